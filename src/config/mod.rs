//! Typed configuration model: a validated tree of servers and locations with
//! server-to-location inheritance resolved once at load time.

mod lexer;
mod parser;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_BODY_LIMIT: u64 = 1024 * 1024;
pub const SERVER_BODY_CAP: u64 = 1024 * 1024 * 1024;
pub const LOCATION_BODY_CAP: u64 = 100 * 1024 * 1024;
pub const DEFAULT_INDEX_NAME: &str = "index.html";

/// Error raised while loading the configuration, pointing at the offending
/// source position when one is known.
#[derive(Debug)]
pub struct ConfigError {
    message: String,
    location: Option<(usize, usize)>,
}

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        ConfigError {
            message: message.into(),
            location: None,
        }
    }

    pub fn at(message: impl Into<String>, line: usize, column: usize) -> Self {
        ConfigError {
            message: message.into(),
            location: Some((line, column)),
        }
    }

    fn at_token(message: impl Into<String>, token: &lexer::Token) -> Self {
        Self::at(message, token.line, token.column)
    }

    pub fn line(&self) -> Option<usize> {
        self.location.map(|(line, _)| line)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.location {
            Some((line, column)) => write!(
                f,
                "config error at line {}, column {}: {}",
                line, column, self.message
            ),
            None => write!(f, "config error: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

/// HTTP methods the server implements end-to-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        }
    }
}

impl FromStr for Method {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "DELETE" => Ok(Method::Delete),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A passive socket address: `(interface, port)` with an empty interface
/// meaning the wildcard address. Ordered by port, then interface.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenEndpoint {
    pub interface: String,
    pub port: u16,
}

impl ListenEndpoint {
    pub fn effective_interface(&self) -> &str {
        if self.interface.is_empty() {
            "0.0.0.0"
        } else {
            &self.interface
        }
    }
}

impl PartialOrd for ListenEndpoint {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ListenEndpoint {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.port, &self.interface).cmp(&(other.port, &other.interface))
    }
}

impl fmt::Display for ListenEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.effective_interface(), self.port)
    }
}

/// One `location <prefix> { … }` block after inheritance resolution.
#[derive(Debug, Clone, Default)]
pub struct LocationConfig {
    pub path: String,
    pub root: Option<String>,
    pub index: Vec<String>,
    pub autoindex: Option<bool>,
    pub client_max_body_size: Option<u64>,
    pub allowed_methods: Vec<Method>,
    pub redirect: Option<(u16, String)>,
    pub cgi_pass: Vec<String>,
    pub cgi_extensions: Vec<String>,
    pub upload_store: Option<String>,
}

impl LocationConfig {
    pub fn new(path: impl Into<String>) -> Self {
        LocationConfig {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Root directory; guaranteed non-empty after resolution.
    pub fn root(&self) -> &str {
        self.root.as_deref().unwrap_or("")
    }

    pub fn autoindex(&self) -> bool {
        self.autoindex.unwrap_or(false)
    }

    pub fn body_limit(&self) -> u64 {
        self.client_max_body_size.unwrap_or(DEFAULT_BODY_LIMIT)
    }

    pub fn allows(&self, method: Method) -> bool {
        self.allowed_methods.contains(&method)
    }
}

/// One `server { … }` block.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub listens: Vec<ListenEndpoint>,
    pub server_names: Vec<String>,
    pub root: Option<String>,
    pub index: Vec<String>,
    pub autoindex: Option<bool>,
    pub client_max_body_size: Option<u64>,
    pub error_pages: HashMap<u16, String>,
    pub locations: Vec<LocationConfig>,
}

impl ServerConfig {
    pub fn listens_on(&self, port: u16) -> bool {
        self.listens.iter().any(|endpoint| endpoint.port == port)
    }
}

/// Load and fully resolve a configuration file.
pub fn load(path: &str) -> Result<Vec<ServerConfig>, ConfigError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::new(format!("cannot read {}: {}", path, e)))?;
    parse(&text)
}

/// Parse configuration text and resolve inheritance and defaults.
pub fn parse(text: &str) -> Result<Vec<ServerConfig>, ConfigError> {
    let mut servers = parser::Parser::new(text)?.parse()?;
    resolve(&mut servers)?;
    Ok(servers)
}

/// Fill unset location attributes from the parent server, apply defaults, and
/// check the invariants that only hold for a complete tree.
fn resolve(servers: &mut [ServerConfig]) -> Result<(), ConfigError> {
    for server in servers.iter_mut() {
        if server.listens.is_empty() {
            return Err(ConfigError::new("server block has no listen directive"));
        }

        // A bare `server { listen …; root …; }` still serves files: give it
        // an implicit catch-all location built from the server's own scalars.
        // Servers whose roots live only in explicit locations keep their 404
        // for unmatched paths.
        if server.root.is_some() && !server.locations.iter().any(|location| location.path == "/") {
            server.locations.push(LocationConfig::new("/"));
        }

        for location in server.locations.iter_mut() {
            if location.root.is_none() {
                location.root = server.root.clone();
            }
            if location.index.is_empty() {
                location.index = server.index.clone();
            }
            if location.autoindex.is_none() {
                location.autoindex = server.autoindex;
            }
            if location.client_max_body_size.is_none() {
                location.client_max_body_size = server.client_max_body_size;
            }

            if location.index.is_empty() {
                location.index.push(DEFAULT_INDEX_NAME.to_string());
            }
            if location.autoindex.is_none() {
                location.autoindex = Some(false);
            }
            if location.client_max_body_size.is_none() {
                location.client_max_body_size = Some(DEFAULT_BODY_LIMIT);
            }
            if location.allowed_methods.is_empty() {
                location.allowed_methods = vec![Method::Get, Method::Post];
            }

            if location.root.as_deref().map_or(true, str::is_empty) {
                return Err(ConfigError::new(format!(
                    "location {} has no root (neither its own nor the server's)",
                    location.path
                )));
            }
        }
    }
    Ok(())
}
