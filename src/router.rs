//! Request routing: virtual-host selection, path sanitation, longest-prefix
//! location match, method gate and filesystem path resolution.

use crate::config::{Method, ServerConfig};
use crate::request::Request;
use crate::util::url_decode;

/// A successfully routed request. Indices point into the immutable config so
/// the result can be captured by a CGI session without borrowing.
#[derive(Debug, Clone)]
pub struct Route {
    pub server: usize,
    pub location: usize,
    /// Decoded, normalised request path.
    pub path: String,
    /// Absolute filesystem path the request resolves to.
    pub fs_path: String,
    pub is_cgi: bool,
    /// Configured `return` short-circuit, if the location carries one.
    pub redirect: Option<(u16, String)>,
}

/// A routing failure, response-shaped. `server` is known for everything past
/// server selection so the caller can consult its custom error pages.
#[derive(Debug, Clone)]
pub struct Reject {
    pub server: Option<usize>,
    pub status: u16,
    pub reason: String,
}

impl Reject {
    fn new(server: Option<usize>, status: u16, reason: impl Into<String>) -> Self {
        Reject {
            server,
            status,
            reason: reason.into(),
        }
    }
}

pub fn route(servers: &[ServerConfig], request: &Request, local_port: u16) -> Result<Route, Reject> {
    let server_index = match find_server(servers, local_port, &request.host()) {
        Some(index) => index,
        None => {
            return Err(Reject::new(
                None,
                500,
                format!("no server is configured for port {}", local_port),
            ))
        }
    };
    let server = &servers[server_index];

    let decoded = String::from_utf8_lossy(&url_decode(request.path())).into_owned();
    let path = normalize_path(&decoded);
    if path.contains("..") {
        return Err(Reject::new(
            Some(server_index),
            403,
            "path traversal attempt",
        ));
    }

    let location_index = match find_location(server, &path) {
        Some(index) => index,
        None => {
            return Err(Reject::new(
                Some(server_index),
                404,
                format!("no location matches {}", path),
            ))
        }
    };
    let location = &server.locations[location_index];

    if let Some(redirect) = &location.redirect {
        return Ok(Route {
            server: server_index,
            location: location_index,
            path,
            fs_path: String::new(),
            is_cgi: false,
            redirect: Some(redirect.clone()),
        });
    }

    if !location.allows(request.method()) {
        return Err(Reject::new(
            Some(server_index),
            405,
            format!("method {} not allowed for {}", request.method(), path),
        ));
    }

    let fs_path = resolve_fs_path(location.root(), &location.path, &path);
    let is_cgi = is_cgi_path(&location.cgi_extensions, &fs_path);

    Ok(Route {
        server: server_index,
        location: location_index,
        path,
        fs_path,
        is_cgi,
        redirect: None,
    })
}

/// Body ceiling for a request whose headers are parsed but whose body is
/// still in flight. Falls back to `None` when routing cannot identify a
/// location (the request will fail later anyway).
pub fn body_limit_for(
    servers: &[ServerConfig],
    local_port: u16,
    host: &str,
    raw_path: &str,
) -> Option<u64> {
    let server = &servers[find_server(servers, local_port, host)?];
    let decoded = String::from_utf8_lossy(&url_decode(raw_path)).into_owned();
    let path = normalize_path(&decoded);
    let location = &server.locations[find_location(server, &path)?];
    Some(location.body_limit())
}

/// Among servers bound to `port`, pick the one whose server-name list matches
/// `host`; the first server on the port is the default.
fn find_server(servers: &[ServerConfig], port: u16, host: &str) -> Option<usize> {
    let mut default = None;
    for (index, server) in servers.iter().enumerate() {
        if !server.listens_on(port) {
            continue;
        }
        if default.is_none() {
            default = Some(index);
        }
        if matches_server_name(server, host) {
            return Some(index);
        }
    }
    default
}

/// Case-insensitive name match with leading `*.` wildcard support.
fn matches_server_name(server: &ServerConfig, host: &str) -> bool {
    let host = host.to_lowercase();
    for name in &server.server_names {
        let name = name.to_lowercase();
        if host == name {
            return true;
        }
        if let Some(suffix) = name.strip_prefix('*') {
            if suffix.starts_with('.') && host.len() > suffix.len() && host.ends_with(suffix) {
                return true;
            }
        }
    }
    false
}

/// Longest-prefix location match. A location matches when its path equals the
/// request path, or prefixes it at a `/` boundary; `/` matches everything.
fn find_location(server: &ServerConfig, path: &str) -> Option<usize> {
    let mut best: Option<usize> = None;
    let mut best_len = 0;
    for (index, location) in server.locations.iter().enumerate() {
        if matches_location(&location.path, path) && location.path.len() > best_len {
            best = Some(index);
            best_len = location.path.len();
        }
    }
    best
}

fn matches_location(location_path: &str, request_path: &str) -> bool {
    if location_path == "/" || location_path == request_path {
        return true;
    }
    match request_path.strip_prefix(location_path) {
        Some(rest) => location_path.ends_with('/') || rest.starts_with('/'),
        None => false,
    }
}

/// Normalise by segment: drop `.`, consume one segment on `..` (ignored at
/// the root), collapse repeated slashes, preserve a trailing slash.
pub fn normalize_path(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }

    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            segment => segments.push(segment),
        }
    }

    let mut result = String::from("/");
    result.push_str(&segments.join("/"));
    if path.ends_with('/') && !result.ends_with('/') {
        result.push('/');
    }
    result
}

/// Strip the location prefix from the request path and append the remainder
/// to the location root.
fn resolve_fs_path(root: &str, location_path: &str, request_path: &str) -> String {
    let root = root.strip_suffix('/').unwrap_or(root);

    let relative = if request_path.len() > location_path.len() {
        &request_path[location_path.len()..]
    } else {
        ""
    };
    if relative.starts_with('/') {
        format!("{}{}", root, relative)
    } else {
        format!("{}/{}", root, relative)
    }
}

fn is_cgi_path(extensions: &[String], fs_path: &str) -> bool {
    extensions.iter().any(|ext| fs_path.ends_with(ext.as_str()))
}
