//! Recursive-descent parser for the `server { … location … { … } }` grammar.
//! Every rejection carries the line and column of the token that caused it.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::str::FromStr;

use super::lexer::{Lexer, Token, TokenKind};
use super::{
    ConfigError, ListenEndpoint, LocationConfig, Method, ServerConfig, LOCATION_BODY_CAP,
    SERVER_BODY_CAP,
};

const CGI_EXTENSIONS: &[&str] = &[".py", ".sh", ".php", ".rb", ".pl"];

pub struct Parser<'a> {
    lexer: Lexer<'a>,
    current: Token,
}

impl<'a> Parser<'a> {
    pub fn new(text: &'a str) -> Result<Self, ConfigError> {
        let mut lexer = Lexer::new(text);
        let current = lexer.next_token()?;
        Ok(Parser { lexer, current })
    }

    fn advance(&mut self) -> Result<(), ConfigError> {
        self.current = self.lexer.next_token()?;
        Ok(())
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<Token, ConfigError> {
        if self.current.kind != kind {
            return Err(ConfigError::at_token(
                format!("expected {}, found `{}'", what, self.current.text),
                &self.current,
            ));
        }
        let token = self.current.clone();
        self.advance()?;
        Ok(token)
    }

    /// Collect directive arguments up to the terminating semicolon.
    fn values(&mut self) -> Result<Vec<Token>, ConfigError> {
        let mut values = Vec::new();
        while self.current.kind != TokenKind::Semicolon {
            if self.current.kind != TokenKind::Word {
                return Err(ConfigError::at_token(
                    format!("expected `;', found `{}'", self.current.text),
                    &self.current,
                ));
            }
            values.push(self.current.clone());
            self.advance()?;
        }
        self.advance()?; // consume `;`
        Ok(values)
    }

    pub fn parse(mut self) -> Result<Vec<ServerConfig>, ConfigError> {
        let mut servers = Vec::new();
        while self.current.kind != TokenKind::Eof {
            if self.current.kind == TokenKind::Word && self.current.text == "server" {
                servers.push(self.server_block()?);
            } else {
                return Err(ConfigError::at_token(
                    format!("expected `server' block, found `{}'", self.current.text),
                    &self.current,
                ));
            }
        }
        if servers.is_empty() {
            return Err(ConfigError::new(
                "configuration must contain at least one server block",
            ));
        }
        Ok(servers)
    }

    fn server_block(&mut self) -> Result<ServerConfig, ConfigError> {
        self.advance()?; // `server`
        self.expect(TokenKind::LeftBrace, "`{' after server")?;

        let mut server = ServerConfig::default();
        let mut seen = HashSet::new();
        let mut seen_endpoints = HashSet::new();
        let mut location_paths = HashSet::new();

        while self.current.kind != TokenKind::RightBrace {
            if self.current.kind == TokenKind::Eof {
                return Err(ConfigError::at_token(
                    "unexpected end of file in server block",
                    &self.current,
                ));
            }
            if self.current.kind == TokenKind::Word && self.current.text == "location" {
                let location = self.location_block()?;
                if !location_paths.insert(location.path.clone()) {
                    return Err(ConfigError::new(format!(
                        "duplicate location path {}",
                        location.path
                    )));
                }
                server.locations.push(location);
            } else {
                self.server_directive(&mut server, &mut seen, &mut seen_endpoints)?;
            }
        }
        self.expect(TokenKind::RightBrace, "`}' after server block")?;
        Ok(server)
    }

    fn server_directive(
        &mut self,
        server: &mut ServerConfig,
        seen: &mut HashSet<String>,
        seen_endpoints: &mut HashSet<ListenEndpoint>,
    ) -> Result<(), ConfigError> {
        let name = self.expect(TokenKind::Word, "a server directive")?;
        let values = self.values()?;

        match name.text.as_str() {
            "listen" => {
                let value = single(&name, &values)?;
                let endpoint = parse_endpoint(value)?;
                if !seen_endpoints.insert(endpoint.clone()) {
                    return Err(ConfigError::at_token(
                        format!("duplicate listen endpoint {}", endpoint),
                        value,
                    ));
                }
                server.listens.push(endpoint);
            }
            "server_name" => {
                require_values(&name, &values)?;
                for value in &values {
                    if server.server_names.iter().any(|n| n == &value.text) {
                        return Err(ConfigError::at_token(
                            format!("duplicate server_name {}", value.text),
                            value,
                        ));
                    }
                    server.server_names.push(value.text.clone());
                }
            }
            "root" => {
                once(&name, seen)?;
                server.root = Some(single(&name, &values)?.text.clone());
            }
            "index" => {
                require_values(&name, &values)?;
                for value in &values {
                    if server.index.iter().any(|n| n == &value.text) {
                        return Err(ConfigError::at_token(
                            format!("duplicate index file {}", value.text),
                            value,
                        ));
                    }
                    server.index.push(value.text.clone());
                }
            }
            "autoindex" => {
                once(&name, seen)?;
                server.autoindex = Some(parse_on_off(single(&name, &values)?)?);
            }
            "client_max_body_size" => {
                once(&name, seen)?;
                let value = single(&name, &values)?;
                let size = parse_size(value)?;
                if size > SERVER_BODY_CAP {
                    return Err(ConfigError::at_token(
                        "client_max_body_size cannot exceed 1G at server scope",
                        value,
                    ));
                }
                server.client_max_body_size = Some(size);
            }
            "error_page" => {
                if values.len() != 2 {
                    return Err(ConfigError::at_token(
                        "error_page expects a code and a uri",
                        &name,
                    ));
                }
                let code = parse_int(&values[0])?;
                if !(400..=599).contains(&code) {
                    return Err(ConfigError::at_token(
                        format!("error_page code {} outside [400,599]", code),
                        &values[0],
                    ));
                }
                if server.error_pages.insert(code, values[1].text.clone()).is_some() {
                    return Err(ConfigError::at_token(
                        format!("duplicate error_page for code {}", code),
                        &values[0],
                    ));
                }
            }
            other => {
                return Err(ConfigError::at_token(
                    format!("unknown server directive `{}'", other),
                    &name,
                ));
            }
        }
        Ok(())
    }

    fn location_block(&mut self) -> Result<LocationConfig, ConfigError> {
        self.advance()?; // `location`
        let path = self.expect(TokenKind::Word, "a location path")?;
        if !path.text.starts_with('/') {
            return Err(ConfigError::at_token(
                "location path must start with `/'",
                &path,
            ));
        }
        self.expect(TokenKind::LeftBrace, "`{' after location path")?;

        let mut location = LocationConfig::new(path.text);
        let mut seen = HashSet::new();

        while self.current.kind != TokenKind::RightBrace {
            if self.current.kind == TokenKind::Eof {
                return Err(ConfigError::at_token(
                    "unexpected end of file in location block",
                    &self.current,
                ));
            }
            self.location_directive(&mut location, &mut seen)?;
        }
        self.expect(TokenKind::RightBrace, "`}' after location block")?;
        Ok(location)
    }

    fn location_directive(
        &mut self,
        location: &mut LocationConfig,
        seen: &mut HashSet<String>,
    ) -> Result<(), ConfigError> {
        let name = self.expect(TokenKind::Word, "a location directive")?;
        let values = self.values()?;

        match name.text.as_str() {
            "root" => {
                once(&name, seen)?;
                location.root = Some(single(&name, &values)?.text.clone());
            }
            "index" => {
                require_values(&name, &values)?;
                for value in &values {
                    if location.index.iter().any(|n| n == &value.text) {
                        return Err(ConfigError::at_token(
                            format!("duplicate index file {}", value.text),
                            value,
                        ));
                    }
                    location.index.push(value.text.clone());
                }
            }
            "autoindex" => {
                once(&name, seen)?;
                location.autoindex = Some(parse_on_off(single(&name, &values)?)?);
            }
            "client_max_body_size" => {
                once(&name, seen)?;
                let value = single(&name, &values)?;
                let size = parse_size(value)?;
                if size > LOCATION_BODY_CAP {
                    return Err(ConfigError::at_token(
                        "client_max_body_size cannot exceed 100M at location scope",
                        value,
                    ));
                }
                location.client_max_body_size = Some(size);
            }
            "allowed_methods" => {
                require_values(&name, &values)?;
                for value in &values {
                    let method = Method::from_str(&value.text).map_err(|_| {
                        ConfigError::at_token(
                            format!("unknown method `{}'", value.text),
                            value,
                        )
                    })?;
                    if location.allowed_methods.contains(&method) {
                        return Err(ConfigError::at_token(
                            format!("duplicate allowed method {}", method),
                            value,
                        ));
                    }
                    location.allowed_methods.push(method);
                }
            }
            "return" => {
                once(&name, seen)?;
                if values.is_empty() || values.len() > 2 {
                    return Err(ConfigError::at_token(
                        "return expects a code and an optional url",
                        &name,
                    ));
                }
                let code = parse_int(&values[0])?;
                if !(200..=599).contains(&code) {
                    return Err(ConfigError::at_token(
                        format!("return code {} outside [200,599]", code),
                        &values[0],
                    ));
                }
                let url = values.get(1).map(|v| v.text.clone()).unwrap_or_default();
                if (300..=399).contains(&code)
                    && !(url.starts_with('/')
                        || url.starts_with("http://")
                        || url.starts_with("https://"))
                {
                    return Err(ConfigError::at_token(
                        "3xx return requires a url starting with /, http:// or https://",
                        &values[0],
                    ));
                }
                location.redirect = Some((code, url));
            }
            "cgi_pass" => {
                let value = single(&name, &values)?;
                if location.cgi_pass.iter().any(|p| p == &value.text) {
                    return Err(ConfigError::at_token(
                        format!("duplicate cgi_pass {}", value.text),
                        value,
                    ));
                }
                location.cgi_pass.push(value.text.clone());
            }
            "cgi_extension" => {
                require_values(&name, &values)?;
                for value in &values {
                    if !CGI_EXTENSIONS.contains(&value.text.as_str()) {
                        return Err(ConfigError::at_token(
                            format!("unsupported cgi_extension {}", value.text),
                            value,
                        ));
                    }
                    if location.cgi_extensions.iter().any(|e| e == &value.text) {
                        return Err(ConfigError::at_token(
                            format!("duplicate cgi_extension {}", value.text),
                            value,
                        ));
                    }
                    location.cgi_extensions.push(value.text.clone());
                }
            }
            "upload_store" => {
                once(&name, seen)?;
                location.upload_store = Some(single(&name, &values)?.text.clone());
            }
            other => {
                return Err(ConfigError::at_token(
                    format!("unknown location directive `{}'", other),
                    &name,
                ));
            }
        }
        Ok(())
    }
}

fn once(name: &Token, seen: &mut HashSet<String>) -> Result<(), ConfigError> {
    if !seen.insert(name.text.clone()) {
        return Err(ConfigError::at_token(
            format!("duplicate directive `{}'", name.text),
            name,
        ));
    }
    Ok(())
}

fn single<'v>(name: &Token, values: &'v [Token]) -> Result<&'v Token, ConfigError> {
    if values.len() != 1 {
        return Err(ConfigError::at_token(
            format!("{} expects exactly one argument", name.text),
            name,
        ));
    }
    Ok(&values[0])
}

fn require_values(name: &Token, values: &[Token]) -> Result<(), ConfigError> {
    if values.is_empty() {
        return Err(ConfigError::at_token(
            format!("{} expects at least one argument", name.text),
            name,
        ));
    }
    Ok(())
}

fn parse_int(token: &Token) -> Result<u16, ConfigError> {
    token
        .text
        .parse()
        .map_err(|_| ConfigError::at_token(format!("invalid number `{}'", token.text), token))
}

fn parse_on_off(token: &Token) -> Result<bool, ConfigError> {
    match token.text.as_str() {
        "on" => Ok(true),
        "off" => Ok(false),
        other => Err(ConfigError::at_token(
            format!("expected `on' or `off', found `{}'", other),
            token,
        )),
    }
}

/// Parse `port` or `interface:port`.
fn parse_endpoint(token: &Token) -> Result<ListenEndpoint, ConfigError> {
    let (interface, port_text) = match token.text.rfind(':') {
        Some(colon) => (&token.text[..colon], &token.text[colon + 1..]),
        None => ("", token.text.as_str()),
    };
    if !interface.is_empty() && Ipv4Addr::from_str(interface).is_err() {
        return Err(ConfigError::at_token(
            format!("invalid listen interface `{}'", interface),
            token,
        ));
    }
    let port: u32 = port_text
        .parse()
        .map_err(|_| ConfigError::at_token(format!("invalid listen port `{}'", port_text), token))?;
    if port == 0 || port > 65535 {
        return Err(ConfigError::at_token(
            format!("listen port {} out of range", port),
            token,
        ));
    }
    Ok(ListenEndpoint {
        interface: interface.to_string(),
        port: port as u16,
    })
}

/// Parse `N`, `NK`, `NM` or `NG`.
fn parse_size(token: &Token) -> Result<u64, ConfigError> {
    let text = &token.text;
    let digits_len = text.bytes().take_while(u8::is_ascii_digit).count();
    if digits_len == 0 {
        return Err(ConfigError::at_token(
            format!("invalid size `{}'", text),
            token,
        ));
    }
    let base: u64 = text[..digits_len]
        .parse()
        .map_err(|_| ConfigError::at_token(format!("invalid size `{}'", text), token))?;
    let multiplier = match &text[digits_len..] {
        "" => 1,
        "K" => 1024,
        "M" => 1024 * 1024,
        "G" => 1024 * 1024 * 1024,
        suffix => {
            return Err(ConfigError::at_token(
                format!("invalid size unit `{}'", suffix),
                token,
            ))
        }
    };
    base.checked_mul(multiplier)
        .ok_or_else(|| ConfigError::at_token(format!("size `{}' overflows", text), token))
}
