//! Response builder: status, headers and body collected incrementally, then
//! serialised to the wire in one buffer.

use crate::util::HtmlEscaped;

/// Canonical reason phrase for a status code.
pub fn status_text(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        418 => "I'm a teapot",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub content_type: String,
    pub body: Vec<u8>,
    pub keep_alive: bool,
    // Insertion-ordered; serialised after the fixed headers.
    extra_headers: Vec<(String, String)>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Response {
            status,
            reason: status_text(status).to_string(),
            content_type: "text/html".to_string(),
            body: Vec::new(),
            keep_alive: true,
            extra_headers: Vec::new(),
        }
    }

    pub fn ok(body: Vec<u8>, content_type: &str) -> Self {
        let mut response = Response::new(200);
        response.content_type = content_type.to_string();
        response.body = body;
        response
    }

    pub fn created(body: Vec<u8>, content_type: &str) -> Self {
        let mut response = Response::new(201);
        response.content_type = content_type.to_string();
        response.body = body;
        response
    }

    pub fn redirect(code: u16, location: &str) -> Self {
        let mut response = Response::new(code);
        response.keep_alive = false;
        response.set_header("Location", location);
        response.body = format!(
            "<html><head><title>{} {}</title></head><body>\n\
             <h1>{} {}</h1>\n\
             <p>Redirecting to <a href=\"{}\">{}</a></p>\n\
             </body></html>\n",
            code,
            response.reason,
            code,
            response.reason,
            HtmlEscaped(location),
            HtmlEscaped(location),
        )
        .into_bytes();
        response
    }

    pub fn error(code: u16, message: &str) -> Self {
        let mut response = Response::new(code);
        response.keep_alive = false;
        response.body = error_page_html(code, message).into_bytes();
        response
    }

    /// Set a header, replacing any earlier value while keeping its position.
    pub fn set_header(&mut self, name: &str, value: &str) {
        for (existing, existing_value) in self.extra_headers.iter_mut() {
            if existing.eq_ignore_ascii_case(name) {
                *existing_value = value.to_string();
                return;
            }
        }
        self.extra_headers.push((name.to_string(), value.to_string()));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.extra_headers
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Serialised wire form: status line, Content-Type, Content-Length,
    /// Connection, extra headers, blank line, body.
    pub fn build(&self) -> Vec<u8> {
        let mut wire = format!(
            "HTTP/1.1 {} {}\r\n\
             Content-Type: {}\r\n\
             Content-Length: {}\r\n\
             Connection: {}\r\n",
            self.status,
            self.reason,
            self.content_type,
            self.body.len(),
            if self.keep_alive { "keep-alive" } else { "close" },
        )
        .into_bytes();
        for (name, value) in &self.extra_headers {
            wire.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        wire.extend_from_slice(b"\r\n");
        wire.extend_from_slice(&self.body);
        wire
    }
}

/// Built-in HTML error page: numeric code, canonical status text, message.
pub fn error_page_html(code: u16, message: &str) -> String {
    format!(
        "<!DOCTYPE html>\n\
         <html>\n\
         <head><title>{} {}</title></head>\n\
         <body>\n\
         <h1>{}</h1>\n\
         <h2>{}</h2>\n\
         <p>{}</p>\n\
         <hr>\n\
         <p><em>{}/{}</em></p>\n\
         </body>\n\
         </html>\n",
        code,
        status_text(code),
        code,
        HtmlEscaped(status_text(code)),
        HtmlEscaped(message),
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
    )
}
