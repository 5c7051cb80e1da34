//! Static file service: existence and permission checks, index lookup,
//! directory listings, MIME mapping, DELETE, and error pages (configured or
//! built-in).

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::time::UNIX_EPOCH;

use chrono::{Local, TimeZone};
use once_cell::sync::Lazy;

use crate::config::{LocationConfig, ServerConfig};
use crate::response::{error_page_html, Response};
use crate::util::{HtmlEscaped, UrlEncoded};

/// Largest file served from disk.
pub const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

// extension → media type, one entry per line of the original table.
static MIME_TYPES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    let table: &[(&str, &[&str])] = &[
        ("text/html", &["html", "htm"]),
        ("text/css", &["css"]),
        ("text/javascript", &["js"]),
        ("text/plain", &["txt", "asc"]),
        ("text/csv", &["csv"]),
        ("text/markdown", &["md"]),
        ("application/json", &["json"]),
        ("application/xml", &["xml", "xsl"]),
        ("application/pdf", &["pdf"]),
        ("application/zip", &["zip"]),
        ("application/gzip", &["gz"]),
        ("application/x-tar", &["tar"]),
        ("application/wasm", &["wasm"]),
        ("application/ogg", &["ogg"]),
        ("image/png", &["png"]),
        ("image/jpeg", &["jpeg", "jpe", "jpg"]),
        ("image/gif", &["gif"]),
        ("image/svg+xml", &["svg"]),
        ("image/webp", &["webp"]),
        ("image/x-icon", &["ico"]),
        ("image/bmp", &["bmp"]),
        ("audio/mpeg", &["mp2", "mp3", "mpga"]),
        ("audio/wav", &["wav"]),
        ("audio/flac", &["flac"]),
        ("video/mpeg", &["mpeg", "mpe", "mpg"]),
        ("video/quicktime", &["qt", "mov"]),
        ("video/x-msvideo", &["avi"]),
        ("video/mp4", &["mp4"]),
        ("video/webm", &["webm"]),
        ("font/woff", &["woff"]),
        ("font/woff2", &["woff2"]),
        ("font/ttf", &["ttf"]),
        ("font/otf", &["otf"]),
    ];
    let mut map = HashMap::new();
    for (mimetype, extensions) in table {
        for extension in *extensions {
            map.insert(*extension, *mimetype);
        }
    }
    map
});

/// Media type for a path, by lowercased final extension.
pub fn mime_type(path: &str) -> &'static str {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rsplit('.').next() {
        Some(extension) if extension != name => MIME_TYPES
            .get(extension.to_lowercase().as_str())
            .copied()
            .unwrap_or(DEFAULT_MIME_TYPE),
        _ => DEFAULT_MIME_TYPE,
    }
}

/// Serve the filesystem path a route resolved to. Error outcomes are
/// returned as `(status, reason)` so the caller can consult the owning
/// server's error-page map.
pub fn serve(
    request_path: &str,
    fs_path: &str,
    location: &LocationConfig,
) -> Result<Response, (u16, String)> {
    let metadata = match fs::metadata(fs_path) {
        Ok(metadata) => metadata,
        Err(e) => return Err(open_error(request_path, &e)),
    };

    if metadata.is_dir() {
        if !request_path.ends_with('/') {
            return Ok(Response::redirect(301, &format!("{}/", request_path)));
        }
        for index_name in &location.index {
            let candidate = format!("{}/{}", fs_path.trim_end_matches('/'), index_name);
            if fs::metadata(&candidate).map(|m| m.is_file()).unwrap_or(false) {
                return serve_file(request_path, &candidate);
            }
        }
        if location.autoindex() {
            return directory_listing(request_path, fs_path);
        }
        return Err((403, "directory listing not allowed".to_string()));
    }

    serve_file(request_path, fs_path)
}

fn serve_file(request_path: &str, fs_path: &str) -> Result<Response, (u16, String)> {
    let mut file = match fs::File::open(fs_path) {
        Ok(file) => file,
        Err(e) => return Err(open_error(request_path, &e)),
    };
    let metadata = file
        .metadata()
        .map_err(|e| (500, format!("cannot stat file: {}", e)))?;
    if !metadata.is_file() {
        return Err((403, "not a regular file".to_string()));
    }
    if metadata.len() > MAX_FILE_SIZE {
        return Err((413, "file too large to serve".to_string()));
    }

    let mut body = Vec::with_capacity(metadata.len() as usize);
    file.read_to_end(&mut body)
        .map_err(|e| (500, format!("cannot read file: {}", e)))?;
    Ok(Response::ok(body, mime_type(fs_path)))
}

fn open_error(request_path: &str, error: &std::io::Error) -> (u16, String) {
    match error.kind() {
        std::io::ErrorKind::NotFound => (404, format!("{} was not found", request_path)),
        std::io::ErrorKind::PermissionDenied => {
            (403, format!("no permission to access {}", request_path))
        }
        _ => (500, format!("cannot open {}: {}", request_path, error)),
    }
}

/// Unlink a regular file: 204 on success, 403/404/500 otherwise.
pub fn delete(request_path: &str, fs_path: &str) -> Result<Response, (u16, String)> {
    let metadata = match fs::metadata(fs_path) {
        Ok(metadata) => metadata,
        Err(e) => return Err(open_error(request_path, &e)),
    };
    if metadata.is_dir() {
        return Err((403, "cannot delete a directory".to_string()));
    }
    match fs::remove_file(fs_path) {
        Ok(()) => {
            let mut response = Response::new(204);
            response.content_type = "text/html".to_string();
            Ok(response)
        }
        Err(e) => Err(match e.kind() {
            std::io::ErrorKind::PermissionDenied => {
                (403, format!("no permission to delete {}", request_path))
            }
            _ => (500, format!("cannot delete {}: {}", request_path, e)),
        }),
    }
}

/// One row per entry: link, size (files), mtime. `.` is skipped, `..` leads.
struct Listing(Vec<fs::DirEntry>);

impl std::fmt::Display for Listing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<a href=\"..\">..</a>/\n")?;
        for entry in &self.0 {
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            let mtime = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| {
                    Local
                        .timestamp(d.as_secs() as i64, 0)
                        .format("%Y-%m-%d %H:%M")
                        .to_string()
                })
                .unwrap_or_else(|| "-".to_string());
            if metadata.is_dir() {
                write!(
                    f,
                    "<a href=\"{}/\">{}</a>/{:>28}  {}\n",
                    UrlEncoded(&name),
                    HtmlEscaped(&name),
                    "-",
                    mtime
                )?;
            } else {
                write!(
                    f,
                    "<a href=\"{}\">{}</a>{:>30}  {}\n",
                    UrlEncoded(&name),
                    HtmlEscaped(&name),
                    human_size(metadata.len()),
                    mtime
                )?;
            }
        }
        Ok(())
    }
}

fn human_size(size: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * 1024;
    const GIB: u64 = 1024 * 1024 * 1024;
    match size {
        s if s < KIB => format!("{} B", s),
        s if s < MIB => format!("{} KB", s / KIB),
        s if s < GIB => format!("{} MB", s / MIB),
        s => format!("{} GB", s / GIB),
    }
}

fn directory_listing(request_path: &str, fs_path: &str) -> Result<Response, (u16, String)> {
    let mut entries: Vec<fs::DirEntry> = fs::read_dir(fs_path)
        .map_err(|e| (500, format!("cannot list directory: {}", e)))?
        .filter_map(|entry| entry.ok())
        .collect();
    entries.sort_by_key(|entry| entry.file_name());

    let body = format!(
        "<html>\n<head>\n<title>Index of {}</title>\n\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n\
         </head>\n<body>\n<h1>Index of {}</h1>\n<tt><pre>\n\
         {}\
         </pre></tt>\n<hr>\n<p><em>{}/{}</em></p>\n</body>\n</html>\n",
        HtmlEscaped(request_path),
        HtmlEscaped(request_path),
        Listing(entries),
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
    );
    Ok(Response::ok(body.into_bytes(), "text/html"))
}

/// Response for an error status: the server's configured page for the code
/// when it can be read, otherwise the built-in page. Always closes.
pub fn error_response(server: Option<&ServerConfig>, code: u16, message: &str) -> Response {
    if let Some(server) = server {
        if let Some(uri) = server.error_pages.get(&code) {
            let page_path = match server.root.as_deref() {
                Some(root) => format!("{}/{}", root.trim_end_matches('/'), uri.trim_start_matches('/')),
                None => uri.clone(),
            };
            if let Ok(body) = fs::read(&page_path) {
                let mut response = Response::new(code);
                response.content_type = mime_type(&page_path).to_string();
                response.body = body;
                response.keep_alive = false;
                return response;
            }
        }
    }
    let mut response = Response::new(code);
    response.body = error_page_html(code, message).into_bytes();
    response.keep_alive = false;
    response
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::LocationConfig;
    use std::io::Write;
    use tempfile::tempdir;
    use test_case::test_case;

    fn location_with(index: &[&str], autoindex: bool) -> LocationConfig {
        let mut location = LocationConfig::new("/");
        location.index = index.iter().map(|s| s.to_string()).collect();
        location.autoindex = Some(autoindex);
        location
    }

    #[test_case("/a/page.html", "text/html")]
    #[test_case("/a/photo.JPG", "image/jpeg")]
    #[test_case("/a/archive.tar", "application/x-tar")]
    #[test_case("/a/unknown.xyz", "application/octet-stream")]
    #[test_case("/a/no-extension", "application/octet-stream")]
    #[test_case("/dotted.dir/file", "application/octet-stream")]
    fn mime_lookup(path: &str, expected: &str) {
        assert_eq!(mime_type(path), expected);
    }

    #[test]
    fn serves_a_file_with_its_media_type() {
        let root = tempdir().unwrap();
        let path = root.path().join("hello.txt");
        fs::File::create(&path)
            .unwrap()
            .write_all(b"hi\n")
            .unwrap();

        let response = serve(
            "/hello.txt",
            path.to_str().unwrap(),
            &location_with(&[], false),
        )
        .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.content_type, "text/plain");
        assert_eq!(response.body, b"hi\n");
    }

    #[test]
    fn missing_file_is_404() {
        let root = tempdir().unwrap();
        let path = root.path().join("nope");
        let (status, _) = serve("/nope", path.to_str().unwrap(), &location_with(&[], false))
            .unwrap_err();
        assert_eq!(status, 404);
    }

    #[test]
    fn directory_without_trailing_slash_redirects() {
        let root = tempdir().unwrap();
        let response = serve(
            "/dir",
            root.path().to_str().unwrap(),
            &location_with(&[], false),
        )
        .unwrap();
        assert_eq!(response.status, 301);
        assert_eq!(response.header("Location"), Some("/dir/"));
    }

    #[test]
    fn directory_with_index_serves_it() {
        let root = tempdir().unwrap();
        fs::File::create(root.path().join("index.html"))
            .unwrap()
            .write_all(b"<p>home</p>")
            .unwrap();
        let response = serve(
            "/",
            root.path().to_str().unwrap(),
            &location_with(&["index.html"], false),
        )
        .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"<p>home</p>");
    }

    #[test]
    fn directory_listing_when_autoindex_on() {
        let root = tempdir().unwrap();
        fs::File::create(root.path().join("b.txt"))
            .unwrap()
            .write_all(b"bb")
            .unwrap();
        fs::create_dir(root.path().join("sub")).unwrap();
        let response = serve(
            "/files/",
            root.path().to_str().unwrap(),
            &location_with(&[], true),
        )
        .unwrap();
        assert_eq!(response.status, 200);
        let body = String::from_utf8(response.body).unwrap();
        assert!(body.contains("Index of /files/"));
        assert!(body.contains("<a href=\"..\">..</a>"));
        assert!(body.contains("b.txt"));
        assert!(body.contains("sub/"));
    }

    #[test]
    fn directory_without_index_or_autoindex_is_403() {
        let root = tempdir().unwrap();
        let (status, _) = serve(
            "/dir/",
            root.path().to_str().unwrap(),
            &location_with(&[], false),
        )
        .unwrap_err();
        assert_eq!(status, 403);
    }

    #[test]
    fn delete_only_touches_regular_files() {
        let root = tempdir().unwrap();
        let file = root.path().join("doomed.txt");
        fs::File::create(&file).unwrap();

        let response = delete("/doomed.txt", file.to_str().unwrap()).unwrap();
        assert_eq!(response.status, 204);
        assert!(response.body.is_empty());
        assert!(!file.exists());

        let (status, _) = delete("/doomed.txt", file.to_str().unwrap()).unwrap_err();
        assert_eq!(status, 404);

        let (status, _) = delete("/", root.path().to_str().unwrap()).unwrap_err();
        assert_eq!(status, 403);
    }

    #[test]
    fn custom_error_page_is_preferred_when_readable() {
        let root = tempdir().unwrap();
        fs::File::create(root.path().join("404.html"))
            .unwrap()
            .write_all(b"custom not found")
            .unwrap();
        let mut server = ServerConfig::default();
        server.root = Some(root.path().to_str().unwrap().to_string());
        server.error_pages.insert(404, "/404.html".to_string());

        let response = error_response(Some(&server), 404, "gone");
        assert_eq!(response.status, 404);
        assert_eq!(response.body, b"custom not found");

        // Unreadable mapping falls back to the built-in page.
        let response = error_response(Some(&server), 403, "denied");
        let body = String::from_utf8(response.body).unwrap();
        assert!(body.contains("403"));
        assert!(body.contains("Forbidden"));
    }
}
