//! `multipart/form-data` uploads: boundary extraction, part splitting,
//! filename sanitisation and collision-free storage.

use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::Utc;

use crate::config::Method;
use crate::request::Request;
use crate::util::{find, HtmlEscaped};

const MAX_PARTS: usize = 100;
const MAX_FILENAME_LEN: usize = 255;

#[derive(Debug)]
pub struct SavedFile {
    pub name: String,
    pub size: usize,
}

#[derive(Debug, Default)]
struct Part {
    name: String,
    filename: Option<String>,
    data: Vec<u8>,
}

/// A request is an upload candidate iff it is a POST with a multipart or
/// raw-bytes content type.
pub fn is_upload_request(request: &Request) -> bool {
    if request.method() != Method::Post {
        return false;
    }
    let content_type = request
        .header("content-type")
        .map(str::to_lowercase)
        .unwrap_or_default();
    content_type.contains("multipart/form-data")
        || content_type.contains("application/octet-stream")
}

/// Store the request's file payload(s) under `upload_dir`. Error outcomes are
/// `(status, reason)` pairs for the caller's error-page machinery.
pub fn handle(
    request: &Request,
    upload_dir: &str,
    body_limit: u64,
) -> Result<Vec<SavedFile>, (u16, String)> {
    if request.body.len() as u64 > body_limit {
        return Err((413, "request body exceeds the configured limit".to_string()));
    }
    let content_type = match request.header("content-type") {
        Some(content_type) => content_type.to_string(),
        None => return Err((400, "upload without a Content-Type header".to_string())),
    };

    ensure_directory(upload_dir)
        .map_err(|e| (500, format!("cannot prepare upload directory: {}", e)))?;

    if content_type.to_lowercase().contains("multipart/form-data") {
        let boundary = extract_boundary(&content_type)
            .ok_or_else(|| (400, "multipart request without a boundary".to_string()))?;
        let parts = parse_multipart(&request.body, &boundary)
            .ok_or_else(|| (400, "malformed multipart body".to_string()))?;

        let mut saved = Vec::new();
        for part in parts {
            let filename = match part.filename {
                Some(filename) => filename,
                None => continue, // plain form field
            };
            let name = save_file(upload_dir, &filename, &part.data)
                .map_err(|e| (500, format!("cannot store {}: {}", filename, e)))?;
            saved.push(SavedFile {
                name,
                size: part.data.len(),
            });
        }
        Ok(saved)
    } else {
        // Raw upload: the whole body is the file.
        let filename = request
            .header("content-disposition")
            .and_then(|value| parse_content_disposition(value).1)
            .or_else(|| request.header("x-filename").map(str::to_string))
            .unwrap_or_else(|| "upload".to_string());
        let name = save_file(upload_dir, &filename, &request.body)
            .map_err(|e| (500, format!("cannot store {}: {}", filename, e)))?;
        Ok(vec![SavedFile {
            name,
            size: request.body.len(),
        }])
    }
}

/// HTML body for the 201 Created response.
pub fn success_page(files: &[SavedFile]) -> String {
    let mut page = format!(
        "<html><head><title>Upload Successful</title></head><body>\n\
         <h1>Upload Successful</h1>\n\
         <p>Uploaded {} file(s):</p>\n<ul>\n",
        files.len()
    );
    for file in files {
        page.push_str(&format!(
            "<li>{} ({} bytes)</li>\n",
            HtmlEscaped(&file.name),
            file.size
        ));
    }
    page.push_str("</ul>\n</body></html>\n");
    page
}

/// Boundary parameter of a multipart Content-Type, quoted or not.
fn extract_boundary(content_type: &str) -> Option<String> {
    let lower = content_type.to_lowercase();
    let start = lower.find("boundary=")? + "boundary=".len();
    let rest = &content_type[start..];
    if let Some(quoted) = rest.strip_prefix('"') {
        let end = quoted.find('"')?;
        return Some(quoted[..end].to_string());
    }
    let end = rest
        .find(|c: char| c == ';' || c == ' ' || c == '\t')
        .unwrap_or(rest.len());
    if end == 0 {
        return None;
    }
    Some(rest[..end].to_string())
}

/// Split a multipart body on `--boundary`. Returns None when no boundary is
/// present at all.
fn parse_multipart(body: &[u8], boundary: &str) -> Option<Vec<Part>> {
    let delimiter = format!("--{}", boundary).into_bytes();

    let mut pos = find(&delimiter, body)?;
    pos += delimiter.len();
    pos += skip_crlf(&body[pos..]);

    let mut parts = Vec::new();
    while pos < body.len() && parts.len() < MAX_PARTS {
        let next = match find(&delimiter, &body[pos..]) {
            Some(offset) => pos + offset,
            None => break,
        };

        let mut content = &body[pos..next];
        if content.ends_with(b"\r\n") {
            content = &content[..content.len() - 2];
        }
        if let Some(part) = parse_part(content) {
            parts.push(part);
        }

        pos = next + delimiter.len();
        if body[pos..].starts_with(b"--") {
            break;
        }
        pos += skip_crlf(&body[pos..]);
    }

    if parts.is_empty() {
        return None;
    }
    Some(parts)
}

fn skip_crlf(data: &[u8]) -> usize {
    let mut n = 0;
    if data.get(n) == Some(&b'\r') {
        n += 1;
    }
    if data.get(n) == Some(&b'\n') {
        n += 1;
    }
    n
}

/// One part: a header block ended by the first blank line, then data.
fn parse_part(content: &[u8]) -> Option<Part> {
    let (header_len, data_start) = match find(b"\r\n\r\n", content) {
        Some(end) => (end, end + 4),
        None => match find(b"\n\n", content) {
            Some(end) => (end, end + 2),
            None => return None,
        },
    };

    let mut part = Part {
        data: content.get(data_start..).unwrap_or(b"").to_vec(),
        ..Default::default()
    };

    let headers = String::from_utf8_lossy(&content[..header_len]).into_owned();
    for line in headers.lines() {
        let line = line.trim_end_matches('\r');
        let colon = match line.find(':') {
            Some(colon) => colon,
            None => continue,
        };
        let header_name = line[..colon].to_lowercase();
        let value = line[colon + 1..].trim();
        if header_name == "content-disposition" {
            let (name, filename) = parse_content_disposition(value);
            if let Some(name) = name {
                part.name = name;
            }
            part.filename = filename;
        }
    }
    Some(part)
}

/// `name` and `filename` parameters of a Content-Disposition value.
fn parse_content_disposition(value: &str) -> (Option<String>, Option<String>) {
    (quoted_param(value, "name=\""), quoted_param(value, "filename=\""))
}

fn quoted_param(value: &str, marker: &str) -> Option<String> {
    // "filename=" must not match inside "...; filename=..." when looking for
    // "name=", so require the marker to start the value or follow a separator.
    let mut search_from = 0;
    while let Some(offset) = value[search_from..].find(marker) {
        let start = search_from + offset;
        if start == 0 || matches!(value.as_bytes()[start - 1], b' ' | b';' | b'\t') {
            let content = &value[start + marker.len()..];
            let end = content.find('"')?;
            return Some(content[..end].to_string());
        }
        search_from = start + marker.len();
    }
    None
}

/// Strip path components and anything outside `[A-Za-z0-9._-]`; spaces become
/// underscores; a leading dot is masked; empty results become `unnamed`.
pub fn sanitize_filename(filename: &str) -> String {
    let base = filename
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or(filename);

    let mut result = String::new();
    for c in base.chars() {
        if result.len() >= MAX_FILENAME_LEN {
            break;
        }
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
            result.push(c);
        } else if c == ' ' {
            result.push('_');
        }
    }

    if result.starts_with('.') {
        result.insert(0, '_');
    }
    if result.is_empty() {
        result = "unnamed".to_string();
    }
    result.truncate(MAX_FILENAME_LEN);
    result
}

/// Pick a name that does not collide: the sanitised name, then with a
/// timestamp, then with a counter, then with a nanosecond suffix.
fn unique_filename(dir: &Path, filename: &str) -> String {
    let sanitized = sanitize_filename(filename);
    if !dir.join(&sanitized).exists() {
        return sanitized;
    }

    let (stem, extension) = match sanitized.rfind('.') {
        Some(dot) if dot > 0 => (&sanitized[..dot], &sanitized[dot..]),
        _ => (sanitized.as_str(), ""),
    };

    let timestamp = Utc::now().timestamp();
    let candidate = format!("{}_{}{}", stem, timestamp, extension);
    if !dir.join(&candidate).exists() {
        return candidate;
    }
    for counter in 1..1000 {
        let candidate = format!("{}_{}_{}{}", stem, timestamp, counter, extension);
        if !dir.join(&candidate).exists() {
            return candidate;
        }
    }
    format!("{}_{}{}", stem, Utc::now().timestamp_nanos(), extension)
}

fn ensure_directory(dir: &str) -> std::io::Result<()> {
    match fs::metadata(dir) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            "upload path exists and is not a directory",
        )),
        Err(_) => fs::create_dir(dir),
    }
}

fn save_file(dir: &str, filename: &str, data: &[u8]) -> std::io::Result<String> {
    let dir = Path::new(dir);
    let name = unique_filename(dir, filename);
    let mut file = fs::File::create(dir.join(&name))?;
    file.write_all(data)?;
    Ok(name)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::request::{ParseStatus, Request};
    use tempfile::tempdir;
    use test_case::test_case;

    fn multipart_request(boundary: &str, parts: &str) -> Request {
        let body = parts.replace('B', boundary);
        let stream = format!(
            "POST /upload HTTP/1.1\r\nHost: x\r\n\
             Content-Type: multipart/form-data; boundary={}\r\n\
             Content-Length: {}\r\n\r\n{}",
            boundary,
            body.len(),
            body
        );
        let mut request = Request::new();
        let (status, _) = request.parse(stream.as_bytes());
        assert_eq!(status, ParseStatus::Success);
        request
    }

    #[test_case("../../etc/passwd", "passwd" ; "strips path components")]
    #[test_case("C:\\docs\\r\u{e9}sum\u{e9}.txt", "rsum.txt" ; "strips backslash paths and non ascii")]
    #[test_case("my file.txt", "my_file.txt" ; "spaces become underscores")]
    #[test_case(".bashrc", "_.bashrc" ; "leading dot masked")]
    #[test_case("<>|", "unnamed" ; "nothing left becomes unnamed")]
    #[test_case("ok-name_1.tar.gz", "ok-name_1.tar.gz" ; "safe names pass through")]
    fn sanitize_cases(input: &str, expected: &str) {
        assert_eq!(sanitize_filename(input), expected);
    }

    #[test]
    fn boundary_extraction() {
        assert_eq!(
            extract_boundary("multipart/form-data; boundary=XYZ"),
            Some("XYZ".to_string())
        );
        assert_eq!(
            extract_boundary("multipart/form-data; boundary=\"a b\"; charset=x"),
            Some("a b".to_string())
        );
        assert_eq!(extract_boundary("multipart/form-data"), None);
    }

    #[test]
    fn content_disposition_params() {
        let (name, filename) =
            parse_content_disposition("form-data; name=\"f\"; filename=\"a.txt\"");
        assert_eq!(name, Some("f".to_string()));
        assert_eq!(filename, Some("a.txt".to_string()));

        let (name, filename) = parse_content_disposition("form-data; name=\"field\"");
        assert_eq!(name, Some("field".to_string()));
        assert_eq!(filename, None);
    }

    #[test]
    fn stores_a_multipart_file() {
        let dir = tempdir().unwrap();
        let request = multipart_request(
            "bnd",
            "--B\r\nContent-Disposition: form-data; name=\"f\"; filename=\"a.txt\"\r\n\r\n\
             HELLO\r\n--B--\r\n",
        );
        let saved = handle(&request, dir.path().to_str().unwrap(), 1024 * 1024).unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].name, "a.txt");
        assert_eq!(saved[0].size, 5);
        assert_eq!(fs::read(dir.path().join("a.txt")).unwrap(), b"HELLO");
    }

    #[test]
    fn form_fields_are_skipped() {
        let dir = tempdir().unwrap();
        let request = multipart_request(
            "bnd",
            "--B\r\nContent-Disposition: form-data; name=\"comment\"\r\n\r\n\
             just text\r\n--B--\r\n",
        );
        let saved = handle(&request, dir.path().to_str().unwrap(), 1024 * 1024).unwrap();
        assert!(saved.is_empty());
    }

    #[test]
    fn colliding_names_get_suffixes() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"old").unwrap();

        let first = unique_filename(dir.path(), "a.txt");
        assert_ne!(first, "a.txt");
        assert!(first.starts_with("a_"));
        assert!(first.ends_with(".txt"));
    }

    #[test]
    fn oversized_body_is_413() {
        let dir = tempdir().unwrap();
        let request = multipart_request("bnd", "--B\r\n\r\n\r\n--B--\r\n");
        let (status, _) = handle(&request, dir.path().to_str().unwrap(), 4).unwrap_err();
        assert_eq!(status, 413);
    }

    #[test]
    fn missing_boundary_is_400() {
        let dir = tempdir().unwrap();
        let stream = "POST /u HTTP/1.1\r\nHost: x\r\n\
                      Content-Type: multipart/form-data\r\n\
                      Content-Length: 4\r\n\r\nabcd";
        let mut request = Request::new();
        request.parse(stream.as_bytes());
        let (status, _) = handle(&request, dir.path().to_str().unwrap(), 1024).unwrap_err();
        assert_eq!(status, 400);
    }

    #[test]
    fn octet_stream_upload_uses_default_name() {
        let dir = tempdir().unwrap();
        let stream = "POST /u HTTP/1.1\r\nHost: x\r\n\
                      Content-Type: application/octet-stream\r\n\
                      Content-Length: 3\r\n\r\nRAW";
        let mut request = Request::new();
        let (status, _) = request.parse(stream.as_bytes());
        assert_eq!(status, ParseStatus::Success);
        let saved = handle(&request, dir.path().to_str().unwrap(), 1024).unwrap();
        assert_eq!(saved[0].name, "upload");
        assert_eq!(fs::read(dir.path().join("upload")).unwrap(), b"RAW");
    }

    #[test]
    fn success_page_lists_files_and_sizes() {
        let page = success_page(&[SavedFile {
            name: "a.txt".to_string(),
            size: 5,
        }]);
        assert!(page.contains("Uploaded 1 file(s)"));
        assert!(page.contains("a.txt (5 bytes)"));
    }
}
