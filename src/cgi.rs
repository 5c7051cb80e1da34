//! CGI/1.1 integration: interpreter selection, environment assembly, child
//! spawning over non-blocking pipes, and output parsing. The event loop owns
//! the per-child `Session` records and drives their I/O.

use std::ffi::{CStr, CString};
use std::net::IpAddr;
use std::os::unix::io::RawFd;

use anyhow::{Context, Result};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::{access, close, dup2, execve, fork, pipe, AccessFlags, ForkResult, Pid};

use crate::config::{LocationConfig, Method};
use crate::request::Request;

/// Wall-clock ceiling for a CGI child.
pub const TIMEOUT_SECS: i64 = 30;
/// Ceiling on accumulated child output.
pub const MAX_OUTPUT_SIZE: usize = 10 * 1024 * 1024;

/// The loop's record of one in-flight CGI child, keyed by `stdout_fd`.
#[derive(Debug)]
pub struct Session {
    /// Owning connection's fd; the connection may be gone at finalisation.
    pub conn_fd: RawFd,
    /// Generation of the owning connection when the session started, so a
    /// recycled fd is not mistaken for the owner.
    pub conn_generation: u64,
    pub pid: Pid,
    pub stdout_fd: RawFd,
    /// Write end towards the child; -1 once closed.
    pub stdin_fd: RawFd,
    pub started: i64,
    pub input: Vec<u8>,
    pub input_sent: usize,
    pub output: Vec<u8>,
    /// Server index, for the error-page map at finalisation.
    pub server: usize,
    pub keep_alive: bool,
}

#[derive(Debug)]
pub struct SpawnedChild {
    pub pid: Pid,
    pub stdout_fd: RawFd,
    pub stdin_fd: RawFd,
}

fn is_executable(path: &str) -> bool {
    std::fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
        && access(path, AccessFlags::X_OK).is_ok()
}

/// Interpreter for a script: the location's `cgi_pass` wins, then a
/// well-known interpreter for the extension, then direct execution (None).
pub fn choose_interpreter(script_path: &str, location: &LocationConfig) -> Option<String> {
    if let Some(interpreter) = location.cgi_pass.first() {
        return Some(interpreter.clone());
    }

    let extension = script_path.rsplit('.').next().unwrap_or("");
    let candidates: &[&str] = match extension {
        "py" => &["/usr/bin/python3", "/usr/bin/python", "python3"],
        "pl" => &["/usr/bin/perl", "perl"],
        "rb" => &["/usr/bin/ruby", "ruby"],
        "php" => &[
            "/usr/bin/php-cgi",
            "/usr/bin/php",
            "/usr/local/bin/php-cgi",
            "/usr/local/bin/php",
            "php",
        ],
        "sh" => &["/bin/bash", "/bin/sh", "sh"],
        _ => return None,
    };
    for candidate in &candidates[..candidates.len() - 1] {
        if is_executable(candidate) {
            return Some(candidate.to_string());
        }
    }
    Some(candidates[candidates.len() - 1].to_string())
}

/// Pre-fork validation: the script must exist, and whichever program will be
/// exec'd must be executable. Failures are `(status, reason)` pairs.
pub fn check_script(
    script_path: &str,
    location: &LocationConfig,
) -> Result<Option<String>, (u16, String)> {
    if std::fs::metadata(script_path).is_err() {
        return Err((404, format!("CGI script not found: {}", script_path)));
    }
    let interpreter = choose_interpreter(script_path, location);
    match &interpreter {
        None => {
            if !is_executable(script_path) {
                return Err((403, "CGI script is not executable".to_string()));
            }
        }
        Some(interpreter) => {
            if !is_executable(interpreter) {
                return Err((500, format!("CGI interpreter not found: {}", interpreter)));
            }
        }
    }
    Ok(interpreter)
}

/// Split PATH_INFO off a request path: everything after the script's CGI
/// extension, when the URI extends past the script.
pub fn split_path_info<'a>(path: &'a str, extensions: &[String]) -> (&'a str, &'a str) {
    for extension in extensions {
        let marker = format!("{}/", extension);
        if let Some(pos) = path.find(&marker) {
            let script_end = pos + extension.len();
            return (&path[..script_end], &path[script_end..]);
        }
    }
    (path, "")
}

/// Assemble the CGI/1.1 environment for a request.
pub fn build_env(
    request: &Request,
    script_path: &str,
    document_root: &str,
    path_info: &str,
    client_ip: IpAddr,
    client_port: u16,
    server_port: u16,
) -> Vec<CString> {
    let mut env: Vec<String> = Vec::new();

    env.push("GATEWAY_INTERFACE=CGI/1.1".to_string());
    env.push(format!("SERVER_PROTOCOL={}", request.version()));
    env.push(format!(
        "SERVER_SOFTWARE={}/{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    ));
    env.push(format!("REQUEST_METHOD={}", request.method()));
    env.push(format!("SERVER_PORT={}", server_port));

    let host = request.host();
    env.push(format!(
        "SERVER_NAME={}",
        if host.is_empty() { "localhost" } else { &host }
    ));

    env.push(format!("SCRIPT_NAME={}", request.path()));
    env.push(format!("SCRIPT_FILENAME={}", script_path));
    if !path_info.is_empty() {
        env.push(format!("PATH_INFO={}", path_info));
        env.push(format!("PATH_TRANSLATED={}{}", document_root, path_info));
    }
    env.push(format!("QUERY_STRING={}", request.query()));
    env.push(format!("REQUEST_URI={}", request.uri()));
    env.push(format!("DOCUMENT_ROOT={}", document_root));
    env.push(format!("REMOTE_ADDR={}", client_ip));
    env.push(format!("REMOTE_PORT={}", client_port));

    if request.method() == Method::Post {
        env.push(format!("CONTENT_LENGTH={}", request.body.len()));
        if let Some(content_type) = request.header("content-type") {
            env.push(format!("CONTENT_TYPE={}", content_type));
        }
    }

    for (name, value) in request.headers() {
        if name == "content-type" || name == "content-length" {
            continue;
        }
        let variable: String = name
            .chars()
            .map(|c| if c == '-' { '_' } else { c.to_ascii_uppercase() })
            .collect();
        env.push(format!("HTTP_{}={}", variable, value));
    }

    match std::env::var("PATH") {
        Ok(path) => env.push(format!("PATH={}", path)),
        Err(_) => env.push("PATH=/usr/local/bin:/usr/bin:/bin".to_string()),
    }
    if let Ok(home) = std::env::var("HOME") {
        env.push(format!("HOME={}", home));
    }
    env.push("REDIRECT_STATUS=200".to_string());

    env.into_iter()
        .filter_map(|entry| CString::new(entry).ok())
        .collect()
}

/// Fork and exec the script with pipes on stdin/stdout (stderr joins
/// stdout). Both parent-side pipe ends come back non-blocking.
pub fn spawn(script_path: &str, interpreter: Option<&str>, env: Vec<CString>) -> Result<SpawnedChild> {
    let (child_stdin_read, child_stdin_write) = pipe().context("failed to create stdin pipe")?;
    let (child_stdout_read, child_stdout_write) = match pipe() {
        Ok(fds) => fds,
        Err(e) => {
            close(child_stdin_read).ok();
            close(child_stdin_write).ok();
            return Err(e).context("failed to create stdout pipe");
        }
    };

    let script = CString::new(script_path).context("script path contains NUL")?;
    let interpreter = interpreter
        .map(|i| CString::new(i).context("interpreter path contains NUL"))
        .transpose()?;

    match unsafe { fork() }.context("failed to fork CGI process")? {
        ForkResult::Child => {
            // Only async-signal-safe work from here to exec.
            close(child_stdin_write).ok();
            close(child_stdout_read).ok();
            dup2(child_stdin_read, libc::STDIN_FILENO).ok();
            dup2(child_stdout_write, libc::STDOUT_FILENO).ok();
            dup2(child_stdout_write, libc::STDERR_FILENO).ok();
            close(child_stdin_read).ok();
            close(child_stdout_write).ok();

            let env_refs: Vec<&CStr> = env.iter().map(|e| e.as_c_str()).collect();
            match &interpreter {
                Some(interpreter) => {
                    let args = [interpreter.as_c_str(), script.as_c_str()];
                    execve(interpreter.as_c_str(), &args, &env_refs).ok();
                }
                None => {
                    let args = [script.as_c_str()];
                    execve(script.as_c_str(), &args, &env_refs).ok();
                }
            }
            // exec failed; the parent sees a non-zero exit at reap time.
            unsafe { libc::_exit(127) };
        }
        ForkResult::Parent { child } => {
            close(child_stdin_read).ok();
            close(child_stdout_write).ok();
            fcntl(child_stdin_write, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
                .context("failed to set CGI stdin non-blocking")?;
            fcntl(child_stdout_read, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
                .context("failed to set CGI stdout non-blocking")?;
            Ok(SpawnedChild {
                pid: child,
                stdout_fd: child_stdout_read,
                stdin_fd: child_stdin_write,
            })
        }
    }
}

/// Parsed CGI output.
#[derive(Debug)]
pub struct CgiOutput {
    pub status: u16,
    pub content_type: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Split child output into headers and body. A missing header block means
/// the whole output is the body. `Err` means output that cannot be turned
/// into a response (a malformed Status header).
pub fn parse_output(output: &[u8]) -> Result<CgiOutput, String> {
    let mut result = CgiOutput {
        status: 200,
        content_type: "text/html".to_string(),
        headers: Vec::new(),
        body: Vec::new(),
    };

    let (header_block, body) = match crate::util::find(b"\r\n\r\n", output) {
        Some(end) => (&output[..end], &output[end + 4..]),
        None => match crate::util::find(b"\n\n", output) {
            Some(end) => (&output[..end], &output[end + 2..]),
            None => {
                result.body = output.to_vec();
                return Ok(result);
            }
        },
    };
    result.body = body.to_vec();

    let mut explicit_status = false;
    for line in String::from_utf8_lossy(header_block).lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let colon = match line.find(':') {
            Some(colon) => colon,
            None => continue,
        };
        let name = &line[..colon];
        let value = line[colon + 1..].trim();

        match name.to_lowercase().as_str() {
            "status" => {
                let code_text = value.split(' ').next().unwrap_or("");
                let code: u16 = code_text
                    .parse()
                    .map_err(|_| format!("malformed Status header: {}", value))?;
                if !(100..=599).contains(&code) {
                    return Err(format!("Status code {} out of range", code));
                }
                result.status = code;
                explicit_status = true;
            }
            "content-type" => result.content_type = value.to_string(),
            "location" => {
                result.headers.push(("Location".to_string(), value.to_string()));
                if !explicit_status && result.status == 200 {
                    result.status = 302;
                }
            }
            // The response builder owns the framing headers; a script's own
            // Content-Length would end up on the wire twice.
            "content-length" | "connection" | "transfer-encoding" => {}
            _ => result.headers.push((name.to_string(), value.to_string())),
        }
    }
    Ok(result)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::request::{ParseStatus, Request};
    use nix::sys::wait::waitpid;
    use nix::unistd::read;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn request(stream: &str) -> Request {
        let mut request = Request::new();
        let (status, _) = request.parse(stream.as_bytes());
        assert_eq!(status, ParseStatus::Success);
        request
    }

    fn env_lookup<'a>(env: &'a [CString], key: &str) -> Option<String> {
        let prefix = format!("{}=", key);
        env.iter()
            .map(|e| e.to_str().unwrap())
            .find(|e| e.starts_with(&prefix))
            .map(|e| e[prefix.len()..].to_string())
    }

    #[test]
    fn environment_covers_the_cgi_contract() {
        let r = request(
            "POST /cgi/run.py?a=1&b=2 HTTP/1.1\r\n\
             Host: example.com:8080\r\n\
             Content-Type: text/plain\r\n\
             Content-Length: 4\r\n\
             X-Custom-Token: abc\r\n\r\nbody",
        );
        let env = build_env(
            &r,
            "/srv/cgi/run.py",
            "/srv/cgi",
            "",
            "10.0.0.9".parse().unwrap(),
            54321,
            8080,
        );
        assert_eq!(env_lookup(&env, "GATEWAY_INTERFACE").as_deref(), Some("CGI/1.1"));
        assert_eq!(env_lookup(&env, "REQUEST_METHOD").as_deref(), Some("POST"));
        assert_eq!(env_lookup(&env, "SERVER_PROTOCOL").as_deref(), Some("HTTP/1.1"));
        assert_eq!(env_lookup(&env, "SERVER_NAME").as_deref(), Some("example.com"));
        assert_eq!(env_lookup(&env, "SERVER_PORT").as_deref(), Some("8080"));
        assert_eq!(env_lookup(&env, "SCRIPT_NAME").as_deref(), Some("/cgi/run.py"));
        assert_eq!(
            env_lookup(&env, "SCRIPT_FILENAME").as_deref(),
            Some("/srv/cgi/run.py")
        );
        assert_eq!(env_lookup(&env, "QUERY_STRING").as_deref(), Some("a=1&b=2"));
        assert_eq!(
            env_lookup(&env, "REQUEST_URI").as_deref(),
            Some("/cgi/run.py?a=1&b=2")
        );
        assert_eq!(env_lookup(&env, "REMOTE_ADDR").as_deref(), Some("10.0.0.9"));
        assert_eq!(env_lookup(&env, "REMOTE_PORT").as_deref(), Some("54321"));
        assert_eq!(env_lookup(&env, "CONTENT_LENGTH").as_deref(), Some("4"));
        assert_eq!(env_lookup(&env, "CONTENT_TYPE").as_deref(), Some("text/plain"));
        assert_eq!(env_lookup(&env, "HTTP_X_CUSTOM_TOKEN").as_deref(), Some("abc"));
        assert_eq!(env_lookup(&env, "REDIRECT_STATUS").as_deref(), Some("200"));
        assert!(env_lookup(&env, "PATH_INFO").is_none());
        assert!(env_lookup(&env, "PATH").is_some());
    }

    #[test]
    fn path_info_extends_past_the_script() {
        let extensions = vec![".py".to_string()];
        let (script, info) = split_path_info("/cgi/run.py/extra/bits", &extensions);
        assert_eq!(script, "/cgi/run.py");
        assert_eq!(info, "/extra/bits");

        let (script, info) = split_path_info("/cgi/run.py", &extensions);
        assert_eq!(script, "/cgi/run.py");
        assert_eq!(info, "");
    }

    #[test]
    fn cgi_pass_wins_interpreter_selection() {
        let mut location = LocationConfig::new("/cgi");
        location.cgi_pass.push("/opt/bin/mini-python".to_string());
        assert_eq!(
            choose_interpreter("/srv/x.py", &location),
            Some("/opt/bin/mini-python".to_string())
        );
    }

    #[test]
    fn missing_script_is_404_before_fork() {
        let location = LocationConfig::new("/cgi");
        let (status, _) = check_script("/definitely/not/here.py", &location).unwrap_err();
        assert_eq!(status, 404);
    }

    #[test]
    fn output_with_crlf_headers() {
        let parsed = parse_output(b"Content-Type: text/plain\r\nX-Extra: v\r\n\r\nok").unwrap();
        assert_eq!(parsed.status, 200);
        assert_eq!(parsed.content_type, "text/plain");
        assert_eq!(parsed.headers, vec![("X-Extra".to_string(), "v".to_string())]);
        assert_eq!(parsed.body, b"ok");
    }

    #[test]
    fn output_with_lf_headers_and_status() {
        let parsed = parse_output(b"Status: 418 short and stout\nContent-Type: text/x\n\nbody").unwrap();
        assert_eq!(parsed.status, 418);
        assert_eq!(parsed.content_type, "text/x");
        assert_eq!(parsed.body, b"body");
    }

    #[test]
    fn script_framing_headers_are_dropped() {
        let parsed = parse_output(
            b"Content-Type: text/plain\r\nContent-Length: 999\r\n\
              Connection: keep-alive\r\nTransfer-Encoding: chunked\r\n\
              X-Kept: yes\r\n\r\nok",
        )
        .unwrap();
        assert_eq!(parsed.headers, vec![("X-Kept".to_string(), "yes".to_string())]);
        assert_eq!(parsed.body, b"ok");
    }

    #[test]
    fn headerless_output_is_all_body() {
        let parsed = parse_output(b"raw bytes with no header block").unwrap();
        assert_eq!(parsed.status, 200);
        assert_eq!(parsed.content_type, "text/html");
        assert_eq!(parsed.body, b"raw bytes with no header block");
    }

    #[test]
    fn location_header_upgrades_to_302() {
        let parsed = parse_output(b"Location: /elsewhere\r\n\r\n").unwrap();
        assert_eq!(parsed.status, 302);
        assert_eq!(
            parsed.headers,
            vec![("Location".to_string(), "/elsewhere".to_string())]
        );

        let parsed = parse_output(b"Status: 301\r\nLocation: /x\r\n\r\n").unwrap();
        assert_eq!(parsed.status, 301);
    }

    #[test]
    fn malformed_status_is_an_error() {
        assert!(parse_output(b"Status: banana\r\n\r\n").is_err());
        assert!(parse_output(b"Status: 9999\r\n\r\n").is_err());
    }

    #[test]
    fn spawns_a_real_child_and_reads_its_output() {
        let dir = tempdir().unwrap();
        let script_path = dir.path().join("hello.sh");
        std::fs::File::create(&script_path)
            .unwrap()
            .write_all(b"#!/bin/sh\nprintf 'Content-Type: text/plain\\r\\n\\r\\nok'\n")
            .unwrap();
        std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let child = spawn(script_path.to_str().unwrap(), Some("/bin/sh"), Vec::new()).unwrap();
        close(child.stdin_fd).ok();

        let mut output = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match read(child.stdout_fd, &mut buf) {
                Ok(0) => break,
                Ok(n) => output.extend_from_slice(&buf[..n]),
                Err(e) if e.as_errno() == Some(nix::errno::Errno::EAGAIN) => {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                Err(e) => panic!("read failed: {}", e),
            }
        }
        close(child.stdout_fd).ok();
        waitpid(child.pid, None).unwrap();

        let parsed = parse_output(&output).unwrap();
        assert_eq!(parsed.status, 200);
        assert_eq!(parsed.content_type, "text/plain");
        assert_eq!(parsed.body, b"ok");
    }
}
