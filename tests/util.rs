use std::collections::HashMap;
use std::fs::{create_dir_all, File};
use std::io;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

fn get_unused_port() -> Option<u16> {
    TcpListener::bind(("127.0.0.1", 0))
        .ok()
        .map(|listener| listener.local_addr().unwrap().port())
}

fn wait_for_port(port: u16) -> bool {
    for _ in 0..1000 {
        if TcpStream::connect(("127.0.0.1", port)).is_ok() {
            return true;
        }
        sleep(Duration::from_millis(5));
    }
    false
}

struct ScopedChild(Child);

impl Drop for ScopedChild {
    fn drop(&mut self) {
        self.0.kill().ok();
        self.0.wait().ok();
    }
}

impl From<Child> for ScopedChild {
    fn from(child: Child) -> Self {
        ScopedChild(child)
    }
}

pub struct Server {
    _child: ScopedChild,
    port: u16,
    root: TempDir,
}

impl Server {
    /// Start the server binary over a fresh www root. The config template may
    /// use `{port}` and `{root}` placeholders.
    pub fn with_config(config_template: &str) -> Self {
        let root = tempdir().expect("failed to create tempdir");

        // Assumes the port won't be reused before the server starts.
        let port = get_unused_port().expect("failed to get unused port");

        let config = config_template
            .replace("{port}", &port.to_string())
            .replace("{root}", root.path().to_str().expect("path is not UTF-8"));
        let config_path = root.path().join("test.conf");
        std::fs::write(&config_path, config).expect("failed to write config");

        let child = Command::new(env!("CARGO_BIN_EXE_webserv"))
            .arg(&config_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn webserv")
            .into();

        assert!(wait_for_port(port), "failed to connect to webserv");

        Self {
            _child: child,
            port,
            root,
        }
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn create_dir(&self, name: &str) -> PathBuf {
        let path = self.root().join(name);
        create_dir_all(&path).expect("failed to create directory");
        path
    }

    pub fn create_file(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.root().join(name);
        let mut file = File::create(&path).expect("failed to create file");
        file.write_all(contents).expect("failed to write file");
        path
    }

    pub fn create_script(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.create_file(name, contents.as_bytes());
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("failed to chmod script");
        path
    }

    pub fn stream(&self) -> TcpStream {
        let stream =
            TcpStream::connect(("127.0.0.1", self.port)).expect("failed to connect to webserv");
        // Set timeouts to prevent tests from hanging.
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
            .set_write_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    /// Send raw bytes, read until the server closes the connection.
    pub fn raw(&self, request: &[u8]) -> Vec<u8> {
        let mut stream = self.stream();
        stream.write_all(request).unwrap();
        let mut response = Vec::new();
        stream
            .read_to_end(&mut response)
            .expect("failed to read response");
        response
    }

    pub fn get(&self, path: &str, headers: HashMap<&str, &str>) -> Response {
        let mut request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\n", path);
        for (name, value) in headers {
            if name == "Host" {
                continue;
            }
            request.push_str(&format!("{}: {}\r\n", name, value));
        }
        request.push_str("Connection: close\r\n\r\n");
        Response::parse(&self.raw(request.as_bytes()))
    }

    pub fn get_with_host(&self, path: &str, host: &str) -> Response {
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            path, host
        );
        Response::parse(&self.raw(request.as_bytes()))
    }

    pub fn post(&self, path: &str, content_type: &str, body: &[u8]) -> Response {
        let mut request = format!(
            "POST {} HTTP/1.1\r\nHost: localhost\r\nContent-Type: {}\r\n\
             Content-Length: {}\r\nConnection: close\r\n\r\n",
            path,
            content_type,
            body.len()
        )
        .into_bytes();
        request.extend_from_slice(body);
        Response::parse(&self.raw(&request))
    }

    pub fn delete(&self, path: &str) -> Response {
        let request = format!(
            "DELETE {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        Response::parse(&self.raw(request.as_bytes()))
    }
}

/// HTTP response as read off the wire.
pub struct Response {
    pub status_line: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn parse(raw: &[u8]) -> Self {
        Self::from_reader(&mut &raw[..]).expect("failed to parse response")
    }

    pub fn from_reader<R: Read>(reader: &mut R) -> io::Result<Self> {
        let status_line = read_line(reader)?;
        let mut headers = HashMap::new();
        loop {
            let line = read_line(reader)?;
            if line.is_empty() {
                break;
            }
            let mut parts = line.splitn(2, ": ");
            let name = parts.next().expect("invalid header").to_string();
            let value = parts.next().expect("invalid header").to_string();
            headers.insert(name, value);
        }
        let length: usize = headers
            .get("Content-Length")
            .map(|value| value.parse().expect("invalid content length"))
            .unwrap_or(0);
        let mut body = vec![0; length];
        reader.read_exact(&mut body)?;
        Ok(Self {
            status_line,
            headers,
            body,
        })
    }

    pub fn status(&self) -> u16 {
        self.status_line
            .split(' ')
            .nth(1)
            .and_then(|code| code.parse().ok())
            .expect("malformed status line")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

fn read_line<R: Read>(reader: &mut R) -> io::Result<String> {
    let mut line = Vec::new();
    let mut byte = [0; 1];
    loop {
        reader.read_exact(&mut byte)?;
        line.push(byte[0]);
        if line.ends_with(b"\r\n") {
            line.truncate(line.len() - 2);
            return Ok(String::from_utf8(line).expect("response line is not UTF-8"));
        }
    }
}
