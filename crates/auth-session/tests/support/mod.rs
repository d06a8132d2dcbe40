//! Minimal loopback HTTP server for exercising the client end to end.

// Not every test binary uses every helper here
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// A parsed incoming request.
#[derive(Debug, Clone)]
pub struct Req {
    pub method: String,
    pub path: String,
    pub bearer: Option<String>,
    pub body: serde_json::Value,
}

/// The response a handler produces.
#[derive(Debug, Clone)]
pub struct Resp {
    pub status: u16,
    pub body: serde_json::Value,
    /// Artificial latency before the response is written.
    pub delay: Option<Duration>,
}

impl Resp {
    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            body,
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

pub type Handler = Arc<dyn Fn(&Req) -> Resp + Send + Sync>;

/// One-connection-per-request HTTP server bound to an ephemeral local port.
pub struct TestServer {
    pub addr: SocketAddr,
    hits: Arc<Mutex<Vec<String>>>,
    accept_task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(handler: Handler) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test server");
        let addr = listener.local_addr().expect("local addr");
        let hits: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let hits_for_task = hits.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let handler = handler.clone();
                let hits = hits_for_task.clone();
                tokio::spawn(async move {
                    let _ = serve_one(stream, handler, hits).await;
                });
            }
        });

        Self {
            addr,
            hits,
            accept_task,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Every request seen so far, as "METHOD /path" in arrival order.
    pub fn requests(&self) -> Vec<String> {
        self.hits.lock().unwrap().clone()
    }

    pub fn hits_for(&self, path: &str) -> usize {
        self.hits
            .lock()
            .unwrap()
            .iter()
            .filter(|line| line.ends_with(path))
            .count()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve_one(
    mut stream: TcpStream,
    handler: Handler,
    hits: Arc<Mutex<Vec<String>>>,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    // Read until end of headers
    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let mut bearer = None;
    let mut content_length = 0usize;
    for line in lines {
        let lower = line.to_ascii_lowercase();
        if let Some(value) = lower.strip_prefix("authorization: bearer ") {
            bearer = Some(line[line.len() - value.len()..].to_string());
        } else if let Some(value) = lower.strip_prefix("content-length: ") {
            content_length = value.trim().parse().unwrap_or(0);
        }
    }

    // Read the body
    let mut body_bytes = buf[header_end + 4..].to_vec();
    while body_bytes.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body_bytes.extend_from_slice(&chunk[..n]);
    }
    let body = if body_bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body_bytes).unwrap_or(serde_json::Value::Null)
    };

    hits.lock().unwrap().push(format!("{method} {path}"));

    let req = Req {
        method,
        path,
        bearer,
        body,
    };
    let resp = handler(&req);
    if let Some(delay) = resp.delay {
        tokio::time::sleep(delay).await;
    }

    let payload = resp.body.to_string();
    let raw = format!(
        "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        resp.status,
        payload.len(),
        payload
    );
    stream.write_all(raw.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

/// A canned successful auth payload.
pub fn auth_payload(user_id: &str, access: &str, refresh: &str, expires_in: i64) -> serde_json::Value {
    serde_json::json!({
        "user": {
            "id": user_id,
            "email": format!("{user_id}@example.com"),
            "username": user_id,
            "isAnonymousAccount": false
        },
        "accessToken": access,
        "refreshToken": refresh,
        "expiresIn": expires_in
    })
}
