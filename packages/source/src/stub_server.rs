//! Minimal in-process HTTP server for exercising the catalog client
//! without network access.
//!
//! Each connection serves exactly one `GET` request and is then closed. The
//! request target (path plus query string) of every request is recorded so
//! tests can assert on retry counts and on the SQL that was sent.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// A canned HTTP response.
#[derive(Debug, Clone)]
pub struct StubResponse {
    /// HTTP status code.
    pub status: u16,
    /// `Content-Type` header value.
    pub content_type: &'static str,
    /// Response body.
    pub body: String,
}

impl StubResponse {
    /// `200 OK` with a JSON body.
    #[must_use]
    pub fn json(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            content_type: "application/json",
            body: body.into(),
        }
    }

    /// `200 OK` with a CSV body.
    #[must_use]
    pub fn csv(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            content_type: "text/csv",
            body: body.into(),
        }
    }

    /// Arbitrary status with a plain-text body.
    #[must_use]
    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "text/plain",
            body: body.into(),
        }
    }
}

type Handler = Arc<dyn Fn(&str) -> StubResponse + Send + Sync>;

/// A running stub server. Stops accepting connections when dropped.
pub struct StubServer {
    addr: SocketAddr,
    hits: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl StubServer {
    /// Starts a server that answers every request with `handler(target)`,
    /// where `target` is the request path including its query string.
    ///
    /// # Panics
    ///
    /// Panics if no local port can be bound.
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&str) -> StubResponse + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap_or_else(|e| panic!("failed to bind stub server: {e}"));
        let addr = listener
            .local_addr()
            .unwrap_or_else(|e| panic!("stub server has no local address: {e}"));
        let hits = Arc::new(Mutex::new(Vec::new()));
        let handler: Handler = Arc::new(handler);

        let task = {
            let hits = Arc::clone(&hits);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let hits = Arc::clone(&hits);
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        serve_one(stream, &hits, handler.as_ref()).await;
                    });
                }
            })
        };

        Self { addr, hits, task }
    }

    /// Starts a server that returns `responses` in order, one per request,
    /// and `404` once they are exhausted.
    pub async fn sequence(responses: Vec<StubResponse>) -> Self {
        let queue = Mutex::new(responses.into_iter());
        Self::start(move |_| {
            queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .next()
                .unwrap_or_else(|| StubResponse::status(404, "no more responses"))
        })
        .await
    }

    /// Base URL (`http://127.0.0.1:<port>`) without a trailing slash.
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Absolute URL for `path`.
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url())
    }

    /// Request targets received so far, in arrival order.
    #[must_use]
    pub fn hits(&self) -> Vec<String> {
        self.hits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Decodes query parameter `key` from a request target such as
/// `/api/3/action/datastore_search_sql?sql=SELECT+1`.
#[must_use]
pub fn query_param(target: &str, key: &str) -> Option<String> {
    let url = reqwest::Url::parse(&format!("http://stub{target}")).ok()?;
    url.query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

async fn serve_one(
    mut stream: TcpStream,
    hits: &Mutex<Vec<String>>,
    handler: &(dyn Fn(&str) -> StubResponse + Send + Sync),
) {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }

    let head = String::from_utf8_lossy(&buf);
    let target = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_string();

    hits.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(target.clone());

    let response = handler(&target);
    let payload = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        response.status,
        reason_phrase(response.status),
        response.content_type,
        response.body.len(),
        response.body,
    );

    if stream.write_all(payload.as_bytes()).await.is_ok() {
        stream.shutdown().await.ok();
    }
}

const fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        404 => "Not Found",
        409 => "Conflict",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}
