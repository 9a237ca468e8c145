//! A minimal in-process HTTP/1.1 server for exercising the `reqwest` paths.

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// What the server answers.
#[derive(Debug, Clone)]
pub struct TestResponse {
    status: u16,
    body: Vec<u8>,
    ranges: bool,
}

impl TestResponse {
    /// Serves `body` with `200`, honoring `Range: bytes=N-`.
    #[must_use]
    pub fn file(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            body,
            ranges: true,
        }
    }

    /// Answers every request with `status` and an empty body.
    #[must_use]
    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
            ranges: false,
        }
    }

    /// Ignores `Range` headers.
    #[must_use]
    pub fn without_ranges(mut self) -> Self {
        self.ranges = false;
        self
    }
}

/// A request the server received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    /// Request path.
    pub path: String,
    /// `Range` header, if sent.
    pub range: Option<String>,
}

#[derive(Debug)]
struct ServerState {
    response: TestResponse,
    requests: Vec<RecordedRequest>,
}

/// HTTP server bound to an ephemeral localhost port. Stops on drop.
#[derive(Debug)]
pub struct HttpTestServer {
    addr: SocketAddr,
    state: Arc<Mutex<ServerState>>,
    handle: JoinHandle<()>,
}

impl HttpTestServer {
    /// Starts the server.
    pub async fn start(response: TestResponse) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(Mutex::new(ServerState {
            response,
            requests: Vec::new(),
        }));

        let shared = Arc::clone(&state);
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    let _ = serve(stream, &shared).await;
                });
            }
        });

        Ok(Self { addr, state, handle })
    }

    /// The bound address.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Absolute URL for `path`.
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    /// Replaces the response for subsequent requests.
    pub fn set_response(&self, response: TestResponse) {
        self.state.lock().response = response;
    }

    /// Requests received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().requests.clone()
    }
}

impl Drop for HttpTestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(stream: TcpStream, state: &Mutex<ServerState>) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;
    let path = request_line
        .split_whitespace()
        .nth(1)
        .unwrap_or("/")
        .to_string();

    let mut range = None;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("range") {
                range = Some(value.trim().to_string());
            }
        }
    }

    let response = {
        let mut state = state.lock();
        state.requests.push(RecordedRequest {
            path,
            range: range.clone(),
        });
        state.response.clone()
    };

    let (status, headers, body) = render(&response, range.as_deref());
    let mut head = format!(
        "HTTP/1.1 {status} {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        reason(status),
        body.len()
    );
    for header in headers {
        head.push_str(&header);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");

    let stream = reader.get_mut();
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(&body).await?;
    stream.shutdown().await
}

fn render(response: &TestResponse, range: Option<&str>) -> (u16, Vec<String>, Vec<u8>) {
    let len = response.body.len();
    let offset = range
        .filter(|_| response.ranges && response.status == 200)
        .and_then(|r| r.strip_prefix("bytes="))
        .and_then(|r| r.strip_suffix('-'))
        .and_then(|r| r.parse::<usize>().ok());

    match offset {
        Some(offset) if offset < len => (
            206,
            vec![format!("Content-Range: bytes {offset}-{}/{len}", len - 1)],
            response.body[offset..].to_vec(),
        ),
        Some(_) => (416, vec![format!("Content-Range: bytes */{len}")], Vec::new()),
        None => (response.status, Vec::new(), response.body.clone()),
    }
}

const fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        206 => "Partial Content",
        404 => "Not Found",
        416 => "Range Not Satisfiable",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Status",
    }
}
