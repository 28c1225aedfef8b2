//! Shared utilities for the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::connect_info::MockConnectInfo;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::Router;
use futures_util::future::BoxFuture;
use futures_util::{Stream, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use stream_gateway::config::GatewayConfig;
use stream_gateway::gateway::Gateway;
use stream_gateway::http::HttpServer;
use stream_gateway::observability::MemorySink;
use stream_gateway::relay::{FetchError, UpstreamFetcher, UpstreamRequest, UpstreamResponse};
use stream_gateway::security::rate_limit::InMemoryStore;

pub const BROWSER_UA: &str = "Mozilla/5.0 (X11; Linux x86_64) Firefox/128.0";
pub const CLIENT_ADDR: ([u8; 4], u16) = ([203, 0, 113, 10], 40_000);

/// Programmable upstream that records calls and notices when its body is dropped.
pub struct FakeFetcher {
    status: StatusCode,
    headers: HeaderMap,
    chunks: Vec<Bytes>,
    hang_after_chunks: bool,
    error: Option<FetchError>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    polls: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
    requests: Mutex<Vec<UpstreamRequest>>,
}

impl FakeFetcher {
    pub fn new(status: u16) -> Self {
        Self {
            status: StatusCode::from_u16(status).unwrap(),
            headers: HeaderMap::new(),
            chunks: Vec::new(),
            hang_after_chunks: false,
            error: None,
            delay: None,
            calls: AtomicUsize::new(0),
            polls: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
            requests: Mutex::default(),
        }
    }

    /// A 200 response carrying `body` split into `chunk` sized pieces.
    pub fn ok(body: &[u8], chunk: usize) -> Self {
        Self::new(200)
            .header("content-type", "video/mp4")
            .header("content-length", &body.len().to_string())
            .body(body, chunk)
    }

    /// Fails before any response headers arrive.
    pub fn failing(error: FetchError) -> Self {
        let mut fetcher = Self::new(200);
        fetcher.error = Some(error);
        fetcher
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(
            HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
        self
    }

    pub fn body(mut self, body: &[u8], chunk: usize) -> Self {
        self.chunks = body
            .chunks(chunk.max(1))
            .map(Bytes::copy_from_slice)
            .collect();
        self
    }

    /// Keep the body open after the last chunk, like a slow origin.
    pub fn hang(mut self) -> Self {
        self.hang_after_chunks = true;
        self
    }

    /// Wait this long before answering, like a distant origin.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Times any body handed out has been polled.
    pub fn body_polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn upstream_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<UpstreamRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl UpstreamFetcher for FakeFetcher {
    fn fetch(&self, request: UpstreamRequest) -> BoxFuture<'_, Result<UpstreamResponse, FetchError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);

        let result = match &self.error {
            Some(error) => Err(error.clone()),
            None => Ok(UpstreamResponse {
                status: self.status,
                headers: self.headers.clone(),
                body: FakeBody {
                    chunks: self.chunks.iter().cloned().collect(),
                    hang: self.hang_after_chunks,
                    polls: self.polls.clone(),
                    closed: self.closed.clone(),
                }
                .boxed(),
            }),
        };
        let delay = self.delay;
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            result
        })
    }
}

struct FakeBody {
    chunks: VecDeque<Bytes>,
    hang: bool,
    polls: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

impl Stream for FakeBody {
    type Item = Result<Bytes, FetchError>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        this.polls.fetch_add(1, Ordering::SeqCst);
        match this.chunks.pop_front() {
            Some(chunk) => Poll::Ready(Some(Ok(chunk))),
            None if this.hang => Poll::Pending,
            None => Poll::Ready(None),
        }
    }
}

impl Drop for FakeBody {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Defaults suited to in-process tests: no DNS checks, no random sampling.
pub fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.upstream.resolve_check = false;
    config.observability.sampling_rate = 0.0;
    config
}

pub struct TestGateway {
    pub router: Router,
    pub gateway: Arc<Gateway>,
    pub sink: Arc<MemorySink>,
}

/// Assemble the real router around a fake upstream and an in-memory sink.
pub fn gateway_with(config: GatewayConfig, fetcher: Arc<FakeFetcher>) -> TestGateway {
    let sink = Arc::new(MemorySink::new());
    let gateway = Arc::new(
        Gateway::new(
            &config,
            fetcher,
            Arc::new(InMemoryStore::new()),
            sink.clone(),
        )
        .unwrap(),
    );
    let router = HttpServer::with_gateway(config, gateway.clone())
        .router()
        .layer(MockConnectInfo(SocketAddr::from(CLIENT_ADDR)));

    TestGateway {
        router,
        gateway,
        sink,
    }
}

pub fn stream_uri(target: &str) -> String {
    let query: String = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("url", target)
        .finish();
    format!("/stream?{query}")
}

/// `GET /stream` for `target` with a browser User-Agent.
pub fn stream_request(target: &str, range: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .uri(stream_uri(target))
        .header("user-agent", BROWSER_UA);
    if let Some(range) = range {
        builder = builder.header("range", range);
    }
    builder.body(Body::empty()).unwrap()
}

pub async fn body_json(body: Body) -> serde_json::Value {
    let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Raw-TCP origin serving `response` to every connection. Request heads are
/// recorded so tests can check what the fetcher sent.
pub async fn start_origin(response: Vec<u8>) -> (SocketAddr, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let response = Arc::new(response);

    let recorded = seen.clone();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let response = response.clone();
            let recorded = recorded.clone();
            tokio::spawn(async move {
                let head = read_head(&mut socket).await;
                recorded.lock().unwrap().push(head);
                let _ = socket.write_all(&response).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (addr, seen)
}

/// Raw-TCP origin that accepts connections and never answers.
pub async fn start_silent_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut open = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            open.push(socket);
        }
    });
    addr
}

async fn read_head(socket: &mut tokio::net::TcpStream) -> String {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
    String::from_utf8_lossy(&head).into_owned()
}
