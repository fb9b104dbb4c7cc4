//! Test doubles shared by the scenario tests.

use crate::clarification::ClarificationSession;
use crate::connection::{StatusSink, UrlProvider};
use crate::event_log::LogLevel;
use crate::loop_events::LoopEventEntry;
use crate::status::PipelineStatus;
use crate::transport::{ConnectionError, SocketCloser, SocketEvent, StatusSocket, Transport};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

enum Script {
    Refuse(String),
    Accept(mpsc::UnboundedReceiver<SocketEvent>),
}

/// Transport whose connection attempts follow a script.
///
/// Each `connect` consumes the next scripted outcome. Once the script runs
/// out, `connect` never completes. Open sockets are counted from the moment
/// `connect` returns until their closer runs.
#[derive(Default)]
pub struct MockTransport {
    scripts: Mutex<VecDeque<Script>>,
    connects: AtomicUsize,
    urls: Mutex<Vec<String>>,
    open: Arc<AtomicUsize>,
    max_open: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Next `n` attempts fail
    pub fn refuse(&self, n: usize) {
        let mut scripts = self.scripts.lock().unwrap();
        for i in 0..n {
            scripts.push_back(Script::Refuse(format!("connection refused ({})", i + 1)));
        }
    }

    /// Next attempt opens a socket fed by the returned sender. Dropping the
    /// sender closes the socket.
    pub fn accept(&self) -> mpsc::UnboundedSender<SocketEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.scripts.lock().unwrap().push_back(Script::Accept(rx));
        tx
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }

    /// Sockets handed out and not yet closed
    pub fn open_sockets(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Highest number of sockets open at the same time
    pub fn max_open_sockets(&self) -> usize {
        self.max_open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, url: &Url) -> Result<Box<dyn StatusSocket>, ConnectionError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(url.to_string());

        let script = self.scripts.lock().unwrap().pop_front();
        match script {
            Some(Script::Refuse(reason)) => Err(ConnectionError::Connect(reason)),
            Some(Script::Accept(rx)) => {
                let now = self.open.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_open.fetch_max(now, Ordering::SeqCst);
                Ok(Box::new(MockSocket {
                    rx,
                    closed: CancellationToken::new(),
                    open: Some(self.open.clone()),
                }))
            }
            None => std::future::pending().await,
        }
    }
}

struct MockSocket {
    rx: mpsc::UnboundedReceiver<SocketEvent>,
    closed: CancellationToken,
    open: Option<Arc<AtomicUsize>>,
}

#[async_trait]
impl StatusSocket for MockSocket {
    async fn next_event(&mut self) -> SocketEvent {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => SocketEvent::Closed(None),
            event = self.rx.recv() => event.unwrap_or(SocketEvent::Closed(None)),
        }
    }

    fn take_closer(&mut self) -> Box<dyn SocketCloser> {
        Box::new(MockCloser {
            closed: self.closed.clone(),
            open: self.open.take(),
        })
    }
}

struct MockCloser {
    closed: CancellationToken,
    open: Option<Arc<AtomicUsize>>,
}

impl SocketCloser for MockCloser {
    fn close(self: Box<Self>) {
        self.closed.cancel();
        if let Some(open) = self.open {
            open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinkCall {
    Log(LogLevel, String),
    Status(PipelineStatus),
    Label(Option<String>),
    Connected(bool),
    Clarification(ClarificationSession),
    LoopEvent(LoopEventEntry),
}

/// Sink that records every callback in order
#[derive(Default)]
pub struct RecordingSink {
    calls: Mutex<Vec<SinkCall>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn statuses(&self) -> Vec<PipelineStatus> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                SinkCall::Status(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    pub fn connection_changes(&self) -> Vec<bool> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                SinkCall::Connected(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    fn push(&self, call: SinkCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl StatusSink for RecordingSink {
    fn log(&self, level: LogLevel, message: &str) {
        self.push(SinkCall::Log(level, message.to_string()));
    }

    fn status(&self, status: PipelineStatus) {
        self.push(SinkCall::Status(status));
    }

    fn progress_label(&self, label: Option<&str>) {
        self.push(SinkCall::Label(label.map(str::to_string)));
    }

    fn connection_state(&self, connected: bool) {
        self.push(SinkCall::Connected(connected));
    }

    fn clarification(&self, session: ClarificationSession) {
        self.push(SinkCall::Clarification(session));
    }

    fn loop_event(&self, event: LoopEventEntry) {
        self.push(SinkCall::LoopEvent(event));
    }
}

pub fn fixed_url(url: &str) -> UrlProvider {
    let url = url.to_string();
    Arc::new(move || url.clone())
}

/// Let spawned tasks run. Under a paused clock this advances time by 1ms.
pub async fn settle() {
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// One request as seen by the stub HTTP server
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// e.g. `POST /api/pipeline/run`
    pub line: String,
    pub body: String,
}

/// Minimal HTTP/1.1 server answering each connection with the next canned
/// `(status, json body)` in order. Returns the base URL and the requests seen.
pub async fn spawn_http_stub(
    responses: Vec<(u16, String)>,
) -> (String, Arc<Mutex<Vec<RecordedRequest>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_by_server = seen.clone();

    tokio::spawn(async move {
        for (status, body) in responses {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let request = read_request(&mut stream).await;
            seen_by_server.lock().unwrap().push(request);

            let reason = match status {
                200 => "OK",
                404 => "Not Found",
                405 => "Method Not Allowed",
                _ => "Error",
            };
            let response = format!(
                "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                reason,
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    });

    (base_url, seen)
}

async fn read_request(stream: &mut tokio::net::TcpStream) -> RecordedRequest {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            break buf.len();
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let content_length = head
        .lines()
        .filter_map(|l| l.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let n = stream.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let body_end = buf.len().min(header_end + content_length);
    RecordedRequest {
        line: head
            .lines()
            .next()
            .unwrap_or_default()
            .trim_end_matches(" HTTP/1.1")
            .to_string(),
        body: String::from_utf8_lossy(&buf[header_end..body_end]).to_string(),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
