//! Provider HTTP calls.
//!
//! reqwest needs a tokio reactor, so requests run as tasks on a small
//! dedicated runtime and report back to the smol side over channels and
//! join handles. A streaming request is owned by an [`EventStream`]; dropping
//! it aborts the reading task, which drops the response body and closes the
//! connection even while the provider is silent.

use async_channel::{Receiver, Sender};
use async_lock::OnceCell;
use futures::StreamExt;
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::task::AbortHandle;

use super::decode::{EventDecoder, StreamEvent, sse_data, status_error};
use crate::error::GenerationError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// A fully built provider request.
#[derive(Clone)]
pub(crate) struct HttpRequest {
    pub backend: &'static str,
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: Value,
}

impl std::fmt::Debug for HttpRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Headers carry credentials
        f.debug_struct("HttpRequest")
            .field("backend", &self.backend)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

type EventResult = Result<StreamEvent, GenerationError>;

fn runtime(backend: &'static str) -> Result<&'static Runtime, GenerationError> {
    static RUNTIME: OnceLock<Runtime> = OnceLock::new();
    if let Some(runtime) = RUNTIME.get() {
        return Ok(runtime);
    }
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("sqlwizard-http")
        .enable_all()
        .build()
        .map_err(|e| GenerationError::Network {
            backend,
            detail: format!("failed to start HTTP runtime: {}", e),
        })?;
    Ok(RUNTIME.get_or_init(|| runtime))
}

/// Connection-pooling client, built on first use and shared by clones.
#[derive(Clone, Default)]
pub(crate) struct HttpClient {
    client: Arc<OnceCell<reqwest::Client>>,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("initialized", &self.client.is_initialized())
            .finish()
    }
}

impl HttpClient {
    pub(crate) async fn get(&self, backend: &'static str) -> Result<&reqwest::Client, GenerationError> {
        self.client
            .get_or_try_init(|| async {
                reqwest::Client::builder()
                    .connect_timeout(CONNECT_TIMEOUT)
                    .build()
                    .map_err(|e| GenerationError::Network {
                        backend,
                        detail: format!("failed to build HTTP client: {}", e),
                    })
            })
            .await
    }
}

/// Events of one streaming response. The request is aborted when this is
/// dropped.
pub(crate) struct EventStream {
    events: Receiver<EventResult>,
    task: AbortHandle,
}

impl EventStream {
    pub(crate) fn events(&self) -> Receiver<EventResult> {
        self.events.clone()
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Start a streaming request. Events arrive on [`EventStream::events`],
/// which closes after `Done` or an error.
pub(crate) fn spawn_stream(
    client: &reqwest::Client,
    request: HttpRequest,
    decoder: EventDecoder,
    timeout: Duration,
) -> Result<EventStream, GenerationError> {
    let runtime = runtime(request.backend)?;
    let (tx, rx) = async_channel::bounded(64);
    let client = client.clone();

    let task = runtime.spawn(async move {
        let backend = request.backend;
        if let Err(e) = stream_events(&client, &request, decoder, timeout, &tx).await {
            tracing::debug!("{}: stream ended with error: {}", backend, e);
            let _ = tx.send(Err(e)).await;
        }
    });

    Ok(EventStream {
        events: rx,
        task: task.abort_handle(),
    })
}

async fn send(
    client: &reqwest::Client,
    request: &HttpRequest,
    timeout: Duration,
) -> Result<reqwest::Response, GenerationError> {
    let mut builder = client
        .post(&request.url)
        .timeout(timeout)
        .json(&request.body);
    for (name, value) in &request.headers {
        builder = builder.header(*name, value);
    }

    let response = builder
        .send()
        .await
        .map_err(|e| request_error(request.backend, e, timeout))?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let body = response.text().await.unwrap_or_default();
    Err(status_error(request.backend, status.as_u16(), retry_after, &body))
}

async fn stream_events(
    client: &reqwest::Client,
    request: &HttpRequest,
    decoder: EventDecoder,
    timeout: Duration,
    tx: &Sender<EventResult>,
) -> Result<(), GenerationError> {
    let backend = request.backend;
    let response = send(client, request, timeout).await?;
    tracing::debug!("{}: streaming response started", backend);

    let mut body = response.bytes_stream();
    let mut lines = LineBuffer::default();

    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| request_error(backend, e, timeout))?;
        for line in lines.push(&chunk) {
            if !dispatch(&line, decoder, backend, tx).await? {
                return Ok(());
            }
        }
    }
    if let Some(line) = lines.finish() {
        if !dispatch(&line, decoder, backend, tx).await? {
            return Ok(());
        }
    }

    let _ = tx.send(Ok(StreamEvent::Done)).await;
    Ok(())
}

/// Decode one line and pass it on. `false` once nothing more should be read.
async fn dispatch(
    line: &str,
    decoder: EventDecoder,
    backend: &'static str,
    tx: &Sender<EventResult>,
) -> Result<bool, GenerationError> {
    let Some(data) = sse_data(line) else {
        return Ok(true);
    };
    match decoder(data, backend)? {
        Some(StreamEvent::Done) => {
            let _ = tx.send(Ok(StreamEvent::Done)).await;
            Ok(false)
        }
        Some(event) => {
            let open = tx.send(Ok(event)).await.is_ok();
            if !open {
                tracing::debug!("{}: receiver dropped, closing stream", backend);
            }
            Ok(open)
        }
        None => Ok(true),
    }
}

/// Splits a byte stream into lines. Only `\n` splits, so multibyte
/// characters are never cut.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(end) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            lines.push(decode_line(&line[..end]));
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        (!self.pending.is_empty()).then(|| decode_line(&std::mem::take(&mut self.pending)))
    }
}

fn decode_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim_end_matches('\r').to_string()
}

/// Send a non-streaming request and parse the JSON body.
pub(crate) async fn send_json(
    client: &reqwest::Client,
    request: HttpRequest,
    timeout: Duration,
) -> Result<Value, GenerationError> {
    let backend = request.backend;
    let client = client.clone();
    runtime(backend)?
        .spawn(async move {
            let response = send(&client, &request, timeout).await?;
            let body = response
                .text()
                .await
                .map_err(|e| request_error(backend, e, timeout))?;
            serde_json::from_str(&body).map_err(|e| GenerationError::MalformedResponse {
                backend,
                detail: e.to_string(),
            })
        })
        .await
        .map_err(|e| GenerationError::Network {
            backend,
            detail: format!("request task failed: {}", e),
        })?
}

fn request_error(backend: &'static str, err: reqwest::Error, timeout: Duration) -> GenerationError {
    if err.is_timeout() {
        GenerationError::Timeout {
            backend,
            after: timeout,
        }
    } else {
        GenerationError::Network {
            backend,
            detail: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::llm::decode::decode_anthropic_event;
    use serde_json::json;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::time::Instant;

    const DELTA: &str =
        "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"SELECT\"}}\n\n";

    /// Answers one request with a single SSE event, then goes quiet and
    /// waits for the client to hang up. Returns whether it saw the hang-up.
    fn silent_after_first_event() -> (String, std::thread::JoinHandle<std::io::Result<bool>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/v1/messages", listener.local_addr().unwrap());

        let server = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept()?;
            let mut buf = [0u8; 4096];
            let mut head = Vec::new();
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf)?;
                if n == 0 {
                    return Ok(false);
                }
                head.extend_from_slice(&buf[..n]);
            }

            write!(
                socket,
                "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n{:x}\r\n{}\r\n",
                DELTA.len(),
                DELTA
            )?;
            socket.flush()?;

            socket.set_read_timeout(Some(Duration::from_secs(10)))?;
            loop {
                match socket.read(&mut buf) {
                    Ok(0) => return Ok(true),
                    // Rest of the request body
                    Ok(_) => continue,
                    Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => return Ok(true),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        return Ok(false);
                    }
                    Err(e) => return Err(e),
                }
            }
        });

        (url, server)
    }

    #[test]
    fn test_dropping_stream_closes_silent_connection() {
        smol::block_on(async {
            let (url, server) = silent_after_first_event();
            let client = reqwest::Client::builder().no_proxy().build().unwrap();
            let request = HttpRequest {
                backend: "test",
                url,
                headers: vec![],
                body: json!({ "stream": true }),
            };

            let stream = spawn_stream(
                &client,
                request,
                decode_anthropic_event,
                Duration::from_secs(30),
            )
            .unwrap();
            let first = stream.events().recv().await.unwrap().unwrap();
            assert_eq!(first, StreamEvent::Text("SELECT".to_string()));

            let dropped = Instant::now();
            drop(stream);

            let hung_up = smol::unblock(move || server.join()).await;
            assert!(matches!(hung_up, Ok(Ok(true))), "connection left open");
            assert!(dropped.elapsed() < Duration::from_secs(5));
        });
    }

    #[test]
    fn test_line_buffer_rejoins_split_lines() {
        let mut lines = LineBuffer::default();
        assert!(lines.push(b"data: {\"a\"").is_empty());
        assert_eq!(lines.push(b":1}\r\n\r\ndata: \xe6\xa6"), vec!["data: {\"a\":1}", ""]);
        assert_eq!(lines.push(b"\x82\xe8\xa6\x81\n"), vec!["data: 概要"]);
        assert_eq!(lines.push(b"data: [DONE]"), Vec::<String>::new());
        assert_eq!(lines.finish().as_deref(), Some("data: [DONE]"));
        assert_eq!(lines.finish(), None);
    }

    #[test]
    fn test_client_is_built_once() {
        smol::block_on(async {
            let http = HttpClient::default();
            let shared = http.clone();
            let first: *const reqwest::Client = http.get("test").await.unwrap();
            let second: *const reqwest::Client = shared.get("test").await.unwrap();
            assert_eq!(first, second);
        });
    }
}
