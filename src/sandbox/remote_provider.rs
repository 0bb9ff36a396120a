//! HTTP/WebSocket client for the hosted sandbox provider.
//!
//! Plain operations are JSON over HTTP. The directory watcher and PTY output
//! are WebSocket streams, each pumped by a background task into an `mpsc`
//! channel so callers never see the socket.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, trace, warn};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::error_handling::types::SandboxError;
use crate::sandbox::provider::{
    CommandOutput, CreateOptions, FileEvent, PtyOptions, PtyProcess, Sandbox, SandboxProvider,
};

const API_KEY_HEADER: &str = "X-API-Key";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Extra time allowed on top of a command's own bound for the HTTP round trip.
const COMMAND_GRACE: Duration = Duration::from_secs(5);
const STREAM_BUFFER: usize = 256;

#[derive(Serialize)]
struct CreateRequest<'a> {
    template: &'a str,
    timeout: u64,
    envs: &'a std::collections::HashMap<String, String>,
}

#[derive(Deserialize)]
struct CreateResponse {
    sandbox_id: String,
}

#[derive(Serialize)]
struct CommandRequest<'a> {
    cmd: &'a str,
    timeout_secs: u64,
}

#[derive(Serialize)]
struct PtyRequest<'a> {
    cols: u16,
    rows: u16,
    cwd: &'a str,
}

#[derive(Deserialize)]
struct PtyResponse {
    pid: u32,
}

#[derive(Serialize)]
struct ResizeRequest {
    cols: u16,
    rows: u16,
}

/// Shared connection settings for the provider API.
#[derive(Debug, Clone)]
struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
    api_key: Option<String>,
}

impl ApiClient {
    fn endpoint(&self, path: &str) -> Result<Url, SandboxError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| SandboxError::Transport(format!("invalid endpoint {}: {}", path, e)))
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.http.request(method, url).timeout(REQUEST_TIMEOUT);
        match &self.api_key {
            Some(key) => builder.header(API_KEY_HEADER, key),
            None => builder,
        }
    }

    /// Opens a WebSocket to `url` (http scheme rewritten to ws) with the API key attached.
    async fn open_socket(
        &self,
        mut url: Url,
    ) -> Result<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        SandboxError,
    > {
        to_ws_scheme(&mut url)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| SandboxError::Transport(e.to_string()))?;
        if let Some(key) = &self.api_key {
            let value = HeaderValue::from_str(key)
                .map_err(|e| SandboxError::Transport(format!("invalid API key header: {}", e)))?;
            request.headers_mut().insert(API_KEY_HEADER, value);
        }
        let (stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| SandboxError::Transport(format!("websocket {}: {}", url, e)))?;
        Ok(stream)
    }
}

fn to_ws_scheme(url: &mut Url) -> Result<(), SandboxError> {
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SandboxError::Transport(format!(
                "unsupported scheme {}",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SandboxError::Transport(format!("cannot use {} for {}", scheme, url)))
}

fn transport_error(err: reqwest::Error) -> SandboxError {
    if err.is_timeout() {
        SandboxError::Timeout(err.to_string())
    } else {
        SandboxError::Transport(err.to_string())
    }
}

/// Maps a provider status onto the error taxonomy, passing successful responses through.
async fn check_status(response: Response, what: &str) -> Result<Response, SandboxError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, what, &body))
}

fn status_error(status: StatusCode, what: &str, body: &str) -> SandboxError {
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => SandboxError::NotFound(what.to_string()),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            SandboxError::Timeout(what.to_string())
        }
        other => SandboxError::Upstream(format!("{} returned {}: {}", what, other, body.trim())),
    }
}

/// PTY calls report a vanished process as `PtyGone` so the relay can reconnect.
fn pty_error(err: SandboxError) -> SandboxError {
    match err {
        SandboxError::NotFound(e) => SandboxError::PtyGone(e),
        other => other,
    }
}

/// Client for the hosted sandbox provider.
pub struct RemoteSandboxProvider {
    api: Arc<ApiClient>,
}

impl RemoteSandboxProvider {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self, SandboxError> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| SandboxError::Transport(format!("invalid provider url: {}", e)))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        if api_key.is_none() {
            warn!("No sandbox provider API key configured, requests are sent unauthenticated");
        }
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| SandboxError::Transport(e.to_string()))?;
        Ok(Self {
            api: Arc::new(ApiClient {
                http,
                base_url,
                api_key,
            }),
        })
    }
}

#[async_trait]
impl SandboxProvider for RemoteSandboxProvider {
    async fn create(&self, options: CreateOptions) -> Result<Arc<dyn Sandbox>, SandboxError> {
        let url = self.api.endpoint("sandboxes")?;
        let body = CreateRequest {
            template: &options.template,
            timeout: options.lifetime_secs,
            envs: &options.envs,
        };
        let response = self
            .api
            .request(Method::POST, url)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let created: CreateResponse = check_status(response, "create sandbox")
            .await?
            .json()
            .await
            .map_err(|e| SandboxError::Upstream(format!("bad create response: {}", e)))?;
        info!("Created sandbox {} from template {}", created.sandbox_id, options.template);
        Ok(Arc::new(RemoteSandbox {
            id: created.sandbox_id,
            api: self.api.clone(),
        }))
    }

    async fn connect(&self, sandbox_id: &str) -> Result<Arc<dyn Sandbox>, SandboxError> {
        let url = self.api.endpoint(&format!("sandboxes/{}", sandbox_id))?;
        let response = self
            .api
            .request(Method::GET, url)
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response, &format!("sandbox {}", sandbox_id)).await?;
        debug!("Connected to sandbox {}", sandbox_id);
        Ok(Arc::new(RemoteSandbox {
            id: sandbox_id.to_string(),
            api: self.api.clone(),
        }))
    }
}

struct RemoteSandbox {
    id: String,
    api: Arc<ApiClient>,
}

impl RemoteSandbox {
    fn endpoint(&self, suffix: &str) -> Result<Url, SandboxError> {
        self.api
            .endpoint(&format!("sandboxes/{}/{}", self.id, suffix))
    }

    fn file_endpoint(&self, suffix: &str, path: &str) -> Result<Url, SandboxError> {
        let mut url = self.endpoint(suffix)?;
        url.query_pairs_mut().append_pair("path", path);
        Ok(url)
    }
}

#[async_trait]
impl Sandbox for RemoteSandbox {
    fn sandbox_id(&self) -> &str {
        &self.id
    }

    async fn run_command(
        &self,
        cmd: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, SandboxError> {
        let url = self.endpoint("commands")?;
        let body = CommandRequest {
            cmd,
            timeout_secs: timeout.as_secs().max(1),
        };
        let request = self
            .api
            .request(Method::POST, url)
            .timeout(timeout + COMMAND_GRACE)
            .json(&body)
            .send();
        let response = tokio::time::timeout(timeout + COMMAND_GRACE, request)
            .await
            .map_err(|_| SandboxError::Timeout(format!("command exceeded {:?}", timeout)))?
            .map_err(transport_error)?;
        let output: CommandOutput = check_status(response, "command")
            .await?
            .json()
            .await
            .map_err(|e| SandboxError::Upstream(format!("bad command response: {}", e)))?;
        trace!("[{}] `{}` exited with {}", self.id, cmd, output.exit_code);
        Ok(output)
    }

    async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        let url = self.file_endpoint("files", path)?;
        let response = self
            .api
            .request(Method::GET, url)
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response, path)
            .await?
            .text()
            .await
            .map_err(transport_error)
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        let url = self.file_endpoint("files", path)?;
        let response = self
            .api
            .request(Method::PUT, url)
            .body(content.to_string())
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response, path).await?;
        Ok(())
    }

    async fn watch_dir(&self, path: &str) -> Result<mpsc::Receiver<FileEvent>, SandboxError> {
        let url = self.file_endpoint("watch", path)?;
        let socket = self.api.open_socket(url).await?;
        let (mut sink, mut stream) = socket.split();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let sandbox_id = self.id.clone();

        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Ping(payload)) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("[{}] Watcher stream error: {}", sandbox_id, e);
                        break;
                    }
                };
                match serde_json::from_str::<FileEvent>(&text) {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("[{}] Unparseable watcher event: {}", sandbox_id, e),
                }
            }
            debug!("[{}] Watcher stream ended", sandbox_id);
        });

        Ok(rx)
    }

    async fn create_pty(&self, options: PtyOptions<'_>) -> Result<PtyProcess, SandboxError> {
        let url = self.endpoint("pty")?;
        let body = PtyRequest {
            cols: options.cols,
            rows: options.rows,
            cwd: options.cwd,
        };
        let response = self
            .api
            .request(Method::POST, url)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let created: PtyResponse = check_status(response, "create pty")
            .await?
            .json()
            .await
            .map_err(|e| SandboxError::Upstream(format!("bad pty response: {}", e)))?;

        let url = self.endpoint(&format!("pty/{}", created.pid))?;
        let socket = self.api.open_socket(url).await.map_err(pty_error)?;
        let (mut sink, mut stream) = socket.split();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let sandbox_id = self.id.clone();
        let pid = created.pid;

        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let chunk = match message {
                    Ok(Message::Binary(data)) => Bytes::from(data),
                    Ok(Message::Text(text)) => Bytes::from(text.into_bytes()),
                    Ok(Message::Ping(payload)) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("[{}] PTY {} stream error: {}", sandbox_id, pid, e);
                        break;
                    }
                };
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
            debug!("[{}] PTY {} output stream ended", sandbox_id, pid);
        });

        info!("[{}] PTY {} started in {}", self.id, pid, options.cwd);
        Ok(PtyProcess { pid, output: rx })
    }

    async fn send_pty_input(&self, pid: u32, data: &[u8]) -> Result<(), SandboxError> {
        let url = self.endpoint(&format!("pty/{}/input", pid))?;
        let response = self
            .api
            .request(Method::POST, url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(data.to_vec())
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response, &format!("pty {}", pid))
            .await
            .map_err(pty_error)?;
        Ok(())
    }

    async fn resize_pty(&self, pid: u32, cols: u16, rows: u16) -> Result<(), SandboxError> {
        let url = self.endpoint(&format!("pty/{}/resize", pid))?;
        let response = self
            .api
            .request(Method::POST, url)
            .json(&ResizeRequest { cols, rows })
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response, &format!("pty {}", pid))
            .await
            .map_err(pty_error)?;
        Ok(())
    }

    async fn kill(&self) -> Result<(), SandboxError> {
        let url = self.api.endpoint(&format!("sandboxes/{}", self.id))?;
        let response = self
            .api
            .request(Method::DELETE, url)
            .send()
            .await
            .map_err(transport_error)?;
        match check_status(response, &self.id).await {
            Ok(_) => {
                info!("Killed sandbox {}", self.id);
                Ok(())
            }
            Err(SandboxError::NotFound(_)) => {
                debug!("Sandbox {} already gone", self.id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
