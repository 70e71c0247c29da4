//! HTTP client for the container engine API.
//!
//! Each request opens a fresh HTTP/1.1 connection over the target's socket.
//! Engines keep no per-connection state we rely on, and a fresh connection
//! keeps streamed endpoints (build, push, exec attach) from tying up a pool.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::{Method, Request, Response, StatusCode, header};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::RuntimeConfig;
use crate::runtime::error::{Result, RuntimeError};
use crate::runtime::frames::{Demuxed, FrameDecoder};
use crate::runtime::progress::{LogSink, ProgressDecoder, apply_record};
use crate::runtime::types::{
    ContainerInfo, ContainerSpec, ContainerSummary, DiskUsage, ExecOutput, NetworkSummary,
    PruneReport, RegistryAuth, RuntimeTarget, split_image_ref,
};
use crate::runtime::ContainerRuntime;

/// Polls of `GET /exec/{id}/json` after the attached stream closes.
const EXEC_INSPECT_ATTEMPTS: u32 = 50;
const EXEC_INSPECT_DELAY: Duration = Duration::from_millis(100);

/// Seconds the engine waits for a graceful stop before killing.
const STOP_GRACE_SECS: u32 = 10;

enum ReqBody {
    Empty,
    Json(Value),
    Tar(Bytes),
}

#[derive(Deserialize)]
struct IdResponse {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Deserialize)]
struct ExecInspect {
    #[serde(rename = "Running", default)]
    running: bool,
    #[serde(rename = "ExitCode", default)]
    exit_code: Option<i64>,
}

/// Container engine client bound to one target.
#[derive(Debug, Clone)]
pub struct DockerClient {
    target: RuntimeTarget,
    api_version: String,
    timeout: Duration,
}

impl DockerClient {
    pub fn new(target: RuntimeTarget, config: &RuntimeConfig) -> Self {
        Self {
            target,
            api_version: config.api_version.clone(),
            timeout: config.request_timeout,
        }
    }

    /// Client for the local control socket.
    pub fn local(config: &RuntimeConfig) -> Self {
        Self::new(RuntimeTarget::local(config), config)
    }

    pub fn target(&self) -> &RuntimeTarget {
        &self.target
    }

    fn connection_error(&self, e: impl std::fmt::Display) -> RuntimeError {
        RuntimeError::Connection {
            target: self.target.to_string(),
            reason: e.to_string(),
        }
    }

    fn host_header(&self) -> String {
        match &self.target {
            RuntimeTarget::Local(_) => "localhost".to_string(),
            RuntimeTarget::Remote { host, port } => format!("{}:{}", host, port),
        }
    }

    async fn handshake<S>(&self, stream: S) -> Result<http1::SendRequest<Full<Bytes>>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| self.connection_error(e))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!("Container engine connection closed with error: {}", e);
            }
        });
        Ok(sender)
    }

    async fn open(&self) -> Result<http1::SendRequest<Full<Bytes>>> {
        match &self.target {
            #[cfg(unix)]
            RuntimeTarget::Local(path) => {
                let stream = tokio::net::UnixStream::connect(path)
                    .await
                    .map_err(|e| self.connection_error(e))?;
                self.handshake(stream).await
            }
            #[cfg(not(unix))]
            RuntimeTarget::Local(_) => Err(self.connection_error(
                "local control sockets are only supported on unix",
            )),
            RuntimeTarget::Remote { host, port } => {
                let stream = tokio::net::TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(|e| self.connection_error(e))?;
                self.handshake(stream).await
            }
        }
    }

    /// Send a request and wait for the response head.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: ReqBody,
        headers: &[(&'static str, String)],
    ) -> Result<Response<Incoming>> {
        let uri = format!("/{}{}", self.api_version, path);
        tracing::debug!(target = %self.target, "{} {}", method, uri);

        let (content_type, bytes) = match body {
            ReqBody::Empty => (None, Bytes::new()),
            ReqBody::Json(v) => (
                Some("application/json"),
                Bytes::from(serde_json::to_vec(&v).map_err(|e| RuntimeError::protocol(e.to_string()))?),
            ),
            ReqBody::Tar(b) => (Some("application/x-tar"), b),
        };

        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::HOST, self.host_header());
        if let Some(ct) = content_type {
            builder = builder.header(header::CONTENT_TYPE, ct);
        }
        for (name, value) in headers {
            builder = builder.header(*name, value.as_str());
        }
        let request = builder
            .body(Full::new(bytes))
            .map_err(|e| RuntimeError::protocol(e.to_string()))?;

        let fut = async {
            let mut sender = self.open().await?;
            sender
                .send_request(request)
                .await
                .map_err(|e| self.connection_error(e))
        };

        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| RuntimeError::Timeout {
                operation: "request",
                after: self.timeout,
            })?
    }

    async fn read_body(&self, response: Response<Incoming>) -> Result<Bytes> {
        let fut = response.into_body().collect();
        let collected = tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| RuntimeError::Timeout {
                operation: "response body",
                after: self.timeout,
            })?
            .map_err(|e| self.connection_error(e))?;
        Ok(collected.to_bytes())
    }

    /// Read the body, turning a non-success status into an error.
    async fn expect(&self, response: Response<Incoming>, ok: &[StatusCode]) -> Result<Bytes> {
        let status = response.status();
        let body = self.read_body(response).await?;
        if status.is_success() || ok.contains(&status) {
            Ok(body)
        } else {
            Err(error_from_body(status, &body))
        }
    }

    async fn expect_json<T: serde::de::DeserializeOwned>(
        &self,
        response: Response<Incoming>,
    ) -> Result<T> {
        let body = self.expect(response, &[]).await?;
        serde_json::from_slice(&body)
            .map_err(|e| RuntimeError::protocol(format!("unexpected response body: {e}")))
    }

    /// Consume a newline-delimited progress stream.
    async fn stream_progress(&self, response: Response<Incoming>, sink: &dyn LogSink) -> Result<()> {
        let status = response.status();
        if !status.is_success() {
            let body = self.read_body(response).await?;
            return Err(error_from_body(status, &body));
        }

        let mut body = response.into_body();
        let mut decoder = ProgressDecoder::new();
        loop {
            let next = tokio::time::timeout(self.timeout, body.frame())
                .await
                .map_err(|_| RuntimeError::Timeout {
                    operation: "progress stream",
                    after: self.timeout,
                })?;
            let Some(frame) = next else { break };
            let frame = frame.map_err(|e| self.connection_error(e))?;
            if let Ok(data) = frame.into_data() {
                for record in decoder.push(&data)? {
                    apply_record(&record, sink)?;
                }
            }
        }
        if let Some(record) = decoder.finish()? {
            apply_record(&record, sink)?;
        }
        Ok(())
    }

    /// Read an attached exec stream to the end and de-multiplex it.
    async fn read_multiplexed(&self, response: Response<Incoming>) -> Result<Demuxed> {
        let status = response.status();
        if !status.is_success() {
            let body = self.read_body(response).await?;
            return Err(error_from_body(status, &body));
        }

        let mut body = response.into_body();
        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        loop {
            let next = tokio::time::timeout(self.timeout, body.frame())
                .await
                .map_err(|_| RuntimeError::Timeout {
                    operation: "exec output",
                    after: self.timeout,
                })?;
            let Some(frame) = next else { break };
            let frame = frame.map_err(|e| self.connection_error(e))?;
            if let Ok(data) = frame.into_data() {
                frames.extend(decoder.push(&data)?);
            }
        }
        decoder.finish()?;
        Ok(Demuxed::from_frames(&frames))
    }
}

/// Build an error from a failed response body.
///
/// Streamed endpoints can fail with a progress record instead of the usual
/// `{"message": ...}` object; the record's error wins when present.
fn error_from_body(status: StatusCode, body: &[u8]) -> RuntimeError {
    let text = String::from_utf8_lossy(body);

    for line in text.lines() {
        if let Ok(record) = serde_json::from_str::<crate::runtime::progress::ProgressRecord>(line)
            && let Some(message) = record.error_message()
        {
            return RuntimeError::Progress { message };
        }
    }

    let message = serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(String::from))
        .unwrap_or_else(|| text.trim().to_string());

    if status == StatusCode::NOT_FOUND {
        RuntimeError::NotFound { message }
    } else {
        RuntimeError::Api {
            status: status.as_u16(),
            message,
        }
    }
}

fn enc(s: &str) -> String {
    urlencoding::encode(s).into_owned()
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn ping(&self) -> Result<()> {
        let resp = self.send(Method::GET, "/_ping", ReqBody::Empty, &[]).await?;
        self.expect(resp, &[]).await.map(|_| ())
    }

    async fn pull_image(&self, image: &str, sink: &dyn LogSink) -> Result<()> {
        let (name, tag) = split_image_ref(image);
        tracing::info!(target = %self.target, "Pulling image {}", image);
        let path = format!("/images/create?fromImage={}&tag={}", enc(name), enc(tag));
        let resp = self.send(Method::POST, &path, ReqBody::Empty, &[]).await?;
        self.stream_progress(resp, sink).await
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let path = format!("/containers/create?name={}", enc(&spec.name));
        let resp = self
            .send(Method::POST, &path, ReqBody::Json(spec.to_create_body()), &[])
            .await?;
        let created: IdResponse = self.expect_json(resp).await?;
        tracing::debug!(target = %self.target, "Created container {} ({})", spec.name, created.id);
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let path = format!("/containers/{}/start", id);
        let resp = self.send(Method::POST, &path, ReqBody::Empty, &[]).await?;
        self.expect(resp, &[StatusCode::NOT_MODIFIED]).await.map(|_| ())
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        let path = format!("/containers/{}/stop?t={}", id, STOP_GRACE_SECS);
        let resp = self.send(Method::POST, &path, ReqBody::Empty, &[]).await?;
        self.expect(resp, &[StatusCode::NOT_MODIFIED, StatusCode::NOT_FOUND])
            .await
            .map(|_| ())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let path = format!("/containers/{}?force=true&v=true", id);
        let resp = self.send(Method::DELETE, &path, ReqBody::Empty, &[]).await?;
        self.expect(resp, &[StatusCode::NOT_FOUND]).await.map(|_| ())
    }

    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerInfo>> {
        let path = format!("/containers/{}/json", id);
        let resp = self.send(Method::GET, &path, ReqBody::Empty, &[]).await?;
        match self.expect_json(resp).await {
            Ok(info) => Ok(Some(info)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerSummary>> {
        let filters = json!({ "label": [label] }).to_string();
        let path = format!("/containers/json?all=true&filters={}", enc(&filters));
        let resp = self.send(Method::GET, &path, ReqBody::Empty, &[]).await?;
        self.expect_json(resp).await
    }

    async fn exec_run(&self, id: &str, cmd: &[String], env: &[String]) -> Result<ExecOutput> {
        // 1. create the exec context
        let path = format!("/containers/{}/exec", id);
        let body = json!({
            "AttachStdout": true,
            "AttachStderr": true,
            "Tty": false,
            "Cmd": cmd,
            "Env": env,
        });
        let resp = self.send(Method::POST, &path, ReqBody::Json(body), &[]).await?;
        let exec: IdResponse = self.expect_json(resp).await?;

        // 2. start attached and collect the multiplexed output
        let path = format!("/exec/{}/start", exec.id);
        let body = json!({ "Detach": false, "Tty": false });
        let resp = self.send(Method::POST, &path, ReqBody::Json(body), &[]).await?;
        let output = self.read_multiplexed(resp).await?;

        // 3. poll for the exit code
        let path = format!("/exec/{}/json", exec.id);
        for _ in 0..EXEC_INSPECT_ATTEMPTS {
            let resp = self.send(Method::GET, &path, ReqBody::Empty, &[]).await?;
            let inspect: ExecInspect = self.expect_json(resp).await?;
            if !inspect.running {
                let exit_code = inspect.exit_code.ok_or_else(|| {
                    RuntimeError::protocol("exec finished without an exit code")
                })?;
                return Ok(ExecOutput {
                    exit_code,
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                });
            }
            tokio::time::sleep(EXEC_INSPECT_DELAY).await;
        }

        Err(RuntimeError::Timeout {
            operation: "exec exit code",
            after: EXEC_INSPECT_DELAY * EXEC_INSPECT_ATTEMPTS,
        })
    }

    async fn upload_archive(&self, id: &str, path: &str, tar: Bytes) -> Result<()> {
        let uri = format!("/containers/{}/archive?path={}", id, enc(path));
        let resp = self.send(Method::PUT, &uri, ReqBody::Tar(tar), &[]).await?;
        self.expect(resp, &[]).await.map(|_| ())
    }

    async fn download_archive(&self, id: &str, path: &str) -> Result<Bytes> {
        let uri = format!("/containers/{}/archive?path={}", id, enc(path));
        let resp = self.send(Method::GET, &uri, ReqBody::Empty, &[]).await?;
        self.expect(resp, &[]).await
    }

    async fn create_network(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<String> {
        let body = json!({
            "Name": name,
            "Driver": "bridge",
            "CheckDuplicate": true,
            "Labels": labels,
        });
        let resp = self
            .send(Method::POST, "/networks/create", ReqBody::Json(body), &[])
            .await?;
        let created: IdResponse = self.expect_json(resp).await?;
        Ok(created.id)
    }

    async fn connect_network(
        &self,
        network: &str,
        container: &str,
        aliases: &[String],
    ) -> Result<()> {
        let path = format!("/networks/{}/connect", network);
        let body = json!({
            "Container": container,
            "EndpointConfig": { "Aliases": aliases },
        });
        let resp = self.send(Method::POST, &path, ReqBody::Json(body), &[]).await?;
        self.expect(resp, &[]).await.map(|_| ())
    }

    async fn remove_network(&self, id: &str) -> Result<()> {
        let path = format!("/networks/{}", id);
        let resp = self.send(Method::DELETE, &path, ReqBody::Empty, &[]).await?;
        self.expect(resp, &[StatusCode::NOT_FOUND]).await.map(|_| ())
    }

    async fn list_networks(&self, name: &str) -> Result<Vec<NetworkSummary>> {
        let filters = json!({ "name": [name] }).to_string();
        let path = format!("/networks?filters={}", enc(&filters));
        let resp = self.send(Method::GET, &path, ReqBody::Empty, &[]).await?;
        let networks: Vec<NetworkSummary> = self.expect_json(resp).await?;
        // The engine's name filter matches substrings.
        Ok(networks.into_iter().filter(|n| n.name == name).collect())
    }

    async fn prune_images(&self, all_unused: bool) -> Result<PruneReport> {
        let dangling = if all_unused { "false" } else { "true" };
        let filters = json!({ "dangling": [dangling] }).to_string();
        let path = format!("/images/prune?filters={}", enc(&filters));
        let resp = self.send(Method::POST, &path, ReqBody::Empty, &[]).await?;
        let body: Value = self.expect_json(resp).await?;
        Ok(PruneReport::from_response(&body, "ImagesDeleted"))
    }

    async fn prune_containers(&self) -> Result<PruneReport> {
        let resp = self
            .send(Method::POST, "/containers/prune", ReqBody::Empty, &[])
            .await?;
        let body: Value = self.expect_json(resp).await?;
        Ok(PruneReport::from_response(&body, "ContainersDeleted"))
    }

    async fn disk_usage(&self) -> Result<DiskUsage> {
        let resp = self.send(Method::GET, "/system/df", ReqBody::Empty, &[]).await?;
        let body: Value = self.expect_json(resp).await?;
        Ok(DiskUsage::from_response(&body))
    }

    async fn build_image(&self, tag: &str, context: Bytes, sink: &dyn LogSink) -> Result<()> {
        tracing::info!(target = %self.target, "Building image {}", tag);
        let path = format!("/build?t={}&rm=true&forcerm=true", enc(tag));
        let resp = self.send(Method::POST, &path, ReqBody::Tar(context), &[]).await?;
        self.stream_progress(resp, sink).await
    }

    async fn push_image(
        &self,
        image: &str,
        auth: Option<&RegistryAuth>,
        sink: &dyn LogSink,
    ) -> Result<()> {
        let (name, tag) = split_image_ref(image);
        let auth_json = match auth {
            Some(a) => serde_json::to_string(a).map_err(|e| RuntimeError::protocol(e.to_string()))?,
            None => "{}".to_string(),
        };
        let auth_header = base64::engine::general_purpose::URL_SAFE.encode(auth_json);

        tracing::info!(target = %self.target, "Pushing image {}", image);
        let path = format!("/images/{}/push?tag={}", name, enc(tag));
        let resp = self
            .send(
                Method::POST,
                &path,
                ReqBody::Empty,
                &[("X-Registry-Auth", auth_header)],
            )
            .await?;
        self.stream_progress(resp, sink).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_from_json_message() {
        let err = error_from_body(
            StatusCode::CONFLICT,
            br#"{"message":"Conflict. The container name is already in use"}"#,
        );
        assert!(
            matches!(err, RuntimeError::Api { status: 409, ref message } if message.contains("already in use"))
        );
    }

    #[test]
    fn test_error_from_404_is_not_found() {
        let err = error_from_body(StatusCode::NOT_FOUND, br#"{"message":"No such container: x"}"#);
        assert!(err.is_not_found());
    }

    #[test]
    fn test_error_record_in_stream_wins_over_status() {
        let body = b"{\"stream\":\"Step 1/2\"}\n{\"error\":\"pull access denied\"}\n";
        let err = error_from_body(StatusCode::INTERNAL_SERVER_ERROR, body);
        assert!(matches!(err, RuntimeError::Progress { ref message } if message == "pull access denied"));
    }

    #[test]
    fn test_error_from_plain_text() {
        let err = error_from_body(StatusCode::BAD_GATEWAY, b"  upstream gone \n");
        assert!(matches!(err, RuntimeError::Api { status: 502, ref message } if message == "upstream gone"));
    }

    #[test]
    fn test_host_header() {
        let config = RuntimeConfig::default();
        let client = DockerClient::new(RuntimeTarget::remote("100.64.0.7", &config), &config);
        assert_eq!(client.host_header(), "100.64.0.7:2375");
        assert_eq!(DockerClient::local(&config).host_header(), "localhost");
    }
}
