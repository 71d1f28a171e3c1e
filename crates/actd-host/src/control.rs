//! Local control surface: NDJSON request/response envelopes over a Unix socket.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use actd_kernel::{GroupDescriptor, GroupId, ObjectDescriptor, ObjectId};
use base64::prelude::*;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use crate::daemon::Activation;
use crate::error::ActivationError;
use crate::instantiator::Stub;

pub const PROTOCOL_VERSION: u8 = 1;

const DRAIN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub v: u8,
    pub id: String,
    pub cmd: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl RequestEnvelope {
    pub fn new(cmd: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            id: uuid::Uuid::new_v4().to_string(),
            cmd: cmd.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ControlError>,
}

impl ResponseEnvelope {
    pub fn ok(id: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, error: ControlError) -> Self {
        Self {
            id: id.into(),
            ok: false,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlError {
    pub code: String,
    pub message: String,
}

impl std::fmt::Display for ControlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ControlError {}

impl ControlError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    fn invalid_request(msg: impl Into<String>) -> Self {
        Self::new("invalid_request", msg)
    }

    fn unknown_method() -> Self {
        Self::new("unknown_method", "unknown command")
    }

    fn decode(msg: impl Into<String>) -> Self {
        Self::new("decode_error", msg)
    }
}

impl From<ActivationError> for ControlError {
    fn from(err: ActivationError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

/// Serves the activation protocol on a Unix socket until the daemon shuts down.
pub struct ControlServer {
    path: PathBuf,
    activation: Activation,
    shutdown_rx: broadcast::Receiver<()>,
}

impl ControlServer {
    pub fn new(path: impl Into<PathBuf>, activation: Activation) -> Self {
        let shutdown_rx = activation.shutdown_signal();
        Self {
            path: path.into(),
            activation,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) -> io::Result<()> {
        if self.path.exists() {
            let _ = std::fs::remove_file(&self.path);
        }
        let listener = UnixListener::bind(&self.path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }
        tracing::info!(socket = %self.path.display(), "control server listening");

        let mut conns = JoinSet::new();
        loop {
            tokio::select! {
                res = listener.accept() => match res {
                    Ok((stream, _)) => {
                        conns.spawn(handle_conn(stream, self.activation.clone()));
                    }
                    Err(err) => tracing::warn!(error = %err, "control accept failed"),
                },
                Some(_) = conns.join_next(), if !conns.is_empty() => {}
                _ = self.shutdown_rx.recv() => break,
            }
        }
        let _ = std::fs::remove_file(&self.path);
        // Give in-flight requests (the shutdown reply among them) a moment to drain.
        let drained = tokio::time::timeout(DRAIN_GRACE, async {
            while conns.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            conns.abort_all();
        }
        tracing::debug!("control server stopped");
        Ok(())
    }
}

async fn handle_conn(stream: UnixStream, activation: Activation) {
    let (r, mut w) = stream.into_split();
    let mut reader = BufReader::new(r);
    let mut line = String::new();

    while let Ok(n) = reader.read_line(&mut line).await {
        if n == 0 {
            break;
        }
        let resp = match serde_json::from_str::<RequestEnvelope>(&line) {
            Ok(req) => handle_request(req, &activation).await,
            Err(e) => ResponseEnvelope::err("", ControlError::decode(e.to_string())),
        };
        if let Ok(json) = serde_json::to_string(&resp) {
            if w.write_all(json.as_bytes()).await.is_err() || w.write_all(b"\n").await.is_err() {
                break;
            }
        }
        line.clear();
    }
}

#[derive(Deserialize)]
struct GroupPayload {
    group: String,
}

#[derive(Deserialize)]
struct ObjectPayload {
    object: String,
}

#[derive(Deserialize)]
struct DescPayload {
    desc_b64: String,
}

#[derive(Deserialize)]
struct SetObjectDescPayload {
    object: String,
    desc_b64: String,
}

#[derive(Deserialize)]
struct SetGroupDescPayload {
    group: String,
    desc_b64: String,
}

#[derive(Deserialize)]
struct ActivatePayload {
    object: String,
    #[serde(default)]
    force: bool,
}

#[derive(Deserialize)]
struct ActiveGroupPayload {
    group: String,
    endpoint: String,
    incarnation: u64,
}

#[derive(Deserialize)]
struct ActiveObjectPayload {
    group: String,
    object: String,
    stub_b64: String,
}

#[derive(Deserialize)]
struct InactiveObjectPayload {
    group: String,
    object: String,
}

#[derive(Deserialize)]
struct InactiveGroupPayload {
    group: String,
    incarnation: u64,
}

#[derive(Deserialize, Default)]
struct ShutdownPayload {
    #[serde(default)]
    token: Option<String>,
}

fn payload<T: DeserializeOwned>(req: &RequestEnvelope) -> Result<T, ControlError> {
    serde_json::from_value(req.payload.clone()).map_err(|e| ControlError::invalid_request(e.to_string()))
}

fn group_id(raw: &str) -> Result<GroupId, ControlError> {
    raw.parse()
        .map_err(|e| ControlError::invalid_request(format!("invalid group id: {e}")))
}

fn object_id(raw: &str) -> Result<ObjectId, ControlError> {
    raw.parse()
        .map_err(|e| ControlError::invalid_request(format!("invalid object id: {e}")))
}

pub fn encode_b64_cbor<T: Serialize>(value: &T) -> Result<String, ControlError> {
    let bytes = actd_cbor::to_canonical_cbor(value).map_err(|e| ControlError::decode(e.to_string()))?;
    Ok(BASE64_STANDARD.encode(bytes))
}

pub fn decode_b64_cbor<T: DeserializeOwned>(encoded: &str) -> Result<T, ControlError> {
    let bytes = BASE64_STANDARD
        .decode(encoded)
        .map_err(|e| ControlError::decode(format!("invalid base64: {e}")))?;
    actd_cbor::from_cbor(&bytes).map_err(|e| ControlError::decode(format!("invalid cbor: {e}")))
}

async fn handle_request(req: RequestEnvelope, activation: &Activation) -> ResponseEnvelope {
    let id = req.id.clone();
    tracing::debug!(cmd = %req.cmd, id = %id, "control request");
    let res = dispatch(&req, activation).await;
    match res {
        Ok(val) => ResponseEnvelope::ok(id, val),
        Err(e) => ResponseEnvelope::err(id, e),
    }
}

async fn dispatch(
    req: &RequestEnvelope,
    activation: &Activation,
) -> Result<serde_json::Value, ControlError> {
    if req.v != PROTOCOL_VERSION {
        return Err(ControlError::invalid_request("unsupported protocol version"));
    }
    let system = activation.system();
    match req.cmd.as_str() {
        "register-group" => {
            let p: DescPayload = payload(req)?;
            let desc: GroupDescriptor = decode_b64_cbor(&p.desc_b64)?;
            let group = system.register_group(desc).await?;
            Ok(serde_json::json!({ "group": group.to_string() }))
        }
        "unregister-group" => {
            let p: GroupPayload = payload(req)?;
            system.unregister_group(group_id(&p.group)?).await?;
            Ok(serde_json::json!({}))
        }
        "register-object" => {
            let p: DescPayload = payload(req)?;
            let desc: ObjectDescriptor = decode_b64_cbor(&p.desc_b64)?;
            let object = system.register_object(desc).await?;
            Ok(serde_json::json!({ "object": object.to_string() }))
        }
        "unregister-object" => {
            let p: ObjectPayload = payload(req)?;
            system.unregister_object(object_id(&p.object)?).await?;
            Ok(serde_json::json!({}))
        }
        "set-object-desc" => {
            let p: SetObjectDescPayload = payload(req)?;
            let desc: ObjectDescriptor = decode_b64_cbor(&p.desc_b64)?;
            let old = system.set_object_descriptor(object_id(&p.object)?, desc).await?;
            Ok(serde_json::json!({ "old_desc_b64": encode_b64_cbor(&old)? }))
        }
        "set-group-desc" => {
            let p: SetGroupDescPayload = payload(req)?;
            let desc: GroupDescriptor = decode_b64_cbor(&p.desc_b64)?;
            let old = system.set_group_descriptor(group_id(&p.group)?, desc).await?;
            Ok(serde_json::json!({ "old_desc_b64": encode_b64_cbor(&old)? }))
        }
        "get-object-desc" => {
            let p: ObjectPayload = payload(req)?;
            let desc = system.object_descriptor(object_id(&p.object)?)?;
            Ok(serde_json::json!({ "desc_b64": encode_b64_cbor(&desc)? }))
        }
        "get-group-desc" => {
            let p: GroupPayload = payload(req)?;
            let desc = system.group_descriptor(group_id(&p.group)?)?;
            Ok(serde_json::json!({ "desc_b64": encode_b64_cbor(&desc)? }))
        }
        "activate" => {
            let p: ActivatePayload = payload(req)?;
            let stub = activation
                .activator()
                .activate(object_id(&p.object)?, p.force)
                .await?;
            Ok(serde_json::json!({ "stub_b64": stub.to_base64() }))
        }
        "active-group" => {
            let p: ActiveGroupPayload = payload(req)?;
            system
                .active_group(group_id(&p.group)?, &p.endpoint, p.incarnation)
                .await?;
            Ok(serde_json::json!({}))
        }
        "active-object" => {
            let p: ActiveObjectPayload = payload(req)?;
            let stub = Stub::from_base64(&p.stub_b64)
                .map_err(|e| ControlError::decode(format!("invalid base64: {e}")))?;
            activation
                .monitor(group_id(&p.group)?)?
                .active_object(object_id(&p.object)?, stub)
                .await?;
            Ok(serde_json::json!({}))
        }
        "inactive-object" => {
            let p: InactiveObjectPayload = payload(req)?;
            activation
                .monitor(group_id(&p.group)?)?
                .inactive_object(object_id(&p.object)?)
                .await?;
            Ok(serde_json::json!({}))
        }
        "inactive-group" => {
            let p: InactiveGroupPayload = payload(req)?;
            activation
                .monitor(group_id(&p.group)?)?
                .inactive_group(p.incarnation)
                .await?;
            Ok(serde_json::json!({}))
        }
        "status" => {
            let status = system.status().await?;
            serde_json::to_value(status).map_err(|e| ControlError::decode(e.to_string()))
        }
        "shutdown" => {
            let p: ShutdownPayload = if req.payload.is_null() {
                ShutdownPayload::default()
            } else {
                payload(req)?
            };
            if let Some(expected) = &activation.config().admin_token {
                if p.token.as_deref() != Some(expected.as_str()) {
                    tracing::warn!("rejected shutdown request with a missing or wrong admin token");
                    return Err(ControlError::new("unauthorized", "shutdown requires the admin token"));
                }
            }
            system.shutdown().await;
            Ok(serde_json::json!({}))
        }
        _ => Err(ControlError::unknown_method()),
    }
}

/// Control client used by the CLI, tests and the socket instantiator.
pub struct ControlClient {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: tokio::net::unix::OwnedWriteHalf,
}

impl ControlClient {
    pub async fn connect(path: &Path) -> io::Result<Self> {
        let stream = UnixStream::connect(path).await?;
        let (r, w) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(r),
            writer: w,
        })
    }

    pub async fn request(&mut self, envelope: &RequestEnvelope) -> io::Result<ResponseEnvelope> {
        let json = serde_json::to_string(envelope).map_err(io::Error::other)?;
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "control connection closed",
            ));
        }
        serde_json::from_str(&line).map_err(io::Error::other)
    }

    /// Sends `cmd` and unwraps the envelope into its result or error.
    pub async fn call(
        &mut self,
        cmd: &str,
        payload: serde_json::Value,
    ) -> io::Result<Result<serde_json::Value, ControlError>> {
        let resp = self.request(&RequestEnvelope::new(cmd, payload)).await?;
        Ok(match (resp.ok, resp.error) {
            (true, _) => Ok(resp.result.unwrap_or(serde_json::Value::Null)),
            (false, Some(error)) => Err(error),
            (false, None) => Err(ControlError::new("unknown", "request failed without an error")),
        })
    }
}
