use std::path::PathBuf;
use std::sync::Arc;

use actd_kernel::{ObjectDescriptor, ObjectId};
use async_trait::async_trait;
use base64::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::control::{ControlClient, RequestEnvelope};

/// Opaque handle to a live object, valid for the incarnation that issued it.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Stub(#[serde(with = "serde_bytes")] Vec<u8>);

impl Stub {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn to_base64(&self) -> String {
        BASE64_STANDARD.encode(&self.0)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, base64::DecodeError> {
        BASE64_STANDARD.decode(encoded).map(Self)
    }
}

impl std::fmt::Debug for Stub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Stub({} bytes)", self.0.len())
    }
}

/// Why a group could not construct an object. The variant decides how the
/// activation loop reacts.
#[derive(Debug, Error)]
pub enum InstantiateError {
    /// The group no longer serves activations; mark it inactive and retry.
    #[error("group inactive: {0}")]
    Inactive(String),
    /// The group could not be reached; treat as a failure, kill it and retry.
    #[error("group unreachable: {0}")]
    Unreachable(String),
    /// The object descriptor cannot be instantiated; retrying will not help.
    #[error("bad descriptor: {0}")]
    BadDescriptor(String),
    /// Any other remote failure; retried without touching the group.
    #[error("remote error: {0}")]
    Remote(String),
}

/// Object factory living inside a group process.
#[async_trait]
pub trait Instantiator: Send + Sync {
    /// Address the group reported itself under. Two instantiators with the same
    /// endpoint are the same instantiator.
    fn endpoint(&self) -> &str;

    async fn new_instance(
        &self,
        id: ObjectId,
        desc: &ObjectDescriptor,
    ) -> Result<Stub, InstantiateError>;
}

/// Turns the endpoint a group reports into a callable instantiator.
#[async_trait]
pub trait InstantiatorConnector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn Instantiator>, InstantiateError>;
}

/// Connects to instantiators listening on Unix sockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct SocketConnector;

#[async_trait]
impl InstantiatorConnector for SocketConnector {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn Instantiator>, InstantiateError> {
        let path = PathBuf::from(endpoint);
        if !path.exists() {
            return Err(InstantiateError::Unreachable(format!(
                "no instantiator socket at {endpoint}"
            )));
        }
        Ok(Arc::new(SocketInstantiator {
            endpoint: endpoint.to_string(),
            path,
        }))
    }
}

/// Speaks the control envelope protocol (`new-instance`) to a group process.
#[derive(Debug)]
pub struct SocketInstantiator {
    endpoint: String,
    path: PathBuf,
}

#[async_trait]
impl Instantiator for SocketInstantiator {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn new_instance(
        &self,
        id: ObjectId,
        desc: &ObjectDescriptor,
    ) -> Result<Stub, InstantiateError> {
        let desc_cbor = actd_cbor::to_canonical_cbor(desc)
            .map_err(|err| InstantiateError::BadDescriptor(err.to_string()))?;
        let mut client = ControlClient::connect(&self.path)
            .await
            .map_err(|err| InstantiateError::Unreachable(err.to_string()))?;
        let request = RequestEnvelope::new(
            "new-instance",
            serde_json::json!({
                "object": id.to_string(),
                "desc_b64": BASE64_STANDARD.encode(desc_cbor),
            }),
        );
        let response = client
            .request(&request)
            .await
            .map_err(|err| InstantiateError::Unreachable(err.to_string()))?;

        if let Some(error) = response.error {
            return Err(match error.code.as_str() {
                "inactive_group" | "no_such_object" => InstantiateError::Inactive(error.message),
                "bad_descriptor" => InstantiateError::BadDescriptor(error.message),
                _ => InstantiateError::Remote(error.message),
            });
        }
        let stub_b64 = response
            .result
            .as_ref()
            .and_then(|result| result.get("stub_b64"))
            .and_then(|value| value.as_str())
            .ok_or_else(|| InstantiateError::Remote("response is missing stub_b64".into()))?;
        Stub::from_base64(stub_b64)
            .map_err(|err| InstantiateError::Remote(format!("invalid stub encoding: {err}")))
    }
}
