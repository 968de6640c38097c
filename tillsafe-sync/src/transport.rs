//! Remote peer abstraction and wire types.
//!
//! The host owns the actual transport (HTTP, RPC, whatever the server
//! speaks). The engine only needs push and pull round-trips in these shapes.

use crate::error::NetworkError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushItem {
    pub local_id: String,
    pub entity_type: String,
    pub fingerprint: String,
    pub payload: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub session_token: String,
    pub items: Vec<PushItem>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedItem {
    pub local_id: String,
    /// Server-side identifier; its shape is server-defined.
    #[serde(default)]
    pub server_id: Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedItem {
    pub local_id: String,
    pub reason: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PushResponse {
    pub accepted: Vec<AcceptedItem>,
    pub rejected: Vec<RejectedItem>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    pub session_token: String,
    pub collection: String,
    pub since_fingerprint: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PullResponse {
    pub records: Vec<Value>,
    pub new_fingerprint: Option<String>,
}

/// The coordinating server, as seen by the sync engine.
#[async_trait]
pub trait RemotePeer: Send + Sync {
    async fn push(&self, request: PushRequest) -> Result<PushResponse, NetworkError>;

    async fn pull(&self, request: PullRequest) -> Result<PullResponse, NetworkError>;
}

/// Supplies the session token attached to every request.
#[async_trait]
pub trait SessionTokenSource: Send + Sync {
    /// `None` when no session is established yet.
    async fn session_token(&self) -> Option<String>;
}

/// A fixed token.
pub struct StaticToken(pub String);

#[async_trait]
impl SessionTokenSource for StaticToken {
    async fn session_token(&self) -> Option<String> {
        Some(self.0.clone())
    }
}
