//! Durable snapshot of bridge state.
//!
//! One JSON document written truncate-then-write. A missing file on load is
//! not an error; a malformed one is fatal for startup.

use crate::bridge::ack_tracker::NatsPubState;
use crate::bridge::retained::RetainedState;
use crate::error::{MqttError, Result};
use crate::packet_id::IdManagerState;
use crate::session::SessionManagerState;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// The persisted document:
/// `{"ts", "id", "idm", "sm", "retained"?, "pubacks"?}`. Readers tolerate
/// the optional fields being absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeState {
    /// RFC 3339 timestamp of the snapshot.
    pub ts: String,
    /// Client id of the server's own session.
    pub id: String,
    pub idm: IdManagerState,
    pub sm: SessionManagerState,
    #[serde(default, skip_serializing_if = "RetainedState::is_empty")]
    pub retained: RetainedState,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pubacks: Vec<NatsPubState>,
}

/// Loads a snapshot. Returns `Ok(None)` when the file does not exist.
///
/// # Errors
///
/// Returns `MqttError::Persistence` on read failures or malformed JSON;
/// the caller treats that as fatal for startup.
pub async fn load(path: &Path) -> Result<Option<BridgeState>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(MqttError::Persistence(e.to_string())),
    };
    let state = serde_json::from_slice(&bytes)?;
    debug!(path = %path.display(), "state loaded");
    Ok(Some(state))
}

/// Writes a snapshot, replacing any previous file contents.
///
/// # Errors
///
/// Returns `MqttError::Persistence` on encoding or write failures.
pub async fn save(path: &Path, state: &BridgeState) -> Result<()> {
    let bytes = serde_json::to_vec(state)?;
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| MqttError::Persistence(e.to_string()))?;
    debug!(path = %path.display(), "server state persisted");
    Ok(())
}
