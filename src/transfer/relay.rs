//! The relay seam.
//!
//! [`RelayClient`] is the request/response half of the relay protocol. The
//! asynchronous "ready" push notification arrives out of band and is fed to
//! [`TransferOrchestrator::notify_ready`](super::TransferOrchestrator::notify_ready).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use super::TransferError;

/// Answer to the batch size/existence/forbidden query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSizeInfo {
    /// Content hash.
    pub hash: String,
    /// Size on the relay; non-positive means unavailable.
    pub size: i64,
    /// Whether the relay holds the content.
    pub exists: bool,
    /// Whether the content has been blocked.
    pub forbidden: bool,
    /// Endpoint serving the download.
    pub download_endpoint: String,
}

/// Answer to the batch "intent to upload" query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadIntent {
    /// Content hash.
    pub hash: String,
    /// Whether the content has been blocked.
    pub forbidden: bool,
    /// Where to send the content; `None` when the relay already holds it.
    pub upload_endpoint: Option<String>,
}

/// Opaque per-hash request identifier issued by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ticket(pub String);

impl std::fmt::Display for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A streaming download body.
pub struct Payload {
    /// Declared length, if the relay sent one.
    pub content_length: Option<u64>,
    /// Compressed bytes.
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Payload")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Client side of the relay protocol.
#[async_trait]
pub trait RelayClient: Send + Sync {
    /// Batch size/existence/forbidden query.
    async fn query_sizes(&self, hashes: &[String]) -> Result<Vec<FileSizeInfo>, TransferError>;

    /// Batch "intent to upload" query.
    async fn query_upload_intent(
        &self,
        hashes: &[String],
    ) -> Result<Vec<UploadIntent>, TransferError>;

    /// Fire-and-forget prefetch hint for a group of hashes.
    async fn enqueue(&self, endpoint: &str, hashes: &[String]) -> Result<(), TransferError>;

    /// Request a ticket for one hash.
    ///
    /// # Errors
    ///
    /// [`TransferError::NotFound`] and [`TransferError::Unauthorized`] abort
    /// the transfer of that file only.
    async fn request_ticket(&self, endpoint: &str, hash: &str) -> Result<Ticket, TransferError>;

    /// Whether the relay has staged the content for `ticket`.
    async fn check_status(&self, endpoint: &str, ticket: &Ticket) -> Result<bool, TransferError>;

    /// Abandon a ticket. Best effort.
    async fn cancel_ticket(&self, endpoint: &str, ticket: &Ticket) -> Result<(), TransferError>;

    /// Open the staged payload for `ticket`.
    async fn download(&self, endpoint: &str, ticket: &Ticket) -> Result<Payload, TransferError>;

    /// Send one compressed payload, reporting cumulative bytes sent.
    async fn upload(
        &self,
        endpoint: &str,
        hash: &str,
        payload: Vec<u8>,
        progress: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<(), TransferError>;
}
