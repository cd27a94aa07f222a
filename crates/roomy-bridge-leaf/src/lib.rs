//! Client side of a Leaf-hosted Roomy space.
//!
//! The bridge is a client of the Roomy event transport, never an
//! implementation of it: everything here goes through the [`LeafTransport`]
//! trait, with an HTTP implementation for real Leaf servers and an in-memory
//! one for tests and local development.

mod batcher;
mod http;
mod memory;
mod profiles;
mod subscription;

use async_trait::async_trait;
use roomy_bridge_core::id::{Did, SpaceDid};
use serde::{Deserialize, Serialize};
use snafu::Snafu;

pub use self::batcher::EventBatcher;
pub use self::http::{HttpLeafTransport, LeafConfig};
pub use self::memory::MemoryLeafTransport;
pub use self::profiles::ProfileCache;
pub use self::subscription::{EventBatch, SpaceSubscription};

#[derive(Debug, Snafu)]
pub enum LeafError {
    #[snafu(display("Leaf request failed: {source}"))]
    Http { source: reqwest::Error },
    #[snafu(display("Leaf returned status {status}"))]
    Status { status: u16 },
    #[snafu(display("Leaf response decode failed: {source}"))]
    Decode { source: serde_json::Error },
    #[snafu(display("Leaf session could not be established"))]
    Auth,
    #[snafu(display("Invalid Leaf URL: {source}"))]
    BadUrl { source: url::ParseError },
}

pub type LeafResult<T> = std::result::Result<T, LeafError>;

impl LeafError {
    /// Whether retrying the same request can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            LeafError::Http { source } => source.is_timeout() || source.is_connect(),
            LeafError::Status { status } => *status == 429 || 500 <= *status,
            _ => false,
        }
    }
}

/// One subscription/fetch item: the space-assigned index, the authoring
/// user, and the raw (not yet schema-checked) event record.
///
/// Events stay raw JSON at this layer; decode failures are a per-event
/// concern of the subscription handler, not a transport error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub idx: u64,
    pub user: Did,
    pub event: serde_json::Value,
}

/// A Roomy user profile as resolved from the AT Protocol side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteProfile {
    pub handle: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
}

#[async_trait]
pub trait LeafTransport: Send + Sync {
    /// Fetch up to `limit` events starting at 1-based index `start`.
    async fn fetch_events(
        &self,
        space: &SpaceDid,
        start: u64,
        limit: usize,
    ) -> LeafResult<Vec<EventEnvelope>>;

    /// Append events to the space, preserving order.
    async fn send_events(
        &self,
        space: &SpaceDid,
        events: Vec<roomy_bridge_core::event::RoomyEvent>,
    ) -> LeafResult<()>;

    /// Resolve a user profile by DID; `None` when the DID is unknown.
    async fn resolve_profile(&self, did: &Did) -> LeafResult<Option<RemoteProfile>>;
}
