use std::sync::Arc;

use roomy_bridge_core::event::RoomyEvent;
use roomy_bridge_core::id::SpaceDid;
use tracing::debug;

use crate::{LeafResult, LeafTransport};

const LOG_TARGET: &str = "bridge::leaf::batcher";

const DEFAULT_THRESHOLD: usize = 50;

/// Buffers events headed for a space and writes them in order-preserving
/// batches, amortizing the cost of history imports.
///
/// Flushes when the buffer reaches the threshold or on an explicit
/// [`Self::flush`]; callers own the final flush before dropping it.
pub struct EventBatcher {
    transport: Arc<dyn LeafTransport>,
    space: SpaceDid,
    threshold: usize,
    pending: Vec<RoomyEvent>,
}

impl EventBatcher {
    pub fn new(transport: Arc<dyn LeafTransport>, space: SpaceDid) -> Self {
        Self::with_threshold(transport, space, DEFAULT_THRESHOLD)
    }

    pub fn with_threshold(
        transport: Arc<dyn LeafTransport>,
        space: SpaceDid,
        threshold: usize,
    ) -> Self {
        Self {
            transport,
            space,
            threshold: threshold.max(1),
            pending: Vec::new(),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub async fn push(&mut self, event: RoomyEvent) -> LeafResult<()> {
        self.pending.push(event);
        if self.threshold <= self.pending.len() {
            self.flush().await?;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> LeafResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let events = std::mem::take(&mut self.pending);
        debug!(target: LOG_TARGET, space = %self.space, count = events.len(), "Flushing event batch");
        self.transport.send_events(&self.space, events).await
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr as _;

    use roomy_bridge_core::event::{CreateMessage, EventKind};
    use roomy_bridge_core::id::{Did, Snowflake};

    use super::*;
    use crate::MemoryLeafTransport;

    fn space() -> SpaceDid {
        SpaceDid::from_str("did:plc:abc").expect("valid did")
    }

    fn message(body: &str) -> RoomyEvent {
        RoomyEvent::new(EventKind::CreateMessage(CreateMessage {
            body: body.to_owned(),
        }))
    }

    #[tokio::test]
    async fn flushes_at_threshold_preserving_order() {
        let transport = Arc::new(MemoryLeafTransport::new(Did::discord(Snowflake::new(1))));
        let mut batcher = EventBatcher::with_threshold(transport.clone(), space(), 3);

        batcher.push(message("a")).await.expect("push");
        batcher.push(message("b")).await.expect("push");
        assert_eq!(transport.event_count(&space()).await, 0);
        assert_eq!(batcher.pending_len(), 2);

        batcher.push(message("c")).await.expect("push");
        assert_eq!(transport.event_count(&space()).await, 3);
        assert_eq!(batcher.pending_len(), 0);

        let bodies: Vec<String> = transport
            .decoded_events(&space())
            .await
            .into_iter()
            .map(|e| match e.kind {
                EventKind::CreateMessage(m) => m.body,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(bodies, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn explicit_flush_drains_partial_batch() {
        let transport = Arc::new(MemoryLeafTransport::new(Did::discord(Snowflake::new(1))));
        let mut batcher = EventBatcher::with_threshold(transport.clone(), space(), 10);

        batcher.push(message("a")).await.expect("push");
        batcher.flush().await.expect("flush");
        assert_eq!(transport.event_count(&space()).await, 1);

        // Flushing an empty buffer is a no-op
        batcher.flush().await.expect("flush");
        assert_eq!(transport.event_count(&space()).await, 1);
    }
}
