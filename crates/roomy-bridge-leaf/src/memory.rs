use std::collections::HashMap;

use async_trait::async_trait;
use roomy_bridge_core::event::RoomyEvent;
use roomy_bridge_core::id::{Did, SpaceDid};
use tokio::sync::Mutex;

use crate::{EventEnvelope, LeafResult, LeafTransport, RemoteProfile};

/// In-memory Leaf stand-in used by tests and local development.
///
/// Keeps one append-only `Vec` per space; indices are 1-based like the real
/// server's.
pub struct MemoryLeafTransport {
    bridge_user: Did,
    spaces: Mutex<HashMap<SpaceDid, Vec<EventEnvelope>>>,
    profiles: Mutex<HashMap<Did, RemoteProfile>>,
}

impl MemoryLeafTransport {
    pub fn new(bridge_user: Did) -> Self {
        Self {
            bridge_user,
            spaces: Mutex::new(HashMap::new()),
            profiles: Mutex::new(HashMap::new()),
        }
    }

    /// Append a raw event as if some other client had written it.
    pub async fn push_external(&self, space: &SpaceDid, user: Did, event: serde_json::Value) -> u64 {
        let mut spaces = self.spaces.lock().await;
        let events = spaces.entry(space.clone()).or_default();
        let idx = events.len() as u64 + 1;
        events.push(EventEnvelope { idx, user, event });
        idx
    }

    pub async fn set_profile(&self, did: Did, profile: RemoteProfile) {
        self.profiles.lock().await.insert(did, profile);
    }

    pub async fn event_count(&self, space: &SpaceDid) -> usize {
        self.spaces
            .lock()
            .await
            .get(space)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// All decoded events of the space, in order. Undecodable records are
    /// skipped.
    pub async fn decoded_events(&self, space: &SpaceDid) -> Vec<RoomyEvent> {
        self.spaces
            .lock()
            .await
            .get(space)
            .map(|events| {
                events
                    .iter()
                    .filter_map(|envelope| serde_json::from_value(envelope.event.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl LeafTransport for MemoryLeafTransport {
    async fn fetch_events(
        &self,
        space: &SpaceDid,
        start: u64,
        limit: usize,
    ) -> LeafResult<Vec<EventEnvelope>> {
        let spaces = self.spaces.lock().await;
        let Some(events) = spaces.get(space) else {
            return Ok(vec![]);
        };
        let start = (start.max(1) - 1) as usize;
        Ok(events.iter().skip(start).take(limit).cloned().collect())
    }

    async fn send_events(&self, space: &SpaceDid, events: Vec<RoomyEvent>) -> LeafResult<()> {
        let mut spaces = self.spaces.lock().await;
        let stored = spaces.entry(space.clone()).or_default();
        for event in events {
            let idx = stored.len() as u64 + 1;
            stored.push(EventEnvelope {
                idx,
                user: self.bridge_user.clone(),
                event: serde_json::to_value(&event)
                    .expect("Event serialization can't fail"),
            });
        }
        Ok(())
    }

    async fn resolve_profile(&self, did: &Did) -> LeafResult<Option<RemoteProfile>> {
        Ok(self.profiles.lock().await.get(did).cloned())
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr as _;

    use roomy_bridge_core::event::{CreateMessage, EventKind};
    use roomy_bridge_core::id::Snowflake;

    use super::*;

    fn space() -> SpaceDid {
        SpaceDid::from_str("did:plc:abc").expect("valid did")
    }

    #[tokio::test]
    async fn paging_is_one_based_and_bounded() {
        let transport = MemoryLeafTransport::new(Did::discord(Snowflake::new(1)));
        for i in 0..5 {
            transport
                .send_events(
                    &space(),
                    vec![RoomyEvent::new(EventKind::CreateMessage(CreateMessage {
                        body: format!("msg {i}"),
                    }))],
                )
                .await
                .expect("send");
        }

        let page = transport.fetch_events(&space(), 1, 2).await.expect("fetch");
        assert_eq!(page.iter().map(|e| e.idx).collect::<Vec<_>>(), vec![1, 2]);

        let page = transport.fetch_events(&space(), 4, 10).await.expect("fetch");
        assert_eq!(page.iter().map(|e| e.idx).collect::<Vec<_>>(), vec![4, 5]);

        let page = transport.fetch_events(&space(), 6, 10).await.expect("fetch");
        assert!(page.is_empty());
    }
}
