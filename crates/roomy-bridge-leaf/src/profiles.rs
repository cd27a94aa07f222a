use std::collections::HashMap;
use std::sync::Arc;

use roomy_bridge_core::id::Did;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{LeafResult, LeafTransport, RemoteProfile};

const LOG_TARGET: &str = "bridge::leaf::profiles";

/// Caching wrapper around [`LeafTransport::resolve_profile`].
///
/// Negative results are cached too: an unknown DID stays unknown for the
/// process lifetime rather than hammering the AppView per message.
pub struct ProfileCache {
    transport: Arc<dyn LeafTransport>,
    cache: Mutex<HashMap<Did, Option<RemoteProfile>>>,
}

impl ProfileCache {
    pub fn new(transport: Arc<dyn LeafTransport>) -> Self {
        Self {
            transport,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn resolve(&self, did: &Did) -> LeafResult<Option<RemoteProfile>> {
        if let Some(cached) = self.cache.lock().await.get(did) {
            return Ok(cached.clone());
        }

        let resolved = self.transport.resolve_profile(did).await?;
        debug!(
            target: LOG_TARGET,
            %did,
            found = resolved.is_some(),
            "Resolved profile"
        );
        self.cache
            .lock()
            .await
            .insert(did.clone(), resolved.clone());
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr as _;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use roomy_bridge_core::event::RoomyEvent;
    use roomy_bridge_core::id::SpaceDid;

    use super::*;
    use crate::EventEnvelope;

    struct CountingTransport {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LeafTransport for CountingTransport {
        async fn fetch_events(
            &self,
            _space: &SpaceDid,
            _start: u64,
            _limit: usize,
        ) -> LeafResult<Vec<EventEnvelope>> {
            Ok(vec![])
        }

        async fn send_events(
            &self,
            _space: &SpaceDid,
            _events: Vec<RoomyEvent>,
        ) -> LeafResult<()> {
            Ok(())
        }

        async fn resolve_profile(&self, did: &Did) -> LeafResult<Option<RemoteProfile>> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if did.as_str().ends_with("known") {
                Ok(Some(RemoteProfile {
                    handle: "user.example.com".to_owned(),
                    display_name: None,
                    avatar: None,
                }))
            } else {
                Ok(None)
            }
        }
    }

    #[tokio::test]
    async fn caches_hits_and_misses() {
        let transport = Arc::new(CountingTransport {
            calls: AtomicUsize::new(0),
        });
        let cache = ProfileCache::new(transport.clone());

        let known = Did::from_str("did:plc:known").expect("valid did");
        let unknown = Did::from_str("did:plc:nobody").expect("valid did");

        assert!(cache.resolve(&known).await.expect("resolve").is_some());
        assert!(cache.resolve(&known).await.expect("resolve").is_some());
        assert!(cache.resolve(&unknown).await.expect("resolve").is_none());
        assert!(cache.resolve(&unknown).await.expect("resolve").is_none());

        assert_eq!(transport.calls.load(Ordering::Relaxed), 2);
    }
}
