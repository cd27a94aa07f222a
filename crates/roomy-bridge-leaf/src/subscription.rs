use std::sync::Arc;
use std::time::Duration;

use roomy_bridge_core::error::FmtCompact as _;
use roomy_bridge_core::id::SpaceDid;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::LeafTransport;

const LOG_TARGET: &str = "bridge::leaf::sub";

const PAGE_SIZE: usize = 100;
const POLL_INTERVAL: Duration = Duration::from_secs(1);
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// One delivery from a space subscription.
///
/// `is_backfill` is set on every batch delivered before the subscription
/// first caught up to the head. It is advisory: the consumer decides what
/// catch-up history still needs acting on (the bridge compares event
/// indices against its replay high-water mark).
#[derive(Debug)]
pub struct EventBatch {
    pub envelopes: Vec<crate::EventEnvelope>,
    pub is_backfill: bool,
}

/// Single-reader pump that turns the pull API into a batch stream.
///
/// There must be at most one subscription per space: the `start` position is
/// owned by this task, and the handler must not call back into the transport
/// for the same space while holding a batch.
pub struct SpaceSubscription;

impl SpaceSubscription {
    pub fn spawn(
        transport: Arc<dyn LeafTransport>,
        space: SpaceDid,
        start: u64,
        batches: mpsc::Sender<EventBatch>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(Self::run(transport, space, start, batches, shutdown))
    }

    #[instrument(name = "leaf.subscription", skip_all, fields(space = %space))]
    async fn run(
        transport: Arc<dyn LeafTransport>,
        space: SpaceDid,
        start: u64,
        batches: mpsc::Sender<EventBatch>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut next = start;
        let mut catching_up = true;

        debug!(target: LOG_TARGET, %space, start, "Subscription starting");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let page = tokio::select! {
                page = transport.fetch_events(&space, next, PAGE_SIZE) => page,
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            let envelopes = match page {
                Ok(envelopes) => envelopes,
                Err(err) => {
                    warn!(
                        target: LOG_TARGET,
                        %space,
                        err = %err.fmt_compact(),
                        "Subscription fetch failed"
                    );
                    tokio::time::sleep(ERROR_BACKOFF).await;
                    continue;
                }
            };

            if envelopes.is_empty() {
                catching_up = false;
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            }

            next += envelopes.len() as u64;
            let full_page = envelopes.len() == PAGE_SIZE;

            let batch = EventBatch {
                envelopes,
                is_backfill: catching_up,
            };
            if catching_up && !full_page {
                catching_up = false;
            }

            if batches.send(batch).await.is_err() {
                debug!(target: LOG_TARGET, %space, "Batch receiver gone, stopping");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr as _;

    use roomy_bridge_core::event::{CreateMessage, EventKind, RoomyEvent};
    use roomy_bridge_core::id::{Did, Snowflake};

    use super::*;
    use crate::{LeafTransport as _, MemoryLeafTransport};

    fn space() -> SpaceDid {
        SpaceDid::from_str("did:plc:abc").expect("valid did")
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn backfill_flag_clears_once_caught_up() {
        let transport = Arc::new(MemoryLeafTransport::new(Did::discord(Snowflake::new(1))));
        for i in 0..3 {
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

        let (tx, mut rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle =
            SpaceSubscription::spawn(transport.clone(), space(), 1, tx, shutdown_rx);

        // Pre-existing history arrives as backfill
        let first = rx.recv().await.expect("batch");
        assert!(first.is_backfill);
        assert_eq!(first.envelopes.len(), 3);
        assert_eq!(
            first.envelopes.iter().map(|e| e.idx).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        // A new event after catch-up arrives live
        transport
            .send_events(
                &space(),
                vec![RoomyEvent::new(EventKind::CreateMessage(CreateMessage {
                    body: "live".to_owned(),
                }))],
            )
            .await
            .expect("send");

        let live = rx.recv().await.expect("batch");
        assert!(!live.is_backfill);
        assert_eq!(live.envelopes.len(), 1);
        assert_eq!(live.envelopes[0].idx, 4);

        shutdown_tx.send(true).expect("shutdown");
        handle.await.expect("join");
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn resumes_from_given_start() {
        let transport = Arc::new(MemoryLeafTransport::new(Did::discord(Snowflake::new(1))));
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

        let (tx, mut rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = SpaceSubscription::spawn(transport, space(), 4, tx, shutdown_rx);

        let batch = rx.recv().await.expect("batch");
        assert_eq!(
            batch.envelopes.iter().map(|e| e.idx).collect::<Vec<_>>(),
            vec![4, 5]
        );

        shutdown_tx.send(true).expect("shutdown");
        handle.await.expect("join");
    }
}
