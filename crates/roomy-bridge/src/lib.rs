//! The Discord <-> Roomy bridge service.
//!
//! For every registered guild <-> space binding, the bridge keeps a
//! bidirectional, eventually-consistent mirror: Discord messages, edits,
//! deletions, reactions, channel/thread lifecycle, sidebar structure and
//! profile changes all appear in the paired Roomy space, and Roomy events of
//! the same kinds are projected back onto Discord through impersonating
//! webhooks. Idempotency comes from content fingerprints, origin-stamped
//! extensions and a durable cursor store, so restarts, duplicate deliveries
//! and reordered backfills all converge.

pub mod backfill;
pub mod config;
pub mod context;
pub mod discord;
pub mod registry;
pub mod subscription;
pub mod sync;
pub mod webhooks;
