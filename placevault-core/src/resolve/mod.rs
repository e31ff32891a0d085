//! Pending-coordinate queue and fixed-arity tile history resolution.

pub mod batcher;
pub mod client;
pub mod pending;

pub use batcher::{
    BatchConfig, DEFAULT_BATCH_SIZE, DrainReport, MAX_BATCH_SIZE, ResolutionBatcher,
    resolve_slots, submit_resolved,
};
pub use client::{
    GraphqlTileHistoryResolver, SlotId, SlotRequest, SlotResult, TileHistory,
    TileHistoryResolver,
};
pub use pending::{
    DEFAULT_PENDING_KEY, InMemoryPendingCoordinates, PendingCoordinates, RedisPendingCoordinates,
};
