//! Streaming: per-chunk data requests, atomic LOD transitions, and the
//! single-flight tracker that drives them as the viewer moves.
//!
//! # Invariants
//! - At most one update cycle is in flight; positions arriving meanwhile
//!   coalesce to the latest one.
//! - A data request settles exactly once and survives rebinding to a
//!   lod-equal chunk.
//! - Chunks under a dominating cell swap out and in together, only after
//!   every incoming payload has settled.
//! - A failed cycle leaves tracker state as it was before the cycle.
//!
//! Everything here runs on one thread inside a [`tokio::task::LocalSet`].

mod config;
mod dominator;
mod error;
mod query;
mod request;
mod tracker;

pub use config::{ConfigError, MAX_LODS, TrackerConfig};
pub use dominator::{Dominator, DominatorState, Transition, TransitionGroup, group_transitions};
pub use error::{QueryError, TrackerError};
pub use query::{
    HandleParams, LeafCellSpec, LeafUpdate, LocalHandle, LocalOctreeQuery, MAX_HANDLE_LODS,
    SpatialQuery,
};
pub use request::{
    CancelToken, ChunkPayload, ChunkProducer, DataRequest, NullProducer, RenderData, RequestData,
};
pub use tracker::{Tracker, TrackerEvent, TrackerStats, parse_leaves};

pub fn crate_info() -> &'static str {
    "lodtrack-stream v0.1.0"
}
