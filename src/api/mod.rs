//! API layer
//!
//! HTTP handlers for:
//! - Client activity submission and reads
//! - Peer inbox and server identity
//! - Metrics (Prometheus)

mod activities;
mod extract;
mod federation;
pub mod metrics;

pub use activities::activities_router;
pub use extract::{ActorCredentials, MaybeActor, PeerServer};
pub use federation::federation_router;
pub use metrics::metrics_router;
