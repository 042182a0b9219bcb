//! Activity processing
//!
//! - `envelope`: boundary validation and per-verb decoding
//! - `dispatcher`: authorization gate, transaction and handler routing
//! - `handlers`: one module per verb family
//! - `audience`: who may see what
//! - `merge`: Update patch rules

pub mod audience;
mod dispatcher;
pub mod envelope;
mod handlers;
mod merge;

pub use audience::{Viewer, can_view, listing_predicate, redact_for};
pub use dispatcher::{DispatchOutcome, Dispatcher, Origin, check_origin};
pub use envelope::{Command, Envelope, ValidationReport, decode, validate};
pub(crate) use handlers::provision_user;
pub use merge::merge_patch;
