//! Service layer
//!
//! Sits between the HTTP handlers and the activity engine.

mod activity;

pub use activity::ActivityService;
