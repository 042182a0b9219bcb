//! Data layer module
//!
//! Handles all data persistence:
//! - Entity documents (JSON bodies keyed by global id)
//! - Actor keys, peer servers, outbox and inbox queues

mod database;
pub mod documents;
mod models;

pub use database::{
    Database, QueueDepth, adjust_follower_count, enqueue_outbox, private_key, store_keys,
    touch_server,
};
pub use models::*;
