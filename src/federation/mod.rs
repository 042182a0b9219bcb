//! Federation module
//!
//! Handles:
//! - Actor keypairs, request signatures and content provenance
//! - Peer key caching
//! - Signed delivery to peer inboxes
//! - Outbox and inbox queues
//! - Remote feed fetching

mod delivery;
mod feed;
mod identity;
mod key_cache;
mod queue;

pub use delivery::{DeliveryResult, HttpTransport, PeerTransport, ServerSigner, build_http_client};
pub use feed::{FeedFetcher, HttpFeedFetcher, RemoteFeed, RemoteItem, parse_feed};
pub use identity::{
    ACTOR_ID_HEADER, Credentials, IdentityService, KeyPair, SERVER_ID_HEADER, SIGNATURE_HEADER,
    TIMESTAMP_HEADER, auth_message, generate_keypair, sign, sign_content, verify,
    verify_provenance,
};
pub use key_cache::PublicKeyCache;
pub use queue::{
    InboundProcessor, InboxWorker, OutboxWorker, QueueSettings, SweepReport, destination_domains,
    enqueue_activity, next_backoff,
};

#[cfg(test)]
pub(crate) use delivery::MockPeerTransport;
#[cfg(test)]
pub(crate) use feed::MockFeedFetcher;
#[cfg(test)]
pub(crate) use identity::tests::test_keypairs;
