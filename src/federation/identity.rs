//! Actor keys and signatures
//!
//! One RSA scheme (PKCS#1 v1.5 over SHA-256, base64 signatures) covers:
//! - request authentication for users (`X-Actor-Id`) and servers (`X-Server-Id`)
//! - content provenance (a signature over an entity id)
//!
//! Request auth signs the hex `sha256(id + ":" + timestamp)`.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use http::HeaderMap;
use rsa::pkcs1v15::{Signature as Pkcs1v15Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use super::delivery::PeerTransport;
use super::key_cache::PublicKeyCache;
use crate::config::AppConfig;
use crate::data::{Database, User, domain_of};
use crate::error::AppError;

pub const ACTOR_ID_HEADER: &str = "x-actor-id";
pub const SERVER_ID_HEADER: &str = "x-server-id";
pub const TIMESTAMP_HEADER: &str = "x-timestamp";
pub const SIGNATURE_HEADER: &str = "x-signature";

/// PEM-encoded RSA keypair
#[derive(Clone)]
pub struct KeyPair {
    pub private_key_pem: String,
    pub public_key_pem: String,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key_pem", &self.public_key_pem)
            .finish_non_exhaustive()
    }
}

/// Generate a keypair off the async runtime
pub async fn generate_keypair(bits: usize) -> Result<KeyPair, AppError> {
    tokio::task::spawn_blocking(move || -> Result<KeyPair, anyhow::Error> {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, bits)?;
        let public_key = RsaPublicKey::from(&private_key);
        Ok(KeyPair {
            private_key_pem: private_key.to_pkcs8_pem(LineEnding::LF)?.to_string(),
            public_key_pem: public_key.to_public_key_pem(LineEnding::LF)?,
        })
    })
    .await
    .map_err(|e| AppError::Internal(e.into()))?
    .map_err(AppError::Internal)
}

/// Sign `message`, returning a base64 signature
pub fn sign(message: &[u8], private_key_pem: &str) -> Result<String, AppError> {
    let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Invalid private key: {}", e)))?;
    let signing_key = SigningKey::<Sha256>::new_unprefixed(private_key);
    let mut rng = rand::thread_rng();
    let signature = signing_key.sign_with_rng(&mut rng, message);
    Ok(BASE64.encode(signature.to_bytes()))
}

/// Verify a base64 signature over `message`
///
/// # Errors
/// `InvalidSignature` for a malformed key, malformed signature or mismatch
pub fn verify(message: &[u8], signature_b64: &str, public_key_pem: &str) -> Result<(), AppError> {
    let public_key =
        RsaPublicKey::from_public_key_pem(public_key_pem).map_err(|_| AppError::InvalidSignature)?;
    let verifier = VerifyingKey::<Sha256>::new_unprefixed(public_key);

    let signature_bytes = BASE64
        .decode(signature_b64.trim())
        .map_err(|_| AppError::InvalidSignature)?;
    let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
        .map_err(|_| AppError::InvalidSignature)?;

    verifier
        .verify(message, &signature)
        .map_err(|_| AppError::InvalidSignature)
}

/// Hex `sha256(id + ":" + timestamp)`
pub fn auth_message(id: &str, timestamp: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    hasher.update(b":");
    hasher.update(timestamp.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Provenance signature over an entity id
pub fn sign_content(id: &str, private_key_pem: &str) -> Result<String, AppError> {
    sign(id.as_bytes(), private_key_pem)
}

/// Check that `signature` was made over `id` by the holder of `public_key_pem`
pub fn verify_provenance(id: &str, signature: &str, public_key_pem: &str) -> bool {
    verify(id.as_bytes(), signature, public_key_pem).is_ok()
}

/// Signed identity presented on a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub id: String,
    pub timestamp: i64,
    pub signature: String,
}

impl Credentials {
    /// Sign as `id` at `now`
    pub fn sign(id: &str, private_key_pem: &str, now: DateTime<Utc>) -> Result<Self, AppError> {
        let timestamp = now.timestamp();
        let signature = sign(auth_message(id, timestamp).as_bytes(), private_key_pem)?;
        Ok(Self {
            id: id.to_string(),
            timestamp,
            signature,
        })
    }

    /// Read credentials from headers. `id_header` selects actor or server auth.
    ///
    /// Returns `None` if the headers are absent; a partial or malformed set is
    /// an error.
    pub fn from_headers(headers: &HeaderMap, id_header: &str) -> Result<Option<Self>, AppError> {
        let read = |name: &str| -> Result<Option<String>, AppError> {
            headers
                .get(name)
                .map(|value| {
                    value
                        .to_str()
                        .map(|s| s.trim().to_string())
                        .map_err(|_| AppError::Validation(format!("Invalid {} header", name)))
                })
                .transpose()
        };

        let id = read(id_header)?;
        let timestamp = read(TIMESTAMP_HEADER)?;
        let signature = read(SIGNATURE_HEADER)?;

        match (id, timestamp, signature) {
            (None, None, None) => Ok(None),
            (Some(id), Some(timestamp), Some(signature)) => {
                let timestamp = timestamp
                    .parse::<i64>()
                    .map_err(|_| AppError::Validation("Invalid X-Timestamp header".to_string()))?;
                Ok(Some(Self {
                    id,
                    timestamp,
                    signature,
                }))
            }
            _ => Err(AppError::Validation(
                "Authentication headers must be sent together".to_string(),
            )),
        }
    }

    /// Header pairs for an outgoing request
    pub fn headers(&self, id_header: &'static str) -> [(&'static str, String); 3] {
        [
            (id_header, self.id.clone()),
            (TIMESTAMP_HEADER, self.timestamp.to_string()),
            (SIGNATURE_HEADER, self.signature.clone()),
        ]
    }

    /// Reject timestamps outside `max_skew_secs` of `now`
    pub fn check_freshness(&self, now: DateTime<Utc>, max_skew_secs: i64) -> Result<(), AppError> {
        let diff = (now.timestamp() - self.timestamp).abs();
        if diff > max_skew_secs {
            return Err(AppError::InvalidSignature);
        }
        Ok(())
    }

    /// Full check against a known public key
    pub fn verify_with(
        &self,
        public_key_pem: &str,
        now: DateTime<Utc>,
        max_skew_secs: i64,
    ) -> Result<(), AppError> {
        self.check_freshness(now, max_skew_secs)?;
        verify(
            auth_message(&self.id, self.timestamp).as_bytes(),
            &self.signature,
            public_key_pem,
        )
    }
}

/// Authenticates users and peers against stored or fetched public keys
pub struct IdentityService {
    db: Arc<Database>,
    config: Arc<AppConfig>,
    transport: Arc<dyn PeerTransport>,
    peer_keys: PublicKeyCache,
}

impl IdentityService {
    pub fn new(db: Arc<Database>, config: Arc<AppConfig>, transport: Arc<dyn PeerTransport>) -> Self {
        let ttl = std::time::Duration::from_secs(config.identity.peer_key_ttl_secs);
        Self {
            db,
            config,
            transport,
            peer_keys: PublicKeyCache::new(Some(ttl)),
        }
    }

    /// Verify user credentials and return the actor id
    pub async fn authenticate_actor(&self, credentials: &Credentials) -> Result<String, AppError> {
        let user: User = self
            .db
            .find(&credentials.id)
            .await?
            .filter(|user: &User| !user.lifecycle.is_deleted())
            .ok_or(AppError::InvalidSignature)?;

        credentials.verify_with(
            &user.public_key,
            Utc::now(),
            self.config.identity.max_clock_skew_secs,
        )?;
        Ok(user.id)
    }

    /// Like `authenticate_actor`, but any failure yields an anonymous caller
    pub async fn authenticate_actor_or_anonymous(
        &self,
        credentials: Option<&Credentials>,
    ) -> Option<String> {
        let credentials = credentials?;
        match self.authenticate_actor(credentials).await {
            Ok(actor_id) => Some(actor_id),
            Err(e) => {
                tracing::debug!(actor = %credentials.id, error = %e, "Actor authentication failed; continuing as anonymous");
                None
            }
        }
    }

    /// Verify server credentials and return the peer domain
    ///
    /// Keys come from the `servers` table, then the cache, then the peer's
    /// `/server` document. A key that fails verification is refetched once in
    /// case the peer rotated it.
    pub async fn authenticate_server(&self, credentials: &Credentials) -> Result<String, AppError> {
        let domain = credentials.id.trim().to_ascii_lowercase();
        if domain.is_empty() || domain.eq_ignore_ascii_case(&self.config.server.domain) {
            return Err(AppError::InvalidSignature);
        }

        let now = Utc::now();
        let max_skew = self.config.identity.max_clock_skew_secs;
        credentials.check_freshness(now, max_skew)?;

        let known = self
            .db
            .get_server(&domain)
            .await?
            .and_then(|server| server.public_key);

        if let Some(pem) = known.as_deref() {
            if credentials.verify_with(pem, now, max_skew).is_ok() {
                return Ok(domain);
            }
            tracing::debug!(domain = %domain, "Stored peer key did not verify; refetching");
            self.peer_keys.invalidate(&domain).await;
        }

        let transport = Arc::clone(&self.transport);
        let pem = self
            .peer_keys
            .get_or_fetch(&domain, |domain| async move {
                transport.fetch_server_key(&domain).await
            })
            .await?;

        credentials.verify_with(&pem, now, max_skew)?;
        self.db.upsert_server_key(&domain, &pem).await?;
        tracing::info!(domain = %domain, "Peer server key recorded");
        Ok(domain)
    }

    /// Drop expired peer keys from the cache
    pub async fn prune_peer_keys(&self) {
        self.peer_keys.prune_expired().await;
    }

    /// Provenance check for a stored entity
    pub async fn verify_entity_signature(&self, id: &str, signature: &str) -> Result<bool, AppError> {
        let Some(owner) = self.owner_public_key(id).await? else {
            return Ok(false);
        };
        Ok(verify_provenance(id, signature, &owner))
    }

    async fn owner_public_key(&self, id: &str) -> Result<Option<String>, AppError> {
        let Some(entity) = self.db.find_entity(id).await? else {
            return Ok(None);
        };
        let owner = entity.owner();
        if let Some(user) = self.db.find::<User>(owner).await? {
            return Ok(Some(user.public_key));
        }
        // Remote owner: the peer server vouches for its actors
        match domain_of(owner) {
            Some(domain) => Ok(self.db.get_server(domain).await?.and_then(|s| s.public_key)),
            None => Ok(None),
        }
    }
}
