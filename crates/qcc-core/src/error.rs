use crate::wire::MessageDigest;

/// Errors surfaced to callers of the connection core.
///
/// Recoverable transport issues (peer unreachable, socket reset) never
/// appear here — they are reported as [`crate::events::CoreEvent::Error`]
/// and handled internally by the reconnect state machine. Only outcomes
/// that change the result of a caller-visible future or call are
/// represented as a typed error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// All N peers replied but no majority agreed on a single payload.
    #[error("no quorum among {responses} responses for command {command}")]
    InvalidResponses { command: u32, responses: usize },

    /// A signature over an admin-signed payload did not verify.
    #[error("signature verification failed")]
    SignatureInvalid,

    /// The durable outbox store returned an error.
    #[error("outbox storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Caller-visible domain error raised before any network send, e.g.
    /// insufficient energy to cover a transfer's effect payload.
    #[error("domain error: {0}")]
    Domain(String),

    /// The core was terminated while a caller was waiting on it.
    #[error("connection core was terminated")]
    Shutdown,

    /// `set_endpoint`/`send` was asked to reach a peer slot that does not
    /// exist in this core's configuration.
    #[error("unknown peer slot {0}")]
    UnknownPeer(usize),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
#[error("outbox entry for digest {digest} not found")]
pub struct DigestNotFound {
    pub digest: MessageDigest,
}
