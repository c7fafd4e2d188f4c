/// The error taxonomy surfaced across the RPC boundary.
///
/// Internal gateway modules still raise `anyhow::Error` for the long tail of
/// host/process failures; callers that need to distinguish failure kinds
/// (the RPC dispatcher, in particular) match on this type instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("challenge {0:?} is not registered")]
    UnknownChallenge(String),

    #[error("netlink operation failed: {0}")]
    Netlink(#[from] NetlinkError),

    #[error("container operation failed: {0}")]
    Container(#[from] ContainerError),

    #[error("no default network found for project {project_id:?}; cluster did not come up cleanly")]
    Topology { project_id: String },

    #[error("vlan space for challenge {challenge:?} is exhausted")]
    Exhaustion { challenge: String },
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct NetlinkError(pub anyhow::Error);

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ContainerError(pub anyhow::Error);

impl NetlinkError {
    pub fn new(err: anyhow::Error) -> Self {
        NetlinkError(err)
    }
}

impl ContainerError {
    pub fn new(err: anyhow::Error) -> Self {
        ContainerError(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// `DecodeError` per spec is never surfaced to a caller: a common-name that
/// fails to base32-decode only downgrades display-name quality, logged as a
/// warning. This type exists so the decoder has something concrete to name
/// in its own `Result`, without leaking a fabricated variant into [`Error`].
#[derive(Debug, thiserror::Error)]
#[error("common name {cn:?} is not valid base32")]
pub struct DecodeError {
    pub cn: String,
}
