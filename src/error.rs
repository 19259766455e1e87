use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("connection manager not started")]
    NotStarted,

    #[error("node is shutting down")]
    ShuttingDown,

    #[error("peer is gone")]
    PeerGone,

    #[error("dial failed: {0}")]
    DialFailed(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("node cannot bootstrap")]
    CantBootstrap,

    #[error("node is bootstrapping")]
    AlreadyBootstrapping,

    #[error("node has already been deployed")]
    AlreadyDeployed,

    #[error("node is already joining a cluster")]
    AlreadyJoining,

    #[error("node has already joined a cluster")]
    AlreadyJoined,

    #[error("corrupt state document: {0}")]
    CorruptState(String),

    #[error("inconsistent on-disk state: {0}")]
    InconsistentState(String),

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("no usable network address: {0}")]
    NetworkAddressNotFound(String),

    #[error("bootstrap failed: {0}")]
    BootstrapFailed(String),

    #[error("provisioner error: {0}")]
    Provisioner(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for NodeError {
    fn from(e: serde_json::Error) -> Self {
        NodeError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, NodeError>;
