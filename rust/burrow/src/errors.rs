//! Error surface for bus commands.
//!
//! Every command reports failure as one of these kinds; the embedding layer
//! flattens them to a single integer code via [`OpError::code`]. Success is
//! the absence of an error, there is no zero variant.

use burrow_pool::PoolError;

/// Resource dimension that ran out of quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Memory,
    Messages,
    Handles,
    Fds,
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resource::Memory => write!(f, "memory"),
            Resource::Messages => write!(f, "messages"),
            Resource::Handles => write!(f, "handles"),
            Resource::Fds => write!(f, "file descriptors"),
        }
    }
}

/// Command-level error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpError {
    /// Id never existed on this peer.
    NoSuch,
    /// Id existed but the handle has been fully released.
    Stale,
    /// Operation is restricted to the node owner.
    NotOwner,
    /// Node destruction already in progress.
    InProgress,
    /// One of the per-user budgets is exhausted.
    Quota(Resource),
    /// Peer was already initialised.
    AlreadyInit,
    /// Peer was never initialised.
    NotInit,
    /// Peer has been shut down.
    Shutdown,
    /// Allocation failed (pool exhausted).
    NoMem,
    /// Queue is empty; try again after the next readable edge.
    WouldBlock,
}

impl OpError {
    /// Stable integer code reported across the command boundary.
    pub fn code(&self) -> u32 {
        match self {
            OpError::NoSuch => 1,
            OpError::Stale => 2,
            OpError::NotOwner => 3,
            OpError::InProgress => 4,
            OpError::Quota(_) => 5,
            OpError::AlreadyInit => 6,
            OpError::NotInit => 7,
            OpError::Shutdown => 8,
            OpError::NoMem => 9,
            OpError::WouldBlock => 10,
        }
    }
}

impl std::fmt::Display for OpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpError::NoSuch => write!(f, "no such id"),
            OpError::Stale => write!(f, "handle released"),
            OpError::NotOwner => write!(f, "not the node owner"),
            OpError::InProgress => write!(f, "destruction in progress"),
            OpError::Quota(r) => write!(f, "quota exceeded: {r}"),
            OpError::AlreadyInit => write!(f, "peer already initialised"),
            OpError::NotInit => write!(f, "peer not initialised"),
            OpError::Shutdown => write!(f, "peer shut down"),
            OpError::NoMem => write!(f, "out of memory"),
            OpError::WouldBlock => write!(f, "queue empty"),
        }
    }
}

impl std::error::Error for OpError {}

impl From<PoolError> for OpError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::Exhausted => OpError::NoMem,
            PoolError::InvalidSize => OpError::NoMem,
            PoolError::UnknownSlice
            | PoolError::GenerationMismatch
            | PoolError::NotPublished => OpError::NoSuch,
            PoolError::OutOfBounds => OpError::NoMem,
        }
    }
}
