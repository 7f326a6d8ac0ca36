//! In-process message bus with handle-addressed nodes.
//!
//! Peers do not talk to each other by name. A peer owns *nodes* (abstract
//! destinations) and every peer holds *handles* to the nodes it may send to;
//! messages are addressed at handles and land in the queue of the node's
//! owner. Handles travel inside messages, which is how capabilities spread:
//!
//! ```text
//!   ┌────────┐   send(handle→N, payload)    ┌────────┐
//!   │ peer A │ ───────────────────────────▶ │ peer B │  owner of N
//!   └────────┘                              └────────┘
//!        ▲   handles to N can be shipped         │
//!        └── to third peers inside messages ◀────┘
//! ```
//!
//! Every peer's reception queue orders entries by a staged/committed stamp
//! protocol, so all observers agree on one causal order of messages and node
//! destructions. Inflight resources are bounded per user by a fairness rule
//! that degrades gracefully under contention.
//!
//! # Usage
//!
//! ```ignore
//! use burrow::{Bus, BusConfig, SendArgs};
//!
//! let bus = Bus::new(BusConfig::default());
//! let a = bus.endpoint(uid);
//! a.init(1 << 16)?;
//!
//! // Mint a node on a sibling peer, keep a handle to it.
//! let b = a.clone_peer(1 << 16)?;
//! a.send(&SendArgs {
//!     destinations: &[b.handle],
//!     payload: b"hi",
//!     ..SendArgs::default()
//! })?;
//!
//! let received = b.endpoint.recv()?;
//! ```

#[macro_use]
mod macros;

mod bus;
mod clock;
mod errors;
mod handle;
mod id;
mod index;
mod peer;
mod queue;
mod transfer;
mod user;
mod wait;

pub use bus::{Bus, BusConfig, ClonedPeer, Endpoint, SendArgs};
pub use errors::{OpError, Resource};
pub use id::HandleId;
pub use peer::{Delivery, Received};
pub use user::{FDS_MAX, HANDLES_MAX, Limits, MESSAGES_MAX, User};

// The pool crate is part of the public surface: recv exposes slice offsets
// into it.
pub use burrow_pool::{POOL_SIZE_MAX, POOL_SIZE_MIN, PoolError};
