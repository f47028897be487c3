//! Remote Node Communication
//!
//! Shared error and liveness types for talking to other broker nodes.
//! Every outbound cluster operation reports failures as a [`RemoteError`],
//! and every known node carries a [`RemotePeerStatus`].

mod peer;

pub use peer::{RemoteError, RemotePeerStatus};
