//! A logical socket multiplexed inside a remote session (§3 "A channel has
//! (id, back-reference to session, state, ...)").
//!
//! The spec's "back-reference to session" is logically weak (§9 "Parent
//! pointers / weak references ... model as non-owning handles validated at
//! use"); channels here are owned outright by [`super::RemoteSession`]'s
//! channel table and never hold a reference back, which sidesteps the
//! weak-pointer question entirely rather than reproducing it.

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::domain_types::ChannelId;

/// Lifecycle state of one multiplexed channel (§3 "Channel").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Initial,
    Connecting,
    Connected,
    Closed,
    Inactive,
}

/// One logical socket carried inside a session's frame stream (§3, §4.11).
pub struct Channel {
    pub id: ChannelId,
    pub state: ChannelState,
    /// The local TCP connection this channel proxies to, once opened. Shared
    /// via `Arc` so callers can clone a handle out and release the channel
    /// table lock before doing local I/O.
    local: Option<Arc<Mutex<TcpStream>>>,
    /// Optional byte counters from the `OpenSocket` negotiation; `None` means
    /// "unbounded" (the common case — the wire protocol does not always cap these).
    pub bytes_left_tx: Option<u64>,
    pub bytes_left_rx: Option<u64>,
    pub error: bool,
}

impl Channel {
    #[must_use]
    pub fn new(id: ChannelId) -> Self {
        Self {
            id,
            state: ChannelState::Initial,
            local: None,
            bytes_left_tx: None,
            bytes_left_rx: None,
            error: false,
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self.state, ChannelState::Connecting | ChannelState::Connected)
    }

    pub fn bind_local(&mut self, stream: TcpStream) {
        self.local = Some(Arc::new(Mutex::new(stream)));
        self.state = ChannelState::Connected;
    }

    /// Returns a cloned handle to the bound local socket, if any, so the
    /// caller can release the channel table lock before doing local I/O.
    #[must_use]
    pub fn local(&self) -> Option<Arc<Mutex<TcpStream>>> {
        self.local.clone()
    }

    pub fn mark_closed(&mut self) {
        self.local = None;
        self.state = ChannelState::Closed;
    }

    pub fn mark_error(&mut self) {
        self.error = true;
        self.mark_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_channel_starts_initial_and_not_open() {
        let channel = Channel::new(ChannelId::try_new(1).unwrap());
        assert_eq!(channel.state, ChannelState::Initial);
        assert!(!channel.is_open());
    }

    #[test]
    fn mark_closed_clears_local_socket() {
        let mut channel = Channel::new(ChannelId::try_new(1).unwrap());
        channel.state = ChannelState::Connected;
        channel.mark_closed();
        assert_eq!(channel.state, ChannelState::Closed);
        assert!(channel.local().is_none());
    }

    #[test]
    fn mark_error_also_sets_error_flag() {
        let mut channel = Channel::new(ChannelId::try_new(1).unwrap());
        channel.mark_error();
        assert!(channel.error);
        assert_eq!(channel.state, ChannelState::Closed);
    }
}
