/// CommChannel: the ordered, reliable message link between the two devices.

use anyhow::Result;

/// A bidirectional, ordered, reliable channel carrying whole messages.
///
/// `recv_message` blocks; any error it returns means the link is gone.
/// `close` must unblock a reader waiting in `recv_message` on this side and
/// make the peer's reader fail as well.
pub trait CommChannel: Send + Sync {
    /// Send one message to the peer.
    fn send_message(&self, data: &[u8]) -> Result<()>;

    /// Receive the next message from the peer (blocking).
    fn recv_message(&self) -> Result<Vec<u8>>;

    fn close(&self) -> Result<()>;

    /// Human-readable description for logs.
    fn description(&self) -> String;
}
