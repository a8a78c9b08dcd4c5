//! A durable connection to one overlay neighbour.
//!
//! A `Peer` binds an address to exactly one TCP socket. Traffic *towards*
//! us from a neighbour arrives on connections the neighbour opens, so
//! only the write half is kept; everything this node sends to the
//! neighbour — flood forwards, BYE — goes through [`Peer::send`].
//!
//! A `Peer` is distinct from a transient reply socket: handlers that
//! answer a stranger open a fresh connection via [`crate::client`] and
//! never track it in a neighbour set.

use std::fmt;
use std::net::SocketAddrV4;

use meshtalk_core::keys::PeerId;
use meshtalk_core::protocol::Message;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

/// One overlay neighbour endpoint.
pub struct Peer {
    addr: SocketAddrV4,
    /// Known once a JOIN/JACC handshake has exchanged identities.
    peer_id: Option<PeerId>,
    /// Write half of the single socket this peer owns. The mutex
    /// serialises writers so frames from two tasks never interleave;
    /// `None` after disconnect.
    writer: Mutex<Option<OwnedWriteHalf>>,
}

impl Peer {
    /// Opens a fresh outbound connection to a neighbour's listening
    /// address. The read half is dropped — see the module docs.
    pub async fn connect(addr: SocketAddrV4) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        debug!(%addr, "established peer connection");
        let (_read_half, write_half) = stream.into_split();
        Ok(Peer {
            addr,
            peer_id: None,
            writer: Mutex::new(Some(write_half)),
        })
    }

    /// Wraps a socket produced by a completed handshake.
    pub fn from_parts(addr: SocketAddrV4, peer_id: Option<PeerId>, write_half: OwnedWriteHalf) -> Self {
        Peer {
            addr,
            peer_id,
            writer: Mutex::new(Some(write_half)),
        }
    }

    /// The neighbour's listening address.
    pub fn addr(&self) -> SocketAddrV4 {
        self.addr
    }

    /// The neighbour's identity, when a handshake has revealed it.
    pub fn peer_id(&self) -> Option<&PeerId> {
        self.peer_id.as_ref()
    }

    /// Serialises and writes one message to the peer's socket.
    ///
    /// On failure the error is surfaced; the caller decides whether to
    /// drop the peer from its neighbour set.
    pub async fn send(&self, msg: &Message) -> std::io::Result<()> {
        debug!(msg_type = %msg.header.msg_type, addr = %self.addr, "sending message to peer");
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "peer already disconnected",
            ));
        };
        writer.write_all(&msg.to_bytes()).await?;
        writer.flush().await
    }

    /// Half-closes the socket for writing. Idempotent: calling this on an
    /// already-disconnected peer does nothing and never errors.
    pub async fn disconnect(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            debug!(addr = %self.addr, "disconnecting peer");
            let _ = writer.shutdown().await;
        }
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("addr", &self.addr)
            .field("peer_id", &self.peer_id)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use meshtalk_core::protocol::{self, MsgType};
    use tokio::net::TcpListener;

    async fn local_pair() -> (Peer, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let addr = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), port);
        let (peer, accepted) = tokio::join!(Peer::connect(addr), listener.accept());
        (peer.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn send_reaches_the_remote_end() {
        let (peer, mut remote) = local_pair().await;
        let msg = Message::new(MsgType::Bye, peer.addr(), 1, 5, Vec::new());
        peer.send(&msg).await.unwrap();

        let received = protocol::read_message(&mut remote).await.unwrap();
        assert_eq!(received, msg);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let (peer, _remote) = local_pair().await;
        peer.disconnect().await;
        peer.disconnect().await;
    }

    #[tokio::test]
    async fn send_after_disconnect_errors() {
        let (peer, _remote) = local_pair().await;
        peer.disconnect().await;
        let msg = Message::new(MsgType::Bye, peer.addr(), 1, 5, Vec::new());
        assert!(peer.send(&msg).await.is_err());
    }
}
