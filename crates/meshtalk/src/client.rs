//! One-shot message sends.
//!
//! Replies to strangers — PONGs, QHITs, reverse-path forwards, and POST
//! deliveries — travel over a fresh TCP connection that is closed right
//! after the single frame is written. These sockets are never tracked in
//! neighbour sets, and a failed reply is dropped without retry.

use std::net::SocketAddrV4;
use std::time::Duration;

use meshtalk_core::protocol::{self, Message, ProtocolError};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// How long to wait for a one-shot TCP connection to be established.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Errors that can occur when sending a one-shot message.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: SocketAddrV4, timeout: Duration },

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddrV4,
        source: std::io::Error,
    },

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Connects to `addr`, writes one framed message, and closes the socket.
pub async fn send_one_shot(addr: SocketAddrV4, msg: &Message) -> Result<(), ClientError> {
    debug!(%addr, msg_type = %msg.header.msg_type, "sending one-shot message");
    let mut stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(ClientError::Connect { addr, source: e });
        }
        Err(_) => {
            return Err(ClientError::ConnectTimeout {
                addr,
                timeout: CONNECT_TIMEOUT,
            });
        }
    };
    protocol::write_message(&mut stream, msg).await?;
    Ok(())
}
