//! TCP listener and message dispatcher.
//!
//! Accepts inbound connections and runs one reader task per connection:
//! decode a frame, route it to the matching [`crate::node::Node`]
//! handler, and loop. BYE and POST end the reader; PING, PONG, QUERY and
//! QHIT arrive on one-shot connections whose close surfaces as a clean
//! EOF on the next read; a connection that carried a JOIN or JACC stays
//! open in the durable neighbour role.
//!
//! A malformed frame or unknown message type closes the offending
//! connection only — never the node.

use std::net::SocketAddr;
use std::sync::Arc;

use meshtalk_core::protocol::{self, MsgType, ProtocolError};
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, error, warn};

use crate::node::Node;

/// Errors that can occur while setting up the listener.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind TCP listener: {0}")]
    Bind(std::io::Error),
}

/// The node's listening socket.
pub struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    /// Binds the listener on all interfaces with address reuse and a
    /// backlog of `max_connections`.
    ///
    /// Use port `0` to let the OS assign a free port, then read it back
    /// with [`Listener::port`].
    pub fn bind(port: u16, backlog: u32) -> Result<Self, ServerError> {
        let socket = TcpSocket::new_v4().map_err(ServerError::Bind)?;
        socket.set_reuseaddr(true).map_err(ServerError::Bind)?;
        socket
            .bind(SocketAddr::from(([0, 0, 0, 0], port)))
            .map_err(ServerError::Bind)?;
        let listener = socket.listen(backlog).map_err(ServerError::Bind)?;
        let local_addr = listener.local_addr().map_err(ServerError::Bind)?;
        Ok(Listener {
            listener,
            local_addr,
        })
    }

    /// The port the listener is actually bound to.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Runs the accept loop, spawning a reader task per connection.
    pub async fn accept_loop(self, node: Arc<Node>) {
        loop {
            match self.listener.accept().await {
                Ok((stream, remote)) => {
                    debug!(%remote, "accepted connection");
                    let node = Arc::clone(&node);
                    tokio::spawn(async move {
                        match handle_connection(stream, node).await {
                            Ok(()) | Err(ProtocolError::ConnectionClosed) => {
                                debug!(%remote, "connection closed");
                            }
                            Err(e) => {
                                warn!(%remote, error = %e, "closing connection after error");
                            }
                        }
                    });
                }
                Err(e) => {
                    // Accept errors are usually transient; keep serving.
                    error!(error = %e, "failed to accept connection");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }
}

/// Reader loop for one inbound connection.
async fn handle_connection(mut stream: TcpStream, node: Arc<Node>) -> Result<(), ProtocolError> {
    loop {
        let msg = protocol::read_message(&mut stream).await?;
        debug!(msg_type = %msg.header.msg_type, sender = %msg.sender(), "received message");
        match msg.header.msg_type {
            MsgType::Ping => node.handle_ping(msg).await,
            MsgType::Pong => node.handle_pong(msg).await,
            MsgType::Query => node.handle_query(msg).await,
            MsgType::Qhit => node.handle_qhit(msg).await,
            MsgType::Join => node.handle_join(msg, &mut stream).await,
            MsgType::Jacc => node.handle_jacc(msg, &mut stream).await,
            MsgType::Bye => {
                node.handle_bye(msg).await;
                return Ok(());
            }
            MsgType::Post => {
                node.handle_post(msg);
                return Ok(());
            }
        }
    }
}
