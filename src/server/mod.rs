//! Protocol Server
//!
//! TCP server for external clients. Each connection gets its own task
//! running a small state machine:
//!
//! ```text
//! Idle ──length prefix──> Framing ──body──> Dispatch ──responses──> Idle
//! ```
//!
//! Frames larger than `max_message_bytes` are answered with an `ERROR` and
//! the connection is closed; the stream cannot be resynchronized after an
//! unread body. Malformed payloads and unknown message types are answered
//! with an `ERROR` and the connection stays open.
//!
//! The listener and every connection close once the run is stopped.

pub mod dispatch;
pub mod framing;
pub mod protocol;

use prost::Message;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::{AppResult, DaqError, ProtocolError};
use crate::session::RunSession;

pub use dispatch::Dispatcher;
pub use protocol::{Envelope, MessageType};

use framing::{read_body, read_header, write_envelope};

/// Connection phase.
enum Phase {
    Idle,
    Framing(usize),
    Dispatch(bytes::BytesMut),
}

/// Listening protocol server.
pub struct ProtocolServer {
    listener: TcpListener,
    dispatcher: Dispatcher,
    session: Arc<RunSession>,
    max_message_bytes: usize,
}

impl ProtocolServer {
    /// Bind the configured address.
    pub async fn bind(
        config: &ServerConfig,
        dispatcher: Dispatcher,
        session: Arc<RunSession>,
    ) -> AppResult<Self> {
        let address = config.bind_address();
        let listener = TcpListener::bind(&address).await.map_err(|e| {
            DaqError::Configuration(format!("Cannot bind protocol server to {}: {}", address, e))
        })?;
        info!(address = %address, "Protocol server listening");
        Ok(Self {
            listener,
            dispatcher,
            session,
            max_message_bytes: config.max_message_bytes,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Accept connections until the run stops.
    pub async fn run(self) {
        loop {
            let accepted = tokio::select! {
                _ = self.session.stopped() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let dispatcher = self.dispatcher.clone();
                    let session = self.session.clone();
                    let max = self.max_message_bytes;
                    tokio::spawn(async move {
                        info!(%peer, "Client connected");
                        let result = tokio::select! {
                            _ = session.stopped() => Ok(()),
                            result = serve_connection(stream, dispatcher, max) => result,
                        };
                        match result {
                            Ok(()) => info!(%peer, "Client disconnected"),
                            Err(e) => warn!(%peer, error = %e, "Client connection closed"),
                        }
                    });
                }
                Err(e) => error!(error = %e, "Accept failed"),
            }
        }
        info!("Protocol server stopped");
    }
}

/// Serve one client until it disconnects or the stream becomes unusable.
pub async fn serve_connection(
    stream: TcpStream,
    dispatcher: Dispatcher,
    max_message_bytes: usize,
) -> Result<(), ProtocolError> {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Could not set TCP_NODELAY");
    }
    let (mut reader, mut writer) = stream.into_split();
    let mut phase = Phase::Idle;

    loop {
        phase = match phase {
            Phase::Idle => match read_header(&mut reader).await? {
                Some(len) => Phase::Framing(len),
                None => return Ok(()),
            },
            Phase::Framing(len) => match read_body(&mut reader, len, max_message_bytes).await {
                Ok(body) => Phase::Dispatch(body),
                Err(e @ ProtocolError::FrameTooLarge { .. }) => {
                    write_envelope(&mut writer, &Envelope::error(&e)).await?;
                    return Err(e);
                }
                Err(e) => return Err(e),
            },
            Phase::Dispatch(body) => {
                let responses = match Envelope::decode(body.freeze()) {
                    Ok(request) => {
                        debug!(kind = request.r#type, bytes = request.data.len(), "Request");
                        dispatcher.handle(request).await
                    }
                    Err(e) => vec![Envelope::error(&ProtocolError::Decode(e))],
                };
                for response in &responses {
                    write_envelope(&mut writer, response).await?;
                }
                Phase::Idle
            }
        };
    }
}
