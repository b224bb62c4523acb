//! A ready made TCP transport on top of tokio
//!
//! The engine itself is sans-IO; this module is the one batteries-included
//! adapter, replacing the per-event-loop glue other clients ship. It
//! connects a plain TCP socket, pumps inbound bytes into
//! [`Connection::parse`], writes whatever the engine emits, and runs the
//! negotiated heartbeat interval.
//!
//! The wrapped handler keeps all its lifecycle callbacks; its `on_data` is
//! never invoked because the socket owns the byte stream.

use std::io;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use fe3o4_amqp_types::value::Table;

use crate::address::Address;
use crate::connection::Connection;
use crate::handler::ConnectionHandler;

/// Error from the TCP transport
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Socket level failure
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The broker closed the connection or a protocol error killed it
    #[error("connection failure: {0}")]
    Connection(String),
}

struct SocketHandler<H> {
    user: H,
    writer: UnboundedSender<Bytes>,
}

impl<H: ConnectionHandler> ConnectionHandler for SocketHandler<H> {
    fn on_data(&mut self, buffer: &[u8]) {
        let _ = self.writer.send(Bytes::copy_from_slice(buffer));
    }

    fn on_negotiate(&mut self, suggested: u16) -> u16 {
        self.user.on_negotiate(suggested)
    }

    fn on_properties(&mut self, server: &Table, client: &mut Table) {
        self.user.on_properties(server, client);
    }

    fn on_ready(&mut self) {
        self.user.on_ready();
    }

    fn on_error(&mut self, message: &str) {
        self.user.on_error(message);
    }

    fn on_closed(&mut self) {
        self.user.on_closed();
    }

    fn on_heartbeat(&mut self) {
        self.user.on_heartbeat();
    }
}

/// A connection bound to a TCP socket
///
/// Create it with [`TcpTransport::connect`], open channels on the
/// [`connection`](TcpTransport::connect) handle it returns, then let
/// [`run`](TcpTransport::run) drive the traffic until the connection ends.
pub struct TcpTransport {
    connection: Connection,
    stream: TcpStream,
    outbound: UnboundedReceiver<Bytes>,
}

impl TcpTransport {
    /// Connect the socket and start the handshake. Returns the transport
    /// and a connection handle to open channels on.
    pub async fn connect<H>(
        address: &Address,
        handler: H,
    ) -> Result<(TcpTransport, Connection), TransportError>
    where
        H: ConnectionHandler + 'static,
    {
        let stream = TcpStream::connect((address.host(), address.port())).await?;
        stream.set_nodelay(true)?;

        let (writer, outbound) = mpsc::unbounded_channel();
        let handler = SocketHandler {
            user: handler,
            writer,
        };
        // this already emits the protocol header into the writer queue
        let connection = Connection::with_address(handler, address);

        let transport = TcpTransport {
            connection: connection.clone(),
            stream,
            outbound,
        };
        Ok((transport, connection))
    }

    /// Drive the connection until it closes or dies. Resolves with `Ok`
    /// after a clean close and with an error when the socket drops or a
    /// protocol failure kills the connection.
    pub async fn run(mut self) -> Result<(), TransportError> {
        let mut inbound = BytesMut::with_capacity(8192);
        let mut negotiated = self.connection.heartbeat_interval();
        let mut heartbeat = interval_for(negotiated);

        loop {
            if !self.connection.usable() && self.outbound.is_empty() {
                return Ok(());
            }

            tokio::select! {
                read = self.stream.read_buf(&mut inbound) => {
                    match read {
                        Ok(0) => {
                            self.connection.fail("connection lost");
                            return Err(TransportError::Connection("connection lost".to_owned()));
                        }
                        Ok(_) => {
                            let consumed = self.connection.parse(&inbound);
                            let _ = inbound.split_to(consumed);
                            // the engine knows how big the next frame is
                            let expected = self.connection.expected() as usize;
                            if inbound.capacity() < expected {
                                inbound.reserve(expected - inbound.len());
                            }
                            // the heartbeat interval is known after tune
                            let interval = self.connection.heartbeat_interval();
                            if interval != negotiated {
                                negotiated = interval;
                                heartbeat = interval_for(interval);
                            }
                        }
                        Err(err) => {
                            self.connection.fail("connection lost");
                            return Err(err.into());
                        }
                    }
                }
                outbound = self.outbound.recv() => {
                    match outbound {
                        Some(bytes) => self.stream.write_all(&bytes).await?,
                        None => return Ok(()),
                    }
                }
                _ = heartbeat.tick() => {
                    self.connection.heartbeat();
                }
            }
        }
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

/// A ticker at half the negotiated interval, or one that effectively
/// never fires while heartbeats are disabled or still unnegotiated
fn interval_for(seconds: u16) -> tokio::time::Interval {
    let period = match seconds {
        0 => Duration::from_secs(3600 * 24),
        s => Duration::from_secs(u64::from(s).max(2) / 2),
    };
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.reset();
    interval
}
