//! The transport adapter contract
//!
//! The engine performs no IO of its own. A handler connects it to the
//! outside world: outbound bytes leave through [`on_data`], and the
//! transport layer feeds inbound bytes into
//! [`Connection::parse`](crate::Connection::parse). Everything else on the
//! trait is a lifecycle notification with a default implementation.

use fe3o4_amqp_types::value::Table;

/// Interface between the protocol engine and the transport layer
///
/// The only required method is [`on_data`](ConnectionHandler::on_data);
/// implementations forward those bytes to the broker in order. Timeouts,
/// sockets and TLS all live behind this trait, the engine never blocks and
/// never spawns threads. All callbacks arrive on the single context that
/// drives the engine.
pub trait ConnectionHandler {
    /// Bytes that must reach the broker, in the order handed out
    fn on_data(&mut self, buffer: &[u8]);

    /// Pick the heartbeat interval, in seconds, given the interval the
    /// server suggested. Return 0 to disable heartbeats. The default
    /// accepts the server's suggestion.
    fn on_negotiate(&mut self, suggested: u16) -> u16 {
        suggested
    }

    /// Inspect the server properties from connection.start and amend the
    /// client properties that will be reported back
    fn on_properties(&mut self, _server: &Table, _client: &mut Table) {}

    /// The handshake finished; queued frames have been flushed and the
    /// connection is ready for use
    fn on_ready(&mut self) {}

    /// A fatal error occurred; the connection and all channels are dead
    fn on_error(&mut self, _message: &str) {}

    /// A user initiated close completed
    fn on_closed(&mut self) {}

    /// A heartbeat frame came in from the server
    fn on_heartbeat(&mut self) {}
}
