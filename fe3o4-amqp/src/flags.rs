//! Option flags for channel operations
//!
//! Operations take a bitwise-or of the flags they recognize; unrelated
//! flags are ignored. Semantics follow the AMQP 0-9-1 specification.

/// Exchanges and queues survive a broker restart
pub const DURABLE: u32 = 0x1;
/// Delete the exchange or queue once unused
pub const AUTODELETE: u32 = 0x2;
/// Only check for existence, do not create
pub const PASSIVE: u32 = 0x4;
/// The queue belongs to this connection alone
pub const EXCLUSIVE: u32 = 0x8;
/// Do not wait for the broker's confirmation
pub const NOWAIT: u32 = 0x10;
/// The exchange is only reachable through exchange bindings
pub const INTERNAL: u32 = 0x20;
/// Only delete when there are no more bindings or consumers
pub const IFUNUSED: u32 = 0x40;
/// Only delete when the queue holds no messages
pub const IFEMPTY: u32 = 0x80;
/// Return the message when it cannot be routed
pub const MANDATORY: u32 = 0x100;
/// Return the message when it cannot be delivered right away
pub const IMMEDIATE: u32 = 0x200;
/// Do not deliver messages published on this same connection
pub const NOLOCAL: u32 = 0x400;
/// Deliver without expecting acknowledgements
pub const NOACK: u32 = 0x800;
/// Requeue instead of discarding when rejecting or recovering
pub const REQUEUE: u32 = 0x1000;
/// Acknowledge everything up to and including the delivery tag
pub const MULTIPLE: u32 = 0x2000;
/// Apply the qos setting to the whole connection
pub const GLOBAL: u32 = 0x4000;
