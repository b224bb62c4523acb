#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs, missing_debug_implementations)]

//! Wire-level data types for the AMQP 0-9-1 protocol.
//!
//! This crate implements the byte-stream side of the protocol: the
//! bounds-checked big-endian cursor, the tagged field values and field
//! tables, the fourteen content-header properties with their presence
//! bitmap, and the typed frames of all recognized classes together with a
//! frame encoder/decoder. It performs no IO and keeps no connection state;
//! the `fe3o4-amqp` crate builds the protocol engine on top of it.

pub mod constants;
pub mod content;
mod error;
pub mod frame;
pub mod properties;
pub mod read;
pub mod value;
pub mod write;

pub use error::Error;
