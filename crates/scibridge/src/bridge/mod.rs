//! Wire layer for host-worker communication.
//!
//! # Architecture
//!
//! - **escape**: `\\` / `\n` escaping of metadata values
//! - **protocol**: Command lines, response buffering and the reply grammar
//! - **codec**: `Encoder` framing commands onto the worker's stdin

pub mod codec;
pub mod escape;
pub mod protocol;
