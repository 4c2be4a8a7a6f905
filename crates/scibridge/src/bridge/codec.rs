//! Framed encoder for worker commands.
//!
//! Commands are single tab-separated lines. Works over any AsyncWrite
//! (the child's stdin in practice) through `FramedWrite`.

use std::io;

use tokio_util::bytes::BytesMut;
use tokio_util::codec::Encoder;

use super::protocol::Command;

/// Encodes [`Command`]s as newline-terminated lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandCodec;

impl CommandCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Encoder<Command> for CommandCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.validate()
            .map_err(|msg| io::Error::new(io::ErrorKind::InvalidInput, msg))?;
        let start = dst.len();
        item.encode_into(dst);
        tracing::trace!(
            verb = %item.verb(),
            line_bytes = dst.len() - start,
            "Encoding command"
        );
        Ok(())
    }
}
