//! Wire protocol types for host-worker communication.
//!
//! - **Commands** (host → worker stdin): one line, tab-separated fields, `\n`-terminated
//! - **Responses** (worker stdout → host): free text closed by an empty line
//! - **Payload** (either direction): raw plane bytes outside the line framing

use std::fmt;

use tokio_util::bytes::BytesMut;

use super::escape::unescape;
use crate::config::LineEnding;
use crate::image::{AXES, ByteOrder, ComponentType, IoRegion, LookupTable};
use crate::metadata::parse_bool;

/// The five operations the worker understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    CanRead,
    Info,
    Read,
    CanWrite,
    Write,
}

impl Verb {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CanRead => "canRead",
            Self::Info => "info",
            Self::Read => "read",
            Self::CanWrite => "canWrite",
            Self::Write => "write",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the worker needs to encode a region of pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteParams<'a> {
    pub path: &'a str,
    pub byte_order: ByteOrder,
    pub region: &'a IoRegion,
    pub spacing: [f64; AXES],
    pub component_type: ComponentType,
    pub components: usize,
    pub lut: Option<&'a LookupTable>,
}

/// A single command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    verb: Verb,
    args: Vec<String>,
    /// `write` terminates every field with a tab, including the last one.
    terminated_fields: bool,
}

impl Command {
    fn simple(verb: Verb, path: &str) -> Self {
        Self {
            verb,
            args: vec![path.to_string()],
            terminated_fields: false,
        }
    }

    pub fn can_read(path: &str) -> Self {
        Self::simple(Verb::CanRead, path)
    }

    pub fn info(path: &str) -> Self {
        Self::simple(Verb::Info, path)
    }

    pub fn can_write(path: &str) -> Self {
        Self::simple(Verb::CanWrite, path)
    }

    /// `read` with exactly five index/size pairs; missing axes become `0`/`1`.
    pub fn read(path: &str, region: &IoRegion) -> Self {
        let mut args = Vec::with_capacity(1 + 2 * AXES);
        args.push(path.to_string());
        for axis in 0..AXES {
            args.push(region.index(axis).to_string());
            args.push(region.size(axis).to_string());
        }
        Self {
            verb: Verb::Read,
            args,
            terminated_fields: false,
        }
    }

    pub fn write(params: &WriteParams<'_>) -> Self {
        let region = params.region;
        let rank = region.rank();

        let mut args = vec![
            params.path.to_string(),
            params.byte_order.wire_code().to_string(),
            rank.to_string(),
        ];
        args.extend((0..AXES).map(|axis| region.size(axis).to_string()));
        args.extend((0..AXES).map(|axis| {
            if axis < rank {
                params.spacing[axis].to_string()
            } else {
                "1".to_string()
            }
        }));
        args.push(params.component_type.to_scifio().to_string());
        args.push(params.components.to_string());
        for axis in 0..AXES {
            args.push(region.index(axis).to_string());
            args.push(region.size(axis).to_string());
        }

        match params.lut {
            Some(lut) => {
                args.push("1".to_string());
                args.push(lut.bits.to_string());
                args.push(lut.entries.len().to_string());
                for rgb in &lut.entries {
                    args.extend(rgb.iter().map(i32::to_string));
                }
            }
            None => args.push("0".to_string()),
        }

        Self {
            verb: Verb::Write,
            args,
            terminated_fields: true,
        }
    }

    pub fn verb(&self) -> Verb {
        self.verb
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Arguments are sent unescaped, so none may contain a field or line separator.
    pub fn validate(&self) -> Result<(), String> {
        match self
            .args
            .iter()
            .find(|arg| arg.contains(['\t', '\n', '\r']))
        {
            Some(arg) => Err(format!(
                "argument {arg:?} contains a tab or line break and cannot be sent"
            )),
            None => Ok(()),
        }
    }

    /// Append the serialized line (including the trailing `\n`) to `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.extend_from_slice(self.verb.as_str().as_bytes());
        if self.terminated_fields {
            dst.extend_from_slice(b"\t");
            for arg in &self.args {
                dst.extend_from_slice(arg.as_bytes());
                dst.extend_from_slice(b"\t");
            }
        } else {
            for arg in &self.args {
                dst.extend_from_slice(b"\t");
                dst.extend_from_slice(arg.as_bytes());
            }
        }
        dst.extend_from_slice(b"\n");
    }

    pub fn to_line(&self) -> String {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    }
}

/// Accumulates one response until it ends with the terminator sentinel.
#[derive(Debug)]
pub struct ResponseBuffer {
    buf: BytesMut,
    line_ending: LineEnding,
}

impl ResponseBuffer {
    pub fn new(line_ending: LineEnding) -> Self {
        Self {
            buf: BytesMut::new(),
            line_ending,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// True once the accumulated bytes end with an empty line.
    pub fn is_complete(&self) -> bool {
        self.buf.ends_with(self.line_ending.terminator())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_text(self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }
}

/// Split a response body into lines on the configured terminator.
pub fn lines(text: &str, line_ending: LineEnding) -> impl Iterator<Item = &str> {
    text.split(line_ending.as_str())
}

fn first_line(text: &str, line_ending: LineEnding) -> &str {
    lines(text, line_ending).next().unwrap_or("")
}

/// `canRead` / `canWrite`: the first line is a boolean literal.
pub fn parse_bool_reply(text: &str, line_ending: LineEnding) -> Result<bool, String> {
    let line = first_line(text, line_ending);
    parse_bool(line).ok_or_else(|| format!("expected a boolean, got {line:?}"))
}

/// `write` control phase: the first line is the number of bytes per plane.
pub fn parse_count_reply(text: &str, line_ending: LineEnding) -> Result<usize, String> {
    let line = first_line(text, line_ending);
    line.trim()
        .parse::<usize>()
        .map_err(|_| format!("expected a byte count, got {line:?}"))
}

/// `info`: alternating key and value lines, values escaped.
///
/// Blank lines between pairs are skipped. A key followed by a blank line, or a
/// key at the very end of the body, has no value and is dropped.
pub fn parse_key_values(text: &str, line_ending: LineEnding) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut pending_key: Option<&str> = None;

    for line in lines(text, line_ending) {
        match pending_key.take() {
            None if line.is_empty() => {}
            None => pending_key = Some(line),
            Some(key) if line.is_empty() => {
                tracing::debug!(%key, "Metadata key without value dropped");
            }
            Some(key) => pairs.push((key.to_string(), unescape(line))),
        }
    }

    if let Some(key) = pending_key {
        tracing::debug!(%key, "Trailing metadata key without value dropped");
    }

    pairs
}
