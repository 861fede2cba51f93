//! Framing for both listener ports: one JSON document per `\n`-terminated
//! line. `serde_json` escapes newlines inside strings, so an encoded document
//! never spans lines.

use std::sync::Arc;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};
use tuicub_core::{Ack, ConnectRequest, Envelope, Event, RelayError};

/// A serialized event line shared by every queue it is fanned out to.
pub type OutboundFrame = Arc<str>;

/// One decoded inbound line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    Line(String),
    /// A line longer than the frame limit. Its bytes were discarded and the
    /// stream continues with the next line.
    Oversized,
}

/// `LinesCodec` that reports over-long lines as an item instead of an error.
///
/// `FramedRead` ends the stream once after any decoder error, which would
/// look like a closed peer.
#[derive(Clone, Debug)]
pub struct FrameCodec {
    lines: LinesCodec,
}

impl FrameCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_frame_len),
        }
    }
}

fn oversized_as_item(
    decoded: Result<Option<String>, LinesCodecError>,
) -> Result<Option<Inbound>, LinesCodecError> {
    match decoded {
        Ok(line) => Ok(line.map(Inbound::Line)),
        Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Inbound::Oversized)),
        Err(e) => Err(e),
    }
}

impl Decoder for FrameCodec {
    type Item = Inbound;
    type Error = LinesCodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Inbound>, LinesCodecError> {
        oversized_as_item(self.lines.decode(buf))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Inbound>, LinesCodecError> {
        oversized_as_item(self.lines.decode_eof(buf))
    }
}

impl<T: AsRef<str>> Encoder<T> for FrameCodec {
    type Error = LinesCodecError;

    fn encode(&mut self, line: T, buf: &mut BytesMut) -> Result<(), LinesCodecError> {
        self.lines.encode(line, buf)
    }
}

pub fn encode_event(event: &Event) -> Result<OutboundFrame, RelayError> {
    Ok(Arc::from(serde_json::to_string(event)?))
}

pub fn encode_ack(ack: &Ack) -> Result<String, RelayError> {
    Ok(serde_json::to_string(ack)?)
}

pub fn decode_connect(line: &str) -> Result<ConnectRequest, RelayError> {
    Ok(serde_json::from_str(line.trim())?)
}

pub fn decode_envelope(line: &str) -> Result<Envelope, RelayError> {
    Ok(serde_json::from_str(line.trim())?)
}
