//! NDJSON codec for bus connections.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a maximum line length so a
//! misbehaving peer cannot make the supervisor buffer an unbounded frame.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Maximum frame length accepted on the inbound side: 1 MiB.
pub const MAX_FRAME_BYTES: usize = 1_048_576;

/// Line-delimited JSON codec. One `\n`-terminated UTF-8 line is one frame.
///
/// Inbound lines longer than [`MAX_FRAME_BYTES`] fail with
/// [`AppError::Ipc`]`("frame too long: …")`. The limit is not applied when
/// encoding.
#[derive(Debug)]
pub struct BusCodec(LinesCodec);

impl BusCodec {
    /// Create a codec with the default [`MAX_FRAME_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_FRAME_BYTES))
    }
}

impl Default for BusCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for BusCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode(src).map_err(map_codec_error)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode_eof(src).map_err(map_codec_error)
    }
}

impl Encoder<String> for BusCodec {
    type Error = AppError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        self.0.encode(item, dst).map_err(map_codec_error)
    }
}

fn map_codec_error(e: LinesCodecError) -> AppError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            AppError::Ipc(format!("frame too long: exceeded {MAX_FRAME_BYTES} bytes"))
        }
        LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
    }
}
