//! Frame codec for `tokio_util::codec::{FramedRead, FramedWrite}`

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::frame::EslFrame;
use super::parse_header_block;
use crate::error::{EslError, EslResult};

/// Upper bound for a single header block; the switch never sends more
const DEFAULT_MAX_HEADER_LEN: usize = 64 * 1024;

/// Upper bound for a single body (full `show channels` dumps can be large)
const DEFAULT_MAX_BODY_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug)]
enum DecodeState {
    Headers,
    Body {
        headers: std::collections::HashMap<String, String>,
        len: usize,
    },
}

/// Splits the byte stream into [`EslFrame`]s and writes commands
#[derive(Debug)]
pub struct EslCodec {
    state: DecodeState,
    max_header_len: usize,
    max_body_len: usize,
}

impl EslCodec {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Headers,
            max_header_len: DEFAULT_MAX_HEADER_LEN,
            max_body_len: DEFAULT_MAX_BODY_LEN,
        }
    }

    pub fn with_max_header_len(mut self, len: usize) -> Self {
        self.max_header_len = len;
        self
    }
}

impl Default for EslCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn find_block_end(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

fn content_length(headers: &std::collections::HashMap<String, String>) -> EslResult<usize> {
    match headers.get("Content-Length") {
        None => Ok(0),
        Some(value) => value.trim().parse::<usize>().map_err(|_| {
            EslError::protocol(format!("invalid Content-Length '{}'", value))
        }),
    }
}

impl Decoder for EslCodec {
    type Item = EslFrame;
    type Error = EslError;

    fn decode(&mut self, src: &mut BytesMut) -> EslResult<Option<EslFrame>> {
        match std::mem::replace(&mut self.state, DecodeState::Headers) {
            DecodeState::Headers => {
                // Stray separators between frames carry no information
                while src.first() == Some(&b'\n') {
                    src.advance(1);
                }

                let Some(end) = find_block_end(&src[..]) else {
                    if src.len() > self.max_header_len {
                        return Err(EslError::protocol(format!(
                            "header block exceeds {} bytes",
                            self.max_header_len
                        )));
                    }
                    return Ok(None);
                };

                let block = src.split_to(end + 2);
                let text = std::str::from_utf8(&block[..end])
                    .map_err(|e| EslError::protocol(format!("header block is not UTF-8: {}", e)))?;
                let headers = parse_header_block(text, false);
                if headers.is_empty() {
                    return Err(EslError::protocol("frame without headers"));
                }

                let len = content_length(&headers)?;
                if len == 0 {
                    return Ok(Some(EslFrame::new(headers, None)));
                }
                if len > self.max_body_len {
                    return Err(EslError::protocol(format!(
                        "body of {} bytes exceeds limit of {}",
                        len, self.max_body_len
                    )));
                }

                self.state = DecodeState::Body { headers, len };
                self.decode(src)
            }
            DecodeState::Body { headers, len } => {
                if src.len() < len {
                    src.reserve(len - src.len());
                    self.state = DecodeState::Body { headers, len };
                    return Ok(None);
                }
                let body = src.split_to(len);
                let body = String::from_utf8_lossy(&body).into_owned();
                Ok(Some(EslFrame::new(headers, Some(body))))
            }
        }
    }
}

impl Encoder<String> for EslCodec {
    type Error = EslError;

    fn encode(&mut self, command: String, dst: &mut BytesMut) -> EslResult<()> {
        let command = command.trim_end_matches('\n');
        if command.is_empty() {
            return Err(EslError::protocol("empty command"));
        }
        // An embedded blank line would let the tail run as a second command
        if command.contains("\n\n") {
            return Err(EslError::protocol("command contains an empty line"));
        }
        dst.reserve(command.len() + 2);
        dst.put_slice(command.as_bytes());
        dst.put_slice(b"\n\n");
        Ok(())
    }
}
