//! Event-socket wire protocol
//!
//! The switch speaks a line-oriented text protocol. Every message is a block
//! of `Name: Value` header lines terminated by an empty line, optionally
//! followed by a body whose size is given by `Content-Length`:
//!
//! ```text
//! Content-Type: api/response
//! Content-Length: 14
//!
//! +OK accepted\n
//! ```
//!
//! Events (`text/event-plain`) nest a second header block inside the body;
//! their values are percent-encoded. [`EslCodec`] does the outer framing,
//! [`EslEvent`] parses the inner block.

pub mod codec;
pub mod event;
pub mod frame;

pub use codec::EslCodec;
pub use event::{names, EslEvent};
pub use frame::{ContentType, EslFrame};

/// Build the header map for one header block.
///
/// Lines without a `:` separator are skipped. When `decode` is set, values
/// are percent-decoded (event bodies), otherwise kept verbatim (outer frames).
pub(crate) fn parse_header_block(
    block: &str,
    decode: bool,
) -> std::collections::HashMap<String, String> {
    let mut headers = std::collections::HashMap::new();
    for line in block.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            tracing::trace!(line, "Skipping header line without separator");
            continue;
        };
        let value = value.trim_start();
        let value = if decode {
            percent_encoding::percent_decode_str(value)
                .decode_utf8_lossy()
                .into_owned()
        } else {
            value.to_string()
        };
        headers.insert(name.trim().to_string(), value);
    }
    headers
}
