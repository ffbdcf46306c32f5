//! Fixed-size header wrapped around every protocol payload.
//!
//! ```text
//! offset  size  field
//!      0     4  signature "CLSY"
//!      4     1  protocol version
//!      5     3  library version (major, minor, patch)
//!      8     4  body length
//!     12     1  message type
//!     13     3  reserved (zero)
//!     16     4  row count
//!     20     8  schema hash
//!     28     4  reserved (zero)
//! ```
//!
//! Integers are big-endian.

use crate::error::{ProtocolError, ProtocolResult};
use crate::messages::PROTOCOL_VERSION;

/// Signature at the start of every envelope.
pub const ENVELOPE_SIGNATURE: [u8; 4] = *b"CLSY";

/// Encoded header size.
pub const ENVELOPE_SIZE: usize = 32;

/// Version of this library, recorded in every envelope for diagnostics.
pub const LIBRARY_VERSION: [u8; 3] = [0, 1, 0];

/// Decoded envelope header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    /// Protocol version of the sender.
    pub protocol_version: u8,
    /// Library version of the sender.
    pub library_version: [u8; 3],
    /// Length of the body that follows the header.
    pub body_len: u32,
    /// Message type code.
    pub message_type: u8,
    /// Number of change rows in the body.
    pub row_count: u32,
    /// Sender's schema hash.
    pub schema_hash: u64,
}

impl Envelope {
    /// Prepends a header to `body`.
    ///
    /// # Errors
    ///
    /// Returns an error if `body` is longer than `u32::MAX` bytes.
    pub fn seal(
        message_type: u8,
        row_count: u32,
        schema_hash: u64,
        body: &[u8],
    ) -> ProtocolResult<Vec<u8>> {
        let body_len = u32::try_from(body.len()).map_err(|_| {
            ProtocolError::InvalidEnvelope(format!("body of {} bytes is too large", body.len()))
        })?;

        let mut buf = Vec::with_capacity(ENVELOPE_SIZE + body.len());
        buf.extend_from_slice(&ENVELOPE_SIGNATURE);
        buf.push(PROTOCOL_VERSION as u8);
        buf.extend_from_slice(&LIBRARY_VERSION);
        buf.extend_from_slice(&body_len.to_be_bytes());
        buf.push(message_type);
        buf.extend_from_slice(&[0; 3]);
        buf.extend_from_slice(&row_count.to_be_bytes());
        buf.extend_from_slice(&schema_hash.to_be_bytes());
        buf.extend_from_slice(&[0; 4]);
        buf.extend_from_slice(body);
        Ok(buf)
    }

    /// Splits `bytes` into header and body, validating the header.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidEnvelope`] on a short buffer, bad
    /// signature or length mismatch, and
    /// [`ProtocolError::UnsupportedVersion`] for a newer protocol.
    pub fn open(bytes: &[u8]) -> ProtocolResult<(Self, &[u8])> {
        if bytes.len() < ENVELOPE_SIZE {
            return Err(ProtocolError::InvalidEnvelope(format!(
                "need {ENVELOPE_SIZE} header bytes, got {}",
                bytes.len()
            )));
        }
        let (header, body) = bytes.split_at(ENVELOPE_SIZE);
        if header[0..4] != ENVELOPE_SIGNATURE {
            return Err(ProtocolError::InvalidEnvelope("bad signature".into()));
        }

        let protocol_version = header[4];
        if u16::from(protocol_version) > PROTOCOL_VERSION || protocol_version == 0 {
            return Err(ProtocolError::UnsupportedVersion(u16::from(protocol_version)));
        }

        let be_u32 = |at: usize| {
            u32::from_be_bytes([header[at], header[at + 1], header[at + 2], header[at + 3]])
        };
        let body_len = be_u32(8);
        if body_len as usize != body.len() {
            return Err(ProtocolError::InvalidEnvelope(format!(
                "header declares {body_len} body bytes, found {}",
                body.len()
            )));
        }

        let mut hash = [0u8; 8];
        hash.copy_from_slice(&header[20..28]);

        Ok((
            Self {
                protocol_version,
                library_version: [header[5], header[6], header[7]],
                body_len,
                message_type: header[12],
                row_count: be_u32(16),
                schema_hash: u64::from_be_bytes(hash),
            },
            body,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let bytes = Envelope::seal(5, 3, 0x0102_0304_0506_0708, b"body").unwrap();
        assert_eq!(bytes.len(), ENVELOPE_SIZE + 4);
        assert_eq!(&bytes[0..4], b"CLSY");
        assert_eq!(bytes[4], 1);
        assert_eq!(&bytes[8..12], &[0, 0, 0, 4]);
        assert_eq!(bytes[12], 5);
        assert_eq!(&bytes[16..20], &[0, 0, 0, 3]);
        assert_eq!(&bytes[20..28], &[1, 2, 3, 4, 5, 6, 7, 8]);

        let (envelope, body) = Envelope::open(&bytes).unwrap();
        assert_eq!(body, b"body");
        assert_eq!(envelope.library_version, LIBRARY_VERSION);
    }

    #[test]
    fn short_buffer() {
        assert!(matches!(
            Envelope::open(b"CLSY"),
            Err(ProtocolError::InvalidEnvelope(_))
        ));
    }

    #[test]
    fn wrong_signature() {
        let mut bytes = Envelope::seal(1, 0, 0, b"").unwrap();
        bytes[0] = b'X';
        assert!(Envelope::open(&bytes).is_err());
    }

    #[test]
    fn truncated_body() {
        let bytes = Envelope::seal(1, 0, 0, b"0123456789").unwrap();
        assert!(Envelope::open(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn newer_protocol_is_unsupported() {
        let mut bytes = Envelope::seal(1, 0, 0, b"").unwrap();
        bytes[4] = 9;
        assert_eq!(
            Envelope::open(&bytes).unwrap_err(),
            ProtocolError::UnsupportedVersion(9)
        );
    }
}
