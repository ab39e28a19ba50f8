//! Symmetric encode/decode contract shared by every MAC wire format.

use bytes::{Bytes, BytesMut};

use crate::CodecError;

/// A value with a fixed big-endian layout on the air interface.
///
/// `serialize` must write exactly `serialized_size()` bytes, and
/// `deserialize` must consume exactly what `serialize` wrote.
pub trait WireFormat: Sized {
    fn serialized_size(&self) -> usize;

    fn serialize(&self, buf: &mut BytesMut);

    /// Decodes one value from the front of `buf`, advancing it past the consumed bytes.
    fn deserialize(buf: &mut &[u8]) -> Result<Self, CodecError>;

    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.serialized_size());
        self.serialize(&mut buf);
        buf.freeze()
    }

    /// Decodes from the start of `data` and reports how many bytes were consumed.
    fn decode_from(data: &[u8]) -> Result<(Self, usize), CodecError> {
        let mut cursor = data;
        let value = Self::deserialize(&mut cursor)?;
        Ok((value, data.len() - cursor.len()))
    }
}

pub(crate) fn ensure(buf: &[u8], needed: usize, what: &'static str) -> Result<(), CodecError> {
    if buf.len() < needed {
        return Err(CodecError::Truncated {
            what,
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

/// CRC-8 with polynomial x^8 + x^2 + x + 1, used as the MAC header check sequence.
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x07
            } else {
                crc << 1
            };
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc8_check_value() {
        assert_eq!(crc8(b"123456789"), 0xF4);
        assert_eq!(crc8(&[]), 0);
    }

    #[test]
    fn test_ensure_reports_shortfall() {
        let err = ensure(&[1, 2], 4, "header").unwrap_err();
        assert_eq!(
            err,
            CodecError::Truncated {
                what: "header",
                needed: 4,
                available: 2
            }
        );
    }
}
