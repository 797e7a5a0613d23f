//! Minecraft VarInt: 7-bit little-endian groups with a continuation high
//! bit, at most five bytes.

use super::ProbeError;

/// Append a VarInt encoding of `value`.
pub fn write_varint(buf: &mut Vec<u8>, mut value: u32) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Append a VarInt-length-prefixed UTF-8 string.
pub fn write_string(buf: &mut Vec<u8>, s: &str) {
    write_varint(buf, s.len() as u32);
    buf.extend_from_slice(s.as_bytes());
}

/// Decode a VarInt from the front of `buf`, returning the value and the
/// number of bytes consumed. `None` means the buffer ends mid-encoding and
/// more bytes are needed. A continuation bit on the fifth byte is a framing
/// error.
pub fn read_varint(buf: &[u8]) -> Result<Option<(u32, usize)>, ProbeError> {
    let mut result: u32 = 0;
    for (i, &byte) in buf.iter().enumerate() {
        if i >= 5 {
            return Err(ProbeError::Framing("varint exceeds five bytes".into()));
        }
        result |= u32::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((result, i + 1)));
        }
    }
    if buf.len() >= 5 {
        return Err(ProbeError::Framing("varint exceeds five bytes".into()));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: u32) -> u32 {
        let mut buf = Vec::new();
        write_varint(&mut buf, value);
        let (decoded, consumed) = read_varint(&buf).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        decoded
    }

    #[test]
    fn test_round_trip() {
        for value in [0, 1, 127, 128, 255, 300, 25565, 2097151, 0x0FFF_FFFF, u32::MAX] {
            assert_eq!(round_trip(value), value);
        }
    }

    #[test]
    fn test_known_encodings() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 0);
        assert_eq!(buf, [0x00]);

        buf.clear();
        write_varint(&mut buf, 255);
        assert_eq!(buf, [0xFF, 0x01]);

        buf.clear();
        write_varint(&mut buf, 25565);
        assert_eq!(buf, [0xDD, 0xC7, 0x01]);
    }

    #[test]
    fn test_decode_four_byte_maximum() {
        let (value, consumed) = read_varint(&[0xFF, 0xFF, 0xFF, 0x7F]).unwrap().unwrap();
        assert_eq!(value, 0x0FFF_FFFF); // 268,435,455
        assert_eq!(consumed, 4);
    }

    #[test]
    fn test_decode_five_byte_maximum() {
        let (value, consumed) = read_varint(&[0xFF, 0xFF, 0xFF, 0xFF, 0x7F])
            .unwrap()
            .unwrap();
        // bits beyond 32 fall off the top; the low 32 survive
        assert_eq!(value, u32::MAX);
        assert_eq!(consumed, 5);
    }

    #[test]
    fn test_sixth_continuation_is_framing_error() {
        let result = read_varint(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]);
        assert!(matches!(result, Err(ProbeError::Framing(_))));

        // even without the sixth byte present, five continuations are fatal
        let result = read_varint(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert!(matches!(result, Err(ProbeError::Framing(_))));
    }

    #[test]
    fn test_partial_input_needs_more_bytes() {
        assert!(read_varint(&[]).unwrap().is_none());
        assert!(read_varint(&[0xFF]).unwrap().is_none());
        assert!(read_varint(&[0xFF, 0xFF, 0xFF]).unwrap().is_none());
    }

    #[test]
    fn test_write_string() {
        let mut buf = Vec::new();
        write_string(&mut buf, "mc.example.org");
        assert_eq!(buf[0], 14);
        assert_eq!(&buf[1..], b"mc.example.org");
    }
}
