// Primitive wire codec.
//
// Encodes and decodes the protocol's primitive types over any
// `std::io::Read`/`Write` stream, independent of message semantics:
// - `UInt32`: 4 bytes, network byte order. `Time` is a `UInt32`.
// - Single bytes (tags, bit-fields of width 8, booleans).
// - Length-prefixed ASCII strings: `UInt32` length, then one byte per char.
// - Coordinates: 2 or 3 `UInt32`s depending on the negotiated variants.
//
// Writers never flush; message-level `send` helpers flush once per message.
//
// I/O errors (including end of stream in the middle of a value) surface as
// `ProtocolError::ConnectionLost`. Values that cannot be represented or read
// back surface as `ProtocolError::MalformedValue`.

use std::io::{self, Read, Write};

use crate::error::{ProtocolError, Result};
use crate::types::{Coordinate, Time, VariantFlags};

/// Longest string accepted on the wire. Protects against unbounded
/// allocation from a corrupt length prefix.
pub const MAX_STRING_LEN: u32 = 4096;

/// Length of the Terminate message.
pub const TERMINATE_LEN: usize = 5;

pub fn write_u8<W: Write>(writer: &mut W, value: u8) -> Result<()> {
    writer.write_all(&[value])?;
    Ok(())
}

pub fn read_u8<R: Read>(reader: &mut R) -> Result<u8> {
    let [b] = read_array::<_, 1>(reader)?;
    Ok(b)
}

pub fn write_u32<W: Write>(writer: &mut W, value: u32) -> Result<()> {
    writer.write_all(&value.to_be_bytes())?;
    Ok(())
}

pub fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    Ok(u32::from_be_bytes(read_array(reader)?))
}

pub fn read_array<R: Read, const N: usize>(reader: &mut R) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// Read a leading tag byte, returning `None` if the stream ended cleanly
/// before it.
pub fn read_tag<R: Read>(reader: &mut R) -> Result<Option<u8>> {
    let mut buf = [0u8; 1];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(buf[0])),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

pub fn write_time<W: Write>(writer: &mut W, time: Time) -> Result<()> {
    write_u32(writer, time.0)
}

pub fn read_time<R: Read>(reader: &mut R) -> Result<Time> {
    read_u32(reader).map(Time)
}

pub fn write_bool<W: Write>(writer: &mut W, value: bool) -> Result<()> {
    write_u8(writer, u8::from(value))
}

pub fn read_bool<R: Read>(reader: &mut R) -> Result<bool> {
    match read_u8(reader)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(ProtocolError::MalformedValue(format!(
            "boolean byte must be 0 or 1, got {other:#04x}"
        ))),
    }
}

/// Write a length-prefixed ASCII string.
pub fn write_string<W: Write>(writer: &mut W, value: &str) -> Result<()> {
    if !value.is_ascii() {
        return Err(ProtocolError::MalformedValue(format!(
            "string {value:?} is not ASCII"
        )));
    }
    let len = u32::try_from(value.len())
        .ok()
        .filter(|len| *len <= MAX_STRING_LEN)
        .ok_or_else(|| {
            ProtocolError::MalformedValue(format!(
                "string of {} bytes exceeds {MAX_STRING_LEN}",
                value.len()
            ))
        })?;
    write_u32(writer, len)?;
    writer.write_all(value.as_bytes())?;
    Ok(())
}

/// Read a length-prefixed ASCII string.
pub fn read_string<R: Read>(reader: &mut R) -> Result<String> {
    let len = read_u32(reader)?;
    if len > MAX_STRING_LEN {
        return Err(ProtocolError::MalformedValue(format!(
            "string length {len} exceeds {MAX_STRING_LEN}"
        )));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    if !buf.is_ascii() {
        return Err(ProtocolError::MalformedValue(
            "string contains non-ASCII bytes".into(),
        ));
    }
    // ASCII is valid UTF-8.
    String::from_utf8(buf).map_err(|e| ProtocolError::MalformedValue(e.to_string()))
}

/// Write a coordinate with 2 or 3 components depending on `variants`.
pub fn write_coordinate<W: Write>(
    writer: &mut W,
    pos: Coordinate,
    variants: VariantFlags,
) -> Result<()> {
    if !variants.three_dimensions() && pos.z != 0 {
        return Err(ProtocolError::MalformedValue(format!(
            "z = {} cannot be sent without THREE_DIMENSIONS",
            pos.z
        )));
    }
    write_u32(writer, pos.x)?;
    write_u32(writer, pos.y)?;
    if variants.three_dimensions() {
        write_u32(writer, pos.z)?;
    }
    Ok(())
}

pub fn read_coordinate<R: Read>(reader: &mut R, variants: VariantFlags) -> Result<Coordinate> {
    let x = read_u32(reader)?;
    let y = read_u32(reader)?;
    let z = if variants.three_dimensions() {
        read_u32(reader)?
    } else {
        0
    };
    Ok(Coordinate { x, y, z })
}

/// Read exactly `len` bytes of a server reply.
///
/// A reply can be pre-empted by the server's Terminate message. If the stream
/// ends after exactly `TERMINATE_LEN` zero bytes, that was a Terminate and
/// this returns `PeerTerminated`; any other short read is `ConnectionLost`.
pub fn read_reply_bytes<R: Read>(reader: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                if filled == TERMINATE_LEN && buf[..TERMINATE_LEN].iter().all(|b| *b == 0) {
                    return Err(ProtocolError::PeerTerminated);
                }
                return Err(ProtocolError::ConnectionLost(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("stream ended after {filled} of {len} reply bytes"),
                )));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    #[test]
    fn u32_is_network_byte_order() {
        let mut buf = Vec::new();
        write_u32(&mut buf, 0x0102_0304).unwrap();
        assert_eq!(buf, vec![1, 2, 3, 4]);
    }

    #[test]
    fn string_layout() {
        let mut buf = Vec::new();
        write_string(&mut buf, "walk").unwrap();
        assert_eq!(buf, vec![0, 0, 0, 4, b'w', b'a', b'l', b'k']);
    }

    #[test]
    fn rejects_non_ascii_write() {
        let mut buf = Vec::new();
        let err = write_string(&mut buf, "café").unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedValue(_)));
        assert!(buf.is_empty());
    }

    #[test]
    fn rejects_non_ascii_read() {
        let mut wire = vec![0, 0, 0, 2];
        wire.extend_from_slice(&[0xC3, 0xA9]);
        let err = read_string(&mut Cursor::new(wire)).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedValue(_)));
    }

    #[test]
    fn rejects_oversized_string_length() {
        let wire = (MAX_STRING_LEN + 1).to_be_bytes().to_vec();
        let err = read_string(&mut Cursor::new(wire)).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedValue(_)));
    }

    #[test]
    fn truncated_u32_is_connection_lost() {
        let err = read_u32(&mut Cursor::new(vec![0u8, 1])).unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionLost(_)));
    }

    #[test]
    fn bool_rejects_other_bytes() {
        assert!(read_bool(&mut Cursor::new(vec![1])).unwrap());
        assert!(!read_bool(&mut Cursor::new(vec![0])).unwrap());
        assert!(matches!(
            read_bool(&mut Cursor::new(vec![2])),
            Err(ProtocolError::MalformedValue(_))
        ));
    }

    #[test]
    fn flat_coordinate_refuses_z() {
        let mut buf = Vec::new();
        let err = write_coordinate(&mut buf, Coordinate::new(1, 2, 3), VariantFlags::NONE)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedValue(_)));
        // Nothing of the rejected coordinate reaches the writer.
        assert!(buf.is_empty());
    }

    #[test]
    fn read_tag_detects_clean_eof() {
        assert_eq!(read_tag(&mut Cursor::new(Vec::<u8>::new())).unwrap(), None);
        assert_eq!(read_tag(&mut Cursor::new(vec![7u8])).unwrap(), Some(7));
    }

    #[test]
    fn reply_preempted_by_terminate() {
        let err = read_reply_bytes(&mut Cursor::new(vec![0u8; 5]), 12).unwrap_err();
        assert!(matches!(err, ProtocolError::PeerTerminated));
    }

    #[test]
    fn short_reply_is_connection_lost() {
        let err = read_reply_bytes(&mut Cursor::new(vec![0u8, 0, 1, 0, 0, 9]), 12).unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionLost(_)));
    }

    proptest! {
        #[test]
        fn u32_roundtrip(v in any::<u32>()) {
            let mut buf = Vec::new();
            write_u32(&mut buf, v).unwrap();
            prop_assert_eq!(read_u32(&mut Cursor::new(buf)).unwrap(), v);
        }

        #[test]
        fn time_roundtrip(ms in any::<u32>()) {
            let mut buf = Vec::new();
            write_time(&mut buf, Time(ms)).unwrap();
            prop_assert_eq!(read_time(&mut Cursor::new(buf)).unwrap(), Time(ms));
        }

        #[test]
        fn coordinate2_roundtrip(x in any::<u32>(), y in any::<u32>()) {
            let pos = Coordinate::flat(x, y);
            let mut buf = Vec::new();
            write_coordinate(&mut buf, pos, VariantFlags::NONE).unwrap();
            prop_assert_eq!(buf.len(), 8);
            prop_assert_eq!(read_coordinate(&mut Cursor::new(buf), VariantFlags::NONE).unwrap(), pos);
        }

        #[test]
        fn coordinate3_roundtrip(x in any::<u32>(), y in any::<u32>(), z in any::<u32>()) {
            let pos = Coordinate::new(x, y, z);
            let flags = VariantFlags::THREE_DIMENSIONS;
            let mut buf = Vec::new();
            write_coordinate(&mut buf, pos, flags).unwrap();
            prop_assert_eq!(buf.len(), 12);
            prop_assert_eq!(read_coordinate(&mut Cursor::new(buf), flags).unwrap(), pos);
        }

        #[test]
        fn string_roundtrip(s in "[ -~]{0,64}") {
            let mut buf = Vec::new();
            write_string(&mut buf, &s).unwrap();
            prop_assert_eq!(read_string(&mut Cursor::new(buf)).unwrap(), s);
        }
    }
}
