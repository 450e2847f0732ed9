//! ULEB128 framing used by the tag-info file formats.

use std::io::{Read, Write};

/// Writes `value` in unsigned LEB128: seven payload bits per byte, high bit
/// set on every byte but the last.
pub fn write_uleb<W: Write>(writer: &mut W, mut value: u64) -> std::io::Result<()> {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        writer.write_all(&[byte])?;
        if value == 0 {
            return Ok(());
        }
    }
}

/// Reads one ULEB128 value.
///
/// Fails with `UnexpectedEof` on a truncated encoding and with `InvalidData`
/// if the encoding does not fit 64 bits.
pub fn read_uleb<R: Read>(reader: &mut R) -> std::io::Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let mut buf = [0u8; 1];
        reader.read_exact(&mut buf)?;
        let byte = buf[0];
        if shift > 63 || (shift == 63 && byte & 0x7F > 1) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "ULEB128 value overflows 64 bits",
            ));
        }
        value |= u64::from(byte & 0x7F) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
}

/// Reads one ULEB128 value, mapping a clean end-of-stream before the first
/// byte to `None`. Used to detect the end of headerless entry streams.
pub fn read_uleb_or_eof<R: Read>(reader: &mut R) -> std::io::Result<Option<u64>> {
    let mut buf = [0u8; 1];
    match reader.read(&mut buf)? {
        0 => return Ok(None),
        _ => {}
    }
    let byte = buf[0];
    if byte & 0x80 == 0 {
        return Ok(Some(u64::from(byte)));
    }
    let rest = read_uleb(reader)?;
    rest.checked_shl(7)
        .filter(|shifted| shifted >> 7 == rest)
        .map(|shifted| shifted | u64::from(byte & 0x7F))
        .map(Some)
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "ULEB128 value overflows 64 bits",
            )
        })
}
