//! VarInt encoding (LEB128) for compact integer representation.
//!
//! Lengths and layer indices on the wire are varints. Signed values go
//! through zigzag first so small negatives stay short.

use crate::error::{OffloadError, Result};

/// Append an unsigned varint to `buf`.
pub fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80; // continuation
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Read an unsigned varint from a byte slice, returning (value, bytes_consumed)
pub fn read_varint(data: &[u8]) -> Result<(u64, usize)> {
    let mut result: u64 = 0;
    let mut shift = 0;
    let mut pos = 0;

    loop {
        let byte = *data.get(pos).ok_or_else(|| {
            OffloadError::InvalidMessage("VarInt: unexpected end of data".to_string())
        })?;
        pos += 1;

        result |= ((byte & 0x7F) as u64) << shift;

        if byte & 0x80 == 0 {
            break;
        }

        shift += 7;
        if shift >= 64 {
            return Err(OffloadError::InvalidMessage("VarInt overflow".to_string()));
        }
    }

    Ok((result, pos))
}

/// Zigzag-encode a signed 32-bit value.
pub fn zigzag_encode(value: i32) -> u64 {
    ((value << 1) ^ (value >> 31)) as u32 as u64
}

/// Decode a zigzag value back to i32.
pub fn zigzag_decode(value: u64) -> Result<i32> {
    let v = u32::try_from(value)
        .map_err(|_| OffloadError::InvalidMessage(format!("Zigzag value out of range: {value}")))?;
    Ok(((v >> 1) as i32) ^ -((v & 1) as i32))
}
