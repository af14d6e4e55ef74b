// All network decoding and encoding in the frame and merkle layers is
// done with the primitives in this file. It has to be very correct.
//
// Decoders take a buffer and a cursor and either advance the cursor or
// fail with a BadDecode naming the field and position. BadDecode is
// deliberately its own type rather than the general error: the session
// reacts to it specifically (it poisons the stream).

use tideway_base::{Id, ID_LEN};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BadDecode(pub String);

pub type DecodeResult<T> = std::result::Result<T, BadDecode>;

impl std::fmt::Display for BadDecode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "decode error: {}", self.0)
    }
}

impl std::error::Error for BadDecode {}

pub fn require_bytes(buf: &[u8], pos: usize, len: usize, name: &str) -> DecodeResult<()> {
    if buf.len() < pos + len {
        return Err(BadDecode(format!(
            "need {} bytes to decode {} at {}, only have {}",
            len,
            name,
            pos,
            buf.len().saturating_sub(pos)
        )));
    }
    Ok(())
}

pub fn require_end(buf: &[u8], pos: usize, name: &str) -> DecodeResult<()> {
    if buf.len() != pos {
        return Err(BadDecode(format!(
            "expected {} to end at {}, have {} bytes",
            name,
            pos,
            buf.len()
        )));
    }
    Ok(())
}

pub fn extract_u8(buf: &[u8], pos: &mut usize, name: &str) -> DecodeResult<u8> {
    require_bytes(buf, *pos, 1, name)?;
    let b = buf[*pos];
    *pos += 1;
    Ok(b)
}

pub fn extract_bytes<'a>(
    buf: &'a [u8],
    pos: &mut usize,
    len: usize,
    name: &str,
) -> DecodeResult<&'a [u8]> {
    require_bytes(buf, *pos, len, name)?;
    let out = &buf[*pos..*pos + len];
    *pos += len;
    Ok(out)
}

pub fn extract_id(buf: &[u8], pos: &mut usize, name: &str) -> DecodeResult<Id> {
    let bytes = extract_bytes(buf, pos, ID_LEN, name)?;
    Ok(Id::from_slice(bytes).expect("fixed-width id"))
}

/// Standard unsigned LEB128. Fails if the value would not fit in 64
/// bits; running out of buffer is an ordinary short read.
pub fn extract_uleb128(buf: &[u8], pos: &mut usize, name: &str) -> DecodeResult<u64> {
    let mut val: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = extract_u8(buf, pos, name)?;
        if shift == 63 && byte > 1 {
            return Err(BadDecode(format!("uleb128 value for {} overflows", name)));
        }
        val |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(val);
        }
        shift += 7;
        if shift > 63 {
            return Err(BadDecode(format!("uleb128 value for {} overflows", name)));
        }
    }
}

pub fn extract_len_prefixed(
    buf: &[u8],
    pos: &mut usize,
    max: usize,
    name: &str,
) -> DecodeResult<Vec<u8>> {
    let len = extract_uleb128(buf, pos, name)?;
    if len > max as u64 {
        return Err(BadDecode(format!(
            "{} of {} bytes exceeds limit {}",
            name, len, max
        )));
    }
    Ok(extract_bytes(buf, pos, len as usize, name)?.to_vec())
}

pub fn extract_utf8_prefixed(
    buf: &[u8],
    pos: &mut usize,
    max: usize,
    name: &str,
) -> DecodeResult<String> {
    let bytes = extract_len_prefixed(buf, pos, max, name)?;
    String::from_utf8(bytes).map_err(|_| BadDecode(format!("{} is not valid utf8", name)))
}

pub fn write_uleb128(out: &mut Vec<u8>, mut val: u64) {
    loop {
        let mut byte = (val & 0x7f) as u8;
        val >>= 7;
        if val != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if val == 0 {
            return;
        }
    }
}

pub fn write_len_prefixed(out: &mut Vec<u8>, bytes: &[u8]) {
    write_uleb128(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}
