//! Response payload shapes shared by server and client.
//!
//! GET_ALIASES answers with a handle list; GET_FIRST and GET_NEXT answer
//! with one iteration item (the variable's name and current value).

use crate::err::WireError;
use crate::handle::VarHandle;
use crate::value::VarValue;

pub fn encode_aliases(handles: &[VarHandle], out: &mut Vec<u8>) {
    out.extend_from_slice(&(handles.len() as u16).to_le_bytes());
    for handle in handles {
        out.extend_from_slice(&handle.id().to_le_bytes());
    }
}

pub fn decode_aliases(buf: &[u8]) -> Result<Vec<VarHandle>, WireError> {
    let count = buf
        .get(..2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]) as usize)
        .ok_or(WireError::Truncated)?;
    if buf.len() != 2 + count * 4 {
        return Err(WireError::BadPayload("alias list length"));
    }
    let mut handles = Vec::with_capacity(count);
    for i in 0..count {
        let off = 2 + i * 4;
        let id = u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]);
        handles.push(VarHandle::new(id));
    }
    Ok(handles)
}

pub fn encode_iteration_item(name: &str, value: &VarValue, out: &mut Vec<u8>) {
    out.extend_from_slice(&(name.len() as u16).to_le_bytes());
    out.extend_from_slice(name.as_bytes());
    value.encode(out);
}

pub fn decode_iteration_item(buf: &[u8]) -> Result<(String, VarValue), WireError> {
    let name_len = buf
        .get(..2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]) as usize)
        .ok_or(WireError::Truncated)?;
    let name_bytes = buf.get(2..2 + name_len).ok_or(WireError::Truncated)?;
    let name = std::str::from_utf8(name_bytes)
        .map_err(|_| WireError::BadUtf8)?
        .to_string();
    let (value, consumed) = VarValue::decode(&buf[2 + name_len..])?;
    if 2 + name_len + consumed != buf.len() {
        return Err(WireError::BadPayload("trailing bytes after item"));
    }
    Ok((name, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_round_trip() {
        let handles = vec![VarHandle::new(1), VarHandle::new(9)];
        let mut out = Vec::new();
        encode_aliases(&handles, &mut out);
        assert_eq!(decode_aliases(&out).unwrap(), handles);
        assert!(decode_aliases(&out[..out.len() - 1]).is_err());
    }

    #[test]
    fn iteration_item_round_trips() {
        let mut out = Vec::new();
        encode_iteration_item("/sys/temp", &VarValue::Float(20.5), &mut out);
        let (name, value) = decode_iteration_item(&out).unwrap();
        assert_eq!(name, "/sys/temp");
        assert_eq!(value, VarValue::Float(20.5));
    }
}
