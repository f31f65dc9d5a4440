//! Typed variable values and their binary codec.
//!
//! A value is a tagged variant: scalars are stored inline, strings and
//! blobs own their buffer. On the wire a value is a one-byte type tag
//! followed by the little-endian scalar, or by a `u32` length and the
//! bytes for STR and BLOB.

use serde::{Deserialize, Serialize};

use crate::err::{VarErr, WireError};

/// Wire type tags, in codec-table order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum VarType {
    Invalid = 0,
    UInt16 = 1,
    Int16 = 2,
    UInt32 = 3,
    Int32 = 4,
    UInt64 = 5,
    Int64 = 6,
    Float = 7,
    Str = 8,
    Blob = 9,
    EndMarker = 10,
}

impl VarType {
    #[must_use]
    pub fn tag(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Invalid),
            1 => Some(Self::UInt16),
            2 => Some(Self::Int16),
            3 => Some(Self::UInt32),
            4 => Some(Self::Int32),
            5 => Some(Self::UInt64),
            6 => Some(Self::Int64),
            7 => Some(Self::Float),
            8 => Some(Self::Str),
            9 => Some(Self::Blob),
            10 => Some(Self::EndMarker),
            _ => None,
        }
    }
}

/// A variable's value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum VarValue {
    UInt16(u16),
    Int16(i16),
    UInt32(u32),
    Int32(i32),
    UInt64(u64),
    Int64(i64),
    Float(f32),
    Str(String),
    Blob(Vec<u8>),
}

impl VarValue {
    #[must_use]
    pub fn var_type(&self) -> VarType {
        match self {
            Self::UInt16(_) => VarType::UInt16,
            Self::Int16(_) => VarType::Int16,
            Self::UInt32(_) => VarType::UInt32,
            Self::Int32(_) => VarType::Int32,
            Self::UInt64(_) => VarType::UInt64,
            Self::Int64(_) => VarType::Int64,
            Self::Float(_) => VarType::Float,
            Self::Str(_) => VarType::Str,
            Self::Blob(_) => VarType::Blob,
        }
    }

    /// The zero value for a type; `None` for non-value tags.
    #[must_use]
    pub fn default_for(ty: VarType) -> Option<VarValue> {
        match ty {
            VarType::UInt16 => Some(Self::UInt16(0)),
            VarType::Int16 => Some(Self::Int16(0)),
            VarType::UInt32 => Some(Self::UInt32(0)),
            VarType::Int32 => Some(Self::Int32(0)),
            VarType::UInt64 => Some(Self::UInt64(0)),
            VarType::Int64 => Some(Self::Int64(0)),
            VarType::Float => Some(Self::Float(0.0)),
            VarType::Str => Some(Self::Str(String::new())),
            VarType::Blob => Some(Self::Blob(Vec::new())),
            VarType::Invalid | VarType::EndMarker => None,
        }
    }

    /// Length as reported by the LENGTH operation: payload bytes for
    /// strings and blobs, scalar width otherwise.
    #[must_use]
    pub fn length(&self) -> usize {
        match self {
            Self::UInt16(_) | Self::Int16(_) => 2,
            Self::UInt32(_) | Self::Int32(_) | Self::Float(_) => 4,
            Self::UInt64(_) | Self::Int64(_) => 8,
            Self::Str(s) => s.len(),
            Self::Blob(b) => b.len(),
        }
    }

    /// Bytes this value takes on the wire, tag included.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Str(_) | Self::Blob(_) => 1 + 4 + self.length(),
            _ => 1 + self.length(),
        }
    }

    /// Append the wire form to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.var_type().tag());
        match self {
            Self::UInt16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Int16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::UInt32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Int32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::UInt64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Int64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Float(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Str(s) => {
                out.extend_from_slice(&(s.len() as u32).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            Self::Blob(b) => {
                out.extend_from_slice(&(b.len() as u32).to_le_bytes());
                out.extend_from_slice(b);
            }
        }
    }

    /// Shorthand for encoding into a fresh buffer.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode(&mut out);
        out
    }

    /// Decode one value from the front of `buf`. Returns the value and
    /// the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(VarValue, usize), WireError> {
        let tag = *buf.first().ok_or(WireError::Truncated)?;
        let ty = VarType::from_tag(tag).ok_or(WireError::BadTag(tag))?;
        let rest = &buf[1..];
        let scalar = |n: usize| -> Result<&[u8], WireError> {
            rest.get(..n).ok_or(WireError::Truncated)
        };
        match ty {
            VarType::UInt16 => {
                let b = scalar(2)?;
                Ok((Self::UInt16(u16::from_le_bytes([b[0], b[1]])), 3))
            }
            VarType::Int16 => {
                let b = scalar(2)?;
                Ok((Self::Int16(i16::from_le_bytes([b[0], b[1]])), 3))
            }
            VarType::UInt32 => {
                let b = scalar(4)?;
                Ok((Self::UInt32(u32::from_le_bytes([b[0], b[1], b[2], b[3]])), 5))
            }
            VarType::Int32 => {
                let b = scalar(4)?;
                Ok((Self::Int32(i32::from_le_bytes([b[0], b[1], b[2], b[3]])), 5))
            }
            VarType::Float => {
                let b = scalar(4)?;
                Ok((Self::Float(f32::from_le_bytes([b[0], b[1], b[2], b[3]])), 5))
            }
            VarType::UInt64 => {
                let b = scalar(8)?;
                let mut w = [0u8; 8];
                w.copy_from_slice(b);
                Ok((Self::UInt64(u64::from_le_bytes(w)), 9))
            }
            VarType::Int64 => {
                let b = scalar(8)?;
                let mut w = [0u8; 8];
                w.copy_from_slice(b);
                Ok((Self::Int64(i64::from_le_bytes(w)), 9))
            }
            VarType::Str | VarType::Blob => {
                let b = scalar(4)?;
                let len = u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize;
                let data = rest.get(4..4 + len).ok_or(WireError::Truncated)?;
                let consumed = 1 + 4 + len;
                if ty == VarType::Str {
                    let s = std::str::from_utf8(data).map_err(|_| WireError::BadUtf8)?;
                    Ok((Self::Str(s.to_string()), consumed))
                } else {
                    Ok((Self::Blob(data.to_vec()), consumed))
                }
            }
            VarType::Invalid | VarType::EndMarker => Err(WireError::BadTag(tag)),
        }
    }

    /// Convert to the storage type of a variable.
    ///
    /// Integer-to-integer conversions succeed when the value fits
    /// (`ERANGE` otherwise), any integer widens to float, and everything
    /// else requires an exact type match (`ENOTSUP`).
    pub fn convert_to(&self, ty: VarType) -> Result<VarValue, VarErr> {
        if self.var_type() == ty {
            return Ok(self.clone());
        }
        let as_i128 = |v: &VarValue| -> Option<i128> {
            match v {
                Self::UInt16(x) => Some(i128::from(*x)),
                Self::Int16(x) => Some(i128::from(*x)),
                Self::UInt32(x) => Some(i128::from(*x)),
                Self::Int32(x) => Some(i128::from(*x)),
                Self::UInt64(x) => Some(i128::from(*x)),
                Self::Int64(x) => Some(i128::from(*x)),
                _ => None,
            }
        };
        let Some(n) = as_i128(self) else {
            return Err(VarErr::NotSup);
        };
        match ty {
            VarType::UInt16 => u16::try_from(n).map(Self::UInt16).map_err(|_| VarErr::Range),
            VarType::Int16 => i16::try_from(n).map(Self::Int16).map_err(|_| VarErr::Range),
            VarType::UInt32 => u32::try_from(n).map(Self::UInt32).map_err(|_| VarErr::Range),
            VarType::Int32 => i32::try_from(n).map(Self::Int32).map_err(|_| VarErr::Range),
            VarType::UInt64 => u64::try_from(n).map(Self::UInt64).map_err(|_| VarErr::Range),
            VarType::Int64 => i64::try_from(n).map(Self::Int64).map_err(|_| VarErr::Range),
            #[allow(clippy::cast_precision_loss)]
            VarType::Float => Ok(Self::Float(n as f32)),
            _ => Err(VarErr::NotSup),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_round_trip() {
        for value in [
            VarValue::UInt16(7),
            VarValue::Int16(-7),
            VarValue::UInt32(70_000),
            VarValue::Int32(-70_000),
            VarValue::UInt64(1 << 40),
            VarValue::Int64(-(1 << 40)),
            VarValue::Float(1.5),
        ] {
            let bytes = value.to_bytes();
            let (decoded, consumed) = VarValue::decode(&bytes).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(consumed, bytes.len());
        }
    }

    #[test]
    fn string_and_blob_round_trip() {
        let s = VarValue::Str("hello".to_string());
        let b = VarValue::Blob(vec![0, 1, 2, 255]);
        for value in [s, b] {
            let bytes = value.to_bytes();
            let (decoded, consumed) = VarValue::decode(&bytes).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(consumed, bytes.len());
        }
    }

    #[test]
    fn truncated_input_is_rejected() {
        let bytes = VarValue::Str("hello".to_string()).to_bytes();
        assert_eq!(
            VarValue::decode(&bytes[..bytes.len() - 1]),
            Err(WireError::Truncated)
        );
        assert_eq!(VarValue::decode(&[]), Err(WireError::Truncated));
    }

    #[test]
    fn invalid_tag_is_rejected() {
        assert_eq!(VarValue::decode(&[200]), Err(WireError::BadTag(200)));
        assert_eq!(VarValue::decode(&[0]), Err(WireError::BadTag(0)));
    }

    #[test]
    fn utf8_is_enforced_for_strings() {
        let mut bytes = vec![VarType::Str.tag()];
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&[0xff, 0xfe]);
        assert_eq!(VarValue::decode(&bytes), Err(WireError::BadUtf8));
    }

    #[test]
    fn integer_conversion_checks_range() {
        let v = VarValue::Int32(-1);
        assert_eq!(v.convert_to(VarType::Int64), Ok(VarValue::Int64(-1)));
        assert_eq!(v.convert_to(VarType::UInt16), Err(VarErr::Range));
        assert_eq!(
            VarValue::UInt16(9).convert_to(VarType::Int32),
            Ok(VarValue::Int32(9))
        );
    }

    #[test]
    fn cross_class_conversion_is_refused() {
        let s = VarValue::Str("9".to_string());
        assert_eq!(s.convert_to(VarType::Int32), Err(VarErr::NotSup));
        assert_eq!(
            VarValue::Int32(1).convert_to(VarType::Blob),
            Err(VarErr::NotSup)
        );
    }
}
