//! Serverside value rendering for PRINT.
//!
//! Variables may carry a printf-like format specifier; when no PRINT
//! subscriber serves the variable, the engine renders the value itself.
//! One `%` conversion is honoured with optional zero-pad, width and
//! precision; literal text around it is preserved. Unsupported or
//! ill-formed specifiers fall back to the type default.
//!
//! Supported conversions: `d` `i` `u` `x` `X` `o` `f` `s`.

use var_protocol::VarValue;

#[derive(Debug, PartialEq)]
struct FormatSpec {
    prefix: String,
    zero_pad: bool,
    width: usize,
    precision: Option<usize>,
    conv: char,
    suffix: String,
}

fn parse_format(format: &str) -> Option<FormatSpec> {
    let percent = format.find('%')?;
    let prefix = format[..percent].to_string();
    let mut chars = format[percent + 1..].char_indices().peekable();

    let mut zero_pad = false;
    if let Some((_, '0')) = chars.peek() {
        zero_pad = true;
        chars.next();
    }
    let mut width = 0usize;
    while let Some((_, c)) = chars.peek() {
        let Some(digit) = c.to_digit(10) else { break };
        width = width * 10 + digit as usize;
        chars.next();
    }
    let mut precision = None;
    if let Some((_, '.')) = chars.peek() {
        chars.next();
        let mut p = 0usize;
        while let Some((_, c)) = chars.peek() {
            let Some(digit) = c.to_digit(10) else { break };
            p = p * 10 + digit as usize;
            chars.next();
        }
        precision = Some(p);
    }
    let (conv_pos, conv) = chars.next()?;
    if !matches!(conv, 'd' | 'i' | 'u' | 'x' | 'X' | 'o' | 'f' | 's') {
        return None;
    }
    let suffix = format[percent + 1 + conv_pos + conv.len_utf8()..].to_string();
    Some(FormatSpec {
        prefix,
        zero_pad,
        width,
        precision,
        conv,
        suffix,
    })
}

fn signed_of(value: &VarValue) -> Option<i64> {
    match value {
        VarValue::UInt16(v) => Some(i64::from(*v)),
        VarValue::Int16(v) => Some(i64::from(*v)),
        VarValue::UInt32(v) => Some(i64::from(*v)),
        VarValue::Int32(v) => Some(i64::from(*v)),
        VarValue::UInt64(v) => i64::try_from(*v).ok(),
        VarValue::Int64(v) => Some(*v),
        _ => None,
    }
}

fn unsigned_of(value: &VarValue) -> Option<u64> {
    match value {
        VarValue::UInt16(v) => Some(u64::from(*v)),
        VarValue::Int16(v) => Some(*v as u16 as u64),
        VarValue::UInt32(v) => Some(u64::from(*v)),
        VarValue::Int32(v) => Some(*v as u32 as u64),
        VarValue::UInt64(v) => Some(*v),
        VarValue::Int64(v) => Some(*v as u64),
        VarValue::Float(_) | VarValue::Str(_) | VarValue::Blob(_) => None,
    }
}

fn pad(body: String, spec: &FormatSpec) -> String {
    if body.len() >= spec.width {
        return body;
    }
    let fill = spec.width - body.len();
    if spec.zero_pad {
        // Keep a leading sign in front of the zeros
        if let Some(rest) = body.strip_prefix('-') {
            return format!("-{}{}", "0".repeat(fill), rest);
        }
        return format!("{}{}", "0".repeat(fill), body);
    }
    format!("{}{}", " ".repeat(fill), body)
}

fn apply(spec: &FormatSpec, value: &VarValue) -> Option<String> {
    let body = match spec.conv {
        'd' | 'i' => signed_of(value)?.to_string(),
        'u' => unsigned_of(value)?.to_string(),
        'x' => format!("{:x}", unsigned_of(value)?),
        'X' => format!("{:X}", unsigned_of(value)?),
        'o' => format!("{:o}", unsigned_of(value)?),
        'f' => match value {
            VarValue::Float(f) => {
                let precision = spec.precision.unwrap_or(6);
                format!("{f:.precision$}")
            }
            _ => return None,
        },
        's' => match value {
            VarValue::Str(s) => match spec.precision {
                Some(p) => s.chars().take(p).collect(),
                None => s.clone(),
            },
            _ => return None,
        },
        _ => return None,
    };
    Some(format!("{}{}{}", spec.prefix, pad(body, spec), spec.suffix))
}

/// The rendering used when no format specifier applies.
fn type_default(value: &VarValue) -> String {
    match value {
        VarValue::UInt16(v) => v.to_string(),
        VarValue::Int16(v) => v.to_string(),
        VarValue::UInt32(v) => v.to_string(),
        VarValue::Int32(v) => v.to_string(),
        VarValue::UInt64(v) => v.to_string(),
        VarValue::Int64(v) => v.to_string(),
        VarValue::Float(v) => format!("{v:.6}"),
        VarValue::Str(s) => s.clone(),
        VarValue::Blob(b) => {
            let mut out = String::with_capacity(b.len() * 2);
            for byte in b {
                out.push_str(&format!("{byte:02x}"));
            }
            out
        }
    }
}

/// Render a value with an optional format specifier.
#[must_use]
pub fn render_value(value: &VarValue, format: Option<&str>) -> String {
    format
        .and_then(parse_format)
        .and_then(|spec| apply(&spec, value))
        .unwrap_or_else(|| type_default(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_per_type() {
        assert_eq!(render_value(&VarValue::Int32(-7), None), "-7");
        assert_eq!(render_value(&VarValue::UInt64(9), None), "9");
        assert_eq!(render_value(&VarValue::Float(1.5), None), "1.500000");
        assert_eq!(render_value(&VarValue::Str("hi".into()), None), "hi");
        assert_eq!(
            render_value(&VarValue::Blob(vec![0xde, 0xad]), None),
            "dead"
        );
    }

    #[test]
    fn decimal_with_width() {
        assert_eq!(render_value(&VarValue::Int32(42), Some("%5d")), "   42");
        assert_eq!(render_value(&VarValue::Int32(42), Some("%05d")), "00042");
        assert_eq!(render_value(&VarValue::Int32(-42), Some("%05d")), "-0042");
    }

    #[test]
    fn hex_and_octal() {
        assert_eq!(render_value(&VarValue::UInt32(255), Some("%x")), "ff");
        assert_eq!(render_value(&VarValue::UInt32(255), Some("%04X")), "00FF");
        assert_eq!(render_value(&VarValue::UInt16(8), Some("%o")), "10");
    }

    #[test]
    fn float_precision() {
        assert_eq!(render_value(&VarValue::Float(1.5), Some("%.2f")), "1.50");
        assert_eq!(
            render_value(&VarValue::Float(1.5), Some("%8.2f")),
            "    1.50"
        );
    }

    #[test]
    fn strings_and_literal_text() {
        assert_eq!(
            render_value(&VarValue::Str("abcdef".into()), Some("%.3s")),
            "abc"
        );
        assert_eq!(
            render_value(&VarValue::Int32(21), Some("temp=%d C")),
            "temp=21 C"
        );
    }

    #[test]
    fn mismatched_specifier_falls_back() {
        // %d on a string cannot apply; the type default wins
        assert_eq!(render_value(&VarValue::Str("x".into()), Some("%d")), "x");
        assert_eq!(render_value(&VarValue::Int32(3), Some("%q")), "3");
        assert_eq!(render_value(&VarValue::Int32(3), Some("no specifier")), "3");
    }
}
