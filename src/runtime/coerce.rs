//! Scalar coercions following the script runtime's rules.
//!
//! These mirror ECMAScript `ToNumber`, `ToBoolean` and `ToString` so that a
//! host reading a value sees what the script itself would see. None of them
//! modify the receiver.

use super::value::{Key, Value};

impl Value {
    /// Integer view: `ToNumber` truncated toward zero. `NaN` maps to `0` and
    /// out-of-range values saturate.
    pub fn to_long(&self) -> i64 {
        match self {
            Value::Long(long) => *long,
            Value::Bool(flag) => i64::from(*flag),
            other => other.to_double() as i64,
        }
    }

    pub fn to_double(&self) -> f64 {
        match self {
            Value::Null => 0.0,
            Value::Long(long) => *long as f64,
            Value::Double(double) => *double,
            Value::Bool(flag) => f64::from(u8::from(*flag)),
            Value::String(bytes) => string_to_number(bytes),
            Value::Array(_) | Value::Object(_) => string_to_number(&self.to_bytes()),
            Value::Map(_) => f64::NAN,
        }
    }

    pub fn to_bool(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Long(long) => *long != 0,
            Value::Double(double) => !(double.is_nan() || *double == 0.0),
            Value::Bool(flag) => *flag,
            Value::String(bytes) => !bytes.is_empty(),
            Value::Array(_) | Value::Map(_) | Value::Object(_) => true,
        }
    }

    /// Byte-string view.
    ///
    /// Arrays join their elements with `,` (null elements render empty), maps
    /// render as `[object Object]`, and objects use their captured string
    /// cast, or the empty string when the class has none.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Value::Null => b"null".to_vec(),
            Value::Long(long) => long.to_string().into_bytes(),
            Value::Double(double) => format_number(*double).into_bytes(),
            Value::Bool(flag) => flag.to_string().into_bytes(),
            Value::String(bytes) => bytes.clone(),
            Value::Array(items) => {
                let mut joined = Vec::new();
                for (position, item) in items.iter().enumerate() {
                    if position > 0 {
                        joined.push(b',');
                    }
                    if !item.is_null() {
                        joined.extend(item.to_bytes());
                    }
                }
                joined
            }
            Value::Map(_) => b"[object Object]".to_vec(),
            Value::Object(object) => object.string_cast.clone().unwrap_or_default(),
        }
    }

    /// Lossy UTF-8 rendering of [`Value::to_bytes`].
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.to_bytes()).into_owned()
    }

    /// Key view used when the value indexes a container.
    pub fn to_key(&self) -> Key {
        match self {
            Value::Long(long) => Key::Int(*long),
            other => Key::parse(&other.to_string_lossy()),
        }
    }
}

/// ECMAScript `StringToNumber`.
pub fn string_to_number(bytes: &[u8]) -> f64 {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim_matches(is_js_whitespace);
    if text.is_empty() {
        return 0.0;
    }

    let radix = |digits: &str, base: u32| -> f64 {
        if digits.is_empty() {
            return f64::NAN;
        }
        digits.chars().try_fold(0.0_f64, |total, c| {
            c.to_digit(base).map(|digit| total * f64::from(base) + f64::from(digit))
        })
        .unwrap_or(f64::NAN)
    };

    match text.get(..2) {
        Some("0x") | Some("0X") => return radix(&text[2..], 16),
        Some("0o") | Some("0O") => return radix(&text[2..], 8),
        Some("0b") | Some("0B") => return radix(&text[2..], 2),
        _ => {}
    }

    match text {
        "Infinity" | "+Infinity" => return f64::INFINITY,
        "-Infinity" => return f64::NEG_INFINITY,
        _ => {}
    }

    let decimal = text
        .bytes()
        .all(|b| b.is_ascii_digit() || matches!(b, b'+' | b'-' | b'.' | b'e' | b'E'));
    if decimal {
        text.parse().unwrap_or(f64::NAN)
    } else {
        f64::NAN
    }
}

fn is_js_whitespace(c: char) -> bool {
    c.is_whitespace() || c == '\u{feff}'
}

/// ECMAScript `Number::toString` with radix 10.
pub fn format_number(number: f64) -> String {
    if number.is_nan() {
        return "NaN".to_string();
    }
    if number == 0.0 {
        return "0".to_string();
    }
    if number.is_infinite() {
        return if number > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }

    let sign = if number < 0.0 { "-" } else { "" };
    // shortest round-trip digits, e.g. "1.2345e3"
    let scientific = format!("{:e}", number.abs());
    let (mantissa, exponent) = scientific
        .split_once('e')
        .unwrap_or((scientific.as_str(), "0"));
    let digits: String = mantissa.chars().filter(char::is_ascii_digit).collect();
    let k = digits.len() as i32;
    let n = exponent.parse::<i32>().unwrap_or(0) + 1;

    let body = if k <= n && n <= 21 {
        format!("{digits}{}", "0".repeat((n - k) as usize))
    } else if 0 < n && n <= 21 {
        let (int_part, frac_part) = digits.split_at(n as usize);
        format!("{int_part}.{frac_part}")
    } else if -6 < n && n <= 0 {
        format!("0.{}{digits}", "0".repeat((-n) as usize))
    } else {
        let exp = n - 1;
        let exp_sign = if exp < 0 { "-" } else { "+" };
        let (first, rest) = digits.split_at(1);
        if rest.is_empty() {
            format!("{first}e{exp_sign}{}", exp.abs())
        } else {
            format!("{first}.{rest}e{exp_sign}{}", exp.abs())
        }
    };
    format!("{sign}{body}")
}
