//! printf-style rendering of item values for the FORMATTED value type.

use crate::error::{Error, Result};
use crate::value::Value;

#[derive(Debug, Default, Clone, Copy)]
struct Directive {
    left: bool,
    zero: bool,
    plus: bool,
    space: bool,
    alternate: bool,
    width: Option<usize>,
    precision: Option<usize>,
    conversion: char,
}

/// Renders `value` through a printf-style format string.
///
/// Supports the flags `-0+ #`, width, precision and the conversions
/// `d i u x X o b f F e E g G s c %`. Literal text around the conversion is
/// kept. A value of the wrong kind for its conversion is coerced when that
/// is lossless enough (integers print through `%f`, floats truncate
/// through `%d`) and is an error otherwise.
pub fn format_value(format: &str, value: &Value) -> Result<String> {
    let mut out = String::new();
    let mut chars = format.chars().peekable();
    let mut consumed = false;

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'%') {
            chars.next();
            out.push('%');
            continue;
        }
        let mut directive = Directive::default();
        while let Some(&flag) = chars.peek() {
            match flag {
                '-' => directive.left = true,
                '0' => directive.zero = true,
                '+' => directive.plus = true,
                ' ' => directive.space = true,
                '#' => directive.alternate = true,
                _ => break,
            }
            chars.next();
        }
        directive.width = take_number(&mut chars);
        if chars.peek() == Some(&'.') {
            chars.next();
            directive.precision = Some(take_number(&mut chars).unwrap_or(0));
        }
        // length modifiers carry no meaning here
        while matches!(chars.peek(), Some('l' | 'h' | 'q' | 'L')) {
            chars.next();
        }
        directive.conversion = chars
            .next()
            .ok_or_else(|| bad_format(format, "incomplete conversion"))?;
        if consumed {
            return Err(bad_format(format, "only one value conversion is supported"));
        }
        consumed = true;
        out.push_str(&render(format, &directive, value)?);
    }
    Ok(out)
}

fn take_number(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Option<usize> {
    let mut digits = String::new();
    while let Some(&c) = chars.peek() {
        if !c.is_ascii_digit() {
            break;
        }
        digits.push(c);
        chars.next();
    }
    digits.parse().ok()
}

fn bad_format(format: &str, details: &str) -> Error {
    Error::invalid_value("FORMAT_STRING", format!("'{}': {}", format, details))
}

fn render(format: &str, directive: &Directive, value: &Value) -> Result<String> {
    let (sign, body) = match directive.conversion {
        'd' | 'i' | 'u' => {
            let v = integer(format, value)?;
            let digits = v.unsigned_abs().to_string();
            (sign_of(directive, v < 0), apply_int_precision(directive, digits))
        }
        'x' | 'X' | 'o' | 'b' => {
            let v = integer(format, value)?;
            // negative numbers print as their 64-bit two's complement pattern
            let bits = if v < 0 { v as i64 as u64 as u128 } else { v as u128 };
            let mut digits = match directive.conversion {
                'x' => format!("{:x}", bits),
                'X' => format!("{:X}", bits),
                'o' => format!("{:o}", bits),
                _ => format!("{:b}", bits),
            };
            digits = apply_int_precision(directive, digits);
            if directive.alternate && bits != 0 {
                let prefix = match directive.conversion {
                    'x' => "0x",
                    'X' => "0X",
                    'o' => "0",
                    _ => "0b",
                };
                digits.insert_str(0, prefix);
            }
            (String::new(), digits)
        }
        'f' | 'F' | 'e' | 'E' | 'g' | 'G' => {
            let v = value
                .to_float()
                .map_err(|_| bad_format(format, &format!("cannot format {} as a float", value.type_name())))?;
            let negative = v.is_sign_negative() && v != 0.0;
            (sign_of(directive, negative), float_body(directive, v.abs()))
        }
        's' => {
            let mut text = value.to_string();
            if let Some(precision) = directive.precision {
                text = text.chars().take(precision).collect();
            }
            (String::new(), text)
        }
        'c' => {
            let text = match value {
                Value::String(s) => s.chars().next().map(String::from).unwrap_or_default(),
                other => {
                    let code = integer(format, other)?;
                    u32::try_from(code)
                        .ok()
                        .and_then(char::from_u32)
                        .map(String::from)
                        .ok_or_else(|| bad_format(format, "invalid character code"))?
                }
            };
            (String::new(), text)
        }
        other => return Err(bad_format(format, &format!("unsupported conversion '%{}'", other))),
    };
    Ok(pad(directive, sign, body))
}

fn integer(format: &str, value: &Value) -> Result<i128> {
    value.to_integer().map_err(|_| {
        bad_format(
            format,
            &format!("cannot format {} as an integer", value.type_name()),
        )
    })
}

fn sign_of(directive: &Directive, negative: bool) -> String {
    if negative {
        "-".into()
    } else if directive.plus {
        "+".into()
    } else if directive.space {
        " ".into()
    } else {
        String::new()
    }
}

fn apply_int_precision(directive: &Directive, digits: String) -> String {
    match directive.precision {
        Some(p) if digits.len() < p => format!("{}{}", "0".repeat(p - digits.len()), digits),
        _ => digits,
    }
}

fn float_body(directive: &Directive, v: f64) -> String {
    let precision = directive.precision.unwrap_or(6);
    if !v.is_finite() {
        return if v.is_nan() { "nan".into() } else { "inf".into() };
    }
    match directive.conversion {
        'f' | 'F' => format!("{:.*}", precision, v),
        'e' | 'E' => {
            let text = exponent(v, precision);
            if directive.conversion == 'E' {
                text.to_uppercase()
            } else {
                text
            }
        }
        _ => {
            let precision = precision.max(1);
            let exp = if v == 0.0 { 0 } else { v.log10().floor() as i32 };
            let mut text = if exp < -4 || exp >= precision as i32 {
                exponent(v, precision - 1)
            } else {
                format!("{:.*}", (precision as i32 - 1 - exp).max(0) as usize, v)
            };
            if !directive.alternate {
                text = strip_trailing_zeros(&text);
            }
            if directive.conversion == 'G' {
                text.to_uppercase()
            } else {
                text
            }
        }
    }
}

/// C style exponent: at least two exponent digits with an explicit sign
fn exponent(v: f64, precision: usize) -> String {
    let text = format!("{:.*e}", precision, v);
    match text.split_once('e') {
        Some((mantissa, exp)) => {
            let (sign, digits) = match exp.strip_prefix('-') {
                Some(d) => ('-', d),
                None => ('+', exp),
            };
            format!("{}e{}{:0>2}", mantissa, sign, digits)
        }
        None => text,
    }
}

fn strip_trailing_zeros(text: &str) -> String {
    let (mantissa, exp) = match text.find('e') {
        Some(i) => text.split_at(i),
        None => (text, ""),
    };
    let mantissa = if mantissa.contains('.') {
        mantissa.trim_end_matches('0').trim_end_matches('.')
    } else {
        mantissa
    };
    format!("{}{}", mantissa, exp)
}

fn pad(directive: &Directive, sign: String, body: String) -> String {
    let len = sign.chars().count() + body.chars().count();
    let width = directive.width.unwrap_or(0);
    if len >= width {
        return sign + &body;
    }
    let fill = width - len;
    let numeric = !matches!(directive.conversion, 's' | 'c');
    if directive.left {
        format!("{}{}{}", sign, body, " ".repeat(fill))
    } else if directive.zero && numeric && !(directive.precision.is_some() && "diuxXob".contains(directive.conversion)) {
        format!("{}{}{}", sign, "0".repeat(fill), body)
    } else {
        format!("{}{}{}", " ".repeat(fill), sign, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(format: &str, value: impl Into<Value>) -> String {
        format_value(format, &value.into()).unwrap()
    }

    #[test]
    fn test_integers() {
        assert_eq!(fmt("%d", 42i64), "42");
        assert_eq!(fmt("%5d", -42i64), "  -42");
        assert_eq!(fmt("%-5d|", 42i64), "42   |");
        assert_eq!(fmt("%05d", -42i64), "-0042");
        assert_eq!(fmt("%+d", 7i64), "+7");
        assert_eq!(fmt("%.3d", 7i64), "007");
    }

    #[test]
    fn test_radix() {
        assert_eq!(fmt("0x%04X", 0xABu64), "0x00AB");
        assert_eq!(fmt("%#x", 255u64), "0xff");
        assert_eq!(fmt("%o", 8u64), "10");
        assert_eq!(fmt("%b", 5u64), "101");
        assert_eq!(fmt("%x", -1i64), "ffffffffffffffff");
    }

    #[test]
    fn test_floats() {
        assert_eq!(fmt("%0.2f", 3.14159), "3.14");
        assert_eq!(fmt("%8.3f", -1.5), "  -1.500");
        assert_eq!(fmt("%f", 2i64), "2.000000");
        assert_eq!(fmt("%e", 12345.678), "1.234568e+04");
        assert_eq!(fmt("%.2E", 0.000123), "1.23E-04");
        assert_eq!(fmt("%g", 0.5), "0.5");
        assert_eq!(fmt("%g", 1234567.0), "1.23457e+06");
    }

    #[test]
    fn test_strings_and_literals() {
        assert_eq!(fmt("%s V", "12"), "12 V");
        assert_eq!(fmt("%5s", "ab"), "   ab");
        assert_eq!(fmt("%.2s", "abcdef"), "ab");
        assert_eq!(fmt("100%%: %d", 1i64), "100%: 1");
        assert_eq!(fmt("%c", 65i64), "A");
    }

    #[test]
    fn test_truncating_float_through_d() {
        assert_eq!(fmt("%d", 9.9), "9");
    }

    #[test]
    fn test_errors() {
        assert!(format_value("%d", &Value::Block(vec![1])).is_err());
        assert!(format_value("%d %d", &Value::Int(1)).is_err());
        assert!(format_value("%y", &Value::Int(1)).is_err());
        assert!(format_value("%", &Value::Int(1)).is_err());
    }
}
