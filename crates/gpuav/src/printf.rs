//! Host-side formatting of debug-printf records.
//!
//! Supports the C conversions `d i u x X o c f F e E g G a A %`, the `- + space # 0`
//! flags, width and precision, `l`/`ll` for 64-bit values (two argument words, low word
//! first) and `vN` for N-component vectors, printed comma separated.

use std::fmt::Write as _;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Formatted {
    pub text: String,
    /// Some argument words the format asked for were not in the record.
    pub truncated: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct FormatSpec {
    left: bool,
    plus: bool,
    space: bool,
    alt: bool,
    zero: bool,
    width: usize,
    precision: Option<usize>,
    components: usize,
    long: bool,
    conversion: char,
}

struct Args<'a> {
    words: &'a [u32],
    next: usize,
    missing: bool,
}

impl Args<'_> {
    fn word(&mut self) -> Option<u32> {
        let w = self.words.get(self.next).copied();
        self.next += 1;
        if w.is_none() {
            self.missing = true;
        }
        w
    }

    fn value(&mut self, long: bool) -> Option<u64> {
        let lo = self.word()?;
        if !long {
            return Some(u64::from(lo));
        }
        let hi = self.word()?;
        Some(u64::from(lo) | (u64::from(hi) << 32))
    }
}

/// Formats `format` with the argument words of one record.
pub fn format(format: &str, words: &[u32]) -> Formatted {
    let mut out = String::with_capacity(format.len() + 16);
    let mut args = Args {
        words,
        next: 0,
        missing: false,
    };
    let mut chars = format.char_indices().peekable();
    while let Some((start, c)) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let Some(spec) = parse_spec(&mut chars) else {
            // Incomplete or unknown directive: print it as written.
            let end = chars.peek().map_or(format.len(), |&(i, _)| i);
            out.push_str(&format[start..end]);
            continue;
        };
        if spec.conversion == '%' {
            out.push('%');
            continue;
        }
        for k in 0..spec.components {
            if k > 0 {
                out.push_str(", ");
            }
            match args.value(spec.long) {
                Some(v) => out.push_str(&convert(&spec, v)),
                None => out.push_str("<missing>"),
            }
        }
    }
    Formatted {
        text: out,
        truncated: args.missing,
    }
}

fn parse_spec(chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>) -> Option<FormatSpec> {
    let mut spec = FormatSpec {
        components: 1,
        ..FormatSpec::default()
    };
    while let Some(&(_, c)) = chars.peek() {
        match c {
            '-' => spec.left = true,
            '+' => spec.plus = true,
            ' ' => spec.space = true,
            '#' => spec.alt = true,
            '0' => spec.zero = true,
            _ => break,
        }
        chars.next();
    }
    spec.width = digits(chars).unwrap_or(0);
    if chars.peek().map(|&(_, c)| c) == Some('.') {
        chars.next();
        spec.precision = Some(digits(chars).unwrap_or(0));
    }
    loop {
        match chars.peek().map(|&(_, c)| c)? {
            'v' => {
                chars.next();
                let (_, n) = chars.next()?;
                spec.components = match n {
                    '2' => 2,
                    '3' => 3,
                    '4' => 4,
                    _ => return None,
                };
            }
            'l' => {
                chars.next();
                spec.long = true;
            }
            'h' => {
                chars.next();
            }
            _ => break,
        }
    }
    let (_, conversion) = chars.next()?;
    match conversion {
        'd' | 'i' | 'u' | 'x' | 'X' | 'o' | 'c' | 'f' | 'F' | 'e' | 'E' | 'g' | 'G' | 'a'
        | 'A' | '%' => {
            spec.conversion = conversion;
            Some(spec)
        }
        _ => None,
    }
}

fn digits(chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>) -> Option<usize> {
    let mut n: Option<usize> = None;
    while let Some(d) = chars.peek().and_then(|&(_, c)| c.to_digit(10)) {
        n = Some(n.unwrap_or(0).saturating_mul(10).saturating_add(d as usize));
        chars.next();
    }
    n
}

fn convert(spec: &FormatSpec, bits: u64) -> String {
    match spec.conversion {
        'd' | 'i' => {
            let v = if spec.long {
                bits as i64
            } else {
                i64::from(bits as u32 as i32)
            };
            integer(spec, v < 0, v.unsigned_abs(), 10, "")
        }
        'u' => integer(spec, false, bits, 10, ""),
        'x' => integer(spec, false, bits, 16, if spec.alt && bits != 0 { "0x" } else { "" }),
        'X' => integer(spec, false, bits, 16, if spec.alt && bits != 0 { "0X" } else { "" }),
        'o' => integer(spec, false, bits, 8, ""),
        'c' => {
            let c = char::from_u32(bits as u32).unwrap_or(char::REPLACEMENT_CHARACTER);
            pad(spec, "", "", c.to_string(), false)
        }
        _ => {
            let v = if spec.long {
                f64::from_bits(bits)
            } else {
                f64::from(f32::from_bits(bits as u32))
            };
            float(spec, v)
        }
    }
}

fn integer(spec: &FormatSpec, negative: bool, magnitude: u64, radix: u32, prefix: &str) -> String {
    let mut body = match radix {
        16 if spec.conversion == 'X' => format!("{magnitude:X}"),
        16 => format!("{magnitude:x}"),
        8 => format!("{magnitude:o}"),
        _ => magnitude.to_string(),
    };
    if radix == 8 && spec.alt && !body.starts_with('0') {
        body.insert(0, '0');
    }
    if let Some(p) = spec.precision {
        if p == 0 && magnitude == 0 {
            body.clear();
        } else if body.len() < p {
            body = format!("{}{body}", "0".repeat(p - body.len()));
        }
    }
    // Zero padding is ignored when a precision is given.
    let zero = spec.precision.is_none();
    pad(spec, sign(spec, negative), prefix, body, zero)
}

fn sign(spec: &FormatSpec, negative: bool) -> &'static str {
    if negative {
        "-"
    } else if spec.plus {
        "+"
    } else if spec.space {
        " "
    } else {
        ""
    }
}

fn pad(spec: &FormatSpec, sign: &str, prefix: &str, body: String, zero_allowed: bool) -> String {
    let len = sign.len() + prefix.len() + body.chars().count();
    if len >= spec.width {
        return format!("{sign}{prefix}{body}");
    }
    let fill = spec.width - len;
    if spec.left {
        format!("{sign}{prefix}{body}{}", " ".repeat(fill))
    } else if spec.zero && zero_allowed {
        format!("{sign}{prefix}{}{body}", "0".repeat(fill))
    } else {
        format!("{}{sign}{prefix}{body}", " ".repeat(fill))
    }
}

fn float(spec: &FormatSpec, v: f64) -> String {
    let upper = spec.conversion.is_ascii_uppercase();
    let negative = v.is_sign_negative() && !v.is_nan();
    let a = v.abs();
    if !a.is_finite() {
        let body = match (a.is_nan(), upper) {
            (true, false) => "nan",
            (true, true) => "NAN",
            (false, false) => "inf",
            (false, true) => "INF",
        };
        return pad(spec, sign(spec, negative), "", body.to_string(), false);
    }
    let precision = spec.precision.unwrap_or(6);
    let (prefix, body) = match spec.conversion.to_ascii_lowercase() {
        'f' => ("", fixed(a, precision, spec.alt)),
        'e' => ("", exponent(a, precision, spec.alt, upper)),
        'g' => ("", general(a, precision, spec.alt, upper)),
        _ => (if upper { "0X" } else { "0x" }, hex_float(a, upper)),
    };
    pad(spec, sign(spec, negative), prefix, body, true)
}

fn fixed(a: f64, precision: usize, alt: bool) -> String {
    let mut s = format!("{a:.precision$}");
    if alt && precision == 0 {
        s.push('.');
    }
    s
}

/// Mantissa and decimal exponent of `a` rounded to `precision` fraction digits.
fn split_exponent(a: f64, precision: usize) -> (String, i32) {
    let s = format!("{a:.precision$e}");
    match s.split_once('e') {
        Some((mantissa, exp)) => (mantissa.to_string(), exp.parse().unwrap_or(0)),
        None => (s, 0),
    }
}

fn exponent(a: f64, precision: usize, alt: bool, upper: bool) -> String {
    let (mut mantissa, exp) = split_exponent(a, precision);
    if alt && precision == 0 {
        mantissa.push('.');
    }
    let e = if upper { 'E' } else { 'e' };
    let sign = if exp < 0 { '-' } else { '+' };
    format!("{mantissa}{e}{sign}{:02}", exp.unsigned_abs())
}

fn general(a: f64, precision: usize, alt: bool, upper: bool) -> String {
    let p = precision.max(1);
    let exp = if a == 0.0 {
        0
    } else {
        split_exponent(a, p - 1).1
    };
    let mut s = if exp < p as i32 && exp >= -4 {
        fixed(a, (p as i32 - 1 - exp) as usize, alt)
    } else {
        exponent(a, p - 1, alt, upper)
    };
    if !alt {
        s = strip_fraction_zeros(&s);
    }
    s
}

fn strip_fraction_zeros(s: &str) -> String {
    let (number, suffix) = match s.find(['e', 'E']) {
        Some(i) => s.split_at(i),
        None => (s, ""),
    };
    if !number.contains('.') {
        return s.to_string();
    }
    let trimmed = number.trim_end_matches('0').trim_end_matches('.');
    format!("{trimmed}{suffix}")
}

/// `%a` body without the `0x` prefix, exact (no precision handling).
fn hex_float(a: f64, upper: bool) -> String {
    let bits = a.to_bits();
    let biased = ((bits >> 52) & 0x7ff) as i32;
    let fraction = bits & ((1u64 << 52) - 1);
    let (lead, exp) = match (biased, fraction) {
        (0, 0) => (0, 0),
        (0, _) => (0, -1022),
        _ => (1, biased - 1023),
    };
    let mut s = String::new();
    let _ = write!(s, "{lead}");
    let digits = format!("{fraction:013x}");
    let digits = digits.trim_end_matches('0');
    if !digits.is_empty() {
        s.push('.');
        s.push_str(digits);
    }
    let _ = write!(s, "p{}{}", if exp < 0 { '-' } else { '+' }, exp.unsigned_abs());
    if upper {
        s.make_ascii_uppercase();
    }
    s
}
