//! Value decoders for configuration values read from the environment
//!
//! Every decoder implements `FromStr` so it can be plugged into the
//! environment decoder generically.

use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("error decoding compression type {0}")]
    Compression(String),

    #[error("error converting {0} to int")]
    NotAnInteger(String),

    #[error("expected a natural number, got {0}")]
    NotNatural(i64),

    #[error("expected a whole, positive number, including zero, got {0}")]
    NotWhole(i64),

    #[error("error compiling given regexp `{value}`: {reason}")]
    Regexp { value: String, reason: String },

    #[error("error parsing certificate: {0}")]
    Certificate(String),

    #[error("invalid duration `{0}`")]
    Duration(String),

    #[error("invalid boolean `{0}`")]
    Bool(String),
}

/// Archive compression codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionType {
    #[default]
    Gz,
    Zst,
}

impl CompressionType {
    /// File extension of archives produced with this codec
    pub fn extension(&self) -> &'static str {
        match self {
            CompressionType::Gz => "tar.gz",
            CompressionType::Zst => "tar.zst",
        }
    }
}

impl FromStr for CompressionType {
    type Err = DecodeError;

    fn from_str(v: &str) -> Result<Self, Self::Err> {
        match v {
            "gz" => Ok(CompressionType::Gz),
            "zst" => Ok(CompressionType::Zst),
            other => Err(DecodeError::Compression(other.to_string())),
        }
    }
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionType::Gz => write!(f, "gz"),
            CompressionType::Zst => write!(f, "zst"),
        }
    }
}

fn parse_int(v: &str) -> Result<i64, DecodeError> {
    v.trim()
        .parse::<i64>()
        .map_err(|_| DecodeError::NotAnInteger(v.to_string()))
}

/// A positive, non-zero natural number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct NaturalNumber(u32);

impl NaturalNumber {
    pub fn new(value: u32) -> Option<Self> {
        (value > 0).then_some(Self(value))
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl Default for NaturalNumber {
    fn default() -> Self {
        Self(1)
    }
}

impl FromStr for NaturalNumber {
    type Err = DecodeError;

    fn from_str(v: &str) -> Result<Self, Self::Err> {
        let value = parse_int(v)?;
        if value <= 0 {
            return Err(DecodeError::NotNatural(value));
        }
        u32::try_from(value)
            .map(Self)
            .map_err(|_| DecodeError::NotAnInteger(v.to_string()))
    }
}

/// A whole number, zero included
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct WholeNumber(u32);

impl WholeNumber {
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl FromStr for WholeNumber {
    type Err = DecodeError;

    fn from_str(v: &str) -> Result<Self, Self::Err> {
        let value = parse_int(v)?;
        if value < 0 {
            return Err(DecodeError::NotWhole(value));
        }
        u32::try_from(value)
            .map(Self)
            .map_err(|_| DecodeError::NotAnInteger(v.to_string()))
    }
}

/// Optional compiled regular expression; an empty value means "not set"
#[derive(Debug, Clone, Default)]
pub struct RegexpDecoder(Option<Regex>);

impl RegexpDecoder {
    pub fn regex(&self) -> Option<&Regex> {
        self.0.as_ref()
    }

    pub fn is_match(&self, haystack: &str) -> bool {
        self.0.as_ref().is_some_and(|re| re.is_match(haystack))
    }
}

impl FromStr for RegexpDecoder {
    type Err = DecodeError;

    fn from_str(v: &str) -> Result<Self, Self::Err> {
        if v.is_empty() {
            return Ok(Self(None));
        }
        Regex::new(v)
            .map(|re| Self(Some(re)))
            .map_err(|e| DecodeError::Regexp {
                value: v.to_string(),
                reason: e.to_string(),
            })
    }
}

/// X.509 certificate given either as a file path or as inline PEM content
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertDecoder {
    pem: Option<String>,
}

impl CertDecoder {
    /// PEM encoded certificate, if one was configured
    pub fn pem(&self) -> Option<&str> {
        self.pem.as_deref()
    }
}

impl FromStr for CertDecoder {
    type Err = DecodeError;

    fn from_str(v: &str) -> Result<Self, Self::Err> {
        if v.is_empty() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(v).unwrap_or_else(|_| v.to_string());

        let (_, pem) = x509_parser::pem::parse_x509_pem(content.as_bytes())
            .map_err(|e| DecodeError::Certificate(e.to_string()))?;
        pem.parse_x509()
            .map_err(|e| DecodeError::Certificate(e.to_string()))?;

        Ok(Self { pem: Some(content) })
    }
}

/// Parse a Go style duration such as `90s`, `1m`, `1h30m` or `250ms`
pub fn parse_duration(input: &str) -> Result<Duration, DecodeError> {
    let s = input.trim();
    let invalid = || DecodeError::Duration(input.to_string());

    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() || s.starts_with('-') {
        return Err(invalid());
    }

    let mut total_nanos: u128 = 0;
    let mut rest = s.strip_prefix('+').unwrap_or(s);
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        if number_len == 0 {
            return Err(invalid());
        }
        let number = &rest[..number_len];
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit_nanos: u128 = match &rest[..unit_len] {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 3600 * 1_000_000_000,
            _ => return Err(invalid()),
        };
        rest = &rest[unit_len..];

        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        if whole.is_empty() && fraction.is_empty() {
            return Err(invalid());
        }
        let whole: u128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };
        total_nanos = whole
            .checked_mul(unit_nanos)
            .and_then(|n| total_nanos.checked_add(n))
            .ok_or_else(invalid)?;
        if !fraction.is_empty() {
            let digits: u128 = fraction.parse().map_err(|_| invalid())?;
            let scale = 10u128
                .checked_pow(fraction.len() as u32)
                .ok_or_else(invalid)?;
            total_nanos = digits
                .checked_mul(unit_nanos)
                .map(|n| n / scale)
                .and_then(|n| total_nanos.checked_add(n))
                .ok_or_else(invalid)?;
        }
    }

    let secs = u64::try_from(total_nanos / 1_000_000_000).map_err(|_| invalid())?;
    Ok(Duration::new(secs, (total_nanos % 1_000_000_000) as u32))
}

/// Parse a boolean, accepting `1`, `t`, `true` and their counterparts
pub fn parse_bool(input: &str) -> Result<bool, DecodeError> {
    match input.trim() {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Ok(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Ok(false),
        _ => Err(DecodeError::Bool(input.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("0", true)]
    #[case("12", true)]
    #[case("-1", false)]
    #[case("abc", false)]
    fn test_whole_number(#[case] input: &str, #[case] ok: bool) {
        assert_eq!(input.parse::<WholeNumber>().is_ok(), ok);
    }

    #[rstest]
    #[case("1", true)]
    #[case("6", true)]
    #[case("0", false)]
    #[case("-1", false)]
    fn test_natural_number(#[case] input: &str, #[case] ok: bool) {
        assert_eq!(input.parse::<NaturalNumber>().is_ok(), ok);
    }

    #[rstest]
    #[case("gz", Some(CompressionType::Gz))]
    #[case("zst", Some(CompressionType::Zst))]
    #[case("", None)]
    #[case("GZ", None)]
    #[case("bz2", None)]
    fn test_compression_type(#[case] input: &str, #[case] expected: Option<CompressionType>) {
        assert_eq!(input.parse::<CompressionType>().ok(), expected);
    }

    #[test]
    fn test_compression_extension() {
        assert_eq!(CompressionType::Gz.extension(), "tar.gz");
        assert_eq!(CompressionType::Zst.extension(), "tar.zst");
    }

    #[test]
    fn test_regexp_decoder() {
        let empty: RegexpDecoder = "".parse().unwrap();
        assert!(empty.regex().is_none());
        assert!(!empty.is_match("anything"));

        let re: RegexpDecoder = r"\.log$".parse().unwrap();
        assert!(re.is_match("app.log"));
        assert!(!re.is_match("app.txt"));

        assert!("(unclosed".parse::<RegexpDecoder>().is_err());
    }

    #[test]
    fn test_cert_decoder_rejects_garbage() {
        let empty: CertDecoder = "".parse().unwrap();
        assert!(empty.pem().is_none());
        assert!(matches!(
            "not a certificate".parse::<CertDecoder>(),
            Err(DecodeError::Certificate(_))
        ));
    }

    #[rstest]
    #[case("1m", Duration::from_secs(60))]
    #[case("90s", Duration::from_secs(90))]
    #[case("1h30m", Duration::from_secs(5400))]
    #[case("250ms", Duration::from_millis(250))]
    #[case("0", Duration::ZERO)]
    #[case("1.5h", Duration::from_secs(5400))]
    fn test_parse_duration(#[case] input: &str, #[case] expected: Duration) {
        assert_eq!(parse_duration(input).unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("10")]
    #[case("-1m")]
    #[case("5 minutes")]
    #[case("m")]
    #[case("99999999999999999999999999999999h")]
    #[case("1.99999999999999999999999999999999999h")]
    #[case("18446744073709551615s1s")]
    fn test_parse_duration_rejects(#[case] input: &str) {
        assert!(parse_duration(input).is_err());
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("true").unwrap());
        assert!(parse_bool("1").unwrap());
        assert!(!parse_bool("F").unwrap());
        assert!(parse_bool("yes").is_err());
    }
}
