use once_cell::sync::Lazy;
use regex::bytes::{Regex, RegexBuilder};

use super::constants::TRF_HEADER_ROW_SKIPS;
use super::error::TrfError;

const TAB: u8 = b'\t';

fn build_header_pattern() -> Result<Regex, regex::Error> {
    RegexBuilder::new(
        r"(?-u)\A[\x00-\x19]([0-9]{2}[/-][0-9]{2}[/-][0-9]{2} [0-9]{2}:[0-9]{2}:[0-9]{2} Z)[\x00-\x19]((?:\+|\-)[0-9]{2}:[0-9]{2})[\x00-\x25]([\x20-\x7F]*)[\x00-\x19]([\x20-\x7F]+)[\x00-\x19]",
    )
    .unicode(false)
    .build()
}

static HEADER_PATTERN: Lazy<Result<Regex, regex::Error>> = Lazy::new(build_header_pattern);

fn header_pattern() -> Result<&'static Regex, TrfError> {
    HEADER_PATTERN
        .as_ref()
        .map_err(|e| TrfError::PatternError(e.clone()))
}

/// The descriptive header that precedes the table of a trajectory log
#[derive(Debug, Clone, PartialEq)]
pub struct TrfHeader {
    pub machine: String,
    /// YY/MM/DD HH:MM:SS Z, in UTC
    pub date: String,
    pub timezone: String,
    pub field_label: String,
    pub field_name: String,
    /// Byte offset at which the table starts
    pub length: usize,
}

/// Find where the header ends.
///
/// The header is tab separated. After six separators the first item longer than three bytes is
/// the start of the table, three bytes past the end of the preceding item.
pub fn determine_header_length(bytes: &[u8]) -> Result<usize, TrfError> {
    let mut offset = 0;
    for (idx, item) in bytes.split(|b| *b == TAB).enumerate() {
        if idx >= TRF_HEADER_ROW_SKIPS && item.len() > 3 {
            // offset includes the separator after the previous item
            return Ok(offset - 1 + 3);
        }
        offset += item.len() + 1;
    }
    Err(TrfError::HeaderMalformed)
}

fn split_field(field: &str) -> (String, String) {
    let parts: Vec<&str> = field.split('/').collect();
    match parts.as_slice() {
        [label, name] => (label.to_string(), name.to_string()),
        _ => (String::new(), field.to_string()),
    }
}

impl TrfHeader {
    /// Decode the header at the start of a trajectory log
    pub fn decode(bytes: &[u8]) -> Result<Self, TrfError> {
        let length = determine_header_length(bytes)?;
        let header = &bytes[..length.min(bytes.len())];

        let caps = header_pattern()?
            .captures(header)
            .ok_or(TrfError::HeaderMalformed)?;
        let text = |idx: usize| -> String {
            caps.get(idx)
                .map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned())
                .unwrap_or_default()
        };

        let (field_label, field_name) = split_field(&text(3));
        Ok(Self {
            machine: text(4),
            date: text(1),
            timezone: text(2),
            field_label,
            field_name,
            length,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A header in the layout a linac writes, for a field "1-1/AP G0" on machine 2619
    pub(crate) fn synthetic_header(field: &str) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.push(0x01);
        bytes.extend_from_slice(b"19/06/14 03:21:08 Z");
        bytes.push(0x01);
        bytes.extend_from_slice(b"+10:00");
        bytes.push(0x01);
        bytes.extend_from_slice(field.as_bytes());
        bytes.push(0x01);
        bytes.extend_from_slice(b"2619");
        bytes.push(0x01);
        for _ in 0..TRF_HEADER_ROW_SKIPS {
            bytes.extend_from_slice(b"\t\xdc\x00\xe8");
        }
        bytes.extend_from_slice(b"\t\xdc\x00");
        bytes
    }

    #[test]
    fn test_header_length() {
        let mut bytes = synthetic_header("1-1/AP G0");
        let expected = bytes.len();
        bytes.extend_from_slice(&[3, 0, 0, 0, 5, 0, 0, 0]);
        assert_eq!(determine_header_length(&bytes).unwrap(), expected);
    }

    #[test]
    fn test_decode_header() {
        let mut bytes = synthetic_header("1-1/AP G0");
        bytes.extend_from_slice(&[3, 0, 0, 0, 5, 0, 0, 0]);
        let header = TrfHeader::decode(&bytes).unwrap();
        assert_eq!(header.machine, "2619");
        assert_eq!(header.date, "19/06/14 03:21:08 Z");
        assert_eq!(header.timezone, "+10:00");
        assert_eq!(header.field_label, "1-1");
        assert_eq!(header.field_name, "AP G0");
    }

    #[test]
    fn test_field_without_label() {
        let mut bytes = synthetic_header("Service Field");
        bytes.extend_from_slice(&[3, 0, 0, 0, 5, 0, 0, 0]);
        let header = TrfHeader::decode(&bytes).unwrap();
        assert_eq!(header.field_label, "");
        assert_eq!(header.field_name, "Service Field");

        assert_eq!(split_field("a/b/c"), (String::new(), String::from("a/b/c")));
    }

    #[test]
    fn test_malformed() {
        assert!(matches!(
            TrfHeader::decode(b"no tabs here"),
            Err(TrfError::HeaderMalformed)
        ));
        let mut bytes = b"\x01garbage".to_vec();
        for _ in 0..7 {
            bytes.extend_from_slice(b"\t\xdc\x00");
        }
        bytes.extend_from_slice(b"\t\x03\x00\x00\x00");
        assert!(matches!(
            TrfHeader::decode(&bytes),
            Err(TrfError::HeaderMalformed)
        ));
    }
}
