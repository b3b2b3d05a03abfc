//! Decoding of recorded iCom streams.
//!
//! An iCom stream is a run of records, each opening with an ASCII date and counter. Scalars
//! are found by their 4 byte tag (2 byte element plus 2 byte value representation) and
//! removed from a working copy of the record as they are read, so repeated tags are consumed
//! in order. Leaf and jaw positions arrive as labelled blocks of numeric items.
use fxhash::FxHashMap;
use ndarray::{s, Array2};
use once_cell::sync::Lazy;
use regex::bytes::{Regex, RegexBuilder};
use std::path::Path;

use super::constants::*;
use super::delivery::Delivery;
use super::error::IcomError;
use super::shared_file::read_shared;
use super::transforms::{clamped_cumulative, iec_to_bipolar};

pub const DELIVERY_MU: &str = "Delivery MU";
pub const GANTRY: &str = "Gantry";
pub const COLLIMATOR: &str = "Collimator";

const MLC_LABEL: &str = "MLCX";
const JAW_LABEL: &str = "ASYMY";

/// Type an iCom payload is converted to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcomValueType {
    Text,
    Int,
    Float,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IcomValue {
    Text(String),
    Int(i64),
    Float(f64),
    List(Vec<String>),
}

/// A scalar iCom item
#[derive(Debug, Clone, Copy)]
pub struct IcomKey {
    pub name: &'static str,
    pub tag: &'static [u8],
    pub value_type: IcomValueType,
    /// Capture every occurrence rather than the first
    pub multiple: bool,
}

const fn key(name: &'static str, tag: &'static [u8], value_type: IcomValueType) -> IcomKey {
    IcomKey {
        name,
        tag,
        value_type,
        multiple: false,
    }
}

pub const ICOM_KEYS: [IcomKey; 22] = [
    key("Patient ID", b" \x00LO", IcomValueType::Text),
    key("Patient Name", b"\x10\x00PN", IcomValueType::Text),
    key("Machine ID", b"\xb2\x00SH", IcomValueType::Text),
    key("Radiation Type", b"\xc6\x00CS", IcomValueType::Text),
    key("Energy", b"\x14\x01SH", IcomValueType::Text),
    key("Wedge", b"\x18\x01CS", IcomValueType::Text),
    key("Segment", b"\x07\x10DS", IcomValueType::Int),
    key("Total MU", b"\t\x10DS", IcomValueType::Float),
    key(DELIVERY_MU, b"2\x00DS", IcomValueType::Float),
    key("Backup Delivery MU", b"3\x00DS", IcomValueType::Float),
    key("Beam Timer", b"8\x00SH", IcomValueType::Float),
    key("Segment MU", b"\x0b\x00DS", IcomValueType::Float),
    key(GANTRY, b"\x1e\x01DS", IcomValueType::Float),
    key(COLLIMATOR, b" \x01DS", IcomValueType::Float),
    key("Table Column", b"\"\x01DS", IcomValueType::Int),
    key("Table Isocentric", b"%\x01DS", IcomValueType::Int),
    key("Table Vertical", b"(\x01DS", IcomValueType::Float),
    key("Table Longitudinal", b")\x01DS", IcomValueType::Float),
    key("Table Lateral", b"*\x01DS", IcomValueType::Float),
    IcomKey {
        name: "Interlocks",
        tag: b"\x02\x10CS",
        value_type: IcomValueType::Text,
        multiple: true,
    },
    IcomKey {
        name: "Previous Interlocks",
        tag: b"\x03\x10CS",
        value_type: IcomValueType::Text,
        multiple: true,
    },
    key("Beam Description", b"\xc2\x00LO", IcomValueType::Text),
];

fn escape_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("\\x{b:02x}")).collect()
}

fn build_lookup_patterns() -> Result<Vec<Regex>, regex::Error> {
    ICOM_KEYS
        .iter()
        .map(|key| {
            RegexBuilder::new(&format!(
                r#"(?-u)[0\x00pP]{}(?:\x00[PSR][\x01-\x06]\x00\x00\x00)?([,\-'"a-zA-Z0-9 \.]+)"#,
                escape_bytes(key.tag)
            ))
            .unicode(false)
            .build()
        })
        .collect()
}

fn build_collimation_pattern(label: &str, items: usize) -> Result<(Regex, Regex), regex::Error> {
    let item = r"0\x1c\x01DS\x00R[\x03-\x06]\x00\x00\x00(-?[0-9]+\.[0-9]+)";
    let block = format!(
        r"(?s-u)0\xb8\x00DS\x00R[\x03-\x06]\x00\x00\x00{label}\n{}",
        vec![item; items].join(r"\n")
    );
    Ok((
        RegexBuilder::new(&block).unicode(false).build()?,
        RegexBuilder::new(&format!("(?s-u){item}")).unicode(false).build()?,
    ))
}

struct Patterns {
    timestamp: Regex,
    lookup: Vec<Regex>,
    mlc: (Regex, Regex),
    jaw: (Regex, Regex),
}

fn build_patterns() -> Result<Patterns, regex::Error> {
    Ok(Patterns {
        timestamp: Regex::new(r"(?-u)[0-9]{4}-[0-9]{2}-[0-9]{2}[0-9]{2}:[0-9]{2}:[0-9]{2}.")?,
        lookup: build_lookup_patterns()?,
        mlc: build_collimation_pattern(MLC_LABEL, ICOM_MLC_ITEMS)?,
        jaw: build_collimation_pattern(JAW_LABEL, ICOM_JAW_ITEMS)?,
    })
}

static PATTERNS: Lazy<Result<Patterns, regex::Error>> = Lazy::new(build_patterns);

fn patterns() -> Result<&'static Patterns, IcomError> {
    PATTERNS
        .as_ref()
        .map_err(|e| IcomError::PatternError(e.clone()))
}

/// Split a stream into records. Bytes before the first record are dropped.
pub fn split_records(bytes: &[u8]) -> Result<Vec<&[u8]>, IcomError> {
    let starts: Vec<usize> = patterns()?
        .timestamp
        .find_iter(bytes)
        .map(|m| m.start().saturating_sub(ICOM_TIMESTAMP_OFFSET))
        .collect();

    Ok(starts
        .iter()
        .enumerate()
        .map(|(idx, start)| {
            let end = starts.get(idx + 1).copied().unwrap_or(bytes.len());
            &bytes[*start..end]
        })
        .collect())
}

/// Find the first non-sentinel payload for a pattern, removing every match it passes over
fn take_first(buffer: &mut Vec<u8>, pattern: &Regex) -> Option<String> {
    while let Some((range, payload)) = pattern.captures(buffer.as_slice()).and_then(|caps| {
        let whole = caps.get(0)?;
        let payload = caps.get(1)?;
        Some((
            whole.range(),
            String::from_utf8_lossy(payload.as_bytes()).into_owned(),
        ))
    }) {
        buffer.drain(range);
        if payload != ICOM_ABSENT_SENTINEL {
            return Some(payload);
        }
    }
    None
}

fn take_all(buffer: &mut Vec<u8>, pattern: &Regex) -> Vec<String> {
    let mut found = Vec::new();
    while let Some(payload) = take_first(buffer, pattern) {
        found.push(payload);
    }
    found
}

fn convert(key: &IcomKey, payload: String) -> Result<IcomValue, IcomError> {
    let bad_value = || IcomError::BadValue {
        key: key.name.to_string(),
        value: payload.clone(),
    };
    match key.value_type {
        IcomValueType::Text => Ok(IcomValue::Text(payload.trim().to_string())),
        IcomValueType::Float => payload
            .trim()
            .parse::<f64>()
            .map(IcomValue::Float)
            .map_err(|_| bad_value()),
        IcomValueType::Int => {
            let value = payload.trim().parse::<f64>().map_err(|_| bad_value())?;
            if value.fract() != 0.0 {
                return Err(bad_value());
            }
            Ok(IcomValue::Int(value as i64))
        }
    }
}

/// Take the next value of a named item out of a working buffer.
///
/// Single items return the first non-sentinel payload; items captured in full return every
/// remaining payload as a list. Each matched span is removed from the buffer, so calling this
/// again for the same name continues further into the record.
pub fn extract(buffer: &mut Vec<u8>, name: &str) -> Result<Option<IcomValue>, IcomError> {
    let patterns = patterns()?;
    let (key, pattern) = ICOM_KEYS
        .iter()
        .zip(patterns.lookup.iter())
        .find(|(key, _)| key.name == name)
        .ok_or_else(|| IcomError::UnknownKey(name.to_string()))?;

    if key.multiple {
        let found = take_all(buffer, pattern);
        return Ok((!found.is_empty()).then_some(IcomValue::List(found)));
    }
    take_first(buffer, pattern)
        .map(|payload| convert(key, payload))
        .transpose()
}

fn extract_collimation(record: &[u8], patterns: &(Regex, Regex)) -> Option<Vec<f64>> {
    let (block, item) = patterns;
    let found = block.find(record)?;
    item.captures_iter(found.as_bytes())
        .map(|caps| {
            caps.get(1)
                .and_then(|m| std::str::from_utf8(m.as_bytes()).ok())
                .and_then(|text| text.parse::<f64>().ok())
        })
        .collect()
}

/// The scalars and collimation of one iCom record
#[derive(Debug, Clone, Default)]
pub struct IcomRecord {
    pub timestamp: String,
    pub fields: FxHashMap<String, IcomValue>,
    /// (leaf pairs, 2) in mm
    pub mlc: Option<Array2<f64>>,
    pub jaw: Option<[f64; 2]>,
    /// Whatever is left of the record once all known items are removed
    pub remainder: Vec<u8>,
}

impl IcomRecord {
    pub fn decode(record: &[u8]) -> Result<Self, IcomError> {
        let patterns = patterns()?;
        let timestamp = patterns
            .timestamp
            .find(record)
            .map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned())
            .unwrap_or_default();

        let mlc = match extract_collimation(record, &patterns.mlc) {
            Some(values) => Some(convert_mlc(values)?),
            None => None,
        };
        let jaw = extract_collimation(record, &patterns.jaw).and_then(|values| {
            match values.as_slice() {
                [first, second] => Some([second * CM_TO_MM, first * CM_TO_MM]),
                _ => None,
            }
        });

        let mut buffer = record.to_vec();
        let mut fields = FxHashMap::default();
        for key in ICOM_KEYS.iter() {
            if let Some(value) = extract(&mut buffer, key.name)? {
                fields.insert(key.name.to_string(), value);
            }
        }

        Ok(Self {
            timestamp,
            fields,
            mlc,
            jaw,
            remainder: buffer,
        })
    }

    pub fn float(&self, name: &str) -> Option<f64> {
        match self.fields.get(name)? {
            IcomValue::Float(value) => Some(*value),
            IcomValue::Int(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        match self.fields.get(name)? {
            IcomValue::Text(value) => Some(value),
            _ => None,
        }
    }
}

/// Reshape the 160 MLCX items into canonical (80, 2) mm
fn convert_mlc(values: Vec<f64>) -> Result<Array2<f64>, IcomError> {
    let mlc = Array2::from_shape_vec((LEAF_PAIRS, 2), values)
        .map_err(|e| IcomError::DeliveryError(e.into()))?;
    let mut mlc = mlc.slice(s![..;-1, ..;-1]).to_owned();
    mlc.column_mut(1).mapv_inplace(|v| -v);
    mlc.mapv_inplace(|v| v * CM_TO_MM);
    Ok(mlc)
}

/// Build a Delivery from the records of an iCom stream.
/// Records without delivered MU, gantry, collimator, MLC and jaw are skipped.
pub fn delivery_from_icom_stream(bytes: &[u8]) -> Result<Delivery, IcomError> {
    let mut delivered = Vec::new();
    let mut gantry = Vec::new();
    let mut collimator = Vec::new();
    let mut mlc = Vec::new();
    let mut jaw = Vec::new();
    let mut skipped = 0;

    for record in split_records(bytes)? {
        let decoded = IcomRecord::decode(record)?;
        match (
            decoded.float(DELIVERY_MU),
            decoded.float(GANTRY),
            decoded.float(COLLIMATOR),
            decoded.mlc,
            decoded.jaw,
        ) {
            (Some(mu), Some(g), Some(c), Some(leaves), Some(j)) => {
                delivered.push(mu);
                gantry.push(g);
                collimator.push(c);
                mlc.push(leaves);
                jaw.push(j);
            }
            _ => {
                spdlog::debug!("Skipping incomplete iCom record at {}", decoded.timestamp);
                skipped += 1;
            }
        }
    }

    if delivered.is_empty() {
        return Err(IcomError::NoRecords);
    }
    if skipped > 0 {
        spdlog::info!("Skipped {skipped} incomplete iCom records");
    }

    let delivery = Delivery::from_control_points(
        clamped_cumulative(&delivered),
        iec_to_bipolar(&gantry)?,
        iec_to_bipolar(&collimator)?,
        &mlc,
        &jaw,
    )?;
    spdlog::info!(
        "Decoded {} iCom control points ({} MU)",
        delivery.len(),
        delivery.total_mu()
    );
    Ok(delivery)
}

pub fn delivery_from_icom_file(path: &Path) -> Result<Delivery, IcomError> {
    let bytes = read_shared(path)?;
    delivery_from_icom_stream(&bytes)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn item(tag: &[u8], payload: &str) -> Vec<u8> {
        [
            b"0".as_slice(),
            tag,
            b"\x00R",
            &[payload.len() as u8],
            b"\x00\x00\x00",
            payload.as_bytes(),
            b"\n",
        ]
        .concat()
    }

    fn collimation(label: &str, values: &[f64]) -> Vec<u8> {
        let mut block = [
            b"0\xb8\x00DS\x00R\x04\x00\x00\x00".as_slice(),
            label.as_bytes(),
        ]
        .concat();
        for value in values {
            let text = format!("{value:.1}");
            block.push(b'\n');
            block.extend_from_slice(b"0\x1c\x01DS\x00R");
            block.push(text.len() as u8);
            block.extend_from_slice(b"\x00\x00\x00");
            block.extend_from_slice(text.as_bytes());
        }
        block.push(b'\n');
        block
    }

    /// A complete record; the leaf values fed in are cm and ordered as the linac sends them
    pub(crate) fn record(counter: usize, delivery_mu: &str, gantry: &str) -> Vec<u8> {
        let mut bytes = b"\x00\x01\x02\x03\x04\x05\x06\x07".to_vec();
        bytes.extend_from_slice(format!("2019-06-1412:00:0{counter}").as_bytes());
        bytes.extend(item(b"2\x00DS", delivery_mu));
        bytes.extend(item(b"\x1e\x01DS", gantry));
        bytes.extend(item(b" \x01DS", "0.0"));
        bytes.extend(item(b" \x00LO", "123456"));
        bytes.extend(collimation(MLC_LABEL, &[1.0; ICOM_MLC_ITEMS]));
        bytes.extend(collimation(JAW_LABEL, &[2.0, 3.0]));
        bytes
    }

    #[test]
    fn test_split_records() {
        let mut stream = b"partial".to_vec();
        let first = record(1, "0.0", "0.0");
        let second = record(2, "1.0", "0.0");
        stream.extend(&first);
        stream.extend(&second);

        let records = split_records(&stream).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], first.as_slice());
        assert_eq!(records[1], second.as_slice());
    }

    #[test]
    fn test_lookup_shrinks_buffer() {
        let gantry = item(b"\x1e\x01DS", "-32767");
        let gantry_real = item(b"\x1e\x01DS", "180.0");
        let energy = item(b"\x14\x01SH", "6 MV");
        let mut bytes = b"head".to_vec();
        bytes.extend(&gantry);
        bytes.extend(&energy);
        bytes.extend(&gantry_real);

        let decoded = IcomRecord::decode(&bytes).unwrap();
        assert_eq!(decoded.float(GANTRY), Some(180.0));
        assert_eq!(decoded.text("Energy"), Some("6 MV"));
        // Each match leaves its trailing newline behind
        let removed = gantry.len() + energy.len() + gantry_real.len() - 3;
        assert_eq!(decoded.remainder.len(), bytes.len() - removed);
    }

    #[test]
    fn test_repeated_patient_id() {
        let first_id = item(b" \x00LO", "111");
        let name = item(b"\x10\x00PN", "SMITH");
        let second_id = item(b" \x00LO", "222");
        let mut bytes = b"head".to_vec();
        bytes.extend(&first_id);
        bytes.extend(&name);
        bytes.extend(&second_id);

        let mut buffer = bytes.clone();
        assert_eq!(
            extract(&mut buffer, "Patient ID").unwrap(),
            Some(IcomValue::Text(String::from("111")))
        );
        assert_eq!(
            extract(&mut buffer, "Patient Name").unwrap(),
            Some(IcomValue::Text(String::from("SMITH")))
        );
        assert_eq!(
            extract(&mut buffer, "Patient ID").unwrap(),
            Some(IcomValue::Text(String::from("222")))
        );
        assert_eq!(extract(&mut buffer, "Patient ID").unwrap(), None);

        let removed = first_id.len() + name.len() + second_id.len() - 3;
        assert_eq!(buffer.len(), bytes.len() - removed);
        assert_eq!(buffer, b"head\n\n\n".to_vec());

        assert!(matches!(
            extract(&mut buffer, "Couch Angle"),
            Err(IcomError::UnknownKey(_))
        ));
    }

    #[test]
    fn test_collimation_length_byte() {
        let good = collimation(JAW_LABEL, &[1.0, 1.0]);
        assert_eq!(IcomRecord::decode(&good).unwrap().jaw, Some([10.0, 10.0]));

        // an item whose length byte falls outside 3..=6 breaks the block
        let marker = b"\x1c\x01DS\x00R";
        let at = good
            .windows(marker.len())
            .position(|window| window == marker)
            .unwrap()
            + marker.len();
        let mut bad = good.clone();
        bad[at] = 0x07;
        assert_eq!(IcomRecord::decode(&bad).unwrap().jaw, None);
    }

    #[test]
    fn test_sentinel_only_is_absent() {
        let bytes = item(b"2\x00DS", "-32767");
        let decoded = IcomRecord::decode(&bytes).unwrap();
        assert_eq!(decoded.float(DELIVERY_MU), None);
    }

    #[test]
    fn test_multiple_and_bad_values() {
        let mut bytes = item(b"\x02\x10CS", "DOOR");
        bytes.extend(item(b"\x02\x10CS", "DOSE"));
        let decoded = IcomRecord::decode(&bytes).unwrap();
        assert_eq!(
            decoded.fields.get("Interlocks"),
            Some(&IcomValue::List(vec![String::from("DOOR"), String::from("DOSE")]))
        );

        let bytes = item(b"\x07\x10DS", "1.5");
        assert!(matches!(
            IcomRecord::decode(&bytes),
            Err(IcomError::BadValue { .. })
        ));
    }

    #[test]
    fn test_collimation() {
        let mut values = vec![0.0; ICOM_MLC_ITEMS];
        values[0] = 1.0;
        values[1] = 2.0;
        let mut bytes = collimation(MLC_LABEL, &values);
        bytes.extend(collimation(JAW_LABEL, &[2.0, 3.0]));

        let decoded = IcomRecord::decode(&bytes).unwrap();
        let mlc = decoded.mlc.unwrap();
        assert_eq!(mlc.shape(), &[80, 2]);
        // first pair lands last with banks swapped
        assert_eq!(mlc[[79, 0]], 20.0);
        assert_eq!(mlc[[79, 1]], -10.0);
        assert_eq!(decoded.jaw, Some([30.0, 20.0]));
    }

    #[test]
    fn test_stream_delivery() {
        let mut stream = record(1, "0.0", "0.0");
        stream.extend(record(2, "1.0", "359.0"));
        // MU reset after the beam is interrupted
        stream.extend(record(3, "0.5", "358.0"));
        stream.extend(b"\x00\x01\x02\x03\x04\x05\x06\x072019-06-1412:00:04 truncated".iter());

        let delivery = delivery_from_icom_stream(&stream).unwrap();
        assert_eq!(delivery.monitor_units(), &[0.0, 1.0, 1.0]);
        assert_eq!(delivery.gantry(), &[0.0, -1.0, -2.0]);
        assert_eq!(delivery.mlc()[[0, 0, 0]], 10.0);
        assert_eq!(delivery.mlc()[[0, 0, 1]], -10.0);

        assert!(matches!(
            delivery_from_icom_stream(b"nothing"),
            Err(IcomError::NoRecords)
        ));
    }
}
