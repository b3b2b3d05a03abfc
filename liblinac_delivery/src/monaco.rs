//! Monaco `tel.1` plan adapter.
//!
//! Control points are recovered by matching a fixed-shape block: 16 rows of 10 leaf
//! positions (cm), 13 rows of segment flags, then the segment type and parameters.
use ndarray::Array2;
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use std::path::Path;

use super::constants::{CM_TO_MM, LEAF_PAIRS};
use super::delivery::Delivery;
use super::error::MonacoError;
use super::shared_file::read_shared_to_string;
use super::transforms::{flip_banks, flip_pairs, iec_to_bipolar, negate_bank, scale};

const DYNAMIC_SEGMENT: &str = "1,1";
const STATIC_SEGMENT: &str = "2,2";

const MLC_ROWS: usize = 16;
const MLC_COLUMNS: usize = 10;
const FLAG_ROWS: usize = 13;
const FLAG_COLUMNS: usize = 6;
const PATTERN_SIZE_LIMIT: usize = 1 << 26;

fn build_control_point_pattern() -> Result<Regex, regex::Error> {
    let mlc_position = r" *-?[0-9]+\.[0-9]+";
    let mlc_row = vec![mlc_position; MLC_COLUMNS].join(",");
    let mlc_block = vec![mlc_row; MLC_ROWS].join("\n");

    let flag_row = vec![r"[0-9]"; FLAG_COLUMNS].join(",");
    let flag_block = vec![flag_row; FLAG_ROWS].join("\n");

    let decimal = r"-?[0-9]+\.[0-9]+";
    let optional_decimal = r"-?[0-9]+(?:\.[0-9]+)?";
    let parameters = format!(
        "([0-9],[0-9])\n\
         {decimal},({optional_decimal})\n\
         ({optional_decimal})\n\
         {decimal},{decimal},{decimal},{decimal}\n\
         ({decimal}),{decimal},{decimal},{decimal}\n\
         {optional_decimal},({optional_decimal}),{optional_decimal},({optional_decimal})"
    );

    RegexBuilder::new(&format!("({mlc_block})\n{flag_block}\n{parameters}"))
        .size_limit(PATTERN_SIZE_LIMIT)
        .build()
}

static CONTROL_POINT_PATTERN: Lazy<Result<Regex, regex::Error>> =
    Lazy::new(build_control_point_pattern);

fn control_point_pattern() -> Result<&'static Regex, MonacoError> {
    CONTROL_POINT_PATTERN
        .as_ref()
        .map_err(|e| MonacoError::PatternError(e.clone()))
}

/// One matched control point, still in Monaco's frame
#[derive(Debug, Clone)]
struct TelControlPoint {
    mlc: Array2<f64>,
    segment_type: String,
    gantry: f64,
    collimator: f64,
    mu: f64,
    jaw_gap: f64,
    jaw_centre: f64,
}

/// Convert the 16x10 leaf block into canonical (leaf pairs, 2) mm
fn convert_mlc_block(block: &str) -> Result<Array2<f64>, MonacoError> {
    let values = block
        .replace(' ', "")
        .replace('\n', ",")
        .split(',')
        .map(|item| item.parse::<f64>())
        .collect::<Result<Vec<f64>, _>>()?;
    let mut mlc = Array2::from_shape_vec((LEAF_PAIRS, 2), values)
        .map_err(|e| MonacoError::DeliveryError(e.into()))?;

    negate_bank(&mut mlc, 0)?;
    let mlc = flip_banks(flip_pairs(mlc.view()).view());
    Ok(scale(mlc.view(), CM_TO_MM))
}

fn parse_control_points(contents: &str) -> Result<Vec<TelControlPoint>, MonacoError> {
    let pattern = control_point_pattern()?;
    pattern
        .captures_iter(contents)
        .map(|caps| -> Result<TelControlPoint, MonacoError> {
            Ok(TelControlPoint {
                mlc: convert_mlc_block(&caps[1])?,
                segment_type: caps[2].to_string(),
                gantry: caps[3].parse()?,
                collimator: caps[4].parse()?,
                mu: caps[5].parse()?,
                jaw_gap: caps[6].parse()?,
                jaw_centre: caps[7].parse()?,
            })
        })
        .collect()
}

/// Build a Delivery from the text of a Monaco `tel.1` file.
///
/// Static (2,2) segments are preceded by a duplicate of their own geometry carrying the
/// previous cumulative MU, so that the segment's MU is delivered through a stationary
/// aperture.
pub fn delivery_from_tel_contents(contents: &str) -> Result<Delivery, MonacoError> {
    let contents = contents.replace("\r\n", "\n");
    let control_points = parse_control_points(&contents)?;
    if control_points.is_empty() {
        return Err(MonacoError::NoControlPoints);
    }

    let mut mu: Vec<f64> = control_points
        .iter()
        .scan(0.0, |total, cp| {
            *total += cp.mu;
            Some(*total)
        })
        .collect();
    let mut gantry = iec_to_bipolar(&control_points.iter().map(|cp| cp.gantry).collect::<Vec<_>>())?;
    let mut collimator =
        iec_to_bipolar(&control_points.iter().map(|cp| cp.collimator).collect::<Vec<_>>())?;
    let mut mlc: Vec<Array2<f64>> = control_points.iter().map(|cp| cp.mlc.clone()).collect();
    let mut jaw: Vec<[f64; 2]> = control_points
        .iter()
        .map(|cp| {
            [
                cp.jaw_centre + cp.jaw_gap / 2.0,
                -(cp.jaw_centre - cp.jaw_gap / 2.0),
            ]
        })
        .collect();

    for (idx, cp) in control_points.iter().enumerate().rev() {
        match cp.segment_type.as_str() {
            DYNAMIC_SEGMENT => (),
            STATIC_SEGMENT => {
                let previous_mu = if idx == 0 { 0.0 } else { mu[idx - 1] };
                mu.insert(idx, previous_mu);
                gantry.insert(idx, gantry[idx]);
                collimator.insert(idx, collimator[idx]);
                mlc.insert(idx, mlc[idx].clone());
                jaw.insert(idx, jaw[idx]);
            }
            other => return Err(MonacoError::UnknownSegmentType(other.to_string())),
        }
    }

    let delivery = Delivery::from_control_points(mu, gantry, collimator, &mlc, &jaw)?;
    spdlog::info!(
        "Decoded {} Monaco control points ({} MU)",
        delivery.len(),
        delivery.total_mu()
    );
    Ok(delivery)
}

/// Read a `tel.1` file without locking it and build its Delivery
pub fn delivery_from_tel_file(path: &Path) -> Result<Delivery, MonacoError> {
    let contents = read_shared_to_string(path)?;
    delivery_from_tel_contents(&contents)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::metersetmap::{calc_metersetmap, MetersetMapConfig};

    /// Text of one tel.1 control point whose canonical leaves are (10 tip_a, 10 tip_b) mm
    pub(crate) fn tel_control_point(
        tip_b: f64,
        tip_a: f64,
        segment_type: &str,
        gantry: &str,
        mu: f64,
        jaw_gap: f64,
        jaw_centre: f64,
    ) -> String {
        let pair = format!("{:5.2},{:5.2}", -tip_b, tip_a);
        let row = vec![pair; MLC_COLUMNS / 2].join(",");
        let mlc = vec![row; MLC_ROWS].join("\n");
        let flags = vec!["1,1,1,1,1,1"; FLAG_ROWS].join("\n");
        format!(
            "{mlc}\n{flags}\n{segment_type}\n\
             0.0,{gantry}\n\
             0\n\
             0.0,0.0,0.0,0.0\n\
             {mu:.4},0.0,0.0,0.0\n\
             0,{jaw_gap:.1},0,{jaw_centre:.1}\n"
        )
    }

    #[test]
    fn test_dynamic_control_points() {
        let contents = [
            tel_control_point(1.0, 1.0, "1,1", "190", 0.0, 4.0, 1.0),
            tel_control_point(2.0, 1.0, "1,1", "200.5", 2.5, 4.0, 1.0),
        ]
        .join("Other Monaco text\r\n");
        let delivery = delivery_from_tel_contents(&contents).unwrap();

        assert_eq!(delivery.monitor_units(), &[0.0, 2.5]);
        assert_eq!(delivery.gantry(), &[-170.0, -159.5]);
        assert_eq!(delivery.collimator(), &[0.0, 0.0]);
        assert_eq!(delivery.mlc().shape(), &[2, 80, 2]);
        assert_eq!(delivery.mlc()[[1, 0, 0]], 10.0);
        assert_eq!(delivery.mlc()[[1, 0, 1]], 20.0);
        assert_eq!(delivery.jaw()[[0, 0]], 3.0);
        assert_eq!(delivery.jaw()[[0, 1]], 1.0);
    }

    #[test]
    fn test_static_segment_duplicated() {
        let contents = tel_control_point(1.0, 1.0, "2,2", "0", 5.0, 4.0, 0.0);
        let delivery = delivery_from_tel_contents(&contents).unwrap();

        assert_eq!(delivery.len(), 2);
        assert_eq!(delivery.monitor_units(), &[0.0, 5.0]);
        let mlc = delivery.mlc();
        assert_eq!(mlc.index_axis(ndarray::Axis(0), 0), mlc.index_axis(ndarray::Axis(0), 1));
        assert_eq!(delivery.jaw()[[0, 0]], 2.0);

        let map = calc_metersetmap(&delivery, &MetersetMapConfig::default()).unwrap();
        assert!(map.sum() > 0.0);
        assert!((map.sum() - 5.0 * 20.0 * 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_unknown_segment_type() {
        let contents = tel_control_point(1.0, 1.0, "3,1", "0", 0.0, 4.0, 0.0);
        assert!(matches!(
            delivery_from_tel_contents(&contents),
            Err(MonacoError::UnknownSegmentType(t)) if t == "3,1"
        ));
    }

    #[test]
    fn test_no_control_points() {
        assert!(matches!(
            delivery_from_tel_contents("not a plan"),
            Err(MonacoError::NoControlPoints)
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tel.1");
        std::fs::write(&path, tel_control_point(1.0, 1.0, "2,2", "0", 1.0, 4.0, 0.0)).unwrap();
        assert_eq!(delivery_from_tel_file(&path).unwrap().len(), 2);
    }
}
