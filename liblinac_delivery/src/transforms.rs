//! Coordinate conventions shared by the ingest adapters.
//!
//! Canonical form is bipolar: angles in (-180, 180] and leaf/jaw positions in mm
//! at isocentre, signed so that positive values lie on each bank's own side of the
//! central axis. Leaf arrays handled here are a single control point, shaped
//! (leaf pairs, 2) with column 0 the -x bank and column 1 the +x bank.
use ndarray::{s, Array2, ArrayView2};

use super::error::TransformError;

/// Convert IEC angles in [0, 360) to bipolar angles in (-180, 180].
///
/// An angle of exactly 180 takes the sign of its nearest non-180 neighbours. If the
/// neighbours on either side disagree the sign cannot be resolved and
/// [`TransformError::AngleAmbiguous`] is returned. A neighbour of exactly 0 counts as
/// positive. A sequence made entirely of 180s is returned as +180.
pub fn iec_to_bipolar(angles: &[f64]) -> Result<Vec<f64>, TransformError> {
    let wrapped: Vec<f64> = angles.iter().map(|angle| angle.rem_euclid(360.0)).collect();
    let mut bipolar: Vec<f64> = wrapped
        .iter()
        .map(|angle| if *angle > 180.0 { angle - 360.0 } else { *angle })
        .collect();

    if wrapped.iter().all(|angle| *angle == 180.0) {
        return Ok(bipolar);
    }

    for idx in 0..wrapped.len() {
        if wrapped[idx] != 180.0 {
            continue;
        }
        let left = (0..idx)
            .rev()
            .find(|j| wrapped[*j] != 180.0)
            .map(|j| bipolar[j]);
        let right = (idx + 1..wrapped.len())
            .find(|j| wrapped[*j] != 180.0)
            .map(|j| bipolar[j]);

        let is_positive = match (left, right) {
            (Some(l), Some(r)) => {
                if (l >= 0.0) != (r >= 0.0) {
                    return Err(TransformError::AngleAmbiguous {
                        index: idx,
                        left: l,
                        right: r,
                    });
                }
                l >= 0.0
            }
            (Some(neighbour), None) | (None, Some(neighbour)) => neighbour >= 0.0,
            (None, None) => true,
        };
        bipolar[idx] = if is_positive { 180.0 } else { -180.0 };
    }

    Ok(bipolar)
}

/// Convert bipolar angles back to IEC angles in [0, 360)
pub fn bipolar_to_iec(angles: &[f64]) -> Vec<f64> {
    angles.iter().map(|angle| angle.rem_euclid(360.0)).collect()
}

/// Reverse the order of the leaf pairs (top-bottom swap)
pub fn flip_pairs(mlc: ArrayView2<f64>) -> Array2<f64> {
    mlc.slice(s![..;-1, ..]).to_owned()
}

/// Swap the two banks (left-right swap)
pub fn flip_banks(mlc: ArrayView2<f64>) -> Array2<f64> {
    mlc.slice(s![.., ..;-1]).to_owned()
}

/// Negate every position of one bank in place
pub fn negate_bank(mlc: &mut Array2<f64>, bank: usize) -> Result<(), TransformError> {
    if mlc.ncols() != 2 || bank > 1 {
        return Err(TransformError::BadBankCount(mlc.ncols()));
    }
    mlc.column_mut(bank).mapv_inplace(|value| -value);
    Ok(())
}

/// Multiply every position by factor, typically cm to mm
pub fn scale(mlc: ArrayView2<f64>, factor: f64) -> Array2<f64> {
    mlc.mapv(|value| value * factor)
}

/// Round half to even at the given number of decimals, matching numpy's round
pub fn round_decimals(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round_ties_even() / factor
}

/// Forward differences with negatives clamped to zero, cumulatively summed from 0.
///
/// This is how every adapter rebuilds a non-decreasing monitor unit axis.
pub fn clamped_cumulative(values: &[f64]) -> Vec<f64> {
    let mut result = Vec::with_capacity(values.len());
    if values.is_empty() {
        return result;
    }
    let mut total = 0.0;
    result.push(total);
    for pair in values.windows(2) {
        total += (pair[1] - pair[0]).max(0.0);
        result.push(total);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use proptest::prelude::*;

    #[test]
    fn test_standard_mapping() {
        let result = iec_to_bipolar(&[0.0, 90.0, 179.0, 181.0, 270.0, 359.5]).unwrap();
        assert_eq!(result, vec![0.0, 90.0, 179.0, -179.0, -90.0, -0.5]);
    }

    #[test]
    fn test_180_takes_neighbour_sign() {
        let result = iec_to_bipolar(&[190.0, 180.0, 180.0, 200.0]).unwrap();
        assert_eq!(result, vec![-170.0, -180.0, -180.0, -160.0]);

        let result = iec_to_bipolar(&[170.0, 180.0]).unwrap();
        assert_eq!(result, vec![170.0, 180.0]);

        let result = iec_to_bipolar(&[180.0, 181.0]).unwrap();
        assert_eq!(result, vec![-180.0, -179.0]);
    }

    #[test]
    fn test_180_zero_neighbour_is_positive() {
        let result = iec_to_bipolar(&[0.0, 180.0, 10.0]).unwrap();
        assert_eq!(result[1], 180.0);
    }

    #[test]
    fn test_180_ambiguous() {
        let result = iec_to_bipolar(&[170.0, 180.0, 190.0]);
        assert_eq!(
            result,
            Err(TransformError::AngleAmbiguous {
                index: 1,
                left: 170.0,
                right: -170.0
            })
        );
    }

    #[test]
    fn test_all_180_untouched() {
        let result = iec_to_bipolar(&[180.0, 180.0, 180.0]).unwrap();
        assert_eq!(result, vec![180.0, 180.0, 180.0]);
    }

    #[test]
    fn test_mlc_helpers() {
        let mlc = array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]];
        assert_eq!(
            flip_pairs(mlc.view()),
            array![[5.0, 6.0], [3.0, 4.0], [1.0, 2.0]]
        );
        assert_eq!(
            flip_banks(mlc.view()),
            array![[2.0, 1.0], [4.0, 3.0], [6.0, 5.0]]
        );
        let mut negated = scale(mlc.view(), 10.0);
        negate_bank(&mut negated, 1).unwrap();
        assert_eq!(negated, array![[10.0, -20.0], [30.0, -40.0], [50.0, -60.0]]);
        assert!(negate_bank(&mut negated, 2).is_err());
    }

    #[test]
    fn test_clamped_cumulative() {
        assert_eq!(
            clamped_cumulative(&[0.0, 2.0, 1.0, 4.0]),
            vec![0.0, 2.0, 2.0, 5.0]
        );
        assert!(clamped_cumulative(&[]).is_empty());
    }

    #[test]
    fn test_round_decimals_ties_even() {
        assert_eq!(round_decimals(0.125, 2), 0.12);
        assert_eq!(round_decimals(2.5, 0), 2.0);
        assert_eq!(round_decimals(1.23456789, 7), 1.2345679);
    }

    proptest! {
        #[test]
        fn prop_bipolar_inverse(angles in prop::collection::vec(0.0f64..360.0, 1..50)) {
            let angles: Vec<f64> = angles.into_iter().filter(|a| *a != 180.0).collect();
            let bipolar = iec_to_bipolar(&angles).unwrap();
            for value in bipolar.iter() {
                prop_assert!(*value > -180.0 && *value <= 180.0);
            }
            let iec = bipolar_to_iec(&bipolar);
            for (a, b) in iec.iter().zip(angles.iter()) {
                prop_assert!((a - b).abs() < 1e-9);
            }
        }
    }
}
