use ndarray::Array2;

use super::delivery::Delivery;
use super::error::GantrySelectorError;
use super::metersetmap::{calc_metersetmap, MetersetMapConfig};

/// Per gantry angle meterset maps of an arc delivery
#[derive(Debug, Clone)]
pub struct GantryMaps {
    pub angles: Vec<f64>,
    pub maps: Vec<Array2<f64>>,
    /// Total meterset across all angles divided by the number of requested angles
    pub normalisation: f64,
}

/// Split a delivery into gantry windows and compute one meterset map per window.
///
/// Every control point must fall within tolerance of one of the angles.
pub fn metersetmaps_by_gantry(
    delivery: &Delivery,
    angles: &[f64],
    tolerance: f64,
    config: &MetersetMapConfig,
) -> Result<GantryMaps, GantrySelectorError> {
    if angles.is_empty() {
        return Err(GantrySelectorError::NoAngles);
    }

    let masked = delivery.mask_by_gantry(angles, tolerance, false)?;
    let maps = masked
        .iter()
        .map(|segment| calc_metersetmap(segment, config))
        .collect::<Result<Vec<_>, _>>()?;

    let total: f64 = delivery.metersets(angles, tolerance)?.iter().sum();
    let normalisation = total / angles.len() as f64;

    for (angle, segment) in angles.iter().zip(masked.iter()) {
        spdlog::info!(
            "Gantry {angle}: {} control points, {} MU",
            segment.len(),
            segment.total_mu()
        );
    }

    Ok(GantryMaps {
        angles: angles.to_vec(),
        maps,
        normalisation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn arc_delivery() -> Delivery {
        let mlc = Array3::from_elem((6, 4, 2), 2.0);
        let jaw = Array2::from_elem((6, 2), 7.5);
        Delivery::new(
            vec![0.0, 1.0, 2.0, 2.0, 4.0, 6.0],
            vec![-1.0, 0.0, 1.0, 89.0, 90.0, 91.0],
            vec![0.0; 6],
            mlc,
            jaw,
        )
        .unwrap()
    }

    fn config() -> MetersetMapConfig {
        MetersetMapConfig {
            grid_resolution: 1.0,
            max_leaf_gap: 20.0,
            leaf_pair_widths: vec![5.0; 4],
            min_step_per_pixel: 10,
        }
    }

    #[test]
    fn test_maps_per_angle() {
        let maps = metersetmaps_by_gantry(&arc_delivery(), &[0.0, 90.0], 3.0, &config()).unwrap();
        assert_eq!(maps.maps.len(), 2);
        assert!((maps.maps[0].sum() - 2.0 * 60.0).abs() < 1e-9);
        assert!((maps.maps[1].sum() - 4.0 * 60.0).abs() < 1e-9);
        assert!((maps.normalisation - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_missing_angle_fails() {
        let result = metersetmaps_by_gantry(&arc_delivery(), &[0.0], 3.0, &config());
        assert!(matches!(
            result,
            Err(GantrySelectorError::DeliveryError(_))
        ));
        assert!(matches!(
            metersetmaps_by_gantry(&arc_delivery(), &[], 3.0, &config()),
            Err(GantrySelectorError::NoAngles)
        ));
    }
}
