//! Meterset map engine.
//!
//! Integrates a [`Delivery`] into a 2-D grid of monitor units per cell at the isocentre
//! plane. Each control point transition is simulated as continuous, linear leaf and jaw
//! motion sampled at a number of time steps; at every step the open fraction of each
//! cell is computed in closed form and the mean over all steps is weighted by the
//! transition's monitor units.
//!
//! Maps are shaped (jaw, mlc). Grid axes are described by [`MetersetGrid`].
use ndarray::{s, Array2, ArrayView2, ArrayView3};
use serde::{Deserialize, Serialize};

use super::constants::{
    expand_leaf_widths, AGILITY_LEAF_PAIR_WIDTHS, DEFAULT_GRID_RESOLUTION, DEFAULT_MAX_LEAF_GAP,
    DEFAULT_MIN_STEP_PER_PIXEL, GRID_MATCH_TOLERANCE, MIN_TIME_STEPS,
};
use super::delivery::Delivery;
use super::error::MetersetMapError;

/// Engine parameters. Derived from the application [`Config`](crate::config::Config)
#[derive(Debug, Clone, PartialEq)]
pub struct MetersetMapConfig {
    pub grid_resolution: f64,
    pub max_leaf_gap: f64,
    pub leaf_pair_widths: Vec<f64>,
    pub min_step_per_pixel: usize,
}

impl Default for MetersetMapConfig {
    fn default() -> Self {
        Self {
            grid_resolution: DEFAULT_GRID_RESOLUTION,
            max_leaf_gap: DEFAULT_MAX_LEAF_GAP,
            leaf_pair_widths: expand_leaf_widths(&AGILITY_LEAF_PAIR_WIDTHS),
            min_step_per_pixel: DEFAULT_MIN_STEP_PER_PIXEL,
        }
    }
}

/// Cell centre coordinates (mm) of a meterset map along each axis
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetersetGrid {
    pub mlc: Vec<f64>,
    pub jaw: Vec<f64>,
}

/// The travel of one device edge over a transition
struct Edge {
    start: f64,
    end: f64,
    /// +1 for an edge blocking everything below it, -1 for everything above it
    multiplier: f64,
}

impl Edge {
    fn position(&self, step: usize, time_steps: usize) -> f64 {
        let dt = (self.end - self.start) / (time_steps - 1) as f64;
        self.start + step as f64 * dt
    }

    fn travel(&self) -> f64 {
        (self.end - self.start).abs()
    }
}

fn check_multiple(value: f64, resolution: f64) -> Result<(), MetersetMapError> {
    let ratio = value / resolution;
    if (ratio - ratio.round()).abs() > 1.0e-9 {
        return Err(MetersetMapError::GridMisaligned { value, resolution });
    }
    Ok(())
}

/// Inclusive range from start to stop in steps of resolution
fn arange_inclusive(start: f64, stop: f64, resolution: f64) -> Vec<f64> {
    let count = ((stop - start) / resolution).round() as i64 + 1;
    if count <= 0 {
        return Vec::new();
    }
    (0..count)
        .map(|idx| start + idx as f64 * resolution)
        .collect()
}

/// Leaf pair centres and the top edge of the central (reference) pair
fn leaf_centres(leaf_pair_widths: &[f64]) -> (Vec<f64>, f64) {
    let total: f64 = leaf_pair_widths.iter().sum();
    let mut cumulative = 0.0;
    let centres: Vec<f64> = leaf_pair_widths
        .iter()
        .map(|width| {
            cumulative += width;
            cumulative - width / 2.0 - total / 2.0
        })
        .collect();

    let reference = leaf_pair_widths.len() / 2;
    let top_of_reference = match centres.get(reference) {
        Some(centre) => centre + leaf_pair_widths[reference] / 2.0,
        None => 0.0,
    };
    (centres, top_of_reference)
}

fn grid_reference_position(leaf_pair_widths: &[f64], grid_resolution: f64) -> f64 {
    let (_, top_of_reference) = leaf_centres(leaf_pair_widths);
    top_of_reference - grid_resolution / 2.0
}

/// Fraction of a cell blocked by an edge, given the signed distance past the edge
fn blocked_fraction(travel_diff: f64, grid_resolution: f64) -> f64 {
    if travel_diff <= -grid_resolution / 2.0 {
        1.0
    } else if travel_diff >= grid_resolution / 2.0 {
        0.0
    } else {
        (-travel_diff + grid_resolution / 2.0) / grid_resolution
    }
}

/// The full grid every transition is accumulated onto
pub fn get_grid(config: &MetersetMapConfig) -> MetersetGrid {
    let resolution = config.grid_resolution;
    let mlc = arange_inclusive(
        -config.max_leaf_gap / 2.0,
        config.max_leaf_gap / 2.0,
        resolution,
    );

    let reference = grid_reference_position(&config.leaf_pair_widths, resolution);
    let total: f64 = config.leaf_pair_widths.iter().sum();
    let top = ((total / 2.0 - reference) / resolution).ceil() * resolution + reference;
    let bottom = reference - ((total / 2.0 + reference) / resolution).ceil() * resolution;

    MetersetGrid {
        mlc,
        jaw: arange_inclusive(bottom, top, resolution),
    }
}

/// Meterset map of a single transition.
///
/// mlc is shaped (2, leaf pairs, 2) and jaw (2, 2), holding the start and end state.
/// The returned grid only spans the region the leaves and jaws can reach during the
/// transition. A jaw pair that never opens gives an empty grid.
pub fn calc_single_control_point(
    mlc: ArrayView3<f64>,
    jaw: ArrayView2<f64>,
    delivered_mu: f64,
    config: &MetersetMapConfig,
) -> Result<(MetersetGrid, Array2<f64>), MetersetMapError> {
    let resolution = config.grid_resolution;
    let widths = &config.leaf_pair_widths;
    for width in widths.iter() {
        check_multiple(*width, resolution)?;
    }
    if mlc.shape()[1] != widths.len() {
        return Err(MetersetMapError::LeafCountMismatch {
            found: mlc.shape()[1],
            expected: widths.len(),
        });
    }

    let jaw_limit = widths.iter().sum::<f64>() / 2.0;
    let max_jaw = jaw.iter().fold(0.0f64, |acc, value| acc.max(value.abs()));
    if max_jaw > jaw_limit {
        return Err(MetersetMapError::JawOutOfRange {
            position: max_jaw,
            limit: jaw_limit,
        });
    }

    // Jaw direction sub-grid
    let (centres, top_of_reference) = leaf_centres(widths);
    let reference = top_of_reference - resolution / 2.0;
    let min_y = jaw.column(0).iter().map(|y1| -y1).fold(f64::INFINITY, f64::min);
    let max_y = jaw.column(1).iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let top = ((max_y - reference) / resolution).round_ties_even() * resolution + reference;
    let bottom = reference - ((-min_y + reference) / resolution).round_ties_even() * resolution;
    let grid_jaw = arange_inclusive(bottom, top, resolution);
    if grid_jaw.is_empty() || centres.is_empty() {
        return Ok((MetersetGrid::default(), Array2::zeros((0, 0))));
    }

    // Each row is served by the leaf pair with the nearest centre
    let leaf_map: Vec<usize> = grid_jaw
        .iter()
        .map(|y| {
            let mut best = 0;
            for (idx, centre) in centres.iter().enumerate() {
                if (y - centre).abs() < (y - centres[best]).abs() {
                    best = idx;
                }
            }
            best
        })
        .collect();
    let first_leaf = leaf_map.iter().copied().min().unwrap_or(0);
    let last_leaf = leaf_map.iter().copied().max().unwrap_or(0);
    let leaves = mlc.slice(s![.., first_leaf..=last_leaf, ..]);

    // MLC direction sub-grid
    let min_x = leaves
        .slice(s![.., .., 0])
        .iter()
        .map(|a| -a)
        .fold(f64::INFINITY, f64::min);
    let max_x = leaves
        .slice(s![.., .., 1])
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);
    let grid_mlc = arange_inclusive(
        (min_x / resolution).round_ties_even() * resolution,
        (max_x / resolution).round_ties_even() * resolution,
        resolution,
    );

    let n_leaves = last_leaf - first_leaf + 1;
    let left: Vec<Edge> = (0..n_leaves)
        .map(|leaf| Edge {
            start: -leaves[[0, leaf, 0]],
            end: -leaves[[1, leaf, 0]],
            multiplier: 1.0,
        })
        .collect();
    let right: Vec<Edge> = (0..n_leaves)
        .map(|leaf| Edge {
            start: leaves[[0, leaf, 1]],
            end: leaves[[1, leaf, 1]],
            multiplier: -1.0,
        })
        .collect();
    let bottom_jaw = Edge {
        start: -jaw[[0, 0]],
        end: -jaw[[1, 0]],
        multiplier: 1.0,
    };
    let top_jaw = Edge {
        start: jaw[[0, 1]],
        end: jaw[[1, 1]],
        multiplier: -1.0,
    };

    let max_travel = left
        .iter()
        .chain(right.iter())
        .chain([&bottom_jaw, &top_jaw])
        .map(Edge::travel)
        .fold(0.0f64, f64::max);
    let pixels = (max_travel / resolution).ceil() as usize;
    let time_steps = (pixels * config.min_step_per_pixel).max(MIN_TIME_STEPS);

    let blocked = |edge: &Edge, grid_value: f64, step: usize| -> f64 {
        let travel_diff = edge.multiplier * (grid_value - edge.position(step, time_steps));
        blocked_fraction(travel_diff, resolution)
    };

    let mut open_sum = Array2::<f64>::zeros((grid_jaw.len(), grid_mlc.len()));
    let mut mlc_open = Array2::<f64>::zeros((n_leaves, grid_mlc.len()));
    let mut jaw_open = vec![0.0; grid_jaw.len()];
    for step in 0..time_steps {
        for leaf in 0..n_leaves {
            for (col, x) in grid_mlc.iter().enumerate() {
                mlc_open[[leaf, col]] =
                    1.0 - (blocked(&left[leaf], *x, step) + blocked(&right[leaf], *x, step));
            }
        }
        for (row, y) in grid_jaw.iter().enumerate() {
            jaw_open[row] = 1.0 - (blocked(&bottom_jaw, *y, step) + blocked(&top_jaw, *y, step));
        }
        for (row, leaf) in leaf_map.iter().enumerate() {
            let leaf = leaf - first_leaf;
            for col in 0..grid_mlc.len() {
                open_sum[[row, col]] += mlc_open[[leaf, col]] * jaw_open[row];
            }
        }
    }

    let map = open_sum.mapv(|total| total / time_steps as f64 * delivered_mu);
    Ok((
        MetersetGrid {
            mlc: grid_mlc,
            jaw: grid_jaw,
        },
        map,
    ))
}

/// Index of each sub-grid coordinate within the full grid axis
fn full_grid_indices(sub: &[f64], full: &[f64], resolution: f64) -> Vec<Option<usize>> {
    let origin = match full.first() {
        Some(origin) => *origin,
        None => return vec![None; sub.len()],
    };
    sub.iter()
        .map(|value| {
            let idx = ((value - origin) / resolution).round();
            if idx < 0.0 || idx as usize >= full.len() {
                return None;
            }
            let idx = idx as usize;
            ((full[idx] - value).abs() < GRID_MATCH_TOLERANCE).then_some(idx)
        })
        .collect()
}

fn add_to_full_grid(
    full_map: &mut Array2<f64>,
    full_grid: &MetersetGrid,
    grid: &MetersetGrid,
    map: &Array2<f64>,
    resolution: f64,
) {
    let rows = full_grid_indices(&grid.jaw, &full_grid.jaw, resolution);
    let cols = full_grid_indices(&grid.mlc, &full_grid.mlc, resolution);
    for (sub_row, full_row) in rows.iter().enumerate() {
        let Some(full_row) = full_row else { continue };
        for (sub_col, full_col) in cols.iter().enumerate() {
            let Some(full_col) = full_col else { continue };
            full_map[[*full_row, *full_col]] += map[[sub_row, sub_col]];
        }
    }
}

/// Compute the meterset map of a full delivery on the grid of [`get_grid`].
///
/// Fails with [`MetersetMapError::GridMisaligned`] if half the maximum leaf gap or any
/// leaf pair width is not a multiple of the grid resolution, and with
/// [`MetersetMapError::LeafOutOfRange`] if any leaf travels beyond half the maximum
/// leaf gap.
pub fn calc_metersetmap(
    delivery: &Delivery,
    config: &MetersetMapConfig,
) -> Result<Array2<f64>, MetersetMapError> {
    let resolution = config.grid_resolution;
    check_multiple(config.max_leaf_gap / 2.0, resolution)?;
    for width in config.leaf_pair_widths.iter() {
        check_multiple(*width, resolution)?;
    }

    let limit = config.max_leaf_gap / 2.0;
    let mlc = delivery.mlc();
    for (control_point, leaves) in mlc.outer_iter().enumerate() {
        if let Some(position) = leaves.iter().find(|position| position.abs() > limit) {
            return Err(MetersetMapError::LeafOutOfRange {
                control_point,
                position: *position,
                limit,
            });
        }
    }

    let full_grid = get_grid(config);
    let mut full_map = Array2::<f64>::zeros((full_grid.jaw.len(), full_grid.mlc.len()));

    let filtered = delivery.filter_irrelevant();
    let mu = filtered.monitor_units();
    for idx in 0..filtered.len().saturating_sub(1) {
        let (grid, map) = calc_single_control_point(
            filtered.mlc().slice(s![idx..idx + 2, .., ..]),
            filtered.jaw().slice(s![idx..idx + 2, ..]),
            mu[idx + 1] - mu[idx],
            config,
        )?;
        add_to_full_grid(&mut full_map, &full_grid, &grid, &map, resolution);
    }

    spdlog::debug!(
        "Calculated meterset map over {} control points ({} MU)",
        filtered.len(),
        filtered.total_mu()
    );
    Ok(full_map)
}

/// Line profile of a single leaf pair moving from start to end.
///
/// left and right are (start, end) tip positions of each bank along the mlc axis.
/// Returns the mlc axis and the profile for one unit of monitor units.
pub fn single_mlc_pair(
    left: (f64, f64),
    right: (f64, f64),
    grid_resolution: f64,
    min_step_per_pixel: usize,
) -> Result<(Vec<f64>, Vec<f64>), MetersetMapError> {
    let half = grid_resolution / 2.0;
    let jaw = ndarray::array![[half, half], [half, half]];
    let mlc = ndarray::array![[[-left.0, right.0]], [[-left.1, right.1]]];
    let config = MetersetMapConfig {
        grid_resolution,
        max_leaf_gap: DEFAULT_MAX_LEAF_GAP,
        leaf_pair_widths: vec![grid_resolution],
        min_step_per_pixel,
    };

    let (grid, map) = calc_single_control_point(mlc.view(), jaw.view(), 1.0, &config)?;
    let profile = if map.nrows() > 0 {
        map.row(0).to_vec()
    } else {
        Vec::new()
    };
    Ok((grid.mlc, profile))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array3};

    fn assert_close_2d(actual: &Array2<f64>, expected: &Array2<f64>, tolerance: f64) {
        assert_eq!(actual.shape(), expected.shape());
        for (a, e) in actual.iter().zip(expected.iter()) {
            assert!((a - e).abs() <= tolerance, "{a} != {e}\n{actual:?}");
        }
    }

    fn three_pair_config() -> MetersetMapConfig {
        MetersetMapConfig {
            grid_resolution: 1.0,
            max_leaf_gap: 10.0,
            leaf_pair_widths: vec![5.0, 5.0, 5.0],
            min_step_per_pixel: 10,
        }
    }

    #[test]
    fn test_static_field_three_pairs() {
        let mu = vec![0.0, 2.0, 5.0, 10.0];
        let mlc = array![
            [[1.0, 1.0], [2.0, 2.0], [3.0, 3.0]],
            [[2.0, 2.0], [3.0, 3.0], [4.0, 4.0]],
            [[-2.0, 3.0], [-2.0, 4.0], [-2.0, 5.0]],
            [[0.0, 0.0], [0.0, 0.0], [0.0, 0.0]],
        ];
        let jaw = array![[7.5, 7.5], [7.5, 7.5], [-2.0, 7.5], [0.0, 0.0]];
        let delivery = Delivery::new(mu, vec![0.0; 4], vec![0.0; 4], mlc, jaw).unwrap();

        let config = three_pair_config();
        let map = calc_metersetmap(&delivery, &config).unwrap();
        let grid = get_grid(&config);
        assert_eq!(grid.mlc, arange_inclusive(-5.0, 5.0, 1.0));
        assert_eq!(grid.jaw, arange_inclusive(-8.0, 8.0, 1.0));

        let expected = array![
            [0., 0., 0., 0., 0., 0., 0., 0., 0., 0., 0.],
            [0., 0., 0., 0.3, 1.9, 2.2, 1.9, 0.4, 0., 0., 0.],
            [0., 0., 0., 0.4, 2.2, 2.5, 2.2, 0.6, 0., 0., 0.],
            [0., 0., 0., 0.4, 2.4, 2.8, 2.5, 0.8, 0., 0., 0.],
            [0., 0., 0., 0.4, 2.5, 3.1, 2.8, 1., 0., 0., 0.],
            [0., 0., 0., 0.4, 2.5, 3.4, 3.1, 1.3, 0., 0., 0.],
            [0., 0., 0.4, 2.3, 3.2, 3.7, 3.7, 3.5, 1.6, 0., 0.],
            [0., 0., 0.4, 2.3, 3.2, 3.8, 4., 3.8, 1.9, 0.1, 0.],
            [0., 0., 0.4, 2.3, 3.2, 3.8, 4.3, 4.1, 2.3, 0.1, 0.],
            [0., 0., 0.4, 2.3, 3.2, 3.9, 5.2, 4.7, 2.6, 0.2, 0.],
            [0., 0., 0.4, 2.3, 3.2, 3.8, 5.4, 6.6, 3.8, 0.5, 0.],
            [0., 0.3, 2.2, 3., 3.5, 4., 5.1, 7.5, 6.7, 3.9, 0.5],
            [0., 0.3, 2.2, 3., 3.5, 4., 4.7, 6.9, 6.7, 3.9, 0.5],
            [0., 0.3, 2.2, 3., 3.5, 4., 4.5, 6.3, 6.4, 3.9, 0.5],
            [0., 0.3, 2.2, 3., 3.5, 4., 4.5, 5.6, 5.7, 3.8, 0.5],
            [0., 0.3, 2.2, 3., 3.5, 4., 4.5, 5.1, 5.1, 3.3, 0.5],
            [0., 0., 0., 0., 0., 0., 0., 0., 0., 0., 0.],
        ];
        assert_close_2d(&map, &expected, 0.05 + 1e-9);
        assert!((map[[11, 5]] - 4.0).abs() <= 0.05);
    }

    #[test]
    fn test_single_control_point() {
        let mlc = array![[[1.0, 1.0], [2.0, 2.0]], [[2.0, 2.0], [3.0, 3.0]]];
        let jaw = array![[1.5, 1.2], [1.5, 1.2]];
        let config = MetersetMapConfig {
            leaf_pair_widths: vec![2.0, 2.0],
            ..MetersetMapConfig::default()
        };
        let (grid, map) = calc_single_control_point(mlc.view(), jaw.view(), 1.0, &config).unwrap();
        assert_eq!(grid.mlc, arange_inclusive(-3.0, 3.0, 1.0));
        assert_eq!(grid.jaw, vec![-1.5, -0.5, 0.5, 1.5]);

        let expected = array![
            [0., 0.07, 0.43, 0.5, 0.43, 0.07, 0.],
            [0., 0.14, 0.86, 1., 0.86, 0.14, 0.],
            [0.14, 0.86, 1., 1., 1., 0.86, 0.14],
            [0.03, 0.17, 0.2, 0.2, 0.2, 0.17, 0.03],
        ];
        assert_close_2d(&map, &expected, 0.005 + 1e-9);
    }

    #[test]
    fn test_single_mlc_pair_sweep() {
        let (x, profile) = single_mlc_pair((-2.3, 3.1), (0.0, 7.7), 1.0, 10).unwrap();
        assert_eq!(x, arange_inclusive(-2.0, 8.0, 1.0));
        let expected = [
            0.064, 0.244, 0.408, 0.475, 0.530, 0.572, 0.481, 0.352, 0.224, 0.096, 0.004,
        ];
        assert_eq!(profile.len(), expected.len());
        for (a, e) in profile.iter().zip(expected.iter()) {
            assert!((a - e).abs() <= 0.0005 + 1e-9, "{a} != {e}");
        }
    }

    fn static_square_delivery(total_mu: f64) -> Delivery {
        let mlc = Array3::from_elem((2, 4, 2), 2.0);
        let jaw = Array2::from_elem((2, 2), 7.5);
        Delivery::new(vec![0.0, total_mu], vec![0.0; 2], vec![0.0; 2], mlc, jaw).unwrap()
    }

    fn four_pair_config() -> MetersetMapConfig {
        MetersetMapConfig {
            grid_resolution: 1.0,
            max_leaf_gap: 20.0,
            leaf_pair_widths: vec![5.0; 4],
            min_step_per_pixel: 10,
        }
    }

    #[test]
    fn test_total_mu_round_trip() {
        let delivery = static_square_delivery(3.0);
        let map = calc_metersetmap(&delivery, &four_pair_config()).unwrap();
        let expected = delivery.total_mu() * 4.0 * 15.0;
        assert!((map.sum() - expected).abs() <= 1e-9 * expected);
    }

    #[test]
    fn test_deterministic() {
        let delivery = static_square_delivery(2.0)
            .merge(&static_square_delivery(1.5))
            .unwrap();
        let config = four_pair_config();
        let first = calc_metersetmap(&delivery, &config).unwrap();
        let second = calc_metersetmap(&delivery, &config).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_preconditions() {
        let delivery = static_square_delivery(1.0);

        let misaligned = MetersetMapConfig {
            grid_resolution: 2.0,
            max_leaf_gap: 20.0,
            leaf_pair_widths: vec![5.0; 4],
            min_step_per_pixel: 10,
        };
        assert!(matches!(
            calc_metersetmap(&delivery, &misaligned),
            Err(MetersetMapError::GridMisaligned { .. })
        ));

        let narrow = MetersetMapConfig {
            max_leaf_gap: 2.0,
            ..four_pair_config()
        };
        assert!(matches!(
            calc_metersetmap(&delivery, &narrow),
            Err(MetersetMapError::LeafOutOfRange { control_point: 0, .. })
        ));

        let short_leaves = MetersetMapConfig {
            leaf_pair_widths: vec![5.0; 2],
            ..four_pair_config()
        };
        assert!(matches!(
            calc_metersetmap(&delivery, &short_leaves),
            Err(MetersetMapError::LeafCountMismatch { .. })
        ));
    }

    #[test]
    fn test_closed_jaw_contributes_nothing() {
        let mlc = Array3::from_elem((2, 4, 2), 2.0);
        let jaw = array![[-3.0, -3.0], [-3.0, -3.0]];
        let delivery = Delivery::new(vec![0.0, 5.0], vec![0.0; 2], vec![0.0; 2], mlc, jaw).unwrap();
        let map = calc_metersetmap(&delivery, &four_pair_config()).unwrap();
        assert_eq!(map.sum(), 0.0);
    }

    #[test]
    fn test_agility_grid() {
        let grid = get_grid(&MetersetMapConfig::default());
        assert_eq!(grid.mlc.len(), 401);
        assert_eq!(grid.mlc[0], -200.0);
        assert_eq!(grid.jaw.first(), Some(&-200.5));
        assert_eq!(grid.jaw.last(), Some(&200.5));
    }
}
