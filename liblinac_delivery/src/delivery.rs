use bitvec::prelude::*;
use ndarray::{concatenate, stack, Array2, Array3, ArrayView2, ArrayView3, Axis};

use super::constants::MASK_MU_DECIMALS;
use super::error::DeliveryError;
use super::transforms::{clamped_cumulative, round_decimals};

/// A beam's control point sequence in canonical (bipolar, mm) form.
///
/// Every attribute shares the control point axis. The MLC is shaped
/// (control points, leaf pairs, 2) where column 0 is the -x bank and column 1 the
/// +x bank; the jaw is shaped (control points, 2) holding (y1, y2). Monitor units
/// start at 0 and never decrease.
///
/// A Delivery is never mutated once built; every operation returns a new value.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    monitor_units: Vec<f64>,
    gantry: Vec<f64>,
    collimator: Vec<f64>,
    mlc: Array3<f64>,
    jaw: Array2<f64>,
}

impl Default for Delivery {
    fn default() -> Self {
        Self::empty()
    }
}

impl Delivery {
    /// Build a Delivery, validating the shared length and monitor unit invariants
    pub fn new(
        monitor_units: Vec<f64>,
        gantry: Vec<f64>,
        collimator: Vec<f64>,
        mlc: Array3<f64>,
        jaw: Array2<f64>,
    ) -> Result<Self, DeliveryError> {
        if mlc.shape()[2] != 2 || jaw.shape()[1] != 2 {
            return Err(DeliveryError::BadShape(
                mlc.shape().to_vec(),
                jaw.shape().to_vec(),
            ));
        }

        let n = monitor_units.len();
        if gantry.len() != n
            || collimator.len() != n
            || mlc.shape()[0] != n
            || jaw.shape()[0] != n
        {
            return Err(DeliveryError::MismatchedLengths {
                mu: n,
                gantry: gantry.len(),
                collimator: collimator.len(),
                mlc: mlc.shape()[0],
                jaw: jaw.shape()[0],
            });
        }

        if let Some(first) = monitor_units.first() {
            if *first != 0.0 {
                return Err(DeliveryError::NonZeroStart(*first));
            }
        }
        if let Some(idx) = monitor_units.windows(2).position(|pair| pair[1] < pair[0]) {
            return Err(DeliveryError::DecreasingMonitorUnits(idx + 1));
        }

        Ok(Self {
            monitor_units,
            gantry,
            collimator,
            mlc,
            jaw,
        })
    }

    /// Build a Delivery from per control point leaf arrays (leaf pairs, 2) and jaw pairs
    pub fn from_control_points(
        monitor_units: Vec<f64>,
        gantry: Vec<f64>,
        collimator: Vec<f64>,
        mlc: &[Array2<f64>],
        jaw: &[[f64; 2]],
    ) -> Result<Self, DeliveryError> {
        if mlc.is_empty() && jaw.is_empty() && monitor_units.is_empty() {
            return Ok(Self::empty());
        }
        let mlc_views: Vec<ArrayView2<f64>> = mlc.iter().map(|leaves| leaves.view()).collect();
        let mlc = if mlc_views.is_empty() {
            Array3::zeros((0, 0, 2))
        } else {
            stack(Axis(0), &mlc_views)?
        };
        let jaw_flat: Vec<f64> = jaw.iter().flat_map(|pair| pair.iter().copied()).collect();
        let jaw = Array2::from_shape_vec((jaw.len(), 2), jaw_flat)?;

        Self::new(monitor_units, gantry, collimator, mlc, jaw)
    }

    /// A Delivery with no control points
    pub fn empty() -> Self {
        Self {
            monitor_units: Vec::new(),
            gantry: Vec::new(),
            collimator: Vec::new(),
            mlc: Array3::zeros((0, 0, 2)),
            jaw: Array2::zeros((0, 2)),
        }
    }

    pub fn monitor_units(&self) -> &[f64] {
        &self.monitor_units
    }

    pub fn gantry(&self) -> &[f64] {
        &self.gantry
    }

    pub fn collimator(&self) -> &[f64] {
        &self.collimator
    }

    pub fn mlc(&self) -> ArrayView3<f64> {
        self.mlc.view()
    }

    pub fn jaw(&self) -> ArrayView2<f64> {
        self.jaw.view()
    }

    pub fn len(&self) -> usize {
        self.monitor_units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.monitor_units.is_empty()
    }

    pub fn num_leaf_pairs(&self) -> usize {
        self.mlc.shape()[1]
    }

    /// Cumulative monitor units at the final control point
    pub fn total_mu(&self) -> f64 {
        self.monitor_units.last().copied().unwrap_or(0.0)
    }

    /// Append other after self along the control point axis.
    ///
    /// Monitor units are rebuilt from clamped forward differences so the join never
    /// produces a decrease.
    pub fn merge(&self, other: &Delivery) -> Result<Self, DeliveryError> {
        if other.is_empty() {
            return Ok(self.clone());
        }
        if self.is_empty() {
            return Ok(other.clone());
        }
        if self.num_leaf_pairs() != other.num_leaf_pairs() {
            return Err(DeliveryError::MismatchedLeafPairs(
                self.num_leaf_pairs(),
                other.num_leaf_pairs(),
            ));
        }

        let joined_mu: Vec<f64> = self
            .monitor_units
            .iter()
            .chain(other.monitor_units.iter())
            .copied()
            .collect();

        Ok(Self {
            monitor_units: clamped_cumulative(&joined_mu),
            gantry: [self.gantry.as_slice(), other.gantry.as_slice()].concat(),
            collimator: [self.collimator.as_slice(), other.collimator.as_slice()].concat(),
            mlc: concatenate(Axis(0), &[self.mlc.view(), other.mlc.view()])?,
            jaw: concatenate(Axis(0), &[self.jaw.view(), other.jaw.view()])?,
        })
    }

    /// Merge a sequence of deliveries in order
    pub fn combine(deliveries: &[Delivery]) -> Result<Self, DeliveryError> {
        let mut combined = Self::empty();
        for delivery in deliveries {
            combined = combined.merge(delivery)?;
        }
        Ok(combined)
    }

    /// Remove interior control points that no monitor units flow through.
    ///
    /// Point k is dropped when mu[k-1] == mu[k] == mu[k+1]. The first and last point of
    /// every hold, along with the sequence endpoints, are kept.
    pub fn filter_irrelevant(&self) -> Self {
        let mu = &self.monitor_units;
        let keep: Vec<usize> = (0..mu.len())
            .filter(|k| {
                *k == 0 || *k + 1 == mu.len() || !(mu[k - 1] == mu[*k] && mu[*k] == mu[k + 1])
            })
            .collect();
        self.select(&keep)
    }

    /// Keep every skip-th control point, always retaining the last one
    pub fn decimate(&self, skip: usize) -> Result<Self, DeliveryError> {
        if skip == 0 {
            return Err(DeliveryError::BadDecimation);
        }
        let mut keep: Vec<usize> = (0..self.len()).step_by(skip).collect();
        if let Some(last) = self.len().checked_sub(1) {
            if keep.last() != Some(&last) {
                keep.push(last);
            }
        }
        Ok(self.select(&keep))
    }

    /// One masked Delivery per requested angle, each holding the control points whose
    /// gantry lies within tolerance of that angle.
    ///
    /// Masks must be a single contiguous run, otherwise [`DeliveryError::DuplicateAngle`].
    /// Control points outside every mask fail with [`DeliveryError::AngleOutOfTolerance`]
    /// unless allow_missing is set. Each masked Delivery has its monitor units rebased to
    /// start at 0.
    pub fn mask_by_gantry(
        &self,
        angles: &[f64],
        tolerance: f64,
        allow_missing: bool,
    ) -> Result<Vec<Self>, DeliveryError> {
        let masks = angles
            .iter()
            .map(|angle| self.gantry_mask(*angle, tolerance))
            .collect::<Result<Vec<BitVec>, DeliveryError>>()?;

        if !allow_missing {
            let mut missing: Vec<f64> = (0..self.len())
                .filter(|idx| !masks.iter().any(|mask| mask[*idx]))
                .map(|idx| self.gantry[idx])
                .collect();
            if !missing.is_empty() {
                missing.sort_by(|a, b| a.total_cmp(b));
                missing.dedup();
                return Err(DeliveryError::AngleOutOfTolerance {
                    angles: missing,
                    tolerance,
                });
            }
        }

        Ok(masks.iter().map(|mask| self.apply_mask(mask)).collect())
    }

    /// Mask a single gantry angle window
    pub fn extract_one_gantry_angle(
        &self,
        angle: f64,
        tolerance: f64,
    ) -> Result<Self, DeliveryError> {
        let mask = self.gantry_mask(angle, tolerance)?;
        Ok(self.apply_mask(&mask))
    }

    /// Final monitor units of every non-empty gantry window
    pub fn metersets(&self, angles: &[f64], tolerance: f64) -> Result<Vec<f64>, DeliveryError> {
        Ok(self
            .mask_by_gantry(angles, tolerance, true)?
            .iter()
            .filter(|masked| !masked.is_empty())
            .map(|masked| masked.total_mu())
            .collect())
    }

    fn gantry_mask(&self, angle: f64, tolerance: f64) -> Result<BitVec, DeliveryError> {
        let mask: BitVec = self
            .gantry
            .iter()
            .map(|gantry| (gantry - angle).abs() <= tolerance)
            .collect();

        if let (Some(first), Some(last)) = (mask.first_one(), mask.last_one()) {
            if mask[first..=last].not_all() {
                return Err(DeliveryError::DuplicateAngle(angle));
            }
        }
        Ok(mask)
    }

    fn apply_mask(&self, mask: &BitSlice) -> Self {
        let indices: Vec<usize> = mask.iter_ones().collect();
        let mut masked = self.select(&indices);
        if let Some(start) = masked.monitor_units.first().copied() {
            masked
                .monitor_units
                .iter_mut()
                .for_each(|mu| *mu = round_decimals(*mu - start, MASK_MU_DECIMALS));
        }
        masked
    }

    fn select(&self, indices: &[usize]) -> Self {
        Self {
            monitor_units: indices.iter().map(|idx| self.monitor_units[*idx]).collect(),
            gantry: indices.iter().map(|idx| self.gantry[*idx]).collect(),
            collimator: indices.iter().map(|idx| self.collimator[*idx]).collect(),
            mlc: self.mlc.select(Axis(0), indices),
            jaw: self.jaw.select(Axis(0), indices),
        }
    }
}
