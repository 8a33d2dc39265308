//! Training-sample selection from co-registered label and feature tiles.
//!
//! A pixel is a foreground sample when its label is non-zero and none of its
//! bands is zero. A pixel whose bands are all zero and whose label is zero is a
//! background sample, accepted only while the zero quota has room. Everything
//! else is left out of training.
use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Default cap on background samples per tile.
pub const DEFAULT_ZERO_QUOTA: usize = 1000;

// ── Arrays ────────────────────────────────────────────────────────────────────

/// Per-pixel class labels of one tile, row-major. 0 = unlabeled; negative
/// values (nodata) are stored as 0.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelArray {
    pub rows: usize,
    pub cols: usize,
    data: Vec<i64>,
}

impl LabelArray {
    pub fn new(rows: usize, cols: usize, mut data: Vec<i64>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(Error::InvalidArgument(format!(
                "label array holds {} values, expected {}x{}",
                data.len(),
                rows,
                cols
            )));
        }
        for v in &mut data {
            if *v < 0 {
                *v = 0;
            }
        }
        Ok(Self { rows, cols, data })
    }

    /// Labels from a raster band; fractional values are truncated toward zero.
    pub fn from_band(rows: usize, cols: usize, band: &[f64]) -> Result<Self> {
        let data = band
            .iter()
            .map(|&v| if v.is_finite() { v as i64 } else { 0 })
            .collect();
        Self::new(rows, cols, data)
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> i64 {
        self.data[row * self.cols + col]
    }

    pub fn as_slice(&self) -> &[i64] {
        &self.data
    }
}

/// Band values of one tile, indexed (row, col, band) with bands innermost, so
/// `as_slice()` is already the flattened `pixels x bands` matrix. Negative and
/// NaN values are stored as 0.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureArray {
    pub rows: usize,
    pub cols: usize,
    pub bands: usize,
    data: Vec<f64>,
}

impl FeatureArray {
    /// Build from pixel-interleaved values.
    pub fn new(rows: usize, cols: usize, bands: usize, mut data: Vec<f64>) -> Result<Self> {
        if bands == 0 {
            return Err(Error::InvalidArgument("feature array needs at least one band".into()));
        }
        if data.len() != rows * cols * bands {
            return Err(Error::InvalidArgument(format!(
                "feature array holds {} values, expected {}x{}x{}",
                data.len(),
                rows,
                cols,
                bands
            )));
        }
        for v in &mut data {
            if v.is_nan() || *v < 0.0 {
                *v = 0.0;
            }
        }
        Ok(Self { rows, cols, bands, data })
    }

    /// Build from band-sequential buffers (one row-major buffer per band).
    pub fn from_bands(rows: usize, cols: usize, band_data: &[Vec<f64>]) -> Result<Self> {
        let bands = band_data.len();
        let pixels = rows * cols;
        if let Some(bad) = band_data.iter().find(|b| b.len() != pixels) {
            return Err(Error::InvalidArgument(format!(
                "band holds {} values, expected {}",
                bad.len(),
                pixels
            )));
        }
        let mut data = Vec::with_capacity(pixels * bands);
        for p in 0..pixels {
            data.extend(band_data.iter().map(|b| b[p]));
        }
        Self::new(rows, cols, bands, data)
    }

    /// Feature vector of one pixel.
    #[inline]
    pub fn pixel(&self, row: usize, col: usize) -> &[f64] {
        let start = (row * self.cols + col) * self.bands;
        &self.data[start..start + self.bands]
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Flatten into a `pixels x bands` matrix for prediction.
    pub fn into_matrix(self) -> FeatureMatrix {
        FeatureMatrix {
            n_rows: self.rows * self.cols,
            n_cols: self.bands,
            data: self.data,
        }
    }
}

/// Dense row-major sample matrix: one row per sample, one column per band.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FeatureMatrix {
    pub n_rows: usize,
    pub n_cols: usize,
    data: Vec<f64>,
}

impl FeatureMatrix {
    pub fn from_vec(n_rows: usize, n_cols: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != n_rows * n_cols {
            return Err(Error::InvalidArgument(format!(
                "matrix data holds {} values, expected {}x{}",
                data.len(),
                n_rows,
                n_cols
            )));
        }
        Ok(Self { n_rows, n_cols, data })
    }

    fn with_columns(n_cols: usize) -> Self {
        Self {
            n_rows: 0,
            n_cols,
            data: Vec::new(),
        }
    }

    fn push_row(&mut self, row: &[f64]) {
        debug_assert_eq!(row.len(), self.n_cols);
        self.data.extend_from_slice(row);
        self.n_rows += 1;
    }

    #[inline]
    pub fn row(&self, i: usize) -> &[f64] {
        &self.data[i * self.n_cols..(i + 1) * self.n_cols]
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.n_cols + col]
    }

    pub fn is_empty(&self) -> bool {
        self.n_rows == 0
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }
}

/// Labeled samples for one tile; `features.row(i)` belongs to `labels[i]`.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSet {
    pub features: FeatureMatrix,
    pub labels: Vec<i64>,
}

impl TrainingSet {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Number of distinct label values.
    pub fn class_count(&self) -> usize {
        class_counts(&self.labels).len()
    }
}

// ── Quota accumulator ─────────────────────────────────────────────────────────

/// Running count of accepted background samples against a fixed cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZeroQuota {
    cap: usize,
    taken: usize,
}

impl ZeroQuota {
    pub fn new(cap: usize) -> Self {
        Self { cap, taken: 0 }
    }

    pub fn taken(&self) -> usize {
        self.taken
    }

    pub fn remaining(&self) -> usize {
        self.cap - self.taken
    }

    /// Claim one slot; false once the cap is reached.
    fn try_take(&mut self) -> bool {
        if self.taken < self.cap {
            self.taken += 1;
            true
        } else {
            false
        }
    }
}

// ── Selection ─────────────────────────────────────────────────────────────────

/// Build the training set for one tile with a fresh background quota of
/// `zero_quota`.
pub fn select_training_samples(labels: &LabelArray, features: &FeatureArray, zero_quota: usize) -> Result<TrainingSet> {
    let mut quota = ZeroQuota::new(zero_quota);
    select_with_quota(labels, features, &mut quota)
}

/// Single row-major pass over the tile, drawing background samples from
/// `quota`. Samples keep scan order.
pub fn select_with_quota(labels: &LabelArray, features: &FeatureArray, quota: &mut ZeroQuota) -> Result<TrainingSet> {
    if labels.rows != features.rows || labels.cols != features.cols {
        return Err(Error::FootprintMismatch {
            expected_rows: labels.rows,
            expected_cols: labels.cols,
            actual_rows: features.rows,
            actual_cols: features.cols,
        });
    }

    let mut matrix = FeatureMatrix::with_columns(features.bands);
    let mut out_labels = Vec::new();

    for i in 0..labels.rows {
        for j in 0..labels.cols {
            let label = labels.get(i, j);
            let pixel = features.pixel(i, j);

            let foreground = label != 0 && pixel.iter().all(|&v| v != 0.0);
            let background = !foreground && label == 0 && pixel.iter().all(|&v| v == 0.0) && quota.try_take();

            if foreground || background {
                matrix.push_row(pixel);
                out_labels.push(label);
            }
        }
    }

    Ok(TrainingSet {
        features: matrix,
        labels: out_labels,
    })
}

// ── Summaries ─────────────────────────────────────────────────────────────────

/// Pixel count per class, ascending by class.
pub fn class_counts(labels: &[i64]) -> BTreeMap<i64, usize> {
    let mut counts = BTreeMap::new();
    for &l in labels {
        *counts.entry(l).or_insert(0) += 1;
    }
    counts
}

/// Number of distinct values in a band. -0.0 and 0.0 count as one; every NaN
/// counts as the same value.
pub fn distinct_values(values: &[f64]) -> usize {
    let mut sorted: Vec<f64> = values
        .iter()
        .map(|&v| if v == 0.0 { 0.0 } else if v.is_nan() { f64::NAN } else { v })
        .collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    sorted.dedup_by(|a, b| a.total_cmp(b).is_eq());
    sorted.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tile(labels: Vec<i64>, pixels: Vec<[f64; 2]>, cols: usize) -> (LabelArray, FeatureArray) {
        let rows = labels.len() / cols;
        let data = pixels.iter().flat_map(|p| p.iter().copied()).collect();
        (
            LabelArray::new(rows, cols, labels).unwrap(),
            FeatureArray::new(rows, cols, 2, data).unwrap(),
        )
    }

    #[test]
    fn foreground_needs_label_and_every_band_non_zero() {
        let (labels, features) = tile(
            vec![1, 2, 3, 0],
            vec![[5.0, 6.0], [7.0, 0.0], [8.0, 9.0], [4.0, 4.0]],
            2,
        );
        let set = select_training_samples(&labels, &features, 0).unwrap();
        assert_eq!(set.labels, vec![1, 3]);
        assert_eq!(set.features.row(0), &[5.0, 6.0]);
        assert_eq!(set.features.row(1), &[8.0, 9.0]);
    }

    #[test]
    fn background_needs_all_zero_bands_and_zero_label() {
        let (labels, features) = tile(
            vec![0, 0, 4, 0],
            vec![[0.0, 0.0], [0.0, 3.0], [0.0, 0.0], [2.0, 2.0]],
            2,
        );
        let set = select_training_samples(&labels, &features, 10).unwrap();
        // (0,0) is background; (0,1) partial zeros; (1,0) labeled but no data;
        // (1,1) unlabeled valid imagery.
        assert_eq!(set.labels, vec![0]);
        assert_eq!(set.features.row(0), &[0.0, 0.0]);
    }

    #[test]
    fn zero_quota_keeps_first_n_background_pixels_in_scan_order() {
        // 3 foreground pixels interleaved with 7 background pixels.
        let labels = vec![0, 1, 0, 0, 2, 0, 0, 0, 3, 0];
        let pixels = labels
            .iter()
            .map(|&l| if l == 0 { [0.0, 0.0] } else { [l as f64, 1.0] })
            .collect();
        let (labels, features) = tile(labels, pixels, 5);

        let mut quota = ZeroQuota::new(4);
        let set = select_with_quota(&labels, &features, &mut quota).unwrap();

        assert_eq!(quota.taken(), 4);
        assert_eq!(quota.remaining(), 0);
        // background accepted at scan positions 0, 2, 3, 5; later ones dropped
        // while foreground keeps flowing.
        assert_eq!(set.labels, vec![0, 1, 0, 0, 2, 0, 3]);
    }

    #[test]
    fn quota_is_independent_of_foreground_count() {
        let labels = vec![5, 5, 5, 5, 0, 0];
        let pixels = vec![[1.0, 1.0], [1.0, 1.0], [1.0, 1.0], [1.0, 1.0], [0.0, 0.0], [0.0, 0.0]];
        let (labels, features) = tile(labels, pixels, 3);
        let set = select_training_samples(&labels, &features, 2).unwrap();
        assert_eq!(class_counts(&set.labels), BTreeMap::from([(0, 2), (5, 4)]));
    }

    #[test]
    fn negative_values_are_treated_as_no_data() {
        let (labels, features) = tile(vec![-1, 2], vec![[-3.0, -3.0], [-1.0, 4.0]], 2);
        assert_eq!(labels.as_slice(), &[0, 2]);
        assert_eq!(features.pixel(0, 1), &[0.0, 4.0]);

        let set = select_training_samples(&labels, &features, 5).unwrap();
        // (0,0) becomes background; (0,1) now has a zero band → excluded.
        assert_eq!(set.labels, vec![0]);
    }

    #[test]
    fn selection_is_deterministic() {
        let labels: Vec<i64> = (0..400).map(|i| (i * 7 % 5) as i64).collect();
        let pixels: Vec<[f64; 2]> = (0..400)
            .map(|i| if i % 3 == 0 { [0.0, 0.0] } else { [(i % 11) as f64, (i % 13) as f64] })
            .collect();
        let (labels, features) = tile(labels, pixels, 20);
        let a = select_training_samples(&labels, &features, 17).unwrap();
        let b = select_training_samples(&labels, &features, 17).unwrap();
        assert_eq!(a, b);
        assert!(!a.is_empty());
    }

    #[test]
    fn mismatched_footprints_are_rejected() {
        let labels = LabelArray::new(2, 2, vec![1; 4]).unwrap();
        let features = FeatureArray::new(2, 3, 1, vec![1.0; 6]).unwrap();
        assert!(matches!(
            select_training_samples(&labels, &features, 1),
            Err(Error::FootprintMismatch { .. })
        ));
    }

    #[test]
    fn from_bands_interleaves_per_pixel() {
        let f = FeatureArray::from_bands(1, 2, &[vec![1.0, 2.0], vec![10.0, 20.0]]).unwrap();
        assert_eq!(f.as_slice(), &[1.0, 10.0, 2.0, 20.0]);
        let m = f.into_matrix();
        assert_eq!((m.n_rows, m.n_cols), (2, 2));
        assert_eq!(m.row(1), &[2.0, 20.0]);
    }

    #[test]
    fn distinct_values_counts_unique_samples() {
        assert_eq!(distinct_values(&[0.0, -0.0, 0.0]), 1);
        assert_eq!(distinct_values(&[3.0, 1.0, 3.0, 2.0]), 3);
        assert_eq!(distinct_values(&[]), 0);
    }
}
