//! Per-tile classification: guard, select training samples, fit, predict every
//! pixel, write the class raster.
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::forest::{Classifier, ForestParams, Predictor};
use crate::raster::{read_raster, write_raster, Raster, OUTPUT_NODATA};
use crate::selection::{class_counts, distinct_values, select_training_samples, FeatureArray, LabelArray, DEFAULT_ZERO_QUOTA};

/// Why a tile had nothing to learn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The label band holds a single value.
    TooFewLabelValues,
    /// The first raw band holds a single value.
    TooFewFeatureValues,
    /// Selection kept fewer than two classes.
    TooFewTrainingClasses,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SkipReason::TooFewLabelValues => "fewer than 2 distinct label values",
            SkipReason::TooFewFeatureValues => "fewer than 2 distinct raw values",
            SkipReason::TooFewTrainingClasses => "fewer than 2 classes in the training set",
        };
        f.write_str(text)
    }
}

/// Diagnostics of one fitted tile.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FitStats {
    pub training_samples: usize,
    pub training_counts: BTreeMap<i64, usize>,
    pub predicted_counts: BTreeMap<i64, usize>,
    pub oob_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Prediction {
    Classified { raster: ClassifiedRaster, stats: FitStats },
    Skipped(SkipReason),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TileOutcome {
    Classified { output: PathBuf, stats: FitStats },
    Skipped(SkipReason),
}

/// One predicted class per pixel, row-major over the tile footprint.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedRaster {
    pub rows: usize,
    pub cols: usize,
    data: Vec<i64>,
}

impl ClassifiedRaster {
    pub fn new(rows: usize, cols: usize, data: Vec<i64>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(Error::Model(format!(
                "prediction holds {} labels for a {}x{} tile",
                data.len(),
                rows,
                cols
            )));
        }
        Ok(Self { rows, cols, data })
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> i64 {
        self.data[row * self.cols + col]
    }

    pub fn as_slice(&self) -> &[i64] {
        &self.data
    }

    /// Single-band raster in `template`'s pixel type and georeferencing, with
    /// the output nodata sentinel declared.
    pub fn to_raster(&self, template: &Raster) -> Result<Raster> {
        let band = self.data.iter().map(|&v| v as f64).collect();
        let mut raster = Raster::new(self.cols, self.rows, template.pixel_type(), vec![band])?;
        raster.geotransform = template.geotransform;
        raster.geokeys = template.geokeys.clone();
        raster.nodata = Some(OUTPUT_NODATA);
        Ok(raster)
    }
}

// ── Tile classifier ───────────────────────────────────────────────────────────

/// Classifies one tile from its raw (feature) and train (label) extracts.
#[derive(Debug, Clone)]
pub struct TileClassifier<C> {
    classifier: C,
    zero_quota: usize,
}

impl Default for TileClassifier<ForestParams> {
    fn default() -> Self {
        Self::new(ForestParams::default(), DEFAULT_ZERO_QUOTA)
    }
}

impl<C: Classifier> TileClassifier<C> {
    pub fn new(classifier: C, zero_quota: usize) -> Self {
        Self { classifier, zero_quota }
    }

    /// Classify the tile and write the result to `output`. Skipped tiles leave
    /// `output` untouched.
    ///
    /// The label raster is checked before the raw raster is decoded, so
    /// unlabeled tiles never pay for reading the imagery.
    pub fn classify_tile(&self, raw: &Path, train: &Path, output: &Path) -> Result<TileOutcome> {
        let train_raster = read_raster(train)?;
        if let Some(reason) = check_labels(&train_raster)? {
            info!(train = %train.display(), %reason, "skipping tile");
            return Ok(TileOutcome::Skipped(reason));
        }

        let raw_raster = read_raster(raw)?;
        match self.predict_checked(&raw_raster, &train_raster)? {
            Prediction::Skipped(reason) => {
                info!(raw = %raw.display(), %reason, "skipping tile");
                Ok(TileOutcome::Skipped(reason))
            }
            Prediction::Classified { raster, stats } => {
                write_raster(output, &raster.to_raster(&train_raster)?)?;
                info!(output = %output.display(), "classified tile written");
                Ok(TileOutcome::Classified {
                    output: output.to_path_buf(),
                    stats,
                })
            }
        }
    }

    /// In-memory classification of co-registered rasters.
    pub fn predict(&self, raw: &Raster, train: &Raster) -> Result<Prediction> {
        if let Some(reason) = check_labels(train)? {
            return Ok(Prediction::Skipped(reason));
        }
        self.predict_checked(raw, train)
    }

    fn predict_checked(&self, raw: &Raster, train: &Raster) -> Result<Prediction> {
        let (rows, cols) = (train.height(), train.width());
        if raw.height() != rows || raw.width() != cols {
            return Err(Error::FootprintMismatch {
                expected_rows: rows,
                expected_cols: cols,
                actual_rows: raw.height(),
                actual_cols: raw.width(),
            });
        }

        if distinct_values(first_band(raw)?) < 2 {
            return Ok(Prediction::Skipped(SkipReason::TooFewFeatureValues));
        }

        let labels = LabelArray::from_band(rows, cols, first_band(train)?)?;
        let features = FeatureArray::from_bands(rows, cols, &raw.bands)?;
        let training = select_training_samples(&labels, &features, self.zero_quota)?;

        let training_counts = class_counts(&training.labels);
        info!(samples = training.len(), bands = features.bands, classes = ?training_counts, "training set selected");
        if training_counts.len() < 2 {
            return Ok(Prediction::Skipped(SkipReason::TooFewTrainingClasses));
        }

        let model = self.classifier.fit(&training.features, &training.labels)?;
        let oob_score = model.oob_score();
        if let Some(score) = oob_score {
            info!(oob_score = score, "model fitted");
        }
        drop(training);

        let predicted = model.predict(&features.into_matrix())?;
        let raster = ClassifiedRaster::new(rows, cols, predicted)?;
        let predicted_counts = class_counts(raster.as_slice());
        info!(classes = ?predicted_counts, "tile predicted");

        Ok(Prediction::Classified {
            raster,
            stats: FitStats {
                training_samples: training_counts.values().sum(),
                training_counts,
                predicted_counts,
                oob_score,
            },
        })
    }
}

fn first_band(raster: &Raster) -> Result<&[f64]> {
    raster
        .band(0)
        .ok_or_else(|| Error::InvalidArgument("raster has no bands".into()))
}

fn check_labels(train: &Raster) -> Result<Option<SkipReason>> {
    if !train.pixel_type().is_integral() {
        warn!(
            pixel_type = train.pixel_type().name(),
            "label raster is not integral; labels are truncated"
        );
    }
    let band = first_band(train)?;
    Ok((distinct_values(band) < 2).then_some(SkipReason::TooFewLabelValues))
}
