//! Random-forest classifier behind a narrow fit/predict contract.
//!
//! Each tree is grown on a bootstrap sample with Gini splits over a random
//! subset of `sqrt(n_features)` candidate features. Prediction is a majority
//! vote. Both phases run on a dedicated rayon pool so `parallelism` is honored
//! regardless of the global pool size.
mod tree;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::debug;

use crate::error::{Error, Result};
use crate::selection::FeatureMatrix;
use tree::{argmax, DecisionTree, TreeBuilder};

/// Fits a model from a feature matrix and one label per row.
pub trait Classifier {
    type Model: Predictor;

    fn fit(&self, x: &FeatureMatrix, y: &[i64]) -> Result<Self::Model>;
}

/// A fitted model.
pub trait Predictor {
    /// One predicted label per row of `x`.
    fn predict(&self, x: &FeatureMatrix) -> Result<Vec<i64>>;

    /// Out-of-bag accuracy, if it was computed at fit time.
    fn oob_score(&self) -> Option<f64> {
        None
    }
}

// ── Parameters ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ForestParams {
    pub n_trees: usize,
    pub min_samples_leaf: usize,
    /// Worker threads used for fitting and prediction.
    pub parallelism: usize,
    pub oob_score: bool,
    /// `None` draws a fresh seed per fit.
    pub seed: Option<u64>,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_trees: 100,
            min_samples_leaf: 50,
            parallelism: 10,
            oob_score: true,
            seed: None,
        }
    }
}

impl ForestParams {
    fn check(&self) -> Result<()> {
        if self.n_trees == 0 {
            return Err(Error::Model("n_trees must be at least 1".into()));
        }
        if self.min_samples_leaf == 0 {
            return Err(Error::Model("min_samples_leaf must be at least 1".into()));
        }
        if self.parallelism == 0 {
            return Err(Error::Model("parallelism must be at least 1".into()));
        }
        Ok(())
    }
}

fn thread_pool(threads: usize) -> Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .map_err(|e| Error::Model(format!("cannot build thread pool: {e}")))
}

/// Bootstrap draw for one tree. Regenerated from the same seed for OOB scoring
/// so the per-tree samples never need to be kept.
fn bootstrap(rng: &mut StdRng, n: usize) -> Vec<usize> {
    (0..n).map(|_| rng.gen_range(0..n)).collect()
}

impl Classifier for ForestParams {
    type Model = RandomForest;

    fn fit(&self, x: &FeatureMatrix, y: &[i64]) -> Result<RandomForest> {
        self.check()?;
        if x.n_rows == 0 {
            return Err(Error::Model("cannot fit on an empty training set".into()));
        }
        if x.n_rows != y.len() {
            return Err(Error::Model(format!(
                "feature matrix has {} rows but {} labels were given",
                x.n_rows,
                y.len()
            )));
        }
        if x.n_cols == 0 {
            return Err(Error::Model("feature matrix has no columns".into()));
        }
        if x.as_slice().iter().any(|v| !v.is_finite()) {
            return Err(Error::Model("feature matrix contains non-finite values".into()));
        }

        let mut classes = y.to_vec();
        classes.sort_unstable();
        classes.dedup();
        let y_idx: Vec<usize> = y
            .iter()
            .map(|label| classes.binary_search(label).unwrap_or_default())
            .collect();

        let n = x.n_rows;
        let base_seed = self.seed.unwrap_or_else(rand::random);
        let max_features = ((x.n_cols as f64).sqrt() as usize).max(1);
        let builder = TreeBuilder {
            x,
            y: &y_idx,
            n_classes: classes.len(),
            min_samples_leaf: self.min_samples_leaf,
            max_features,
        };

        let pool = thread_pool(self.parallelism)?;
        let trees: Vec<DecisionTree> = pool.install(|| {
            (0..self.n_trees)
                .into_par_iter()
                .map(|t| {
                    let mut rng = StdRng::seed_from_u64(base_seed.wrapping_add(t as u64));
                    let samples = bootstrap(&mut rng, n);
                    builder.build(samples, &mut rng)
                })
                .collect()
        });

        let oob_score = if self.oob_score {
            pool.install(|| out_of_bag_accuracy(&trees, x, &y_idx, classes.len(), base_seed))
        } else {
            None
        };

        debug!(
            trees = trees.len(),
            samples = n,
            features = x.n_cols,
            classes = classes.len(),
            leaves = trees.iter().map(DecisionTree::leaf_count).sum::<usize>(),
            "random forest fitted"
        );

        Ok(RandomForest {
            classes,
            n_features: x.n_cols,
            parallelism: self.parallelism,
            trees,
            oob_score,
        })
    }
}

/// Accuracy of the vote over trees that did not see each sample. `None` when
/// every sample landed in every bootstrap.
fn out_of_bag_accuracy(
    trees: &[DecisionTree],
    x: &FeatureMatrix,
    y: &[usize],
    n_classes: usize,
    base_seed: u64,
) -> Option<f64> {
    let n = x.n_rows;
    let mut votes = vec![0u32; n * n_classes];
    let mut in_bag = vec![false; n];

    for (t, tree) in trees.iter().enumerate() {
        let mut rng = StdRng::seed_from_u64(base_seed.wrapping_add(t as u64));
        in_bag.fill(false);
        for s in bootstrap(&mut rng, n) {
            in_bag[s] = true;
        }
        votes
            .par_chunks_mut(n_classes)
            .enumerate()
            .filter(|(i, _)| !in_bag[*i])
            .for_each(|(i, row_votes)| row_votes[tree.predict_row(x.row(i))] += 1);
    }

    let mut scored = 0usize;
    let mut correct = 0usize;
    for (i, row_votes) in votes.chunks(n_classes).enumerate() {
        if row_votes.iter().all(|&v| v == 0) {
            continue;
        }
        scored += 1;
        if argmax(row_votes) == y[i] {
            correct += 1;
        }
    }
    (scored > 0).then(|| correct as f64 / scored as f64)
}

// ── Model ─────────────────────────────────────────────────────────────────────

/// Fitted forest. Class labels are kept sorted; trees vote with dense indices.
#[derive(Debug, Clone)]
pub struct RandomForest {
    classes: Vec<i64>,
    n_features: usize,
    parallelism: usize,
    trees: Vec<DecisionTree>,
    oob_score: Option<f64>,
}

impl RandomForest {
    pub fn classes(&self) -> &[i64] {
        &self.classes
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }
}

impl Predictor for RandomForest {
    fn predict(&self, x: &FeatureMatrix) -> Result<Vec<i64>> {
        if x.n_cols != self.n_features {
            return Err(Error::Model(format!(
                "model expects {} features, got {}",
                self.n_features, x.n_cols
            )));
        }
        if x.is_empty() {
            return Ok(Vec::new());
        }

        let k = self.classes.len();
        let pool = thread_pool(self.parallelism)?;
        let predicted = pool.install(|| {
            x.as_slice()
                .par_chunks(x.n_cols)
                .map_init(
                    || vec![0u32; k],
                    |votes, row| {
                        votes.fill(0);
                        for tree in &self.trees {
                            votes[tree.predict_row(row)] += 1;
                        }
                        self.classes[argmax(votes)]
                    },
                )
                .collect()
        });
        Ok(predicted)
    }

    fn oob_score(&self) -> Option<f64> {
        self.oob_score
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two well-separated clusters on feature 0, noise on feature 1.
    fn separable(n: usize) -> (FeatureMatrix, Vec<i64>) {
        let mut data = Vec::with_capacity(n * 2);
        let mut labels = Vec::with_capacity(n);
        for i in 0..n {
            let low = i % 2 == 0;
            let f0 = if low { 10.0 + (i % 7) as f64 } else { 80.0 + (i % 5) as f64 };
            data.push(f0);
            data.push(((i * 37) % 100) as f64);
            labels.push(if low { 1 } else { 2 });
        }
        (FeatureMatrix::from_vec(n, 2, data).unwrap(), labels)
    }

    fn small_params() -> ForestParams {
        ForestParams {
            n_trees: 15,
            min_samples_leaf: 2,
            parallelism: 2,
            oob_score: true,
            seed: Some(42),
        }
    }

    #[test]
    fn default_params_match_tile_configuration() {
        let p = ForestParams::default();
        assert_eq!(p.n_trees, 100);
        assert_eq!(p.min_samples_leaf, 50);
        assert_eq!(p.parallelism, 10);
        assert!(p.oob_score);
        assert_eq!(p.seed, None);
    }

    #[test]
    fn fits_and_predicts_separable_classes() {
        let (x, y) = separable(200);
        let model = small_params().fit(&x, &y).unwrap();
        assert_eq!(model.classes(), &[1, 2]);
        assert_eq!(model.n_trees(), 15);

        let predicted = model.predict(&x).unwrap();
        let correct = predicted.iter().zip(&y).filter(|(p, t)| p == t).count();
        assert!(correct as f64 / y.len() as f64 >= 0.98, "{correct}/{}", y.len());

        let probe = FeatureMatrix::from_vec(2, 2, vec![12.0, 50.0, 83.0, 50.0]).unwrap();
        assert_eq!(model.predict(&probe).unwrap(), vec![1, 2]);
    }

    #[test]
    fn oob_score_reported_when_enabled() {
        let (x, y) = separable(200);
        let model = small_params().fit(&x, &y).unwrap();
        let oob = model.oob_score().unwrap();
        assert!(oob > 0.95, "oob = {oob}");

        let no_oob = ForestParams { oob_score: false, ..small_params() }.fit(&x, &y).unwrap();
        assert_eq!(no_oob.oob_score(), None);
    }

    #[test]
    fn same_seed_gives_same_model() {
        let (x, y) = separable(120);
        let a = small_params().fit(&x, &y).unwrap();
        let b = small_params().fit(&x, &y).unwrap();
        assert_eq!(a.predict(&x).unwrap(), b.predict(&x).unwrap());
        assert_eq!(a.oob_score(), b.oob_score());
    }

    #[test]
    fn large_leaf_size_collapses_to_majority() {
        let x = FeatureMatrix::from_vec(5, 1, vec![1.0, 2.0, 3.0, 8.0, 9.0]).unwrap();
        let y = [4, 4, 4, 7, 7];
        let params = ForestParams { min_samples_leaf: 10, ..small_params() };
        let model = params.fit(&x, &y).unwrap();
        // Every tree is a single leaf, so every row gets the same vote.
        let predicted = model.predict(&x).unwrap();
        assert!(predicted.windows(2).all(|w| w[0] == w[1]));
        assert!(predicted[0] == 4 || predicted[0] == 7);
    }

    #[test]
    fn fit_rejects_bad_input() {
        let params = small_params();
        let empty = FeatureMatrix::from_vec(0, 2, vec![]).unwrap();
        assert!(matches!(params.fit(&empty, &[]), Err(Error::Model(_))));

        let x = FeatureMatrix::from_vec(2, 1, vec![1.0, 2.0]).unwrap();
        assert!(matches!(params.fit(&x, &[1]), Err(Error::Model(_))));

        let nan = FeatureMatrix::from_vec(2, 1, vec![1.0, f64::NAN]).unwrap();
        assert!(matches!(params.fit(&nan, &[1, 2]), Err(Error::Model(_))));

        let no_cols = FeatureMatrix::from_vec(2, 0, vec![]).unwrap();
        assert!(matches!(params.fit(&no_cols, &[1, 2]), Err(Error::Model(_))));

        let zero_trees = ForestParams { n_trees: 0, ..small_params() };
        assert!(matches!(zero_trees.fit(&x, &[1, 2]), Err(Error::Model(_))));
    }

    #[test]
    fn predict_rejects_feature_count_mismatch() {
        let (x, y) = separable(40);
        let model = small_params().fit(&x, &y).unwrap();
        let wrong = FeatureMatrix::from_vec(1, 3, vec![1.0, 2.0, 3.0]).unwrap();
        assert!(matches!(model.predict(&wrong), Err(Error::Model(_))));
    }

    #[test]
    fn single_class_training_predicts_that_class() {
        let x = FeatureMatrix::from_vec(3, 1, vec![1.0, 2.0, 3.0]).unwrap();
        let model = small_params().fit(&x, &[5, 5, 5]).unwrap();
        assert_eq!(model.predict(&x).unwrap(), vec![5, 5, 5]);
    }
}
