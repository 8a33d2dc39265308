//! CART classification tree grown on a bootstrap sample, Gini criterion.
use rand::Rng;

use crate::selection::FeatureMatrix;

#[derive(Debug, Clone)]
enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        class: usize,
    },
}

/// Fitted tree over dense class indices. Node 0 is the root.
#[derive(Debug, Clone)]
pub(crate) struct DecisionTree {
    nodes: Vec<Node>,
}

impl DecisionTree {
    pub(crate) fn predict_row(&self, row: &[f64]) -> usize {
        let mut i = 0;
        loop {
            match self.nodes[i] {
                Node::Leaf { class } => return class,
                Node::Split { feature, threshold, left, right } => {
                    i = if row[feature] <= threshold { left } else { right };
                }
            }
        }
    }

    pub(crate) fn leaf_count(&self) -> usize {
        self.nodes.iter().filter(|n| matches!(n, Node::Leaf { .. })).count()
    }
}

/// Index of the largest count; ties go to the smallest index.
pub(crate) fn argmax(counts: &[u32]) -> usize {
    let mut best = 0;
    for (i, &c) in counts.iter().enumerate() {
        if c > counts[best] {
            best = i;
        }
    }
    best
}

fn gini(counts: &[u32], n: usize) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let n = n as f64;
    1.0 - counts.iter().map(|&c| (c as f64 / n).powi(2)).sum::<f64>()
}

struct SplitCandidate {
    feature: usize,
    threshold: f64,
    impurity: f64,
}

pub(crate) struct TreeBuilder<'a> {
    pub x: &'a FeatureMatrix,
    /// Dense class index per training row.
    pub y: &'a [usize],
    pub n_classes: usize,
    pub min_samples_leaf: usize,
    /// Candidate features drawn per node.
    pub max_features: usize,
}

impl TreeBuilder<'_> {
    /// Grow a tree over `samples` (row indices, repeats allowed).
    ///
    /// Growth uses an explicit work stack over sub-ranges of `samples`, so
    /// deep unbalanced trees do not recurse.
    pub(crate) fn build<R: Rng>(&self, mut samples: Vec<usize>, rng: &mut R) -> DecisionTree {
        let mut nodes = vec![Node::Leaf { class: 0 }];
        let mut stack = vec![(0usize, 0usize, samples.len())];

        while let Some((slot, start, end)) = stack.pop() {
            let part = &mut samples[start..end];
            let counts = self.histogram(part);
            let class = argmax(&counts);
            let n = part.len();

            let pure = counts.iter().filter(|&&c| c > 0).count() <= 1;
            if pure || n < 2 * self.min_samples_leaf {
                nodes[slot] = Node::Leaf { class };
                continue;
            }

            let Some(split) = self.best_split(part, &counts, rng) else {
                nodes[slot] = Node::Leaf { class };
                continue;
            };

            let mid = start + partition_in_place(part, |&s| self.x.get(s, split.feature) <= split.threshold);
            let left = nodes.len();
            let right = left + 1;
            nodes.push(Node::Leaf { class: 0 });
            nodes.push(Node::Leaf { class: 0 });
            nodes[slot] = Node::Split {
                feature: split.feature,
                threshold: split.threshold,
                left,
                right,
            };
            stack.push((right, mid, end));
            stack.push((left, start, mid));
        }

        DecisionTree { nodes }
    }

    fn histogram(&self, samples: &[usize]) -> Vec<u32> {
        let mut counts = vec![0u32; self.n_classes];
        for &s in samples {
            counts[self.y[s]] += 1;
        }
        counts
    }

    /// Lowest weighted-Gini split that keeps `min_samples_leaf` on both sides.
    /// Features are visited in random order until `max_features` non-constant
    /// ones have been scanned and a valid split exists.
    fn best_split<R: Rng>(&self, samples: &[usize], counts: &[u32], rng: &mut R) -> Option<SplitCandidate> {
        let n = samples.len();
        let parent = gini(counts, n);
        let mut best: Option<SplitCandidate> = None;
        let mut scanned = 0;

        let order = rand::seq::index::sample(rng, self.x.n_cols, self.x.n_cols);
        let mut pairs: Vec<(f64, usize)> = Vec::with_capacity(n);

        for feature in order.into_iter() {
            if scanned >= self.max_features && best.is_some() {
                break;
            }

            pairs.clear();
            pairs.extend(samples.iter().map(|&s| (self.x.get(s, feature), self.y[s])));
            pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
            if pairs[0].0 == pairs[n - 1].0 {
                continue;
            }
            scanned += 1;

            let mut left = vec![0u32; self.n_classes];
            let mut right = counts.to_vec();
            for i in 0..n - 1 {
                let class = pairs[i].1;
                left[class] += 1;
                right[class] -= 1;

                let (lo, hi) = (pairs[i].0, pairs[i + 1].0);
                let n_left = i + 1;
                let n_right = n - n_left;
                if lo == hi || n_left < self.min_samples_leaf || n_right < self.min_samples_leaf {
                    continue;
                }

                let impurity = (n_left as f64 * gini(&left, n_left) + n_right as f64 * gini(&right, n_right)) / n as f64;
                if best.as_ref().map_or(true, |b| impurity < b.impurity) {
                    let mid = lo + (hi - lo) / 2.0;
                    best = Some(SplitCandidate {
                        feature,
                        threshold: if mid < hi { mid } else { lo },
                        impurity,
                    });
                }
            }
        }

        best.filter(|b| b.impurity < parent - 1e-12)
    }
}

/// Reorder `items` so those matching `pred` come first; returns their count.
fn partition_in_place<T, F: Fn(&T) -> bool>(items: &mut [T], pred: F) -> usize {
    let mut boundary = 0;
    for i in 0..items.len() {
        if pred(&items[i]) {
            items.swap(i, boundary);
            boundary += 1;
        }
    }
    boundary
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn matrix(rows: &[[f64; 2]]) -> FeatureMatrix {
        FeatureMatrix::from_vec(rows.len(), 2, rows.iter().flat_map(|r| r.iter().copied()).collect()).unwrap()
    }

    #[test]
    fn gini_of_pure_and_even_nodes() {
        assert_eq!(gini(&[4, 0], 4), 0.0);
        assert!((gini(&[2, 2], 4) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn argmax_breaks_ties_toward_smallest_class() {
        assert_eq!(argmax(&[3, 5, 5]), 1);
        assert_eq!(argmax(&[0, 0]), 0);
    }

    #[test]
    fn tree_separates_threshold_data() {
        let x = matrix(&[[1.0, 9.0], [2.0, 9.0], [3.0, 9.0], [7.0, 9.0], [8.0, 9.0], [9.0, 9.0]]);
        let y = [0, 0, 0, 1, 1, 1];
        let builder = TreeBuilder { x: &x, y: &y, n_classes: 2, min_samples_leaf: 1, max_features: 1 };
        let tree = builder.build((0..6).collect(), &mut StdRng::seed_from_u64(3));

        assert_eq!(tree.predict_row(&[2.5, 9.0]), 0);
        assert_eq!(tree.predict_row(&[8.5, 9.0]), 1);
        assert_eq!(tree.leaf_count(), 2);
    }

    #[test]
    fn min_samples_leaf_blocks_small_splits() {
        let x = matrix(&[[1.0, 0.0], [2.0, 0.0], [8.0, 0.0], [9.0, 0.0]]);
        let y = [0, 0, 1, 1];
        let builder = TreeBuilder { x: &x, y: &y, n_classes: 2, min_samples_leaf: 3, max_features: 2 };
        let tree = builder.build((0..4).collect(), &mut StdRng::seed_from_u64(0));
        assert_eq!(tree.leaf_count(), 1);
    }

    #[test]
    fn partition_in_place_moves_matches_forward() {
        let mut v = vec![5, 1, 7, 2, 9];
        let k = partition_in_place(&mut v, |&x| x < 5);
        assert_eq!(k, 2);
        assert!(v[..k].iter().all(|&x| x < 5));
        assert!(v[k..].iter().all(|&x| x >= 5));
    }
}
