//! Random-forest regression.
//!
//! Bootstrap-aggregated CART trees split on variance reduction. Each tree
//! draws from its own ChaCha stream derived from the forest seed, so a fit is
//! reproducible regardless of how rayon schedules the trees.

use rand::seq::index;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::ForestParams;
use crate::error::{Result, TwinError};

const MIN_GAIN: f64 = 1e-12;

/// Flat node arena entry; children are indices into the owning tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    nodes: Vec<Node>,
}

impl RegressionTree {
    pub fn predict(&self, row: &[f64]) -> f64 {
        let mut at = 0;
        loop {
            match &self.nodes[at] {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    at = if row[*feature] <= *threshold {
                        *left
                    } else {
                        *right
                    };
                }
            }
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], at: usize) -> usize {
            match &nodes[at] {
                Node::Leaf { .. } => 0,
                Node::Split { left, right, .. } => 1 + walk(nodes, *left).max(walk(nodes, *right)),
            }
        }
        walk(&self.nodes, 0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    trees: Vec<RegressionTree>,
    n_features: usize,
    importances: Vec<f64>,
}

impl RandomForest {
    /// Fit `params.n_trees` trees on bootstrap samples of (`x`, `y`).
    pub fn fit(x: &[Vec<f64>], y: &[f64], params: &ForestParams) -> Result<Self> {
        if x.is_empty() {
            return Err(TwinError::DatasetTooSmall("no rows to fit".into()));
        }
        if x.len() != y.len() {
            return Err(TwinError::InvalidConfig(format!(
                "{} feature rows but {} targets",
                x.len(),
                y.len()
            )));
        }
        let n_features = x[0].len();
        if n_features == 0 || x.iter().any(|r| r.len() != n_features) {
            return Err(TwinError::SchemaMismatch(format!(
                "feature rows must all have the same non-zero width ({})",
                n_features
            )));
        }

        let fitted: Vec<(RegressionTree, Vec<f64>)> = (0..params.n_trees)
            .into_par_iter()
            .map(|i| {
                let mut rng = ChaCha8Rng::seed_from_u64(params.seed);
                rng.set_stream(i as u64);
                grow(x, y, n_features, params, &mut rng)
            })
            .collect();

        let mut importances = vec![0.0; n_features];
        let mut trees = Vec::with_capacity(fitted.len());
        for (tree, imp) in fitted {
            for (acc, v) in importances.iter_mut().zip(normalized(imp)) {
                *acc += v;
            }
            trees.push(tree);
        }

        Ok(Self {
            trees,
            n_features,
            importances: normalized(importances),
        })
    }

    pub fn predict_one(&self, row: &[f64]) -> Result<f64> {
        if row.len() != self.n_features {
            return Err(TwinError::SchemaMismatch(format!(
                "expected {} features, got {}",
                self.n_features,
                row.len()
            )));
        }
        let sum: f64 = self.trees.iter().map(|t| t.predict(row)).sum();
        Ok(sum / self.trees.len() as f64)
    }

    pub fn predict(&self, rows: &[Vec<f64>]) -> Result<Vec<f64>> {
        rows.iter().map(|r| self.predict_one(r)).collect()
    }

    /// Mean impurity decrease per feature, summing to 1 (all zero if no tree split).
    pub fn importances(&self) -> &[f64] {
        &self.importances
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn trees(&self) -> &[RegressionTree] {
        &self.trees
    }
}

fn normalized(mut v: Vec<f64>) -> Vec<f64> {
    let total: f64 = v.iter().sum();
    if total > 0.0 {
        v.iter_mut().for_each(|x| *x /= total);
    }
    v
}

/// Running sums for variance-reduction scoring.
#[derive(Debug, Clone, Copy, Default)]
struct Moments {
    n: usize,
    sum: f64,
    sum_sq: f64,
}

impl Moments {
    fn of(y: &[f64], idx: &[usize]) -> Self {
        let mut m = Self::default();
        idx.iter().for_each(|&i| m.push(y[i]));
        m
    }

    fn push(&mut self, v: f64) {
        self.n += 1;
        self.sum += v;
        self.sum_sq += v * v;
    }

    fn minus(&self, other: &Self) -> Self {
        Self {
            n: self.n - other.n,
            sum: self.sum - other.sum,
            sum_sq: self.sum_sq - other.sum_sq,
        }
    }

    fn mean(&self) -> f64 {
        if self.n == 0 {
            0.0
        } else {
            self.sum / self.n as f64
        }
    }

    /// Sum of squared deviations from the mean.
    fn sse(&self) -> f64 {
        if self.n == 0 {
            0.0
        } else {
            (self.sum_sq - self.sum * self.sum / self.n as f64).max(0.0)
        }
    }
}

struct BestSplit {
    feature: usize,
    threshold: f64,
    gain: f64,
}

struct Pending {
    node: usize,
    idx: Vec<usize>,
    depth: usize,
}

fn grow(
    x: &[Vec<f64>],
    y: &[f64],
    n_features: usize,
    params: &ForestParams,
    rng: &mut ChaCha8Rng,
) -> (RegressionTree, Vec<f64>) {
    let n = x.len();
    let sample: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
    let mut importance = vec![0.0; n_features];

    let mut nodes = vec![Node::Leaf { value: 0.0 }];
    let mut stack = vec![Pending {
        node: 0,
        idx: sample,
        depth: 0,
    }];

    while let Some(p) = stack.pop() {
        let moments = Moments::of(y, &p.idx);
        let splittable = params.max_depth.map_or(true, |d| p.depth < d)
            && p.idx.len() >= params.min_samples_split
            && p.idx.len() >= 2 * params.min_samples_leaf
            && moments.sse() > MIN_GAIN;

        let best = if splittable {
            let features = candidate_features(n_features, params.max_features, rng);
            best_split(x, y, &p.idx, &features, params.min_samples_leaf, &moments)
        } else {
            None
        };

        let Some(split) = best else {
            nodes[p.node] = Node::Leaf {
                value: moments.mean(),
            };
            continue;
        };

        importance[split.feature] += split.gain;
        let (l, r): (Vec<usize>, Vec<usize>) = p
            .idx
            .iter()
            .partition(|&&i| x[i][split.feature] <= split.threshold);

        let left = nodes.len();
        let right = left + 1;
        nodes.push(Node::Leaf { value: 0.0 });
        nodes.push(Node::Leaf { value: 0.0 });
        nodes[p.node] = Node::Split {
            feature: split.feature,
            threshold: split.threshold,
            left,
            right,
        };
        stack.push(Pending {
            node: right,
            idx: r,
            depth: p.depth + 1,
        });
        stack.push(Pending {
            node: left,
            idx: l,
            depth: p.depth + 1,
        });
    }

    (RegressionTree { nodes }, importance)
}

fn candidate_features(n_features: usize, max_features: Option<usize>, rng: &mut ChaCha8Rng) -> Vec<usize> {
    match max_features {
        Some(k) if k < n_features => {
            let mut picked = index::sample(rng, n_features, k).into_vec();
            picked.sort_unstable();
            picked
        }
        _ => (0..n_features).collect(),
    }
}

fn best_split(
    x: &[Vec<f64>],
    y: &[f64],
    idx: &[usize],
    features: &[usize],
    min_leaf: usize,
    parent: &Moments,
) -> Option<BestSplit> {
    let n = idx.len();
    let parent_sse = parent.sse();
    let mut order = idx.to_vec();
    let mut best: Option<BestSplit> = None;

    for &f in features {
        order.sort_by(|&a, &b| x[a][f].total_cmp(&x[b][f]));
        let mut left = Moments::default();
        for k in 0..n - 1 {
            left.push(y[order[k]]);
            let n_left = k + 1;
            if n_left < min_leaf || n - n_left < min_leaf {
                continue;
            }
            let (lo, hi) = (x[order[k]][f], x[order[k + 1]][f]);
            if lo == hi {
                continue;
            }
            let right = parent.minus(&left);
            let gain = parent_sse - left.sse() - right.sse();
            if gain > best.as_ref().map_or(MIN_GAIN, |b| b.gain) {
                best = Some(BestSplit {
                    feature: f,
                    threshold: midpoint(lo, hi),
                    gain,
                });
            }
        }
    }
    best
}

/// A threshold `t` with `lo <= t < hi`.
fn midpoint(lo: f64, hi: f64) -> f64 {
    let mid = lo + (hi - lo) / 2.0;
    if mid < hi {
        mid
    } else {
        lo
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(n_trees: usize) -> ForestParams {
        ForestParams {
            n_trees,
            ..ForestParams::default()
        }
    }

    /// y = 10 * [x0 > 5], x1 constant.
    fn step_data() -> (Vec<Vec<f64>>, Vec<f64>) {
        let x: Vec<Vec<f64>> = (0..200).map(|i| vec![(i % 11) as f64, 3.0]).collect();
        let y = x.iter().map(|r| if r[0] > 5.0 { 10.0 } else { 0.0 }).collect();
        (x, y)
    }

    #[test]
    fn test_learns_step_function() {
        let (x, y) = step_data();
        let forest = RandomForest::fit(&x, &y, &params(20)).unwrap();
        assert!((forest.predict_one(&[2.0, 3.0]).unwrap() - 0.0).abs() < 1e-9);
        assert!((forest.predict_one(&[9.0, 3.0]).unwrap() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_importance_on_informative_feature() {
        let (x, y) = step_data();
        let forest = RandomForest::fit(&x, &y, &params(10)).unwrap();
        let imp = forest.importances();
        assert_eq!(imp.len(), 2);
        assert!((imp.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert_eq!(imp[1], 0.0);
    }

    #[test]
    fn test_same_seed_same_forest() {
        let x: Vec<Vec<f64>> = (0..300)
            .map(|i| vec![i as f64, ((i * 37) % 101) as f64, ((i * 13) % 7) as f64])
            .collect();
        let y: Vec<f64> = x.iter().map(|r| r[0] * 0.5 + r[1] - r[2] * 3.0).collect();
        let p = ForestParams {
            n_trees: 16,
            max_features: Some(2),
            ..ForestParams::default()
        };
        let a = RandomForest::fit(&x, &y, &p).unwrap();
        let b = RandomForest::fit(&x, &y, &p).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.predict(&x).unwrap(), b.predict(&x).unwrap());
    }

    #[test]
    fn test_constant_target() {
        let x: Vec<Vec<f64>> = (0..50).map(|i| vec![i as f64]).collect();
        let y = vec![7.0; 50];
        let forest = RandomForest::fit(&x, &y, &params(5)).unwrap();
        assert_eq!(forest.predict_one(&[123.0]).unwrap(), 7.0);
        assert_eq!(forest.importances(), &[0.0]);
        assert!(forest.trees().iter().all(|t| t.node_count() == 1));
    }

    #[test]
    fn test_depth_limit() {
        let x: Vec<Vec<f64>> = (0..256).map(|i| vec![i as f64]).collect();
        let y: Vec<f64> = (0..256).map(|i| i as f64).collect();
        let p = ForestParams {
            n_trees: 4,
            max_depth: Some(3),
            ..ForestParams::default()
        };
        let forest = RandomForest::fit(&x, &y, &p).unwrap();
        assert!(forest.trees().iter().all(|t| t.depth() <= 3));
    }

    #[test]
    fn test_min_samples_leaf_respected() {
        let x: Vec<Vec<f64>> = (0..40).map(|i| vec![i as f64]).collect();
        let y: Vec<f64> = (0..40).map(|i| (i * i) as f64).collect();
        let p = ForestParams {
            n_trees: 1,
            min_samples_leaf: 20,
            min_samples_split: 2,
            ..ForestParams::default()
        };
        let forest = RandomForest::fit(&x, &y, &p).unwrap();
        // 40 bootstrap draws cannot be split twice with 20 per leaf.
        assert!(forest.trees()[0].node_count() <= 3);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(matches!(
            RandomForest::fit(&[], &[], &params(1)),
            Err(TwinError::DatasetTooSmall(_))
        ));
        let ragged = vec![vec![1.0, 2.0], vec![1.0]];
        assert!(RandomForest::fit(&ragged, &[1.0, 2.0], &params(1)).is_err());

        let (x, y) = step_data();
        let forest = RandomForest::fit(&x, &y, &params(2)).unwrap();
        assert!(matches!(
            forest.predict_one(&[1.0]),
            Err(TwinError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn test_midpoint_stays_below_upper() {
        assert_eq!(midpoint(1.0, 3.0), 2.0);
        let lo = 1.0f64;
        let hi = f64::from_bits(lo.to_bits() + 1);
        let t = midpoint(lo, hi);
        assert!(lo <= t && t < hi);
    }
}
