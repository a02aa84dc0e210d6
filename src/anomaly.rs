// Offline anomaly analysis - statistical methods over behavior feature
// vectors. Deliberately not wired into the per-request fuser: callers
// invoke it against exported feature history for investigation and
// batch scoring.

use std::collections::VecDeque;

use parking_lot::RwLock;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::behavior::{FeatureVector, FEATURE_COUNT, FEATURE_NAMES};
use crate::stats::{mean, percentile, std_dev};

const HISTORY_SIZE: usize = 1000;
const ZSCORE_THRESHOLD: f64 = 3.0;
const MODIFIED_ZSCORE_THRESHOLD: f64 = 3.5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum AnomalySeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyReport {
    pub score: f64,
    /// False until enough observations exist to model the distribution.
    pub trained: bool,
    pub is_anomaly: bool,
    pub confidence: f64,
    pub risk_factors: Vec<String>,
    pub severity: AnomalySeverity,
}

impl AnomalyReport {
    fn untrained() -> Self {
        Self {
            score: 0.5,
            trained: false,
            is_anomaly: false,
            confidence: 0.0,
            risk_factors: vec!["no_model".to_string()],
            severity: AnomalySeverity::Low,
        }
    }
}

/// Statistical anomaly detector over feature vectors: z-score, modified
/// z-score (median absolute deviation) and IQR bounds per feature.
pub struct AnomalyDetector {
    history: RwLock<VecDeque<[f64; FEATURE_COUNT]>>,
    min_samples: usize,
}

impl AnomalyDetector {
    pub fn new(min_samples: usize) -> Self {
        Self {
            history: RwLock::new(VecDeque::with_capacity(HISTORY_SIZE)),
            min_samples: min_samples.max(4),
        }
    }

    /// Feed one observation into the model.
    pub fn observe(&self, features: &FeatureVector) {
        let mut history = self.history.write();
        history.push_back(features.values);
        if history.len() > HISTORY_SIZE {
            history.pop_front();
        }
    }

    pub fn history_size(&self) -> usize {
        self.history.read().len()
    }

    /// Score a feature vector against the observed distribution without
    /// folding it into the model.
    pub fn check(&self, features: &FeatureVector) -> AnomalyReport {
        let history = self.history.read();
        if history.len() < self.min_samples {
            return AnomalyReport::untrained();
        }

        let mut risk_factors = Vec::new();
        let mut scores = Vec::new();

        for (dim, name) in FEATURE_NAMES.iter().enumerate() {
            let series: Vec<f64> = history.iter().map(|v| v[dim]).collect();
            let value = features.values[dim];

            // Plain z-score against mean/std.
            let std = std_dev(&series);
            if std > 1e-9 {
                let z = (value - mean(&series)).abs() / std;
                scores.push((z / ZSCORE_THRESHOLD).min(1.0));
                if z > ZSCORE_THRESHOLD {
                    risk_factors.push(format!("{name}: {z:.2}\u{3c3} from mean"));
                }
            }

            // Modified z-score, robust to outliers in the history.
            let med = percentile(&series, 50.0);
            let deviations: Vec<f64> = series.iter().map(|x| (x - med).abs()).collect();
            let mad = percentile(&deviations, 50.0).max(1e-4);
            let modified_z = 0.6745 * (value - med).abs() / mad;
            scores.push((modified_z / MODIFIED_ZSCORE_THRESHOLD).min(1.0));
            if modified_z > MODIFIED_ZSCORE_THRESHOLD {
                risk_factors.push(format!("{name}: modified z {modified_z:.2}"));
            }

            // IQR fences.
            let q1 = percentile(&series, 25.0);
            let q3 = percentile(&series, 75.0);
            let iqr = q3 - q1;
            if iqr > 1e-9 {
                let lower = q1 - 1.5 * iqr;
                let upper = q3 + 1.5 * iqr;
                if value < lower || value > upper {
                    risk_factors.push(format!("{name}: outside IQR [{lower:.2}, {upper:.2}]"));
                    scores.push(1.0);
                } else {
                    scores.push(0.0);
                }
            }
        }

        let score = if scores.is_empty() { 0.0 } else { mean(&scores) };
        let confidence = confidence_from(&scores);
        let severity = severity_from(score, risk_factors.len());

        AnomalyReport {
            score,
            trained: true,
            is_anomaly: !risk_factors.is_empty(),
            confidence,
            risk_factors,
            severity,
        }
    }
}

fn confidence_from(scores: &[f64]) -> f64 {
    if scores.is_empty() {
        return 0.5;
    }
    let m = mean(scores);
    let variance = scores.iter().map(|x| (x - m).powi(2)).sum::<f64>() / scores.len() as f64;
    (1.0 / (1.0 + variance)).clamp(0.5, 1.0)
}

fn severity_from(score: f64, factor_count: usize) -> AnomalySeverity {
    if score > 0.8 || factor_count >= 6 {
        AnomalySeverity::Critical
    } else if score > 0.6 || factor_count >= 4 {
        AnomalySeverity::High
    } else if score > 0.4 || factor_count >= 2 {
        AnomalySeverity::Medium
    } else {
        AnomalySeverity::Low
    }
}

// ---------------------------------------------------------------------------
// Isolation Forest
// ---------------------------------------------------------------------------

enum IsolationNode {
    Internal {
        split_feature: usize,
        split_value: f64,
        left: Box<IsolationNode>,
        right: Box<IsolationNode>,
    },
    Leaf {
        size: usize,
    },
}

struct IsolationTree {
    root: IsolationNode,
}

impl IsolationTree {
    fn build(data: &[Vec<f64>], height_limit: usize, rng: &mut impl Rng) -> Self {
        let root = Self::build_recursive(data, 0, height_limit, rng);
        IsolationTree { root }
    }

    fn build_recursive(
        data: &[Vec<f64>],
        depth: usize,
        height_limit: usize,
        rng: &mut impl Rng,
    ) -> IsolationNode {
        if data.len() <= 1 || depth >= height_limit {
            return IsolationNode::Leaf { size: data.len() };
        }
        let dim = data[0].len();
        if dim == 0 {
            return IsolationNode::Leaf { size: data.len() };
        }
        let split_feature = rng.gen_range(0..dim);
        let mut min_val = f64::INFINITY;
        let mut max_val = f64::NEG_INFINITY;
        for point in data {
            let v = point[split_feature];
            min_val = min_val.min(v);
            max_val = max_val.max(v);
        }
        if (max_val - min_val).abs() < 1e-10 {
            return IsolationNode::Leaf { size: data.len() };
        }
        let split_value = rng.gen_range(min_val..max_val);
        let mut left_data = Vec::new();
        let mut right_data = Vec::new();
        for point in data {
            if point[split_feature] < split_value {
                left_data.push(point.clone());
            } else {
                right_data.push(point.clone());
            }
        }
        IsolationNode::Internal {
            split_feature,
            split_value,
            left: Box::new(Self::build_recursive(&left_data, depth + 1, height_limit, rng)),
            right: Box::new(Self::build_recursive(&right_data, depth + 1, height_limit, rng)),
        }
    }

    fn path_length(&self, point: &[f64]) -> f64 {
        Self::path_length_recursive(&self.root, point, 0)
    }

    fn path_length_recursive(node: &IsolationNode, point: &[f64], depth: usize) -> f64 {
        match node {
            IsolationNode::Leaf { size } => depth as f64 + c_factor(*size),
            IsolationNode::Internal {
                split_feature,
                split_value,
                left,
                right,
            } => {
                if point.get(*split_feature).copied().unwrap_or(0.0) < *split_value {
                    Self::path_length_recursive(left, point, depth + 1)
                } else {
                    Self::path_length_recursive(right, point, depth + 1)
                }
            }
        }
    }
}

/// Average path length of unsuccessful BST search: c(n) = 2H(n-1) - 2(n-1)/n.
fn c_factor(n: usize) -> f64 {
    if n <= 1 {
        return 0.0;
    }
    let n_f = n as f64;
    2.0 * harmonic(n - 1) - 2.0 * (n_f - 1.0) / n_f
}

fn harmonic(n: usize) -> f64 {
    if n == 0 {
        return 0.0;
    }
    (n as f64).ln() + 0.5772156649
}

/// Isolation forest over feature vectors. Anomalous points isolate in
/// short paths; the score approaches 1 for outliers and ~0.5 for points
/// indistinguishable from the training sample.
pub struct IsolationForest {
    trees: Vec<IsolationTree>,
    subsample_size: usize,
    num_trees: usize,
    trained: bool,
}

impl IsolationForest {
    pub fn new(num_trees: usize, subsample_size: usize) -> Self {
        IsolationForest {
            trees: Vec::new(),
            subsample_size,
            num_trees,
            trained: false,
        }
    }

    pub fn fit(&mut self, data: &[Vec<f64>]) {
        if data.is_empty() {
            return;
        }
        let mut rng = rand::thread_rng();
        let height_limit = (self.subsample_size as f64).log2().ceil() as usize;
        self.trees.clear();

        for _ in 0..self.num_trees {
            let sample: Vec<Vec<f64>> = if data.len() <= self.subsample_size {
                data.to_vec()
            } else {
                let mut indices: Vec<usize> = (0..data.len()).collect();
                indices.shuffle(&mut rng);
                indices[..self.subsample_size].iter().map(|&i| data[i].clone()).collect()
            };
            self.trees.push(IsolationTree::build(&sample, height_limit, &mut rng));
        }
        self.trained = true;
    }

    pub fn is_trained(&self) -> bool {
        self.trained
    }

    /// Anomaly score in (0, 1]; 0.5 when untrained.
    pub fn score(&self, point: &[f64]) -> f64 {
        if !self.trained || self.trees.is_empty() {
            return 0.5;
        }
        let avg_path: f64 =
            self.trees.iter().map(|t| t.path_length(point)).sum::<f64>() / self.trees.len() as f64;
        let c_n = c_factor(self.subsample_size);
        if c_n <= 0.0 {
            return 0.5;
        }
        2.0_f64.powf(-avg_path / c_n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(scale: f64, offset: f64) -> FeatureVector {
        let mut values = [0.0; FEATURE_COUNT];
        for (i, v) in values.iter_mut().enumerate() {
            *v = offset + scale * (1.0 + i as f64 * 0.1);
        }
        FeatureVector {
            timestamp_ms: 0,
            values,
        }
    }

    #[test]
    fn test_untrained_returns_no_model() {
        let detector = AnomalyDetector::new(30);
        let report = detector.check(&vector(1.0, 0.0));
        assert!(!report.trained);
        assert_eq!(report.score, 0.5);
        assert_eq!(report.risk_factors, vec!["no_model".to_string()]);
    }

    #[test]
    fn test_outlier_flagged_after_training() {
        let detector = AnomalyDetector::new(30);
        for i in 0..60 {
            // Normal cluster with mild variation.
            detector.observe(&vector(1.0 + (i % 7) as f64 * 0.05, 0.0));
        }

        let normal = detector.check(&vector(1.1, 0.0));
        let outlier = detector.check(&vector(50.0, 100.0));
        assert!(normal.trained && outlier.trained);
        assert!(outlier.score > normal.score);
        assert!(outlier.is_anomaly);
        assert!(!outlier.risk_factors.is_empty());
        assert!(matches!(outlier.severity, AnomalySeverity::High | AnomalySeverity::Critical));
    }

    #[test]
    fn test_history_bounded() {
        let detector = AnomalyDetector::new(10);
        for i in 0..(HISTORY_SIZE + 50) {
            detector.observe(&vector(1.0, i as f64 * 1e-6));
        }
        assert_eq!(detector.history_size(), HISTORY_SIZE);
    }

    #[test]
    fn test_isolation_forest_separates_outliers() {
        let mut forest = IsolationForest::new(50, 64);
        assert_eq!(forest.score(&[0.0, 0.0]), 0.5);

        let data: Vec<Vec<f64>> = (0..200)
            .map(|i| {
                let x = (i % 20) as f64 * 0.05;
                let y = (i % 13) as f64 * 0.07;
                vec![x, y]
            })
            .collect();
        forest.fit(&data);
        assert!(forest.is_trained());

        let inlier = forest.score(&[0.5, 0.4]);
        let outlier = forest.score(&[25.0, -30.0]);
        assert!(
            outlier > inlier,
            "outlier {outlier} should exceed inlier {inlier}"
        );
    }
}
