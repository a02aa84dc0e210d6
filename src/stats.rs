// Numeric kernel - pure statistical functions shared by every signal
// producer. No state, no allocation beyond scratch sorting.
//
// Every function is total: empty or degenerate input returns 0.0 (never
// NaN or infinity), so a score downstream can always be clamped into [0,1].

use std::collections::HashMap;

/// Arithmetic mean. Empty input returns 0.
pub fn mean(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().sum::<f64>() / data.len() as f64
}

/// Population variance. Fewer than 2 samples returns 0.
pub fn variance(data: &[f64]) -> f64 {
    if data.len() < 2 {
        return 0.0;
    }
    let m = mean(data);
    data.iter().map(|x| (x - m).powi(2)).sum::<f64>() / data.len() as f64
}

/// Population standard deviation. Fewer than 2 samples returns 0.
pub fn std_dev(data: &[f64]) -> f64 {
    variance(data).sqrt()
}

/// Median of a sample. Empty input returns 0.
pub fn median(data: &[f64]) -> f64 {
    percentile(data, 50.0)
}

/// Percentile via linear interpolation between closest ranks.
///
/// `p` is in [0, 100]. Empty input returns 0; a single sample returns that
/// sample for every percentile.
pub fn percentile(data: &[f64], p: f64) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let mut sorted = data.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let p = p.clamp(0.0, 100.0);
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        return sorted[lo];
    }
    let frac = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Interquartile range (q3 - q1).
pub fn iqr(data: &[f64]) -> f64 {
    percentile(data, 75.0) - percentile(data, 25.0)
}

/// Absolute z-score of `value` against (`mean`, `std`).
///
/// A zero spread means the sample carries no information about deviation:
/// an exactly-matching value scores 0, anything else scores the cap the
/// caller applies downstream (we return a large finite sentinel).
pub fn z_score(value: f64, mean: f64, std: f64) -> f64 {
    if std < 1e-12 {
        if (value - mean).abs() < 1e-12 {
            return 0.0;
        }
        return 100.0;
    }
    (value - mean).abs() / std
}

/// Clamp into [lo, hi].
pub fn clamp(value: f64, lo: f64, hi: f64) -> f64 {
    value.max(lo).min(hi)
}

/// Clamp into the score domain [0, 1].
pub fn clamp01(value: f64) -> f64 {
    clamp(value, 0.0, 1.0)
}

/// Logistic sigmoid.
pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Exponentially weighted moving average over `data` in arrival order.
///
/// Seeds from the first sample. Empty input returns 0.
pub fn ewma(data: &[f64], alpha: f64) -> f64 {
    let mut iter = data.iter();
    let mut acc = match iter.next() {
        Some(first) => *first,
        None => return 0.0,
    };
    for v in iter {
        acc = alpha * v + (1.0 - alpha) * acc;
    }
    acc
}

/// Coefficient of variation (std / mean). Zero mean returns 0.
pub fn coefficient_of_variation(data: &[f64]) -> f64 {
    let m = mean(data);
    if m.abs() < 1e-12 {
        return 0.0;
    }
    std_dev(data) / m
}

/// Euclidean distance between two vectors of equal length.
pub fn euclidean_distance(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f64>()
        .sqrt()
}

/// Cosine distance (1 - cosine similarity). Zero-norm input returns 0.
pub fn cosine_distance(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a < 1e-12 || norm_b < 1e-12 {
        return 0.0;
    }
    1.0 - dot / (norm_a * norm_b)
}

/// Shannon entropy (bits) of a discrete sample.
pub fn shannon_entropy<T: std::hash::Hash + Eq>(sample: &[T]) -> f64 {
    if sample.is_empty() {
        return 0.0;
    }
    let mut counts: HashMap<&T, usize> = HashMap::new();
    for item in sample {
        *counts.entry(item).or_insert(0) += 1;
    }
    let n = sample.len() as f64;
    counts
        .values()
        .map(|&c| {
            let p = c as f64 / n;
            -p * p.log2()
        })
        .sum()
}

/// Shannon entropy normalized into [0, 1] by the maximum achievable for
/// the observed alphabet size. One distinct symbol (or fewer) returns 0.
pub fn normalized_entropy<T: std::hash::Hash + Eq>(sample: &[T]) -> f64 {
    if sample.is_empty() {
        return 0.0;
    }
    let distinct: std::collections::HashSet<&T> = sample.iter().collect();
    if distinct.len() <= 1 {
        return 0.0;
    }
    shannon_entropy(sample) / (distinct.len() as f64).log2()
}

/// Entropy of inter-event intervals, quantized to 100 ms buckets and
/// normalized into [0, 1]. Perfectly regular timing scores 0, maximally
/// irregular timing approaches 1.
pub fn interval_entropy(intervals_ms: &[f64]) -> f64 {
    if intervals_ms.len() < 2 {
        return 0.0;
    }
    let buckets: Vec<i64> = intervals_ms
        .iter()
        .map(|&i| (i / 100.0).round() as i64)
        .collect();
    normalized_entropy(&buckets)
}

/// Consecutive differences of a timestamp sequence (milliseconds).
/// Fewer than 2 timestamps yields an empty vector.
pub fn intervals(timestamps_ms: &[u64]) -> Vec<f64> {
    timestamps_ms
        .windows(2)
        .map(|w| w[1].saturating_sub(w[0]) as f64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_and_variance_guards() {
        assert_eq!(mean(&[]), 0.0);
        assert_eq!(variance(&[5.0]), 0.0);
        assert_eq!(std_dev(&[]), 0.0);
        assert_eq!(mean(&[1.0, 2.0, 3.0]), 2.0);
    }

    #[test]
    fn test_percentile_exact_values() {
        let data = [15.0, 20.0, 35.0, 40.0, 50.0];
        assert_eq!(percentile(&data, 0.0), 15.0);
        assert_eq!(percentile(&data, 50.0), 35.0);
        assert_eq!(percentile(&data, 100.0), 50.0);
        // Linear interpolation between ranks 1 and 2
        assert!((percentile(&data, 40.0) - 29.0).abs() < 1e-9);
        assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
    }

    #[test]
    fn test_z_score_zero_spread() {
        assert_eq!(z_score(5.0, 5.0, 0.0), 0.0);
        assert!(z_score(6.0, 5.0, 0.0) > 10.0);
        assert!((z_score(7.0, 5.0, 1.0) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_entropy_monotone_under_duplication() {
        // Duplicating the whole sample preserves the distribution, so
        // entropy must not change; skewing it must not increase entropy.
        let sample = ["a", "b", "c", "d"];
        let doubled = ["a", "b", "c", "d", "a", "b", "c", "d"];
        let skewed = ["a", "a", "a", "a", "a", "b", "c", "d"];

        let h = shannon_entropy(&sample);
        assert!((shannon_entropy(&doubled) - h).abs() < 1e-9);
        assert!(shannon_entropy(&skewed) < h);

        assert_eq!(shannon_entropy(&["x"; 10]), 0.0);
        assert!((normalized_entropy(&sample) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_interval_entropy_regular_vs_jittered() {
        let regular: Vec<f64> = vec![1000.0; 50];
        let jittered: Vec<f64> = (0..50).map(|i| 100.0 + (i as f64 * 137.0) % 900.0).collect();
        assert_eq!(interval_entropy(&regular), 0.0);
        assert!(interval_entropy(&jittered) > 0.5);
    }

    #[test]
    fn test_ewma_converges() {
        let burst: Vec<f64> = std::iter::repeat(1.0)
            .take(5)
            .chain(std::iter::repeat(0.0).take(30))
            .collect();
        let settled = ewma(&burst, 0.3);
        assert!(settled < 0.01, "ewma should decay after clean samples: {settled}");
        assert_eq!(ewma(&[], 0.3), 0.0);
    }

    #[test]
    fn test_distances() {
        assert_eq!(euclidean_distance(&[0.0, 0.0], &[3.0, 4.0]), 5.0);
        assert!(cosine_distance(&[1.0, 0.0], &[1.0, 0.0]).abs() < 1e-12);
        assert!((cosine_distance(&[1.0, 0.0], &[0.0, 1.0]) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_cv_and_sigmoid_bounds() {
        assert_eq!(coefficient_of_variation(&[0.0, 0.0]), 0.0);
        let uniform = vec![500.0; 20];
        assert_eq!(coefficient_of_variation(&uniform), 0.0);
        assert!(sigmoid(0.0) - 0.5 < 1e-12);
        assert!(sigmoid(10.0) > 0.99);
    }
}
