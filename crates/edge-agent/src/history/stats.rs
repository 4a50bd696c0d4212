use serde::Serialize;

/// Summary of one field over a window.
///
/// With no samples every value is `NaN` and `count` is 0; `NaN` serializes as `null`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Statistics {
    pub mean: f64,
    /// Sample standard deviation, 0 for a single sample.
    pub stddev: f64,
    pub min: f64,
    pub max: f64,
    pub count: usize,
}

impl Statistics {
    pub fn empty() -> Self {
        Self {
            mean: f64::NAN,
            stddev: f64::NAN,
            min: f64::NAN,
            max: f64::NAN,
            count: 0,
        }
    }

    pub fn from_values(values: &[f64]) -> Self {
        let count = values.len();
        if count == 0 {
            return Self::empty();
        }

        let mean = values.iter().sum::<f64>() / count as f64;
        let stddev = if count > 1 {
            let sq: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
            (sq / (count - 1) as f64).sqrt()
        } else {
            0.0
        };
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        Self {
            mean,
            stddev,
            min,
            max,
            count,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Distance from the mean in standard deviations. `None` when undefined.
    pub fn z_score(&self, value: f64) -> Option<f64> {
        (self.count > 1 && self.stddev > 0.0).then(|| (value - self.mean).abs() / self.stddev)
    }
}

impl PartialEq for Statistics {
    fn eq(&self, other: &Self) -> bool {
        fn same(a: f64, b: f64) -> bool {
            (a.is_nan() && b.is_nan()) || (a - b).abs() < 1e-9
        }
        self.count == other.count
            && same(self.mean, other.mean)
            && same(self.stddev, other.stddev)
            && same(self.min, other.min)
            && same(self.max, other.max)
    }
}
