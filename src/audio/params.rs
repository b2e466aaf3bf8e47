use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Apodization applied to each window before the transform to reduce spectral leakage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowFunction {
    /// Symmetric Hamming window (`0.54 - 0.46 cos(2 pi n / (N - 1))`).
    Hamming,
    /// Symmetric Hann window.
    Hann,
    /// No shaping.
    Rectangular,
}

impl Default for WindowFunction {
    fn default() -> Self {
        WindowFunction::Hamming
    }
}

impl WindowFunction {
    /// Returns the window coefficients for a window of `len` samples.
    pub fn coefficients(&self, len: usize) -> Vec<f64> {
        if len < 2 {
            return vec![1.0; len];
        }

        let denom = (len - 1) as f64;
        (0..len)
            .map(|n| {
                let phase = 2.0 * std::f64::consts::PI * n as f64 / denom;
                match self {
                    WindowFunction::Hamming => 0.54 - 0.46 * phase.cos(),
                    WindowFunction::Hann => 0.5 - 0.5 * phase.cos(),
                    WindowFunction::Rectangular => 1.0,
                }
            })
            .collect()
    }

    /// Applies this window to `data` in-place.
    pub fn apply(&self, data: &mut [f64]) {
        let coefficients = self.coefficients(data.len());
        for (x, w) in data.iter_mut().zip(coefficients) {
            *x *= w;
        }
    }
}

/// Fingerprinting configuration.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncParams {
    /// Samples per analysis window. Must be a power of two.
    pub window_length: usize,
    /// Width of each frequency bucket, in FFT bins.
    pub freq_range_step: usize,
    pub window_function: WindowFunction,
}

impl Default for SyncParams {
    fn default() -> Self {
        Self {
            window_length: super::DEFAULT_WINDOW_LENGTH,
            freq_range_step: super::DEFAULT_FREQ_RANGE_STEP,
            window_function: WindowFunction::default(),
        }
    }
}

impl SyncParams {
    /// Returns new [SyncParams] with the provided `window_length`.
    pub fn with_window_length(mut self, window_length: usize) -> Self {
        self.window_length = window_length;
        self
    }

    /// Returns new [SyncParams] with the provided `freq_range_step`.
    pub fn with_freq_range_step(mut self, freq_range_step: usize) -> Self {
        self.freq_range_step = freq_range_step;
        self
    }

    /// Returns new [SyncParams] with the provided `window_function`.
    pub fn with_window_function(mut self, window_function: WindowFunction) -> Self {
        self.window_function = window_function;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.window_length < 2 || !self.window_length.is_power_of_two() {
            return Err(Error::InvalidParams(format!(
                "window_length must be a power of two >= 2, got {}",
                self.window_length
            )));
        }
        if self.freq_range_step == 0 {
            return Err(Error::InvalidParams(
                "freq_range_step must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Number of frequency buckets per window: `ceil((L / 2) / freq_range_step)`.
    pub fn bucket_count(&self) -> usize {
        let half = self.window_length / 2;
        (half + self.freq_range_step - 1) / self.freq_range_step
    }

    /// Converts a window index (or window offset) into seconds at the given sample rate.
    pub fn window_to_seconds(&self, windows: i64, sample_rate: u32) -> f64 {
        windows as f64 * self.window_length as f64 / sample_rate as f64
    }
}
