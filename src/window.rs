//! Window functions for segment tapering

use std::f64::consts::PI;
use std::fmt;

use crate::error::{invalid, Result};

/// Default Kaiser shape, same as the usual `kaiser` default in spectral tools
pub const DEFAULT_KAISER_BETA: f64 = 14.0;
/// Default Tukey taper fraction
pub const DEFAULT_TUKEY_ALPHA: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Window {
    Boxcar,
    Hann,
    Hamming,
    Bartlett,
    Blackman,
    /// Kaiser window with shape parameter beta
    Kaiser(f64),
    /// Tapered cosine; alpha is the fraction of the window inside the taper
    Tukey(f64),
}

impl Window {
    /// Names accepted by [`Window::from_name`]
    pub const NAMES: [&'static str; 7] = [
        "boxcar", "hann", "hamming", "bartlett", "blackman", "kaiser", "tukey",
    ];

    /// Resolve a window by name. `param` is the shape parameter for
    /// `kaiser` (beta) and `tukey` (alpha) and is ignored otherwise.
    pub fn from_name(name: &str, param: Option<f64>) -> Result<Self> {
        let window = match name {
            "boxcar" | "rectangular" => Self::Boxcar,
            "hann" | "hanning" => Self::Hann,
            "hamming" => Self::Hamming,
            "bartlett" => Self::Bartlett,
            "blackman" => Self::Blackman,
            "kaiser" => Self::Kaiser(param.unwrap_or(DEFAULT_KAISER_BETA)),
            "tukey" => Self::Tukey(param.unwrap_or(DEFAULT_TUKEY_ALPHA)),
            other => return invalid(format!("unknown window type: {other}")),
        };
        window.validate()?;
        Ok(window)
    }

    fn validate(&self) -> Result<()> {
        match *self {
            Self::Kaiser(beta) if !beta.is_finite() || beta < 0.0 => {
                invalid(format!("kaiser beta must be a non-negative number, got {beta}"))
            }
            Self::Tukey(alpha) if !alpha.is_finite() => {
                invalid(format!("tukey alpha must be finite, got {alpha}"))
            }
            _ => Ok(()),
        }
    }

    /// Symmetric window of length `m`
    pub fn symmetric(&self, m: usize) -> Vec<f64> {
        match *self {
            Self::Boxcar => vec![1.0; m],
            Self::Hann => cosine_sum(m, &[0.5, 0.5]),
            Self::Hamming => cosine_sum(m, &[0.54, 0.46]),
            Self::Blackman => cosine_sum(m, &[0.42, 0.5, 0.08]),
            Self::Bartlett => bartlett(m),
            Self::Kaiser(beta) => kaiser(m, beta),
            Self::Tukey(alpha) => tukey(m, alpha),
        }
    }

    /// Periodic window of length `m` for spectral use.
    ///
    /// For even `m` a symmetric window of `m + 1` points is generated and the
    /// last point dropped, so the wraparound sample is not counted twice.
    pub fn periodic(&self, m: usize) -> Vec<f64> {
        if m % 2 == 0 && m > 0 {
            let mut w = self.symmetric(m + 1);
            w.truncate(m);
            w
        } else {
            self.symmetric(m)
        }
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boxcar => write!(f, "boxcar"),
            Self::Hann => write!(f, "hann"),
            Self::Hamming => write!(f, "hamming"),
            Self::Bartlett => write!(f, "bartlett"),
            Self::Blackman => write!(f, "blackman"),
            Self::Kaiser(beta) => write!(f, "kaiser(beta={beta})"),
            Self::Tukey(alpha) => write!(f, "tukey(alpha={alpha})"),
        }
    }
}

/// Generalized cosine window `sum_k (-1)^k a_k cos(2 pi k n / (m - 1))`
fn cosine_sum(m: usize, coeffs: &[f64]) -> Vec<f64> {
    if m <= 1 {
        return vec![1.0; m];
    }
    let denom = (m - 1) as f64;
    (0..m)
        .map(|n| {
            coeffs
                .iter()
                .enumerate()
                .map(|(k, a)| {
                    let sign = if k % 2 == 0 { 1.0 } else { -1.0 };
                    sign * a * (2.0 * PI * k as f64 * n as f64 / denom).cos()
                })
                .sum()
        })
        .collect()
}

fn bartlett(m: usize) -> Vec<f64> {
    if m <= 1 {
        return vec![1.0; m];
    }
    let denom = (m - 1) as f64;
    (0..m)
        .map(|n| {
            let n = n as f64;
            if n <= denom / 2.0 {
                2.0 * n / denom
            } else {
                2.0 - 2.0 * n / denom
            }
        })
        .collect()
}

fn kaiser(m: usize, beta: f64) -> Vec<f64> {
    if m <= 1 {
        return vec![1.0; m];
    }
    let alpha = (m - 1) as f64 / 2.0;
    let norm = bessel_i0e(beta);
    (0..m)
        .map(|n| {
            let ratio = (n as f64 - alpha) / alpha;
            let x = beta * (1.0 - ratio * ratio).max(0.0).sqrt();
            // I0(x) / I0(beta) in scaled form, I0 itself overflows past ~713
            bessel_i0e(x) / norm * (x - beta).exp()
        })
        .collect()
}

fn tukey(m: usize, alpha: f64) -> Vec<f64> {
    if m <= 1 {
        return vec![1.0; m];
    }
    if alpha <= 0.0 {
        return vec![1.0; m];
    }
    if alpha >= 1.0 {
        return cosine_sum(m, &[0.5, 0.5]);
    }
    let denom = (m - 1) as f64;
    let width = (alpha * denom / 2.0).floor() as usize;
    (0..m)
        .map(|n| {
            let x = n as f64;
            if n <= width {
                0.5 * (1.0 + (PI * (-1.0 + 2.0 * x / alpha / denom)).cos())
            } else if n < m - width - 1 {
                1.0
            } else {
                0.5 * (1.0 + (PI * (-2.0 / alpha + 1.0 + 2.0 * x / alpha / denom)).cos())
            }
        })
        .collect()
}

/// Modified Bessel function of the first kind, order zero (power series)
fn bessel_i0(x: f64) -> f64 {
    let half = x / 2.0;
    let mut term = 1.0;
    let mut sum = 1.0;
    let mut k = 1.0;
    loop {
        term *= (half / k) * (half / k);
        sum += term;
        if term < sum * 1e-17 || !sum.is_finite() {
            break;
        }
        k += 1.0;
    }
    sum
}

/// Exponentially scaled `I0(x) * exp(-|x|)`, finite for every finite `x`
fn bessel_i0e(x: f64) -> f64 {
    let x = x.abs();
    if x < 700.0 {
        return bessel_i0(x) * (-x).exp();
    }
    // Asymptotic series, term k is (2k-1)^2 / (8 k x) times term k-1
    let mut term = 1.0;
    let mut sum = 1.0;
    for k in 1..=8 {
        let k = k as f64;
        term *= (2.0 * k - 1.0).powi(2) / (8.0 * k * x);
        sum += term;
    }
    sum / (2.0 * PI * x).sqrt()
}
