//! Averaged power spectral density of one frequency hop
//!
//! Each hop gets its own [`PsdState`]. Sample blocks are transformed in parallel on the
//! PSD executor and summed into the state under its lock; finalizing waits for all of
//! them and produces the shifted, cropped, averaged (and usually log-scaled) spectrum.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::{
    error::{invalid, Error, Result},
    pool::{BoundedExecutor, TaskHandle},
    spectral::{fftshift, Detrend, FftBackend, IntoComplex64, Scaling, Welch},
    window::Window,
    Sample,
};

/// Frequency axis and power of one finished hop, ascending in frequency
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrum {
    pub freqs: Vec<f64>,
    pub power: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct PsdConfig {
    pub bins: usize,
    pub sample_rate: f64,
    pub window: Window,
    /// Overlap between Welch segments, as a fraction of `bins`
    pub fft_overlap: f64,
    /// Fraction of bins cropped from the hop edges (0 = no crop)
    pub crop_factor: f64,
    pub log_scale: bool,
    pub remove_dc: bool,
    pub detrend: Detrend,
    pub backend: FftBackend,
    pub max_threads: usize,
    pub max_queue_size: i64,
}

impl Default for PsdConfig {
    fn default() -> Self {
        Self {
            bins: 512,
            sample_rate: 2e6,
            window: Window::Hann,
            fft_overlap: 0.5,
            crop_factor: 0.0,
            log_scale: true,
            remove_dc: false,
            detrend: Detrend::None,
            backend: FftBackend::Auto,
            max_threads: 0,
            max_queue_size: 0,
        }
    }
}

#[derive(Debug, Default)]
struct Accumulator {
    repeats: u32,
    power_sum: Option<Vec<f64>>,
}

/// Running sums of one hop. Created by [`Psd::start_hop`], consumed by [`Psd::finalize`].
pub struct PsdState {
    center_freq: f64,
    freqs: Vec<f64>,
    accum: Arc<Mutex<Accumulator>>,
    pending: Vec<TaskHandle<Result<()>>>,
}

impl PsdState {
    pub fn center_freq(&self) -> f64 {
        self.center_freq
    }

    /// Segments submitted so far
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

pub struct Psd {
    bins: usize,
    crop_factor: f64,
    log_scale: bool,
    remove_dc: bool,
    welch: Arc<Welch>,
    base_freqs: Vec<f64>,
    executor: BoundedExecutor,
}

impl Psd {
    pub fn new(config: &PsdConfig) -> Result<Self> {
        if config.bins == 0 {
            return invalid("number of bins must be at least 1");
        }
        if !(0.0..1.0).contains(&config.fft_overlap) {
            return invalid(format!(
                "FFT overlap must be in [0, 1), got {}",
                config.fft_overlap
            ));
        }
        if !(0.0..1.0).contains(&config.crop_factor) {
            return invalid(format!(
                "crop factor must be in [0, 1), got {}",
                config.crop_factor
            ));
        }
        let noverlap = (config.bins as f64 * config.fft_overlap).floor() as usize;
        let welch = Welch::new(
            config.sample_rate,
            config.bins,
            noverlap,
            config.window,
            config.detrend,
            Scaling::Density,
            config.backend,
        )?;
        debug!(
            "PSD: {} bins, window {}, {} overlapping samples, detrend {:?}",
            config.bins, config.window, noverlap, config.detrend
        );
        Ok(Self {
            bins: config.bins,
            crop_factor: config.crop_factor,
            log_scale: config.log_scale,
            remove_dc: config.remove_dc,
            base_freqs: welch.freqs(),
            welch: Arc::new(welch),
            executor: BoundedExecutor::new("psd", config.max_threads, config.max_queue_size)?,
        })
    }

    pub fn executor(&self) -> &BoundedExecutor {
        &self.executor
    }

    /// Fresh state for the hop centered at `center_freq`
    pub fn start_hop(&self, center_freq: f64) -> PsdState {
        PsdState {
            center_freq,
            freqs: self.base_freqs.iter().map(|f| f + center_freq).collect(),
            accum: Arc::new(Mutex::new(Accumulator::default())),
            pending: Vec::new(),
        }
    }

    /// Queue the Welch estimate of `samples` to be summed into `state`.
    /// Blocks while the PSD queue is full.
    pub fn submit_segment(&self, state: &mut PsdState, samples: Vec<Sample>) {
        let welch = self.welch.clone();
        let accum = state.accum.clone();
        let remove_dc = self.remove_dc;
        let handle = self
            .executor
            .submit(move || accumulate(&welch, remove_dc, &accum, &samples));
        state.pending.push(handle);
    }

    /// Synchronous variant of [`Psd::submit_segment`], mostly for tests and tools
    pub fn update<S: IntoComplex64>(&self, state: &PsdState, samples: &[S]) -> Result<()> {
        accumulate(&self.welch, self.remove_dc, &state.accum, samples)
    }

    /// Queue the final averaging of `state` behind all of its segments
    pub fn finalize(&self, state: PsdState) -> TaskHandle<Result<Spectrum>> {
        let bins = self.bins;
        let crop_factor = self.crop_factor;
        let log_scale = self.log_scale;
        self.executor.submit(move || {
            let PsdState {
                freqs,
                accum,
                pending,
                ..
            } = state;
            for handle in pending {
                handle.wait()??;
            }
            let accum = accum
                .lock()
                .map_err(|_| Error::TaskFailed("PSD accumulator lock poisoned".to_owned()))?;
            let power = accum.power_sum.clone().ok_or(Error::IncompletePsd)?;
            Ok(average(
                freqs,
                power,
                accum.repeats,
                bins,
                crop_factor,
                log_scale,
            ))
        })
    }
}

fn accumulate<S: IntoComplex64>(
    welch: &Welch,
    remove_dc: bool,
    accum: &Mutex<Accumulator>,
    samples: &[S],
) -> Result<()> {
    // The FFT runs outside the lock, only the sum is serialized
    let mut power = welch.estimate(samples)?;
    if remove_dc {
        remove_dc_bin(&mut power);
    }
    let mut accum = accum
        .lock()
        .map_err(|_| Error::TaskFailed("PSD accumulator lock poisoned".to_owned()))?;
    match accum.power_sum.as_mut() {
        Some(sum) => sum.iter_mut().zip(&power).for_each(|(s, p)| *s += p),
        None => accum.power_sum = Some(power),
    }
    accum.repeats += 1;
    Ok(())
}

/// Replace the DC bin with the mean of its two spectral neighbours.
/// Works on FFT bin order, where those neighbours are bins 1 and n-1.
fn remove_dc_bin(power: &mut [f64]) {
    let n = power.len();
    if n >= 3 {
        power[0] = (power[1] + power[n - 1]) / 2.0;
    }
}

fn average(
    mut freqs: Vec<f64>,
    mut power: Vec<f64>,
    repeats: u32,
    bins: usize,
    crop_factor: f64,
    log_scale: bool,
) -> Spectrum {
    fftshift(&mut freqs);
    fftshift(&mut power);
    if crop_factor > 0.0 {
        let half = (crop_factor * bins as f64 / 2.0).round_ties_even() as usize;
        if half > 0 && 2 * half < freqs.len() {
            let end = freqs.len() - half;
            freqs = freqs[half..end].to_vec();
            power = power[half..end].to_vec();
        }
    }
    if repeats > 1 {
        let n = repeats as f64;
        power.iter_mut().for_each(|p| *p /= n);
    }
    if log_scale {
        power.iter_mut().for_each(|p| *p = 10.0 * p.log10());
    }
    Spectrum { freqs, power }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;
    use std::f32::consts::PI;

    fn noise(n: usize, seed: u64) -> Vec<Sample> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| Sample::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)))
            .collect()
    }

    fn config(bins: usize) -> PsdConfig {
        PsdConfig {
            bins,
            sample_rate: 1e6,
            max_threads: 4,
            ..PsdConfig::default()
        }
    }

    #[test]
    fn test_freq_axis_is_shifted_and_centered() {
        let psd = Psd::new(&PsdConfig {
            log_scale: false,
            ..config(8)
        })
        .unwrap();
        let mut state = psd.start_hop(100e6);
        assert_eq!(state.center_freq(), 100e6);
        psd.submit_segment(&mut state, noise(64, 1));
        let spectrum = psd.finalize(state).wait().unwrap().unwrap();
        let step = 1e6 / 8.0;
        let expected: Vec<f64> = (-4..4).map(|k| 100e6 + k as f64 * step).collect();
        assert_eq!(spectrum.freqs, expected);
        assert_eq!(spectrum.power.len(), 8);
        assert!(spectrum.power.iter().all(|p| *p > 0.0));
    }

    #[test]
    fn test_order_of_segments_does_not_matter() {
        let blocks: Vec<Vec<Sample>> = (0..12).map(|i| noise(256, i)).collect();
        let psd = Psd::new(&PsdConfig {
            log_scale: false,
            ..config(32)
        })
        .unwrap();

        let mut forward = psd.start_hop(0.0);
        for block in &blocks {
            psd.submit_segment(&mut forward, block.clone());
        }
        let mut backward = psd.start_hop(0.0);
        for block in blocks.iter().rev() {
            psd.submit_segment(&mut backward, block.clone());
        }
        assert_eq!(forward.pending(), 12);
        let a = psd.finalize(forward).wait().unwrap().unwrap();
        let b = psd.finalize(backward).wait().unwrap().unwrap();
        for (x, y) in a.power.iter().zip(&b.power) {
            assert!((x - y).abs() <= 1e-12 * x.abs().max(1.0));
        }
    }

    #[test]
    fn test_async_matches_sync_average() {
        let blocks: Vec<Vec<Sample>> = (0..3).map(|i| noise(128, 10 + i)).collect();
        let psd = Psd::new(&config(16)).unwrap();
        let sync = psd.start_hop(0.0);
        for block in &blocks {
            psd.update(&sync, block).unwrap();
        }
        let mut parallel = psd.start_hop(0.0);
        for block in &blocks {
            psd.submit_segment(&mut parallel, block.clone());
        }
        let a = psd.finalize(sync).wait().unwrap().unwrap();
        let b = psd.finalize(parallel).wait().unwrap().unwrap();
        for (x, y) in a.power.iter().zip(&b.power) {
            assert!((x - y).abs() < 1e-9);
        }
    }

    #[test]
    fn test_finalize_without_segments_fails() {
        let psd = Psd::new(&config(16)).unwrap();
        let state = psd.start_hop(1e6);
        assert!(matches!(
            psd.finalize(state).wait().unwrap(),
            Err(Error::IncompletePsd)
        ));
    }

    #[test]
    fn test_crop_and_log_scale() {
        let psd = Psd::new(&PsdConfig {
            crop_factor: 0.25,
            window: Window::Boxcar,
            ..config(16)
        })
        .unwrap();
        let mut state = psd.start_hop(0.0);
        psd.submit_segment(&mut state, vec![Sample::new(1.0, 0.0); 64]);
        psd.submit_segment(&mut state, vec![Sample::new(1.0, 0.0); 64]);
        let spectrum = psd.finalize(state).wait().unwrap().unwrap();
        // round(0.25 * 16 / 2) = 2 bins cropped from each end
        assert_eq!(spectrum.freqs.len(), 12);
        assert_eq!(spectrum.freqs[0], -6.0 * 1e6 / 16.0);
        // DC of a constant signal: |16|^2 / (fs * 16), averaged over two identical blocks
        let dc = spectrum.freqs.iter().position(|f| *f == 0.0).unwrap();
        let expected = 10.0 * (16.0 / 1e6f64).log10();
        assert!((spectrum.power[dc] - expected).abs() < 1e-9);
    }

    #[test]
    fn test_remove_dc_interpolates_neighbours() {
        let psd = Psd::new(&PsdConfig {
            remove_dc: true,
            log_scale: false,
            window: Window::Boxcar,
            fft_overlap: 0.0,
            ..config(16)
        })
        .unwrap();
        // DC offset plus a tone in bin 1
        let samples: Vec<Sample> = (0..64)
            .map(|i| {
                let phase = 2.0 * PI * i as f32 / 16.0;
                Sample::new(1.0 + phase.cos(), phase.sin())
            })
            .collect();
        let mut state = psd.start_hop(0.0);
        psd.submit_segment(&mut state, samples);
        let spectrum = psd.finalize(state).wait().unwrap().unwrap();
        let dc = spectrum.freqs.iter().position(|f| *f == 0.0).unwrap();
        let expected = (spectrum.power[dc + 1] + spectrum.power[dc - 1]) / 2.0;
        assert!((spectrum.power[dc] - expected).abs() < 1e-9);
    }

    #[test]
    fn test_short_block_surfaces_error() {
        let psd = Psd::new(&config(64)).unwrap();
        let mut state = psd.start_hop(0.0);
        psd.submit_segment(&mut state, noise(10, 3));
        assert!(matches!(
            psd.finalize(state).wait().unwrap(),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_rejects_bad_config() {
        assert!(Psd::new(&PsdConfig { bins: 0, ..PsdConfig::default() }).is_err());
        assert!(Psd::new(&PsdConfig { fft_overlap: 1.0, ..PsdConfig::default() }).is_err());
        assert!(Psd::new(&PsdConfig { crop_factor: -0.1, ..PsdConfig::default() }).is_err());
    }
}
