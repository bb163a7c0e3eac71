//! Frequency hopping plan, buffer sizing and the bin/overlap/time conversions around them

use tracing::{debug, info, warn};

use crate::error::{invalid, Result};

/// Round `freq` to the nearest multiple of `bin_size`
pub fn nearest_freq(freq: f64, bin_size: f64) -> f64 {
    (freq / bin_size).round_ties_even() * bin_size
}

/// Constraint on the FFT size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BinsRule {
    #[default]
    Any,
    Even,
    Pow2,
}

/// Round `bins` up to satisfy `rule`
pub fn nearest_bins(bins: usize, rule: BinsRule) -> usize {
    match rule {
        BinsRule::Any => bins,
        BinsRule::Even if bins % 2 != 0 => {
            let even = bins + 1;
            warn!("number of FFT bins should be even, changing to {}", even);
            even
        }
        BinsRule::Pow2 if !bins.is_power_of_two() => {
            let pow2 = bins.next_power_of_two();
            warn!("number of FFT bins should be power of two, changing to {}", pow2);
            pow2
        }
        _ => bins,
    }
}

/// Round the overlap/crop factor up so that `overlap * bins` is an even number of bins
pub fn nearest_overlap(overlap: f64, bins: usize) -> f64 {
    let bins_overlap = overlap * bins as f64;
    if bins_overlap % 2.0 != 0.0 {
        let even = (bins_overlap / 2.0).ceil() * 2.0;
        let overlap = even / bins as f64;
        warn!(
            "number of overlapping FFT bins should be even, changing overlap/crop factor to {:.5}",
            overlap
        );
        overlap
    } else {
        overlap
    }
}

/// Bin size in Hz to the number of FFT bins needed at `sample_rate`
pub fn bin_size_to_bins(bin_size: f64, sample_rate: f64) -> usize {
    (sample_rate / bin_size).ceil() as usize
}

pub fn bins_to_bin_size(bins: usize, sample_rate: f64) -> f64 {
    sample_rate / bins as f64
}

/// Integration time in seconds to the number of averaged spectra
pub fn time_to_repeats(bins: usize, integration_time: f64, sample_rate: f64) -> usize {
    (sample_rate * integration_time / bins as f64).ceil() as usize
}

pub fn repeats_to_time(bins: usize, repeats: usize, sample_rate: f64) -> f64 {
    (repeats * bins) as f64 / sample_rate
}

/// Center frequencies of a sweep plus the derived hop geometry
#[derive(Debug, Clone, PartialEq)]
pub struct FreqPlan {
    pub bin_size: f64,
    /// Bins left per hop after removing the overlap
    pub bins_crop: usize,
    pub sample_rate_crop: f64,
    pub hop_size: f64,
    pub hopping: bool,
    pub freqs: Vec<f64>,
}

impl FreqPlan {
    /// Plan hops covering `[min_freq, max_freq]` with `bins`-point FFTs.
    /// `overlap` is the fraction of each hop shared with its neighbour.
    pub fn new(
        min_freq: f64,
        max_freq: f64,
        bins: usize,
        overlap: f64,
        sample_rate: f64,
    ) -> Result<Self> {
        if !(min_freq <= max_freq) {
            return invalid(format!(
                "min frequency {min_freq} must not exceed max frequency {max_freq}"
            ));
        }
        if bins == 0 {
            return invalid("number of bins must be at least 1");
        }
        if !(0.0..1.0).contains(&overlap) {
            return invalid(format!("overlap must be in [0, 1), got {overlap}"));
        }
        if !(sample_rate > 0.0) {
            return invalid(format!("sample rate must be positive, got {sample_rate}"));
        }

        let bin_size = bins_to_bin_size(bins, sample_rate);
        let bins_crop = ((1.0 - overlap) * bins as f64).round_ties_even() as usize;
        let sample_rate_crop = (1.0 - overlap) * sample_rate;
        let freq_range = max_freq - min_freq;
        let hopping = freq_range >= sample_rate_crop;
        let hop_size = nearest_freq(sample_rate_crop, bin_size);

        let freqs = if hopping {
            if hop_size <= 0.0 {
                return invalid(format!(
                    "overlap {overlap} leaves less than one bin per hop"
                ));
            }
            let hops = (freq_range / hop_size).ceil() as usize;
            let first = min_freq + hop_size / 2.0;
            (0..hops).map(|i| first + i as f64 * hop_size).collect()
        } else {
            vec![min_freq + freq_range / 2.0]
        };

        let plan = Self {
            bin_size,
            bins_crop,
            sample_rate_crop,
            hop_size,
            hopping,
            freqs,
        };
        plan.log_summary(overlap, bins, sample_rate, freq_range);
        Ok(plan)
    }

    pub fn hops(&self) -> usize {
        self.freqs.len()
    }

    fn log_summary(&self, overlap: f64, bins: usize, sample_rate: f64, freq_range: f64) {
        info!("overlap: {:.5}", overlap);
        info!("bin_size: {:.2} Hz", self.bin_size);
        info!("bins: {}", bins);
        info!("bins (after crop): {}", self.bins_crop);
        info!("sample_rate: {:.3} MHz", sample_rate / 1e6);
        info!("sample_rate (after crop): {:.3} MHz", self.sample_rate_crop / 1e6);
        info!("freq_range: {:.3} MHz", freq_range / 1e6);
        info!("hopping: {}", if self.hopping { "YES" } else { "NO" });
        info!("hop_size: {:.3} MHz", self.hop_size / 1e6);
        info!("hops: {}", self.hops());
        if let (Some(first), Some(last)) = (self.freqs.first(), self.freqs.last()) {
            info!("min_center_freq: {:.3} MHz", first / 1e6);
            info!("max_center_freq: {:.3} MHz", last / 1e6);
            info!("min_freq (after crop): {:.3} MHz", (first - self.hop_size / 2.0) / 1e6);
            info!("max_freq (after crop): {:.3} MHz", (last + self.hop_size / 2.0) / 1e6);
        }
        debug!("frequency hops table:");
        debug!("  {:8}      {:8}      {:8}", "Min:", "Center:", "Max:");
        for f in &self.freqs {
            debug!(
                "  {:8.3} MHz  {:8.3} MHz  {:8.3} MHz",
                (f - sample_rate / 2.0) / 1e6,
                f / 1e6,
                (f + sample_rate / 2.0) / 1e6
            );
        }
    }
}

/// How big the sample buffer is and how many reads fill one averaging period
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPlan {
    pub allocation_size: usize,
    pub repeats_per_average: u32,
}

impl BufferPlan {
    /// `max_buffer_size == 0` caps at 100 base units, a negative value means unlimited.
    /// An explicit cap below one FFT of `bins` samples is rejected.
    pub fn new(bins: usize, repeats: usize, base_unit: usize, max_buffer_size: i64) -> Result<Self> {
        if base_unit == 0 {
            return invalid("base buffer size must be positive");
        }
        if bins == 0 || repeats == 0 {
            return invalid("bins and repeats must be at least 1");
        }
        let samples = bins * repeats;
        let mut allocation_size = samples.div_ceil(base_unit) * base_unit;
        let mut repeats_per_average = 1;

        let cap = match max_buffer_size {
            // The automatic cap always leaves room for one FFT
            0 => Some((base_unit * 100).max(bins.div_ceil(base_unit) * base_unit)),
            n if n < 0 => None,
            n => Some((n as usize).div_ceil(base_unit) * base_unit),
        };
        if let Some(cap) = cap {
            if cap < bins {
                return invalid(format!(
                    "max buffer size ({cap} samples) is smaller than one FFT of {bins} bins"
                ));
            }
            if allocation_size > cap {
                warn!(
                    "required buffer size ({}) will be shrunk to max_buffer_size ({})",
                    allocation_size, cap
                );
                repeats_per_average = allocation_size.div_ceil(cap) as u32;
                allocation_size = cap;
            }
        }

        info!("repeats: {}", repeats);
        info!("samples: {}", samples);
        match cap {
            Some(cap) => info!(
                "max_buffer_size (samples): {} (repeats: {:.2})",
                cap,
                cap as f64 / bins as f64
            ),
            None => info!("max_buffer_size (samples): UNLIMITED"),
        }
        info!(
            "buffer_size (samples): {} (repeats: {:.2})",
            allocation_size,
            allocation_size as f64 / bins as f64
        );
        info!("buffer_repeats: {}", repeats_per_average);

        Ok(Self {
            allocation_size,
            repeats_per_average,
        })
    }

    /// Samples acquired per hop
    pub fn samples_per_hop(&self) -> usize {
        self.allocation_size * self.repeats_per_average as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_point_plan() {
        let plan = FreqPlan::new(100e6, 100e6, 512, 0.0, 2e6).unwrap();
        assert!(!plan.hopping);
        assert_eq!(plan.freqs, vec![100e6]);
    }

    #[test]
    fn test_narrow_range_is_one_centered_hop() {
        let plan = FreqPlan::new(100e6, 101e6, 512, 0.25, 2e6).unwrap();
        // 1 MHz < 2 MHz * 0.75
        assert_eq!(plan.hops(), 1);
        assert_eq!(plan.freqs[0], 100.5e6);
    }

    #[test]
    fn test_hops_are_evenly_spaced() {
        let plan = FreqPlan::new(88e6, 108e6, 1000, 0.2, 2.4e6).unwrap();
        assert!(plan.hopping);
        assert_eq!(plan.bin_size, 2400.0);
        assert_eq!(plan.bins_crop, 800);
        assert!((plan.hop_size - 1.92e6).abs() < 1e-6);
        assert_eq!(plan.hops(), (20e6f64 / plan.hop_size).ceil() as usize);
        assert!((plan.freqs[0] - (88e6 + plan.hop_size / 2.0)).abs() < 1e-6);
        for pair in plan.freqs.windows(2) {
            assert!(pair[1] > pair[0]);
            assert!((pair[1] - pair[0] - plan.hop_size).abs() < 1e-3);
        }
        // Cropped hops still cover the requested range
        let last = *plan.freqs.last().unwrap();
        assert!(last + plan.hop_size / 2.0 >= 108e6);
    }

    #[test]
    fn test_hop_size_is_multiple_of_bin_size() {
        let plan = FreqPlan::new(0.0, 50e6, 300, 0.1, 2e6).unwrap();
        let ratio = plan.hop_size / plan.bin_size;
        assert!((ratio - ratio.round()).abs() < 1e-9);
    }

    #[test]
    fn test_plan_rejects_bad_input() {
        assert!(FreqPlan::new(2e6, 1e6, 512, 0.0, 2e6).is_err());
        assert!(FreqPlan::new(1e6, 2e6, 0, 0.0, 2e6).is_err());
        assert!(FreqPlan::new(1e6, 2e6, 512, 1.0, 2e6).is_err());
        assert!(FreqPlan::new(1e6, 2e6, 512, 0.0, 0.0).is_err());
    }

    #[test]
    fn test_nearest_overlap() {
        // 0.5 * 4 = 2 bins, already even
        assert_eq!(nearest_overlap(0.5, 4), 0.5);
        // 0.3 * 4 = 1.2 bins, rounded up to 2
        assert_eq!(nearest_overlap(0.3, 4), 0.5);
        assert_eq!(nearest_overlap(0.1, 100), 0.1);
        assert_eq!(nearest_overlap(0.15, 100), 0.16);
    }

    #[test]
    fn test_nearest_bins() {
        assert_eq!(nearest_bins(513, BinsRule::Any), 513);
        assert_eq!(nearest_bins(513, BinsRule::Even), 514);
        assert_eq!(nearest_bins(513, BinsRule::Pow2), 1024);
        assert_eq!(nearest_bins(512, BinsRule::Pow2), 512);
    }

    #[test]
    fn test_conversions() {
        assert_eq!(bin_size_to_bins(3000.0, 2e6), 667);
        assert_eq!(bins_to_bin_size(1000, 2e6), 2000.0);
        assert_eq!(time_to_repeats(1000, 0.5, 2e6), 1000);
        assert_eq!(repeats_to_time(1000, 1000, 2e6), 0.5);
        assert_eq!(nearest_freq(1234.0, 100.0), 1200.0);
    }

    #[test]
    fn test_buffer_fits_without_cap() {
        let plan = BufferPlan::new(512, 10, 16384, 0).unwrap();
        assert_eq!(plan.allocation_size, 16384);
        assert_eq!(plan.repeats_per_average, 1);
    }

    #[test]
    fn test_buffer_is_shrunk_to_cap() {
        // 512 * 10000 samples need 313 units of 16384, cap is 100 units
        let plan = BufferPlan::new(512, 10_000, 16384, 0).unwrap();
        assert_eq!(plan.allocation_size, 1_638_400);
        assert_eq!(plan.repeats_per_average, 4);
        assert!(plan.samples_per_hop() >= 512 * 10_000);

        // Explicit cap is rounded up to a whole unit
        let plan = BufferPlan::new(1000, 100, 1024, 5000).unwrap();
        assert_eq!(plan.allocation_size, 5120);
        assert_eq!(plan.repeats_per_average, 20);
        assert!(plan.samples_per_hop() >= 100_000);
    }

    #[test]
    fn test_cap_below_one_fft_is_rejected() {
        assert!(matches!(
            BufferPlan::new(4096, 10, 512, 1024),
            Err(crate::Error::InvalidParameter(_))
        ));
        let plan = BufferPlan::new(4096, 10, 16, 0).unwrap();
        assert_eq!(plan.allocation_size, 4096);
        // Rounded up to a whole unit, the cap fits exactly one FFT
        let plan = BufferPlan::new(4096, 10, 1024, 3500).unwrap();
        assert_eq!(plan.allocation_size, 4096);
        assert_eq!(plan.repeats_per_average, 10);
    }

    #[test]
    fn test_buffer_unlimited() {
        let plan = BufferPlan::new(512, 10_000, 16384, -1).unwrap();
        assert_eq!(plan.repeats_per_average, 1);
        assert_eq!(plan.allocation_size % 16384, 0);
        assert!(plan.allocation_size >= 512 * 10_000);
    }

    #[test]
    fn test_buffer_invariants_hold() {
        for bins in [1usize, 7, 256, 4096] {
            for repeats in [1usize, 3, 100, 5000] {
                for cap in [-1i64, 0, 3000, 1 << 20] {
                    if cap > 0 && (cap as usize).div_ceil(1024) * 1024 < bins {
                        assert!(BufferPlan::new(bins, repeats, 1024, cap).is_err());
                        continue;
                    }
                    let plan = BufferPlan::new(bins, repeats, 1024, cap).unwrap();
                    assert_eq!(plan.allocation_size % 1024, 0);
                    assert!(plan.samples_per_hop() >= bins * repeats);
                    if cap == 0 {
                        assert!(plan.allocation_size <= 102_400);
                    } else if cap > 0 {
                        assert!(plan.allocation_size <= (cap as usize).div_ceil(1024) * 1024);
                    }
                }
            }
        }
    }
}
