//! The sweep loop: tune, acquire, hand off to the PSD workers, hand off to the writer
//!
//! The control thread never transforms or writes anything itself. It only tunes, reads
//! into the one reusable buffer and submits copies of it, so computing hop N overlaps
//! with acquiring hop N+1. Full queues stall it, which is the intended backpressure.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use chrono::Utc;
use tracing::{debug, info};

use crate::{
    device::Device,
    error::Result,
    monitoring::{QueueStats, SweepStats},
    plan::{BufferPlan, FreqPlan},
    psd::{Psd, PsdConfig},
    spectral::{Detrend, FftBackend},
    window::Window,
    writer::Writer,
    Sample,
};

#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub min_freq: f64,
    pub max_freq: f64,
    pub bins: usize,
    /// Spectra averaged per hop
    pub repeats: usize,
    /// Runs over the whole plan, 0 = until stopped or out of time
    pub runs: usize,
    /// Checked after every completed run
    pub time_limit: Option<Duration>,
    /// Fraction of each hop shared with its neighbour
    pub overlap: f64,
    /// Crop the overlapping bins instead of keeping them
    pub crop: bool,
    pub window: Window,
    pub fft_overlap: f64,
    pub log_scale: bool,
    pub remove_dc: bool,
    pub detrend: Detrend,
    pub tune_delay: Duration,
    /// Read unit hint for the device, 0 = device default
    pub base_buffer_size: usize,
    /// 0 = 100 read units, negative = unlimited
    pub max_buffer_size: i64,
    /// 0 = available parallelism
    pub max_threads: usize,
    /// 0 = ten per worker, negative = unbounded
    pub max_queue_size: i64,
    pub backend: FftBackend,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            min_freq: 1_420_405_752.0,
            max_freq: 1_420_405_752.0,
            bins: 512,
            repeats: 1600,
            runs: 1,
            time_limit: None,
            overlap: 0.0,
            crop: false,
            window: Window::Hann,
            fft_overlap: 0.5,
            log_scale: true,
            remove_dc: false,
            detrend: Detrend::None,
            tune_delay: Duration::ZERO,
            base_buffer_size: 0,
            max_buffer_size: 0,
            max_threads: 0,
            max_queue_size: 0,
            backend: FftBackend::Auto,
        }
    }
}

impl SweepConfig {
    fn psd_config(&self, sample_rate: f64) -> PsdConfig {
        PsdConfig {
            bins: self.bins,
            sample_rate,
            window: self.window,
            fft_overlap: self.fft_overlap,
            crop_factor: if self.crop { self.overlap } else { 0.0 },
            log_scale: self.log_scale,
            remove_dc: self.remove_dc,
            detrend: self.detrend,
            backend: self.backend,
            max_threads: self.max_threads,
            max_queue_size: self.max_queue_size,
        }
    }
}

pub struct Sweeper<D> {
    device: D,
    writer: Writer,
    stop: Arc<AtomicBool>,
}

impl<D: Device> Sweeper<D> {
    pub fn new(device: D, writer: Writer) -> Self {
        Self {
            device,
            writer,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Flag that ends the sweep after the current run once set. Cleared when a sweep starts.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Sweep `[min_freq, max_freq]` until the run count, time limit or stop flag ends it
    pub fn sweep(&mut self, config: &SweepConfig) -> Result<SweepStats> {
        self.stop.store(false, Ordering::SeqCst);
        let sample_rate = self.device.sample_rate();
        // Configuration errors surface before the device is touched
        let plan = FreqPlan::new(
            config.min_freq,
            config.max_freq,
            config.bins,
            config.overlap,
            sample_rate,
        )?;
        let psd = Psd::new(&config.psd_config(sample_rate))?;

        if self.device.is_streaming() {
            self.device.stop_stream()?;
        }
        let base_unit = self.device.start_stream(config.base_buffer_size)?;
        let result = self.run(config, &plan, &psd, base_unit);
        // The stream is closed on the error path too
        let stopped = self.device.stop_stream();
        let stats = result?;
        stopped?;
        stats.log();
        info!("Total time: {:.3} s", stats.elapsed.as_secs_f64());
        Ok(stats)
    }

    fn run(
        &mut self,
        config: &SweepConfig,
        plan: &FreqPlan,
        psd: &Psd,
        base_unit: usize,
    ) -> Result<SweepStats> {
        let buffers = BufferPlan::new(config.bins, config.repeats, base_unit, config.max_buffer_size)?;
        let mut buffer = vec![Sample::default(); buffers.allocation_size];
        // Records report the samples of one read, as rtl_power does
        let samples = buffers.allocation_size as u64;

        let t_start = Instant::now();
        let mut stats = SweepStats::default();
        let mut last_write = None;
        while config.runs == 0 || stats.runs < config.runs {
            stats.runs += 1;
            let t_run = Instant::now();
            debug!("Run: {}", stats.runs);

            for &freq in &plan.freqs {
                debug!("  Frequency hop: {:.2} Hz", freq);
                let t_tune = Instant::now();
                self.tune(freq, config.tune_delay)?;
                let mut state = psd.start_hop(freq);
                debug!("    Tune time: {:.3} s", t_tune.elapsed().as_secs_f64());

                // Timestamps of the last read of the hop
                let mut acq_start = Utc::now();
                let mut acq_stop = acq_start;
                for repeat in 0..buffers.repeats_per_average {
                    debug!("    Repeat: {}", repeat + 1);
                    let t_acq = Instant::now();
                    acq_start = Utc::now();
                    self.device.read_into(&mut buffer)?;
                    acq_stop = Utc::now();
                    debug!("      Acquisition time: {:.3} s", t_acq.elapsed().as_secs_f64());
                    // The buffer is refilled right away, the workers get a snapshot
                    psd.submit_segment(&mut state, buffer.clone());
                }
                let spectrum = psd.finalize(state);
                self.writer
                    .write_async(spectrum.into(), acq_start, acq_stop, samples);
                stats.hops += 1;
                debug!("    Total hop time: {:.3} s", t_tune.elapsed().as_secs_f64());
            }

            last_write = Some(self.writer.write_next_async());
            debug!("  Total run time: {:.3} s", t_run.elapsed().as_secs_f64());

            if let Some(limit) = config.time_limit {
                if t_start.elapsed() >= limit {
                    info!(
                        "Time limit of {:.3} s exceeded, completed {} runs",
                        limit.as_secs_f64(),
                        stats.runs
                    );
                    break;
                }
            }
            if self.stop.load(Ordering::SeqCst) {
                info!("Stop requested, completed {} runs", stats.runs);
                break;
            }
        }

        if let Some(handle) = last_write {
            handle.wait()?;
        }
        if let Some(e) = self.writer.take_failure() {
            return Err(e);
        }
        stats.buffer_overflows = self.device.buffer_overflow_count();
        stats.psd = QueueStats::of(psd.executor());
        stats.writer = QueueStats::of(self.writer.executor());
        stats.elapsed = t_start.elapsed();
        Ok(stats)
    }

    fn tune(&mut self, freq: f64, delay: Duration) -> Result<()> {
        if self.device.frequency() != freq {
            self.device.set_frequency(freq)?;
            if !delay.is_zero() {
                thread::sleep(delay);
            }
        } else {
            debug!("    Same frequency as before, tuning skipped");
        }
        Ok(())
    }
}
