//! Argument parsing for running from the command line

use std::{path::PathBuf, time::Duration};

use clap::Parser;
use hop_power::{
    error::{Error, Result},
    plan::{bin_size_to_bins, nearest_bins, nearest_overlap, time_to_repeats, BinsRule, FreqPlan},
    spectral::{Detrend, FftBackend},
    sweep::SweepConfig,
    window::Window,
    writer::Format,
};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Center frequency or frequency range to sweep (Hz|Hz:Hz, k/M/G/T multipliers allowed)
    #[clap(short, long, default_value = "1420405752", value_parser = parse_freq_range)]
    pub freq: (f64, f64),
    /// Recording of interleaved complex f32 samples to replay
    #[clap(short, long)]
    pub input: PathBuf,
    /// Sample rate of the recording
    #[clap(short, long, default_value = "2M", value_parser = parse_float_with_multiplier)]
    pub rate: f64,
    /// Output file (default: stdout)
    #[clap(short = 'O', long)]
    pub output: Option<PathBuf>,
    /// Output format
    #[clap(short = 'F', long, default_value = "rtl_power", value_parser = parse_format)]
    pub format: Format,
    /// Number of FFT bins [default: 512]
    #[clap(short, long, conflicts_with = "bin-size")]
    pub bins: Option<usize>,
    /// Bin size in Hz, sets the number of FFT bins
    #[clap(short = 'B', long, value_parser = parse_float_with_multiplier)]
    pub bin_size: Option<f64>,
    /// Number of spectra to average [default: 1600]
    #[clap(short = 'n', long, conflicts_with_all = &["time", "total-time"])]
    pub repeats: Option<usize>,
    /// Integration time per hop in seconds, sets the number of averaged spectra
    #[clap(short, long, conflicts_with = "total-time")]
    pub time: Option<f64>,
    /// Integration time of the whole sweep in seconds, split evenly between the hops
    #[clap(short = 'T', long)]
    pub total_time: Option<f64>,
    /// Repeat the sweep until interrupted
    #[clap(short = 'c', long = "continue", conflicts_with = "elapsed")]
    pub endless: bool,
    /// Number of sweeps
    #[clap(short = 'u', long, default_value_t = 1)]
    pub runs: usize,
    /// Repeat the sweep until this many seconds have passed
    #[clap(short, long)]
    pub elapsed: Option<f64>,
    /// Seconds to wait after retuning
    #[clap(long, default_value_t = 0.0)]
    pub tune_delay: f64,
    /// Percent of overlap between neighbouring hops
    #[clap(short, long, default_value_t = 0.0)]
    pub overlap: f64,
    /// Percent of each hop to overlap and then crop away, takes precedence over --overlap
    #[clap(short = 'k', long, default_value_t = 0.0)]
    pub crop: f64,
    /// Base read size in samples (0 = device default)
    #[clap(short = 's', long, default_value_t = 0)]
    pub buffer_size: usize,
    /// Largest buffer in samples (0 = 100 reads, negative = unlimited)
    #[clap(short = 'S', long, default_value_t = 0, allow_hyphen_values = true)]
    pub max_buffer_size: i64,
    /// Round the number of FFT bins up to an even number
    #[clap(long, conflicts_with = "pow2")]
    pub even: bool,
    /// Round the number of FFT bins up to a power of two
    #[clap(long)]
    pub pow2: bool,
    /// Use the portable FFT instead of the SIMD accelerated one
    #[clap(long)]
    pub scalar_fft: bool,
    /// PSD worker threads (0 = number of cores)
    #[clap(long, default_value_t = 0)]
    pub max_threads: usize,
    /// PSD and writer queue limit (0 = ten per worker, negative = unbounded)
    #[clap(long, default_value_t = 0, allow_hyphen_values = true)]
    pub max_queue_size: i64,
    /// Linear power values instead of dB
    #[clap(short, long)]
    pub linear: bool,
    /// Interpolate the DC bin from its neighbours
    #[clap(short = 'R', long)]
    pub remove_dc: bool,
    /// Detrend each Welch segment
    #[clap(short = 'D', long, default_value = "no", value_parser = parse_detrend)]
    pub detrend: Detrend,
    /// Welch's method window function
    #[clap(long, default_value = "hann", value_parser = clap::builder::PossibleValuesParser::new(Window::NAMES))]
    pub fft_window: String,
    /// Shape parameter of the window (kaiser beta, tukey alpha)
    #[clap(long)]
    pub fft_window_param: Option<f64>,
    /// Welch's method overlap between segments, in percent
    #[clap(long, default_value_t = 50.0)]
    pub fft_overlap: f64,
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,
}

impl Args {
    /// Resolve the derived settings (bins, overlap, repeats, run limits) for a device
    /// running at `sample_rate`
    pub fn sweep_config(&self, sample_rate: f64) -> Result<SweepConfig> {
        let (min_freq, max_freq) = self.freq;

        let bins = match self.bin_size {
            Some(bin_size) if bin_size > 0.0 => bin_size_to_bins(bin_size, sample_rate),
            Some(bin_size) => {
                return Err(Error::InvalidParameter(format!(
                    "bin size must be positive, got {bin_size}"
                )))
            }
            None => self.bins.unwrap_or(512),
        };
        let rule = if self.pow2 {
            BinsRule::Pow2
        } else if self.even {
            BinsRule::Even
        } else {
            BinsRule::Any
        };
        let bins = nearest_bins(bins, rule);

        let (overlap, crop) = if self.crop > 0.0 {
            (self.crop, true)
        } else {
            (self.overlap, false)
        };
        let overlap = if overlap != 0.0 {
            nearest_overlap(overlap / 100.0, bins)
        } else {
            0.0
        };

        let time = match self.total_time {
            Some(total) => {
                let hops = FreqPlan::new(min_freq, max_freq, bins, overlap, sample_rate)?.hops();
                Some(total / hops as f64)
            }
            None => self.time,
        };
        let repeats = match time {
            Some(t) if t > 0.0 => time_to_repeats(bins, t, sample_rate),
            Some(t) => {
                return Err(Error::InvalidParameter(format!(
                    "integration time must be positive, got {t}"
                )))
            }
            None => self.repeats.unwrap_or(1600),
        };

        let time_limit = self.elapsed.map(seconds).transpose()?;
        let runs = if self.endless || time_limit.is_some() {
            0
        } else {
            self.runs
        };

        Ok(SweepConfig {
            min_freq,
            max_freq,
            bins,
            repeats,
            runs,
            time_limit,
            overlap,
            crop,
            window: Window::from_name(&self.fft_window, self.fft_window_param)?,
            fft_overlap: self.fft_overlap / 100.0,
            log_scale: !self.linear,
            remove_dc: self.remove_dc,
            detrend: self.detrend,
            tune_delay: seconds(self.tune_delay)?,
            base_buffer_size: self.buffer_size,
            max_buffer_size: self.max_buffer_size,
            max_threads: self.max_threads,
            max_queue_size: self.max_queue_size,
            backend: if self.scalar_fft {
                FftBackend::Scalar
            } else {
                FftBackend::Auto
            },
        })
    }
}

fn seconds(secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|e| Error::InvalidParameter(format!("invalid duration {secs}: {e}")))
}

/// Match verbosity filter with tracing subscriber log levels
pub fn convert_filter(filter: log::LevelFilter) -> tracing_subscriber::filter::LevelFilter {
    match filter {
        log::LevelFilter::Off => tracing_subscriber::filter::LevelFilter::OFF,
        log::LevelFilter::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        log::LevelFilter::Warn => tracing_subscriber::filter::LevelFilter::WARN,
        log::LevelFilter::Info => tracing_subscriber::filter::LevelFilter::INFO,
        log::LevelFilter::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
        log::LevelFilter::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
    }
}

/// Number with an optional k, M, G or T suffix
fn parse_float_with_multiplier(s: &str) -> std::result::Result<f64, String> {
    let s = s.trim();
    let (num, multiplier) = match s.chars().last() {
        Some('k') => (&s[..s.len() - 1], 1e3),
        Some('M') => (&s[..s.len() - 1], 1e6),
        Some('G') => (&s[..s.len() - 1], 1e9),
        Some('T') => (&s[..s.len() - 1], 1e12),
        _ => (s, 1.0),
    };
    num.parse::<f64>()
        .map(|n| n * multiplier)
        .map_err(|_| format!("\"{s}\" is not numeric"))
}

/// `freq` or `min:max`
fn parse_freq_range(s: &str) -> std::result::Result<(f64, f64), String> {
    match s.split_once(':') {
        Some((min, max)) => Ok((
            parse_float_with_multiplier(min)?,
            parse_float_with_multiplier(max)?,
        )),
        None => {
            let freq = parse_float_with_multiplier(s)?;
            Ok((freq, freq))
        }
    }
}

fn parse_format(s: &str) -> std::result::Result<Format, String> {
    Format::from_name(s).map_err(|e| e.to_string())
}

fn parse_detrend(s: &str) -> std::result::Result<Detrend, String> {
    Detrend::from_name(s).map_err(|e| e.to_string())
}
