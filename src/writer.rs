//! Ordered output of finished hops
//!
//! Records are handed over as not-yet-finished PSD tasks. A single writer thread resolves
//! them strictly in submission order, so hops finishing out of order never reorder the
//! output. Encoding and I/O failures drop the record and keep the sweep going.

use std::{
    io::{self, Read, Write},
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use tracing::error;

use crate::{
    error::{invalid, Error, Result},
    pool::{BoundedExecutor, TaskHandle},
    psd::Spectrum,
};

/// Magic tag opening every binary record
pub const BIN_MAGIC: &[u8; 5] = b"SDRFF";
pub const BIN_VERSION: u8 = 1;
/// magic(5) version(1) time_start(8) start(8) stop(8) step(8) samples(8) size(8) pad(2)
pub const BIN_HEADER_SIZE: usize = 56;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    /// Commented header plus `freq power` lines per hop
    RtlPowerFftw,
    /// One comma separated row per hop
    #[default]
    RtlPower,
    /// Self-describing binary records
    SoapyPowerBin,
}

impl Format {
    pub const NAMES: [&'static str; 3] = ["rtl_power", "rtl_power_fftw", "soapy_power_bin"];

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "rtl_power_fftw" => Ok(Self::RtlPowerFftw),
            "rtl_power" => Ok(Self::RtlPower),
            "soapy_power_bin" => Ok(Self::SoapyPowerBin),
            other => invalid(format!("unknown output format: {other}")),
        }
    }

    /// Encode one hop
    pub fn write_record(&self, out: &mut dyn Write, record: &Record) -> io::Result<()> {
        match self {
            Self::RtlPowerFftw => write_rtl_power_fftw(out, record),
            Self::RtlPower => write_rtl_power(out, record),
            Self::SoapyPowerBin => BinRecord::from_record(record)?.encode(out),
        }
    }

    /// Encode the end-of-run marker
    pub fn write_next(&self, out: &mut dyn Write) -> io::Result<()> {
        match self {
            Self::RtlPowerFftw => writeln!(out),
            Self::RtlPower | Self::SoapyPowerBin => Ok(()),
        }
    }
}

/// PSD output that is either still being computed or already available
pub enum PsdResult {
    Pending(TaskHandle<Result<Spectrum>>),
    Ready(Spectrum),
}

impl PsdResult {
    /// Block until the spectrum is available
    pub fn resolve(self) -> Result<Spectrum> {
        match self {
            Self::Pending(handle) => handle.wait()?,
            Self::Ready(spectrum) => Ok(spectrum),
        }
    }
}

impl From<Spectrum> for PsdResult {
    fn from(spectrum: Spectrum) -> Self {
        Self::Ready(spectrum)
    }
}

impl From<TaskHandle<Result<Spectrum>>> for PsdResult {
    fn from(handle: TaskHandle<Result<Spectrum>>) -> Self {
        Self::Pending(handle)
    }
}

/// One finished hop, ready to be encoded
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub spectrum: Spectrum,
    pub time_start: DateTime<Utc>,
    pub time_stop: DateTime<Utc>,
    pub samples: u64,
}

impl Record {
    fn step(&self) -> f64 {
        match self.spectrum.freqs.as_slice() {
            [a, b, ..] => b - a,
            _ => 0.0,
        }
    }

    /// First frequency, one-past-last frequency and bin step
    fn span(&self) -> io::Result<(f64, f64, f64)> {
        let step = self.step();
        match (self.spectrum.freqs.first(), self.spectrum.freqs.last()) {
            (Some(first), Some(last)) => Ok((*first, last + step, step)),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "cannot encode an empty spectrum",
            )),
        }
    }
}

fn write_rtl_power_fftw(out: &mut dyn Write, record: &Record) -> io::Result<()> {
    writeln!(out, "# soapy_power output")?;
    writeln!(
        out,
        "# Acquisition start: {}",
        record.time_start.format("%Y-%m-%d %H:%M:%S%.6f")
    )?;
    writeln!(
        out,
        "# Acquisition end: {}",
        record.time_stop.format("%Y-%m-%d %H:%M:%S%.6f")
    )?;
    writeln!(out, "#")?;
    writeln!(out, "# frequency [Hz] power spectral density [dB/Hz]")?;
    for (f, p) in record.spectrum.freqs.iter().zip(&record.spectrum.power) {
        writeln!(out, "{} {}", py_float(*f), py_float(*p))?;
    }
    writeln!(out)
}

fn write_rtl_power(out: &mut dyn Write, record: &Record) -> io::Result<()> {
    let (start, stop, step) = record.span()?;
    let mut row = format!(
        "{}, {}, {}, {}, {}, {}",
        record.time_stop.format("%Y-%m-%d"),
        record.time_stop.format("%H:%M:%S"),
        py_float(start),
        py_float(stop),
        py_float(step),
        record.samples
    );
    for p in &record.spectrum.power {
        row.push_str(", ");
        row.push_str(&py_float(*p));
    }
    writeln!(out, "{}", row)
}

/// Shortest round-trip text of `v` laid out like Python's `repr`: plain notation for
/// decimal exponents in `-4..16`, otherwise `1.5e-09` / `1e+16`
fn py_float(v: f64) -> String {
    if v.is_nan() {
        return "nan".to_owned();
    }
    if v.is_infinite() {
        return if v > 0.0 { "inf" } else { "-inf" }.to_owned();
    }
    let sci = format!("{:e}", v);
    let Some((mantissa, exp)) = sci.split_once('e') else {
        return sci;
    };
    let Ok(exp) = exp.parse::<i32>() else {
        return sci;
    };
    let (sign, mantissa) = match mantissa.strip_prefix('-') {
        Some(m) => ("-", m),
        None => ("", mantissa),
    };
    let digits: String = mantissa.chars().filter(|c| *c != '.').collect();
    let body = if (-4..16).contains(&exp) {
        if exp < 0 {
            format!("0.{}{}", "0".repeat((-exp - 1) as usize), digits)
        } else {
            let point = exp as usize + 1;
            if digits.len() <= point {
                format!("{}{}.0", digits, "0".repeat(point - digits.len()))
            } else {
                format!("{}.{}", &digits[..point], &digits[point..])
            }
        }
    } else {
        let exp_sign = if exp < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", mantissa, exp_sign, exp.abs())
    };
    format!("{sign}{body}")
}

/// Decoded (or about to be encoded) binary record
#[derive(Debug, Clone, PartialEq)]
pub struct BinRecord {
    /// Acquisition start, seconds since the Unix epoch
    pub time_start: f64,
    pub start: f64,
    /// Exclusive upper frequency
    pub stop: f64,
    pub step: f64,
    pub samples: u64,
    pub power: Vec<f32>,
}

impl BinRecord {
    pub fn from_record(record: &Record) -> io::Result<Self> {
        let (start, stop, step) = record.span()?;
        let time_start = record.time_start.timestamp() as f64
            + record.time_start.timestamp_subsec_nanos() as f64 / 1e9;
        Ok(Self {
            time_start,
            start,
            stop,
            step,
            samples: record.samples,
            power: record.spectrum.power.iter().map(|p| *p as f32).collect(),
        })
    }

    pub fn encode(&self, out: &mut dyn Write) -> io::Result<()> {
        let size = (self.power.len() * 4) as u64;
        let mut buf = Vec::with_capacity(BIN_HEADER_SIZE + size as usize);
        buf.extend_from_slice(BIN_MAGIC);
        buf.push(BIN_VERSION);
        buf.extend_from_slice(&self.time_start.to_le_bytes());
        buf.extend_from_slice(&self.start.to_le_bytes());
        buf.extend_from_slice(&self.stop.to_le_bytes());
        buf.extend_from_slice(&self.step.to_le_bytes());
        buf.extend_from_slice(&self.samples.to_le_bytes());
        buf.extend_from_slice(&size.to_le_bytes());
        buf.extend_from_slice(&[0u8; 2]);
        for p in &self.power {
            buf.extend_from_slice(&p.to_le_bytes());
        }
        out.write_all(&buf)
    }

    /// Read the next record, `None` on a clean end of stream
    pub fn decode<R: Read>(input: &mut R) -> Result<Option<Self>> {
        let mut header = [0u8; BIN_HEADER_SIZE];
        let n = read_full(input, &mut header)?;
        if n == 0 {
            return Ok(None);
        }
        if n < BIN_HEADER_SIZE {
            return Err(Error::Decode(format!("truncated header ({n} bytes)")));
        }
        if &header[..5] != BIN_MAGIC {
            return Err(Error::Decode("magic tag mismatch".to_owned()));
        }
        if header[5] != BIN_VERSION {
            return Err(Error::Decode(format!(
                "unsupported format version {}",
                header[5]
            )));
        }
        let f64_at = |at: usize| f64::from_le_bytes(field(&header, at));
        let u64_at = |at: usize| u64::from_le_bytes(field(&header, at));
        let size = u64_at(46) as usize;
        if size % 4 != 0 {
            return Err(Error::Decode(format!("payload size {size} is not a whole number of f32")));
        }
        let mut payload = vec![0u8; size];
        if read_full(input, &mut payload)? < size {
            return Err(Error::Decode("truncated payload".to_owned()));
        }
        let power = payload
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Some(Self {
            time_start: f64_at(6),
            start: f64_at(14),
            stop: f64_at(22),
            step: f64_at(30),
            samples: u64_at(38),
            power,
        }))
    }
}

fn field(header: &[u8; BIN_HEADER_SIZE], at: usize) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&header[at..at + 8]);
    out
}

/// Like `read_exact`, but reports how much was read before EOF
fn read_full<R: Read>(input: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// Linear replay of a binary record stream. Iteration ends after the first error.
pub struct BinReader<R> {
    input: R,
    done: bool,
}

impl<R: Read> BinReader<R> {
    pub fn new(input: R) -> Self {
        Self { input, done: false }
    }
}

impl<R: Read> Iterator for BinReader<R> {
    type Item = Result<BinRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let next = BinRecord::decode(&mut self.input).transpose();
        self.done = !matches!(next, Some(Ok(_)));
        next
    }
}

type Sink = Arc<Mutex<Box<dyn Write + Send>>>;

/// Single-threaded, order preserving record writer
pub struct Writer {
    format: Format,
    sink: Sink,
    failure: Arc<Mutex<Option<Error>>>,
    executor: BoundedExecutor,
}

impl Writer {
    pub fn new(sink: Box<dyn Write + Send>, format: Format, max_queue_size: i64) -> Result<Self> {
        Ok(Self {
            format,
            sink: Arc::new(Mutex::new(sink)),
            failure: Arc::new(Mutex::new(None)),
            executor: BoundedExecutor::new("writer", 1, max_queue_size)?,
        })
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn executor(&self) -> &BoundedExecutor {
        &self.executor
    }

    /// Queue one hop. The PSD is resolved on the writer thread, in submission order.
    pub fn write_async(
        &self,
        psd: PsdResult,
        time_start: DateTime<Utc>,
        time_stop: DateTime<Utc>,
        samples: u64,
    ) -> TaskHandle<()> {
        let format = self.format;
        let sink = self.sink.clone();
        let failure = self.failure.clone();
        self.executor.submit(move || {
            let spectrum = match psd.resolve() {
                Ok(spectrum) => spectrum,
                Err(e) => {
                    error!("PSD computation failed, hop dropped: {}", e);
                    if let Ok(mut slot) = failure.lock() {
                        slot.get_or_insert(e);
                    }
                    return;
                }
            };
            let record = Record {
                spectrum,
                time_start,
                time_stop,
                samples,
            };
            if let Err(e) = emit(&sink, |out| format.write_record(out, &record)) {
                error!("failed to write record: {}", e);
            }
        })
    }

    /// Queue the end-of-run marker
    pub fn write_next_async(&self) -> TaskHandle<()> {
        let format = self.format;
        let sink = self.sink.clone();
        self.executor.submit(move || {
            if let Err(e) = emit(&sink, |out| format.write_next(out)) {
                error!("failed to write end-of-run marker: {}", e);
            }
        })
    }

    /// First PSD failure seen by the writer thread, if any
    pub fn take_failure(&self) -> Option<Error> {
        self.failure.lock().ok().and_then(|mut slot| slot.take())
    }
}

fn emit<F>(sink: &Sink, encode: F) -> io::Result<()>
where
    F: FnOnce(&mut dyn Write) -> io::Result<()>,
{
    let mut out = sink
        .lock()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "output lock poisoned"))?;
    encode(&mut **out)?;
    out.flush()
}
