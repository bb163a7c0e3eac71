//! Receiver abstraction consumed by the sweep, plus a file-replay implementation
//!
//! Real hardware backends implement [`Device`]; the sweep only ever tunes, reads and
//! starts/stops the stream.

use std::{
    fs::File,
    io::{ErrorKind, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};

use byte_slice_cast::AsMutByteSlice;
use tracing::{debug, info};

use crate::{
    error::{Error, Result},
    Sample,
};

/// Read unit used when the caller leaves the choice to the device
pub const DEFAULT_BUFFER_SIZE: usize = 16384;

pub trait Device {
    /// Samples per second
    fn sample_rate(&self) -> f64;
    fn hardware(&self) -> &str;
    /// Start streaming. `buffer_size` is a hint (0 = device default); returns the
    /// native read unit actually used.
    fn start_stream(&mut self, buffer_size: usize) -> Result<usize>;
    fn stop_stream(&mut self) -> Result<()>;
    fn is_streaming(&self) -> bool;
    fn set_frequency(&mut self, freq: f64) -> Result<()>;
    fn frequency(&self) -> f64;
    /// Fill the whole buffer with samples, blocking until done
    fn read_into(&mut self, buffer: &mut [Sample]) -> Result<()>;
    /// Overflows reported by the device since the stream started
    fn buffer_overflow_count(&self) -> u64;
}

/// Replays a recording of interleaved native-endian `f32` I/Q pairs, looping at EOF.
/// Tuning only moves the reported frequency.
pub struct FileDevice {
    path: PathBuf,
    hardware: String,
    sample_rate: f64,
    frequency: f64,
    file: Option<File>,
    /// Interleaved I/Q staging area the file is read into
    raw: Vec<f32>,
}

impl FileDevice {
    pub fn open<P: AsRef<Path>>(path: P, sample_rate: f64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !(sample_rate > 0.0) {
            return Err(Error::InvalidParameter(format!(
                "sample rate must be positive, got {sample_rate}"
            )));
        }
        let len = std::fs::metadata(&path)
            .map_err(|e| Error::Device(format!("cannot open {}: {e}", path.display())))?
            .len();
        if len < std::mem::size_of::<Sample>() as u64 {
            return Err(Error::Device(format!(
                "{} holds no complete sample",
                path.display()
            )));
        }
        info!("replaying {} ({} samples)", path.display(), len / 8);
        Ok(Self {
            hardware: format!("file:{}", path.display()),
            path,
            sample_rate,
            frequency: 0.0,
            file: None,
            raw: Vec::new(),
        })
    }
}

impl Device for FileDevice {
    fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    fn hardware(&self) -> &str {
        &self.hardware
    }

    fn start_stream(&mut self, buffer_size: usize) -> Result<usize> {
        let file = File::open(&self.path)
            .map_err(|e| Error::Device(format!("cannot open {}: {e}", self.path.display())))?;
        self.file = Some(file);
        let unit = if buffer_size == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            buffer_size
        };
        debug!("stream started, read unit {} samples", unit);
        Ok(unit)
    }

    fn stop_stream(&mut self) -> Result<()> {
        self.file = None;
        Ok(())
    }

    fn is_streaming(&self) -> bool {
        self.file.is_some()
    }

    fn set_frequency(&mut self, freq: f64) -> Result<()> {
        self.frequency = freq;
        Ok(())
    }

    fn frequency(&self) -> f64 {
        self.frequency
    }

    fn read_into(&mut self, buffer: &mut [Sample]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::Device("read before the stream was started".to_owned()))?;
        self.raw.resize(buffer.len() * 2, 0.0);
        let bytes = self.raw.as_mut_byte_slice();
        let mut filled = 0;
        let mut rewound = false;
        while filled < bytes.len() {
            match file.read(&mut bytes[filled..]) {
                Ok(0) => {
                    if rewound {
                        return Err(Error::Device("recording is empty".to_owned()));
                    }
                    // A partial trailing sample is dropped
                    filled -= filled % std::mem::size_of::<Sample>();
                    file.seek(SeekFrom::Start(0))
                        .map_err(|e| Error::Device(format!("rewind failed: {e}")))?;
                    rewound = true;
                }
                Ok(n) => {
                    filled += n;
                    rewound = false;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::Device(format!("read failed: {e}"))),
            }
        }
        for (sample, iq) in buffer.iter_mut().zip(self.raw.chunks_exact(2)) {
            *sample = Sample::new(iq[0], iq[1]);
        }
        Ok(())
    }

    fn buffer_overflow_count(&self) -> u64 {
        0
    }
}
