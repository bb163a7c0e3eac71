use rustfft::num_complex::Complex;

pub mod device;
pub mod error;
pub mod monitoring;
pub mod plan;
pub mod pool;
pub mod psd;
pub mod spectral;
pub mod sweep;
pub mod window;
pub mod writer;

pub use error::{Error, Result};

/// One complex baseband sample as delivered by the receiver
pub type Sample = Complex<f32>;
