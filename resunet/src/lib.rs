pub mod blocks;
pub mod encoder;
pub mod stft;
pub mod weights;

use candle_core::Device;
use eyre::Result;

pub use encoder::{ResUNet30Encoder, ResUNetConfig};
pub use stft::{Spectrogram, Stft};
pub use weights::{load_checkpoint, DEFAULT_PREFIX};

/// CPU unless built with the `cuda` feature.
pub fn get_default_device() -> Result<Device> {
    if cfg!(feature = "cuda") {
        Ok(Device::new_cuda(0)?)
    } else {
        Ok(Device::Cpu)
    }
}
