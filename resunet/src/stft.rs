use candle_core::{Device, Tensor};
use eyre::{bail, Result};
use realfft::{RealFftPlanner, RealToComplex};
use std::f32::consts::PI;
use std::sync::Arc;

/// Floor applied to the squared magnitude before the square root.
pub const MAGNITUDE_EPS: f32 = 1e-10;

/// Centered short-time Fourier transform with a periodic Hann window.
pub struct Stft {
    n_fft: usize,
    hop: usize,
    window: Vec<f32>,
    fft: Arc<dyn RealToComplex<f32>>,
}

/// Magnitude and phase of one channel, each stored frame-major
/// (`frames x bins`).
#[derive(Debug, Clone)]
pub struct Spectrogram {
    pub frames: usize,
    pub bins: usize,
    pub mag: Vec<f32>,
    pub cos: Vec<f32>,
    pub sin: Vec<f32>,
}

impl Stft {
    pub fn new(n_fft: usize, hop: usize) -> Self {
        let window = hann_window(n_fft);
        let fft = RealFftPlanner::<f32>::new().plan_fft_forward(n_fft);
        Self {
            n_fft,
            hop,
            window,
            fft,
        }
    }

    pub fn bins(&self) -> usize {
        self.n_fft / 2 + 1
    }

    /// Number of frames produced for `len` input samples.
    pub fn num_frames(&self, len: usize) -> usize {
        1 + len / self.hop
    }

    pub fn spectrogram_phase(&self, samples: &[f32]) -> Result<Spectrogram> {
        let padded = reflect_pad(samples, self.n_fft / 2)?;
        let frames = self.num_frames(samples.len());
        let bins = self.bins();

        let mut input = self.fft.make_input_vec();
        let mut output = self.fft.make_output_vec();
        let mut mag = Vec::with_capacity(frames * bins);
        let mut cos = Vec::with_capacity(frames * bins);
        let mut sin = Vec::with_capacity(frames * bins);

        for frame in 0..frames {
            let start = frame * self.hop;
            let chunk = &padded[start..start + self.n_fft];
            for ((dst, &x), &w) in input.iter_mut().zip(chunk).zip(&self.window) {
                *dst = x * w;
            }
            self.fft.process(&mut input, &mut output)?;
            for c in &output {
                let m = (c.re * c.re + c.im * c.im).max(MAGNITUDE_EPS).sqrt();
                mag.push(m);
                cos.push(c.re / m);
                sin.push(c.im / m);
            }
        }

        Ok(Spectrogram {
            frames,
            bins,
            mag,
            cos,
            sin,
        })
    }
}

impl Spectrogram {
    /// Magnitude as a `[1, 1, frames, bins]` tensor.
    pub fn magnitude_tensor(&self, device: &Device) -> Result<Tensor> {
        let t = Tensor::from_slice(&self.mag, (1, 1, self.frames, self.bins), device)?;
        Ok(t)
    }
}

fn hann_window(n: usize) -> Vec<f32> {
    (0..n)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / n as f32).cos())
        .collect()
}

/// Mirror `pad` samples on each side without repeating the edge sample.
fn reflect_pad(samples: &[f32], pad: usize) -> Result<Vec<f32>> {
    let len = samples.len();
    if len <= pad {
        bail!(
            "signal of {} samples is too short to reflect-pad by {}",
            len,
            pad
        );
    }
    let mut out = Vec::with_capacity(len + 2 * pad);
    out.extend((1..=pad).rev().map(|i| samples[i]));
    out.extend_from_slice(samples);
    out.extend((1..=pad).map(|i| samples[len - 1 - i]));
    Ok(out)
}
