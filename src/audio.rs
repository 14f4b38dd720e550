use eyre::{bail, Result, WrapErr};
use std::path::Path;

/// Decoded audio, one sample vector per channel, normalized to [-1, 1].
#[derive(Debug, Clone)]
pub struct Waveform {
    pub channels: Vec<Vec<f32>>,
    pub sample_rate: u32,
}

impl Waveform {
    pub fn num_samples(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn duration_secs(&self) -> f32 {
        self.num_samples() as f32 / self.sample_rate as f32
    }

    /// Samples of a single-channel recording.
    pub fn mono(&self) -> Result<&[f32]> {
        match self.channels.as_slice() {
            [samples] => Ok(samples.as_slice()),
            other => bail!("expected a mono recording, got {} channels", other.len()),
        }
    }
}

/// Decode a WAV or FLAC file at its native sample rate.
pub fn read_audio_file(path: &Path) -> Result<Waveform> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    let decode: fn(&Path) -> Result<Waveform> = match ext.as_str() {
        "wav" => read_wav,
        "flac" => read_flac,
        other => bail!("unsupported audio extension '.{}'", other),
    };
    let waveform = decode(path).wrap_err_with(|| format!("failed to decode {}", path.display()))?;
    tracing::debug!(
        "decoded {} ({} ch, {} Hz, {:.2}s)",
        path.display(),
        waveform.channels.len(),
        waveform.sample_rate,
        waveform.duration_secs()
    );
    Ok(waveform)
}

fn read_wav(path: &Path) -> Result<Waveform> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let scale = int_scale(spec.bits_per_sample as u32);
            reader
                .samples::<i32>()
                .map(|s| s.map(|s| s as f32 / scale))
                .collect::<Result<_, _>>()?
        }
    };
    Ok(Waveform {
        channels: deinterleave(&interleaved, spec.channels as usize),
        sample_rate: spec.sample_rate,
    })
}

fn read_flac(path: &Path) -> Result<Waveform> {
    let mut reader = claxon::FlacReader::open(path)?;
    let info = reader.streaminfo();
    let scale = int_scale(info.bits_per_sample);
    let interleaved: Vec<f32> = reader
        .samples()
        .map(|s| s.map(|s| s as f32 / scale))
        .collect::<Result<_, _>>()?;
    Ok(Waveform {
        channels: deinterleave(&interleaved, info.channels as usize),
        sample_rate: info.sample_rate,
    })
}

/// Full-scale value of a signed integer sample, e.g. 32768 for 16 bits.
fn int_scale(bits_per_sample: u32) -> f32 {
    (1u64 << (bits_per_sample - 1)) as f32
}

fn deinterleave(interleaved: &[f32], channels: usize) -> Vec<Vec<f32>> {
    let channels = channels.max(1);
    let mut out = vec![Vec::with_capacity(interleaved.len() / channels); channels];
    for frame in interleaved.chunks_exact(channels) {
        for (dst, &s) in out.iter_mut().zip(frame) {
            dst.push(s);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_wav(path: &Path, channels: u16, samples: &[i16]) {
        let spec = hound::WavSpec {
            channels,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_read_wav_normalizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.wav");
        write_wav(&path, 1, &[0, 16384, -32768, 32767]);

        let wav = read_audio_file(&path).unwrap();
        assert_eq!(wav.sample_rate, 16000);
        assert_eq!(
            wav.mono().unwrap().to_vec(),
            vec![0.0f32, 0.5, -1.0, 32767.0 / 32768.0]
        );
        assert_eq!(wav.duration_secs(), 4.0 / 16000.0);
    }

    #[test]
    fn test_stereo_is_split_and_not_mono() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.WAV");
        write_wav(&path, 2, &[1, -1, 2, -2, 3, -3]);

        let wav = read_audio_file(&path).unwrap();
        assert_eq!(wav.channels.len(), 2);
        assert_eq!(wav.num_samples(), 3);
        assert!(wav.channels[1].iter().all(|&s| s < 0.0));
        assert!(wav.mono().is_err());
    }

    fn testdata(name: &str) -> std::path::PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("testdata").join(name)
    }

    #[test]
    fn test_read_flac_16bit_stereo() {
        let flac = read_audio_file(&testdata("stereo_16bit.flac")).unwrap();
        assert_eq!(flac.sample_rate, 16000);
        assert_eq!(flac.channels.len(), 2);
        assert_eq!(flac.num_samples(), 16);

        let (left, right) = (&flac.channels[0], &flac.channels[1]);
        assert_eq!(left[..3].to_vec(), vec![-1.0f32, 1000.0 / 32768.0, 2000.0 / 32768.0]);
        assert_eq!(left[15], 32767.0 / 32768.0);
        assert_eq!(right[0], 32767.0 / 32768.0);
        assert_eq!(right[1], -1000.0 / 32768.0);
        assert!(flac.mono().is_err());
    }

    #[test]
    fn test_read_flac_24bit_uses_stream_bit_depth() {
        let flac = read_audio_file(&testdata("mono_24bit.flac")).unwrap();
        assert_eq!(flac.sample_rate, 16000);
        let samples = flac.mono().unwrap();
        assert_eq!(samples.len(), 16);
        assert_eq!(
            samples[..4].to_vec(),
            vec![-1.0f32, 0.5, 0.0, 8388607.0 / 8388608.0]
        );
        assert!(samples.iter().all(|s| (-1.0..1.0).contains(s)));
    }

    #[test]
    fn test_corrupt_flac_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.flac");
        std::fs::write(&path, b"fLaC not really").unwrap();
        let err = read_audio_file(&path).unwrap_err();
        assert!(err.to_string().contains("failed to decode"), "{err}");
    }

    #[test]
    fn test_unsupported_extension() {
        let err = read_audio_file(Path::new("clip.mp3")).unwrap_err();
        assert!(err.to_string().contains("unsupported"));
    }

    #[test]
    fn test_int_scale() {
        assert_eq!(int_scale(8), 128.0);
        assert_eq!(int_scale(16), 32768.0);
        assert_eq!(int_scale(24), 8388608.0);
    }
}
