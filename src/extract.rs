use audiosep_resunet::{
    get_default_device, load_checkpoint, ResUNet30Encoder, ResUNetConfig, Stft, DEFAULT_PREFIX,
};
use candle_core::Device;
use eyre::{bail, Result, WrapErr};
use std::path::PathBuf;

use crate::audio::Waveform;
use crate::dataset::{Dataset, Manifest};
use crate::parts::{FeatureBatch, PartStore};

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub manifest: PathBuf,
    pub audio_dir: PathBuf,
    /// Parts are written next to this path, named after its file name.
    pub output: PathBuf,
    pub checkpoint: Option<PathBuf>,
    /// Utterances per part file.
    pub save_interval: usize,
    pub pool_between_blocks: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            manifest: PathBuf::from("LibriSpeech/metadata/test-clean.csv"),
            audio_dir: PathBuf::from("LibriSpeech"),
            output: PathBuf::from("speaker_recognition/librispeech_testclean_features"),
            checkpoint: None,
            save_interval: 1,
            pool_between_blocks: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub resumed_from: usize,
    pub written: usize,
    pub skipped: usize,
    pub total: usize,
}

impl ExtractOptions {
    pub fn store(&self) -> Result<PartStore> {
        PartStore::new(&self.output)
    }

    pub fn dataset(&self) -> Result<Dataset> {
        let manifest = Manifest::from_csv(&self.manifest)?;
        tracing::info!(
            "{} utterances listed in {}",
            manifest.rows.len(),
            self.manifest.display()
        );
        Ok(Dataset::new(manifest, &self.audio_dir))
    }

    /// Load the pretrained encoder and extract every missing part.
    pub fn run(&self) -> Result<RunSummary> {
        let Some(checkpoint) = &self.checkpoint else {
            bail!("no checkpoint given");
        };
        let device = get_default_device()?;
        tracing::info!("device: {:?}", device);

        let config = ResUNetConfig {
            pool_between_blocks: self.pool_between_blocks,
            ..Default::default()
        };
        let vb = load_checkpoint(checkpoint, DEFAULT_PREFIX, &device)?;
        let encoder = ResUNet30Encoder::load(config, vb)
            .wrap_err_with(|| format!("{} is not a ResUNet30 checkpoint", checkpoint.display()))?;
        let extractor = FeatureExtractor::new(encoder, device);

        extractor.run(&self.dataset()?, &self.store()?, self.save_interval)
    }
}

pub struct FeatureExtractor {
    encoder: ResUNet30Encoder,
    stft: Stft,
    device: Device,
}

impl FeatureExtractor {
    pub fn new(encoder: ResUNet30Encoder, device: Device) -> Self {
        let config = encoder.config();
        let stft = Stft::new(config.window_size, config.hop_size);
        Self {
            encoder,
            stft,
            device,
        }
    }

    pub fn embedding_size(&self) -> usize {
        self.encoder.config().embedding_size()
    }

    /// Pooled encoder embedding of a mono recording.
    pub fn embed(&self, waveform: &Waveform) -> Result<Vec<f32>> {
        let samples = waveform.mono()?;
        let spec = self.stft.spectrogram_phase(samples)?;
        let mag = spec.magnitude_tensor(&self.device)?;
        let pooled = self.encoder.embed(&mag)?;
        Ok(pooled.squeeze(0)?.to_vec1::<f32>()?)
    }

    /// Embed every utterance not yet covered by a part file.
    pub fn run(
        &self,
        dataset: &Dataset,
        store: &PartStore,
        save_interval: usize,
    ) -> Result<RunSummary> {
        if save_interval == 0 {
            bail!("save interval must be at least 1");
        }
        let resume = store.resume_index()?;
        if resume > 0 {
            tracing::info!("{} utterances already extracted, resuming", resume);
        } else {
            tracing::info!("no parts found, starting from the beginning");
        }

        let mut summary = RunSummary {
            resumed_from: resume,
            total: dataset.len(),
            ..Default::default()
        };
        let pending = dataset.subset(resume);
        let mut features = Vec::with_capacity(save_interval);
        let mut labels = Vec::with_capacity(save_interval);

        for chunk_start in pending.clone().step_by(save_interval) {
            let chunk_end = (chunk_start + save_interval).min(pending.end);
            if store.exists(chunk_end) {
                tracing::info!("skipping existing {}", store.part_path(chunk_end).display());
                summary.skipped += 1;
                continue;
            }
            for idx in chunk_start..chunk_end {
                let utterance = dataset.get(idx)?;
                let embedding = self
                    .embed(&utterance.waveform)
                    .wrap_err_with(|| format!("failed to embed utterance {}", idx))?;
                features.push(embedding);
                labels.push(utterance.label);
                tracing::debug!("[{}/{}] label {}", idx + 1, dataset.len(), utterance.label);
            }
            let batch = FeatureBatch::from_rows(&features, &labels)?;
            if store.save(chunk_end, &batch)? {
                summary.written += 1;
            } else {
                summary.skipped += 1;
            }
            features.clear();
            labels.clear();
        }

        tracing::info!(
            "all {} features extracted ({} parts written, {} skipped)",
            summary.total,
            summary.written,
            summary.skipped
        );
        Ok(summary)
    }
}
