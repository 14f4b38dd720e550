use candle_core::{Tensor, D};
use candle_nn::{batch_norm, conv2d, BatchNorm, Conv2d, Conv2dConfig, VarBuilder};
use eyre::{bail, Result, WrapErr};

use crate::blocks::{EncoderBlockRes1B, BATCH_NORM_EPS};

#[derive(Debug, Clone)]
pub struct ResUNetConfig {
    pub window_size: usize,
    pub hop_size: usize,
    pub input_channels: usize,
    /// Output channels of `pre_conv` followed by encoder blocks 1-6.
    pub channels: [usize; 7],
    /// Pooling factor `(time, freq)` of encoder blocks 1-6.
    pub downsample: [(usize, usize); 6],
    /// Feed the pooled output of each block into the next one. Off by
    /// default: blocks 2-6 then see the pre-pool activation of their
    /// predecessor, which is how the published feature files were made.
    pub pool_between_blocks: bool,
}

impl Default for ResUNetConfig {
    fn default() -> Self {
        Self {
            window_size: 2048,
            hop_size: 320,
            input_channels: 1,
            channels: [32, 32, 64, 128, 256, 384, 384],
            downsample: [(2, 2), (2, 2), (2, 2), (2, 2), (2, 2), (1, 2)],
            pool_between_blocks: false,
        }
    }
}

impl ResUNetConfig {
    pub fn freq_bins(&self) -> usize {
        self.window_size / 2 + 1
    }

    pub fn embedding_size(&self) -> usize {
        self.channels[6]
    }
}

/// Encoder half of ResUNet30 up to the bottleneck block `conv_block7a`.
#[derive(Debug, Clone)]
pub struct ResUNet30Encoder {
    config: ResUNetConfig,
    bn0: BatchNorm,
    pre_conv: Conv2d,
    encoder_blocks: Vec<EncoderBlockRes1B>,
    conv_block7a: EncoderBlockRes1B,
}

impl ResUNet30Encoder {
    pub fn load(config: ResUNetConfig, vb: VarBuilder) -> Result<Self> {
        let bn0 = batch_norm(config.freq_bins(), BATCH_NORM_EPS, vb.pp("bn0"))?;
        let pre_conv = conv2d(
            config.input_channels,
            config.channels[0],
            1,
            Conv2dConfig::default(),
            vb.pp("pre_conv"),
        )?;
        let mut encoder_blocks = Vec::with_capacity(6);
        for i in 0..6 {
            encoder_blocks.push(EncoderBlockRes1B::load(
                config.channels[i],
                config.channels[i + 1],
                config.downsample[i],
                vb.pp(format!("encoder_block{}", i + 1)),
            )?);
        }
        let center = config.embedding_size();
        let conv_block7a = EncoderBlockRes1B::load(center, center, (1, 1), vb.pp("conv_block7a"))?;
        tracing::debug!(
            "loaded ResUNet30 encoder: {} freq bins, {} embedding dims",
            config.freq_bins(),
            center
        );
        Ok(Self {
            config,
            bn0,
            pre_conv,
            encoder_blocks,
            conv_block7a,
        })
    }

    pub fn config(&self) -> &ResUNetConfig {
        &self.config
    }

    /// `mag`: `[batch, channels, frames, freq_bins]` magnitude spectrogram.
    /// Returns `[batch, embedding_size]`.
    pub fn embed(&self, mag: &Tensor) -> Result<Tensor> {
        let (_, channels, frames, bins) = mag.dims4()?;
        if channels != self.config.input_channels {
            bail!(
                "expected {} input channel(s), got {}",
                self.config.input_channels,
                channels
            );
        }
        if bins != self.config.freq_bins() {
            bail!(
                "expected {} frequency bins, got {}",
                self.config.freq_bins(),
                bins
            );
        }

        // normalize each frequency bin
        let x = mag.transpose(1, 3)?.contiguous()?;
        let x = x.apply_t(&self.bn0, false)?;
        let x = x.transpose(1, 3)?.contiguous()?;
        let x = x.narrow(D::Minus1, 0, bins - 1)?.contiguous()?;
        let mut x = x.apply(&self.pre_conv)?;

        let last = self.encoder_blocks.len() - 1;
        for (i, block) in self.encoder_blocks.iter().enumerate() {
            let (pooled, pre_pool) = block
                .forward(&x)
                .wrap_err_with(|| format!("encoder block {} on {} frames", i + 1, frames))?;
            x = if i == last || self.config.pool_between_blocks {
                pooled
            } else {
                pre_pool
            };
        }

        let (center, _) = self.conv_block7a.forward(&x)?;
        tracing::debug!("bottleneck shape {:?}", center.dims());
        Ok(center.mean((2, 3))?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    pub(crate) fn tiny_config() -> ResUNetConfig {
        ResUNetConfig {
            window_size: 16,
            hop_size: 4,
            channels: [2, 2, 3, 3, 4, 4, 5],
            ..Default::default()
        }
    }

    pub(crate) fn tiny_encoder(varmap: &VarMap) -> ResUNet30Encoder {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        ResUNet30Encoder::load(tiny_config(), vb.pp("ss_model").pp("base")).unwrap()
    }

    #[test]
    fn test_default_matches_resunet30() {
        let config = ResUNetConfig::default();
        assert_eq!(config.freq_bins(), 1025);
        assert_eq!(config.embedding_size(), 384);
    }

    #[test]
    fn test_parameter_names() {
        let varmap = VarMap::new();
        tiny_encoder(&varmap);
        let data = varmap.data().lock().unwrap();
        for name in [
            "ss_model.base.bn0.running_var",
            "ss_model.base.pre_conv.weight",
            "ss_model.base.encoder_block1.conv_block1.conv1.weight",
            "ss_model.base.encoder_block6.conv_block1.bn2.bias",
            "ss_model.base.conv_block7a.conv_block1.conv2.weight",
        ] {
            assert!(data.contains_key(name), "missing {name}");
        }
        // 7a keeps its channel count, so no shortcut conv
        assert!(!data.contains_key("ss_model.base.conv_block7a.conv_block1.shortcut.weight"));
    }

    #[test]
    fn test_embed_shape() {
        let varmap = VarMap::new();
        let encoder = tiny_encoder(&varmap);
        let mag = Tensor::rand(0f32, 1.0, (1, 1, 6, 9), &Device::Cpu).unwrap();
        let pooled = encoder.embed(&mag).unwrap();
        assert_eq!(pooled.dims(), &[1, 5]);
        let values = pooled.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_embed_rejects_wrong_bins() {
        let varmap = VarMap::new();
        let encoder = tiny_encoder(&varmap);
        let mag = Tensor::rand(0f32, 1.0, (1, 1, 6, 8), &Device::Cpu).unwrap();
        assert!(encoder.embed(&mag).is_err());
    }

    #[test]
    fn test_pooled_chaining_runs_out_of_bins() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = ResUNetConfig {
            pool_between_blocks: true,
            ..tiny_config()
        };
        let encoder = ResUNet30Encoder::load(config, vb).unwrap();

        // 8 freq bins after dropping the last one shrink to 1 before block 4
        let mag = Tensor::rand(0f32, 1.0, (1, 1, 40, 9), &Device::Cpu).unwrap();
        assert!(encoder.embed(&mag).is_err());

        let unpooled = ResUNet30Encoder {
            config: tiny_config(),
            ..encoder
        };
        assert_eq!(unpooled.embed(&mag).unwrap().dims(), &[1, 5]);
    }
}
