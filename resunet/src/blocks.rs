use candle_core::Tensor;
use candle_nn::{batch_norm, conv2d, conv2d_no_bias, BatchNorm, Conv2d, Conv2dConfig, VarBuilder};
use eyre::{bail, Result};

pub const LEAKY_RELU_SLOPE: f64 = 0.01;
pub const BATCH_NORM_EPS: f64 = 1e-5;

/// Pre-activation residual block: two 3x3 convolutions, each preceded by
/// batch norm and leaky ReLU.
#[derive(Debug, Clone)]
pub struct ConvBlockRes {
    bn1: BatchNorm,
    bn2: BatchNorm,
    conv1: Conv2d,
    conv2: Conv2d,
    shortcut: Option<Conv2d>,
}

impl ConvBlockRes {
    pub fn load(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        let same = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let bn1 = batch_norm(in_channels, BATCH_NORM_EPS, vb.pp("bn1"))?;
        let bn2 = batch_norm(out_channels, BATCH_NORM_EPS, vb.pp("bn2"))?;
        let conv1 = conv2d_no_bias(in_channels, out_channels, 3, same, vb.pp("conv1"))?;
        let conv2 = conv2d_no_bias(out_channels, out_channels, 3, same, vb.pp("conv2"))?;
        let shortcut = if in_channels != out_channels {
            Some(conv2d(
                in_channels,
                out_channels,
                1,
                Conv2dConfig::default(),
                vb.pp("shortcut"),
            )?)
        } else {
            None
        };
        Ok(Self {
            bn1,
            bn2,
            conv1,
            conv2,
            shortcut,
        })
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let x = input.apply_t(&self.bn1, false)?;
        let x = candle_nn::ops::leaky_relu(&x, LEAKY_RELU_SLOPE)?.apply(&self.conv1)?;
        let x = x.apply_t(&self.bn2, false)?;
        let x = candle_nn::ops::leaky_relu(&x, LEAKY_RELU_SLOPE)?.apply(&self.conv2)?;
        let residual = match &self.shortcut {
            Some(shortcut) => input.apply(shortcut)?,
            None => input.clone(),
        };
        Ok((residual + x)?)
    }
}

/// Residual block followed by average pooling.
#[derive(Debug, Clone)]
pub struct EncoderBlockRes1B {
    conv_block1: ConvBlockRes,
    downsample: (usize, usize),
}

impl EncoderBlockRes1B {
    pub fn load(
        in_channels: usize,
        out_channels: usize,
        downsample: (usize, usize),
        vb: VarBuilder,
    ) -> Result<Self> {
        let conv_block1 = ConvBlockRes::load(in_channels, out_channels, vb.pp("conv_block1"))?;
        Ok(Self {
            conv_block1,
            downsample,
        })
    }

    /// Returns `(pooled, pre_pool)`.
    pub fn forward(&self, input: &Tensor) -> Result<(Tensor, Tensor)> {
        let encoder = self.conv_block1.forward(input)?;
        let (_, _, t, f) = encoder.dims4()?;
        let (dt, df) = self.downsample;
        if t < dt || f < df {
            bail!("cannot pool a {}x{} map by {}x{}", t, f, dt, df);
        }
        let pooled = if self.downsample == (1, 1) {
            encoder.clone()
        } else {
            encoder.avg_pool2d(self.downsample)?
        };
        Ok((pooled, encoder))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn random_vb(varmap: &VarMap) -> VarBuilder<'_> {
        VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu)
    }

    #[test]
    fn test_conv_block_keeps_spatial_shape() {
        let varmap = VarMap::new();
        let block = ConvBlockRes::load(2, 4, random_vb(&varmap)).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 2, 5, 8), &Device::Cpu).unwrap();
        let y = block.forward(&x).unwrap();
        assert_eq!(y.dims(), &[1, 4, 5, 8]);

        let names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
        assert!(names.contains(&"shortcut.weight".to_string()));
        assert!(names.contains(&"shortcut.bias".to_string()));
        assert!(names.contains(&"bn1.running_mean".to_string()));
        assert!(!names.contains(&"conv1.bias".to_string()));
    }

    #[test]
    fn test_identity_residual_without_shortcut() {
        let device = Device::Cpu;
        // all-zero conv weights leave only the residual path
        let block = ConvBlockRes::load(3, 3, VarBuilder::zeros(DType::F32, &device)).unwrap();
        assert!(block.shortcut.is_none());
        let x = Tensor::randn(0f32, 1.0, (1, 3, 4, 4), &device).unwrap();
        let y = block.forward(&x).unwrap();
        let diff = (y - &x).unwrap().abs().unwrap().flatten_all().unwrap().max(0).unwrap();
        assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn test_encoder_block_pools() {
        let varmap = VarMap::new();
        let block = EncoderBlockRes1B::load(2, 2, (2, 2), random_vb(&varmap)).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 2, 5, 8), &Device::Cpu).unwrap();
        let (pooled, pre_pool) = block.forward(&x).unwrap();
        assert_eq!(pre_pool.dims(), &[1, 2, 5, 8]);
        assert_eq!(pooled.dims(), &[1, 2, 2, 4]);

        let block = EncoderBlockRes1B::load(2, 2, (1, 2), random_vb(&varmap).pp("b")).unwrap();
        let (pooled, _) = block.forward(&x).unwrap();
        assert_eq!(pooled.dims(), &[1, 2, 5, 4]);

        let narrow = Tensor::randn(0f32, 1.0, (1, 2, 1, 8), &Device::Cpu).unwrap();
        let block = EncoderBlockRes1B::load(2, 2, (2, 2), random_vb(&varmap).pp("c")).unwrap();
        assert!(block.forward(&narrow).is_err());
    }
}
