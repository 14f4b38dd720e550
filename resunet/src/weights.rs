use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use eyre::{bail, Result, WrapErr};
use std::collections::HashMap;
use std::path::Path;

/// Where the separation backbone lives inside an AudioSep state dict.
pub const DEFAULT_PREFIX: &str = "ss_model.base";

/// Keys under which training checkpoints nest the state dict: plain
/// `torch.save({"model": ...})` dumps and Lightning `.ckpt` files.
const MODEL_KEY: &str = "model";
const STATE_DICT_KEY: &str = "state_dict";

/// Read a checkpoint into a `VarBuilder` rooted at `prefix`.
///
/// `.safetensors` files are read directly. Anything else is treated as a
/// PyTorch pickle; its `model` or `state_dict` entry is used when present,
/// the top-level dict otherwise. Keys outside `prefix` are ignored.
pub fn load_checkpoint(path: &Path, prefix: &str, device: &Device) -> Result<VarBuilder<'static>> {
    if !path.exists() {
        bail!("checkpoint not found at {}", path.display())
    }
    let tensors = read_tensors(path, device)
        .wrap_err_with(|| format!("failed to read checkpoint {}", path.display()))?;
    let tensors = strip_model_key(tensors, prefix);

    let matching = tensors.keys().filter(|k| k.starts_with(prefix)).count();
    tracing::debug!(
        "checkpoint {} holds {} tensors, {} under {}",
        path.display(),
        tensors.len(),
        matching,
        prefix
    );
    if matching == 0 {
        bail!("no tensors under '{}' in {}", prefix, path.display());
    }

    let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
    Ok(if prefix.is_empty() { vb } else { vb.pp(prefix) })
}

fn read_tensors(path: &Path, device: &Device) -> Result<HashMap<String, Tensor>> {
    let is_safetensors = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("safetensors"));
    if is_safetensors {
        return Ok(candle_core::safetensors::load(path, device)?);
    }

    let mut entries = Vec::new();
    for key in [MODEL_KEY, STATE_DICT_KEY] {
        if let Ok(nested) = candle_core::pickle::read_all_with_key(path, Some(key)) {
            if !nested.is_empty() {
                tracing::debug!("using '{}' entry of {}", key, path.display());
                entries = nested;
                break;
            }
        }
    }
    if entries.is_empty() {
        entries = candle_core::pickle::read_all(path)?;
    }
    entries
        .into_iter()
        .map(|(name, tensor)| -> Result<(String, Tensor)> {
            Ok((name, tensor.to_device(device)?))
        })
        .collect()
}

/// Flattened exports sometimes keep the `model.` prefix of the training
/// checkpoint.
fn strip_model_key(tensors: HashMap<String, Tensor>, prefix: &str) -> HashMap<String, Tensor> {
    if tensors.keys().any(|k| k.starts_with(prefix)) {
        return tensors;
    }
    let nested = format!("{MODEL_KEY}.");
    tensors
        .into_iter()
        .map(|(name, tensor)| match name.strip_prefix(&nested) {
            Some(stripped) => (stripped.to_string(), tensor),
            None => (name, tensor),
        })
        .collect()
}
