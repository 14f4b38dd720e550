use candle_core::{Device, Tensor};
use eyre::{bail, Result, WrapErr};
use std::collections::HashMap;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

pub const PART_EXTENSION: &str = "safetensors";
const FEATURES_KEY: &str = "features";
const LABELS_KEY: &str = "labels";

/// Embeddings and speaker labels of consecutive utterances.
#[derive(Debug, Clone)]
pub struct FeatureBatch {
    /// `[rows, dim]` f32
    pub features: Tensor,
    /// `[rows]` i64
    pub labels: Tensor,
}

impl FeatureBatch {
    pub fn from_rows(features: &[Vec<f32>], labels: &[i64]) -> Result<Self> {
        if features.len() != labels.len() {
            bail!(
                "{} feature rows but {} labels",
                features.len(),
                labels.len()
            );
        }
        let dim = features.first().map_or(0, Vec::len);
        if features.iter().any(|row| row.len() != dim) {
            bail!("feature rows have different lengths");
        }
        let flat: Vec<f32> = features.iter().flatten().copied().collect();
        Ok(Self {
            features: Tensor::from_vec(flat, (features.len(), dim), &Device::Cpu)?,
            labels: Tensor::from_slice(labels, labels.len(), &Device::Cpu)?,
        })
    }

    pub fn rows(&self) -> usize {
        self.labels.elem_count()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let tensors = HashMap::from([
            (FEATURES_KEY, self.features.clone()),
            (LABELS_KEY, self.labels.clone()),
        ]);
        candle_core::safetensors::save(&tensors, path)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let mut tensors = candle_core::safetensors::load(path, &Device::Cpu)
            .wrap_err_with(|| format!("failed to read {}", path.display()))?;
        let (Some(features), Some(labels)) =
            (tensors.remove(FEATURES_KEY), tensors.remove(LABELS_KEY))
        else {
            bail!("{} lacks '{}' or '{}'", path.display(), FEATURES_KEY, LABELS_KEY);
        };
        if features.dim(0)? != labels.elem_count() {
            bail!("{} has mismatched features and labels", path.display());
        }
        Ok(Self { features, labels })
    }

    pub fn concat(batches: &[FeatureBatch]) -> Result<Self> {
        if batches.is_empty() {
            bail!("nothing to concatenate");
        }
        let features: Vec<&Tensor> = batches.iter().map(|b| &b.features).collect();
        let labels: Vec<&Tensor> = batches.iter().map(|b| &b.labels).collect();
        Ok(Self {
            features: Tensor::cat(&features, 0)?,
            labels: Tensor::cat(&labels, 0)?,
        })
    }
}

/// Coverage of the corpus by the part files on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub total: usize,
    pub completed: usize,
    /// Utterance indices no part covers.
    pub gaps: Vec<Range<usize>>,
}

impl Status {
    pub fn is_complete(&self) -> bool {
        self.gaps.is_empty() && self.completed == self.total
    }
}

/// Part files `{base}_part_{n}.safetensors` next to the output path. Part
/// `n` ends at utterance `n` (1-based), so the highest `n` on disk is the
/// number of utterances already done.
#[derive(Debug, Clone)]
pub struct PartStore {
    dir: PathBuf,
    base: String,
}

impl PartStore {
    pub fn new(output: &Path) -> Result<Self> {
        let Some(base) = output.file_name().and_then(|n| n.to_str()) else {
            bail!("output path {} has no file name", output.display());
        };
        let dir = match output.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Ok(Self {
            dir,
            base: base.to_string(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn part_path(&self, n: usize) -> PathBuf {
        self.dir
            .join(format!("{}_part_{}.{}", self.base, n, PART_EXTENSION))
    }

    /// Destination of `merge`.
    pub fn merged_path(&self) -> PathBuf {
        let mut path = self.dir.join(&self.base);
        if path.extension().is_none() {
            path.set_extension(PART_EXTENSION);
        }
        path
    }

    pub fn exists(&self, n: usize) -> bool {
        self.part_path(n).exists()
    }

    fn parse_index(&self, file_name: &str) -> Option<usize> {
        let digits = file_name
            .strip_prefix(&self.base)?
            .strip_prefix("_part_")?
            .strip_suffix(PART_EXTENSION)?
            .strip_suffix('.')?;
        // only the spelling `part_path` produces, so listing and `exists` agree
        let zero_padded = digits.len() > 1 && digits.starts_with('0');
        if zero_padded || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }

    /// Parts on disk, sorted by index.
    pub fn list(&self) -> Result<Vec<(usize, PathBuf)>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let prefix = format!("{}_part_", self.base);
        let mut parts = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.starts_with(&prefix) {
                continue;
            }
            match self.parse_index(name) {
                Some(n) => parts.push((n, path)),
                None => tracing::warn!("ignoring {}", path.display()),
            }
        }
        parts.sort_by_key(|(n, _)| *n);
        Ok(parts)
    }

    pub fn resume_index(&self) -> Result<usize> {
        Ok(self.list()?.last().map_or(0, |(n, _)| *n))
    }

    /// Write part `n` unless it already exists. Returns whether it was written.
    pub fn save(&self, n: usize, batch: &FeatureBatch) -> Result<bool> {
        let path = self.part_path(n);
        if path.exists() {
            tracing::info!("skipping existing {}", path.display());
            return Ok(false);
        }
        fs::create_dir_all(&self.dir)
            .wrap_err_with(|| format!("failed to create {}", self.dir.display()))?;

        // a crash mid-write must not leave a file that counts as done
        let tmp = path.with_extension(format!("{PART_EXTENSION}.tmp"));
        batch.save(&tmp)?;
        fs::rename(&tmp, &path)?;
        tracing::info!("saved {} features to {}", n, path.display());
        Ok(true)
    }

    pub fn load(&self, n: usize) -> Result<FeatureBatch> {
        FeatureBatch::load(&self.part_path(n))
    }

    pub fn status(&self, total: usize) -> Result<Status> {
        let mut cursor = 0;
        let mut completed = 0;
        let mut gaps = Vec::new();
        for (n, path) in self.list()? {
            if n > total {
                bail!(
                    "{} ends past the {} utterances in the manifest",
                    path.display(),
                    total
                );
            }
            let rows = FeatureBatch::load(&path)?.rows();
            let Some(start) = n.checked_sub(rows) else {
                bail!("{} holds {} rows, more than its index", path.display(), rows);
            };
            if start < cursor {
                bail!(
                    "{} overlaps utterances already covered up to {}",
                    path.display(),
                    cursor
                );
            }
            if start > cursor {
                gaps.push(cursor..start);
            }
            completed += rows;
            cursor = n;
        }
        if cursor < total {
            gaps.push(cursor..total);
        }
        Ok(Status {
            total,
            completed,
            gaps,
        })
    }

    /// Concatenate every part in order into `merged_path()`.
    pub fn merge(&self, total: usize) -> Result<PathBuf> {
        let status = self.status(total)?;
        if !status.is_complete() {
            bail!(
                "{} of {} utterances extracted, missing {:?}",
                status.completed,
                status.total,
                status.gaps
            );
        }
        let batches = self
            .list()?
            .iter()
            .map(|(_, path)| FeatureBatch::load(path))
            .collect::<Result<Vec<_>>>()?;
        let merged = FeatureBatch::concat(&batches)?;
        let path = self.merged_path();
        merged.save(&path)?;
        tracing::info!("merged {} parts into {}", batches.len(), path.display());
        Ok(path)
    }
}
