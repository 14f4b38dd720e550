use eyre::{bail, Result, WrapErr};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::audio::{read_audio_file, Waveform};

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestRow {
    pub origin_path: String,
    #[serde(rename = "speaker_ID")]
    pub speaker_id: i64,
}

#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub rows: Vec<ManifestRow>,
}

impl Manifest {
    pub fn from_csv(path: &Path) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)
            .wrap_err_with(|| format!("failed to open manifest {}", path.display()))?;
        Self::from_reader(&mut reader)
    }

    fn from_reader<R: std::io::Read>(reader: &mut csv::Reader<R>) -> Result<Self> {
        let mut rows = Vec::new();
        for (i, record) in reader.deserialize::<ManifestRow>().enumerate() {
            let row = record.wrap_err_with(|| format!("bad manifest row {}", i))?;
            rows.push(row);
        }
        Ok(Self { rows })
    }
}

/// One decoded corpus entry.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub waveform: Waveform,
    pub label: i64,
}

/// Manifest rows resolved against an audio root.
#[derive(Debug, Clone)]
pub struct Dataset {
    manifest: Manifest,
    audio_dir: PathBuf,
}

impl Dataset {
    pub fn new(manifest: Manifest, audio_dir: impl Into<PathBuf>) -> Self {
        Self {
            manifest,
            audio_dir: audio_dir.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.manifest.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifest.rows.is_empty()
    }

    pub fn label(&self, idx: usize) -> Result<i64> {
        Ok(self.row(idx)?.speaker_id)
    }

    /// Audio path of row `idx`; Windows separators in the manifest are
    /// normalized.
    pub fn path(&self, idx: usize) -> Result<PathBuf> {
        let origin = self.row(idx)?.origin_path.replace('\\', "/");
        Ok(self.audio_dir.join(origin))
    }

    pub fn get(&self, idx: usize) -> Result<Utterance> {
        let waveform = read_audio_file(&self.path(idx)?)?;
        Ok(Utterance {
            waveform,
            label: self.label(idx)?,
        })
    }

    /// Global indices still to process when resuming at `start`.
    pub fn subset(&self, start: usize) -> std::ops::Range<usize> {
        start.min(self.len())..self.len()
    }

    fn row(&self, idx: usize) -> Result<&ManifestRow> {
        match self.manifest.rows.get(idx) {
            Some(row) => Ok(row),
            None => bail!("index {} out of range for {} rows", idx, self.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CSV: &str = "\
origin_path,speaker_ID,duration
test-clean\\1089\\134686\\1089-134686-0000.flac,1089,10.4
test-clean/121/121-0001.flac,121,3.2
";

    fn manifest(csv: &str) -> Result<Manifest> {
        let mut reader = csv::Reader::from_reader(csv.as_bytes());
        Manifest::from_reader(&mut reader)
    }

    #[test]
    fn test_parse_manifest() {
        let manifest = manifest(CSV).unwrap();
        assert_eq!(manifest.rows.len(), 2);
        assert_eq!(manifest.rows[0].speaker_id, 1089);
        assert_eq!(manifest.rows[1].origin_path, "test-clean/121/121-0001.flac");
    }

    #[test]
    fn test_paths_are_normalized() {
        let dataset = Dataset::new(manifest(CSV).unwrap(), "LibriSpeech");
        assert_eq!(
            dataset.path(0).unwrap(),
            PathBuf::from("LibriSpeech/test-clean/1089/134686/1089-134686-0000.flac")
        );
        assert_eq!(dataset.label(1).unwrap(), 121);
        assert!(dataset.path(2).is_err());
    }

    #[test]
    fn test_bad_rows() {
        assert!(manifest("origin_path,speaker_ID\na.flac,abc\n").is_err());
        assert!(manifest("path,speaker\na.flac,1\n").is_err());
    }

    #[test]
    fn test_subset() {
        let dataset = Dataset::new(manifest(CSV).unwrap(), ".");
        assert_eq!(dataset.subset(0), 0..2);
        assert_eq!(dataset.subset(1), 1..2);
        assert!(dataset.subset(5).is_empty());
    }
}
