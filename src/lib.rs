pub mod audio;
pub mod dataset;
pub mod extract;
pub mod parts;

pub use audio::{read_audio_file, Waveform};
pub use audiosep_resunet as resunet;
pub use dataset::{Dataset, Manifest, Utterance};
pub use extract::{ExtractOptions, FeatureExtractor, RunSummary};
pub use parts::{FeatureBatch, PartStore, Status};
