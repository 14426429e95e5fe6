pub mod config;
pub mod device_map;
mod error;
mod generator;
mod handler;
mod loader;
mod loader_factory;
mod util;

mod stable_diffusion;

pub use config::GeneratorConfig;
pub use device_map::*;
pub use error::*;
pub use generator::*;
pub use handler::*;
use image::DynamicImage;
pub use loader::*;
pub use loader_factory::*;
use serde::{Deserialize, Serialize};
pub use stable_diffusion::{SdLoader, SdPipeline, SdVersion};
pub(crate) use util::*;

/// A generation request as it arrives from the GUI. Unset knobs are
/// resolved from [`GeneratorConfig`] defaults; the seed is kept as raw
/// user input and parsed at generation time.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    pub steps: Option<usize>,
    pub guidance: Option<f64>,
    pub seed: Option<String>,
    pub output_filename: Option<String>,
}

/// Fully-resolved parameters handed to the pipeline for a single run.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceParams {
    pub prompt: String,
    pub negative_prompt: String,
    pub steps: usize,
    pub guidance: f64,
    pub seed: Option<u64>,
}

pub trait PipelineLike: Send + Sync {
    fn run(&self, params: &InferenceParams) -> anyhow::Result<DynamicImage>;
}
