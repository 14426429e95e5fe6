use std::fs;
use std::path::PathBuf;

use image::DynamicImage;
use tracing::{info, warn};

use crate::{
    GenerateError, GenerationRequest, GeneratorConfig, InferenceParams, ModelHandler,
};

const DEFAULT_OUTPUT_FILENAME: &str = "generated_image.png";

/// Mean RGB intensity below which a result is flagged as suspiciously
/// dark. Advisory only.
const DARK_IMAGE_THRESHOLD: f64 = 10.0;

/// A successfully generated image and where it was written.
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub image: DynamicImage,
    pub path: PathBuf,
}

pub struct ImageGenerator {
    config: GeneratorConfig,
    handler: ModelHandler,
}

impl ImageGenerator {
    pub fn new(config: GeneratorConfig) -> Self {
        let handler = ModelHandler::new(&config);
        Self { config, handler }
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    pub fn handler(&self) -> &ModelHandler {
        &self.handler
    }

    pub async fn load_model(&self) {
        self.handler.load().await;
    }

    pub async fn upgrade_model(&self, new_model: &str) {
        self.handler.upgrade(new_model).await;
    }

    /// Run one generation. The pipeline call is blocking, synchronous
    /// and non-cancelable; its duration scales with step count and
    /// resolution. Nothing is written to disk on a failure path.
    pub fn generate(&self, request: &GenerationRequest) -> Result<GeneratedImage, GenerateError> {
        info!("generating image for prompt: {:?}", request.prompt);

        let Some(pipeline) = self.handler.pipeline() else {
            warn!("pipeline not loaded, cannot generate");
            return Err(GenerateError::PipelineNotReady);
        };

        let negative_prompt = if request.negative_prompt.trim().is_empty() {
            self.config.default_negative_prompt.clone()
        } else {
            request.negative_prompt.clone()
        };
        let params = InferenceParams {
            prompt: request.prompt.clone(),
            negative_prompt,
            steps: request.steps.unwrap_or(self.config.num_inference_steps),
            guidance: request.guidance.unwrap_or(self.config.guidance_scale),
            seed: request.seed.as_deref().and_then(parse_seed),
        };

        let image = pipeline.run(&params).map_err(GenerateError::Inference)?;

        let mean = mean_intensity(&image);
        if mean < DARK_IMAGE_THRESHOLD {
            warn!("generated image appears very dark (mean intensity {mean:.1})");
        }

        fs::create_dir_all(&self.config.output_dir)?;
        let filename = request
            .output_filename
            .as_deref()
            .unwrap_or(DEFAULT_OUTPUT_FILENAME);
        let path = self.config.output_dir.join(filename);
        image.save(&path).map_err(|source| GenerateError::Save {
            path: path.clone(),
            source,
        })?;
        info!("image saved to {}", path.display());

        Ok(GeneratedImage { image, path })
    }
}

/// Parse raw seed input. Blank input means "unseeded"; input that fails
/// to parse is ignored the same way, with a warning.
fn parse_seed(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.parse::<u64>() {
        Ok(seed) => Some(seed),
        Err(_) => {
            warn!("invalid seed {raw:?}, ignoring");
            None
        }
    }
}

fn mean_intensity(image: &DynamicImage) -> f64 {
    let rgb = image.to_rgb8();
    let pixels = rgb.as_raw();
    if pixels.is_empty() {
        return 0.0;
    }
    pixels.iter().map(|&v| u64::from(v)).sum::<u64>() as f64 / pixels.len() as f64
}

#[cfg(test)]
mod test {
    use image::{ImageBuffer, Rgb};
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn seed_parsing() {
        assert_eq!(parse_seed("42"), Some(42));
        assert_eq!(parse_seed("  7 "), Some(7));
        assert_eq!(parse_seed(""), None);
        assert_eq!(parse_seed("   "), None);
        assert_eq!(parse_seed("not-a-number"), None);
        assert_eq!(parse_seed("-1"), None);
        assert_eq!(parse_seed("4.2"), None);
    }

    #[test]
    fn mean_intensity_of_solid_images() {
        let black = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(4, 4, Rgb([0, 0, 0])));
        let white = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(4, 4, Rgb([255, 255, 255])));
        let grey = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(4, 4, Rgb([8, 8, 8])));

        assert_eq!(mean_intensity(&black), 0.0);
        assert_eq!(mean_intensity(&white), 255.0);
        assert!(mean_intensity(&grey) < DARK_IMAGE_THRESHOLD);
    }
}
