use std::path::PathBuf;

use crate::DeviceMap;

/// Defaults a request falls back to when it leaves a knob unset. One
/// instance per generator, never persisted.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub model_name: String,
    pub device: DeviceMap,
    pub output_dir: PathBuf,
    pub num_inference_steps: usize,
    pub guidance_scale: f64,
    pub height: usize,
    pub width: usize,
    pub default_negative_prompt: String,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            model_name: "runwayml/stable-diffusion-v1-5".to_string(),
            device: DeviceMap::default(),
            output_dir: PathBuf::from("generated_images"),
            num_inference_steps: 40,
            guidance_scale: 7.5,
            // portrait aspect, a reasonable quality/speed balance
            height: 768,
            width: 512,
            default_negative_prompt: "deformed, extra fingers, mutated hands, \
                poorly drawn hands, extra limbs, bad anatomy, low quality, \
                blurry, grainy, distorted face"
                .to_string(),
        }
    }
}
