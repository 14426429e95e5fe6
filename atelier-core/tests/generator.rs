use std::fs;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use atelier_core::{
    GenerateError, GenerationRequest, GeneratorConfig, ImageGenerator, InferenceParams,
    PipelineLike,
};
use image::{DynamicImage, ImageBuffer, Rgb};
use pretty_assertions::{assert_eq, assert_ne};
use tempfile::TempDir;

/// Deterministic stand-in for the diffusion pipeline: pixels derive
/// from the seed and prompt, and every call is recorded.
#[derive(Default)]
struct StubPipeline {
    calls: Mutex<Vec<InferenceParams>>,
}

impl StubPipeline {
    fn last_call(&self) -> InferenceParams {
        self.calls
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no pipeline calls recorded")
    }
}

impl PipelineLike for StubPipeline {
    fn run(&self, params: &InferenceParams) -> anyhow::Result<DynamicImage> {
        self.calls.lock().unwrap().push(params.clone());

        let mut key = params.seed.unwrap_or(0).wrapping_mul(0x9e37_79b9);
        for byte in params.prompt.bytes() {
            key = key.wrapping_mul(31).wrapping_add(u64::from(byte));
        }
        let image = ImageBuffer::from_fn(8, 8, |x, y| {
            let v = key.wrapping_add(u64::from(x) * 7 + u64::from(y) * 13);
            Rgb([
                (v & 0xff) as u8,
                ((v >> 8) & 0xff) as u8,
                ((v >> 16) & 0xff) as u8,
            ])
        });
        Ok(DynamicImage::ImageRgb8(image))
    }
}

/// Always returns an all-black image.
struct DarkPipeline;

impl PipelineLike for DarkPipeline {
    fn run(&self, _params: &InferenceParams) -> anyhow::Result<DynamicImage> {
        let image = ImageBuffer::from_pixel(8, 8, Rgb([0, 0, 0]));
        Ok(DynamicImage::ImageRgb8(image))
    }
}

/// Always fails.
struct BrokenPipeline;

impl PipelineLike for BrokenPipeline {
    fn run(&self, _params: &InferenceParams) -> anyhow::Result<DynamicImage> {
        Err(anyhow!("device out of memory"))
    }
}

fn generator_in(dir: &TempDir) -> ImageGenerator {
    let config = GeneratorConfig {
        output_dir: dir.path().join("generated_images"),
        ..GeneratorConfig::default()
    };
    ImageGenerator::new(config)
}

fn request(prompt: &str) -> GenerationRequest {
    GenerationRequest {
        prompt: prompt.to_string(),
        ..GenerationRequest::default()
    }
}

fn pixels(image: &DynamicImage) -> Vec<u8> {
    image.to_rgb8().into_raw()
}

#[test]
fn generate_without_pipeline_fails_and_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let generator = generator_in(&dir);

    let result = generator.generate(&request("a red cube on a white table"));

    assert!(matches!(result, Err(GenerateError::PipelineNotReady)));
    assert!(!generator.config().output_dir.exists());
}

#[test]
fn failed_inference_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let generator = generator_in(&dir);
    generator.handler().install(Arc::new(BrokenPipeline));

    let result = generator.generate(&request("a red cube on a white table"));

    assert!(matches!(result, Err(GenerateError::Inference(_))));
    assert!(!generator.config().output_dir.exists());
}

#[test]
fn generate_writes_one_file_with_the_requested_name() {
    let dir = TempDir::new().unwrap();
    let generator = generator_in(&dir);
    generator.handler().install(Arc::new(StubPipeline::default()));

    let mut req = request("a red cube on a white table");
    req.output_filename = Some("cube.png".to_string());
    let generated = generator.generate(&req).unwrap();

    assert_eq!(
        generated.path,
        generator.config().output_dir.join("cube.png")
    );
    let entries = fs::read_dir(&generator.config().output_dir)
        .unwrap()
        .count();
    assert_eq!(entries, 1);

    let on_disk = image::open(&generated.path).unwrap();
    assert_eq!(pixels(&on_disk), pixels(&generated.image));
}

#[test]
fn default_filename_is_used_and_existing_files_are_overwritten() {
    let dir = TempDir::new().unwrap();
    let generator = generator_in(&dir);
    generator.handler().install(Arc::new(StubPipeline::default()));

    let out_dir = generator.config().output_dir.clone();
    fs::create_dir_all(&out_dir).unwrap();
    let path = out_dir.join("generated_image.png");
    fs::write(&path, b"stale bytes").unwrap();

    let generated = generator.generate(&request("a lighthouse at dusk")).unwrap();

    assert_eq!(generated.path, path);
    let on_disk = image::open(&path).unwrap();
    assert_eq!(pixels(&on_disk), pixels(&generated.image));
}

#[test]
fn same_seed_is_deterministic_and_different_seed_is_not() {
    let dir = TempDir::new().unwrap();
    let generator = generator_in(&dir);
    generator.handler().install(Arc::new(StubPipeline::default()));

    let mut req = request("a red cube on a white table");
    req.seed = Some("42".to_string());
    let first = generator.generate(&req).unwrap();
    let second = generator.generate(&req).unwrap();

    req.seed = Some("43".to_string());
    let other = generator.generate(&req).unwrap();

    assert_eq!(pixels(&first.image), pixels(&second.image));
    assert_ne!(pixels(&first.image), pixels(&other.image));
}

#[test]
fn unparsable_seed_behaves_like_no_seed() {
    let dir = TempDir::new().unwrap();
    let generator = generator_in(&dir);
    let stub = Arc::new(StubPipeline::default());
    generator.handler().install(stub.clone());

    let mut req = request("a red cube on a white table");
    req.seed = Some("not-a-number".to_string());
    let with_bad_seed = generator.generate(&req).unwrap();
    assert_eq!(stub.last_call().seed, None);

    let unseeded = generator
        .generate(&request("a red cube on a white table"))
        .unwrap();
    assert_eq!(pixels(&with_bad_seed.image), pixels(&unseeded.image));
}

#[test]
fn defaults_are_resolved_from_configuration() {
    let dir = TempDir::new().unwrap();
    let generator = generator_in(&dir);
    let stub = Arc::new(StubPipeline::default());
    generator.handler().install(stub.clone());

    generator.generate(&request("a red cube")).unwrap();
    let call = stub.last_call();
    assert_eq!(call.steps, 40);
    assert_eq!(call.guidance, 7.5);
    assert_eq!(
        call.negative_prompt,
        generator.config().default_negative_prompt
    );

    // whitespace-only negative prompt also falls back to the default
    let mut req = request("a red cube");
    req.negative_prompt = "   ".to_string();
    generator.generate(&req).unwrap();
    assert_eq!(
        stub.last_call().negative_prompt,
        generator.config().default_negative_prompt
    );

    let mut req = request("a red cube");
    req.negative_prompt = "blurry".to_string();
    req.steps = Some(25);
    req.guidance = Some(9.0);
    req.seed = Some("7".to_string());
    generator.generate(&req).unwrap();
    let call = stub.last_call();
    assert_eq!(call.negative_prompt, "blurry");
    assert_eq!(call.steps, 25);
    assert_eq!(call.guidance, 9.0);
    assert_eq!(call.seed, Some(7));
}

#[test]
fn dark_output_is_still_a_success() {
    let dir = TempDir::new().unwrap();
    let generator = generator_in(&dir);
    generator.handler().install(Arc::new(DarkPipeline));

    let generated = generator.generate(&request("the void")).unwrap();
    assert!(generated.path.exists());
}

#[tokio::test]
async fn upgrade_to_unsupported_model_clears_the_pipeline() {
    let dir = TempDir::new().unwrap();
    let generator = generator_in(&dir);
    generator.handler().install(Arc::new(StubPipeline::default()));
    assert!(generator.handler().is_ready());

    generator.upgrade_model("definitely-not-a-diffusion-model").await;

    assert!(!generator.handler().is_ready());
    assert_eq!(
        generator.handler().model_name(),
        "definitely-not-a-diffusion-model"
    );
    assert!(matches!(
        generator.generate(&request("a red cube")),
        Err(GenerateError::PipelineNotReady)
    ));
}
