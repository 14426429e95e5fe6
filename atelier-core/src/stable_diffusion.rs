use anyhow::{Error, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_transformers::models::stable_diffusion::{
    self, clip::ClipTextTransformer, unet_2d::UNet2DConditionModel,
    vae::AutoEncoderKL, StableDiffusionConfig,
};
use hf_hub::api::tokio::Api;
use hf_hub::Repo;
use image::DynamicImage;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use crate::{
    tensor_to_image, DeviceMap, InferenceParams, LoadError, Loader, PipelineLike, PipelineSpec,
};

/// All supported checkpoints share the CLIP tokenizer from this repo.
const TOKENIZER_REPO: &str = "openai/clip-vit-base-patch32";

/// Latent scaling factor shared by the v1.x/v2.x VAE.
const VAE_SCALE: f64 = 0.18215;

/// Weight layouts this loader understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdVersion {
    V1_5,
    V2_1,
}

impl SdVersion {
    /// Detect the checkpoint version from a model identifier.
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase();

        if !name_upper.contains("STABLE-DIFFUSION") {
            return None;
        }
        if name_upper.contains("2-1") || name_upper.contains("2.1") {
            Some(SdVersion::V2_1)
        } else {
            // Bare "stable-diffusion" identifiers get the v1.5 layout
            Some(SdVersion::V1_5)
        }
    }

    fn config(
        self,
        sliced_attention_size: Option<usize>,
        height: usize,
        width: usize,
    ) -> StableDiffusionConfig {
        match self {
            SdVersion::V1_5 => {
                StableDiffusionConfig::v1_5(sliced_attention_size, Some(height), Some(width))
            }
            SdVersion::V2_1 => {
                StableDiffusionConfig::v2_1(sliced_attention_size, Some(height), Some(width))
            }
        }
    }
}

pub struct SdPipeline {
    device: Device,
    dtype: DType,
    sd_config: StableDiffusionConfig,
    tokenizer: Tokenizer,
    text_model: ClipTextTransformer,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
}

impl SdPipeline {
    /// Tokenize `text`, pad to the CLIP context length and run the text
    /// encoder. The encoder runs in full precision regardless of the
    /// pipeline dtype.
    fn encode_text(&self, text: &str) -> Result<Tensor> {
        let vocab = self.tokenizer.get_vocab(true);
        let pad_id = match &self.sd_config.clip.pad_with {
            Some(padding) => *vocab
                .get(padding.as_str())
                .ok_or_else(|| Error::msg("padding token missing from tokenizer vocab"))?,
            None => *vocab
                .get("<|endoftext|>")
                .ok_or_else(|| Error::msg("end-of-text token missing from tokenizer vocab"))?,
        };

        let mut tokens = self
            .tokenizer
            .encode(text, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        let max_len = self.sd_config.clip.max_position_embeddings;
        if tokens.len() > max_len {
            anyhow::bail!("prompt is too long: {} tokens > {max_len}", tokens.len());
        }
        while tokens.len() < max_len {
            tokens.push(pad_id);
        }

        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.text_model.forward(&tokens)?)
    }

    /// Stacked [uncond, cond] embeddings for classifier-free guidance.
    fn encode_prompts(&self, prompt: &str, negative_prompt: &str) -> Result<Tensor> {
        let cond = self.encode_text(prompt)?;
        let uncond = self.encode_text(negative_prompt)?;
        Ok(Tensor::cat(&[uncond, cond], 0)?.to_dtype(self.dtype)?)
    }
}

impl PipelineLike for SdPipeline {
    fn run(&self, params: &InferenceParams) -> Result<DynamicImage> {
        if let Some(seed) = params.seed {
            self.device.set_seed(seed)?;
            info!("using seed: {seed}");
        }

        // The scheduler depends on the step count, so it is rebuilt per
        // request.
        let mut scheduler = self.sd_config.build_scheduler(params.steps)?;
        let text_embeddings = self.encode_prompts(&params.prompt, &params.negative_prompt)?;

        let mut latents = Tensor::randn(
            0f32,
            1f32,
            (1, 4, self.sd_config.height / 8, self.sd_config.width / 8),
            &self.device,
        )?
        .to_dtype(self.dtype)?;
        latents = (latents * scheduler.init_noise_sigma())?;

        let timesteps = scheduler.timesteps().to_vec();
        for (index, &timestep) in timesteps.iter().enumerate() {
            debug!("denoise step {}/{}", index + 1, params.steps);

            let latent_input = Tensor::cat(&[&latents, &latents], 0)?;
            let latent_input = scheduler.scale_model_input(latent_input, timestep)?;
            let noise_pred = self
                .unet
                .forward(&latent_input, timestep as f64, &text_embeddings)?;

            let noise_pred = noise_pred.chunk(2, 0)?;
            let (noise_pred_uncond, noise_pred_text) = (&noise_pred[0], &noise_pred[1]);
            let noise_pred =
                (noise_pred_uncond + ((noise_pred_text - noise_pred_uncond)? * params.guidance)?)?;

            latents = scheduler.step(&noise_pred, timestep, &latents)?;
        }

        let image = self.vae.decode(&(&latents / VAE_SCALE)?)?;
        let image = ((image / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
        let image = (image.clamp(0f32, 1f32)? * 255.)?.to_dtype(DType::U8)?;

        tensor_to_image(&image.i(0)?)
    }
}

fn weight_file(stem: &str, dtype: DType) -> String {
    if dtype == DType::F16 {
        format!("{stem}.fp16.safetensors")
    } else {
        format!("{stem}.safetensors")
    }
}

pub struct SdLoader;

impl Loader for SdLoader {
    type Pipeline = SdPipeline;

    async fn load(
        spec: PipelineSpec,
        api: Api,
        device_map: DeviceMap,
    ) -> Result<Self::Pipeline, LoadError> {
        let device = crate::select_best_device(device_map)?;
        let accelerated = !matches!(device, Device::Cpu);

        // Reduced precision on accelerated devices; full precision plus
        // automatic attention slicing to bound peak memory on CPU.
        let dtype = if accelerated { DType::F16 } else { DType::F32 };
        let sliced_attention_size = if accelerated { None } else { Some(0) };
        let sd_config = spec
            .version
            .config(sliced_attention_size, spec.height, spec.width);

        let tokenizer_file = api
            .model(TOKENIZER_REPO.to_string())
            .get("tokenizer.json")
            .await?;
        let tokenizer =
            Tokenizer::from_file(tokenizer_file).map_err(|e| LoadError::Tokenizer(Error::msg(e)))?;

        let repo = api.repo(Repo::model(spec.model_name.clone()));
        let clip_weights = repo.get(&weight_file("text_encoder/model", dtype)).await?;
        let vae_weights = repo
            .get(&weight_file("vae/diffusion_pytorch_model", dtype))
            .await?;
        let unet_weights = repo
            .get(&weight_file("unet/diffusion_pytorch_model", dtype))
            .await?;

        let text_model = stable_diffusion::build_clip_transformer(
            &sd_config.clip,
            &clip_weights,
            &device,
            DType::F32,
        )?;
        let vae = sd_config.build_vae(&vae_weights, &device, dtype)?;

        let use_flash_attn = cfg!(feature = "flash-attn") && matches!(device, Device::Cuda(_));
        let unet = match sd_config.build_unet(&unet_weights, &device, 4, use_flash_attn, dtype) {
            Ok(unet) => unet,
            Err(err) if use_flash_attn => {
                warn!("flash attention unavailable ({err}), using default attention");
                sd_config.build_unet(&unet_weights, &device, 4, false, dtype)?
            }
            Err(err) => return Err(err.into()),
        };

        info!("pipeline loaded for {}", spec.model_name);

        Ok(SdPipeline {
            device,
            dtype,
            sd_config,
            tokenizer,
            text_model,
            unet,
            vae,
        })
    }
}
