use std::sync::Arc;

use hf_hub::api::tokio::Api;
use tracing::info;

use crate::{DeviceMap, LoadError, Loader, PipelineLike, PipelineSpec, SdLoader, SdVersion};

/// Load a pipeline for a model identifier, detecting the weight layout
/// from the name. Unsupported identifiers fail before anything is
/// fetched.
pub async fn load_pipeline(
    model_name: &str,
    height: usize,
    width: usize,
    device_map: DeviceMap,
) -> Result<Arc<dyn PipelineLike>, LoadError> {
    let version = SdVersion::from_name(model_name)
        .ok_or_else(|| LoadError::UnsupportedModel(model_name.to_string()))?;

    info!("loading model: {model_name} (detected variant: {version:?})");

    let api = Api::new()?;
    let spec = PipelineSpec {
        model_name: model_name.to_string(),
        version,
        height,
        width,
    };
    let pipeline = SdLoader::load(spec, api, device_map).await?;
    Ok(Arc::new(pipeline))
}
