use std::future::Future;

use hf_hub::api::tokio::Api;

use crate::{DeviceMap, LoadError, PipelineLike, SdVersion};

/// Which weights to pull and how to configure the pipeline they feed.
#[derive(Debug, Clone)]
pub struct PipelineSpec {
    pub model_name: String,
    pub version: SdVersion,
    pub height: usize,
    pub width: usize,
}

pub trait Loader {
    type Pipeline: PipelineLike;

    fn load(
        spec: PipelineSpec,
        api: Api,
        device_map: DeviceMap,
    ) -> impl Future<Output = Result<Self::Pipeline, LoadError>>
    where
        Self: Sized;
}
