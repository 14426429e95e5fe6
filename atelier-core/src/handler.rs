use std::sync::{Arc, RwLock};

use tracing::{error, info};

use crate::{load_pipeline, DeviceMap, GeneratorConfig, PipelineLike};

struct Slot {
    model_name: String,
    pipeline: Option<Arc<dyn PipelineLike>>,
}

/// Owns the loaded pipeline as a single-writer resource. Generations
/// take a snapshot of the `Arc` and never hold the lock across the
/// pipeline call, so a reload can swap the slot without tearing down an
/// in-flight run.
pub struct ModelHandler {
    device_map: DeviceMap,
    height: usize,
    width: usize,
    slot: RwLock<Slot>,
}

impl ModelHandler {
    /// A handler in the "no pipeline" state; call [`load`](Self::load)
    /// to bring the configured model up.
    pub fn new(config: &GeneratorConfig) -> Self {
        Self {
            device_map: config.device,
            height: config.height,
            width: config.width,
            slot: RwLock::new(Slot {
                model_name: config.model_name.clone(),
                pipeline: None,
            }),
        }
    }

    /// Load (or reload) the pipeline for the configured model. Every
    /// failure is absorbed into the "no pipeline" state; a later load
    /// or upgrade can retry.
    pub async fn load(&self) {
        let model_name = self.model_name();
        self.reload(&model_name).await;
    }

    /// Replace the configured model identifier and re-run load. The
    /// identifier is updated even when the load fails, so the next
    /// attempt targets the new model.
    pub async fn upgrade(&self, new_model: &str) {
        self.reload(new_model).await;
        if self.is_ready() {
            info!("model upgraded to: {new_model}");
        }
    }

    async fn reload(&self, model_name: &str) {
        let loaded = load_pipeline(model_name, self.height, self.width, self.device_map).await;
        let mut slot = self.slot.write().unwrap();
        slot.model_name = model_name.to_string();
        match loaded {
            Ok(pipeline) => slot.pipeline = Some(pipeline),
            Err(err) => {
                error!("failed to load model {model_name}: {err}");
                slot.pipeline = None;
            }
        }
    }

    /// Install an already-built pipeline, replacing any current one.
    pub fn install(&self, pipeline: Arc<dyn PipelineLike>) {
        self.slot.write().unwrap().pipeline = Some(pipeline);
    }

    /// Snapshot of the current pipeline, if one is loaded.
    pub fn pipeline(&self) -> Option<Arc<dyn PipelineLike>> {
        self.slot.read().unwrap().pipeline.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.slot.read().unwrap().pipeline.is_some()
    }

    pub fn model_name(&self) -> String {
        self.slot.read().unwrap().model_name.clone()
    }
}
