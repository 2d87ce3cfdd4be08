//! Action dispatch inside the worker process.

use serde::Deserialize;
use serde_json::{json, Value};

use super::ipc_types::{ProgressEnvelope, RequestEnvelope};
use super::worker_main::{InstructionHandler, ProgressSink};
use crate::error::{EngineError, Result};
use crate::imaging::encode_png_base64;
use crate::log_warn;
use crate::pipeline::{
    ConfigurationUpdate, EngineStatusQuery, GenerationRequest, PipelineBackend, PipelineManager, StepProgress,
    Variant,
};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct UnloadRequest {
    variant: Option<Variant>,
}

fn parse<T: for<'de> Deserialize<'de>>(action: &str, payload: &Value) -> Result<T> {
    let payload = if payload.is_null() { json!({}) } else { payload.clone() };
    serde_json::from_value(payload).map_err(|e| EngineError::Configuration(format!("bad {action} payload: {e}")))
}

fn progress_envelope(id: u64, step: StepProgress) -> ProgressEnvelope {
    let images = step.images.map(|images| {
        images
            .iter()
            .filter_map(|image| match encode_png_base64(image) {
                Ok(encoded) => Some(encoded),
                Err(e) => {
                    log_warn!("worker", "Dropping preview that failed to encode: {e}");
                    None
                }
            })
            .collect()
    });
    ProgressEnvelope {
        id,
        step: Some(step.step),
        total: Some(step.total),
        rate: step.rate,
        images,
        task: None,
    }
}

/// Serves `invoke`, `configure`, `status`, `engine_status` and `unload`.
pub struct DiffusionWorker<B: PipelineBackend> {
    manager: PipelineManager<B>,
}

impl<B: PipelineBackend> DiffusionWorker<B> {
    pub fn new(manager: PipelineManager<B>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &PipelineManager<B> {
        &self.manager
    }

    fn invoke(&mut self, payload: &Value, progress: &ProgressSink) -> Result<Value> {
        let request: GenerationRequest = parse("invoke", payload)?;
        progress.task("Generating");
        let id = progress.id();
        let output = self
            .manager
            .generate(&request, &mut |step: StepProgress| progress.emit(progress_envelope(id, step)))?;

        let images = output
            .images
            .iter()
            .map(encode_png_base64)
            .collect::<Result<Vec<_>>>()?;
        Ok(json!({
            "images": images,
            "nsfw_content_detected": output.nsfw_content_detected,
        }))
    }
}

impl<B: PipelineBackend> InstructionHandler for DiffusionWorker<B> {
    fn handle(&mut self, request: &RequestEnvelope, progress: &ProgressSink) -> Result<Value> {
        // Long loads and engine builds keep the controller informed through this request
        let sink = progress.clone();
        self.manager.set_keepalive_callback(move || sink.heartbeat());

        match request.action.as_str() {
            "invoke" => self.invoke(&request.payload, progress),
            "configure" => {
                let update = ConfigurationUpdate::from_value(request.payload.clone())?;
                let applied = self.manager.apply_configuration(update)?;
                Ok(serde_json::to_value(applied)?)
            }
            "status" => Ok(serde_json::to_value(self.manager.status())?),
            "engine_status" => {
                let query: EngineStatusQuery = parse("engine_status", &request.payload)?;
                Ok(serde_json::to_value(self.manager.engine_status(&query))?)
            }
            "unload" => {
                let unload: UnloadRequest = parse("unload", &request.payload)?;
                let unloaded: Vec<Variant> = match unload.variant {
                    Some(variant) => {
                        if self.manager.unload(variant) {
                            vec![variant]
                        } else {
                            Vec::new()
                        }
                    }
                    None => self.manager.unload_all(),
                };
                Ok(json!({ "unloaded": unloaded }))
            }
            other => Err(EngineError::Protocol(format!("unknown action '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::decode_base64_image;
    use crate::pipeline::layout::test_support::TempRoot;
    use crate::pipeline::model_manager::tests::manager_with;
    use crate::pipeline::DryRunState;
    use crate::worker::channel::MessageChannel;

    fn request(id: u64, action: &str, payload: Value) -> RequestEnvelope {
        RequestEnvelope {
            id,
            action: action.to_string(),
            payload,
        }
    }

    fn worker(root: &TempRoot) -> DiffusionWorker<crate::pipeline::DryRunBackend> {
        let (manager, _) = manager_with(root, DryRunState::default(), |_| {});
        DiffusionWorker::new(manager)
    }

    fn progress_of(channel: &MessageChannel) -> Vec<ProgressEnvelope> {
        channel
            .drain()
            .iter()
            .map(|raw| serde_json::from_str(raw).unwrap())
            .collect()
    }

    #[test]
    fn test_invoke_returns_images_and_progress() {
        let root = TempRoot::new("handler_invoke");
        let mut worker = worker(&root);
        let channel = MessageChannel::new();
        let sink = ProgressSink::new(channel.clone(), 7);

        let result = worker
            .handle(&request(7, "invoke", json!({"prompt": "a fox", "width": 32, "height": 16})), &sink)
            .unwrap();

        let images = result["images"].as_array().unwrap();
        assert_eq!(images.len(), 1);
        let image = decode_base64_image(images[0].as_str().unwrap()).unwrap();
        assert_eq!((image.width(), image.height()), (32, 16));
        assert_eq!(result["nsfw_content_detected"], json!([false]));

        let progress = progress_of(&channel);
        assert_eq!(progress[0].task.as_deref(), Some("Generating"));
        assert!(progress.iter().all(|p| p.id == 7));
        let last = progress.last().unwrap();
        assert_eq!((last.step, last.total), (Some(4), Some(4)));
        assert_eq!(last.images.as_ref().map(Vec::len), Some(1));
    }

    #[test]
    fn test_configure_and_status() {
        let root = TempRoot::new("handler_configure");
        let mut worker = worker(&root);
        let sink = ProgressSink::new(MessageChannel::new(), 1);

        let applied = worker
            .handle(&request(1, "configure", json!({"chunking_size": 32})), &sink)
            .unwrap();
        assert_eq!(applied["changed"], json!(["chunking_size"]));

        let status = worker.handle(&request(2, "status", Value::Null), &sink).unwrap();
        assert_eq!(status["variants"].as_array().unwrap().len(), 3);
        assert_eq!(worker.manager().config().chunking_size, 32);
    }

    #[test]
    fn test_bad_payloads_are_configuration_errors() {
        let root = TempRoot::new("handler_bad");
        let mut worker = worker(&root);
        let sink = ProgressSink::new(MessageChannel::new(), 1);

        let err = worker
            .handle(&request(1, "invoke", json!({"width": "wide"})), &sink)
            .unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));

        let err = worker
            .handle(&request(2, "engine_status", json!({"size": 512})), &sink)
            .unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[test]
    fn test_engine_status_action() {
        let root = TempRoot::new("handler_engine_status");
        let mut worker = worker(&root);
        let sink = ProgressSink::new(MessageChannel::new(), 1);
        let status = worker
            .handle(&request(1, "engine_status", json!({"model": "sd15.ckpt"})), &sink)
            .unwrap();
        assert_eq!(status["supported"], json!(false));
        assert_eq!(status["ready"], json!(false));
    }

    #[test]
    fn test_unload_single_and_all() {
        let root = TempRoot::new("handler_unload");
        let mut worker = worker(&root);
        let sink = ProgressSink::new(MessageChannel::new(), 1);
        worker.handle(&request(1, "invoke", json!({"width": 16, "height": 16})), &sink).unwrap();

        let result = worker.handle(&request(2, "unload", json!({"variant": "refiner"})), &sink).unwrap();
        assert_eq!(result["unloaded"], json!([]));
        let result = worker.handle(&request(3, "unload", Value::Null), &sink).unwrap();
        assert_eq!(result["unloaded"], json!(["base"]));
    }

    #[test]
    fn test_unknown_action() {
        let root = TempRoot::new("handler_unknown");
        let mut worker = worker(&root);
        let sink = ProgressSink::new(MessageChannel::new(), 1);
        let err = worker.handle(&request(1, "dance", Value::Null), &sink).unwrap_err();
        assert!(matches!(err, EngineError::Protocol(_)));
    }
}
