//! End-to-end generation: primary pass, optional refinement, memory swaps.

use serde::{Deserialize, Serialize};

use super::backend::{
    CallArgs, DiffusionPipeline, Generator, PipelineBackend, PipelineOutput, StepProgress,
};
use super::model_manager::PipelineManager;
use super::variant::Variant;
use crate::error::{EngineError, Result};
use crate::imaging::{decode_base64_image, refiner_dimensions, resize};
use crate::logger::redact;
use crate::{log_debug, log_info};

const DEFAULT_STEPS: u32 = 40;
const DEFAULT_GUIDANCE: f32 = 7.5;

/// Arguments of an `invoke` request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationRequest {
    pub prompt: Option<String>,
    pub negative_prompt: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub num_inference_steps: Option<u32>,
    pub guidance_scale: Option<f32>,
    pub strength: Option<f32>,
    pub num_images: Option<u32>,
    /// Base64 PNG/JPEG.
    pub image: Option<String>,
    /// Base64 PNG/JPEG. Its presence selects the inpainter.
    pub mask: Option<String>,
    pub chunking_size: Option<u32>,
    pub chunking_blur: Option<u32>,
    pub refiner_strength: Option<f32>,
    pub refiner_guidance_scale: Option<f32>,
    pub refiner_aesthetic_score: Option<f32>,
    pub refiner_negative_aesthetic_score: Option<f32>,
    /// Upscale small images to the refiner size before refining. Defaults to true.
    pub scale_to_refiner_size: Option<bool>,
}

fn random_seed() -> u64 {
    uuid::Uuid::new_v4().as_u128() as u64
}

impl<B: PipelineBackend> PipelineManager<B> {
    /// Run a request. The accelerated flag is restored on every exit path.
    pub fn generate(
        &mut self,
        request: &GenerationRequest,
        progress: &mut dyn FnMut(StepProgress),
    ) -> Result<PipelineOutput> {
        log_info!("generation", "Generating with {}", redact(&serde_json::to_value(request)?));
        let previous = self.accelerated_enabled;
        let result = self.generate_inner(request, progress);
        self.accelerated_enabled = previous;
        result
    }

    /// Fixed-shape engines cannot take smaller or non-square-to-size inputs without chunking.
    fn incompatible_geometry(&self, variant: Variant, width: u32, height: u32, chunking_size: u32) -> bool {
        let size = self.size(variant);
        width < size || height < size || ((width != size || height != size) && chunking_size == 0)
    }

    fn generate_inner(
        &mut self,
        request: &GenerationRequest,
        progress: &mut dyn FnMut(StepProgress),
    ) -> Result<PipelineOutput> {
        let image = request.image.as_deref().map(decode_base64_image).transpose()?;
        let mask = request.mask.as_deref().map(decode_base64_image).transpose()?;

        let (target, other) = if mask.is_some() {
            (Variant::Inpainter, Variant::Base)
        } else {
            (Variant::Base, Variant::Inpainter)
        };
        let policy = self.config.pipeline_switch;
        let size = self.size(target);
        let width = request.width.unwrap_or(size);
        let height = request.height.unwrap_or(size);
        if width == 0 || height == 0 {
            return Err(EngineError::Configuration(format!(
                "width and height must be positive, got {width}x{height}"
            )));
        }
        let chunking_size = request.chunking_size.unwrap_or(self.config.chunking_size);
        let chunking_blur = request.chunking_blur.unwrap_or(self.config.chunking_blur);

        if self.use_accelerated(target) && self.incompatible_geometry(target, width, height, chunking_size) {
            log_info!(
                "generation",
                "{width}x{height} does not fit the {size} engine, running without acceleration"
            );
            self.accelerated_enabled = false;
        }

        let heartbeat = self.heartbeat.start();
        self.release(other, policy)?;
        self.ensure_ready(target)?;
        heartbeat.stop();

        let args = CallArgs {
            prompt: request.prompt.clone(),
            negative_prompt: request.negative_prompt.clone(),
            width,
            height,
            num_inference_steps: request.num_inference_steps.unwrap_or(DEFAULT_STEPS),
            guidance_scale: request.guidance_scale.unwrap_or(DEFAULT_GUIDANCE),
            strength: request.strength,
            aesthetic_score: None,
            negative_aesthetic_score: None,
            num_images: request.num_images.unwrap_or(1),
            image,
            mask,
            chunking_size,
            chunking_blur,
        };
        let output = self.call_variant(target, &args, progress)?;

        if self.source(Variant::Refiner).is_none() {
            return Ok(output);
        }
        let defaults = self.config.refiner_defaults;
        // Only an explicit non-positive strength opts out of refinement
        let strength = match request.refiner_strength {
            Some(strength) if strength <= 0.0 => {
                log_debug!("generation", "Refiner strength is {strength}, skipping refinement");
                return Ok(output);
            }
            Some(strength) => strength,
            None => defaults.strength,
        };

        let heartbeat = self.heartbeat.start();
        self.release(target, policy)?;
        self.ensure_ready(Variant::Refiner)?;
        heartbeat.stop();

        let refiner_size = self.size(Variant::Refiner);
        let scale = request.scale_to_refiner_size.unwrap_or(true);
        let mut refined = Vec::with_capacity(output.images.len());

        for (index, image) in output.images.iter().enumerate() {
            if output.is_nsfw(index) {
                refined.push(image.clone());
                continue;
            }
            let (width, height) = (image.width(), image.height());
            let upscaled = if scale {
                refiner_dimensions(width, height, refiner_size)
            } else {
                None
            };
            let input = match upscaled {
                Some((w, h)) => {
                    log_debug!("generation", "Upscaling {width}x{height} to {w}x{h} for refinement");
                    resize(image, w, h)
                }
                None => image.clone(),
            };

            let args = CallArgs {
                prompt: request.prompt.clone(),
                negative_prompt: request.negative_prompt.clone(),
                width: input.width(),
                height: input.height(),
                num_inference_steps: request.num_inference_steps.unwrap_or(DEFAULT_STEPS),
                guidance_scale: request.refiner_guidance_scale.unwrap_or(defaults.guidance_scale),
                strength: Some(strength),
                aesthetic_score: Some(request.refiner_aesthetic_score.unwrap_or(defaults.aesthetic_score)),
                negative_aesthetic_score: Some(
                    request
                        .refiner_negative_aesthetic_score
                        .unwrap_or(defaults.negative_aesthetic_score),
                ),
                num_images: 1,
                image: Some(input),
                mask: None,
                chunking_size,
                chunking_blur,
            };

            // Previews are reported in the caller's coordinate space
            let mut adapted = |mut step: StepProgress| {
                if upscaled.is_some() {
                    if let Some(images) = step.images.as_mut() {
                        for preview in images.iter_mut() {
                            *preview = resize(preview, width, height);
                        }
                    }
                }
                progress(step);
            };
            let result = self.call_variant(Variant::Refiner, &args, &mut adapted)?;
            let first = result
                .images
                .into_iter()
                .next()
                .ok_or_else(|| EngineError::Pipeline("refiner returned no image".to_string()))?;
            refined.push(match upscaled {
                Some(_) => resize(&first, width, height),
                None => first,
            });
        }

        self.release(Variant::Refiner, policy)?;
        Ok(PipelineOutput {
            images: refined,
            nsfw_content_detected: output.nsfw_content_detected,
        })
    }

    fn call_variant(
        &mut self,
        variant: Variant,
        args: &CallArgs,
        progress: &mut dyn FnMut(StepProgress),
    ) -> Result<PipelineOutput> {
        let seed = self.config.seed;
        let generator = self
            .generator
            .get_or_try_init(|| Ok::<_, EngineError>(Generator::new(seed.unwrap_or_else(random_seed))))?;
        let instance = self.slots[variant.index()]
            .get_mut()
            .ok_or_else(|| EngineError::Pipeline(format!("{} pipeline is not loaded", variant.as_str())))?;
        log_debug!("generation", "Calling {} pipeline (seed {})", variant.as_str(), generator.seed());
        instance.pipeline.call(generator, args, progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::encode_png_base64;
    use crate::pipeline::dry_run::{DryRunHandle, DryRunState, SourceKind};
    use crate::pipeline::layout::test_support::TempRoot;
    use crate::pipeline::model_manager::tests::manager_with;
    use crate::pipeline::variant::{PipelineState, SwapPolicy};
    use image::{DynamicImage, Rgb, RgbImage};

    fn request(width: u32, height: u32) -> GenerationRequest {
        GenerationRequest {
            prompt: Some("a lighthouse".to_string()),
            width: Some(width),
            height: Some(height),
            ..GenerationRequest::default()
        }
    }

    fn refined_calls(handle: &DryRunHandle) -> Vec<(u32, u32, Option<(u32, u32)>)> {
        handle
            .lock()
            .calls
            .iter()
            .filter(|c| c.variant == Variant::Refiner)
            .map(|c| (c.width, c.height, c.input_size))
            .collect()
    }

    #[test]
    fn test_plain_generation() {
        let root = TempRoot::new("gen_plain");
        let (mut manager, handle) = manager_with(&root, DryRunState::default(), |_| {});
        let mut steps = 0;
        let output = manager
            .generate(&request(64, 48), &mut |_: StepProgress| steps += 1)
            .unwrap();
        assert_eq!(output.images.len(), 1);
        assert_eq!((output.images[0].width(), output.images[0].height()), (64, 48));
        assert_eq!(steps, 4);
        assert_eq!(handle.lock().calls.len(), 1);
    }

    #[test]
    fn test_refiner_strength_zero_skips_refinement() {
        let root = TempRoot::new("gen_zero");
        let (mut manager, handle) = manager_with(&root, DryRunState::default(), |c| {
            c.refiner = Some("refiner.ckpt".to_string());
        });
        let mut req = request(64, 64);
        req.refiner_strength = Some(0.0);
        let output = manager.generate(&req, &mut |_: StepProgress| {}).unwrap();

        assert!(refined_calls(&handle).is_empty());
        assert_eq!(manager.state(Variant::Refiner), PipelineState::Unloaded);
        // Base colour, untouched by the refiner
        assert_eq!(output.images[0].to_rgb8().get_pixel(0, 0), &Rgb([200, 40, 40]));
    }

    #[test]
    fn test_omitted_refiner_strength_still_refines() {
        let root = TempRoot::new("gen_default_strength");
        let (mut manager, handle) = manager_with(&root, DryRunState::default(), |c| {
            c.refiner = Some("refiner.ckpt".to_string());
            c.refiner_size = Some(64);
            c.refiner_defaults.strength = 0.0;
        });
        let output = manager.generate(&request(64, 64), &mut |_: StepProgress| {}).unwrap();

        let calls = handle.lock().calls.clone();
        let refiner: Vec<_> = calls.iter().filter(|c| c.variant == Variant::Refiner).collect();
        assert_eq!(refiner.len(), 1);
        assert_eq!(refiner[0].strength, Some(0.0));
        assert_eq!(output.images[0].to_rgb8().get_pixel(0, 0), &Rgb([40, 200, 40]));
    }

    #[test]
    fn test_zero_size_request_is_configuration_error() {
        let root = TempRoot::new("gen_zero_size");
        let (mut manager, handle) = manager_with(&root, DryRunState::default(), |c| {
            c.refiner = Some("refiner.ckpt".to_string());
        });
        let err = manager
            .generate(&request(0, 500), &mut |_: StepProgress| {})
            .unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
        assert!(handle.lock().calls.is_empty());
        assert_eq!(manager.state(Variant::Base), PipelineState::Unloaded);
    }

    #[test]
    fn test_small_images_upscaled_for_refiner_then_restored() {
        let root = TempRoot::new("gen_upscale");
        let (mut manager, handle) = manager_with(&root, DryRunState::default(), |c| {
            c.refiner = Some("refiner.ckpt".to_string());
            c.refiner_size = Some(1024);
        });
        let mut previews = Vec::new();
        let output = manager
            .generate(&request(300, 500), &mut |step: StepProgress| {
                if let Some(images) = step.images {
                    previews.push((images[0].width(), images[0].height()));
                }
            })
            .unwrap();

        assert_eq!(refined_calls(&handle), vec![(1024, 1704, Some((1024, 1704)))]);
        assert_eq!((output.images[0].width(), output.images[0].height()), (300, 500));
        assert_eq!(output.images[0].to_rgb8().get_pixel(0, 0), &Rgb([40, 200, 40]));
        // Primary preview, then the refiner preview mapped back
        assert_eq!(previews, vec![(300, 500), (300, 500)]);
        assert_eq!(manager.state(Variant::Refiner), PipelineState::Offloaded);
        assert_eq!(manager.state(Variant::Base), PipelineState::Offloaded);
    }

    #[test]
    fn test_nsfw_images_are_not_refined() {
        let root = TempRoot::new("gen_nsfw");
        let state = DryRunState {
            nsfw: vec![true, false],
            ..DryRunState::default()
        };
        let (mut manager, handle) = manager_with(&root, state, |c| {
            c.refiner = Some("refiner.ckpt".to_string());
            c.pipeline_switch = SwapPolicy::Unload;
        });
        let mut req = request(512, 512);
        req.num_images = Some(2);
        let output = manager.generate(&req, &mut |_: StepProgress| {}).unwrap();

        assert_eq!(refined_calls(&handle).len(), 1);
        assert_eq!(output.nsfw_content_detected, vec![true, false]);
        assert_eq!(output.images[0].to_rgb8().get_pixel(0, 0), &Rgb([200, 40, 40]));
        assert_eq!(output.images[1].to_rgb8().get_pixel(0, 0), &Rgb([40, 200, 40]));
        assert_eq!(manager.state(Variant::Base), PipelineState::Unloaded);
        assert_eq!(manager.state(Variant::Refiner), PipelineState::Unloaded);
    }

    #[test]
    fn test_mask_selects_inpainter_and_offloads_base() {
        let root = TempRoot::new("gen_inpaint");
        let (mut manager, handle) = manager_with(&root, DryRunState::default(), |_| {});
        manager.generate(&request(64, 64), &mut |_: StepProgress| {}).unwrap();

        let picture = DynamicImage::ImageRgb8(RgbImage::new(64, 64));
        let mut req = request(64, 64);
        req.image = Some(encode_png_base64(&picture).unwrap());
        req.mask = Some(encode_png_base64(&picture).unwrap());
        manager.generate(&req, &mut |_: StepProgress| {}).unwrap();

        assert_eq!(handle.lock().calls.last().map(|c| c.variant), Some(Variant::Inpainter));
        assert_eq!(manager.state(Variant::Base), PipelineState::Offloaded);
        assert_eq!(manager.state(Variant::Inpainter), PipelineState::Loaded);
    }

    #[test]
    fn test_small_geometry_disables_acceleration_for_one_call() {
        let root = TempRoot::new("gen_geometry");
        let state = DryRunState {
            accelerated_supported: true,
            ..DryRunState::default()
        };
        let (mut manager, handle) = manager_with(&root, state, |c| c.build_accelerated = true);

        manager.generate(&request(256, 256), &mut |_: StepProgress| {}).unwrap();
        assert!(manager.accelerated_enabled());
        assert!(!handle.lock().calls[0].accelerated);

        manager.generate(&request(512, 512), &mut |_: StepProgress| {}).unwrap();
        assert!(handle.lock().calls[1].accelerated);
        let sources: Vec<SourceKind> = handle.lock().constructions.iter().map(|c| c.source).collect();
        assert_eq!(sources.last(), Some(&SourceKind::Accelerated));
    }

    #[test]
    fn test_accelerated_flag_restored_after_failing_call() {
        let root = TempRoot::new("gen_restore");
        let state = DryRunState {
            accelerated_supported: true,
            fail_calls: true,
            ..DryRunState::default()
        };
        let (mut manager, _) = manager_with(&root, state, |c| c.build_accelerated = true);
        assert!(manager.accelerated_enabled());

        let err = manager
            .generate(&request(128, 128), &mut |_: StepProgress| {})
            .unwrap_err();
        assert!(matches!(err, EngineError::Pipeline(_)));
        assert!(manager.accelerated_enabled());
    }

    #[test]
    fn test_seed_makes_generator_deterministic() {
        let root = TempRoot::new("gen_seed");
        let (mut manager, _) = manager_with(&root, DryRunState::default(), |c| c.seed = Some(99));
        manager.generate(&request(64, 64), &mut |_: StepProgress| {}).unwrap();
        assert_eq!(manager.generator.get().map(|g| g.seed()), Some(99));
    }

    #[test]
    fn test_bad_image_is_protocol_error() {
        let root = TempRoot::new("gen_bad_image");
        let (mut manager, _) = manager_with(&root, DryRunState::default(), |_| {});
        let mut req = request(64, 64);
        req.image = Some("%%%".to_string());
        assert!(matches!(
            manager.generate(&req, &mut |_: StepProgress| {}),
            Err(EngineError::Protocol(_))
        ));
    }
}
