use std::{
    collections::HashMap,
    path::Path,
    sync::{atomic::Ordering, Arc},
};

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use healthgpt_lora::{
    AdapterSelector, CheckpointOverlay, HLoraConfig, NamedParams, OverlayReport, TargetModules,
};
use healthgpt_quant::QuantizationBackend;
use serde::de::DeserializeOwned;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

pub mod chat_template;
pub mod generation;
pub mod inputs;

use chat_template::{ConversationTemplate, Role};
use generation::{GenerationOutput, GenerationParams, LanguageModel};
use inputs::tokenize_with_image;

use crate::{
    models::phi3::{self, Model},
    precision::{
        checkpoint::{CheckpointSource, LoadTarget, SafetensorsCheckpoint},
        placement::{LeafPlacement, PlacementState},
        PrecisionManager,
    },
    request::{InferenceRequest, ModelVariant, Task, TaskRouting},
    vision_models::{
        clip::{ClipVisionConfig, ClipVisionTower},
        fuse,
        image_processor::ClipImageProcessor,
        preprocessor_config::PreProcessorConfig,
        projector::{MmProjector, ProjectorKind},
        MultimodalConfig, VisionFusion,
    },
    vocab::{VocabularyExtension, IMAGE_TOKEN},
    ConfigError, LoadError, PipelineConfig, PipelineError, Result, TextTokenizer, DEBUG,
};

/// End tokens used by the supported chat formats, added to the stop set when the
/// tokenizer knows them.
const KNOWN_END_TOKENS: [&str; 3] = ["<|endoftext|>", "<|end|>", "<|im_end|>"];

/// Where the vision tower comes from.
pub struct VisionSources {
    pub config: ClipVisionConfig,
    pub preprocessor: PreProcessorConfig,
    pub checkpoint: Box<dyn CheckpointSource>,
}

/// Everything a pipeline is built from, before any tensor is loaded.
pub struct PipelineSources {
    pub backbone_config: phi3::Config,
    pub multimodal: MultimodalConfig,
    pub backbone: Box<dyn CheckpointSource>,
    pub tokenizer: Box<dyn TextTokenizer>,
    pub vision: Option<VisionSources>,
    /// Adapter weights.
    pub hlora: Option<Box<dyn CheckpointSource>>,
    /// Projector weights.
    pub fusion: Option<Box<dyn CheckpointSource>>,
}

fn read_json<T: DeserializeOwned>(path: &Path) -> std::result::Result<T, LoadError> {
    let raw = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| LoadError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn boxed(path: &Path) -> std::result::Result<Box<dyn CheckpointSource>, LoadError> {
    Ok(Box::new(SafetensorsCheckpoint::from_path(path)?))
}

impl PipelineSources {
    /// Resolve the files named by `config`. Only configuration files are read here.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let root = &config.model_name_or_path;
        let config_path = root.join("config.json");
        let backbone_config: phi3::Config = read_json(&config_path)?;
        let multimodal: MultimodalConfig = read_json(&config_path)?;
        let tokenizer = Tokenizer::from_file(root.join("tokenizer.json"))
            .map_err(|e| PipelineError::Tokenizer(e.to_string()))?;

        let vision = match &config.vit_path {
            Some(vit) => {
                let preprocessor_path = vit.join("preprocessor_config.json");
                let preprocessor = if preprocessor_path.exists() {
                    PreProcessorConfig::from_file(&preprocessor_path)?
                } else {
                    warn!(
                        "`{}` not found, using the CLIP preprocessing defaults.",
                        preprocessor_path.display()
                    );
                    PreProcessorConfig::default()
                };
                Some(VisionSources {
                    config: ClipVisionConfig::from_file(&vit.join("config.json"))?,
                    preprocessor,
                    checkpoint: boxed(vit)?,
                })
            }
            None => None,
        };

        Ok(Self {
            backbone_config,
            multimodal,
            backbone: boxed(root)?,
            tokenizer: Box::new(tokenizer),
            vision,
            hlora: config.hlora_path.as_deref().map(boxed).transpose()?,
            fusion: config.fusion_layer_path.as_deref().map(boxed).transpose()?,
        })
    }
}

/// The backbone and, when present, the projector, as one overlay target.
struct OverlayTarget<'a> {
    model: &'a mut Model,
    projector: Option<&'a mut MmProjector>,
}

impl NamedParams for OverlayTarget<'_> {
    fn visit_params_mut(
        &mut self,
        f: &mut dyn FnMut(&str, &mut Tensor) -> candle_core::Result<()>,
    ) -> candle_core::Result<()> {
        self.model.visit_params_mut(f)?;
        if let Some(projector) = self.projector.as_mut() {
            projector.visit_params_mut(f)?;
        }
        Ok(())
    }
}

/// A loaded model ready to answer requests. One request runs at a time.
pub struct HealthGptPipeline {
    model: Model,
    vision: Option<VisionFusion>,
    tokenizer: Box<dyn TextTokenizer>,
    vocab: VocabularyExtension,
    selector: AdapterSelector,
    routing: TaskRouting,
    precision: PrecisionManager,
    placement: PlacementState,
    instruct_template: Option<String>,
    overlay: OverlayReport,
    bos: Option<u32>,
    eos: Vec<u32>,
}

impl HealthGptPipeline {
    /// Load in order: precision, backbone, vision tower, vocabulary, adapters, overlays.
    pub fn load(
        config: &PipelineConfig,
        sources: PipelineSources,
        device: Device,
        backend: Option<Arc<dyn QuantizationBackend>>,
    ) -> Result<Self> {
        config.validate()?;
        if sources.multimodal.mm_vision_select_feature != "patch" {
            return Err(ConfigError::Invalid {
                name: "mm_vision_select_feature",
                reason: format!(
                    "`{}` is not supported, only `patch`",
                    sources.multimodal.mm_vision_select_feature
                ),
            }
            .into());
        }
        let precision = PrecisionManager::new(config.dtype, config.int8, device, backend)?;
        let profile = *precision.profile();
        let model_err = |e: candle_core::Error| {
            if profile.quantized {
                PipelineError::QuantizedLoad(LoadError::Candle(e))
            } else {
                PipelineError::Load(LoadError::Candle(e))
            }
        };

        let (mut weights, placement) = precision.load_weights(&*sources.backbone)?;
        let projector_names: Vec<String> = weights
            .keys()
            .filter(|n| n.starts_with(MmProjector::PREFIX))
            .cloned()
            .collect();
        let projector_weights: HashMap<String, Tensor> = projector_names
            .into_iter()
            .filter_map(|n| weights.remove_entry(&n))
            .collect();
        let vb = VarBuilder::from_tensors(weights, profile.compute_dtype, precision.device());
        let mut model = Model::new(&sources.backbone_config, vb).map_err(model_err)?;
        precision.quantize_backbone(&mut model)?;

        let mut vision = match sources.vision {
            Some(vs) => Some(Self::load_vision(
                &precision,
                vs,
                &sources.multimodal,
                sources.backbone_config.hidden_size,
            )?),
            None => None,
        };

        let mut tokenizer = sources.tokenizer;
        let vocab = VocabularyExtension::extend(&mut *tokenizer, &mut model, config.vq_idx_nums)?;

        let selector = AdapterSelector::new(config.hlora.nums)?;
        model.attach_adapters(&TargetModules::all_linear(), &config.hlora, &selector)?;

        let overlay = Self::apply_overlays(
            &mut model,
            vision.as_mut().map(VisionFusion::projector_mut),
            projector_weights,
            [sources.fusion, sources.hlora].into_iter().flatten(),
            &config.hlora,
        )?;
        if let Some(fusion) = vision.as_mut() {
            let mut expected = Vec::new();
            fusion
                .projector_mut()
                .visit_params_mut(&mut |name, _| {
                    expected.push(name.to_string());
                    Ok(())
                })
                .map_err(LoadError::Candle)?;
            let missing = overlay.missing(&expected);
            if !missing.is_empty() {
                return Err(LoadError::MissingProjectorWeights { missing }.into());
            }
        }
        precision.release_device_cache();

        let mut eos = sources.backbone_config.eos_tokens();
        for token in KNOWN_END_TOKENS {
            if let Some(id) = tokenizer.token_to_id(token) {
                if !eos.contains(&id) {
                    eos.push(id);
                }
            }
        }
        info!(
            "Pipeline ready: {} on {:?}, {} adapters, {} vision tower.",
            profile.mode,
            precision.device(),
            config.hlora.nums,
            if vision.is_some() { "with" } else { "without" }
        );

        Ok(Self {
            model,
            vision,
            tokenizer,
            vocab,
            selector,
            routing: config.routing,
            precision,
            placement,
            instruct_template: config.instruct_template.clone(),
            overlay,
            bos: sources.backbone_config.bos_token_id,
            eos,
        })
    }

    fn load_vision(
        precision: &PrecisionManager,
        sources: VisionSources,
        multimodal: &MultimodalConfig,
        text_hidden: usize,
    ) -> Result<VisionFusion> {
        let mut weights = sources
            .checkpoint
            .load(&LoadTarget::Host, DType::F32)?;
        weights.retain(|name, _| name.starts_with(ClipVisionTower::PREFIX));
        let vb = VarBuilder::from_tensors(weights, DType::F32, &Device::Cpu);
        let mut tower =
            ClipVisionTower::new(vb, &sources.config, multimodal.mm_vision_select_layer)
                .map_err(LoadError::Candle)?;

        let kind: ProjectorKind = multimodal
            .mm_projector_type
            .parse()
            .map_err(|reason| ConfigError::Invalid {
                name: "mm_projector_type",
                reason,
            })?;
        let vision_hidden = multimodal.mm_hidden_size.unwrap_or(sources.config.hidden_size);
        let mut projector =
            MmProjector::new(kind, vision_hidden, text_hidden, DType::F32, &Device::Cpu)
                .map_err(LoadError::Candle)?;

        let dtype = precision.profile().vision_dtype();
        if precision.profile().quantized {
            info!("INT8 keeps the vision tower and projector in {dtype:?}.");
        }
        precision.place_best_effort(&mut tower, dtype, "the vision tower");
        precision.place_best_effort(&mut projector, dtype, "the projector");
        Ok(VisionFusion::new(
            tower,
            projector,
            ClipImageProcessor::new(sources.preprocessor),
        ))
    }

    /// Projector weights from the backbone checkpoint first, then every extra file in order.
    fn apply_overlays(
        model: &mut Model,
        projector: Option<&mut MmProjector>,
        projector_weights: HashMap<String, Tensor>,
        files: impl Iterator<Item = Box<dyn CheckpointSource>>,
        hlora: &HLoraConfig,
    ) -> Result<OverlayReport> {
        let overlay = CheckpointOverlay::new()?;
        let mut target = OverlayTarget { model, projector };
        let mut report = OverlayReport::default();
        if !projector_weights.is_empty() {
            report.merge(overlay.apply(&mut target, projector_weights, hlora.nums)?);
        }
        for file in files {
            info!("Overlaying `{}`.", file.describe());
            let tensors = file.load(&LoadTarget::Host, DType::F32)?;
            report.merge(overlay.apply(&mut target, tensors, hlora.nums)?);
        }
        Ok(report)
    }

    pub fn placement_state(&self) -> PlacementState {
        self.placement
    }

    pub fn precision(&self) -> &PrecisionManager {
        &self.precision
    }

    pub fn vocabulary(&self) -> &VocabularyExtension {
        &self.vocab
    }

    pub fn overlay_report(&self) -> &OverlayReport {
        &self.overlay
    }

    pub fn tokenizer(&self) -> &dyn TextTokenizer {
        &*self.tokenizer
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn vision(&self) -> Option<&VisionFusion> {
        self.vision.as_ref()
    }

    pub fn eos_tokens(&self) -> &[u32] {
        &self.eos
    }

    /// Device, dtype and representation of every leaf of the backbone, tower and projector.
    pub fn placements(&self) -> Vec<LeafPlacement> {
        let mut leaves = self.model.placements();
        if let Some(vision) = &self.vision {
            leaves.extend(vision.placements());
        }
        leaves
    }

    /// Activate the adapter routed to `task`.
    pub fn select_adapter(&self, task: Task) -> std::result::Result<usize, ConfigError> {
        let index = self.routing.adapter_for(task);
        self.selector
            .select(index)
            .map_err(|_| ConfigError::AdapterOutOfRange {
                task,
                index,
                nums: self.selector.nums(),
            })?;
        debug!("Task `{task}` uses adapter {index}.");
        Ok(index)
    }

    pub fn template_for(
        &self,
        variant: ModelVariant,
    ) -> std::result::Result<&'static ConversationTemplate, ConfigError> {
        let name = self
            .instruct_template
            .as_deref()
            .unwrap_or(variant.default_template());
        ConversationTemplate::by_name(name)
    }

    /// The question as a single user turn, with the image placeholder on its own line
    /// first when an image is present, followed by an open assistant turn.
    pub fn build_prompt(
        template: &'static ConversationTemplate,
        question: &str,
        has_image: bool,
    ) -> Result<String> {
        let user = if has_image {
            format!("{IMAGE_TOKEN}\n{question}")
        } else {
            question.to_string()
        };
        let mut conv = template.conversation();
        conv.append_message(Role::User, Some(user));
        conv.append_message(Role::Assistant, None);
        Ok(conv.get_prompt()?)
    }

    pub fn generate(
        &mut self,
        request: &InferenceRequest,
        params: &GenerationParams,
    ) -> Result<GenerationOutput> {
        params.validate()?;
        request.validate(self.vision.is_some())?;
        let template = self.template_for(request.model_variant)?;
        self.select_adapter(request.task)?;

        let fusion = match (&request.image, &self.vision) {
            (Some(bytes), Some(fusion)) => Some((bytes, fusion)),
            (Some(_), None) => return Err(ConfigError::VisionTowerMissing.into()),
            (None, _) => None,
        };

        let prompt = Self::build_prompt(template, &request.question, fusion.is_some())?;
        let bos = self.bos.filter(|_| template.add_bos);
        let image_token_id = self.vocab.image_token_id;
        let ids = tokenize_with_image(&prompt, &*self.tokenizer, image_token_id, bos)?;
        if DEBUG.load(Ordering::Relaxed) {
            debug!("Prompt: {prompt:?}");
            debug!("Prompt ids: {ids:?}");
        }
        // The question itself may carry a placeholder. Reject it before any image work.
        let placeholders = ids.iter().filter(|&&id| id == image_token_id).count();
        if placeholders != usize::from(fusion.is_some()) {
            return Err(ConfigError::PlaceholderCount(placeholders).into());
        }

        let vision = match fusion {
            Some((bytes, fusion)) => {
                let image = image::load_from_memory(bytes)?;
                Some(fusion.encode(&image)?)
            }
            None => None,
        };

        let device = self.model.device().clone();
        let model = &self.model;
        let fused = fuse(&ids, image_token_id, |t| model.embed(t), vision.as_ref(), &device)?;
        if let (Some(span), Some(vision)) = (&fused.image_span, &vision) {
            debug!(
                "Image {}x{} fused at positions {span:?}, {} positions in total.",
                vision.image_size.0, vision.image_size.1, fused.seq_len
            );
        }

        let tokens = generation::generate(&mut self.model, &fused.embeds, params, &self.eos)
            .map_err(PipelineError::Generation)?;
        let text = self.tokenizer.decode(&tokens, true)?.trim().to_string();
        Ok(match request.task {
            Task::Analyze => GenerationOutput::Text(text),
            Task::Generate => GenerationOutput::Image {
                text,
                vq_indices: self.vocab.vq_indices(&tokens),
            },
        })
    }
}

/// Validate, load and answer one request. Nothing is loaded when the request itself is
/// invalid.
pub fn run_request(
    config: &PipelineConfig,
    sources: PipelineSources,
    request: &InferenceRequest,
    params: &GenerationParams,
    device: Device,
    backend: Option<Arc<dyn QuantizationBackend>>,
) -> Result<GenerationOutput> {
    config.validate()?;
    params.validate()?;
    request.validate(sources.vision.is_some())?;
    config.template_for(request.model_variant)?;
    let mut pipeline = HealthGptPipeline::load(config, sources, device, backend)?;
    pipeline.generate(request, params)
}
