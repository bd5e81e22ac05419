use std::path::PathBuf;

use anyhow::Result;
use clap::Subcommand;
use healthgpt_core::{
    GenerationParams, HLoraConfig, Int8Config, PipelineConfig, PrecisionMode, RequestConfig,
    RunConfig, TaskRouting,
};

fn parse_precision(s: &str) -> Result<PrecisionMode, String> {
    s.parse().map_err(|e: healthgpt_core::ConfigError| e.to_string())
}

#[derive(Debug, Subcommand)]
pub enum Selected {
    /// Load a model and answer one question, everything given as flags.
    Run {
        /// Backbone directory with `config.json`, `tokenizer.json` and the weights.
        #[arg(long)]
        model_name_or_path: PathBuf,

        /// Numeric precision: FP32, FP16, BF16 or INT8.
        #[arg(long, default_value = "FP32", value_parser = parse_precision)]
        dtype: PrecisionMode,

        /// Adapter rank.
        #[arg(long, default_value_t = 16)]
        hlora_r: usize,

        /// Adapter scaling numerator, the scale is `alpha / r`.
        #[arg(long, default_value_t = 32.)]
        hlora_alpha: f64,

        #[arg(long, default_value_t = 0.)]
        hlora_dropout: f32,

        /// Number of adapters attached to every linear layer.
        #[arg(long, default_value_t = 4)]
        hlora_nums: usize,

        /// Size of the visual codebook vocabulary.
        #[arg(long, default_value_t = 1024)]
        vq_idx_nums: usize,

        /// Conversation template: `phi3_instruct`, `phi4_instruct` or `plain`.
        /// Defaults to the model variant's template.
        #[arg(long)]
        instruct_template: Option<String>,

        /// CLIP vision tower directory.
        #[arg(long)]
        vit_path: Option<PathBuf>,

        /// Adapter weight file.
        #[arg(long)]
        hlora_path: Option<PathBuf>,

        /// Projector weight file.
        #[arg(long)]
        fusion_layer_path: Option<PathBuf>,

        #[arg(long)]
        question: String,

        #[arg(long)]
        img_path: Option<PathBuf>,

        /// `Analyze Image` or `Generate Image`.
        #[arg(long, default_value = "Analyze Image")]
        task: String,

        /// `HealthGPT-M3` or `HealthGPT-L14`.
        #[arg(long)]
        model_variant: Option<String>,

        /// Answer from the question alone.
        #[arg(long, default_value_t = false)]
        text_only: bool,

        #[arg(long, default_value_t = false)]
        do_sample: bool,

        #[arg(long, default_value_t = 0.)]
        temperature: f64,

        #[arg(long)]
        top_p: Option<f64>,

        #[arg(long, default_value_t = 1)]
        num_beams: usize,

        #[arg(long, default_value_t = 1024)]
        max_new_tokens: usize,

        /// Integer seed for sampling.
        #[arg(long, default_value_t = 299792458)]
        seed: u64,

        /// Use the host even when an accelerator is available.
        #[arg(long, default_value_t = false)]
        cpu: bool,
    },

    /// Read the pipeline, generation options and request from a TOML file.
    Toml {
        #[arg(short, long)]
        file: PathBuf,
    },
}

impl Selected {
    pub fn into_run_config(self) -> Result<RunConfig> {
        match self {
            Self::Toml { file } => Ok(RunConfig::from_toml_file(&file)?),
            Self::Run {
                model_name_or_path,
                dtype,
                hlora_r,
                hlora_alpha,
                hlora_dropout,
                hlora_nums,
                vq_idx_nums,
                instruct_template,
                vit_path,
                hlora_path,
                fusion_layer_path,
                question,
                img_path,
                task,
                model_variant,
                text_only,
                do_sample,
                temperature,
                top_p,
                num_beams,
                max_new_tokens,
                seed,
                cpu,
            } => Ok(RunConfig {
                pipeline: PipelineConfig {
                    model_name_or_path,
                    dtype,
                    hlora: HLoraConfig {
                        rank: hlora_r,
                        alpha: hlora_alpha,
                        dropout: hlora_dropout,
                        nums: hlora_nums,
                    },
                    vq_idx_nums,
                    instruct_template,
                    vit_path,
                    hlora_path,
                    fusion_layer_path,
                    routing: TaskRouting::default(),
                    int8: Int8Config::default(),
                    cpu,
                },
                generation: GenerationParams {
                    do_sample,
                    temperature,
                    top_p,
                    num_beams,
                    max_new_tokens,
                    seed,
                },
                request: RequestConfig {
                    task,
                    model_variant,
                    question,
                    img_path,
                    text_only,
                },
            }),
        }
    }
}
