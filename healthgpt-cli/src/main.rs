use anyhow::Result;
use clap::Parser;
use healthgpt_core::{
    int8_backend, run_request,
    utils::{best_device, setup_logger_and_debug},
    GenerationOutput, PipelineSources,
};
use tracing::info;

mod selected;

use selected::Selected;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    command: Selected,
}

fn main() -> Result<()> {
    let args = Args::parse();
    setup_logger_and_debug();

    let run = args.command.into_run_config()?;
    let request = run.request.to_request()?;
    // Caller mistakes surface before any file or device is touched.
    run.pipeline.validate()?;
    run.generation.validate()?;
    request.validate(run.pipeline.vit_path.is_some())?;

    let device = best_device(run.pipeline.cpu)?;
    let sources = PipelineSources::from_config(&run.pipeline)?;
    let output = run_request(
        &run.pipeline,
        sources,
        &request,
        &run.generation,
        device,
        int8_backend(),
    )?;

    if let GenerationOutput::Image { vq_indices, .. } = &output {
        info!("Generated {} visual codebook indices.", vq_indices.len());
    }
    println!("Q: {}", request.question);
    println!("HealthGPT: {}", output.text());
    Ok(())
}
