//! Diffusion engine CLI.
//!
//! Runs as the controller by default. With `--worker` the same binary
//! becomes the worker process, speaking JSON lines on stdin/stdout.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

use diffusion_engine::config::load_config;
use diffusion_engine::error::EngineError;
use diffusion_engine::imaging::{decode_base64_image, encode_png_base64};
use diffusion_engine::pipeline::{ConfigurationUpdate, GenerationRequest};
use diffusion_engine::worker::worker_main::run_worker_process;
use diffusion_engine::worker::{ChildProcessLauncher, Dispatcher};
use diffusion_engine::{log_error, log_info};

/// How often `invoke` reports progress while waiting.
const PROGRESS_POLL: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(name = "diffusion-engine")]
#[command(about = "Run diffusion pipelines in a supervised worker process")]
struct Cli {
    /// Run as the worker process (used internally by the controller)
    #[arg(long, hide = true)]
    worker: bool,

    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Seconds to wait for each reply; waits forever when omitted
    #[arg(long, global = true)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the worker and check that it answers
    Ping,
    /// Report configuration and pipeline residency
    Status,
    /// Check whether compiled engines exist for a model
    EngineStatus {
        model: String,
        #[arg(long)]
        size: Option<u32>,
    },
    /// Apply a partial configuration update given as JSON
    Configure { json: String },
    /// Generate images
    Invoke {
        prompt: String,
        #[arg(long)]
        negative_prompt: Option<String>,
        #[arg(long)]
        width: Option<u32>,
        #[arg(long)]
        height: Option<u32>,
        #[arg(long)]
        steps: Option<u32>,
        /// Input image for image-to-image
        #[arg(long)]
        image: Option<PathBuf>,
        /// Inpainting mask; selects the inpainter
        #[arg(long)]
        mask: Option<PathBuf>,
        /// Output prefix; images are written as <out>-<n>.png
        #[arg(long, default_value = "output")]
        out: String,
        /// Print progress while generating
        #[arg(long)]
        progress: bool,
    },
}

fn read_image_base64(path: &Path) -> anyhow::Result<String> {
    let image = image::open(path).with_context(|| format!("cannot read image {}", path.display()))?;
    Ok(encode_png_base64(&image)?)
}

fn invoke(
    dispatcher: &Dispatcher,
    request: &GenerationRequest,
    out: &str,
    show_progress: bool,
    timeout: Option<Duration>,
) -> anyhow::Result<()> {
    let id = dispatcher.dispatch("invoke", serde_json::to_value(request)?)?;
    let start = std::time::Instant::now();

    let result = loop {
        match dispatcher.wait(id, Some(PROGRESS_POLL)) {
            Ok(result) => break result,
            Err(EngineError::Timeout(_)) => {
                if let Some(limit) = timeout {
                    if start.elapsed() >= limit {
                        bail!("no result after {limit:?}");
                    }
                }
                if show_progress {
                    if let Some(p) = dispatcher.last_progress(id) {
                        match (p.step, p.total) {
                            (Some(step), Some(total)) => eprintln!("step {step}/{total}"),
                            _ => {
                                if let Some(task) = p.task {
                                    eprintln!("{task}...");
                                }
                            }
                        }
                    }
                }
            }
            Err(e) => return Err(e.into()),
        }
    };

    let images = result["images"].as_array().cloned().unwrap_or_default();
    let flags = result["nsfw_content_detected"].as_array().cloned().unwrap_or_default();
    for (index, encoded) in images.iter().enumerate() {
        let Some(encoded) = encoded.as_str() else {
            bail!("image {index} is not a string");
        };
        let path = format!("{out}-{index}.png");
        decode_base64_image(encoded)?
            .save(&path)
            .with_context(|| format!("cannot write {path}"))?;
        let nsfw = flags.get(index).and_then(Value::as_bool).unwrap_or(false);
        println!("{path}{}", if nsfw { " (nsfw)" } else { "" });
    }
    Ok(())
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref())?;

    if cli.worker {
        run_worker_process(config)?;
        return Ok(());
    }

    let Some(command) = cli.command else {
        bail!("no command given, see --help");
    };

    let mut launcher = ChildProcessLauncher::current_exe()?;
    if let Some(path) = &cli.config {
        launcher = launcher.arg("--config").arg(path);
    }
    let dispatcher = Dispatcher::new(launcher, config.supervisor);
    let timeout = cli.timeout.map(Duration::from_secs);

    match command {
        Commands::Ping => {
            let reply = dispatcher.invoke("ping", Value::Null, timeout)?;
            println!("{reply}");
        }
        Commands::Status => {
            let status = dispatcher.status(timeout)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::EngineStatus { model, size } => {
            let status = dispatcher.invoke("engine_status", json!({"model": model, "size": size}), timeout)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Configure { json } => {
            let update = ConfigurationUpdate::from_value(serde_json::from_str(&json)?)?;
            let applied = dispatcher.configure(&update, timeout)?;
            println!("{}", serde_json::to_string_pretty(&applied)?);
        }
        Commands::Invoke {
            prompt,
            negative_prompt,
            width,
            height,
            steps,
            image,
            mask,
            out,
            progress,
        } => {
            let request = GenerationRequest {
                prompt: Some(prompt),
                negative_prompt,
                width,
                height,
                num_inference_steps: steps,
                image: image.as_deref().map(read_image_base64).transpose()?,
                mask: mask.as_deref().map(read_image_base64).transpose()?,
                ..GenerationRequest::default()
            };
            invoke(&dispatcher, &request, &out, progress, timeout)?;
        }
    }

    dispatcher.terminate()?;
    log_info!("cli", "Done");
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        log_error!("cli", "{e:#}");
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
