use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tams_imagine::app::App;
use tams_imagine::cancel::cancel_pair;
use tams_imagine::config::Config;
use tams_imagine::models::GenerationParams;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "tams-imagine")]
#[command(about = "Generate images with the Tensor Art TAMS API")]
struct CliArgs {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate an image from a text prompt.
    Imagine {
        prompt: String,

        /// Where to write the image. Defaults to `imagine.<ext>` for the
        /// image type actually returned.
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[arg(long)]
        model: Option<String>,

        #[arg(long, value_parser = parse_size_arg)]
        size: Option<(u32, u32)>,

        #[arg(long)]
        steps: Option<u32>,

        #[arg(long)]
        seed: Option<u64>,

        #[arg(long)]
        negative: Option<String>,
    },
    /// List available models.
    Models {
        #[arg(long, default_value_t = 1)]
        page: u32,

        #[arg(long, default_value_t = 10)]
        page_size: u32,

        #[arg(long, default_value = "CHECKPOINT")]
        model_type: String,
    },
    /// Show details for one model.
    Model { id: String },
}

fn parse_size_arg(input: &str) -> std::result::Result<(u32, u32), String> {
    let invalid = || format!("Invalid size '{}'. Expected format: WIDTHxHEIGHT", input);
    let (w, h) = input.split_once(['x', 'X']).ok_or_else(invalid)?;
    let width: u32 = w.trim().parse().map_err(|_| invalid())?;
    let height: u32 = h.trim().parse().map_err(|_| invalid())?;
    if width == 0 || height == 0 {
        return Err(invalid());
    }
    Ok((width, height))
}

fn default_output(mime: &str) -> PathBuf {
    let ext = match mime {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "bin",
    };
    PathBuf::from(format!("imagine.{}", ext))
}

fn apply_overrides(
    mut params: GenerationParams,
    model: Option<String>,
    size: Option<(u32, u32)>,
    steps: Option<u32>,
    seed: Option<u64>,
    negative: Option<String>,
) -> GenerationParams {
    if let Some(model) = model {
        params.model_id = model;
    }
    if let Some((width, height)) = size {
        params.width = width;
        params.height = height;
    }
    if let Some(steps) = steps {
        params.steps = steps;
    }
    if seed.is_some() {
        params.seed = seed;
    }
    if let Some(negative) = negative {
        params.negative_prompt = negative;
    }
    params
}

async fn run(command: Command) -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    let app = App::new(config).context("Failed to initialize application")?;

    match command {
        Command::Imagine {
            prompt,
            output,
            model,
            size,
            steps,
            seed,
            negative,
        } => {
            let (handle, signal) = cancel_pair();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, cancelling generation");
                    handle.cancel();
                }
            });

            let params = apply_overrides(app.default_params(), model, size, steps, seed, negative);
            match app.imagine(&prompt, params, signal).await {
                Ok(image) => {
                    let output = output.unwrap_or_else(|| default_output(image.mime));
                    tokio::fs::write(&output, &image.bytes)
                        .await
                        .with_context(|| format!("Failed to write {}", output.display()))?;
                    info!(
                        "Saved {} byte {} image to {}",
                        image.bytes.len(),
                        image.mime,
                        output.display()
                    );
                    println!("{}", output.display());
                }
                Err(e) => {
                    error!("Generation failed: {}", e);
                    anyhow::bail!(e.user_message());
                }
            }
        }
        Command::Models {
            page,
            page_size,
            model_type,
        } => {
            let models = app.list_models(page, page_size, &model_type).await?;
            if models.is_empty() {
                println!("No models found.");
            }
            for model in models {
                println!("{}\t{}\t{}", model.id, model.model_type, model.name);
            }
        }
        Command::Model { id } => {
            let model = app.model_details(&id).await?;
            println!("{}", serde_json::to_string_pretty(&model)?);
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tams_imagine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = CliArgs::parse();

    info!("Starting tams-imagine");

    if let Err(e) = run(args.command).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_arg_valid() {
        assert_eq!(parse_size_arg("512x768").unwrap(), (512, 768));
        assert_eq!(parse_size_arg("1024X1024").unwrap(), (1024, 1024));
    }

    #[test]
    fn test_parse_size_arg_invalid() {
        for input in ["512", "axb", "0x512", "512x"] {
            let err = parse_size_arg(input).unwrap_err();
            assert!(err.contains("WIDTHxHEIGHT"), "{}", input);
        }
    }

    #[test]
    fn test_overrides_only_touch_given_fields() {
        let params = apply_overrides(
            GenerationParams::default(),
            None,
            Some((512, 512)),
            None,
            Some(42),
            None,
        );
        assert_eq!(params.width, 512);
        assert_eq!(params.seed, Some(42));
        assert_eq!(params.steps, GenerationParams::default().steps);
        assert_eq!(params.model_id, GenerationParams::default().model_id);
    }

    #[test]
    fn test_default_output_follows_image_type() {
        assert_eq!(default_output("image/jpeg"), PathBuf::from("imagine.jpg"));
        assert_eq!(default_output("image/png"), PathBuf::from("imagine.png"));
        assert_eq!(default_output("image/webp"), PathBuf::from("imagine.webp"));
        assert_eq!(default_output("application/octet-stream"), PathBuf::from("imagine.bin"));
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let args = CliArgs::try_parse_from(["tams-imagine", "imagine", "a red fox", "--size", "512x512"])
            .unwrap();
        assert!(matches!(
            args.command,
            Command::Imagine { size: Some((512, 512)), output: None, .. }
        ));

        let args =
            CliArgs::try_parse_from(["tams-imagine", "imagine", "a red fox", "-o", "fox.png"]).unwrap();
        assert!(
            matches!(args.command, Command::Imagine { output: Some(ref path), .. } if path == &PathBuf::from("fox.png"))
        );

        let args = CliArgs::try_parse_from(["tams-imagine", "models", "--page-size", "5"]).unwrap();
        assert!(matches!(args.command, Command::Models { page: 1, page_size: 5, .. }));
    }
}
