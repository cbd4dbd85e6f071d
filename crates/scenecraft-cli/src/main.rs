//! `scenecraft` command line front end

mod input;

use anyhow::{Context as _, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use input::{ArgsCollector, LineCollector};
use scenecraft_core::{
    EngineConfig, InputCollector, PipelineVariant, RunError, RunJournal, SceneOrchestrator,
    Services,
};
use scenecraft_providers::{McpCapabilityProvider, OllamaClient};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("scenecraft")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Feedback-driven 3D scene construction in Blender")
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .global(true)
                .default_value("pretty")
                .value_parser(["pretty", "json"])
                .help("Log output format"),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("run")
                .about("Build a scene from a description and/or reference image")
                .arg(config_arg())
                .arg(
                    Arg::new("prompt")
                        .long("prompt")
                        .short('p')
                        .help("Scene description; asked on stdin when neither --prompt nor --image is given"),
                )
                .arg(
                    Arg::new("image")
                        .long("image")
                        .short('i')
                        .value_parser(value_parser!(PathBuf))
                        .help("Reference image"),
                )
                .arg(
                    Arg::new("variant")
                        .long("variant")
                        .value_parser(["code-first", "tool-planned"])
                        .help("Stage sequence to run"),
                )
                .arg(
                    Arg::new("iterations")
                        .long("iterations")
                        .value_parser(value_parser!(u32))
                        .help("Feedback passes after the first"),
                )
                .arg(
                    Arg::new("render-path")
                        .long("render-path")
                        .value_parser(value_parser!(PathBuf))
                        .help("Where the render is written"),
                )
                .arg(
                    Arg::new("journal-dir")
                        .long("journal-dir")
                        .value_parser(value_parser!(PathBuf))
                        .help("Write a run journal under this directory"),
                )
                .arg(
                    Arg::new("model-url")
                        .long("model-url")
                        .env("SCENECRAFT_MODEL_URL")
                        .help("Ollama base URL"),
                )
                .arg(
                    Arg::new("sandbox")
                        .long("sandbox")
                        .action(ArgAction::SetTrue)
                        .help("Launch the capability server inside the sandbox program"),
                ),
        )
        .subcommand(
            Command::new("check-config")
                .about("Validate a configuration file and print the effective settings")
                .arg(config_arg()),
        )
        .subcommand(
            Command::new("verify-journal")
                .about("Verify the hash chain of a run journal")
                .arg(
                    Arg::new("path")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("journal.jsonl file or run directory"),
                ),
        )
}

fn config_arg() -> Arg {
    Arg::new("config")
        .long("config")
        .short('c')
        .env("SCENECRAFT_CONFIG")
        .value_parser(value_parser!(PathBuf))
        .help("TOML configuration file")
}

fn init_logging(format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(args: &ArgMatches) -> Result<EngineConfig> {
    match args.get_one::<PathBuf>("config") {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

/// Command line values take precedence over the file
fn apply_overrides(config: &mut EngineConfig, args: &ArgMatches) -> Result<()> {
    if let Some(variant) = args.get_one::<String>("variant") {
        config.variant = variant.parse::<PipelineVariant>()?;
    }
    if let Some(iterations) = args.get_one::<u32>("iterations") {
        config.feedback.iterations = *iterations;
    }
    if let Some(path) = args.get_one::<PathBuf>("render-path") {
        config.render_path.clone_from(path);
    }
    if let Some(dir) = args.get_one::<PathBuf>("journal-dir") {
        config.journal_dir = Some(dir.clone());
    }
    if let Some(url) = args.get_one::<String>("model-url") {
        config.models.base_url.clone_from(url);
    }
    if args.get_flag("sandbox") {
        config.capabilities.sandbox.enabled = true;
    }
    Ok(())
}

async fn run(args: &ArgMatches) -> Result<ExitCode> {
    let mut config = load_config(args)?;
    apply_overrides(&mut config, args)?;

    let model = OllamaClient::new(config.models.base_url.clone())?;
    let provider = Arc::new(McpCapabilityProvider::from_config(&config.capabilities));
    let services = Services::new(Arc::new(model), provider.clone(), &config.capabilities);
    let orchestrator = SceneOrchestrator::new(config, services)?;

    let prompt = args.get_one::<String>("prompt").cloned();
    let image = args.get_one::<PathBuf>("image").cloned();
    let collector: Box<dyn InputCollector> = if prompt.is_some() || image.is_some() {
        Box::new(ArgsCollector::new(
            prompt.unwrap_or_default(),
            image.map(|p| p.to_string_lossy().into_owned()).unwrap_or_default(),
        ))
    } else {
        Box::new(LineCollector::new(tokio::io::BufReader::new(tokio::io::stdin())))
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling run");
            on_signal.cancel();
        }
    });

    let result = orchestrator.run(collector.as_ref(), &cancel).await;
    provider.shutdown().await;

    match result {
        Ok(report) => {
            println!(
                "Completed {} pass(es); render at {}",
                report.completed_passes(),
                report.render_path.display()
            );
            if let Some(dir) = report.journal_dir {
                println!("Journal: {}", dir.display());
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => Ok(report_failure(&err)),
    }
}

fn report_failure(err: &RunError) -> ExitCode {
    tracing::error!(error = %err, "run failed");
    eprintln!("error: {err}");
    if let Some(ctx) = err.partial_context() {
        match serde_json::to_string_pretty(ctx) {
            Ok(json) => eprintln!("partial context:\n{json}"),
            Err(e) => tracing::warn!(error = %e, "could not serialise partial context"),
        }
    }
    match err {
        RunError::Input(_) => ExitCode::from(2),
        RunError::Cancelled { .. } => ExitCode::from(130),
        RunError::Aborted { .. } | RunError::Setup(_) | RunError::Journal(_) => ExitCode::FAILURE,
    }
}

fn check_config(args: &ArgMatches) -> Result<ExitCode> {
    let config = load_config(args)?;
    config.validate()?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(ExitCode::SUCCESS)
}

fn journal_file(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join("journal.jsonl")
    } else {
        path.to_path_buf()
    }
}

fn verify_journal(args: &ArgMatches) -> Result<ExitCode> {
    let Some(path) = args.get_one::<PathBuf>("path") else {
        anyhow::bail!("journal path is required");
    };
    let file = journal_file(path);
    let entries = RunJournal::verify_file(&file)
        .with_context(|| format!("verifying {}", file.display()))?;
    println!("{}: {entries} entries, chain intact", file.display());
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let matches = cli().get_matches();
    let format = matches
        .get_one::<String>("log-format")
        .map_or("pretty", String::as_str);
    init_logging(format);

    match matches.subcommand() {
        Some(("run", args)) => run(args).await,
        Some(("check-config", args)) => check_config(args),
        Some(("verify-journal", args)) => verify_journal(args),
        _ => Ok(ExitCode::from(2)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_definition_is_consistent() {
        cli().debug_assert();
    }

    #[test]
    fn flags_override_file_values() {
        let matches = cli().get_matches_from([
            "scenecraft",
            "run",
            "--variant",
            "tool-planned",
            "--iterations",
            "2",
            "--render-path",
            "/tmp/out.png",
            "--sandbox",
        ]);
        let (_, args) = matches.subcommand().unwrap();
        let mut config = EngineConfig::default();
        apply_overrides(&mut config, args).unwrap();

        assert_eq!(config.variant, PipelineVariant::ToolPlanned);
        assert_eq!(config.feedback.iterations, 2);
        assert_eq!(config.render_path, PathBuf::from("/tmp/out.png"));
        assert!(config.capabilities.sandbox.enabled);
    }

    #[test]
    fn journal_directory_resolves_to_file() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(journal_file(dir.path()), dir.path().join("journal.jsonl"));
        let file = dir.path().join("custom.jsonl");
        assert_eq!(journal_file(&file), file);
    }

    #[test]
    fn missing_config_file_is_reported() {
        let matches =
            cli().get_matches_from(["scenecraft", "check-config", "--config", "/nope/config.toml"]);
        let (_, args) = matches.subcommand().unwrap();
        assert!(load_config(args).is_err());
    }
}
