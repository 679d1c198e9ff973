//! Inspecta CLI - composition root for the inspection engine core.
//!
//! Loads settings, discovers engine plugins, optionally starts the 3-D host,
//! and runs single inspections from the command line.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use inspecta_core::dispatch::EngineSelector;
use inspecta_core::{
    AlgorithmInput, CancellationToken, EngineDispatcher, EngineFactorySet, EngineRegistry,
    HostLaunchConfig, InspectaSettings, PluginLoader, ThreeDHost, ThreeDHostSupervisor,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "inspecta")]
#[command(about = "Run Inspecta inspection engines")]
struct Args {
    /// Settings file (JSON); missing file means defaults
    #[arg(short, long, default_value = "inspecta.json")]
    settings: PathBuf,

    /// Override the plugins directory from the settings
    #[arg(long)]
    plugins_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List discovered engines and plugin load errors
    Engines,

    /// Run one inspection and print the result as JSON
    Run {
        /// Template name; selects the engine when --engine is absent
        #[arg(short, long)]
        template: String,

        /// Engine id to run, bypassing template selection
        #[arg(short, long)]
        engine: Option<String>,

        /// Input parameter, as KEY=VALUE (repeatable)
        #[arg(short, long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// Input image, as KEY=PATH (repeatable)
        #[arg(short, long = "image", value_name = "KEY=PATH")]
        images: Vec<String>,

        #[arg(long, default_value = "")]
        lot_id: String,

        #[arg(long, default_value = "")]
        image_id: String,
    },

    /// Start the 3-D host and print its status
    HostStatus,
}

fn split_pair(pair: &str, what: &str) -> Result<(String, String)> {
    match pair.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => bail!("{} '{}' is not KEY=VALUE", what, pair),
    }
}

fn build_input(
    template: &str,
    lot_id: &str,
    image_id: &str,
    params: &[String],
    images: &[String],
) -> Result<AlgorithmInput> {
    let mut input = AlgorithmInput::new(template).with_ids(lot_id, image_id);
    for pair in params {
        let (key, value) = split_pair(pair, "parameter")?;
        input = input.with_param(key, value);
    }
    for pair in images {
        let (key, path) = split_pair(pair, "image")?;
        input = input.with_image(key, path);
    }
    Ok(input)
}

/// Everything the commands share, wired from settings.
struct App {
    settings: InspectaSettings,
    host: Arc<ThreeDHost>,
    registry: Arc<EngineRegistry>,
    load_errors: Vec<String>,
    supervisor: Option<ThreeDHostSupervisor>,
}

impl App {
    async fn compose(settings: InspectaSettings, start_host: bool) -> Result<Self> {
        let host = Arc::new(ThreeDHost::new());

        let supervisor = if start_host || settings.auto_start_host {
            let config = HostLaunchConfig::from_settings(&settings)?;
            let supervisor = ThreeDHostSupervisor::new(config, host.clone());
            match supervisor.start().await {
                Ok(()) => Some(supervisor),
                Err(e) if start_host => return Err(e).context("failed to start the 3-D host"),
                Err(e) => {
                    warn!("3-D host not started: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let loader = PluginLoader::new(EngineFactorySet::builtin(
            host.clone(),
            settings.ipc_timeout(),
        ));
        let discovery = loader.discover_async(settings.plugins_dir.clone()).await;
        let load_errors = discovery.error_messages();
        for error in &load_errors {
            warn!("Plugin load error: {}", error);
        }

        let registry = Arc::new(EngineRegistry::new());
        let registered = discovery.register_into(&registry);
        info!(
            "Registered {} engine(s) from {}",
            registered,
            settings.plugins_dir.display()
        );

        Ok(Self {
            settings,
            host,
            registry,
            load_errors,
            supervisor,
        })
    }

    async fn close(self) {
        if let Some(supervisor) = self.supervisor {
            supervisor.shutdown().await;
        }
    }
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn execute(app: &App, command: &Command) -> Result<()> {
    match command {
        Command::Engines => print_json(&json!({
            "engines": app.registry.descriptors(),
            "errors": app.load_errors,
        })),
        Command::Run {
            template,
            engine,
            params,
            images,
            lot_id,
            image_id,
        } => {
            let input = build_input(template, lot_id, image_id, params, images)?;
            let engine_id = match engine {
                Some(id) => id.clone(),
                None => EngineSelector::from_settings(&app.settings)
                    .resolve(template)
                    .to_string(),
            };
            info!("Running template '{}' on engine '{}'", template, engine_id);

            let cancel = CancellationToken::new();
            let interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    interrupt.cancel();
                }
            });

            let dispatcher = EngineDispatcher::new(app.registry.clone());
            let result = dispatcher.dispatch(&engine_id, &input, &cancel).await;
            print_json(&serde_json::to_value(&result)?)
        }
        Command::HostStatus => match app.host.status().await {
            Some(status) => print_json(&serde_json::to_value(&status)?),
            None => Err(anyhow::anyhow!("3-D host did not answer GetStatus")),
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let mut settings = InspectaSettings::load(&args.settings)?;
    if let Some(dir) = args.plugins_dir {
        settings.plugins_dir = dir;
    }

    let start_host = matches!(args.command, Command::HostStatus);
    let app = App::compose(settings, start_host).await?;

    let outcome = execute(&app, &args.command).await;
    app.close().await;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_input() {
        let input = build_input(
            "Housing",
            "LOT-1",
            "0001",
            &["Gap.Upper=0.2".to_string(), "Mode = fast".to_string()],
            &["Gray=/data/g.png".to_string()],
        )
        .unwrap();

        assert_eq!(input.param_f64("gap.upper"), Some(0.2));
        assert_eq!(input.param("Mode"), Some("fast"));
        assert_eq!(
            input.image_path("Gray"),
            Some(PathBuf::from("/data/g.png"))
        );
        assert_eq!(input.lot_id, "LOT-1");
    }

    #[test]
    fn test_build_input_rejects_bad_pairs() {
        assert!(build_input("T", "", "", &["novalue".to_string()], &[]).is_err());
        assert!(build_input("T", "", "", &[], &["=/x.png".to_string()]).is_err());
    }

    #[test]
    fn test_run_args() {
        let args = Args::parse_from([
            "inspecta",
            "run",
            "--template",
            "Housing",
            "-p",
            "Gap.Upper=0.2",
            "--image",
            "Gray=g.png",
        ]);
        match args.command {
            Command::Run {
                template,
                engine,
                params,
                images,
                ..
            } => {
                assert_eq!(template, "Housing");
                assert!(engine.is_none());
                assert_eq!(params.len(), 1);
                assert_eq!(images.len(), 1);
            }
            other => panic!("Expected Run, got: {:?}", other),
        }
    }
}
