//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use ragstream_core::config::{AppConfig, CONFIG_FILE_NAME, ConfigOverrides, load_config};
use ragstream_core::{
    GatewayState, HttpRetrievalClient, RagPipeline, RelayEvent, ingest_directory, run_gateway,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, config_file: Option<&Path>) -> anyhow::Result<()> {
    match command {
        Commands::Config { action } => handle_config(action, config_file),
        Commands::Serve { host, port, ingest } => {
            let overrides = ConfigOverrides { host, port };
            handle_serve(load(config_file, &overrides)?, ingest).await
        }
        Commands::Ingest { dir } => handle_ingest(load_default(config_file)?, dir).await,
        Commands::Ask { prompt } => handle_ask(load_default(config_file)?, &prompt).await,
        Commands::Stream { prompt } => handle_stream(load_default(config_file)?, prompt).await,
    }
}

/// Load configuration and log any validation warnings.
fn load(config_file: Option<&Path>, overrides: &ConfigOverrides) -> anyhow::Result<AppConfig> {
    let config = load_config(config_file, overrides)?;
    for warning in config.validate() {
        warn!("{}", warning);
    }
    Ok(config)
}

fn load_default(config_file: Option<&Path>) -> anyhow::Result<AppConfig> {
    load(config_file, &ConfigOverrides::default())
}

fn handle_config(action: ConfigAction, config_file: Option<&Path>) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_path = config_file
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = AppConfig::default().to_toml()?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load_default(config_file)?;
            println!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

async fn ingest_into(config: &AppConfig, dir: &Path) -> anyhow::Result<()> {
    let backend = HttpRetrievalClient::new(&config.retrieval)?;
    let stats = ingest_directory(dir, &backend, &config.ingest).await?;
    println!(
        "Indexed {} file(s), {} chunk(s); {} file(s) failed",
        stats.files_indexed, stats.chunks_indexed, stats.files_failed
    );
    Ok(())
}

async fn handle_ingest(config: AppConfig, dir: Option<PathBuf>) -> anyhow::Result<()> {
    let dir = dir.or_else(|| config.ingest.docs_dir.clone()).ok_or_else(|| {
        anyhow::anyhow!("No documents directory given and ingest.docs_dir is not set")
    })?;
    ingest_into(&config, &dir).await
}

async fn handle_serve(config: AppConfig, ingest: bool) -> anyhow::Result<()> {
    if ingest {
        match &config.ingest.docs_dir {
            Some(dir) => ingest_into(&config, dir).await?,
            None => warn!("--ingest given but ingest.docs_dir is not set; skipping ingestion"),
        }
    }

    let pipeline = Arc::new(RagPipeline::from_config(&config)?);
    info!(
        provider = %config.llm.provider,
        model = config.llm.effective_model(),
        retrieval = %config.retrieval.base_url,
        "Starting gateway"
    );
    let state = GatewayState::new(pipeline, config.relay.clone()).shared();
    run_gateway(state, &config.server).await?;
    Ok(())
}

async fn handle_ask(config: AppConfig, prompt: &str) -> anyhow::Result<()> {
    let pipeline = RagPipeline::from_config(&config)?;
    let answer = pipeline.generate(prompt).await?;
    println!("{}", answer);
    Ok(())
}

async fn handle_stream(config: AppConfig, prompt: String) -> anyhow::Result<()> {
    let pipeline = Arc::new(RagPipeline::from_config(&config)?);
    let mut events = pipeline.spawn_stream(prompt, &config.relay);
    let mut stdout = std::io::stdout();

    while let Some(event) = events.recv().await {
        match event {
            RelayEvent::Ready => info!("Stream ready"),
            RelayEvent::Data(text) => {
                write!(stdout, "{}", text)?;
                stdout.flush()?;
            }
            RelayEvent::Done => {
                writeln!(stdout)?;
                return Ok(());
            }
            RelayEvent::Error(message) => {
                writeln!(stdout)?;
                anyhow::bail!("Stream failed: {}", message);
            }
        }
    }
    anyhow::bail!("Stream ended without a terminal event")
}
