use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use events::Event;
use scorch::{FileExperimentStore, Scorch, ScorchConfig, TerminalMode};
use scorch_core::Experiment;
use server::{create_router, state::AppState, ServerConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_CONFIG: &str = "scorch.toml";

#[derive(Parser)]
#[command(name = "scorch")]
#[command(about = "Run component pipelines against live experiments", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Engine and server settings
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG)]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP and websocket API
    Serve {
        /// Overrides `[server] bind`
        #[arg(short, long)]
        bind: Option<String>,
    },
    /// Execute one run in the foreground; breakpoints use this terminal
    Run {
        experiment: String,
        #[arg(short, long, default_value_t = 0)]
        run: usize,
    },
    /// Print the pipeline graph of one loop
    Pipeline {
        experiment: String,
        #[arg(short, long, default_value_t = 0)]
        run: usize,
        #[arg(short, long = "loop", default_value_t = 0)]
        loop_index: usize,
    },
    /// Check an experiment's scorch metadata
    Validate {
        /// Stored experiment name, or a path to an experiment JSON file
        experiment: String,
    },
}

struct Settings {
    scorch: ScorchConfig,
    server: ServerConfig,
}

async fn load_settings(path: &Path) -> Result<Settings> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", path.display()))
        }
    };

    let scorch = ScorchConfig::from_toml(&content)
        .with_context(|| format!("Invalid engine settings in {}", path.display()))?;
    let server = ServerConfig::from_toml(&content)
        .with_context(|| format!("Invalid server settings in {}", path.display()))?;
    Ok(Settings { scorch, server })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(&cli.config).await?;
    init_tracing(&settings.server.log_level);

    match cli.command {
        Commands::Serve { bind } => serve(settings, bind).await,
        Commands::Run { experiment, run } => run_once(settings.scorch, &experiment, run).await,
        Commands::Pipeline {
            experiment,
            run,
            loop_index,
        } => print_pipeline(settings.scorch, &experiment, run, loop_index).await,
        Commands::Validate { experiment } => validate(settings.scorch, &experiment).await,
    }
}

fn engine(config: ScorchConfig, mode: TerminalMode) -> Scorch {
    let store = Arc::new(FileExperimentStore::new(&config.base_dir));
    Scorch::builder(config, store)
        .with_terminal_mode(mode)
        .build()
}

async fn serve(settings: Settings, bind: Option<String>) -> Result<()> {
    let bind = bind.unwrap_or(settings.server.bind);
    let scorch = engine(settings.scorch, TerminalMode::Web);
    let app = create_router(AppState::new(scorch));

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;

    println!();
    println!("SCORCH");
    println!("════════════════════════════════════════");
    println!();
    println!("  API Server:  http://{}", listener.local_addr()?);
    println!("  Swagger UI:  http://{}/swagger-ui", listener.local_addr()?);
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    axum::serve(listener, app).await?;
    Ok(())
}

async fn run_once(config: ScorchConfig, experiment: &str, run: usize) -> Result<()> {
    let scorch = engine(config, TerminalMode::Cli);

    let ctrl_c = {
        let scorch = scorch.clone();
        let experiment = experiment.to_string();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!(experiment = %experiment, "Interrupted, cancelling run");
                let _ = scorch.cancel_run(&experiment).await;
            }
        })
    };

    let mut events = scorch.bus().watch(experiment);
    let progress = tokio::spawn(async move {
        while let Some(envelope) = events.recv().await {
            if let Event::ComponentStatus {
                loop_index,
                count,
                stage,
                name,
                status,
                ..
            } = envelope.event
            {
                println!("[loop {} #{}] {} {}: {}", loop_index, count, stage, name, status);
            }
        }
    });

    let result = scorch.execute(experiment, run).await;
    ctrl_c.abort();
    progress.abort();

    let pipeline = scorch.pipeline(experiment, run, 0).await?;
    let value: serde_json::Value = serde_json::from_str(&pipeline)?;
    println!("{}", serde_json::to_string_pretty(&value)?);

    result.with_context(|| format!("Run {} of {} failed", run, experiment))?;
    println!("Run {} of {} succeeded", run, experiment);
    Ok(())
}

async fn print_pipeline(
    config: ScorchConfig,
    experiment: &str,
    run: usize,
    loop_index: usize,
) -> Result<()> {
    let scorch = engine(config, TerminalMode::Cli);
    let pipeline = scorch
        .pipeline(experiment, run, loop_index)
        .await
        .with_context(|| format!("No pipeline for {} run {} loop {}", experiment, run, loop_index))?;
    let value: serde_json::Value = serde_json::from_str(&pipeline)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

async fn validate(config: ScorchConfig, experiment: &str) -> Result<()> {
    let path = Path::new(experiment);
    let experiment: Experiment = if path.extension().is_some_and(|ext| ext == "json") {
        let content = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_slice(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?
    } else {
        let store = FileExperimentStore::new(&config.base_dir);
        scorch::ExperimentStore::get(&store, experiment)
            .await
            .with_context(|| format!("Failed to load experiment {}", experiment))?
    };

    experiment
        .scorch
        .validate()
        .with_context(|| format!("Experiment {} is invalid", experiment.name))?;

    println!(
        "Experiment {} is valid: {} components, {} runs",
        experiment.name,
        experiment.scorch.components.len(),
        experiment.scorch.runs.len()
    );
    Ok(())
}

fn init_tracing(default_level: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("scorch={0},server={0},tower_http={0}", default_level).into()
            }),
        )
        .init();
}
