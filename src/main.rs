//! testbed CLI - test environment provider.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use testbed::config::{self, Config, StoreConfig};
use testbed::engine::{CheckoutEngine, SuiteRecords, release_environment};
use testbed::events::{LogPublisher, StoreMainSuiteSource};
use testbed::provider::{ProviderSession, ResourceKind};
use testbed::registry::{ProviderRegistry, schema};
use testbed::rules::TemplateEvaluator;
use testbed::store::{ConfigStore, FileStore, MemoryStore};
use testbed::testrun::TestRun;

#[derive(Parser)]
#[command(name = "testbed")]
#[command(about = "Checks out test environments and splits test suites across them", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "testbed.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check out environments for a testrun
    Checkout {
        /// Testrun JSON file
        testrun: PathBuf,

        /// Suite runner ids, one per suite in order
        #[arg(short, long = "suite-runner")]
        suite_runners: Vec<String>,

        /// Write the result here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Register a provider configuration or a dataset
    Register {
        /// iut, execution-space, log-area or dataset
        kind: String,

        /// JSON file with the configuration
        file: PathBuf,

        /// Register for this testrun instead of globally
        #[arg(short, long)]
        testrun: Option<String>,
    },

    /// Validate the configuration file, or a provider configuration
    Validate {
        /// Provider kind of `file` (iut, execution-space, log-area)
        #[arg(long, requires = "file")]
        provider: Option<String>,

        /// Provider configuration JSON file
        #[arg(long, requires = "provider")]
        file: Option<PathBuf>,
    },

    /// Check in every resource recorded for a testrun
    Release {
        /// Testrun id
        testrun: String,
    },

    /// Initialize a new configuration file
    Init {
        /// Configuration store (memory, file)
        #[arg(short, long, default_value = "file")]
        store: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging; RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Checkout {
            testrun,
            suite_runners,
            output,
        } => checkout(&cli.config, &testrun, suite_runners, output).await,
        Commands::Register {
            kind,
            file,
            testrun,
        } => register(&cli.config, &kind, &file, testrun).await,
        Commands::Validate { provider, file } => match (provider, file) {
            (Some(kind), Some(file)) => validate_provider(&kind, &file),
            _ => validate_config(&cli.config),
        },
        Commands::Release { testrun } => release(&cli.config, &testrun).await,
        Commands::Init { store } => init_config(&cli.config, &store),
    }
}

fn load(config_path: &Path) -> Result<Config> {
    let config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    info!("Loaded configuration from {}", config_path.display());
    Ok(config)
}

fn open_store(config: &Config) -> Arc<dyn ConfigStore> {
    match &config.store {
        StoreConfig::Memory => {
            warn!("Using an in-memory store; nothing outlives this process");
            Arc::new(MemoryStore::new())
        }
        StoreConfig::File { path } => Arc::new(FileStore::new(path)),
    }
}

fn registry(config: &Config, store: Arc<dyn ConfigStore>) -> ProviderRegistry {
    ProviderRegistry::new(
        store,
        Arc::new(TemplateEvaluator),
        Arc::new(ProviderSession::new()),
    )
    .with_executor(config.executor.clone())
}

fn read_json(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

async fn checkout(
    config_path: &Path,
    testrun_path: &Path,
    suite_runners: Vec<String>,
    output: Option<PathBuf>,
) -> Result<()> {
    let config = load(config_path)?;
    let testrun = TestRun::load(testrun_path)?;
    let store = open_store(&config);

    let testrun_id = match &testrun.id {
        Some(id) => id.clone(),
        None => {
            let id = uuid::Uuid::new_v4().to_string();
            info!("Testrun has no id, recording it as {}", id);
            id
        }
    };

    let registry = registry(&config, store.clone()).with_testrun(&testrun);
    let main_suites = StoreMainSuiteSource::new(store, &testrun_id);
    let engine = CheckoutEngine::new(
        config.engine,
        config.executor,
        registry,
        LogPublisher,
        main_suites,
    )
    .with_testrun_id(testrun_id);

    let result = engine.run(&testrun, &suite_runners).await;
    let json = serde_json::to_string_pretty(&result)?;
    match output {
        Some(path) => std::fs::write(&path, json)
            .with_context(|| format!("Failed to write {}", path.display()))?,
        None => println!("{}", json),
    }

    if !result.is_success() {
        std::process::exit(result.exit_code());
    }
    Ok(())
}

async fn register(
    config_path: &Path,
    kind: &str,
    file: &Path,
    testrun: Option<String>,
) -> Result<()> {
    let config = load(config_path)?;
    let value = read_json(file)?;

    let mut registry = registry(&config, open_store(&config));
    if let Some(id) = testrun {
        registry = registry.with_testrun_id(id);
    }

    let path = if kind == "dataset" {
        registry.register_dataset(&value).await?
    } else {
        registry.register_named(kind, &value).await?
    };
    println!("Registered {} at {}", kind, path);
    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    match config::load_config(config_path) {
        Ok(config) => {
            let engine = &config.engine;
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  IUT timeout: {}s", engine.wait_for_iut_timeout_secs);
            println!(
                "  Execution space timeout: {}s",
                engine.wait_for_execution_space_timeout_secs
            );
            println!("  Log area timeout: {}s", engine.wait_for_log_area_timeout_secs);
            println!("  Checkout deadline: {}s", engine.checkout_deadline().as_secs());
            match engine.max_parallel_iuts {
                Some(max) => println!("  Max parallel IUTs: {}", max),
                None => println!("  Max parallel IUTs: unbounded"),
            }
            println!("  Controller mode: {}", engine.controller);

            let store = match &config.store {
                StoreConfig::Memory => "memory".to_string(),
                StoreConfig::File { path } => format!("file ({})", path),
            };
            println!("  Store: {}", store);

            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn validate_provider(kind: &str, file: &Path) -> Result<()> {
    let kind: ResourceKind = kind.parse().map_err(|e: String| anyhow!(e))?;
    let value = read_json(file)?;
    match schema::validate(kind, &value) {
        Ok(()) => {
            println!("{} provider configuration is valid!", kind);
            Ok(())
        }
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    }
}

async fn release(config_path: &Path, testrun_id: &str) -> Result<()> {
    let config = load(config_path)?;
    let store = open_store(&config);
    let registry = registry(&config, store.clone()).with_testrun_id(testrun_id);
    let records = SuiteRecords::new(store, testrun_id);

    let outcome = release_environment(&registry, &records).await?;
    println!("Released {} sub-suite(s)", outcome.released);
    if let Some(failure) = outcome.last_failure() {
        eprintln!(
            "{} resource(s) could not be checked in, last: {}",
            outcome.failures.len(),
            failure
        );
        std::process::exit(1);
    }
    Ok(())
}

fn init_config(config_path: &Path, store: &str) -> Result<()> {
    let store_config = match store {
        "memory" => {
            r#"[store]
type = "memory""#
        }
        "file" => {
            r#"[store]
type = "file"
path = "~/.testbed/store""#
        }
        _ => {
            eprintln!("Unknown store: {}. Use: memory, file", store);
            std::process::exit(1);
        }
    };

    let config = format!(
        r#"# testbed configuration file

[engine]
event_data_timeout_secs = 10
wait_for_iut_timeout_secs = 10
wait_for_execution_space_timeout_secs = 10
wait_for_log_area_timeout_secs = 10
# max_parallel_iuts = 4
poll_interval_secs = 5
grace_secs = 10
main_suite_timeout_secs = 30
main_suite_poll_secs = 5
controller = false
termination_log = "/dev/termination-log"

{}

[executor]
environment_provider_url = "http://localhost:8080"

[executor.environment]
"#,
        store_config
    );

    if config_path.exists() {
        eprintln!(
            "{} already exists. Remove it first or edit manually.",
            config_path.display()
        );
        std::process::exit(1);
    }

    std::fs::write(config_path, config)?;
    println!("Created {}", config_path.display());
    println!();
    println!("Register providers, then run:");
    println!("  testbed checkout testrun.json");

    Ok(())
}
