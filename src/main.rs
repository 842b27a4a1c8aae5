use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use sandbox_llm::{
    cache::{SledTensorCache, TensorCache},
    catalog::ModelCatalog,
    config::AppConfig,
    conversation::{Conversation, TemplateConfig},
    fetch::{ArtifactLoader, HttpFetcher},
    protocol::{ChatMessage, RequestPrompt},
    tokenizer::{HfTokenizer, Tokenizer},
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "sandbox-llm")]
#[command(about = "Operator tools for the sandboxed LLM runtime")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Durable tensor cache directory
    #[arg(long, global = true)]
    cache_path: Option<PathBuf>,

    /// Log level
    #[arg(long, value_enum, default_value = "info", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the model catalog
    Models {
        /// JSON catalog replacing the built-in one
        #[arg(long)]
        catalog: Option<PathBuf>,
    },

    /// Render a chat history into the model's flat prompt
    Prompt {
        #[arg(short, long)]
        model: String,

        /// JSON array of {"role", "content"} messages
        #[arg(long)]
        messages_json: PathBuf,

        /// tokenizer.json used to count prompt tokens
        #[arg(long)]
        tokenizer: Option<PathBuf>,
    },

    /// Download every artifact of a model into the tensor cache
    Fetch {
        #[arg(short, long)]
        model: String,
    },

    /// Inspect the tensor cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show entry counts and sizes
    Stats,
    /// Show the size of one entry
    Get { key: String },
    /// Remove every entry
    Clear,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => AppConfig::default(),
    };
    if let Some(path) = &cli.cache_path {
        config.host.cache_path = Some(path.clone());
    }
    Ok(config)
}

fn load_catalog(path: Option<&PathBuf>) -> Result<ModelCatalog> {
    match path {
        Some(path) => ModelCatalog::from_file(path)
            .with_context(|| format!("Failed to load catalog from {}", path.display())),
        None => Ok(ModelCatalog::builtin()),
    }
}

fn open_store(config: &AppConfig) -> Result<SledTensorCache> {
    let path = match &config.host.cache_path {
        Some(path) => path,
        None => bail!("No cache path configured; pass --cache-path or set host.cache_path"),
    };
    SledTensorCache::new(path).with_context(|| format!("Failed to open tensor cache at {}", path.display()))
}

fn list_models(catalog: &ModelCatalog) {
    println!("{:<24} {:<8} {:>8} {:>8}  {}", "ID", "DTYPE", "SIZE GB", "VRAM GB", "TEMPLATE");
    for model in catalog.models() {
        let dtype = serde_json::to_string(&model.dtype).unwrap_or_default();
        println!(
            "{:<24} {:<8} {:>8.1} {:>8.1}  {}",
            model.id,
            dtype.trim_matches('"'),
            model.size_gb,
            model.vram_gb,
            model.template
        );
    }
}

fn render_prompt(catalog: &ModelCatalog, model_id: &str, messages: PathBuf, tokenizer: Option<PathBuf>) -> Result<()> {
    let model = catalog
        .get(model_id)
        .with_context(|| format!("Unknown model {}", model_id))?;
    let json = std::fs::read_to_string(&messages)
        .with_context(|| format!("Failed to read {}", messages.display()))?;
    let messages: Vec<ChatMessage> = serde_json::from_str(&json).context("Failed to parse messages")?;

    let template = TemplateConfig::named(&model.template)?;
    let stop = template.stop_str()?.to_string();
    let conversation = Conversation::from_prompt(template, &RequestPrompt::messages(messages))?;
    let pieces = conversation.prompt_array()?;

    println!("{}", pieces.concat());
    println!("---");
    println!("stop: {:?}", stop);

    if let Some(path) = tokenizer {
        let tokenizer = HfTokenizer::from_file(&path)?;
        let mut total = 0;
        for piece in &pieces {
            total += tokenizer.encode(piece)?.len();
        }
        let window = model.window;
        let fits = total + window.mean_gen_length < window.max_window_length;
        println!(
            "tokens: {} (window {}, mean generation {}, {})",
            total,
            window.max_window_length,
            window.mean_gen_length,
            if fits { "fits" } else { "needs a window shift" }
        );
    }
    Ok(())
}

async fn fetch_model(config: &AppConfig, catalog: &ModelCatalog, model_id: &str) -> Result<()> {
    let model = catalog
        .get(model_id)
        .with_context(|| format!("Unknown model {}", model_id))?;
    let store = open_store(config)?;

    let loader = ArtifactLoader::new(
        store.clone(),
        Arc::new(HttpFetcher::new()),
        config.host.fetch_attempts,
        config.host.fetch_retry_delay,
    );
    let artifacts = loader
        .load(model, |p| {
            info!(
                "[{}/{}] {} ({})",
                p.done,
                p.total,
                p.key,
                if p.from_cache { "cached" } else { "fetched" }
            );
        })
        .await
        .with_context(|| format!("Failed to fetch artifacts for {}", model_id))?;
    store.flush().await?;

    println!(
        "{}: {} artifacts, {} bytes ({} already cached)",
        model_id,
        artifacts.len(),
        artifacts.total_bytes(),
        artifacts.cache_hits
    );
    Ok(())
}

async fn cache_command(config: &AppConfig, action: CacheAction) -> Result<()> {
    let store = open_store(config)?;
    match action {
        CacheAction::Stats => println!("{}", store.stats()?),
        CacheAction::Get { key } => match store.get(&key).await? {
            Some(blob) => println!("{}: {} bytes", key, blob.len()),
            None => println!("{}: not cached", key),
        },
        CacheAction::Clear => {
            store.clear()?;
            store.flush().await?;
            println!("Cache cleared");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level: tracing::Level = cli.log_level.into();
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    debug!("Starting {} v{}", sandbox_llm::NAME, sandbox_llm::VERSION);
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Models { catalog } => {
            let catalog = load_catalog(catalog.as_ref().or(config.catalog.as_ref()))?;
            list_models(&catalog);
        }
        Commands::Prompt {
            model,
            messages_json,
            tokenizer,
        } => {
            let catalog = load_catalog(config.catalog.as_ref())?;
            render_prompt(&catalog, &model, messages_json, tokenizer)?;
        }
        Commands::Fetch { model } => {
            let catalog = load_catalog(config.catalog.as_ref())?;
            fetch_model(&config, &catalog, &model).await?;
        }
        Commands::Cache { action } => cache_command(&config, action).await?,
    }
    Ok(())
}
