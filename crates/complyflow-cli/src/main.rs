//! complyflow command line
//!
//! Runs compliance analyses against documents on disk, with rules from a
//! YAML file, checkpoints in a directory and the execution ledger in a
//! JSON-lines file. Results are printed to stdout as JSON; logs go to stderr.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use complyflow_core::{DocumentInput, ReviewAction, ReviewDecision, SegmentMode};
use complyflow_runtime::{
    EvaluatorRegistry, FileCheckpointStore, JsonlLedger, ProviderRegistry,
    RuntimeConfig, UsageTracker, WorkflowEngine, YamlRuleRepository,
};

/// Pages in a document file are separated by form feeds.
const PAGE_BREAK: char = '\u{c}';

#[derive(Parser, Debug)]
#[command(name = "complyflow")]
#[command(version, about = "Checkpointed compliance analysis of marketing content")]
struct Cli {
    /// Runtime configuration (YAML, or JSON by extension)
    #[arg(short, long, env = "COMPLYFLOW_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Rule file
    #[arg(long, env = "COMPLYFLOW_RULES", default_value = "rules.yaml", global = true)]
    rules: PathBuf,

    /// Directory holding workflow checkpoints
    #[arg(long, default_value = ".complyflow/checkpoints", global = true)]
    checkpoint_dir: PathBuf,

    /// Execution ledger file
    #[arg(long, default_value = ".complyflow/ledger.jsonl", global = true)]
    ledger: PathBuf,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Analyze a document and stop for human review
    Run {
        /// Submission id
        id: String,

        /// Document to analyze
        document: PathBuf,

        #[arg(short, long)]
        project: Option<String>,

        #[arg(short, long, value_enum, default_value_t = Mode::Chunk)]
        mode: Mode,
    },

    /// Record a review decision and finalize
    Resume {
        id: String,

        #[arg(short, long, value_enum, default_value_t = Action::Approve)]
        action: Action,

        #[arg(short, long, default_value = "")]
        feedback: String,
    },

    /// Print the stored snapshot
    Show { id: String },

    /// Score the stored snapshot without changing it
    Preview { id: String },

    /// Continue an interrupted run from its last checkpoint
    Recover { id: String },

    /// Print the execution ledger of a submission
    Records { id: String },

    /// Analyze a document line by line, printing one event per line
    Deep {
        id: String,

        document: PathBuf,

        #[arg(short, long)]
        project: Option<String>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Mode {
    Chunk,
    Line,
}

impl From<Mode> for SegmentMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Chunk => SegmentMode::Chunk,
            Mode::Line => SegmentMode::Line,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Action {
    Approve,
    Reject,
    Comment,
}

impl From<Action> for ReviewAction {
    fn from(action: Action) -> Self {
        match action {
            Action::Approve => ReviewAction::Approve,
            Action::Reject => ReviewAction::Reject,
            Action::Comment => ReviewAction::Comment,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let usage = Arc::new(UsageTracker::new());
    let engine = build_engine(&cli, usage.clone())?;

    match &cli.command {
        Command::Run {
            id,
            document,
            project,
            mode,
        } => {
            let input = read_document(document)?;
            let state = engine
                .run_with_mode(id, project.as_deref(), input, (*mode).into())
                .await?;
            print_json(&state)?;
        }
        Command::Resume {
            id,
            action,
            feedback,
        } => {
            let decision = ReviewDecision::new((*action).into(), feedback.clone());
            let state = engine.resume(id, decision).await?;
            print_json(&state)?;
        }
        Command::Show { id } => match engine.get_snapshot(id).await? {
            Some(state) => print_json(&state)?,
            None => anyhow::bail!("No snapshot for submission {}", id),
        },
        Command::Preview { id } => {
            print_json(&engine.preview(id).await?)?;
        }
        Command::Recover { id } => {
            print_json(&engine.recover(id).await?)?;
        }
        Command::Records { id } => {
            for record in engine.ledger().records(id).await? {
                println!("{}", serde_json::to_string(&record)?);
            }
        }
        Command::Deep {
            id,
            document,
            project,
        } => {
            let text = std::fs::read_to_string(document)
                .with_context(|| format!("Failed to read {}", document.display()))?;
            let mut events = std::pin::pin!(engine.deep_analysis(id, project.as_deref(), text));
            while let Some(event) = events.next().await {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
    }

    engine.drain().await;

    let total = usage.total();
    if total.llm_calls > 0 || total.cache_hits > 0 {
        tracing::info!(
            llm_calls = total.llm_calls,
            cache_hits = total.cache_hits,
            total_tokens = total.total_tokens,
            estimated_cost = total.estimated_cost,
            "LLM usage"
        );
    }
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn build_engine(cli: &Cli, usage: Arc<UsageTracker>) -> anyhow::Result<WorkflowEngine> {
    let config = match &cli.config {
        Some(path) => RuntimeConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => RuntimeConfig::default(),
    };

    let rules = YamlRuleRepository::new(&cli.rules, config.scoring.registry());
    let checkpoints = FileCheckpointStore::new(&cli.checkpoint_dir).with_context(|| {
        format!(
            "Failed to open checkpoint directory {}",
            cli.checkpoint_dir.display()
        )
    })?;
    if let Some(parent) = cli.ledger.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let mut builder = WorkflowEngine::builder(config.clone())
        .rule_repository(Arc::new(rules))
        .checkpoint_store(Arc::new(checkpoints))
        .ledger(Arc::new(JsonlLedger::new(&cli.ledger)))
        .usage_tracker(usage.clone());

    match &config.provider {
        Some(provider_config) => {
            let providers = ProviderRegistry::with_defaults();
            let provider = providers.create_from(provider_config).with_context(|| {
                format!(
                    "Failed to create provider '{}' (available: {:?})",
                    provider_config.provider_type,
                    providers.available_types()
                )
            })?;
            tracing::info!(
                provider = provider.name(),
                model = %config.llm.model,
                "Using LLM evaluators"
            );
            builder = builder.evaluators(EvaluatorRegistry::llm(&config, provider, usage));
        }
        None => tracing::info!("No provider configured, using keyword evaluators"),
    }

    Ok(builder.build()?)
}

fn read_document(path: &Path) -> anyhow::Result<DocumentInput> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    if text.contains(PAGE_BREAK) {
        Ok(DocumentInput::Pages(
            text.split(PAGE_BREAK).map(str::to_string).collect(),
        ))
    } else {
        Ok(DocumentInput::Text(text))
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
