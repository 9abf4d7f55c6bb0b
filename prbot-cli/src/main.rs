use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use prbot_core::config::CacheBackend;
use prbot_core::state_machine::repository::{
    CacheStore, CommentCacheStore, InMemoryCacheStore, SqliteCacheStore,
};
use prbot_core::{
    get_bot_version, BotConfig, ConfigProvider, Event, ForgeClient, GitHubClient, IssueId,
    IssueProcessor, IssueSnapshot, PropertyFileWriter, RecordingForge, RuntimeConfig,
};

/// prbot: reconciles pull requests and issues against bot commands
#[derive(Parser, Debug)]
#[command(name = "prbot", version)]
#[command(about = "Reconcile an issue or pull request after an event", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one reconciliation pass for an event
    Process(ProcessArgs),
    /// Print the stored bot cache
    ShowCache(ShowCacheArgs),
    /// Validate a policy file
    CheckConfig(CheckConfigArgs),
}

#[derive(Parser, Debug)]
struct ProcessArgs {
    /// Event as JSON
    event: PathBuf,

    /// Issue snapshot as JSON; runs offline against a recording forge
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Log forge writes instead of sending them and skip saving the cache
    #[arg(long)]
    dry_run: bool,

    /// Policy file (overrides PRBOT_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct ShowCacheArgs {
    /// Issue as owner/repo#number
    #[arg(required_unless_present = "all")]
    issue: Option<String>,

    /// List every issue in the SQLite store
    #[arg(long, conflicts_with = "issue")]
    all: bool,
}

#[derive(Parser, Debug)]
struct CheckConfigArgs {
    /// Policy file (defaults to PRBOT_CONFIG)
    path: Option<PathBuf>,
}

/// Parse `owner/repo#number`.
fn parse_issue_ref(value: &str) -> Result<IssueId> {
    let (repo, number) = value
        .split_once('#')
        .ok_or_else(|| anyhow!("expected owner/repo#number, got {:?}", value))?;
    let (owner, name) = repo
        .split_once('/')
        .filter(|(o, n)| !o.is_empty() && !n.is_empty() && !n.contains('/'))
        .ok_or_else(|| anyhow!("expected owner/repo#number, got {:?}", value))?;
    let number = number
        .parse::<u64>()
        .with_context(|| format!("invalid issue number in {:?}", value))?;
    Ok(IssueId::new(owner, name, number))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {} from {}", what, path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse {} from {}", what, path.display()))
}

fn open_store(
    runtime: &RuntimeConfig,
    forge: &Arc<dyn ForgeClient>,
    bot_user: &str,
) -> Result<Arc<dyn CacheStore>> {
    Ok(match runtime.cache_backend {
        CacheBackend::Sqlite => {
            let path = runtime.state_dir.join("cache.db");
            info!("Using SQLite cache at {}", path.display());
            Arc::new(SqliteCacheStore::new(&path).context("Failed to open cache database")?)
        }
        CacheBackend::Memory => Arc::new(InMemoryCacheStore::new()),
        CacheBackend::Comment => Arc::new(CommentCacheStore::new(forge.clone(), bot_user)),
    })
}

fn github_client(runtime: &RuntimeConfig) -> Result<GitHubClient> {
    let token = runtime
        .github_token
        .clone()
        .context("GITHUB_TOKEN is required unless --snapshot is given")?;
    GitHubClient::new(runtime.github_api_url.clone(), token)
}

async fn run_process(args: ProcessArgs, mut runtime: RuntimeConfig) -> Result<()> {
    if let Some(path) = args.config {
        runtime.config_path = Some(path);
    }
    let config = Arc::new(runtime.bot_config()?);
    let event: Event = read_json(&args.event, "event")?;

    let recording = match &args.snapshot {
        Some(path) => {
            let snapshot: IssueSnapshot = read_json(path, "snapshot")?;
            if snapshot.id != event.issue {
                return Err(anyhow!(
                    "snapshot is for {} but the event is for {}",
                    snapshot.id,
                    event.issue
                ));
            }
            Some(Arc::new(
                RecordingForge::new(config.bot_user()).with_issue(snapshot),
            ))
        }
        None => None,
    };
    let forge: Arc<dyn ForgeClient> = match &recording {
        Some(recording) => recording.clone(),
        None => Arc::new(github_client(&runtime)?),
    };

    let store = open_store(&runtime, &forge, config.bot_user())?;
    let processor = IssueProcessor::new(
        forge,
        store,
        config,
        PropertyFileWriter::new(runtime.property_dir.clone()),
    )
    .with_dry_run(args.dry_run || runtime.dry_run);

    let outcome = processor.process(event).await?;
    let mut report = serde_json::to_value(&outcome)?;
    if let (Some(recording), Some(map)) = (&recording, report.as_object_mut()) {
        map.insert("forge_calls".into(), serde_json::to_value(recording.calls())?);
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_show_cache(args: ShowCacheArgs, runtime: RuntimeConfig) -> Result<()> {
    if args.all {
        if runtime.cache_backend != CacheBackend::Sqlite {
            return Err(anyhow!("--all needs the sqlite cache backend"));
        }
        let store = SqliteCacheStore::new(runtime.state_dir.join("cache.db"))?;
        for issue in store.issues().await? {
            println!("{}", issue);
        }
        return Ok(());
    }

    let issue = parse_issue_ref(args.issue.as_deref().unwrap_or_default())?;
    let config = runtime.bot_config()?;
    let forge: Arc<dyn ForgeClient> = match runtime.cache_backend {
        CacheBackend::Comment => Arc::new(github_client(&runtime)?),
        _ => Arc::new(RecordingForge::new(config.bot_user())),
    };
    let store = open_store(&runtime, &forge, config.bot_user())?;
    let cache = store.load(&issue).await?;
    println!("{}", serde_json::to_string_pretty(&cache)?);
    Ok(())
}

fn run_check_config(args: CheckConfigArgs, runtime: &RuntimeConfig) -> Result<()> {
    let config = match args.path.or_else(|| runtime.config_path.clone()) {
        Some(path) => BotConfig::from_path(&path)
            .with_context(|| format!("Invalid policy file {}", path.display()))?,
        None => BotConfig::default(),
    };
    println!(
        "OK: bot {} with {} signature categories, {} command patterns, {} architectures",
        config.bot_user(),
        config.signature_categories().len(),
        config.grammar().len(),
        config.tests().architectures.len()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let runtime = RuntimeConfig::from_env()?;
    info!("prbot {}", get_bot_version());

    match cli.command {
        Commands::Process(args) => run_process(args, runtime).await,
        Commands::ShowCache(args) => run_show_cache(args, runtime).await,
        Commands::CheckConfig(args) => run_check_config(args, &runtime),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_issue_ref() {
        let issue = parse_issue_ref("acme/widgets#42").unwrap();
        assert_eq!(issue, IssueId::new("acme", "widgets", 42));
    }

    #[test]
    fn test_parse_issue_ref_rejects_garbage() {
        for bad in ["acme/widgets", "widgets#1", "/w#1", "a/b/c#1", "a/b#x", "a/b#"] {
            assert!(parse_issue_ref(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["prbot", "process", "event.json", "--dry-run"]).unwrap();
        match cli.command {
            Commands::Process(args) => {
                assert!(args.dry_run);
                assert!(args.snapshot.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(Cli::try_parse_from(["prbot", "show-cache"]).is_err());
        assert!(Cli::try_parse_from(["prbot", "show-cache", "--all"]).is_ok());
    }
}
