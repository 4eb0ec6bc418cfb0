//! `whistle`: build the policy index, search it, and run intake sessions
//! from a terminal.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value as JsonValue;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;
use whistle_core::{ConversationId, JudgmentResult, PolicyIndex, RetrievalResult};
use whistle_runtime::providers::{EmbeddingProvider, ProviderRegistry};
use whistle_runtime::{
    index_builder::load_sources_with, AuditStore, IndexBuilder, MemoryAuditStore, RuntimeConfig,
    SqliteAuditStore, WhistleService,
};

#[derive(Parser)]
#[command(name = "whistle")]
#[command(version, about = "Anonymous whistle-blower intake with policy-grounded judgments")]
struct Cli {
    /// Runtime configuration (YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Clone)]
struct EmbedderArgs {
    /// Embedding provider: hashing, or openai when built with that feature
    #[arg(long, default_value = "hashing")]
    embedder: String,

    /// Embedding provider configuration as JSON, e.g. '{"dimension": 384}'
    #[arg(long, default_value = "{}")]
    embedder_config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Chunk and embed a directory of policy sources into a JSONL index
    BuildIndex {
        /// Directory of .txt, .md, .pdf and .jsonl sources
        #[arg(short, long)]
        sources: PathBuf,

        /// Output index file
        #[arg(short, long)]
        out: PathBuf,

        /// Maximum characters per chunk
        #[arg(long, default_value = "1024")]
        chunk_chars: usize,

        #[command(flatten)]
        embedder: EmbedderArgs,
    },

    /// Search a built index
    Search {
        #[arg(short, long)]
        index: PathBuf,

        /// Query text
        query: String,

        /// Number of passages to return
        #[arg(short, default_value = "5")]
        k: usize,

        /// Output as JSON
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        embedder: EmbedderArgs,
    },

    /// Interactive intake session
    Chat {
        #[arg(short, long)]
        index: PathBuf,

        /// Reasoning provider, e.g. anthropic
        #[arg(long, default_value = "anthropic")]
        provider: String,

        /// Reasoning provider configuration as JSON
        #[arg(long, default_value = "{}")]
        provider_config: String,

        /// SQLite audit database; in-memory when omitted
        #[arg(long)]
        audit_db: Option<PathBuf>,

        #[command(flatten)]
        embedder: EmbedderArgs,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn parse_json(label: &str, raw: &str) -> Result<JsonValue> {
    serde_json::from_str(raw).with_context(|| format!("{} is not valid JSON", label))
}

fn load_config(path: Option<&Path>) -> Result<RuntimeConfig> {
    match path {
        Some(path) => RuntimeConfig::from_yaml_file(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(RuntimeConfig::default()),
    }
}

fn make_embedder(registry: &ProviderRegistry, args: &EmbedderArgs) -> Result<Arc<dyn EmbeddingProvider>> {
    let config = parse_json("--embedder-config", &args.embedder_config)?;
    registry
        .embedding(&args.embedder, &config)
        .with_context(|| format!("creating embedder '{}'", args.embedder))
}

fn load_index(path: &Path) -> Result<PolicyIndex> {
    PolicyIndex::load_jsonl(path).with_context(|| format!("loading index {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let registry = ProviderRegistry::with_defaults();

    match cli.command {
        Commands::BuildIndex {
            sources,
            out,
            chunk_chars,
            embedder,
        } => {
            let embedder = make_embedder(&registry, &embedder)?;
            build_index(&sources, &out, chunk_chars, embedder).await
        }
        Commands::Search {
            index,
            query,
            k,
            json,
            embedder,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let embedder = make_embedder(&registry, &embedder)?;
            search(config, &index, &query, k, json, embedder).await
        }
        Commands::Chat {
            index,
            provider,
            provider_config,
            audit_db,
            embedder,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let provider_config = parse_json("--provider-config", &provider_config)?;
            let provider = registry
                .reasoning(&provider, &provider_config)
                .with_context(|| format!("creating reasoning provider '{}'", provider))?;
            let audit: Arc<dyn AuditStore> = match audit_db {
                Some(path) => Arc::new(
                    SqliteAuditStore::open(&path)
                        .with_context(|| format!("opening audit database {}", path.display()))?,
                ),
                None => Arc::new(MemoryAuditStore::new()),
            };
            let service = WhistleService::builder()
                .config(config)
                .provider(provider)
                .embedder(make_embedder(&registry, &embedder)?)
                .audit(audit)
                .index(load_index(&index)?)
                .build()?;
            chat(service).await
        }
    }
}

async fn build_index(
    sources: &Path,
    out: &Path,
    chunk_chars: usize,
    embedder: Arc<dyn EmbeddingProvider>,
) -> Result<()> {
    let sections = load_sources_with(sources, chunk_chars)
        .with_context(|| format!("reading sources from {}", sources.display()))?;
    if sections.is_empty() {
        bail!("no policy text found in {}", sources.display());
    }
    let index = IndexBuilder::new(embedder)
        .chunk_chars(chunk_chars)
        .build_from_sections(sections)
        .await?;
    index
        .write_jsonl(out)
        .with_context(|| format!("writing index to {}", out.display()))?;
    info!(path = %out.display(), "Index written");
    println!(
        "Indexed {} passages ({} dimensions, fingerprint {}) -> {}",
        index.len(),
        index.dimension(),
        index.fingerprint(),
        out.display()
    );
    Ok(())
}

async fn search(
    config: RuntimeConfig,
    index: &Path,
    query: &str,
    k: usize,
    json: bool,
    embedder: Arc<dyn EmbeddingProvider>,
) -> Result<()> {
    let index = load_index(index)?;
    let handle = Arc::new(whistle_runtime::PolicyIndexHandle::with_index(index));
    let retriever = whistle_runtime::Retriever::new(
        handle,
        embedder,
        whistle_runtime::EmbeddingCache::new(config.cache.max_entries, config.cache.ttl),
        config.retrieval.embedding_timeout,
    );
    let results = retriever.search(query, k).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        print_results(&results);
    }
    Ok(())
}

fn print_results(results: &[RetrievalResult]) {
    if results.is_empty() {
        println!("No matching passages.");
    }
    for hit in results {
        println!("{}. [{:.3}] {} ({})  {}", hit.rank, hit.score, hit.title, hit.section, hit.policy_id);
        let preview: String = hit.text.chars().take(200).collect();
        println!("   {}", preview.replace('\n', " "));
    }
}

fn print_judgment(judgment: &JudgmentResult) {
    println!("\n=== Assessment ===");
    println!("Severity: {} ({})", judgment.severity_label, judgment.severity.ordinal());
    if !judgment.violation_type.is_empty() {
        println!("Violations: {}", judgment.violation_type.join(", "));
    }
    println!("Rationale: {}", judgment.rationale);
    if !judgment.recommended_actions.is_empty() {
        println!("Recommended actions:");
        for action in &judgment.recommended_actions {
            println!("  - {}", action);
        }
    }
    if !judgment.policy_links.is_empty() {
        println!("Policies cited:");
        for link in &judgment.policy_links {
            println!("  - {} {}", link.title, link.url);
        }
    }
    if judgment.needs_more_evidence {
        println!("More evidence would strengthen this assessment.");
    }
    println!();
}

async fn judge(service: &WhistleService, id: &ConversationId) {
    match service.request_judgment(id).await {
        Ok(judgment) => print_judgment(&judgment),
        Err(e) => eprintln!("Judgment failed: {}", e),
    }
}

async fn chat(service: WhistleService) -> Result<()> {
    let started = service.start_conversation().await?;
    let id = started.conversation_id;
    println!("{}\n", started.greeting_text);
    println!("(commands: /upload <path>, /judge, /clear, /quit)\n");

    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line.split_once(' ').unwrap_or((line, "")) {
            ("/quit", _) => break,
            ("/clear", _) => {
                service.clear_conversation(&id).await?;
                println!("Conversation cleared.\n");
            }
            ("/judge", _) => judge(&service, &id).await,
            ("/upload", path) => {
                let path = Path::new(path.trim());
                let bytes = match tokio::fs::read(path).await {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        eprintln!("Cannot read {}: {}", path.display(), e);
                        continue;
                    }
                };
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let upload = service.upload_evidence(&id, &name, &bytes).await?;
                match upload.detail {
                    Some(detail) => println!("Evidence {}: {} ({})\n", name, upload.status, detail),
                    None => println!("Evidence {}: {}\n", name, upload.status),
                }
            }
            _ => match service.send_message(&id, line).await {
                Ok(reply) if reply.awaiting_judgment_request => judge(&service, &id).await,
                Ok(reply) => println!("\n{}\n", reply.reply_text),
                Err(e) => eprintln!("Error: {}", e),
            },
        }
    }

    let usage = service.usage();
    info!(
        calls = usage.llm_calls,
        tokens = usage.total_tokens,
        cost_usd = usage.estimated_cost,
        "Session finished"
    );
    Ok(())
}
