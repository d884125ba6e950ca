use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use batchload_core::EntityRegistry;
use batchload_storage::config::connect_options_from_url;
use batchload_storage::{try_until_allowed, MemoryStore, PgStore, RecordStore, RetryPolicy, StoreConfig};
use batchload_sync::{
    copy_entity, load_rows, read_rows_file, BulkWriter, LoaderConfig, NoopTransform,
    ReadCursor, ReadOptions, ResumingReader, RowTransform, RuleSet, RuleTransform,
};
use clap::{Args, Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "batchload")]
#[command(about = "Duplicate-safe bulk loads and chunked reads")]
struct Cli {
    /// YAML file with database connection sections.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Section of the config file to connect with.
    #[arg(long, global = true)]
    section: Option<String>,
    /// Entity registry file.
    #[arg(long, global = true)]
    entities: Option<PathBuf>,
    /// Use the test database instead of production.
    #[arg(long, global = true)]
    test: bool,
    /// Run against an empty in-memory store; nothing reaches the database.
    #[arg(long, global = true)]
    dry_run: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create every registered table that does not exist yet.
    Migrate,
    /// Insert a JSON or JSON-lines dump, skipping rows that already exist.
    Load {
        #[arg(long)]
        entity: String,
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        batch_size: Option<usize>,
        /// Load all existing keys up front instead of querying per row.
        #[arg(long)]
        low_memory: bool,
    },
    /// Stream rows as JSON lines, in key order.
    Dump {
        #[arg(long)]
        entity: String,
        #[command(flatten)]
        read: ReadArgs,
    },
    /// Copy rows from one entity into another through optional rules.
    Copy {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        rules: Option<PathBuf>,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        low_memory: bool,
        #[command(flatten)]
        read: ReadArgs,
    },
}

#[derive(Debug, Args)]
struct ReadArgs {
    /// Resume after this key, comma separated for composite keys.
    #[arg(long, conflicts_with = "offset")]
    after_key: Option<String>,
    /// Skip this many rows before the first chunk. Prefer --after-key.
    #[arg(long)]
    offset: Option<u64>,
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    max_chunks: Option<usize>,
    #[arg(long)]
    chunksize: Option<usize>,
}

impl ReadArgs {
    fn options(
        &self,
        entity: &batchload_core::EntityDef,
        config: &LoaderConfig,
    ) -> Result<ReadOptions> {
        let cursor = match (&self.after_key, self.offset) {
            (Some(key), _) => ReadCursor::AfterKey(
                entity
                    .parse_key(key)
                    .with_context(|| format!("parsing --after-key for `{}`", entity.name()))?,
            ),
            (None, Some(offset)) => ReadCursor::Offset(offset),
            (None, None) => ReadCursor::Start,
        };
        Ok(ReadOptions {
            chunksize: self.chunksize.unwrap_or(config.chunksize),
            limit: self.limit,
            max_chunks: self.max_chunks,
            cursor,
        })
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("batchload=info,warn")),
        )
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let message = format!("{err:#}");
            error!(error = %message, "batchload failed");
            ExitCode::FAILURE
        }
    }
}

/// In-memory store with every registered table created.
async fn dry_run_store(
    registry: &EntityRegistry,
    retry: &RetryPolicy,
) -> Result<Arc<dyn RecordStore>> {
    let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
    for entity in registry.iter() {
        try_until_allowed(retry, "ensure_table", || store.ensure_table(entity)).await?;
    }
    Ok(store)
}

async fn connect(cli: &Cli, config: &LoaderConfig) -> Result<Arc<dyn RecordStore>> {
    let retry = config.retry_policy();
    let (options, max_connections) = match &config.database_url {
        Some(url) => (connect_options_from_url(url)?, 4),
        None => {
            let path = cli
                .config
                .clone()
                .or_else(|| config.db_config_path.clone())
                .context("no database configured: pass --config or set BATCHLOAD_DB_CONFIG or DATABASE_URL")?;
            let section = cli.section.as_deref().unwrap_or(&config.db_section);
            let store_config = StoreConfig::load_section(&path, section)?;
            (
                store_config.connect_options(cli.test)?,
                store_config.max_connections,
            )
        }
    };
    let store = PgStore::connect(options, max_connections, &retry).await?;
    Ok(Arc::new(store))
}

fn writer_config(config: &LoaderConfig, batch_size: Option<usize>, low_memory: bool) -> LoaderConfig {
    LoaderConfig {
        batch_size: batch_size.unwrap_or(config.batch_size),
        low_memory: low_memory || config.low_memory,
        ..config.clone()
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = LoaderConfig::from_env();
    let entities_path = cli.entities.clone().unwrap_or_else(|| config.entities_path.clone());
    let registry = EntityRegistry::load(&entities_path)
        .with_context(|| format!("loading entity registry {}", entities_path.display()))?;
    let retry = config.retry_policy();
    let store = if cli.dry_run {
        info!("dry run: using an in-memory store");
        dry_run_store(&registry, &retry).await?
    } else {
        connect(&cli, &config).await?
    };

    match &cli.command {
        Commands::Migrate => {
            for entity in registry.iter() {
                try_until_allowed(&retry, "ensure_table", || store.ensure_table(entity)).await?;
                info!(entity = entity.name(), "table ready");
            }
        }
        Commands::Load {
            entity,
            input,
            batch_size,
            low_memory,
        } => {
            let entity = registry.get(entity)?;
            let rows = read_rows_file(input).await?;
            let writer = BulkWriter::from_config(
                store,
                &writer_config(&config, *batch_size, *low_memory),
            )?;
            let (summary, _report) = load_rows(&writer, entity, rows).await?;
            println!("{}", serde_json::to_string(&summary)?);
        }
        Commands::Dump { entity, read } => {
            let entity = registry.get(entity)?;
            let options = read.options(entity, &config)?;
            let mut reader = ResumingReader::new(store, entity, options, retry)?;
            let mut stdout = tokio::io::stdout();
            let mut rows = 0usize;
            while let Some(chunk) = reader.next_chunk().await? {
                let mut out = String::new();
                for record in &chunk {
                    out.push_str(&serde_json::to_string(&record.to_json())?);
                    out.push('\n');
                }
                stdout.write_all(out.as_bytes()).await?;
                rows += chunk.len();
            }
            stdout.flush().await?;
            info!(
                entity = entity.name(),
                rows,
                cursor = %reader.cursor(),
                state = ?reader.state(),
                "dump finished"
            );
        }
        Commands::Copy {
            from,
            to,
            rules,
            batch_size,
            low_memory,
            read,
        } => {
            let from = registry.get(from)?;
            let to = registry.get(to)?;
            let options = read.options(from, &config)?;
            let mut transform: Box<dyn RowTransform> = match rules {
                Some(path) => Box::new(RuleTransform::new(
                    RuleSet::load(path)?,
                    store.clone(),
                    &registry,
                    retry,
                )?),
                None => Box::new(NoopTransform),
            };
            let writer = BulkWriter::from_config(
                store.clone(),
                &writer_config(&config, *batch_size, *low_memory),
            )?;
            let summary = copy_entity(
                store,
                &writer,
                from,
                to,
                options,
                retry,
                transform.as_mut(),
            )
            .await?;
            println!("{}", serde_json::to_string(&summary.run)?);
            info!(cursor = %summary.cursor, state = ?summary.state, "resume point");
        }
    }
    Ok(())
}
