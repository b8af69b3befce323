//! been: binary entrypoint.
//! Command-line front end over the aggregator, plus `serve`, which runs the
//! read API and the periodic update loop.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use been::aggregator::Aggregator;
use been::api::{create_router, AppState};
use been::collapse::DisplayItem;
use been::config::AppConfig;
use been::metrics::Metrics;
use been::model::EventQuery;
use been::scheduler::{spawn_update_scheduler, SchedulerCfg};
use been::sources::{SourceContext, SourceRegistry};
use been::store::{self, create_named_store, create_store};

#[derive(Parser)]
#[command(
    name = "been",
    version,
    about = "Personal activity aggregator",
    propagate_version = true
)]
struct Cli {
    /// Configuration file (default: config/been.toml)
    #[arg(short, long, global = true, env = "BEEN_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Storage backend: couch, redis or memory
    #[arg(short, long, global = true, env = "BEEN_STORE")]
    store: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch events from all sources, or from one source (id or unique prefix)
    Update { source: Option<String> },

    /// Register a source of the given kind
    Add {
        kind: String,
        /// Kind-specific parameters (e.g. a feed url or a directory)
        params: Vec<String>,
    },

    /// Show summaries of the newest events
    Log {
        #[arg(short = 'n', long, default_value_t = 100)]
        count: usize,
        /// Only events of this source
        #[arg(long)]
        source: Option<String>,
        /// Fold bursts of events into groups
        #[arg(long)]
        collapsed: bool,
    },

    /// List registered sources
    List {
        /// Ids only
        #[arg(long)]
        short: bool,
    },

    /// Delete every event and reset all source cursors
    Empty,

    /// Rebuild stored events from their raw data
    Reprocess,

    /// Get, or set when a value is given, a source setting
    Configure {
        source: String,
        key: String,
        /// JSON value (plain text is stored as a string)
        value: Vec<String>,
    },

    /// Copy all sources and events from one backend to another
    Migrate { from: String, to: String },

    /// Add an event to a `publish` source, e.g. `publish notes summary:"hello"`
    Publish {
        name: String,
        /// key:value pairs
        fields: Vec<String>,
    },

    /// Run the HTTP read API with periodic updates
    Serve {
        /// Listen address (overrides [serve].bind)
        #[arg(long)]
        bind: Option<String>,
    },
}

/// Compact logs to stderr; `BEEN_LOG_JSON=1` switches to JSON lines.
fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("been=info,warn"));
    let json = std::env::var("BEEN_LOG_JSON").ok().is_some_and(|v| v == "1");

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        registry
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .init();
    }
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut cfg = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load_default()?,
    };
    if let Some(store) = &cli.store {
        cfg.store = store.trim().to_ascii_lowercase();
    }
    Ok(cfg)
}

async fn open(cfg: &AppConfig) -> Result<Aggregator> {
    let store = create_store(cfg).await.context("opening event store")?;
    let ctx = SourceContext::new(&cfg.feed)?;
    Aggregator::load(store, SourceRegistry::builtin(), ctx).await
}

/// `key:value` pairs, surrounding quotes stripped from values.
fn parse_fields(args: &[String]) -> Result<Map<String, Value>> {
    let mut out = Map::new();
    for arg in args {
        let Some((key, value)) = arg.split_once(':') else {
            bail!("expected key:value, got '{arg}'");
        };
        let value = value.trim_matches(|c| c == '"' || c == '\'');
        out.insert(key.trim().to_string(), Value::String(value.to_string()));
    }
    Ok(out)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let cfg = load_config(&cli)?;

    match cli.command {
        Commands::Update { source } => {
            let mut agg = open(&cfg).await?;
            let only = source.map(|key| agg.resolve(&key).map(|id| vec![id])).transpose()?;
            let report = agg.update(only.as_deref()).await;
            println!(
                "{} -- +{} events [{}]",
                chrono::Local::now().format("%a %b %e %H:%M:%S %Y"),
                report.total(),
                report.summary()
            );
            for (id, err) in &report.failed {
                eprintln!("  {id}: {err}");
            }
            if !report.is_success() {
                std::process::exit(1);
            }
        }

        Commands::Add { kind, params } => {
            let mut agg = open(&cfg).await?;
            if agg.registry().kinds().all(|k| k.kind != kind) {
                eprintln!("Invalid source kind '{kind}'. Available kinds:");
                for k in agg.registry().kinds() {
                    eprintln!("  {}", k.usage);
                }
                std::process::exit(1);
            }
            let id = agg.add(&kind, &params).await?;
            println!("added {id}");
        }

        Commands::Log {
            count,
            source,
            collapsed,
        } => {
            let agg = open(&cfg).await?;
            let mut query = EventQuery::default().count(count);
            if let Some(key) = source {
                query = query.source(agg.resolve(&key)?);
            }
            if collapsed {
                for item in agg.collapsed_events(&query).await? {
                    match item {
                        DisplayItem::Event(ev) => println!("{}", ev.summary),
                        DisplayItem::Group(g) => {
                            println!("{} ({} events)", g.source, g.children.len());
                            for ev in &g.children {
                                println!("  {}", ev.summary);
                            }
                        }
                    }
                }
            } else {
                for ev in agg.events(&query).await? {
                    println!("{}", ev.summary);
                }
            }
        }

        Commands::List { short } => {
            let agg = open(&cfg).await?;
            let counts = agg.store().events_by_source_count().await?;
            for source in agg.sources() {
                println!("{}", source.source_id);
                if short {
                    continue;
                }
                println!("  {} events", counts.get(&source.source_id).copied().unwrap_or(0));
                for field in ["username", "url", "path", "collapse", "syndicate"] {
                    if let Some(v) = source.get(field) {
                        println!("  * {field}: {v}");
                    }
                }
            }
        }

        Commands::Empty => {
            open(&cfg).await?.empty().await?;
            println!("event store emptied");
        }

        Commands::Reprocess => {
            let n = open(&cfg).await?.reprocess().await?;
            println!("reprocessed {n} events");
        }

        Commands::Configure { source, key, value } => {
            let mut agg = open(&cfg).await?;
            let id = agg.resolve(&source)?;
            if value.is_empty() {
                let current = agg.config_value(&id, &key)?.unwrap_or(Value::Null);
                println!("{current}");
            } else {
                let set = agg.configure(&id, &key, &value.join(" ")).await?;
                println!("{id}: {key} = {set}");
            }
        }

        Commands::Migrate { from, to } => {
            let source = create_named_store(&from, &cfg).await?;
            let target = create_named_store(&to, &cfg).await?;
            let (sources, events) = store::migrate(source.as_ref(), target.as_ref()).await?;
            println!("migrated {sources} sources and {events} events from {from} to {to}");
        }

        Commands::Publish { name, fields } => {
            let mut agg = open(&cfg).await?;
            let stored = agg.publish(&name, parse_fields(&fields)?).await?;
            println!("published to publish:{name} (+{stored})");
        }

        Commands::Serve { bind } => {
            let metrics = Metrics::init()?;
            let agg = open(&cfg).await?;
            let state = AppState::new(agg);
            let _scheduler = spawn_update_scheduler(
                SchedulerCfg {
                    interval_secs: cfg.serve.update_interval_secs,
                },
                state.aggregator.clone(),
            );
            let app = create_router(state).merge(metrics.router());

            let addr = bind.unwrap_or_else(|| cfg.serve.bind.clone());
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .with_context(|| format!("binding {addr}"))?;
            tracing::info!(%addr, backend = %cfg.store, "serving");
            axum::serve(listener, app).await?;
        }
    }

    Ok(())
}
