use std::str::FromStr;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use lookout_core::health::{self, Ctx};
use lookout_core::{KindKeyParts, WatchEvent};
use lookout_derived::usergroup::GroupType;
use lookout_store::{spawn_engine, EngineConfig, EngineHandle, IngestHandle};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "lookoutctl", version, about = "Lookout: replay a recorded watch stream and query the engine")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// NDJSON watch-event stream to replay ("-" reads stdin)
    #[arg(long = "from", global = true, default_value = "-")]
    from: String,

    /// Flush period in milliseconds (overrides LOOKOUT_FLUSH_MS)
    #[arg(long = "flush-ms", global = true)]
    flush_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List kind keys observed in the stream, with object counts
    Kinds,
    /// List objects of one kind with their health condition
    Ls {
        /// Kind key, e.g. "v1/Pod" or "rbac.authorization.k8s.io/v1/Role"
        gvk: String,
    },
    /// Show synthesized user groups
    Groups,
    /// List pod identities scheduled on a node
    NodePods {
        /// Node name as it appears in pod spec.nodeName
        node: String,
    },
    /// Engine counters after the replay
    Stats,
}

fn init_tracing() {
    let env = std::env::var("LOOKOUT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("LOOKOUT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid LOOKOUT_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    // Validate user-supplied keys before consuming the stream.
    if let Commands::Ls { gvk } = &cli.command {
        KindKeyParts::from_str(gvk)?;
    }

    let handle = run_replay(&cli.from, cli.flush_ms).await?;

    match &cli.command {
        Commands::Kinds => {
            info!("kinds invoked");
            match cli.output {
                Output::Human => {
                    println!("{:<44} {:>6}", "KIND", "COUNT");
                    for key in handle.kinds() {
                        println!("{:<44} {:>6}", key, handle.snapshot(&key).len());
                    }
                }
                Output::Json => {
                    #[derive(serde::Serialize)]
                    struct Row {
                        kind: String,
                        count: usize,
                    }
                    let rows: Vec<Row> = handle
                        .kinds()
                        .into_iter()
                        .map(|kind| {
                            let count = handle.snapshot(&kind).len();
                            Row { kind, count }
                        })
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                }
            }
        }
        Commands::Ls { gvk } => {
            info!(kind = %gvk, "ls invoked");
            // Normalized form of the already-validated key.
            let key = KindKeyParts::from_str(gvk)?.key();
            let snap = handle.snapshot(&key);
            let ctx = Ctx::default();
            match cli.output {
                Output::Human => {
                    println!("{:<48} {:<12} {}", "IDENTITY", "STATUS", "REASON");
                    for id in snap.sorted_identities() {
                        if let Some(raw) = snap.get(id) {
                            let c = health::evaluate(&key, raw, &ctx);
                            println!("{:<48} {:<12} {}", id, c.status, c.reason);
                        }
                    }
                }
                Output::Json => {
                    #[derive(serde::Serialize)]
                    struct Row<'a> {
                        identity: &'a str,
                        status: &'static str,
                        reason: String,
                    }
                    let rows: Vec<Row> = snap
                        .sorted_identities()
                        .into_iter()
                        .filter_map(|id| {
                            snap.get(id).map(|raw| {
                                let c = health::evaluate(&key, raw, &ctx);
                                Row {
                                    identity: id,
                                    status: c.status.as_str(),
                                    reason: c.reason,
                                }
                            })
                        })
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                }
            }
        }
        Commands::Groups => {
            info!("groups invoked");
            let groups = handle.user_groups();
            match cli.output {
                Output::Human => {
                    println!(
                        "{:<40} {:<6} {:<28} {:<12} {}",
                        "IDENTITY", "TYPE", "ROLES", "STATUS", "REASON"
                    );
                    for id in groups.sorted_identities() {
                        if let Some(g) = groups.get(id) {
                            let roles: Vec<&str> = g.roles.iter().map(|r| r.name.as_str()).collect();
                            println!(
                                "{:<40} {:<6} {:<28} {:<12} {}",
                                id,
                                group_type_str(g.group_type),
                                roles.join(","),
                                g.condition.status,
                                g.condition.reason
                            );
                        }
                    }
                }
                Output::Json => {
                    let rows: Vec<_> = groups
                        .sorted_identities()
                        .into_iter()
                        .filter_map(|id| groups.get(id))
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                }
            }
        }
        Commands::NodePods { node } => {
            info!(node = %node, "node-pods invoked");
            let pods = handle.pods_on_node(node);
            match cli.output {
                Output::Human => {
                    for p in &pods {
                        println!("{}", p);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&pods)?),
            }
        }
        Commands::Stats => {
            info!("stats invoked");
            let stats = handle.stats();
            match cli.output {
                Output::Human => {
                    println!("ticks:         {}", stats.ticks);
                    println!("ops ingested:  {}", stats.ops_ingested);
                    println!("ops applied:   {}", stats.ops_applied);
                    println!("kinds:         {}", stats.kinds);
                    println!("user groups:   {}", stats.user_groups);
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
            }
        }
    }

    Ok(())
}

/// Feed the whole stream into a fresh engine, then wait until every sent op
/// is visible in a published snapshot.
async fn run_replay(from: &str, flush_ms: Option<u64>) -> Result<EngineHandle> {
    let mut cfg = EngineConfig::from_env();
    if let Some(ms) = flush_ms {
        cfg.flush_interval = Duration::from_millis(ms.max(1));
    }
    let (ingest, handle) = spawn_engine(cfg);

    let (sent, skipped) = if from == "-" {
        feed(BufReader::new(tokio::io::stdin()), &ingest).await?
    } else {
        let file = tokio::fs::File::open(from)
            .await
            .with_context(|| format!("opening {}", from))?;
        feed(BufReader::new(file), &ingest).await?
    };
    info!(sent, skipped, "replay stream consumed");

    // Close ingest so the engine drains once the stream is done.
    drop(ingest);
    wait_settled(&handle, sent).await;
    Ok(handle)
}

async fn feed<R>(reader: BufReader<R>, ingest: &IngestHandle) -> Result<(u64, u64)>
where
    R: AsyncRead + Unpin,
{
    let mut lines = reader.lines();
    let mut sent = 0u64;
    let mut skipped = 0u64;
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<WatchEvent>(line) {
            Ok(ev) => {
                ingest.ingest(ev);
                sent += 1;
            }
            Err(e) => {
                skipped += 1;
                warn!(error = %e, "skipping undecodable event line");
            }
        }
    }
    Ok((sent, skipped))
}

/// Wait for the engine to absorb `sent` ops (configurable deadline).
async fn wait_settled(handle: &EngineHandle, sent: u64) {
    let wait_secs = std::env::var("LOOKOUT_WAIT_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(8);
    let mut rx = handle.subscribe_ticks();
    let deadline = Instant::now() + Duration::from_secs(wait_secs);
    while handle.stats().ops_ingested < sent {
        let now = Instant::now();
        if now >= deadline {
            warn!("replay did not settle before deadline");
            break;
        }
        let rem = deadline.duration_since(now).min(Duration::from_secs(2));
        match tokio::time::timeout(rem, rx.changed()).await {
            Ok(Ok(())) => {}
            // Engine exited after its final drain; stats are final.
            Ok(Err(_)) => break,
            Err(_) => {}
        }
    }
}

fn group_type_str(t: GroupType) -> &'static str {
    match t {
        GroupType::User => "user",
        GroupType::Group => "group",
    }
}
