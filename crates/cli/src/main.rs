use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use sift_core::schema::Schema;
use sift_facets::{FilterSet, FilterSetAction};
use sift_search::{Hit, Matches, RecordIndex};
use sift_store::{build_session, spawn_session, Command, SearchSession, SessionHandle, SessionState};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "siftctl", version, about = "Faceted search over JSON records")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// JSON file holding an array of records
    #[arg(long = "data", env = "SIFT_DATA", global = true)]
    data: Option<PathBuf>,

    /// JSON schema naming id, search, filter and store fields
    #[arg(long = "schema", env = "SIFT_SCHEMA", global = true)]
    schema: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build the index and print its size
    Index,
    /// Run one query, toggle filters, print facets and results
    Search {
        /// Query text; "" matches every record
        query: String,
        /// Facet selection, COL=ROW; repeatable
        #[arg(long = "filter", value_parser = parse_filter)]
        filters: Vec<(String, String)>,
        /// Limit printed results
        #[arg(long = "limit", default_value_t = 20)]
        limit: usize,
    },
    /// Interactive session reading commands from stdin
    Repl {
        /// Command queue capacity
        #[arg(long = "queue-cap", env = "SIFT_QUEUE_CAP", default_value_t = 256)]
        cap: usize,
        /// Limit printed results
        #[arg(long = "limit", default_value_t = 20)]
        limit: usize,
    },
}

fn parse_filter(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((col, row)) if !col.is_empty() && !row.is_empty() => Ok((col.to_string(), row.to_string())),
        _ => Err(format!("expected COL=ROW, got {s:?}")),
    }
}

fn init_tracing() {
    let env = std::env::var("SIFT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("SIFT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid SIFT_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_records(path: &Path) -> Result<Vec<Value>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading records from {}", path.display()))?;
    match serde_json::from_str(&raw).with_context(|| format!("parsing records in {}", path.display()))? {
        Value::Array(items) => Ok(items),
        _ => bail!("{}: expected a JSON array of records", path.display()),
    }
}

fn load_schema(path: &Path) -> Result<Schema> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading schema from {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing schema in {}", path.display()))
}

async fn open_session(cli: &Cli) -> Result<SearchSession> {
    let data = cli.data.as_deref().context("no records file: pass --data or set SIFT_DATA")?;
    let schema = cli.schema.as_deref().context("no schema file: pass --schema or set SIFT_SCHEMA")?;
    let records = load_records(data)?;
    let schema = load_schema(schema)?;
    info!(records = records.len(), data = %data.display(), "records loaded");
    build_session(records, schema.into_config()).await
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let session = open_session(&cli).await?;

    match cli.command {
        Commands::Index => {
            let index = session.index();
            match cli.output {
                Output::Human => {
                    println!("records: {}", index.len());
                    println!("terms:   {}", index.term_count());
                    println!("search:  {}", index.search_fields().join(", "));
                    println!("filter:  {}", index.filter_fields().join(", "));
                    println!("store:   {}", index.store_fields().join(", "));
                }
                Output::Json => {
                    #[derive(serde::Serialize)]
                    struct Stats<'a> {
                        records: usize,
                        terms: usize,
                        search_fields: &'a [String],
                        filter_fields: &'a [String],
                        store_fields: &'a [String],
                    }
                    let stats = Stats {
                        records: index.len(),
                        terms: index.term_count(),
                        search_fields: index.search_fields(),
                        filter_fields: index.filter_fields(),
                        store_fields: index.store_fields(),
                    };
                    println!("{}", serde_json::to_string_pretty(&stats)?);
                }
            }
        }
        Commands::Search { ref query, ref filters, limit } => {
            let mut session = session;
            session.set_query(query);
            for (col, row) in filters {
                if session.state().filters.col(col).and_then(|c| c.row(row)).is_none() {
                    warn!(col = %col, row = %row, "no such facet row for this query");
                }
                session.apply_action(&FilterSetAction::toggle(col.as_str(), row.as_str()));
            }
            print_state(&session.state(), session.index(), cli.output, limit)?;
        }
        Commands::Repl { cap, limit } => {
            let index = Arc::clone(session.index());
            let (tx, handle) = spawn_session(session, cap);
            print_state(&handle.current(), &index, cli.output, limit)?;
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                tokio::select! {
                    line = lines.next_line() => {
                        let Some(line) = line.context("reading stdin")? else { break };
                        match parse_repl(&line, &handle.current().filters) {
                            Ok(Repl::Exit) => break,
                            Ok(Repl::Show) => print_state(&handle.current(), &index, cli.output, limit)?,
                            Ok(Repl::Skip) => {}
                            Ok(Repl::Send(cmd)) => {
                                let before = handle.current().epoch;
                                tx.send(cmd).await.context("session loop stopped")?;
                                let state = wait_past(&handle, before).await;
                                print_state(&state, &index, cli.output, limit)?;
                            }
                            Err(e) => eprintln!("{e}"),
                        }
                    }
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; leaving repl");
                        break;
                    }
                }
            }
            drop(tx);
        }
    }

    Ok(())
}

#[derive(Debug, PartialEq)]
enum Repl {
    Send(Command),
    Show,
    Skip,
    Exit,
}

const REPL_HELP: &str = "commands: q <text> | t <col>=<row> | c <col> | ca | s | exit";

fn parse_repl(line: &str, filters: &FilterSet) -> Result<Repl> {
    let line = line.trim();
    let (head, rest) = line.split_once(' ').map(|(h, r)| (h, r.trim())).unwrap_or((line, ""));
    Ok(match head {
        "" => Repl::Skip,
        "q" => Repl::Send(Command::SetQuery(rest.to_string())),
        "t" => {
            let (col, row) = parse_filter(rest).map_err(anyhow::Error::msg)?;
            Repl::Send(Command::Apply(FilterSetAction::toggle(col, row)))
        }
        "c" if !rest.is_empty() => Repl::Send(Command::Apply(FilterSetAction::clear_col(rest))),
        "ca" => Repl::Send(Command::Apply(FilterSetAction::clear_all(filters.names()))),
        "s" => Repl::Show,
        "exit" | "quit" => Repl::Exit,
        _ => bail!("{REPL_HELP}"),
    })
}

async fn wait_past(handle: &SessionHandle, epoch: u64) -> Arc<SessionState> {
    let mut rx = handle.subscribe_epoch();
    let _ = tokio::time::timeout(Duration::from_secs(2), async {
        while *rx.borrow_and_update() <= epoch {
            if rx.changed().await.is_err() { break; }
        }
    })
    .await;
    handle.current()
}

fn print_state(state: &SessionState, index: &RecordIndex, output: Output, limit: usize) -> Result<()> {
    match output {
        Output::Human => {
            println!("query {:?}: {} candidates, {} results", state.text, state.candidates.len(), state.results.len());
            for col in state.filters.cols() {
                println!("{} ({} / {})", col.name, col.num_on(), col.len());
                for row in &col.rows {
                    let mark = if row.on { "*" } else { " " };
                    println!("  {} {} ({})", mark, row.name, row.count);
                }
            }
            for r in state.results.iter().take(limit) {
                let hit = Hit { doc: r.doc, matches: r.matches.clone() };
                let title = index.text(r.doc, 0).map(|t| bracket(t, &index.highlight(&hit, 0))).unwrap_or_default();
                println!("{:<14} {}", r.id, title);
            }
            if state.results.len() > limit {
                println!("... {} more", state.results.len() - limit);
            }
        }
        Output::Json => {
            #[derive(serde::Serialize)]
            struct Row<'a> {
                id: &'a str,
                stored: serde_json::Map<String, Value>,
                matches: &'a Matches,
            }
            #[derive(serde::Serialize)]
            struct Out<'a> {
                epoch: u64,
                query: &'a str,
                candidates: usize,
                facets: &'a FilterSet,
                total: usize,
                results: Vec<Row<'a>>,
            }
            let results = state
                .results
                .iter()
                .take(limit)
                .map(|r| Row {
                    id: &r.id,
                    stored: r.stored.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                    matches: &r.matches,
                })
                .collect();
            let out = Out {
                epoch: state.epoch,
                query: &state.text,
                candidates: state.candidates.len(),
                facets: &state.filters,
                total: state.results.len(),
                results,
            };
            println!("{}", serde_json::to_string(&out)?);
        }
    }
    Ok(())
}

/// Wrap runs of highlighted char positions in brackets.
fn bracket(text: &str, positions: &[usize]) -> String {
    let mut out = String::with_capacity(text.len() + 2 * positions.len());
    let mut open = false;
    for (i, ch) in text.chars().enumerate() {
        let hit = positions.binary_search(&i).is_ok();
        if hit && !open { out.push('['); }
        if !hit && open { out.push(']'); }
        open = hit;
        out.push(ch);
    }
    if open { out.push(']'); }
    out
}
