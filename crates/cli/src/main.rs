use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tokio::signal;
use tracing::{info, warn};

use konverge_controller::{delete_all, run, FailureKind, Reconciliation, RunOptions};
use konverge_core::{meta, ClusterOps, ClusterState};
use konverge_engine::RefDocument;
use konverge_kubehub::KubeCluster;

#[derive(Parser, Debug)]
#[command(name = "konvergectl", version, about = "Apply a constraint document and watch it converge")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile every entry of a document against the cluster
    Apply {
        /// Document file (YAML or JSON)
        file: PathBuf,
        /// Keep reconciling after convergence, until Ctrl-C
        #[arg(long = "watch", action = ArgAction::SetTrue)]
        watch: bool,
        /// Concurrent reconcile workers
        #[arg(long = "workers", default_value_t = 2)]
        workers: usize,
    },
    /// Reconcile a document, then delete everything it created
    Delete {
        /// Document file (YAML or JSON)
        file: PathBuf,
    },
}

fn init_tracing() {
    let env = std::env::var("KONVERGE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KONVERGE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KONVERGE_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_document(file: &PathBuf) -> Result<Box<RefDocument>> {
    let contents = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    // YAML is a superset of JSON, one parser covers both
    let doc = RefDocument::from_yaml(&contents)
        .with_context(|| format!("parsing {}", file.display()))?;
    Ok(Box::new(doc))
}

/// Prints one line per tracked object, re-printing only when the observed
/// resource version moves.
struct Progress {
    output: Output,
    seen: HashMap<String, String>,
}

impl Progress {
    fn new(output: Output) -> Self {
        Self { output, seen: HashMap::new() }
    }

    fn report(&mut self, state: &ClusterState) {
        for (locator, obj) in state.iter() {
            let rv = meta::resource_version(obj).unwrap_or("").to_string();
            match self.seen.get(&locator.path_key()) {
                Some(prev) if *prev == rv => continue,
                _ => {}
            }
            self.seen.insert(locator.path_key(), rv.clone());
            match self.output {
                Output::Human => {
                    let where_ = match locator.target.namespace.as_deref() {
                        Some(ns) => format!("{}/{}", ns, locator.name),
                        None => locator.name.clone(),
                    };
                    println!("+ {} ({}) <- {}", where_, locator.target.ty.kind, locator.path_key());
                }
                Output::Json => {
                    let line = serde_json::json!({
                        "path": locator.path_key(),
                        "kind": locator.target.ty.kind,
                        "namespace": locator.target.namespace,
                        "name": locator.name,
                        "resourceVersion": rv,
                    });
                    println!("{}", line);
                }
            }
        }
    }
}

/// Drive a run to completion (or Ctrl-C), printing progress as it happens.
async fn drive(rec: &mut Reconciliation, output: Output) -> Result<()> {
    let mut progress = Progress::new(output);
    let mut reported: HashMap<String, String> = HashMap::new();
    let mut done = rec.shutdown_signal();
    loop {
        if *done.borrow() {
            break;
        }
        tokio::select! {
            maybe = rec.states.recv() => match maybe {
                Some(state) => progress.report(&state),
                None => break,
            },
            maybe = rec.failures.recv() => {
                if let Some(f) = maybe {
                    // dedup: a label stuck on the same dependency repeats the
                    // same failure on every retry
                    if reported.get(&f.path) != Some(&f.message) {
                        reported.insert(f.path.clone(), f.message.clone());
                        match f.kind {
                            FailureKind::NotConcrete => eprintln!("  ... {}", f.message),
                            _ => eprintln!("error: {}: {}", f.path, f.message),
                        }
                    }
                }
            },
            _ = done.changed() => {}
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; shutting down");
                rec.shutdown();
                break;
            }
        }
    }
    progress.report(&rec.final_snapshot());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Apply { file, watch, workers } => {
            let doc = load_document(&file)?;
            let cluster: Arc<dyn ClusterOps> = Arc::new(KubeCluster::connect().await?);
            let mut rec = run(doc, cluster, RunOptions { watch, label_workers: workers }).await?;
            info!(total = rec.total, watch, "reconciling");
            drive(&mut rec, cli.output).await?;
            let tracked = rec.tracked();
            if tracked < rec.total {
                warn!(tracked, total = rec.total, "stopped before full convergence");
                anyhow::bail!("{}/{} entries converged", tracked, rec.total);
            }
            info!(tracked, "converged");
        }
        Commands::Delete { file } => {
            let doc = load_document(&file)?;
            let cluster: Arc<dyn ClusterOps> = Arc::new(KubeCluster::connect().await?);
            // locations are only known once every entry has reconciled, so a
            // delete is an apply followed by deleting what it tracked
            let mut rec = run(doc, Arc::clone(&cluster), RunOptions::default()).await?;
            info!(total = rec.total, "resolving locations before delete");
            drive(&mut rec, cli.output).await?;
            let locators = rec.locators();
            let deleted = delete_all(cluster, locators).await?;
            for locator in &deleted {
                match cli.output {
                    Output::Human => println!("- {} <- {}", locator.name, locator.path_key()),
                    Output::Json => {
                        let line = serde_json::json!({
                            "deleted": locator.path_key(),
                            "name": locator.name,
                        });
                        println!("{}", line);
                    }
                }
            }
            info!(count = deleted.len(), "deleted");
        }
    }

    Ok(())
}
