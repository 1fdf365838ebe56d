use clap::Parser;
use slog::{crit, info, o, Drain, Logger};
use std::sync::Arc;
use std::time::Duration;
use stepwise::{
    Create, Delete, InMemoryCluster, Instruction, Orchestrator, OrchestratorConfig,
    ResourceDefinition, ScaleReplicas,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "stepwise")]
#[command(about = "Create, scale and delete a controller-managed resource, one observed step at a time", long_about = None)]
struct Args {
    /// Resource definition file (YAML or JSON)
    #[arg(short, long, default_value = "./seldon_deployment.json")]
    config: String,

    /// Namespace to deploy into, overriding the definition
    #[arg(short, long)]
    namespace: Option<String>,

    /// Replica count for the scale step
    #[arg(short, long, default_value_t = 2)]
    replicas: u32,

    /// Deadline for the whole rollout, in seconds
    #[arg(short, long, default_value_t = 60)]
    timeout: u64,

    /// Time allowed for the cleanup delete after a failure, in seconds
    #[arg(long, default_value_t = 10)]
    cleanup_timeout: u64,

    /// How long the simulated controller takes to reconcile each change, in milliseconds
    #[arg(long, default_value_t = 500)]
    reconcile_delay_ms: u64,

    /// Log every observed change of the resource
    #[arg(short, long, default_value_t = false)]
    debug: bool,
}

fn create_logger(debug: bool) -> Logger {
    let level = if debug {
        slog::Level::Debug
    } else {
        slog::Level::Info
    };
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog::LevelFilter::new(drain, level).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let logger = create_logger(args.debug);

    let mut definition = ResourceDefinition::from_path(&args.config)?;
    if let Some(namespace) = args.namespace {
        definition = definition.with_namespace(namespace);
    }

    let config = OrchestratorConfig::default()
        .with_deadline(Duration::from_secs(args.timeout))
        .with_cleanup_timeout(Duration::from_secs(args.cleanup_timeout))
        .with_debug(args.debug);

    // Local stand-in for the remote cluster and its controller
    let cluster = InMemoryCluster::new(logger.clone());
    let _reconciler = cluster.spawn_reconciler(Duration::from_millis(args.reconcile_delay_ms));

    let mut orchestrator = Orchestrator::new(
        definition,
        Arc::new(cluster.clone()),
        Arc::new(cluster),
        config,
        logger.clone(),
    )?;

    let instructions: Vec<Box<dyn Instruction>> = vec![
        Box::new(Create),
        Box::new(ScaleReplicas::new(args.replicas)),
        Box::new(Delete),
    ];

    // Ctrl+C aborts the rollout and triggers cleanup
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    let interrupt_logger = logger.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!(interrupt_logger, "Interrupted, aborting rollout");
            interrupt.cancel();
        }
    });

    match orchestrator.run_with_cancel(&instructions, cancel).await {
        Ok(()) => {
            info!(logger, "Rollout finished"; "resource" => %orchestrator.handle());
            Ok(())
        }
        Err(e) => {
            crit!(logger, "Rollout failed"; "error" => %e);
            Err(e.into())
        }
    }
}
