use std::sync::Arc;

use dagrun::config::{BackendKind, OrchestratorConfig};
use dagrun::database;
use dagrun::graph::Node;
use dagrun::logging::init_logging;
use dagrun::manager::{JobQueueManager, ManagerEvent};
use dagrun::module::{ModuleRegistry, ModuleResolver};
use dagrun::queue::{MemoryQueue, QueueBackend, SqliteQueue};
use dagrun::runner::{PipelineRunner, RunConfig};
use dagrun::scheduler::{MemoryScheduleStore, ScheduleStore, SqliteScheduleStore};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

fn demo_nodes() -> Vec<Node> {
    vec![
        Node::new("base", &[], |_| Ok(json!(10))),
        Node::new("scale", &[], |_| Ok(json!(3))),
        Node::new("total", &["base", "scale"], |args| {
            Ok(json!(args.i64("base")? * args.i64("scale")?))
        }),
    ]
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = OrchestratorConfig::from_env()?;
    let (logging, _guard) = init_logging(&config.log_dir)?;
    let log_cleanup = CancellationToken::new();
    logging.start_retention_cleanup(log_cleanup.clone());

    let (queue, schedules): (Arc<dyn QueueBackend>, Arc<dyn ScheduleStore>) = match config.backend
    {
        BackendKind::Memory => (
            Arc::new(MemoryQueue::new()),
            Arc::new(MemoryScheduleStore::new()),
        ),
        BackendKind::Sqlite => {
            let pool = database::init_pool(&config.database_url).await?;
            database::run_migrations(&pool).await?;
            (
                Arc::new(SqliteQueue::new(pool.clone())),
                Arc::new(SqliteScheduleStore::new(pool)),
            )
        }
    };

    let registry = Arc::new(ModuleRegistry::new());
    registry.register("demo", demo_nodes);
    let runner = Arc::new(PipelineRunner::new(ModuleResolver::new(registry)));

    let manager = JobQueueManager::new(queue, schedules, runner, config.manager_config());
    let mut events = manager.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let ManagerEvent::JobFinished(status) = event {
                info!(
                    "Job {} finished as {} (outputs: {:?}, error: {:?})",
                    status.job_id, status.state, status.outputs, status.error
                );
            }
        }
    });

    manager.start().await?;
    info!("dagrun started on {} backend", config.backend);

    let demo = RunConfig::builder("demo").target("total").build()?;
    let job_id = manager.submit(demo, None).await?;
    info!("Submitted demo job {}", job_id);

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
    }
    manager.shutdown().await;
    log_cleanup.cancel();
    Ok(())
}
