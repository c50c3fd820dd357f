use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use console::style;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

use super::App;
use crate::core::lifecycle::{LifecycleManager, WorkerComponent};
use crate::core::scheduler::{DispatchMessage, Dispatcher, ScheduleTicker};
use crate::core::terminal::{GuideSection, print_info, print_success};
use crate::core::worker::{Task, TaskHandler, WorkerPool, run_with_deadline};

pub async fn run_daemon(app: &App) -> Result<()> {
    let handler = Arc::new(app.pipeline_handler(false).await?);
    let pool = WorkerPool::start(
        handler,
        app.config.worker.workers,
        app.config.worker.queue_capacity,
        app.config.task_deadline(),
    );
    let ticker = Arc::new(ScheduleTicker::new(
        app.store.clone(),
        Arc::new(pool.queue()),
        app.config.catch_up_window(),
    ));

    let mut lifecycle = LifecycleManager::new().await?;
    lifecycle.attach(Arc::new(Mutex::new(WorkerComponent::new(pool))));
    lifecycle
        .schedule_ticker(&app.config.scheduler.tick_cron, ticker)
        .await?;
    lifecycle.start().await?;

    GuideSection::new("Vigil Daemon")
        .status("Status", &style("RUNNING").green().bold().to_string())
        .status("Data", &app.data_dir.display().to_string())
        .status("Tick", &app.config.scheduler.tick_cron)
        .status("Workers", &app.config.worker.workers.to_string())
        .blank()
        .info(&format!(
            "Press {} to stop.",
            style("Ctrl+C").bold().yellow()
        ))
        .print();
    println!();

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    lifecycle.shutdown().await?;
    print_success("Daemon stopped.");
    Ok(())
}

/// Runs dispatched jobs in the calling task instead of a queue, so a single
/// tick from the command line finishes its work before exiting.
struct InlineDispatcher {
    handler: Arc<dyn TaskHandler>,
    deadline: Duration,
}

#[async_trait]
impl Dispatcher for InlineDispatcher {
    async fn dispatch(&self, message: DispatchMessage) -> Result<()> {
        let task = Task::from(message);
        print_info(&format!("Running {}", task));
        let status = run_with_deadline(self.handler.as_ref(), task, self.deadline).await?;
        print_success(&status);
        Ok(())
    }
}

pub async fn run_single_tick(app: &App) -> Result<()> {
    let handler: Arc<dyn TaskHandler> = Arc::new(app.pipeline_handler(true).await?);
    let ticker = ScheduleTicker::new(
        app.store.clone(),
        Arc::new(InlineDispatcher {
            handler,
            deadline: app.config.task_deadline(),
        }),
        app.config.catch_up_window(),
    );
    let fired = ticker.tick(Utc::now()).await?;
    if fired.is_empty() {
        print_info("No schedules were due.");
    } else {
        print_success(&format!("Dispatched {} schedule(s): {:?}", fired.len(), fired));
    }
    Ok(())
}
