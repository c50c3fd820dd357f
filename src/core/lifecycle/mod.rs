use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::core::scheduler::ScheduleTicker;
use crate::core::worker::WorkerPool;

#[derive(Debug, PartialEq)]
pub enum LifecycleState {
    Init,
    StartComponents,
    Ready,
    Shutdown,
}

#[async_trait::async_trait]
pub trait LifecycleComponent {
    async fn on_init(&mut self) -> Result<()> {
        Ok(())
    }
    async fn on_start(&mut self) -> Result<()> {
        Ok(())
    }
    async fn on_shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct LifecycleManager {
    state: LifecycleState,
    components: Vec<Arc<Mutex<dyn LifecycleComponent + Send + Sync>>>,
    pub scheduler: JobScheduler,
}

impl LifecycleManager {
    pub async fn new() -> Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            state: LifecycleState::Init,
            components: Vec::new(),
            scheduler,
        })
    }

    pub fn state(&self) -> &LifecycleState {
        &self.state
    }

    pub fn attach(&mut self, component: Arc<Mutex<dyn LifecycleComponent + Send + Sync>>) {
        self.components.push(component);
    }

    /// Run `ticker` on every firing of `tick_cron` (seconds-first syntax).
    pub async fn schedule_ticker(&mut self, tick_cron: &str, ticker: Arc<ScheduleTicker>) -> Result<()> {
        let job = Job::new_async(tick_cron, move |_uuid, mut _l| {
            let ticker = ticker.clone();
            Box::pin(async move {
                match ticker.tick(Utc::now()).await {
                    Ok(ids) if !ids.is_empty() => info!("Tick dispatched schedules {:?}", ids),
                    Ok(_) => {}
                    Err(e) => error!("Schedule tick failed: {}", e),
                }
            })
        })?;
        self.scheduler.add(job).await?;
        info!("Schedule ticker registered on '{}'", tick_cron);
        Ok(())
    }

    pub async fn start(&mut self) -> Result<()> {
        info!("Lifecycle Phase: Init");
        self.state = LifecycleState::Init;
        for comp in &self.components {
            comp.lock().await.on_init().await?;
        }

        info!("Lifecycle Phase: Start Components");
        self.state = LifecycleState::StartComponents;
        for comp in &self.components {
            comp.lock().await.on_start().await?;
        }

        info!("Lifecycle Phase: Ready (Starting Scheduler)");
        self.scheduler.start().await?;
        self.state = LifecycleState::Ready;

        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Lifecycle Phase: Shutdown");
        self.state = LifecycleState::Shutdown;

        if let Err(e) = self.scheduler.shutdown().await {
            warn!("Scheduler shutdown error: {}", e);
        }

        // Reverse order so the queue outlives whatever feeds it.
        for comp in self.components.iter().rev() {
            if let Err(e) = comp.lock().await.on_shutdown().await {
                warn!("Component shutdown error: {}", e);
            }
        }

        Ok(())
    }
}

/// Drains the worker pool when the daemon stops.
pub struct WorkerComponent {
    pool: Option<WorkerPool>,
}

impl WorkerComponent {
    pub fn new(pool: WorkerPool) -> Self {
        Self { pool: Some(pool) }
    }
}

#[async_trait::async_trait]
impl LifecycleComponent for WorkerComponent {
    async fn on_shutdown(&mut self) -> Result<()> {
        if let Some(pool) = self.pool.take() {
            pool.shutdown().await;
        }
        Ok(())
    }
}
