use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::audit::AuditRunner;
use crate::core::discovery::TenantDiscovery;
use crate::core::report::ReportBuilder;
use crate::core::scheduler::{DispatchMessage, Dispatcher};
use crate::core::store::Store;
use crate::core::store::types::JobKind;

#[derive(Debug, Clone, PartialEq)]
pub enum Task {
    RunAudits {
        tenant_id: String,
        audit_names: Vec<String>,
    },
    BuildReport {
        tenant_id: String,
        audit_names: Vec<String>,
        name_template: Option<String>,
    },
    BuildDiffReport {
        tenant_id: String,
        audit_names: Vec<String>,
        name_template: Option<String>,
    },
    PairDiff {
        run_a: i64,
        run_b: i64,
    },
    BuildInsightReport {
        tenant_id: String,
        insight_id: i64,
    },
    DiscoverTenants {
        organization_id: String,
        service_filter: String,
    },
    Purge {
        older_than_days: u32,
        audit_name: Option<String>,
    },
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::RunAudits { tenant_id, audit_names } => {
                write!(f, "run-audits[{}] for {}", audit_names.join(", "), tenant_id)
            }
            Task::BuildReport { tenant_id, .. } => write!(f, "build-report for {}", tenant_id),
            Task::BuildDiffReport { tenant_id, .. } => {
                write!(f, "build-diff-report for {}", tenant_id)
            }
            Task::PairDiff { run_a, run_b } => write!(f, "pair-diff {} vs {}", run_a, run_b),
            Task::BuildInsightReport { tenant_id, insight_id } => {
                write!(f, "insight {} for {}", insight_id, tenant_id)
            }
            Task::DiscoverTenants { organization_id, .. } => {
                write!(f, "discover-tenants in organizations/{}", organization_id)
            }
            Task::Purge { older_than_days, .. } => write!(f, "purge older than {}d", older_than_days),
        }
    }
}

impl From<DispatchMessage> for Task {
    fn from(msg: DispatchMessage) -> Self {
        match msg.job_kind {
            JobKind::RunAudits => Task::RunAudits {
                tenant_id: msg.tenant_id,
                audit_names: msg.audit_names,
            },
            JobKind::BuildReport => Task::BuildReport {
                tenant_id: msg.tenant_id,
                audit_names: msg.audit_names,
                name_template: msg.output_name_template,
            },
            JobKind::BuildDiffReport => Task::BuildDiffReport {
                tenant_id: msg.tenant_id,
                audit_names: msg.audit_names,
                name_template: msg.output_name_template,
            },
        }
    }
}

/// Executes one task and returns a status line.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: Task) -> Result<String>;
}

/// The production handler: audits, reports, discovery and retention.
pub struct PipelineHandler {
    store: Store,
    runner: AuditRunner,
    reports: ReportBuilder,
    discovery: TenantDiscovery,
}

impl PipelineHandler {
    pub fn new(
        store: Store,
        runner: AuditRunner,
        reports: ReportBuilder,
        discovery: TenantDiscovery,
    ) -> Self {
        Self {
            store,
            runner,
            reports,
            discovery,
        }
    }

    async fn run_audits(&self, tenant_id: &str, audit_names: &[String]) -> String {
        let mut failed = 0;
        for name in audit_names {
            match self.runner.run_audit(tenant_id, name).await {
                Ok(message) => info!("{}", message),
                Err(e) => {
                    failed += 1;
                    error!("Audit '{}' for tenant {} failed: {}", name, tenant_id, e);
                }
            }
        }
        format!(
            "Ran {} audits for {} ({} failed).",
            audit_names.len(),
            tenant_id,
            failed
        )
    }
}

/// Runs one task, failing it once `deadline` elapses.
pub async fn run_with_deadline(
    handler: &dyn TaskHandler,
    task: Task,
    deadline: Duration,
) -> Result<String> {
    let label = task.to_string();
    tokio::time::timeout(deadline, handler.handle(task))
        .await
        .map_err(|_| anyhow!("{} abandoned after {}s deadline", label, deadline.as_secs()))?
}

/// Retention: drop runs older than `older_than_days`, optionally for one audit.
pub async fn purge_old_runs(store: &Store, older_than_days: u32, audit_name: Option<&str>) -> Result<String> {
    let cutoff = Utc::now() - ChronoDuration::days(i64::from(older_than_days));
    info!("Purging audit runs older than {}", cutoff.format("%Y-%m-%d"));
    let purged = store.purge_runs(cutoff, audit_name).await?;
    Ok(if purged == 0 {
        "No old audits found to purge.".to_string()
    } else {
        format!("Successfully purged {} audit records.", purged)
    })
}

#[async_trait]
impl TaskHandler for PipelineHandler {
    async fn handle(&self, task: Task) -> Result<String> {
        match task {
            Task::RunAudits {
                tenant_id,
                audit_names,
            } => Ok(self.run_audits(&tenant_id, &audit_names).await),
            Task::BuildReport {
                tenant_id,
                audit_names,
                name_template,
            } => {
                let id = self
                    .reports
                    .build_report(&tenant_id, &audit_names, name_template.as_deref())
                    .await?;
                Ok(format!("Report generated successfully (id {}).", id))
            }
            Task::BuildDiffReport {
                tenant_id,
                audit_names,
                name_template,
            } => {
                let id = self
                    .reports
                    .build_diff_report(&tenant_id, &audit_names, name_template.as_deref())
                    .await?;
                Ok(format!("Diff report generated successfully (id {}).", id))
            }
            Task::PairDiff { run_a, run_b } => {
                let id = self.reports.build_pair_diff_report(run_a, run_b).await?;
                Ok(format!("Diff report generated successfully (id {}).", id))
            }
            Task::BuildInsightReport {
                tenant_id,
                insight_id,
            } => {
                let id = self
                    .reports
                    .build_insight_report(&tenant_id, insight_id)
                    .await?;
                Ok(format!("Insight report generated successfully (id {}).", id))
            }
            Task::DiscoverTenants {
                organization_id,
                service_filter,
            } => {
                let summary = self
                    .discovery
                    .discover(&organization_id, &service_filter)
                    .await?;
                Ok(format!("Discovery finished: {}.", summary))
            }
            Task::Purge {
                older_than_days,
                audit_name,
            } => purge_old_runs(&self.store, older_than_days, audit_name.as_deref()).await,
        }
    }
}

/// Cloneable handle for putting tasks on the queue.
#[derive(Clone)]
pub struct TaskQueue {
    sender: mpsc::Sender<Task>,
}

impl TaskQueue {
    pub async fn submit(&self, task: Task) -> Result<()> {
        self.sender
            .send(task)
            .await
            .map_err(|e| anyhow!("task queue is closed, dropped {}", e.0))
    }
}

#[async_trait]
impl Dispatcher for TaskQueue {
    async fn dispatch(&self, message: DispatchMessage) -> Result<()> {
        self.submit(Task::from(message)).await
    }
}

pub struct WorkerPool {
    queue: TaskQueue,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(handler: Arc<dyn TaskHandler>, workers: usize, capacity: usize, deadline: Duration) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let cancel = CancellationToken::new();

        let handles = (0..workers.max(1))
            .map(|worker_id| {
                let receiver = receiver.clone();
                let handler = handler.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    worker_loop(worker_id, receiver, handler, cancel, deadline).await;
                })
            })
            .collect();

        info!("Started {} workers (queue capacity {})", workers.max(1), capacity.max(1));
        Self {
            queue: TaskQueue { sender },
            cancel,
            handles,
        }
    }

    pub fn queue(&self) -> TaskQueue {
        self.queue.clone()
    }

    /// Stop taking new tasks and wait for in-flight ones to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        drop(self.queue);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("Worker ended abnormally: {}", e);
            }
        }
        info!("Worker pool stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    receiver: Arc<Mutex<mpsc::Receiver<Task>>>,
    handler: Arc<dyn TaskHandler>,
    cancel: CancellationToken,
    deadline: Duration,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => None,
            task = async { receiver.lock().await.recv().await } => task,
        };
        let Some(task) = next else {
            break;
        };

        let label = task.to_string();
        info!("Worker {} started {}", worker_id, label);
        match run_with_deadline(handler.as_ref(), task, deadline).await {
            Ok(status) => info!("Worker {} finished {}: {}", worker_id, label, status),
            Err(e) => error!("Worker {} failed {}: {}", worker_id, label, e),
        }
    }
}
