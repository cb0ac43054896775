use crate::model::JobOutcome;
use crate::partition::WorkerBucket;
use crate::tunnel::{self, RunContext};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Spawns one task per bucket. Each worker owns its bucket outright and
/// never runs two of its jobs concurrently.
pub fn spawn_workers(
    buckets: Vec<WorkerBucket>,
    ctx: Arc<RunContext>,
    tx: mpsc::Sender<JobOutcome>,
) {
    for bucket in buckets {
        let ctx = Arc::clone(&ctx);
        let tx = tx.clone();
        tokio::spawn(run_bucket(bucket, ctx, tx));
    }
}

async fn run_bucket(bucket: WorkerBucket, ctx: Arc<RunContext>, tx: mpsc::Sender<JobOutcome>) {
    let worker_id = bucket.worker_id;
    debug!("worker {} starting with {} job(s)", worker_id, bucket.job_count());
    for group in &bucket.groups {
        for (subjob, job) in group.jobs.iter().enumerate() {
            let profile_id = job.profile.id.clone();
            info!(
                "worker {} probing profile {} via {}",
                worker_id, profile_id, group.endpoint_ip
            );
            let result = tunnel::run_job(&ctx, worker_id, subjob, job)
                .await
                .map_err(|err| format!("{:#}", err));
            let outcome = JobOutcome { profile_id, result };
            if tx.send(outcome).await.is_err() {
                debug!("worker {} result channel closed; stopping", worker_id);
                return;
            }
        }
    }
    debug!("worker {} finished", worker_id);
}
