use std::sync::Arc;
use std::time::Duration;

use launchpad_core::SubmitOutcome;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::pipeline::SubmitPipeline;
use crate::task::TaskToSubmit;

/// A task handed back with the outcome of its attempt.
pub type Finished = (TaskToSubmit, SubmitOutcome);

/// Drives submission flows for batches of tasks arriving from the task pool.
///
/// Each batch received on the queue is one scheduler tick; every task in it
/// gets its own flow, and all flows run concurrently. Finished tasks are
/// sent back on the outcome channel.
pub struct Submitter {
    pipeline: Arc<SubmitPipeline>,
    /// How long in-flight flows may keep running after shutdown is requested.
    grace: Duration,
}

impl Submitter {
    pub fn new(pipeline: Arc<SubmitPipeline>, grace: Duration) -> Self {
        Self { pipeline, grace }
    }

    /// Run until the queue closes or `shutdown` is cancelled.
    ///
    /// On shutdown no new tasks are accepted. Flows still running after the
    /// grace period are told to stop: a task whose job has not reached
    /// `jobs-submit` is reported `Deferred` with its state as it was before
    /// the attempt, and a task whose batch is already being submitted waits
    /// for the real result.
    ///
    /// A panicking flow is a bug in the pipeline and is re-raised here.
    pub async fn run(
        self,
        mut queue: mpsc::Receiver<Vec<TaskToSubmit>>,
        outcomes: mpsc::Sender<Finished>,
        shutdown: CancellationToken,
    ) {
        info!("submitter started");
        let abort = CancellationToken::new();
        let mut flows: JoinSet<Finished> = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(in_flight = flows.len(), "submitter shutting down");
                    break;
                }
                batch = queue.recv() => match batch {
                    Some(tasks) => {
                        let tick = self.pipeline.begin_tick();
                        info!(tick, tasks = tasks.len(), "submitting tasks");
                        for task in tasks {
                            self.spawn_flow(&mut flows, task, abort.clone());
                        }
                    }
                    None => {
                        info!("task queue closed");
                        break;
                    }
                },
                Some(joined) = flows.join_next(), if !flows.is_empty() => {
                    deliver(&outcomes, joined).await;
                }
            }
        }

        // Let in-flight flows finish, up to the grace period.
        let drained = tokio::time::timeout(self.grace, async {
            while let Some(joined) = flows.join_next().await {
                deliver(&outcomes, joined).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(remaining = flows.len(), "grace period elapsed, stopping flows");
            abort.cancel();
            while let Some(joined) = flows.join_next().await {
                deliver(&outcomes, joined).await;
            }
        }
        info!("submitter stopped");
    }

    fn spawn_flow(
        &self,
        flows: &mut JoinSet<Finished>,
        mut task: TaskToSubmit,
        abort: CancellationToken,
    ) {
        let pipeline = Arc::clone(&self.pipeline);
        flows.spawn(async move {
            let outcome = pipeline.submit_until(&mut task, &abort).await;
            (task, outcome)
        });
    }
}

async fn deliver(
    outcomes: &mpsc::Sender<Finished>,
    joined: Result<Finished, tokio::task::JoinError>,
) {
    match joined {
        Ok((task, outcome)) => {
            if outcome.is_failure() {
                warn!(task = %task.id, %outcome, "submission failed");
            } else {
                info!(task = %task.id, %outcome, "submission finished");
            }
            if outcomes.send((task, outcome)).await.is_err() {
                error!("outcome receiver dropped");
            }
        }
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => error!(error = %e, "submission flow cancelled"),
    }
}
