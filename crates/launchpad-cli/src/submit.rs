//! `launchpad submit`: feed a task file through the submitter loop.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use launchpad_core::{
    BadHosts, Broadcast, BroadcastStore, ConfigRegistry, HostIdentity, LaunchpadConfig,
    RuntimeConfig, SubmitOutcome, TaskId,
};
use launchpad_remote::ProcessRunner;
use launchpad_submit::{
    FileKeyStore, PipelineServices, SubmitPipeline, Submitter, TaskToSubmit,
};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long running submissions may finish after Ctrl-C.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// One entry of the task file.
#[derive(Debug, Deserialize)]
pub struct TaskEntry {
    #[serde(flatten)]
    pub id: TaskId,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Broadcast settings applied to this task only.
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
}

/// Split entries into tasks and the broadcasts that carry their overrides.
fn prepare(entries: Vec<TaskEntry>, store: &BroadcastStore) -> Vec<TaskToSubmit> {
    entries
        .into_iter()
        .map(|entry| {
            if !entry.overrides.is_empty() {
                store.put(Broadcast {
                    point: Some(entry.id.point.clone()),
                    namespace: Some(entry.id.name.clone()),
                    settings: entry.overrides,
                });
            }
            TaskToSubmit::new(entry.id, entry.runtime)
        })
        .collect()
}

pub async fn run(
    config: &LaunchpadConfig,
    runner: Arc<ProcessRunner>,
    tasks_file: &Path,
) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(tasks_file)
        .with_context(|| format!("reading {}", tasks_file.display()))?;
    let entries: Vec<TaskEntry> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing {}", tasks_file.display()))?;

    let broadcasts = Arc::new(BroadcastStore::new());
    let tasks = prepare(entries, &broadcasts);
    let total = tasks.len();

    let services = PipelineServices {
        runner,
        registry: Arc::new(ConfigRegistry::from_config(config)),
        runtime: broadcasts,
        keys: Arc::new(FileKeyStore::new(&config.workflow.service_dir())),
        bad_hosts: BadHosts::from_config(&config.bad_hosts),
        identity: HostIdentity::detect(&config.host),
    };
    let pipeline = Arc::new(SubmitPipeline::new(config, services));
    let submitter = Submitter::new(pipeline, SHUTDOWN_GRACE);

    let (queue_tx, queue_rx) = mpsc::channel(1);
    let (outcome_tx, mut outcome_rx) = mpsc::channel(total.max(1));
    let shutdown = CancellationToken::new();

    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping submission");
            on_signal.cancel();
        }
    });

    let loop_handle = tokio::spawn(submitter.run(queue_rx, outcome_tx, shutdown));
    queue_tx.send(tasks).await.context("submitter stopped early")?;
    drop(queue_tx);

    let mut failed = 0usize;
    while let Some((task, outcome)) = outcome_rx.recv().await {
        if outcome.is_failure() {
            failed += 1;
        }
        println!("{}", outcome_line(&task, &outcome)?);
    }
    loop_handle.await.context("submitter loop panicked")?;

    info!(total, failed, "submission complete");
    if failed > 0 {
        anyhow::bail!("{failed} of {total} task(s) failed to submit");
    }
    Ok(())
}

fn outcome_line(task: &TaskToSubmit, outcome: &SubmitOutcome) -> serde_json::Result<String> {
    let mut line = serde_json::to_value(outcome)?;
    if let Some(obj) = line.as_object_mut() {
        obj.insert("task".into(), task.id.to_string().into());
        obj.insert("submit_num".into(), task.state.submit_num.into());
    }
    serde_json::to_string(&line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use launchpad_core::RuntimeConfigSource;

    #[test]
    fn overrides_become_task_scoped_broadcasts() {
        let entries: Vec<TaskEntry> = serde_json::from_str(
            r#"[
                {"point": "1", "name": "a", "runtime": {"platform": "desktop"},
                 "overrides": {"platform": "hpc"}},
                {"point": "1", "name": "b", "runtime": {"platform": "desktop"}}
            ]"#,
        )
        .unwrap();
        let store = BroadcastStore::new();
        let tasks = prepare(entries, &store);
        assert_eq!(tasks.len(), 2);

        let a = store
            .runtime_config(&tasks[0].id, &tasks[0].runtime)
            .unwrap();
        let b = store
            .runtime_config(&tasks[1].id, &tasks[1].runtime)
            .unwrap();
        assert_eq!(a.platform.as_deref(), Some("hpc"));
        assert_eq!(b.platform.as_deref(), Some("desktop"));
    }

    #[test]
    fn outcome_line_carries_task_identity() {
        let mut task = TaskToSubmit::new(TaskId::new("2", "model"), RuntimeConfig::default());
        task.state.submit_num = 1;
        let outcome = SubmitOutcome::Submitted {
            platform: "hpc".into(),
            host: "h1".into(),
            job_id: Some("1000".into()),
        };
        let v: serde_json::Value =
            serde_json::from_str(&outcome_line(&task, &outcome).unwrap()).unwrap();
        assert_eq!(v["outcome"], "submitted");
        assert_eq!(v["task"], "2/model");
        assert_eq!(v["submit_num"], 1);
        assert_eq!(v["job_id"], "1000");
    }
}
