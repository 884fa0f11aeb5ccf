//! Sector sealing demo: SDR → PreCommit2 → SDRTrees on several in-process
//! workers sharing one `InMemoryTaskStore`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use stagehand_core::app::{EngineBuilder, EngineGroup, StatusReport};
use stagehand_core::config::EngineConfig;
use stagehand_core::domain::{PipelineKey, Resources, StageDetails, TaskError};
use stagehand_core::impls::InMemoryTaskStore;
use stagehand_core::ports::{Clock, SystemClock, TaskCounts, TaskStore};
use stagehand_core::stage::{OwnershipProbe, Stage, TaskContext};

use crate::cli::CliArgs;

const STAGES: [&str; 3] = ["SDR", "PreCommit2", "SDRTrees"];

#[derive(Debug, Deserialize)]
struct Sector {
    miner: String,
    number: u64,
}

/// Sleep `steps` times, checking ownership after each step.
async fn simulate(probe: &OwnershipProbe, steps: u32, step: Duration) -> bool {
    for _ in 0..steps {
        tokio::time::sleep(step).await;
        if !probe.still_owned().await {
            return false;
        }
    }
    true
}

struct Sdr;

#[async_trait]
impl Stage for Sdr {
    fn details(&self) -> StageDetails {
        StageDetails::new("SDR")
            .with_cost(Resources::new(4, 0, 16_000))
            .with_max_failures(3)
    }

    async fn execute(&self, task: TaskContext, probe: OwnershipProbe) -> Result<bool, TaskError> {
        let sector: Sector = task.decode_payload()?;
        info!(miner = %sector.miner, sector = sector.number, "sealing layers");
        Ok(simulate(&probe, 4, Duration::from_millis(50)).await)
    }
}

struct PreCommit2 {
    corrupt: bool,
}

#[async_trait]
impl Stage for PreCommit2 {
    fn details(&self) -> StageDetails {
        StageDetails::new("PreCommit2")
            .with_cost(Resources::new(2, 0, 8_000))
            .with_max_failures(3)
            .following(["SDR"])
    }

    async fn execute(&self, _task: TaskContext, probe: OwnershipProbe) -> Result<bool, TaskError> {
        if !simulate(&probe, 2, Duration::from_millis(40)).await {
            return Ok(false);
        }
        if self.corrupt {
            return Err(TaskError::invariant("expected 1 sealed sector row, got 2"));
        }
        Ok(true)
    }
}

struct Trees {
    fail: bool,
}

#[async_trait]
impl Stage for Trees {
    fn details(&self) -> StageDetails {
        StageDetails::new("SDRTrees")
            .with_display_name("Trees")
            .with_cost(Resources::new(1, 1, 8_000))
            .with_max_per_worker(1)
            .with_max_failures(3)
            .following(["PreCommit2"])
    }

    async fn execute(&self, task: TaskContext, probe: OwnershipProbe) -> Result<bool, TaskError> {
        if !simulate(&probe, 2, Duration::from_millis(30)).await {
            return Ok(false);
        }
        if self.fail {
            return Err(TaskError::transient(format!(
                "tree_r_last write failed (attempt {})",
                task.previous_failures() + 1
            )));
        }
        Ok(true)
    }
}

/// Decides when the cluster has nothing left to do.
///
/// Every expected row in a final state ends the run at once. Otherwise the
/// counts must stay settled and unchanged for `quiet` (a pipeline whose
/// upstream failed terminally never gets its later rows).
struct Settle {
    expected: usize,
    quiet: Duration,
    last: Option<TaskCounts>,
    quiet_since: Option<Instant>,
}

impl Settle {
    fn new(expected: usize, quiet: Duration) -> Self {
        Self {
            expected,
            quiet,
            last: None,
            quiet_since: None,
        }
    }

    fn observe(&mut self, counts: TaskCounts, now: Instant) -> bool {
        if !counts.is_settled() {
            self.last = Some(counts);
            self.quiet_since = None;
            return false;
        }
        if counts.total() >= self.expected {
            return true;
        }
        if self.last != Some(counts) {
            self.last = Some(counts);
            self.quiet_since = Some(now);
            return false;
        }
        self.quiet_since
            .is_some_and(|since| now.duration_since(since) >= self.quiet)
    }
}

fn load_config(args: &CliArgs) -> Result<EngineConfig> {
    match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

pub async fn run(args: CliArgs) -> Result<()> {
    let config = load_config(&args)?;
    let report = seal(&args, &config).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{report}");
    }
    Ok(())
}

/// Run the cluster until no worker has anything left to pick up (or ctrl-c).
async fn seal(args: &CliArgs, config: &EngineConfig) -> Result<StatusReport> {
    let store = Arc::new(InMemoryTaskStore::new());
    let clock = SystemClock;

    for n in 0..args.pipelines {
        let key = PipelineKey::new(format!("f01000-{n}"));
        let payload = serde_json::json!({ "miner": "f01000", "number": n });
        store.register_pipeline(key, payload, clock.now()).await?;
    }

    let mut groups = Vec::with_capacity(args.workers);
    for i in 0..args.workers {
        let worker_config = EngineConfig {
            worker_name: format!("{}-{i}", config.worker_name),
            ..config.clone()
        };
        let engine = EngineBuilder::new(store.clone())
            .with_config(worker_config)
            .register(Sdr)?
            .register(PreCommit2 {
                corrupt: args.corrupt_precommit,
            })?
            .register(Trees {
                fail: args.fail_trees,
            })?
            .expect_stages(&STAGES)
            .build()?;
        groups.push(EngineGroup::start(Arc::new(engine)).await?);
    }
    info!(workers = groups.len(), pipelines = args.pipelines, "cluster running");

    let mut settle = Settle::new(
        args.pipelines * STAGES.len(),
        config.dependency_poll_interval() * 2,
    );
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);
    loop {
        tokio::select! {
            _ = &mut interrupted => {
                warn!("interrupted, shutting down");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(250)) => {
                let counts = store.counts_by_state().await?;
                if settle.observe(counts, Instant::now()) {
                    break;
                }
            }
        }
    }

    let report = StatusReport::collect(store.as_ref(), clock.now(), config.heartbeat_timeout()).await?;

    for g in &groups {
        g.request_shutdown();
    }
    for g in groups {
        g.shutdown_and_join().await;
    }
    Ok(report)
}
