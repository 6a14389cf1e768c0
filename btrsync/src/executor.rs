use crate::cmd::pipeline;
use crate::config::Config;
use crate::error::BtrSyncError;
use crate::flow::{Flow, Sink};
use crate::planner::{Plan, PlanningResult, Skip};
use crate::root::Root;
use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Outcome of one successfully-run plan.
#[derive(Debug, Clone)]
pub struct Completed {
    pub plan: Plan,
    pub bytes_transferred: u64,
    pub stderr_tails: Vec<Vec<u8>>,
}

/// Outcome of a plan whose flow had at least one nonzero-exit stage. Per the
/// first-failure reporting contract, `error` always names the earliest
/// failing stage even if a later one produced louder output.
#[derive(Debug)]
pub struct Failed {
    pub plan: Plan,
    pub error: BtrSyncError,
    pub all_stderr_tails: Vec<Vec<u8>>,
}

/// The structured, final result of an executor run.
#[derive(Debug, Default)]
pub struct RunResult {
    pub completed: Vec<Completed>,
    pub failed: Vec<Failed>,
    pub skipped: Vec<Skip>,
    pub cancelled: bool,
}

/// Runs a planned list of transfers sequentially against a source and
/// destination [`Root`], aggregating per-subvolume outcomes. Concurrency is
/// deliberately absent at this layer -- the source stream structure already
/// serializes one send at a time; only a single [`Flow`] runs at once.
pub struct BtrSync {
    config: Config,
    cancel: Arc<AtomicBool>,
}

impl BtrSync {
    pub fn new(config: Config) -> Self {
        Self { config, cancel: Arc::new(AtomicBool::new(false)) }
    }

    /// A handle a caller can flip from a signal handler to request
    /// cancellation after the in-flight flow drains.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn run(&self, planning: PlanningResult, src: &Root, dst: &Root) -> Result<RunResult> {
        let mut result = RunResult { skipped: planning.skipped, ..Default::default() };

        for plan in planning.plans {
            if self.cancel.load(Ordering::SeqCst) {
                result.cancelled = true;
                break;
            }

            slog_scope::info!("starting transfer"; "src" => plan.src_vol.display_name(), "dst" => %plan.dst_path.display());

            let parent = plan.parent.as_ref();
            let send = match src.send_cmd(&plan.src_vol, parent, &plan.clones) {
                Ok(cmd) => cmd,
                Err(e) => {
                    slog_scope::error!("aborting: failed to build send command"; "error" => %e);
                    return Err(e);
                }
            };
            // A pipe destination has no receive subprocess to build; the
            // executor drives it as a send-only flow that pumps straight to
            // this process's own stdout instead of wiring `dst.receive_cmd`.
            let flow = if matches!(dst, Root::Pipe(_)) {
                Flow::new(vec![send], Sink::SelfStdout)
            } else {
                let receive = match dst.receive_cmd(&plan.dst_path) {
                    Ok(cmd) => cmd,
                    Err(e) => {
                        slog_scope::error!("aborting: failed to build receive command"; "error" => %e);
                        return Err(e);
                    }
                };
                Flow::new(pipeline(vec![send, receive]).stages, Sink::Process)
            };
            let flow_result = flow.run(&self.config, &self.cancel)?;

            if flow_result.cancelled {
                result.cancelled = true;
            }

            match flow_result.first_failed_stage() {
                None => {
                    slog_scope::info!("transfer completed"; "src" => plan.src_vol.display_name());
                    result.completed.push(Completed {
                        plan,
                        bytes_transferred: flow_result.bytes_transferred,
                        stderr_tails: flow_result.stage_outcomes.iter().map(|o| o.stderr_tail.clone()).collect(),
                    });
                }
                Some(idx) => {
                    let stage_error = BtrSyncError::StageFailure {
                        stage_idx: idx,
                        exit_code: flow_result.stage_outcomes[idx].exit_status.and_then(|s| s.code()),
                        stderr_tail: String::from_utf8_lossy(&flow_result.stage_outcomes[idx].stderr_tail).into_owned(),
                    };
                    debug_assert!(!stage_error.is_fatal(), "a per-stage failure must never be the fatal error variant");
                    slog_scope::error!("transfer failed"; "src" => plan.src_vol.display_name(), "error" => %stage_error);
                    result.failed.push(Failed {
                        all_stderr_tails: flow_result.stage_outcomes.iter().map(|o| o.stderr_tail.clone()).collect(),
                        error: stage_error,
                        plan,
                    });
                }
            }

            if result.cancelled {
                break;
            }
        }

        Ok(result)
    }
}

impl RunResult {
    /// Exit-code mapping per the executor's external contract: 0 all
    /// succeeded, 1 some failed, 130 interrupted.
    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            130
        } else if !self.failed.is_empty() {
            1
        } else {
            0
        }
    }
}
