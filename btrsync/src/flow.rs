use crate::cmd::{Cmd, StreamSpec};
use crate::config::Config;
use crate::error::BtrSyncError;
use anyhow::{Context, Result};
use nix::fcntl::{splice, OFlag, SpliceFFlags};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{close, pipe2, Pid};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Where the last stage's output ultimately goes. Most pipelines end in a
/// process (`btrfs receive`, `cat > file`); the pipe-sink root has no final
/// process, so the Flow itself pumps the last stage's stdout to this
/// process's own stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sink {
    Process,
    SelfStdout,
}

/// The outcome of one stage after the flow has fully drained.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub exit_status: Option<ExitStatus>,
    pub stderr_tail: Vec<u8>,
}

impl StageOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_status.map(|s| s.success()).unwrap_or(false)
    }
}

/// The result of running a [`Flow`] to completion.
#[derive(Debug, Clone)]
pub struct FlowResult {
    pub stage_outcomes: Vec<StageOutcome>,
    pub bytes_transferred: u64,
    pub cancelled: bool,
}

impl FlowResult {
    pub fn succeeded(&self) -> bool {
        !self.cancelled && self.stage_outcomes.iter().all(|o| o.succeeded())
    }

    /// Index of the earliest-failing stage, per the first-failure reporting
    /// contract: a later stage's louder failure must never eclipse an
    /// earlier one.
    pub fn first_failed_stage(&self) -> Option<usize> {
        self.stage_outcomes.iter().position(|o| !o.succeeded())
    }
}

/// A linear composition of stages realized as running processes glued by OS
/// pipes. Owns every spawned child and every intermediate pipe fd; `run()`
/// releases all of them on every exit path.
pub struct Flow {
    stages: Vec<Cmd>,
    sink: Sink,
}

impl Flow {
    pub fn new(stages: Vec<Cmd>, sink: Sink) -> Self {
        Self { stages, sink }
    }

    /// Spawn every stage, pump bytes until completion, and wait for all
    /// stages to exit. `cancel` is polled by the waiter so a caller can
    /// request SIGINT-driven cancellation mid-flight.
    pub fn run(self, config: &Config, cancel: &std::sync::atomic::AtomicBool) -> Result<FlowResult> {
        let n = self.stages.len();
        assert!(n > 0, "a flow must have at least one stage");

        // One OS pipe per inter-stage boundary; `pipes[i]` connects stage i's
        // stdout to stage i+1's stdin. Created O_CLOEXEC so a fd that hasn't
        // been explicitly duped for a given stage vanishes at that stage's
        // exec instead of leaking into it via fork -- only the non-CLOEXEC
        // dup handed to stdin/stdout below survives exec.
        let mut boundary_pipes: Vec<(RawFd, RawFd)> = Vec::with_capacity(n.saturating_sub(1));
        for _ in 0..n.saturating_sub(1) {
            boundary_pipes.push(pipe2(OFlag::O_CLOEXEC).context("failed to create inter-stage pipe")?);
        }

        // An extra pipe for the self-stdout sink, connecting the last stage's
        // stdout to a pump thread that splices onward to this process's fd 1.
        let sink_pipe = if self.sink == Sink::SelfStdout {
            Some(pipe2(OFlag::O_CLOEXEC).context("failed to create sink pipe")?)
        } else {
            None
        };

        let mut children: Vec<Child> = Vec::with_capacity(n);
        let mut stderr_readers: Vec<RawFd> = Vec::with_capacity(n);

        let spawn_result = (|| -> Result<()> {
            for (idx, stage) in self.stages.iter().enumerate() {
                let mut command = Command::new(&stage.argv[0]);
                command.args(&stage.argv[1..]);
                for (k, v) in &stage.env_overrides {
                    command.env(k, v);
                }

                command.stdin(stdio_for_stdin(idx, &boundary_pipes, &stage.stdin)?);
                command.stdout(stdio_for_stdout(idx, n, &boundary_pipes, sink_pipe, &stage.stdout)?);

                let (stderr_read, stderr_write) = pipe2(OFlag::O_CLOEXEC).context("failed to create stderr pipe")?;
                command.stderr(unsafe { Stdio::from_raw_fd(stderr_write) });

                let child = command.spawn().map_err(|source| BtrSyncError::Spawn {
                    stage_idx: idx,
                    argv0: stage.argv[0].to_string_lossy().into_owned(),
                    source,
                })?;
                let _ = close(stderr_write);
                stderr_readers.push(stderr_read);
                children.push(child);
            }
            Ok(())
        })();

        // Every fd this process still holds for boundary pipes must be
        // closed once all children have inherited the ends they need --
        // otherwise a reader never sees EOF.
        for &(read_end, write_end) in &boundary_pipes {
            let _ = close(read_end);
            let _ = close(write_end);
        }

        if let Err(e) = spawn_result {
            for (read_end, _) in stderr_readers.iter().map(|&fd| (fd, ())) {
                let _ = close(read_end);
            }
            for mut child in children {
                let _ = kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM);
                let _ = child.wait();
            }
            if let Some((r, w)) = sink_pipe {
                let _ = close(r);
                let _ = close(w);
            }
            return Err(e);
        }

        let stderr_tail_bytes = config.stderr_tail_bytes;
        let stderr_handles: Vec<JoinHandle<Vec<u8>>> = stderr_readers
            .into_iter()
            .map(|fd| std::thread::spawn(move || capture_tail(fd, stderr_tail_bytes)))
            .collect();

        let bytes_transferred = Arc::new(AtomicU64::new(0));
        let pump_handle = sink_pipe.map(|(sink_read, sink_write)| {
            let copy_chunk_bytes = config.copy_chunk_bytes;
            let counter = Arc::clone(&bytes_transferred);
            std::thread::spawn(move || {
                let _ = close(sink_write);
                pump_to_stdout(sink_read, copy_chunk_bytes, &counter);
                let _ = close(sink_read);
            })
        });

        let waiters: Vec<JoinHandle<Option<ExitStatus>>> = children
            .into_iter()
            .map(|mut child| std::thread::spawn(move || child.wait().ok()))
            .collect();

        let deadline = Instant::now() + config.shutdown_grace;
        let mut exit_statuses: Vec<Option<ExitStatus>> = Vec::with_capacity(n);
        let mut cancelled = false;
        for waiter in waiters {
            loop {
                if waiter.is_finished() {
                    exit_statuses.push(waiter.join().unwrap_or(None));
                    break;
                }
                if cancel.load(Ordering::SeqCst) {
                    cancelled = true;
                }
                if cancelled && Instant::now() > deadline {
                    break;
                }
                std::thread::sleep(Duration::from_millis(20));
            }
        }

        if let Some(handle) = pump_handle {
            let _ = handle.join();
        }

        let stderr_tails: Vec<Vec<u8>> = stderr_handles.into_iter().map(|h| h.join().unwrap_or_default()).collect();

        let stage_outcomes = exit_statuses
            .into_iter()
            .zip(stderr_tails)
            .map(|(exit_status, stderr_tail)| StageOutcome { exit_status, stderr_tail })
            .collect();

        Ok(FlowResult {
            stage_outcomes,
            bytes_transferred: bytes_transferred.load(Ordering::SeqCst),
            cancelled,
        })
    }
}

fn stdio_for_stdin(idx: usize, boundary_pipes: &[(RawFd, RawFd)], spec: &StreamSpec) -> Result<Stdio> {
    if idx > 0 {
        let (read_end, _) = boundary_pipes[idx - 1];
        let dup = nix::unistd::dup(read_end).context("failed to dup inter-stage pipe read end")?;
        return Ok(unsafe { Stdio::from_raw_fd(dup) });
    }
    stdio_from_spec(spec, false)
}

fn stdio_for_stdout(
    idx: usize,
    n: usize,
    boundary_pipes: &[(RawFd, RawFd)],
    sink_pipe: Option<(RawFd, RawFd)>,
    spec: &StreamSpec,
) -> Result<Stdio> {
    if idx + 1 < n {
        let (_, write_end) = boundary_pipes[idx];
        let dup = nix::unistd::dup(write_end).context("failed to dup inter-stage pipe write end")?;
        return Ok(unsafe { Stdio::from_raw_fd(dup) });
    }
    if let Some((_, write_end)) = sink_pipe {
        let dup = nix::unistd::dup(write_end).context("failed to dup sink pipe write end")?;
        return Ok(unsafe { Stdio::from_raw_fd(dup) });
    }
    stdio_from_spec(spec, true)
}

fn stdio_from_spec(spec: &StreamSpec, for_output: bool) -> Result<Stdio> {
    Ok(match spec {
        StreamSpec::Inherit => Stdio::inherit(),
        StreamSpec::Null => Stdio::null(),
        StreamSpec::Pipe => Stdio::piped(),
        StreamSpec::Fd(fd) => {
            let dup = nix::unistd::dup(*fd).context("failed to dup explicit fd")?;
            unsafe { Stdio::from_raw_fd(dup) }
        }
        StreamSpec::File(path, mode) => {
            let file = match mode {
                crate::cmd::FileMode::Read => File::open(path).with_context(|| format!("failed to open {:?} for reading", path))?,
                crate::cmd::FileMode::WriteCreate if for_output => {
                    if path.exists() {
                        return Err(BtrSyncError::Filesystem { kind: crate::error::FilesystemErrorKind::FileExists }.into());
                    }
                    OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .open(path)
                        .with_context(|| format!("failed to create {:?}", path))?
                }
                crate::cmd::FileMode::WriteCreate => {
                    OpenOptions::new().write(true).create(true).truncate(true).open(path).with_context(|| format!("failed to open {:?} for writing", path))?
                }
            };
            unsafe { Stdio::from_raw_fd(file.into_raw_fd()) }
        }
    })
}

/// Read a pipe end to completion, retaining only the last `max_bytes`.
fn capture_tail(fd: RawFd, max_bytes: usize) -> Vec<u8> {
    let mut file = unsafe { File::from_raw_fd(fd) };
    let mut tail: VecDeque<u8> = VecDeque::with_capacity(max_bytes.min(1 << 20));
    let mut buf = [0u8; 8192];
    loop {
        match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                for &b in &buf[..n] {
                    if tail.len() == max_bytes {
                        tail.pop_front();
                    }
                    tail.push_back(b);
                }
            }
            Err(_) => break,
        }
    }
    tail.into_iter().collect()
}

/// Pump bytes from `src` (a pipe read end) to this process's own stdout,
/// preferring a zero-copy `splice(2)` and falling back to a buffered copy
/// loop when the kernel declines (e.g. destination is not a pipe and the
/// platform's splice can't bridge it). EPIPE/broken-pipe is swallowed: the
/// downstream exit code is the signal of record.
fn pump_to_stdout(src: RawFd, chunk_bytes: usize, counter: &Arc<AtomicU64>) {
    let stdout_fd = std::io::stdout().as_raw_fd();
    let mut buf = vec![0u8; chunk_bytes];
    loop {
        match splice(src, None, stdout_fd, None, chunk_bytes, SpliceFFlags::empty()) {
            Ok(0) => break,
            Ok(n) => {
                counter.fetch_add(n as u64, Ordering::SeqCst);
                continue;
            }
            Err(nix::Error::Sys(nix::errno::Errno::EPIPE)) => break,
            Err(_) => {
                // splice unsupported for this fd pair; fall back to read/write.
                let mut file = unsafe { File::from_raw_fd(src) };
                loop {
                    match file.read(&mut buf) {
                        Ok(0) => return,
                        Ok(n) => {
                            use std::io::Write;
                            if std::io::stdout().write_all(&buf[..n]).is_err() {
                                return;
                            }
                            counter.fetch_add(n as u64, Ordering::SeqCst);
                        }
                        Err(_) => return,
                    }
                }
            }
        }
    }
}
