// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

//! Background block-job control framework.
//!
//! A job's driver runs on a dedicated worker thread and cooperates with
//! the controlling side through shared flags and a kick eventfd: pausing,
//! cancellation and speed changes are requests the driver observes at its
//! own pause and sleep points, never preemption. A driver may hand back a
//! deferred exit stage, which runs on the thread that joins the job:
//! the moral equivalent of deferring completion work to the main loop.

#[macro_use]
extern crate log;

use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vmm_sys_util::eventfd::EventFd;

#[derive(Error, Debug)]
pub enum JobError {
    /// Cannot create EventFd.
    #[error("Error creating EventFd: {0}")]
    EventFd(#[source] io::Error),
    /// Cannot create epoll context.
    #[error("Error creating epoll context: {0}")]
    Epoll(#[source] io::Error),
    /// Cannot spawn the job worker thread.
    #[error("Error spawning job thread: {0}")]
    ThreadSpawn(#[source] io::Error),
}

pub type JobResult<T> = std::result::Result<T, JobError>;

/// Per-error-source policy configured on a job.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    #[default]
    Report,
    Ignore,
    /// Stop on ENOSPC, report anything else.
    Enospc,
    Stop,
}

/// What to do about one failed request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorAction {
    Report,
    Ignore,
    Stop,
}

/// Resolve a policy against a concrete errno.
pub fn error_action(policy: OnError, errno: i32) -> ErrorAction {
    match policy {
        OnError::Report => ErrorAction::Report,
        OnError::Ignore => ErrorAction::Ignore,
        OnError::Stop => ErrorAction::Stop,
        OnError::Enospc => {
            if errno == libc::ENOSPC {
                ErrorAction::Stop
            } else {
                ErrorAction::Report
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoStatus {
    Ok,
    Failed,
    NoSpace,
}

impl IoStatus {
    fn from_u32(v: u32) -> IoStatus {
        match v {
            1 => IoStatus::Failed,
            2 => IoStatus::NoSpace,
            _ => IoStatus::Ok,
        }
    }

    fn as_u32(self) -> u32 {
        match self {
            IoStatus::Ok => 0,
            IoStatus::Failed => 1,
            IoStatus::NoSpace => 2,
        }
    }

    pub fn from_errno(errno: i32) -> IoStatus {
        if errno == libc::ENOSPC {
            IoStatus::NoSpace
        } else {
            IoStatus::Failed
        }
    }
}

struct JobState {
    id: String,
    cancelled: AtomicBool,
    pause_count: AtomicU32,
    paused: AtomicBool,
    speed: AtomicU64,
    offset: AtomicU64,
    len: AtomicU64,
    iostatus: AtomicU32,
    ready: AtomicBool,
    kick: EventFd,
}

impl JobState {
    fn kick(&self) {
        let _ = self.kick.write(1);
    }
}

/// Deferred completion stage: receives the run loop's return code and
/// yields the job's final code.
pub type ExitFn = Box<dyn FnOnce(i32) -> i32 + Send>;

/// Driver-side view of a job.
pub struct JobCtx {
    state: Arc<JobState>,
    epoll_file: File,
}

/// Waits never block longer than this, so a missed kick only costs
/// latency, not liveness.
const MAX_WAIT_MS: i32 = 50;

impl JobCtx {
    fn new(state: Arc<JobState>) -> JobResult<Self> {
        let epoll_fd = epoll::create(true).map_err(JobError::Epoll)?;
        // Use 'File' to enforce closing on 'epoll_fd'
        // SAFETY: epoll_fd is a valid fd
        let epoll_file = unsafe { File::from_raw_fd(epoll_fd) };
        epoll::ctl(
            epoll_file.as_raw_fd(),
            epoll::ControlOptions::EPOLL_CTL_ADD,
            state.kick.as_raw_fd(),
            epoll::Event::new(epoll::Events::EPOLLIN, 0),
        )
        .map_err(JobError::Epoll)?;
        Ok(JobCtx { state, epoll_file })
    }

    pub fn id(&self) -> &str {
        &self.state.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Withdraw a pending cancellation so the job can report clean
    /// completion; used once a job decides cancel must finish cleanly.
    pub fn reset_cancel(&self) {
        self.state.cancelled.store(false, Ordering::Release);
    }

    pub fn speed(&self) -> u64 {
        self.state.speed.load(Ordering::Acquire)
    }

    pub fn should_pause(&self) -> bool {
        self.state.pause_count.load(Ordering::Acquire) > 0
    }

    /// Ask for a pause from inside the job (used by the Stop error action).
    pub fn request_pause(&self) {
        self.state.pause_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Cooperative pause point: runs `on_pause` once if a pause was
    /// requested, then parks until resumed. There is no matching resume
    /// callback; the driver simply continues its loop.
    pub fn pause_point(&self, on_pause: impl FnOnce()) {
        if !self.should_pause() {
            return;
        }
        on_pause();
        self.state.paused.store(true, Ordering::Release);
        while self.should_pause() {
            self.wait_kick(MAX_WAIT_MS);
        }
        self.state.paused.store(false, Ordering::Release);
    }

    /// Kick-interruptible sleep.
    pub fn sleep_ns(&self, ns: u64) {
        if self.is_cancelled() {
            return;
        }
        if ns == 0 {
            thread::yield_now();
            return;
        }
        let ms = (ns.div_ceil(1_000_000) as i32).clamp(1, MAX_WAIT_MS);
        self.wait_kick(ms);
    }

    fn wait_kick(&self, timeout_ms: i32) {
        let mut events = [epoll::Event::new(epoll::Events::empty(), 0)];
        match epoll::wait(self.epoll_file.as_raw_fd(), timeout_ms, &mut events) {
            Ok(n) if n > 0 => {
                let _ = self.state.kick.read();
            }
            Ok(_) => (),
            Err(e) => {
                if e.kind() != io::ErrorKind::Interrupted {
                    warn!("job '{}': epoll_wait failed: {e}", self.state.id);
                }
            }
        }
    }

    pub fn kick_fd(&self) -> RawFd {
        self.state.kick.as_raw_fd()
    }

    /// Drain the kick eventfd after an external poller observed it.
    pub fn clear_kick(&self) {
        let _ = self.state.kick.read();
    }

    /// Report that the job has reached its ready point.
    pub fn event_ready(&self) {
        if !self.state.ready.swap(true, Ordering::AcqRel) {
            info!("job '{}': ready", self.state.id);
        }
    }

    pub fn iostatus(&self) -> IoStatus {
        IoStatus::from_u32(self.state.iostatus.load(Ordering::Acquire))
    }

    pub fn set_iostatus(&self, status: IoStatus) {
        self.state
            .iostatus
            .store(status.as_u32(), Ordering::Release);
    }

    pub fn progress_offset(&self) -> u64 {
        self.state.offset.load(Ordering::Acquire)
    }

    pub fn add_progress(&self, bytes: u64) {
        self.state.offset.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn set_progress_len(&self, len: u64) {
        self.state.len.store(len, Ordering::Release);
    }
}

/// Spawn a job driver on its own worker thread.
pub fn spawn<F>(id: &str, driver: F) -> JobResult<JobHandle>
where
    F: FnOnce(JobCtx) -> (i32, Option<ExitFn>) + Send + 'static,
{
    let state = Arc::new(JobState {
        id: id.to_string(),
        cancelled: AtomicBool::new(false),
        pause_count: AtomicU32::new(0),
        paused: AtomicBool::new(false),
        speed: AtomicU64::new(0),
        offset: AtomicU64::new(0),
        len: AtomicU64::new(0),
        iostatus: AtomicU32::new(IoStatus::Ok.as_u32()),
        ready: AtomicBool::new(false),
        kick: EventFd::new(libc::EFD_NONBLOCK).map_err(JobError::EventFd)?,
    });
    let ctx = JobCtx::new(state.clone())?;
    let thread = thread::Builder::new()
        .name(format!("block-job-{id}"))
        .spawn(move || driver(ctx))
        .map_err(JobError::ThreadSpawn)?;
    Ok(JobHandle {
        state,
        thread: Mutex::new(Some(thread)),
        completion: Mutex::new(None),
    })
}

/// Controlling-side view of a job.
pub struct JobHandle {
    state: Arc<JobState>,
    #[allow(clippy::type_complexity)]
    thread: Mutex<Option<thread::JoinHandle<(i32, Option<ExitFn>)>>>,
    completion: Mutex<Option<i32>>,
}

impl JobHandle {
    pub fn id(&self) -> &str {
        &self.state.id
    }

    pub fn pause(&self) {
        self.state.pause_count.fetch_add(1, Ordering::AcqRel);
        self.state.kick();
    }

    pub fn resume(&self) {
        let prev = self.state.pause_count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "resume without matching pause");
        // Resuming also retries after a Stop error action.
        self.state
            .iostatus
            .store(IoStatus::Ok.as_u32(), Ordering::Release);
        self.state.kick();
    }

    pub fn is_paused(&self) -> bool {
        self.state.paused.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Release);
        self.state.kick();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    pub fn set_speed(&self, bytes_per_sec: u64) {
        self.state.speed.store(bytes_per_sec, Ordering::Release);
        self.state.kick();
    }

    pub fn speed(&self) -> u64 {
        self.state.speed.load(Ordering::Acquire)
    }

    pub fn is_ready(&self) -> bool {
        self.state.ready.load(Ordering::Acquire)
    }

    pub fn iostatus(&self) -> IoStatus {
        IoStatus::from_u32(self.state.iostatus.load(Ordering::Acquire))
    }

    /// (bytes processed, current estimated total).
    pub fn progress(&self) -> (u64, u64) {
        (
            self.state.offset.load(Ordering::Acquire),
            self.state.len.load(Ordering::Acquire),
        )
    }

    pub fn kick(&self) {
        self.state.kick();
    }

    /// Wait for the driver to finish, run the deferred exit stage on the
    /// calling thread, and return the job's final code (0 or a negated
    /// errno). Idempotent.
    pub fn join(&self) -> i32 {
        if let Some(code) = *self.completion.lock().unwrap() {
            return code;
        }
        let thread = self
            .thread
            .lock()
            .unwrap()
            .take()
            .expect("job joined exactly once");
        let (ret, exit) = thread.join().expect("job thread does not panic");
        let code = match exit {
            Some(exit) => exit(ret),
            None => ret,
        };
        info!("job '{}': completed with code {}", self.state.id, code);
        *self.completion.lock().unwrap() = Some(code);
        code
    }
}
