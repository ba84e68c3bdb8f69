//! Exec-mode state machine for the emulation worker thread
//!
//! The machine owns the worker's run/suspend state and the two hand-off
//! signals between the controller side and the worker:
//!
//! - the **resume** semaphore ("may proceed"), posted by the controller when
//!   it flips a suspended VM back to `Opened`;
//! - the **stopped** semaphore ("fully stopped"), posted by the worker once it
//!   has acted on a suspend request at its checkpoint.
//!
//! ## Transitions
//!
//! ```text
//! NotStarted --start--> Closing
//! Opened --pause--> Pausing --checkpoint--> Paused --resume--> Opened
//! Opened --suspend--> Closing --checkpoint--> Closed --resume--> Opened
//! Paused --blocking suspend--> Closing
//! ```
//!
//! Every transition happens under one mutex, so observers see a total order.
//! The mode is mirrored in an atomic for lock-free queries; those are
//! best-effort and may be stale as soon as they return.

use crate::error::{VmError, VmResult};
use crate::sync::Semaphore;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// Run/suspend state of the emulation worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExecMode {
    /// Worker thread object exists but was never started
    NotStarted = 0,
    /// Emulation is running
    Opened = 1,
    /// Light suspend requested, not yet acknowledged by the worker
    Pausing = 2,
    /// Light suspend in effect; VM memory stays live
    Paused = 3,
    /// Heavy suspend requested, not yet acknowledged by the worker
    Closing = 4,
    /// Heavy suspend in effect; plugins are closed
    Closed = 5,
}

impl ExecMode {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ExecMode::Opened,
            2 => ExecMode::Pausing,
            3 => ExecMode::Paused,
            4 => ExecMode::Closing,
            5 => ExecMode::Closed,
            _ => ExecMode::NotStarted,
        }
    }

    /// `Paused` or `Closed`.
    pub fn is_suspended(self) -> bool {
        matches!(self, ExecMode::Paused | ExecMode::Closed)
    }

    /// `Pausing` or `Closing`: a suspend request the worker has not acted on.
    pub fn is_suspending(self) -> bool {
        matches!(self, ExecMode::Pausing | ExecMode::Closing)
    }

    /// Whether `self -> next` is an edge of the transition table.
    pub fn can_transition_to(self, next: ExecMode) -> bool {
        use ExecMode::*;
        matches!(
            (self, next),
            (NotStarted, Closing)
                | (Opened, Pausing)
                | (Opened, Closing)
                | (Pausing, Paused)
                | (Closing, Closed)
                | (Paused, Opened)
                | (Closed, Opened)
                | (Paused, Closing)
        )
    }
}

impl fmt::Display for ExecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecMode::NotStarted => "NotStarted",
            ExecMode::Opened => "Opened",
            ExecMode::Pausing => "Pausing",
            ExecMode::Paused => "Paused",
            ExecMode::Closing => "Closing",
            ExecMode::Closed => "Closed",
        };
        f.write_str(name)
    }
}

/// Weight of a suspend: what the worker tears down at its checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SuspendKind {
    /// Light suspend: stop executing, keep plugins open
    Pause,
    /// Heavy suspend: close plugins
    Close,
}

impl SuspendKind {
    fn target(self) -> ExecMode {
        match self {
            SuspendKind::Pause => ExecMode::Paused,
            SuspendKind::Close => ExecMode::Closed,
        }
    }
}

/// Side effects the worker performs at its checkpoint.
pub trait CheckpointHooks {
    /// Called on the worker thread before it acknowledges a suspend.
    fn on_suspend(&mut self, kind: SuspendKind) -> VmResult<()>;

    /// Called on the worker thread after a resume, before emulation
    /// continues. `kind` is the heaviest suspend since the last resume.
    fn on_resume(&mut self, kind: SuspendKind) -> VmResult<()>;
}

/// Callback invoked under the state lock for every transition.
pub type TransitionObserver = Box<dyn Fn(ExecMode, ExecMode) + Send + Sync>;

/// Mode plus bookkeeping, guarded by the state lock
struct ModeState {
    mode: ExecMode,

    /// Controller threads blocked on the stopped semaphore
    stopped_waiters: usize,

    /// Heaviest suspend acknowledged since the last successful on-resume
    pending_resume: Option<SuspendKind>,
}

/// Suspend/resume/close state of one emulation worker.
///
/// Created with the worker thread object and dropped with it.
pub struct ExecModeStateMachine {
    state: Mutex<ModeState>,

    /// Lock-free mirror of `state.mode`
    fast_mode: AtomicU8,

    /// "May proceed": posted on resume and on cancellation
    resume_sem: Semaphore,

    /// "Fully stopped": posted once per registered waiter on each settle
    stopped_sem: Semaphore,

    /// External cancellation request
    cancel_requested: AtomicBool,

    /// The worker ran its terminal close; nothing will take a resume permit
    exited: AtomicBool,

    /// Identity of the worker thread, once bound
    worker: Mutex<Option<ThreadId>>,

    /// Longest a controller waits for the worker to settle
    stop_timeout: Duration,

    /// Bounded spin before resume falls back to the stopped semaphore
    resume_spin: Duration,

    observer: Option<TransitionObserver>,
}

impl ExecModeStateMachine {
    /// Create a machine in `NotStarted`.
    pub fn new(stop_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(ModeState {
                mode: ExecMode::NotStarted,
                stopped_waiters: 0,
                pending_resume: None,
            }),
            fast_mode: AtomicU8::new(ExecMode::NotStarted as u8),
            resume_sem: Semaphore::new(0),
            stopped_sem: Semaphore::new(0),
            cancel_requested: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            worker: Mutex::new(None),
            stop_timeout,
            resume_spin: Duration::ZERO,
            observer: None,
        }
    }

    /// Install a transition observer.
    ///
    /// The observer runs under the state lock and must not call back into
    /// the machine.
    pub fn with_observer(mut self, observer: TransitionObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Spin this long on a settling suspend before `resume` blocks.
    pub fn with_resume_spin(mut self, spin: Duration) -> Self {
        self.resume_spin = spin;
        self
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Current mode (lock-free, best-effort).
    pub fn mode(&self) -> ExecMode {
        ExecMode::from_u8(self.fast_mode.load(Ordering::Acquire))
    }

    /// Emulation is running.
    pub fn is_opened(&self) -> bool {
        self.mode() == ExecMode::Opened
    }

    /// Light suspend in effect.
    pub fn is_paused(&self) -> bool {
        self.mode() == ExecMode::Paused
    }

    /// Heavy suspend in effect.
    pub fn is_closed(&self) -> bool {
        self.mode() == ExecMode::Closed
    }

    /// `start` has been called.
    pub fn is_started(&self) -> bool {
        self.mode() != ExecMode::NotStarted
    }

    /// A cancellation was requested.
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    /// The worker thread has left its loop for good.
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    /// Configured stop timeout.
    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout
    }

    // ========================================================================
    // Controller side
    // ========================================================================

    /// Mark the worker as launched. The first checkpoint then performs the
    /// cold-open side effects.
    pub fn start(&self) -> VmResult<()> {
        let mut state = self.state.lock();
        if state.mode != ExecMode::NotStarted {
            return Err(VmError::AlreadyStarted);
        }
        self.set_mode(&mut state, ExecMode::Closing);
        Ok(())
    }

    /// Request a heavy suspend. Returns whether the VM was running.
    ///
    /// A non-blocking request while a pause is in flight or in effect is
    /// rejected with `InvalidTransition`. A blocking request waits for the
    /// pause to settle and then escalates it to a close.
    pub fn suspend(&self, blocking: bool) -> VmResult<bool> {
        // Fast path: already closed and nothing to wait for.
        if !blocking && matches!(self.mode(), ExecMode::Closed | ExecMode::NotStarted) {
            let state = self.state.lock();
            if matches!(state.mode, ExecMode::Closed | ExecMode::NotStarted) {
                return Ok(false);
            }
        }

        let blocking = blocking && !self.is_worker_thread();
        let mut state = self.state.lock();
        loop {
            match state.mode {
                ExecMode::NotStarted | ExecMode::Closed => return Ok(false),
                ExecMode::Closing => {
                    if blocking {
                        self.wait_until_settled(&mut state)?;
                    }
                    return Ok(false);
                }
                ExecMode::Pausing => {
                    if !blocking {
                        return Err(VmError::InvalidTransition {
                            from: state.mode,
                            requested: "suspend",
                        });
                    }
                    self.wait_until_settled(&mut state)?;
                }
                ExecMode::Paused => {
                    if !blocking {
                        return Err(VmError::InvalidTransition {
                            from: state.mode,
                            requested: "suspend",
                        });
                    }
                    self.set_mode(&mut state, ExecMode::Closing);
                    // The worker is parked on the resume semaphore.
                    self.resume_sem.post();
                    self.wait_until_settled(&mut state)?;
                    return Ok(false);
                }
                ExecMode::Opened => {
                    self.set_mode(&mut state, ExecMode::Closing);
                    if blocking {
                        self.wait_until_settled(&mut state)?;
                    }
                    return Ok(true);
                }
            }
        }
    }

    /// Request a light suspend and wait for the worker to acknowledge it.
    /// Returns whether the VM was running.
    ///
    /// Called on the worker thread, the request is recorded and acted on at
    /// the next checkpoint.
    pub fn pause(&self) -> VmResult<bool> {
        let blocking = !self.is_worker_thread();
        let mut state = self.state.lock();
        match state.mode {
            ExecMode::NotStarted | ExecMode::Paused | ExecMode::Closed => Ok(false),
            ExecMode::Pausing | ExecMode::Closing => {
                if blocking {
                    self.wait_until_settled(&mut state)?;
                }
                Ok(false)
            }
            ExecMode::Opened => {
                self.set_mode(&mut state, ExecMode::Pausing);
                if blocking {
                    self.wait_until_settled(&mut state)?;
                }
                Ok(true)
            }
        }
    }

    /// Resume a suspended VM. Returns whether this call resumed it.
    ///
    /// Already `Opened` returns `Ok(false)` without blocking. A suspend still
    /// in flight is waited out first; if another controller changed the mode
    /// during that wait, the call gives up and returns `Ok(false)`. Once the
    /// worker has exited, fails with `WorkerExited`.
    pub fn resume(&self) -> VmResult<bool> {
        if self.mode() == ExecMode::Opened {
            let state = self.state.lock();
            if state.mode == ExecMode::Opened {
                return Ok(false);
            }
        }
        if self.mode().is_suspending() {
            self.spin_until_settled();
        }

        let mut state = self.state.lock();
        match state.mode {
            ExecMode::NotStarted => return Err(VmError::NotStarted),
            ExecMode::Opened => return Ok(false),
            ExecMode::Pausing | ExecMode::Closing => {
                if self.is_worker_thread() {
                    return Err(VmError::InvalidTransition {
                        from: state.mode,
                        requested: "resume from the worker thread",
                    });
                }
                self.wait_until_settled(&mut state)?;
                if !state.mode.is_suspended() {
                    log::warn!(
                        "resume: mode changed to {} while waiting for the worker; giving up",
                        state.mode
                    );
                    return Ok(false);
                }
            }
            ExecMode::Paused | ExecMode::Closed => {}
        }

        if self.has_exited() {
            return Err(VmError::WorkerExited);
        }
        self.set_mode(&mut state, ExecMode::Opened);
        self.resume_sem.post();
        Ok(true)
    }

    /// Ask the worker to terminate at its next checkpoint, waking it if it
    /// is parked.
    pub fn request_cancel(&self) {
        if !self.cancel_requested.swap(true, Ordering::AcqRel) {
            log::debug!("exec mode: cancellation requested");
        }
        self.resume_sem.post();
    }

    // ========================================================================
    // Worker side
    // ========================================================================

    /// Record the calling thread as the worker thread.
    pub fn bind_worker_thread(&self) {
        *self.worker.lock() = Some(thread::current().id());
    }

    /// True on the bound worker thread.
    pub fn is_worker_thread(&self) -> bool {
        *self.worker.lock() == Some(thread::current().id())
    }

    /// The per-frame checkpoint. Worker thread only.
    ///
    /// Returns immediately while `Opened`. On a pending suspend it runs
    /// `on_suspend`, acknowledges, and parks until resumed, then runs
    /// `on_resume` before returning. Returns `ThreadCancelled` once a
    /// cancellation was requested. Hook failures are returned after the
    /// state is settled; a failing `on_resume` leaves the VM `Closed`.
    pub fn state_check_in_thread<H>(&self, hooks: &mut H) -> VmResult<()>
    where
        H: CheckpointHooks + ?Sized,
    {
        if self.mode() == ExecMode::Opened && !self.is_cancel_requested() {
            let state = self.state.lock();
            if state.mode == ExecMode::Opened && state.pending_resume.is_none() {
                return Ok(());
            }
        }

        let mut state = self.state.lock();
        loop {
            if self.is_cancel_requested() {
                return Err(VmError::ThreadCancelled);
            }
            match state.mode {
                ExecMode::NotStarted => return Err(VmError::NotStarted),
                ExecMode::Opened => break,
                ExecMode::Pausing | ExecMode::Closing => {
                    let kind = if state.mode == ExecMode::Pausing {
                        SuspendKind::Pause
                    } else {
                        SuspendKind::Close
                    };
                    // Nobody else moves the mode out of Pausing/Closing, so
                    // the hook can run unlocked.
                    let result = MutexGuard::unlocked(&mut state, || hooks.on_suspend(kind));
                    self.settle(&mut state, kind);
                    result?;
                }
                ExecMode::Paused | ExecMode::Closed => {
                    MutexGuard::unlocked(&mut state, || self.resume_sem.wait());
                }
            }
        }

        let Some(kind) = state.pending_resume else {
            return Ok(());
        };
        let result = MutexGuard::unlocked(&mut state, || hooks.on_resume(kind));
        match result {
            Ok(()) => {
                state.pending_resume = None;
                Ok(())
            }
            Err(e) => {
                log::error!("checkpoint: on-resume failed, staying closed: {}", e);
                if state.mode == ExecMode::Opened {
                    self.set_mode(&mut state, ExecMode::Closing);
                    let _ = MutexGuard::unlocked(&mut state, || hooks.on_suspend(SuspendKind::Close));
                    self.settle(&mut state, SuspendKind::Close);
                }
                Err(e)
            }
        }
    }

    /// Bring the machine to `Closed` on worker exit, running the close hook
    /// and waking every controller waiting for a stop. Worker thread only.
    ///
    /// Marks the machine exited: later resumes fail instead of releasing a
    /// worker that is gone.
    pub fn close_in_thread<H>(&self, hooks: &mut H) -> VmResult<()>
    where
        H: CheckpointHooks + ?Sized,
    {
        let mut state = self.state.lock();
        self.exited.store(true, Ordering::Release);
        match state.mode {
            ExecMode::NotStarted | ExecMode::Closed => {
                let waiters = std::mem::take(&mut state.stopped_waiters);
                self.stopped_sem.post_many(waiters);
                return Ok(());
            }
            ExecMode::Opened => self.set_mode(&mut state, ExecMode::Closing),
            ExecMode::Pausing => {
                self.set_mode(&mut state, ExecMode::Paused);
                self.set_mode(&mut state, ExecMode::Closing);
            }
            ExecMode::Paused => self.set_mode(&mut state, ExecMode::Closing),
            ExecMode::Closing => {}
        }
        let result = MutexGuard::unlocked(&mut state, || hooks.on_suspend(SuspendKind::Close));
        self.settle(&mut state, SuspendKind::Close);
        result
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn set_mode(&self, state: &mut ModeState, to: ExecMode) {
        let from = state.mode;
        debug_assert!(
            from.can_transition_to(to),
            "illegal exec mode transition {} -> {}",
            from,
            to
        );
        state.mode = to;
        self.fast_mode.store(to as u8, Ordering::Release);
        log::debug!("exec mode: {} -> {}", from, to);
        if let Some(observer) = &self.observer {
            observer(from, to);
        }
    }

    /// Acknowledge a suspend: flip to the stopped mode and wake every
    /// registered waiter.
    fn settle(&self, state: &mut MutexGuard<'_, ModeState>, kind: SuspendKind) {
        self.set_mode(state, kind.target());
        state.pending_resume = state.pending_resume.max(Some(kind));
        let waiters = std::mem::take(&mut state.stopped_waiters);
        self.stopped_sem.post_many(waiters);
    }

    /// Block until the mode is no longer `Pausing`/`Closing`.
    ///
    /// Wakes are re-validated under the lock, so stale permits only cost a
    /// spurious loop.
    fn wait_until_settled(&self, state: &mut MutexGuard<'_, ModeState>) -> VmResult<()> {
        let deadline = Instant::now() + self.stop_timeout;
        while state.mode.is_suspending() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                log::error!(
                    "exec mode: worker did not settle from {} within {:?}",
                    state.mode,
                    self.stop_timeout
                );
                return Err(VmError::StopTimeout {
                    waited: self.stop_timeout,
                });
            }
            state.stopped_waiters += 1;
            MutexGuard::unlocked(state, || self.stopped_sem.wait_timeout(remaining));
        }
        Ok(())
    }

    fn spin_until_settled(&self) {
        if self.resume_spin.is_zero() {
            return;
        }
        let start = Instant::now();
        while self.mode().is_suspending() && start.elapsed() < self.resume_spin {
            thread::yield_now();
        }
    }
}

impl fmt::Debug for ExecModeStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecModeStateMachine")
            .field("mode", &self.mode())
            .field("cancel_requested", &self.is_cancel_requested())
            .field("exited", &self.has_exited())
            .finish()
    }
}
