//! Scoped pause/close guards
//!
//! A guard suspends the VM when it is built and, if the scope ended with
//! [`allow_resume`](ScopedPause::allow_resume) called, resumes it when it is
//! dropped. A scope that unwinds or returns early without that call leaves
//! the VM suspended.
//!
//! ## Reentrancy
//!
//! Guards built against the same [`GuardContext`] nest: an inner pause inside
//! a pause (or anything inside a close) is a no-op. An inner close inside a
//! pause escalates the suspend but never resumes, since the VM was already
//! stopped when it began.
//!
//! Across threads, the outermost guard of each thread takes the emulator's
//! scope lock, so a guard built on a second thread blocks until the first
//! thread's scope ends. Guards built on the executor thread never block on
//! the lock: if another thread owns the scope they suspend without it.

use crate::emulator::Emulator;
use crate::error::{VmError, VmResult};
use crate::exec_mode::SuspendKind;
use parking_lot::ReentrantMutexGuard;
use std::cell::Cell;

/// Per-request record of the suspend scopes already entered.
///
/// Create one at the top of an operation and pass it to every guard built
/// while serving it. Not `Sync`: a context belongs to one thread.
#[derive(Debug, Default)]
pub struct GuardContext {
    paused: Cell<bool>,
    closed: Cell<bool>,
}

impl GuardContext {
    /// Context with no scope entered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inside a pause scope.
    pub fn is_paused(&self) -> bool {
        self.paused.get()
    }

    /// Inside a close scope.
    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    fn flag(&self, kind: SuspendKind) -> &Cell<bool> {
        match kind {
            SuspendKind::Pause => &self.paused,
            SuspendKind::Close => &self.closed,
        }
    }

    fn covers(&self, kind: SuspendKind) -> bool {
        match kind {
            SuspendKind::Pause => self.paused.get() || self.closed.get(),
            SuspendKind::Close => self.closed.get(),
        }
    }
}

/// Proof that the VM of an emulator is suspended for as long as the value
/// lives. Required by savestate freeze/thaw.
pub trait VmSuspended {
    /// Emulator whose VM is suspended.
    fn suspended_emulator(&self) -> &Emulator;
}

/// Shared body of the three guards
struct SuspendScope<'a> {
    emulator: &'a Emulator,
    ctx: &'a GuardContext,
    kind: SuspendKind,

    /// Held by the outermost scope on this thread
    _lock: Option<ReentrantMutexGuard<'a, ()>>,

    /// Nested in a scope of at least this weight; does nothing
    already_scoped: bool,

    /// The VM was not running when the scope began
    already_stopped: bool,

    allow_resume: bool,
}

impl<'a> SuspendScope<'a> {
    fn enter(emulator: &'a Emulator, ctx: &'a GuardContext, kind: SuspendKind) -> VmResult<Self> {
        if ctx.covers(kind) {
            log::trace!("scoped {:?}: already inside a covering scope", kind);
            return Ok(Self {
                emulator,
                ctx,
                kind,
                _lock: None,
                already_scoped: true,
                already_stopped: true,
                allow_resume: false,
            });
        }

        if let Some(machine) = emulator.machine() {
            if machine.is_worker_thread() {
                return Err(VmError::InvalidTransition {
                    from: machine.mode(),
                    requested: "enter a suspend scope on the worker thread",
                });
            }
        }

        let lock = if emulator.executor().is_self() {
            let lock = emulator.scope_lock().try_lock();
            if lock.is_none() {
                log::debug!("scoped {:?}: scope owned by another thread, deferring", kind);
            }
            lock
        } else {
            Some(emulator.scope_lock().lock())
        };

        let was_running = match kind {
            SuspendKind::Pause => emulator.pause()?,
            SuspendKind::Close => emulator.suspend(true)?,
        };
        ctx.flag(kind).set(true);

        Ok(Self {
            emulator,
            ctx,
            kind,
            _lock: lock,
            already_scoped: false,
            already_stopped: !was_running,
            allow_resume: false,
        })
    }
}

impl Drop for SuspendScope<'_> {
    fn drop(&mut self) {
        if self.already_scoped {
            return;
        }
        self.ctx.flag(self.kind).set(false);
        if self.already_stopped {
            return;
        }
        if !self.allow_resume {
            log::debug!("scoped {:?}: left without allow_resume, VM stays suspended", self.kind);
            return;
        }
        if let Err(e) = self.emulator.resume() {
            log::warn!("scoped {:?}: resume on exit failed: {}", self.kind, e);
        }
    }
}

/// Pauses the VM for the guard's lifetime.
pub struct ScopedPause<'a> {
    scope: SuspendScope<'a>,
}

impl<'a> ScopedPause<'a> {
    /// Pause the VM (no-op inside a covering scope of `ctx`).
    pub fn new(emulator: &'a Emulator, ctx: &'a GuardContext) -> VmResult<Self> {
        Ok(Self {
            scope: SuspendScope::enter(emulator, ctx, SuspendKind::Pause)?,
        })
    }

    /// Resume the VM when the guard is dropped.
    pub fn allow_resume(&mut self) {
        self.scope.allow_resume = true;
    }

    /// Whether this guard is a nested no-op.
    pub fn is_nested(&self) -> bool {
        self.scope.already_scoped
    }
}

/// Closes the VM (plugins closed) for the guard's lifetime.
pub struct ScopedClose<'a> {
    scope: SuspendScope<'a>,
}

impl<'a> ScopedClose<'a> {
    /// Close the VM (no-op inside a close scope of `ctx`).
    pub fn new(emulator: &'a Emulator, ctx: &'a GuardContext) -> VmResult<Self> {
        Ok(Self {
            scope: SuspendScope::enter(emulator, ctx, SuspendKind::Close)?,
        })
    }

    /// Resume the VM when the guard is dropped.
    pub fn allow_resume(&mut self) {
        self.scope.allow_resume = true;
    }

    /// Whether this guard is a nested no-op.
    pub fn is_nested(&self) -> bool {
        self.scope.already_scoped
    }
}

/// Suspends the VM while a modal popup is shown.
///
/// Pauses by default; closes when `gs.close_on_popup` is set, since a
/// fullscreen GS window would hide the popup.
pub struct ScopedPopup<'a> {
    scope: SuspendScope<'a>,
}

impl<'a> ScopedPopup<'a> {
    /// Suspend the VM for a popup.
    pub fn new(emulator: &'a Emulator, ctx: &'a GuardContext) -> VmResult<Self> {
        let kind = if emulator.config().gs.close_on_popup {
            SuspendKind::Close
        } else {
            SuspendKind::Pause
        };
        Ok(Self {
            scope: SuspendScope::enter(emulator, ctx, kind)?,
        })
    }

    /// Resume the VM when the guard is dropped.
    pub fn allow_resume(&mut self) {
        self.scope.allow_resume = true;
    }

    /// Whether the popup closed the VM rather than pausing it.
    pub fn is_closing(&self) -> bool {
        self.scope.kind == SuspendKind::Close
    }
}

impl VmSuspended for ScopedPause<'_> {
    fn suspended_emulator(&self) -> &Emulator {
        self.scope.emulator
    }
}

impl VmSuspended for ScopedClose<'_> {
    fn suspended_emulator(&self) -> &Emulator {
        self.scope.emulator
    }
}

impl VmSuspended for ScopedPopup<'_> {
    fn suspended_emulator(&self) -> &Emulator {
        self.scope.emulator
    }
}
