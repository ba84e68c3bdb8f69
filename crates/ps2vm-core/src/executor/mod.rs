//! Command executor: one thread, one FIFO queue
//!
//! Every state-mutating call on the emulator is funneled through this thread,
//! so cross-thread requests are linearized in the order they were posted.
//! Callers choose between fire-and-forget (`post`) and a blocking RPC
//! (`send`); `try_invoke_self` lets a method be written once and called from
//! any thread, including the executor itself.

mod action;

pub use action::{ResultSlot, SyncAction};
pub(crate) use action::panic_message;

use crate::error::{VmError, VmResult};
use crate::events::{EventSink, VmEvent};
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

/// Queue contents, guarded by the queue lock
struct QueueState {
    /// Posted, not yet invoked
    pending: VecDeque<SyncAction>,

    /// The executor thread has left its loop
    exited: bool,
}

/// State shared between the executor handle and its thread
struct ExecutorShared {
    queue: Mutex<QueueState>,

    /// Signalled when the queue goes from empty to non-empty, or on shutdown
    wake: Condvar,

    /// Set by `shutdown_queue`
    shutdown: AtomicBool,

    /// Failure reports for fire-and-forget actions
    events: EventSink,

    /// Actions invoked so far
    invoked: AtomicU64,

    /// Actions dropped unexecuted
    discarded: AtomicU64,
}

impl ExecutorShared {
    fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Process the queue until it is empty.
    ///
    /// The queue lock is released around each invocation so actions may post
    /// new actions.
    fn drain(&self) -> usize {
        let mut processed = 0;
        loop {
            let action = match self.queue.lock().pending.pop_front() {
                Some(action) => action,
                None => break,
            };
            if self.is_shutting_down() && action.allows_cancel() {
                self.discard(action);
            } else {
                self.invoke(action);
            }
            processed += 1;
        }
        processed
    }

    fn invoke(&self, action: SyncAction) {
        let name = action.name();
        log::trace!("executor: invoking '{}'", name);
        if let Some(error) = action.invoke() {
            log::warn!("executor: action '{}' failed: {}", name, error);
            self.events.publish(VmEvent::ActionFailed {
                action: name,
                error,
            });
        }
        self.invoked.fetch_add(1, Ordering::Relaxed);
    }

    fn discard(&self, action: SyncAction) {
        log::warn!(
            "executor: dropping '{}' unexecuted (queue shutting down)",
            action.name()
        );
        action.discard();
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Executor thread main loop
    fn run_loop(&self) {
        loop {
            {
                let mut queue = self.queue.lock();
                while queue.pending.is_empty() && !self.is_shutting_down() {
                    self.wake.wait(&mut queue);
                }
                if queue.pending.is_empty() {
                    // Shutting down with nothing left. Later critical posts
                    // run on their caller.
                    queue.exited = true;
                    break;
                }
            }
            self.drain();
        }
        log::debug!("executor: thread exiting");
    }
}

/// Handle to the serialized command executor.
pub struct CommandExecutor {
    shared: Arc<ExecutorShared>,

    /// Executor thread handle (taken on join)
    handle: Mutex<Option<JoinHandle<()>>>,

    /// Identity of the executor thread
    thread_id: OnceCell<ThreadId>,
}

impl CommandExecutor {
    /// Spawn the executor thread.
    pub fn start(name: &str, events: EventSink) -> VmResult<Self> {
        let shared = Arc::new(ExecutorShared {
            queue: Mutex::new(QueueState {
                pending: VecDeque::new(),
                exited: false,
            }),
            wake: Condvar::new(),
            shutdown: AtomicBool::new(false),
            events,
            invoked: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        });

        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || thread_shared.run_loop())
            .map_err(VmError::Spawn)?;

        let thread_id = OnceCell::new();
        let _ = thread_id.set(handle.thread().id());
        log::debug!("executor: '{}' started", name);

        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
            thread_id,
        })
    }

    /// True when called from the executor thread.
    pub fn is_self(&self) -> bool {
        self.thread_id.get() == Some(&thread::current().id())
    }

    /// Whether `shutdown_queue` has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.shared.is_shutting_down()
    }

    /// Enqueue an action and return immediately.
    ///
    /// Returns `false` if the action was discarded because the executor is
    /// shutting down and the action is not critical. Critical actions posted
    /// after the executor thread has exited run on the calling thread.
    pub fn post(&self, action: SyncAction) -> bool {
        let mut queue = self.shared.queue.lock();
        if self.shared.is_shutting_down() && !action.is_critical() {
            drop(queue);
            self.shared.discard(action);
            return false;
        }
        if queue.exited {
            drop(queue);
            log::debug!(
                "executor: running critical '{}' on the caller (executor exited)",
                action.name()
            );
            self.shared.invoke(action);
            return true;
        }
        let was_empty = queue.pending.is_empty();
        queue.pending.push_back(action);
        if was_empty {
            self.shared.wake.notify_one();
        }
        true
    }

    /// Run `f` on the executor thread and block until it finishes.
    ///
    /// Errors raised on the executor thread come back as the return value.
    /// Called from the executor thread itself, `f` runs inline.
    pub fn send<T, F>(&self, name: &'static str, f: F) -> VmResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> VmResult<T> + Send + 'static,
    {
        if self.is_self() {
            return f();
        }
        self.dispatch(name, false, f)
    }

    /// Like `send`, but the action is critical and still runs while the
    /// queue is shutting down.
    pub fn send_critical<T, F>(&self, name: &'static str, f: F) -> VmResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> VmResult<T> + Send + 'static,
    {
        if self.is_self() {
            return f();
        }
        self.dispatch(name, true, f)
    }

    fn dispatch<T, F>(&self, name: &'static str, critical: bool, f: F) -> VmResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> VmResult<T> + Send + 'static,
    {
        let value = Arc::new(Mutex::new(None));
        let out = value.clone();
        let slot = Arc::new(ResultSlot::new());

        let mut action = SyncAction::new(name, move || {
            *out.lock() = Some(f()?);
            Ok(())
        });
        if critical {
            action = action.critical();
        }
        self.post(action.with_slot(slot.clone()));

        slot.wait()?;
        let result = value.lock().take();
        result.ok_or(VmError::NotExecuted)
    }

    /// Returns `None` when already on the executor thread (the caller should
    /// proceed inline); otherwise sends `f` and returns its outcome.
    pub fn try_invoke_self<T, F>(&self, name: &'static str, f: F) -> Option<VmResult<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> VmResult<T> + Send + 'static,
    {
        if self.is_self() {
            return None;
        }
        Some(self.send(name, f))
    }

    /// Process everything queued so far.
    ///
    /// On the executor thread this drains inline and returns the number of
    /// actions processed. From any other thread it blocks until every action
    /// posted before the call has been processed and returns 0.
    pub fn drain(&self) -> VmResult<usize> {
        if self.is_self() {
            return Ok(self.shared.drain());
        }
        self.send("drain", || Ok(0))
    }

    /// Stop accepting non-critical work and let the thread wind down.
    ///
    /// Queued non-critical actions resolve as `NotExecuted`; critical ones
    /// still run.
    pub fn shutdown_queue(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!("executor: shutting down queue");
        let _queue = self.shared.queue.lock();
        self.shared.wake.notify_all();
    }

    /// Shut down and wait for the executor thread to exit.
    ///
    /// A no-op when called from the executor thread.
    pub fn join(&self) {
        self.shutdown_queue();
        if self.is_self() {
            return;
        }
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                log::error!("executor: thread terminated by panic");
            }
        }
    }

    /// Number of actions currently queued.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().pending.len()
    }

    /// Number of actions invoked so far.
    pub fn invoked_count(&self) -> u64 {
        self.shared.invoked.load(Ordering::Relaxed)
    }

    /// Number of actions dropped unexecuted.
    pub fn discarded_count(&self) -> u64 {
        self.shared.discarded.load(Ordering::Relaxed)
    }
}

impl Drop for CommandExecutor {
    fn drop(&mut self) {
        self.join();
    }
}
