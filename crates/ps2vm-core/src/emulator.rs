//! Controller facade
//!
//! `Emulator` is the handle the UI side holds. It owns the command executor,
//! the current emulation worker and the shared virtual machine. Every
//! state-mutating call is decided on the executor thread, so requests from
//! different threads are applied in the order they were posted.

use crate::config::VmConfig;
use crate::error::{VmError, VmResult};
use crate::events::{EventSink, VmEvent};
use crate::exec_mode::{ExecMode, ExecModeStateMachine};
use crate::executor::{CommandExecutor, SyncAction};
use crate::guards::{GuardContext, ScopedClose, ScopedPause};
use crate::vm::{SharedVm, VirtualMachine};
use crate::worker::EmulationWorker;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::sync::Arc;

/// Name given to the executor thread.
pub const EXECUTOR_THREAD_NAME: &str = "ps2vm-executor";

struct EmulatorInner {
    executor: CommandExecutor,

    /// Current worker; only touched on the executor thread
    worker: Mutex<Option<EmulationWorker>>,

    /// State machine of the current (or last) worker
    machine: RwLock<Option<Arc<ExecModeStateMachine>>>,

    vm: SharedVm,
    config: RwLock<VmConfig>,
    events: EventSink,

    /// Held by the outermost guard scope of a thread
    scope: ReentrantMutex<()>,
}

/// Cloneable handle to one emulated console.
#[derive(Clone)]
pub struct Emulator {
    inner: Arc<EmulatorInner>,
}

impl Emulator {
    /// Create an emulator around `vm` and start its executor thread.
    ///
    /// The worker is not started; call [`Emulator::start`].
    pub fn new(config: VmConfig, vm: VirtualMachine, events: EventSink) -> VmResult<Self> {
        let executor = CommandExecutor::start(EXECUTOR_THREAD_NAME, events.clone())?;
        Ok(Self {
            inner: Arc::new(EmulatorInner {
                executor,
                worker: Mutex::new(None),
                machine: RwLock::new(None),
                vm: vm.into_shared(),
                config: RwLock::new(config),
                events,
                scope: ReentrantMutex::new(()),
            }),
        })
    }

    /// Emulator over a headless machine built from `config`.
    pub fn headless(config: VmConfig, events: EventSink) -> VmResult<Self> {
        let vm = VirtualMachine::headless(&config);
        Self::new(config, vm, events)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// The command executor.
    pub fn executor(&self) -> &CommandExecutor {
        &self.inner.executor
    }

    /// Snapshot of the active configuration.
    pub fn config(&self) -> VmConfig {
        self.inner.config.read().clone()
    }

    /// Current mode; `NotStarted` when no worker exists.
    pub fn exec_mode(&self) -> ExecMode {
        self.machine()
            .map(|m| m.mode())
            .unwrap_or(ExecMode::NotStarted)
    }

    /// Emulation is running.
    pub fn is_opened(&self) -> bool {
        self.exec_mode() == ExecMode::Opened
    }

    /// Light suspend in effect.
    pub fn is_paused(&self) -> bool {
        self.exec_mode() == ExecMode::Paused
    }

    /// Heavy suspend in effect.
    pub fn is_closed(&self) -> bool {
        self.exec_mode() == ExecMode::Closed
    }

    /// Virtual frames executed since the last cold boot.
    pub fn frame_count(&self) -> u64 {
        self.inner.vm.lock().cpu.frame_count()
    }

    /// Whether two handles refer to the same emulator.
    pub fn ptr_eq(&self, other: &Emulator) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn machine(&self) -> Option<Arc<ExecModeStateMachine>> {
        self.inner.machine.read().clone()
    }

    pub(crate) fn vm(&self) -> &SharedVm {
        &self.inner.vm
    }

    pub(crate) fn scope_lock(&self) -> &ReentrantMutex<()> {
        &self.inner.scope
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Spawn the emulation worker. The VM stays closed until the first
    /// resume.
    ///
    /// Fails with `AlreadyStarted` while a worker is live. A worker that was
    /// cancelled without joining, or that exited on its own after a failure,
    /// is waited out and replaced.
    pub fn start(&self) -> VmResult<()> {
        let this = self.clone();
        self.executor()
            .try_invoke_self("start", move || this.start_inline())
            .unwrap_or_else(|| self.start_inline())
    }

    /// Resume the VM. Returns whether this call resumed it.
    ///
    /// Fails with `WorkerExited` when the worker died; call
    /// [`Emulator::start`] again.
    pub fn resume(&self) -> VmResult<bool> {
        let this = self.clone();
        self.executor()
            .try_invoke_self("resume", move || this.resume_inline())
            .unwrap_or_else(|| self.resume_inline())
    }

    /// Pause the VM and wait for the worker to acknowledge. Returns whether
    /// the VM was running.
    pub fn pause(&self) -> VmResult<bool> {
        let this = self.clone();
        self.executor()
            .try_invoke_self("pause", move || this.pause_inline())
            .unwrap_or_else(|| self.pause_inline())
    }

    /// Close the VM (plugins closed). Returns whether the VM was running.
    pub fn suspend(&self, blocking: bool) -> VmResult<bool> {
        let this = self.clone();
        self.executor()
            .try_invoke_self("suspend", move || this.suspend_inline(blocking))
            .unwrap_or_else(|| self.suspend_inline(blocking))
    }

    /// Terminate the worker; with `blocking`, wait for its cleanup and
    /// return to `NotStarted`.
    pub fn cancel(&self, blocking: bool) -> VmResult<()> {
        let this = self.clone();
        self.executor()
            .try_invoke_self("cancel", move || this.cancel_inline(blocking))
            .unwrap_or_else(|| self.cancel_inline(blocking))
    }

    /// Install a new configuration. Returns `false` when it equals the
    /// active one.
    ///
    /// CPU settings are applied under a pause and the recompiler caches
    /// cleared. A changed plugin list is swapped in under a close instead,
    /// and is rejected up front when a slot has no plugin available.
    /// Executor and boot settings take effect on the next start.
    pub fn apply_settings(&self, config: VmConfig) -> VmResult<bool> {
        let this = self.clone();
        let remote = config.clone();
        self.executor()
            .try_invoke_self("apply settings", move || this.apply_settings_inline(remote))
            .unwrap_or_else(|| self.apply_settings_inline(config))
    }

    /// Tear everything down: cancel the worker, shut plugins down and stop
    /// the executor thread.
    ///
    /// Both teardown steps are critical and run even if the queue is already
    /// shutting down. Later commands fail with `NotExecuted`.
    pub fn shutdown(&self) {
        log::info!("Shutting down emulator");
        let this = self.clone();
        self.executor().post(
            SyncAction::new("cancel worker", move || this.cancel_inline(true)).critical(),
        );
        let vm = self.inner.vm.clone();
        self.executor().post(
            SyncAction::new("shutdown plugins", move || {
                vm.lock().plugins.shutdown();
                Ok(())
            })
            .critical(),
        );
        self.executor().join();
    }

    // ========================================================================
    // Executor-thread bodies
    // ========================================================================

    fn start_inline(&self) -> VmResult<()> {
        let mut slot = self.inner.worker.lock();
        if let Some(worker) = slot.as_ref() {
            let machine = worker.machine();
            if !machine.is_cancel_requested() && !machine.has_exited() {
                return Err(VmError::AlreadyStarted);
            }
            let timeout = machine.stop_timeout();
            if !worker.wait_for_exit(timeout) {
                return Err(VmError::StopTimeout { waited: timeout });
            }
        }
        *slot = None;

        let config = self.config();
        let events = self.inner.events.clone();
        let machine = Arc::new(
            ExecModeStateMachine::new(config.executor.stop_timeout())
                .with_resume_spin(config.executor.resume_spin())
                .with_observer(Box::new(move |from: ExecMode, to: ExecMode| {
                    events.publish(VmEvent::ModeChanged { from, to })
                })),
        );
        let worker = EmulationWorker::spawn(
            machine.clone(),
            self.inner.vm.clone(),
            config.boot,
            self.inner.events.clone(),
        )?;
        *self.inner.machine.write() = Some(machine.clone());
        *slot = Some(worker);
        drop(slot);

        // Return once the first checkpoint has settled the VM as Closed.
        machine.suspend(true)?;
        Ok(())
    }

    fn resume_inline(&self) -> VmResult<bool> {
        match self.machine() {
            Some(machine) => machine.resume(),
            None => Err(VmError::NotStarted),
        }
    }

    fn pause_inline(&self) -> VmResult<bool> {
        match self.machine() {
            Some(machine) => machine.pause(),
            None => Ok(false),
        }
    }

    fn suspend_inline(&self, blocking: bool) -> VmResult<bool> {
        match self.machine() {
            Some(machine) => machine.suspend(blocking),
            None => Ok(false),
        }
    }

    fn cancel_inline(&self, blocking: bool) -> VmResult<()> {
        if blocking {
            let worker = self.inner.worker.lock().take();
            if let Some(mut worker) = worker {
                worker.cancel(true);
            }
            *self.inner.machine.write() = None;
        } else if let Some(worker) = self.inner.worker.lock().as_mut() {
            worker.cancel(false);
        }
        Ok(())
    }

    fn apply_settings_inline(&self, config: VmConfig) -> VmResult<bool> {
        if *self.inner.config.read() == config {
            return Ok(false);
        }
        let swap_plugins = self.inner.config.read().plugins.enabled != config.plugins.enabled;
        if !swap_plugins {
            let ctx = GuardContext::new();
            let mut guard = ScopedPause::new(self, &ctx)?;
            self.apply_cpu_settings(&config);
            *self.inner.config.write() = config;
            log::info!("Settings applied");
            guard.allow_resume();
            return Ok(true);
        }

        self.inner.vm.lock().check_plugins(&config.plugins.enabled)?;
        let ctx = GuardContext::new();
        let mut guard = ScopedClose::new(self, &ctx)?;
        self.inner
            .vm
            .lock()
            .set_enabled_plugins(&config.plugins.enabled)?;
        self.apply_cpu_settings(&config);
        *self.inner.config.write() = config;
        log::info!("Settings applied, plugin set swapped");
        guard.allow_resume();
        Ok(true)
    }

    fn apply_cpu_settings(&self, config: &VmConfig) {
        let mut vm = self.inner.vm.lock();
        vm.cpu.apply_settings(&config.cpu);
        vm.cpu.clear_caches();
    }
}

impl std::fmt::Debug for Emulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emulator")
            .field("mode", &self.exec_mode())
            .field("pending", &self.executor().pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CpuConfig;
    use crate::cpu::CpuCore;
    use crate::headless::HeadlessCpu;
    use crate::plugins::PluginId;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    fn config() -> VmConfig {
        let mut config = VmConfig::default();
        config.cpu.frame_slice_us = 100;
        config.executor.stop_timeout_ms = 5_000;
        config
    }

    fn emulator() -> Emulator {
        Emulator::headless(config(), EventSink::disconnected()).unwrap()
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_not_started_queries() {
        let emu = emulator();
        assert_eq!(emu.exec_mode(), ExecMode::NotStarted);
        assert!(matches!(emu.resume(), Err(VmError::NotStarted)));
        assert!(!emu.pause().unwrap());
        assert!(!emu.suspend(true).unwrap());
        emu.cancel(true).unwrap();
        emu.shutdown();
    }

    #[test]
    fn test_start_resume_pause_resume() {
        let emu = emulator();
        emu.start().unwrap();
        assert!(matches!(emu.start(), Err(VmError::AlreadyStarted)));

        assert!(emu.resume().unwrap());
        assert!(emu.is_opened());
        wait_until(|| emu.frame_count() > 0);

        assert!(emu.pause().unwrap());
        assert!(emu.is_paused());
        let frozen = emu.frame_count();
        thread::sleep(Duration::from_millis(10));
        assert_eq!(emu.frame_count(), frozen);

        assert!(emu.resume().unwrap());
        assert!(emu.is_opened());
        emu.shutdown();
    }

    #[test]
    fn test_cancel_then_restart() {
        let emu = emulator();
        emu.start().unwrap();
        emu.resume().unwrap();
        emu.cancel(true).unwrap();
        assert_eq!(emu.exec_mode(), ExecMode::NotStarted);
        assert!(!emu.vm().lock().plugins.is_initialized(PluginId::Gs));

        emu.start().unwrap();
        assert!(emu.resume().unwrap());
        wait_until(|| emu.vm().lock().plugins.is_opened(PluginId::Gs));
        emu.shutdown();
    }

    #[test]
    fn test_nonblocking_cancel_then_restart() {
        let emu = emulator();
        emu.start().unwrap();
        emu.resume().unwrap();
        emu.cancel(false).unwrap();
        emu.start().unwrap();
        assert!(emu.resume().unwrap());
        emu.shutdown();
    }

    #[test]
    fn test_apply_settings() {
        let emu = emulator();
        emu.start().unwrap();
        emu.resume().unwrap();

        assert!(!emu.apply_settings(config()).unwrap());

        let mut changed = config();
        changed.cpu.recompiler = false;
        assert!(emu.apply_settings(changed.clone()).unwrap());
        assert_eq!(emu.config(), changed);
        assert!(emu.is_opened());
        emu.shutdown();
    }

    #[test]
    fn test_apply_settings_keeps_existing_suspend() {
        let emu = emulator();
        emu.start().unwrap();
        emu.resume().unwrap();
        emu.suspend(true).unwrap();

        let mut changed = config();
        changed.cpu.frame_slice_us = 50;
        assert!(emu.apply_settings(changed).unwrap());
        assert!(emu.is_closed());
        emu.shutdown();
    }

    #[test]
    fn test_apply_settings_swaps_plugins() {
        let emu = emulator();
        emu.start().unwrap();
        emu.resume().unwrap();
        wait_until(|| emu.vm().lock().plugins.is_opened(PluginId::Dev9));

        let mut changed = config();
        changed.plugins.enabled = vec![PluginId::Gs, PluginId::Pad];
        assert!(emu.apply_settings(changed).unwrap());
        assert!(emu.is_opened());
        assert_eq!(
            emu.vm().lock().plugins.loaded(),
            vec![PluginId::Gs, PluginId::Pad]
        );
        wait_until(|| emu.vm().lock().plugins.is_opened(PluginId::Pad));

        // Re-enabled slots are initialised and opened on the warm resume.
        let mut widened = config();
        widened.plugins.enabled = vec![PluginId::Gs, PluginId::Pad, PluginId::Usb];
        assert!(emu.apply_settings(widened).unwrap());
        wait_until(|| emu.vm().lock().plugins.is_opened(PluginId::Usb));

        emu.cancel(true).unwrap();
        emu.start().unwrap();
        assert_eq!(
            emu.vm().lock().plugins.loaded(),
            vec![PluginId::Gs, PluginId::Pad, PluginId::Usb]
        );
        emu.shutdown();
    }

    #[test]
    fn test_apply_settings_rejects_unavailable_plugin() {
        let base = config();
        let mut plugins = crate::plugins::PluginManager::new();
        plugins.load(PluginId::Gs, Box::new(crate::headless::NullPlugin));
        let vm = VirtualMachine::new(Box::new(HeadlessCpu::new(&base.cpu)), plugins);
        let emu = Emulator::new(base.clone(), vm, EventSink::disconnected()).unwrap();
        emu.start().unwrap();
        emu.resume().unwrap();

        let mut changed = base.clone();
        changed.plugins.enabled = vec![PluginId::Gs, PluginId::Cdvd];
        assert!(matches!(
            emu.apply_settings(changed),
            Err(VmError::PluginInit {
                plugin: PluginId::Cdvd,
                ..
            })
        ));
        assert_eq!(emu.config(), base);
        assert!(emu.is_opened());
        emu.shutdown();
    }

    /// Panics on its first slice, then runs like the headless CPU
    struct PanicOnceCpu {
        inner: HeadlessCpu,
        panicked: Arc<AtomicBool>,
    }

    impl CpuCore for PanicOnceCpu {
        fn reset(&mut self) {
            self.inner.reset()
        }
        fn clear_caches(&mut self) {
            self.inner.clear_caches()
        }
        fn apply_settings(&mut self, config: &CpuConfig) {
            self.inner.apply_settings(config)
        }
        fn fast_boot(&mut self, elf: &Path) -> VmResult<()> {
            self.inner.fast_boot(elf)
        }
        fn execute_slice(&mut self) -> VmResult<()> {
            if !self.panicked.swap(true, Ordering::SeqCst) {
                panic!("bus error at 0x1fc00000");
            }
            self.inner.execute_slice()
        }
        fn frame_count(&self) -> u64 {
            self.inner.frame_count()
        }
        fn freeze(&self) -> VmResult<Vec<u8>> {
            self.inner.freeze()
        }
        fn thaw(&mut self, data: &[u8]) -> VmResult<()> {
            self.inner.thaw(data)
        }
    }

    #[test]
    fn test_dead_worker_is_replaced_on_start() {
        let base = config();
        let cpu = PanicOnceCpu {
            inner: HeadlessCpu::new(&base.cpu),
            panicked: Arc::new(AtomicBool::new(false)),
        };
        let mut plugins = crate::plugins::PluginManager::new();
        plugins.load(PluginId::Gs, Box::new(crate::headless::NullPlugin));
        let (sink, rx) = EventSink::channel();
        let emu = Emulator::new(base, VirtualMachine::new(Box::new(cpu), plugins), sink).unwrap();

        emu.start().unwrap();
        assert!(emu.resume().unwrap());
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(VmEvent::WorkerExited) => break,
                Ok(_) => continue,
                Err(e) => panic!("worker never exited: {}", e),
            }
        }

        assert_eq!(emu.exec_mode(), ExecMode::Closed);
        assert!(matches!(emu.resume(), Err(VmError::WorkerExited)));
        assert!(!emu.is_opened());
        assert!(!emu.pause().unwrap());
        assert!(!emu.suspend(true).unwrap());

        emu.start().unwrap();
        assert!(emu.resume().unwrap());
        wait_until(|| emu.frame_count() > 0);
        assert!(emu.pause().unwrap());
        emu.shutdown();
    }

    #[test]
    fn test_mode_changes_are_published() {
        let (sink, rx) = EventSink::channel();
        let emu = Emulator::headless(config(), sink).unwrap();
        emu.start().unwrap();
        emu.resume().unwrap();
        emu.pause().unwrap();
        emu.shutdown();

        let modes: Vec<_> = rx
            .try_iter()
            .filter_map(|event| match event {
                VmEvent::ModeChanged { from, to } => Some((from, to)),
                _ => None,
            })
            .collect();
        assert_eq!(modes[0], (ExecMode::NotStarted, ExecMode::Closing));
        assert!(modes.contains(&(ExecMode::Pausing, ExecMode::Paused)));
        assert_eq!(modes.last().map(|m| m.1), Some(ExecMode::Closed));
    }

    #[test]
    fn test_commands_after_shutdown() {
        let emu = emulator();
        emu.start().unwrap();
        emu.shutdown();
        assert!(matches!(emu.resume(), Err(VmError::NotExecuted)));
        assert!(!emu.vm().lock().plugins.any_open());
    }
}
