//! Emulation worker thread
//!
//! Runs the CPU one slice at a time and calls the exec-mode checkpoint
//! between slices. Suspend and resume side effects (closing and reopening
//! plugins, the cold boot on first resume) run here, on the worker thread.

use crate::config::BootConfig;
use crate::error::{VmError, VmResult};
use crate::events::{EventSink, VmEvent};
use crate::exec_mode::{CheckpointHooks, ExecModeStateMachine, SuspendKind};
use crate::executor::panic_message;
use crate::sync::Semaphore;
use crate::vm::SharedVm;
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Name given to the worker thread.
pub const WORKER_THREAD_NAME: &str = "ps2vm-core";

/// Checkpoint side effects against the shared machine
struct WorkerHooks {
    vm: SharedVm,
    boot: BootConfig,

    /// The cold boot ran during this session
    booted: bool,
}

impl CheckpointHooks for WorkerHooks {
    fn on_suspend(&mut self, kind: SuspendKind) -> VmResult<()> {
        if kind == SuspendKind::Close {
            self.vm.lock().plugins.close();
        }
        Ok(())
    }

    fn on_resume(&mut self, _kind: SuspendKind) -> VmResult<()> {
        let mut vm = self.vm.lock();
        if !self.booted {
            vm.plugins.init()?;
            vm.plugins.open()?;
            vm.cpu.reset();
            vm.cpu.clear_caches();
            if let (true, Some(elf)) = (self.boot.fast_boot, self.boot.elf.as_deref()) {
                vm.cpu.fast_boot(elf)?;
            }
            self.booted = true;
            log::info!("Virtual machine cold-booted");
            return Ok(());
        }
        // Plugins swapped in while closed come back uninitialised.
        vm.plugins.init()?;
        vm.plugins.open()
    }
}

/// Owner of the emulation worker thread.
///
/// Dropping the worker cancels it and joins the thread.
pub struct EmulationWorker {
    machine: Arc<ExecModeStateMachine>,

    /// Held by the thread for its whole life, released after cleanup
    running: Arc<Mutex<()>>,

    handle: Option<thread::JoinHandle<()>>,
}

impl EmulationWorker {
    /// Start the machine and spawn the worker thread.
    ///
    /// Returns once the thread is running. The VM stays suspended until the
    /// first resume, which performs the cold boot.
    pub fn spawn(
        machine: Arc<ExecModeStateMachine>,
        vm: SharedVm,
        boot: BootConfig,
        events: EventSink,
    ) -> VmResult<Self> {
        machine.start()?;

        let running = Arc::new(Mutex::new(()));
        let started = Arc::new(Semaphore::new(0));

        let thread_machine = machine.clone();
        let thread_running = running.clone();
        let thread_started = started.clone();
        let handle = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || {
                let _running = thread_running.lock();
                thread_machine.bind_worker_thread();
                thread_started.post();

                let mut hooks = WorkerHooks {
                    vm,
                    boot,
                    booted: false,
                };
                Self::run_loop(&thread_machine, &mut hooks, &events);
                Self::cleanup(&thread_machine, &mut hooks, &events);
            })
            .map_err(VmError::Spawn)?;

        started.wait();
        log::info!("Emulation worker started");

        Ok(Self {
            machine,
            running,
            handle: Some(handle),
        })
    }

    /// Worker thread main loop
    fn run_loop(machine: &ExecModeStateMachine, hooks: &mut WorkerHooks, events: &EventSink) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| loop {
            match machine.state_check_in_thread(hooks) {
                Ok(()) => {}
                Err(VmError::ThreadCancelled) => break,
                Err(e) => {
                    log::error!("worker: checkpoint failed: {}", e);
                    events.publish(VmEvent::WorkerError(e));
                    continue;
                }
            }

            let slice = hooks.vm.lock().cpu.execute_slice();
            if let Err(e) = slice {
                log::error!("worker: CPU slice failed, closing the VM: {}", e);
                events.publish(VmEvent::WorkerError(e));
                if let Err(e) = machine.suspend(false) {
                    log::debug!("worker: close after CPU failure superseded: {}", e);
                }
            }
        }));

        if let Err(panic) = outcome {
            let message = panic_message(panic.as_ref());
            log::error!("worker: panicked: {}", message);
            events.publish(VmEvent::WorkerError(VmError::ActionPanicked(message)));
        }
    }

    /// Terminal cleanup: close, shut plugins down, announce the exit.
    fn cleanup(machine: &ExecModeStateMachine, hooks: &mut WorkerHooks, events: &EventSink) {
        if let Err(e) = machine.close_in_thread(hooks) {
            log::error!("worker: close on exit failed: {}", e);
            events.publish(VmEvent::WorkerError(e));
        }
        hooks.vm.lock().plugins.shutdown();
        log::info!("Emulation worker exited");
        events.publish(VmEvent::WorkerExited);
    }

    /// State machine driving this worker.
    pub fn machine(&self) -> &Arc<ExecModeStateMachine> {
        &self.machine
    }

    /// Whether the thread has not yet finished its cleanup.
    pub fn is_running(&self) -> bool {
        self.running.is_locked()
    }

    /// Wait up to `timeout` for the thread to finish its cleanup.
    pub fn wait_for_exit(&self, timeout: Duration) -> bool {
        self.running.try_lock_for(timeout).is_some()
    }

    /// Request termination; with `blocking`, also join the thread.
    ///
    /// A blocking cancel from the worker thread itself does not join.
    pub fn cancel(&mut self, blocking: bool) {
        self.machine.request_cancel();
        if !blocking || self.machine.is_worker_thread() {
            return;
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("worker: thread terminated by panic");
            }
        }
    }
}

impl Drop for EmulationWorker {
    fn drop(&mut self) {
        self.cancel(true);
    }
}

impl std::fmt::Debug for EmulationWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmulationWorker")
            .field("mode", &self.machine.mode())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CpuConfig, VmConfig};
    use crate::cpu::CpuCore;
    use crate::exec_mode::ExecMode;
    use crate::headless::NullPlugin;
    use crate::plugins::{PluginId, PluginManager};
    use crate::vm::VirtualMachine;
    use std::path::Path;

    fn test_config() -> VmConfig {
        let mut config = VmConfig::default();
        config.cpu.frame_slice_us = 100;
        config
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(std::time::Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn spawn(vm: SharedVm, boot: BootConfig, events: EventSink) -> EmulationWorker {
        let machine = Arc::new(ExecModeStateMachine::new(Duration::from_secs(5)));
        EmulationWorker::spawn(machine, vm, boot, events).unwrap()
    }

    /// Fails its first slice, then behaves
    struct FlakyCpu {
        failed: bool,
        frames: u64,
    }

    impl CpuCore for FlakyCpu {
        fn reset(&mut self) {}
        fn clear_caches(&mut self) {}
        fn apply_settings(&mut self, _config: &CpuConfig) {}
        fn fast_boot(&mut self, _elf: &Path) -> VmResult<()> {
            Ok(())
        }
        fn execute_slice(&mut self) -> VmResult<()> {
            thread::sleep(Duration::from_micros(100));
            if !self.failed {
                self.failed = true;
                return Err(VmError::Cpu("illegal instruction".into()));
            }
            self.frames += 1;
            Ok(())
        }
        fn frame_count(&self) -> u64 {
            self.frames
        }
        fn freeze(&self) -> VmResult<Vec<u8>> {
            Ok(Vec::new())
        }
        fn thaw(&mut self, _data: &[u8]) -> VmResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_first_resume_cold_boots() {
        let config = test_config();
        let vm = VirtualMachine::headless(&config).into_shared();
        let mut worker = spawn(vm.clone(), config.boot.clone(), EventSink::disconnected());
        assert!(worker.is_running());
        wait_until(|| worker.machine().mode() == ExecMode::Closed);
        assert!(!vm.lock().plugins.is_initialized(PluginId::Gs));

        assert!(worker.machine().resume().unwrap());
        wait_until(|| vm.lock().cpu.frame_count() > 0);
        assert!(worker.machine().pause().unwrap());
        assert!(vm.lock().cpu.frame_count() > 0);
        assert!(vm.lock().plugins.is_opened(PluginId::Gs));

        worker.cancel(true);
        assert!(!worker.is_running());
        assert!(!vm.lock().plugins.is_initialized(PluginId::Gs));
    }

    #[test]
    fn test_close_closes_plugins_and_resume_reopens() {
        let config = test_config();
        let vm = VirtualMachine::headless(&config).into_shared();
        let mut worker = spawn(vm.clone(), config.boot.clone(), EventSink::disconnected());

        worker.machine().resume().unwrap();
        wait_until(|| vm.lock().plugins.is_opened(PluginId::Spu2));
        assert!(worker.machine().suspend(true).unwrap());
        assert_eq!(worker.machine().mode(), ExecMode::Closed);
        assert!(!vm.lock().plugins.any_open());
        assert!(vm.lock().plugins.is_initialized(PluginId::Spu2));

        worker.machine().resume().unwrap();
        wait_until(|| vm.lock().plugins.is_opened(PluginId::Spu2));
        worker.cancel(true);
    }

    #[test]
    fn test_cpu_failure_closes_vm_and_reports() {
        let (sink, rx) = EventSink::channel();
        let mut plugins = PluginManager::new();
        plugins.load(PluginId::Gs, Box::new(NullPlugin));
        let vm = VirtualMachine::new(
            Box::new(FlakyCpu {
                failed: false,
                frames: 0,
            }),
            plugins,
        )
        .into_shared();
        let mut worker = spawn(vm.clone(), BootConfig::default(), sink);

        worker.machine().resume().unwrap();
        match rx.recv_timeout(Duration::from_secs(5)) {
            Ok(VmEvent::WorkerError(VmError::Cpu(msg))) => assert_eq!(msg, "illegal instruction"),
            other => panic!("unexpected event: {:?}", other),
        }
        wait_until(|| worker.machine().mode() == ExecMode::Closed);
        assert!(!vm.lock().plugins.any_open());

        // The controller may resume after inspecting the failure.
        assert!(worker.machine().resume().unwrap());
        worker.cancel(true);
        assert!(rx
            .try_iter()
            .any(|event| matches!(event, VmEvent::WorkerExited)));
    }

    /// Panics on every slice
    struct PanickingCpu;

    impl CpuCore for PanickingCpu {
        fn reset(&mut self) {}
        fn clear_caches(&mut self) {}
        fn apply_settings(&mut self, _config: &CpuConfig) {}
        fn fast_boot(&mut self, _elf: &Path) -> VmResult<()> {
            Ok(())
        }
        fn execute_slice(&mut self) -> VmResult<()> {
            panic!("TLB miss in kernel mode");
        }
        fn frame_count(&self) -> u64 {
            0
        }
        fn freeze(&self) -> VmResult<Vec<u8>> {
            Ok(Vec::new())
        }
        fn thaw(&mut self, _data: &[u8]) -> VmResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_cpu_panic_ends_worker_and_blocks_resume() {
        let (sink, rx) = EventSink::channel();
        let mut plugins = PluginManager::new();
        plugins.load(PluginId::Gs, Box::new(NullPlugin));
        let vm = VirtualMachine::new(Box::new(PanickingCpu), plugins).into_shared();
        let worker = spawn(vm.clone(), BootConfig::default(), sink);

        assert!(worker.machine().resume().unwrap());
        match rx.recv_timeout(Duration::from_secs(5)) {
            Ok(VmEvent::WorkerError(VmError::ActionPanicked(msg))) => {
                assert!(msg.contains("TLB miss"))
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(5)),
            Ok(VmEvent::WorkerExited)
        ));
        assert!(worker.wait_for_exit(Duration::from_secs(5)));
        assert!(worker.machine().has_exited());
        assert_eq!(worker.machine().mode(), ExecMode::Closed);
        assert!(!vm.lock().plugins.is_initialized(PluginId::Gs));

        assert!(matches!(worker.machine().resume(), Err(VmError::WorkerExited)));
        assert!(!worker.machine().is_opened());
        assert!(!worker.machine().pause().unwrap());
    }

    #[test]
    fn test_nonblocking_cancel_then_wait() {
        let config = test_config();
        let vm = VirtualMachine::headless(&config).into_shared();
        let mut worker = spawn(vm, config.boot.clone(), EventSink::disconnected());
        worker.cancel(false);
        assert!(worker.wait_for_exit(Duration::from_secs(5)));
        assert!(!worker.is_running());
        assert_eq!(worker.machine().mode(), ExecMode::Closed);
    }

    #[test]
    fn test_fast_boot_runs_elf() {
        let mut config = test_config();
        config.boot.fast_boot = true;
        config.boot.elf = Some("demo.elf".into());

        let booted = Arc::new(Mutex::new(None));
        struct BootSpy(crate::headless::HeadlessCpu, Arc<Mutex<Option<std::path::PathBuf>>>);
        impl CpuCore for BootSpy {
            fn reset(&mut self) {
                self.0.reset()
            }
            fn clear_caches(&mut self) {
                self.0.clear_caches()
            }
            fn apply_settings(&mut self, config: &CpuConfig) {
                self.0.apply_settings(config)
            }
            fn fast_boot(&mut self, elf: &Path) -> VmResult<()> {
                *self.1.lock() = Some(elf.to_path_buf());
                self.0.fast_boot(elf)
            }
            fn execute_slice(&mut self) -> VmResult<()> {
                self.0.execute_slice()
            }
            fn frame_count(&self) -> u64 {
                self.0.frame_count()
            }
            fn freeze(&self) -> VmResult<Vec<u8>> {
                self.0.freeze()
            }
            fn thaw(&mut self, data: &[u8]) -> VmResult<()> {
                self.0.thaw(data)
            }
        }

        let cpu = BootSpy(crate::headless::HeadlessCpu::new(&config.cpu), booted.clone());
        let vm = VirtualMachine::new(Box::new(cpu), PluginManager::new()).into_shared();
        let mut worker = spawn(vm, config.boot.clone(), EventSink::disconnected());
        worker.machine().resume().unwrap();
        wait_until(|| booted.lock().is_some());
        assert_eq!(booted.lock().as_deref(), Some(Path::new("demo.elf")));
        worker.cancel(true);
    }
}
