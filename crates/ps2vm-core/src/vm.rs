//! The virtual machine proper: CPU plus plugins.
//!
//! While the worker is `Opened` it is the only party touching the machine.
//! Everyone else locks it only inside a suspended window (see `guards`).

use crate::config::VmConfig;
use crate::cpu::CpuCore;
use crate::error::{VmError, VmResult};
use crate::headless::{HeadlessCpu, NullPlugin};
use crate::plugins::{Plugin, PluginId, PluginManager};
use parking_lot::Mutex;
use std::sync::Arc;

/// Handle shared between the controller and the worker thread.
pub type SharedVm = Arc<Mutex<VirtualMachine>>;

/// Builds the plugin for a slot, or `None` when no plugin exists for it.
pub type PluginFactory = Box<dyn Fn(PluginId) -> Option<Box<dyn Plugin>> + Send>;

/// CPU and plugin collaborators of one emulated console.
pub struct VirtualMachine {
    /// CPU entry point
    pub cpu: Box<dyn CpuCore>,

    /// Loaded plugins
    pub plugins: PluginManager,

    /// Source of plugins for slots enabled after construction
    factory: Option<PluginFactory>,
}

impl VirtualMachine {
    /// Assemble a machine from its collaborators.
    pub fn new(cpu: Box<dyn CpuCore>, plugins: PluginManager) -> Self {
        Self {
            cpu,
            plugins,
            factory: None,
        }
    }

    /// Use `factory` to fill slots enabled by later settings changes.
    pub fn with_plugin_factory(mut self, factory: PluginFactory) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Headless machine: frame-counting CPU and inert plugins for every
    /// enabled slot.
    pub fn headless(config: &VmConfig) -> Self {
        let mut plugins = PluginManager::new();
        for &id in &config.plugins.enabled {
            plugins.load(id, Box::new(NullPlugin));
        }
        Self::new(Box::new(HeadlessCpu::new(&config.cpu)), plugins)
            .with_plugin_factory(Box::new(|_| Some(Box::new(NullPlugin) as Box<dyn Plugin>)))
    }

    /// Wrap for sharing with the worker thread.
    pub fn into_shared(self) -> SharedVm {
        Arc::new(Mutex::new(self))
    }

    /// Check that every slot in `enabled` is loaded or can be built.
    pub fn check_plugins(&self, enabled: &[PluginId]) -> VmResult<()> {
        let loaded = self.plugins.loaded();
        for &id in enabled {
            if loaded.contains(&id) {
                continue;
            }
            let buildable = self.factory.as_ref().is_some_and(|f| f(id).is_some());
            if !buildable {
                return Err(VmError::PluginInit {
                    plugin: id,
                    reason: "no plugin available for this slot".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Make the loaded plugin set equal to `enabled`: unload the others and
    /// build the missing ones. New plugins are left uninitialised.
    ///
    /// Only call inside a closed window. Nothing changes when a slot cannot
    /// be filled.
    pub fn set_enabled_plugins(&mut self, enabled: &[PluginId]) -> VmResult<()> {
        self.check_plugins(enabled)?;
        for id in self.plugins.loaded() {
            if !enabled.contains(&id) {
                self.plugins.unload(id);
            }
        }
        let loaded = self.plugins.loaded();
        for &id in enabled {
            if loaded.contains(&id) {
                continue;
            }
            if let Some(plugin) = self.factory.as_ref().and_then(|f| f(id)) {
                self.plugins.load(id, plugin);
                log::debug!("Loaded {} plugin", id);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for VirtualMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualMachine")
            .field("frames", &self.cpu.frame_count())
            .field("plugins", &self.plugins.loaded())
            .finish()
    }
}
