//! Plugin manager: the boundary to the GS/PAD/SPU2/... collaborators
//!
//! Plugins are initialised once per emulation session, opened and closed
//! around every heavy suspend, and shut down when the session ends. The
//! manager tracks which plugins are initialised/open so every operation is
//! idempotent and safe to repeat from cleanup paths.

use crate::error::{VmError, VmResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Plugin slots, in canonical open order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PluginId {
    /// Graphics synthesizer
    Gs,
    /// Controllers
    Pad,
    /// Sound
    Spu2,
    /// Disc drive
    Cdvd,
    /// USB
    Usb,
    /// FireWire
    Fw,
    /// Network/HDD expansion bay
    Dev9,
}

impl PluginId {
    /// All plugin slots in open order.
    pub const ALL: [PluginId; 7] = [
        PluginId::Gs,
        PluginId::Pad,
        PluginId::Spu2,
        PluginId::Cdvd,
        PluginId::Usb,
        PluginId::Fw,
        PluginId::Dev9,
    ];

    /// Short display name.
    pub fn short_name(self) -> &'static str {
        match self {
            PluginId::Gs => "GS",
            PluginId::Pad => "PAD",
            PluginId::Spu2 => "SPU2",
            PluginId::Cdvd => "CDVD",
            PluginId::Usb => "USB",
            PluginId::Fw => "FW",
            PluginId::Dev9 => "DEV9",
        }
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// A loaded plugin. Failures are reported as plain strings; the manager
/// wraps them in the matching `VmError` variant.
pub trait Plugin: Send {
    /// Once-per-session initialisation.
    fn init(&mut self) -> Result<(), String>;

    /// Release session resources.
    fn shutdown(&mut self);

    /// Attach to the running VM (windows, audio devices, ...).
    fn open(&mut self) -> Result<(), String>;

    /// Detach from the VM.
    fn close(&mut self);

    /// Serialise plugin state for a savestate.
    fn freeze(&mut self) -> Result<Vec<u8>, String> {
        Ok(Vec::new())
    }

    /// Restore plugin state from a savestate.
    fn thaw(&mut self, _data: &[u8]) -> Result<(), String> {
        Ok(())
    }
}

struct PluginSlot {
    id: PluginId,
    plugin: Box<dyn Plugin>,
    initialized: bool,
    opened: bool,
}

/// Owns the loaded plugins and their lifecycle flags.
pub struct PluginManager {
    /// Loaded plugins, in open order
    slots: Vec<PluginSlot>,
}

impl PluginManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Load `plugin` into slot `id`, replacing any previous plugin there.
    pub fn load(&mut self, id: PluginId, plugin: Box<dyn Plugin>) {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.id == id) {
            if slot.opened {
                slot.plugin.close();
            }
            if slot.initialized {
                slot.plugin.shutdown();
            }
            *slot = PluginSlot {
                id,
                plugin,
                initialized: false,
                opened: false,
            };
            return;
        }
        self.slots.push(PluginSlot {
            id,
            plugin,
            initialized: false,
            opened: false,
        });
        self.slots.sort_by_key(|s| s.id);
    }

    /// Close, shut down and drop the plugin in slot `id`. Returns whether a
    /// plugin was loaded there.
    pub fn unload(&mut self, id: PluginId) -> bool {
        let Some(index) = self.slots.iter().position(|s| s.id == id) else {
            return false;
        };
        if id == PluginId::Gs {
            self.close_one(PluginId::Pad);
        }
        let mut slot = self.slots.remove(index);
        if slot.opened {
            slot.plugin.close();
        }
        if slot.initialized {
            slot.plugin.shutdown();
        }
        log::debug!("Unloaded {} plugin", id);
        true
    }

    /// Loaded plugin ids, in open order.
    pub fn loaded(&self) -> Vec<PluginId> {
        self.slots.iter().map(|s| s.id).collect()
    }

    /// Initialise every plugin that is not yet initialised.
    pub fn init(&mut self) -> VmResult<()> {
        let mut announced = false;
        for slot in self.slots.iter_mut().filter(|s| !s.initialized) {
            if !announced {
                log::info!("Initializing plugins...");
                announced = true;
            }
            log::debug!("\tInit {}", slot.id);
            slot.plugin.init().map_err(|reason| VmError::PluginInit {
                plugin: slot.id,
                reason,
            })?;
            slot.initialized = true;
        }
        if announced {
            log::info!("Plugins initialized successfully.");
        }
        Ok(())
    }

    /// Open one plugin (no-op if already open).
    pub fn open_one(&mut self, id: PluginId) -> VmResult<()> {
        let Some(slot) = self.slots.iter_mut().find(|s| s.id == id) else {
            return Ok(());
        };
        if slot.opened {
            return Ok(());
        }
        if !slot.initialized {
            return Err(VmError::PluginOpen {
                plugin: id,
                reason: "plugin is not initialized".to_string(),
            });
        }
        log::debug!("\tOpening {}", id);
        slot.plugin
            .open()
            .map_err(|reason| VmError::PluginOpen { plugin: id, reason })?;
        slot.opened = true;
        Ok(())
    }

    /// Open every plugin in canonical order.
    ///
    /// Stops at the first failure; plugins opened before it stay open.
    pub fn open(&mut self) -> VmResult<()> {
        if self.slots.iter().all(|s| s.opened) {
            return Ok(());
        }
        log::info!("Opening plugins...");
        for id in self.loaded() {
            self.open_one(id)?;
        }
        log::info!("Plugins opened successfully.");
        Ok(())
    }

    /// Close one plugin (no-op if not open).
    ///
    /// Closing GS force-closes PAD first, since PAD depends on the GS window.
    pub fn close_one(&mut self, id: PluginId) {
        if id == PluginId::Gs {
            self.close_one(PluginId::Pad);
        }
        if let Some(slot) = self.slots.iter_mut().find(|s| s.id == id && s.opened) {
            log::debug!("\tClosing {}", id);
            slot.plugin.close();
            slot.opened = false;
        }
    }

    /// Close every open plugin in reverse order.
    pub fn close(&mut self) {
        if !self.any_open() {
            return;
        }
        log::debug!("Closing plugins...");
        for id in self.loaded().into_iter().rev() {
            self.close_one(id);
        }
        log::debug!("Plugins closed successfully.");
    }

    /// Close, then shut down every initialised plugin in reverse order.
    pub fn shutdown(&mut self) {
        self.close();
        if !self.slots.iter().any(|s| s.initialized) {
            return;
        }
        log::debug!("Shutting down plugins...");
        for slot in self.slots.iter_mut().rev().filter(|s| s.initialized) {
            log::debug!("\tShutdown {}", slot.id);
            slot.initialized = false;
            slot.plugin.shutdown();
        }
        log::debug!("Plugins shutdown successfully.");
    }

    /// Collect every plugin's state blob.
    pub fn freeze(&mut self) -> VmResult<Vec<(PluginId, Vec<u8>)>> {
        self.slots
            .iter_mut()
            .map(|slot| {
                slot.plugin
                    .freeze()
                    .map(|data| (slot.id, data))
                    .map_err(|reason| VmError::PluginFreeze {
                        plugin: slot.id,
                        reason,
                    })
            })
            .collect()
    }

    /// Restore state blobs; blobs for unloaded plugins are skipped.
    pub fn thaw(&mut self, blobs: &[(PluginId, Vec<u8>)]) -> VmResult<()> {
        for (id, data) in blobs {
            if let Some(slot) = self.slots.iter_mut().find(|s| s.id == *id) {
                slot.plugin
                    .thaw(data)
                    .map_err(|reason| VmError::PluginThaw { plugin: *id, reason })?;
            } else {
                log::warn!("savestate carries {} data but no {} plugin is loaded", id, id);
            }
        }
        Ok(())
    }

    /// Whether the plugin in slot `id` is open.
    pub fn is_opened(&self, id: PluginId) -> bool {
        self.slots.iter().any(|s| s.id == id && s.opened)
    }

    /// Whether the plugin in slot `id` is initialised.
    pub fn is_initialized(&self, id: PluginId) -> bool {
        self.slots.iter().any(|s| s.id == id && s.initialized)
    }

    /// Whether any plugin is open.
    pub fn any_open(&self) -> bool {
        self.slots.iter().any(|s| s.opened)
    }
}

impl Default for PluginManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PluginManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
