//! Registry Entry - host-side handles to VM values
//!
//! A `RegistryEntry` lets the host hold on to a VM value (usually a function
//! or a module table) between calls. It owns no VM memory: the value lives in
//! the instance's association table, keyed by the address of the entry's own
//! identity allocation.
//!
//! # Lifecycle
//!
//! - **Armed**: created by popping the top of the stack into the association
//!   table. `get` pushes the value back.
//! - **Destroyed**: the host drops the last reference. The association is
//!   queued for removal and the instance drains the queue before its next
//!   call, so dropping a handle never needs the instance lock.
//! - **Disarmed**: the instance was closed first. The entry stays valid as a
//!   host object, but `get` reports a handle-invalidity error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::vm::{TableRef, VmValue};

use super::companion::ENTRIES_KEY;
use super::state::{LuaState, StateKey};
use super::types::{BridgeError, BridgeResult};

type ReleaseQueue = Arc<Mutex<Vec<usize>>>;

/// Identity allocation of an entry; its address is the association key.
#[derive(Debug)]
struct EntrySlot {
    armed: AtomicBool,
    releases: ReleaseQueue,
}

/// Handle to a VM value stored in an instance's association table.
#[derive(Debug)]
pub struct RegistryEntry {
    slot: Arc<EntrySlot>,
    instance: u64,
    state_key: StateKey,
}

impl RegistryEntry {
    /// Pop the top of the stack into the association table.
    pub fn register(state: &mut LuaState) -> BridgeResult<Self> {
        state.collect_released();
        let value = state
            .vm_mut()
            .pop_value()
            .map_err(|e| BridgeError::argument(format!("cannot register value: {}", e)))?;
        let slot = Arc::new(EntrySlot {
            armed: AtomicBool::new(true),
            releases: state.entries().release_queue(),
        });
        let entry = Self {
            slot,
            instance: state.instance_id(),
            state_key: state.key(),
        };
        let key = entry.key();
        association_table(state)?
            .lock()
            .set(VmValue::LightUserdata(key), value)
            .map_err(|e| BridgeError::argument(e.to_string()))?;
        state.entries_mut().track(key, Arc::downgrade(&entry.slot));
        trace!(target: "vmbridge::registry", key, instance = entry.instance, "registered");
        Ok(entry)
    }

    /// Association key: the address of this entry's identity allocation.
    pub fn key(&self) -> usize {
        Arc::as_ptr(&self.slot) as usize
    }

    pub fn is_armed(&self) -> bool {
        self.slot.armed.load(Ordering::Acquire)
    }

    /// Logical key of the owning instance
    pub fn state_key(&self) -> StateKey {
        self.state_key
    }

    /// Check if `state` is the instance this entry belongs to.
    pub fn belongs_to(&self, state: &LuaState) -> bool {
        state.instance_id() == self.instance
    }

    /// Push the stored value onto `state`'s stack.
    pub fn get(&self, state: &mut LuaState) -> BridgeResult<()> {
        if !self.is_armed() {
            return Err(BridgeError::HandleInvalid(
                "registry entry was invalidated because its Lua state was closed".into(),
            ));
        }
        if !self.belongs_to(state) {
            return Err(BridgeError::HandleInvalid(
                "registry entry belongs to a different Lua state".into(),
            ));
        }
        let value = association_table(state)?
            .lock()
            .get(&VmValue::LightUserdata(self.key()));
        state.vm_mut().push(value);
        Ok(())
    }
}

impl Drop for RegistryEntry {
    fn drop(&mut self) {
        if self.slot.armed.load(Ordering::Acquire) {
            let key = self.key();
            self.slot.releases.lock().push(key);
        }
    }
}

fn association_table(state: &LuaState) -> BridgeResult<TableRef> {
    match state.vm().registry().lock().get_str(ENTRIES_KEY) {
        VmValue::Table(t) => Ok(t),
        _ => Err(BridgeError::HandleInvalid(
            "Lua state has no registry entry table".into(),
        )),
    }
}

/// Per-instance bookkeeping of live entries.
#[derive(Debug, Default)]
pub(crate) struct EntryTable {
    live: HashMap<usize, Weak<EntrySlot>>,
    releases: ReleaseQueue,
}

impl EntryTable {
    fn release_queue(&self) -> ReleaseQueue {
        Arc::clone(&self.releases)
    }

    fn track(&mut self, key: usize, slot: Weak<EntrySlot>) {
        self.live.insert(key, slot);
    }

    /// Number of entries whose association is still present
    pub(crate) fn len(&self) -> usize {
        self.live.len()
    }

    /// Remove the associations of dropped entries from `table`.
    pub(crate) fn drain_released(&mut self, table: &TableRef) {
        let keys: Vec<usize> = std::mem::take(&mut *self.releases.lock());
        if keys.is_empty() {
            return;
        }
        let mut t = table.lock();
        for key in &keys {
            self.live.remove(key);
            // Assigning nil to a light userdata key cannot fail.
            let _ = t.set(VmValue::LightUserdata(*key), VmValue::Nil);
        }
        trace!(target: "vmbridge::registry", released = keys.len(), "released entries");
    }

    /// Disarm every live entry. Runs once, when the instance is torn down.
    pub(crate) fn disarm_all(&mut self) {
        let mut disarmed = 0usize;
        for slot in self.live.values().filter_map(Weak::upgrade) {
            slot.armed.store(false, Ordering::Release);
            disarmed += 1;
        }
        self.live.clear();
        self.releases.lock().clear();
        debug!(target: "vmbridge::registry", disarmed, "disarmed registry entries");
    }
}
