//! VM instances and the instance registry.
//!
//! A [`LuaState`] is one VM instance together with its cached companion
//! helpers and its registry-entry bookkeeping. A [`Bridge`] maps logical
//! [`StateKey`]s to instances; key zero is the default instance, created on
//! first use and destroyed only by [`Bridge::reset`].
//!
//! # Design
//!
//! - Instances live behind `parking_lot::Mutex`, so one instance is never
//!   used by two threads at once
//! - The key map is a `DashMap`, so opening and closing instances does not
//!   serialise calls into other instances
//! - Closing disarms every registry entry before the instance is marked
//!   closed
//!
//! # Example
//!
//! ```ignore
//! let bridge = Bridge::new();
//! let key = bridge.open()?;
//! let state = bridge.state(Some(key))?;
//! assert_eq!(state.lock().vm().top(), 0);
//! bridge.close(key)?;
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::config::BridgeConfig;
use crate::vm::{Returns, VmConfig, VmState};

use super::companion::{bootstrap_chunk, Helpers};
use super::pcall::handle_lua_error;
use super::registry_entry::EntryTable;
use super::types::{BridgeError, BridgeResult};

/// Logical name of an instance within a [`Bridge`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateKey(u64);

impl StateKey {
    /// The lazily created default instance
    pub const DEFAULT: StateKey = StateKey(0);
    /// Shared by every instance outside the registry, such as parallel workers
    pub const UNREGISTERED: StateKey = StateKey(u64::MAX);

    pub fn is_default(self) -> bool {
        self.0 == 0
    }

    pub fn is_registered(self) -> bool {
        self != Self::UNREGISTERED
    }

    pub fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_default() {
            write!(f, "default")
        } else if !self.is_registered() {
            write!(f, "unregistered")
        } else {
            write!(f, "state#{}", self.0)
        }
    }
}

/// A VM instance ready for bridge calls.
pub struct LuaState {
    key: StateKey,
    label: String,
    vm: VmState,
    helpers: Helpers,
    entries: EntryTable,
}

impl LuaState {
    /// Create an instance and run the bootstrap chunk.
    pub fn new(key: StateKey, config: VmConfig) -> BridgeResult<Self> {
        let mut vm = VmState::with_config(config);
        let status = vm.do_chunk(&bootstrap_chunk(), Returns::Fixed(0));
        if let Some(err) = handle_lua_error(&mut vm, status, "vmbridge module from LuaState::new()") {
            return Err(err);
        }
        let helpers = Helpers::resolve(&vm)?;
        let label = if key.is_default() {
            "default".to_string()
        } else {
            format!("0x{:x}", vm.registry().address())
        };
        debug!(target: "vmbridge::state", key = %key, instance = vm.id(), "Lua state opened");
        Ok(Self {
            key,
            label,
            vm,
            helpers,
            entries: EntryTable::default(),
        })
    }

    pub fn key(&self) -> StateKey {
        self.key
    }

    /// Process-unique id of the underlying VM
    pub fn instance_id(&self) -> u64 {
        self.vm.id()
    }

    /// Name used in profiler reports
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn vm(&self) -> &VmState {
        &self.vm
    }

    pub fn vm_mut(&mut self) -> &mut VmState {
        &mut self.vm
    }

    pub fn helpers(&self) -> &Helpers {
        &self.helpers
    }

    pub fn is_closed(&self) -> bool {
        self.vm.is_closed()
    }

    pub(crate) fn entries(&self) -> &EntryTable {
        &self.entries
    }

    pub(crate) fn entries_mut(&mut self) -> &mut EntryTable {
        &mut self.entries
    }

    /// Number of live registry entries
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Remove the associations of registry entries dropped since the last call.
    pub fn collect_released(&mut self) {
        if let crate::vm::VmValue::Table(t) =
            self.vm.registry().lock().get_str(super::companion::ENTRIES_KEY)
        {
            self.entries.drain_released(&t);
        }
    }

    /// Tear the instance down. Registry entries are disarmed first.
    pub fn close(&mut self) {
        if self.vm.is_closed() {
            return;
        }
        self.entries.disarm_all();
        self.vm.close();
        debug!(target: "vmbridge::state", key = %self.key, instance = self.vm.id(), "Lua state closed");
    }
}

impl Drop for LuaState {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for LuaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LuaState")
            .field("key", &self.key)
            .field("label", &self.label)
            .field("vm", &self.vm)
            .field("entries", &self.entries.len())
            .finish()
    }
}

/// Instance shared between the registry and its users
pub type SharedState = Arc<Mutex<LuaState>>;

/// Registry of VM instances.
pub struct Bridge {
    states: DashMap<StateKey, SharedState>,
    next_key: AtomicU64,
    config: BridgeConfig,
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.states.iter().map(|e| *e.key()).collect();
        keys.sort();
        f.debug_struct("Bridge")
            .field("state_count", &self.states.len())
            .field("keys", &keys)
            .finish()
    }
}

impl Bridge {
    /// Create a bridge with default configuration
    pub fn new() -> Self {
        Self::with_config(BridgeConfig::default())
    }

    /// Create a bridge whose instances use `config`'s limits
    pub fn with_config(config: BridgeConfig) -> Self {
        Self {
            states: DashMap::new(),
            next_key: AtomicU64::new(1),
            config,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    fn fresh_key(&self) -> StateKey {
        StateKey(self.next_key.fetch_add(1, Ordering::Relaxed))
    }

    /// Create an instance that is not registered under any key. It carries
    /// [`StateKey::UNREGISTERED`], so handles it creates never resolve.
    pub fn new_instance(&self) -> BridgeResult<LuaState> {
        LuaState::new(StateKey::UNREGISTERED, self.config.vm_config())
    }

    /// Open a new instance and return its key.
    pub fn open(&self) -> BridgeResult<StateKey> {
        let state = LuaState::new(self.fresh_key(), self.config.vm_config())?;
        let key = state.key();
        self.states.insert(key, Arc::new(Mutex::new(state)));
        Ok(key)
    }

    /// Look up an instance; `None` means the default instance, which is
    /// created on first use.
    pub fn state(&self, key: Option<StateKey>) -> BridgeResult<SharedState> {
        match key {
            None | Some(StateKey::DEFAULT) => {
                let entry = self
                    .states
                    .entry(StateKey::DEFAULT)
                    .or_try_insert_with(|| {
                        LuaState::new(StateKey::DEFAULT, self.config.vm_config())
                            .map(|s| Arc::new(Mutex::new(s)))
                    })?;
                Ok(Arc::clone(entry.value()))
            }
            Some(key) => self
                .states
                .get(&key)
                .map(|e| Arc::clone(e.value()))
                .ok_or_else(|| {
                    BridgeError::argument(
                        "Lua state should be NULL or a value returned from lua_open.",
                    )
                }),
        }
    }

    /// Check if `key` names an open instance.
    pub fn is_open(&self, key: StateKey) -> bool {
        self.states.contains_key(&key)
    }

    /// Number of open instances, counting the default one once created.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Close an instance. Closing the default key resets it.
    pub fn close(&self, key: StateKey) -> BridgeResult<()> {
        if key.is_default() {
            self.reset();
            return Ok(());
        }
        match self.states.remove(&key) {
            Some((_, state)) => {
                state.lock().close();
                Ok(())
            }
            None => Err(BridgeError::argument(
                "Lua state should be NULL or a value returned from lua_open.",
            )),
        }
    }

    /// Destroy the default instance. The next use creates a fresh one.
    pub fn reset(&self) {
        if let Some((_, state)) = self.states.remove(&StateKey::DEFAULT) {
            state.lock().close();
            debug!(target: "vmbridge::state", "default Lua state reset");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::registry_entry::RegistryEntry;

    #[test]
    fn test_default_state_is_lazy_and_stable() {
        let bridge = Bridge::new();
        assert!(bridge.is_empty());
        let a = bridge.state(None).unwrap();
        let b = bridge.state(Some(StateKey::DEFAULT)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.lock().label(), "default");
        assert_eq!(bridge.len(), 1);
    }

    #[test]
    fn test_unregistered_instances_share_a_key() {
        let bridge = Bridge::new();
        let a = bridge.open().unwrap();
        let worker = bridge.new_instance().unwrap();
        assert_eq!(worker.key(), StateKey::UNREGISTERED);
        assert_eq!(worker.key().to_string(), "unregistered");
        assert!(!bridge.is_open(worker.key()));
        assert_eq!(bridge.open().unwrap().id(), a.id() + 1);
    }

    #[test]
    fn test_reset_replaces_default() {
        let bridge = Bridge::new();
        let first = bridge.state(None).unwrap().lock().instance_id();
        bridge.reset();
        let second = bridge.state(None).unwrap().lock().instance_id();
        assert_ne!(first, second);
    }

    #[test]
    fn test_open_close() {
        let bridge = Bridge::new();
        let key = bridge.open().unwrap();
        assert!(!key.is_default());
        assert!(bridge.is_open(key));
        let state = bridge.state(Some(key)).unwrap();
        bridge.close(key).unwrap();
        assert!(state.lock().is_closed());
        assert!(bridge.state(Some(key)).is_err());
        assert!(bridge.close(key).is_err());
    }

    #[test]
    fn test_bootstrap_installs_module() {
        let bridge = Bridge::new();
        let state = bridge.state(None).unwrap();
        let mut state = state.lock();
        let vm = state.vm_mut();
        vm.get_global("vmbridge");
        assert_eq!(vm.type_at(-1), crate::vm::VmType::Table);
        vm.pop(1);
        assert_eq!(vm.top(), 0);
    }

    #[test]
    fn test_dropped_entries_are_collected() {
        let mut state = LuaState::new(StateKey::DEFAULT, VmConfig::default()).unwrap();
        state.vm_mut().push_number(1.0);
        let entry = RegistryEntry::register(&mut state).unwrap();
        assert_eq!(state.entry_count(), 1);
        drop(entry);
        state.collect_released();
        assert_eq!(state.entry_count(), 0);
    }

    #[test]
    fn test_close_disarms_entries() {
        let mut state = LuaState::new(StateKey::DEFAULT, VmConfig::default()).unwrap();
        state.vm_mut().push_string("kept");
        let entry = RegistryEntry::register(&mut state).unwrap();
        entry.get(&mut state).unwrap();
        assert_eq!(state.vm().top(), 1);
        state.close();
        assert!(!entry.is_armed());
        assert!(matches!(
            entry.get(&mut state),
            Err(BridgeError::HandleInvalid(_))
        ));
    }

    #[test]
    fn test_entry_rejects_other_state() {
        let mut a = LuaState::new(StateKey::DEFAULT, VmConfig::default()).unwrap();
        let mut b = LuaState::new(StateKey::DEFAULT, VmConfig::default()).unwrap();
        a.vm_mut().push_boolean(true);
        let entry = RegistryEntry::register(&mut a).unwrap();
        assert!(matches!(entry.get(&mut b), Err(BridgeError::HandleInvalid(_))));
    }
}
