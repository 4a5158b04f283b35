//! Sampling profiler for tooled calls.
//!
//! While a tooled call runs with profiling on, a count hook samples the call
//! stack every `interval` calls and appends the sample to a session owned by
//! that call. Sessions store samples in fixed-size chunks; once the chunk
//! limit is reached further samples are dropped and counted.
//!
//! After the call the session is folded into a process-wide store keyed by
//! instance. Stack fragments are interned in one shared pool, since the same
//! frames recur in nearly every sample.
//!
//! # Mode strings
//!
//! A profile mode is a granularity letter followed by a sampling interval:
//! `"li1"` samples every call at line granularity, `"fi10"` every tenth call
//! at function granularity.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, LazyLock};

use lasso::{Rodeo, Spur};
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::vm::{FrameInfo, Hook, HookEvent, HookSlot, VmState};

use super::types::{BridgeError, BridgeResult};

/// What identifies a stack frame in a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Granularity {
    /// Function name
    Function,
    /// Definition site, `chunk:line`
    Line,
}

/// Parsed profiling mode
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProfileMode {
    pub granularity: Granularity,
    /// Sample once every this many calls
    pub interval: u32,
}

impl ProfileMode {
    pub fn parse(mode: &str) -> BridgeResult<Self> {
        let invalid = || BridgeError::Config(format!("Invalid mode '{}' for profile", mode));
        let mut granularity = Granularity::Line;
        let mut interval = 1u32;
        let mut chars = mode.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                'f' => granularity = Granularity::Function,
                'l' => granularity = Granularity::Line,
                'i' => {
                    let mut digits = String::new();
                    while let Some(d) = chars.peek().filter(|d| d.is_ascii_digit()) {
                        digits.push(*d);
                        chars.next();
                    }
                    interval = digits.parse().map_err(|_| invalid())?;
                    if interval == 0 {
                        return Err(invalid());
                    }
                }
                _ => return Err(invalid()),
            }
        }
        Ok(Self {
            granularity,
            interval,
        })
    }
}

impl Default for ProfileMode {
    fn default() -> Self {
        Self {
            granularity: Granularity::Line,
            interval: 1,
        }
    }
}

impl fmt::Display for ProfileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let g = match self.granularity {
            Granularity::Function => 'f',
            Granularity::Line => 'l',
        };
        write!(f, "{}i{}", g, self.interval)
    }
}

/// Resource limits of a profiling session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProfileLimits {
    /// Frames recorded per sample, innermost first
    pub max_depth: usize,
    /// Samples per chunk
    pub chunk_size: usize,
    /// Chunks per session
    pub max_chunks: usize,
}

impl Default for ProfileLimits {
    fn default() -> Self {
        Self {
            max_depth: 8,
            chunk_size: 1024,
            max_chunks: 64,
        }
    }
}

#[derive(Debug, Clone)]
struct Sample {
    stack: String,
    vm_state: char,
}

/// Samples collected during one tooled call.
#[derive(Debug)]
pub(crate) struct ProfileSession {
    granularity: Granularity,
    limits: ProfileLimits,
    chunks: Vec<Vec<Sample>>,
    dropped: u64,
}

impl ProfileSession {
    fn new(granularity: Granularity, limits: ProfileLimits) -> Self {
        Self {
            granularity,
            limits,
            chunks: Vec::new(),
            dropped: 0,
        }
    }

    fn record(&mut self, frames: &[FrameInfo], vm_state: char) {
        let full = self
            .chunks
            .last()
            .map_or(true, |c| c.len() >= self.limits.chunk_size);
        if full {
            if self.chunks.len() >= self.limits.max_chunks {
                self.dropped += 1;
                return;
            }
            self.chunks.push(Vec::with_capacity(self.limits.chunk_size));
        }
        let stack = frames
            .iter()
            .rev()
            .map(|f| match (self.granularity, &f.source) {
                (Granularity::Line, Some(src)) => src.to_string(),
                _ => f.name.clone(),
            })
            .collect::<Vec<_>>()
            .join(";");
        if let Some(chunk) = self.chunks.last_mut() {
            chunk.push(Sample { stack, vm_state });
        }
    }

    fn samples(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }
}

/// Install the sampling hook.
pub(crate) fn start(
    vm: &mut VmState,
    mode: &ProfileMode,
    limits: ProfileLimits,
) -> Arc<Mutex<ProfileSession>> {
    let session = Arc::new(Mutex::new(ProfileSession::new(mode.granularity, limits)));
    let sink = Arc::clone(&session);
    let depth = limits.max_depth.max(1);
    vm.set_hook(
        HookSlot::Profile,
        Some(Hook::every(mode.interval, move |vm: &mut VmState, event| {
            if event != HookEvent::Count {
                return;
            }
            let frames = vm.call_stack(depth);
            let vm_state = if vm.jit_enabled() { 'N' } else { 'I' };
            sink.lock().record(&frames, vm_state);
        })),
    );
    trace!(target: "vmbridge::profiler", vm = vm.id(), mode = %mode, "profiler started");
    session
}

/// Remove the sampling hook and fold the session into the store.
pub(crate) fn finish(vm: &mut VmState, session: Arc<Mutex<ProfileSession>>, label: &str) {
    vm.set_hook(HookSlot::Profile, None);
    let session = std::mem::replace(
        &mut *session.lock(),
        ProfileSession::new(Granularity::Line, ProfileLimits::default()),
    );
    if session.dropped > 0 {
        warn!(
            target: "vmbridge::profiler",
            vm = vm.id(),
            dropped = session.dropped,
            "profiler chunk limit reached; samples dropped"
        );
    }
    debug!(target: "vmbridge::profiler", vm = vm.id(), samples = session.samples(), "profiler stopped");
    STORE.lock().fold(vm.id(), label, session);
}

type StackKey = (SmallVec<[Spur; 8]>, char);

#[derive(Debug, Default)]
struct InstanceProfile {
    label: String,
    counts: HashMap<StackKey, u32>,
}

#[derive(Debug, Default)]
struct ProfileStore {
    pool: Rodeo,
    instances: BTreeMap<u64, InstanceProfile>,
}

impl ProfileStore {
    fn fold(&mut self, instance: u64, label: &str, session: ProfileSession) {
        let Self { pool, instances } = self;
        let entry = instances.entry(instance).or_insert_with(|| InstanceProfile {
            label: label.to_string(),
            counts: HashMap::new(),
        });
        for sample in session.chunks.into_iter().flatten() {
            let fragments: SmallVec<[Spur; 8]> = sample
                .stack
                .split(';')
                .filter(|s| !s.is_empty())
                .map(|s| pool.get_or_intern(s))
                .collect();
            *entry.counts.entry((fragments, sample.vm_state)).or_insert(0) += 1;
        }
    }

    fn report(&self) -> Vec<ProfileReport> {
        self.instances
            .values()
            .map(|profile| {
                let mut entries: Vec<ProfileEntry> = profile
                    .counts
                    .iter()
                    .map(|((fragments, vm_state), samples)| ProfileEntry {
                        stack: fragments
                            .iter()
                            .map(|s| self.pool.resolve(s))
                            .collect::<Vec<_>>()
                            .join(";"),
                        vm_state: *vm_state,
                        samples: *samples,
                    })
                    .collect();
                entries.sort_by(|a, b| a.stack.cmp(&b.stack).then(a.vm_state.cmp(&b.vm_state)));
                ProfileReport {
                    state: profile.label.clone(),
                    entries,
                }
            })
            .collect()
    }
}

static STORE: LazyLock<Mutex<ProfileStore>> = LazyLock::new(|| Mutex::new(ProfileStore::default()));

/// Accumulated samples of one stack in one VM state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileEntry {
    /// Frames, outermost first, separated by `;`
    pub stack: String,
    /// `'N'` compiled, `'I'` interpreted
    pub vm_state: char,
    pub samples: u32,
}

/// Profile of one instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileReport {
    /// `"default"` for the default instance, otherwise its address
    pub state: String,
    pub entries: Vec<ProfileEntry>,
}

impl ProfileReport {
    pub fn total_samples(&self) -> u64 {
        self.entries.iter().map(|e| e.samples as u64).sum()
    }
}

/// Profiles of every instance that ran tooled calls, optionally clearing
/// the store.
pub fn profile_data(flush: bool) -> Vec<ProfileReport> {
    let mut store = STORE.lock();
    let report = store.report();
    if flush {
        *store = ProfileStore::default();
    }
    report
}
