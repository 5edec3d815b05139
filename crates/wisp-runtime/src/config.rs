//! Runtime configuration.
//!
//! The original C implementation tunes the VM through compile-time
//! `#define`s (`GC_STRESS`, `GC_LOG`, fixed frame/registry sizes). As a
//! library rather than a single firmware image, those become fields on
//! [`VmConfig`], readable from the environment the way the teacher's
//! scheduler sizes its strand registry from `SEQ_STRAND_REGISTRY_SIZE`
//! (an env var with a constant fallback, not a build-time flag).

use std::env;

use serde::{Deserialize, Serialize};

/// `closeUpvalues`/temp-roots/pinned-routine/call-frame bounds and GC
/// thresholds for one VM instance. `Serialize`/`Deserialize` let a host
/// persist a tuned config alongside a saved program rather than
/// re-deriving it from the environment on every run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmConfig {
    /// Byte threshold above which a collection runs, before the first
    /// collection has adjusted it.
    pub initial_gc_threshold: usize,
    /// Hard ceiling on `next_gc` growth (spec.md §4.3: `next_gc = min(bytes*2, ALWAYS_GC_ABOVE)`).
    pub always_gc_above: usize,
    /// Force a collection before every allocation (debug aid).
    pub gc_stress: bool,
    /// Log each collection's before/after byte counts to stderr.
    pub gc_log: bool,
    /// Number of `Value` slots per routine-stack slice (spec.md §4.5).
    pub stack_slice_size: usize,
    /// Maximum call frames per routine (spec.md §4.5: 48).
    pub max_call_frames: usize,
    /// Maximum concurrently pinned (ISR) routines (spec.md §4.5: ≤10).
    pub max_pinned_routines: usize,
    /// Maximum temp-roots stack depth (spec.md §4.3: 8 is sufficient).
    pub temp_roots_capacity: usize,
    /// Default channel capacity when unspecified (spec.md §4.5: 1).
    pub default_channel_capacity: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            initial_gc_threshold: 1024 * 1024,
            always_gc_above: 64 * 1024 * 1024,
            gc_stress: false,
            gc_log: false,
            stack_slice_size: 256,
            max_call_frames: 48,
            max_pinned_routines: 10,
            temp_roots_capacity: 8,
            default_channel_capacity: 1,
        }
    }
}

impl VmConfig {
    /// Reads env-var overrides (`WISP_GC_STRESS`, `WISP_GC_LOG`,
    /// `WISP_STACK_SLICE_SIZE`) over the defaults. Malformed values fall
    /// back to the default rather than panicking.
    pub fn from_env() -> Self {
        let mut cfg = VmConfig::default();
        if env_flag("WISP_GC_STRESS") {
            cfg.gc_stress = true;
        }
        if env_flag("WISP_GC_LOG") {
            cfg.gc_log = true;
        }
        if let Some(n) = env_usize("WISP_STACK_SLICE_SIZE") {
            cfg.stack_slice_size = n;
        }
        if let Some(n) = env_usize("WISP_INITIAL_GC_THRESHOLD") {
            cfg.initial_gc_threshold = n;
        }
        cfg
    }
}

fn env_flag(name: &str) -> bool {
    matches!(env::var(name).as_deref(), Ok("1") | Ok("true"))
}

fn env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}
