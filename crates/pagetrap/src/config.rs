//! Pool configuration, consumed (not owned) by `GuardedAllocator::init`.

/// Tunables for one guarded pool.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Number of guarded slots; also the maximum number of simultaneously
    /// live sampled allocations. Fixed for the pool's lifetime.
    pub slot_count: usize,
    /// How many subsequent deallocations a slot is withheld from reuse
    /// after its own. Zero releases immediately; larger values widen the
    /// use-after-free detection window at the cost of earlier pool
    /// exhaustion under allocation pressure.
    pub quarantine_len: usize,
    /// RNG seed for slot selection and placement. None seeds from the
    /// environment at init; tests pass a fixed seed for determinism.
    pub seed: Option<u64>,
    /// Hook producing opaque trace ids recorded at allocate/deallocate time,
    /// correlated by the external symbolication layer. When absent, ids come
    /// from a process-wide monotonic counter.
    pub trace_hook: Option<fn() -> u64>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            slot_count: 16,
            quarantine_len: 0,
            seed: None,
            trace_hook: None,
        }
    }
}

impl Config {
    /// Defaults overridden by `PAGETRAP_SLOTS`, `PAGETRAP_QUARANTINE` and
    /// `PAGETRAP_SEED` where set and parseable.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    // The override logic, with the environment read abstracted so tests do
    // not have to mutate process state.
    fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Self {
        let mut cfg = Config::default();
        if let Some(v) = lookup("PAGETRAP_SLOTS").and_then(|v| v.parse::<usize>().ok()) {
            if v > 0 {
                cfg.slot_count = v;
            }
        }
        if let Some(v) = lookup("PAGETRAP_QUARANTINE").and_then(|v| v.parse::<usize>().ok()) {
            cfg.quarantine_len = v;
        }
        if let Some(v) = lookup("PAGETRAP_SEED").and_then(|v| v.parse::<u64>().ok()) {
            cfg.seed = Some(v);
        }
        cfg
    }
}
