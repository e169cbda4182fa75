//! Process-wide heap configuration, read from the environment once.
//!
//! Resolution runs inside the allocator, possibly on the first allocation of
//! the process, so it cannot sit behind a `OnceLock`: parsing may allocate,
//! and that allocation re-enters here. A non-blocking atomic state machine
//! hands any reentrant or concurrent caller the build default until the
//! winning thread stores the resolved value.

use std::ffi::CStr;
use std::sync::atomic::{AtomicU8, Ordering};

use mapalloc_core::HeapConfig;

// Atomic cache: 0 = unresolved, 255 = resolving, anything else is
// `HeapConfig::to_bits` output.
static CACHED_CONFIG: AtomicU8 = AtomicU8::new(CONFIG_UNRESOLVED);

const CONFIG_UNRESOLVED: u8 = 0;
const CONFIG_RESOLVING: u8 = u8::MAX;

const RECLAIM_VAR: &CStr = c"MAPALLOC_RECLAIM";
const POISON_VAR: &CStr = c"MAPALLOC_POISON";

/// Run `f` on the value of an environment variable, if set and valid UTF-8.
///
/// Uses `getenv` directly; `std::env::var` allocates and takes the
/// environment lock.
fn with_env<R>(name: &CStr, f: impl FnOnce(Option<&str>) -> R) -> R {
    // SAFETY: `name` is NUL-terminated; getenv returns null or a
    // NUL-terminated string that stays valid until the environment changes.
    let raw = unsafe { libc::getenv(name.as_ptr()) };
    if raw.is_null() {
        return f(None);
    }
    // SAFETY: non-null getenv result, see above.
    let value = unsafe { CStr::from_ptr(raw) };
    f(value.to_str().ok())
}

fn resolve_from_env() -> HeapConfig {
    with_env(RECLAIM_VAR, |reclaim| {
        with_env(POISON_VAR, |poison| HeapConfig::from_env_values(reclaim, poison))
    })
}

/// Configuration of heaps built with [`Heap::new`](crate::Heap::new).
///
/// Reads `MAPALLOC_RECLAIM` and `MAPALLOC_POISON` on first call and caches
/// the result for the life of the process.
#[must_use]
pub fn process_config() -> HeapConfig {
    let cached = CACHED_CONFIG.load(Ordering::Acquire);
    if let Some(config) = HeapConfig::from_bits(cached) {
        return config;
    }
    if cached == CONFIG_RESOLVING {
        return HeapConfig::DEFAULT;
    }

    if CACHED_CONFIG
        .compare_exchange(
            CONFIG_UNRESOLVED,
            CONFIG_RESOLVING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        // Lost the race; use the winner's value if it has landed.
        return HeapConfig::from_bits(CACHED_CONFIG.load(Ordering::Acquire))
            .unwrap_or(HeapConfig::DEFAULT);
    }

    let config = resolve_from_env();
    CACHED_CONFIG.store(config.to_bits(), Ordering::Release);
    tracing::debug!(
        reclaim = ?config.reclaim,
        poison_freed = config.poison_freed,
        "resolved heap configuration"
    );
    config
}
