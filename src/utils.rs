//! Shared helpers: stable name hashes, shutdown plumbing, lock recovery.

use sha2::{Digest, Sha256};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::info;

/// Stable 32-bit hash of a symbolic name.
///
/// Used to derive module ids from class names and service keys from handler
/// names; must not change across runs or platforms.
pub fn stable_hash32(name: &str) -> u32 {
    let digest = Sha256::digest(name.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Stable 64-bit hash of a symbolic name (instance ids).
pub fn stable_hash64(name: &str) -> u64 {
    let digest = Sha256::digest(name.as_bytes());
    u64::from_be_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ])
}

/// Returns a watch receiver that flips to `true` once SIGINT is received.
///
/// Must be called from within a tokio runtime.
pub fn create_shutdown_receiver() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("SIGINT received, requesting shutdown");
            let _ = tx.send(true);
        }
    });
    rx
}

/// Lock a mutex, recovering the guard if a previous holder panicked.
///
/// Module ticks run under `catch_unwind`, so a buggy module must not poison
/// the fabric's locks for everyone else.
pub fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_hash_is_deterministic() {
        assert_eq!(stable_hash32("NetworkModule"), stable_hash32("NetworkModule"));
        assert_eq!(stable_hash64("303"), stable_hash64("303"));
        assert_ne!(stable_hash32("a"), stable_hash32("b"));
    }

    #[test]
    fn lock_unpoisoned_recovers() {
        let mutex = Mutex::new(1u32);
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = mutex.lock().unwrap();
            panic!("poison it");
        }));
        assert_eq!(*lock_unpoisoned(&mutex), 1);
    }
}
