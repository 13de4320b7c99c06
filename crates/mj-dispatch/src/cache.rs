//! Compilation cache with single-flight semantics.
//!
//! Keys are SHA-256 digests over a canonical text payload. At most one
//! compilation runs per key at any moment: concurrent callers with the same
//! key block until the in-flight compilation finishes and then share its
//! artifact. A failed compilation removes the key, so an identical later
//! call may retry instead of hitting a poisoned entry.

use mj_runtime::PartitionedExecutable;
use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    namespace: &'static str,
    digest_hex: String,
}

impl CacheKey {
    #[must_use]
    pub fn as_string(&self) -> String {
        format!("{}-{}", self.namespace, self.digest_hex)
    }
}

/// Hashes a canonical payload into a cache key.
#[must_use]
pub fn build_cache_key(payload: &str) -> CacheKey {
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    let digest = hasher.finalize();

    let mut digest_hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = std::fmt::Write::write_fmt(&mut digest_hex, format_args!("{byte:02x}"));
    }

    CacheKey {
        namespace: "mjx",
        digest_hex,
    }
}

enum Slot {
    InFlight,
    Ready(Arc<dyn PartitionedExecutable>),
}

/// Unbounded artifact cache keyed by [`CacheKey`].
#[derive(Default)]
pub struct ArtifactCache {
    state: Mutex<FxHashMap<CacheKey, Slot>>,
    cond: Condvar,
    compilations: AtomicU64,
}

impl ArtifactCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of compilations that have completed successfully. Exposed so
    /// callers can observe cache idempotence.
    #[must_use]
    pub fn compile_count(&self) -> u64 {
        self.compilations.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, FxHashMap<CacheKey, Slot>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the artifact for `key`, compiling it with `build` on a miss.
    ///
    /// If another thread is already compiling the same key, blocks until
    /// that compilation resolves. When it succeeded, its artifact is
    /// shared; when it failed, the key is vacant again and this caller
    /// takes over the compilation.
    pub fn get_or_compile<E>(
        &self,
        key: &CacheKey,
        build: impl FnOnce() -> Result<Arc<dyn PartitionedExecutable>, E>,
    ) -> Result<Arc<dyn PartitionedExecutable>, E> {
        let mut state = self.lock();
        loop {
            match state.get(key) {
                Some(Slot::Ready(artifact)) => return Ok(artifact.clone()),
                Some(Slot::InFlight) => {}
                None => break,
            }
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.insert(key.clone(), Slot::InFlight);
        drop(state);

        let built = build();

        let mut state = self.lock();
        match &built {
            Ok(artifact) => {
                state.insert(key.clone(), Slot::Ready(artifact.clone()));
                self.compilations.fetch_add(1, Ordering::SeqCst);
            }
            Err(_) => {
                state.remove(key);
            }
        }
        drop(state);
        self.cond.notify_all();

        built
    }
}

#[cfg(test)]
mod tests {
    use super::{ArtifactCache, build_cache_key};
    use mj_runtime::{ExecutionError, PartitionedExecutable, ShardLayout};
    use mj_core::Value;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Debug)]
    struct NullExecutable;

    impl PartitionedExecutable for NullExecutable {
        fn execute(&self, _args: &[Value]) -> Result<Vec<Value>, ExecutionError> {
            Ok(Vec::new())
        }

        fn output_layouts(&self) -> &[ShardLayout] {
            &[]
        }

        fn donated(&self) -> &[bool] {
            &[]
        }
    }

    #[test]
    fn keys_are_deterministic_and_payload_sensitive() {
        let a = build_cache_key("payload-a");
        assert_eq!(a, build_cache_key("payload-a"));
        assert_ne!(a, build_cache_key("payload-b"));
        assert!(a.as_string().starts_with("mjx-"));
    }

    #[test]
    fn second_lookup_reuses_the_artifact() {
        let cache = ArtifactCache::new();
        let key = build_cache_key("k");

        let first = cache
            .get_or_compile::<()>(&key, || Ok(Arc::new(NullExecutable)))
            .expect("compile should succeed");
        let second = cache
            .get_or_compile::<()>(&key, || panic!("cache hit must not recompile"))
            .expect("hit should succeed");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.compile_count(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn failed_compilation_leaves_the_key_vacant() {
        let cache = ArtifactCache::new();
        let key = build_cache_key("k");

        let err = cache
            .get_or_compile(&key, || Err("boom"))
            .expect_err("build failure should propagate");
        assert_eq!(err, "boom");
        assert!(cache.is_empty());
        assert_eq!(cache.compile_count(), 0);

        cache
            .get_or_compile::<()>(&key, || Ok(Arc::new(NullExecutable)))
            .expect("retry should succeed");
        assert_eq!(cache.compile_count(), 1);
    }

    #[test]
    fn concurrent_same_key_callers_share_one_compilation() {
        let cache = Arc::new(ArtifactCache::new());
        let key = build_cache_key("hot");
        let builds = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let key = key.clone();
            let builds = Arc::clone(&builds);
            handles.push(std::thread::spawn(move || {
                cache
                    .get_or_compile::<()>(&key, || {
                        builds.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(std::time::Duration::from_millis(20));
                        Ok(Arc::new(NullExecutable))
                    })
                    .expect("compile should succeed");
            }));
        }
        for handle in handles {
            handle.join().expect("thread should not panic");
        }

        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(cache.compile_count(), 1);
    }
}
