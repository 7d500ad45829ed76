use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::error::Result;
use crate::types::CompiledUtil;

/// `None` records a definitive non-match.
pub type Compiled = Option<Arc<[CompiledUtil]>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub token: String,
    /// Separator override used for this compile, if any.
    pub separators: Option<Vec<String>>,
}

impl CacheKey {
    pub fn new(token: impl Into<String>, separators: Option<&[String]>) -> Self {
        Self {
            token: token.into(),
            separators: separators.map(<[String]>::to_vec),
        }
    }
}

/// Token to result map. Concurrent callers for the same key wait on one
/// compile; a failed compile leaves the slot empty so the next caller
/// retries.
#[derive(Debug, Default)]
pub struct TokenCache {
    entries: Mutex<HashMap<CacheKey, Arc<OnceCell<Compiled>>>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_compile<F>(&self, key: CacheKey, compile: F) -> Result<Compiled>
    where
        F: FnOnce() -> Result<Compiled>,
    {
        let slot = {
            let mut entries = self.entries.lock();
            Arc::clone(entries.entry(key).or_default())
        };
        slot.get_or_try_init(compile).cloned()
    }

    pub fn get(&self, key: &CacheKey) -> Option<Compiled> {
        let slot = self.entries.lock().get(key).cloned()?;
        slot.get().cloned()
    }

    /// Number of settled entries.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|slot| slot.get().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::{CacheKey, TokenCache};
    use crate::error::Error;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn compiles_each_key_once() {
        let cache = TokenCache::new();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let result = cache
                .get_or_compile(CacheKey::new("p-4", None), || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                })
                .expect("compile");
            assert!(result.is_none());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn separator_override_is_part_of_the_key() {
        let cache = TokenCache::new();
        let separators = vec!["__".to_string()];
        cache
            .get_or_compile(CacheKey::new("hover__p-4", None), || Ok(None))
            .expect("default");
        assert!(cache
            .get(&CacheKey::new("hover__p-4", Some(&separators)))
            .is_none());
    }

    #[test]
    fn errors_are_not_cached() {
        let cache = TokenCache::new();
        let key = CacheKey::new("p-x", None);
        let err = cache
            .get_or_compile(key.clone(), || Err(Error::Scan("boom".into())))
            .expect_err("error");
        assert!(matches!(err, Error::Scan(_)));
        assert!(cache.get(&key).is_none());
        assert!(cache.get_or_compile(key, || Ok(None)).is_ok());
    }

    #[test]
    fn concurrent_callers_share_one_compile() {
        let cache = Arc::new(TokenCache::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let handles = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let calls = Arc::clone(&calls);
                thread::spawn(move || {
                    cache
                        .get_or_compile(CacheKey::new("flex", None), || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(std::time::Duration::from_millis(20));
                            Ok(None)
                        })
                        .expect("compile")
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
