use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

static INV_AT: AtomicU64 = AtomicU64::new(0);

/// Returns a fresh invalidation stamp.
///
/// Stamps increase monotonically across the whole process so a [`Sticky`]
/// value can tell whether it was invalidated after it last did some work.
pub fn inv_at() -> u64 {
    INV_AT.fetch_add(1, Ordering::SeqCst) + 1
}

/// A memoised value that outlives [`Memo::clear`].
///
/// Instead of being dropped, the value is told the stamp of the clear and is
/// expected to reset whatever derived data it holds.
pub trait Sticky: Send + Sync + 'static {
    fn invalidate_memo(&self, inv_at: u64);
}

pub type MemoValue = Arc<dyn Any + Send + Sync>;

trait MemoKey: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn matches(&self, other: &dyn Any) -> bool;
}

impl<K> MemoKey for K
where
    K: Any + PartialEq + Send + Sync,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn matches(&self, other: &dyn Any) -> bool {
        other.downcast_ref::<K>().is_some_and(|other| other == self)
    }
}

#[derive(Default)]
struct Slot {
    value: Option<MemoValue>,
    sticky: Option<Arc<dyn Sticky>>,
}

struct Entry {
    key: Box<dyn MemoKey>,
    slot: Arc<Mutex<Slot>>,
}

/// A small key-value store with per-key locking.
///
/// Keys are arbitrary `PartialEq` values compared by type and value. While a
/// value is being computed by [`Memo::read`] only that key is locked, so a
/// slow computation never blocks readers of other keys.
#[derive(Default)]
pub struct Memo {
    entries: Mutex<Vec<Entry>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Memo {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot<K>(&self, key: &K, create: bool) -> Option<Arc<Mutex<Slot>>>
    where
        K: Any + PartialEq + Send + Sync + Clone,
    {
        let mut entries = lock(&self.entries);
        if let Some(entry) = entries.iter().find(|e| e.key.matches(key)) {
            return Some(entry.slot.clone());
        }
        if !create {
            return None;
        }
        let slot = Arc::new(Mutex::new(Slot::default()));
        entries.push(Entry {
            key: Box::new(key.clone()),
            slot: slot.clone(),
        });
        Some(slot)
    }

    /// Returns the value stored under `key`, computing it with `init` when
    /// absent (or stored with a different type).
    pub fn read<K, V, F>(&self, key: K, init: F) -> Arc<V>
    where
        K: Any + PartialEq + Send + Sync + Clone,
        V: Any + Send + Sync,
        F: FnOnce() -> V,
    {
        let Some(slot) = self.slot(&key, true) else {
            return Arc::new(init());
        };
        let mut slot = lock(&slot);
        if let Some(v) = slot.value.clone().and_then(|v| v.downcast::<V>().ok()) {
            return v;
        }
        let v = Arc::new(init());
        slot.value = Some(v.clone());
        slot.sticky = None;
        v
    }

    /// Like [`Memo::read`] but the value survives [`Memo::clear`].
    pub fn read_sticky<K, V, F>(&self, key: K, init: F) -> Arc<V>
    where
        K: Any + PartialEq + Send + Sync + Clone,
        V: Sticky,
        F: FnOnce() -> V,
    {
        let Some(slot) = self.slot(&key, true) else {
            return Arc::new(init());
        };
        let mut slot = lock(&slot);
        if let Some(v) = slot.value.clone().and_then(|v| v.downcast::<V>().ok()) {
            return v;
        }
        let v = Arc::new(init());
        slot.value = Some(v.clone());
        slot.sticky = Some(v.clone());
        v
    }

    /// Returns the value under `key` without computing it.
    pub fn peek<K, V>(&self, key: &K) -> Option<Arc<V>>
    where
        K: Any + PartialEq + Send + Sync + Clone,
        V: Any + Send + Sync,
    {
        let slot = self.slot(key, false)?;
        let slot = lock(&slot);
        slot.value.clone().and_then(|v| v.downcast::<V>().ok())
    }

    pub fn put<K, V>(&self, key: K, value: V) -> Arc<V>
    where
        K: Any + PartialEq + Send + Sync + Clone,
        V: Any + Send + Sync,
    {
        let v = Arc::new(value);
        if let Some(slot) = self.slot(&key, true) {
            let mut slot = lock(&slot);
            slot.value = Some(v.clone());
            slot.sticky = None;
        }
        v
    }

    pub fn del<K>(&self, key: &K)
    where
        K: Any + PartialEq + Send + Sync,
    {
        lock(&self.entries).retain(|e| !e.key.matches(key));
    }

    /// Calls `f` for every computed entry until it returns `false`.
    pub fn range(&self, mut f: impl FnMut(&dyn Any, &MemoValue) -> bool) {
        let snapshot: Vec<(usize, Arc<Mutex<Slot>>)> = lock(&self.entries)
            .iter()
            .enumerate()
            .map(|(i, e)| (i, e.slot.clone()))
            .collect();
        for (i, slot) in snapshot {
            let value = lock(&slot).value.clone();
            let Some(value) = value else {
                continue;
            };
            let entries = lock(&self.entries);
            let Some(entry) = entries.get(i) else {
                break;
            };
            if !f(entry.key.as_any(), &value) {
                break;
            }
        }
    }

    pub fn values(&self) -> Vec<MemoValue> {
        let slots: Vec<_> = lock(&self.entries).iter().map(|e| e.slot.clone()).collect();
        slots
            .iter()
            .filter_map(|slot| lock(slot).value.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every non-sticky entry.
    ///
    /// Entries whose value is being computed right now are dropped too; the
    /// computation finishes on the detached slot and the next read starts over.
    pub fn clear(&self) {
        let stamp = inv_at();
        let mut sticky = Vec::new();
        {
            let mut entries = lock(&self.entries);
            entries.retain(|entry| match entry.slot.try_lock() {
                Ok(slot) => match &slot.sticky {
                    Some(s) => {
                        sticky.push(s.clone());
                        true
                    }
                    None => false,
                },
                Err(std::sync::TryLockError::Poisoned(_)) => false,
                Err(std::sync::TryLockError::WouldBlock) => false,
            });
        }
        for s in sticky {
            s.invalidate_memo(stamp);
        }
    }
}

impl fmt::Debug for Memo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memo").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, PartialEq)]
    struct PathKey(&'static str);

    #[derive(Debug, Clone, PartialEq)]
    struct OtherKey(&'static str);

    struct Counter {
        invalidated: AtomicU64,
    }

    impl Sticky for Counter {
        fn invalidate_memo(&self, inv_at: u64) {
            self.invalidated.store(inv_at, Ordering::SeqCst);
        }
    }

    #[test]
    fn read_computes_once_per_key() {
        let memo = Memo::new();
        let calls = AtomicUsize::new(0);
        let compute = || {
            calls.fetch_add(1, Ordering::SeqCst);
            42u32
        };
        assert_eq!(*memo.read(PathKey("a"), compute), 42);
        assert_eq!(*memo.read(PathKey("a"), || 7u32), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn keys_of_different_types_do_not_collide() {
        let memo = Memo::new();
        memo.put(PathKey("x"), 1u8);
        memo.put(OtherKey("x"), 2u8);
        assert_eq!(memo.peek::<_, u8>(&PathKey("x")).as_deref(), Some(&1));
        assert_eq!(memo.peek::<_, u8>(&OtherKey("x")).as_deref(), Some(&2));
        assert_eq!(memo.len(), 2);
    }

    #[test]
    fn clear_keeps_sticky_values_and_notifies_them() {
        let memo = Memo::new();
        memo.put(PathKey("plain"), "gone".to_string());
        let sticky = memo.read_sticky(PathKey("sticky"), || Counter {
            invalidated: AtomicU64::new(0),
        });

        memo.clear();

        assert!(memo.peek::<_, String>(&PathKey("plain")).is_none());
        let again = memo
            .peek::<_, Counter>(&PathKey("sticky"))
            .expect("sticky value survives");
        assert!(Arc::ptr_eq(&sticky, &again));
        assert!(sticky.invalidated.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn concurrent_reads_share_one_computation() {
        let memo = Arc::new(Memo::new());
        let calls = Arc::new(AtomicUsize::new(0));
        std::thread::scope(|s| {
            for _ in 0..8 {
                let memo = memo.clone();
                let calls = calls.clone();
                s.spawn(move || {
                    memo.read(PathKey("slow"), || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(std::time::Duration::from_millis(20));
                        "done"
                    });
                });
            }
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn del_and_values() {
        let memo = Memo::new();
        memo.put(PathKey("a"), 1i32);
        memo.put(PathKey("b"), 2i32);
        memo.del(&PathKey("a"));
        let values: Vec<i32> = memo
            .values()
            .into_iter()
            .filter_map(|v| v.downcast::<i32>().ok().map(|v| *v))
            .collect();
        assert_eq!(values, vec![2]);

        let mut seen = Vec::new();
        memo.range(|k, _| {
            if let Some(k) = k.downcast_ref::<PathKey>() {
                seen.push(k.0);
            }
            true
        });
        assert_eq!(seen, vec!["b"]);
    }
}
