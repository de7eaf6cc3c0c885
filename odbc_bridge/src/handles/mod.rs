use crate::error::{OdbcError, Result};
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

struct Entry<T> {
    value: Arc<T>,
    pins: Arc<AtomicUsize>,
}

struct TableInner<T> {
    entries: HashMap<u32, Entry<T>>,
    next_id: u32,
}

/// Resources keyed by integer id. Background jobs pin the resource they
/// target so it outlives its removal from the table.
pub struct HandleTable<T> {
    name: &'static str,
    inner: Mutex<TableInner<T>>,
}

impl<T> HandleTable<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(TableInner {
                entries: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, TableInner<T>>> {
        self.inner
            .lock()
            .map_err(|_| OdbcError::InternalError(format!("Failed to lock {} table mutex", self.name)))
    }

    pub fn insert(&self, value: T) -> Result<u32> {
        let mut inner = self.lock()?;
        let id = inner.next_id;
        inner.next_id = inner.next_id.wrapping_add(1).max(1);
        inner.entries.insert(
            id,
            Entry {
                value: Arc::new(value),
                pins: Arc::new(AtomicUsize::new(0)),
            },
        );
        Ok(id)
    }

    pub fn get(&self, id: u32) -> Result<Arc<T>> {
        self.lock()?
            .entries
            .get(&id)
            .map(|e| Arc::clone(&e.value))
            .ok_or(OdbcError::InvalidHandle(id))
    }

    /// Holds `id` for the duration of a job. The pin is released when the
    /// returned guard drops.
    pub fn pin(&self, id: u32) -> Result<Pinned<T>> {
        let inner = self.lock()?;
        let entry = inner.entries.get(&id).ok_or(OdbcError::InvalidHandle(id))?;
        Ok(Pinned::new(Arc::clone(&entry.value), Arc::clone(&entry.pins)))
    }

    /// Drops the table's reference. A pinned value stays alive until its
    /// last pin is released.
    pub fn remove(&self, id: u32) -> Result<()> {
        let entry = self
            .lock()?
            .entries
            .remove(&id)
            .ok_or(OdbcError::InvalidHandle(id))?;
        let pins = entry.pins.load(Ordering::Acquire);
        if pins > 0 {
            log::debug!("{} {} removed while pinned by {} job(s)", self.name, id, pins);
        }
        Ok(())
    }

    pub fn pin_count(&self, id: u32) -> usize {
        self.lock()
            .ok()
            .and_then(|inner| inner.entries.get(&id).map(|e| e.pins.load(Ordering::Acquire)))
            .unwrap_or(0)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.lock()
            .map(|inner| inner.entries.contains_key(&id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.lock().map(|inner| inner.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Scope guard keeping a resource referenced while a job targets it.
pub struct Pinned<T> {
    value: Arc<T>,
    pins: Arc<AtomicUsize>,
}

impl<T> Pinned<T> {
    fn new(value: Arc<T>, pins: Arc<AtomicUsize>) -> Self {
        pins.fetch_add(1, Ordering::AcqRel);
        Self { value, pins }
    }

    /// Pins a value that does not live in a table.
    pub fn detached(value: Arc<T>) -> Self {
        Self::new(value, Arc::new(AtomicUsize::new(0)))
    }
}

impl<T> Deref for Pinned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> Drop for Pinned<T> {
    fn drop(&mut self) {
        self.pins.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_start_at_one() {
        let table = HandleTable::new("test");
        assert_eq!(table.insert("a").unwrap(), 1);
        assert_eq!(table.insert("b").unwrap(), 2);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_get_not_found() {
        let table: HandleTable<u8> = HandleTable::new("test");
        match table.get(9) {
            Err(OdbcError::InvalidHandle(9)) => (),
            other => panic!("Expected InvalidHandle, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_pin_and_unpin() {
        let table = HandleTable::new("test");
        let id = table.insert(5u32).unwrap();
        {
            let p1 = table.pin(id).unwrap();
            let _p2 = table.pin(id).unwrap();
            assert_eq!(*p1, 5);
            assert_eq!(table.pin_count(id), 2);
        }
        assert_eq!(table.pin_count(id), 0);
    }

    #[test]
    fn test_remove_while_pinned_keeps_value_alive() {
        struct Tracked(Arc<AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let table = HandleTable::new("test");
        let id = table.insert(Tracked(Arc::clone(&drops))).unwrap();

        let pin = table.pin(id).unwrap();
        table.remove(id).unwrap();
        assert!(!table.contains(id));
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        drop(pin);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_twice_reports_invalid_handle() {
        let table = HandleTable::new("test");
        let id = table.insert(1u8).unwrap();
        table.remove(id).unwrap();
        assert!(matches!(table.remove(id), Err(OdbcError::InvalidHandle(_))));
    }

    #[test]
    fn test_pin_unknown_id_fails() {
        let table: HandleTable<u8> = HandleTable::new("test");
        assert!(table.pin(3).is_err());
    }
}
