// Explicit indirection for wrapping third-party entry points: a named function
// slot that can be wrapped once and restored, plus the per-call side table used
// to attach hidden state to requests and commands.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use crate::error::PatchError;

struct Slot<F: ?Sized> {
    current: Arc<F>,
    original: Option<Arc<F>>,
}

/// A replaceable entry point of a wrapped library.
pub struct Wrappable<F: ?Sized> {
    name: &'static str,
    slot: RwLock<Slot<F>>,
}

impl<F: ?Sized> Wrappable<F> {
    pub fn new(name: &'static str, function: Arc<F>) -> Self {
        Self {
            name,
            slot: RwLock::new(Slot {
                current: function,
                original: None,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The function callers dispatch through right now.
    pub fn get(&self) -> Arc<F> {
        let slot = self.slot.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&slot.current)
    }

    pub fn is_wrapped(&self) -> bool {
        let slot = self.slot.read().unwrap_or_else(PoisonError::into_inner);
        slot.original.is_some()
    }

    /// Replaces the entry point with `factory(original)`.
    pub fn wrap<W>(&self, factory: W) -> Result<(), PatchError>
    where
        W: FnOnce(Arc<F>) -> Arc<F>,
    {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        if slot.original.is_some() {
            return Err(PatchError::AlreadyWrapped(self.name));
        }
        let original = Arc::clone(&slot.current);
        slot.current = factory(Arc::clone(&original));
        slot.original = Some(original);
        log::debug!("wrapped `{}`", self.name);
        Ok(())
    }

    /// Restores the function that was in place before [`Wrappable::wrap`].
    pub fn unwrap(&self) -> Result<(), PatchError> {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        let original = slot.original.take().ok_or(PatchError::NotWrapped(self.name))?;
        slot.current = original;
        log::debug!("unwrapped `{}`", self.name);
        Ok(())
    }
}

impl<F: ?Sized> fmt::Debug for Wrappable<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wrappable")
            .field("name", &self.name)
            .field("wrapped", &self.is_wrapped())
            .finish()
    }
}

/// Process-unique identity of a request or command object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallId(u64);

impl CallId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Out-of-band state keyed by [`CallId`], scoped to the lifetime of one call.
pub struct SideTable<V> {
    entries: Mutex<HashMap<CallId, V>>,
}

impl<V> Default for SideTable<V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<V> SideTable<V> {
    pub fn insert(&self, id: CallId, value: V) -> Option<V> {
        self.lock().insert(id, value)
    }

    pub fn remove(&self, id: CallId) -> Option<V> {
        self.lock().remove(&id)
    }

    pub fn contains(&self, id: CallId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CallId, V>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<V> fmt::Debug for SideTable<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SideTable").field("len", &self.len()).finish()
    }
}

/// Removes its entry from a [`SideTable`] when dropped.
pub struct SideTableEntry<V> {
    table: Arc<SideTable<V>>,
    id: CallId,
}

impl<V> SideTableEntry<V> {
    pub fn insert(table: &Arc<SideTable<V>>, id: CallId, value: V) -> Self {
        table.insert(id, value);
        Self {
            table: Arc::clone(table),
            id,
        }
    }
}

impl<V> Drop for SideTableEntry<V> {
    fn drop(&mut self) {
        self.table.remove(self.id);
    }
}

impl<V> fmt::Debug for SideTableEntry<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SideTableEntry").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Greeter = dyn Fn(&str) -> String + Send + Sync;

    fn greeter() -> Wrappable<Greeter> {
        let greet: Arc<Greeter> = Arc::new(|name: &str| format!("hello {name}"));
        Wrappable::new("greet", greet)
    }

    #[test]
    fn wrap_then_unwrap_restores_original() {
        let slot = greeter();
        assert!(!slot.is_wrapped());

        slot.wrap(|original| Arc::new(move |name: &str| original(name).to_uppercase()))
            .unwrap();
        assert!(slot.is_wrapped());
        assert_eq!(slot.get()("bob"), "HELLO BOB");

        slot.unwrap().unwrap();
        assert!(!slot.is_wrapped());
        assert_eq!(slot.get()("bob"), "hello bob");
    }

    #[test]
    fn double_wrap_is_rejected() {
        let slot = greeter();
        slot.wrap(|original| original).unwrap();
        assert_eq!(
            slot.wrap(|original| original),
            Err(PatchError::AlreadyWrapped("greet"))
        );
        slot.unwrap().unwrap();
        assert_eq!(slot.unwrap(), Err(PatchError::NotWrapped("greet")));
    }

    #[test]
    fn side_table_entry_is_scoped() {
        let table = Arc::new(SideTable::default());
        let id = CallId::next();
        {
            let _entry = SideTableEntry::insert(&table, id, "marker");
            assert!(table.contains(id));
        }
        assert!(!table.contains(id));
        assert!(table.is_empty());
        assert_ne!(CallId::next(), CallId::next());
    }
}
