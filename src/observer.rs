use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::{Arc, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync + 'static>;

struct ListenerSet<T> {
    next_id:   u64,
    callbacks: BTreeMap<u64, Callback<T>>,
}

/// A set of registered callbacks. Every registration returns a [`ListenerHandle`]; dropping the handle or calling
/// [`ListenerHandle::unsubscribe`] removes the callback.
pub struct Listeners<T> {
    set: Arc<Mutex<ListenerSet<T>>>,
}

impl<T> Listeners<T>
where
    T: 'static,
{
    pub fn new() -> Self {
        Self {
            set: Arc::new(Mutex::new(ListenerSet {
                next_id:   0,
                callbacks: BTreeMap::new(),
            })),
        }
    }

    pub fn add<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut set = self.set.lock();
            let id = set.next_id;
            set.next_id += 1;
            set.callbacks.insert(id, Arc::new(callback));
            id
        };

        let weak: Weak<Mutex<ListenerSet<T>>> = Arc::downgrade(&self.set);
        ListenerHandle {
            remover: Some(Box::new(move || {
                if let Some(set) = weak.upgrade() {
                    set.lock().callbacks.remove(&id);
                }
            })),
        }
    }

    /// Invoke every callback. Callbacks run outside of the lock, so they are free to register or unregister.
    pub fn emit(&self, value: &T) -> usize {
        let callbacks: Vec<Callback<T>> = self.set.lock().callbacks.values().cloned().collect();
        for callback in callbacks.iter() {
            callback(value);
        }
        callbacks.len()
    }

    pub fn len(&self) -> usize {
        self.set.lock().callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.set.lock().callbacks.clear();
    }
}

impl<T> Default for Listeners<T>
where
    T: 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Listeners<T> {
    fn clone(&self) -> Self {
        Self {
            set: Arc::clone(&self.set),
        }
    }
}

impl<T> Debug for Listeners<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.set.lock().callbacks.len())
            .finish()
    }
}

/// Registration of a single callback. The callback stays registered for as long as the handle lives.
#[must_use = "the callback is unregistered as soon as the handle is dropped"]
pub struct ListenerHandle {
    remover: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ListenerHandle {
    pub fn unsubscribe(mut self) {
        self.remove();
    }

    /// Keep the callback registered for the lifetime of the registry.
    pub fn detach(mut self) {
        self.remover.take();
    }

    fn remove(&mut self) {
        if let Some(remover) = self.remover.take() {
            remover();
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.remove();
    }
}

impl Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("active", &self.remover.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn register_emit_unsubscribe() {
        let listeners = Listeners::<u32>::new();
        let sum = Arc::new(AtomicUsize::new(0));

        let s = sum.clone();
        let first = listeners.add(move |v| {
            s.fetch_add(*v as usize, Ordering::SeqCst);
        });
        let s = sum.clone();
        let second = listeners.add(move |v| {
            s.fetch_add(*v as usize * 10, Ordering::SeqCst);
        });

        assert_eq!(listeners.emit(&1), 2);
        assert_eq!(sum.load(Ordering::SeqCst), 11);

        first.unsubscribe();
        assert_eq!(listeners.emit(&1), 1);
        assert_eq!(sum.load(Ordering::SeqCst), 21);

        drop(second);
        assert!(listeners.is_empty());
        assert_eq!(listeners.emit(&1), 0);
    }

    #[test]
    fn detached_handle_keeps_callback() {
        let listeners = Listeners::<()>::new();
        listeners.add(|_| {}).detach();
        assert_eq!(listeners.len(), 1);
    }
}
