//! Observer capability shared by readers and plugins.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, warn};

/// Receives events of type `E`
pub trait Observer<E>: Send + Sync {
    fn update(&self, event: &E) -> anyhow::Result<()>;
}

impl<E, F> Observer<E> for F
where
    F: Fn(&E) -> anyhow::Result<()> + Send + Sync,
{
    fn update(&self, event: &E) -> anyhow::Result<()> {
        self(event)
    }
}

/// Something observers can subscribe to
pub trait Observable<E> {
    fn add_observer(&self, observer: Arc<dyn Observer<E>>);

    /// Returns false if the observer was not registered
    fn remove_observer(&self, observer: &Arc<dyn Observer<E>>) -> bool;

    fn clear_observers(&self);

    fn count_observers(&self) -> usize;

    /// Deliver `event` to every observer in registration order
    fn notify_observers(&self, event: &E);
}

/// Ordered observer list with failure isolation.
///
/// Notification works on a snapshot taken at the start of dispatch, so an
/// observer added or removed meanwhile does not affect the others.
pub struct ObserverList<E> {
    observers: RwLock<Vec<Arc<dyn Observer<E>>>>,
}

impl<E> ObserverList<E> {
    pub fn new() -> Self {
        Self {
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn add(&self, observer: Arc<dyn Observer<E>>) {
        self.observers.write().push(observer);
    }

    pub fn remove(&self, observer: &Arc<dyn Observer<E>>) -> bool {
        let mut observers = self.observers.write();
        let target = Arc::as_ptr(observer) as *const ();
        match observers
            .iter()
            .position(|o| Arc::as_ptr(o) as *const () == target)
        {
            Some(idx) => {
                observers.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        self.observers.write().clear();
    }

    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.read().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Arc<dyn Observer<E>>> {
        self.observers.read().clone()
    }

    /// Notify every observer; returns how many failed.
    ///
    /// Errors and panics are logged with `source` and never reach the caller.
    pub fn notify(&self, source: &str, event: &E) -> usize {
        let mut failures = 0;
        for observer in self.snapshot() {
            match catch_unwind(AssertUnwindSafe(|| observer.update(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    warn!(source = %source, "observer failed: {:#}", e);
                }
                Err(panic) => {
                    failures += 1;
                    error!(source = %source, "observer panicked: {}", panic_message(&*panic));
                }
            }
        }
        failures
    }
}

impl<E> Default for ObserverList<E> {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> Arc<dyn Observer<u32>> {
        let log = Arc::clone(log);
        Arc::new(move |e: &u32| -> anyhow::Result<()> {
            log.lock().push(format!("{}:{}", tag, e));
            Ok(())
        })
    }

    #[test]
    fn test_notify_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let list = ObserverList::new();
        list.add(recorder(&log, "a"));
        list.add(recorder(&log, "b"));

        assert_eq!(list.notify("test", &1), 0);
        assert_eq!(*log.lock(), vec!["a:1", "b:1"]);
    }

    #[test]
    fn test_failing_observers_are_isolated() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let list: ObserverList<u32> = ObserverList::new();
        list.add(Arc::new(|_: &u32| -> anyhow::Result<()> { anyhow::bail!("boom") }));
        list.add(Arc::new(|_: &u32| -> anyhow::Result<()> { panic!("kaboom") }));
        list.add(recorder(&log, "c"));

        assert_eq!(list.notify("test", &7), 2);
        assert_eq!(*log.lock(), vec!["c:7"]);
    }

    #[test]
    fn test_remove_and_clear() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let list = ObserverList::new();
        let a = recorder(&log, "a");
        list.add(Arc::clone(&a));
        list.add(recorder(&log, "b"));

        assert!(list.remove(&a));
        assert!(!list.remove(&a));
        assert_eq!(list.len(), 1);

        list.clear();
        assert!(list.is_empty());
        assert_eq!(list.notify("test", &1), 0);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_observer_added_during_dispatch_waits_for_next_event() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let list = Arc::new(ObserverList::new());
        let late = recorder(&log, "late");
        {
            let list2 = Arc::clone(&list);
            let late = Arc::clone(&late);
            list.add(Arc::new(move |_: &u32| -> anyhow::Result<()> {
                list2.add(Arc::clone(&late));
                Ok(())
            }));
        }

        list.notify("test", &1);
        assert!(log.lock().is_empty());
        list.notify("test", &2);
        assert_eq!(*log.lock(), vec!["late:2"]);
    }

    #[test]
    fn test_observer_removed_during_dispatch_still_gets_current_event() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let list = Arc::new(ObserverList::new());
        let b = recorder(&log, "b");

        list.add(recorder(&log, "a"));
        {
            let list2 = Arc::clone(&list);
            let b = Arc::clone(&b);
            list.add(Arc::new(move |_: &u32| -> anyhow::Result<()> {
                list2.remove(&b);
                Ok(())
            }));
        }
        list.add(Arc::clone(&b));
        list.add(recorder(&log, "c"));

        assert_eq!(list.notify("test", &1), 0);
        assert_eq!(*log.lock(), vec!["a:1", "b:1", "c:1"]);
        assert_eq!(list.len(), 3);

        log.lock().clear();
        list.notify("test", &2);
        assert_eq!(*log.lock(), vec!["a:2", "c:2"]);
    }
}
