//! The runtime heap and the cycle-collector worker.
//!
//! Objects live behind strong references ([crate::value::ObjRef]); the heap
//! keeps a weak list so the collector can see everything that's alive. The
//! worker thread never executes user code and never touches the heap: it
//! only sets a pending flag on a timer. The interpreter checks that flag at
//! statement boundaries and runs the mark/sweep itself, which keeps root
//! scanning race-free without locking the environment.

use crate::consts::COLLECTOR_WAKE_MILLIS;
use crate::value::{ObjRef, Value};
use std::rc::Weak;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A heap object. The field vector's positions match the runtime class
/// layout (base fields first).
#[derive(Debug)]
pub(crate) struct Object {
    /// Dynamic class name
    pub class: String,
    pub fields: Vec<Value>,
    /// Set by the collector when the object was found unreachable with no
    /// tracked fields; destruction then becomes a no-op
    pub skip_destructor: bool,
    pub destroyed: bool,
    /// Collector workspace
    pub marked: bool,
}

impl Object {
    pub fn new(class: String, fields: Vec<Value>) -> Self {
        Self {
            class,
            fields,
            skip_destructor: false,
            destroyed: false,
            marked: false,
        }
    }
}

/// The weak list of every object ever allocated (dead entries are pruned
/// opportunistically).
#[derive(Debug, Default)]
pub(crate) struct Heap {
    objects: Vec<Weak<std::cell::RefCell<Object>>>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, obj: &ObjRef) {
        self.objects.push(std::rc::Rc::downgrade(obj));
    }

    /// Upgrade every live entry, pruning the dead ones.
    pub fn live(&mut self) -> Vec<ObjRef> {
        let mut live = Vec::with_capacity(self.objects.len());
        self.objects.retain(|weak| match weak.upgrade() {
            Some(obj) => {
                live.push(obj);
                true
            }
            None => false,
        });
        live
    }

    /// Number of currently live objects. Test probe.
    pub fn len(&mut self) -> usize {
        self.live().len()
    }
}

/// Handle to the background collector worker. The worker wakes roughly
/// every [COLLECTOR_WAKE_MILLIS] and raises the pending flag; it can also be
/// poked explicitly (e.g. by `destroy`).
#[derive(Debug)]
pub(crate) struct Collector {
    pending: Arc<AtomicBool>,
    stop: Arc<(Mutex<bool>, Condvar)>,
    worker: Option<JoinHandle<()>>,
}

impl Collector {
    pub fn start() -> Self {
        let pending = Arc::new(AtomicBool::new(false));
        let stop = Arc::new((Mutex::new(false), Condvar::new()));

        let worker_pending = Arc::clone(&pending);
        let worker_stop = Arc::clone(&stop);
        let worker = thread::spawn(move || {
            let (lock, condvar) = &*worker_stop;
            let mut stopped = lock.lock().unwrap();
            while !*stopped {
                let (guard, _) = condvar
                    .wait_timeout(
                        stopped,
                        Duration::from_millis(COLLECTOR_WAKE_MILLIS),
                    )
                    .unwrap();
                stopped = guard;
                if !*stopped {
                    worker_pending.store(true, Ordering::SeqCst);
                }
            }
        });

        Self {
            pending,
            stop,
            worker: Some(worker),
        }
    }

    /// Ask for a collection at the next statement boundary.
    pub fn request(&self) {
        self.pending.store(true, Ordering::SeqCst);
    }

    /// Consume the pending flag. Returns true if a collection was
    /// requested since the last check.
    pub fn take_pending(&self) -> bool {
        self.pending.swap(false, Ordering::SeqCst)
    }

    /// Stop the worker and join it.
    pub fn stop(&mut self) {
        let (lock, condvar) = &*self.stop;
        *lock.lock().unwrap() = true;
        condvar.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_heap_prunes_dead_objects() {
        let mut heap = Heap::new();
        let a = Rc::new(RefCell::new(Object::new("A".into(), vec![])));
        let b = Rc::new(RefCell::new(Object::new("B".into(), vec![])));
        heap.register(&a);
        heap.register(&b);
        assert_eq!(heap.len(), 2);
        drop(b);
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn test_collector_sets_pending_on_request() {
        let mut collector = Collector::start();
        assert!(!collector.take_pending());
        collector.request();
        assert!(collector.take_pending());
        assert!(!collector.take_pending());
        collector.stop();
    }

    #[test]
    fn test_collector_wakes_on_timer() {
        let mut collector = Collector::start();
        // Give the worker a couple of wake cycles
        thread::sleep(Duration::from_millis(COLLECTOR_WAKE_MILLIS * 3));
        assert!(collector.take_pending());
        collector.stop();
    }
}
