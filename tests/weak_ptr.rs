use rc_intrusive::{upcast, AsAny, LockError, RefCount, RefCounted, StrongPtr, WeakCounter, WeakPtr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Object {
    rc: WeakCounter,
    value: u64,
    drops: Arc<AtomicUsize>,
}

impl Object {
    fn new(value: u64, drops: &Arc<AtomicUsize>) -> Self {
        Self {
            rc: WeakCounter::new(),
            value,
            drops: Arc::clone(drops),
        }
    }
}

impl RefCounted for Object {
    type Counter = WeakCounter;
    fn ref_count(&self) -> &WeakCounter {
        &self.rc
    }
}

impl Drop for Object {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn lifecycle_scenario() {
    init_logging();
    let drops = Arc::new(AtomicUsize::new(0));
    let o = Box::new(Object::new(1, &drops));
    assert_eq!(o.rc.use_count(), 0);

    let p1 = StrongPtr::from(o);
    assert_eq!(p1.use_count(), 1);
    let w = p1.downgrade();
    let p2 = p1.clone();
    assert_eq!(p1.use_count(), 2);

    {
        let locked = w.lock();
        assert!(!locked.is_empty());
        assert_eq!(p1.use_count(), 3);
        assert_eq!(w.use_count(), 3);
    }
    assert_eq!(p1.use_count(), 2);

    drop(p1);
    assert!(!w.expired());
    drop(p2);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert!(w.lock().is_empty());
    assert!(w.expired());
    assert_eq!(w.try_lock().unwrap_err(), LockError::Expired);

    // Stays expired.
    let w2 = w.clone();
    assert!(w2.expired());
    assert!(w2.lock().is_empty());
}

#[test]
fn weak_handles_do_not_keep_target_alive() {
    let drops = Arc::new(AtomicUsize::new(0));
    let p = StrongPtr::new(Object::new(2, &drops));
    let weaks: Vec<WeakPtr<Object>> = (0..4).map(|_| p.downgrade()).collect();
    assert_eq!(p.use_count(), 1);
    drop(p);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert!(weaks.iter().all(|w| w.expired()));
}

#[test]
fn raw_pointer_weak_reference() {
    let drops = Arc::new(AtomicUsize::new(0));
    let mut p = StrongPtr::new(Object::new(3, &drops));
    let raw = p.detach().expect("non-empty");
    let w = unsafe { WeakPtr::from_raw(raw.as_ptr()) };
    assert_eq!(w.lock().value, 3);
    assert_eq!(unsafe { rc_intrusive::strong::decrement(raw) }, 0);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert!(w.expired());
}

#[test]
fn reset_and_default_weak() {
    let drops = Arc::new(AtomicUsize::new(0));
    let p = StrongPtr::new(Object::new(4, &drops));
    let mut w = WeakPtr::from(&p);
    assert!(!w.expired());
    w.reset();
    assert!(w.expired());
    assert_eq!(w.try_lock().unwrap_err(), LockError::Empty);
    assert!(WeakPtr::<Object>::default().lock().is_empty());
    assert_eq!(p.rc.weak_count(), 1);
}

// ---- Weak views through trait objects ----

trait Labelled: RefCounted<Counter = WeakCounter> + AsAny {
    fn label(&self) -> String;
}

impl Labelled for Object {
    fn label(&self) -> String {
        format!("object-{}", self.value)
    }
}

#[test]
fn weak_upcast_and_lock_through_trait_object() {
    let drops = Arc::new(AtomicUsize::new(0));
    let p = StrongPtr::new(Object::new(5, &drops));
    let w: WeakPtr<dyn Labelled> = upcast!(p.downgrade(), dyn Labelled);
    let dynp: StrongPtr<dyn Labelled> = upcast!(p.clone(), dyn Labelled);
    let w2 = dynp.downgrade();
    assert!(WeakPtr::ptr_eq(&w, &w2));

    let locked = w.lock();
    assert_eq!(locked.label(), "object-5");
    assert_eq!(p.use_count(), 3);
    let concrete = locked.downcast::<Object>().expect("is an object");
    assert!(concrete == p);
    drop(concrete);
    drop(dynp);
    drop(p);
    assert!(w.expired());
    assert!(w2.lock().is_empty());
}

// ---- Races ----

#[test]
fn concurrent_first_weak_ref_publishes_one_block() {
    init_logging();
    let threads = 8;
    for _ in 0..100 {
        let drops = Arc::new(AtomicUsize::new(0));
        let p = StrongPtr::new(Object::new(6, &drops));
        let barrier = Barrier::new(threads);
        let weaks: Vec<WeakPtr<Object>> = thread::scope(|s| {
            let handles: Vec<_> = (0..threads)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        p.downgrade()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(weaks.iter().all(|w| WeakPtr::ptr_eq(w, &weaks[0])));
        assert_eq!(p.rc.weak_count(), threads + 1);
    }
}

#[test]
fn lock_never_succeeds_after_final_release() {
    init_logging();
    for _ in 0..500 {
        let drops = Arc::new(AtomicUsize::new(0));
        let p = StrongPtr::new(Object::new(42, &drops));
        let w = p.downgrade();
        let released = AtomicBool::new(false);
        let barrier = Barrier::new(2);
        thread::scope(|s| {
            s.spawn(|| {
                barrier.wait();
                loop {
                    let after_release = released.load(Ordering::Acquire);
                    let q = w.lock();
                    if let Some(obj) = q.get() {
                        assert!(!after_release, "locked a released object");
                        assert_eq!(obj.value, 42);
                        assert_eq!(drops.load(Ordering::SeqCst), 0);
                    } else if after_release {
                        break;
                    }
                }
            });
            barrier.wait();
            drop(p);
            released.store(true, Ordering::Release);
        });
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(w.expired());
    }
}

#[test]
fn many_lockers_race_the_last_owner() {
    let threads = 6;
    for _ in 0..200 {
        let drops = Arc::new(AtomicUsize::new(0));
        let p = StrongPtr::new(Object::new(7, &drops));
        let w = p.downgrade();
        let barrier = Barrier::new(threads + 1);
        let released = AtomicBool::new(false);
        thread::scope(|s| {
            for _ in 0..threads {
                s.spawn(|| {
                    barrier.wait();
                    for _ in 0..100 {
                        let after_release = released.load(Ordering::Acquire);
                        let q = w.lock();
                        if let Some(obj) = q.get() {
                            assert!(!after_release, "locked a released object");
                            assert_eq!(obj.value, 7);
                        }
                    }
                });
            }
            barrier.wait();
            drop(p);
            released.store(true, Ordering::Release);
        });
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(w.expired());
    }
}

#[test]
fn final_release_finishes_while_observers_poll() {
    init_logging();
    let pollers = 8;
    for _ in 0..20 {
        let drops = Arc::new(AtomicUsize::new(0));
        let p = StrongPtr::new(Object::new(8, &drops));
        let w = p.downgrade();
        let stop = AtomicBool::new(false);
        let barrier = Barrier::new(pollers + 1);
        let elapsed = thread::scope(|s| {
            for i in 0..pollers {
                let (w, stop, barrier) = (&w, &stop, &barrier);
                s.spawn(move || {
                    barrier.wait();
                    while !stop.load(Ordering::Acquire) {
                        if i % 2 == 0 {
                            let _ = w.expired();
                        } else {
                            drop(w.lock());
                        }
                    }
                });
            }
            barrier.wait();
            // Let the pollers overlap before the last owner goes.
            thread::sleep(Duration::from_millis(2));
            let start = Instant::now();
            drop(p);
            let elapsed = start.elapsed();
            stop.store(true, Ordering::Release);
            elapsed
        });
        assert!(
            elapsed < Duration::from_secs(5),
            "final release blocked for {elapsed:?}"
        );
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(w.expired());
    }
}
