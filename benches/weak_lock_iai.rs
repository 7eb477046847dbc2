#[cfg(target_os = "linux")]
mod bench {
    use iai::black_box;
    use rc_intrusive::{RefCounted, StrongCounter, StrongPtr, WeakCounter};

    #[derive(Default)]
    struct Plain {
        rc: StrongCounter,
    }

    impl RefCounted for Plain {
        type Counter = StrongCounter;
        fn ref_count(&self) -> &StrongCounter {
            &self.rc
        }
    }

    #[derive(Default)]
    struct Observed {
        rc: WeakCounter,
    }

    impl RefCounted for Observed {
        type Counter = WeakCounter;
        fn ref_count(&self) -> &WeakCounter {
            &self.rc
        }
    }

    // Clone and drop a handle repeatedly.
    pub fn strong_clone_drop() {
        let p = StrongPtr::new(Plain::default());
        for _ in 0..10_000 {
            let q = p.clone();
            black_box(&q);
        }
    }

    // Successful upgrades of a live target.
    pub fn weak_lock_hit() {
        let p = StrongPtr::new(Observed::default());
        let w = p.downgrade();
        for _ in 0..10_000 {
            let q = w.lock();
            black_box(&q);
        }
    }

    // Upgrades of a target that is already gone.
    pub fn weak_lock_expired() {
        let w = StrongPtr::new(Observed::default()).downgrade();
        for _ in 0..10_000 {
            black_box(w.lock().is_empty());
        }
    }

    // First weak reference on fresh objects publishes a control block each.
    pub fn weak_first_downgrade() {
        let objects: Vec<_> = (0..1_000)
            .map(|_| StrongPtr::new(Observed::default()))
            .collect();
        let weaks: Vec<_> = objects.iter().map(StrongPtr::downgrade).collect();
        black_box((objects.len(), weaks.len()));
    }
}

#[cfg(target_os = "linux")]
use bench::{strong_clone_drop, weak_first_downgrade, weak_lock_expired, weak_lock_hit};

#[cfg(target_os = "linux")]
iai::main!(
    strong_clone_drop,
    weak_lock_hit,
    weak_lock_expired,
    weak_first_downgrade
);

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("Skipping: iai benches require Linux/valgrind.");
}
