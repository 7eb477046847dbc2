//! Identity-keyed containers and the feature-selected default hasher.
//!
//! `StrongPtr` hashes and compares by address, so it can key hash sets and
//! maps directly. `StrongSet` and `StrongMap` pick the hasher chosen by the
//! `*-hash` Cargo features.

use std::collections::{HashMap, HashSet};

use crate::strong::StrongPtr;

#[cfg(all(
    feature = "random-state-hash",
    any(feature = "wyhash-hash", feature = "xxh3-hash")
))]
compile_error!(
    "Features 'random-state-hash' and ('wyhash-hash' or 'xxh3-hash') are mutually exclusive"
);
#[cfg(all(feature = "wyhash-hash", feature = "xxh3-hash"))]
compile_error!("Features 'wyhash-hash' and 'xxh3-hash' are mutually exclusive");
#[cfg(not(any(
    feature = "random-state-hash",
    feature = "wyhash-hash",
    feature = "xxh3-hash"
)))]
compile_error!(
    "No default hash feature selected. Enable exactly one of: 'wyhash-hash' (default), 'random-state-hash', or 'xxh3-hash'"
);

#[cfg(feature = "random-state-hash")]
pub type DefaultHashBuilder = std::collections::hash_map::RandomState;

#[cfg(feature = "wyhash-hash")]
pub type DefaultHashBuilder = SeededState<wyhash::WyHash>;

#[cfg(feature = "xxh3-hash")]
pub type DefaultHashBuilder = SeededState<xxhash_rust::xxh3::Xxh3>;

/// Name of the selected hasher, for benchmark labels.
#[cfg(feature = "wyhash-hash")]
pub const HASH_NAME: &str = "wyhash-hash";
#[cfg(feature = "random-state-hash")]
pub const HASH_NAME: &str = "random-state-hash";
#[cfg(feature = "xxh3-hash")]
pub const HASH_NAME: &str = "xxh3-hash";

/// Hash set of owning handles, keyed by object identity.
pub type StrongSet<T> = HashSet<StrongPtr<T>, DefaultHashBuilder>;

/// Hash map keyed by object identity.
pub type StrongMap<T, V> = HashMap<StrongPtr<T>, V, DefaultHashBuilder>;

#[cfg(any(feature = "wyhash-hash", feature = "xxh3-hash"))]
pub use seeded::SeededState;

#[cfg(any(feature = "wyhash-hash", feature = "xxh3-hash"))]
mod seeded {
    use core::hash::{BuildHasher, Hasher};
    use core::marker::PhantomData;
    use std::cell::Cell;
    use std::collections::hash_map::RandomState;

    /// A hasher that can be started from a 64-bit seed.
    pub trait SeedableHasher: Hasher {
        fn with_seed(seed: u64) -> Self;
    }

    #[cfg(feature = "wyhash-hash")]
    impl SeedableHasher for wyhash::WyHash {
        fn with_seed(seed: u64) -> Self {
            wyhash::WyHash::with_seed(seed)
        }
    }

    #[cfg(feature = "xxh3-hash")]
    impl SeedableHasher for xxhash_rust::xxh3::Xxh3 {
        fn with_seed(seed: u64) -> Self {
            xxhash_rust::xxh3::Xxh3::with_seed(seed)
        }
    }

    thread_local! {
        // Per-thread base key; each builder takes the next value.
        static KEY: Cell<u64> = Cell::new(base_key());
    }

    fn base_key() -> u64 {
        let mut buf = [0u8; 8];
        match getrandom::getrandom(&mut buf) {
            Ok(()) => u64::from_le_bytes(buf),
            // RandomState draws its own keys from the OS.
            Err(_) => RandomState::new().hash_one(std::thread::current().id()),
        }
    }

    /// Builder handing every hasher the seed drawn when it was created.
    pub struct SeededState<H> {
        seed: u64,
        _hasher: PhantomData<fn() -> H>,
    }

    impl<H> Clone for SeededState<H> {
        fn clone(&self) -> Self {
            Self {
                seed: self.seed,
                _hasher: PhantomData,
            }
        }
    }

    impl<H> Default for SeededState<H> {
        fn default() -> Self {
            let seed = KEY.with(|key| {
                let k = key.get();
                key.set(k.wrapping_add(1));
                k
            });
            Self {
                seed,
                _hasher: PhantomData,
            }
        }
    }

    impl<H: SeedableHasher> BuildHasher for SeededState<H> {
        type Hasher = H;

        #[inline]
        fn build_hasher(&self) -> H {
            H::with_seed(self.seed)
        }
    }
}
