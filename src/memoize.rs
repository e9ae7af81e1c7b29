//! Memoized fingerprint computation shared by all worker threads.

use std::{
    cell::RefCell,
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Weak,
    },
};

use bit_set::BitSet;
use dashmap::DashMap;

use crate::{
    canonize::canonical_encoding,
    error::Result,
    fingerprint::{resolve_handler, FingerprintHandler},
    molecule::Molecule,
};

static NEXT_CACHE_ID: AtomicU64 = AtomicU64::new(0);

/// A handler clone owned by one thread on behalf of one cache.
struct ThreadHandler {
    handler: Box<dyn FingerprintHandler>,
    owner: Weak<AtomicUsize>,
}

impl Drop for ThreadHandler {
    fn drop(&mut self) {
        if let Some(live) = self.owner.upgrade() {
            live.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

thread_local! {
    // Keyed by cache id. Dropped with the thread.
    static THREAD_HANDLERS: RefCell<HashMap<u64, ThreadHandler>> = RefCell::new(HashMap::new());
}

/// Thread-safe map from canonical encoding to fingerprint.
///
/// Entries are write-once: two threads racing on the same new encoding may
/// both compute it, but they compute equal values and only the first insert
/// is kept. Each thread computes with its own clone of the handler, held in
/// thread-local storage and released when the thread exits.
#[derive(Clone)]
pub struct FingerprintCache {
    id: u64,
    prototype: Arc<dyn FingerprintHandler>,
    fingerprints: Arc<DashMap<String, BitSet>>,
    live_handlers: Arc<AtomicUsize>,
}

impl FingerprintCache {
    /// Resolve the handler called `name` and start with an empty cache.
    pub fn new(name: &str) -> Result<Self> {
        Ok(Self::with_handler(resolve_handler(name)?))
    }

    pub fn with_handler(handler: Box<dyn FingerprintHandler>) -> Self {
        Self {
            id: NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed),
            prototype: Arc::from(handler),
            fingerprints: Arc::new(DashMap::new()),
            live_handlers: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn handler_name(&self) -> String {
        self.prototype.name()
    }

    pub fn num_bits(&self) -> usize {
        self.prototype.num_bits()
    }

    /// Fingerprint of `mol`, computed at most once per canonical encoding
    /// (modulo the benign race above).
    pub fn get_fingerprint(&self, mol: &Molecule) -> BitSet {
        self.fingerprint_for(&canonical_encoding(mol), mol)
    }

    /// As [`Self::get_fingerprint`] when the canonical encoding of `mol` is
    /// already known.
    pub fn fingerprint_for(&self, encoding: &str, mol: &Molecule) -> BitSet {
        if let Some(fp) = self.fingerprints.get(encoding) {
            return fp.clone();
        }
        let fp = self.handler_for_current_thread(|handler| handler.compute(mol));
        self.fingerprints
            .entry(encoding.to_string())
            .or_insert(fp)
            .clone()
    }

    /// Run `f` with this thread's private handler, cloned from the prototype
    /// on first use.
    pub fn handler_for_current_thread<R>(&self, f: impl FnOnce(&mut dyn FingerprintHandler) -> R) -> R {
        THREAD_HANDLERS.with(|handlers| {
            let mut handlers = handlers.borrow_mut();
            if !handlers.contains_key(&self.id) {
                // Clones left behind by dropped caches.
                handlers.retain(|_, h| h.owner.strong_count() > 0);
                self.live_handlers.fetch_add(1, Ordering::Relaxed);
                handlers.insert(
                    self.id,
                    ThreadHandler {
                        handler: self.prototype.clone_for_thread(),
                        owner: Arc::downgrade(&self.live_handlers),
                    },
                );
            }
            match handlers.get_mut(&self.id) {
                Some(slot) => f(slot.handler.as_mut()),
                None => f(self.prototype.clone_for_thread().as_mut()),
            }
        })
    }

    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }

    /// Number of live threads holding a handler clone.
    pub fn thread_handlers(&self) -> usize {
        self.live_handlers.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for FingerprintCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FingerprintCache")
            .field("handler", &self.prototype.name())
            .field("entries", &self.fingerprints.len())
            .finish()
    }
}
