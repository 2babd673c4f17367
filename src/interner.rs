//! # Symbol Interner
//!
//! Canonicalises predicate names, name-constants (`/coder`, `/string`) and
//! long strings into compact integer ids. Interning is process-global but
//! partitioned by kind, so an integer alone never ambiguously maps to both a
//! name-constant and a predicate name.
//!
//! Equality of interned symbols is integer comparison. Readers hit the
//! sharded [`DashMap`] fast path; the growth path for a first-seen symbol
//! takes a short write lock on the resolve table.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::{Arc, OnceLock};

/// Interned name-constant (written `/word` in source text).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NameId(pub u32);

/// Interned predicate name (arity-free; schema keys are `(NameId, arity)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PredName(pub u32);

/// Strings at or above this length are deduplicated through the interner so
/// repeated fact keys share one allocation.
const STRING_INTERN_THRESHOLD: usize = 16;

/// One id space: text -> dense id, id -> shared text.
struct SymbolPool {
    ids: DashMap<String, u32>,
    table: RwLock<Vec<Arc<str>>>,
}

impl SymbolPool {
    fn new() -> Self {
        SymbolPool {
            ids: DashMap::new(),
            table: RwLock::new(Vec::new()),
        }
    }

    fn intern(&self, text: &str) -> u32 {
        if let Some(id) = self.ids.get(text) {
            return *id;
        }
        // Slow path: allocate under the entry lock so concurrent first-sights
        // of the same symbol agree on one id.
        let entry = self.ids.entry(text.to_string());
        match entry {
            dashmap::mapref::entry::Entry::Occupied(e) => *e.get(),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                let mut table = self.table.write();
                let id = table.len() as u32;
                table.push(Arc::from(text));
                v.insert(id);
                id
            }
        }
    }

    fn resolve(&self, id: u32) -> Arc<str> {
        let table = self.table.read();
        Arc::clone(&table[id as usize])
    }

    fn len(&self) -> usize {
        self.table.read().len()
    }
}

/// Process-global interner, partitioned by symbol kind.
pub struct Interner {
    names: SymbolPool,
    predicates: SymbolPool,
    strings: DashMap<String, Arc<str>>,
}

static GLOBAL: OnceLock<Interner> = OnceLock::new();

impl Interner {
    fn new() -> Self {
        Interner {
            names: SymbolPool::new(),
            predicates: SymbolPool::new(),
            strings: DashMap::new(),
        }
    }

    /// The process-wide interner instance.
    pub fn global() -> &'static Interner {
        GLOBAL.get_or_init(Interner::new)
    }

    /// Intern a name-constant. `text` excludes the leading `/`.
    pub fn name(&self, text: &str) -> NameId {
        NameId(self.names.intern(text))
    }

    /// Intern a predicate name.
    pub fn predicate(&self, text: &str) -> PredName {
        PredName(self.predicates.intern(text))
    }

    /// Resolve a name-constant back to its text (without the leading `/`).
    pub fn name_text(&self, id: NameId) -> Arc<str> {
        self.names.resolve(id.0)
    }

    /// Resolve a predicate name back to its text.
    pub fn predicate_text(&self, id: PredName) -> Arc<str> {
        self.predicates.resolve(id.0)
    }

    /// Share the allocation for a string value. Short strings are copied
    /// directly; longer ones are deduplicated so fact keys alias one buffer.
    pub fn string(&self, text: &str) -> Arc<str> {
        if text.len() < STRING_INTERN_THRESHOLD {
            return Arc::from(text);
        }
        if let Some(shared) = self.strings.get(text) {
            return Arc::clone(&shared);
        }
        let shared: Arc<str> = Arc::from(text);
        self.strings.insert(text.to_string(), Arc::clone(&shared));
        shared
    }

    /// Number of distinct name-constants seen so far.
    pub fn name_count(&self) -> usize {
        self.names.len()
    }

    /// Number of distinct predicate names seen so far.
    pub fn predicate_count(&self) -> usize {
        self.predicates.len()
    }
}
