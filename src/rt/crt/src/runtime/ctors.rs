//! Static initializer and finalizer tables.

use tracing::trace;

/// A null-terminated table of initializer or finalizer functions. Entries after the first `None`
/// are never called.
pub type InitTable = &'static [Option<fn()>];

/// The constructor and destructor tables for one module, as produced by the build.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticInitTable {
    ctors: InitTable,
    dtors: InitTable,
}

impl StaticInitTable {
    pub const EMPTY: Self = Self {
        ctors: &[],
        dtors: &[],
    };

    pub const fn new(ctors: InitTable, dtors: InitTable) -> Self {
        Self { ctors, dtors }
    }

    fn live(table: InitTable) -> &'static [Option<fn()>] {
        let end = table.iter().position(Option::is_none).unwrap_or(table.len());
        &table[..end]
    }

    /// Call every constructor, starting from the last non-null entry and walking back to the first.
    pub fn run_constructors(&self) {
        let ctors = Self::live(self.ctors);
        trace!("running {} static constructors", ctors.len());
        for ctor in ctors.iter().rev().flatten() {
            ctor();
        }
    }

    /// Call every destructor in table order, stopping at the first null entry.
    pub fn run_destructors(&self) {
        let dtors = Self::live(self.dtors);
        trace!("running {} static destructors", dtors.len());
        for dtor in dtors.iter().flatten() {
            dtor();
        }
    }

    pub fn constructor_count(&self) -> usize {
        Self::live(self.ctors).len()
    }

    pub fn destructor_count(&self) -> usize {
        Self::live(self.dtors).len()
    }
}
