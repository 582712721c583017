//! Top level runtime module, holding the process-wide runtime context.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use atomic::Atomic;
use parking_lot::Mutex;

mod alloc;
mod atexit;
mod core;
mod ctors;
mod image;
mod upcall;

pub use self::alloc::{Block, BlockArena, FixedBlockPool};
pub use atexit::{DeferredExitRegistry, ExitFn, CALLBACKS_PER_BLOCK};
pub use ctors::{InitTable, StaticInitTable};
pub use image::{MappedImage, SectionDescriptor, SectionEnumerator, SectionFlags};
pub use upcall::{Dispatch, InterruptRouter};

pub use self::core::{BootState, LoaderReason};
use self::core::BootRecord;
use crate::{
    config::RuntimeConfig,
    preinit::{DiagnosticSink, STDERR_SINK},
    RegistryError,
};

/// Size in bytes of the blocks handed out by the runtime's own pool.
pub const POOL_BLOCK_SIZE: usize = 64;

bitflags::bitflags! {
    /// Various state flags for the runtime.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RuntimeState : u32 {
        /// The loader told us about process attach, so attach need not be synthesized.
        const LOADER_NOTIFIED = 1;
        const ROUTER_INSTALLED = 2;
        /// Constructors have run and the entry point may be called.
        const READY = 4;
    }
}

/// The runtime context. One is built at process entry; teardown is [CrtRuntime::detach].
pub struct CrtRuntime {
    config: RuntimeConfig,
    state: AtomicU32,
    boot: Mutex<BootRecord>,
    current: Atomic<BootState>,
    arena: BlockArena<POOL_BLOCK_SIZE>,
    exit_registry: DeferredExitRegistry,
    init_table: StaticInitTable,
    router: InterruptRouter,
    sink: &'static dyn DiagnosticSink,
}

impl std::fmt::Debug for CrtRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CrtRuntime({:?}, {})",
            self.boot_state(),
            if self.state().contains(RuntimeState::READY) {
                "ready"
            } else {
                "not-ready"
            }
        )
    }
}

impl CrtRuntime {
    /// Build a runtime that reports fatal conditions to standard error.
    pub fn new(config: RuntimeConfig, init_table: StaticInitTable) -> Arc<Self> {
        Self::with_sink(config, init_table, &STDERR_SINK)
    }

    pub fn with_sink(
        config: RuntimeConfig,
        init_table: StaticInitTable,
        sink: &'static dyn DiagnosticSink,
    ) -> Arc<Self> {
        tracing::debug!("building runtime context: {:?}", config);
        Arc::new(Self {
            arena: BlockArena::new(config.pool_capacity),
            config,
            state: AtomicU32::new(0),
            boot: Mutex::new(BootRecord::new()),
            current: Atomic::new(BootState::Unattached),
            exit_registry: DeferredExitRegistry::new(),
            init_table,
            router: InterruptRouter::new(),
            sink,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn state(&self) -> RuntimeState {
        RuntimeState::from_bits_truncate(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, flags: RuntimeState) {
        self.state.fetch_or(flags.bits(), Ordering::SeqCst);
    }

    fn clear_state(&self, flags: RuntimeState) {
        self.state.fetch_and(!flags.bits(), Ordering::SeqCst);
    }

    /// The current life-cycle state. Does not wait for an in-progress transition.
    pub fn boot_state(&self) -> BootState {
        self.current.load(Ordering::SeqCst)
    }

    /// Every state the runtime has been in, oldest first.
    pub fn history(&self) -> Vec<BootState> {
        self.boot.lock().history().to_vec()
    }

    pub fn router(&self) -> &InterruptRouter {
        &self.router
    }

    pub fn exit_registry(&self) -> &DeferredExitRegistry {
        &self.exit_registry
    }

    /// Arrange for `func(context)` to run at teardown, before static destructors.
    pub fn register_at_exit(&self, func: ExitFn, context: usize) -> Result<(), RegistryError> {
        self.exit_registry.register(func, context)
    }

    pub fn arena(&self) -> &BlockArena<POOL_BLOCK_SIZE> {
        &self.arena
    }

    /// A new pool over the runtime's block arena.
    pub fn pool(&self) -> FixedBlockPool<'_, POOL_BLOCK_SIZE> {
        self.arena.pool()
    }
}
