//! Implements the process life cycle: attach, guarded entry, and teardown.

use std::{
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{atomic::Ordering, Arc},
};

use bytemuck::NoUninit;
use tracing::{debug, info, trace, warn};

use super::{
    upcall::{hook_os_interrupts, unhook_os_interrupts},
    CrtRuntime, Dispatch, RuntimeState,
};
use crate::{preinit::format_bail, FatalError};

/// Life-cycle state of the runtime context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, NoUninit)]
#[repr(u8)]
pub enum BootState {
    Unattached,
    Attaching,
    Running,
    Detaching,
    Detached,
    FaultedDuringAttach,
}

impl BootState {
    pub fn is_terminal(self) -> bool {
        matches!(self, BootState::Detached | BootState::FaultedDuringAttach)
    }
}

/// Why the loader is calling into the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderReason {
    ProcessAttach,
    ProcessDetach,
    ThreadAttach,
    ThreadDetach,
}

#[derive(Debug)]
pub(crate) struct BootRecord {
    history: Vec<BootState>,
}

impl BootRecord {
    pub(crate) fn new() -> Self {
        Self {
            history: vec![BootState::Unattached],
        }
    }

    fn current(&self) -> BootState {
        self.history
            .last()
            .copied()
            .unwrap_or(BootState::Unattached)
    }

    pub(crate) fn history(&self) -> &[BootState] {
        &self.history
    }
}

fn panic_detail(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl CrtRuntime {
    fn transition(&self, record: &mut BootRecord, next: BootState) {
        trace!("boot: {:?} -> {:?}", record.current(), next);
        record.history.push(next);
        self.current.store(next, Ordering::SeqCst);
    }

    /// Handle a notification from the loader. Thread notifications are ignored.
    pub fn notify(self: &Arc<Self>, reason: LoaderReason) -> Result<(), FatalError> {
        debug!("loader notification: {:?}", reason);
        match reason {
            LoaderReason::ProcessAttach => {
                self.set_state(RuntimeState::LOADER_NOTIFIED);
                self.attach()
            }
            LoaderReason::ProcessDetach => self.detach(),
            LoaderReason::ThreadAttach | LoaderReason::ThreadDetach => Ok(()),
        }
    }

    /// Run static constructors and install the interrupt router. Attaching an already attached
    /// runtime does nothing; attaching after a failed attach fails again.
    ///
    /// Constructors run with the transition lock held and must not attach or detach.
    pub fn attach(self: &Arc<Self>) -> Result<(), FatalError> {
        let mut record = self.boot.lock();
        match record.current() {
            BootState::Unattached => {}
            BootState::FaultedDuringAttach => {
                return Err(FatalError::InitFailed {
                    detail: "an earlier attach failed".to_string(),
                })
            }
            state => {
                trace!("attach in state {:?} ignored", state);
                return Ok(());
            }
        }

        self.transition(&mut record, BootState::Attaching);
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| self.init_table.run_constructors()))
        {
            self.transition(&mut record, BootState::FaultedDuringAttach);
            return Err(FatalError::InitFailed {
                detail: panic_detail(payload),
            });
        }

        self.router.install();
        if self.config.hook_os_interrupts {
            hook_os_interrupts(self);
        }
        self.set_state(RuntimeState::ROUTER_INSTALLED | RuntimeState::READY);
        self.transition(&mut record, BootState::Running);
        Ok(())
    }

    /// Tear the runtime down: deferred-exit callbacks newest first, then static destructors, then
    /// the interrupt router is removed. Only a running runtime is torn down; in any other state
    /// this does nothing. A concurrent caller waits for the teardown in progress.
    ///
    /// A panic in a callback or destructor ends teardown early, still leaving the runtime
    /// detached, and is reported as a fault.
    pub fn detach(&self) -> Result<(), FatalError> {
        let mut record = self.boot.lock();
        self.teardown(&mut record)
    }

    fn teardown(&self, record: &mut BootRecord) -> Result<(), FatalError> {
        if record.current() != BootState::Running {
            trace!("detach in state {:?} ignored", record.current());
            return Ok(());
        }

        self.transition(record, BootState::Detaching);
        self.clear_state(RuntimeState::READY);
        let teardown = catch_unwind(AssertUnwindSafe(|| {
            self.exit_registry.run_all();
            self.init_table.run_destructors();
        }));

        self.router.uninstall();
        unhook_os_interrupts(self);
        self.clear_state(RuntimeState::ROUTER_INSTALLED);
        self.transition(record, BootState::Detached);

        teardown.map_err(|payload| FatalError::Fault {
            detail: format!("during teardown: {}", panic_detail(payload)),
        })
    }

    /// Call the entry point inside the fault guard, attaching first if the loader never did, and
    /// tear down once it returns. A fault leaves the runtime running with no teardown done.
    pub fn enter(self: &Arc<Self>, main: impl FnOnce() -> i32) -> Result<i32, FatalError> {
        if !self.state().contains(RuntimeState::LOADER_NOTIFIED) {
            debug!("no loader attach notification recorded, synthesizing one");
        }
        self.attach()?;
        if self.boot_state() != BootState::Running {
            return Err(FatalError::InitFailed {
                detail: format!("cannot enter in state {:?}", self.boot_state()),
            });
        }

        let code = catch_unwind(AssertUnwindSafe(main)).map_err(|payload| {
            warn!("entry point faulted");
            FatalError::Fault {
                detail: panic_detail(payload),
            }
        })?;
        info!("entry point returned {}", code);
        self.detach()?;
        Ok(code)
    }

    /// Write a fatal diagnostic to the sink and produce the exit status that goes with it.
    pub fn report_fatal(&self, err: &FatalError) -> i32 {
        self.sink.emit(&format_bail(&err.to_string(), err.code()));
        err.exit_status()
    }

    /// Run `main` through [CrtRuntime::enter], reporting any fatal condition. Returns the status
    /// the process should exit with.
    pub fn run(self: &Arc<Self>, main: impl FnOnce() -> i32) -> i32 {
        match self.enter(main) {
            Ok(code) => code,
            Err(err) => self.report_fatal(&err),
        }
    }

    /// The process's single top-level wrapper: run `main` and end the process with its status.
    pub fn start(self: &Arc<Self>, main: impl FnOnce() -> i32) -> ! {
        let status = self.run(main);
        self.sink.terminate(status);
        std::process::exit(status)
    }

    /// Deliver an asynchronous interrupt. Without an installed response the default policy
    /// reports the interrupt and terminates the process. Teardown runs first only if no other
    /// transition holds the lifecycle lock; the interrupt never waits for one.
    pub fn deliver_interrupt(&self) {
        match self.router.dispatch() {
            Dispatch::Responded | Dispatch::NotInstalled => {}
            Dispatch::DefaultPolicy => {
                let status = self.report_fatal(&FatalError::Interrupted);
                match self.boot.try_lock() {
                    Some(mut record) => {
                        if let Err(e) = self.teardown(&mut record) {
                            warn!("teardown after interrupt failed: {}", e);
                        }
                    }
                    None => debug!("lifecycle transition in progress, terminating without teardown"),
                }
                self.sink.terminate(status);
            }
        }
    }
}
