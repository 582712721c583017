//! Routing of the asynchronous "please stop" interrupt.
//!
//! The OS delivers the interrupt on a thread of its own choosing. It is forwarded to whichever
//! runtime most recently installed its router; that router either runs the response the
//! application installed, or reports that the default policy applies.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Once, Weak,
};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use super::CrtRuntime;
use crate::{
    preinit::{format_bail, DiagnosticSink, STDERR_SINK},
    FatalError,
};

type Response = Arc<dyn Fn() + Send + Sync>;

/// What happened to a delivered interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The installed response ran.
    Responded,
    /// No response is installed; the default policy applies.
    DefaultPolicy,
    /// The router is not installed, so the interrupt was dropped.
    NotInstalled,
}

#[derive(Default)]
pub struct InterruptRouter {
    installed: AtomicBool,
    response: RwLock<Option<Response>>,
}

impl core::fmt::Debug for InterruptRouter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InterruptRouter")
            .field("installed", &self.is_installed())
            .field("has_response", &self.has_response())
            .finish()
    }
}

impl InterruptRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self) {
        self.installed.store(true, Ordering::SeqCst);
    }

    pub fn uninstall(&self) {
        self.installed.store(false, Ordering::SeqCst);
    }

    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::SeqCst)
    }

    /// Install the application's response, replacing any previous one.
    pub fn set_response(&self, response: impl Fn() + Send + Sync + 'static) {
        *self.response.write() = Some(Arc::new(response));
    }

    /// Remove the application's response. Later interrupts fall back to the default policy.
    pub fn clear_response(&self) {
        *self.response.write() = None;
    }

    pub fn has_response(&self) -> bool {
        self.response.read().is_some()
    }

    /// Deliver one interrupt. The response runs without the router's lock held, so it may replace
    /// or clear itself.
    pub fn dispatch(&self) -> Dispatch {
        if !self.is_installed() {
            trace!("interrupt arrived with no router installed");
            return Dispatch::NotInstalled;
        }
        let response = self.response.read().clone();
        match response {
            Some(response) => {
                response();
                Dispatch::Responded
            }
            None => Dispatch::DefaultPolicy,
        }
    }
}

static OS_HOOK: Once = Once::new();
static OS_TARGET: Mutex<Option<Weak<CrtRuntime>>> = Mutex::new(None);

/// Route OS interrupts to `rt`. The OS handler itself is registered at most once per process.
pub(crate) fn hook_os_interrupts(rt: &Arc<CrtRuntime>) {
    *OS_TARGET.lock() = Some(Arc::downgrade(rt));
    OS_HOOK.call_once(|| {
        if let Err(e) = ctrlc::set_handler(|| forward_os_interrupt(&STDERR_SINK)) {
            warn!("failed to hook OS interrupt: {}", e);
        } else {
            debug!("hooked OS interrupt");
        }
    });
}

/// Stop routing OS interrupts to `rt`, if it is the current target.
pub(crate) fn unhook_os_interrupts(rt: &CrtRuntime) {
    let mut target = OS_TARGET.lock();
    if target
        .as_ref()
        .is_some_and(|weak| core::ptr::eq(weak.as_ptr(), rt))
    {
        *target = None;
    }
}

/// The OS handler cannot be removed once set, so an interrupt that no installed router can take
/// gets the process's default behavior: a diagnostic, then termination.
fn forward_os_interrupt(sink: &dyn DiagnosticSink) {
    let target = OS_TARGET.lock().as_ref().and_then(Weak::upgrade);
    match target {
        Some(rt) if rt.router().is_installed() => rt.deliver_interrupt(),
        _ => {
            trace!("OS interrupt with no runtime to route to");
            let err = FatalError::Interrupted;
            sink.emit(&format_bail(&err.to_string(), err.code()));
            sink.terminate(err.exit_status());
        }
    }
}
