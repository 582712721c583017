//! Utilities that enable formatted printing for early runtime init, and the diagnostic sink used
//! for fatal conditions. Nothing here may depend on a logging subscriber being installed.

use std::{
    fmt,
    io::{self, Write},
};

#[repr(C)]
struct PreinitLogger;

impl fmt::Write for PreinitLogger {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        // Errors are ignored: there is nowhere left to report them.
        let _ = io::stderr().lock().write_all(s.as_bytes());
        Ok(())
    }
}

#[doc(hidden)]
pub fn _print_normal(args: core::fmt::Arguments) {
    use fmt::Write;
    let _ = PreinitLogger.write_fmt(args);
}

#[macro_export]
macro_rules! preinit_print {
    ($($arg:tt)*) => {
        $crate::preinit::_print_normal(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! preinit_println {
    () => {
        $crate::preinit_print!("\n")
    };
    ($fmt:expr) => {
        $crate::preinit_print!(concat!($fmt, "\n"))
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::preinit_print!(concat!($fmt, "\n"), $($arg)*)
    };
}

/// Where fatal diagnostics go, and how the process is ended afterwards.
///
/// The runtime only ever calls [DiagnosticSink::terminate] once it has decided that no consistent
/// state remains. Implementations used outside of tests should not return from it.
pub trait DiagnosticSink: Send + Sync {
    /// Write a human-readable message to the process-error output.
    fn emit(&self, message: &str);

    /// End the process with the given exit status.
    fn terminate(&self, status: i32);
}

/// The default sink: standard error, followed by [std::process::exit].
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrSink;

impl DiagnosticSink for StderrSink {
    fn emit(&self, message: &str) {
        preinit_println!("{}", message);
    }

    fn terminate(&self, status: i32) {
        let _ = io::stderr().flush();
        std::process::exit(status)
    }
}

pub static STDERR_SINK: StderrSink = StderrSink;

/// Formats a fatal message the way the runtime reports it: the message, a blank line, then the
/// numeric error code.
pub fn format_bail(message: &str, code: u32) -> String {
    format!("{}\n\nerror code: {}", message, code)
}
