//! Diagnostic output hook for device reported failures

/// Sink for diagnostic messages, failures are ignored
pub trait DebugLog {
    fn debug_print(&mut self, msg: &str);
}

/// Discards all messages
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct NoLog;

impl DebugLog for NoLog {
    fn debug_print(&mut self, _msg: &str) {}
}

/// Forwards messages to the `log` facade
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct LogFacade;

impl DebugLog for LogFacade {
    fn debug_print(&mut self, msg: &str) {
        debug!("{}", msg);
    }
}

impl <F: FnMut(&str)> DebugLog for F {
    fn debug_print(&mut self, msg: &str) {
        (self)(msg)
    }
}
