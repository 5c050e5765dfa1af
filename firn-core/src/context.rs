//! Per-thread evaluation contexts.

use thiserror::Error;

/// State threaded through every evaluation on one runtime thread.
///
/// The lazy core consults only the yield flag; the effect subsystem
/// sets it when an evaluator invokes an operation that wants to
/// suspend the current computation.
pub struct Context
{
    yielding: bool,
}

impl Context
{
    /// Create a context with no pending yield.
    pub fn new() -> Self
    {
        Self{yielding: false}
    }

    /// Whether the most recent callee requested to suspend.
    pub fn is_yielding(&self) -> bool
    {
        self.yielding
    }

    /// Mark the context as suspending.
    ///
    /// Called by the effect subsystem when an operation yields.
    pub fn request_yield(&mut self)
    {
        self.yielding = true;
    }

    /// Report an unrecoverable runtime error and terminate evaluation.
    ///
    /// No cleanup is attempted. This panics with the error message;
    /// runtime builds compiled with `panic = "abort"` terminate the
    /// process, which is the intended behavior for embedders.
    pub fn fatal(&self, error: FatalError) -> !
    {
        log::error!("fatal runtime error: {error}");
        panic!("fatal runtime error: {error}");
    }
}

/// Machine-readable classification of a fatal runtime error.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FatalCode
{
    /// The operation is not supported by this build of the runtime.
    NotSupported,
}

/// Unrecoverable runtime error reported through [`Context::fatal`].
#[derive(Clone, Copy, Debug, Error)]
#[error("{code:?}: {message}")]
pub struct FatalError
{
    /// What went wrong, coarsely.
    pub code: FatalCode,

    /// Human-readable detail.
    pub message: &'static str,
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn yield_flag_starts_clear_and_latches()
    {
        let mut context = Context::new();
        assert!(!context.is_yielding());
        context.request_yield();
        assert!(context.is_yielding());
    }

    #[test]
    #[should_panic(expected = "NotSupported: no such luck")]
    fn fatal_panics_with_the_error()
    {
        let context = Context::new();
        context.fatal(FatalError{
            code: FatalCode::NotSupported,
            message: "no such luck",
        });
    }
}
