use thiserror::Error;

/// Sticky error kinds held by the bridge's error register.
///
/// Once a kind is recorded, every start/push/pop short-circuits and reports
/// the same kind until [`Bridge::clear_error`](crate::Bridge::clear_error)
/// runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ScriptError {
    #[error("interpreter reported a fatal failure")]
    Fatal,
    #[error("value on top of the stack does not have the requested type")]
    PopTypeMismatch,
    #[error("script function call failed")]
    CallFailed,
    #[error("script evaluation failed")]
    EvalFailed,
    #[error("no operation is pending")]
    NothingPending,
    #[error("another operation is already pending")]
    Busy,
    #[error("global is not callable")]
    NotCallable,
    #[error("value pushed outside of a call or set operation")]
    InvalidPush,
    #[error("more than one value pushed while setting a global")]
    SetTooManyValues,
}

/// Failure while creating the interpreter context.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("failed to create Lua state: {0}")]
    Runtime(#[from] mlua::Error),
    #[error("memory limit of {limit} bytes could not be applied: {source}")]
    MemoryLimit {
        limit: usize,
        #[source]
        source: mlua::Error,
    },
}

/// Failure text returned by a host callback. Scripts observe it as a Lua
/// error raised from the callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HostError(pub String);

impl HostError {
    pub fn new(message: impl Into<String>) -> Self {
        HostError(message.into())
    }
}

impl From<&str> for HostError {
    fn from(message: &str) -> Self {
        HostError(message.to_string())
    }
}

impl From<String> for HostError {
    fn from(message: String) -> Self {
        HostError(message)
    }
}
