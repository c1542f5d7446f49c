//! Structured descriptions of script failures and the channels that carry
//! them back to the host.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use mlua::Error as LuaError;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{HostError, ScriptError};

static LOCATION_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^(?:\[string "(?P<chunk>[^"]*)"\]|(?P<file>[^:\s][^:]*)):(?P<line>\d+):\s?(?P<message>.*)$"#)
        .expect("location prefix regex should compile")
});

/// What went wrong inside the interpreter, broken into the fields the host
/// log wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptDiagnostic {
    pub file: String,
    pub line: Option<u32>,
    pub category: String,
    pub message: String,
}

impl ScriptDiagnostic {
    /// Builds a diagnostic from an interpreter error. `fallback_file` is used
    /// when the error text carries no `chunk:line:` prefix.
    pub fn from_lua_error(err: &LuaError, fallback_file: &str) -> Self {
        let root = root_cause(err);
        let text = match root {
            LuaError::RuntimeError(message) | LuaError::MemoryError(message) => message.clone(),
            LuaError::SyntaxError { message, .. } => message.clone(),
            LuaError::ExternalError(inner) => inner.to_string(),
            other => other.to_string(),
        };
        Self::from_message(error_category(root), &text, fallback_file)
    }

    /// Parses `chunk:line: message` text, keeping only its first line.
    pub fn from_message(category: &str, text: &str, fallback_file: &str) -> Self {
        let first_line = text.lines().next().unwrap_or_default().trim_end();
        match LOCATION_PREFIX.captures(first_line) {
            Some(caps) => {
                let file = caps
                    .name("chunk")
                    .or_else(|| caps.name("file"))
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_else(|| fallback_file.to_string());
                ScriptDiagnostic {
                    file,
                    line: caps.name("line").and_then(|m| m.as_str().parse().ok()),
                    category: category.to_string(),
                    message: caps
                        .name("message")
                        .map(|m| m.as_str().to_string())
                        .unwrap_or_default(),
                }
            }
            None => ScriptDiagnostic {
                file: fallback_file.to_string(),
                line: None,
                category: category.to_string(),
                message: first_line.to_string(),
            },
        }
    }
}

impl fmt::Display for ScriptDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<12}:{:<4}:   {}: {}",
            self.file,
            self.line.unwrap_or(0),
            self.category,
            self.message
        )
    }
}

fn root_cause(err: &LuaError) -> &LuaError {
    match err {
        LuaError::CallbackError { cause, .. } => root_cause(cause),
        other => other,
    }
}

/// Category label for an interpreter error, after unwrapping callback frames.
pub fn error_category(err: &LuaError) -> &'static str {
    match root_cause(err) {
        LuaError::RuntimeError(_) => "RuntimeError",
        LuaError::SyntaxError { .. } => "SyntaxError",
        LuaError::MemoryError(_) => "MemoryError",
        LuaError::ExternalError(inner) if inner.downcast_ref::<HostError>().is_some() => {
            "HostError"
        }
        _ => "Error",
    }
}

pub(crate) fn is_heap_failure(err: &LuaError) -> bool {
    matches!(root_cause(err), LuaError::MemoryError(_))
}

/// Receives call/eval diagnostics and fatal notices from the bridge.
pub trait ErrorReporter {
    fn report(&self, kind: ScriptError, diagnostic: &ScriptDiagnostic);
    fn fatal(&self, message: &str);
}

/// Default reporter: forwards everything to the `log` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, kind: ScriptError, diagnostic: &ScriptDiagnostic) {
        log::error!("[lantern_bridge] {kind}: {diagnostic}");
    }

    fn fatal(&self, message: &str) {
        log::error!("[lantern_bridge] fatal interpreter failure: {message}");
    }
}

/// Keeps every rendered diagnostic in memory; useful for tests and for
/// hosts that surface script errors in their own UI.
#[derive(Clone, Default)]
pub struct RecordingReporter {
    entries: Rc<RefCell<Vec<String>>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.borrow().clone()
    }
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, kind: ScriptError, diagnostic: &ScriptDiagnostic) {
        self.entries
            .borrow_mut()
            .push(format!("{kind:?} {diagnostic}"));
    }

    fn fatal(&self, message: &str) {
        self.entries.borrow_mut().push(format!("Fatal {message}"));
    }
}

/// One-shot notification for interpreter heap failures.
///
/// Kept apart from the sticky register so the owner can observe a fatal
/// condition no matter which operation (if any) tripped it. The first
/// message is retained until taken.
#[derive(Debug, Clone, Default)]
pub struct FatalSignal {
    message: Rc<RefCell<Option<String>>>,
}

impl FatalSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when an earlier, untaken message is already pending.
    pub fn raise(&self, message: impl Into<String>) -> bool {
        let mut slot = self.message.borrow_mut();
        if slot.is_some() {
            return false;
        }
        *slot = Some(message.into());
        true
    }

    pub fn is_raised(&self) -> bool {
        self.message.borrow().is_some()
    }

    pub fn take(&self) -> Option<String> {
        self.message.borrow_mut().take()
    }
}
