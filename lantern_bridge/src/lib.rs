//! Host-side bridge into an embedded Lua interpreter.
//!
//! The host assembles one operation at a time (evaluate source, call a
//! global function, or assign a global) through a fluent push/pop protocol
//! and reads typed results back. Failures are latched in a sticky error
//! register so a long chain can be checked once at the end.

pub mod bridge;
pub mod buffer;
pub mod context;
pub mod diagnostic;
pub mod error;
pub mod options;
pub mod value;

pub use bridge::{Bridge, Mode};
pub use buffer::{BufferElement, BufferKind, ExternalBuffer, SharedBuffer};
pub use context::ScriptContext;
pub use diagnostic::{ErrorReporter, FatalSignal, LogReporter, RecordingReporter, ScriptDiagnostic};
pub use error::{HostError, InitError, ScriptError};
pub use options::{BridgeOptions, LibraryProfile, DEFAULT_CHUNK_NAME};
pub use value::{Arity, Decode, Encode, HostFunction, ScriptValue};
