use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use log::{debug, warn};
use mlua::Error as LuaError;

use crate::buffer::{BufferElement, ExternalBuffer, SharedBuffer};
use crate::context::ScriptContext;
use crate::diagnostic::{is_heap_failure, ErrorReporter, FatalSignal, LogReporter, ScriptDiagnostic};
use crate::error::{HostError, InitError, ScriptError};
use crate::options::BridgeOptions;
use crate::value::{Arity, Decode, Encode, HostFunction, ScriptValue};

/// The operation currently being assembled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Idle,
    Calling { name: String, arg_count: usize },
    Evaluating { source: String },
    Setting { name: String },
}

impl Mode {
    pub fn is_idle(&self) -> bool {
        matches!(self, Mode::Idle)
    }

    fn label(&self) -> &'static str {
        match self {
            Mode::Idle => "idle",
            Mode::Calling { .. } => "calling",
            Mode::Evaluating { .. } => "evaluating",
            Mode::Setting { .. } => "setting",
        }
    }
}

/// Chainable request surface over one embedded Lua interpreter.
///
/// An operation is started with [`eval`](Self::eval), [`call`](Self::call)
/// or [`set`](Self::set), fed zero or more `push_*` values, and finished by a
/// `pop_*`. Failures land in a sticky error register: once set, every
/// start/push/pop is a no-op reporting the same [`ScriptError`] until
/// [`clear_error`](Self::clear_error) runs.
///
/// ```
/// use lantern_bridge::{Bridge, BridgeOptions};
///
/// let mut bridge = Bridge::new(BridgeOptions::default()).unwrap();
/// bridge.eval("function add(a, b) return a + b end").pop().unwrap();
/// let sum = bridge.call("add").push_number(2.0).push_number(3.0).pop_number();
/// assert_eq!(sum, Ok(5.0));
/// ```
pub struct Bridge {
    context: ScriptContext,
    mode: Mode,
    error: Option<ScriptError>,
    /// Global assigned by the most recent set, until another operation
    /// starts. A push in that window is a second value for the same set.
    committed_set: Option<String>,
    chunk_name: String,
    reporter: Rc<dyn ErrorReporter>,
    fatal: FatalSignal,
    last_diagnostic: Option<ScriptDiagnostic>,
}

impl Bridge {
    pub fn new(options: BridgeOptions) -> Result<Self, InitError> {
        Self::with_reporter(options, Rc::new(LogReporter))
    }

    pub fn with_reporter(
        options: BridgeOptions,
        reporter: Rc<dyn ErrorReporter>,
    ) -> Result<Self, InitError> {
        let context = ScriptContext::new(&options)?;
        debug!(
            "[lantern_bridge] context ready (chunk {}, libraries {:?}, memory limit {:?})",
            options.chunk_name, options.libraries, options.memory_limit
        );
        Ok(Bridge {
            context,
            mode: Mode::Idle,
            error: None,
            committed_set: None,
            chunk_name: options.chunk_name,
            reporter,
            fatal: FatalSignal::new(),
            last_diagnostic: None,
        })
    }

    pub fn error(&self) -> Option<ScriptError> {
        self.error
    }

    pub fn mode(&self) -> &Mode {
        &self.mode
    }

    pub fn stack_depth(&self) -> usize {
        self.context.depth()
    }

    /// Diagnostic captured by the most recent call/eval failure.
    pub fn last_diagnostic(&self) -> Option<&ScriptDiagnostic> {
        self.last_diagnostic.as_ref()
    }

    /// Handle on the fatal channel; clones observe the same notification.
    pub fn fatal_signal(&self) -> FatalSignal {
        self.fatal.clone()
    }

    pub fn take_fatal(&self) -> Option<String> {
        self.fatal.take()
    }

    pub fn context(&self) -> &ScriptContext {
        &self.context
    }

    /// Discards the sticky error and every value on the stack. Any pending
    /// operation is abandoned, since its stack values are gone.
    pub fn clear_error(&mut self) {
        if let Some(kind) = self.error.take() {
            debug!("[lantern_bridge] clearing {kind:?} while {}", self.mode.label());
        }
        self.context.clear();
        self.mode = Mode::Idle;
        self.committed_set = None;
    }

    /// Starts a lazy evaluation of `source`; it runs when the result is popped.
    pub fn eval(&mut self, source: impl Into<String>) -> &mut Self {
        if self.admit_operation() {
            self.mode = Mode::Evaluating {
                source: source.into(),
            };
        }
        self
    }

    /// Starts a call to global function `name`. The global is resolved
    /// immediately; a non-function leaves the bridge idle with
    /// [`ScriptError::NotCallable`].
    pub fn call(&mut self, name: impl Into<String>) -> &mut Self {
        if !self.admit_operation() {
            return self;
        }
        let name = name.into();
        match self.context.push_callable(&name) {
            Ok(true) => {
                debug!("[lantern_bridge] calling {name}");
                self.mode = Mode::Calling { name, arg_count: 0 };
            }
            Ok(false) => {
                warn!("[lantern_bridge] global {name} is not callable");
                self.fail(ScriptError::NotCallable);
            }
            Err(err) => {
                self.runtime_fault(err);
            }
        }
        self
    }

    /// Starts an assignment to global `name`; the next push commits it.
    pub fn set(&mut self, name: impl Into<String>) -> &mut Self {
        if self.admit_operation() {
            self.mode = Mode::Setting { name: name.into() };
        }
        self
    }

    /// Pushes any encodable value as the next call argument or as the value
    /// of a pending set.
    pub fn push<T: Encode>(&mut self, value: T) -> &mut Self {
        if self.error.is_some() {
            return self;
        }
        let rejection = match self.mode {
            Mode::Calling { .. } | Mode::Setting { .. } => None,
            Mode::Idle if self.committed_set.is_some() => Some(ScriptError::SetTooManyValues),
            Mode::Idle | Mode::Evaluating { .. } => Some(ScriptError::InvalidPush),
        };
        if let Some(kind) = rejection {
            self.fail(kind);
            return self;
        }
        if let Err(err) = self.context.push(value) {
            self.encode_fault(err);
            return self;
        }
        let commit = match &mut self.mode {
            Mode::Calling { arg_count, .. } => {
                *arg_count += 1;
                false
            }
            Mode::Setting { .. } => true,
            Mode::Idle | Mode::Evaluating { .. } => false,
        };
        if commit {
            self.commit_set();
        }
        self
    }

    pub fn push_number(&mut self, value: f64) -> &mut Self {
        self.push(value)
    }

    pub fn push_string(&mut self, value: &str) -> &mut Self {
        self.push(value)
    }

    /// Pushes a string-keyed map as a table with one string field per entry.
    pub fn push_table<'m, K, V, I>(&mut self, entries: I) -> &mut Self
    where
        I: IntoIterator<Item = (&'m K, &'m V)>,
        K: AsRef<str> + ?Sized + 'm,
        V: AsRef<str> + ?Sized + 'm,
    {
        let table: BTreeMap<&str, &str> = entries
            .into_iter()
            .map(|(key, value)| (key.as_ref(), value.as_ref()))
            .collect();
        self.push(&table)
    }

    pub fn push_value(&mut self, value: ScriptValue) -> &mut Self {
        self.push(value)
    }

    /// Pushes a typed view over `buffer` without copying. The view keeps the
    /// shared storage alive for as long as scripts reference it.
    pub fn push_buffer<T: BufferElement>(&mut self, buffer: SharedBuffer<T>) -> &mut Self {
        self.push(buffer)
    }

    /// Pushes a typed view aliasing caller-owned memory.
    ///
    /// # Safety
    ///
    /// Same contract as [`ExternalBuffer::new`]: `region` must stay
    /// allocated, un-moved and otherwise unreferenced for as long as any
    /// script value refers to the view.
    pub unsafe fn push_external_buffer<T: BufferElement>(&mut self, region: &mut [T]) -> &mut Self {
        self.push(ExternalBuffer::new(region))
    }

    /// Registers `callback` as a script-callable function with the declared
    /// native-call arity.
    pub fn push_function<F>(&mut self, arity: Arity, callback: F) -> &mut Self
    where
        F: Fn(&[ScriptValue]) -> Result<ScriptValue, HostError> + 'static,
    {
        self.push(HostFunction::new(arity, callback))
    }

    pub fn pop_number(&mut self) -> Result<f64, ScriptError> {
        self.pop_as()
    }

    pub fn pop_string(&mut self) -> Result<String, ScriptError> {
        self.pop_as()
    }

    pub fn pop_table(&mut self) -> Result<BTreeMap<String, String>, ScriptError> {
        self.pop_as()
    }

    /// Like [`pop_table`](Self::pop_table) but merges into `target`,
    /// overwriting keys the script also provides.
    pub fn pop_table_into(
        &mut self,
        target: &mut BTreeMap<String, String>,
    ) -> Result<(), ScriptError> {
        let entries = self.pop_table()?;
        target.extend(entries);
        Ok(())
    }

    pub fn pop_value(&mut self) -> Result<ScriptValue, ScriptError> {
        self.pop_as()
    }

    /// Completes the pending operation and decodes its result as `T`. On a
    /// type mismatch the result stays on the stack and the mode is kept.
    pub fn pop_as<T: Decode>(&mut self) -> Result<T, ScriptError> {
        self.complete()?;
        match self.context.peek::<T>() {
            Ok(Some(value)) => {
                if let Err(err) = self.context.drop_top() {
                    return Err(self.runtime_fault(err));
                }
                self.finish();
                Ok(value)
            }
            Ok(None) => {
                warn!(
                    "[lantern_bridge] result of {} operation has an unexpected type",
                    self.mode.label()
                );
                Err(self.fail(ScriptError::PopTypeMismatch))
            }
            Err(err) => Err(self.runtime_fault(err)),
        }
    }

    /// Completes the pending operation and discards its result.
    pub fn pop(&mut self) -> Result<(), ScriptError> {
        self.complete()?;
        if let Err(err) = self.context.drop_top() {
            return Err(self.runtime_fault(err));
        }
        self.finish();
        Ok(())
    }

    fn admit_operation(&mut self) -> bool {
        if self.error.is_some() {
            return false;
        }
        if !self.mode.is_idle() {
            warn!(
                "[lantern_bridge] refusing new operation while {}",
                self.mode.label()
            );
            self.fail(ScriptError::Busy);
            return false;
        }
        self.committed_set = None;
        true
    }

    fn commit_set(&mut self) {
        let Mode::Setting { name } = &self.mode else {
            return;
        };
        let name = name.clone();
        if self.context.depth() != 1 {
            self.fail(ScriptError::SetTooManyValues);
            return;
        }
        match self.context.put_global(&name) {
            Ok(()) => {
                debug!("[lantern_bridge] set {name}");
                self.mode = Mode::Idle;
                self.committed_set = Some(name);
            }
            Err(err) => {
                self.runtime_fault(err);
            }
        }
    }

    /// Runs the pending call or evaluation, leaving its result on the stack.
    fn complete(&mut self) -> Result<(), ScriptError> {
        if let Some(kind) = self.error {
            return Err(kind);
        }
        if matches!(self.mode, Mode::Idle | Mode::Setting { .. }) {
            warn!(
                "[lantern_bridge] pop requested while {}",
                self.mode.label()
            );
            return Err(self.fail(ScriptError::NothingPending));
        }
        let outcome = match &self.mode {
            Mode::Calling { arg_count, .. } => self
                .context
                .call(*arg_count)
                .map_err(|err| (ScriptError::CallFailed, err)),
            Mode::Evaluating { source } => self
                .context
                .eval(source, &self.chunk_name)
                .map_err(|err| (ScriptError::EvalFailed, err)),
            Mode::Idle | Mode::Setting { .. } => Ok(()),
        };
        match outcome {
            Ok(()) => Ok(()),
            Err((_, err)) if is_heap_failure(&err) => Err(self.runtime_fault(err)),
            Err((kind, err)) => {
                let diagnostic = ScriptDiagnostic::from_lua_error(&err, &self.chunk_name);
                self.reporter.report(kind, &diagnostic);
                self.last_diagnostic = Some(diagnostic);
                Err(self.fail(kind))
            }
        }
    }

    fn finish(&mut self) {
        debug!("[lantern_bridge] {} operation complete", self.mode.label());
        self.mode = Mode::Idle;
    }

    /// Records `kind` unless an earlier error is already sticky; returns the
    /// error now held by the register.
    fn fail(&mut self, kind: ScriptError) -> ScriptError {
        *self.error.get_or_insert(kind)
    }

    fn runtime_fault(&mut self, err: LuaError) -> ScriptError {
        let message = err.to_string();
        if self.fatal.raise(message.clone()) {
            self.reporter.fatal(&message);
        }
        self.fail(ScriptError::Fatal)
    }

    fn encode_fault(&mut self, err: LuaError) {
        if is_heap_failure(&err) {
            self.runtime_fault(err);
        } else {
            warn!("[lantern_bridge] value could not be pushed: {err}");
            self.fail(ScriptError::InvalidPush);
        }
    }
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("mode", &self.mode)
            .field("error", &self.error)
            .field("context", &self.context)
            .field("chunk_name", &self.chunk_name)
            .finish_non_exhaustive()
    }
}
