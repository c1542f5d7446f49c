//! Single-owner handle over the interpreter state and its value stack.

use std::fmt;

use mlua::{
    Error as LuaError, Lua, LuaOptions, MultiValue, RegistryKey, Result as LuaResult, Value,
};

use crate::error::InitError;
use crate::options::BridgeOptions;
use crate::value::{Decode, Encode};

/// Interpreter context owned by exactly one bridge.
///
/// Values parked on the stack are held through registry keys so the
/// collector keeps them alive until they are popped or cleared.
pub struct ScriptContext {
    stack: Vec<RegistryKey>,
    lua: Lua,
}

impl ScriptContext {
    pub fn new(options: &BridgeOptions) -> Result<Self, InitError> {
        let lua = Lua::new_with(options.libraries.std_lib(), LuaOptions::default())?;
        if let Some(limit) = options.memory_limit {
            lua.set_memory_limit(limit)
                .map_err(|source| InitError::MemoryLimit { limit, source })?;
        }
        Ok(ScriptContext {
            stack: Vec::new(),
            lua,
        })
    }

    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn push<T: Encode>(&mut self, value: T) -> LuaResult<()> {
        let encoded = value.encode(&self.lua)?;
        let key = self.lua.create_registry_value(encoded)?;
        self.stack.push(key);
        Ok(())
    }

    /// Looks up global `name` and parks it on the stack when it is a
    /// function. Anything else leaves the stack untouched and yields `false`.
    pub fn push_callable(&mut self, name: &str) -> LuaResult<bool> {
        let value = self.lua.globals().get::<_, Value>(name)?;
        if !matches!(value, Value::Function(_)) {
            return Ok(false);
        }
        let key = self.lua.create_registry_value(value)?;
        self.stack.push(key);
        Ok(true)
    }

    /// Pops the top value into global `name`.
    pub fn put_global(&mut self, name: &str) -> LuaResult<()> {
        let key = self.stack.pop().ok_or_else(stack_underflow)?;
        let value = take_value(&self.lua, key)?;
        self.lua.globals().set(name, value)
    }

    /// Protected call of the function sitting below the top `argc` values.
    /// Function and arguments are consumed; the first result (or `nil`)
    /// replaces them.
    pub fn call(&mut self, argc: usize) -> LuaResult<()> {
        let base = self
            .stack
            .len()
            .checked_sub(argc + 1)
            .ok_or_else(stack_underflow)?;
        let keys = self.stack.split_off(base);
        let mut values = keys
            .into_iter()
            .map(|key| take_value(&self.lua, key))
            .collect::<LuaResult<Vec<_>>>()?;
        let function = match values.remove(0) {
            Value::Function(function) => function,
            other => {
                return Err(LuaError::RuntimeError(format!(
                    "attempt to call a {} value",
                    other.type_name()
                )))
            }
        };
        let results = function.call::<_, MultiValue>(MultiValue::from_vec(values))?;
        let first = results.into_iter().next().unwrap_or(Value::Nil);
        let key = self.lua.create_registry_value(first)?;
        self.stack.push(key);
        Ok(())
    }

    /// Protected evaluation of `source`. The first result (or `nil`) is left
    /// on the stack.
    pub fn eval(&mut self, source: &str, chunk_name: &str) -> LuaResult<()> {
        let results = self
            .lua
            .load(source)
            .set_name(chunk_name)
            .eval::<MultiValue>()?;
        let first = results.into_iter().next().unwrap_or(Value::Nil);
        let key = self.lua.create_registry_value(first)?;
        self.stack.push(key);
        Ok(())
    }

    /// Decodes the top value without removing it. `Ok(None)` means the stack
    /// is empty or the value has a different type.
    pub fn peek<T: Decode>(&self) -> LuaResult<Option<T>> {
        let Some(key) = self.stack.last() else {
            return Ok(None);
        };
        let value = self.lua.registry_value::<Value>(key)?;
        Ok(T::decode(value))
    }

    pub fn drop_top(&mut self) -> LuaResult<()> {
        let key = self.stack.pop().ok_or_else(stack_underflow)?;
        self.lua.remove_registry_value(key)
    }

    /// Discards every parked value.
    pub fn clear(&mut self) {
        self.stack.clear();
        self.lua.expire_registry_values();
    }
}

impl fmt::Debug for ScriptContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptContext")
            .field("depth", &self.stack.len())
            .field("used_memory", &self.lua.used_memory())
            .finish()
    }
}

fn take_value(lua: &Lua, key: RegistryKey) -> LuaResult<Value<'_>> {
    let value = lua.registry_value::<Value>(&key)?;
    lua.remove_registry_value(key)?;
    Ok(value)
}

fn stack_underflow() -> LuaError {
    LuaError::RuntimeError("value stack underflow".to_string())
}
