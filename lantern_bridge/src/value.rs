//! Values the host and the interpreter can exchange.
//!
//! [`Encode`] and [`Decode`] are the two halves of the marshaling contract:
//! every push goes through `Encode`, every typed pop through `Decode`. A
//! decode that returns `None` is a type mismatch and leaves the value where
//! it was.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::BuildHasher;
use std::rc::Rc;

use mlua::{Error as LuaError, Lua, MultiValue, Result as LuaResult, Table, Value};
use serde::Serialize;

use crate::buffer::{BufferElement, BufferView, ExternalBuffer, SharedBuffer};
use crate::error::HostError;

/// Converts a host value into an interpreter value.
pub trait Encode {
    fn encode<'lua>(self, lua: &'lua Lua) -> LuaResult<Value<'lua>>;
}

/// Converts an interpreter value into a host value, or `None` when the value
/// has the wrong type.
pub trait Decode: Sized {
    fn decode(value: Value<'_>) -> Option<Self>;
}

/// Owned snapshot of a script value.
///
/// Tables are flattened to their string-keyed, string-valued entries;
/// functions, userdata and threads are only described by their type name.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ScriptValue {
    Nil,
    Boolean(bool),
    Number(f64),
    String(String),
    Table(BTreeMap<String, String>),
    Opaque(&'static str),
}

impl ScriptValue {
    pub fn from_value(value: Value<'_>) -> Self {
        match value {
            Value::Nil => ScriptValue::Nil,
            Value::Boolean(flag) => ScriptValue::Boolean(flag),
            Value::Integer(i) => ScriptValue::Number(i as f64),
            Value::Number(n) => ScriptValue::Number(n),
            Value::String(text) => ScriptValue::String(text.to_string_lossy().into_owned()),
            Value::Table(table) => ScriptValue::Table(string_entries(table).collect()),
            other => ScriptValue::Opaque(other.type_name()),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ScriptValue::Nil => "nil",
            ScriptValue::Boolean(_) => "boolean",
            ScriptValue::Number(_) => "number",
            ScriptValue::String(_) => "string",
            ScriptValue::Table(_) => "table",
            ScriptValue::Opaque(kind) => kind,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            ScriptValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScriptValue::String(text) => Some(text.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptValue::Nil => write!(f, "nil"),
            ScriptValue::Boolean(flag) => write!(f, "{flag}"),
            ScriptValue::Number(n) => write!(f, "{n}"),
            ScriptValue::String(text) => write!(f, "{text}"),
            ScriptValue::Table(entries) => {
                write!(f, "{{")?;
                for (index, (key, value)) in entries.iter().enumerate() {
                    if index > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{key} = {value:?}")?;
                }
                write!(f, "}}")
            }
            ScriptValue::Opaque(kind) => write!(f, "<{kind}>"),
        }
    }
}

impl From<f64> for ScriptValue {
    fn from(value: f64) -> Self {
        ScriptValue::Number(value)
    }
}

impl From<&str> for ScriptValue {
    fn from(value: &str) -> Self {
        ScriptValue::String(value.to_string())
    }
}

impl From<String> for ScriptValue {
    fn from(value: String) -> Self {
        ScriptValue::String(value)
    }
}

impl From<bool> for ScriptValue {
    fn from(value: bool) -> Self {
        ScriptValue::Boolean(value)
    }
}

/// Raw traversal of a table's own string-keyed, string-valued entries.
/// Bytes that are not UTF-8 are replaced, as in [`ScriptValue::from_value`].
fn string_entries(table: Table<'_>) -> impl Iterator<Item = (String, String)> + '_ {
    table
        .pairs::<Value, Value>()
        .filter_map(Result::ok)
        .filter_map(|(key, value)| match (key, value) {
            (Value::String(key), Value::String(value)) => Some((
                key.to_string_lossy().into_owned(),
                value.to_string_lossy().into_owned(),
            )),
            _ => None,
        })
}

fn encode_table<'lua, K, V>(
    lua: &'lua Lua,
    entries: impl IntoIterator<Item = (K, V)>,
) -> LuaResult<Value<'lua>>
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let table = lua.create_table()?;
    for (key, value) in entries {
        table.raw_set(key.as_ref(), value.as_ref())?;
    }
    Ok(Value::Table(table))
}

impl Encode for f64 {
    fn encode<'lua>(self, _lua: &'lua Lua) -> LuaResult<Value<'lua>> {
        Ok(Value::Number(self))
    }
}

impl Encode for &str {
    fn encode<'lua>(self, lua: &'lua Lua) -> LuaResult<Value<'lua>> {
        lua.create_string(self).map(Value::String)
    }
}

impl Encode for String {
    fn encode<'lua>(self, lua: &'lua Lua) -> LuaResult<Value<'lua>> {
        self.as_str().encode(lua)
    }
}

impl<K, V> Encode for &BTreeMap<K, V>
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    fn encode<'lua>(self, lua: &'lua Lua) -> LuaResult<Value<'lua>> {
        encode_table(lua, self.iter())
    }
}

impl<K, V, S> Encode for &HashMap<K, V, S>
where
    K: AsRef<str>,
    V: AsRef<str>,
    S: BuildHasher,
{
    fn encode<'lua>(self, lua: &'lua Lua) -> LuaResult<Value<'lua>> {
        encode_table(lua, self.iter())
    }
}

impl<T: BufferElement> Encode for SharedBuffer<T> {
    fn encode<'lua>(self, lua: &'lua Lua) -> LuaResult<Value<'lua>> {
        lua.create_userdata(BufferView::shared(self))
            .map(Value::UserData)
    }
}

impl<T: BufferElement> Encode for ExternalBuffer<T> {
    fn encode<'lua>(self, lua: &'lua Lua) -> LuaResult<Value<'lua>> {
        lua.create_userdata(BufferView::external(self))
            .map(Value::UserData)
    }
}

impl Encode for ScriptValue {
    fn encode<'lua>(self, lua: &'lua Lua) -> LuaResult<Value<'lua>> {
        match self {
            ScriptValue::Nil => Ok(Value::Nil),
            ScriptValue::Boolean(flag) => Ok(Value::Boolean(flag)),
            ScriptValue::Number(n) => Ok(Value::Number(n)),
            ScriptValue::String(text) => text.encode(lua),
            ScriptValue::Table(entries) => encode_table(lua, entries),
            ScriptValue::Opaque(kind) => Err(LuaError::ToLuaConversionError {
                from: kind,
                to: "value",
                message: Some("opaque script values cannot be pushed back".to_string()),
            }),
        }
    }
}

impl Decode for f64 {
    fn decode(value: Value<'_>) -> Option<Self> {
        match value {
            Value::Number(n) => Some(n),
            Value::Integer(i) => Some(i as f64),
            _ => None,
        }
    }
}

impl Decode for String {
    fn decode(value: Value<'_>) -> Option<Self> {
        match value {
            Value::String(text) => Some(text.to_string_lossy().into_owned()),
            _ => None,
        }
    }
}

impl Decode for BTreeMap<String, String> {
    fn decode(value: Value<'_>) -> Option<Self> {
        match value {
            Value::Table(table) => Some(string_entries(table).collect()),
            _ => None,
        }
    }
}

impl Decode for HashMap<String, String> {
    fn decode(value: Value<'_>) -> Option<Self> {
        match value {
            Value::Table(table) => Some(string_entries(table).collect()),
            _ => None,
        }
    }
}

impl Decode for ScriptValue {
    fn decode(value: Value<'_>) -> Option<Self> {
        Some(ScriptValue::from_value(value))
    }
}

/// Native-call arity declared for a host callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    /// The callback always sees exactly this many arguments: missing ones
    /// are `nil`, extra ones are dropped.
    Fixed(usize),
    /// The callback sees every argument the script passed.
    Variadic,
}

type HostCallback = dyn Fn(&[ScriptValue]) -> Result<ScriptValue, HostError>;

/// Host callback exposed to scripts as an ordinary Lua function.
#[derive(Clone)]
pub struct HostFunction {
    arity: Arity,
    callback: Rc<HostCallback>,
}

impl HostFunction {
    pub fn new<F>(arity: Arity, callback: F) -> Self
    where
        F: Fn(&[ScriptValue]) -> Result<ScriptValue, HostError> + 'static,
    {
        HostFunction {
            arity,
            callback: Rc::new(callback),
        }
    }

    pub fn arity(&self) -> Arity {
        self.arity
    }

    fn invoke(&self, args: MultiValue<'_>) -> Result<ScriptValue, HostError> {
        let mut values: Vec<ScriptValue> = args.into_iter().map(ScriptValue::from_value).collect();
        if let Arity::Fixed(count) = self.arity {
            values.resize(count, ScriptValue::Nil);
        }
        (self.callback)(&values)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction")
            .field("arity", &self.arity)
            .finish_non_exhaustive()
    }
}

impl Encode for HostFunction {
    fn encode<'lua>(self, lua: &'lua Lua) -> LuaResult<Value<'lua>> {
        let function = lua.create_function(move |lua_ctx, args: MultiValue| {
            let result = self.invoke(args).map_err(LuaError::external)?;
            result.encode(lua_ctx)
        })?;
        Ok(Value::Function(function))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_decode_accepts_integers_and_floats() -> LuaResult<()> {
        let lua = Lua::new();
        let int: Value = lua.load("return 7").eval()?;
        let float: Value = lua.load("return 2.5").eval()?;
        assert_eq!(f64::decode(int), Some(7.0));
        assert_eq!(f64::decode(float), Some(2.5));
        assert_eq!(f64::decode(Value::Boolean(true)), None);
        Ok(())
    }

    #[test]
    fn string_decode_rejects_numbers() -> LuaResult<()> {
        let lua = Lua::new();
        let text: Value = lua.load("return 'door'").eval()?;
        let number: Value = lua.load("return 12").eval()?;
        assert_eq!(String::decode(text).as_deref(), Some("door"));
        assert_eq!(String::decode(number), None);
        Ok(())
    }

    #[test]
    fn table_decode_keeps_string_entries_only() -> LuaResult<()> {
        let lua = Lua::new();
        let value: Value = lua
            .load(r#"return { toMap = "crypt", toX = "40", [1] = "skip", hp = 10 }"#)
            .eval()?;
        let decoded = BTreeMap::<String, String>::decode(value).expect("table");
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded["toMap"], "crypt");
        assert_eq!(decoded["toX"], "40");
        Ok(())
    }

    #[test]
    fn non_utf8_strings_decode_lossily() -> LuaResult<()> {
        let lua = Lua::new();
        let text: Value = lua.load(r#"return "\255\254""#).eval()?;
        assert_eq!(String::decode(text).as_deref(), Some("\u{FFFD}\u{FFFD}"));

        let table: Value = lua.load(r#"return { k = "\255", ok = "x" }"#).eval()?;
        let entries = HashMap::<String, String>::decode(table).expect("table");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries["k"], "\u{FFFD}");
        assert_eq!(entries["ok"], "x");
        Ok(())
    }

    #[test]
    fn script_value_accessors() {
        assert_eq!(ScriptValue::from(2.5).as_number(), Some(2.5));
        assert_eq!(ScriptValue::from("lamp").as_number(), None);
        assert_eq!(ScriptValue::from("lamp").as_str(), Some("lamp"));
        assert_eq!(ScriptValue::from(true).type_name(), "boolean");
    }

    #[test]
    fn encoded_table_is_visible_to_scripts() -> LuaResult<()> {
        let lua = Lua::new();
        let mut params = HashMap::new();
        params.insert("id", "stairs_2");
        let value = (&params).encode(&lua)?;
        lua.globals().set("params", value)?;
        let id: String = lua.load("return params.id").eval()?;
        assert_eq!(id, "stairs_2");
        Ok(())
    }

    #[test]
    fn opaque_values_refuse_to_encode() {
        let lua = Lua::new();
        assert!(ScriptValue::Opaque("function").encode(&lua).is_err());
    }

    #[test]
    fn host_function_pads_to_declared_arity() -> LuaResult<()> {
        let lua = Lua::new();
        let function = HostFunction::new(Arity::Fixed(2), |args| {
            Ok(ScriptValue::Number(args.len() as f64))
        });
        assert_eq!(function.arity(), Arity::Fixed(2));
        lua.globals().set("count", function.encode(&lua)?)?;
        let padded: f64 = lua.load("return count(1)").eval()?;
        let truncated: f64 = lua.load("return count(1, 2, 3)").eval()?;
        assert_eq!(padded, 2.0);
        assert_eq!(truncated, 2.0);
        Ok(())
    }

    #[test]
    fn host_function_errors_reach_the_script() -> LuaResult<()> {
        let lua = Lua::new();
        let function = HostFunction::new(Arity::Variadic, |_| Err(HostError::new("locked")));
        lua.globals().set("open", function.encode(&lua)?)?;
        let caught: String = lua
            .load("local ok, err = pcall(open) return tostring(err)")
            .eval()?;
        assert!(caught.contains("locked"), "unexpected error text: {caught}");
        Ok(())
    }

    #[test]
    fn display_renders_tables_in_key_order() {
        let mut entries = BTreeMap::new();
        entries.insert("b".to_string(), "2".to_string());
        entries.insert("a".to_string(), "1".to_string());
        assert_eq!(ScriptValue::Table(entries).to_string(), r#"{a = "1", b = "2"}"#);
        assert_eq!(ScriptValue::Nil.to_string(), "nil");
    }
}
