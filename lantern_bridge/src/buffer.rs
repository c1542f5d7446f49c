//! Typed buffer views that let scripts read and write host memory in place.
//!
//! Lua has no typed arrays, so a view is a userdata with `__index`,
//! `__newindex`, `__len` and `__tostring` metamethods. Indices are 1-based
//! like every other Lua sequence; `view.length` is accepted as an alias for
//! `#view`.

use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::ptr::NonNull;
use std::rc::Rc;

use mlua::{Error as LuaError, MetaMethod, Result as LuaResult, UserData, UserDataMethods, Value};

mod sealed {
    pub trait Sealed {}
    impl Sealed for i32 {}
    impl Sealed for u32 {}
}

/// Element layout of a buffer view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    Int32,
    Uint32,
}

impl BufferKind {
    pub fn type_name(self) -> &'static str {
        match self {
            BufferKind::Int32 => "Int32Array",
            BufferKind::Uint32 => "Uint32Array",
        }
    }
}

/// Element types a buffer view can expose.
pub trait BufferElement: Copy + Default + fmt::Debug + sealed::Sealed + 'static {
    const KIND: BufferKind;

    fn to_lua_integer(self) -> i64;

    /// Converts a Lua number into the element type, wrapping modulo 2^32.
    fn from_lua_number(value: f64) -> Self;
}

impl BufferElement for i32 {
    const KIND: BufferKind = BufferKind::Int32;

    fn to_lua_integer(self) -> i64 {
        i64::from(self)
    }

    fn from_lua_number(value: f64) -> Self {
        wrap_to_u32(value) as i32
    }
}

impl BufferElement for u32 {
    const KIND: BufferKind = BufferKind::Uint32;

    fn to_lua_integer(self) -> i64 {
        i64::from(self)
    }

    fn from_lua_number(value: f64) -> Self {
        wrap_to_u32(value)
    }
}

/// ToUint32: truncate toward zero, then reduce modulo 2^32. NaN and the
/// infinities map to 0.
fn wrap_to_u32(value: f64) -> u32 {
    if !value.is_finite() {
        return 0;
    }
    value.trunc().rem_euclid(4_294_967_296.0) as u32
}

/// Host memory shared with scripts by reference count.
///
/// Cloning shares the same storage. Script views hold a clone, so the
/// region outlives every script reference without copying.
#[derive(Debug, Default)]
pub struct SharedBuffer<T> {
    data: Rc<RefCell<Vec<T>>>,
}

impl<T> Clone for SharedBuffer<T> {
    fn clone(&self) -> Self {
        SharedBuffer {
            data: Rc::clone(&self.data),
        }
    }
}

impl<T: BufferElement> SharedBuffer<T> {
    pub fn new(data: Vec<T>) -> Self {
        SharedBuffer {
            data: Rc::new(RefCell::new(data)),
        }
    }

    pub fn zeroed(len: usize) -> Self {
        Self::new(vec![T::default(); len])
    }

    pub fn len(&self) -> usize {
        self.data.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrows the contents. Scripts touching the buffer while this guard is
    /// alive get a Lua error instead of a panic.
    pub fn borrow(&self) -> Ref<'_, [T]> {
        Ref::map(self.data.borrow(), |data| data.as_slice())
    }

    pub fn borrow_mut(&self) -> RefMut<'_, [T]> {
        RefMut::map(self.data.borrow_mut(), |data| data.as_mut_slice())
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.data.borrow().clone()
    }

    pub fn ptr_eq(&self, other: &SharedBuffer<T>) -> bool {
        Rc::ptr_eq(&self.data, &other.data)
    }
}

impl<T: BufferElement> From<Vec<T>> for SharedBuffer<T> {
    fn from(data: Vec<T>) -> Self {
        SharedBuffer::new(data)
    }
}

/// Caller-owned memory aliased into the interpreter without any lifetime
/// tracking.
#[derive(Debug)]
pub struct ExternalBuffer<T> {
    ptr: NonNull<T>,
    len: usize,
}

impl<T: BufferElement> ExternalBuffer<T> {
    /// # Safety
    ///
    /// The interpreter may keep the resulting view alive after the current
    /// operation returns. The caller must keep `region` allocated, un-moved
    /// and free of other live references for as long as any script value
    /// refers to the view (in practice: until the owning bridge is dropped,
    /// unless the scripts are known to discard it earlier).
    pub unsafe fn new(region: &mut [T]) -> Self {
        ExternalBuffer {
            len: region.len(),
            ptr: NonNull::from(region).cast(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

enum Backing<T> {
    Shared(SharedBuffer<T>),
    External(ExternalBuffer<T>),
}

/// Script-side handle to a typed buffer.
pub struct BufferView<T> {
    backing: Backing<T>,
}

impl<T: BufferElement> BufferView<T> {
    pub(crate) fn shared(buffer: SharedBuffer<T>) -> Self {
        BufferView {
            backing: Backing::Shared(buffer),
        }
    }

    pub(crate) fn external(buffer: ExternalBuffer<T>) -> Self {
        BufferView {
            backing: Backing::External(buffer),
        }
    }

    fn len(&self) -> LuaResult<usize> {
        match &self.backing {
            Backing::Shared(buffer) => buffer
                .data
                .try_borrow()
                .map(|data| data.len())
                .map_err(|_| host_borrowed()),
            Backing::External(buffer) => Ok(buffer.len),
        }
    }

    fn get(&self, index: usize) -> LuaResult<Option<T>> {
        match &self.backing {
            Backing::Shared(buffer) => {
                let data = buffer.data.try_borrow().map_err(|_| host_borrowed())?;
                Ok(data.get(index).copied())
            }
            Backing::External(buffer) => {
                if index >= buffer.len {
                    return Ok(None);
                }
                // SAFETY: bounds checked above; liveness is the contract of
                // `ExternalBuffer::new`.
                Ok(Some(unsafe { buffer.ptr.as_ptr().add(index).read() }))
            }
        }
    }

    fn set(&self, index: usize, value: T) -> LuaResult<()> {
        match &self.backing {
            Backing::Shared(buffer) => {
                let mut data = buffer.data.try_borrow_mut().map_err(|_| host_borrowed())?;
                let len = data.len();
                let slot = data
                    .get_mut(index)
                    .ok_or_else(|| out_of_range(T::KIND, index, len))?;
                *slot = value;
                Ok(())
            }
            Backing::External(buffer) => {
                if index >= buffer.len {
                    return Err(out_of_range(T::KIND, index, buffer.len));
                }
                // SAFETY: bounds checked above; liveness is the contract of
                // `ExternalBuffer::new`.
                unsafe { buffer.ptr.as_ptr().add(index).write(value) };
                Ok(())
            }
        }
    }
}

fn host_borrowed() -> LuaError {
    LuaError::RuntimeError("buffer is currently borrowed by the host".to_string())
}

fn out_of_range(kind: BufferKind, index: usize, len: usize) -> LuaError {
    LuaError::RuntimeError(format!(
        "{} index {} out of range (length {len})",
        kind.type_name(),
        index + 1
    ))
}

/// Maps a 1-based Lua key to a 0-based slot. Non-integral keys yield `None`.
fn slot_index(key: &Value) -> Option<usize> {
    let index = match key {
        Value::Integer(i) => *i as i64,
        Value::Number(n) if n.fract() == 0.0 => *n as i64,
        _ => return None,
    };
    usize::try_from(index).ok()?.checked_sub(1)
}

fn lua_number(value: &Value) -> Option<f64> {
    match value {
        Value::Integer(i) => Some(*i as f64),
        Value::Number(n) => Some(*n),
        _ => None,
    }
}

impl<T: BufferElement> UserData for BufferView<T> {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Index, |_, this, key: Value| {
            if let Value::String(name) = &key {
                if name.to_str()? == "length" {
                    return Ok(Some(this.len()? as i64));
                }
                return Ok(None);
            }
            match slot_index(&key) {
                Some(index) => Ok(this.get(index)?.map(BufferElement::to_lua_integer)),
                None => Ok(None),
            }
        });

        methods.add_meta_method(
            MetaMethod::NewIndex,
            |_, this, (key, value): (Value, Value)| {
                let index = slot_index(&key).ok_or_else(|| {
                    LuaError::RuntimeError(format!(
                        "{} keys must be positive integers",
                        T::KIND.type_name()
                    ))
                })?;
                let number = lua_number(&value).ok_or_else(|| {
                    LuaError::RuntimeError(format!(
                        "{} elements must be numbers, got {}",
                        T::KIND.type_name(),
                        value.type_name()
                    ))
                })?;
                this.set(index, T::from_lua_number(number))
            },
        );

        methods.add_meta_method(MetaMethod::Len, |_, this, ()| this.len());

        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(format!("{}({})", T::KIND.type_name(), this.len()?))
        });
    }
}
