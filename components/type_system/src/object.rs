//! Objects, references and raw field storage.

use crate::ty::{ArrayClass, Type};
use crate::vm::Vm;
use crate::vtable::VirtualTable;
use crate::Class;
use core_types::{ValueKind, VmError, VmResult};
use locking::LockSystem;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

/// A runtime value passed into or out of compiled code.
#[derive(Debug, Clone)]
pub enum JavaValue {
    /// 32-bit integer (and all sub-int types).
    Int(i32),
    /// 64-bit integer.
    Long(i64),
    /// 32-bit float.
    Float(f32),
    /// 64-bit float.
    Double(f64),
    /// Object reference; `None` is Java's `null`.
    Reference(Option<ObjRef>),
}

impl JavaValue {
    /// The storage kind of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            JavaValue::Int(_) => ValueKind::Int,
            JavaValue::Long(_) => ValueKind::Long,
            JavaValue::Float(_) => ValueKind::Float,
            JavaValue::Double(_) => ValueKind::Double,
            JavaValue::Reference(_) => ValueKind::Reference,
        }
    }

    /// The zero value of a kind.
    pub fn default_of(kind: ValueKind) -> JavaValue {
        match kind {
            ValueKind::Int => JavaValue::Int(0),
            ValueKind::Long => JavaValue::Long(0),
            ValueKind::Float => JavaValue::Float(0.0),
            ValueKind::Double => JavaValue::Double(0.0),
            ValueKind::Reference => JavaValue::Reference(None),
        }
    }

    /// Integer payload, or an engine fault.
    pub fn as_int(&self) -> VmResult<i32> {
        match self {
            JavaValue::Int(v) => Ok(*v),
            other => Err(VmError::internal(format!("expected int, got {:?}", other))),
        }
    }

    /// Long payload, or an engine fault.
    pub fn as_long(&self) -> VmResult<i64> {
        match self {
            JavaValue::Long(v) => Ok(*v),
            other => Err(VmError::internal(format!("expected long, got {:?}", other))),
        }
    }

    /// Reference payload, or an engine fault.
    pub fn as_reference(&self) -> VmResult<Option<ObjRef>> {
        match self {
            JavaValue::Reference(r) => Ok(r.clone()),
            other => Err(VmError::internal(format!(
                "expected reference, got {:?}",
                other
            ))),
        }
    }
}

/// Raw storage for one object's fields or one class's statics.
///
/// Primitive fields live in a byte block addressed by the layout's
/// offsets; references live beside it, keyed by the same offsets, so
/// the block itself stays scannable without a type map.
pub struct Storage {
    bytes: RwLock<Vec<u8>>,
    refs: Mutex<HashMap<usize, ObjRef>>,
}

impl Storage {
    /// Zero-filled storage of `size` bytes.
    pub fn new(size: usize) -> Storage {
        Storage {
            bytes: RwLock::new(vec![0; size]),
            refs: Mutex::new(HashMap::new()),
        }
    }

    /// Size of the primitive block in bytes.
    pub fn size(&self) -> usize {
        self.bytes.read().len()
    }

    fn read_slice<const N: usize>(&self, offset: usize) -> [u8; N] {
        let bytes = self.bytes.read();
        let mut out = [0u8; N];
        out.copy_from_slice(&bytes[offset..offset + N]);
        out
    }

    fn write_slice(&self, offset: usize, data: &[u8]) {
        let mut bytes = self.bytes.write();
        bytes[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Reads a 8-bit integer field.
    pub fn get_i8(&self, offset: usize) -> i8 {
        i8::from_le_bytes(self.read_slice::<1>(offset))
    }

    /// Writes a 8-bit integer field.
    pub fn set_i8(&self, offset: usize, value: i8) {
        self.write_slice(offset, &value.to_le_bytes());
    }

    /// Reads a 16-bit integer field.
    pub fn get_i16(&self, offset: usize) -> i16 {
        i16::from_le_bytes(self.read_slice::<2>(offset))
    }

    /// Writes a 16-bit integer field.
    pub fn set_i16(&self, offset: usize, value: i16) {
        self.write_slice(offset, &value.to_le_bytes());
    }

    /// Reads a 32-bit integer field.
    pub fn get_i32(&self, offset: usize) -> i32 {
        i32::from_le_bytes(self.read_slice::<4>(offset))
    }

    /// Writes a 32-bit integer field.
    pub fn set_i32(&self, offset: usize, value: i32) {
        self.write_slice(offset, &value.to_le_bytes());
    }

    /// Reads a 64-bit integer field.
    pub fn get_i64(&self, offset: usize) -> i64 {
        i64::from_le_bytes(self.read_slice::<8>(offset))
    }

    /// Writes a 64-bit integer field.
    pub fn set_i64(&self, offset: usize, value: i64) {
        self.write_slice(offset, &value.to_le_bytes());
    }

    /// Reads a float field.
    pub fn get_f32(&self, offset: usize) -> f32 {
        f32::from_le_bytes(self.read_slice::<4>(offset))
    }

    /// Writes a float field.
    pub fn set_f32(&self, offset: usize, value: f32) {
        self.write_slice(offset, &value.to_le_bytes());
    }

    /// Reads a double field.
    pub fn get_f64(&self, offset: usize) -> f64 {
        f64::from_le_bytes(self.read_slice::<8>(offset))
    }

    /// Writes a double field.
    pub fn set_f64(&self, offset: usize, value: f64) {
        self.write_slice(offset, &value.to_le_bytes());
    }

    /// Reads a reference field.
    pub fn get_ref(&self, offset: usize) -> Option<ObjRef> {
        self.refs.lock().get(&offset).cloned()
    }

    /// Writes a reference field.
    pub fn set_ref(&self, offset: usize, value: Option<ObjRef>) {
        let mut refs = self.refs.lock();
        match value {
            Some(r) => {
                refs.insert(offset, r);
            }
            None => {
                refs.remove(&offset);
            }
        }
    }

    /// Reads a value of the given kind.
    pub fn load(&self, kind: ValueKind, offset: usize) -> JavaValue {
        match kind {
            ValueKind::Int => JavaValue::Int(self.get_i32(offset)),
            ValueKind::Long => JavaValue::Long(self.get_i64(offset)),
            ValueKind::Float => JavaValue::Float(self.get_f32(offset)),
            ValueKind::Double => JavaValue::Double(self.get_f64(offset)),
            ValueKind::Reference => JavaValue::Reference(self.get_ref(offset)),
        }
    }

    /// Writes a value; the kind must match the slot's layout.
    pub fn store(&self, offset: usize, value: JavaValue) {
        match value {
            JavaValue::Int(v) => self.set_i32(offset, v),
            JavaValue::Long(v) => self.set_i64(offset, v),
            JavaValue::Float(v) => self.set_f32(offset, v),
            JavaValue::Double(v) => self.set_f64(offset, v),
            JavaValue::Reference(r) => self.set_ref(offset, r),
        }
    }
}

/// A heap object: virtual table, lock-word header and field storage.
pub struct Object {
    vt: Arc<VirtualTable>,
    header: AtomicU64,
    data: Storage,
    array_length: Option<u32>,
}

impl Object {
    /// Allocates an instance of `class`, running initialisation first.
    pub fn new_instance(vm: &Arc<Vm>, class: &Arc<Class>) -> VmResult<ObjRef> {
        class.initialise()?;
        Self::new_instance_uninit(vm, class)
    }

    /// Allocates an instance without forcing class initialisation
    /// (used by allocation paths that already initialised).
    pub fn new_instance_uninit(_vm: &Arc<Vm>, class: &Arc<Class>) -> VmResult<ObjRef> {
        class.resolve()?;
        Ok(ObjRef(Arc::new(Object {
            vt: class.vt()?,
            header: AtomicU64::new(0),
            data: Storage::new(class.struct_size()?),
            array_length: None,
        })))
    }

    /// Allocates an array of `length` elements.
    pub fn new_array(_vm: &Arc<Vm>, class: &Arc<ArrayClass>, length: u32) -> VmResult<ObjRef> {
        let ty = Type::Array(class.clone());
        ty.resolve()?;
        let elem = 1usize << class.element_log_size();
        Ok(ObjRef(Arc::new(Object {
            vt: ty.vt()?,
            header: AtomicU64::new(0),
            data: Storage::new(elem * length as usize),
            array_length: Some(length),
        })))
    }
}

/// A shared reference to a heap object. Identity is pointer identity.
#[derive(Clone)]
pub struct ObjRef(Arc<Object>);

impl ObjRef {
    /// Whether two references denote the same object.
    pub fn same_as(&self, other: &ObjRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// The object's virtual table.
    pub fn vt(&self) -> &Arc<VirtualTable> {
        &self.0.vt
    }

    /// The object's dynamic type.
    pub fn class_type(&self) -> Type {
        self.0.vt.ty().clone()
    }

    /// The object's field storage.
    pub fn data(&self) -> &Storage {
        &self.0.data
    }

    /// Array length; an engine fault on a non-array object.
    pub fn array_length(&self) -> VmResult<u32> {
        self.0
            .array_length
            .ok_or_else(|| VmError::internal("array length of a non-array object"))
    }

    /// The header word cell driven by the lock system.
    pub fn header(&self) -> &AtomicU64 {
        &self.0.header
    }

    /// Acquires the object's lock.
    pub fn lock(&self, locks: &LockSystem) {
        locks.lock(&self.0.header);
    }

    /// Releases the object's lock.
    pub fn unlock(&self, locks: &LockSystem) -> VmResult<()> {
        locks.unlock(&self.0.header)
    }

    /// Parks on the object's wait set.
    pub fn wait(&self, locks: &LockSystem, timeout: Option<Duration>) -> VmResult<()> {
        locks.wait(&self.0.header, timeout)
    }

    /// Wakes one waiter.
    pub fn notify(&self, locks: &LockSystem) -> VmResult<()> {
        locks.notify(&self.0.header)
    }

    /// Wakes all waiters.
    pub fn notify_all(&self, locks: &LockSystem) -> VmResult<()> {
        locks.notify_all(&self.0.header)
    }

    /// The identity hash, assigned lazily.
    pub fn hash_code(&self, locks: &LockSystem) -> u32 {
        locks.hash_code(&self.0.header)
    }
}

impl std::fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjRef({})", self.0.vt.ty().name())
    }
}
