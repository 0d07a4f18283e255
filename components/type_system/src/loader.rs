//! Class loaders: the per-loader type registry.
//!
//! The registry maps are each guarded by a dedicated mutex, and the
//! lock order is always "registry mutex before individual type lock":
//! a map lock is never held across a resolve.

use crate::method::Method;
use crate::ty::Type;
use crate::vm::{ClassBytesSource, Vm};
use crate::Class;
use core_types::{MethodDesc, Name, TypeDesc, VmError, VmResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::debug;

/// One class loader: owns every type it defines for the process
/// lifetime (types are never unloaded).
pub struct ClassLoader {
    vm: Weak<Vm>,
    self_ref: Weak<ClassLoader>,
    source: Arc<dyn ClassBytesSource>,
    classes: Mutex<HashMap<Name, Arc<Class>>>,
    method_refs: Mutex<HashMap<(Name, Name, Name), Arc<Method>>>,
    interface_slots: Mutex<HashMap<(Name, Name), u32>>,
}

impl ClassLoader {
    pub(crate) fn new(vm: &Arc<Vm>, source: Arc<dyn ClassBytesSource>) -> Arc<ClassLoader> {
        Arc::new_cyclic(|self_ref| ClassLoader {
            vm: Arc::downgrade(vm),
            self_ref: self_ref.clone(),
            source,
            classes: Mutex::new(HashMap::new()),
            method_refs: Mutex::new(HashMap::new()),
            interface_slots: Mutex::new(HashMap::new()),
        })
    }

    fn arc(&self) -> Arc<ClassLoader> {
        self.self_ref
            .upgrade()
            .expect("class loader dropped while in use")
    }

    /// The owning VM.
    pub fn vm(&self) -> VmResult<Arc<Vm>> {
        self.vm
            .upgrade()
            .ok_or_else(|| VmError::internal("VM dropped"))
    }

    /// A class already defined by this loader, if any.
    pub fn find_loaded(&self, name: &Name) -> Option<Arc<Class>> {
        self.classes.lock().get(name).cloned()
    }

    /// Loads a class by binary name: asks the byte source, then
    /// defines. Idempotent per name.
    pub fn load_class(&self, name: &Name) -> VmResult<Arc<Class>> {
        if let Some(loaded) = self.find_loaded(name) {
            return Ok(loaded);
        }
        let bytes = self
            .source
            .lookup(name)
            .ok_or_else(|| VmError::ClassNotFound(name.as_str().to_string()))?;
        self.define_class(name, bytes)
    }

    /// Defines a class from raw bytes; a racing define of the same
    /// name yields the first definition.
    pub fn define_class(&self, name: &Name, bytes: Vec<u8>) -> VmResult<Arc<Class>> {
        let mut classes = self.classes.lock();
        if let Some(existing) = classes.get(name) {
            return Ok(existing.clone());
        }
        let class = Class::new(&self.arc(), name.clone(), bytes);
        classes.insert(name.clone(), class.clone());
        debug!(class = %name, "defined");
        Ok(class)
    }

    /// Maps a parsed descriptor to a (loaded, not resolved) type.
    pub fn type_from_descriptor(&self, desc: &TypeDesc) -> VmResult<Type> {
        match desc {
            TypeDesc::Primitive(kind) => Ok(Type::Primitive(self.vm()?.primitive(*kind)?)),
            TypeDesc::Object(name) => Ok(Type::Class(self.load_class(name)?)),
            TypeDesc::Array(inner) => {
                let component = self.type_from_descriptor(inner)?;
                Ok(Type::Array(component.array_class()?))
            }
        }
    }

    /// Maps a constant-pool type name (binary class name, or an array
    /// descriptor) to a type.
    pub fn type_from_name(&self, name: &Name) -> VmResult<Type> {
        if name.as_str().starts_with('[') {
            let desc = TypeDesc::parse(self.vm()?.names(), name.as_str())?;
            self.type_from_descriptor(&desc)
        } else {
            Ok(Type::Class(self.load_class(name)?))
        }
    }

    /// The shared method record of a (class, name, descriptor) triple.
    /// Call sites and the declaration all receive the same record.
    pub fn method_handle(
        &self,
        class: &Arc<Class>,
        name: &Name,
        descriptor: &Name,
    ) -> VmResult<Arc<Method>> {
        let key = (class.name().clone(), name.clone(), descriptor.clone());
        if let Some(existing) = self.method_refs.lock().get(&key) {
            return Ok(existing.clone());
        }
        let desc = MethodDesc::parse(self.vm()?.names(), descriptor.as_str())?;
        let mut refs = self.method_refs.lock();
        Ok(refs
            .entry(key)
            .or_insert_with(|| Method::new(class, name.clone(), descriptor.clone(), desc))
            .clone())
    }

    /// The interface-table slot index of a (name, descriptor) method
    /// identity. Identical spellings share an index across interfaces,
    /// which is what makes unrelated declarations of the same method
    /// land in the same bucket.
    pub fn interface_slot_index(&self, name: &Name, descriptor: &Name) -> u32 {
        let mut slots = self.interface_slots.lock();
        let next = slots.len() as u32;
        *slots
            .entry((name.clone(), descriptor.clone()))
            .or_insert(next)
    }
}

impl std::fmt::Debug for ClassLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ClassLoader(classes={})", self.classes.lock().len())
    }
}
