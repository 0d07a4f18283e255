//! The VM instance context.
//!
//! All process-wide state - the name table, the lock system, the boot
//! class loader, primitive types and the compiler hook - hangs off one
//! [`Vm`] value passed by reference, never off ambient globals.

use crate::loader::ClassLoader;
use crate::object::{JavaValue, ObjRef, Object};
use crate::ty::Primitive;
use crate::Class;
use crate::Method;
use crate::VmOptions;
use core_types::{EntryPoint, Name, Names, PrimitiveKind, VmError, VmResult};
use locking::LockSystem;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tracing::debug;

/// Produces raw class bytes for a binary name; the engine's view of
/// the file/archive world.
pub trait ClassBytesSource: Send + Sync {
    /// Returns the class bytes, or `None` if the source has no entry.
    fn lookup(&self, name: &Name) -> Option<Vec<u8>>;
}

/// The lazy-binding resolver's compilation service, installed by the
/// linker at bootstrap. Kept opaque here so the type system never
/// depends on the translator.
pub trait MethodCompiler: Send + Sync {
    /// Translates and compiles `method` if needed, returning its entry.
    fn ensure_compiled(&self, vm: &Arc<Vm>, method: &Arc<Method>) -> VmResult<EntryPoint>;

    /// Calls a compiled entry with the given arguments.
    fn invoke(&self, vm: &Arc<Vm>, entry: EntryPoint, args: &[JavaValue]) -> VmResult<JavaValue>;
}

/// One virtual machine instance.
pub struct Vm {
    self_ref: Weak<Vm>,
    names: Names,
    options: VmOptions,
    locks: LockSystem,
    next_vt_id: AtomicU32,
    boot_loader: OnceLock<Arc<ClassLoader>>,
    primitives: OnceLock<Vec<Arc<Primitive>>>,
    object_class: OnceLock<Arc<Class>>,
    array_interfaces: OnceLock<Vec<Arc<Class>>>,
    compiler: OnceLock<Arc<dyn MethodCompiler>>,
    strings: Mutex<HashMap<Name, ObjRef>>,
}

impl Vm {
    /// Creates a VM with the given options. [`Vm::bootstrap`] must run
    /// before any class can be loaded.
    pub fn new(options: VmOptions) -> Arc<Vm> {
        Arc::new_cyclic(|self_ref| Vm {
            self_ref: self_ref.clone(),
            names: Names::new(),
            options,
            locks: LockSystem::new(),
            next_vt_id: AtomicU32::new(1),
            boot_loader: OnceLock::new(),
            primitives: OnceLock::new(),
            object_class: OnceLock::new(),
            array_interfaces: OnceLock::new(),
            compiler: OnceLock::new(),
            strings: Mutex::new(HashMap::new()),
        })
    }

    fn arc(&self) -> Arc<Vm> {
        self.self_ref.upgrade().expect("VM dropped while in use")
    }

    /// Creates the boot class loader over `source`, builds the
    /// primitive types and loads the root class.
    pub fn bootstrap(&self, source: Arc<dyn ClassBytesSource>) -> VmResult<Arc<ClassLoader>> {
        let this = self.arc();
        let loader = ClassLoader::new(&this, source);
        self.boot_loader
            .set(loader.clone())
            .map_err(|_| VmError::internal("VM bootstrapped twice"))?;

        let primitives = [
            PrimitiveKind::Boolean,
            PrimitiveKind::Byte,
            PrimitiveKind::Char,
            PrimitiveKind::Short,
            PrimitiveKind::Int,
            PrimitiveKind::Long,
            PrimitiveKind::Float,
            PrimitiveKind::Double,
            PrimitiveKind::Void,
        ]
        .iter()
        .map(|&kind| Primitive::new(&this, &loader, kind))
        .collect();
        self.primitives
            .set(primitives)
            .map_err(|_| VmError::internal("primitive set built twice"))?;

        let object_name = self.names.get(&self.options.object_class_name);
        let object_class = loader.load_class(&object_name)?;
        self.object_class
            .set(object_class)
            .map_err(|_| VmError::internal("root class set twice"))?;

        debug!(root = %object_name, "VM bootstrapped");
        Ok(loader)
    }

    /// The name intern table.
    pub fn names(&self) -> &Names {
        &self.names
    }

    /// The construction options.
    pub fn options(&self) -> &VmOptions {
        &self.options
    }

    /// The object lock system.
    pub fn locks(&self) -> &LockSystem {
        &self.locks
    }

    /// The boot class loader.
    pub fn boot_loader(&self) -> VmResult<Arc<ClassLoader>> {
        self.boot_loader
            .get()
            .cloned()
            .ok_or_else(|| VmError::internal("VM not bootstrapped"))
    }

    /// The primitive type of `kind`.
    pub fn primitive(&self, kind: PrimitiveKind) -> VmResult<Arc<Primitive>> {
        let primitives = self
            .primitives
            .get()
            .ok_or_else(|| VmError::internal("VM not bootstrapped"))?;
        primitives
            .iter()
            .find(|p| p.kind() == kind)
            .cloned()
            .ok_or_else(|| VmError::internal("unknown primitive"))
    }

    /// The root class.
    pub fn object_class(&self) -> VmResult<Arc<Class>> {
        self.object_class
            .get()
            .cloned()
            .ok_or_else(|| VmError::internal("VM not bootstrapped"))
    }

    /// The interfaces every array implements. Loaded on first use;
    /// names the byte source cannot produce are skipped.
    pub fn array_interfaces(&self) -> VmResult<&[Arc<Class>]> {
        if let Some(loaded) = self.array_interfaces.get() {
            return Ok(loaded);
        }
        let loader = self.boot_loader()?;
        let mut loaded = Vec::new();
        for name in &self.options.array_interfaces {
            let name = self.names.get(name);
            match loader.load_class(&name) {
                Ok(class) => loaded.push(class),
                Err(VmError::ClassNotFound(_)) => {
                    debug!(interface = %name, "array interface unavailable, skipped");
                }
                Err(other) => return Err(other),
            }
        }
        let _ = self.array_interfaces.set(loaded);
        Ok(self.array_interfaces.get().expect("just set"))
    }

    /// Installs the compilation service. Called once by the linker.
    pub fn set_compiler(&self, compiler: Arc<dyn MethodCompiler>) -> VmResult<()> {
        self.compiler
            .set(compiler)
            .map_err(|_| VmError::internal("compiler installed twice"))
    }

    /// The compilation service.
    pub fn compiler(&self) -> VmResult<Arc<dyn MethodCompiler>> {
        self.compiler
            .get()
            .cloned()
            .ok_or_else(|| VmError::internal("no compiler installed"))
    }

    /// Interned string literal object for `text`.
    pub fn string_literal(&self, text: &Name) -> VmResult<ObjRef> {
        if let Some(existing) = self.strings.lock().get(text) {
            return Ok(existing.clone());
        }
        let loader = self.boot_loader()?;
        let string_name = self.names.get(&self.options.string_class_name);
        let string_class = loader
            .load_class(&string_name)
            .map_err(|_| VmError::NoClassDef(self.options.string_class_name.clone()))?;
        let object = Object::new_instance(&self.arc(), &string_class)?;
        let mut strings = self.strings.lock();
        Ok(strings.entry(text.clone()).or_insert(object).clone())
    }

    /// Allocates a process-unique virtual-table id.
    pub(crate) fn next_vt_id(&self) -> u32 {
        self.next_vt_id.fetch_add(1, Ordering::Relaxed)
    }
}
