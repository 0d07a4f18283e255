//! The type model: classes, array classes and primitives.
//!
//! Every type moves monotonically through `LOADED -> RESOLVED ->
//! INITED`, guarded by its own re-entrant lifecycle lock. Readers that
//! observe `RESOLVED` without the lock rely on the status being stored
//! with release ordering after the resolved data is published.

use crate::loader::ClassLoader;
use crate::vm::Vm;
use crate::vtable::VirtualTable;
use crate::Class;
use core_types::{Name, PrimitiveKind, VmError, VmResult};
use parking_lot::{Mutex, ReentrantMutex};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// Lifecycle stage of a type. Never decreases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResolutionStatus {
    /// Bytes are in hand; nothing is parsed.
    Loaded = 0,
    /// Layout and dispatch tables exist and are immutable.
    Resolved = 1,
    /// Static state exists and `<clinit>` has run.
    Inited = 2,
}

impl ResolutionStatus {
    fn from_u8(raw: u8) -> ResolutionStatus {
        match raw {
            0 => ResolutionStatus::Loaded,
            1 => ResolutionStatus::Resolved,
            _ => ResolutionStatus::Inited,
        }
    }
}

/// State shared by every type variant.
pub(crate) struct TypeCore {
    name: Name,
    loader: Weak<ClassLoader>,
    status: AtomicU8,
    lock: ReentrantMutex<()>,
    resolving: AtomicBool,
    vt: OnceLock<Arc<VirtualTable>>,
    array: Mutex<Option<Arc<ArrayClass>>>,
}

impl TypeCore {
    pub(crate) fn new(name: Name, loader: &Arc<ClassLoader>) -> TypeCore {
        TypeCore {
            name,
            loader: Arc::downgrade(loader),
            status: AtomicU8::new(ResolutionStatus::Loaded as u8),
            lock: ReentrantMutex::new(()),
            resolving: AtomicBool::new(false),
            vt: OnceLock::new(),
            array: Mutex::new(None),
        }
    }

    pub(crate) fn name(&self) -> &Name {
        &self.name
    }

    pub(crate) fn loader(&self) -> VmResult<Arc<ClassLoader>> {
        self.loader
            .upgrade()
            .ok_or_else(|| VmError::internal("class loader dropped"))
    }

    pub(crate) fn status(&self) -> ResolutionStatus {
        ResolutionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Publishes a new lifecycle stage; release-ordered after the data
    /// the stage promises.
    pub(crate) fn set_status(&self, status: ResolutionStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub(crate) fn lifecycle_lock(&self) -> parking_lot::ReentrantMutexGuard<'_, ()> {
        self.lock.lock()
    }

    /// Marks the core as mid-resolution; a second same-thread entry
    /// means the hierarchy is circular.
    pub(crate) fn begin_resolving(&self) -> VmResult<()> {
        if self.resolving.swap(true, Ordering::Relaxed) {
            return Err(VmError::format(
                self.name.as_str(),
                "circular class hierarchy",
            ));
        }
        Ok(())
    }

    pub(crate) fn end_resolving(&self) {
        self.resolving.store(false, Ordering::Relaxed);
    }

    pub(crate) fn publish_vt(&self, vt: Arc<VirtualTable>) -> VmResult<()> {
        self.vt
            .set(vt)
            .map_err(|_| VmError::internal("virtual table built twice"))
    }

    pub(crate) fn vt(&self) -> VmResult<Arc<VirtualTable>> {
        self.vt
            .get()
            .cloned()
            .ok_or_else(|| VmError::internal("type not resolved"))
    }

    pub(crate) fn cached_array(&self) -> &Mutex<Option<Arc<ArrayClass>>> {
        &self.array
    }
}

/// A primitive type. Resolved at construction; its trivial virtual
/// table exists only to join the subtype-check machinery.
pub struct Primitive {
    pub(crate) core: TypeCore,
    kind: PrimitiveKind,
}

impl Primitive {
    pub(crate) fn new(
        vm: &Arc<Vm>,
        loader: &Arc<ClassLoader>,
        kind: PrimitiveKind,
    ) -> Arc<Primitive> {
        let name = vm.names().get(&kind.id().to_string());
        let prim = Arc::new(Primitive {
            core: TypeCore::new(name, loader),
            kind,
        });
        let vt = VirtualTable::create_for_leaf(vm, Type::Primitive(prim.clone()));
        prim.core
            .publish_vt(vt)
            .expect("fresh primitive has no table");
        prim.core.set_status(ResolutionStatus::Inited);
        prim
    }

    /// Which primitive this is.
    pub fn kind(&self) -> PrimitiveKind {
        self.kind
    }

    /// The single-character name.
    pub fn name(&self) -> &Name {
        self.core.name()
    }
}

/// An array type, derived structurally from its component.
pub struct ArrayClass {
    pub(crate) core: TypeCore,
    self_ref: Weak<ArrayClass>,
    component: Type,
}

impl std::fmt::Debug for ArrayClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ArrayClass({})", self.name())
    }
}

impl ArrayClass {
    pub(crate) fn new(loader: &Arc<ClassLoader>, component: Type) -> VmResult<Arc<ArrayClass>> {
        let vm = loader.vm()?;
        let name = vm
            .names()
            .get(&format!("[{}", component.descriptor_fragment()));
        Ok(Arc::new_cyclic(|self_ref| ArrayClass {
            core: TypeCore::new(name, loader),
            self_ref: self_ref.clone(),
            component,
        }))
    }

    fn arc(&self) -> Arc<ArrayClass> {
        self.self_ref
            .upgrade()
            .expect("array class dropped while in use")
    }

    /// The array's binary name (`[I`, `[Ljava/lang/Object;`, ...).
    pub fn name(&self) -> &Name {
        self.core.name()
    }

    /// The component type.
    pub fn component(&self) -> &Type {
        &self.component
    }

    /// Element storage size, log2 bytes.
    pub fn element_log_size(&self) -> u32 {
        match &self.component {
            Type::Primitive(p) => p.kind().log_size(),
            _ => 3,
        }
    }

    fn do_resolve(&self) -> VmResult<()> {
        let _guard = self.core.lifecycle_lock();
        if self.core.status() >= ResolutionStatus::Resolved {
            return Ok(());
        }
        self.core.begin_resolving()?;
        let result = (|| {
            let loader = self.core.loader()?;
            let vm = loader.vm()?;
            let vt = VirtualTable::create_for_array(&vm, &self.arc())?;
            self.core.publish_vt(vt)?;
            self.core.set_status(ResolutionStatus::Resolved);
            Ok(())
        })();
        self.core.end_resolving();
        result
    }

    fn do_initialise(&self) -> VmResult<()> {
        self.do_resolve()?;
        self.core.set_status(ResolutionStatus::Inited);
        Ok(())
    }
}

/// Any engine type: class, array or primitive.
///
/// Cloning is cheap; all variants are shared behind `Arc`.
#[derive(Clone)]
pub enum Type {
    /// A loaded class or interface.
    Class(Arc<Class>),
    /// An array type.
    Array(Arc<ArrayClass>),
    /// A primitive type.
    Primitive(Arc<Primitive>),
}

impl Type {
    pub(crate) fn core(&self) -> &TypeCore {
        match self {
            Type::Class(c) => &c.core,
            Type::Array(a) => &a.core,
            Type::Primitive(p) => &p.core,
        }
    }

    /// The type's binary name.
    pub fn name(&self) -> &Name {
        self.core().name()
    }

    /// The owning class loader.
    pub fn loader(&self) -> VmResult<Arc<ClassLoader>> {
        self.core().loader()
    }

    /// The owning VM.
    pub fn vm(&self) -> VmResult<Arc<Vm>> {
        self.loader()?.vm()
    }

    /// Current lifecycle stage.
    pub fn status(&self) -> ResolutionStatus {
        self.core().status()
    }

    /// Whether layout and dispatch tables are readable.
    pub fn is_resolved(&self) -> bool {
        self.status() >= ResolutionStatus::Resolved
    }

    /// Whether static state is readable.
    pub fn is_initialised(&self) -> bool {
        self.status() >= ResolutionStatus::Inited
    }

    /// Drives the type to `RESOLVED`. Idempotent.
    pub fn resolve(&self) -> VmResult<()> {
        if self.is_resolved() {
            return Ok(());
        }
        match self {
            Type::Class(c) => c.resolve(),
            Type::Array(a) => a.do_resolve(),
            Type::Primitive(_) => Ok(()),
        }
    }

    /// Drives the type to `INITED`. Idempotent; superclass and
    /// interfaces first.
    pub fn initialise(&self) -> VmResult<()> {
        if self.is_initialised() {
            return Ok(());
        }
        match self {
            Type::Class(c) => c.initialise(),
            Type::Array(a) => a.do_initialise(),
            Type::Primitive(_) => Ok(()),
        }
    }

    /// The type's virtual table, resolving first if needed.
    pub fn vt(&self) -> VmResult<Arc<VirtualTable>> {
        self.resolve()?;
        self.core().vt()
    }

    /// Subtype check; forces resolution of both sides.
    pub fn is_assignable_to(&self, parent: &Type) -> VmResult<bool> {
        let own = self.vt()?;
        let target = parent.vt()?;
        Ok(own.is_assignable_to(&target))
    }

    /// The array type over this component, created once per component.
    pub fn array_class(&self) -> VmResult<Arc<ArrayClass>> {
        if let Some(existing) = self.core().cached_array().lock().as_ref() {
            return Ok(existing.clone());
        }
        let loader = self.loader()?;
        let fresh = ArrayClass::new(&loader, self.clone())?;
        let mut cached = self.core().cached_array().lock();
        if cached.is_none() {
            *cached = Some(fresh);
        }
        Ok(cached.as_ref().expect("just set").clone())
    }

    /// The `dims`-dimensional array type over this component;
    /// `dims == 0` is the type itself.
    pub fn array_type(&self, dims: usize) -> VmResult<Type> {
        let mut ty = self.clone();
        for _ in 0..dims {
            ty = Type::Array(ty.array_class()?);
        }
        Ok(ty)
    }

    /// The descriptor spelling of this type (`I`, `Lpkg/C;`, `[I`).
    pub fn descriptor_fragment(&self) -> String {
        match self {
            Type::Primitive(p) => p.kind().id().to_string(),
            Type::Class(c) => format!("L{};", c.name()),
            Type::Array(a) => a.name().as_str().to_string(),
        }
    }

    /// Downcast to a class, or an internal fault.
    pub fn as_class(&self) -> VmResult<Arc<Class>> {
        match self {
            Type::Class(c) => Ok(c.clone()),
            _ => Err(VmError::internal(format!(
                "{} is not a class",
                self.name()
            ))),
        }
    }

    /// Downcast to an array class, or an internal fault.
    pub fn as_array(&self) -> VmResult<Arc<ArrayClass>> {
        match self {
            Type::Array(a) => Ok(a.clone()),
            _ => Err(VmError::internal(format!(
                "{} is not an array class",
                self.name()
            ))),
        }
    }

    /// Whether two handles denote the same type.
    pub fn same_as(&self, other: &Type) -> bool {
        match (self, other) {
            (Type::Class(a), Type::Class(b)) => Arc::ptr_eq(a, b),
            (Type::Array(a), Type::Array(b)) => Arc::ptr_eq(a, b),
            (Type::Primitive(a), Type::Primitive(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl std::fmt::Debug for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Type({})", self.name())
    }
}
