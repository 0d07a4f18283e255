//! Classes: parsing-driven resolution, layouts and initialisation.

use crate::loader::ClassLoader;
use crate::method::{Field, Layout, Method};
use crate::object::Storage;
use crate::ty::{ResolutionStatus, Type, TypeCore};
use crate::vtable::VirtualTable;
use classfile::{AccessFlags, Attributes, Constant, ConstantPool, RawClassFile, RawMember};
use core_types::{EntryPoint, Name, TypeDesc, VmError, VmResult};
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock, Weak};
use tracing::debug;

/// A resolved reference to a field, with its declaring class.
#[derive(Clone)]
pub struct FieldRef {
    /// The class whose storage holds the field.
    pub declaring: Arc<Class>,
    /// The field itself.
    pub field: Arc<Field>,
    /// Whether the reference is to static storage.
    pub is_static: bool,
}

impl std::fmt::Debug for FieldRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FieldRef({:?}, static={})", self.field, self.is_static)
    }
}

enum CpEntry {
    Class(Type),
    Method(Arc<Method>),
    Field(FieldRef),
}

pub(crate) struct ResolvedClass {
    pub(crate) access: AccessFlags,
    pub(crate) super_class: Arc<Class>,
    pub(crate) interfaces: Vec<Arc<Class>>,
    pub(crate) pool: ConstantPool,
    cp_cache: Vec<OnceLock<CpEntry>>,
    pub(crate) layout: Layout,
    pub(crate) static_layout: Layout,
    #[allow(dead_code)]
    pub(crate) static_vt: Arc<VirtualTable>,
    pub(crate) attributes: Attributes,
}

/// A class or interface, owned by its loader for the process lifetime.
pub struct Class {
    pub(crate) core: TypeCore,
    self_ref: Weak<Class>,
    bytes: Mutex<Option<Vec<u8>>>,
    resolved: OnceLock<ResolvedClass>,
    statics: OnceLock<Storage>,
}

struct FieldSpec {
    access: AccessFlags,
    name: Name,
    desc: TypeDesc,
    ty: Type,
    attributes: Attributes,
}

fn align_word(size: usize) -> usize {
    (size + 7) & !7
}

impl Class {
    pub(crate) fn new(loader: &Arc<ClassLoader>, name: Name, bytes: Vec<u8>) -> Arc<Class> {
        Arc::new_cyclic(|self_ref| Class {
            core: TypeCore::new(name, loader),
            self_ref: self_ref.clone(),
            bytes: Mutex::new(Some(bytes)),
            resolved: OnceLock::new(),
            statics: OnceLock::new(),
        })
    }

    fn arc(&self) -> Arc<Class> {
        self.self_ref.upgrade().expect("class dropped while in use")
    }

    /// The class's binary name.
    pub fn name(&self) -> &Name {
        self.core.name()
    }

    /// The owning class loader.
    pub fn loader(&self) -> VmResult<Arc<ClassLoader>> {
        self.core.loader()
    }

    pub(crate) fn resolved(&self) -> VmResult<&ResolvedClass> {
        self.resolved
            .get()
            .ok_or_else(|| VmError::internal(format!("{} is not resolved", self.name())))
    }

    /// The class's virtual table; requires the class to be resolved.
    pub fn vt(&self) -> VmResult<Arc<VirtualTable>> {
        self.core.vt()
    }

    /// Declared access flags; requires the class to be resolved.
    pub fn access(&self) -> VmResult<AccessFlags> {
        Ok(self.resolved()?.access)
    }

    /// The superclass; the root class is its own superclass.
    pub fn super_class(&self) -> VmResult<Arc<Class>> {
        Ok(self.resolved()?.super_class.clone())
    }

    /// Directly implemented interfaces.
    pub fn interfaces(&self) -> VmResult<&[Arc<Class>]> {
        Ok(&self.resolved()?.interfaces)
    }

    /// Whether this is the root class (its own superclass).
    pub fn is_root(&self) -> VmResult<bool> {
        Ok(Arc::as_ptr(&self.resolved()?.super_class) == self as *const Class)
    }

    /// Declared instance methods.
    pub fn instance_methods(&self) -> VmResult<&[Arc<Method>]> {
        Ok(self.resolved()?.layout.methods())
    }

    /// Declared static methods.
    pub fn static_methods(&self) -> VmResult<&[Arc<Method>]> {
        Ok(self.resolved()?.static_layout.methods())
    }

    /// The flattened instance layout.
    pub fn layout(&self) -> VmResult<&Layout> {
        Ok(&self.resolved()?.layout)
    }

    /// The static-storage pseudo-layout.
    pub fn static_layout(&self) -> VmResult<&Layout> {
        Ok(&self.resolved()?.static_layout)
    }

    /// Instance storage size in bytes, inherited fields included.
    pub fn struct_size(&self) -> VmResult<usize> {
        Ok(self.resolved()?.layout.struct_size())
    }

    /// The constant pool; requires the class to be resolved.
    pub fn pool(&self) -> VmResult<&ConstantPool> {
        Ok(&self.resolved()?.pool)
    }

    /// The class-level attribute table.
    pub fn attributes(&self) -> VmResult<&Attributes> {
        Ok(&self.resolved()?.attributes)
    }

    /// The static storage block; requires the class to be initialised.
    pub fn statics(&self) -> VmResult<&Storage> {
        self.statics
            .get()
            .ok_or_else(|| VmError::internal(format!("{} is not initialised", self.name())))
    }

    /// Current lifecycle stage.
    pub fn status(&self) -> ResolutionStatus {
        self.core.status()
    }

    /// Drives the class to `RESOLVED`: parses the class bytes, lays
    /// out fields and methods, and builds both virtual tables.
    /// Idempotent; a failure leaves partially-loaded referenced
    /// classes in place (no rollback).
    pub fn resolve(&self) -> VmResult<()> {
        if self.core.status() >= ResolutionStatus::Resolved {
            return Ok(());
        }
        let _guard = self.core.lifecycle_lock();
        if self.core.status() >= ResolutionStatus::Resolved {
            return Ok(());
        }
        self.core.begin_resolving()?;
        let result = self.do_resolve();
        self.core.end_resolving();
        result
    }

    fn do_resolve(&self) -> VmResult<()> {
        let this = self.arc();
        let loader = self.loader()?;
        let vm = loader.vm()?;
        debug!(class = %self.name(), "resolving");

        let bytes = self
            .bytes
            .lock()
            .take()
            .ok_or_else(|| VmError::internal("class bytes consumed twice"))?;
        let raw = RawClassFile::parse(vm.names(), self.name(), &bytes)?;

        let is_root = raw.super_class.is_none();
        let super_class = match &raw.super_class {
            None => this.clone(),
            Some(name) => {
                let sup = loader.load_class(name)?;
                sup.resolve()?;
                sup
            }
        };

        let mut interfaces = Vec::with_capacity(raw.interfaces.len());
        for name in &raw.interfaces {
            let ifce = loader.load_class(name)?;
            ifce.resolve()?;
            interfaces.push(ifce);
        }

        // Fields, packed largest-first into instance and static layouts.
        let mut instance_specs = Vec::new();
        let mut static_specs = Vec::new();
        for member in &raw.fields {
            let desc = TypeDesc::parse(vm.names(), member.descriptor.as_str())?;
            let ty = loader.type_from_descriptor(&desc)?;
            let spec = FieldSpec {
                access: member.access,
                name: member.name.clone(),
                desc,
                ty,
                attributes: member.attributes.clone(),
            };
            if member.access.is_static() {
                static_specs.push(spec);
            } else {
                instance_specs.push(spec);
            }
        }
        let instance_base = if is_root {
            0
        } else {
            super_class.struct_size()?
        };
        let (instance_fields, instance_size) = Self::pack_fields(instance_specs, instance_base);
        let (static_fields, static_size) = Self::pack_fields(static_specs, 0);

        // Methods, shared with any call sites that referenced them.
        let mut instance_methods = Vec::new();
        let mut static_methods = Vec::new();
        for member in &raw.methods {
            let handle = self.declare_method(&loader, member)?;
            if member.access.is_static() {
                handle.set_slot(0)?;
                static_methods.push(handle);
            } else {
                instance_methods.push(handle);
            }
        }

        let static_vt = VirtualTable::create_for_leaf(&vm, Type::Class(this.clone()));
        let vt = VirtualTable::create_for_class(
            &vm,
            &this,
            &super_class,
            is_root,
            &interfaces,
            &instance_methods,
            raw.access,
        )?;

        let cp_cache = (0..raw.pool.len()).map(|_| OnceLock::new()).collect();
        let resolved = ResolvedClass {
            access: raw.access,
            super_class,
            interfaces,
            pool: raw.pool,
            cp_cache,
            layout: Layout::new(instance_fields, instance_methods, instance_size),
            static_layout: Layout::new(static_fields, static_methods, static_size),
            static_vt,
            attributes: raw.attributes,
        };
        self.resolved
            .set(resolved)
            .map_err(|_| VmError::internal("class resolved twice"))?;
        self.core.publish_vt(vt)?;
        self.core.set_status(ResolutionStatus::Resolved);
        debug!(class = %self.name(), "resolved");
        Ok(())
    }

    fn declare_method(
        &self,
        loader: &Arc<ClassLoader>,
        member: &RawMember,
    ) -> VmResult<Arc<Method>> {
        let handle = loader.method_handle(&self.arc(), &member.name, &member.descriptor)?;
        handle.post_initialise(member.access, member.attributes.clone())?;
        Ok(handle)
    }

    /// Packs field specs into offsets, largest log-size bucket first,
    /// so smaller fields fill the tail without padding holes.
    fn pack_fields(specs: Vec<FieldSpec>, base: usize) -> (Vec<Arc<Field>>, usize) {
        let mut size = align_word(base);
        let mut fields = Vec::with_capacity(specs.len());
        for log in (0..=3u32).rev() {
            for spec in specs.iter().filter(|s| s.desc.log_size() == log) {
                let offset = size;
                size += 1usize << log;
                fields.push(Field::new(
                    spec.access,
                    spec.name.clone(),
                    spec.desc.clone(),
                    spec.ty.clone(),
                    offset,
                    spec.attributes.clone(),
                ));
            }
        }
        (fields, size)
    }

    /// Drives the class to `INITED`: superclass and interfaces first,
    /// then static storage, constant-value initializers and `<clinit>`.
    /// Idempotent; re-entry from `<clinit>` sees the class as
    /// initialised.
    pub fn initialise(&self) -> VmResult<()> {
        self.resolve()?;
        if self.core.status() >= ResolutionStatus::Inited {
            return Ok(());
        }
        let _guard = self.core.lifecycle_lock();
        if self.core.status() >= ResolutionStatus::Inited {
            return Ok(());
        }
        debug!(class = %self.name(), "initialising");

        if !self.is_root()? {
            self.super_class()?.initialise()?;
        }
        for ifce in self.resolved()?.interfaces.clone() {
            ifce.initialise()?;
        }

        let storage = Storage::new(self.resolved()?.static_layout.struct_size());
        self.statics
            .set(storage)
            .map_err(|_| VmError::internal("static storage allocated twice"))?;
        self.core.set_status(ResolutionStatus::Inited);

        self.apply_constant_values()?;

        let vm = self.loader()?.vm()?;
        let clinit_name = vm.names().get("<clinit>");
        let clinit_desc = vm.names().get("()V");
        if let Some(clinit) = self
            .resolved()?
            .static_layout
            .find_method(&clinit_name, &clinit_desc)
        {
            let compiler = vm.compiler()?;
            let entry = compiler.ensure_compiled(&vm, &clinit)?;
            compiler.invoke(&vm, entry, &[])?;
        }
        debug!(class = %self.name(), "initialised");
        Ok(())
    }

    fn apply_constant_values(&self) -> VmResult<()> {
        let resolved = self.resolved()?;
        let storage = self.statics()?;
        let vm = self.loader()?.vm()?;
        for field in resolved.static_layout.fields() {
            let Some(attr) = field.attributes().lookup("ConstantValue") else {
                continue;
            };
            if attr.data.len() != 2 {
                return Err(VmError::format(
                    self.name().as_str(),
                    "bad length for ConstantValue attribute",
                ));
            }
            let idx = u16::from_be_bytes([attr.data[0], attr.data[1]]);
            let offset = field.offset();
            match resolved.pool.entry(idx)? {
                Constant::Integer(v) => storage.set_i32(offset, *v),
                Constant::Long(v) => storage.set_i64(offset, *v),
                Constant::Float(v) => storage.set_f32(offset, *v),
                Constant::Double(v) => storage.set_f64(offset, *v),
                Constant::String(utf8) => {
                    let text = resolved.pool.utf8_at(*utf8)?.clone();
                    storage.set_ref(offset, Some(vm.string_literal(&text)?));
                }
                other => {
                    return Err(VmError::format(
                        self.name().as_str(),
                        format!("invalid ConstantValue entry: {:?}", other),
                    ))
                }
            }
        }
        Ok(())
    }

    /// Finds an instance method, walking the superclass chain; the
    /// self-referential root terminates the walk.
    pub fn find_virtual_method(
        &self,
        name: &Name,
        descriptor: &Name,
    ) -> VmResult<Option<Arc<Method>>> {
        self.resolve()?;
        let mut cur = self.arc();
        loop {
            let next = {
                let r = cur.resolved()?;
                if let Some(found) = r.layout.find_method(name, descriptor) {
                    return Ok(Some(found));
                }
                if Arc::ptr_eq(&r.super_class, &cur) {
                    return Ok(None);
                }
                r.super_class.clone()
            };
            cur = next;
        }
    }

    /// [`Class::find_virtual_method`], erroring when absent.
    pub fn find_virtual_method_required(
        &self,
        name: &Name,
        descriptor: &Name,
    ) -> VmResult<Arc<Method>> {
        self.find_virtual_method(name, descriptor)?
            .ok_or_else(|| VmError::NoSuchMethod {
                class: self.name().as_str().to_string(),
                name: name.as_str().to_string(),
                descriptor: descriptor.as_str().to_string(),
            })
    }

    /// Finds a static method, walking the superclass chain of static
    /// layouts.
    pub fn find_static_method(
        &self,
        name: &Name,
        descriptor: &Name,
    ) -> VmResult<Option<Arc<Method>>> {
        self.resolve()?;
        let mut cur = self.arc();
        loop {
            let next = {
                let r = cur.resolved()?;
                if let Some(found) = r.static_layout.find_method(name, descriptor) {
                    return Ok(Some(found));
                }
                if Arc::ptr_eq(&r.super_class, &cur) {
                    return Ok(None);
                }
                r.super_class.clone()
            };
            cur = next;
        }
    }

    /// Finds an instance field, walking the superclass chain.
    pub fn find_virtual_field(&self, name: &Name) -> VmResult<Option<Arc<Field>>> {
        self.resolve()?;
        let mut cur = self.arc();
        loop {
            let next = {
                let r = cur.resolved()?;
                if let Some(found) = r.layout.find_field(name) {
                    return Ok(Some(found));
                }
                if Arc::ptr_eq(&r.super_class, &cur) {
                    return Ok(None);
                }
                r.super_class.clone()
            };
            cur = next;
        }
    }

    /// Finds a static field with its declaring class.
    pub fn find_static_field(&self, name: &Name) -> VmResult<Option<(Arc<Class>, Arc<Field>)>> {
        self.resolve()?;
        let mut cur = self.arc();
        loop {
            let next = {
                let r = cur.resolved()?;
                if let Some(found) = r.static_layout.find_field(name) {
                    return Ok(Some((cur.clone(), found)));
                }
                if Arc::ptr_eq(&r.super_class, &cur) {
                    return Ok(None);
                }
                r.super_class.clone()
            };
            cur = next;
        }
    }

    /// Registers a native function pointer for a declared `native`
    /// method.
    pub fn register_native(
        &self,
        name: &Name,
        descriptor: &Name,
        entry: EntryPoint,
    ) -> VmResult<()> {
        self.resolve()?;
        let found = self
            .resolved()?
            .static_layout
            .find_method(name, descriptor)
            .or_else(|| {
                self.resolved()
                    .ok()
                    .and_then(|r| r.layout.find_method(name, descriptor))
            });
        let method = found.ok_or_else(|| VmError::NoSuchMethod {
            class: self.name().as_str().to_string(),
            name: name.as_str().to_string(),
            descriptor: descriptor.as_str().to_string(),
        })?;
        if !method.access()?.is_native() {
            return Err(VmError::NoSuchMethod {
                class: self.name().as_str().to_string(),
                name: name.as_str().to_string(),
                descriptor: descriptor.as_str().to_string(),
            });
        }
        method.register_native(entry)
    }

    /// The raw constant at `idx` (for `ldc`-family translation).
    pub fn constant_at(&self, idx: u16) -> VmResult<Constant> {
        Ok(self.resolved()?.pool.entry(idx)?.clone())
    }

    fn cp_slot(&self, idx: u16) -> VmResult<&OnceLock<CpEntry>> {
        let r = self.resolved()?;
        r.cp_cache.get(idx as usize).ok_or_else(|| {
            VmError::format(
                self.name().as_str(),
                format!("wrong constant pool index {}", idx),
            )
        })
    }

    /// Resolves (and caches) the `Class` constant at `idx` to a type.
    pub fn class_at(&self, idx: u16) -> VmResult<Type> {
        if let Some(CpEntry::Class(ty)) = self.cp_slot(idx)?.get() {
            return Ok(ty.clone());
        }
        let loader = self.loader()?;
        let name = self.resolved()?.pool.class_name_at(idx)?.clone();
        let ty = if name.as_str().starts_with('[') {
            loader.type_from_name(&name)?
        } else {
            Type::Class(loader.load_class(&name)?)
        };
        let _ = self.cp_slot(idx)?.set(CpEntry::Class(ty.clone()));
        Ok(ty)
    }

    /// Resolves (and caches) a method reference to its shared handle.
    /// `expect_static` guards against virtual/static confusion.
    pub fn method_at(&self, idx: u16, expect_static: bool) -> VmResult<Arc<Method>> {
        if let Some(CpEntry::Method(m)) = self.cp_slot(idx)?.get() {
            self.check_method_kind(m, expect_static)?;
            return Ok(m.clone());
        }
        let loader = self.loader()?;
        let (class_name, name, descriptor) = {
            let (c, n, d) = self.resolved()?.pool.method_ref_at(idx)?;
            (c.clone(), n.clone(), d.clone())
        };
        let target = if class_name.as_str().starts_with('[') {
            // Methods invoked on arrays dispatch through the root class.
            loader.vm()?.object_class()?
        } else {
            loader.load_class(&class_name)?
        };
        let handle = loader.method_handle(&target, &name, &descriptor)?;
        self.check_method_kind(&handle, expect_static)?;
        let _ = self.cp_slot(idx)?.set(CpEntry::Method(handle.clone()));
        Ok(handle)
    }

    fn check_method_kind(&self, method: &Arc<Method>, expect_static: bool) -> VmResult<()> {
        if method.is_declared() && method.access()?.is_static() != expect_static {
            return Err(VmError::format(
                self.name().as_str(),
                "inconsistent use of virtual and static methods",
            ));
        }
        Ok(())
    }

    /// Resolves (and caches) a field reference.
    pub fn field_at(&self, idx: u16, expect_static: bool) -> VmResult<FieldRef> {
        if let Some(CpEntry::Field(f)) = self.cp_slot(idx)?.get() {
            if f.is_static != expect_static {
                return Err(VmError::format(
                    self.name().as_str(),
                    "inconsistent use of virtual and static fields",
                ));
            }
            return Ok(f.clone());
        }
        let loader = self.loader()?;
        let (class_name, name, descriptor) = {
            let (c, n, d) = self.resolved()?.pool.field_ref_at(idx)?;
            (c.clone(), n.clone(), d.clone())
        };
        let owner = loader.load_class(&class_name)?;
        let field_ref = if expect_static {
            let (declaring, field) =
                owner
                    .find_static_field(&name)?
                    .ok_or_else(|| VmError::NoSuchField {
                        class: class_name.as_str().to_string(),
                        name: name.as_str().to_string(),
                    })?;
            FieldRef {
                declaring,
                field,
                is_static: true,
            }
        } else {
            let field = owner
                .find_virtual_field(&name)?
                .ok_or_else(|| VmError::NoSuchField {
                    class: class_name.as_str().to_string(),
                    name: name.as_str().to_string(),
                })?;
            FieldRef {
                declaring: owner,
                field,
                is_static: false,
            }
        };
        if field_ref.field.desc().to_string() != descriptor.as_str() {
            return Err(VmError::NoSuchField {
                class: class_name.as_str().to_string(),
                name: name.as_str().to_string(),
            });
        }
        if field_ref.field.access().is_static() != expect_static {
            return Err(VmError::format(
                self.name().as_str(),
                "inconsistent use of virtual and static fields",
            ));
        }
        let _ = self.cp_slot(idx)?.set(CpEntry::Field(field_ref.clone()));
        Ok(field_ref)
    }
}

impl std::fmt::Debug for Class {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Class({}, {:?})", self.name(), self.status())
    }
}
