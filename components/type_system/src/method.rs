//! Methods, fields and resolved member layouts.
//!
//! A [`Method`] is created the first time a (class, name, descriptor)
//! triple is seen - whether from the declaring class's own member
//! table or from a call site's constant pool - and the loader
//! deduplicates them, so every call site and the declaration share one
//! record. Declaration details arrive later, when the declaring class
//! resolves; dispatch-slot indices arrive when its virtual table is
//! built; the compiled entry arrives when the lazy-binding resolver
//! first runs it.

use crate::ty::Type;
use crate::Class;
use classfile::{AccessFlags, Attributes, CodeAttribute};
use core_types::{EntryPoint, MethodDesc, Name, TypeDesc, VmError, VmResult};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// Slot sentinel: not yet assigned.
const NO_SLOT: u32 = u32::MAX;

struct DeclaredInfo {
    access: AccessFlags,
    attributes: Attributes,
}

/// One method record, shared between call sites and the declaration.
pub struct Method {
    class: Weak<Class>,
    name: Name,
    descriptor: Name,
    desc: MethodDesc,
    declared: OnceLock<DeclaredInfo>,
    slot: AtomicU32,
    entry: AtomicU64,
    native_entry: AtomicU64,
}

impl Method {
    pub(crate) fn new(
        class: &Arc<Class>,
        name: Name,
        descriptor: Name,
        desc: MethodDesc,
    ) -> Arc<Method> {
        Arc::new(Method {
            class: Arc::downgrade(class),
            name,
            descriptor,
            desc,
            declared: OnceLock::new(),
            slot: AtomicU32::new(NO_SLOT),
            entry: AtomicU64::new(0),
            native_entry: AtomicU64::new(0),
        })
    }

    /// The class named by the reference (not necessarily the declarer).
    pub fn class(&self) -> Arc<Class> {
        self.class.upgrade().expect("class loader dropped")
    }

    /// Method name.
    pub fn name(&self) -> &Name {
        &self.name
    }

    /// Raw descriptor string.
    pub fn descriptor(&self) -> &Name {
        &self.descriptor
    }

    /// Parsed descriptor.
    pub fn desc(&self) -> &MethodDesc {
        &self.desc
    }

    /// `Class::name(descriptor)` for diagnostics.
    pub fn full_name(&self) -> String {
        format!("{}::{}{}", self.class().name(), self.name, self.descriptor)
    }

    /// Attaches the declaration read from class bytes. The static flag
    /// of a reference may never change once seen.
    pub(crate) fn post_initialise(
        &self,
        access: AccessFlags,
        attributes: Attributes,
    ) -> VmResult<()> {
        if let Some(existing) = self.declared.get() {
            if existing.access.is_static() != access.is_static() {
                return Err(VmError::format(
                    self.class().name().as_str(),
                    format!("inconsistent static redeclaration of {}", self.name),
                ));
            }
            return Err(VmError::format(
                self.class().name().as_str(),
                format!("duplicate method {}{}", self.name, self.descriptor),
            ));
        }
        let _ = self.declared.set(DeclaredInfo { access, attributes });
        Ok(())
    }

    /// Whether the declaring class has resolved this method's body.
    pub fn is_declared(&self) -> bool {
        self.declared.get().is_some()
    }

    /// Declared access flags; an error before declaration.
    pub fn access(&self) -> VmResult<AccessFlags> {
        self.declared
            .get()
            .map(|d| d.access)
            .ok_or_else(|| VmError::NoSuchMethod {
                class: self.class().name().as_str().to_string(),
                name: self.name.as_str().to_string(),
                descriptor: self.descriptor.as_str().to_string(),
            })
    }

    /// Declared attribute table; an error before declaration.
    pub fn attributes(&self) -> VmResult<&Attributes> {
        self.declared
            .get()
            .map(|d| &d.attributes)
            .ok_or_else(|| VmError::NoSuchMethod {
                class: self.class().name().as_str().to_string(),
                name: self.name.as_str().to_string(),
                descriptor: self.descriptor.as_str().to_string(),
            })
    }

    /// The decoded `Code` attribute; a format error if absent.
    pub fn code(&self) -> VmResult<CodeAttribute> {
        let class = self.class();
        let attributes = self.attributes()?;
        let attr = attributes.lookup("Code").ok_or_else(|| {
            VmError::format(
                class.name().as_str(),
                format!("no Code attribute in {}{}", self.name, self.descriptor),
            )
        })?;
        CodeAttribute::parse(class.pool()?, class.name(), &attr.data)
    }

    /// The dispatch-slot index, once the virtual table assigned one.
    pub fn slot(&self) -> Option<u32> {
        let raw = self.slot.load(Ordering::Acquire);
        (raw != NO_SLOT).then_some(raw)
    }

    /// Assigns the dispatch slot; assigning twice is an engine fault.
    pub(crate) fn set_slot(&self, slot: u32) -> VmResult<()> {
        let prev = self
            .slot
            .compare_exchange(NO_SLOT, slot, Ordering::AcqRel, Ordering::Acquire);
        match prev {
            Ok(_) => Ok(()),
            Err(existing) if existing == slot => Ok(()),
            Err(_) => Err(VmError::internal(format!(
                "re-resolving resolved method {}",
                self.full_name()
            ))),
        }
    }

    /// The compiled entry, if the method has been compiled.
    pub fn entry(&self) -> Option<EntryPoint> {
        EntryPoint::from_raw(self.entry.load(Ordering::Acquire))
    }

    /// Publishes the compiled entry. The first publisher wins; the
    /// race's loser gets the winner's entry, making a second patch a
    /// benign no-op.
    pub fn publish_entry(&self, entry: EntryPoint) -> EntryPoint {
        match self.entry.compare_exchange(
            0,
            entry.as_raw(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => entry,
            Err(existing) => EntryPoint::from_raw(existing).expect("nonzero on race"),
        }
    }

    /// The registered native entry, if any.
    pub fn native_entry(&self) -> Option<EntryPoint> {
        EntryPoint::from_raw(self.native_entry.load(Ordering::Acquire))
    }

    /// Registers a native function for a `native` method; registering
    /// twice is a linkage error.
    pub fn register_native(&self, entry: EntryPoint) -> VmResult<()> {
        self.native_entry
            .compare_exchange(0, entry.as_raw(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| {
                VmError::Linkage(format!(
                    "native function of {} registered twice",
                    self.full_name()
                ))
            })
    }
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Method({}{})", self.name, self.descriptor)
    }
}

/// One resolved field with its byte offset in the owning layout.
pub struct Field {
    access: AccessFlags,
    name: Name,
    desc: TypeDesc,
    ty: Type,
    offset: usize,
    attributes: Attributes,
}

impl Field {
    pub(crate) fn new(
        access: AccessFlags,
        name: Name,
        desc: TypeDesc,
        ty: Type,
        offset: usize,
        attributes: Attributes,
    ) -> Arc<Field> {
        Arc::new(Field {
            access,
            name,
            desc,
            ty,
            offset,
            attributes,
        })
    }

    /// Access flags.
    pub fn access(&self) -> AccessFlags {
        self.access
    }

    /// Field name.
    pub fn name(&self) -> &Name {
        &self.name
    }

    /// Parsed descriptor.
    pub fn desc(&self) -> &TypeDesc {
        &self.desc
    }

    /// The field's loaded type.
    pub fn ty(&self) -> &Type {
        &self.ty
    }

    /// Byte offset within the owning storage block.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The field's attribute table.
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }
}

impl std::fmt::Debug for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Field({} {} @{})", self.desc, self.name, self.offset)
    }
}

/// The flattened member tables of one class (instance or static side).
pub struct Layout {
    fields: Vec<Arc<Field>>,
    methods: Vec<Arc<Method>>,
    struct_size: usize,
}

impl Layout {
    pub(crate) fn new(
        fields: Vec<Arc<Field>>,
        methods: Vec<Arc<Method>>,
        struct_size: usize,
    ) -> Layout {
        Layout {
            fields,
            methods,
            struct_size,
        }
    }

    /// Declared fields with assigned offsets.
    pub fn fields(&self) -> &[Arc<Field>] {
        &self.fields
    }

    /// Declared methods.
    pub fn methods(&self) -> &[Arc<Method>] {
        &self.methods
    }

    /// Total storage size in bytes, including inherited fields.
    pub fn struct_size(&self) -> usize {
        self.struct_size
    }

    /// Finds a declared method by name and descriptor.
    pub fn find_method(&self, name: &Name, descriptor: &Name) -> Option<Arc<Method>> {
        self.methods
            .iter()
            .find(|m| m.name() == name && m.descriptor() == descriptor)
            .cloned()
    }

    /// Finds a declared field by name.
    pub fn find_field(&self, name: &Name) -> Option<Arc<Field>> {
        self.fields.iter().find(|f| f.name() == name).cloned()
    }
}
