//! Virtual tables and the fast subtype checker.
//!
//! Subtype tests follow the display scheme of Cliff Click and John
//! Rose, "Fast subtype checking in the HotSpot JVM" (JGI '02): each
//! table carries a fixed-length array of ancestor table ids indexed by
//! inheritance depth, so a primary-chain test is one array compare.
//! Types too deep for the display, interfaces and covariant array
//! supertypes live in a sorted, de-duplicated secondary set scanned
//! linearly behind a one-entry cache.
//!
//! Interface calls dispatch through a fixed-size interface method
//! table: interface methods hash into a constant number of buckets by
//! their per-loader slot index; a one-candidate bucket patches to a
//! direct entry, a collision bucket keeps its candidate list for
//! call-time linear resolution.
//!
//! Method entry points are `u64` tokens in atomic slots, so the
//! lazy-binding resolver patches a slot with a single compare-and-swap.

use crate::loader::ClassLoader;
use crate::method::Method;
use crate::ty::{ArrayClass, Type};
use crate::vm::Vm;
use crate::Class;
use core_types::{EntryPoint, Name, VmError, VmResult};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Display length, including the trailing cache slot.
pub const DISPLAY_LENGTH: usize = 9;
/// Depth threshold; tables at or past this depth become secondary.
pub const CACHE_OFFSET: usize = DISPLAY_LENGTH - 1;

/// The subtype-check structure embedded in every virtual table.
pub struct TypeChecker {
    /// Ancestor table ids by inheritance depth (primary chain only).
    display: [u32; CACHE_OFFSET],
    /// One-entry cache over the secondary set.
    cache: AtomicU32,
    /// Own depth if primary, [`CACHE_OFFSET`] if secondary.
    offset: u32,
    /// Non-primary supertypes: (table id, type), sorted by id, deduped.
    secondary: Vec<(u32, Type)>,
}

/// One interface-dispatch bucket.
pub struct InterfaceSlot {
    methods: Vec<Arc<Method>>,
    entry: AtomicU64,
}

impl InterfaceSlot {
    fn new(methods: Vec<Arc<Method>>) -> InterfaceSlot {
        InterfaceSlot {
            methods,
            entry: AtomicU64::new(0),
        }
    }

    /// Candidate implementations bucketed here.
    pub fn methods(&self) -> &[Arc<Method>] {
        &self.methods
    }

    /// Whether more than one interface method landed in this bucket.
    pub fn has_collision(&self) -> bool {
        self.methods.len() > 1
    }

    /// The patched direct entry, when the bucket is collision-free.
    pub fn entry(&self) -> Option<EntryPoint> {
        EntryPoint::from_raw(self.entry.load(Ordering::Acquire))
    }

    /// Patches the direct entry; first writer wins.
    pub fn patch_entry(&self, entry: EntryPoint) -> EntryPoint {
        match self
            .entry
            .compare_exchange(0, entry.as_raw(), Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => entry,
            Err(existing) => EntryPoint::from_raw(existing).expect("nonzero on race"),
        }
    }
}

/// Per-type dispatch table and subtype checker.
pub struct VirtualTable {
    id: u32,
    ty: Type,
    checker: TypeChecker,
    methods: Vec<Arc<Method>>,
    entries: Vec<AtomicU64>,
    interface_slots: Vec<InterfaceSlot>,
}

impl VirtualTable {
    /// Process-unique table id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The type this table dispatches for.
    pub fn ty(&self) -> &Type {
        &self.ty
    }

    /// Whether this table sits on the primary display chain.
    pub fn is_primary(&self) -> bool {
        (self.checker.offset as usize) < CACHE_OFFSET
    }

    /// Number of virtual-method slots.
    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    /// The method owning a dispatch slot.
    pub fn method_at(&self, slot: usize) -> Option<&Arc<Method>> {
        self.methods.get(slot)
    }

    /// All slot-owning methods, by slot index.
    pub fn methods(&self) -> &[Arc<Method>] {
        &self.methods
    }

    /// The compiled entry in a dispatch slot, if patched.
    pub fn entry_at(&self, slot: usize) -> Option<EntryPoint> {
        self.entries
            .get(slot)
            .and_then(|cell| EntryPoint::from_raw(cell.load(Ordering::Acquire)))
    }

    /// Patches a dispatch slot with a compiled entry; first writer
    /// wins and later patches are no-ops.
    pub fn patch_entry(&self, slot: usize, entry: EntryPoint) -> VmResult<EntryPoint> {
        let cell = self
            .entries
            .get(slot)
            .ok_or_else(|| VmError::internal("dispatch slot out of range"))?;
        match cell.compare_exchange(0, entry.as_raw(), Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => Ok(entry),
            Err(existing) => Ok(EntryPoint::from_raw(existing).expect("nonzero on race")),
        }
    }

    /// The interface dispatch buckets (empty on tables that cannot be
    /// an interface-call receiver).
    pub fn interface_slots(&self) -> &[InterfaceSlot] {
        &self.interface_slots
    }

    /// One interface bucket, by slot hash.
    pub fn interface_slot(&self, index: usize) -> VmResult<&InterfaceSlot> {
        self.interface_slots
            .get(index)
            .ok_or_else(|| VmError::internal("interface slot out of range"))
    }

    /// Non-primary supertype count (test support).
    pub fn secondary_len(&self) -> usize {
        self.checker.secondary.len()
    }

    fn entry_values(&self) -> Vec<u64> {
        self.entries
            .iter()
            .map(|cell| cell.load(Ordering::Acquire))
            .collect()
    }

    /// O(1) fast path of the subtype test.
    pub fn is_assignable_to(&self, parent: &VirtualTable) -> bool {
        let parent_offset = parent.checker.offset as usize;
        if parent_offset < CACHE_OFFSET {
            return self.checker.display[parent_offset] == parent.id;
        }
        if self.checker.cache.load(Ordering::Relaxed) == parent.id {
            return true;
        }
        if self.id == parent.id {
            return true;
        }
        self.slow_is_assignable_to(parent)
    }

    /// Linear scan of the secondary set; updates the cache on a hit.
    fn slow_is_assignable_to(&self, parent: &VirtualTable) -> bool {
        for (id, _) in &self.checker.secondary {
            if *id == parent.id {
                self.checker.cache.store(parent.id, Ordering::Relaxed);
                return true;
            }
        }
        false
    }

    /// Table for a primitive or a static-storage pseudo-type: a root
    /// checker with no methods.
    pub(crate) fn create_for_leaf(vm: &Arc<Vm>, ty: Type) -> Arc<VirtualTable> {
        let id = vm.next_vt_id();
        let checker = root_checker(id);
        Arc::new(VirtualTable {
            id,
            ty,
            checker,
            methods: Vec::new(),
            entries: Vec::new(),
            interface_slots: Vec::new(),
        })
    }

    /// Table for a class, built bottom-up: the slot arrays start as a
    /// copy of the superclass's and only introduced or overridden
    /// slots are rewritten.
    pub(crate) fn create_for_class(
        vm: &Arc<Vm>,
        class: &Arc<Class>,
        super_class: &Arc<Class>,
        is_root: bool,
        interfaces: &[Arc<Class>],
        own_methods: &[Arc<Method>],
        access: classfile::AccessFlags,
    ) -> VmResult<Arc<VirtualTable>> {
        let ty = Type::Class(class.clone());
        let super_vt = if is_root {
            None
        } else {
            Some(super_class.vt()?)
        };

        let is_interface = access.is_interface();
        let mut methods: Vec<Arc<Method>> = Vec::new();
        let mut entry_values: Vec<u64> = Vec::new();

        if !is_interface {
            if let Some(sup) = &super_vt {
                methods = sup.methods.clone();
                entry_values = sup.entry_values();
            }
            let mut next_slot = methods.len() as u32;
            for meth in own_methods {
                let parent = if is_root {
                    None
                } else {
                    super_class.find_virtual_method(meth.name(), meth.descriptor())?
                };
                let slot = match parent {
                    Some(p) => p
                        .slot()
                        .ok_or_else(|| VmError::internal("superclass method has no slot"))?,
                    None => {
                        let s = next_slot;
                        next_slot += 1;
                        s
                    }
                };
                meth.set_slot(slot)?;
                let slot = slot as usize;
                match slot.cmp(&methods.len()) {
                    std::cmp::Ordering::Equal => {
                        methods.push(meth.clone());
                        entry_values.push(0);
                    }
                    std::cmp::Ordering::Less => {
                        methods[slot] = meth.clone();
                        entry_values[slot] = 0;
                    }
                    std::cmp::Ordering::Greater => {
                        return Err(VmError::internal("dispatch slots assigned out of order"))
                    }
                }
            }
        }

        let mut direct = Vec::with_capacity(interfaces.len());
        for ifce in interfaces {
            direct.push(ifce.vt()?);
        }
        let id = vm.next_vt_id();
        let checker = derived_checker(id, &ty, super_vt.as_ref(), direct, is_interface)?;

        // Interfaces and abstract classes are never interface-call
        // receivers, so they carry no population.
        let interface_slots = if is_interface || access.is_abstract() {
            Vec::new()
        } else {
            let loader = class.loader()?;
            build_interface_slots(
                &loader,
                vm.options().interface_table_slots,
                &checker.secondary,
                &|name, desc| lookup_during_build(own_methods, super_class, is_root, name, desc),
            )?
        };

        Ok(Arc::new(VirtualTable {
            id,
            ty,
            checker,
            methods,
            entries: entry_values.into_iter().map(AtomicU64::new).collect(),
            interface_slots,
        }))
    }

    /// Table for an array type, derived structurally from the
    /// component:
    ///
    /// ```text
    /// Integer[][]
    /// Number[][] + lifted interfaces        int[][][]
    /// Object[][]                            Object[][]
    /// Object[]              int[]           Object[]
    ///            Object + Cloneable/Serializable
    /// ```
    pub(crate) fn create_for_array(
        vm: &Arc<Vm>,
        array: &Arc<ArrayClass>,
    ) -> VmResult<Arc<VirtualTable>> {
        let ty = Type::Array(array.clone());
        let object_class = vm.object_class()?;
        let object_type = Type::Class(object_class.clone());

        let mut dim = 1usize;
        let mut base = array.component().clone();
        while let Type::Array(inner) = base.clone() {
            base = inner.component().clone();
            dim += 1;
        }

        let mut is_secondary = false;
        let mut direct: Vec<Arc<VirtualTable>> = Vec::new();
        let super_type: Type;

        match &base {
            Type::Primitive(_) => {
                super_type = object_type.array_type(dim - 1)?;
                for ifce in vm.array_interfaces()? {
                    let lifted = Type::Class(ifce.clone()).array_type(dim - 1)?;
                    direct.push(lifted.vt()?);
                }
            }
            Type::Class(c) if Arc::ptr_eq(c, &object_class) => {
                super_type = array.component().clone();
                for ifce in vm.array_interfaces()? {
                    let lifted = Type::Class(ifce.clone()).array_type(dim - 1)?;
                    direct.push(lifted.vt()?);
                }
            }
            Type::Class(c) => {
                c.resolve()?;
                if c.access()?.is_interface() {
                    is_secondary = true;
                }
                super_type = Type::Class(c.super_class()?).array_type(dim)?;
                let base_vt = c.vt()?;
                for (sid, sty) in &base_vt.checker.secondary {
                    if *sid == base_vt.id {
                        continue; // don't add myself
                    }
                    let lifted = sty.array_type(dim)?;
                    direct.push(lifted.vt()?);
                }
            }
            Type::Array(_) => {
                return Err(VmError::internal("array base cannot be an array"));
            }
        }

        super_type.resolve()?;
        let super_vt = super_type.vt()?;
        let id = vm.next_vt_id();
        let checker = derived_checker(id, &ty, Some(&super_vt), direct, is_secondary)?;

        // Object arrays answer virtual calls with the root class's
        // method table.
        let object_vt = object_type.vt()?;
        let methods = object_vt.methods.clone();
        let entries = object_vt.entry_values();

        let loader = ty.loader()?;
        let interface_slots = build_interface_slots(
            &loader,
            vm.options().interface_table_slots,
            &checker.secondary,
            &|name, desc| object_class.find_virtual_method(name, desc),
        )?;

        Ok(Arc::new(VirtualTable {
            id,
            ty,
            checker,
            methods,
            entries: entries.into_iter().map(AtomicU64::new).collect(),
            interface_slots,
        }))
    }
}

impl std::fmt::Debug for VirtualTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "VirtualTable({}, id={}, offset={}, methods={}, secondaries={})",
            self.ty.name(),
            self.id,
            self.checker.offset,
            self.methods.len(),
            self.checker.secondary.len()
        )
    }
}

fn root_checker(id: u32) -> TypeChecker {
    let mut display = [0u32; CACHE_OFFSET];
    display[0] = id;
    TypeChecker {
        display,
        cache: AtomicU32::new(0),
        offset: 0,
        secondary: Vec::new(),
    }
}

/// Builds a checker below `super_vt`, flattening every transitive
/// non-primary supertype into the secondary set so assignability is
/// transitive by construction.
fn derived_checker(
    id: u32,
    ty: &Type,
    super_vt: Option<&Arc<VirtualTable>>,
    direct: Vec<Arc<VirtualTable>>,
    is_secondary: bool,
) -> VmResult<TypeChecker> {
    let Some(sup) = super_vt else {
        if !direct.is_empty() {
            return Err(VmError::internal(
                "a root virtual table cannot have secondary supertypes",
            ));
        }
        return Ok(root_checker(id));
    };

    let parent_len = sup.checker.offset as usize + 1;
    let is_secondary = is_secondary || parent_len >= CACHE_OFFSET;
    let mut display = sup.checker.display;
    let mut secondary: Vec<(u32, Type)> = Vec::new();

    let offset = if is_secondary {
        secondary.push((id, ty.clone()));
        CACHE_OFFSET
    } else {
        display[parent_len] = id;
        parent_len
    };

    for d in &direct {
        secondary.push((d.id, d.ty.clone()));
        secondary.extend(d.checker.secondary.iter().cloned());
    }
    secondary.extend(sup.checker.secondary.iter().cloned());
    secondary.sort_by_key(|(sid, _)| *sid);
    secondary.dedup_by_key(|(sid, _)| *sid);

    Ok(TypeChecker {
        display,
        cache: AtomicU32::new(0),
        offset: offset as u32,
        secondary,
    })
}

/// Virtual-method lookup usable while the class is still resolving:
/// the class's own (unpublished) methods first, then the super chain.
fn lookup_during_build(
    own_methods: &[Arc<Method>],
    super_class: &Arc<Class>,
    is_root: bool,
    name: &Name,
    descriptor: &Name,
) -> VmResult<Option<Arc<Method>>> {
    if let Some(found) = own_methods
        .iter()
        .find(|m| m.name() == name && m.descriptor() == descriptor)
    {
        return Ok(Some(found.clone()));
    }
    if is_root {
        return Ok(None);
    }
    super_class.find_virtual_method(name, descriptor)
}

/// Populates the interface method table: every method of every
/// implemented interface is bucketed by its per-loader slot index and
/// bound to the receiver's most-derived override.
fn build_interface_slots(
    loader: &Arc<ClassLoader>,
    slot_count: usize,
    secondary: &[(u32, Type)],
    lookup: &dyn Fn(&Name, &Name) -> VmResult<Option<Arc<Method>>>,
) -> VmResult<Vec<InterfaceSlot>> {
    let mut buckets: Vec<Vec<Arc<Method>>> = (0..slot_count).map(|_| Vec::new()).collect();

    for (_, ty) in secondary {
        let Type::Class(ifce) = ty else { continue };
        if !ifce.access()?.is_interface() {
            continue;
        }
        for m in ifce.instance_methods()? {
            let must_implement = m.access()?.is_abstract();
            let implementation = match lookup(m.name(), m.descriptor())? {
                Some(found) => found,
                None if must_implement => {
                    return Err(VmError::NoSuchMethod {
                        class: ifce.name().as_str().to_string(),
                        name: m.name().as_str().to_string(),
                        descriptor: m.descriptor().as_str().to_string(),
                    })
                }
                // A default body on the interface itself.
                None => m.clone(),
            };
            let index = loader.interface_slot_index(m.name(), m.descriptor()) as usize % slot_count;
            let bucket = &mut buckets[index];
            if !bucket.iter().any(|b| Arc::ptr_eq(b, &implementation)) {
                bucket.push(implementation);
            }
        }
    }

    Ok(buckets.into_iter().map(InterfaceSlot::new).collect())
}
