//! Lazy-binding trampolines.
//!
//! A trampoline stands in for a not-yet-compiled call target. The
//! "stub" is an atomic resolved-or-not cell - the method's entry slot,
//! a virtual-table slot, or an interface-table bucket - plus this
//! resolver. The first call performs the lookup appropriate to its
//! flavor, compiles the target, patches the cell with one
//! compare-and-swap (a second patch is a benign no-op by
//! construction), and hands back the resolved entry.

use crate::Linker;
use core_types::{EntryPoint, VmError, VmResult};
use std::sync::Arc;
use tracing::debug;
use type_system::{Method, ObjRef, Vm};

/// The three stub flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrampolineKind {
    /// Static call: the target is fixed by the reference.
    Static,
    /// Virtual call: the receiver's class picks the override.
    Virtual,
    /// Interface call: dispatch through the interface method table.
    Interface,
}

/// One unresolved call's stand-in.
pub struct Trampoline {
    kind: TrampolineKind,
    method: Arc<Method>,
}

impl Trampoline {
    pub(crate) fn new(kind: TrampolineKind, method: Arc<Method>) -> Trampoline {
        Trampoline { kind, method }
    }

    /// The stub flavor.
    pub fn kind(&self) -> TrampolineKind {
        self.kind
    }

    /// The statically-referenced method.
    pub fn method(&self) -> &Arc<Method> {
        &self.method
    }

    /// Resolves the call: looks the target up, compiles it, patches
    /// the dispatch cell and returns the entry to jump to.
    pub fn resolve(
        &self,
        vm: &Arc<Vm>,
        linker: &Linker,
        receiver: Option<&ObjRef>,
    ) -> VmResult<EntryPoint> {
        match self.kind {
            TrampolineKind::Static => linker.resolve_static(vm, &self.method),
            TrampolineKind::Virtual => {
                let receiver = required_receiver(receiver)?;
                linker.resolve_virtual(vm, &self.method, receiver)
            }
            TrampolineKind::Interface => {
                let receiver = required_receiver(receiver)?;
                linker.resolve_interface(vm, &self.method, receiver)
            }
        }
    }
}

fn required_receiver<'a>(receiver: Option<&'a ObjRef>) -> VmResult<&'a ObjRef> {
    receiver.ok_or_else(|| VmError::internal("receiver-polymorphic call without a receiver"))
}

impl Linker {
    /// Builds a trampoline of the given flavor for a method reference.
    pub fn trampoline(&self, kind: TrampolineKind, method: Arc<Method>) -> Trampoline {
        Trampoline::new(kind, method)
    }

    /// Resolves a static (or exact) call: finds the declaration along
    /// the superclass chain, compiles it, and patches the reference's
    /// own entry cell.
    pub fn resolve_static(&self, vm: &Arc<Vm>, method: &Arc<Method>) -> VmResult<EntryPoint> {
        if let Some(entry) = method.entry() {
            return Ok(entry);
        }
        let target = if method.is_declared() {
            method.clone()
        } else {
            let class = method.class();
            class.initialise()?;
            class
                .find_static_method(method.name(), method.descriptor())?
                .or(class.find_virtual_method(method.name(), method.descriptor())?)
                .ok_or_else(|| VmError::NoSuchMethod {
                    class: class.name().as_str().to_string(),
                    name: method.name().as_str().to_string(),
                    descriptor: method.descriptor().as_str().to_string(),
                })?
        };
        let entry = self.compile_target(vm, &target)?;
        debug!(method = %method.full_name(), "static call site patched");
        Ok(method.publish_entry(entry))
    }

    /// Resolves a virtual call for a concrete receiver: finds the
    /// most-derived override, compiles it, and patches the receiver
    /// class's dispatch slot.
    pub fn resolve_virtual(
        &self,
        vm: &Arc<Vm>,
        method: &Arc<Method>,
        receiver: &ObjRef,
    ) -> VmResult<EntryPoint> {
        let receiver_class = receiver.vt().ty().as_class().ok();
        let implementation = match &receiver_class {
            Some(class) => {
                class.find_virtual_method_required(method.name(), method.descriptor())?
            }
            // Arrays dispatch with the root class's method table.
            None => vm
                .object_class()?
                .find_virtual_method_required(method.name(), method.descriptor())?,
        };
        let slot = implementation
            .slot()
            .ok_or_else(|| VmError::internal("virtual target has no dispatch slot"))?;
        let entry = self.compile_target(vm, &implementation)?;
        let patched = receiver.vt().patch_entry(slot as usize, entry)?;
        debug!(
            method = %implementation.full_name(),
            slot,
            "virtual dispatch slot patched"
        );
        Ok(patched)
    }

    /// Resolves an interface call for a concrete receiver: picks the
    /// implementation out of the receiver's interface-table bucket,
    /// compiles it, and - when the bucket is collision-free - patches
    /// the bucket's direct entry. A collision bucket stays a linear
    /// table consulted per call.
    pub fn resolve_interface(
        &self,
        vm: &Arc<Vm>,
        method: &Arc<Method>,
        receiver: &ObjRef,
    ) -> VmResult<EntryPoint> {
        let loader = receiver.vt().ty().loader()?;
        let slots = vm.options().interface_table_slots;
        let index = loader.interface_slot_index(method.name(), method.descriptor()) as usize % slots;
        let slot = receiver.vt().interface_slot(index)?;

        let implementation = slot
            .methods()
            .iter()
            .find(|m| m.name() == method.name() && m.descriptor() == method.descriptor())
            .cloned()
            .ok_or_else(|| VmError::NoSuchMethod {
                class: receiver.vt().ty().name().as_str().to_string(),
                name: method.name().as_str().to_string(),
                descriptor: method.descriptor().as_str().to_string(),
            })?;
        let entry = self.compile_target(vm, &implementation)?;
        if !slot.has_collision() {
            let patched = slot.patch_entry(entry);
            debug!(
                method = %implementation.full_name(),
                index,
                "interface table bucket patched"
            );
            return Ok(patched);
        }
        Ok(entry)
    }

    /// Fast-path virtual dispatch: the patched slot when present, the
    /// trampoline path otherwise.
    pub fn dispatch_virtual(
        &self,
        vm: &Arc<Vm>,
        method: &Arc<Method>,
        receiver: &ObjRef,
    ) -> VmResult<EntryPoint> {
        if let Some(slot) = method.slot() {
            if let Some(entry) = receiver.vt().entry_at(slot as usize) {
                return Ok(entry);
            }
        }
        self.resolve_virtual(vm, method, receiver)
    }

    /// Fast-path interface dispatch through the interface method
    /// table: a patched bucket hits in O(1); a collision bucket scans
    /// its linear candidate list.
    pub fn dispatch_interface(
        &self,
        vm: &Arc<Vm>,
        method: &Arc<Method>,
        receiver: &ObjRef,
    ) -> VmResult<EntryPoint> {
        let loader = receiver.vt().ty().loader()?;
        let slots = vm.options().interface_table_slots;
        let index = loader.interface_slot_index(method.name(), method.descriptor()) as usize % slots;
        let slot = receiver.vt().interface_slot(index)?;
        if !slot.has_collision() {
            if let Some(entry) = slot.entry() {
                return Ok(entry);
            }
        }
        self.resolve_interface(vm, method, receiver)
    }
}
