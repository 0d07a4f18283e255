//! The lazy-binding resolver and compilation service.

use crate::mangler::{method_symbol, native_symbol_long, native_symbol_short};
use core_types::{EntryPoint, VmError, VmResult};
use std::sync::Arc;
use tracing::debug;
use translator::{CodeBackend, Translator};
use type_system::{JavaValue, Method, MethodCompiler, Vm};

/// Supplies raw entries for mangled native-method symbols; the
/// engine's view of the foreign-function bridge.
pub trait NativeBridge: Send + Sync {
    /// Looks a symbol up, returning its callable entry if present.
    fn lookup(&self, symbol: &str) -> Option<EntryPoint>;
}

/// Binds the translator, the code backend and the native bridge into
/// the VM's compilation service.
pub struct Linker {
    backend: Arc<dyn CodeBackend>,
    native: Option<Arc<dyn NativeBridge>>,
}

impl Linker {
    /// Creates the linker and installs it as the VM's compiler.
    pub fn install(
        vm: &Arc<Vm>,
        backend: Arc<dyn CodeBackend>,
        native: Option<Arc<dyn NativeBridge>>,
    ) -> VmResult<Arc<Linker>> {
        let linker = Arc::new(Linker { backend, native });
        vm.set_compiler(linker.clone())?;
        Ok(linker)
    }

    /// The code backend.
    pub fn backend(&self) -> &Arc<dyn CodeBackend> {
        &self.backend
    }

    /// Compiles a declared method (bytecode through the translator,
    /// `native` through the bridge), caching the entry on the method.
    pub(crate) fn compile_target(
        &self,
        vm: &Arc<Vm>,
        method: &Arc<Method>,
    ) -> VmResult<EntryPoint> {
        if let Some(entry) = method.entry() {
            return Ok(entry);
        }
        let access = method.access()?;
        if access.is_abstract() {
            return Err(VmError::Linkage(format!(
                "calling abstract method {}",
                method.full_name()
            )));
        }
        let entry = if access.is_native() {
            self.bind_native(method)?
        } else {
            method.class().initialise()?;
            let graph = Translator::translate(vm, method)?;
            self.backend.compile(vm, graph)?
        };
        let symbol = method_symbol(
            method.class().name().as_str(),
            method.name().as_str(),
            method.desc(),
        );
        debug!(method = %method.full_name(), %symbol, "compiled");
        Ok(method.publish_entry(entry))
    }

    /// Binds a `native` method: a registered pointer wins, otherwise
    /// the bridge is probed with the short symbol and then the
    /// overload-qualified one.
    fn bind_native(&self, method: &Arc<Method>) -> VmResult<EntryPoint> {
        if let Some(entry) = method.native_entry() {
            return Ok(entry);
        }
        let bridge = self.native.as_ref().ok_or_else(|| {
            VmError::Linkage(format!(
                "no native bridge for native method {}",
                method.full_name()
            ))
        })?;
        let class = method.class();
        let short = native_symbol_short(class.name().as_str(), method.name().as_str());
        let long = native_symbol_long(
            class.name().as_str(),
            method.name().as_str(),
            method.desc(),
        );
        let entry = bridge
            .lookup(&short)
            .or_else(|| bridge.lookup(&long))
            .ok_or_else(|| {
                VmError::Linkage(format!("unresolved native method {}", method.full_name()))
            })?;
        let _ = method.register_native(entry);
        Ok(entry)
    }
}

impl MethodCompiler for Linker {
    fn ensure_compiled(&self, vm: &Arc<Vm>, method: &Arc<Method>) -> VmResult<EntryPoint> {
        if method.is_declared() {
            self.compile_target(vm, method)
        } else {
            self.resolve_static(vm, method)
        }
    }

    fn invoke(&self, vm: &Arc<Vm>, entry: EntryPoint, args: &[JavaValue]) -> VmResult<JavaValue> {
        self.backend.invoke(vm, entry, args)
    }
}
