//! Integration test support for the execution engine.
//!
//! Provides three things the suites share:
//!
//! - [`ClassBuilder`] - emits real class-file bytes for synthetic
//!   test classes
//! - [`MapSource`] - an in-memory class-byte source
//! - [`MockBackend`] - a [`CodeBackend`] that "compiles" by retaining
//!   the translated graph and evaluates it on invocation, enough to
//!   run the test corpus end to end

use core_types::{EntryPoint, Name, ValueKind, VmError, VmResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use translator::{
    ArithOp, ArrayElem, CodeBackend, Cond, ConvTarget, InvokeKind, MethodGraph, Op, Terminator,
};
use type_system::{
    ClassBytesSource, ClassLoader, JavaValue, ObjRef, Object, Type, Vm, VmOptions,
};

pub use translator::opcodes;

// ---------------------------------------------------------------------
// Class-file builder
// ---------------------------------------------------------------------

const CP_UTF8: u8 = 1;
const CP_INTEGER: u8 = 3;
const CP_FLOAT: u8 = 4;
const CP_LONG: u8 = 5;
const CP_DOUBLE: u8 = 6;
const CP_CLASS: u8 = 7;
const CP_STRING: u8 = 8;
const CP_FIELD_REF: u8 = 9;
const CP_METHOD_REF: u8 = 10;
const CP_INTERFACE_METHOD_REF: u8 = 11;
const CP_NAME_AND_TYPE: u8 = 12;

/// Class access flags, re-exported for test readability.
pub mod flags {
    pub const ACC_PUBLIC: u16 = 0x0001;
    pub const ACC_STATIC: u16 = 0x0008;
    pub const ACC_FINAL: u16 = 0x0010;
    pub const ACC_SYNCHRONIZED: u16 = 0x0020;
    pub const ACC_NATIVE: u16 = 0x0100;
    pub const ACC_INTERFACE: u16 = 0x0200;
    pub const ACC_ABSTRACT: u16 = 0x0400;
}

enum PoolConst {
    Utf8(String),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class(u16),
    Str(u16),
    FieldRef(u16, u16),
    MethodRef(u16, u16),
    InterfaceMethodRef(u16, u16),
    NameAndType(u16, u16),
    Padding,
}

#[derive(Default)]
struct Pool {
    entries: Vec<PoolConst>,
    utf8: HashMap<String, u16>,
    classes: HashMap<String, u16>,
}

impl Pool {
    fn push(&mut self, entry: PoolConst) -> u16 {
        let wide = matches!(entry, PoolConst::Long(_) | PoolConst::Double(_));
        self.entries.push(entry);
        let index = self.entries.len() as u16;
        if wide {
            self.entries.push(PoolConst::Padding);
        }
        index
    }

    fn utf8(&mut self, text: &str) -> u16 {
        if let Some(&idx) = self.utf8.get(text) {
            return idx;
        }
        let idx = self.push(PoolConst::Utf8(text.to_string()));
        self.utf8.insert(text.to_string(), idx);
        idx
    }

    fn class(&mut self, name: &str) -> u16 {
        if let Some(&idx) = self.classes.get(name) {
            return idx;
        }
        let utf8 = self.utf8(name);
        let idx = self.push(PoolConst::Class(utf8));
        self.classes.insert(name.to_string(), idx);
        idx
    }

    fn name_and_type(&mut self, name: &str, desc: &str) -> u16 {
        let n = self.utf8(name);
        let d = self.utf8(desc);
        self.push(PoolConst::NameAndType(n, d))
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&((self.entries.len() as u16 + 1).to_be_bytes()));
        for entry in &self.entries {
            match entry {
                PoolConst::Utf8(text) => {
                    out.push(CP_UTF8);
                    out.extend_from_slice(&(text.len() as u16).to_be_bytes());
                    out.extend_from_slice(text.as_bytes());
                }
                PoolConst::Integer(v) => {
                    out.push(CP_INTEGER);
                    out.extend_from_slice(&v.to_be_bytes());
                }
                PoolConst::Float(v) => {
                    out.push(CP_FLOAT);
                    out.extend_from_slice(&v.to_bits().to_be_bytes());
                }
                PoolConst::Long(v) => {
                    out.push(CP_LONG);
                    out.extend_from_slice(&v.to_be_bytes());
                }
                PoolConst::Double(v) => {
                    out.push(CP_DOUBLE);
                    out.extend_from_slice(&v.to_bits().to_be_bytes());
                }
                PoolConst::Class(utf8) => {
                    out.push(CP_CLASS);
                    out.extend_from_slice(&utf8.to_be_bytes());
                }
                PoolConst::Str(utf8) => {
                    out.push(CP_STRING);
                    out.extend_from_slice(&utf8.to_be_bytes());
                }
                PoolConst::FieldRef(c, nt) => {
                    out.push(CP_FIELD_REF);
                    out.extend_from_slice(&c.to_be_bytes());
                    out.extend_from_slice(&nt.to_be_bytes());
                }
                PoolConst::MethodRef(c, nt) => {
                    out.push(CP_METHOD_REF);
                    out.extend_from_slice(&c.to_be_bytes());
                    out.extend_from_slice(&nt.to_be_bytes());
                }
                PoolConst::InterfaceMethodRef(c, nt) => {
                    out.push(CP_INTERFACE_METHOD_REF);
                    out.extend_from_slice(&c.to_be_bytes());
                    out.extend_from_slice(&nt.to_be_bytes());
                }
                PoolConst::NameAndType(n, d) => {
                    out.push(CP_NAME_AND_TYPE);
                    out.extend_from_slice(&n.to_be_bytes());
                    out.extend_from_slice(&d.to_be_bytes());
                }
                PoolConst::Padding => {}
            }
        }
    }
}

/// One exception-table row for [`ClassBuilder::method_with_exceptions`].
pub struct ExceptionRow {
    pub start: u16,
    pub end: u16,
    pub handler: u16,
    /// Caught class, `None` for catch-all.
    pub catch: Option<String>,
}

struct MemberDef {
    access: u16,
    name: u16,
    descriptor: u16,
    attributes: Vec<(u16, Vec<u8>)>,
}

/// Emits class-file bytes for synthetic test classes.
pub struct ClassBuilder {
    pool: Pool,
    access: u16,
    this_class: u16,
    super_class: u16,
    interfaces: Vec<u16>,
    fields: Vec<MemberDef>,
    methods: Vec<MemberDef>,
}

impl ClassBuilder {
    /// A class extending `super_name`; `None` builds the root class.
    pub fn new(name: &str, super_name: Option<&str>) -> ClassBuilder {
        let mut pool = Pool::default();
        let this_class = pool.class(name);
        let super_class = super_name.map(|s| pool.class(s)).unwrap_or(0);
        ClassBuilder {
            pool,
            access: flags::ACC_PUBLIC,
            this_class,
            super_class,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }

    /// Overrides the class access flags.
    pub fn access(&mut self, access: u16) -> &mut Self {
        self.access = access;
        self
    }

    /// Adds a directly implemented interface.
    pub fn implements(&mut self, name: &str) -> &mut Self {
        let idx = self.pool.class(name);
        self.interfaces.push(idx);
        self
    }

    /// Adds a field with no attributes.
    pub fn field(&mut self, access: u16, name: &str, descriptor: &str) -> &mut Self {
        let name = self.pool.utf8(name);
        let descriptor = self.pool.utf8(descriptor);
        self.fields.push(MemberDef {
            access,
            name,
            descriptor,
            attributes: Vec::new(),
        });
        self
    }

    /// Adds a static int field with a `ConstantValue` attribute.
    pub fn const_int_field(&mut self, name: &str, value: i32) -> &mut Self {
        let value_idx = self.pool.push(PoolConst::Integer(value));
        self.const_field(name, "I", value_idx)
    }

    /// Adds a static long field with a `ConstantValue` attribute.
    pub fn const_long_field(&mut self, name: &str, value: i64) -> &mut Self {
        let value_idx = self.pool.push(PoolConst::Long(value));
        self.const_field(name, "J", value_idx)
    }

    fn const_field(&mut self, name: &str, descriptor: &str, value_idx: u16) -> &mut Self {
        let attr_name = self.pool.utf8("ConstantValue");
        let name = self.pool.utf8(name);
        let descriptor = self.pool.utf8(descriptor);
        self.fields.push(MemberDef {
            access: flags::ACC_PUBLIC | flags::ACC_STATIC,
            name,
            descriptor,
            attributes: vec![(attr_name, value_idx.to_be_bytes().to_vec())],
        });
        self
    }

    /// Adds a method with a `Code` attribute and no exception table.
    pub fn method(
        &mut self,
        access: u16,
        name: &str,
        descriptor: &str,
        max_stack: u16,
        max_locals: u16,
        code: Vec<u8>,
    ) -> &mut Self {
        self.method_with_exceptions(access, name, descriptor, max_stack, max_locals, code, &[])
    }

    /// Adds a method with a `Code` attribute and an exception table.
    #[allow(clippy::too_many_arguments)]
    pub fn method_with_exceptions(
        &mut self,
        access: u16,
        name: &str,
        descriptor: &str,
        max_stack: u16,
        max_locals: u16,
        code: Vec<u8>,
        exceptions: &[ExceptionRow],
    ) -> &mut Self {
        let mut data = Vec::new();
        data.extend_from_slice(&max_stack.to_be_bytes());
        data.extend_from_slice(&max_locals.to_be_bytes());
        data.extend_from_slice(&(code.len() as u32).to_be_bytes());
        data.extend_from_slice(&code);
        data.extend_from_slice(&(exceptions.len() as u16).to_be_bytes());
        for row in exceptions {
            let catch_idx = row.catch.as_deref().map(|c| self.pool.class(c)).unwrap_or(0);
            data.extend_from_slice(&row.start.to_be_bytes());
            data.extend_from_slice(&row.end.to_be_bytes());
            data.extend_from_slice(&row.handler.to_be_bytes());
            data.extend_from_slice(&catch_idx.to_be_bytes());
        }
        data.extend_from_slice(&0u16.to_be_bytes());

        let attr_name = self.pool.utf8("Code");
        let name = self.pool.utf8(name);
        let descriptor = self.pool.utf8(descriptor);
        self.methods.push(MemberDef {
            access,
            name,
            descriptor,
            attributes: vec![(attr_name, data)],
        });
        self
    }

    /// Adds a bodyless (abstract or native) method.
    pub fn bodyless_method(&mut self, access: u16, name: &str, descriptor: &str) -> &mut Self {
        let name = self.pool.utf8(name);
        let descriptor = self.pool.utf8(descriptor);
        self.methods.push(MemberDef {
            access,
            name,
            descriptor,
            attributes: Vec::new(),
        });
        self
    }

    /// Constant-pool index of a method reference, for call bytecode.
    pub fn method_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        let c = self.pool.class(class);
        let nt = self.pool.name_and_type(name, descriptor);
        self.pool.push(PoolConst::MethodRef(c, nt))
    }

    /// Constant-pool index of an interface-method reference.
    pub fn interface_method_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        let c = self.pool.class(class);
        let nt = self.pool.name_and_type(name, descriptor);
        self.pool.push(PoolConst::InterfaceMethodRef(c, nt))
    }

    /// Constant-pool index of a field reference.
    pub fn field_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        let c = self.pool.class(class);
        let nt = self.pool.name_and_type(name, descriptor);
        self.pool.push(PoolConst::FieldRef(c, nt))
    }

    /// Constant-pool index of a class reference.
    pub fn class_ref(&mut self, name: &str) -> u16 {
        self.pool.class(name)
    }

    /// Constant-pool index of an integer constant.
    pub fn int_const(&mut self, value: i32) -> u16 {
        self.pool.push(PoolConst::Integer(value))
    }

    /// Constant-pool index of a string constant.
    pub fn string_const(&mut self, text: &str) -> u16 {
        let utf8 = self.pool.utf8(text);
        self.pool.push(PoolConst::Str(utf8))
    }

    /// Serializes the class file.
    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&0xCAFE_BABEu32.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes()); // minor
        out.extend_from_slice(&52u16.to_be_bytes()); // major (Java 8)
        self.pool.serialize(&mut out);
        out.extend_from_slice(&self.access.to_be_bytes());
        out.extend_from_slice(&self.this_class.to_be_bytes());
        out.extend_from_slice(&self.super_class.to_be_bytes());
        out.extend_from_slice(&(self.interfaces.len() as u16).to_be_bytes());
        for idx in &self.interfaces {
            out.extend_from_slice(&idx.to_be_bytes());
        }
        for members in [&self.fields, &self.methods] {
            out.extend_from_slice(&(members.len() as u16).to_be_bytes());
            for member in members.iter() {
                out.extend_from_slice(&member.access.to_be_bytes());
                out.extend_from_slice(&member.name.to_be_bytes());
                out.extend_from_slice(&member.descriptor.to_be_bytes());
                out.extend_from_slice(&(member.attributes.len() as u16).to_be_bytes());
                for (name, data) in &member.attributes {
                    out.extend_from_slice(&name.to_be_bytes());
                    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
                    out.extend_from_slice(data);
                }
            }
        }
        out.extend_from_slice(&0u16.to_be_bytes()); // class attributes
        out
    }
}

/// Class bytes of a minimal root class.
pub fn object_class_bytes() -> Vec<u8> {
    ClassBuilder::new("java/lang/Object", None).build()
}

// ---------------------------------------------------------------------
// Byte source
// ---------------------------------------------------------------------

/// In-memory class-byte source.
pub struct MapSource {
    map: Mutex<HashMap<String, Vec<u8>>>,
}

impl MapSource {
    /// A source over the given (name, bytes) pairs. The root class is
    /// added automatically when absent.
    pub fn new(classes: Vec<(&str, Vec<u8>)>) -> Arc<MapSource> {
        let mut map: HashMap<String, Vec<u8>> = classes
            .into_iter()
            .map(|(name, bytes)| (name.to_string(), bytes))
            .collect();
        map.entry("java/lang/Object".to_string())
            .or_insert_with(object_class_bytes);
        Arc::new(MapSource {
            map: Mutex::new(map),
        })
    }
}

impl ClassBytesSource for MapSource {
    fn lookup(&self, name: &Name) -> Option<Vec<u8>> {
        self.map.lock().get(name.as_str()).cloned()
    }
}

// ---------------------------------------------------------------------
// Mock backend: a graph evaluator
// ---------------------------------------------------------------------

/// A backend that retains translated graphs and evaluates them.
pub struct MockBackend {
    graphs: Mutex<HashMap<u64, Arc<MethodGraph>>>,
    next_entry: AtomicU64,
    linker: Mutex<Weak<linker::Linker>>,
    class_objects: Mutex<HashMap<u32, ObjRef>>,
}

impl MockBackend {
    pub fn new() -> Arc<MockBackend> {
        Arc::new(MockBackend {
            graphs: Mutex::new(HashMap::new()),
            next_entry: AtomicU64::new(1),
            linker: Mutex::new(Weak::new()),
            class_objects: Mutex::new(HashMap::new()),
        })
    }

    /// Wires the resolver in after [`linker::Linker::install`].
    pub fn set_linker(&self, linker: &Arc<linker::Linker>) {
        *self.linker.lock() = Arc::downgrade(linker);
    }

    /// Number of graphs compiled so far.
    pub fn compiled_count(&self) -> usize {
        self.graphs.lock().len()
    }

    /// The retained graph behind an entry (test inspection).
    pub fn graph_of(&self, entry: EntryPoint) -> Option<Arc<MethodGraph>> {
        self.graphs.lock().get(&entry.as_raw()).cloned()
    }

    fn linker(&self) -> VmResult<Arc<linker::Linker>> {
        self.linker
            .lock()
            .upgrade()
            .ok_or_else(|| VmError::internal("mock backend has no linker"))
    }

    fn class_object(&self, vm: &Arc<Vm>, ty: &Type) -> VmResult<ObjRef> {
        let id = ty.vt()?.id();
        if let Some(existing) = self.class_objects.lock().get(&id) {
            return Ok(existing.clone());
        }
        let object = Object::new_instance_uninit(vm, &vm.object_class()?)?;
        Ok(self
            .class_objects
            .lock()
            .entry(id)
            .or_insert(object)
            .clone())
    }

    fn run(&self, vm: &Arc<Vm>, graph: &MethodGraph, args: &[JavaValue]) -> VmResult<JavaValue> {
        let mut locals: Vec<Option<JavaValue>> = vec![None; graph.max_locals];
        let mut slot = 0usize;
        for arg in args {
            let wide = arg.kind().is_wide();
            locals[slot] = Some(arg.clone());
            slot += if wide { 2 } else { 1 };
        }

        let mut stack: Vec<JavaValue> = Vec::new();
        let mut pending: Option<ObjRef> = None;
        let mut block = graph.block(graph.entry);

        loop {
            for op in &block.ops {
                self.step(vm, op, &mut stack, &mut locals, &mut pending)?;
            }

            match block.terminator.as_ref().expect("sealed block") {
                Terminator::Goto(target) => block = graph.block(*target),
                Terminator::Branch {
                    then_block,
                    else_block,
                } => {
                    let cond = pop_int(&mut stack)?;
                    block = graph.block(if cond != 0 { *then_block } else { *else_block });
                }
                Terminator::Switch { default, cases } => {
                    let key = pop_int(&mut stack)?;
                    let target = cases
                        .iter()
                        .find(|(k, _)| *k == key)
                        .map(|(_, b)| *b)
                        .unwrap_or(*default);
                    block = graph.block(target);
                }
                Terminator::Return(Some(_)) => {
                    return stack
                        .pop()
                        .ok_or_else(|| VmError::internal("return from empty stack"));
                }
                Terminator::Return(None) => return Ok(JavaValue::Reference(None)),
                Terminator::Throw => {
                    let exc = pop_ref(&mut stack)?
                        .ok_or_else(|| VmError::internal("throw of null"))?;
                    let Some(handler) = block.handler else {
                        return Err(VmError::internal("uncaught exception in mock backend"));
                    };
                    stack.clear();
                    pending = Some(exc);
                    block = graph.block(handler);
                }
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    fn step(
        &self,
        vm: &Arc<Vm>,
        op: &Op,
        stack: &mut Vec<JavaValue>,
        locals: &mut [Option<JavaValue>],
        pending: &mut Option<ObjRef>,
    ) -> VmResult<()> {
        match op {
            Op::IntConst(v) => stack.push(JavaValue::Int(*v)),
            Op::LongConst(v) => stack.push(JavaValue::Long(*v)),
            Op::FloatConst(v) => stack.push(JavaValue::Float(*v)),
            Op::DoubleConst(v) => stack.push(JavaValue::Double(*v)),
            Op::NullConst => stack.push(JavaValue::Reference(None)),
            Op::StringConst(text) => {
                stack.push(JavaValue::Reference(Some(vm.string_literal(text)?)));
            }
            Op::ClassConst(ty) => {
                stack.push(JavaValue::Reference(Some(self.class_object(vm, ty)?)));
            }

            Op::Load { index, .. } => {
                let value = locals[*index as usize]
                    .clone()
                    .ok_or_else(|| VmError::internal("load of undefined local"))?;
                stack.push(value);
            }
            Op::Store { index, .. } => {
                let value = pop_any(stack)?;
                locals[*index as usize] = Some(value);
            }
            Op::Iinc { index, amount } => {
                let current = match &locals[*index as usize] {
                    Some(JavaValue::Int(v)) => *v,
                    _ => return Err(VmError::internal("iinc of non-int local")),
                };
                locals[*index as usize] =
                    Some(JavaValue::Int(current.wrapping_add(*amount as i32)));
            }

            Op::Pop => {
                pop_any(stack)?;
            }
            Op::Pop2 => {
                let top = pop_any(stack)?;
                if !top.kind().is_wide() {
                    pop_any(stack)?;
                }
            }
            Op::Dup => {
                let top = peek(stack)?.clone();
                stack.push(top);
            }
            Op::DupX1 => {
                let a = pop_any(stack)?;
                let b = pop_any(stack)?;
                stack.push(a.clone());
                stack.push(b);
                stack.push(a);
            }
            Op::DupX2 => {
                let a = pop_any(stack)?;
                let b = pop_any(stack)?;
                if b.kind().is_wide() {
                    stack.push(a.clone());
                    stack.push(b);
                    stack.push(a);
                } else {
                    let c = pop_any(stack)?;
                    stack.push(a.clone());
                    stack.push(c);
                    stack.push(b);
                    stack.push(a);
                }
            }
            Op::Dup2 => {
                let a = pop_any(stack)?;
                if a.kind().is_wide() {
                    stack.push(a.clone());
                    stack.push(a);
                } else {
                    let b = pop_any(stack)?;
                    stack.push(b.clone());
                    stack.push(a.clone());
                    stack.push(b);
                    stack.push(a);
                }
            }
            Op::Dup2X1 | Op::Dup2X2 => {
                return Err(VmError::internal("dup form not supported by mock backend"))
            }
            Op::Swap => {
                let a = pop_any(stack)?;
                let b = pop_any(stack)?;
                stack.push(a);
                stack.push(b);
            }

            Op::Arith { kind, op } => {
                let result = match kind {
                    ValueKind::Int => {
                        let b = pop_int(stack)?;
                        let a = pop_int(stack)?;
                        JavaValue::Int(int_arith(a, b, *op)?)
                    }
                    ValueKind::Long => {
                        // The shift family takes an int shift amount.
                        let b = match pop_any(stack)? {
                            JavaValue::Long(v) => v,
                            JavaValue::Int(v) => v as i64,
                            other => {
                                return Err(VmError::internal(format!(
                                    "bad arith operand {:?}",
                                    other
                                )))
                            }
                        };
                        let a = pop_long(stack)?;
                        JavaValue::Long(long_arith(a, b, *op)?)
                    }
                    ValueKind::Float => {
                        let b = pop_float(stack)?;
                        let a = pop_float(stack)?;
                        JavaValue::Float(float_arith(a, b, *op)?)
                    }
                    ValueKind::Double => {
                        let b = pop_double(stack)?;
                        let a = pop_double(stack)?;
                        JavaValue::Double(double_arith(a, b, *op)?)
                    }
                    ValueKind::Reference => {
                        return Err(VmError::internal("arith on references"))
                    }
                };
                stack.push(result);
            }
            Op::Neg { kind } => {
                let result = match kind {
                    ValueKind::Int => JavaValue::Int(pop_int(stack)?.wrapping_neg()),
                    ValueKind::Long => JavaValue::Long(pop_long(stack)?.wrapping_neg()),
                    ValueKind::Float => JavaValue::Float(-pop_float(stack)?),
                    ValueKind::Double => JavaValue::Double(-pop_double(stack)?),
                    ValueKind::Reference => {
                        return Err(VmError::internal("neg of a reference"))
                    }
                };
                stack.push(result);
            }
            Op::Convert { to, .. } => {
                let value = pop_any(stack)?;
                stack.push(convert(value, *to)?);
            }

            Op::IntCompare(cond) => {
                let b = pop_int(stack)?;
                let a = pop_int(stack)?;
                stack.push(JavaValue::Int(compare_ints(a, b, *cond) as i32));
            }
            Op::RefCompare(cond) => {
                let b = pop_ref(stack)?;
                let a = pop_ref(stack)?;
                let same = match (&a, &b) {
                    (None, None) => true,
                    (Some(x), Some(y)) => x.same_as(y),
                    _ => false,
                };
                let hit = match cond {
                    Cond::Eq => same,
                    Cond::Ne => !same,
                    _ => return Err(VmError::internal("bad reference comparison")),
                };
                stack.push(JavaValue::Int(hit as i32));
            }
            Op::LongCompare => {
                let b = pop_long(stack)?;
                let a = pop_long(stack)?;
                stack.push(JavaValue::Int(match a.cmp(&b) {
                    std::cmp::Ordering::Less => -1,
                    std::cmp::Ordering::Equal => 0,
                    std::cmp::Ordering::Greater => 1,
                }));
            }
            Op::FloatCompare { greater_on_nan } => {
                let b = pop_float(stack)?;
                let a = pop_float(stack)?;
                stack.push(JavaValue::Int(fp_compare(
                    a as f64,
                    b as f64,
                    *greater_on_nan,
                )));
            }
            Op::DoubleCompare { greater_on_nan } => {
                let b = pop_double(stack)?;
                let a = pop_double(stack)?;
                stack.push(JavaValue::Int(fp_compare(a, b, *greater_on_nan)));
            }
            Op::RefIsNull => {
                let r = pop_ref(stack)?;
                stack.push(JavaValue::Int(r.is_none() as i32));
            }

            Op::GetStatic(field) => {
                field.declaring.initialise()?;
                let value = field
                    .declaring
                    .statics()?
                    .load(field.field.desc().value_kind(), field.field.offset());
                stack.push(value);
            }
            Op::PutStatic(field) => {
                field.declaring.initialise()?;
                let value = pop_any(stack)?;
                field
                    .declaring
                    .statics()?
                    .store(field.field.offset(), value);
            }
            Op::GetField(field) => {
                let receiver = pop_obj(stack)?;
                let value = receiver
                    .data()
                    .load(field.field.desc().value_kind(), field.field.offset());
                stack.push(value);
            }
            Op::PutField(field) => {
                let value = pop_any(stack)?;
                let receiver = pop_obj(stack)?;
                receiver.data().store(field.field.offset(), value);
            }

            Op::Invoke { kind, method } => {
                let linker = self.linker()?;
                let param_count = method.desc().params.len();
                let has_receiver = *kind != InvokeKind::Static;
                let total = param_count + has_receiver as usize;
                let mut args = Vec::with_capacity(total);
                for _ in 0..total {
                    args.push(pop_any(stack)?);
                }
                args.reverse();

                let entry = match kind {
                    InvokeKind::Static => linker.resolve_static(vm, method)?,
                    InvokeKind::Special => vm.compiler()?.ensure_compiled(vm, method)?,
                    InvokeKind::Virtual => {
                        let receiver = as_obj(&args[0])?;
                        linker.dispatch_virtual(vm, method, &receiver)?
                    }
                    InvokeKind::Interface => {
                        let receiver = as_obj(&args[0])?;
                        linker.dispatch_interface(vm, method, &receiver)?
                    }
                };
                let result = self.invoke(vm, entry, &args)?;
                if method.desc().ret.value_kind_opt().is_some() {
                    stack.push(result);
                }
            }

            Op::New(class) => {
                let object = Object::new_instance(vm, class)?;
                stack.push(JavaValue::Reference(Some(object)));
            }
            Op::NewArray(class) => {
                let length = pop_int(stack)?;
                if length < 0 {
                    return Err(VmError::internal("negative array length"));
                }
                let object = Object::new_array(vm, class, length as u32)?;
                stack.push(JavaValue::Reference(Some(object)));
            }
            Op::MultiNewArray { .. } => {
                return Err(VmError::internal(
                    "multianewarray not supported by mock backend",
                ))
            }
            Op::ArrayLength => {
                let array = pop_obj(stack)?;
                stack.push(JavaValue::Int(array.array_length()? as i32));
            }
            Op::ArrayLoad(elem) => {
                let index = pop_int(stack)?;
                let array = pop_obj(stack)?;
                check_bounds(&array, index)?;
                let offset = (index as usize) << elem_log(*elem);
                stack.push(array_get(&array, *elem, offset));
            }
            Op::ArrayStore(elem) => {
                let value = pop_any(stack)?;
                let index = pop_int(stack)?;
                let array = pop_obj(stack)?;
                check_bounds(&array, index)?;
                let offset = (index as usize) << elem_log(*elem);
                array_set(&array, *elem, offset, value)?;
            }

            Op::InstanceOf(ty) => {
                let target = ty.vt()?;
                let r = pop_ref(stack)?;
                let hit = match r {
                    None => false,
                    Some(obj) => obj.vt().is_assignable_to(&target),
                };
                stack.push(JavaValue::Int(hit as i32));
            }
            Op::CheckCast(ty) => {
                let target = ty.vt()?;
                let top = peek(stack)?.clone();
                if let JavaValue::Reference(Some(obj)) = top {
                    if !obj.vt().is_assignable_to(&target) {
                        return Err(VmError::internal("class cast failure"));
                    }
                }
            }

            Op::MonitorEnter => {
                let receiver = pop_obj(stack)?;
                receiver.lock(vm.locks());
            }
            Op::MonitorExit => {
                let receiver = pop_obj(stack)?;
                receiver.unlock(vm.locks())?;
            }

            Op::CaughtException => {
                let exc = pending
                    .take()
                    .ok_or_else(|| VmError::internal("landing pad with no exception"))?;
                stack.push(JavaValue::Reference(Some(exc)));
            }
        }
        Ok(())
    }
}

impl CodeBackend for MockBackend {
    fn compile(&self, _vm: &Arc<Vm>, graph: MethodGraph) -> VmResult<EntryPoint> {
        let raw = self.next_entry.fetch_add(1, Ordering::Relaxed);
        let entry = EntryPoint::from_raw(raw).expect("nonzero entry");
        self.graphs.lock().insert(raw, Arc::new(graph));
        Ok(entry)
    }

    fn invoke(&self, vm: &Arc<Vm>, entry: EntryPoint, args: &[JavaValue]) -> VmResult<JavaValue> {
        let graph = self
            .graphs
            .lock()
            .get(&entry.as_raw())
            .cloned()
            .ok_or_else(|| VmError::internal("invoking an unknown entry"))?;
        self.run(vm, &graph, args)
    }
}

// ---------------------------------------------------------------------
// Value helpers
// ---------------------------------------------------------------------

fn pop_any(stack: &mut Vec<JavaValue>) -> VmResult<JavaValue> {
    stack
        .pop()
        .ok_or_else(|| VmError::internal("operand stack underflow in mock backend"))
}

fn peek(stack: &[JavaValue]) -> VmResult<&JavaValue> {
    stack
        .last()
        .ok_or_else(|| VmError::internal("operand stack underflow in mock backend"))
}

fn pop_int(stack: &mut Vec<JavaValue>) -> VmResult<i32> {
    match pop_any(stack)? {
        JavaValue::Int(v) => Ok(v),
        other => Err(VmError::internal(format!("expected int, got {:?}", other))),
    }
}

fn pop_long(stack: &mut Vec<JavaValue>) -> VmResult<i64> {
    match pop_any(stack)? {
        JavaValue::Long(v) => Ok(v),
        other => Err(VmError::internal(format!("expected long, got {:?}", other))),
    }
}

fn pop_float(stack: &mut Vec<JavaValue>) -> VmResult<f32> {
    match pop_any(stack)? {
        JavaValue::Float(v) => Ok(v),
        other => Err(VmError::internal(format!("expected float, got {:?}", other))),
    }
}

fn pop_double(stack: &mut Vec<JavaValue>) -> VmResult<f64> {
    match pop_any(stack)? {
        JavaValue::Double(v) => Ok(v),
        other => Err(VmError::internal(format!(
            "expected double, got {:?}",
            other
        ))),
    }
}

fn pop_ref(stack: &mut Vec<JavaValue>) -> VmResult<Option<ObjRef>> {
    match pop_any(stack)? {
        JavaValue::Reference(r) => Ok(r),
        other => Err(VmError::internal(format!(
            "expected reference, got {:?}",
            other
        ))),
    }
}

fn pop_obj(stack: &mut Vec<JavaValue>) -> VmResult<ObjRef> {
    pop_ref(stack)?.ok_or_else(|| VmError::internal("null dereference in mock backend"))
}

fn as_obj(value: &JavaValue) -> VmResult<ObjRef> {
    match value {
        JavaValue::Reference(Some(r)) => Ok(r.clone()),
        JavaValue::Reference(None) => Err(VmError::internal("null receiver in mock backend")),
        other => Err(VmError::internal(format!(
            "expected reference, got {:?}",
            other
        ))),
    }
}

fn int_arith(a: i32, b: i32, op: ArithOp) -> VmResult<i32> {
    Ok(match op {
        ArithOp::Add => a.wrapping_add(b),
        ArithOp::Sub => a.wrapping_sub(b),
        ArithOp::Mul => a.wrapping_mul(b),
        ArithOp::Div => {
            if b == 0 {
                return Err(VmError::internal("division by zero"));
            }
            a.wrapping_div(b)
        }
        ArithOp::Rem => {
            if b == 0 {
                return Err(VmError::internal("division by zero"));
            }
            a.wrapping_rem(b)
        }
        ArithOp::And => a & b,
        ArithOp::Or => a | b,
        ArithOp::Xor => a ^ b,
        ArithOp::Shl => a.wrapping_shl(b as u32 & 31),
        ArithOp::Shr => a.wrapping_shr(b as u32 & 31),
        ArithOp::Ushr => ((a as u32).wrapping_shr(b as u32 & 31)) as i32,
    })
}

fn long_arith(a: i64, b: i64, op: ArithOp) -> VmResult<i64> {
    Ok(match op {
        ArithOp::Add => a.wrapping_add(b),
        ArithOp::Sub => a.wrapping_sub(b),
        ArithOp::Mul => a.wrapping_mul(b),
        ArithOp::Div => {
            if b == 0 {
                return Err(VmError::internal("division by zero"));
            }
            a.wrapping_div(b)
        }
        ArithOp::Rem => {
            if b == 0 {
                return Err(VmError::internal("division by zero"));
            }
            a.wrapping_rem(b)
        }
        ArithOp::And => a & b,
        ArithOp::Or => a | b,
        ArithOp::Xor => a ^ b,
        ArithOp::Shl => a.wrapping_shl(b as u32 & 63),
        ArithOp::Shr => a.wrapping_shr(b as u32 & 63),
        ArithOp::Ushr => ((a as u64).wrapping_shr(b as u32 & 63)) as i64,
    })
}

fn float_arith(a: f32, b: f32, op: ArithOp) -> VmResult<f32> {
    Ok(match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => a / b,
        ArithOp::Rem => a % b,
        _ => return Err(VmError::internal("bitwise op on float")),
    })
}

fn double_arith(a: f64, b: f64, op: ArithOp) -> VmResult<f64> {
    Ok(match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => a / b,
        ArithOp::Rem => a % b,
        _ => return Err(VmError::internal("bitwise op on double")),
    })
}

fn compare_ints(a: i32, b: i32, cond: Cond) -> bool {
    match cond {
        Cond::Eq => a == b,
        Cond::Ne => a != b,
        Cond::Lt => a < b,
        Cond::Ge => a >= b,
        Cond::Gt => a > b,
        Cond::Le => a <= b,
    }
}

fn fp_compare(a: f64, b: f64, greater_on_nan: bool) -> i32 {
    if a.is_nan() || b.is_nan() {
        return if greater_on_nan { 1 } else { -1 };
    }
    if a < b {
        -1
    } else if a > b {
        1
    } else {
        0
    }
}

fn convert(value: JavaValue, to: ConvTarget) -> VmResult<JavaValue> {
    let as_double = match value {
        JavaValue::Int(v) => v as f64,
        JavaValue::Long(v) => v as f64,
        JavaValue::Float(v) => v as f64,
        JavaValue::Double(v) => v,
        JavaValue::Reference(_) => {
            return Err(VmError::internal("conversion of a reference"))
        }
    };
    Ok(match to {
        ConvTarget::Int => JavaValue::Int(as_double as i32),
        ConvTarget::Long => JavaValue::Long(as_double as i64),
        ConvTarget::Float => JavaValue::Float(as_double as f32),
        ConvTarget::Double => JavaValue::Double(as_double),
        ConvTarget::Byte => JavaValue::Int(as_double as i32 as i8 as i32),
        ConvTarget::Char => JavaValue::Int(as_double as i32 as u16 as i32),
        ConvTarget::Short => JavaValue::Int(as_double as i32 as i16 as i32),
    })
}

fn elem_log(elem: ArrayElem) -> u32 {
    match elem {
        ArrayElem::Byte => 0,
        ArrayElem::Char | ArrayElem::Short => 1,
        ArrayElem::Int | ArrayElem::Float => 2,
        ArrayElem::Long | ArrayElem::Double | ArrayElem::Reference => 3,
    }
}

fn check_bounds(array: &ObjRef, index: i32) -> VmResult<()> {
    let length = array.array_length()?;
    if index < 0 || index as u32 >= length {
        return Err(VmError::internal("array index out of bounds"));
    }
    Ok(())
}

fn array_get(array: &ObjRef, elem: ArrayElem, offset: usize) -> JavaValue {
    let data = array.data();
    match elem {
        ArrayElem::Byte => JavaValue::Int(data.get_i8(offset) as i32),
        ArrayElem::Char => JavaValue::Int(data.get_i16(offset) as u16 as i32),
        ArrayElem::Short => JavaValue::Int(data.get_i16(offset) as i32),
        ArrayElem::Int => JavaValue::Int(data.get_i32(offset)),
        ArrayElem::Long => JavaValue::Long(data.get_i64(offset)),
        ArrayElem::Float => JavaValue::Float(data.get_f32(offset)),
        ArrayElem::Double => JavaValue::Double(data.get_f64(offset)),
        ArrayElem::Reference => JavaValue::Reference(data.get_ref(offset)),
    }
}

fn array_set(array: &ObjRef, elem: ArrayElem, offset: usize, value: JavaValue) -> VmResult<()> {
    let data = array.data();
    match (elem, value) {
        (ArrayElem::Byte, JavaValue::Int(v)) => data.set_i8(offset, v as i8),
        (ArrayElem::Char, JavaValue::Int(v)) => data.set_i16(offset, v as u16 as i16),
        (ArrayElem::Short, JavaValue::Int(v)) => data.set_i16(offset, v as i16),
        (ArrayElem::Int, JavaValue::Int(v)) => data.set_i32(offset, v),
        (ArrayElem::Long, JavaValue::Long(v)) => data.set_i64(offset, v),
        (ArrayElem::Float, JavaValue::Float(v)) => data.set_f32(offset, v),
        (ArrayElem::Double, JavaValue::Double(v)) => data.set_f64(offset, v),
        (ArrayElem::Reference, JavaValue::Reference(r)) => data.set_ref(offset, r),
        (elem, value) => {
            return Err(VmError::internal(format!(
                "array store mismatch: {:?} {:?}",
                elem, value
            )))
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------

/// Installs a tracing subscriber honoring `RUST_LOG`, once per
/// process. Call from a test to see engine debug events.
pub fn init_tracing() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A booted VM with a mock backend and the linker installed.
pub struct TestVm {
    pub vm: Arc<Vm>,
    pub loader: Arc<ClassLoader>,
    pub linker: Arc<linker::Linker>,
    pub backend: Arc<MockBackend>,
}

impl TestVm {
    /// Boots a VM over the given classes (the root class is implied).
    pub fn boot(classes: Vec<(&str, Vec<u8>)>) -> TestVm {
        Self::boot_with_native(classes, None)
    }

    /// Boots a VM with a native bridge attached.
    pub fn boot_with_native(
        classes: Vec<(&str, Vec<u8>)>,
        native: Option<Arc<dyn linker::NativeBridge>>,
    ) -> TestVm {
        let vm = Vm::new(VmOptions::default());
        let source = MapSource::new(classes);
        let loader = vm.bootstrap(source).expect("bootstrap");
        let backend = MockBackend::new();
        let link = linker::Linker::install(&vm, backend.clone(), native).expect("install linker");
        backend.set_linker(&link);
        TestVm {
            vm,
            loader,
            linker: link,
            backend,
        }
    }

    /// Loads and resolves a class by name.
    pub fn class(&self, name: &str) -> Arc<type_system::Class> {
        let name = self.vm.names().get(name);
        let class = self.loader.load_class(&name).expect("load class");
        class.resolve().expect("resolve class");
        class
    }

    /// The interned name of a string.
    pub fn name(&self, text: &str) -> Name {
        self.vm.names().get(text)
    }

    /// Calls a static method by name with the given arguments.
    pub fn call_static(
        &self,
        class: &str,
        method: &str,
        descriptor: &str,
        args: &[JavaValue],
    ) -> VmResult<JavaValue> {
        let class = self.class(class);
        let target = class
            .find_static_method(&self.name(method), &self.name(descriptor))?
            .expect("static method");
        let entry = self.linker.resolve_static(&self.vm, &target)?;
        self.backend.invoke(&self.vm, entry, args)
    }

    /// Calls a virtual method on a receiver through the dispatch
    /// machinery, exactly as a compiled call site would.
    pub fn call_virtual(
        &self,
        method: &Arc<type_system::Method>,
        receiver: &ObjRef,
        args: &[JavaValue],
    ) -> VmResult<JavaValue> {
        let entry = self.linker.dispatch_virtual(&self.vm, method, receiver)?;
        let mut all = vec![JavaValue::Reference(Some(receiver.clone()))];
        all.extend_from_slice(args);
        self.backend.invoke(&self.vm, entry, &all)
    }

    /// Calls an interface method on a receiver through the interface
    /// method table.
    pub fn call_interface(
        &self,
        method: &Arc<type_system::Method>,
        receiver: &ObjRef,
        args: &[JavaValue],
    ) -> VmResult<JavaValue> {
        let entry = self.linker.dispatch_interface(&self.vm, method, receiver)?;
        let mut all = vec![JavaValue::Reference(Some(receiver.clone()))];
        all.extend_from_slice(args);
        self.backend.invoke(&self.vm, entry, &all)
    }
}
