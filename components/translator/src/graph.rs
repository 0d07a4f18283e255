//! The basic-block graph handed to the code backend.
//!
//! Operations form a typed stack machine: every block declares the
//! operand-stack shape at its entry, every op's stack effect is fixed
//! by its variant, and control transfers only at block terminators.
//! A block's `handler` edge names the landing pad that receives any
//! exception its ops raise.

use core_types::{EntryPoint, Name, ValueKind, VmResult};
use std::sync::Arc;
use type_system::{ArrayClass, Class, FieldRef, JavaValue, Method, Type, Vm};

/// Index of a basic block within its [`MethodGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

/// Array element widths, for array accesses and allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayElem {
    /// 8-bit (byte, boolean).
    Byte,
    /// 16-bit unsigned.
    Char,
    /// 16-bit signed.
    Short,
    /// 32-bit integer.
    Int,
    /// 64-bit integer.
    Long,
    /// 32-bit float.
    Float,
    /// 64-bit float.
    Double,
    /// Object reference.
    Reference,
}

impl ArrayElem {
    /// The operand-stack kind elements of this width load as.
    pub fn value_kind(self) -> ValueKind {
        match self {
            ArrayElem::Byte | ArrayElem::Char | ArrayElem::Short | ArrayElem::Int => ValueKind::Int,
            ArrayElem::Long => ValueKind::Long,
            ArrayElem::Float => ValueKind::Float,
            ArrayElem::Double => ValueKind::Double,
            ArrayElem::Reference => ValueKind::Reference,
        }
    }
}

/// Binary arithmetic and bitwise operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    /// Addition.
    Add,
    /// Subtraction.
    Sub,
    /// Multiplication.
    Mul,
    /// Division.
    Div,
    /// Remainder.
    Rem,
    /// Bitwise and.
    And,
    /// Bitwise or.
    Or,
    /// Bitwise xor.
    Xor,
    /// Shift left (shift amount is always int).
    Shl,
    /// Arithmetic shift right.
    Shr,
    /// Logical shift right.
    Ushr,
}

/// Integer and reference comparison conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Less than.
    Lt,
    /// Greater or equal.
    Ge,
    /// Greater than.
    Gt,
    /// Less or equal.
    Le,
}

/// Narrowing targets of the conversion family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvTarget {
    /// To 32-bit int.
    Int,
    /// To 64-bit long.
    Long,
    /// To float.
    Float,
    /// To double.
    Double,
    /// To int through a signed 8-bit truncation.
    Byte,
    /// To int through an unsigned 16-bit truncation.
    Char,
    /// To int through a signed 16-bit truncation.
    Short,
}

impl ConvTarget {
    /// The operand-stack kind the conversion produces.
    pub fn value_kind(self) -> ValueKind {
        match self {
            ConvTarget::Int | ConvTarget::Byte | ConvTarget::Char | ConvTarget::Short => {
                ValueKind::Int
            }
            ConvTarget::Long => ValueKind::Long,
            ConvTarget::Float => ValueKind::Float,
            ConvTarget::Double => ValueKind::Double,
        }
    }
}

/// The four invocation flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeKind {
    /// Static call, no receiver.
    Static,
    /// Receiver-polymorphic call through the virtual table.
    Virtual,
    /// Exact call (constructors, super calls, private methods).
    Special,
    /// Call through the interface method table.
    Interface,
}

/// One typed stack-machine operation.
#[derive(Debug, Clone)]
pub enum Op {
    /// Push an int constant.
    IntConst(i32),
    /// Push a long constant.
    LongConst(i64),
    /// Push a float constant.
    FloatConst(f32),
    /// Push a double constant.
    DoubleConst(f64),
    /// Push `null`.
    NullConst,
    /// Push the interned string object for a literal.
    StringConst(Name),
    /// Push the language-visible class object of a type.
    ClassConst(Type),
    /// Push a local-variable slot.
    Load {
        /// Slot kind.
        kind: ValueKind,
        /// Slot index.
        index: u16,
    },
    /// Pop into a local-variable slot.
    Store {
        /// Slot kind.
        kind: ValueKind,
        /// Slot index.
        index: u16,
    },
    /// Drop the top category-1 value.
    Pop,
    /// Drop one category-2 or two category-1 values.
    Pop2,
    /// Duplicate the top value.
    Dup,
    /// Duplicate the top value under the next one.
    DupX1,
    /// Duplicate the top value under the next two slots.
    DupX2,
    /// Duplicate the top slot pair.
    Dup2,
    /// Duplicate the top slot pair under one slot.
    Dup2X1,
    /// Duplicate the top slot pair under two slots.
    Dup2X2,
    /// Swap the two top category-1 values.
    Swap,
    /// Binary arithmetic on two operands of `kind`.
    Arith {
        /// Operand kind.
        kind: ValueKind,
        /// Operator.
        op: ArithOp,
    },
    /// Negate the top value of `kind`.
    Neg {
        /// Operand kind.
        kind: ValueKind,
    },
    /// Numeric conversion.
    Convert {
        /// Source kind.
        from: ValueKind,
        /// Target.
        to: ConvTarget,
    },
    /// Pop two ints, push `a cond b` as 0/1.
    IntCompare(Cond),
    /// Pop two references, push identity `a cond b` as 0/1 (Eq/Ne only).
    RefCompare(Cond),
    /// Pop two longs, push -1/0/1.
    LongCompare,
    /// Pop two floats, push -1/0/1; NaN yields +1 or -1 per flavor.
    FloatCompare {
        /// `fcmpg` pushes +1 on NaN, `fcmpl` pushes -1.
        greater_on_nan: bool,
    },
    /// Pop two doubles, push -1/0/1.
    DoubleCompare {
        /// `dcmpg` pushes +1 on NaN, `dcmpl` pushes -1.
        greater_on_nan: bool,
    },
    /// Pop a reference, push 1 if null else 0.
    RefIsNull,
    /// Increment a local int slot in place.
    Iinc {
        /// Slot index.
        index: u16,
        /// Signed increment.
        amount: i16,
    },
    /// Pop a receiver, push a field value.
    GetField(FieldRef),
    /// Pop a value and a receiver, store the field.
    PutField(FieldRef),
    /// Push a static field value (initialises the declaring class).
    GetStatic(FieldRef),
    /// Pop a value into a static field.
    PutStatic(FieldRef),
    /// Call a method; pops arguments (and receiver), pushes the
    /// non-void result.
    Invoke {
        /// Dispatch flavor.
        kind: InvokeKind,
        /// The referenced method record.
        method: Arc<Method>,
    },
    /// Allocate an instance; pushes the reference.
    New(Arc<Class>),
    /// Pop a length, push a new array.
    NewArray(Arc<ArrayClass>),
    /// Pop `dims` lengths, push a new multi-dimensional array.
    MultiNewArray {
        /// The array class allocated.
        class: Arc<ArrayClass>,
        /// Number of popped dimension lengths.
        dims: u8,
    },
    /// Pop index and array, push the element.
    ArrayLoad(ArrayElem),
    /// Pop value, index and array, store the element.
    ArrayStore(ArrayElem),
    /// Pop an array, push its length.
    ArrayLength,
    /// Pop a reference, push 1 if it is assignable to the type.
    InstanceOf(Type),
    /// Throw unless the top reference is assignable to the type.
    CheckCast(Type),
    /// Pop a reference and acquire its lock.
    MonitorEnter,
    /// Pop a reference and release its lock.
    MonitorExit,
    /// Landing-pad entry: push the in-flight exception.
    CaughtException,
}

/// How a block ends.
#[derive(Debug, Clone)]
pub enum Terminator {
    /// Unconditional edge.
    Goto(BlockId),
    /// Pop an int; nonzero takes `then_block`.
    Branch {
        /// Nonzero edge.
        then_block: BlockId,
        /// Zero edge.
        else_block: BlockId,
    },
    /// Pop an int and select a case edge.
    Switch {
        /// Edge when no case matches.
        default: BlockId,
        /// (match value, edge) pairs.
        cases: Vec<(i32, BlockId)>,
    },
    /// Return from the method, popping the value if any.
    Return(Option<ValueKind>),
    /// Pop a reference and unwind to the block's handler edge, or out
    /// of the method if there is none.
    Throw,
}

/// One basic block.
#[derive(Debug)]
pub struct BasicBlock {
    /// The block's id.
    pub id: BlockId,
    /// Diagnostic label.
    pub label: &'static str,
    /// Operand-stack shape on entry.
    pub entry_shape: Vec<ValueKind>,
    /// Straight-line operations.
    pub ops: Vec<Op>,
    /// The closing control transfer; `None` only while under
    /// construction.
    pub terminator: Option<Terminator>,
    /// Landing pad receiving exceptions raised in this block.
    pub handler: Option<BlockId>,
}

/// The translated form of one method body.
#[derive(Debug)]
pub struct MethodGraph {
    /// The translated method.
    pub method: Arc<Method>,
    /// All blocks, indexed by [`BlockId`].
    pub blocks: Vec<BasicBlock>,
    /// The entry block.
    pub entry: BlockId,
    /// Local-variable slot count.
    pub max_locals: usize,
    /// Declared operand-stack bound.
    pub max_stack: usize,
    /// Whether the body is bracketed by monitor enter/exit.
    pub is_synchronized: bool,
}

impl MethodGraph {
    /// The block with the given id.
    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.0 as usize]
    }

    /// Blocks reachable from the entry, in discovery order.
    pub fn reachable(&self) -> Vec<BlockId> {
        let mut seen = vec![false; self.blocks.len()];
        let mut order = Vec::new();
        let mut work = vec![self.entry];
        while let Some(id) = work.pop() {
            if std::mem::replace(&mut seen[id.0 as usize], true) {
                continue;
            }
            order.push(id);
            let block = self.block(id);
            if let Some(handler) = block.handler {
                work.push(handler);
            }
            match block.terminator.as_ref() {
                Some(Terminator::Goto(t)) => work.push(*t),
                Some(Terminator::Branch {
                    then_block,
                    else_block,
                }) => {
                    work.push(*then_block);
                    work.push(*else_block);
                }
                Some(Terminator::Switch { default, cases }) => {
                    work.push(*default);
                    work.extend(cases.iter().map(|(_, b)| *b));
                }
                Some(Terminator::Return(_)) | Some(Terminator::Throw) | None => {}
            }
        }
        order
    }
}

/// The native code generator consuming translated graphs.
pub trait CodeBackend: Send + Sync {
    /// Compiles a graph to a callable entry point. The graph is
    /// consumed; nothing of the translation session survives the call.
    fn compile(&self, vm: &Arc<Vm>, graph: MethodGraph) -> VmResult<EntryPoint>;

    /// Calls a compiled entry.
    fn invoke(&self, vm: &Arc<Vm>, entry: EntryPoint, args: &[JavaValue]) -> VmResult<JavaValue>;
}
