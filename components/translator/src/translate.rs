//! Bytecode to basic-block-graph translation.
//!
//! One linear pass over the bytecode stream. Forward branches allocate
//! placeholder blocks carrying the operand-stack shape in effect at
//! the branch; backward branches split the already-translated block at
//! the target offset. A worklist of pending forward targets is drained
//! whenever a straight-line run ends; translation is complete when the
//! worklist is empty, and bytecode that ends a run without a control
//! transfer is a class format error.
//!
//! Synchronized methods are bracketed: the entry block stores the
//! receiver (or the class object) into a synthetic local, acquires its
//! monitor, and every return edge and every landing pad releases it
//! before leaving the method.

use crate::exceptions::{RegionEntry, Regions};
use crate::graph::{
    ArithOp, ArrayElem, BasicBlock, BlockId, Cond, ConvTarget, InvokeKind, MethodGraph, Op,
    Terminator,
};
use crate::opcodes as bc;
use classfile::Reader;
use core_types::{PrimitiveKind, ValueKind, VmError, VmResult};
use std::sync::Arc;
use tracing::{debug, trace};
use type_system::{Class, Method, Type, Vm};

/// The bytecode translation engine.
pub struct Translator;

impl Translator {
    /// Translates one method body into a [`MethodGraph`].
    ///
    /// The session owns nothing that outlives the call; on failure the
    /// partial graph is discarded.
    pub fn translate(vm: &Arc<Vm>, method: &Arc<Method>) -> VmResult<MethodGraph> {
        let class = method.class();
        class.resolve()?;
        let access = method.access()?;
        if access.is_native() {
            return Err(VmError::internal(format!(
                "translating native method {}",
                method.full_name()
            )));
        }
        if access.is_abstract() {
            return Err(VmError::internal(format!(
                "translating abstract method {}",
                method.full_name()
            )));
        }

        let code = method.code()?;
        debug!(method = %method.full_name(), len = code.code.len(), "translating");

        let mut session = CodeGen::new(vm, method, &class, &code)?;
        session.run()?;
        session.finish()
    }
}

#[derive(Default)]
struct OpInfo {
    /// Placeholder or split block starting exactly at this offset.
    block: Option<BlockId>,
    /// Where this offset's first op landed, for lazy splits.
    placed: Option<(BlockId, usize)>,
    /// Operand-stack shape in effect at this offset.
    shape: Option<Vec<ValueKind>>,
    /// Entered with the in-flight exception as the whole stack.
    handler_entry: bool,
}

/// How a placeholder's entry shape is derived.
#[derive(Clone, Copy, PartialEq)]
enum ShapeMode {
    /// Snapshot of the current translation-time stack.
    Current,
    /// Exception-handler entry: exactly one reference.
    Handler,
}

struct CodeGen<'a> {
    vm: &'a Arc<Vm>,
    method: &'a Arc<Method>,
    class: &'a Arc<Class>,
    reader: Reader<'a>,
    code_len: usize,
    blocks: Vec<BasicBlock>,
    op_infos: Vec<OpInfo>,
    pending: Vec<usize>,
    stack: Vec<ValueKind>,
    max_stack: usize,
    locals: Vec<Option<ValueKind>>,
    current: BlockId,
    /// Needs a worklist drain before reading more bytecode.
    closed: bool,
    regions: Regions,
    cur_node: usize,
    is_sync: bool,
    is_static: bool,
    ret_kind: Option<ValueKind>,
    /// Synthetic local holding the locked receiver of a synchronized
    /// method (user code may overwrite slot 0).
    sync_slot: Option<u16>,
    entry: BlockId,
}

impl<'a> CodeGen<'a> {
    fn new(
        vm: &'a Arc<Vm>,
        method: &'a Arc<Method>,
        class: &'a Arc<Class>,
        code: &'a classfile::CodeAttribute,
    ) -> VmResult<CodeGen<'a>> {
        let access = method.access()?;
        let is_sync = access.is_synchronized();
        let is_static = access.is_static();
        let code_len = code.code.len();

        let mut max_locals = code.max_locals as usize;
        let sync_slot = if is_sync {
            let slot = max_locals as u16;
            max_locals += 1;
            Some(slot)
        } else {
            None
        };

        let mut session = CodeGen {
            vm,
            method,
            class,
            reader: Reader::new(&code.code),
            code_len,
            blocks: Vec::new(),
            op_infos: (0..code_len).map(|_| OpInfo::default()).collect(),
            pending: Vec::new(),
            stack: Vec::new(),
            max_stack: code.max_stack as usize,
            locals: vec![None; max_locals],
            current: BlockId(0),
            closed: false,
            regions: Regions::build(&[], code_len),
            cur_node: 0,
            is_sync,
            is_static,
            ret_kind: method.desc().ret.value_kind_opt(),
            sync_slot,
            entry: BlockId(0),
        };

        session.bind_arguments()?;

        // Entry block: bracket the body for synchronized methods, then
        // fall into the bytecode at offset zero.
        let entry = session.new_block("entry", Vec::new());
        session.entry = entry;
        session.current = entry;
        if let Some(slot) = session.sync_slot {
            session.emit_receiver_source();
            session.block_mut(entry).ops.push(Op::Store {
                kind: ValueKind::Reference,
                index: slot,
            });
            session.locals[slot as usize] = Some(ValueKind::Reference);
            session.block_mut(entry).ops.push(Op::Load {
                kind: ValueKind::Reference,
                index: slot,
            });
            session.block_mut(entry).ops.push(Op::MonitorEnter);
        }
        let start = session.forward_branch("start", 0, false, ShapeMode::Current)?;
        session.block_mut(entry).terminator = Some(Terminator::Goto(start));

        // Exception regions, with the implicit outermost interval that
        // guarantees monitor release on every unwinding path.
        let mut entries = Vec::with_capacity(code.exception_table.len());
        for raw in &code.exception_table {
            let catch = if raw.catch_type == 0 {
                None
            } else {
                Some(session.class.class_at(raw.catch_type)?)
            };
            entries.push(RegionEntry {
                start: raw.start_pc as usize,
                end: raw.end_pc as usize,
                handler_pc: raw.handler_pc as usize,
                catch,
            });
        }
        session.regions = Regions::build(&entries, code_len);
        session.build_landing_pads()?;

        Ok(session)
    }

    // ---- block plumbing ----

    fn new_block(&mut self, label: &'static str, entry_shape: Vec<ValueKind>) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BasicBlock {
            id,
            label,
            entry_shape,
            ops: Vec::new(),
            terminator: None,
            handler: None,
        });
        id
    }

    fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id.0 as usize]
    }

    fn terminated(&self, id: BlockId) -> bool {
        self.blocks[id.0 as usize].terminator.is_some()
    }

    fn emit(&mut self, op: Op) {
        let current = self.current;
        self.block_mut(current).ops.push(op);
    }

    fn seal(&mut self, terminator: Terminator) {
        let current = self.current;
        self.block_mut(current).terminator = Some(terminator);
    }

    /// Seals the current block with a path-ending terminator; the next
    /// bytecode comes from the pending worklist.
    fn end_path(&mut self, terminator: Terminator) {
        self.seal(terminator);
        self.closed = true;
    }

    fn format_err(&self, reason: impl Into<String>) -> VmError {
        VmError::format(self.class.name().as_str(), reason)
    }

    // ---- operand stack shape ----

    fn push(&mut self, kind: ValueKind) -> VmResult<()> {
        if self.stack.len() >= self.max_stack {
            return Err(self.format_err(format!(
                "operand stack overflow in {}",
                self.method.full_name()
            )));
        }
        self.stack.push(kind);
        Ok(())
    }

    fn pop(&mut self) -> VmResult<ValueKind> {
        self.stack.pop().ok_or_else(|| {
            self.format_err(format!(
                "operand stack underflow in {}",
                self.method.full_name()
            ))
        })
    }

    fn pop_kind(&mut self, expected: ValueKind) -> VmResult<()> {
        let got = self.pop()?;
        if got != expected {
            return Err(self.format_err(format!(
                "expected {:?} on the operand stack, found {:?}",
                expected, got
            )));
        }
        Ok(())
    }

    // ---- locals ----

    fn local_load(&mut self, kind: ValueKind, index: u16) -> VmResult<()> {
        let slot = self
            .locals
            .get(index as usize)
            .ok_or_else(|| self.format_err(format!("bad local index {}", index)))?;
        match slot {
            Some(stored) if *stored == kind => {}
            Some(stored) => {
                return Err(self.format_err(format!(
                    "local {} holds {:?}, loaded as {:?}",
                    index, stored, kind
                )))
            }
            None => return Err(self.format_err(format!("reading undefined local {}", index))),
        }
        self.push(kind)?;
        self.emit(Op::Load { kind, index });
        Ok(())
    }

    fn local_store(&mut self, kind: ValueKind, index: u16) -> VmResult<()> {
        self.pop_kind(kind)?;
        let index_usize = index as usize;
        let span = if kind.is_wide() { 2 } else { 1 };
        if index_usize + span > self.locals.len() {
            return Err(self.format_err(format!("bad local index {}", index)));
        }
        self.locals[index_usize] = Some(kind);
        if kind.is_wide() {
            self.locals[index_usize + 1] = None;
        }
        self.emit(Op::Store { kind, index });
        Ok(())
    }

    fn bind_arguments(&mut self) -> VmResult<()> {
        let mut index = 0usize;
        if !self.is_static {
            if self.locals.is_empty() {
                return Err(self.format_err("max_locals too small for the receiver"));
            }
            self.locals[0] = Some(ValueKind::Reference);
            index = 1;
        }
        for param in &self.method.desc().params {
            let kind = param.value_kind();
            let span = if kind.is_wide() { 2 } else { 1 };
            if index + span > self.locals.len() {
                return Err(self.format_err("max_locals too small for the arguments"));
            }
            self.locals[index] = Some(kind);
            index += span;
        }
        Ok(())
    }

    // ---- branch targets ----

    /// The block starting at `pc`: an existing placeholder, a lazy
    /// split of already-translated code, or a fresh placeholder.
    fn forward_branch(
        &mut self,
        label: &'static str,
        pc: usize,
        push_pending: bool,
        mode: ShapeMode,
    ) -> VmResult<BlockId> {
        if pc >= self.code_len && !(pc == 0 && self.code_len == 0) {
            return Err(self.format_err(format!("branch target {} outside the code", pc)));
        }
        if let Some(existing) = self.op_infos[pc].block {
            self.validate_join(pc, mode)?;
            return Ok(existing);
        }
        if self.op_infos[pc].placed.is_some() {
            self.validate_join(pc, mode)?;
            return self.split_at(pc);
        }
        let shape = match mode {
            ShapeMode::Current => self.stack.clone(),
            ShapeMode::Handler => vec![ValueKind::Reference],
        };
        let block = self.new_block(label, shape.clone());
        self.op_infos[pc].block = Some(block);
        self.op_infos[pc].shape = Some(shape);
        self.op_infos[pc].handler_entry = mode == ShapeMode::Handler;
        if push_pending {
            self.pending.push(pc);
        }
        Ok(block)
    }

    /// Validates the current shape against the shape recorded for a
    /// join point. A mismatch is an engine fault.
    fn validate_join(&self, pc: usize, mode: ShapeMode) -> VmResult<()> {
        if mode == ShapeMode::Handler {
            return Ok(());
        }
        if let Some(expected) = &self.op_infos[pc].shape {
            if *expected != self.stack {
                return Err(VmError::internal(format!(
                    "stack shape mismatch at join {} of {}: {:?} vs {:?}",
                    pc,
                    self.method.full_name(),
                    expected,
                    self.stack
                )));
            }
        }
        Ok(())
    }

    /// Splits the block containing already-translated `pc` so a block
    /// starts exactly there.
    fn split_at(&mut self, pc: usize) -> VmResult<BlockId> {
        let (block, index) = self.op_infos[pc]
            .placed
            .ok_or_else(|| VmError::internal("splitting an untranslated offset"))?;
        if index == 0 && self.op_infos[pc].block.is_some() {
            return Ok(block);
        }
        let shape = self.op_infos[pc].shape.clone().unwrap_or_default();
        let split = self.new_block("split", shape);

        let moved_ops = self.blocks[block.0 as usize].ops.split_off(index);
        let moved_term = self.blocks[block.0 as usize].terminator.take();
        let handler = self.blocks[block.0 as usize].handler;
        {
            let b = self.block_mut(split);
            b.ops = moved_ops;
            b.terminator = moved_term;
            b.handler = handler;
        }
        self.block_mut(block).terminator = Some(Terminator::Goto(split));

        for info in self.op_infos.iter_mut() {
            if let Some((b, i)) = info.placed {
                if b == block && i >= index {
                    info.placed = Some((split, i - index));
                }
            }
        }
        self.op_infos[pc].block = Some(split);
        if self.current == block {
            self.current = split;
        }
        Ok(split)
    }

    /// Switches translation into a block starting at `pc`, restoring
    /// its recorded operand-stack shape and wiring its handler edge.
    fn enter_block(&mut self, block: BlockId, pc: usize) {
        self.current = block;
        if self.op_infos[pc].handler_entry {
            self.stack = vec![ValueKind::Reference];
        } else if let Some(shape) = &self.op_infos[pc].shape {
            self.stack = shape.clone();
        }
        let pad = self.regions.pad_for(self.cur_node);
        self.block_mut(block).handler = pad;
        self.closed = false;
    }

    fn place(&mut self, pc: usize) {
        let at = (self.current, self.blocks[self.current.0 as usize].ops.len());
        self.op_infos[pc].placed = Some(at);
        if self.op_infos[pc].shape.is_none() {
            self.op_infos[pc].shape = Some(self.stack.clone());
        }
    }

    fn next_pending(&mut self) -> Option<usize> {
        while let Some(pc) = self.pending.pop() {
            if self.op_infos[pc].placed.is_none() {
                return Some(pc);
            }
        }
        None
    }

    // ---- exception regions ----

    /// Updates the active interval when `pc` crosses a boundary, and
    /// forces a block break so handler edges stay uniform per block.
    fn enter_region(&mut self, pc: usize) -> VmResult<()> {
        let node = self.regions.node_for(pc);
        if node == self.cur_node {
            return Ok(());
        }
        self.cur_node = node;
        if !self.terminated(self.current)
            && self.op_infos[pc].block.is_none()
            && self.op_infos[pc].placed.is_none()
        {
            let next = self.forward_branch("region-boundary", pc, false, ShapeMode::Current)?;
            self.seal(Terminator::Goto(next));
            self.enter_block(next, pc);
        }
        Ok(())
    }

    /// Pushes the synchronized receiver (or, in a landing pad or the
    /// entry block of a static method, the class object).
    fn emit_receiver_source(&mut self) {
        if self.is_static {
            let ty = Type::Class(self.class.clone());
            self.emit(Op::ClassConst(ty));
        } else {
            self.emit(Op::Load {
                kind: ValueKind::Reference,
                index: 0,
            });
        }
    }

    fn emit_sync_release(&mut self) {
        if let Some(slot) = self.sync_slot {
            self.emit(Op::Load {
                kind: ValueKind::Reference,
                index: slot,
            });
            self.emit(Op::MonitorExit);
        }
    }

    /// Builds every interval's landing pad: a chain of type tests over
    /// the active handlers, ending in a rethrow (releasing the monitor
    /// first in synchronized methods).
    fn build_landing_pads(&mut self) -> VmResult<()> {
        for node_idx in 0..self.regions.len() {
            let entries = self.regions.node(node_idx).entries.clone();
            if entries.is_empty() && !self.is_sync {
                continue;
            }

            let pad = self.new_block("landing-pad", Vec::new());
            self.block_mut(pad).ops.push(Op::CaughtException);
            let mut cursor = Some(pad);

            for entry in &entries {
                let Some(check) = cursor else { break };
                // Handler bodies enter with the exception as the only
                // stack value.
                let saved = std::mem::take(&mut self.stack);
                let handler = self.forward_branch(
                    "exception-handler",
                    entry.handler_pc,
                    true,
                    ShapeMode::Handler,
                )?;
                self.stack = saved;

                match &entry.catch {
                    Some(ty) => {
                        let next = self.new_block(
                            "next-exception-check",
                            vec![ValueKind::Reference],
                        );
                        let b = self.block_mut(check);
                        b.ops.push(Op::Dup);
                        b.ops.push(Op::InstanceOf(ty.clone()));
                        b.terminator = Some(Terminator::Branch {
                            then_block: handler,
                            else_block: next,
                        });
                        cursor = Some(next);
                    }
                    None => {
                        self.block_mut(check).terminator = Some(Terminator::Goto(handler));
                        cursor = None;
                    }
                }
            }

            if let Some(tail) = cursor {
                let saved_current = self.current;
                self.current = tail;
                self.emit_sync_release();
                self.seal(Terminator::Throw);
                self.current = saved_current;
                self.closed = false;
            }
            self.regions.set_pad(node_idx, pad);
        }
        Ok(())
    }

    // ---- the main loop ----

    fn run(&mut self) -> VmResult<()> {
        loop {
            if self.closed {
                let Some(pc) = self.next_pending() else {
                    return Ok(());
                };
                self.reader.seek(pc)?;
                self.closed = false;
                continue;
            }
            if self.reader.remaining() == 0 {
                return Err(self.format_err(format!(
                    "code of {} falls off the end without returning",
                    self.method.full_name()
                )));
            }

            let pc = self.reader.tell();
            self.enter_region(pc)?;

            if self.op_infos[pc].placed.is_some() {
                // Fell into already-translated code: attach and drain.
                if !self.terminated(self.current) {
                    self.validate_join(pc, ShapeMode::Current)?;
                    let target = self.split_at(pc)?;
                    self.seal(Terminator::Goto(target));
                }
                self.closed = true;
                continue;
            }
            if let Some(block) = self.op_infos[pc].block {
                // (unless the region break above already entered it)
                if block != self.current {
                    if !self.terminated(self.current) {
                        self.validate_join(pc, ShapeMode::Current)?;
                        self.seal(Terminator::Goto(block));
                    }
                    self.enter_block(block, pc);
                }
            }

            self.place(pc);
            let opcode = self.reader.u1()?;
            trace!(pc, opcode = bc::name(opcode), "decoding");
            self.dispatch(pc, opcode)?;
        }
    }

    fn finish(self) -> VmResult<MethodGraph> {
        for block in &self.blocks {
            if block.terminator.is_none() {
                return Err(VmError::internal(format!(
                    "unterminated block {:?} in {}",
                    block.id,
                    self.method.full_name()
                )));
            }
        }
        debug!(
            method = %self.method.full_name(),
            blocks = self.blocks.len(),
            "translated"
        );
        Ok(MethodGraph {
            method: self.method.clone(),
            blocks: self.blocks,
            entry: self.entry,
            max_locals: self.locals.len(),
            max_stack: self.max_stack,
            is_synchronized: self.is_sync,
        })
    }

    // ---- opcode translation ----

    fn dispatch(&mut self, pc: usize, opcode: u8) -> VmResult<()> {
        match opcode {
            bc::NOP => {}

            bc::ACONST_NULL => {
                self.push(ValueKind::Reference)?;
                self.emit(Op::NullConst);
            }
            bc::ICONST_M1..=bc::ICONST_5 => {
                self.push(ValueKind::Int)?;
                self.emit(Op::IntConst(opcode as i32 - bc::ICONST_0 as i32));
            }
            bc::LCONST_0 | bc::LCONST_1 => {
                self.push(ValueKind::Long)?;
                self.emit(Op::LongConst((opcode - bc::LCONST_0) as i64));
            }
            bc::FCONST_0..=bc::FCONST_2 => {
                self.push(ValueKind::Float)?;
                self.emit(Op::FloatConst((opcode - bc::FCONST_0) as f32));
            }
            bc::DCONST_0 | bc::DCONST_1 => {
                self.push(ValueKind::Double)?;
                self.emit(Op::DoubleConst((opcode - bc::DCONST_0) as f64));
            }
            bc::BIPUSH => {
                let v = self.reader.s1()? as i32;
                self.push(ValueKind::Int)?;
                self.emit(Op::IntConst(v));
            }
            bc::SIPUSH => {
                let v = self.reader.s2()? as i32;
                self.push(ValueKind::Int)?;
                self.emit(Op::IntConst(v));
            }

            bc::LDC => {
                let idx = self.reader.u1()? as u16;
                self.ldc(idx, false)?;
            }
            bc::LDC_W => {
                let idx = self.reader.u2()?;
                self.ldc(idx, false)?;
            }
            bc::LDC2_W => {
                let idx = self.reader.u2()?;
                self.ldc(idx, true)?;
            }

            bc::ILOAD => {
                let idx = self.reader.u1()? as u16;
                self.local_load(ValueKind::Int, idx)?;
            }
            bc::LLOAD => {
                let idx = self.reader.u1()? as u16;
                self.local_load(ValueKind::Long, idx)?;
            }
            bc::FLOAD => {
                let idx = self.reader.u1()? as u16;
                self.local_load(ValueKind::Float, idx)?;
            }
            bc::DLOAD => {
                let idx = self.reader.u1()? as u16;
                self.local_load(ValueKind::Double, idx)?;
            }
            bc::ALOAD => {
                let idx = self.reader.u1()? as u16;
                self.local_load(ValueKind::Reference, idx)?;
            }
            0x1a..=0x1d => self.local_load(ValueKind::Int, (opcode - bc::ILOAD_0) as u16)?,
            0x1e..=0x21 => self.local_load(ValueKind::Long, (opcode - bc::LLOAD_0) as u16)?,
            0x22..=0x25 => self.local_load(ValueKind::Float, (opcode - bc::FLOAD_0) as u16)?,
            0x26..=0x29 => self.local_load(ValueKind::Double, (opcode - bc::DLOAD_0) as u16)?,
            0x2a..=0x2d => self.local_load(ValueKind::Reference, (opcode - bc::ALOAD_0) as u16)?,

            bc::IALOAD => self.array_load(ArrayElem::Int)?,
            bc::LALOAD => self.array_load(ArrayElem::Long)?,
            bc::FALOAD => self.array_load(ArrayElem::Float)?,
            bc::DALOAD => self.array_load(ArrayElem::Double)?,
            bc::AALOAD => self.array_load(ArrayElem::Reference)?,
            bc::BALOAD => self.array_load(ArrayElem::Byte)?,
            bc::CALOAD => self.array_load(ArrayElem::Char)?,
            bc::SALOAD => self.array_load(ArrayElem::Short)?,

            bc::ISTORE => {
                let idx = self.reader.u1()? as u16;
                self.local_store(ValueKind::Int, idx)?;
            }
            bc::LSTORE => {
                let idx = self.reader.u1()? as u16;
                self.local_store(ValueKind::Long, idx)?;
            }
            bc::FSTORE => {
                let idx = self.reader.u1()? as u16;
                self.local_store(ValueKind::Float, idx)?;
            }
            bc::DSTORE => {
                let idx = self.reader.u1()? as u16;
                self.local_store(ValueKind::Double, idx)?;
            }
            bc::ASTORE => {
                let idx = self.reader.u1()? as u16;
                self.local_store(ValueKind::Reference, idx)?;
            }
            0x3b..=0x3e => self.local_store(ValueKind::Int, (opcode - bc::ISTORE_0) as u16)?,
            0x3f..=0x42 => self.local_store(ValueKind::Long, (opcode - bc::LSTORE_0) as u16)?,
            0x43..=0x46 => self.local_store(ValueKind::Float, (opcode - bc::FSTORE_0) as u16)?,
            0x47..=0x4a => self.local_store(ValueKind::Double, (opcode - bc::DSTORE_0) as u16)?,
            0x4b..=0x4e => {
                self.local_store(ValueKind::Reference, (opcode - bc::ASTORE_0) as u16)?
            }

            bc::IASTORE => self.array_store(ArrayElem::Int)?,
            bc::LASTORE => self.array_store(ArrayElem::Long)?,
            bc::FASTORE => self.array_store(ArrayElem::Float)?,
            bc::DASTORE => self.array_store(ArrayElem::Double)?,
            bc::AASTORE => self.array_store(ArrayElem::Reference)?,
            bc::BASTORE => self.array_store(ArrayElem::Byte)?,
            bc::CASTORE => self.array_store(ArrayElem::Char)?,
            bc::SASTORE => self.array_store(ArrayElem::Short)?,

            bc::POP => {
                let kind = self.pop()?;
                if kind.is_wide() {
                    return Err(self.format_err("pop of a category-2 value"));
                }
                self.emit(Op::Pop);
            }
            bc::POP2 => {
                let kind = self.pop()?;
                if !kind.is_wide() {
                    let second = self.pop()?;
                    if second.is_wide() {
                        return Err(self.format_err("pop2 splits a category-2 value"));
                    }
                }
                self.emit(Op::Pop2);
            }
            bc::DUP => {
                let kind = *self.top(0)?;
                if kind.is_wide() {
                    return Err(self.format_err("dup of a category-2 value"));
                }
                self.push(kind)?;
                self.emit(Op::Dup);
            }
            bc::DUP_X1 => {
                let a = self.pop_cat1()?;
                let b = self.pop_cat1()?;
                self.push(a)?;
                self.push(b)?;
                self.push(a)?;
                self.emit(Op::DupX1);
            }
            bc::DUP_X2 => {
                let a = self.pop_cat1()?;
                let under = self.pop()?;
                if under.is_wide() {
                    self.push(a)?;
                    self.push(under)?;
                    self.push(a)?;
                } else {
                    let c = self.pop_cat1()?;
                    self.push(a)?;
                    self.push(c)?;
                    self.push(under)?;
                    self.push(a)?;
                }
                self.emit(Op::DupX2);
            }
            bc::DUP2 => {
                let top = self.pop()?;
                if top.is_wide() {
                    self.push(top)?;
                    self.push(top)?;
                } else {
                    let b = self.pop_cat1()?;
                    self.push(b)?;
                    self.push(top)?;
                    self.push(b)?;
                    self.push(top)?;
                }
                self.emit(Op::Dup2);
            }
            bc::DUP2_X1 => {
                let top = self.pop()?;
                if top.is_wide() {
                    let b = self.pop_cat1()?;
                    self.push(top)?;
                    self.push(b)?;
                    self.push(top)?;
                } else {
                    let a = self.pop_cat1()?;
                    let c = self.pop_cat1()?;
                    self.push(a)?;
                    self.push(top)?;
                    self.push(c)?;
                    self.push(a)?;
                    self.push(top)?;
                }
                self.emit(Op::Dup2X1);
            }
            bc::DUP2_X2 => {
                let top = self.pop()?;
                if top.is_wide() {
                    let under = self.pop()?;
                    if under.is_wide() {
                        self.push(top)?;
                        self.push(under)?;
                        self.push(top)?;
                    } else {
                        let c = self.pop_cat1()?;
                        self.push(top)?;
                        self.push(c)?;
                        self.push(under)?;
                        self.push(top)?;
                    }
                } else {
                    let a = self.pop_cat1()?;
                    let under = self.pop()?;
                    if under.is_wide() {
                        self.push(a)?;
                        self.push(top)?;
                        self.push(under)?;
                        self.push(a)?;
                        self.push(top)?;
                    } else {
                        let d = self.pop_cat1()?;
                        self.push(a)?;
                        self.push(top)?;
                        self.push(d)?;
                        self.push(under)?;
                        self.push(a)?;
                        self.push(top)?;
                    }
                }
                self.emit(Op::Dup2X2);
            }
            bc::SWAP => {
                let a = self.pop_cat1()?;
                let b = self.pop_cat1()?;
                self.push(a)?;
                self.push(b)?;
                self.emit(Op::Swap);
            }

            0x60..=0x63 => self.arith(opcode, bc::IADD, ArithOp::Add)?,
            0x64..=0x67 => self.arith(opcode, bc::ISUB, ArithOp::Sub)?,
            0x68..=0x6b => self.arith(opcode, bc::IMUL, ArithOp::Mul)?,
            0x6c..=0x6f => self.arith(opcode, bc::IDIV, ArithOp::Div)?,
            0x70..=0x73 => self.arith(opcode, bc::IREM, ArithOp::Rem)?,
            0x74..=0x77 => {
                let kind = arith_kind(opcode - bc::INEG);
                self.pop_kind(kind)?;
                self.push(kind)?;
                self.emit(Op::Neg { kind });
            }
            bc::ISHL | bc::ISHR | bc::IUSHR => {
                let op = match opcode {
                    bc::ISHL => ArithOp::Shl,
                    bc::ISHR => ArithOp::Shr,
                    _ => ArithOp::Ushr,
                };
                self.pop_kind(ValueKind::Int)?;
                self.pop_kind(ValueKind::Int)?;
                self.push(ValueKind::Int)?;
                self.emit(Op::Arith {
                    kind: ValueKind::Int,
                    op,
                });
            }
            bc::LSHL | bc::LSHR | bc::LUSHR => {
                let op = match opcode {
                    bc::LSHL => ArithOp::Shl,
                    bc::LSHR => ArithOp::Shr,
                    _ => ArithOp::Ushr,
                };
                self.pop_kind(ValueKind::Int)?;
                self.pop_kind(ValueKind::Long)?;
                self.push(ValueKind::Long)?;
                self.emit(Op::Arith {
                    kind: ValueKind::Long,
                    op,
                });
            }
            bc::IAND | bc::LAND => self.bitwise(opcode == bc::LAND, ArithOp::And)?,
            bc::IOR | bc::LOR => self.bitwise(opcode == bc::LOR, ArithOp::Or)?,
            bc::IXOR | bc::LXOR => self.bitwise(opcode == bc::LXOR, ArithOp::Xor)?,

            bc::IINC => {
                let index = self.reader.u1()? as u16;
                let amount = self.reader.s1()? as i16;
                self.iinc(index, amount)?;
            }

            bc::I2L => self.convert(ValueKind::Int, ConvTarget::Long)?,
            bc::I2F => self.convert(ValueKind::Int, ConvTarget::Float)?,
            bc::I2D => self.convert(ValueKind::Int, ConvTarget::Double)?,
            bc::L2I => self.convert(ValueKind::Long, ConvTarget::Int)?,
            bc::L2F => self.convert(ValueKind::Long, ConvTarget::Float)?,
            bc::L2D => self.convert(ValueKind::Long, ConvTarget::Double)?,
            bc::F2I => self.convert(ValueKind::Float, ConvTarget::Int)?,
            bc::F2L => self.convert(ValueKind::Float, ConvTarget::Long)?,
            bc::F2D => self.convert(ValueKind::Float, ConvTarget::Double)?,
            bc::D2I => self.convert(ValueKind::Double, ConvTarget::Int)?,
            bc::D2L => self.convert(ValueKind::Double, ConvTarget::Long)?,
            bc::D2F => self.convert(ValueKind::Double, ConvTarget::Float)?,
            bc::I2B => self.convert(ValueKind::Int, ConvTarget::Byte)?,
            bc::I2C => self.convert(ValueKind::Int, ConvTarget::Char)?,
            bc::I2S => self.convert(ValueKind::Int, ConvTarget::Short)?,

            bc::LCMP => {
                self.pop_kind(ValueKind::Long)?;
                self.pop_kind(ValueKind::Long)?;
                self.push(ValueKind::Int)?;
                self.emit(Op::LongCompare);
            }
            bc::FCMPL | bc::FCMPG => {
                self.pop_kind(ValueKind::Float)?;
                self.pop_kind(ValueKind::Float)?;
                self.push(ValueKind::Int)?;
                self.emit(Op::FloatCompare {
                    greater_on_nan: opcode == bc::FCMPG,
                });
            }
            bc::DCMPL | bc::DCMPG => {
                self.pop_kind(ValueKind::Double)?;
                self.pop_kind(ValueKind::Double)?;
                self.push(ValueKind::Int)?;
                self.emit(Op::DoubleCompare {
                    greater_on_nan: opcode == bc::DCMPG,
                });
            }

            bc::IFEQ..=bc::IFLE => {
                let offset = self.reader.s2()? as i32;
                let cond = zero_cond(opcode);
                self.emit(Op::IntConst(0));
                self.emit(Op::IntCompare(cond));
                self.pop_kind(ValueKind::Int)?;
                self.cond_br(pc, offset, false)?;
            }
            bc::IF_ICMPEQ..=bc::IF_ICMPLE => {
                let offset = self.reader.s2()? as i32;
                let cond = icmp_cond(opcode);
                self.pop_kind(ValueKind::Int)?;
                self.pop_kind(ValueKind::Int)?;
                self.push(ValueKind::Int)?;
                self.emit(Op::IntCompare(cond));
                self.pop_kind(ValueKind::Int)?;
                self.cond_br(pc, offset, false)?;
            }
            bc::IF_ACMPEQ | bc::IF_ACMPNE => {
                let offset = self.reader.s2()? as i32;
                let cond = if opcode == bc::IF_ACMPEQ {
                    Cond::Eq
                } else {
                    Cond::Ne
                };
                self.pop_kind(ValueKind::Reference)?;
                self.pop_kind(ValueKind::Reference)?;
                self.push(ValueKind::Int)?;
                self.emit(Op::RefCompare(cond));
                self.pop_kind(ValueKind::Int)?;
                self.cond_br(pc, offset, false)?;
            }
            bc::IFNULL | bc::IFNONNULL => {
                let offset = self.reader.s2()? as i32;
                self.pop_kind(ValueKind::Reference)?;
                self.emit(Op::RefIsNull);
                self.cond_br(pc, offset, opcode == bc::IFNONNULL)?;
            }

            bc::GOTO => {
                let offset = self.reader.s2()? as i32;
                let target_pc = self.branch_target(pc, offset)?;
                let target = self.forward_branch("goto", target_pc, true, ShapeMode::Current)?;
                self.end_path(Terminator::Goto(target));
            }
            bc::GOTO_W => {
                let offset = self.reader.s4()?;
                let target_pc = self.branch_target(pc, offset)?;
                let target = self.forward_branch("goto", target_pc, true, ShapeMode::Current)?;
                self.end_path(Terminator::Goto(target));
            }

            bc::TABLESWITCH => {
                self.skip_switch_padding(pc)?;
                let default = self.reader.s4()?;
                let low = self.reader.s4()?;
                let high = self.reader.s4()?;
                if low > high {
                    return Err(self.format_err("tableswitch with low > high"));
                }
                self.pop_kind(ValueKind::Int)?;
                let mut cases = Vec::with_capacity((high - low + 1) as usize);
                for key in low..=high {
                    let offset = self.reader.s4()?;
                    let target_pc = self.branch_target(pc, offset)?;
                    let block =
                        self.forward_branch("switch-case", target_pc, true, ShapeMode::Current)?;
                    cases.push((key, block));
                }
                let default_pc = self.branch_target(pc, default)?;
                let default_block =
                    self.forward_branch("switch-default", default_pc, true, ShapeMode::Current)?;
                self.end_path(Terminator::Switch {
                    default: default_block,
                    cases,
                });
            }
            bc::LOOKUPSWITCH => {
                self.skip_switch_padding(pc)?;
                let default = self.reader.s4()?;
                let npairs = self.reader.s4()?;
                if npairs < 0 {
                    return Err(self.format_err("lookupswitch with negative pair count"));
                }
                self.pop_kind(ValueKind::Int)?;
                let mut cases = Vec::with_capacity(npairs as usize);
                for _ in 0..npairs {
                    let key = self.reader.s4()?;
                    let offset = self.reader.s4()?;
                    let target_pc = self.branch_target(pc, offset)?;
                    let block =
                        self.forward_branch("switch-case", target_pc, true, ShapeMode::Current)?;
                    cases.push((key, block));
                }
                let default_pc = self.branch_target(pc, default)?;
                let default_block =
                    self.forward_branch("switch-default", default_pc, true, ShapeMode::Current)?;
                self.end_path(Terminator::Switch {
                    default: default_block,
                    cases,
                });
            }

            bc::IRETURN..=bc::ARETURN => {
                let kind = match opcode {
                    bc::IRETURN => ValueKind::Int,
                    bc::LRETURN => ValueKind::Long,
                    bc::FRETURN => ValueKind::Float,
                    bc::DRETURN => ValueKind::Double,
                    _ => ValueKind::Reference,
                };
                if self.ret_kind != Some(kind) {
                    return Err(self.format_err(format!(
                        "return kind {:?} does not match {}",
                        kind,
                        self.method.full_name()
                    )));
                }
                self.emit_sync_release();
                self.pop_kind(kind)?;
                self.end_path(Terminator::Return(Some(kind)));
            }
            bc::RETURN => {
                if self.ret_kind.is_some() {
                    return Err(self.format_err(format!(
                        "void return from non-void {}",
                        self.method.full_name()
                    )));
                }
                self.emit_sync_release();
                self.end_path(Terminator::Return(None));
            }

            bc::GETSTATIC => {
                let idx = self.reader.u2()?;
                let field = self.class.field_at(idx, true)?;
                self.push(field.field.desc().value_kind())?;
                self.emit(Op::GetStatic(field));
            }
            bc::PUTSTATIC => {
                let idx = self.reader.u2()?;
                let field = self.class.field_at(idx, true)?;
                self.pop_kind(field.field.desc().value_kind())?;
                self.emit(Op::PutStatic(field));
            }
            bc::GETFIELD => {
                let idx = self.reader.u2()?;
                let field = self.class.field_at(idx, false)?;
                self.pop_kind(ValueKind::Reference)?;
                self.push(field.field.desc().value_kind())?;
                self.emit(Op::GetField(field));
            }
            bc::PUTFIELD => {
                let idx = self.reader.u2()?;
                let field = self.class.field_at(idx, false)?;
                self.pop_kind(field.field.desc().value_kind())?;
                self.pop_kind(ValueKind::Reference)?;
                self.emit(Op::PutField(field));
            }

            bc::INVOKEVIRTUAL => {
                let idx = self.reader.u2()?;
                self.invoke(idx, InvokeKind::Virtual)?;
            }
            bc::INVOKESPECIAL => {
                let idx = self.reader.u2()?;
                self.invoke(idx, InvokeKind::Special)?;
            }
            bc::INVOKESTATIC => {
                let idx = self.reader.u2()?;
                self.invoke(idx, InvokeKind::Static)?;
            }
            bc::INVOKEINTERFACE => {
                let idx = self.reader.u2()?;
                self.reader.u2()?; // count and the reserved zero byte
                self.invoke(idx, InvokeKind::Interface)?;
            }

            bc::NEW => {
                let idx = self.reader.u2()?;
                let class = self.class.class_at(idx)?.as_class()?;
                self.push(ValueKind::Reference)?;
                self.emit(Op::New(class));
            }
            bc::NEWARRAY => {
                let atype = self.reader.u1()?;
                let kind = primitive_array_kind(atype)
                    .ok_or_else(|| self.format_err(format!("bad newarray type {}", atype)))?;
                let component = Type::Primitive(self.vm.primitive(kind)?);
                let array = component.array_class()?;
                self.pop_kind(ValueKind::Int)?;
                self.push(ValueKind::Reference)?;
                self.emit(Op::NewArray(array));
            }
            bc::ANEWARRAY => {
                let idx = self.reader.u2()?;
                let component = self.class.class_at(idx)?;
                let array = component.array_class()?;
                self.pop_kind(ValueKind::Int)?;
                self.push(ValueKind::Reference)?;
                self.emit(Op::NewArray(array));
            }
            bc::MULTIANEWARRAY => {
                let idx = self.reader.u2()?;
                let dims = self.reader.u1()?;
                if dims == 0 {
                    return Err(self.format_err("multianewarray with zero dimensions"));
                }
                let class = self.class.class_at(idx)?.as_array()?;
                for _ in 0..dims {
                    self.pop_kind(ValueKind::Int)?;
                }
                self.push(ValueKind::Reference)?;
                self.emit(Op::MultiNewArray { class, dims });
            }
            bc::ARRAYLENGTH => {
                self.pop_kind(ValueKind::Reference)?;
                self.push(ValueKind::Int)?;
                self.emit(Op::ArrayLength);
            }

            bc::ATHROW => {
                self.pop_kind(ValueKind::Reference)?;
                self.end_path(Terminator::Throw);
            }

            bc::CHECKCAST => {
                let idx = self.reader.u2()?;
                let ty = self.class.class_at(idx)?;
                let top = *self.top(0)?;
                if top != ValueKind::Reference {
                    return Err(self.format_err("checkcast of a non-reference"));
                }
                self.emit(Op::CheckCast(ty));
            }
            bc::INSTANCEOF => {
                let idx = self.reader.u2()?;
                let ty = self.class.class_at(idx)?;
                self.pop_kind(ValueKind::Reference)?;
                self.push(ValueKind::Int)?;
                self.emit(Op::InstanceOf(ty));
            }

            bc::MONITORENTER => {
                self.pop_kind(ValueKind::Reference)?;
                self.emit(Op::MonitorEnter);
            }
            bc::MONITOREXIT => {
                self.pop_kind(ValueKind::Reference)?;
                self.emit(Op::MonitorExit);
            }

            bc::WIDE => {
                let wide_op = self.reader.u1()?;
                let index = self.reader.u2()?;
                match wide_op {
                    bc::ILOAD => self.local_load(ValueKind::Int, index)?,
                    bc::LLOAD => self.local_load(ValueKind::Long, index)?,
                    bc::FLOAD => self.local_load(ValueKind::Float, index)?,
                    bc::DLOAD => self.local_load(ValueKind::Double, index)?,
                    bc::ALOAD => self.local_load(ValueKind::Reference, index)?,
                    bc::ISTORE => self.local_store(ValueKind::Int, index)?,
                    bc::LSTORE => self.local_store(ValueKind::Long, index)?,
                    bc::FSTORE => self.local_store(ValueKind::Float, index)?,
                    bc::DSTORE => self.local_store(ValueKind::Double, index)?,
                    bc::ASTORE => self.local_store(ValueKind::Reference, index)?,
                    bc::IINC => {
                        let amount = self.reader.s2()?;
                        self.iinc(index, amount)?;
                    }
                    other => {
                        return Err(self.format_err(format!(
                            "unsupported wide opcode '{}'",
                            bc::name(other)
                        )))
                    }
                }
            }

            bc::JSR | bc::RET | bc::JSR_W => {
                return Err(self.format_err(format!(
                    "unsupported opcode '{}' ({})",
                    bc::name(opcode),
                    opcode
                )))
            }
            bc::INVOKEDYNAMIC => {
                return Err(self.format_err("unsupported opcode 'invokedynamic'"))
            }
            other => {
                return Err(self.format_err(format!(
                    "unknown opcode '{}' ({})",
                    bc::name(other),
                    other
                )))
            }
        }
        Ok(())
    }

    // ---- opcode helpers ----

    fn top(&self, depth: usize) -> VmResult<&ValueKind> {
        if self.stack.len() <= depth {
            return Err(self.format_err("operand stack underflow"));
        }
        Ok(&self.stack[self.stack.len() - depth - 1])
    }

    fn pop_cat1(&mut self) -> VmResult<ValueKind> {
        let kind = self.pop()?;
        if kind.is_wide() {
            return Err(self.format_err("category-2 value where category-1 expected"));
        }
        Ok(kind)
    }

    fn arith(&mut self, opcode: u8, family_base: u8, op: ArithOp) -> VmResult<()> {
        let kind = arith_kind(opcode - family_base);
        self.pop_kind(kind)?;
        self.pop_kind(kind)?;
        self.push(kind)?;
        self.emit(Op::Arith { kind, op });
        Ok(())
    }

    fn bitwise(&mut self, is_long: bool, op: ArithOp) -> VmResult<()> {
        let kind = if is_long {
            ValueKind::Long
        } else {
            ValueKind::Int
        };
        self.pop_kind(kind)?;
        self.pop_kind(kind)?;
        self.push(kind)?;
        self.emit(Op::Arith { kind, op });
        Ok(())
    }

    fn convert(&mut self, from: ValueKind, to: ConvTarget) -> VmResult<()> {
        self.pop_kind(from)?;
        self.push(to.value_kind())?;
        self.emit(Op::Convert { from, to });
        Ok(())
    }

    fn iinc(&mut self, index: u16, amount: i16) -> VmResult<()> {
        match self.locals.get(index as usize) {
            Some(Some(ValueKind::Int)) => {}
            _ => return Err(self.format_err(format!("iinc of non-int local {}", index))),
        }
        self.emit(Op::Iinc { index, amount });
        Ok(())
    }

    fn ldc(&mut self, idx: u16, wide: bool) -> VmResult<()> {
        match self.class.constant_at(idx)? {
            classfile::Constant::Integer(v) if !wide => {
                self.push(ValueKind::Int)?;
                self.emit(Op::IntConst(v));
            }
            classfile::Constant::Float(v) if !wide => {
                self.push(ValueKind::Float)?;
                self.emit(Op::FloatConst(v));
            }
            classfile::Constant::String(utf8) if !wide => {
                let text = self.class.pool()?.utf8_at(utf8)?.clone();
                self.push(ValueKind::Reference)?;
                self.emit(Op::StringConst(text));
            }
            classfile::Constant::Class(_) if !wide => {
                let ty = self.class.class_at(idx)?;
                self.push(ValueKind::Reference)?;
                self.emit(Op::ClassConst(ty));
            }
            classfile::Constant::Long(v) if wide => {
                self.push(ValueKind::Long)?;
                self.emit(Op::LongConst(v));
            }
            classfile::Constant::Double(v) if wide => {
                self.push(ValueKind::Double)?;
                self.emit(Op::DoubleConst(v));
            }
            other => {
                return Err(self.format_err(format!("wrong ldc constant type: {:?}", other)))
            }
        }
        Ok(())
    }

    fn array_load(&mut self, elem: ArrayElem) -> VmResult<()> {
        self.pop_kind(ValueKind::Int)?;
        self.pop_kind(ValueKind::Reference)?;
        self.push(elem.value_kind())?;
        self.emit(Op::ArrayLoad(elem));
        Ok(())
    }

    fn array_store(&mut self, elem: ArrayElem) -> VmResult<()> {
        self.pop_kind(elem.value_kind())?;
        self.pop_kind(ValueKind::Int)?;
        self.pop_kind(ValueKind::Reference)?;
        self.emit(Op::ArrayStore(elem));
        Ok(())
    }

    fn invoke(&mut self, idx: u16, kind: InvokeKind) -> VmResult<()> {
        let method = self.class.method_at(idx, kind == InvokeKind::Static)?;
        let desc = method.desc().clone();
        for param in desc.params.iter().rev() {
            self.pop_kind(param.value_kind())?;
        }
        if kind != InvokeKind::Static {
            self.pop_kind(ValueKind::Reference)?;
        }
        if let Some(ret) = desc.ret.value_kind_opt() {
            self.push(ret)?;
        }
        self.emit(Op::Invoke { kind, method });
        Ok(())
    }

    fn branch_target(&self, pc: usize, offset: i32) -> VmResult<usize> {
        let target = pc as i64 + offset as i64;
        if target < 0 || target as usize >= self.code_len {
            return Err(self.format_err(format!("branch target {} outside the code", target)));
        }
        Ok(target as usize)
    }

    /// Seals the current block with a two-way branch; translation
    /// continues in the fall-through block.
    fn cond_br(&mut self, pc: usize, offset: i32, invert: bool) -> VmResult<()> {
        let target_pc = self.branch_target(pc, offset)?;
        let fallthrough_pc = self.reader.tell();
        if fallthrough_pc >= self.code_len {
            return Err(self.format_err("conditional branch at the end of the code"));
        }
        let taken = self.forward_branch("if-true", target_pc, true, ShapeMode::Current)?;
        let fallthrough =
            self.forward_branch("if-false", fallthrough_pc, false, ShapeMode::Current)?;
        let (then_block, else_block) = if invert {
            (fallthrough, taken)
        } else {
            (taken, fallthrough)
        };
        self.seal(Terminator::Branch {
            then_block,
            else_block,
        });
        Ok(())
    }

    fn skip_switch_padding(&mut self, pc: usize) -> VmResult<()> {
        let pad = (4 - ((pc + 1) % 4)) % 4;
        self.reader.skip(pad)
    }
}

fn arith_kind(offset: u8) -> ValueKind {
    match offset {
        0 => ValueKind::Int,
        1 => ValueKind::Long,
        2 => ValueKind::Float,
        _ => ValueKind::Double,
    }
}

fn zero_cond(opcode: u8) -> Cond {
    match opcode {
        bc::IFEQ => Cond::Eq,
        bc::IFNE => Cond::Ne,
        bc::IFLT => Cond::Lt,
        bc::IFGE => Cond::Ge,
        bc::IFGT => Cond::Gt,
        _ => Cond::Le,
    }
}

fn icmp_cond(opcode: u8) -> Cond {
    match opcode {
        bc::IF_ICMPEQ => Cond::Eq,
        bc::IF_ICMPNE => Cond::Ne,
        bc::IF_ICMPLT => Cond::Lt,
        bc::IF_ICMPGE => Cond::Ge,
        bc::IF_ICMPGT => Cond::Gt,
        _ => Cond::Le,
    }
}

fn primitive_array_kind(atype: u8) -> Option<PrimitiveKind> {
    Some(match atype {
        4 => PrimitiveKind::Boolean,
        5 => PrimitiveKind::Char,
        6 => PrimitiveKind::Float,
        7 => PrimitiveKind::Double,
        8 => PrimitiveKind::Byte,
        9 => PrimitiveKind::Short,
        10 => PrimitiveKind::Int,
        11 => PrimitiveKind::Long,
        _ => return None,
    })
}
