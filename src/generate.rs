//! The per-opcode visitor that turns one function body into its metadata.
//!
//! The external decoder (wasmparser) has already validated the function;
//! this pass only re-walks the instruction stream once, forward, tracking
//! operand depth, resolving control-flow targets through the coalescer, and
//! emitting fixed-layout entries for every operand the interpreter should
//! not have to re-decode.

#[cfg(test)]
mod tests;

use rustc_hash::FxHashMap;
use wasmparser::{
    BinaryReader, BlockType, Catch, FuncType, HeapType, MemArg, Operator,
    ValType, WasmFeatures,
};

use crate::callconv::{tag, CallConvention, CallKind, CallSequenceEncoder, SlotWidth, ValueLoc};
use crate::coalesce::{Coalescer, Location, PendingPatch};
use crate::counter::OperandStackCounter;
use crate::entry::{
    ArrayEntry, ArrayNewFixedEntry, ArraySegmentEntry, BranchInfo, CallEntry, CallIndirectEntry,
    CallRefEntry, CastEntry, CatchEntry, Entry, GlobalEntry, IfEntry, Index32Entry, Index64Entry,
    JumpTarget, LengthEntry, RethrowEntry, StructFieldEntry, StructNewEntry, SwitchHeader,
    SwitchTargetInfo, TableCopyEntry, TableInitEntry, TailCallEntry, TailCallIndirectEntry,
    TailCallRefEntry, ThrowEntry,
};
use crate::error::CompileFailure;
use crate::metadata::{ExceptionHandler, FunctionMetadata, HandlerKind, ResumePoint};
use crate::module_info::ModuleInfo;
use crate::stream::{MetadataStream, Slot};

/// Raw opcodes the lazy drain defers on: a run of adjacent headers/footers
/// collapses into one resolution point.
const OP_BLOCK: u8 = 0x02;
const OP_END: u8 = 0x0b;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    TopLevel,
    Block,
    Loop,
    If,
    Else,
    Try,
    Catch,
    CatchAll,
    TryTable,
}

/// One open control construct.
struct ControlFrame {
    kind: FrameKind,
    params: u32,
    results: u32,
    /// Operand height just below this construct's params.
    base_height: u32,
    /// Coalescer record; unused for the top level.
    index: u32,
    pc: u32,
    mc: u32,
    try_depth: u32,
    /// PC of the first catch/delegate, closing the protected range.
    pc_end: u32,
    /// `if`: reserved header entry, patched at the arm boundary.
    if_slot: Option<Slot<IfEntry>>,
    /// `else`: reserved end-jump, patched when the construct closes.
    pending_exit: Option<Slot<JumpTarget>>,
    /// Byte length of the opening instruction.
    open_length: u8,
    /// Fall-through jumps past catch handlers, patched at the exit sweep.
    catch_fixups: Vec<PendingPatch>,
    /// try_table arms: handler kind and tag, in declaration order.
    try_table: Vec<(HandlerKind, u32)>,
}

impl ControlFrame {
    fn new(kind: FrameKind, params: u32, results: u32, base_height: u32) -> Self {
        ControlFrame {
            kind,
            params,
            results,
            base_height,
            index: u32::MAX,
            pc: 0,
            mc: 0,
            try_depth: 0,
            pc_end: 0,
            if_slot: None,
            pending_exit: None,
            open_length: 0,
            catch_fixups: Vec::new(),
            try_table: Vec::new(),
        }
    }

    /// Branch arity: loops take their params across a back edge, everything
    /// else its results.
    fn branch_arity(&self) -> u32 {
        if self.kind == FrameKind::Loop {
            self.params
        } else {
            self.results
        }
    }
}

pub(crate) struct MetadataGenerator<'a> {
    module: &'a ModuleInfo,
    body: &'a [u8],
    signature: &'a FuncType,

    stream: MetadataStream,
    counter: OperandStackCounter,
    coalescer: Coalescer,
    calls: CallSequenceEncoder,
    frames: Vec<ControlFrame>,

    /// Byte offset of PC 0 (end of local declarations).
    code_offset: u32,
    /// Bytes of `body` consumed once the top-level `end` is seen.
    consumed: usize,
    finished: bool,
    /// Depth of syntactic nesting inside unreachable code; zero when live.
    unreachable: u32,

    try_depth: u32,
    max_try_depth: u32,
    loop_count: u32,

    num_locals: u32,
    num_arguments: u32,
    argument_and_results_stack_bytes: u32,
    locals_program: Vec<u8>,
    return_program: Vec<u8>,

    exception_handlers: Vec<ExceptionHandler>,
    resume_points: FxHashMap<u32, ResumePoint>,
    call_targets: Vec<Option<u32>>,

    uses_rethrow: bool,
    uses_simd: bool,
    uses_tail_calls: bool,
    tail_call_clobbers_instance: bool,
}

fn round_up2(v: u32) -> u32 {
    (v + 1) & !1
}

fn is_ref(ty: ValType) -> bool {
    matches!(ty, ValType::Ref(_))
}

/// Compact heap-type code for cast entries: a module type index when
/// non-negative, an abstract heap type otherwise.
fn heap_type_code(hty: &HeapType) -> i32 {
    use wasmparser::AbstractHeapType as A;
    match hty {
        HeapType::Concrete(index) => index.as_module_index().unwrap_or(0) as i32,
        HeapType::Abstract { ty, .. } => match ty {
            A::Func => -1,
            A::Extern => -2,
            A::Any => -3,
            A::None => -4,
            A::NoExtern => -5,
            A::NoFunc => -6,
            A::Eq => -7,
            A::Struct => -8,
            A::Array => -9,
            A::I31 => -10,
            A::Exn => -11,
            A::NoExn => -12,
            A::Cont => -13,
            A::NoCont => -14,
        },
    }
}

impl<'a> MetadataGenerator<'a> {
    pub(crate) fn new(body: &'a [u8], signature: &'a FuncType, module: &'a ModuleInfo) -> Self {
        MetadataGenerator {
            module,
            body,
            signature,
            stream: MetadataStream::new(),
            counter: OperandStackCounter::default(),
            coalescer: Coalescer::default(),
            calls: CallSequenceEncoder::default(),
            frames: Vec::new(),
            code_offset: 0,
            consumed: 0,
            finished: false,
            unreachable: 0,
            try_depth: 0,
            max_try_depth: 0,
            loop_count: 0,
            num_locals: 0,
            num_arguments: 0,
            argument_and_results_stack_bytes: 0,
            locals_program: Vec::new(),
            return_program: Vec::new(),
            exception_handlers: Vec::new(),
            resume_points: FxHashMap::default(),
            call_targets: Vec::new(),
            uses_rethrow: false,
            uses_simd: false,
            uses_tail_calls: false,
            tail_call_clobbers_instance: false,
        }
    }

    pub(crate) fn compile(mut self) -> Result<FunctionMetadata, CompileFailure> {
        log::debug!(
            "generating metadata: {} body bytes, {} params, {} results",
            self.body.len(),
            self.signature.params().len(),
            self.signature.results().len()
        );
        let mut reader = BinaryReader::new_features(self.body, 0, WasmFeatures::all());
        self.read_arguments_and_locals(&mut reader)?;

        self.frames.push(ControlFrame::new(
            FrameKind::TopLevel,
            self.signature.params().len() as u32,
            self.signature.results().len() as u32,
            0,
        ));

        let mut ops = reader;
        while !ops.eof() {
            let start = ops.original_position();
            let op = ops.read_operator()?;
            let end = ops.original_position();
            if self.finished {
                return Err(CompileFailure::new(start, "instruction after function end"));
            }
            self.visit(op, start, end)?;
        }
        if !self.finished {
            return Err(CompileFailure::new(self.body.len(), "function body missing end"));
        }
        self.finalize()
    }

    /// Argument marshalling tags, return tags, and local declarations.
    fn read_arguments_and_locals(
        &mut self,
        reader: &mut BinaryReader<'a>,
    ) -> Result<(), CompileFailure> {
        let convention = CallConvention::for_signature(self.signature);
        self.argument_and_results_stack_bytes =
            convention.frame_size() - convention.header_bytes;

        for loc in &convention.params {
            self.locals_program.push(match *loc {
                ValueLoc::Gpr(i) => tag::ARG_GPR0 + i,
                ValueLoc::Fpr(i) => tag::ARG_FPR0 + i,
                ValueLoc::Stack {
                    width: SlotWidth::W8,
                    ..
                } => tag::LOCAL_STACK,
                ValueLoc::Stack {
                    width: SlotWidth::W16,
                    ..
                } => tag::LOCAL_STACK_VECTOR,
            });
        }
        self.locals_program.push(tag::LOCAL_END);
        self.num_arguments = self.signature.params().len() as u32;
        self.num_locals = self.num_arguments;

        for loc in &convention.results {
            self.return_program.push(match *loc {
                ValueLoc::Gpr(i) => tag::RESULT_GPR0 + i,
                ValueLoc::Fpr(i) => tag::RESULT_FPR0 + i,
                ValueLoc::Stack {
                    width: SlotWidth::W8,
                    ..
                } => tag::RESULT_STACK,
                ValueLoc::Stack {
                    width: SlotWidth::W16,
                    ..
                } => tag::RESULT_STACK_VECTOR,
            });
        }
        self.return_program.push(tag::RESULT_END);

        let groups = reader.read_var_u32()?;
        for _ in 0..groups {
            let count = reader.read_var_u32()?;
            let ty: ValType = reader.read()?;
            let flag = if is_ref(ty) { 0xff } else { 0x00 };
            for _ in 0..count {
                self.locals_program.push(flag);
            }
            self.num_locals += count;
        }
        self.code_offset = reader.original_position() as u32;
        Ok(())
    }

    fn finalize(mut self) -> Result<FunctionMetadata, CompileFailure> {
        assert!(
            self.coalescer.is_drained(),
            "control-flow fix-ups outstanding at finalize"
        );
        let num_rethrow_slots = if self.uses_rethrow {
            round_up2(self.max_try_depth)
        } else {
            0
        };
        // The interpreter allocates the rounded-up size; keep the trailing
        // local flags in step with it.
        if self.num_locals % 2 == 1 {
            self.locals_program.push(0);
        }
        let frame_size_in_v128 =
            round_up2(self.num_locals) / 2 + num_rethrow_slots / 2 + self.counter.max();

        log::debug!(
            "metadata finalized: {} entry bytes, frame {} v128 units, {} handler(s)",
            self.stream.mc(),
            frame_size_in_v128,
            self.exception_handlers.len()
        );

        Ok(FunctionMetadata {
            entries: self.stream.into_bytes(),
            locals_program: self.locals_program,
            return_program: self.return_program,
            exception_handlers: self.exception_handlers,
            resume_points: self.resume_points,
            call_targets: self.call_targets,
            frame_size_in_v128,
            bytecode: self.body[..self.consumed].to_vec(),
            code_offset: self.code_offset,
            num_locals: self.num_locals,
            num_arguments: self.num_arguments,
            num_rethrow_slots,
            argument_and_results_stack_bytes: self.argument_and_results_stack_bytes,
            max_operand_depth: self.counter.max(),
            uses_simd: self.uses_simd,
            uses_tail_calls: self.uses_tail_calls,
            tail_call_clobbers_instance: self.tail_call_clobbers_instance,
        })
    }

    // --- Cursor helpers -----------------------------------------------

    fn pc(&self, offset: usize) -> u32 {
        offset as u32 - self.code_offset
    }

    fn instr_len(&self, start: usize, end: usize) -> Result<u8, CompileFailure> {
        u8::try_from(end - start)
            .map_err(|_| CompileFailure::new(start, "instruction too long for metadata"))
    }

    /// Lazy drain: resolve queued control-flow targets at the location
    /// following `end`, unless the next opcode is another header or an
    /// `end` (batch runs of adjacent headers into one point).
    fn maybe_drain(&mut self, end: usize) {
        match self.body.get(end) {
            Some(&next) if next != OP_BLOCK && next != OP_END => {
                let here = Location {
                    pc: self.pc(end),
                    mc: self.stream.mc(),
                };
                self.coalescer.drain(here, &mut self.stream);
            }
            _ => {}
        }
    }

    fn block_counts(&self, ty: BlockType, offset: usize) -> Result<(u32, u32), CompileFailure> {
        Ok(match ty {
            BlockType::Empty => (0, 0),
            BlockType::Type(_) => (0, 1),
            BlockType::FuncType(index) => {
                let sig = self.module.func_type(index, offset)?;
                (sig.params().len() as u32, sig.results().len() as u32)
            }
        })
    }

    fn base_below_params(&self, params: u32, offset: usize) -> Result<u32, CompileFailure> {
        self.counter
            .height()
            .checked_sub(params)
            .ok_or_else(|| CompileFailure::new(offset, "block params exceed operand stack"))
    }

    // --- Entry emission helpers ---------------------------------------

    fn push_const32(&mut self, value: u32, start: usize, end: usize) -> Result<(), CompileFailure> {
        let length = self.instr_len(start, end)? as u32;
        self.stream.push(Index32Entry { value, length });
        Ok(())
    }

    fn push_const64(&mut self, value: u64, start: usize, end: usize) -> Result<(), CompileFailure> {
        let length = self.instr_len(start, end)? as u64;
        self.stream.push(Index64Entry { value, length });
        Ok(())
    }

    fn push_length(&mut self, start: usize, end: usize) -> Result<(), CompileFailure> {
        let length = self.instr_len(start, end)?;
        self.stream.push(LengthEntry { length });
        Ok(())
    }

    /// Memory-access offset: width follows the memory's addressing mode.
    fn push_memarg(&mut self, memarg: &MemArg, start: usize, end: usize) -> Result<(), CompileFailure> {
        if self.module.memory64(memarg.memory) {
            self.push_const64(memarg.offset, start, end)
        } else {
            self.push_const32(memarg.offset as u32, start, end)
        }
    }

    fn next_profile(&mut self, target: Option<u32>) -> u32 {
        let profile = self.call_targets.len() as u32;
        self.call_targets.push(target);
        profile
    }

    // --- Visitor ------------------------------------------------------

    fn visit(&mut self, op: Operator, start: usize, end: usize) -> Result<(), CompileFailure> {
        if self.unreachable > 0 {
            return self.visit_unreachable_op(op, start, end);
        }
        match op {
            // Control structure
            Operator::Unreachable => self.unreachable = 1,
            Operator::Nop => {}
            Operator::Block { blockty } => self.visit_block(blockty, start, end)?,
            Operator::Loop { blockty } => self.visit_loop(blockty, start, end)?,
            Operator::If { blockty } => self.visit_if(blockty, start, end)?,
            Operator::Else => self.visit_else(start, end)?,
            Operator::End => self.visit_end(start, end)?,

            // Branch family
            Operator::Br { relative_depth } => {
                self.visit_branch(relative_depth, start, end)?;
                self.unreachable = 1;
            }
            Operator::BrIf { relative_depth } => {
                self.counter.adjust(-1);
                self.visit_branch(relative_depth, start, end)?;
            }
            Operator::BrTable { targets } => {
                self.visit_switch(&targets, start)?;
                self.unreachable = 1;
            }
            Operator::Return => self.unreachable = 1,
            Operator::BrOnNull { relative_depth } => {
                self.visit_branch_null(relative_depth, false, start, end)?;
            }
            Operator::BrOnNonNull { relative_depth } => {
                self.visit_branch_null(relative_depth, true, start, end)?;
            }
            Operator::BrOnCast {
                relative_depth,
                to_ref_type,
                ..
            }
            | Operator::BrOnCastFail {
                relative_depth,
                to_ref_type,
                ..
            } => {
                self.stream.push(CastEntry {
                    heap_type: heap_type_code(&to_ref_type.heap_type()),
                    length: 0,
                });
                self.visit_branch(relative_depth, start, end)?;
            }

            // Exceptions
            Operator::Try { blockty } => self.visit_try(blockty, start, end)?,
            Operator::Catch { tag_index } => self.visit_catch(Some(tag_index), start, end)?,
            Operator::CatchAll => self.visit_catch(None, start, end)?,
            Operator::Delegate { relative_depth } => {
                self.visit_delegate(relative_depth, start, end)?;
            }
            Operator::Rethrow { relative_depth } => {
                self.visit_rethrow(relative_depth, start)?;
                self.unreachable = 1;
            }
            Operator::Throw { tag_index } => {
                self.module.tag_signature(tag_index, start)?;
                self.stream.push(ThrowEntry { tag_index });
                self.unreachable = 1;
            }
            Operator::ThrowRef => {
                self.counter.adjust(-1);
                self.unreachable = 1;
            }
            Operator::TryTable { try_table } => self.visit_try_table(try_table, start, end)?,

            // Calls
            Operator::Call { function_index } => {
                self.visit_call(function_index, CallKind::Call, start, end)?;
            }
            Operator::ReturnCall { function_index } => {
                self.visit_call(function_index, CallKind::TailCall, start, end)?;
                self.unreachable = 1;
            }
            Operator::CallIndirect {
                type_index,
                table_index,
            } => {
                self.visit_call_indirect(type_index, table_index, CallKind::Call, start, end)?;
            }
            Operator::ReturnCallIndirect {
                type_index,
                table_index,
            } => {
                self.visit_call_indirect(type_index, table_index, CallKind::TailCall, start, end)?;
                self.unreachable = 1;
            }
            Operator::CallRef { type_index } => {
                self.visit_call_ref(type_index, CallKind::Call, start, end)?;
            }
            Operator::ReturnCallRef { type_index } => {
                self.visit_call_ref(type_index, CallKind::TailCall, start, end)?;
                self.unreachable = 1;
            }

            // Parametric
            Operator::Drop => self.counter.adjust(-1),
            Operator::Select | Operator::TypedSelect { .. } => {
                self.counter.adjust(-2);
                self.push_length(start, end)?;
            }

            // Locals: indices are small; the interpreter decodes them on
            // the fly instead of reading metadata.
            Operator::LocalGet { .. } => self.counter.adjust(1),
            Operator::LocalSet { .. } => self.counter.adjust(-1),
            Operator::LocalTee { .. } => {}

            // Globals
            Operator::GlobalGet { global_index } => {
                self.counter.adjust(1);
                self.push_global(global_index, false, start, end)?;
            }
            Operator::GlobalSet { global_index } => {
                self.counter.adjust(-1);
                self.push_global(global_index, true, start, end)?;
            }

            // Tables
            Operator::TableGet { table } => {
                self.check_table(table, start)?;
                self.push_const32(table, start, end)?;
            }
            Operator::TableSet { table } => {
                self.check_table(table, start)?;
                self.counter.adjust(-2);
                self.push_const32(table, start, end)?;
            }
            Operator::TableSize { table } => {
                self.check_table(table, start)?;
                self.counter.adjust(1);
                self.push_const32(table, start, end)?;
            }
            Operator::TableGrow { table } => {
                self.check_table(table, start)?;
                self.counter.adjust(-1);
                self.push_const32(table, start, end)?;
            }
            Operator::TableFill { table } => {
                self.check_table(table, start)?;
                self.counter.adjust(-3);
                self.push_const32(table, start, end)?;
            }
            Operator::TableCopy {
                dst_table,
                src_table,
            } => {
                self.check_table(dst_table, start)?;
                self.check_table(src_table, start)?;
                self.counter.adjust(-3);
                let length = self.instr_len(start, end)?;
                self.stream.push(TableCopyEntry {
                    dst_table,
                    src_table,
                    length,
                });
            }
            Operator::TableInit { elem_index, table } => {
                self.check_table(table, start)?;
                self.counter.adjust(-3);
                let length = self.instr_len(start, end)?;
                self.stream.push(TableInitEntry {
                    elem_index,
                    table_index: table,
                    length,
                });
            }
            Operator::ElemDrop { elem_index } => {
                self.push_const32(elem_index, start, end)?;
            }

            // Memory loads: pop address, push value.
            Operator::I32Load { memarg }
            | Operator::I64Load { memarg }
            | Operator::F32Load { memarg }
            | Operator::F64Load { memarg }
            | Operator::I32Load8S { memarg }
            | Operator::I32Load8U { memarg }
            | Operator::I32Load16S { memarg }
            | Operator::I32Load16U { memarg }
            | Operator::I64Load8S { memarg }
            | Operator::I64Load8U { memarg }
            | Operator::I64Load16S { memarg }
            | Operator::I64Load16U { memarg }
            | Operator::I64Load32S { memarg }
            | Operator::I64Load32U { memarg } => self.push_memarg(&memarg, start, end)?,

            // Memory stores: pop address and value.
            Operator::I32Store { memarg }
            | Operator::I64Store { memarg }
            | Operator::F32Store { memarg }
            | Operator::F64Store { memarg }
            | Operator::I32Store8 { memarg }
            | Operator::I32Store16 { memarg }
            | Operator::I64Store8 { memarg }
            | Operator::I64Store16 { memarg }
            | Operator::I64Store32 { memarg } => {
                self.counter.adjust(-2);
                self.push_memarg(&memarg, start, end)?;
            }

            Operator::MemorySize { .. } => self.counter.adjust(1),
            Operator::MemoryGrow { .. } => {}
            Operator::MemoryFill { .. } | Operator::MemoryCopy { .. } => {
                self.counter.adjust(-3);
                self.push_length(start, end)?;
            }
            Operator::MemoryInit { data_index, .. } => {
                self.counter.adjust(-3);
                self.push_const32(data_index, start, end)?;
            }
            Operator::DataDrop { data_index } => {
                self.push_const32(data_index, start, end)?;
            }

            // Constants: pre-decoded so the interpreter never re-reads LEB.
            Operator::I32Const { value } => {
                self.counter.adjust(1);
                self.push_const32(value as u32, start, end)?;
            }
            Operator::I64Const { value } => {
                self.counter.adjust(1);
                self.push_const64(value as u64, start, end)?;
            }
            Operator::F32Const { value } => {
                self.counter.adjust(1);
                self.push_const32(value.bits(), start, end)?;
            }
            Operator::F64Const { value } => {
                self.counter.adjust(1);
                self.push_const64(value.bits(), start, end)?;
            }
            Operator::V128Const { .. } => {
                // The raw 16 bytes sit in the instruction stream already.
                self.uses_simd = true;
                self.counter.adjust(1);
            }

            // References
            Operator::RefNull { .. } => {
                self.counter.adjust(1);
                self.push_const64(0, start, end)?;
            }
            Operator::RefIsNull | Operator::RefAsNonNull => {}
            Operator::RefFunc { function_index } => {
                self.module.function_signature(function_index, start)?;
                self.counter.adjust(1);
                self.push_const32(function_index, start, end)?;
            }
            Operator::RefEq => self.counter.adjust(-1),

            // GC structs
            Operator::StructNew { struct_type_index } => {
                let fields = self.module.struct_field_count(struct_type_index, start)?;
                self.counter.adjust(1 - fields as i32);
                let length = self.instr_len(start, end)?;
                self.stream.push(StructNewEntry {
                    type_index: struct_type_index,
                    field_count: fields as u16,
                    length,
                });
            }
            Operator::StructNewDefault { struct_type_index } => {
                let fields = self.module.struct_field_count(struct_type_index, start)?;
                self.counter.adjust(1);
                let length = self.instr_len(start, end)?;
                self.stream.push(StructNewEntry {
                    type_index: struct_type_index,
                    field_count: fields as u16,
                    length,
                });
            }
            Operator::StructGet { field_index, .. }
            | Operator::StructGetS { field_index, .. }
            | Operator::StructGetU { field_index, .. } => {
                let length = self.instr_len(start, end)?;
                self.stream.push(StructFieldEntry {
                    field_index,
                    length,
                });
            }
            Operator::StructSet { field_index, .. } => {
                self.counter.adjust(-2);
                let length = self.instr_len(start, end)?;
                self.stream.push(StructFieldEntry {
                    field_index,
                    length,
                });
            }

            // GC arrays
            Operator::ArrayNew { array_type_index } => {
                self.counter.adjust(-1);
                self.push_array(array_type_index, start, end)?;
            }
            Operator::ArrayNewDefault { array_type_index } => {
                self.push_array(array_type_index, start, end)?;
            }
            Operator::ArrayNewFixed {
                array_type_index,
                array_size,
            } => {
                self.counter.adjust(1 - array_size as i32);
                let length = self.instr_len(start, end)?;
                self.stream.push(ArrayNewFixedEntry {
                    type_index: array_type_index,
                    arg_count: array_size,
                    length,
                });
            }
            Operator::ArrayNewData {
                array_type_index,
                array_data_index,
            } => {
                self.counter.adjust(-1);
                self.push_array_segment(array_type_index, array_data_index, start, end)?;
            }
            Operator::ArrayNewElem {
                array_type_index,
                array_elem_index,
            } => {
                self.counter.adjust(-1);
                self.push_array_segment(array_type_index, array_elem_index, start, end)?;
            }
            Operator::ArrayGet { array_type_index }
            | Operator::ArrayGetS { array_type_index }
            | Operator::ArrayGetU { array_type_index } => {
                self.counter.adjust(-1);
                self.push_array(array_type_index, start, end)?;
            }
            Operator::ArraySet { array_type_index } => {
                self.counter.adjust(-3);
                self.push_array(array_type_index, start, end)?;
            }
            Operator::ArrayLen => {}
            Operator::ArrayFill { .. } => {
                self.counter.adjust(-4);
                self.push_length(start, end)?;
            }
            Operator::ArrayCopy { .. } => {
                self.counter.adjust(-5);
                self.push_length(start, end)?;
            }
            Operator::ArrayInitData {
                array_type_index,
                array_data_index,
            } => {
                self.counter.adjust(-4);
                self.push_array_segment(array_type_index, array_data_index, start, end)?;
            }
            Operator::ArrayInitElem {
                array_type_index,
                array_elem_index,
            } => {
                self.counter.adjust(-4);
                self.push_array_segment(array_type_index, array_elem_index, start, end)?;
            }

            // GC casts and scalars
            Operator::RefTestNonNull { hty }
            | Operator::RefTestNullable { hty }
            | Operator::RefCastNonNull { hty }
            | Operator::RefCastNullable { hty } => {
                let length = self.instr_len(start, end)?;
                self.stream.push(CastEntry {
                    heap_type: heap_type_code(&hty),
                    length,
                });
            }
            Operator::RefI31 | Operator::I31GetS | Operator::I31GetU => {}
            Operator::AnyConvertExtern | Operator::ExternConvertAny => {}

            // Saturating truncation carries a two-byte opcode; the
            // interpreter skips it via the length entry.
            Operator::I32TruncSatF32S
            | Operator::I32TruncSatF32U
            | Operator::I32TruncSatF64S
            | Operator::I32TruncSatF64U
            | Operator::I64TruncSatF32S
            | Operator::I64TruncSatF32U
            | Operator::I64TruncSatF64S
            | Operator::I64TruncSatF64U => self.push_length(start, end)?,

            // Atomics
            Operator::MemoryAtomicNotify { memarg } => {
                self.counter.adjust(-1);
                self.push_memarg(&memarg, start, end)?;
            }
            Operator::MemoryAtomicWait32 { memarg } | Operator::MemoryAtomicWait64 { memarg } => {
                self.counter.adjust(-2);
                self.push_memarg(&memarg, start, end)?;
            }
            Operator::AtomicFence => self.push_length(start, end)?,

            Operator::I32AtomicLoad { memarg }
            | Operator::I32AtomicLoad8U { memarg }
            | Operator::I32AtomicLoad16U { memarg }
            | Operator::I64AtomicLoad { memarg }
            | Operator::I64AtomicLoad8U { memarg }
            | Operator::I64AtomicLoad16U { memarg }
            | Operator::I64AtomicLoad32U { memarg } => self.push_memarg(&memarg, start, end)?,

            Operator::I32AtomicStore { memarg }
            | Operator::I32AtomicStore8 { memarg }
            | Operator::I32AtomicStore16 { memarg }
            | Operator::I64AtomicStore { memarg }
            | Operator::I64AtomicStore8 { memarg }
            | Operator::I64AtomicStore16 { memarg }
            | Operator::I64AtomicStore32 { memarg } => {
                self.counter.adjust(-2);
                self.push_memarg(&memarg, start, end)?;
            }

            Operator::I32AtomicRmwAdd { memarg }
            | Operator::I32AtomicRmw8AddU { memarg }
            | Operator::I32AtomicRmw16AddU { memarg }
            | Operator::I64AtomicRmwAdd { memarg }
            | Operator::I64AtomicRmw8AddU { memarg }
            | Operator::I64AtomicRmw16AddU { memarg }
            | Operator::I64AtomicRmw32AddU { memarg }
            | Operator::I32AtomicRmwSub { memarg }
            | Operator::I32AtomicRmw8SubU { memarg }
            | Operator::I32AtomicRmw16SubU { memarg }
            | Operator::I64AtomicRmwSub { memarg }
            | Operator::I64AtomicRmw8SubU { memarg }
            | Operator::I64AtomicRmw16SubU { memarg }
            | Operator::I64AtomicRmw32SubU { memarg }
            | Operator::I32AtomicRmwAnd { memarg }
            | Operator::I32AtomicRmw8AndU { memarg }
            | Operator::I32AtomicRmw16AndU { memarg }
            | Operator::I64AtomicRmwAnd { memarg }
            | Operator::I64AtomicRmw8AndU { memarg }
            | Operator::I64AtomicRmw16AndU { memarg }
            | Operator::I64AtomicRmw32AndU { memarg }
            | Operator::I32AtomicRmwOr { memarg }
            | Operator::I32AtomicRmw8OrU { memarg }
            | Operator::I32AtomicRmw16OrU { memarg }
            | Operator::I64AtomicRmwOr { memarg }
            | Operator::I64AtomicRmw8OrU { memarg }
            | Operator::I64AtomicRmw16OrU { memarg }
            | Operator::I64AtomicRmw32OrU { memarg }
            | Operator::I32AtomicRmwXor { memarg }
            | Operator::I32AtomicRmw8XorU { memarg }
            | Operator::I32AtomicRmw16XorU { memarg }
            | Operator::I64AtomicRmwXor { memarg }
            | Operator::I64AtomicRmw8XorU { memarg }
            | Operator::I64AtomicRmw16XorU { memarg }
            | Operator::I64AtomicRmw32XorU { memarg }
            | Operator::I32AtomicRmwXchg { memarg }
            | Operator::I32AtomicRmw8XchgU { memarg }
            | Operator::I32AtomicRmw16XchgU { memarg }
            | Operator::I64AtomicRmwXchg { memarg }
            | Operator::I64AtomicRmw8XchgU { memarg }
            | Operator::I64AtomicRmw16XchgU { memarg }
            | Operator::I64AtomicRmw32XchgU { memarg } => {
                self.counter.adjust(-1);
                self.push_memarg(&memarg, start, end)?;
            }

            Operator::I32AtomicRmwCmpxchg { memarg }
            | Operator::I32AtomicRmw8CmpxchgU { memarg }
            | Operator::I32AtomicRmw16CmpxchgU { memarg }
            | Operator::I64AtomicRmwCmpxchg { memarg }
            | Operator::I64AtomicRmw8CmpxchgU { memarg }
            | Operator::I64AtomicRmw16CmpxchgU { memarg }
            | Operator::I64AtomicRmw32CmpxchgU { memarg } => {
                self.counter.adjust(-2);
                self.push_memarg(&memarg, start, end)?;
            }

            // SIMD memory access
            Operator::V128Load { memarg }
            | Operator::V128Load8x8S { memarg }
            | Operator::V128Load8x8U { memarg }
            | Operator::V128Load16x4S { memarg }
            | Operator::V128Load16x4U { memarg }
            | Operator::V128Load32x2S { memarg }
            | Operator::V128Load32x2U { memarg }
            | Operator::V128Load8Splat { memarg }
            | Operator::V128Load16Splat { memarg }
            | Operator::V128Load32Splat { memarg }
            | Operator::V128Load64Splat { memarg }
            | Operator::V128Load32Zero { memarg }
            | Operator::V128Load64Zero { memarg } => {
                self.uses_simd = true;
                self.push_memarg(&memarg, start, end)?;
            }
            Operator::V128Store { memarg } => {
                self.uses_simd = true;
                self.counter.adjust(-2);
                self.push_memarg(&memarg, start, end)?;
            }
            Operator::V128Load8Lane { memarg, .. }
            | Operator::V128Load16Lane { memarg, .. }
            | Operator::V128Load32Lane { memarg, .. }
            | Operator::V128Load64Lane { memarg, .. } => {
                self.uses_simd = true;
                self.counter.adjust(-1);
                self.push_memarg(&memarg, start, end)?;
            }
            Operator::V128Store8Lane { memarg, .. }
            | Operator::V128Store16Lane { memarg, .. }
            | Operator::V128Store32Lane { memarg, .. }
            | Operator::V128Store64Lane { memarg, .. } => {
                self.uses_simd = true;
                self.counter.adjust(-2);
                self.push_memarg(&memarg, start, end)?;
            }

            // Pure computation: a net stack delta, no metadata.
            op => {
                if let Some(delta) = plain_stack_delta(&op) {
                    self.counter.adjust(delta);
                } else if let Some(delta) = simd_stack_delta(&op) {
                    self.uses_simd = true;
                    self.counter.adjust(delta);
                } else {
                    return Err(CompileFailure::new(
                        start,
                        format!("unsupported instruction {op:?}"),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Inside unreachable code only the syntactic structure matters: track
    /// nesting, and hand the boundary that re-enters live code back to the
    /// normal paths.
    fn visit_unreachable_op(
        &mut self,
        op: Operator,
        start: usize,
        end: usize,
    ) -> Result<(), CompileFailure> {
        match op {
            Operator::Block { .. }
            | Operator::Loop { .. }
            | Operator::If { .. }
            | Operator::Try { .. }
            | Operator::TryTable { .. } => self.unreachable += 1,
            Operator::Else if self.unreachable == 1 => {
                self.unreachable = 0;
                self.visit_else(start, end)?;
            }
            Operator::Catch { tag_index } if self.unreachable == 1 => {
                self.unreachable = 0;
                self.visit_catch(Some(tag_index), start, end)?;
            }
            Operator::CatchAll if self.unreachable == 1 => {
                self.unreachable = 0;
                self.visit_catch(None, start, end)?;
            }
            Operator::Delegate { relative_depth } if self.unreachable == 1 => {
                self.unreachable = 0;
                self.visit_delegate(relative_depth, start, end)?;
            }
            // A deeper delegate closes one syntactic level, like end.
            Operator::Delegate { .. } => self.unreachable -= 1,
            Operator::End => {
                if self.unreachable == 1 {
                    self.unreachable = 0;
                    self.visit_end(start, end)?;
                } else {
                    self.unreachable -= 1;
                }
            }
            _ => {}
        }
        Ok(())
    }

    // --- Control structure --------------------------------------------

    fn visit_block(&mut self, ty: BlockType, start: usize, end: usize) -> Result<(), CompileFailure> {
        let (params, results) = self.block_counts(ty, start)?;
        let base = self.base_below_params(params, start)?;
        let pc = self.pc(start);

        let index = self.coalescer.open_construct();
        let mut frame = ControlFrame::new(FrameKind::Block, params, results, base);
        frame.index = index;
        frame.pc = pc;
        frame.mc = self.stream.mc();
        frame.try_depth = self.try_depth;

        // The block's own header entry: skip to the first real instruction.
        let slot = self.stream.reserve(JumpTarget::PENDING);
        self.coalescer.await_entry(index, PendingPatch { pc, slot });
        self.frames.push(frame);

        self.maybe_drain(end);
        Ok(())
    }

    fn visit_loop(&mut self, ty: BlockType, start: usize, end: usize) -> Result<(), CompileFailure> {
        let (params, results) = self.block_counts(ty, start)?;
        let base = self.base_below_params(params, start)?;
        let pc = self.pc(start);
        let length = self.instr_len(start, end)?;

        // A loop's entry is itself: back edges re-execute the header.
        let entry = Location {
            pc,
            mc: self.stream.mc(),
        };
        let index = self.coalescer.open_loop(entry);
        let mut frame = ControlFrame::new(FrameKind::Loop, params, results, base);
        frame.index = index;
        frame.pc = pc;
        frame.mc = entry.mc;
        frame.try_depth = self.try_depth;
        self.frames.push(frame);

        self.stream.push(LengthEntry { length });

        // Resumption bookkeeping: offset + 1 so zero can mean "absent".
        self.resume_points.insert(
            pc + 1,
            ResumePoint {
                loop_index: self.loop_count,
                live_values: self.counter.height(),
                try_depth: self.try_depth,
            },
        );
        self.loop_count += 1;
        Ok(())
    }

    fn visit_if(&mut self, ty: BlockType, start: usize, end: usize) -> Result<(), CompileFailure> {
        self.counter.adjust(-1); // condition
        let (params, results) = self.block_counts(ty, start)?;
        let base = self.base_below_params(params, start)?;
        let length = self.instr_len(start, end)?;

        let index = self.coalescer.open_construct();
        let mut frame = ControlFrame::new(FrameKind::If, params, results, base);
        frame.index = index;
        frame.pc = self.pc(start);
        frame.mc = self.stream.mc();
        frame.try_depth = self.try_depth;
        frame.open_length = length;
        frame.if_slot = Some(self.stream.reserve(IfEntry::PENDING));
        self.frames.push(frame);
        Ok(())
    }

    fn visit_else(&mut self, start: usize, end: usize) -> Result<(), CompileFailure> {
        let pc = self.pc(start);
        let next_pc = self.pc(end);
        let else_mc = self.stream.mc();
        let frame = self
            .frames
            .last_mut()
            .filter(|f| f.kind == FrameKind::If)
            .ok_or_else(|| CompileFailure::new(start, "else outside if"))?;

        // The false edge of the `if`: first instruction of this arm,
        // skipping the arm's own end-jump entry.
        let slot = frame.if_slot.take().expect("if header pending");
        let header = IfEntry {
            else_delta_pc: next_pc - frame.pc,
            else_delta_mc: (else_mc + JumpTarget::SIZE as u32) - frame.mc,
            length: frame.open_length,
        };

        frame.kind = FrameKind::Else;
        frame.pc = pc;
        frame.mc = else_mc;
        let base = frame.base_height;
        let params = frame.params;

        self.stream.patch(slot, header);
        let exit = self.stream.reserve(JumpTarget::PENDING);
        self.frames
            .last_mut()
            .expect("frame still open")
            .pending_exit = Some(exit);

        self.counter.set_height(base);
        self.counter.adjust(params as i32);
        Ok(())
    }

    fn visit_end(&mut self, start: usize, end: usize) -> Result<(), CompileFailure> {
        let pc = self.pc(start);
        let next_pc = self.pc(end);
        let frame = self
            .frames
            .pop()
            .ok_or_else(|| CompileFailure::new(start, "unbalanced end"))?;

        self.counter.set_height(frame.base_height);
        self.counter.adjust(frame.results as i32);

        match frame.kind {
            FrameKind::TopLevel => {
                // Every remaining edge lands on the terminal end, whose
                // metadata is the return marshalling entry.
                let here = Location {
                    pc,
                    mc: self.stream.mc(),
                };
                self.coalescer.drain_final(here, &mut self.stream);
                self.push_return_entry();
                self.consumed = end;
                self.finished = true;
                return Ok(());
            }
            FrameKind::Block | FrameKind::Loop => {
                self.coalescer.close(frame.index);
            }
            FrameKind::If => {
                // No else arm: the false edge falls through to right here.
                let slot = frame.if_slot.expect("if header pending");
                self.stream.patch(
                    slot,
                    IfEntry {
                        else_delta_pc: next_pc - frame.pc,
                        else_delta_mc: self.stream.mc() - frame.mc,
                        length: frame.open_length,
                    },
                );
                self.coalescer.close(frame.index);
            }
            FrameKind::Else => {
                let slot = frame.pending_exit.expect("else end-jump pending");
                self.coalescer.defer_exit(PendingPatch { pc: frame.pc, slot });
                self.coalescer.close(frame.index);
            }
            FrameKind::Try | FrameKind::Catch | FrameKind::CatchAll => {
                self.try_depth -= 1;
                for fixup in frame.catch_fixups {
                    self.coalescer.defer_exit(fixup);
                }
                self.coalescer.close(frame.index);
            }
            FrameKind::TryTable => {
                self.close_try_table(&frame, pc);
                self.try_depth -= 1;
                self.coalescer.close(frame.index);
            }
        }
        self.maybe_drain(end);
        Ok(())
    }

    /// Terminal return marshalling: a two-byte size, then one location tag
    /// per result.
    fn push_return_entry(&mut self) {
        let mut bytes = Vec::with_capacity(2 + self.return_program.len());
        bytes.extend_from_slice(&((2 + self.return_program.len()) as u16).to_le_bytes());
        bytes.extend_from_slice(&self.return_program);
        self.stream.push_bytes(&bytes);
    }

    // --- Exceptions ---------------------------------------------------

    fn visit_try(&mut self, ty: BlockType, start: usize, end: usize) -> Result<(), CompileFailure> {
        self.try_depth += 1;
        self.max_try_depth = self.max_try_depth.max(self.try_depth);

        let (params, results) = self.block_counts(ty, start)?;
        let base = self.base_below_params(params, start)?;
        let length = self.instr_len(start, end)?;

        let index = self.coalescer.open_construct();
        let mut frame = ControlFrame::new(FrameKind::Try, params, results, base);
        frame.index = index;
        frame.pc = self.pc(start);
        frame.mc = self.stream.mc();
        frame.try_depth = self.try_depth;
        self.frames.push(frame);

        self.stream.push(LengthEntry { length });
        self.maybe_drain(end);
        Ok(())
    }

    fn visit_catch(
        &mut self,
        tag_index: Option<u32>,
        start: usize,
        end: usize,
    ) -> Result<(), CompileFailure> {
        let pc = self.pc(start);
        let next_pc = self.pc(end);
        let args = match tag_index {
            Some(tag) => self.module.tag_signature(tag, start)?.params().len() as u32,
            None => 0,
        };

        let num_locals = self.num_locals;
        let try_depth = self.try_depth;
        let frame = self
            .frames
            .last_mut()
            .filter(|f| {
                matches!(
                    f.kind,
                    FrameKind::Try | FrameKind::Catch | FrameKind::CatchAll
                )
            })
            .ok_or_else(|| CompileFailure::new(start, "catch outside try"))?;

        if frame.kind == FrameKind::Try {
            // The protected range closes at the first catch.
            frame.pc_end = pc;
        }
        frame.kind = if tag_index.is_some() {
            FrameKind::Catch
        } else {
            FrameKind::CatchAll
        };

        self.counter.set_height(frame.base_height);
        self.counter.adjust(args as i32);
        let stack_size_in_v128 = self.counter.height() + round_up2(num_locals);

        // Fall-through from the previous arm jumps past this handler.
        let slot = self.stream.reserve(JumpTarget::PENDING);
        frame.catch_fixups.push(PendingPatch { pc, slot });

        let record = ExceptionHandler {
            kind: if tag_index.is_some() {
                HandlerKind::Catch
            } else {
                HandlerKind::CatchAll
            },
            start_pc: frame.pc,
            // The catch instruction is part of the protected range.
            end_pc: frame.pc_end + 1,
            handler_pc: next_pc,
            handler_mc: self.stream.mc(),
            try_depth,
            tag: tag_index.unwrap_or(0),
        };
        self.exception_handlers.push(record);
        self.stream.push(CatchEntry { stack_size_in_v128 });
        Ok(())
    }

    /// `delegate` both records a handler and closes its try, like `end`.
    fn visit_delegate(
        &mut self,
        relative_depth: u32,
        start: usize,
        end: usize,
    ) -> Result<(), CompileFailure> {
        let pc = self.pc(start);
        let mut frame = self
            .frames
            .pop()
            .filter(|f| f.kind == FrameKind::Try)
            .ok_or_else(|| CompileFailure::new(start, "delegate outside try"))?;
        frame.pc_end = pc;

        // The delegate label is resolved outside the try being closed.
        let target_at = self
            .frames
            .len()
            .checked_sub(1 + relative_depth as usize)
            .ok_or_else(|| CompileFailure::new(start, "delegate depth out of range"))?;
        let target = &self.frames[target_at];
        let target_depth = match target.kind {
            FrameKind::Try => target.try_depth,
            FrameKind::TopLevel => 0,
            _ => {
                return Err(CompileFailure::new(
                    start,
                    "delegate target is not a try or the function",
                ));
            }
        };

        let slot = self.stream.reserve(JumpTarget::PENDING);
        frame.catch_fixups.push(PendingPatch { pc, slot });

        self.exception_handlers.push(ExceptionHandler {
            kind: HandlerKind::Delegate,
            start_pc: frame.pc,
            end_pc: frame.pc_end + 1,
            handler_pc: pc,
            handler_mc: self.stream.mc(),
            try_depth: self.try_depth,
            tag: target_depth,
        });

        self.try_depth -= 1;
        self.counter.set_height(frame.base_height);
        self.counter.adjust(frame.results as i32);
        for fixup in frame.catch_fixups {
            self.coalescer.defer_exit(fixup);
        }
        self.coalescer.close(frame.index);
        self.maybe_drain(end);
        Ok(())
    }

    fn visit_rethrow(&mut self, relative_depth: u32, start: usize) -> Result<(), CompileFailure> {
        let at = self
            .frames
            .len()
            .checked_sub(1 + relative_depth as usize)
            .ok_or_else(|| CompileFailure::new(start, "rethrow depth out of range"))?;
        let frame = &self.frames[at];
        if !matches!(frame.kind, FrameKind::Catch | FrameKind::CatchAll) {
            return Err(CompileFailure::new(start, "rethrow target is not a catch"));
        }
        self.uses_rethrow = true;
        self.stream.push(RethrowEntry {
            try_depth: frame.try_depth,
        });
        Ok(())
    }

    fn visit_try_table(
        &mut self,
        table: wasmparser::TryTable,
        start: usize,
        end: usize,
    ) -> Result<(), CompileFailure> {
        let (params, results) = self.block_counts(table.ty, start)?;
        let base = self.base_below_params(params, start)?;
        let pc = self.pc(start);
        let num_locals = self.num_locals;

        // Catch labels are resolved in the surrounding context, before this
        // construct's own frame exists.
        struct Arm {
            kind: HandlerKind,
            tag: u32,
            frame_at: usize,
            stack_size_in_v128: u32,
        }
        let mut arms = Vec::with_capacity(table.catches.len());
        for catch in &table.catches {
            let (kind, tag, label) = match *catch {
                Catch::One { tag, label } => {
                    self.module.tag_signature(tag, start)?;
                    (HandlerKind::TryTableCatch, tag, label)
                }
                Catch::OneRef { tag, label } => {
                    self.module.tag_signature(tag, start)?;
                    (HandlerKind::TryTableCatchRef, tag, label)
                }
                Catch::All { label } => (HandlerKind::TryTableCatchAll, 0, label),
                Catch::AllRef { label } => (HandlerKind::TryTableCatchAllRef, 0, label),
            };
            let frame_at = self
                .frames
                .len()
                .checked_sub(1 + label as usize)
                .ok_or_else(|| CompileFailure::new(start, "catch label out of range"))?;
            let target = &self.frames[frame_at];
            // Landing-pad shape: everything below the target plus what the
            // handler pushes, on top of the locals area.
            let stack_size_in_v128 =
                target.base_height + target.branch_arity() + round_up2(num_locals);
            arms.push(Arm {
                kind,
                tag,
                frame_at,
                stack_size_in_v128,
            });
        }

        self.try_depth += 1;
        self.max_try_depth = self.max_try_depth.max(self.try_depth);

        let index = self.coalescer.open_construct();
        let mut frame = ControlFrame::new(FrameKind::TryTable, params, results, base);
        frame.index = index;
        frame.pc = pc;
        frame.mc = self.stream.mc();
        frame.try_depth = self.try_depth;
        frame.try_table = arms.iter().map(|arm| (arm.kind, arm.tag)).collect();

        let slot = self.stream.reserve(JumpTarget::PENDING);
        self.coalescer.await_entry(index, PendingPatch { pc, slot });

        for arm in &arms {
            self.stream.push(CatchEntry {
                stack_size_in_v128: arm.stack_size_in_v128,
            });
            let slot = self.stream.reserve(JumpTarget::PENDING);
            let patch = PendingPatch { pc, slot };
            let target = &self.frames[arm.frame_at];
            if target.kind == FrameKind::TopLevel {
                self.coalescer.branch_to_top(patch);
            } else {
                self.coalescer.branch_to(target.index, patch, &mut self.stream);
            }
        }

        self.frames.push(frame);
        self.maybe_drain(end);
        Ok(())
    }

    /// Handler records for a closing try_table; their metadata offsets are
    /// fixed by the entry layout emitted at the open.
    fn close_try_table(&mut self, frame: &ControlFrame, pc: u32) {
        const ARM_STRIDE: u32 = (CatchEntry::SIZE + JumpTarget::SIZE) as u32;
        for (i, &(kind, tag)) in frame.try_table.iter().enumerate() {
            self.exception_handlers.push(ExceptionHandler {
                kind,
                start_pc: frame.pc,
                end_pc: pc + 1,
                handler_pc: frame.pc,
                handler_mc: frame.mc + JumpTarget::SIZE as u32 + i as u32 * ARM_STRIDE,
                try_depth: self.try_depth,
                tag,
            });
        }
    }

    // --- Branches -----------------------------------------------------

    fn target_frame(&self, relative_depth: u32, start: usize) -> Result<usize, CompileFailure> {
        self.frames
            .len()
            .checked_sub(1 + relative_depth as usize)
            .ok_or_else(|| CompileFailure::new(start, "branch depth out of range"))
    }

    fn branch_counts(
        &self,
        frame_at: usize,
        start: usize,
    ) -> Result<(u16, u16), CompileFailure> {
        let frame = &self.frames[frame_at];
        let arity = frame.branch_arity();
        let to_pop = (self.counter.height() as i64)
            - frame.base_height as i64
            - arity as i64;
        if to_pop < 0 {
            return Err(CompileFailure::new(start, "branch below target baseline"));
        }
        Ok((to_pop as u16, arity as u16))
    }

    fn register_branch(&mut self, frame_at: usize, patch: PendingPatch) {
        let frame = &self.frames[frame_at];
        if frame.kind == FrameKind::TopLevel {
            self.coalescer.branch_to_top(patch);
        } else {
            self.coalescer.branch_to(frame.index, patch, &mut self.stream);
        }
    }

    fn visit_branch(
        &mut self,
        relative_depth: u32,
        start: usize,
        end: usize,
    ) -> Result<(), CompileFailure> {
        let frame_at = self.target_frame(relative_depth, start)?;
        let (to_pop, to_keep) = self.branch_counts(frame_at, start)?;
        let length = self.instr_len(start, end)?;
        let pc = self.pc(start);

        let slot = self.stream.reserve(JumpTarget::PENDING);
        self.stream.push(BranchInfo {
            to_pop,
            to_keep,
            length,
        });
        self.register_branch(frame_at, PendingPatch { pc, slot });
        Ok(())
    }

    /// `br_on_null` / `br_on_non_null`. The null check consumes the
    /// reference on one side of the edge only.
    fn visit_branch_null(
        &mut self,
        relative_depth: u32,
        negate: bool,
        start: usize,
        end: usize,
    ) -> Result<(), CompileFailure> {
        let frame_at = self.target_frame(relative_depth, start)?;
        let (mut to_pop, to_keep) = self.branch_counts(frame_at, start)?;
        if !negate {
            // Branching on null pops the null itself first.
            to_pop = to_pop
                .checked_sub(1)
                .ok_or_else(|| CompileFailure::new(start, "branch below target baseline"))?;
        }
        let length = self.instr_len(start, end)?;
        let pc = self.pc(start);

        let slot = self.stream.reserve(JumpTarget::PENDING);
        self.stream.push(BranchInfo {
            to_pop,
            to_keep,
            length,
        });
        self.register_branch(frame_at, PendingPatch { pc, slot });

        if negate {
            // br_on_non_null drops the reference when falling through.
            self.counter.adjust(-1);
        }
        Ok(())
    }

    fn visit_switch(
        &mut self,
        targets: &wasmparser::BrTable<'_>,
        start: usize,
    ) -> Result<(), CompileFailure> {
        self.counter.adjust(-1); // index
        let pc = self.pc(start);

        let mut depths = Vec::with_capacity(targets.len() as usize + 1);
        for depth in targets.targets() {
            depths.push(depth?);
        }
        depths.push(targets.default());

        self.stream.push(SwitchHeader {
            count: depths.len() as u32,
        });
        for depth in depths {
            let frame_at = self.target_frame(depth, start)?;
            let (to_pop, to_keep) = self.branch_counts(frame_at, start)?;
            let slot = self.stream.reserve(JumpTarget::PENDING);
            self.stream.push(SwitchTargetInfo { to_pop, to_keep });
            self.register_branch(frame_at, PendingPatch { pc, slot });
        }
        Ok(())
    }

    // --- Calls --------------------------------------------------------

    /// Derive (or fetch the memoized copy of) the marshalling program for a
    /// signature. The header entry carries the frame size and precedes the
    /// program bytes in the stream, so the program is materialized first.
    fn call_program(&mut self, signature: &FuncType, kind: CallKind) -> (u32, u32, Vec<u8>) {
        let program = self.calls.sequence_for(signature, kind);
        (
            program.frame_size,
            program.stack_args_bytes,
            program.bytes.clone(),
        )
    }

    fn tail_call_stack_bump(&mut self, stack_args: u32) {
        // The shuffled argument area rides on the operand stack; make sure
        // the frame has room even though the height never reports it.
        let extra_slots = stack_args.div_ceil(16);
        self.counter
            .ensure_capacity(self.counter.height() + extra_slots);
        self.uses_tail_calls = true;
    }

    fn visit_call(
        &mut self,
        function_index: u32,
        kind: CallKind,
        start: usize,
        end: usize,
    ) -> Result<(), CompileFailure> {
        let module = self.module;
        let signature = module.function_signature(function_index, start)?;
        let args = signature.params().len() as u32;
        let results = signature.results().len() as u32;
        let length = self.instr_len(start, end)?;
        let profile = self.next_profile(Some(function_index));

        let (frame_size, stack_args, program) = self.call_program(signature, kind);
        match kind {
            CallKind::TailCall => {
                self.counter.adjust(-(args as i32));
                if module.is_imported_function(function_index) {
                    self.tail_call_clobbers_instance = true;
                }
                self.stream.push(TailCallEntry {
                    length,
                    profile,
                    callee: function_index,
                    caller_stack_args: self.argument_and_results_stack_bytes as i32,
                });
                self.stream.push_bytes(&program);
                self.tail_call_stack_bump(stack_args);
            }
            CallKind::Call => {
                self.counter.adjust(results as i32 - args as i32);
                self.stream.push(CallEntry {
                    length,
                    profile,
                    callee: function_index,
                    frame_size,
                    extra_results: results.saturating_sub(args) as u16,
                    argument_count: args as u16,
                });
                self.stream.push_bytes(&program);
            }
        }
        Ok(())
    }

    fn visit_call_indirect(
        &mut self,
        type_index: u32,
        table_index: u32,
        kind: CallKind,
        start: usize,
        end: usize,
    ) -> Result<(), CompileFailure> {
        self.check_table(table_index, start)?;
        let module = self.module;
        let signature = module.func_type(type_index, start)?;
        let args = signature.params().len() as u32;
        let results = signature.results().len() as u32;
        let length = self.instr_len(start, end)?;
        let profile = self.next_profile(None);

        let (frame_size, stack_args, program) = self.call_program(signature, kind);
        match kind {
            CallKind::TailCall => {
                // Arguments plus the callee index itself.
                self.counter.adjust(-(args as i32) - 1);
                self.tail_call_clobbers_instance = true;
                self.stream.push(TailCallIndirectEntry {
                    length,
                    profile,
                    table: table_index,
                    type_index,
                    caller_stack_args: self.argument_and_results_stack_bytes as i32,
                });
                self.stream.push_bytes(&program);
                self.tail_call_stack_bump(stack_args);
            }
            CallKind::Call => {
                self.counter.adjust(results as i32 - args as i32 - 1);
                self.stream.push(CallIndirectEntry {
                    length,
                    profile,
                    table: table_index,
                    type_index,
                    frame_size,
                    extra_results: results.saturating_sub(args) as u16,
                    argument_count: args as u16,
                });
                self.stream.push_bytes(&program);
            }
        }
        Ok(())
    }

    fn visit_call_ref(
        &mut self,
        type_index: u32,
        kind: CallKind,
        start: usize,
        end: usize,
    ) -> Result<(), CompileFailure> {
        let module = self.module;
        let signature = module.func_type(type_index, start)?;
        let args = signature.params().len() as u32;
        let results = signature.results().len() as u32;
        let length = self.instr_len(start, end)?;
        let profile = self.next_profile(None);

        let (frame_size, stack_args, program) = self.call_program(signature, kind);
        match kind {
            CallKind::TailCall => {
                self.counter.adjust(-(args as i32) - 1);
                self.tail_call_clobbers_instance = true;
                self.stream.push(TailCallRefEntry {
                    length,
                    profile,
                    caller_stack_args: self.argument_and_results_stack_bytes as i32,
                });
                self.stream.push_bytes(&program);
                self.tail_call_stack_bump(stack_args);
            }
            CallKind::Call => {
                self.counter.adjust(results as i32 - args as i32 - 1);
                self.stream.push(CallRefEntry {
                    length,
                    profile,
                    frame_size,
                    extra_results: results.saturating_sub(args) as u16,
                    argument_count: args as u16,
                });
                self.stream.push_bytes(&program);
            }
        }
        Ok(())
    }

    // --- Globals, tables, GC helpers ----------------------------------

    fn push_global(
        &mut self,
        index: u32,
        is_set: bool,
        start: usize,
        end: usize,
    ) -> Result<(), CompileFailure> {
        let global = self.module.global(index, start)?;
        if is_set && !global.mutable {
            return Err(CompileFailure::new(
                start,
                format!("global {index} is immutable"),
            ));
        }
        let entry = GlobalEntry {
            index,
            length: self.instr_len(start, end)?,
            binding: global.binding as u8,
            is_ref: is_ref(global.ty) as u8,
        };
        self.stream.push(entry);
        Ok(())
    }

    fn check_table(&self, index: u32, start: usize) -> Result<(), CompileFailure> {
        if self.module.tables.get(index as usize).is_none() {
            return Err(CompileFailure::new(
                start,
                format!("table index {index} out of range"),
            ));
        }
        Ok(())
    }

    fn push_array(&mut self, type_index: u32, start: usize, end: usize) -> Result<(), CompileFailure> {
        let length = self.instr_len(start, end)?;
        self.stream.push(ArrayEntry { type_index, length });
        Ok(())
    }

    fn push_array_segment(
        &mut self,
        type_index: u32,
        segment: u32,
        start: usize,
        end: usize,
    ) -> Result<(), CompileFailure> {
        let length = self.instr_len(start, end)?;
        self.stream.push(ArraySegmentEntry {
            type_index,
            segment,
            length,
        });
        Ok(())
    }
}

/// Net operand-stack delta for pure scalar computation. `None` means the
/// opcode is not a plain op and must be handled elsewhere.
fn plain_stack_delta(op: &Operator) -> Option<i32> {
    use Operator as O;
    Some(match op {
        // One operand in, one out.
        O::I32Eqz
        | O::I64Eqz
        | O::I32Clz
        | O::I32Ctz
        | O::I32Popcnt
        | O::I64Clz
        | O::I64Ctz
        | O::I64Popcnt
        | O::F32Abs
        | O::F32Neg
        | O::F32Ceil
        | O::F32Floor
        | O::F32Trunc
        | O::F32Nearest
        | O::F32Sqrt
        | O::F64Abs
        | O::F64Neg
        | O::F64Ceil
        | O::F64Floor
        | O::F64Trunc
        | O::F64Nearest
        | O::F64Sqrt
        | O::I32WrapI64
        | O::I64ExtendI32S
        | O::I64ExtendI32U
        | O::I32TruncF32S
        | O::I32TruncF32U
        | O::I32TruncF64S
        | O::I32TruncF64U
        | O::I64TruncF32S
        | O::I64TruncF32U
        | O::I64TruncF64S
        | O::I64TruncF64U
        | O::F32ConvertI32S
        | O::F32ConvertI32U
        | O::F32ConvertI64S
        | O::F32ConvertI64U
        | O::F64ConvertI32S
        | O::F64ConvertI32U
        | O::F64ConvertI64S
        | O::F64ConvertI64U
        | O::F32DemoteF64
        | O::F64PromoteF32
        | O::I32ReinterpretF32
        | O::I64ReinterpretF64
        | O::F32ReinterpretI32
        | O::F64ReinterpretI64
        | O::I32Extend8S
        | O::I32Extend16S
        | O::I64Extend8S
        | O::I64Extend16S
        | O::I64Extend32S => 0,

        // Two operands in, one out.
        O::I32Eq
        | O::I32Ne
        | O::I32LtS
        | O::I32LtU
        | O::I32GtS
        | O::I32GtU
        | O::I32LeS
        | O::I32LeU
        | O::I32GeS
        | O::I32GeU
        | O::I64Eq
        | O::I64Ne
        | O::I64LtS
        | O::I64LtU
        | O::I64GtS
        | O::I64GtU
        | O::I64LeS
        | O::I64LeU
        | O::I64GeS
        | O::I64GeU
        | O::F32Eq
        | O::F32Ne
        | O::F32Lt
        | O::F32Gt
        | O::F32Le
        | O::F32Ge
        | O::F64Eq
        | O::F64Ne
        | O::F64Lt
        | O::F64Gt
        | O::F64Le
        | O::F64Ge
        | O::I32Add
        | O::I32Sub
        | O::I32Mul
        | O::I32DivS
        | O::I32DivU
        | O::I32RemS
        | O::I32RemU
        | O::I32And
        | O::I32Or
        | O::I32Xor
        | O::I32Shl
        | O::I32ShrS
        | O::I32ShrU
        | O::I32Rotl
        | O::I32Rotr
        | O::I64Add
        | O::I64Sub
        | O::I64Mul
        | O::I64DivS
        | O::I64DivU
        | O::I64RemS
        | O::I64RemU
        | O::I64And
        | O::I64Or
        | O::I64Xor
        | O::I64Shl
        | O::I64ShrS
        | O::I64ShrU
        | O::I64Rotl
        | O::I64Rotr
        | O::F32Add
        | O::F32Sub
        | O::F32Mul
        | O::F32Div
        | O::F32Min
        | O::F32Max
        | O::F32Copysign
        | O::F64Add
        | O::F64Sub
        | O::F64Mul
        | O::F64Div
        | O::F64Min
        | O::F64Max
        | O::F64Copysign => -1,

        _ => return None,
    })
}

/// Net delta for pure SIMD computation.
fn simd_stack_delta(op: &Operator) -> Option<i32> {
    use Operator as O;
    Some(match op {
        // v128 (or scalar) in, v128 (or scalar) out.
        O::I8x16Splat
        | O::I16x8Splat
        | O::I32x4Splat
        | O::I64x2Splat
        | O::F32x4Splat
        | O::F64x2Splat
        | O::I8x16ExtractLaneS { .. }
        | O::I8x16ExtractLaneU { .. }
        | O::I16x8ExtractLaneS { .. }
        | O::I16x8ExtractLaneU { .. }
        | O::I32x4ExtractLane { .. }
        | O::I64x2ExtractLane { .. }
        | O::F32x4ExtractLane { .. }
        | O::F64x2ExtractLane { .. }
        | O::V128Not
        | O::V128AnyTrue
        | O::I8x16Abs
        | O::I8x16Neg
        | O::I8x16Popcnt
        | O::I8x16AllTrue
        | O::I8x16Bitmask
        | O::I16x8Abs
        | O::I16x8Neg
        | O::I16x8AllTrue
        | O::I16x8Bitmask
        | O::I32x4Abs
        | O::I32x4Neg
        | O::I32x4AllTrue
        | O::I32x4Bitmask
        | O::I64x2Abs
        | O::I64x2Neg
        | O::I64x2AllTrue
        | O::I64x2Bitmask
        | O::F32x4Abs
        | O::F32x4Neg
        | O::F32x4Sqrt
        | O::F32x4Ceil
        | O::F32x4Floor
        | O::F32x4Trunc
        | O::F32x4Nearest
        | O::F64x2Abs
        | O::F64x2Neg
        | O::F64x2Sqrt
        | O::F64x2Ceil
        | O::F64x2Floor
        | O::F64x2Trunc
        | O::F64x2Nearest
        | O::I16x8ExtendLowI8x16S
        | O::I16x8ExtendHighI8x16S
        | O::I16x8ExtendLowI8x16U
        | O::I16x8ExtendHighI8x16U
        | O::I32x4ExtendLowI16x8S
        | O::I32x4ExtendHighI16x8S
        | O::I32x4ExtendLowI16x8U
        | O::I32x4ExtendHighI16x8U
        | O::I64x2ExtendLowI32x4S
        | O::I64x2ExtendHighI32x4S
        | O::I64x2ExtendLowI32x4U
        | O::I64x2ExtendHighI32x4U
        | O::I16x8ExtAddPairwiseI8x16S
        | O::I16x8ExtAddPairwiseI8x16U
        | O::I32x4ExtAddPairwiseI16x8S
        | O::I32x4ExtAddPairwiseI16x8U
        | O::I32x4TruncSatF32x4S
        | O::I32x4TruncSatF32x4U
        | O::I32x4TruncSatF64x2SZero
        | O::I32x4TruncSatF64x2UZero
        | O::F32x4ConvertI32x4S
        | O::F32x4ConvertI32x4U
        | O::F64x2ConvertLowI32x4S
        | O::F64x2ConvertLowI32x4U
        | O::F32x4DemoteF64x2Zero
        | O::F64x2PromoteLowF32x4 => 0,

        // Two in, one out.
        O::I8x16ReplaceLane { .. }
        | O::I16x8ReplaceLane { .. }
        | O::I32x4ReplaceLane { .. }
        | O::I64x2ReplaceLane { .. }
        | O::F32x4ReplaceLane { .. }
        | O::F64x2ReplaceLane { .. }
        | O::I8x16Shuffle { .. }
        | O::I8x16Swizzle
        | O::V128And
        | O::V128AndNot
        | O::V128Or
        | O::V128Xor
        | O::I8x16Shl
        | O::I8x16ShrS
        | O::I8x16ShrU
        | O::I16x8Shl
        | O::I16x8ShrS
        | O::I16x8ShrU
        | O::I32x4Shl
        | O::I32x4ShrS
        | O::I32x4ShrU
        | O::I64x2Shl
        | O::I64x2ShrS
        | O::I64x2ShrU
        | O::I8x16Eq
        | O::I8x16Ne
        | O::I8x16LtS
        | O::I8x16LtU
        | O::I8x16GtS
        | O::I8x16GtU
        | O::I8x16LeS
        | O::I8x16LeU
        | O::I8x16GeS
        | O::I8x16GeU
        | O::I16x8Eq
        | O::I16x8Ne
        | O::I16x8LtS
        | O::I16x8LtU
        | O::I16x8GtS
        | O::I16x8GtU
        | O::I16x8LeS
        | O::I16x8LeU
        | O::I16x8GeS
        | O::I16x8GeU
        | O::I32x4Eq
        | O::I32x4Ne
        | O::I32x4LtS
        | O::I32x4LtU
        | O::I32x4GtS
        | O::I32x4GtU
        | O::I32x4LeS
        | O::I32x4LeU
        | O::I32x4GeS
        | O::I32x4GeU
        | O::I64x2Eq
        | O::I64x2Ne
        | O::I64x2LtS
        | O::I64x2GtS
        | O::I64x2LeS
        | O::I64x2GeS
        | O::F32x4Eq
        | O::F32x4Ne
        | O::F32x4Lt
        | O::F32x4Gt
        | O::F32x4Le
        | O::F32x4Ge
        | O::F64x2Eq
        | O::F64x2Ne
        | O::F64x2Lt
        | O::F64x2Gt
        | O::F64x2Le
        | O::F64x2Ge
        | O::I8x16Add
        | O::I8x16AddSatS
        | O::I8x16AddSatU
        | O::I8x16Sub
        | O::I8x16SubSatS
        | O::I8x16SubSatU
        | O::I8x16MinS
        | O::I8x16MinU
        | O::I8x16MaxS
        | O::I8x16MaxU
        | O::I8x16AvgrU
        | O::I8x16NarrowI16x8S
        | O::I8x16NarrowI16x8U
        | O::I16x8Add
        | O::I16x8AddSatS
        | O::I16x8AddSatU
        | O::I16x8Sub
        | O::I16x8SubSatS
        | O::I16x8SubSatU
        | O::I16x8Mul
        | O::I16x8MinS
        | O::I16x8MinU
        | O::I16x8MaxS
        | O::I16x8MaxU
        | O::I16x8AvgrU
        | O::I16x8Q15MulrSatS
        | O::I16x8NarrowI32x4S
        | O::I16x8NarrowI32x4U
        | O::I16x8ExtMulLowI8x16S
        | O::I16x8ExtMulHighI8x16S
        | O::I16x8ExtMulLowI8x16U
        | O::I16x8ExtMulHighI8x16U
        | O::I32x4Add
        | O::I32x4Sub
        | O::I32x4Mul
        | O::I32x4MinS
        | O::I32x4MinU
        | O::I32x4MaxS
        | O::I32x4MaxU
        | O::I32x4DotI16x8S
        | O::I32x4ExtMulLowI16x8S
        | O::I32x4ExtMulHighI16x8S
        | O::I32x4ExtMulLowI16x8U
        | O::I32x4ExtMulHighI16x8U
        | O::I64x2Add
        | O::I64x2Sub
        | O::I64x2Mul
        | O::I64x2ExtMulLowI32x4S
        | O::I64x2ExtMulHighI32x4S
        | O::I64x2ExtMulLowI32x4U
        | O::I64x2ExtMulHighI32x4U
        | O::F32x4Add
        | O::F32x4Sub
        | O::F32x4Mul
        | O::F32x4Div
        | O::F32x4Min
        | O::F32x4Max
        | O::F32x4PMin
        | O::F32x4PMax
        | O::F64x2Add
        | O::F64x2Sub
        | O::F64x2Mul
        | O::F64x2Div
        | O::F64x2Min
        | O::F64x2Max
        | O::F64x2PMin
        | O::F64x2PMax => -1,

        // Three in, one out.
        O::V128Bitselect => -2,

        _ => return None,
    })
}
