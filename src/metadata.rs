//! The finished per-function artifact.

use rustc_hash::FxHashMap;

/// Exception handler classification in the handler table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Catch,
    CatchAll,
    Delegate,
    TryTableCatch,
    TryTableCatchRef,
    TryTableCatchAll,
    TryTableCatchAllRef,
}

/// One fixed-size record in the exception handler table.
///
/// `start_pc..end_pc` is the protected source range, inclusive of the
/// catch/delegate instruction itself. For delegates, `tag` holds the target
/// try depth instead of an exception tag.
#[derive(Debug, Clone, Copy)]
pub struct ExceptionHandler {
    pub kind: HandlerKind,
    pub start_pc: u32,
    pub end_pc: u32,
    pub handler_pc: u32,
    pub handler_mc: u32,
    pub try_depth: u32,
    pub tag: u32,
}

/// Where a higher tier can resume execution mid-loop with an identical
/// stack shape.
#[derive(Debug, Clone, Copy)]
pub struct ResumePoint {
    /// Ordinal of the loop within the function, in open order.
    pub loop_index: u32,
    /// Live operand slots at the loop header.
    pub live_values: u32,
    pub try_depth: u32,
}

/// Everything the paired interpreter consumes for one function.
///
/// Produced whole by [`crate::generate`]; the metadata buffer is moved out
/// of the generator, never copied.
#[derive(Debug)]
pub struct FunctionMetadata {
    /// The 8-byte-aligned metadata entry stream, addressed by MC.
    pub entries: Vec<u8>,
    /// Argument-placement tags, an end tag, then one flag byte per declared
    /// local (0xff for reference types), padded to an even local count.
    pub locals_program: Vec<u8>,
    /// Result-location tags for returning from this function.
    pub return_program: Vec<u8>,
    pub exception_handlers: Vec<ExceptionHandler>,
    /// Loop resumption map, keyed by source offset + 1 (0 means absent).
    pub resume_points: FxHashMap<u32, ResumePoint>,
    /// Direct-call targets indexed by call-profile slot; `None` for
    /// indirect and ref calls.
    pub call_targets: Vec<Option<u32>>,
    /// Total frame size in 16-byte units: locals + rethrow slots + maximum
    /// operand depth.
    pub frame_size_in_v128: u32,
    /// Retained copy of the source bytes, truncated to the consumed length.
    pub bytecode: Vec<u8>,
    /// Byte offset of PC 0 within `bytecode` (end of local declarations).
    pub code_offset: u32,
    pub num_locals: u32,
    pub num_arguments: u32,
    /// Rethrow-slot region size in 8-byte slots (even).
    pub num_rethrow_slots: u32,
    /// Caller-visible stack argument/result area of this function's own
    /// frame, in bytes.
    pub argument_and_results_stack_bytes: u32,
    pub max_operand_depth: u32,
    pub uses_simd: bool,
    pub uses_tail_calls: bool,
    /// Set when a tail call may replace the instance register (indirect,
    /// ref, or imported-target tail calls).
    pub tail_call_clobbers_instance: bool,
}
