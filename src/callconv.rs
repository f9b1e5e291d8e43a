//! Calling-convention description and the marshalling program encoder.
//!
//! A [`CallConvention`] says where each argument and result of a signature
//! lives across a native call: a general register, a float register, or a
//! stack slot of width 8 or 16. The [`CallSequenceEncoder`] lowers that
//! description into the one-tag-per-slot micro-program the interpreter runs
//! to move values between its operand stack and the native frame, reversed
//! so the topmost operand is marshalled first. Programs are memoized per
//! signature; tail calls reuse the derivation with a disjoint tag range so
//! the interpreter can special-case frame reuse without re-deriving
//! anything.

use rustc_hash::FxHashMap;

use wasmparser::{FuncType, ValType};

use crate::entry::{CallReturnEntry, Entry};

/// Native stack alignment the marshalled frame is padded to.
pub(crate) const STACK_ALIGNMENT: u32 = 16;

/// Saved frame pointer + return address.
pub(crate) const FRAME_HEADER_BYTES: u32 = 16;

const NUM_ARG_GPRS: u8 = 8;
const NUM_ARG_FPRS: u8 = 8;

pub(crate) fn round_up_to_alignment(bytes: u32) -> u32 {
    (bytes + STACK_ALIGNMENT - 1) & !(STACK_ALIGNMENT - 1)
}

/// Marshalling tag bytes. The interpreter dispatches on these one at a time.
pub(crate) mod tag {
    /// `0x00..=0x07`: argument GPR 0-7.
    pub const ARG_GPR0: u8 = 0x00;
    /// `0x08..=0x0f`: argument FPR 0-7.
    pub const ARG_FPR0: u8 = 0x08;
    /// Store 8 bytes; SP is already 16-aligned.
    pub const STACK_STORE: u8 = 0x10;
    /// Decrement SP, then store 8 bytes into the upper half.
    pub const STACK_STORE_UNALIGNED: u8 = 0x11;
    /// Store 16 bytes; SP is already 16-aligned.
    pub const STACK_VECTOR: u8 = 0x12;
    pub const STACK_VECTOR_UNALIGNED: u8 = 0x13;
    /// Decrement SP by one aligned unit (padding).
    pub const DEC_SP: u8 = 0x14;
    /// Perform the call.
    pub const DISPATCH: u8 = 0x15;

    /// Added to every frame-touching tag (`0x10..=0x15`) in a tail-call
    /// program; register moves are identical in both ranges.
    pub const TAIL_SHIFT: u8 = 0x20;

    /// `0x40..=0x47`: result GPR 0-7.
    pub const RESULT_GPR0: u8 = 0x40;
    /// `0x48..=0x4f`: result FPR 0-7.
    pub const RESULT_FPR0: u8 = 0x48;
    pub const RESULT_STACK: u8 = 0x50;
    pub const RESULT_STACK_VECTOR: u8 = 0x51;
    pub const RESULT_END: u8 = 0x52;

    /// Locals program: argument placement on function entry. GPR/FPR tags
    /// are shared with the argument range above.
    pub const LOCAL_STACK: u8 = 0x10;
    pub const LOCAL_STACK_VECTOR: u8 = 0x11;
    pub const LOCAL_END: u8 = 0x12;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotWidth {
    W8,
    W16,
}

impl SlotWidth {
    fn bytes(self) -> u32 {
        match self {
            SlotWidth::W8 => 8,
            SlotWidth::W16 => 16,
        }
    }
}

/// Where one argument or result lives across the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueLoc {
    Gpr(u8),
    Fpr(u8),
    Stack { offset: u32, width: SlotWidth },
}

/// Ordered argument/result locations for one signature.
#[derive(Debug, Clone)]
pub struct CallConvention {
    pub params: Vec<ValueLoc>,
    pub results: Vec<ValueLoc>,
    pub header_bytes: u32,
    /// Header plus the stack-passed argument/result area (unaligned).
    pub header_and_args_bytes: u32,
    pub first_stack_result_offset: u32,
}

fn width_of(ty: ValType) -> SlotWidth {
    match ty {
        ValType::V128 => SlotWidth::W16,
        _ => SlotWidth::W8,
    }
}

fn uses_fpr(ty: ValType) -> bool {
    matches!(ty, ValType::F32 | ValType::F64 | ValType::V128)
}

fn assign(types: &[ValType]) -> (Vec<ValueLoc>, u32, u32) {
    let mut locations = Vec::with_capacity(types.len());
    let mut gprs = 0u8;
    let mut fprs = 0u8;
    let mut stack = FRAME_HEADER_BYTES;
    let mut first_stack = 0u32;
    for &ty in types {
        let loc = if uses_fpr(ty) && fprs < NUM_ARG_FPRS {
            let loc = ValueLoc::Fpr(fprs);
            fprs += 1;
            loc
        } else if !uses_fpr(ty) && gprs < NUM_ARG_GPRS {
            let loc = ValueLoc::Gpr(gprs);
            gprs += 1;
            loc
        } else {
            let width = width_of(ty);
            let loc = ValueLoc::Stack {
                offset: stack,
                width,
            };
            if first_stack == 0 {
                first_stack = stack;
            }
            stack += width.bytes();
            loc
        };
        locations.push(loc);
    }
    (locations, stack - FRAME_HEADER_BYTES, first_stack)
}

impl CallConvention {
    /// Derive the convention for a signature. Eight GPRs and eight FPRs are
    /// available to arguments and results; the remainder spills to the
    /// stack, results overlaying the argument area.
    pub fn for_signature(signature: &FuncType) -> Self {
        let (params, arg_stack_bytes, _) = assign(signature.params());
        let (results, result_stack_bytes, first_stack_result) = assign(signature.results());
        CallConvention {
            params,
            results,
            header_bytes: FRAME_HEADER_BYTES,
            header_and_args_bytes: FRAME_HEADER_BYTES + arg_stack_bytes.max(result_stack_bytes),
            first_stack_result_offset: first_stack_result,
        }
    }

    /// Total frame size once padded to the stack alignment.
    pub fn frame_size(&self) -> u32 {
        round_up_to_alignment(self.header_and_args_bytes)
    }

    /// Stack bytes for arguments and results beyond the header.
    pub fn stack_args_bytes(&self) -> u32 {
        self.frame_size() - self.header_bytes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum CallKind {
    Call,
    TailCall,
}

/// A derived marshalling program plus its frame accounting.
#[derive(Debug, Clone)]
pub(crate) struct CallSequenceProgram {
    /// Reversed argument tags, then (for plain calls) the
    /// [`CallReturnEntry`] and result tags, or (for tail calls) the callee
    /// stack-area size as a little-endian u64.
    pub bytes: Vec<u8>,
    /// Length of the reversed argument-tag section.
    pub arg_program_len: usize,
    pub frame_size: u32,
    pub stack_args_bytes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SigKey {
    params: Box<[ValType]>,
    results: Box<[ValType]>,
    kind: CallKind,
}

/// Memoizing encoder: one derivation per (signature, kind) for the whole
/// function. Recomputing would be correct, only slower.
#[derive(Debug, Default)]
pub(crate) struct CallSequenceEncoder {
    cache: FxHashMap<SigKey, CallSequenceProgram>,
}

impl CallSequenceEncoder {
    pub(crate) fn sequence_for(
        &mut self,
        signature: &FuncType,
        kind: CallKind,
    ) -> &CallSequenceProgram {
        let key = SigKey {
            params: signature.params().into(),
            results: signature.results().into(),
            kind,
        };
        self.cache
            .entry(key)
            .or_insert_with(|| build_program(signature, kind))
    }

    #[cfg(test)]
    fn cached_len(&self) -> usize {
        self.cache.len()
    }
}

fn shift_for(kind: CallKind, t: u8) -> u8 {
    match kind {
        CallKind::Call => t,
        // Only the frame-touching tags move; register moves are shared.
        CallKind::TailCall if (tag::STACK_STORE..=tag::DISPATCH).contains(&t) => {
            t + tag::TAIL_SHIFT
        }
        CallKind::TailCall => t,
    }
}

fn build_program(signature: &FuncType, kind: CallKind) -> CallSequenceProgram {
    let convention = CallConvention::for_signature(signature);
    let frame_size = convention.frame_size();

    let mut tags = vec![shift_for(kind, tag::DISPATCH)];
    let mut sp = convention.header_bytes;
    for loc in &convention.params {
        let t = match *loc {
            ValueLoc::Gpr(i) => tag::ARG_GPR0 + i,
            ValueLoc::Fpr(i) => tag::ARG_FPR0 + i,
            ValueLoc::Stack {
                width: SlotWidth::W8,
                ..
            } => {
                let t = if sp % STACK_ALIGNMENT == 0 {
                    tag::STACK_STORE
                } else {
                    tag::STACK_STORE_UNALIGNED
                };
                sp += 8;
                t
            }
            ValueLoc::Stack {
                width: SlotWidth::W16,
                ..
            } => {
                let t = if sp % STACK_ALIGNMENT == 0 {
                    tag::STACK_VECTOR
                } else {
                    tag::STACK_VECTOR_UNALIGNED
                };
                sp += 16;
                t
            }
        };
        tags.push(shift_for(kind, t));
    }
    if sp % STACK_ALIGNMENT != 0 {
        // The last argument left the top pair half-filled; claim the rest.
        tags.push(shift_for(kind, tag::DEC_SP));
        sp += 8;
    }
    while sp < frame_size {
        tags.push(shift_for(kind, tag::DEC_SP));
        sp += 16;
    }
    debug_assert_eq!(sp, frame_size);

    tags.reverse();
    let arg_program_len = tags.len();
    let mut bytes = tags;

    let stack_args_bytes = convention.stack_args_bytes();
    match kind {
        CallKind::Call => {
            let ret = CallReturnEntry {
                frame_size,
                first_stack_result_offset: convention.first_stack_result_offset,
            };
            let mut encoded = [0u8; 8];
            ret.encode(&mut encoded);
            bytes.extend_from_slice(&encoded);
            for loc in &convention.results {
                bytes.push(match *loc {
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
            bytes.push(tag::RESULT_END);
        }
        CallKind::TailCall => {
            bytes.extend_from_slice(&(stack_args_bytes as u64).to_le_bytes());
        }
    }

    CallSequenceProgram {
        bytes,
        arg_program_len,
        frame_size,
        stack_args_bytes,
    }
}
