use super::*;
use crate::module_info::ModuleInfo;

fn try_compile_nth(
    wat_src: &str,
    n: usize,
) -> Result<FunctionMetadata, CompileFailure> {
    let bytes = wat::parse_str(wat_src).expect("fixture must assemble");
    let parsed = ModuleInfo::parse(&bytes)?;
    let (func_index, range) = parsed.bodies[n].clone();
    let signature = parsed.info.function_signature(func_index, 0)?.clone();
    MetadataGenerator::new(&bytes[range], &signature, &parsed.info).compile()
}

fn compile_nth(wat_src: &str, n: usize) -> FunctionMetadata {
    try_compile_nth(wat_src, n).expect("fixture must compile")
}

fn compile(wat_src: &str) -> FunctionMetadata {
    compile_nth(wat_src, 0)
}

/// Decode a JumpTarget at a metadata cursor.
fn jump_at(entries: &[u8], mc: usize) -> (i32, i32) {
    (
        i32::from_le_bytes(entries[mc..mc + 4].try_into().unwrap()),
        i32::from_le_bytes(entries[mc + 4..mc + 8].try_into().unwrap()),
    )
}

fn u32_at(entries: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(entries[at..at + 4].try_into().unwrap())
}

#[test]
fn straight_line_add_emits_only_the_return_entry() {
    let md = compile(
        r#"
        (module (func (param i32 i32) (result i32)
            local.get 0
            local.get 1
            i32.add
        ))
    "#,
    );
    // local.get and i32.add need no metadata; the one entry is the terminal
    // return marshalling.
    assert_eq!(md.entries.len(), 8);
    // size = 2 bytes of size + 1 result tag + end tag.
    assert_eq!(&md.entries[0..2], &4u16.to_le_bytes());
    assert_eq!(md.entries[2], tag::RESULT_GPR0);
    assert_eq!(md.entries[3], tag::RESULT_END);

    assert_eq!(md.max_operand_depth, 2);
    // Two GPR argument tags, end tag; two locals, no padding byte.
    assert_eq!(
        md.locals_program,
        vec![tag::ARG_GPR0, tag::ARG_GPR0 + 1, tag::LOCAL_END]
    );
    assert_eq!(md.num_locals, 2);
    assert_eq!(md.num_arguments, 2);
    // locals (2 -> 1 v128 unit) + max depth.
    assert_eq!(md.frame_size_in_v128, 3);
    assert!(md.exception_handlers.is_empty());
    assert!(md.resume_points.is_empty());
}

#[test]
fn block_branch_resolves_to_the_instruction_after_end() {
    let md = compile(
        r#"
        (module (func (result i32)
            block (result i32)
                i32.const 1
                br 0
            end
        ))
    "#,
    );
    // Layout: block JumpTarget(8) | const(8) | br JumpTarget(8) +
    // BranchInfo(8) | return entry(8).
    assert_eq!(md.entries.len(), 40);

    // Block header: entry is the const at pc 2, mc 8.
    assert_eq!(jump_at(&md.entries, 0), (2, 8));
    // Constant entry: value 1, length 2.
    assert_eq!(u32_at(&md.entries, 8), 1);
    assert_eq!(u32_at(&md.entries, 12), 2);

    // The branch (pc 4, slot at mc 16) lands on the function's final end
    // (pc 7) whose metadata is the return entry (mc 32).
    assert_eq!(jump_at(&md.entries, 16), (3, 16));
    // BranchInfo: nothing to pop below the result, one value kept.
    assert_eq!(&md.entries[24..26], &0u16.to_le_bytes());
    assert_eq!(&md.entries[26..28], &1u16.to_le_bytes());
}

#[test]
fn nested_empty_blocks_coalesce_to_one_location() {
    let md = compile(
        r#"
        (module (func
            block block block
            end end end
        ))
    "#,
    );
    // One placeholder per construct, no duplicates, then the return entry.
    assert_eq!(md.entries.len(), 32);

    // All three headers resolve to the same absolute location: the final
    // end (pc 9) and the metadata after the placeholders (mc 24).
    for (i, mc) in [0usize, 8, 16].into_iter().enumerate() {
        let (delta_pc, delta_mc) = jump_at(&md.entries, mc);
        let pc = 2 * i as i32; // block headers at pc 0, 2, 4
        assert_eq!(pc + delta_pc, 9);
        assert_eq!(mc as i32 + delta_mc, 24);
    }
}

#[test]
fn loop_back_edge_reuses_the_entry_recorded_at_open() {
    let md = compile(
        r#"
        (module (func
            loop
                br 0
            end
        ))
    "#,
    );
    // Loop length entry at mc 0, branch placeholder at mc 8.
    assert_eq!(md.entries[0], 2); // loop opcode + blocktype
    // Back edge from pc 2 to the loop header at pc 0, mc 0.
    assert_eq!(jump_at(&md.entries, 8), (-2, -8));

    // Resumption map: keyed by loop pc + 1.
    let resume = md.resume_points.get(&1).expect("loop resume point");
    assert_eq!(resume.loop_index, 0);
    assert_eq!(resume.live_values, 0);
    assert_eq!(resume.try_depth, 0);
}

#[test]
fn if_else_arms_are_patched_through_the_header() {
    let md = compile(
        r#"
        (module (func (param i32) (result i32)
            local.get 0
            if (result i32)
                i32.const 1
            else
                i32.const 2
            end
        ))
    "#,
    );
    // IfEntry(16) | const(8) | else JumpTarget(8) | const(8) | return(8).
    assert_eq!(md.entries.len(), 48);

    // False edge: from the if (pc 2) to the else arm's body (pc 7),
    // skipping the arm's own end-jump entry (mc 24 + 8).
    assert_eq!(u32_at(&md.entries, 0), 5);
    assert_eq!(u32_at(&md.entries, 4), 32);
    assert_eq!(md.entries[8], 2); // if opcode + blocktype

    // The then-arm's jump over the else arm: from the else (pc 6) to the
    // final end (pc 10, mc 40).
    assert_eq!(jump_at(&md.entries, 24), (4, 16));
}

#[test]
fn if_without_else_falls_through_to_the_end() {
    let md = compile(
        r#"
        (module (func (param i32)
            local.get 0
            if
                nop
            end
        ))
    "#,
    );
    // IfEntry(16) | return(8). False edge goes past the end (pc 6),
    // metadata unchanged (mc 16).
    assert_eq!(md.entries.len(), 24);
    assert_eq!(u32_at(&md.entries, 0), 4); // pc 2 -> pc 6
    assert_eq!(u32_at(&md.entries, 4), 16);
}

#[test]
fn code_after_a_return_emits_no_metadata() {
    let md = compile(
        r#"
        (module (func (result i32)
            i32.const 1
            return
            i32.const 2
            drop
            i32.const 3
        ))
    "#,
    );
    // Only the live constant and the return entry; the unreachable tail is
    // structure-tracked but emits nothing.
    assert_eq!(md.entries.len(), 16);
    assert_eq!(u32_at(&md.entries, 0), 1);
}

#[test]
fn identical_call_sites_share_one_cached_program() {
    let md = compile_nth(
        r#"
        (module
            (func $callee (param i32) (result i32) local.get 0)
            (func $caller (result i32)
                i32.const 7
                call $callee
                call $callee
            )
        )
    "#,
        1,
    );
    // const(8) | CallEntry(24)+program(16) | CallEntry(24)+program(16) |
    // return(8).
    assert_eq!(md.entries.len(), 96);
    // The two call headers differ only in their profile slot; the cached
    // programs are byte-identical.
    assert_eq!(&md.entries[32..48], &md.entries[72..88]);
    assert_eq!(md.call_targets, vec![Some(0), Some(0)]);
}

#[test]
fn call_frame_size_is_rounded_to_stack_alignment() {
    let md = compile_nth(
        r#"
        (module
            (func $callee
                (param i64 i64 i64 i64 i64 i64 i64 i64 i64 i64) (result i64)
                i64.const 0)
            (func $caller (result i64)
                i64.const 0 i64.const 0 i64.const 0 i64.const 0 i64.const 0
                i64.const 0 i64.const 0 i64.const 0 i64.const 0 i64.const 0
                call $callee
            )
        )
    "#,
        1,
    );
    // Ten i64 const entries (16 bytes each), then the call header.
    let call_mc = 160;
    assert_eq!(md.entries[call_mc], 2); // call + LEB index
    // Two stack args beyond 8 GPRs: header 16 + 16, already aligned.
    assert_eq!(u32_at(&md.entries, call_mc + 12), 32);
    assert_eq!(
        &md.entries[call_mc + 18..call_mc + 20],
        &10u16.to_le_bytes()
    );
    assert_eq!(md.max_operand_depth, 10);
}

#[test]
fn try_catch_records_a_handler() {
    let md = compile(
        r#"
        (module
            (tag $e (param i32))
            (func
                try
                    nop
                catch $e
                    drop
                end
            )
        )
    "#,
    );
    assert_eq!(md.exception_handlers.len(), 1);
    let handler = &md.exception_handlers[0];
    assert_eq!(handler.kind, HandlerKind::Catch);
    assert_eq!(handler.try_depth, 1);
    assert_eq!(handler.tag, 0);
    // The protected range starts at the try and includes the catch.
    assert_eq!(handler.start_pc, 0);
    assert!(handler.end_pc > handler.start_pc);
    // No rethrow: no reserved slots.
    assert_eq!(md.num_rethrow_slots, 0);
}

#[test]
fn rethrow_reserves_aligned_slots() {
    let md = compile(
        r#"
        (module
            (tag $e)
            (func
                try
                    nop
                catch $e
                    rethrow 0
                end
            )
        )
    "#,
    );
    // One try deep, rounded up to an even slot count.
    assert_eq!(md.num_rethrow_slots, 2);
    assert_eq!(md.frame_size_in_v128, 1 + md.max_operand_depth);
}

#[test]
fn tail_call_to_an_import_clobbers_the_instance() {
    let md = compile(
        r#"
        (module
            (import "env" "f" (func $f))
            (func
                return_call $f
            )
        )
    "#,
    );
    assert!(md.uses_tail_calls);
    assert!(md.tail_call_clobbers_instance);

    let md = compile_nth(
        r#"
        (module
            (func $local)
            (func
                return_call $local
            )
        )
    "#,
        1,
    );
    assert!(md.uses_tail_calls);
    assert!(!md.tail_call_clobbers_instance);
}

#[test]
fn br_table_emits_one_target_per_arm_plus_default() {
    let md = compile(
        r#"
        (module (func (param i32)
            block
                block
                    local.get 0
                    br_table 0 1
                end
            end
        ))
    "#,
    );
    // block JT(8) | block JT(8) | SwitchHeader(8) | 2 x (JT(8) + info(8)) |
    // return(8).
    assert_eq!(md.entries.len(), 64);
    assert_eq!(u32_at(&md.entries, 16), 2);
}

#[test]
fn immutable_global_set_is_rejected() {
    let err = try_compile_nth(
        r#"
        (module
            (global $g i32 (i32.const 0))
            (func
                i32.const 1
                global.set $g
            )
        )
    "#,
        0,
    )
    .unwrap_err();
    assert!(err.message.contains("immutable"));
}

#[test]
fn out_of_range_call_is_rejected() {
    // Assemble a raw module by hand: wat would refuse the bad index.
    let bytes = wat::parse_str(
        r#"
        (module (func (result i32) i32.const 1))
    "#,
    )
    .unwrap();
    let parsed = ModuleInfo::parse(&bytes).unwrap();
    let (func_index, _range) = parsed.bodies[0].clone();
    let signature = parsed.info.function_signature(func_index, 0).unwrap().clone();
    // Body with `call 9` (0x10 0x09) in place of the constant.
    let body = [0x00, 0x10, 0x09, 0x0b];
    let err = MetadataGenerator::new(&body, &signature, &parsed.info)
        .compile()
        .unwrap_err();
    assert!(err.message.contains("out of range"));
    assert_eq!(err.offset, 1);
}

#[test]
fn truncated_body_is_rejected() {
    let bytes = wat::parse_str("(module (func (result i32) i32.const 1))").unwrap();
    let parsed = ModuleInfo::parse(&bytes).unwrap();
    let (func_index, range) = parsed.bodies[0].clone();
    let signature = parsed.info.function_signature(func_index, 0).unwrap().clone();
    // Strip the trailing end opcode.
    let body = &bytes[range.start..range.end - 1];
    assert!(
        MetadataGenerator::new(body, &signature, &parsed.info)
            .compile()
            .is_err()
    );
}

#[test]
fn reference_locals_are_flagged_in_the_locals_program() {
    let md = compile(
        r#"
        (module (func (param i32)
            (local funcref)
            nop
        ))
    "#,
    );
    // One GPR argument tag, end tag, one reference flag; two locals total,
    // already even.
    assert_eq!(
        md.locals_program,
        vec![tag::ARG_GPR0, tag::LOCAL_END, 0xff]
    );
    assert_eq!(md.num_locals, 2);
}

#[test]
fn odd_local_count_gets_a_padding_byte() {
    let md = compile(
        r#"
        (module (func
            (local i64)
            nop
        ))
    "#,
    );
    assert_eq!(md.locals_program, vec![tag::LOCAL_END, 0x00, 0x00]);
    assert_eq!(md.num_locals, 1);
    assert_eq!(md.frame_size_in_v128, 1);
}

#[test]
fn memory_offsets_are_predecoded() {
    let md = compile(
        r#"
        (module
            (memory 1)
            (func (result i32)
                i32.const 8
                i32.const 1
                i32.store offset=4
                i32.const 8
                i32.load offset=4
            )
        )
    "#,
    );
    // const(8) const(8) store(8) const(8) load(8) return(8).
    assert_eq!(md.entries.len(), 48);
    // Store entry: offset 4, instruction length 3 (opcode + align + offset).
    assert_eq!(u32_at(&md.entries, 16), 4);
    assert_eq!(u32_at(&md.entries, 20), 3);
}

#[test]
fn bytecode_is_truncated_to_the_consumed_length() {
    let bytes = wat::parse_str("(module (func (result i32) i32.const 1))").unwrap();
    let parsed = ModuleInfo::parse(&bytes).unwrap();
    let (func_index, range) = parsed.bodies[0].clone();
    let signature = parsed.info.function_signature(func_index, 0).unwrap().clone();
    // Pad the body with trailing garbage the generator must not retain.
    let mut body = bytes[range].to_vec();
    let real_len = body.len();
    body.extend_from_slice(&[0xaa; 5]);
    let err = MetadataGenerator::new(&body, &signature, &parsed.info).compile();
    // Trailing bytes after the final end are malformed input.
    assert!(err.is_err());

    let md = compile("(module (func (result i32) i32.const 1))");
    assert_eq!(md.bytecode.len(), real_len);
    assert_eq!(md.code_offset, 1);
}
