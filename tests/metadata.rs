//! End-to-end tests over the public API: assemble a module from WAT, pull
//! the module info and body ranges, and generate metadata for each function.

use wasmeta::{generate, FunctionMetadata, HandlerKind, ModuleInfo};

fn compile_nth(wat_src: &str, n: usize) -> FunctionMetadata {
    let bytes = wat::parse_str(wat_src).expect("fixture must assemble");
    let parsed = ModuleInfo::parse(&bytes).expect("module must parse");
    let (func_index, range) = parsed.bodies[n].clone();
    let signature = parsed
        .info
        .function_signature(func_index, 0)
        .expect("function signature")
        .clone();
    generate(&bytes[range], &signature, &parsed.info).expect("fixture must compile")
}

fn compile(wat_src: &str) -> FunctionMetadata {
    compile_nth(wat_src, 0)
}

// --- Operand depth vs. an independent arity table ----------------------

/// Reference stack deltas for the opcodes the fixtures below use, written
/// against the wasm spec rather than the generator's own table.
fn reference_delta(name: &str) -> i32 {
    match name {
        "i32.const" | "i64.const" | "f32.const" | "f64.const" | "local.get" => 1,
        "local.set" | "drop" => -1,
        "local.tee" | "i32.eqz" | "i32.clz" | "i64.extend_i32_s" | "f64.sqrt"
        | "f64.convert_i32_s" | "i32.wrap_i64" => 0,
        "i32.add" | "i32.sub" | "i32.mul" | "i32.and" | "i32.xor" | "i32.shl" | "i64.add"
        | "i64.mul" | "f64.add" | "f64.div" | "i32.lt_s" | "i32.eq" | "f64.gt" => -1,
        "select" => -2,
        other => panic!("no reference delta for {other}"),
    }
}

/// Walks a straight-line instruction list, tracking height and max with the
/// reference table, and checks the generator saw the same maximum.
fn check_straight_line(instructions: &[&str]) {
    let body_text = instructions.join("\n");
    let md = compile(&format!(
        "(module (func (local i32) (local i64) {body_text} drop))"
    ));

    let mut height: i32 = 0;
    let mut max: i32 = 0;
    for instr in instructions {
        let name = instr.split_whitespace().next().unwrap();
        height += reference_delta(name);
        assert!(height >= 0, "reference table underflow at {instr}");
        max = max.max(height);
    }
    // The trailing drop only lowers the height.
    assert_eq!(md.max_operand_depth, max as u32);
}

#[test]
fn operand_depth_matches_reference_arity_table() {
    check_straight_line(&["i32.const 1", "i32.const 2", "i32.add"]);
    check_straight_line(&[
        "i32.const 1",
        "i32.const 2",
        "i32.const 3",
        "select",
        "i32.eqz",
    ]);
    check_straight_line(&[
        "local.get 0",
        "i32.const 10",
        "i32.mul",
        "local.tee 0",
        "i64.extend_i32_s",
        "local.get 1",
        "i64.add",
        "i32.wrap_i64",
    ]);
    check_straight_line(&[
        "f64.const 1.5",
        "f64.const 2.5",
        "f64.div",
        "f64.sqrt",
        "i32.const 3",
        "f64.convert_i32_s",
        "f64.gt",
    ]);
}

#[test]
fn two_local_add_scenario() {
    // locals (i32, i32), body: local.get 0; local.get 1; i32.add; end.
    let md = compile(
        r#"
        (module (func (param i32 i32) (result i32)
            local.get 0
            local.get 1
            i32.add
        ))
    "#,
    );
    // Depth runs 1, 2, 1: the maximum is two slots.
    assert_eq!(md.max_operand_depth, 2);
    // The add reserves nothing; the single entry is the terminal return
    // marshalling.
    assert_eq!(md.entries.len(), 8);
}

// --- Placeholder patching ----------------------------------------------

/// No entry may retain the 0xbeef/0xbeef sentinel once generation returns.
fn assert_no_sentinel(md: &FunctionMetadata) {
    let sentinel: Vec<u8> = [0xbeefu32, 0xbeef]
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect();
    for window in md.entries.chunks(8) {
        assert_ne!(window, &sentinel[..], "unpatched placeholder survived");
    }
}

#[test]
fn every_placeholder_is_patched_before_finalize() {
    let fixtures = [
        "(module (func block block block end end end))",
        "(module (func (result i32) block (result i32) i32.const 1 br 0 end))",
        "(module (func loop br 0 end))",
        "(module (func (param i32) local.get 0 if nop else nop end))",
        "(module (func (param i32) block block local.get 0 br_table 0 1 end end))",
        "(module (tag $e) (func try nop catch $e nop catch_all nop end))",
        "(module (func block (result i32) i32.const 0 br_if 1 i32.const 2 br 0 end drop))",
    ];
    for fixture in fixtures {
        assert_no_sentinel(&compile(fixture));
    }
}

#[test]
fn deeply_nested_branches_resolve_in_one_pass() {
    let md = compile(
        r#"
        (module (func (param i32)
            block
                block
                    block
                        local.get 0
                        br_if 2
                        local.get 0
                        br_if 1
                        local.get 0
                        br_if 0
                    end
                end
            end
        ))
    "#,
    );
    assert_no_sentinel(&md);
}

// --- Calls --------------------------------------------------------------

#[test]
fn call_frame_size_rounds_up_to_stack_alignment() {
    // Nine i64 arguments: one spills past the eight GPRs, so the native
    // frame is header (16) + 8 bytes of stack args, rounded up to 32.
    let md = compile_nth(
        r#"
        (module
            (func $callee (param i64 i64 i64 i64 i64 i64 i64 i64 i64))
            (func
                i64.const 0 i64.const 0 i64.const 0 i64.const 0 i64.const 0
                i64.const 0 i64.const 0 i64.const 0 i64.const 0
                call $callee
            )
        )
    "#,
        1,
    );
    // Nine Index64 const entries precede the call header; the frame size
    // lives 12 bytes into it.
    let call_mc = 9 * 16;
    let frame = u32::from_le_bytes(md.entries[call_mc + 12..call_mc + 16].try_into().unwrap());
    assert_eq!(frame, 32);
}

#[test]
fn register_only_call_keeps_the_minimal_frame() {
    let md = compile_nth(
        r#"
        (module
            (func $callee (param i32 f64) (result i32) i32.const 0)
            (func (result i32)
                i32.const 1
                f64.const 2.0
                call $callee
            )
        )
    "#,
        1,
    );
    // const(8) + const(16) puts the call header at 24.
    let frame = u32::from_le_bytes(md.entries[24 + 12..24 + 16].try_into().unwrap());
    assert_eq!(frame, 16);
}

#[test]
fn call_profile_slots_record_direct_targets_only() {
    let md = compile_nth(
        r#"
        (module
            (type $sig (func))
            (table 1 funcref)
            (func $a)
            (func
                call $a
                i32.const 0
                call_indirect (type $sig)
                call $a
            )
        )
    "#,
        1,
    );
    assert_eq!(md.call_targets, vec![Some(0), None, Some(0)]);
}

#[test]
fn tail_calls_are_flagged() {
    let md = compile_nth(
        r#"
        (module
            (func $a)
            (func return_call $a)
        )
    "#,
        1,
    );
    assert!(md.uses_tail_calls);
    assert!(!md.tail_call_clobbers_instance);

    let md = compile_nth(
        r#"
        (module
            (type $sig (func))
            (table 1 funcref)
            (func
                i32.const 0
                return_call_indirect (type $sig)
            )
        )
    "#,
        0,
    );
    assert!(md.uses_tail_calls);
    assert!(md.tail_call_clobbers_instance);
}

// --- Exceptions ----------------------------------------------------------

#[test]
fn catch_arms_build_the_handler_table() {
    let md = compile(
        r#"
        (module
            (tag $a (param i32))
            (tag $b)
            (func
                try
                    nop
                catch $a
                    drop
                catch $b
                    nop
                catch_all
                    nop
                end
            )
        )
    "#,
    );
    assert_eq!(md.exception_handlers.len(), 3);
    assert_eq!(md.exception_handlers[0].kind, HandlerKind::Catch);
    assert_eq!(md.exception_handlers[0].tag, 0);
    assert_eq!(md.exception_handlers[1].kind, HandlerKind::Catch);
    assert_eq!(md.exception_handlers[1].tag, 1);
    assert_eq!(md.exception_handlers[2].kind, HandlerKind::CatchAll);
    // All protect the same try and share its depth.
    for handler in &md.exception_handlers {
        assert_eq!(handler.start_pc, 0);
        assert_eq!(handler.try_depth, 1);
    }
    assert_no_sentinel(&md);
}

#[test]
fn nested_tries_deepen_the_rethrow_region() {
    let md = compile(
        r#"
        (module
            (tag $e)
            (func
                try
                    try
                        nop
                    catch $e
                        rethrow 0
                    end
                catch $e
                    nop
                end
            )
        )
    "#,
    );
    // Two tries deep; rethrow slots round up to an even count.
    assert_eq!(md.num_rethrow_slots, 2);
    let inner = md
        .exception_handlers
        .iter()
        .find(|h| h.try_depth == 2)
        .expect("inner handler at depth 2");
    assert_eq!(inner.kind, HandlerKind::Catch);
}

#[test]
fn delegate_records_its_target_depth() {
    let md = compile(
        r#"
        (module
            (tag $e)
            (func
                try
                    try
                        nop
                    delegate 0
                catch $e
                    nop
                end
            )
        )
    "#,
    );
    let delegate = md
        .exception_handlers
        .iter()
        .find(|h| h.kind == HandlerKind::Delegate)
        .expect("delegate handler");
    // The inner try delegates to the outer one (depth 1).
    assert_eq!(delegate.tag, 1);
    assert_eq!(delegate.try_depth, 2);
}

#[test]
fn try_table_arms_are_recorded_in_declaration_order() {
    let md = compile(
        r#"
        (module
            (tag $a)
            (func
                block
                    try_table (catch $a 0) (catch_all 0)
                        nop
                    end
                end
            )
        )
    "#,
    );
    let kinds: Vec<HandlerKind> = md.exception_handlers.iter().map(|h| h.kind).collect();
    assert_eq!(
        kinds,
        vec![HandlerKind::TryTableCatch, HandlerKind::TryTableCatchAll]
    );
    assert_eq!(md.exception_handlers[0].tag, 0);
    // Arm metadata sits at a fixed stride after the header placeholder.
    assert_eq!(
        md.exception_handlers[1].handler_mc,
        md.exception_handlers[0].handler_mc + 16
    );
    assert_no_sentinel(&md);
}

// --- Loops and resumption ------------------------------------------------

#[test]
fn each_loop_gets_a_resume_point() {
    let md = compile(
        r#"
        (module (func (param i32)
            loop
                nop
            end
            i32.const 1
            loop
                nop
            end
            drop
        ))
    "#,
    );
    assert_eq!(md.resume_points.len(), 2);
    let mut points: Vec<_> = md.resume_points.values().collect();
    points.sort_by_key(|p| p.loop_index);
    assert_eq!(points[0].loop_index, 0);
    assert_eq!(points[0].live_values, 0);
    assert_eq!(points[1].loop_index, 1);
    // The second loop runs with the constant still live.
    assert_eq!(points[1].live_values, 1);
    // Offset zero is reserved for "absent".
    assert!(!md.resume_points.contains_key(&0));
}

#[test]
fn loop_inside_try_remembers_the_exception_depth() {
    let md = compile(
        r#"
        (module
            (tag $e)
            (func
                try
                    loop
                        nop
                    end
                catch $e
                    nop
                end
            )
        )
    "#,
    );
    let point = md.resume_points.values().next().expect("resume point");
    assert_eq!(point.try_depth, 1);
}

// --- Frame accounting ----------------------------------------------------

#[test]
fn frame_size_covers_locals_rethrow_and_operands() {
    let md = compile(
        r#"
        (module (func (param i32) (local i64 i64)
            i32.const 1
            i32.const 2
            i32.const 3
            drop drop drop
        ))
    "#,
    );
    // Three locals round up to 2 v128 units; no rethrow slots; max depth 3.
    assert_eq!(md.num_locals, 3);
    assert_eq!(md.max_operand_depth, 3);
    assert_eq!(md.frame_size_in_v128, 2 + 3);
    // One argument tag, the end tag, two declared-local flags, and the
    // padding byte for the odd local count.
    assert_eq!(md.locals_program.len(), 5);
}

#[test]
fn memory64_offsets_use_wide_entries() {
    let narrow = compile(
        r#"
        (module (memory 1)
            (func (result i32) i32.const 0 i32.load offset=16))
    "#,
    );
    let wide = compile(
        r#"
        (module (memory i64 1)
            (func (result i32) i64.const 0 i32.load offset=16))
    "#,
    );
    // const(8) + load(8) + return(8) vs const(16) + load(16) + return(8).
    assert_eq!(narrow.entries.len(), 24);
    assert_eq!(wide.entries.len(), 40);
}

// --- Failure paths -------------------------------------------------------

#[test]
fn failures_carry_an_offset_and_no_artifact() {
    let bytes = wat::parse_str(
        r#"
        (module
            (global $g i32 (i32.const 0))
            (func i32.const 1 global.set $g)
        )
    "#,
    )
    .unwrap();
    let parsed = ModuleInfo::parse(&bytes).unwrap();
    let (func_index, range) = parsed.bodies[0].clone();
    let signature = parsed.info.function_signature(func_index, 0).unwrap().clone();
    let err = generate(&bytes[range.clone()], &signature, &parsed.info).unwrap_err();
    assert!(err.message.contains("immutable"));
    // The offset points inside the function body, at the global.set.
    assert!(err.offset > 0 && err.offset < range.len());
}
