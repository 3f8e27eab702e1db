//! End-to-end reconstruction scenarios over hand-assembled code records.

use std::rc::Rc;

use depyc_lib::{
    decompile, decompile_module, engine, CodeFlags, CodeObject, DecompileOptions, OutputMode,
    PycModule, Value, Version,
};

const V27: Version = Version::new(2, 7);
const V38: Version = Version::new(3, 8);
const V311: Version = Version::new(3, 11);

/// Assemble wordcode (3.6+): every instruction is two bytes.
fn asm_word(instrs: &[(u8, u8)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(instrs.len() * 2);
    for &(op, arg) in instrs {
        out.push(op);
        out.push(arg);
    }
    out
}

/// Assemble the pre-3.6 variable-width form: one byte below the argument
/// threshold, three bytes at or above it.
fn asm_legacy(instrs: &[(u8, Option<u16>)]) -> Vec<u8> {
    let mut out = Vec::new();
    for &(op, arg) in instrs {
        out.push(op);
        if let Some(arg) = arg {
            out.extend_from_slice(&arg.to_le_bytes());
        }
    }
    out
}

fn module_code(code: Vec<u8>, consts: Vec<Value>, names: &[&str]) -> CodeObject {
    CodeObject {
        stack_size: 16,
        code,
        consts,
        names: names.iter().map(|s| s.to_string()).collect(),
        name: "<module>".to_string(),
        file_name: "test.py".to_string(),
        ..Default::default()
    }
}

fn func_code(
    name: &str,
    arg_count: u32,
    var_names: &[&str],
    code: Vec<u8>,
    consts: Vec<Value>,
    names: &[&str],
) -> CodeObject {
    CodeObject {
        arg_count,
        num_locals: var_names.len() as u32,
        stack_size: 16,
        flags: CodeFlags::OPTIMIZED | CodeFlags::NEWLOCALS,
        code,
        consts,
        names: names.iter().map(|s| s.to_string()).collect(),
        var_names: var_names.iter().map(|s| s.to_string()).collect(),
        name: name.to_string(),
        file_name: "test.py".to_string(),
        ..Default::default()
    }
}

fn source(version: Version, code: CodeObject) -> String {
    let module = PycModule {
        version,
        code: Rc::new(code),
    };
    decompile_module(&module, DecompileOptions::default()).expect("decompile")
}

#[test]
fn function_returning_sum() {
    let f = func_code(
        "f",
        0,
        &[],
        asm_word(&[(100, 0), (100, 1), (23, 0), (83, 0)]),
        vec![Value::Int(1), Value::Int(2)],
        &[],
    );
    let module = module_code(
        asm_word(&[(100, 0), (100, 1), (132, 0), (90, 0), (100, 2), (83, 0)]),
        vec![
            Value::Code(Rc::new(f)),
            Value::Str("f".into()),
            Value::None,
        ],
        &["f"],
    );
    assert_eq!(source(V38, module), "def f():\n    return 1 + 2\n");
}

fn if_else_module() -> CodeObject {
    // 0  LOAD_NAME a
    // 2  POP_JUMP_IF_FALSE 10
    // 4  LOAD_CONST 1
    // 6  STORE_NAME b
    // 8  JUMP_FORWARD +4 (to 14)
    // 10 LOAD_CONST 2
    // 12 STORE_NAME b
    // 14 LOAD_CONST None
    // 16 RETURN_VALUE
    module_code(
        asm_word(&[
            (101, 0),
            (114, 10),
            (100, 0),
            (90, 1),
            (110, 4),
            (100, 1),
            (90, 1),
            (100, 2),
            (83, 0),
        ]),
        vec![Value::Int(1), Value::Int(2), Value::None],
        &["a", "b"],
    )
}

#[test]
fn if_else_statement() {
    assert_eq!(
        source(V38, if_else_module()),
        "if a:\n    b = 1\nelse:\n    b = 2\n"
    );
}

#[test]
fn ternary_expression() {
    // Same shape, but both branches leave a value and the store happens at
    // the merge point.
    let module = module_code(
        asm_word(&[
            (101, 0),
            (114, 8),
            (100, 0),
            (110, 2),
            (100, 1),
            (90, 1),
            (100, 2),
            (83, 0),
        ]),
        vec![Value::Int(1), Value::Int(2), Value::None],
        &["a", "b"],
    );
    assert_eq!(source(V38, module), "b = 1 if a else 2\n");
}

#[test]
fn const_key_map() {
    let module = module_code(
        asm_word(&[(100, 1), (100, 2), (100, 0), (156, 2), (90, 0), (100, 3), (83, 0)]),
        vec![
            Value::Tuple(vec![Value::Str("x".into()), Value::Str("y".into())]),
            Value::Int(1),
            Value::Int(2),
            Value::None,
        ],
        &["d"],
    );
    assert_eq!(source(V38, module), "d = {'x': 1, 'y': 2}\n");
}

#[test]
fn class_definition() {
    let body = func_code(
        "C",
        0,
        &[],
        asm_word(&[(100, 0), (90, 0), (100, 1), (83, 0)]),
        vec![Value::Int(1), Value::None],
        &["x"],
    );
    let module = module_code(
        asm_word(&[
            (71, 0),
            (100, 0),
            (100, 1),
            (132, 0),
            (100, 1),
            (131, 2),
            (90, 0),
            (100, 2),
            (83, 0),
        ]),
        vec![
            Value::Code(Rc::new(body)),
            Value::Str("C".into()),
            Value::None,
        ],
        &["C"],
    );
    assert_eq!(source(V38, module), "class C:\n    x = 1\n");
}

#[test]
fn call_with_kw_names_sideband() {
    // 3.11: PUSH_NULL; LOAD_NAME f; args; KW_NAMES; PRECALL; CALL
    let module = module_code(
        asm_word(&[
            (151, 0),
            (2, 0),
            (101, 0),
            (100, 0),
            (100, 1),
            (172, 2),
            (166, 2),
            (171, 2),
            (1, 0),
            (100, 3),
            (83, 0),
        ]),
        vec![
            Value::Int(1),
            Value::Int(2),
            Value::Tuple(vec![Value::Str("k".into())]),
            Value::None,
        ],
        &["f"],
    );
    assert_eq!(source(V311, module), "f(1, k=2)\n");
}

#[test]
fn deterministic_output() {
    let a = source(V38, if_else_module());
    let b = source(V38, if_else_module());
    assert_eq!(a, b);
}

#[test]
fn ternary_tree_is_stable() {
    let module = module_code(
        asm_word(&[
            (101, 0),
            (114, 8),
            (100, 0),
            (110, 2),
            (100, 1),
            (90, 1),
            (100, 2),
            (83, 0),
        ]),
        vec![Value::Int(1), Value::Int(2), Value::None],
        &["a", "b"],
    );
    let mut ctx_a = engine::BuildCtx::new(V38);
    let tree_a = engine::build(&module, depyc_lib::ast::BlockKind::Main, &mut ctx_a).unwrap();
    let mut ctx_b = engine::BuildCtx::new(V38);
    let tree_b = engine::build(&module, depyc_lib::ast::BlockKind::Main, &mut ctx_b).unwrap();
    assert_eq!(tree_a, tree_b);
    assert!(ctx_a.clean);
}

#[test]
fn augmented_assignment() {
    let module = module_code(
        asm_word(&[(101, 0), (100, 0), (55, 0), (90, 0), (100, 1), (83, 0)]),
        vec![Value::Int(1), Value::None],
        &["x"],
    );
    assert_eq!(source(V38, module), "x += 1\n");
}

#[test]
fn chained_assignment() {
    let module = module_code(
        asm_word(&[(100, 0), (4, 0), (90, 0), (90, 1), (100, 1), (83, 0)]),
        vec![Value::Int(1), Value::None],
        &["a", "b"],
    );
    assert_eq!(source(V38, module), "a = b = 1\n");
}

#[test]
fn short_circuit_and() {
    let module = module_code(
        asm_word(&[(101, 0), (111, 6), (101, 1), (90, 2), (100, 0), (83, 0)]),
        vec![Value::None],
        &["a", "b", "x"],
    );
    assert_eq!(source(V38, module), "x = a and b\n");
}

#[test]
fn while_loop_27() {
    // 0  SETUP_LOOP +16 (to 19)
    // 3  LOAD_NAME a
    // 6  POP_JUMP_IF_FALSE 18
    // 9  LOAD_CONST 1
    // 12 STORE_NAME x
    // 15 JUMP_ABSOLUTE 3
    // 18 POP_BLOCK
    // 19 LOAD_CONST None
    // 22 RETURN_VALUE
    let module = module_code(
        asm_legacy(&[
            (120, Some(16)),
            (101, Some(0)),
            (114, Some(18)),
            (100, Some(0)),
            (90, Some(1)),
            (113, Some(3)),
            (87, None),
            (100, Some(1)),
            (83, None),
        ]),
        vec![Value::Int(1), Value::None],
        &["a", "x"],
    );
    assert_eq!(source(V27, module), "while a:\n    x = 1\n");
}

#[test]
fn for_loop_38() {
    // 0  LOAD_NAME xs
    // 2  GET_ITER
    // 4  FOR_ITER +8 (to 14)
    // 6  STORE_NAME i
    // 8  LOAD_CONST 1
    // 10 STORE_NAME x
    // 12 JUMP_ABSOLUTE 4
    // 14 LOAD_CONST None
    // 16 RETURN_VALUE
    let module = module_code(
        asm_word(&[
            (101, 0),
            (68, 0),
            (93, 8),
            (90, 1),
            (100, 0),
            (90, 2),
            (113, 4),
            (100, 1),
            (83, 0),
        ]),
        vec![Value::Int(1), Value::None],
        &["xs", "i", "x"],
    );
    assert_eq!(source(V38, module), "for i in xs:\n    x = 1\n");
}

#[test]
fn print_statement_27() {
    let module = module_code(
        asm_legacy(&[
            (101, Some(0)),
            (71, None),
            (72, None),
            (100, Some(0)),
            (83, None),
        ]),
        vec![Value::None],
        &["a"],
    );
    assert_eq!(source(V27, module), "print a\n");
}

#[test]
fn list_comprehension() {
    let lc = func_code(
        "<listcomp>",
        1,
        &[".0", "x"],
        asm_word(&[
            (103, 0),
            (124, 0),
            (93, 8),
            (125, 1),
            (124, 1),
            (145, 2),
            (113, 4),
            (83, 0),
        ]),
        vec![Value::None],
        &[],
    );
    let module = module_code(
        asm_word(&[
            (100, 0),
            (100, 1),
            (132, 0),
            (101, 0),
            (68, 0),
            (131, 1),
            (90, 1),
            (100, 2),
            (83, 0),
        ]),
        vec![
            Value::Code(Rc::new(lc)),
            Value::Str("<listcomp>".into()),
            Value::None,
        ],
        &["xs", "ys"],
    );
    assert_eq!(source(V38, module), "ys = [x for x in xs]\n");
}

#[test]
fn plain_import() {
    let module = module_code(
        asm_word(&[(100, 0), (100, 1), (108, 0), (90, 0), (100, 1), (83, 0)]),
        vec![Value::Int(0), Value::None],
        &["os"],
    );
    assert_eq!(source(V38, module), "import os\n");
}

#[test]
fn from_import() {
    let module = module_code(
        asm_word(&[
            (100, 0),
            (100, 1),
            (108, 0),
            (109, 1),
            (90, 1),
            (1, 0),
            (100, 2),
            (83, 0),
        ]),
        vec![
            Value::Int(0),
            Value::Tuple(vec![Value::Str("path".into())]),
            Value::None,
        ],
        &["os", "path"],
    );
    assert_eq!(source(V38, module), "from os import path\n");
}

#[test]
fn try_bare_except_27() {
    // 0  SETUP_EXCEPT +10 (handler at 13)
    // 3  LOAD_CONST 1
    // 6  STORE_NAME x
    // 9  POP_BLOCK
    // 10 JUMP_FORWARD +13 (to 26)
    // 13 POP_TOP x3
    // 16 LOAD_CONST 2
    // 19 STORE_NAME y
    // 22 JUMP_FORWARD +1 (to 26)
    // 25 END_FINALLY
    // 26 LOAD_CONST None
    // 29 RETURN_VALUE
    let module = module_code(
        asm_legacy(&[
            (121, Some(10)),
            (100, Some(0)),
            (90, Some(0)),
            (87, None),
            (110, Some(13)),
            (1, None),
            (1, None),
            (1, None),
            (100, Some(1)),
            (90, Some(1)),
            (110, Some(1)),
            (88, None),
            (100, Some(2)),
            (83, None),
        ]),
        vec![Value::Int(1), Value::Int(2), Value::None],
        &["x", "y"],
    );
    assert_eq!(
        source(V27, module),
        "try:\n    x = 1\nexcept:\n    y = 2\n"
    );
}

#[test]
fn try_typed_except_27() {
    // try: x = 1 / except E, e: y = 2
    let module = module_code(
        asm_legacy(&[
            (121, Some(10)), // 0  SETUP_EXCEPT -> 13
            (100, Some(0)),  // 3  LOAD_CONST 1
            (90, Some(1)),   // 6  STORE_NAME x
            (87, None),      // 9  POP_BLOCK
            (110, Some(25)), // 10 JUMP_FORWARD -> 38
            (4, None),       // 13 DUP_TOP
            (101, Some(0)),  // 14 LOAD_NAME E
            (107, Some(10)), // 17 COMPARE_OP exception-match
            (114, Some(37)), // 20 POP_JUMP_IF_FALSE -> 37
            (1, None),       // 23 POP_TOP
            (90, Some(2)),   // 24 STORE_NAME e
            (1, None),       // 27 POP_TOP
            (100, Some(1)),  // 28 LOAD_CONST 2
            (90, Some(3)),   // 31 STORE_NAME y
            (110, Some(1)),  // 34 JUMP_FORWARD -> 38
            (88, None),      // 37 END_FINALLY
            (100, Some(2)),  // 38 LOAD_CONST None
            (83, None),      // 41 RETURN_VALUE
        ]),
        vec![Value::Int(1), Value::Int(2), Value::None],
        &["E", "x", "e", "y"],
    );
    assert_eq!(
        source(V27, module),
        "try:\n    x = 1\nexcept E, e:\n    y = 2\n"
    );
}

#[test]
fn with_statement_27() {
    let module = module_code(
        asm_legacy(&[
            (101, Some(0)),  // 0  LOAD_NAME ctx
            (143, Some(13)), // 3  SETUP_WITH -> 19
            (90, Some(1)),   // 6  STORE_NAME v
            (100, Some(0)),  // 9  LOAD_CONST 1
            (90, Some(2)),   // 12 STORE_NAME x
            (87, None),      // 15 POP_BLOCK
            (100, Some(1)),  // 16 LOAD_CONST None
            (81, None),      // 19 WITH_CLEANUP
            (88, None),      // 20 END_FINALLY
            (100, Some(1)),  // 21 LOAD_CONST None
            (83, None),      // 24 RETURN_VALUE
        ]),
        vec![Value::Int(1), Value::None],
        &["ctx", "v", "x"],
    );
    assert_eq!(source(V27, module), "with ctx as v:\n    x = 1\n");
}

#[test]
fn lambda_assignment() {
    let lambda = func_code(
        "<lambda>",
        1,
        &["x"],
        asm_word(&[(124, 0), (100, 0), (23, 0), (83, 0)]),
        vec![Value::Int(1)],
        &[],
    );
    let module = module_code(
        asm_word(&[(100, 0), (100, 1), (132, 0), (90, 0), (100, 2), (83, 0)]),
        vec![
            Value::Code(Rc::new(lambda)),
            Value::Str("<lambda>".into()),
            Value::None,
        ],
        &["f"],
    );
    assert_eq!(source(V38, module), "f = lambda x: x + 1\n");
}

#[test]
fn module_docstring_hoisted() {
    let module = module_code(
        asm_word(&[(100, 0), (90, 0), (100, 1), (83, 0)]),
        vec![Value::Str("doc".into()), Value::None],
        &["__doc__"],
    );
    assert_eq!(source(V38, module), "'doc'\n");
}

#[test]
fn tuple_unpack_assignment() {
    let module = module_code(
        asm_word(&[(101, 0), (92, 2), (90, 1), (90, 2), (100, 0), (83, 0)]),
        vec![Value::None],
        &["t", "a", "b"],
    );
    assert_eq!(source(V38, module), "a, b = t\n");
}

#[test]
fn nested_tuple_unpack_assignment() {
    // a, (b, c) = t: the inner UNPACK_SEQUENCE arrives while the outer
    // target list is still being collected.
    let module = module_code(
        asm_word(&[
            (101, 0),
            (92, 2),
            (90, 1),
            (92, 2),
            (90, 2),
            (90, 3),
            (100, 0),
            (83, 0),
        ]),
        vec![Value::None],
        &["t", "a", "b", "c"],
    );
    assert_eq!(source(V38, module), "a, (b, c) = t\n");
}

#[test]
fn starred_unpack_assignment() {
    // a, *b, c = t: UNPACK_EX packs counts before/after the star into the
    // low/high operand bytes (1 | 1 << 8, via EXTENDED_ARG in wordcode).
    let module = module_code(
        asm_word(&[
            (101, 0),
            (144, 1),
            (94, 1),
            (90, 1),
            (90, 2),
            (90, 3),
            (100, 0),
            (83, 0),
        ]),
        vec![Value::None],
        &["t", "a", "b", "c"],
    );
    assert_eq!(source(V38, module), "a, *b, c = t\n");
}

#[test]
fn nested_unpack_in_for_loop() {
    // for k, (v1, v2) in items: x = 1
    // 0  LOAD_NAME items
    // 2  GET_ITER
    // 4  FOR_ITER +12 (to 18)
    // 6  UNPACK_SEQUENCE 2
    // 8  STORE_NAME k
    // 10 UNPACK_SEQUENCE 2
    // 12 STORE_NAME v1
    // 14 STORE_NAME v2
    // 16 JUMP_ABSOLUTE 4
    // 18 LOAD_CONST None
    // 20 RETURN_VALUE
    let module = module_code(
        asm_word(&[
            (101, 0),
            (68, 0),
            (93, 12),
            (92, 2),
            (90, 1),
            (92, 2),
            (90, 2),
            (90, 3),
            (113, 4),
            (100, 0),
            (83, 0),
        ]),
        vec![Value::None],
        &["items", "k", "v1", "v2"],
    );
    assert_eq!(
        source(V38, module),
        "for k, (v1, v2) in items:\n    pass\n"
    );
}

#[test]
fn disassembly_listing() {
    let module = PycModule {
        version: V38,
        code: Rc::new(module_code(
            asm_word(&[(100, 0), (90, 0), (100, 1), (83, 0)]),
            vec![Value::Int(1), Value::None],
            &["x"],
        )),
    };
    let listing = decompile_module(
        &module,
        DecompileOptions {
            mode: OutputMode::Disasm,
            warn_banner: true,
        },
    )
    .unwrap();
    assert!(listing.contains("LOAD_CONST"));
    assert!(listing.contains("; 1"));
    assert!(listing.contains("STORE_NAME"));
    assert!(listing.contains("; x"));
}

#[test]
fn full_container_round_trip() {
    // A complete 3.8 pyc: header plus a marshalled module for `x = 1`.
    let mut data = Vec::new();
    data.extend_from_slice(&0x0A0D0D55u32.to_le_bytes()); // magic
    data.extend_from_slice(&0u32.to_le_bytes()); // flags
    data.extend_from_slice(&0u32.to_le_bytes()); // mtime
    data.extend_from_slice(&0u32.to_le_bytes()); // size

    data.push(b'c');
    data.extend_from_slice(&0u32.to_le_bytes()); // argcount
    data.extend_from_slice(&0u32.to_le_bytes()); // posonlyargcount
    data.extend_from_slice(&0u32.to_le_bytes()); // kwonlyargcount
    data.extend_from_slice(&0u32.to_le_bytes()); // nlocals
    data.extend_from_slice(&2u32.to_le_bytes()); // stacksize
    data.extend_from_slice(&64u32.to_le_bytes()); // flags (CO_NOFREE)
    // code bytes
    let code = asm_word(&[(100, 0), (90, 0), (100, 1), (83, 0)]);
    data.push(b's');
    data.extend_from_slice(&(code.len() as u32).to_le_bytes());
    data.extend_from_slice(&code);
    // consts (1, None)
    data.extend_from_slice(&[b')', 2, b'i']);
    data.extend_from_slice(&1i32.to_le_bytes());
    data.push(b'N');
    // names ('x',)
    data.extend_from_slice(&[b')', 1, b'z', 1, b'x']);
    // varnames, freevars, cellvars
    data.extend_from_slice(&[b')', 0, b')', 0, b')', 0]);
    // filename, name
    data.extend_from_slice(&[b'z', 4]);
    data.extend_from_slice(b"t.py");
    data.extend_from_slice(&[b'z', 8]);
    data.extend_from_slice(b"<module>");
    // firstlineno + lnotab
    data.extend_from_slice(&1u32.to_le_bytes());
    data.push(b's');
    data.extend_from_slice(&0u32.to_le_bytes());

    assert_eq!(decompile(&data).unwrap(), "x = 1\n");
}
