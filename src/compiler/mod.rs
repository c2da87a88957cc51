//! Script compiler
//!
//! Source text is compiled to bytecode in three steps:
//!
//! # Lexing
//!
//! A single forward scan produces a flat list of tokens with line numbers.
//!
//! # Parsing
//!
//! Brackets are matched into a token tree, control structures and function
//! literals get their bodies attached, and a precedence climber turns every
//! bracket's contents into a [`parser::Node`] tree.
//!
//! # Code generation
//!
//! The tree is walked once per function literal, emitting a word array and a
//! constant pool. Nested function literals become `Code` constants of the
//! enclosing unit and are bound to a closure when they execute.
use crate::{error::CompileError, runtime::value::Value, vm::context::Ctx};

pub mod codegen;
pub mod lexer;
pub mod parser;
pub mod tokens;

impl Ctx<'_> {
    /// Compiles `src` into a code object. The code takes no declared
    /// parameters and evaluates to its last statement's value.
    pub fn compile(&mut self, src: &[u8], file: &str, first_line: u32) -> Result<Value, CompileError> {
        let tree = parser::parse(src, first_line).map_err(|e| e.in_file(file))?;
        codegen::generate(self, &tree, file).map_err(|e| e.in_file(file))
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        error::{CompileError, RtResult},
        runtime::{libraries, value::Value, Runtime},
        vm::context::Ctx,
    };

    fn run_with(src: &str, setup: impl FnOnce(&mut Ctx<'_>, &Value), check: impl FnOnce(&mut Ctx<'_>, RtResult)) {
        let rt = Runtime::new();
        let mut cx = rt.new_context();
        cx.with(|ctx| {
            let ns = ctx.new_hash();
            libraries::core::register(ctx, &ns).unwrap();
            setup(ctx, &ns);
            let code = ctx.compile(src.as_bytes(), "test.nas", 1).unwrap();
            let result = ctx.call_value(&code, &[], Value::Nil, ns);
            check(ctx, result);
        });
    }

    fn run(src: &str, check: impl FnOnce(&mut Ctx<'_>, RtResult)) {
        run_with(src, |_, _| (), check)
    }

    fn num(src: &str) -> f64 {
        let mut out = f64::NAN;
        run(src, |_, r| out = r.unwrap().num().unwrap());
        out
    }

    fn text(src: &str) -> String {
        let mut out = String::new();
        run(src, |_, r| out = r.unwrap().to_str_lossy().unwrap());
        out
    }

    fn error(src: &str) -> String {
        let mut out = String::new();
        run(src, |_, r| out = r.unwrap_err().message);
        out
    }

    fn compile_error(src: &str) -> CompileError {
        let rt = Runtime::new();
        let mut cx = rt.new_context();
        cx.compile(src.as_bytes(), "big.nas", 1).unwrap_err()
    }

    fn on_small_stack<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
        std::thread::Builder::new()
            .stack_size(2 << 20)
            .spawn(f)
            .unwrap()
            .join()
            .unwrap()
    }

    fn nums(v: &Value) -> Vec<f64> {
        v.vec_items()
            .unwrap()
            .iter()
            .map(|x| x.num().unwrap())
            .collect()
    }

    #[test]
    fn last_statement_is_the_result() {
        assert_eq!(num("a = 1; a + 2"), 3.0);
        assert_eq!(num("var x = 4; x *= 2; x - 1;"), 7.0);
        assert_eq!(num("1 < 2 ? 10 : 20"), 10.0);
        assert_eq!(num("nil or 0 or 5"), 5.0);
        assert_eq!(num("0 and 5"), 0.0);
        assert_eq!(num("!nil + -(-3)"), 4.0);
        assert_eq!(num("`a`"), 97.0);
    }

    #[test]
    fn compile_errors_carry_position() {
        let rt = Runtime::new();
        let mut cx = rt.new_context();
        let err = cx.compile(b"x = 1;\nif (", "bad.nas", 1).unwrap_err();
        assert_eq!(err.file, "bad.nas");
        assert_eq!(err.line, 2);
        let err = cx.compile(b"a = ;\n", "bad.nas", 10).unwrap_err();
        assert_eq!(err.line, 10);
        let err = cx.compile(b"while (1) { break nope; }", "bad.nas", 1).unwrap_err();
        assert!(err.message.contains("nope"));
    }

    #[test]
    fn scalar_coercion() {
        assert_eq!(text(r#""10" ~ "20""#), "1020");
        assert_eq!(num(r#""10" - "4""#), 6.0);
        assert_eq!(text("1.5 ~ 2"), "1.52");
        assert_eq!(num(r#"size([1, 2] ~ [3])"#), 3.0);
        assert_eq!(num(r#"("0x10" == 16) + ("abc" == "abc")"#), 2.0);
        assert_eq!(error(r#""abc" * 2"#), "non-numeric string in numeric context");
        assert_eq!(error("nil + 1"), "nil used in numeric context");
        assert_eq!(error("if ([]) 1;"), "non-scalar used in boolean context");
    }

    #[test]
    fn closures_are_independent() {
        let src = "
            var counter = func { var n = 0; return func { n += 1; return n; } };
            var a = counter();
            var b = counter();
            a(); a(); b();
            [a(), b()]
        ";
        run(src, |_, r| assert_eq!(nums(&r.unwrap()), vec![3.0, 2.0]));
    }

    #[test]
    fn bound_functions_share_a_namespace() {
        let src = "
            var ns = { x: 5 };
            var get = bind(func { x }, ns);
            var set = bind(func { x = arg[0] }, ns);
            set(7);
            [get(), ns.x]
        ";
        run(src, |_, r| assert_eq!(nums(&r.unwrap()), vec![7.0, 7.0]));
    }

    #[test]
    fn methods_and_parents() {
        let src = r#"
            var Base = { greet: func { "hi " ~ me.name } };
            var obj = { parents: [Base], name: "bob" };
            obj.greet()
        "#;
        assert_eq!(text(src), "hi bob");
        assert_eq!(error("var a = {}; a.parents = [a]; a.y"), "no such member: y");
        assert_eq!(num("var h = {}; h.n = 1; h.n += 2; h.n"), 3.0);
    }

    #[test]
    fn labeled_break_leaves_both_loops() {
        let src = r#"
            var out = [];
            for (outer; var i = 0; i < 3; i += 1) {
                for (inner; var j = 0; j < 3; j += 1) {
                    append(out, i ~ ":" ~ j);
                    if (j == 0) break outer;
                }
            }
            append(out, "done");
            out
        "#;
        run(src, |_, r| {
            let items: Vec<String> = r
                .unwrap()
                .vec_items()
                .unwrap()
                .iter()
                .map(|v| v.to_str_lossy().unwrap())
                .collect();
            assert_eq!(items, vec!["0:0", "done"]);
        });
    }

    #[test]
    fn loops() {
        assert_eq!(num("var s = 0; foreach (x; [1, 2, 3]) s += x; s"), 6.0);
        assert_eq!(num("var s = 0; forindex (i; [5, 6, 7]) s += i; s"), 3.0);
        assert_eq!(num("var i = 0; while (i < 10) { i += 1; if (i == 4) break; } i"), 4.0);
        assert_eq!(
            num("var s = 0; for (var i = 0; i < 5; i += 1) { if (i == 2) continue; s += i; } s"),
            8.0
        );
        let src = "
            var n = 0;
            foreach (outer; a; [1, 2, 3])
                foreach (b; [1, 2, 3]) {
                    if (b == 2) continue outer;
                    n += 1;
                }
            n
        ";
        assert_eq!(num(src), 3.0);
    }

    #[test]
    fn arguments() {
        let src = "
            var f = func(a, b = 10, rest...) { a + b + size(rest) };
            [f(1), f(1, 2), f(1, 2, 3, 4), f(b: 5, a: 1)]
        ";
        run(src, |_, r| assert_eq!(nums(&r.unwrap()), vec![11.0, 3.0, 5.0, 6.0]));
        assert_eq!(num("var f = func { size(arg) }; f(1, 2, 3)"), 3.0);
        assert_eq!(num("var f = func(a = -1) { a }; f()"), -1.0);
        assert_eq!(
            error("var f = func(a, b) { a }; f(1)"),
            "too few function args (have 1 need 2)"
        );
        assert_eq!(error("var f = func(a) { a }; f(b: 1)"), "missing argument: a");
    }

    #[test]
    fn indexing_and_slices() {
        let src = r#"
            var v = [1, 2, 3, 4];
            v[-1] = 9;
            [size(v[1:2]), v[1:nil][0], v[3], "hello"[1], size("hello"[1:3])]
        "#;
        run(src, |_, r| assert_eq!(nums(&r.unwrap()), vec![2.0, 2.0, 9.0, 101.0, 3.0]));
        assert_eq!(text(r#"var s = substr("abc", 0); s[0] = `x`; s"#), "xbc");
        assert_eq!(num("var h = {}; h[1] = 2; h[1] += 1; h[1]"), 3.0);
        assert_eq!(error("[1][5]"), "vector index 5 out of bounds (size 1)");
    }

    #[test]
    fn non_finite_indices_and_bad_bytes() {
        assert_eq!(error("[1][0 / 0]"), "index nan is not a finite number");
        assert_eq!(error("var v = [1]; v[-1 / 0] = 2"), "index -inf is not a finite number");
        assert_eq!(error(r#""abc"[1 / 0]"#), "index inf is not a finite number");
        assert_eq!(error("[1, 2][0:0 / 0]"), "index nan is not a finite number");
        assert_eq!(
            error(r#"var s = substr("abc", 0); s[0] = 300"#),
            "byte value 300 out of range"
        );
        assert_eq!(
            error(r#"var s = substr("abc", 0); s[0] = -1"#),
            "byte value -1 out of range"
        );
        assert_eq!(error("chr(1e9)"), "chr: byte value 1000000000 out of range");
        assert_eq!(text(r#"var s = substr("abc", 0); s[-1] = 255; s[0:1]"#), "ab");
    }

    #[test]
    fn nested_compile_and_call() {
        assert_eq!(num(r#"var f = compile("1 + 2"); f()"#), 3.0);
        assert_eq!(num(r#"var y = 4; compile("y * 2")()"#), 8.0);
        let src = r#"
            var err = [];
            var r = call(func { die("oops") }, nil, nil, nil, err);
            [r == nil, err[0]]
        "#;
        run(src, |_, r| {
            let v = r.unwrap();
            assert_eq!(v.vec_get(0).and_then(|x| x.num()), Some(1.0));
            assert_eq!(v.vec_get(1).and_then(|x| x.to_str_lossy()), Some("oops".into()));
        });
        assert_eq!(error(r#"call(func { die("inner") })"#), "inner");
        assert_eq!(num("call(func(a, b) { a - b }, [5, 3])"), 2.0);
    }

    #[test]
    fn die_attaches_a_value() {
        run("die({ code: 3 })", |ctx, r| {
            let err = r.unwrap_err();
            assert!(err.value.is_hash());
            assert_eq!(ctx.die_value().hash_len(), Some(1));
            assert_eq!(err.location().map(|at| at.line), Some(1));
        });
    }

    fn collect_native(ctx: &mut Ctx<'_>, _me: Value, _args: &[Value]) -> RtResult {
        ctx.collect();
        Ok(Value::Nil)
    }

    #[test]
    fn values_under_construction_survive_collection() {
        let src = r#"
            var v = ["a" ~ "b", collect(), "c" ~ "d", { k: "e" ~ "f" }];
            collect();
            v[0] ~ v[2] ~ v[3].k
        "#;
        run_with(
            src,
            |ctx, ns| ctx.gen_lib(ns, &[("collect", collect_native)]).unwrap(),
            |ctx, r| {
                assert_eq!(r.unwrap().to_str_lossy().unwrap(), "abcdef");
                assert!(ctx.runtime().stats().collections >= 2);
            },
        );
    }

    fn fail_native(_ctx: &mut Ctx<'_>, _me: Value, _args: &[Value]) -> RtResult {
        Err(crate::error::RuntimeError::new("boom"))
    }

    #[test]
    fn resume_after_native_error() {
        let rt = Runtime::new();
        let mut cx = rt.new_context();
        let (code, ns) = cx.with(|ctx| {
            let ns = ctx.new_hash();
            ctx.gen_lib(&ns, &[("fail", fail_native)]).unwrap();
            let code = ctx.compile(b"var x = fail();\nx + 1", "resume.nas", 1).unwrap();
            (code, ns)
        });
        let err = cx.call(&code, &[], Value::Nil, ns).unwrap_err();
        assert_eq!(err.message, "boom");
        assert_eq!(cx.stack_depth(), 1);
        assert_eq!(cx.frame_line(0), Some(1));
        assert_eq!(cx.frame_file(0).as_deref(), Some("resume.nas"));
        let v = cx.continue_call(Value::Num(5.0)).unwrap();
        assert_eq!(v.num(), Some(6.0));
        assert_eq!(cx.stack_depth(), 0);
        assert!(cx.continue_call(Value::Nil).is_err());
    }

    fn nested_native(ctx: &mut Ctx<'_>, _me: Value, _args: &[Value]) -> RtResult {
        Ok(Value::Num(if ctx.is_sub_context() { 1.0 } else { 0.0 }))
    }

    #[test]
    fn natives_see_sub_contexts() {
        run_with(
            "[nested(), call(nested)]",
            |ctx, ns| ctx.gen_lib(ns, &[("nested", nested_native)]).unwrap(),
            |_, r| assert_eq!(nums(&r.unwrap()), vec![0.0, 1.0]),
        );
    }

    #[test]
    fn locals_from_a_literal_hash() {
        assert_eq!(num(r#"call(func { x + 1 }, nil, nil, {"x": 41})"#), 42.0);
        assert_eq!(num(r#"var h = {y: 2}; h["y"] + h.y"#), 4.0);
        assert_eq!(num(r#"var ns = {"z": 1}; call(func { z = 5 }, nil, nil, ns); ns.z"#), 5.0);
    }

    #[test]
    fn long_scripts_on_a_small_stack() {
        let n = on_small_stack(|| {
            let mut src = String::from("var n = 0;\n");
            for f in 0..20 {
                src.push_str(&format!("var f{} = func {{\n", f));
                for _ in 0..1000 {
                    src.push_str("n += 1;\n");
                }
                src.push_str("};\n");
            }
            for f in 0..20 {
                src.push_str(&format!("f{}();\n", f));
            }
            src.push('n');
            num(&src)
        });
        assert_eq!(n, 20_000.0);
    }

    #[test]
    fn oversized_units_are_compile_errors() {
        let err = on_small_stack(|| {
            let src: String = (0..20_000).map(|i| format!("x = {};\n", i)).collect();
            compile_error(&src)
        });
        assert_eq!(err.message, "function too large");
        assert_eq!(err.file, "big.nas");
        assert!((13_000..13_200).contains(&err.line), "line {}", err.line);

        // Default values fill the pool without emitting any code.
        let err = on_small_stack(|| {
            let mut src = String::from("f = func(\n");
            for i in 0..33_000 {
                src.push_str(&format!("a{} = {},\n", i, i));
            }
            src.push_str(") { nil };\n");
            compile_error(&src)
        });
        assert_eq!(err.message, "too many constants");
        assert!((32_000..33_000).contains(&err.line), "line {}", err.line);
    }

    #[test]
    fn deep_nesting_is_a_compile_error() {
        let parens = format!("{}1{}", "(".repeat(10_000), ")".repeat(10_000));
        let err = compile_error(&parens);
        assert_eq!(err.message, "expression too deeply nested");
        assert_eq!(err.line, 1);
        let nots = format!("x = {}1", "!".repeat(10_000));
        assert_eq!(compile_error(&nots).message, "expression too deeply nested");
        let sums = format!("x = 1{}", " + 1".repeat(5_000));
        assert_eq!(compile_error(&sums).message, "expression too deeply nested");
        assert_eq!(num(&format!("{}1{}", "(".repeat(40), ")".repeat(40))), 1.0);
        assert_eq!(num(&format!("0{}", " + 1".repeat(100))), 100.0);
    }
}
