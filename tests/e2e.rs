//! Pipeline-level scenarios: whole programs through the library entry
//! points, checking the shape of the emitted assembly and the preprocessor
//! round trips.

use minic::{build_input, compile, Options};

fn asm(src: &str) -> String {
    let opts = Options::default();
    let (buffer, prelude_len) = build_input(src, &opts);
    compile(&buffer, prelude_len, &opts).expect("program should compile")
}

fn preprocessed(src: &str, defines: &[&str]) -> String {
    let opts = Options {
        preprocess_only: true,
        defines: defines.iter().map(|d| d.to_string()).collect(),
        ..Options::default()
    };
    let (buffer, prelude_len) = build_input(src, &opts);
    compile(&buffer, prelude_len, &opts).expect("program should preprocess")
}

fn diagnostic(src: &str) -> minic::CompileError {
    let opts = Options::default();
    let (buffer, prelude_len) = build_input(src, &opts);
    compile(&buffer, prelude_len, &opts).expect_err("program should be rejected")
}

#[test]
fn the_trivial_program_compiles() {
    let out = asm("int main(){return 0;}");
    assert!(out.starts_with(".intel_syntax noprefix\n"));
    assert!(out.contains(".global main"));
    assert!(out.contains("main:"));
    assert!(out.contains("  leave\n  ret\n"));
}

#[test]
fn locals_and_arithmetic_compile() {
    let out = asm("int main(){int a=2;int b=3;return a*b+4;}");
    assert!(out.contains("imul"));
    assert!(out.contains("[rbp-"));
}

#[test]
fn recursion_compiles_with_calls_both_ways() {
    let out = asm(
        "int fib(int n){if(n<2)return n; return fib(n-1)+fib(n-2);} \
         int main(){return fib(10);}",
    );
    assert!(out.contains(".global fib"));
    assert!(out.matches("call fib").count() >= 3);
    assert!(out.contains("setl"));
}

#[test]
fn arrays_and_pointer_arithmetic_compile() {
    let out = asm("int main(){int a[3]; a[0]=1; a[1]=2; a[2]=3; int *p=a; return *(p+1)+*(p+2);}");
    // pointer indices are scaled by the element size at analysis time and
    // folded into plain constants
    assert!(out.contains("DWORD PTR"));
    assert!(out.contains("lea"));
}

#[test]
fn for_loops_compile_with_their_labels() {
    let out = asm("int main(){int x=0; for(int i=0;i<5;i=i+1) x=x+i; return x;}");
    assert!(out.contains(".Lbeginfor_0_main:"));
    assert!(out.contains(".Lendfor_0_main:"));
    assert!(out.contains("jmp .Lbeginfor_0_main"));
}

#[test]
fn globals_compile_into_the_data_section() {
    let out = asm("int g; int main(){g=7; return g;}");
    let data = out.find(".data").unwrap();
    let text = out.find(".text").unwrap();
    assert!(out[data..text].contains("g:"));
    assert!(out[data..text].contains(".zero 4"));
    assert!(out[text..].contains("[rip+g]"));
}

#[test]
fn object_macros_reach_the_compiled_code() {
    let out = asm("#define N 42\nint main(){return N;}");
    assert!(out.contains("mov r10, 42"));
}

#[test]
fn ifdef_selects_the_branch_by_command_line_define() {
    let src = "#ifdef X\nint main(){return 1;}\n#else\nint main(){return 2;}\n#endif\n";
    let with = preprocessed(src, &["X"]);
    assert!(with.contains("return 1"));
    assert!(!with.contains("return 2"));
    let without = preprocessed(src, &[]);
    assert!(without.contains("return 2"));
    assert!(!without.contains("return 1"));
}

#[test]
fn preprocessing_without_directives_is_the_identity() {
    let src = "int main() {\n  /* answer */ return 42; // here\n}\n";
    assert_eq!(preprocessed(src, &[]), src);
}

#[test]
fn a_missing_final_newline_is_appended() {
    assert_eq!(preprocessed("int x;", &[]), "int x;\n");
}

#[test]
fn predefined_macros_come_in_with_dash_g() {
    let src = "#ifdef __x86_64__\nint main(){return 1;}\n#endif\n";
    let opts = Options {
        preprocess_only: true,
        import_predefined: true,
        ..Options::default()
    };
    let (buffer, prelude_len) = build_input(src, &opts);
    let out = compile(&buffer, prelude_len, &opts).unwrap();
    assert!(out.contains("return 1"));
}

#[test]
fn diagnostics_carry_the_caret_excerpt() {
    let err = diagnostic("int main() {\n  return oops;\n}\n");
    assert_eq!(err.msg, "undeclared identifier");
    let opts = Options::default();
    let (buffer, _) = build_input("int main() {\n  return oops;\n}\n", &opts);
    let rendered = err.render(&buffer);
    assert!(rendered.contains("  return oops;"));
    assert!(rendered.contains("^ undeclared identifier"));
}

#[test]
fn the_error_directive_stops_compilation() {
    let err = diagnostic("#error out of cheese\nint main(){return 0;}\n");
    assert_eq!(err.msg, "#error: out of cheese");
}

#[test]
fn structs_switches_and_gotos_compile_together() {
    let out = asm(
        "struct point { int x; int y; };\n\
         int classify(int k) {\n\
           switch (k) {\n\
             case 0: return 10;\n\
             case 1: goto out;\n\
             default: return 30;\n\
           }\n\
           out: return 20;\n\
         }\n\
         int main() {\n\
           struct point p;\n\
           p.x = 1;\n\
           p.y = classify(p.x);\n\
           return p.y;\n\
         }",
    );
    assert!(out.contains(".Lswitch_0_classify_0:"));
    assert!(out.contains(".Lendswitch_0_classify:"));
    assert!(out.contains(".Lgoto_out_classify:"));
    assert!(out.contains("call classify"));
}

#[test]
fn do_while_and_ternary_compile() {
    let out = asm(
        "int main() { int i = 0; do { i = i + 1; } while (i < 3); return i == 3 ? 0 : 1; }",
    );
    assert!(out.contains(".Lbegindo_0_main:"));
    assert!(out.contains(".Lenddo_0_main:"));
    assert!(out.contains("sete"));
}

#[test]
fn string_literals_and_char_pointers_compile() {
    let out = asm("char *msg = \"hello\"; int main() { char *p; p = msg; return 0; }");
    assert!(out.contains(".string \"hello\""));
    assert!(out.contains(".quad .LC0"));
}

#[test]
fn typedefs_and_enums_compile() {
    let out = asm(
        "typedef long word; enum { OK = 0, FAIL = 1 };\n\
         int main() { word w; w = OK; return (int)w; }",
    );
    assert!(out.contains(".global main"));
}

#[test]
fn constant_folding_reaches_the_listing() {
    let out = asm("int main() { return 6 * 7; }");
    assert!(out.contains("mov r10, 42"), "expected the folded 42:\n{out}");
}

#[test]
fn sizeof_is_resolved_at_compile_time() {
    let out = asm("int main() { int a[4]; return sizeof a; }");
    assert!(out.contains("mov r10, 16"));
}
