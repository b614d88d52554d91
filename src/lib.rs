//! A compiler for a subset of C, emitting Intel-syntax x86-64 assembly for
//! the System V ABI.
//!
//! The pipeline runs strictly forward: lex → preprocess → parse → analyze →
//! fold → lower to a basic-block three-address IR → lower to x86-64 → emit
//! text. See `src/bin` for the executable driver using this library.

pub mod back;
pub mod common;
pub mod front;
pub mod middle;

pub use common::{CompileError, Result};

use front::lex::Lexer;
use front::pp;

/// Target macros imported by `-g`, mirroring the host compiler's predefines.
pub const PREDEFINED_MACROS: &[(&str, &str)] = &[
    ("__x86_64__", "1"),
    ("__linux__", "1"),
    ("__STDC__", "1"),
    ("__LP64__", "1"),
];

#[derive(Debug, Default, Clone)]
pub struct Options {
    /// `-E`: write the preprocessed token chain instead of assembly.
    pub preprocess_only: bool,
    /// `-g`: register [PREDEFINED_MACROS] before preprocessing.
    pub import_predefined: bool,
    /// `-D`: command-line macros, `NAME` or `NAME=VALUE`.
    pub defines: Vec<String>,
}

/// Build the input buffer: a synthetic `#define` prelude for `-g`/`-D`,
/// then the source, with a final newline guaranteed. Returns the buffer and
/// the prelude length (the `-E` writer skips the prelude).
pub fn build_input(source: &str, opts: &Options) -> (String, usize) {
    let mut buffer = String::new();
    if opts.import_predefined {
        for (name, value) in PREDEFINED_MACROS {
            buffer.push_str(&format!("#define {name} {value}\n"));
        }
    }
    for define in &opts.defines {
        let (name, value) = define
            .split_once('=')
            .unwrap_or((define.as_str(), "1"));
        buffer.push_str(&format!("#define {name} {value}\n"));
    }
    let prelude_len = buffer.len();
    buffer.push_str(source);
    if !buffer.ends_with('\n') {
        buffer.push('\n');
    }
    (buffer, prelude_len)
}

/// Run the pipeline over a buffer produced by [build_input]. Returns the
/// assembly listing, or the reconstructed source when `-E` is set.
pub fn compile(buffer: &str, prelude_len: usize, opts: &Options) -> Result<String> {
    let mut ts = Lexer::new(buffer, true).tokenize()?;
    pp::preprocess(&mut ts)?;
    if opts.preprocess_only {
        return Ok(pp::write_preprocessed(&ts, prelude_len));
    }
    ts.fix_head();
    let mut prog = front::parse(&ts)?;
    front::analyze(&mut prog, &ts)?;
    front::fold(&mut prog);
    let ir = middle::lower(&prog, &ts)?;
    let asm = back::codegen(ir);
    Ok(back::emit(&asm))
}
