//! The compiler driver: reads one translation unit, writes one assembly
//! listing (or the preprocessed source with `-E`). Exit code 0 on success,
//! 1 on any diagnostic.
//!
//! Run with `--help` for more info.

use std::process::exit;

use clap::Parser;

use minic::{build_input, compile, Options};

#[derive(Debug, Parser)]
#[command(version, about = "A compiler for a subset of C targeting x86-64 System V", long_about = None)]
struct Args {
    /// path to the input source file
    #[arg(short = 'i', value_name = "FILE", conflicts_with = "text")]
    input: Option<String>,
    /// use the remaining arguments as the input program
    #[arg(
        short = 'I',
        value_name = "TEXT",
        num_args = 1..,
        allow_hyphen_values = true,
        trailing_var_arg = true
    )]
    text: Option<Vec<String>>,
    /// path for the output file
    #[arg(short = 'o', value_name = "FILE")]
    output: String,
    /// emit preprocessed source instead of assembly
    #[arg(short = 'E')]
    preprocess: bool,
    /// import the target's predefined macros before preprocessing
    #[arg(short = 'g', requires = "preprocess")]
    predefined: bool,
    /// define an object-like macro (NAME or NAME=VALUE)
    #[arg(short = 'D', value_name = "NAME[=VALUE]")]
    defines: Vec<String>,
}

fn main() {
    // debug traces are informational and go to stdout; diagnostics own stderr
    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Stdout)
        .init();
    let args = Args::parse();

    let source = match (&args.input, &args.text) {
        (Some(path), None) => match std::fs::read_to_string(path) {
            Ok(source) => source,
            Err(err) => {
                eprintln!("cannot read '{path}': {err}");
                exit(1);
            }
        },
        (None, Some(words)) => words.join(" "),
        _ => {
            eprintln!("exactly one of -i and -I is required");
            exit(1);
        }
    };

    let opts = Options {
        preprocess_only: args.preprocess,
        import_predefined: args.predefined,
        defines: args.defines,
    };
    let (buffer, prelude_len) = build_input(&source, &opts);

    match compile(&buffer, prelude_len, &opts) {
        Ok(output) => {
            if let Err(err) = std::fs::write(&args.output, output) {
                eprintln!("cannot write '{}': {err}", args.output);
                exit(1);
            }
        }
        Err(diag) => {
            eprint!("{}", diag.render(&buffer));
            exit(1);
        }
    }
}
