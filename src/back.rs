//! The back-end of the compiler.

pub mod codegen;
pub mod emit;
pub mod x64;

pub use codegen::codegen;
pub use emit::emit;
