//! Core of the kaleido toolchain.
//!
//! kaleido is a small expression language whose only value type is a
//! 64-bit float. The pipeline is:
//!
//!   source .kal
//!     -> lexer   (token stream)
//!     -> parser  (functions, prototypes, expressions)
//!     -> lower   (backend operations through the `Backend` trait)
//!     -> codegen_wasm (block IR, wasm-encoder, executed on wasmi)
//!
//! The `driver` runs this per top-level unit, interactively or over a
//! whole source text. Higher-level tools should depend on this crate
//! rather than reimplementing the pipeline.

// ---------------------------------------------------------------------
// Error handling and diagnostics
// ---------------------------------------------------------------------

pub mod span;
pub mod error;

// ---------------------------------------------------------------------
// Front-end: lexing and parsing
// ---------------------------------------------------------------------

pub mod lexer;
pub mod parser;
pub mod ast;

// ---------------------------------------------------------------------
// Lowering and the backend interface
// ---------------------------------------------------------------------

pub mod backend;
pub mod lower;

// ---------------------------------------------------------------------
// Builtins and prelude integration
// ---------------------------------------------------------------------

pub mod builtins;
pub mod prelude;

// ---------------------------------------------------------------------
// Back-end: wasm code generation, unit driver and compiler orchestration
// ---------------------------------------------------------------------

pub mod ir;
pub mod codegen_wasm;
pub mod driver;
pub mod compiler;

// ---------------------------------------------------------------------
// Public API re-exports
// ---------------------------------------------------------------------

pub use backend::{Backend, BackendError};
pub use codegen_wasm::WasmBackend;
pub use compiler::{CompilationArtifact, CompileOptions, compile_wasm, preload};
pub use driver::{Driver, DriverOptions, UnitOutcome};
pub use error::CoreError;
pub use lower::Session;
