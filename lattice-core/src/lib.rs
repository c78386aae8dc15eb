//! Middle-end of the lattice simulation language.
//!
//! The frontend hands this crate a typed IR function over sets, fields, and
//! tensor index expressions; [`lower`] rewrites it into explicit loops,
//! scalar arithmetic, and offset-computed loads and stores for a code
//! generator. See the `lower` module for the pass ordering.

pub mod error;
pub mod flatten;
pub mod gpu;
pub mod ir;
pub mod ir_printer;
pub mod lower;
pub mod lower_accesses;
pub mod lower_indexexprs;
pub mod lower_maps;
pub mod storage;
pub mod temps;
pub mod types;
pub mod visitor;


pub use error::{CompilerError, Diagnostic, DiagnosticSink, Result, Severity};
pub use lower::{lower, Backend, PipelineConfig};
