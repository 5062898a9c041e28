//! Metadata resolution, generic inflation, class layout and a bytecode
//! interpreter for a managed execution runtime (spec.md's C1-C10 module
//! split): a metadata cache and class loader on top of `cil-image`'s raw
//! tables, a two-pass IL lowering pipeline, and the interpreter that runs
//! the result.

pub mod cache;
pub mod class;
pub mod config;
pub mod error;
pub mod generic;
pub mod il;
pub mod interp;
pub mod object;
