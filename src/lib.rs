//! wireup: declarative, concurrent component assembly.
//!
//! A [`document::Document`] names module instances by
//! `<type-category>.<instance>` and wires them together with `!REF:` and
//! `!CONST:` markers. [`assembly::Assembler`] builds every instance
//! concurrently, in whatever order the references allow, and
//! [`assembly::runner::run`] starts the runnable ones.

pub mod assembly;
pub mod config;
pub mod document;
pub mod error;
pub mod logger;
pub mod stock;

pub use assembly::{Assembler, Assembly, Instance, Module, Registry};
pub use document::Document;
pub use error::{AppError, AssembleError, RunError};
