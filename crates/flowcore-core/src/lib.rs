//! Expression/alias engine, validator, compiler, and executor for
//! declarative workflows.

pub mod collab;
pub mod compile;
pub mod exec;
pub mod expr;
pub mod template;
pub mod validate;
