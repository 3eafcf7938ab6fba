//! Configuration data model.
//!
//! The configuration language's lexer and parser live outside this crate;
//! they yield a well-formed [`SourceFile`] of [`Block`]s whose attribute
//! values are [`Expr`] trees. Expression evaluation produces dynamic
//! [`Value`]s which the loader binds onto each component's argument schema.

pub mod ast;
pub mod value;

pub use ast::{Attribute, Block, Expr, RefPath, SourceFile, Span};
pub use value::Value;
