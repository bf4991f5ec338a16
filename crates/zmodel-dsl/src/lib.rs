//! zmodel schema DSL
//!
//! This crate defines the typed AST for `.zmodel` documents (data sources,
//! plugins, enums, models, functions and attribute declarations), a parser
//! front end producing that AST, and a printer that regenerates canonical
//! source text from it.
//!
//! Semantic validation lives in `zmodel-check`; this crate only knows about
//! syntax.

pub mod ast;
pub mod parser;
pub mod printer;

pub use parser::{parse_document, parse_expression, ParseError};
pub use printer::{print_document, print_expression};
