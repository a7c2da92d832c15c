//! # nnef-parser
//!
//! Parser, type checker and flattener for NNEF graph descriptions.
//!
//! This crate handles the full front-end pipeline:
//
//   source text ──► Lexer ──► Tokens ──► Parser ──► typed AST ──► Evaluator ──► ParserCallback
//                                          │                         │
//                                          └ stdlib + fragments      └ lowering policy
//
// The parser type-checks while it builds the AST, so the evaluator only sees
// well-typed assignments. The evaluator flattens them into a sequence of
// primitive operations with resolved element types, inlining ("lowering")
// whichever compound fragments the options select.
//
// USAGE:
//   // Flatten a document into a graph:
//   let graph = nnef_parser::parse_graph(source_text, &ParseOptions::with_defaults())?;
//   println!("{}", graph.dump());
//
//   // Or receive the operations directly:
//   nnef_parser::parse_document(source_text, &options, &mut my_callback)?;

pub mod ast;
pub mod callback;
pub mod declarations;
pub mod driver;
pub mod error;
pub mod eval;
pub mod graph;
pub mod lexer;
pub mod options;
pub mod parser;
pub mod prototype;
pub mod stdlib;
pub mod token;
pub mod types;
pub mod validate;
pub mod value;

pub use callback::{ParserCallback, ShouldLower};
pub use driver::{parse_document, parse_graph};
pub use error::{Error, ErrorCategory, ErrorKind, Result};
pub use graph::{Graph, GraphBuilder, Operation, Tensor};
pub use options::{LoweringPolicy, ParseOptions};
pub use prototype::{Fragment, FragmentTable, Param, Prototype, ResultParam};
pub use token::Position;
pub use types::{Type, TypeInterner, TypeRef, Typename};
pub use value::Value;
