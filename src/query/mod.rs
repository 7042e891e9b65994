//! Query parsing and evaluation: string → AST → iterator tree.

mod ast;
mod builder;
mod parser;

pub use ast::{Ast, FULL_TEXT};
pub use builder::build;
pub use parser::{parse_query, ParsedQuery, QueryParser};
