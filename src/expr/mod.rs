//! Expression sublanguage for Trellis templates
//!
//! This module implements the `${...}` expression language used throughout a
//! GraphDefinition: in resource templates, `readyWhen`/`includeWhen`
//! predicates, status field projections, and validation rules.
//!
//! # Grammar
//!
//! - Literals: `null`, booleans, integers, floats, single/double quoted strings
//! - Paths: `schema.spec.name`, `config.data['db-host']`, `items[0]`
//! - Optional chain: `db.status.?ready` - null instead of an error when an
//!   intermediate segment is absent
//! - Null coalesce: `a.?b ?? 'fallback'`
//! - Ternary: `cond ? a : b`
//! - Boolean (`&& || !`), arithmetic (`+ - * / %`), comparison operators
//! - List predicates: `pods.all(p, p.ready)`, `exists`, `exists_one`,
//!   `filter`, `map`
//! - Built-ins: `size(x)`, `string(x)`, `int(x)`, `float(x)`, `bool(x)`
//!
//! # Namespaces
//!
//! The [`Environment`] resolves three root namespaces: `schema` (the
//! instance's spec and metadata), node-id bindings (the live objects of
//! already-resolved nodes), and constants.

mod env;
mod error;
mod eval;
mod lexer;
mod parser;
mod template;
mod value;

pub use env::Environment;
pub use error::ExprError;
pub use eval::evaluate;
pub use parser::{BinaryOp, Expr, MacroName, UnaryOp};
pub use template::{
    document_references, has_expressions, parse_standalone, render_document, render_string, scan,
    Part,
};
pub use value::Value;
