//! # Nibble: Template-Driven Text Extraction
//!
//! Nibble turns semi-structured plain text (receipts, invoices, fixed-format
//! logs) into a structured tree of objects, arrays, and scalars, guided by a
//! textual template that declares field placeholders, types, and
//! transformations.
//!
//! ## Features
//!
//! - **Placeholder templates**: `{Path:type:format}` spans mark the fields to
//!   extract; literal text between them matches input case-insensitively
//! - **Array rows**: a line whose placeholders all target one repeating array
//!   (`{Items[].Rate:number}`) consumes as many input rows as match
//! - **Pipelines**: chain transformations left to right,
//!   `{Name:word | upper() | prefix('X-')}`
//! - **Aggregate expressions**: `sum(Items[].Total)`, `count(Items[])`,
//!   `coalesce(A, B)` evaluated against the completed tree in a final pass
//! - **Forgiving by design**: non-matching lines, missing tokens, and
//!   unparsable values degrade to best-effort fallbacks, never errors
//!
//! ## Example
//!
//! ```
//! use nibble::Template;
//!
//! let template = Template::compile(
//!     "Invoice No: {InvoiceNumber}\n\
//!      Item Rate Qty Total\n\
//!      {Items[].ItemName:word} {Items[].Rate:number} {Items[].Quantity:integer} {Items[].Total:number}",
//! ).expect("template compiles");
//!
//! let tree = template.extract(
//!     "Invoice No: INV-1001\n\
//!      Item Rate Qty Total\n\
//!      Item1 34 4 136\n\
//!      Item2 55 2 110",
//! );
//!
//! assert_eq!(tree["InvoiceNumber"], "INV-1001");
//! assert_eq!(tree["Items"][1]["Total"], 110);
//! ```
//!
//! The output is a `serde_json::Value` (object keys in insertion order), so
//! rendering to JSON or any other representation is left to the caller.

// Core modules
pub mod coerce;
pub mod expr;
pub mod extract;
pub mod template;
pub mod tree;

// Re-export key types
pub use coerce::coerce;
pub use expr::{evaluate_pipeline, value_at, Pipeline, PipeStep, Term};
pub use template::{LineTemplate, Placeholder, Template, TemplateError};
pub use tree::{set_value, split_path, PathSegment};
