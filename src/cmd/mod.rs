//! Command-line entry points.

pub mod engine;
pub mod ocr;
pub mod schema;
pub mod text;
