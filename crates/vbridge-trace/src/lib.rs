//! Error-trace model and the two halves of trace matching: conversion of a
//! raw trace into a canonical sequence, and comparison of two canonical
//! sequences into a similarity score.

mod compare;
mod convert;
mod model;

pub use compare::{is_match, similarity, validate_threshold, ComparisonFunction};
pub use convert::{convert, convert_raw, ConversionFunction, ConvertedTrace};
pub use model::{ErrorTrace, Note, NoteKind, StatementKind, TraceNode};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TraceError {
    #[error("malformed_trace: {0}")]
    Malformed(String),
    #[error("unsupported_trace_format: {0}")]
    UnsupportedFormat(u64),
    #[error("unknown_function: index {0} is out of range")]
    UnknownFunction(usize),
    #[error("unknown_conversion_function: {0}")]
    UnknownConversion(u8),
    #[error("unknown_comparison_function: {0}")]
    UnknownComparison(u8),
    #[error("invalid_threshold: {0}")]
    InvalidThreshold(String),
}
