// crates/core/src/error.rs
use thiserror::Error;

/// Errors produced while decoding an analyzer report.
///
/// These are structural only: missing sections or sparse data never fail,
/// they just leave the corresponding parts of the result empty.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("analyzer report is empty")]
    EmptyInput,
}
