//! Utility modules

pub mod error;

pub use error::{
    ConvertError, ErrorResponse, RecorderError, RecorderResult, SourceError, SourceResult,
    WriterError, WriterResult,
};
