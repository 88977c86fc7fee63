//! Wire-level body parsing for webspark_rust.
//!
//! This crate provides the streaming `multipart/form-data` parser the
//! request layer hands uploaded bodies to. The parser consumes any
//! `std::io::Read` stream in fixed-size chunks, keeps only a bounded scan
//! window in memory, and spools file payloads to temporary files that are
//! deleted again on cleanup.
//!
//! # Features
//!
//! - Bounded-memory scanning regardless of payload size
//! - CRLF and bare-LF delimited bodies
//! - Scalar-then-list promotion for repeated field names
//! - Deterministic temp-file cleanup on every exit path
//!
//! # Example
//!
//! ```ignore
//! use webspark_http::{MultipartConfig, MultipartParser};
//!
//! let parser = MultipartParser::new(stream, content_type, content_length,
//!     MultipartConfig::default())?;
//! let total = parser.parse_with(|forms, files| forms.len() + files.len())?;
//! ```

#![deny(unsafe_code)]

pub mod multipart;

pub use multipart::{
    Charset, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_BODY_SIZE, DecodePolicy, Delimiter, FileFields,
    FormFields, MultiValue, MultipartConfig, MultipartError, MultipartParser, UploadFile,
    parse_boundary, parse_charset,
};
