//! Multipart form data parser.
//!
//! Provides streaming parsing of `multipart/form-data` request bodies into
//! form fields and file uploads. The parser reads the body in fixed-size
//! chunks and keeps only a bounded window of it in memory: file payloads are
//! spooled to temporary files as soon as they are confirmed not to contain
//! the next boundary, so multi-gigabyte uploads never accumulate in RAM.
//!
//! # Usage
//!
//! ```ignore
//! use webspark_http::{MultipartConfig, MultipartParser};
//!
//! let mut parser = MultipartParser::new(stream, content_type, content_length,
//!     MultipartConfig::default())?;
//! let (forms, files) = parser.parse()?;
//!
//! let username = forms.get("username").and_then(|v| v.first());
//! if let Some(upload) = files.get("avatar").and_then(|v| v.first()) {
//!     // upload.file() is rewound to offset 0 and readable until cleanup
//!     // deletes the backing temp file.
//! }
//! parser.cleanup();
//! ```
//!
//! A parser instance serves exactly one request body. Cleanup runs on every
//! exit path: [`MultipartParser::parse`] invokes it before propagating an
//! error, [`MultipartParser::parse_with`] invokes it after the caller's
//! closure returns, and `Drop` is the best-effort backstop.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use memchr::memmem;
use tracing::trace;
use webspark_core::HttpError;

/// Default maximum request body size (2MB).
pub const DEFAULT_MAX_BODY_SIZE: usize = 2 * 1024 * 1024;

/// Default read granularity (4KB).
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// RFC 2046 recommends multipart boundary length <= 70 characters.
const MAX_BOUNDARY_LEN: usize = 70;

/// Content type assumed for parts that carry no `Content-Type` header.
const DEFAULT_PART_CONTENT_TYPE: &str = "text/plain";

/// Line delimiter used within a multipart stream.
///
/// Detected once from the first occurrence of the boundary and trusted for
/// the remainder of the stream; a body that switches delimiters mid-stream
/// is not supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delimiter {
    /// `\r\n`
    Crlf,
    /// `\n`
    Lf,
}

impl Delimiter {
    /// The delimiter's byte payload.
    #[must_use]
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Self::Crlf => b"\r\n",
            Self::Lf => b"\n",
        }
    }
}

/// Character set used to decode form field values and part headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Charset {
    /// UTF-8 (the default).
    #[default]
    Utf8,
    /// ISO-8859-1 / Latin-1. Decoding is total.
    Latin1,
}

impl Charset {
    /// Resolve a `charset=` label from a `Content-Type` header.
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        match label.to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Some(Self::Utf8),
            "latin-1" | "latin1" | "iso-8859-1" => Some(Self::Latin1),
            _ => None,
        }
    }

    /// Decode `bytes` under the given error policy.
    ///
    /// Returns `None` only for [`DecodePolicy::Strict`] on invalid input.
    fn decode(self, bytes: &[u8], policy: DecodePolicy) -> Option<String> {
        match self {
            Self::Utf8 => match policy {
                DecodePolicy::Strict => std::str::from_utf8(bytes).ok().map(str::to_owned),
                DecodePolicy::Replace => Some(String::from_utf8_lossy(bytes).into_owned()),
                DecodePolicy::Ignore => Some(decode_utf8_ignore(bytes)),
            },
            Self::Latin1 => Some(bytes.iter().map(|&b| char::from(b)).collect()),
        }
    }
}

/// Policy for handling undecodable bytes in form field values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodePolicy {
    /// Fail the parse on invalid input (the default).
    #[default]
    Strict,
    /// Drop invalid sequences.
    Ignore,
    /// Substitute U+FFFD for invalid sequences.
    Replace,
}

fn decode_utf8_ignore(mut bytes: &[u8]) -> String {
    let mut out = String::new();
    loop {
        match std::str::from_utf8(bytes) {
            Ok(valid) => {
                out.push_str(valid);
                return out;
            }
            Err(err) => {
                let valid_up_to = err.valid_up_to();
                if let Ok(valid) = std::str::from_utf8(&bytes[..valid_up_to]) {
                    out.push_str(valid);
                }
                let skip = err.error_len().unwrap_or(bytes.len() - valid_up_to);
                bytes = &bytes[valid_up_to + skip..];
                if bytes.is_empty() {
                    return out;
                }
            }
        }
    }
}

/// Configuration for multipart parsing.
#[derive(Debug, Clone)]
pub struct MultipartConfig {
    /// Maximum request body size in bytes.
    max_body_size: usize,
    /// Read granularity in bytes.
    chunk_size: usize,
    /// Text charset for form field values (overridable by `charset=` in the
    /// request `Content-Type`).
    charset: Charset,
    /// Handling of undecodable field bytes.
    decode_policy: DecodePolicy,
}

impl Default for MultipartConfig {
    fn default() -> Self {
        Self {
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            charset: Charset::Utf8,
            decode_policy: DecodePolicy::Strict,
        }
    }
}

impl MultipartConfig {
    /// Create a new configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum request body size.
    #[must_use]
    pub fn max_body_size(mut self, size: usize) -> Self {
        self.max_body_size = size;
        self
    }

    /// Set the read granularity.
    #[must_use]
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    /// Set the text charset for form field values.
    #[must_use]
    pub fn charset(mut self, charset: Charset) -> Self {
        self.charset = charset;
        self
    }

    /// Set the handling of undecodable field bytes.
    #[must_use]
    pub fn decode_policy(mut self, policy: DecodePolicy) -> Self {
        self.decode_policy = policy;
        self
    }

    /// Get the maximum request body size.
    #[must_use]
    pub fn get_max_body_size(&self) -> usize {
        self.max_body_size
    }

    /// Get the read granularity.
    #[must_use]
    pub fn get_chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Get the text charset.
    #[must_use]
    pub fn get_charset(&self) -> Charset {
        self.charset
    }

    /// Get the decode policy.
    #[must_use]
    pub fn get_decode_policy(&self) -> DecodePolicy {
        self.decode_policy
    }
}

/// Errors that can occur during multipart parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultipartError {
    /// No `boundary` parameter in the Content-Type header.
    MissingBoundary,
    /// Boundary parameter present but unusable.
    InvalidBoundary,
    /// Unknown `charset` parameter in the Content-Type header.
    UnsupportedCharset { label: String },
    /// Declared Content-Length exceeds the configured limit.
    ContentLengthTooLarge { length: usize, max: usize },
    /// More bytes arrived than the configured limit allows.
    BodyTooLarge,
    /// Neither CRLF nor LF follows the first boundary occurrence.
    UndetectableDelimiter,
    /// No boundary found in the first chunk.
    BoundaryNotFound,
    /// Declared length exhausted while scanning part headers.
    MalformedPartHeaders,
    /// Stream ended before a part's header terminator.
    HeaderTerminatorNotFound,
    /// A part carried no Content-Disposition header.
    MissingContentDisposition,
    /// Content-Disposition present but unusable.
    InvalidContentDisposition { detail: String },
    /// Part header bytes could not be decoded.
    InvalidPartHeaders { detail: String },
    /// Declared length exhausted while scanning for a part's closing boundary.
    ClosingBoundaryNotFound,
    /// Stream ended before a part's closing boundary.
    PartBodyTerminatorNotFound,
    /// A form field's bytes were invalid under the strict decode policy.
    InvalidFieldEncoding { name: String },
    /// I/O error while spooling part data.
    Io { detail: String },
}

impl MultipartError {
    /// The HTTP status code this error maps to.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::ContentLengthTooLarge { .. } | Self::BodyTooLarge => 413,
            Self::Io { .. } => 500,
            _ => 400,
        }
    }
}

impl std::fmt::Display for MultipartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingBoundary => write!(f, "Missing boundary in Content-Type header"),
            Self::InvalidBoundary => write!(f, "invalid multipart boundary"),
            Self::UnsupportedCharset { label } => {
                write!(f, "unsupported charset in Content-Type header: {label}")
            }
            Self::ContentLengthTooLarge { length, max } => {
                write!(f, "Content-Length {length} exceeds max body size of {max}.")
            }
            Self::BodyTooLarge => write!(f, "Request entity too large"),
            Self::UndetectableDelimiter => {
                write!(
                    f,
                    "Invalid multipart/form-data: Unable to determine line delimiter."
                )
            }
            Self::BoundaryNotFound => {
                write!(f, "Invalid multipart/form-data: boundary not found")
            }
            Self::MalformedPartHeaders => {
                write!(f, "Invalid multipart/form-data: malformed part headers")
            }
            Self::HeaderTerminatorNotFound => {
                write!(
                    f,
                    "Invalid multipart/form-data: part header terminator not found"
                )
            }
            Self::MissingContentDisposition => {
                write!(f, "Missing Content-Disposition header.")
            }
            Self::InvalidContentDisposition { detail } => {
                write!(f, "invalid Content-Disposition: {detail}")
            }
            Self::InvalidPartHeaders { detail } => write!(f, "invalid part headers: {detail}"),
            Self::ClosingBoundaryNotFound => {
                write!(f, "Invalid multipart/form-data: closing boundary not found.")
            }
            Self::PartBodyTerminatorNotFound => {
                write!(
                    f,
                    "Invalid multipart/form-data: part body terminator not found."
                )
            }
            Self::InvalidFieldEncoding { name } => {
                write!(f, "invalid text encoding in form field \"{name}\"")
            }
            Self::Io { detail } => write!(f, "multipart I/O error: {detail}"),
        }
    }
}

impl std::error::Error for MultipartError {}

impl From<MultipartError> for HttpError {
    fn from(err: MultipartError) -> Self {
        let status = err.status_code();
        Self::new(err.to_string(), status)
    }
}

/// One value or an ordered list of values under a single field name.
///
/// Mirrors the forms/files contract: the first occurrence of a name stores a
/// scalar; a recurrence promotes it to a list, preserving stream order.
#[derive(Debug, PartialEq, Eq)]
pub enum MultiValue<T> {
    /// The name occurred once.
    Single(T),
    /// The name occurred more than once; entries are in stream order.
    Many(Vec<T>),
}

impl<T> MultiValue<T> {
    /// Append a value, promoting `Single` to `Many` on the second occurrence.
    pub fn push(&mut self, value: T) {
        let current = std::mem::replace(self, Self::Many(Vec::new()));
        *self = match current {
            Self::Single(existing) => Self::Many(vec![existing, value]),
            Self::Many(mut items) => {
                items.push(value);
                Self::Many(items)
            }
        };
    }

    /// The first value in stream order.
    #[must_use]
    pub fn first(&self) -> Option<&T> {
        match self {
            Self::Single(value) => Some(value),
            Self::Many(items) => items.first(),
        }
    }

    /// All values in stream order.
    #[must_use]
    pub fn all(&self) -> &[T] {
        match self {
            Self::Single(value) => std::slice::from_ref(value),
            Self::Many(items) => items,
        }
    }

    /// Number of values.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Many(items) => items.len(),
        }
    }

    /// Returns true if there are no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over all values in stream order.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.all().iter()
    }
}

/// Parsed form fields: name to decoded value(s).
pub type FormFields = HashMap<String, MultiValue<String>>;

/// Parsed file uploads: name to upload record(s).
pub type FileFields = HashMap<String, MultiValue<UploadFile>>;

/// An uploaded file spooled to a temporary file.
///
/// The handle is rewound to offset 0 when the part completes. The backing
/// file is deleted by the parser's cleanup, so callers must read the content
/// before cleanup runs (or before the parser is dropped).
#[derive(Debug)]
pub struct UploadFile {
    /// The original filename from Content-Disposition.
    pub filename: String,
    /// Content-Type of the part (`text/plain` when the part had none).
    pub content_type: String,
    file: File,
    path: PathBuf,
}

impl UploadFile {
    /// The open spool file handle.
    #[must_use]
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Mutable access to the spool file handle, for reading or seeking.
    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// Path of the backing temporary file.
    #[must_use]
    pub fn spool_path(&self) -> &Path {
        &self.path
    }

    /// Read the remaining content from the current cursor position.
    pub fn read_bytes(&mut self) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::new();
        self.file.read_to_end(&mut out)?;
        Ok(out)
    }

    /// Consume the record, keeping only the open handle.
    #[must_use]
    pub fn into_file(self) -> File {
        self.file
    }
}

/// Headers of one boundary-delimited part.
#[derive(Debug)]
struct PartHeaders {
    name: String,
    filename: Option<String>,
    content_type: String,
}

/// Destination for a part's body bytes while it is being scanned.
#[derive(Debug)]
enum PartSink {
    Field {
        name: String,
        content: Vec<u8>,
    },
    File {
        name: String,
        filename: String,
        content_type: String,
        file: File,
        path: PathBuf,
    },
}

impl PartSink {
    fn write(&mut self, bytes: &[u8]) -> Result<(), MultipartError> {
        if bytes.is_empty() {
            return Ok(());
        }
        match self {
            Self::Field { content, .. } => content.extend_from_slice(bytes),
            Self::File { file, .. } => {
                file.write_all(bytes).map_err(|e| MultipartError::Io {
                    detail: format!("failed to write spool file: {e}"),
                })?;
            }
        }
        Ok(())
    }
}

/// Paths of all spool files opened during one parse.
///
/// Every path is registered before any bytes are written to it, so cleanup
/// can never leak a file created mid-part.
#[derive(Debug, Default)]
struct TempFileRegistry {
    paths: Vec<PathBuf>,
}

impl TempFileRegistry {
    fn register(&mut self, path: PathBuf) {
        self.paths.push(path);
    }

    fn remove_all(&mut self) {
        for path in self.paths.drain(..) {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    trace!(path = %path.display(), error = %err, "failed to remove spool file");
                }
            }
        }
    }
}

static SPOOL_COUNTER: AtomicU64 = AtomicU64::new(1);

fn create_spool_file() -> std::io::Result<(PathBuf, File)> {
    let temp_dir = std::env::temp_dir();
    let ts_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();

    for _ in 0..32 {
        let counter = SPOOL_COUNTER.fetch_add(1, Ordering::Relaxed);
        let candidate = temp_dir.join(format!(
            "webspark-{}-{ts_nanos}-{counter}.tmp",
            std::process::id()
        ));

        match OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&candidate)
        {
            Ok(file) => return Ok((candidate, file)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(err) => return Err(err),
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        "failed to allocate unique spool file",
    ))
}

/// Parse the `boundary` parameter from a Content-Type header.
///
/// Content-Type format: `multipart/form-data; boundary=----WebKitFormBoundary...`
pub fn parse_boundary(content_type: &str) -> Result<String, MultipartError> {
    for param in content_type.split(';').skip(1) {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        if key.trim().eq_ignore_ascii_case("boundary") {
            let boundary = unquote(value.trim());
            if boundary.is_empty() || boundary.len() > MAX_BOUNDARY_LEN {
                return Err(MultipartError::InvalidBoundary);
            }
            return Ok(boundary);
        }
    }

    Err(MultipartError::MissingBoundary)
}

/// Parse the optional `charset` parameter from a Content-Type header.
pub fn parse_charset(content_type: &str) -> Result<Option<Charset>, MultipartError> {
    for param in content_type.split(';').skip(1) {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        if key.trim().eq_ignore_ascii_case("charset") {
            let label = unquote(value.trim());
            return match Charset::from_label(&label) {
                Some(charset) => Ok(Some(charset)),
                None => Err(MultipartError::UnsupportedCharset { label }),
            };
        }
    }

    Ok(None)
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
    {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

/// Detect the line delimiter from the first chunk.
///
/// The two bytes following the first boundary occurrence decide: `\r\n`
/// selects CRLF, a lone `\n` selects LF, anything else is a protocol error.
fn detect_delimiter(buffer: &[u8], boundary: &[u8]) -> Result<Delimiter, MultipartError> {
    let idx = memmem::find(buffer, boundary).ok_or(MultipartError::UndetectableDelimiter)?;
    let after = &buffer[idx + boundary.len()..];
    if after.starts_with(b"\r\n") {
        Ok(Delimiter::Crlf)
    } else if after.starts_with(b"\n") {
        Ok(Delimiter::Lf)
    } else {
        Err(MultipartError::UndetectableDelimiter)
    }
}

/// Parse a Content-Disposition value into (name, optional filename).
///
/// Format: `form-data; name="field"; filename="file.txt"`
fn parse_content_disposition(value: &str) -> Result<(String, Option<String>), MultipartError> {
    let mut name = None;
    let mut filename = None;

    for item in value.split(';') {
        let item = item.trim();
        if item.eq_ignore_ascii_case("form-data") {
            continue;
        }

        if let Some((key, raw_value)) = item.split_once('=') {
            let key = key.trim();
            let unquoted = unquote(raw_value.trim());
            if key.eq_ignore_ascii_case("name") {
                name = Some(unquoted);
            } else if key.eq_ignore_ascii_case("filename") {
                if unquoted.contains("..")
                    || unquoted.contains('/')
                    || unquoted.contains('\\')
                    || unquoted.contains('\0')
                {
                    return Err(MultipartError::InvalidContentDisposition {
                        detail: "filename contains path traversal characters".to_string(),
                    });
                }
                filename = Some(unquoted);
            }
        }
    }

    let name = name.ok_or_else(|| MultipartError::InvalidContentDisposition {
        detail: "missing name parameter".to_string(),
    })?;

    Ok((name, filename))
}

/// The media type of a part's Content-Type value, lowercased, parameters
/// stripped. Empty values fall back to `text/plain`.
fn part_media_type(value: &str) -> String {
    let media = value.split(';').next().unwrap_or("").trim();
    if media.is_empty() {
        DEFAULT_PART_CONTENT_TYPE.to_string()
    } else {
        media.to_ascii_lowercase()
    }
}

/// Streaming parser for one `multipart/form-data` request body.
///
/// Construction validates the declared content length against the size
/// limit, so oversized requests are rejected before a single byte is read.
/// [`parse`](Self::parse) then resolves the boundary (also before any read),
/// detects the line delimiter from the first chunk, and walks the stream
/// part by part.
pub struct MultipartParser<R: Read> {
    stream: R,
    content_type: String,
    content_length: usize,
    max_body_size: usize,
    chunk_size: usize,
    charset: Charset,
    decode_policy: DecodePolicy,
    delimiter: Option<Delimiter>,
    buffer: Vec<u8>,
    remaining: usize,
    total_read: usize,
    peak_buffer_len: usize,
    registry: TempFileRegistry,
    forms: FormFields,
    files: FileFields,
}

impl<R: Read> MultipartParser<R> {
    /// Create a parser for one request body.
    ///
    /// Fails with a 413 size-limit error if the declared `content_length`
    /// exceeds the configured maximum, before any stream read.
    pub fn new(
        stream: R,
        content_type: impl Into<String>,
        content_length: usize,
        config: MultipartConfig,
    ) -> Result<Self, MultipartError> {
        if content_length > config.max_body_size {
            return Err(MultipartError::ContentLengthTooLarge {
                length: content_length,
                max: config.max_body_size,
            });
        }

        Ok(Self {
            stream,
            content_type: content_type.into(),
            content_length,
            max_body_size: config.max_body_size,
            chunk_size: config.chunk_size,
            charset: config.charset,
            decode_policy: config.decode_policy,
            delimiter: None,
            buffer: Vec::new(),
            remaining: 0,
            total_read: 0,
            peak_buffer_len: 0,
            registry: TempFileRegistry::default(),
            forms: FormFields::new(),
            files: FileFields::new(),
        })
    }

    /// Parse the request body into the forms and files maps.
    ///
    /// On error, cleanup has already run (spool files deleted, maps reset)
    /// before the error is returned.
    pub fn parse(&mut self) -> Result<(&FormFields, &FileFields), MultipartError> {
        if let Err(err) = self.run() {
            self.cleanup();
            return Err(err);
        }
        Ok((&self.forms, &self.files))
    }

    /// Parse, hand the result maps to `f`, then clean up.
    ///
    /// The scoped equivalent of a `with` block: spool files are guaranteed
    /// deleted by the time this returns, so `f` must read any upload content
    /// it wants to keep.
    pub fn parse_with<T>(
        mut self,
        f: impl FnOnce(&FormFields, &FileFields) -> T,
    ) -> Result<T, MultipartError> {
        match self.run() {
            Ok(()) => {
                let out = f(&self.forms, &self.files);
                self.cleanup();
                Ok(out)
            }
            Err(err) => {
                self.cleanup();
                Err(err)
            }
        }
    }

    /// Parsed form fields. Empty before a successful parse and after cleanup.
    #[must_use]
    pub fn forms(&self) -> &FormFields {
        &self.forms
    }

    /// Parsed file uploads. Empty before a successful parse and after cleanup.
    #[must_use]
    pub fn files(&self) -> &FileFields {
        &self.files
    }

    /// Take ownership of the file uploads.
    ///
    /// The backing temp files are still deleted by cleanup; the caller must
    /// read the handles before that happens.
    pub fn take_files(&mut self) -> FileFields {
        std::mem::take(&mut self.files)
    }

    /// Take ownership of the form fields.
    pub fn take_forms(&mut self) -> FormFields {
        std::mem::take(&mut self.forms)
    }

    /// The delimiter detected from the stream, once parsing has started.
    #[must_use]
    pub fn delimiter(&self) -> Option<Delimiter> {
        self.delimiter
    }

    /// Largest number of bytes the scan buffer held at any point.
    ///
    /// Stays in `O(chunk_size + boundary_length)` regardless of payload
    /// size; exposed so the bound is directly assertable in tests.
    #[must_use]
    pub fn peak_buffer_len(&self) -> usize {
        self.peak_buffer_len
    }

    /// Release all resources held by this parse.
    ///
    /// Closes any still-open spool handles (by dropping the files map),
    /// deletes the backing files from disk, and resets the forms/files maps
    /// and scratch buffer to empty. Idempotent; also invoked by `Drop`.
    pub fn cleanup(&mut self) {
        self.files.clear();
        self.forms.clear();
        self.buffer = Vec::new();
        self.registry.remove_all();
    }

    /// Resolve the boundary from the Content-Type header, applying any
    /// `charset=` override as a side effect. Performs no stream reads.
    fn resolve_boundary(&mut self) -> Result<String, MultipartError> {
        let boundary = parse_boundary(&self.content_type)?;
        if let Some(charset) = parse_charset(&self.content_type)? {
            self.charset = charset;
        }
        Ok(boundary)
    }

    /// Read up to `min(chunk_size, remaining)` bytes and append them to the
    /// scan buffer. Returns false when the stream yields nothing.
    fn fill(&mut self) -> Result<bool, MultipartError> {
        let want = self.chunk_size.min(self.remaining);
        if want == 0 {
            return Ok(false);
        }

        let start = self.buffer.len();
        self.buffer.resize(start + want, 0);
        let n = self
            .stream
            .read(&mut self.buffer[start..])
            .map_err(|e| MultipartError::Io {
                detail: format!("failed to read request body: {e}"),
            })?;
        self.buffer.truncate(start + n);

        self.total_read += n;
        if self.total_read > self.max_body_size {
            return Err(MultipartError::BodyTooLarge);
        }
        self.remaining = self.remaining.saturating_sub(n);

        if self.buffer.len() > self.peak_buffer_len {
            self.peak_buffer_len = self.buffer.len();
        }
        Ok(n > 0)
    }

    /// Top up the buffer to at least `n` bytes while the stream has more.
    fn ensure_buffered(&mut self, n: usize) -> Result<(), MultipartError> {
        while self.buffer.len() < n && self.remaining > 0 {
            if !self.fill()? {
                break;
            }
        }
        Ok(())
    }

    /// Consume an optional delimiter following a boundary and make sure the
    /// two bytes deciding between "next part" and "closing `--`" are
    /// buffered before the caller inspects them.
    fn after_boundary(&mut self, delim: &'static [u8]) -> Result<(), MultipartError> {
        self.ensure_buffered(2)?;
        if self.buffer.starts_with(delim) {
            self.buffer.drain(..delim.len());
        }
        self.ensure_buffered(2)?;
        Ok(())
    }

    fn run(&mut self) -> Result<(), MultipartError> {
        let boundary_token = self.resolve_boundary()?;
        let boundary = format!("--{boundary_token}").into_bytes();
        let blength = boundary.len();
        let boundary_finder = memmem::Finder::new(&boundary);

        self.remaining = self.content_length;
        self.fill()?;

        let delimiter = detect_delimiter(&self.buffer, &boundary)?;
        self.delimiter = Some(delimiter);
        trace!(delimiter = ?delimiter, boundary_len = blength, "detected multipart delimiter");

        let delim = delimiter.as_bytes();
        let dlen = delim.len();
        let terminator = [delim, delim].concat();
        let terminator_finder = memmem::Finder::new(&terminator);

        // Discard the preamble up to and including the first boundary.
        let Some(start) = boundary_finder.find(&self.buffer) else {
            return Err(MultipartError::BoundaryNotFound);
        };
        self.buffer.drain(..start + blength);
        self.after_boundary(delim)?;

        while !self.buffer.starts_with(b"--") {
            // Part headers end at the first double delimiter.
            let header_end = loop {
                if let Some(idx) = terminator_finder.find(&self.buffer) {
                    break idx;
                }
                if self.remaining == 0 {
                    return Err(MultipartError::MalformedPartHeaders);
                }
                if !self.fill()? {
                    return Err(MultipartError::HeaderTerminatorNotFound);
                }
            };

            let header_bytes = self.buffer[..header_end].to_vec();
            self.buffer.drain(..header_end + terminator.len());
            let headers = self.parse_part_headers(&header_bytes, delimiter)?;
            let mut sink = self.new_sink(headers)?;

            // Scan for the part's closing boundary, flushing everything but
            // a tail of boundary_length + 2 bytes so a boundary split across
            // reads is never missed and memory stays bounded.
            let body_end = loop {
                if let Some(idx) = boundary_finder.find(&self.buffer) {
                    break idx;
                }
                let tail_size = blength + 2;
                if self.buffer.len() > tail_size {
                    let flush_len = self.buffer.len() - tail_size;
                    sink.write(&self.buffer[..flush_len])?;
                    self.buffer.drain(..flush_len);
                }
                if self.remaining == 0 {
                    return Err(MultipartError::ClosingBoundaryNotFound);
                }
                if !self.fill()? {
                    return Err(MultipartError::PartBodyTerminatorNotFound);
                }
            };

            let mut body_len = body_end;
            if self.buffer[..body_end].ends_with(delim) {
                body_len -= dlen;
            }
            sink.write(&self.buffer[..body_len])?;
            self.buffer.drain(..body_end + blength);

            self.finalize_part(sink)?;
            self.after_boundary(delim)?;
        }

        Ok(())
    }

    fn parse_part_headers(
        &self,
        raw: &[u8],
        delimiter: Delimiter,
    ) -> Result<PartHeaders, MultipartError> {
        let delim = delimiter.as_bytes();
        let mut headers: HashMap<String, String> = HashMap::new();

        let mut start = 0;
        let mut lines: Vec<&[u8]> = Vec::new();
        for pos in memmem::find_iter(raw, delim) {
            lines.push(&raw[start..pos]);
            start = pos + delim.len();
        }
        lines.push(&raw[start..]);

        for line in lines {
            let line = line.trim_ascii();
            if line.is_empty() {
                continue;
            }
            let Some(text) = self.charset.decode(line, self.decode_policy) else {
                return Err(MultipartError::InvalidPartHeaders {
                    detail: "invalid text encoding in part header".to_string(),
                });
            };
            // Lines without a colon are tolerated and skipped.
            if let Some((key, value)) = text.split_once(':') {
                headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }

        let disposition = headers
            .get("content-disposition")
            .ok_or(MultipartError::MissingContentDisposition)?;
        let (name, filename) = parse_content_disposition(disposition)?;
        let content_type = headers
            .get("content-type")
            .map_or_else(|| DEFAULT_PART_CONTENT_TYPE.to_string(), |v| part_media_type(v));

        Ok(PartHeaders {
            name,
            filename,
            content_type,
        })
    }

    fn new_sink(&mut self, headers: PartHeaders) -> Result<PartSink, MultipartError> {
        let PartHeaders {
            name,
            filename,
            content_type,
        } = headers;

        match filename {
            Some(filename) => {
                let (path, file) = create_spool_file().map_err(|e| MultipartError::Io {
                    detail: format!("failed to create spool file: {e}"),
                })?;
                // Register before the first write so cleanup cannot miss it.
                self.registry.register(path.clone());
                trace!(name = %name, path = %path.display(), "spooling file part");
                Ok(PartSink::File {
                    name,
                    filename,
                    content_type,
                    file,
                    path,
                })
            }
            None => Ok(PartSink::Field {
                name,
                content: Vec::new(),
            }),
        }
    }

    fn finalize_part(&mut self, sink: PartSink) -> Result<(), MultipartError> {
        match sink {
            PartSink::Field { name, content } => {
                let Some(value) = self.charset.decode(&content, self.decode_policy) else {
                    return Err(MultipartError::InvalidFieldEncoding { name });
                };
                trace!(name = %name, len = content.len(), "finalized form field");
                insert_value(&mut self.forms, name, value);
            }
            PartSink::File {
                name,
                filename,
                content_type,
                mut file,
                path,
            } => {
                file.seek(SeekFrom::Start(0)).map_err(|e| MultipartError::Io {
                    detail: format!("failed to rewind spool file: {e}"),
                })?;
                trace!(name = %name, filename = %filename, "finalized file part");
                insert_value(
                    &mut self.files,
                    name,
                    UploadFile {
                        filename,
                        content_type,
                        file,
                        path,
                    },
                );
            }
        }
        Ok(())
    }
}

impl<R: Read> Drop for MultipartParser<R> {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn insert_value<T>(map: &mut HashMap<String, MultiValue<T>>, name: String, value: T) {
    match map.entry(name) {
        Entry::Occupied(mut entry) => entry.get_mut().push(value),
        Entry::Vacant(entry) => {
            entry.insert(MultiValue::Single(value));
        }
    }
}
