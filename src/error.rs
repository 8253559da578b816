//! Crate-wide error type.
//!
//! One variant per failure mode in the loader's contract. The façade and
//! every backend funnel their failures through this type so callers get a
//! single, structured error regardless of which format was loaded.

use thiserror::Error;

/// Everything that can go wrong loading or invoking an in-memory image.
#[derive(Debug, Error)]
pub enum Error {
    #[error("image buffer is empty")]
    EmptyImage,

    #[error("unrecognized image format")]
    UnsupportedFormat,

    #[error("image is built for {provided:?} but this host is {expected:?}")]
    ForeignPlatform {
        provided: String,
        expected: String,
    },

    #[error("malformed image: {detail}")]
    MalformedImage { detail: String },

    #[error("failed to map image into memory: {detail}")]
    MapFailure { detail: String },

    #[error("relocation failed: {detail}")]
    RelocationFailure { detail: String },

    #[error("could not resolve external symbol `{name}`")]
    UnresolvedExternalSymbol { name: String },

    #[error("failed to load dependency `{name}`: {detail}")]
    DependencyLoadFailure { name: String, detail: String },

    #[error("required dyld entry points are missing: {}", .list.join(", "))]
    MissingDyldSymbols { list: Vec<String> },

    #[error("AP32 header is invalid")]
    Ap32HeaderInvalid,

    #[error("AP32 decompression failed: {detail}")]
    Ap32DecodeFailure { detail: String },

    #[error("library has already been freed")]
    LibraryClosed,

    #[error("export name is empty")]
    EmptyExportName,

    #[error("export `{name}` was not found")]
    ExportNotFound { name: String },

    #[error("dyld APIs are unavailable in this process")]
    DyldApisUnavailable,

    #[error("dyld reported a load failure: {detail}")]
    MachODyldFailure { detail: String },
}

pub type Result<T> = std::result::Result<T, Error>;
