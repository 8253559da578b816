//! In-memory loader for native shared-library images.
//!
//! Loads an ELF, Mach-O, or PE shared-library image directly out of a byte
//! buffer — no filesystem staging — maps it, resolves its external symbols,
//! and invokes a named zero-argument export.

pub mod aplib;
pub mod backend;
pub mod error;
pub mod format;
pub mod introspect;
pub mod mapper;
pub mod resolver;

use std::sync::RwLock;

pub use error::{Error, Result};

/// A loaded image, ready to have exports invoked or to be freed.
///
/// `call_export` takes a shared read lock; `free` takes the exclusive write
/// lock. Once freed, every subsequent `call_export` returns
/// [`Error::LibraryClosed`].
pub struct Image {
    backend: RwLock<Option<backend::Loaded>>,
}

impl Image {
    /// Parse, map, and relocate `bytes`, without invoking anything yet.
    pub fn load(bytes: &[u8]) -> Result<Image> {
        let loaded = backend::load(bytes)?;
        Ok(Image { backend: RwLock::new(Some(loaded)) })
    }

    /// Read `path` off disk and load it exactly as [`Image::load`] would.
    ///
    /// The file is only ever used as a byte source; once read, the loader
    /// never touches the path again.
    pub fn load_from_path(path: impl AsRef<std::path::Path>) -> Result<Image> {
        let bytes = std::fs::read(path).map_err(|e| Error::MalformedImage {
            detail: format!("could not read image file: {e}"),
        })?;
        Image::load(&bytes)
    }

    /// Resolve and invoke the named zero-argument export.
    ///
    /// `name` is trimmed of surrounding whitespace first. Both `name` and its
    /// leading-underscore variant (stripped if present, added if absent) are
    /// tried, since Mach-O images conventionally export C symbols with a `_`
    /// prefix the caller rarely spells out.
    pub fn call_export(&self, name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::EmptyExportName);
        }
        let guard = self.backend.read().expect("reflektor image lock poisoned");
        let loaded = guard.as_ref().ok_or(Error::LibraryClosed)?;

        let alternate = match name.strip_prefix('_') {
            Some(stripped) => stripped.to_string(),
            None => format!("_{name}"),
        };
        match loaded.call_export(name) {
            Err(Error::ExportNotFound { .. }) => loaded.call_export(&alternate),
            result => result,
        }
    }

    /// Unmap the image. Calling `free` again after it has already succeeded
    /// is a no-op that returns `Ok(())` both times.
    pub fn free(&self) -> Result<()> {
        let mut guard = self.backend.write().expect("reflektor image lock poisoned");
        match guard.take() {
            Some(loaded) => loaded.free(),
            None => Ok(()),
        }
    }
}
