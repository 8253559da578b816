//! Loader backends: one module per container format,
//! composing `format` parsing, `mapper` mapping, and `resolver` symbol
//! resolution into a `load → relocate → protect → invoke` pipeline, behind
//! the single façade `crate::Image` talks to.

#[cfg(target_os = "linux")]
pub mod elf;
#[cfg(target_os = "macos")]
pub mod macho;
#[cfg(windows)]
pub mod pe;

use crate::error::{Error, Result};
use crate::format::{self, Container};

/// A mapped, relocated image ready to have exports invoked.
pub enum Loaded {
    #[cfg(target_os = "linux")]
    Elf(elf::Loaded),
    #[cfg(target_os = "macos")]
    MachO(macho::Loaded),
    #[cfg(windows)]
    Pe(pe::Loaded),
}

impl Loaded {
    pub fn call_export(&self, name: &str) -> Result<()> {
        match self {
            #[cfg(target_os = "linux")]
            Loaded::Elf(loaded) => loaded.call_export(name),
            #[cfg(target_os = "macos")]
            Loaded::MachO(loaded) => loaded.call_export(name),
            #[cfg(windows)]
            Loaded::Pe(loaded) => loaded.call_export(name),
        }
    }

    pub fn free(self) -> Result<()> {
        match self {
            #[cfg(target_os = "linux")]
            Loaded::Elf(loaded) => loaded.free(),
            #[cfg(target_os = "macos")]
            Loaded::MachO(loaded) => loaded.free(),
            #[cfg(windows)]
            Loaded::Pe(loaded) => loaded.free(),
        }
    }
}

/// Sniff `bytes`' container format and run the matching backend's full
/// `load → relocate → protect` pipeline.
pub fn load(bytes: &[u8]) -> Result<Loaded> {
    match format::detect(bytes)? {
        Container::Elf => {
            #[cfg(target_os = "linux")]
            {
                Ok(Loaded::Elf(elf::load(bytes)?))
            }
            #[cfg(not(target_os = "linux"))]
            {
                Err(Error::UnsupportedFormat)
            }
        }
        Container::MachO => {
            #[cfg(target_os = "macos")]
            {
                Ok(Loaded::MachO(macho::load(bytes)?))
            }
            #[cfg(not(target_os = "macos"))]
            {
                Err(Error::UnsupportedFormat)
            }
        }
        Container::Pe => {
            #[cfg(windows)]
            {
                Ok(Loaded::Pe(pe::load(bytes)?))
            }
            #[cfg(not(windows))]
            {
                Err(Error::UnsupportedFormat)
            }
        }
    }
}
