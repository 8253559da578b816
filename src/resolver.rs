//! External-symbol resolver.
//!
//! Resolves import names against: (1) a cache of symbols already resolved
//! this session, (2) the dependency libraries the backend primes ahead of
//! relocation, (3) every other module already mapped into the process (via
//! [`crate::introspect`]). On unix this is `dlopen`/`dlsym` against
//! `RTLD_DEFAULT`; on Windows it's `GetProcAddress` against each loaded
//! module, falling back to a raw export-directory walk.

use std::collections::HashMap;

use crate::error::{Error, Result};

/// Baseline dependencies primed before any import resolution is attempted.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub const BASELINE_DEPENDENCIES: &[&str] = &[
    "libc.so.6",
    "libdl.so.2",
    "libpthread.so.0",
    "ld-linux-x86-64.so.2",
    "ld-musl-x86_64.so.1",
];

#[cfg(all(target_os = "linux", target_arch = "x86"))]
pub const BASELINE_DEPENDENCIES: &[&str] = &[
    "libc.so.6",
    "libdl.so.2",
    "libpthread.so.0",
    "ld-linux.so.2",
    "ld-musl-i386.so.1",
];

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
pub const BASELINE_DEPENDENCIES: &[&str] = &[
    "libc.so.6",
    "libdl.so.2",
    "libpthread.so.0",
    "ld-linux-aarch64.so.1",
    "ld-musl-aarch64.so.1",
];

#[cfg(target_os = "macos")]
pub const BASELINE_DEPENDENCIES: &[&str] = &["/usr/lib/libSystem.B.dylib"];

#[cfg(windows)]
pub const BASELINE_DEPENDENCIES: &[&str] =
    &["kernel32.dll", "ntdll.dll", "user32.dll", "msvcrt.dll"];

/// Directories searched, in order, for a baseline dependency's basename.
#[cfg(unix)]
const SEARCH_DIRS: &[&str] = &["/lib", "/lib64", "/usr/lib", "/usr/lib64"];

/// Every path/name variant tried for a dependency, in resolution order: the
/// name itself, its basename, the name with any `.so.N` version suffix
/// trimmed, and the basename under each standard search directory.
#[cfg(unix)]
fn candidates(name: &str) -> Vec<String> {
    let mut out = vec![name.to_string()];
    let basename = name.rsplit('/').next().unwrap_or(name);
    if basename != name {
        out.push(basename.to_string());
    }
    if let Some(idx) = basename.find(".so.") {
        out.push(basename[..idx + 3].to_string());
    }
    for dir in SEARCH_DIRS {
        out.push(format!("{dir}/{basename}"));
    }
    out.dedup();
    out
}

pub struct Resolver {
    cache: HashMap<String, u64>,
    #[cfg(unix)]
    handles: Vec<*mut std::ffi::c_void>,
    #[cfg(windows)]
    handles: Vec<winapi::shared::minwindef::HMODULE>,
}

unsafe impl Send for Resolver {}
unsafe impl Sync for Resolver {}

impl Resolver {
    pub fn new() -> Result<Resolver> {
        let mut resolver = Resolver { cache: HashMap::new(), handles: Vec::new() };
        for name in BASELINE_DEPENDENCIES {
            // Best effort: a missing baseline dependency on an unusual host
            // just means fewer symbols are pre-primed, not a hard failure.
            let _ = resolver.load_dependency(name);
        }
        Ok(resolver)
    }

    /// Explicitly load `name` as a dependency, priming its exports for
    /// subsequent [`Resolver::resolve`] calls. Tries every path/name
    /// candidate in turn and succeeds on the first one that loads.
    pub fn load_dependency(&mut self, name: &str) -> Result<()> {
        imp::load_dependency(self, name)
    }

    /// Resolve `name` to an absolute address, consulting the cache first.
    pub fn resolve(&mut self, name: &str) -> Result<u64> {
        if let Some(addr) = self.cache.get(name) {
            return Ok(*addr);
        }
        let addr = imp::resolve(self, name)
            .or_else(|| imp::resolve_versioned(self, name))
            .ok_or_else(|| Error::UnresolvedExternalSymbol { name: name.to_string() })?;
        self.cache.insert(name.to_string(), addr);
        Ok(addr)
    }
}

#[cfg(unix)]
mod imp {
    use super::Resolver;
    use crate::error::{Error, Result};
    use std::ffi::CString;

    pub fn load_dependency(resolver: &mut Resolver, name: &str) -> Result<()> {
        let mut last = String::from("no candidates tried");
        for candidate in super::candidates(name) {
            match load_one(resolver, &candidate) {
                Ok(()) => return Ok(()),
                Err(Error::DependencyLoadFailure { detail, .. }) => last = detail,
                Err(e) => return Err(e),
            }
        }
        Err(Error::DependencyLoadFailure { name: name.to_string(), detail: last })
    }

    fn load_one(resolver: &mut Resolver, name: &str) -> Result<()> {
        let cname = CString::new(name).map_err(|_| Error::DependencyLoadFailure {
            name: name.to_string(),
            detail: "library name contains an interior NUL".into(),
        })?;
        let handle = unsafe { libc::dlopen(cname.as_ptr(), libc::RTLD_NOW | libc::RTLD_GLOBAL) };
        if handle.is_null() {
            return Err(Error::DependencyLoadFailure {
                name: name.to_string(),
                detail: dlerror(),
            });
        }
        resolver.handles.push(handle);
        Ok(())
    }

    pub fn resolve(_resolver: &mut Resolver, name: &str) -> Option<u64> {
        if let Some(addr) = dlsym_default(name) {
            return Some(addr);
        }
        // `RTLD_DEFAULT` only sees symbols already in the global scope; a
        // dependency loaded without `RTLD_GLOBAL`, or not primed at all,
        // still has its export sitting in its own on-disk dynamic symbol
        // table. Re-enumerate the process's mapped modules (picking up
        // anything mapped since the last call) and read each one's table
        // directly.
        for module in crate::introspect::modules().ok()?.iter() {
            if let Some(addr) = symbol_table_lookup(module, name) {
                return Some(addr);
            }
        }
        None
    }

    fn dlsym_default(name: &str) -> Option<u64> {
        let cname = CString::new(name).ok()?;
        unsafe {
            let addr = libc::dlsym(libc::RTLD_DEFAULT, cname.as_ptr());
            if addr.is_null() {
                None
            } else {
                Some(addr as u64)
            }
        }
    }

    /// Look up `name` in `module`'s own on-disk dynamic symbol table,
    /// returning a runtime address relative to its mapped load base.
    fn symbol_table_lookup(module: &crate::introspect::RuntimeModule, name: &str) -> Option<u64> {
        use object::{Object, ObjectSymbol as _};
        let data = std::fs::read(&module.path).ok()?;
        let file = object::File::parse(&*data).ok()?;
        file.dynamic_symbols().find_map(|sym| {
            let sym_name = sym.name().ok()?;
            if sym_name == name && !sym.is_undefined() {
                Some(module.load_base.wrapping_add(sym.address()))
            } else {
                None
            }
        })
    }

    /// Retry with an `@version` suffix stripped, for symbols the caller
    /// asked for versioned but the dynamic symbol table only exports
    /// unversioned.
    pub fn resolve_versioned(resolver: &mut Resolver, name: &str) -> Option<u64> {
        let base = name.split('@').next()?;
        if base == name {
            return None;
        }
        resolve(resolver, base)
    }

    fn dlerror() -> String {
        unsafe {
            let msg = libc::dlerror();
            if msg.is_null() {
                "unknown dlopen failure".to_string()
            } else {
                std::ffi::CStr::from_ptr(msg).to_string_lossy().into_owned()
            }
        }
    }
}

#[cfg(windows)]
mod imp {
    use super::Resolver;
    use crate::error::{Error, Result};
    use std::ffi::CString;
    use winapi::um::libloaderapi::{GetProcAddress, LoadLibraryA};

    pub fn load_dependency(resolver: &mut Resolver, name: &str) -> Result<()> {
        let cname = CString::new(name).map_err(|_| Error::DependencyLoadFailure {
            name: name.to_string(),
            detail: "library name contains an interior NUL".into(),
        })?;
        let handle = unsafe { LoadLibraryA(cname.as_ptr()) };
        if handle.is_null() {
            return Err(Error::DependencyLoadFailure {
                name: name.to_string(),
                detail: std::io::Error::last_os_error().to_string(),
            });
        }
        resolver.handles.push(handle);
        Ok(())
    }

    pub fn resolve(resolver: &mut Resolver, name: &str) -> Option<u64> {
        let cname = CString::new(name).ok()?;
        for &handle in &resolver.handles {
            let addr = unsafe { GetProcAddress(handle, cname.as_ptr()) };
            if !addr.is_null() {
                return Some(addr as u64);
            }
        }
        for module in crate::introspect::modules().ok()?.iter() {
            if let Some(addr) = export_directory_lookup(module, name) {
                return Some(addr);
            }
        }
        None
    }

    pub fn resolve_versioned(_resolver: &mut Resolver, _name: &str) -> Option<u64> {
        None
    }

    /// Fallback for modules `GetProcAddress` can't see (not yet registered
    /// with the loader): walk the module's own PE export directory via the
    /// `object` reader.
    fn export_directory_lookup(module: &crate::introspect::RuntimeModule, name: &str) -> Option<u64> {
        let base = module.load_base as *const u8;
        if base.is_null() {
            return None;
        }
        // Mapped modules are read as a live image, not a file, so this walks
        // the export directory in place rather than reopening the DLL file.
        let bytes = unsafe { std::slice::from_raw_parts(base, 0x1000) };
        let file = object::read::pe::PeFile64::parse(bytes).ok()?;
        use object::{Object, ObjectSymbol as _};
        file.exports().ok()?.into_iter().find_map(|export| {
            if export.name() == name.as_bytes() {
                Some(module.load_base + export.address())
            } else {
                None
            }
        })
    }
}
