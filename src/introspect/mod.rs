//! Runtime-module introspector: enumerates the shared libraries
//! already mapped into this process, giving the resolver somewhere to look
//! for external symbols besides the dependencies it loads itself.
//!
//! One backend module per OS, each enumerating modules in whatever way that
//! platform natively exposes them.

use crate::error::Result;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod linux;
        use linux as imp;
    } else if #[cfg(target_os = "macos")] {
        mod macos;
        use macos as imp;
    } else if #[cfg(windows)] {
        mod windows;
        use windows as imp;
    } else {
        compile_error!("reflektor's introspector has no implementation for this target");
    }
}

/// A shared library already mapped into this process.
#[derive(Debug, Clone)]
pub struct RuntimeModule {
    /// On-disk path, when the loader recorded one (always true on Linux and
    /// Windows; best-effort on darwin).
    pub path: String,
    /// Base address this module is mapped at in this process.
    pub load_base: u64,
    /// Domain score: prefer libc, musl, ld-*; -1 if unscored.
    pub score: i32,
}

/// Score a module path the way the resolver prefers candidates:
/// libc highest, then musl/the dynamic linker, everything else last.
pub fn score(path: &str) -> i32 {
    if path.contains("libc.so") {
        100
    } else if path.contains("libc-") {
        95
    } else if path.contains("ld-musl") {
        90
    } else if path.contains("musl") {
        85
    } else if path.contains("ld-linux") {
        80
    } else {
        -1
    }
}

/// List every module currently mapped into this process, ordered by score
/// descending then path ascending.
pub fn modules() -> Result<Vec<RuntimeModule>> {
    let mut list = imp::modules()?;
    list.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.path.cmp(&b.path)));
    Ok(list)
}
