//! `/proc/self/maps` parsing.

use std::fs;

use super::{score, RuntimeModule};
use crate::error::{Error, Result};

pub fn modules() -> Result<Vec<RuntimeModule>> {
    let maps = fs::read_to_string("/proc/self/maps").map_err(|e| Error::MapFailure {
        detail: format!("could not read /proc/self/maps: {e}"),
    })?;

    let mut seen = std::collections::HashMap::new();
    for line in maps.lines() {
        let Some(parsed) = parse_line(line) else { continue };
        seen.entry(parsed.path.clone()).or_insert(parsed);
    }

    Ok(seen.into_values().collect())
}

/// Parse one `/proc/self/maps` line: `start-end perms offset dev inode path`.
fn parse_line(line: &str) -> Option<RuntimeModule> {
    let mut fields = line.split_whitespace();
    let range = fields.next()?;
    let perms = fields.next()?;
    let offset = fields.next()?;
    let _dev = fields.next()?;
    let _inode = fields.next()?;
    let path = fields.next()?;

    if !perms.contains('x') || !path.starts_with('/') {
        return None;
    }

    let start = u64::from_str_radix(range.split('-').next()?, 16).ok()?;
    let offset = u64::from_str_radix(offset, 16).ok()?;
    let load_base = start.checked_sub(offset)?;

    Some(RuntimeModule { path: path.to_string(), load_base, score: score(path) })
}
