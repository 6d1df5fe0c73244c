//! Path utility functions

use anyhow::{anyhow, Result};
use std::path::{Component, Path, PathBuf};

const STORAGE_DIR: &str = "VMs";

/// Default storage root: a `VMs` directory next to the executable,
/// or `~/pxevm/VMs` when the executable location is unknown.
pub fn default_storage_root() -> Result<PathBuf> {
    if let Some(dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        return Ok(dir.join(STORAGE_DIR));
    }
    Ok(dirs::home_dir()
        .ok_or_else(|| anyhow!("no home directory found"))?
        .join("pxevm")
        .join(STORAGE_DIR))
}

/// Resolve path under root directory
pub fn resolve_under_root(root: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        root.join(p)
    }
}

/// Absolute, `.`/`..`-free form of `p`. Symlinks are followed when the path
/// exists; otherwise the result is purely lexical.
pub fn resolve(p: &Path) -> PathBuf {
    if let Ok(real) = p.canonicalize() {
        return real;
    }
    let abs = match std::env::current_dir() {
        Ok(cwd) => resolve_under_root(&cwd, p),
        Err(_) => p.to_path_buf(),
    };
    let mut out = PathBuf::new();
    for comp in abs.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// True when `path` lies inside `root`, comparing resolved paths component
/// by component and ignoring ASCII case.
pub fn is_within(path: &Path, root: &Path) -> bool {
    let path = resolve(path);
    let root = resolve(root);
    let mut inner = path.components();
    for want in root.components() {
        match inner.next() {
            Some(have) => {
                let have = have.as_os_str().to_string_lossy();
                let want = want.as_os_str().to_string_lossy();
                if !have.eq_ignore_ascii_case(&want) {
                    return false;
                }
            }
            None => return false,
        }
    }
    inner.next().is_some()
}

/// True when `dir` has no entries at all
pub fn dir_is_empty(dir: &Path) -> std::io::Result<bool> {
    Ok(std::fs::read_dir(dir)?.next().is_none())
}
