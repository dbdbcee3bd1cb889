//! Every filesystem side effect rootguard performs lives here: bounded reads
//! of configuration and evidence, and the one mutating recovery action
//! (directory creation inside the safe root).

use anyhow::{anyhow, bail, Context, Result};
use std::{
    fs, io,
    path::{Component, Path, PathBuf},
};

/// Reads a file after verifying it is not a symlink and is within `max_bytes`.
///
/// NOTE: narrow TOCTOU window between `symlink_metadata()` and `fs::read()`.
/// Closing it fully requires `O_NOFOLLOW` or `fstat` on the fd.
pub fn read_validated(path: &Path, max_bytes: u64) -> Result<Vec<u8>> {
    let meta = fs::symlink_metadata(path).with_context(|| format!("stat {}", path.display()))?;
    if meta.file_type().is_symlink() {
        return Err(anyhow!("Refusing to read symlink: {}", path.display()));
    }
    if meta.len() > max_bytes {
        return Err(anyhow!(
            "File too large: {} ({} bytes, max {max_bytes} bytes)",
            path.display(),
            meta.len(),
        ));
    }
    fs::read(path).with_context(|| format!("read {}", path.display()))
}

/// Creates `relative` under `root` one component at a time and returns the
/// directories it actually created.
///
/// `root` must be canonical. Existing components are accepted only if they
/// are directories that stay inside `root`; a symlinked component is
/// canonicalized and checked before descending, so a planted link can never
/// redirect creation outside the root. `AlreadyExists` from a concurrent
/// caller counts as success.
pub fn materialize_dirs(root: &Path, relative: &Path) -> Result<Vec<PathBuf>> {
    let mut cur = root.to_path_buf();
    let mut created = Vec::new();

    for comp in relative.components() {
        let Component::Normal(name) = comp else {
            bail!("Refusing non-normal path component in {}", relative.display());
        };
        let next = cur.join(name);

        match fs::symlink_metadata(&next) {
            Ok(meta) if meta.file_type().is_symlink() => {
                cur = checked_dir(root, &next)?;
            }
            Ok(meta) if meta.is_dir() => cur = next,
            Ok(_) => bail!("Not a directory: {}", next.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => match fs::create_dir(&next) {
                Ok(()) => {
                    created.push(next.clone());
                    cur = next;
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    cur = checked_dir(root, &next)?;
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("create {}", next.display()));
                }
            },
            Err(e) => return Err(e).with_context(|| format!("stat {}", next.display())),
        }
    }
    Ok(created)
}

/// Canonicalizes `p` and requires a directory inside `root`.
fn checked_dir(root: &Path, p: &Path) -> Result<PathBuf> {
    let canonical = p
        .canonicalize()
        .with_context(|| format!("resolve {}", p.display()))?;
    if !canonical.starts_with(root) {
        bail!("Refusing to follow link out of safe root: {}", p.display());
    }
    if !canonical.is_dir() {
        bail!("Not a directory: {}", p.display());
    }
    Ok(canonical)
}
