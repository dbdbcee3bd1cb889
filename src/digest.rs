use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::{
    fs,
    io::Read,
    path::{Path, PathBuf},
};
use walkdir::WalkDir;

/// Limits for walking an artifact directory.
const MAX_TREE_FILES: usize = 10_000;
const MAX_TREE_BYTES: u64 = 2 * 1024 * 1024 * 1024; // 2GB

/// One file in a [`TreeDigest`], path relative to the tree root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileDigest {
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Aggregate digest of a directory. Each sorted entry feeds its
/// length-prefixed relative path and then its content hash, so renaming a
/// file changes the digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeDigest {
    pub sha256: String,
    pub total_bytes: u64,
    pub files: Vec<FileDigest>,
}

/// Streams `p` through SHA-256. Refuses symlinks and files over `max_size`.
pub fn sha256_file(p: &Path, max_size: u64) -> Result<(String, u64)> {
    let meta = fs::symlink_metadata(p).with_context(|| format!("stat {}", p.display()))?;
    if meta.file_type().is_symlink() {
        return Err(anyhow!("Refusing to hash symlink: {}", p.display()));
    }
    if !meta.is_file() {
        return Err(anyhow!("Not a regular file: {}", p.display()));
    }
    let len = meta.len();
    if len > max_size {
        return Err(anyhow!(
            "File too large: {} ({} bytes, max {} bytes)",
            p.display(),
            len,
            max_size
        ));
    }

    let mut f = fs::File::open(p).with_context(|| format!("open {}", p.display()))?;
    let mut h = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = f
            .read(&mut buf)
            .with_context(|| format!("read {}", p.display()))?;
        if n == 0 {
            break;
        }
        h.update(&buf[..n]);
    }
    Ok((hex::encode(h.finalize()), len))
}

/// Hashes every regular file under `dir`. Symlinks anywhere in the tree are
/// an error, not something to skip.
pub fn hash_tree(dir: &Path, max_file_size: u64) -> Result<TreeDigest> {
    let mut paths: Vec<PathBuf> = Vec::new();
    let mut total: u64 = 0;

    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.with_context(|| format!("walk {}", dir.display()))?;
        if entry.path_is_symlink() {
            return Err(anyhow!(
                "Refusing to include symlink in tree: {}",
                entry.path().display()
            ));
        }
        if !entry.file_type().is_file() {
            continue;
        }
        if paths.len() >= MAX_TREE_FILES {
            return Err(anyhow!(
                "Too many files under {} (max {})",
                dir.display(),
                MAX_TREE_FILES
            ));
        }
        let size = entry.metadata()?.len();
        total = total.saturating_add(size);
        if total > MAX_TREE_BYTES {
            return Err(anyhow!(
                "Tree too large: {} bytes (max {} bytes)",
                total,
                MAX_TREE_BYTES
            ));
        }
        paths.push(entry.into_path());
    }
    paths.sort();

    let mut h = Sha256::new();
    let mut files = Vec::with_capacity(paths.len());
    for p in &paths {
        let (sha256, bytes) = sha256_file(p, max_file_size)?;
        let rel = p.strip_prefix(dir).with_context(|| {
            format!("'{}' is not under '{}'", p.display(), dir.display())
        })?;
        let path = rel.to_string_lossy().replace('\\', "/");
        h.update((path.len() as u64).to_le_bytes());
        h.update(path.as_bytes());
        h.update(sha256.as_bytes());
        files.push(FileDigest {
            path,
            sha256,
            bytes,
        });
    }

    Ok(TreeDigest {
        sha256: hex::encode(h.finalize()),
        total_bytes: total,
        files,
    })
}
