//! Detached signing of attestation statements.
//!
//! Key material never passes through this crate. Signing is delegated to an
//! external tool behind the [`AttestationSigner`] trait; the shipped
//! implementation runs `cosign sign-blob` directly (no shell) and reports
//! failures with sanitized stderr.

use std::{
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use anyhow::{anyhow, Context, Result};
use regex::Regex;

const MAX_TOOL_ERR_BYTES: usize = 8 * 1024; // 8KB

/// Produces a signature bundle for a statement file.
pub trait AttestationSigner {
    /// Signs `statement` and writes the signature bundle to `bundle`.
    fn sign(&self, statement: &Path, bundle: &Path) -> Result<()>;
}

/// Sigstore `cosign` signer.
#[derive(Debug, Clone)]
pub struct CosignSigner {
    binary: PathBuf,
}

impl Default for CosignSigner {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("cosign"),
        }
    }
}

impl CosignSigner {
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// True if the binary launches at all. Exit status is ignored.
    pub fn is_available(&self) -> bool {
        Command::new(&self.binary)
            .arg("version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok()
    }
}

impl AttestationSigner for CosignSigner {
    fn sign(&self, statement: &Path, bundle: &Path) -> Result<()> {
        if !self.is_available() {
            return Err(anyhow!(
                "cosign: not found. Install: https://docs.sigstore.dev/cosign/system_config/installation/"
            ));
        }
        run_checked(
            Command::new(&self.binary)
                .args(["sign-blob", "--yes", "--bundle"])
                .arg(bundle)
                .arg(statement),
            "cosign sign-blob",
        )?;
        tracing::info!(bundle = %bundle.display(), "statement signed");
        Ok(())
    }
}

/// Runs an external tool, returning an error with sanitized stderr on failure.
pub(crate) fn run_checked(cmd: &mut Command, name: &str) -> Result<()> {
    let out = cmd.output().with_context(|| format!("running {name}"))?;
    if !out.status.success() {
        return Err(anyhow!(
            "{name} failed: {}",
            sanitize_tool_stderr(&out.stderr)
        ));
    }
    Ok(())
}

/// Truncates tool output and redacts credentials and absolute paths.
pub fn sanitize_tool_stderr(stderr: &[u8]) -> String {
    let mut s = String::from_utf8_lossy(stderr).to_string();
    if s.len() > MAX_TOOL_ERR_BYTES {
        let mut cut = MAX_TOOL_ERR_BYTES;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push_str("\n[TRUNCATED]");
    }

    let patterns = [
        (r"AKIA[0-9A-Z]{16}", "AKIA****************"),
        (r"(?i)ghp_[A-Za-z0-9]{30,60}", "ghp_****************"),
        (
            r"(?i)BEGIN (RSA|EC|OPENSSH|ENCRYPTED SIGSTORE) PRIVATE KEY",
            "BEGIN [REDACTED] PRIVATE KEY",
        ),
        (
            r"(?i)(password|token|cosign_password)\s*[:=]\s*[^\s]+",
            "[REDACTED]=[REDACTED]",
        ),
        (r"(?i)bearer\s+[a-z0-9\-_\.=]{1,500}", "bearer [REDACTED]"),
    ];
    for (pat, repl) in patterns {
        if let Ok(re) = Regex::new(pat) {
            s = re.replace_all(&s, repl).to_string();
        }
    }

    s.lines()
        .map(|line| {
            if line.trim_start().starts_with('/') {
                "[REDACTED_PATH]"
            } else {
                line
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}
