//! Red team tests for the safe-root boundary.
//!
//! Adversarial candidates must be rejected with a security classification,
//! never resolved outside the root and never trigger recovery, whatever the
//! recovery configuration.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

use std::{
    fs,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use rootguard::{
    config::RecoveryConfig, EventBus, EventKind, RejectReason, SafeRootBoundary,
    SelfHealingValidator, ValidationError, ValidationOutcome,
};
use tempfile::TempDir;

fn aggressive_recovery() -> RecoveryConfig {
    RecoveryConfig {
        enabled: true,
        max_attempts: u32::MAX,
        materialize_leaf: true,
    }
}

/// Validator plus a counter of recovery-related events.
fn guarded(dir: &TempDir) -> (SelfHealingValidator, Arc<AtomicUsize>) {
    let bus = Arc::new(EventBus::new());
    let recoveries = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&recoveries);
    bus.subscribe_all(move |e| {
        if matches!(
            e.kind,
            EventKind::StructureMissing | EventKind::StructureRecovered | EventKind::DagNodeRebuilt
        ) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    });
    let boundary = SafeRootBoundary::new(dir.path(), &[]).unwrap();
    (
        SelfHealingValidator::new(boundary, aggressive_recovery(), true, bus),
        recoveries,
    )
}

// -------------------------------------------------------------------------
// (a) Traversal in every spelling
// -------------------------------------------------------------------------

#[test]
fn traversal_variants_are_rejected_without_recovery() {
    let dir = TempDir::new().unwrap();
    fs::create_dir(dir.path().join("a")).unwrap();
    let (v, recoveries) = guarded(&dir);

    for c in [
        "..",
        "../",
        "a/../..",
        "a/../../etc",
        "./../x",
        "a/./../../../x",
        "..\\..\\windows",
        "a\\..\\..",
        "missing/../../x",
    ] {
        let err = v.validate_and_resolve(c).unwrap_err();
        assert!(
            matches!(err, ValidationError::OutsideSafeRoot { .. }),
            "{c:?} -> {err:?}"
        );
    }
    assert_eq!(recoveries.load(Ordering::SeqCst), 0);
    assert!(!dir.path().join("missing").exists());
}

#[test]
fn dotdot_inside_a_name_is_not_traversal() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("..hidden"), b"x").unwrap();
    fs::write(dir.path().join("file..txt"), b"x").unwrap();
    let b = SafeRootBoundary::new(dir.path(), &[]).unwrap();
    assert!(b.resolve("..hidden").is_resolved());
    assert!(b.resolve("file..txt").is_resolved());
}

// -------------------------------------------------------------------------
// (b) Absolute paths and prefixes
// -------------------------------------------------------------------------

#[test]
fn absolute_paths_outside_prefixes_are_rejected() {
    let dir = TempDir::new().unwrap();
    let (v, recoveries) = guarded(&dir);
    for c in ["/", "/etc/passwd", "/tmp", "//etc"] {
        let err = v.validate_and_resolve(c).unwrap_err();
        assert!(err.is_security(), "{c:?} -> {err:?}");
    }
    assert_eq!(recoveries.load(Ordering::SeqCst), 0);
}

#[test]
fn absolute_path_to_root_itself_is_not_a_bypass() {
    let dir = TempDir::new().unwrap();
    let b = SafeRootBoundary::new(dir.path(), &[]).unwrap();
    let abs = dir.path().canonicalize().unwrap();
    assert_eq!(
        b.resolve(abs.to_str().unwrap()),
        ValidationOutcome::Rejected(RejectReason::AbsolutePath)
    );
}

#[test]
fn allowed_prefix_cannot_be_escaped_by_traversal() {
    let dir = TempDir::new().unwrap();
    let shared = TempDir::new().unwrap();
    fs::write(shared.path().join("ok.txt"), b"x").unwrap();
    let prefix = shared.path().canonicalize().unwrap();
    let b = SafeRootBoundary::new(dir.path(), &[prefix.clone()]).unwrap();

    assert!(b.resolve(prefix.join("ok.txt").to_str().unwrap()).is_resolved());
    let sneaky = format!("{}/../", prefix.display());
    assert!(!b.resolve(&sneaky).is_resolved());
}

// -------------------------------------------------------------------------
// (c) Encoding tricks
// -------------------------------------------------------------------------

#[test]
fn control_characters_and_nul_are_rejected() {
    let dir = TempDir::new().unwrap();
    let b = SafeRootBoundary::new(dir.path(), &[]).unwrap();
    assert_eq!(
        b.resolve("a\0b"),
        ValidationOutcome::Rejected(RejectReason::NullByte)
    );
    for c in ["a\nb", "a\rb", "\x1b[31m", "tab\there", "\u{7f}"] {
        assert_eq!(
            b.resolve(c),
            ValidationOutcome::Rejected(RejectReason::ControlCharacter),
            "{c:?}"
        );
    }
}

#[test]
fn blank_candidates_are_invalid_not_missing() {
    let dir = TempDir::new().unwrap();
    let (v, recoveries) = guarded(&dir);
    for c in ["", " ", "   "] {
        let err = v.validate_and_resolve(c).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidPath { .. }), "{c:?}");
    }
    assert_eq!(recoveries.load(Ordering::SeqCst), 0);
}

#[test]
fn duplicate_separators_are_rejected() {
    let dir = TempDir::new().unwrap();
    let b = SafeRootBoundary::new(dir.path(), &[]).unwrap();
    assert_eq!(
        b.resolve("a//b"),
        ValidationOutcome::Rejected(RejectReason::DuplicateSeparator)
    );
}

// -------------------------------------------------------------------------
// (d) Symlinks
// -------------------------------------------------------------------------

#[cfg(unix)]
#[test]
fn symlink_to_outside_is_an_escape_and_never_heals() {
    use std::os::unix::fs::symlink;

    let dir = TempDir::new().unwrap();
    let outside = TempDir::new().unwrap();
    fs::write(outside.path().join("secret"), b"s").unwrap();
    symlink(outside.path(), dir.path().join("out")).unwrap();
    symlink(outside.path().join("secret"), dir.path().join("secret-link")).unwrap();
    let (v, recoveries) = guarded(&dir);

    for c in ["out", "out/secret", "secret-link"] {
        let err = v.validate_and_resolve(c).unwrap_err();
        assert!(err.is_security(), "{c:?} -> {err:?}");
    }
    assert_eq!(recoveries.load(Ordering::SeqCst), 0);
}

#[cfg(unix)]
#[test]
fn recovery_refuses_to_build_through_outbound_link() {
    use std::os::unix::fs::symlink;

    let dir = TempDir::new().unwrap();
    let outside = TempDir::new().unwrap();
    symlink(outside.path(), dir.path().join("link")).unwrap();
    let (v, recoveries) = guarded(&dir);

    let err = v.validate_and_resolve("link/new/dir").unwrap_err();
    assert!(matches!(err, ValidationError::OutsideSafeRoot { .. }), "{err:?}");
    assert_eq!(recoveries.load(Ordering::SeqCst), 0);
    assert!(!outside.path().join("new").exists());
}

#[cfg(unix)]
#[test]
fn missing_file_behind_outbound_link_is_an_escape_not_missing() {
    use std::os::unix::fs::symlink;

    let dir = TempDir::new().unwrap();
    let outside = TempDir::new().unwrap();
    symlink(outside.path(), dir.path().join("link")).unwrap();
    let (v, recoveries) = guarded(&dir);

    for _ in 0..3 {
        let err = v.validate_and_resolve("link/new.txt").unwrap_err();
        assert!(matches!(err, ValidationError::OutsideSafeRoot { .. }), "{err:?}");
        assert!(err.is_security());
    }
    assert_eq!(recoveries.load(Ordering::SeqCst), 0);
    assert_eq!(v.recovery_attempts("link/new.txt"), 0);
    assert_eq!(fs::read_dir(outside.path()).unwrap().count(), 0);
}

#[cfg(unix)]
#[test]
fn symlink_inside_root_is_followed() {
    use std::os::unix::fs::symlink;

    let dir = TempDir::new().unwrap();
    fs::create_dir(dir.path().join("real")).unwrap();
    symlink(dir.path().join("real"), dir.path().join("alias")).unwrap();
    let b = SafeRootBoundary::new(dir.path(), &[]).unwrap();

    let root = dir.path().canonicalize().unwrap();
    assert_eq!(
        b.resolve("alias"),
        ValidationOutcome::Resolved(root.join("real"))
    );
}

// -------------------------------------------------------------------------
// (e) Error text
// -------------------------------------------------------------------------

#[test]
fn errors_do_not_leak_the_safe_root() {
    let dir = TempDir::new().unwrap();
    let (v, _) = guarded(&dir);
    let root = dir.path().canonicalize().unwrap();
    for c in ["../x", "/etc", "a//b", ""] {
        let msg = v.validate_and_resolve(c).unwrap_err().to_string();
        assert!(!msg.contains(&*root.to_string_lossy()), "{c:?}: {msg}");
    }
}
