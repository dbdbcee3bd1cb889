use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::{fs, path::PathBuf, sync::Arc};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rootguard::{
    attest::BuilderInfo,
    signing::{AttestationSigner, CosignSigner},
    snapshot::SnapshotScheduler,
    EventBus, GovernanceRecorder, GuardConfig, ProvenanceService, SelfHealingValidator,
};

#[derive(Parser)]
#[command(name = "rootguard", about = "Self-healing safe-root path validation", version)]
struct Cli {
    /// Config JSON (defaults to ./rootguard.json if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Safe root; overrides the config file
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Additional absolute prefix accepted as-is (repeatable)
    #[arg(long = "allow-prefix", global = true)]
    allow_prefix: Vec<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Write the governance audit report here after the command runs
    #[arg(long, global = true)]
    report: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Resolve paths against the safe root, healing missing structure
    Resolve {
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Print the SHA-256 digest of a file or directory tree
    Digest { path: String },

    /// Write an in-toto / SLSA provenance statement for the given paths
    Attest {
        #[arg(required = true)]
        paths: Vec<String>,

        /// Builder identity recorded in runDetails.builder.id
        #[arg(long)]
        builder_id: String,

        /// Output file (stdout if omitted)
        #[arg(long)]
        out: Option<PathBuf>,

        /// Sign the statement with cosign (requires --out)
        #[arg(long, requires = "out")]
        sign: bool,
    },

    /// Validate paths and print the governance audit report
    Audit { paths: Vec<String> },
}

struct Session {
    validator: Arc<SelfHealingValidator>,
    recorder: Arc<GovernanceRecorder>,
    config: GuardConfig,
    _snapshots: Option<SnapshotScheduler>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let session = open_session(&cli)?;
    let result = match &cli.cmd {
        Cmd::Resolve { paths } => resolve_paths(&session, paths),
        Cmd::Digest { path } => digest_path(&session, path),
        Cmd::Attest {
            paths,
            builder_id,
            out,
            sign,
        } => attest_paths(&session, paths, builder_id, out.as_ref(), *sign),
        Cmd::Audit { paths } => audit(&session, paths),
    };

    if let Some(report) = &cli.report {
        session.recorder.write_report(report)?;
        eprintln!("→ Report: {}", report.display());
    }
    result
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}

fn open_session(cli: &Cli) -> Result<Session> {
    let config_file = cli.config.clone().or_else(|| {
        let p = PathBuf::from("rootguard.json");
        p.exists().then_some(p)
    });
    let mut config = GuardConfig::load(config_file.as_deref())?;
    if let Some(root) = &cli.root {
        config.safe_root.clone_from(root);
    }
    config.allowed_prefixes.extend(cli.allow_prefix.iter().cloned());

    let bus = Arc::new(EventBus::new());
    let recorder = Arc::new(GovernanceRecorder::new(config.compliance.clone()));
    recorder.attach(&bus);
    let validator = SelfHealingValidator::from_config(&config, bus)
        .with_context(|| format!("safe root {}", config.safe_root.display()))?;

    let validator = Arc::new(validator);
    let snapshots = config
        .snapshots
        .interval()
        .map(|every| validator.start_snapshot_scheduler(every))
        .transpose()?;

    Ok(Session {
        validator,
        recorder,
        config,
        _snapshots: snapshots,
    })
}

fn resolve_paths(session: &Session, paths: &[String]) -> Result<()> {
    let mut rejected = 0usize;
    for p in paths {
        match session.validator.validate_and_resolve(p) {
            Ok(canonical) => println!("{}", canonical.display()),
            Err(e) => {
                rejected += 1;
                eprintln!("✗ {e}");
            }
        }
    }
    if rejected > 0 {
        return Err(anyhow!("{rejected} of {} path(s) rejected", paths.len()));
    }
    Ok(())
}

fn digest_path(session: &Session, path: &str) -> Result<()> {
    let svc = ProvenanceService::new(Arc::clone(&session.validator), session.config.max_file_bytes);
    let subject = svc.subject(path)?;
    let hex = subject.digest.get("sha256").map_or("", String::as_str);
    println!("sha256:{hex}  {}", subject.name);
    Ok(())
}

fn attest_paths(
    session: &Session,
    paths: &[String],
    builder_id: &str,
    out: Option<&PathBuf>,
    sign: bool,
) -> Result<()> {
    let svc = ProvenanceService::new(Arc::clone(&session.validator), session.config.max_file_bytes);
    let statement = svc.attest_paths(paths, &BuilderInfo::now(builder_id))?;
    let bytes = serde_json::to_vec_pretty(&statement)?;

    let Some(out) = out else {
        println!("{}", String::from_utf8_lossy(&bytes));
        return Ok(());
    };
    fs::write(out, &bytes).with_context(|| format!("write {}", out.display()))?;
    println!("→ Statement: {}", out.display());

    if sign {
        let bundle = out.with_extension("sigstore.bundle");
        CosignSigner::default().sign(out, &bundle)?;
        println!("→ Sigstore bundle: {}", bundle.display());
    }
    Ok(())
}

fn audit(session: &Session, paths: &[String]) -> Result<()> {
    for p in paths {
        match session.validator.validate_and_resolve(p) {
            Ok(canonical) => eprintln!("✓ {p} → {}", canonical.display()),
            Err(e) => eprintln!("✗ {e}"),
        }
    }
    let report = session.recorder.export_report()?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
