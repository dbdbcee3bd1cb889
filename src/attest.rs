use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

pub const STATEMENT_TYPE: &str = "https://in-toto.io/Statement/v1";
pub const SLSA_PREDICATE_TYPE: &str = "https://slsa.dev/provenance/v1";
pub const DEFAULT_BUILD_TYPE: &str = "rootguard/generic-build/v1";

/// An in-toto subject: artifact name plus `algorithm -> hex digest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub name: String,
    pub digest: BTreeMap<String, String>,
}

impl Subject {
    pub fn sha256(name: impl Into<String>, hex_digest: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            digest: BTreeMap::from([("sha256".to_string(), hex_digest.into())]),
        }
    }
}

/// Who built the subjects and when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuilderInfo {
    pub id: String,
    pub version: BTreeMap<String, String>,
    pub invocation_id: String,
    pub started_on: OffsetDateTime,
    pub finished_on: OffsetDateTime,
}

impl BuilderInfo {
    /// Builder whose run starts and ends now. The invocation id is derived
    /// from the builder id and start time.
    pub fn now(id: impl Into<String>) -> Self {
        let id = id.into();
        let started_on = OffsetDateTime::now_utc();
        let invocation_id = format!("{id}@{}", started_on.unix_timestamp_nanos());
        Self {
            version: BTreeMap::from([(
                "rootguard".to_string(),
                env!("CARGO_PKG_VERSION").to_string(),
            )]),
            id,
            invocation_id,
            started_on,
            finished_on: started_on,
        }
    }
}

/// in-toto Statement v1 carrying a SLSA v1 provenance predicate.
pub fn make_provenance_statement(
    subjects: &[Subject],
    builder: &BuilderInfo,
    build_type: &str,
    external_parameters: &Value,
) -> Result<Value> {
    if subjects.is_empty() {
        return Err(anyhow!("provenance statement needs at least one subject"));
    }
    if builder.id.trim().is_empty() {
        return Err(anyhow!("builder id must not be empty"));
    }
    let started = builder.started_on.format(&Rfc3339)?;
    let finished = builder.finished_on.format(&Rfc3339)?;

    Ok(json!({
        "_type": STATEMENT_TYPE,
        "subject": subjects,
        "predicateType": SLSA_PREDICATE_TYPE,
        "predicate": {
            "buildDefinition": {
                "buildType": build_type,
                "externalParameters": external_parameters,
                "internalParameters": {},
                "resolvedDependencies": []
            },
            "runDetails": {
                "builder": {
                    "id": builder.id,
                    "version": builder.version
                },
                "metadata": {
                    "invocationId": builder.invocation_id,
                    "startedOn": started,
                    "finishedOn": finished
                }
            }
        }
    }))
}
