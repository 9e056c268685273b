//! Ordered, pure upgrades of older state documents.

use serde_json::{Map, Value, json};

use crate::{CURRENT_STATE_VERSION, SurfError, SurfResult};

/// Lease stamped onto ephemeral sessions that predate per-session leases.
pub const LEGACY_DEFAULT_LEASE_TTL_MS: u64 = 6 * 60 * 60 * 1000;

type MigrationFn = fn(&Value) -> SurfResult<Value>;

/// `(from_version, step)`; each step produces `from_version + 1`.
const MIGRATIONS: &[(u32, MigrationFn)] = &[(1, migrate_v1_to_v2), (2, migrate_v2_to_v3)];

/// Documents without a `version` are treated as version 1.
pub fn document_version(doc: &Value) -> SurfResult<u32> {
    match doc.get("version") {
        None | Some(Value::Null) => Ok(1),
        Some(v) => v
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| SurfError::StateVersionMismatch(format!("state version {v} is not an integer"))),
    }
}

pub fn migrate_state_value(doc: &Value) -> SurfResult<Value> {
    let from = document_version(doc)?;
    if from > CURRENT_STATE_VERSION {
        return Err(SurfError::StateVersionMismatch(format!(
            "state version {from} is newer than supported version {CURRENT_STATE_VERSION}"
        )));
    }

    let mut version = from;
    let mut current = doc.clone();
    while version < CURRENT_STATE_VERSION {
        let step = MIGRATIONS
            .iter()
            .find(|(v, _)| *v == version)
            .map(|(_, f)| *f)
            .ok_or_else(|| {
                SurfError::StateVersionMismatch(format!("no migration from state version {version}"))
            })?;
        current = step(&current)?;
        version += 1;
        object_mut(&mut current)?.insert("version".to_string(), json!(version));
    }
    if from != CURRENT_STATE_VERSION {
        tracing::debug!(from, to = CURRENT_STATE_VERSION, "migrated state document");
    }
    Ok(current)
}

/// v1 had no per-session policy/lease and no network bookkeeping.
fn migrate_v1_to_v2(doc: &Value) -> SurfResult<Value> {
    let mut next = doc.clone();
    let root = object_mut(&mut next)?;

    if let Some(Value::Object(sessions)) = root.get_mut("sessions") {
        for session in sessions.values_mut() {
            let Some(s) = session.as_object_mut() else {
                continue;
            };
            let managed = s.get("kind").and_then(Value::as_str) != Some("attached");
            if !s.contains_key("policy") {
                let policy = if managed { "ephemeral" } else { "persistent" };
                s.insert("policy".to_string(), json!(policy));
            }
            if !s.contains_key("leaseTtlMs") {
                let ttl = if s.get("policy").and_then(Value::as_str) == Some("ephemeral") {
                    json!(LEGACY_DEFAULT_LEASE_TTL_MS)
                } else {
                    Value::Null
                };
                s.insert("leaseTtlMs".to_string(), ttl);
            }
            s.entry("profile").or_insert(Value::Null);
        }
    }

    root.entry("networkCaptures").or_insert_with(|| json!({}));
    root.entry("networkArtifacts").or_insert_with(|| json!({}));
    root.entry("nextCaptureOrdinal").or_insert(json!(1));
    root.entry("nextArtifactOrdinal").or_insert(json!(1));
    Ok(next)
}

/// v3 added unreachable tracking and normalized session policies and target timestamps.
fn migrate_v2_to_v3(doc: &Value) -> SurfResult<Value> {
    let mut next = doc.clone();
    let root = object_mut(&mut next)?;

    let mut last_seen_by_session = Map::new();
    if let Some(Value::Object(sessions)) = root.get_mut("sessions") {
        for (id, session) in sessions.iter_mut() {
            let Some(s) = session.as_object_mut() else {
                continue;
            };
            s.entry("managedUnreachableSince").or_insert(Value::Null);
            s.entry("managedUnreachableCount").or_insert(json!(0));

            let managed = s.get("kind").and_then(Value::as_str) != Some("attached");
            let policy = s
                .get("policy")
                .and_then(Value::as_str)
                .map(str::to_ascii_lowercase)
                .filter(|p| p == "ephemeral" || p == "persistent")
                .unwrap_or_else(|| if managed { "ephemeral" } else { "persistent" }.to_string());
            s.insert("policy".to_string(), json!(policy));

            if s.get("leaseTtlMs").is_some_and(|v| v.as_u64().is_none_or(|n| n == 0)) {
                s.insert("leaseTtlMs".to_string(), Value::Null);
            }
            if let Some(seen) = s.get("lastSeenAt").cloned() {
                last_seen_by_session.insert(id.clone(), seen);
            }
        }
    }

    if let Some(Value::Object(targets)) = root.get_mut("targets") {
        for target in targets.values_mut() {
            let Some(t) = target.as_object_mut() else {
                continue;
            };
            if !t.get("updatedAt").is_some_and(Value::is_string) {
                let fallback = t
                    .get("sessionId")
                    .and_then(Value::as_str)
                    .and_then(|sid| last_seen_by_session.get(sid))
                    .cloned()
                    .unwrap_or_else(|| json!("1970-01-01T00:00:00Z"));
                t.insert("updatedAt".to_string(), fallback);
            }
        }
    }
    Ok(next)
}

fn object_mut(doc: &mut Value) -> SurfResult<&mut Map<String, Value>> {
    doc.as_object_mut()
        .ok_or_else(|| SurfError::StateVersionMismatch("state document is not a JSON object".to_string()))
}
