use sha2::{Digest, Sha256};

use crate::error::{Result, SdlError};
use crate::ids::{RepoId, VersionId};
use crate::storage::{now_unix_ms, SnapshotRow, Storage, VersionRecord};

/// Deterministic hash over a snapshot set: parent hash concatenated with the
/// `|`-joined fingerprints in byte-order of symbol id. Two versions are
/// hash-equal iff their fingerprint sets match and their parent hashes match.
pub fn compute_version_hash(prev_hash: Option<&str>, snapshots: &[SnapshotRow]) -> String {
    let mut sorted: Vec<&SnapshotRow> = snapshots.iter().collect();
    sorted.sort_by(|a, b| a.symbol_id.as_bytes().cmp(b.symbol_id.as_bytes()));

    let mut hasher = Sha256::new();
    hasher.update(prev_hash.unwrap_or("").as_bytes());
    hasher.update([0u8]);
    let mut first = true;
    for s in sorted {
        if !first {
            hasher.update(b"|");
        }
        hasher.update(s.ast_fingerprint.as_bytes());
        first = false;
    }
    let out = hasher.finalize();
    let mut hex = String::with_capacity(64);
    for b in out {
        hex.push_str(&format!("{b:02x}"));
    }
    hex
}

fn joined_fingerprints(snapshots: &[SnapshotRow]) -> String {
    let mut sorted: Vec<&SnapshotRow> = snapshots.iter().collect();
    sorted.sort_by(|a, b| a.symbol_id.as_bytes().cmp(b.symbol_id.as_bytes()));
    sorted
        .iter()
        .map(|s| format!("{}={}", s.symbol_id, s.ast_fingerprint))
        .collect::<Vec<_>>()
        .join("|")
}

/// Finalize one version: allocate `<repoId>-v<millis>`, snapshot every live
/// symbol, chain to the parent hash, all in one atomic unit.
///
/// When the snapshot set is byte-identical to the parent's, the version
/// inherits the parent's hash (and parent pointer), so an unchanged tree
/// re-indexed twice reports the same `version_hash`.
pub fn finalize_version(
    storage: &Storage,
    repo: &RepoId,
    reason: Option<&str>,
    snapshots: Vec<SnapshotRow>,
) -> Result<VersionRecord> {
    let parent = storage.latest_version(repo.as_str())?;

    let (prev_hash, version_hash) = match &parent {
        Some(p) => {
            let parent_snaps: Vec<SnapshotRow> =
                storage.snapshots_for_version(&p.version_id)?.into_values().collect();
            if joined_fingerprints(&parent_snaps) == joined_fingerprints(&snapshots) {
                (p.prev_version_hash.clone(), p.version_hash.clone())
            } else {
                let h = compute_version_hash(p.version_hash.as_deref(), &snapshots);
                (p.version_hash.clone(), Some(h))
            }
        }
        None => (None, Some(compute_version_hash(None, &snapshots))),
    };

    // Millisecond ids can collide under back-to-back refreshes; walk forward.
    let mut millis = now_unix_ms();
    let version_id = loop {
        let candidate = VersionId::for_repo(repo, millis);
        if storage.get_version(candidate.as_str())?.is_none() {
            break candidate;
        }
        millis += 1;
    };

    let record = VersionRecord {
        version_id: version_id.as_str().to_string(),
        repo_id: repo.as_str().to_string(),
        created_at: millis,
        reason: reason.map(str::to_string),
        prev_version_hash: prev_hash,
        version_hash,
    };
    storage.insert_version_with_snapshots(&record, &snapshots)?;
    Ok(record)
}

/// Resolve a caller-supplied version id, accepting the bare `v<millis>` tail.
pub fn resolve_version(storage: &Storage, repo: &RepoId, raw: &str) -> Result<VersionRecord> {
    let vid = VersionId::new(raw)?;
    if let Some(rec) = storage.get_version(vid.as_str())? {
        if rec.repo_id == repo.as_str() {
            return Ok(rec);
        }
        return Err(SdlError::version_not_found(raw));
    }
    if !raw.contains('-') {
        let qualified = format!("{}-{}", repo.as_str(), raw.trim());
        if let Some(rec) = storage.get_version(&qualified)? {
            return Ok(rec);
        }
    }
    Err(SdlError::version_not_found(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(id: &str, fp: &str) -> SnapshotRow {
        SnapshotRow {
            symbol_id: id.to_string(),
            ast_fingerprint: fp.to_string(),
            signature_json: None,
            summary: None,
            invariants_json: None,
            side_effects_json: None,
        }
    }

    #[test]
    fn hash_is_order_insensitive_over_input_but_sorted_internally() {
        let a = vec![snap("b", "2"), snap("a", "1")];
        let b = vec![snap("a", "1"), snap("b", "2")];
        assert_eq!(compute_version_hash(None, &a), compute_version_hash(None, &b));
    }

    #[test]
    fn hash_chains_on_parent() {
        let snaps = vec![snap("a", "1")];
        let h0 = compute_version_hash(None, &snaps);
        let h1 = compute_version_hash(Some(h0.as_str()), &snaps);
        assert_ne!(h0, h1);
    }

    #[test]
    fn unchanged_refresh_inherits_parent_hash() {
        let storage = Storage::open_in_memory().unwrap();
        storage.register_repo("demo", "/tmp/demo", "{}").unwrap();
        let repo = RepoId::new("demo").unwrap();

        let v1 = finalize_version(&storage, &repo, Some("full"), vec![snap("a", "1")]).unwrap();
        let v2 = finalize_version(&storage, &repo, Some("noop"), vec![snap("a", "1")]).unwrap();
        assert_ne!(v1.version_id, v2.version_id);
        assert_eq!(v1.version_hash, v2.version_hash);

        let v3 = finalize_version(&storage, &repo, Some("edit"), vec![snap("a", "9")]).unwrap();
        assert_ne!(v3.version_hash, v2.version_hash);
        assert_eq!(v3.prev_version_hash, v2.version_hash);
    }

    #[test]
    fn version_ids_never_collide() {
        let storage = Storage::open_in_memory().unwrap();
        storage.register_repo("demo", "/tmp/demo", "{}").unwrap();
        let repo = RepoId::new("demo").unwrap();
        let a = finalize_version(&storage, &repo, None, vec![]).unwrap();
        let b = finalize_version(&storage, &repo, None, vec![]).unwrap();
        assert_ne!(a.version_id, b.version_id);
    }

    #[test]
    fn bare_tail_resolves_against_repo() {
        let storage = Storage::open_in_memory().unwrap();
        storage.register_repo("demo", "/tmp/demo", "{}").unwrap();
        let repo = RepoId::new("demo").unwrap();
        let v = finalize_version(&storage, &repo, None, vec![snap("a", "1")]).unwrap();
        let tail = v.version_id.rsplit('-').next().unwrap();
        let found = resolve_version(&storage, &repo, tail).unwrap();
        assert_eq!(found.version_id, v.version_id);
    }
}
