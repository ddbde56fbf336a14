//! Provenance fingerprints linking integration commits to the branch builds
//! that produced them.
//!
//! The key is `sha256(head + "#" + revision)` where `head` is the first line
//! of the integration commit message. Both sides can compute it: the branch
//! right after committing, the mainline when reading its own change log.

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::db::Database;
use crate::envelope;
use crate::errors::DatabaseError;
use crate::models::{BuildRef, Fingerprint, IntegrationRecord};
use crate::svn::SvnLogEntry;

/// Key-value store of fingerprints and the builds participating in them.
pub trait FingerprintIndex {
    /// Register `original` as the producer of `key`. Idempotent.
    fn get_or_create(&self, key: &str, original: &BuildRef) -> Result<Fingerprint, DatabaseError>;

    fn get(&self, key: &str) -> Result<Option<Fingerprint>, DatabaseError>;

    /// Register `usage` as a consumer of an existing fingerprint.
    fn add_usage(&self, key: &str, usage: &BuildRef) -> Result<(), DatabaseError>;
}

impl FingerprintIndex for Database {
    fn get_or_create(&self, key: &str, original: &BuildRef) -> Result<Fingerprint, DatabaseError> {
        self.fingerprint_get_or_create(key, original)
    }

    fn get(&self, key: &str) -> Result<Option<Fingerprint>, DatabaseError> {
        self.get_fingerprint(key)
    }

    fn add_usage(&self, key: &str, usage: &BuildRef) -> Result<(), DatabaseError> {
        self.add_fingerprint_usage(key, usage)
    }
}

pub fn fingerprint_key(head: &str, revision: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(head.as_bytes());
    hasher.update(b"#");
    hasher.update(revision.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Record the fingerprint of a successful integration. Nothing is recorded
/// for no-ops and conflicts.
pub fn record_fingerprint<I: FingerprintIndex + ?Sized>(
    index: &I,
    branch_build: &BuildRef,
    head: &str,
    merge_commit: i64,
) -> Result<Option<Fingerprint>, DatabaseError> {
    if merge_commit <= 0 {
        return Ok(None);
    }
    let key = fingerprint_key(head, merge_commit);
    let fingerprint = index.get_or_create(&key, branch_build)?;
    debug!(%key, build = %branch_build, merge_commit, "recorded integration fingerprint");
    Ok(Some(fingerprint))
}

/// The fingerprint behind a mainline log entry, if the entry is an
/// integration commit whose producer was recorded.
pub fn find_integration_fingerprint<I: FingerprintIndex + ?Sized>(
    index: &I,
    entry: &SvnLogEntry,
) -> Result<Option<Fingerprint>, DatabaseError> {
    let Some(head) = envelope::parse_integration_head(&entry.message) else {
        return Ok(None);
    };
    index.get(&fingerprint_key(head, entry.revision))
}

/// The branch build that produced a mainline log entry.
pub fn annotate<I: FingerprintIndex + ?Sized>(
    index: &I,
    entry: &SvnLogEntry,
) -> Result<Option<BuildRef>, DatabaseError> {
    Ok(find_integration_fingerprint(index, entry)?.map(|fp| fp.original))
}

/// Register `mainline_build` as a consumer of every integration found in
/// its change log. Returns how many fingerprints were touched.
pub fn register_mainline_build<I: FingerprintIndex + ?Sized>(
    index: &I,
    mainline_build: &BuildRef,
    change_log: &[SvnLogEntry],
) -> Result<usize, DatabaseError> {
    let mut registered = 0;
    for entry in change_log {
        if let Some(fp) = find_integration_fingerprint(index, entry)? {
            index.add_usage(&fp.key, mainline_build)?;
            registered += 1;
        }
    }
    if registered > 0 {
        debug!(build = %mainline_build, registered, "mainline build absorbed integrations");
    }
    Ok(registered)
}

/// The first mainline build containing the integration described by
/// `record`, or -1 when unknown.
///
/// When `upstream_project_id` is `None` the earliest usage outside the
/// branch itself is taken. Lookup failures are logged and read as unknown
/// since fingerprints can be pruned at any time.
pub fn upstream_build_number<I: FingerprintIndex + ?Sized>(
    index: &I,
    record: &IntegrationRecord,
    upstream_project_id: Option<&str>,
) -> i64 {
    if record.merge_commit <= 0 {
        return -1;
    }
    let key = fingerprint_key(&record.message, record.merge_commit);
    let fingerprint = match index.get(&key) {
        Ok(Some(fp)) => fp,
        Ok(None) => return -1,
        Err(e) => {
            warn!(error = %e, %key, "fingerprint lookup failed");
            return -1;
        }
    };

    let numbers = match upstream_project_id {
        Some(id) => fingerprint.usages_of(id),
        None => {
            let mut other: Vec<i64> = fingerprint
                .usages
                .iter()
                .filter(|u| u.project_id != record.project_id)
                .map(|u| u.number)
                .collect();
            other.sort_unstable();
            other
        }
    };
    numbers.first().copied().unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn entry(revision: i64, message: &str) -> SvnLogEntry {
        SvnLogEntry {
            revision,
            author: "builder".into(),
            date: String::new(),
            message: message.into(),
            changed_paths: Vec::new(),
        }
    }

    fn record(head: &str, merge_commit: i64) -> IntegrationRecord {
        IntegrationRecord {
            id: 1,
            project_id: "branch".into(),
            build_number: 7,
            message: head.into(),
            merge_commit,
            integration_source: 42,
            back_merge: None,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_key_is_stable_and_revision_sensitive() {
        let a = fingerprint_key("Integrated b1 #7 (from Jenkins)", 101);
        assert_eq!(a, fingerprint_key("Integrated b1 #7 (from Jenkins)", 101));
        assert_ne!(a, fingerprint_key("Integrated b1 #7 (from Jenkins)", 102));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_round_trip_from_mainline_log() {
        let db = db();
        let head = envelope::integration_head("b1 #7");
        let branch_build = BuildRef::new("branch", 7);
        let created = record_fingerprint(&db, &branch_build, &head, 101)
            .unwrap()
            .unwrap();

        let msg = envelope::integration_message(&head, "file:///r/branches/b1", 42);
        let found = find_integration_fingerprint(&db, &entry(101, &msg))
            .unwrap()
            .unwrap();
        assert_eq!(found.key, created.key);
        assert_eq!(annotate(&db, &entry(101, &msg)).unwrap(), Some(branch_build));
        assert!(annotate(&db, &entry(100, &msg)).unwrap().is_none());
        assert!(annotate(&db, &entry(101, "manual fix")).unwrap().is_none());
    }

    #[test]
    fn test_noop_and_conflict_are_not_recorded() {
        let db = db();
        let build = BuildRef::new("branch", 1);
        assert!(record_fingerprint(&db, &build, "Integrated b1 #1 (from Jenkins)", 0)
            .unwrap()
            .is_none());
        assert!(record_fingerprint(&db, &build, "Integrated b1 #1 (from Jenkins)", -1)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_upstream_build_number_uses_earliest_mainline_build() {
        let db = db();
        let head = envelope::integration_head("b1 #7");
        record_fingerprint(&db, &BuildRef::new("branch", 7), &head, 101).unwrap();
        let rec = record(&head, 101);
        assert_eq!(upstream_build_number(&db, &rec, Some("trunk")), -1);

        let log = vec![
            entry(100, "unrelated"),
            entry(101, &envelope::integration_message(&head, "file:///r/branches/b1", 42)),
        ];
        assert_eq!(register_mainline_build(&db, &BuildRef::new("trunk", 12), &log).unwrap(), 1);
        register_mainline_build(&db, &BuildRef::new("trunk", 11), &log).unwrap();
        assert_eq!(upstream_build_number(&db, &rec, Some("trunk")), 11);
        assert_eq!(upstream_build_number(&db, &rec, None), 11);
    }

    #[test]
    fn test_pruned_fingerprint_reads_unknown() {
        let db = db();
        let head = envelope::integration_head("b1 #7");
        record_fingerprint(&db, &BuildRef::new("branch", 7), &head, 101).unwrap();
        db.prune_fingerprints(Utc::now() + chrono::Duration::seconds(5))
            .unwrap();
        assert_eq!(upstream_build_number(&db, &record(&head, 101), Some("trunk")), -1);
        assert_eq!(upstream_build_number(&db, &record(&head, 0), Some("trunk")), -1);
    }
}
