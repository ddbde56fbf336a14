//! The commit-message envelope that marks reconciliation commits.
//!
//! Integration commits read
//!
//! ```text
//! Integrated <branch build> (from Jenkins)
//! <branch URL>@<branch revision>
//! ```
//!
//! and rebase commits start with `[REBASE] `. Matching is case-sensitive and
//! anchored at the start of the message so that histories written by earlier
//! tools stay recognizable. A user commit that happens to start with one of
//! the prefixes is misclassified; that is a known limitation of the format.

pub const INTEGRATE_PREFIX: &str = "Integrated ";
pub const INTEGRATE_SUFFIX: &str = " (from Jenkins)";
pub const REBASE_PREFIX: &str = "[REBASE] ";

/// First line of an integration commit for the given branch build.
pub fn integration_head(build_display: &str) -> String {
    format!("{}{}{}", INTEGRATE_PREFIX, build_display, INTEGRATE_SUFFIX)
}

/// Full integration commit message.
pub fn integration_message(head: &str, branch_url: &str, branch_revision: i64) -> String {
    format!("{}\n{}@{}", head, branch_url, branch_revision)
}

pub fn rebase_message(upstream_url: &str) -> String {
    format!("{}Rebasing from {}", REBASE_PREFIX, upstream_url)
}

/// Message of the record-only commit that keeps mainline revision
/// `merge_commit` from being merged back into the branch.
pub fn back_merge_message(merge_commit: i64) -> String {
    format!(
        "{}Block the merge commit rev.{} from getting merged back into our branch",
        REBASE_PREFIX, merge_commit
    )
}

/// True for commits produced by a rebase, an integration or a back-merge.
pub fn is_reconciliation(message: &str) -> bool {
    message.starts_with(INTEGRATE_PREFIX) || message.starts_with(REBASE_PREFIX)
}

/// The envelope head of an integration commit message, up to and including
/// the suffix marker.
pub fn parse_integration_head(message: &str) -> Option<&str> {
    let msg = message.trim();
    if !msg.starts_with(INTEGRATE_PREFIX) {
        return None;
    }
    let with_newline = format!("{}\n", INTEGRATE_SUFFIX);
    if msg.contains(&with_newline) || msg.ends_with(INTEGRATE_SUFFIX) {
        let end = msg.find(INTEGRATE_SUFFIX)? + INTEGRATE_SUFFIX.len();
        return Some(&msg[..end]);
    }
    None
}

/// The `<branch URL>@<revision>` trailer of an integration commit message.
pub fn parse_integration_source(message: &str) -> Option<(String, i64)> {
    let head = parse_integration_head(message)?;
    let rest = message.trim()[head.len()..].trim();
    let line = rest.lines().next()?.trim();
    let (url, rev) = line.rsplit_once('@')?;
    Some((url.to_string(), rev.parse().ok()?))
}
