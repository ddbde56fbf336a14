//! Parsers for `svn` CLI output: the XML produced by `info` and `log`, and
//! the status lines printed by `merge`, `update`, `switch` and `commit`.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::SvnError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Dir,
    File,
    Unknown,
}

/// Result of `svn info` on a URL or a working copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SvnInfo {
    pub url: String,
    pub root_url: String,
    pub uuid: String,
    /// Working copy revision, or the peg revision for a URL target.
    pub revision: i64,
    /// Revision in which the node was last changed.
    pub last_changed_rev: i64,
    pub kind: NodeKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SvnLogEntry {
    pub revision: i64,
    pub author: String,
    pub date: String,
    pub message: String,
    pub changed_paths: Vec<SvnChangedPath>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SvnChangedPath {
    pub action: String,
    pub path: String,
    pub copy_from_path: Option<String>,
    pub copy_from_rev: Option<i64>,
}

/// One per-path notification printed by `svn merge`.
///
/// The three status columns mirror the CLI: text contents, properties, and
/// tree structure. `'C'` in any of them means the path is conflicted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeEvent {
    pub path: String,
    pub content: char,
    pub props: char,
    pub tree: char,
}

impl MergeEvent {
    pub fn is_conflicted(&self) -> bool {
        self.content == 'C' || self.props == 'C' || self.tree == 'C'
    }
}

pub fn parse_svn_info(xml: &str) -> Result<SvnInfo, SvnError> {
    debug!("parsing svn info XML ({} bytes)", xml.len());
    let url = extract_tag_content(xml, "url")
        .ok_or_else(|| SvnError::XmlParseError("missing <url> in svn info".into()))?;
    let root_url = extract_tag_content(xml, "root")
        .ok_or_else(|| SvnError::XmlParseError("missing <root> in svn info".into()))?;
    let uuid = extract_tag_content(xml, "uuid").unwrap_or_default();
    let revision = extract_attribute(xml, "entry", "revision")
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| SvnError::XmlParseError("missing revision in svn info".into()))?;
    let last_changed_rev = extract_attribute(xml, "commit", "revision")
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or(revision);
    let kind = match extract_attribute(xml, "entry", "kind").as_deref() {
        Some("dir") => NodeKind::Dir,
        Some("file") => NodeKind::File,
        _ => NodeKind::Unknown,
    };
    Ok(SvnInfo {
        url,
        root_url,
        uuid,
        revision,
        last_changed_rev,
        kind,
    })
}

pub fn parse_svn_log(xml: &str) -> Result<Vec<SvnLogEntry>, SvnError> {
    debug!("parsing svn log XML ({} bytes)", xml.len());
    let mut entries = Vec::new();
    for part in xml.split("<logentry").skip(1) {
        let entry_xml = match part.find("</logentry>") {
            Some(pos) => &part[..pos],
            None => part,
        };
        let revision = match extract_attr_from_str(entry_xml, "revision")
            .and_then(|s| s.parse::<i64>().ok())
        {
            Some(rev) => rev,
            None => {
                warn!("skipping svn log entry with missing or unparseable revision attribute");
                continue;
            }
        };
        entries.push(SvnLogEntry {
            revision,
            author: extract_tag_content(entry_xml, "author").unwrap_or_default(),
            date: extract_tag_content(entry_xml, "date").unwrap_or_default(),
            message: extract_tag_content(entry_xml, "msg").unwrap_or_default(),
            changed_paths: parse_changed_paths(entry_xml),
        });
    }
    debug!(count = entries.len(), "parsed svn log entries");
    Ok(entries)
}

/// Parse the per-path notifications of `svn merge`.
///
/// Header lines (`--- Merging ...`) are skipped and parsing stops at the
/// conflict summary.
pub fn parse_merge_output(output: &str) -> Vec<MergeEvent> {
    let mut events = Vec::new();
    for line in output.lines() {
        if line.starts_with("Summary of conflicts") {
            break;
        }
        if line.starts_with("---") {
            continue;
        }
        let bytes = line.as_bytes();
        if bytes.len() < 6 || bytes[4] != b' ' {
            continue;
        }
        let status = &line[..4];
        if !status.chars().all(|c| " ADUCGERM".contains(c) || c == 'B') {
            continue;
        }
        let columns: Vec<char> = status.chars().collect();
        events.push(MergeEvent {
            path: line[5..].trim_end().to_string(),
            content: columns[0],
            props: columns[1],
            tree: columns[3],
        });
    }
    events
}

/// Revision reported by `update`, `switch` or `checkout`.
pub fn parse_update_revision(output: &str) -> Option<i64> {
    const MARKERS: [&str; 3] = ["At revision ", "Updated to revision ", "Checked out revision "];
    output.lines().find_map(|line| {
        MARKERS.iter().find_map(|marker| {
            line.strip_prefix(marker)
                .and_then(|rest| rest.trim().trim_end_matches('.').parse::<i64>().ok())
        })
    })
}

/// Revision created by `commit` or `copy`, if any.
pub fn parse_committed_revision(output: &str) -> Option<i64> {
    output.lines().find_map(|line| {
        line.trim()
            .strip_prefix("Committed revision")
            .and_then(|rest| rest.trim().trim_end_matches('.').parse::<i64>().ok())
    })
}

fn extract_tag_content(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}", tag);
    let close = format!("</{}>", tag);
    let mut search_from = 0;
    while let Some(rel_pos) = xml[search_from..].find(&open) {
        let start_pos = search_from + rel_pos;
        let after_open = &xml[start_pos + open.len()..];
        // <url> must not match <urlencoded>
        if let Some(ch) = after_open.chars().next() {
            if ch != '>' && !ch.is_ascii_whitespace() {
                search_from = start_pos + open.len();
                continue;
            }
        }
        let content_start = after_open.find('>')? + 1;
        let content = &after_open[content_start..];
        let end_pos = content.find(&close)?;
        return Some(xml_unescape(content[..end_pos].trim()));
    }
    None
}

/// Unescape standard XML entities.
fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn extract_attribute(xml: &str, tag: &str, attr: &str) -> Option<String> {
    let open = format!("<{}", tag);
    let start_pos = xml.find(&open)?;
    let after_tag = &xml[start_pos + open.len()..];
    let tag_end = after_tag.find('>')?;
    extract_attr_from_str(&after_tag[..tag_end], attr)
}

fn extract_attr_from_str(s: &str, attr: &str) -> Option<String> {
    for quote in ['"', '\''] {
        let pattern = format!("{}={}", attr, quote);
        if let Some(pos) = s.find(&pattern) {
            let after = &s[pos + pattern.len()..];
            let end = after.find(quote)?;
            return Some(xml_unescape(&after[..end]));
        }
    }
    None
}

fn parse_changed_paths(entry_xml: &str) -> Vec<SvnChangedPath> {
    let Some(start) = entry_xml.find("<paths>") else {
        return Vec::new();
    };
    let rest = &entry_xml[start..];
    let Some(end) = rest.find("</paths>") else {
        return Vec::new();
    };

    rest[..end]
        .split("<path")
        .skip(1)
        .filter_map(|part| {
            let fragment = &part[..part.find("</path>")?];
            let path = match fragment.find('>') {
                Some(pos) => xml_unescape(fragment[pos + 1..].trim()),
                None => String::new(),
            };
            Some(SvnChangedPath {
                action: extract_attr_from_str(fragment, "action").unwrap_or_default(),
                path,
                copy_from_path: extract_attr_from_str(fragment, "copyfrom-path"),
                copy_from_rev: extract_attr_from_str(fragment, "copyfrom-rev")
                    .and_then(|s| s.parse::<i64>().ok()),
            })
        })
        .collect()
}
