//! Inspection of a repository location to propose where a new feature branch
//! (and its dev tag) should live.

use std::sync::LazyLock;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

static TRUNK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/trunk/?([\w|_-]*)").expect("trunk pattern is valid"));
static BRANCHES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/branches/\w+/?([\w|_-]*)").expect("branches pattern is valid")
});

/// Placeholder substituted with the branch name by the caller.
pub const NEW_BRANCH_PLACEHOLDER: &str = "<new_branch_name>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepositoryLayout {
    /// One project per trunk/branches/tags triple.
    Single,
    /// Closely related projects sharing one trunk/branches/tags triple.
    Multi,
    /// Anything not following the trunk/branches/tags convention.
    Custom,
}

impl std::fmt::Display for RepositoryLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single => write!(f, "single project layout"),
            Self::Multi => write!(f, "multi project layout"),
            Self::Custom => write!(f, "custom layout"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryLayoutInfo {
    pub layout: RepositoryLayout,
    /// The inspected location without its trailing `/`.
    pub location: String,
    pub sub_project: Option<String>,
    pub default_new_branch_url: String,
    pub default_new_dev_tag_url: String,
}

impl RepositoryLayoutInfo {
    pub fn new(location: &str) -> Self {
        let trimmed = location.trim();
        let location = trimmed.strip_suffix('/').unwrap_or(trimmed).to_string();

        let captures = TRUNK
            .captures(&location)
            .or_else(|| BRANCHES.captures(&location));

        let mut branch_url = String::new();
        let mut group = String::new();
        let matched = match captures {
            Some(caps) => {
                let whole = caps.get(0).map(|m| m.start()).unwrap_or(0);
                branch_url.push_str(&location[..whole]);
                group = caps
                    .get(1)
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default();
                true
            }
            None => false,
        };

        branch_url.push_str("/branches/");
        branch_url.push_str(NEW_BRANCH_PLACEHOLDER);
        branch_url.push('/');
        if !group.is_empty() {
            branch_url.push_str(&group);
            branch_url.push('/');
        }
        let dev_tag_url = branch_url.replace("/branches/", "/tags/dev/");

        let (layout, sub_project) = if !matched {
            (RepositoryLayout::Custom, None)
        } else if group.is_empty() {
            (RepositoryLayout::Single, None)
        } else if location.ends_with(&group) {
            (RepositoryLayout::Multi, Some(group))
        } else {
            (RepositoryLayout::Custom, None)
        };

        Self {
            layout,
            location,
            sub_project,
            default_new_branch_url: branch_url,
            default_new_dev_tag_url: dev_tag_url,
        }
    }

    /// The default branch URL with the placeholder replaced by `name`.
    pub fn branch_url_for(&self, name: &str) -> String {
        self.default_new_branch_url
            .replace(NEW_BRANCH_PLACEHOLDER, name)
            .trim_end_matches('/')
            .to_string()
    }
}
