//! Expansion of parameterized project locations such as
//! `https://${ROOT_SVN_URL}${REPO}/trunk`.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex_lite::{Captures, Regex};
use tracing::debug;

use crate::models::Project;

static VARIABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_.]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .expect("variable pattern is valid")
});

const SVN_SCHEMES: [&str; 5] = ["file://", "http://", "https://", "svn://", "svn+ssh://"];

/// Replace every `${NAME}` / `$NAME` reference for which `lookup` returns a
/// value. Unknown references are left in place.
pub fn expand_variables<F>(text: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    VARIABLE
        .replace_all(text, |caps: &Captures<'_>| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            lookup(name).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// True when `text` still contains a variable reference.
pub fn has_unresolved(text: &str) -> bool {
    VARIABLE.is_match(text)
}

pub fn is_svn_url(text: &str) -> bool {
    SVN_SCHEMES.iter().any(|scheme| text.starts_with(scheme))
}

/// Resolves project locations against the process environment, the
/// `[environment]` config table and the project's own parameters, in that
/// order of precedence.
#[derive(Debug, Clone, Default)]
pub struct LocationResolver {
    environment: BTreeMap<String, String>,
    use_process_env: bool,
}

impl LocationResolver {
    pub fn new(environment: BTreeMap<String, String>) -> Self {
        Self {
            environment,
            use_process_env: true,
        }
    }

    /// A resolver that ignores the process environment.
    pub fn isolated(environment: BTreeMap<String, String>) -> Self {
        Self {
            environment,
            use_process_env: false,
        }
    }

    /// Expand `location` for `project`. Returns `None` when a reference stays
    /// unresolved or the result is not an svn URL.
    pub fn resolve_location(&self, location: &str, project: &Project) -> Option<String> {
        let expanded = expand_variables(location, |name| {
            if self.use_process_env {
                if let Ok(value) = std::env::var(name) {
                    return Some(value);
                }
            }
            self.environment
                .get(name)
                .or_else(|| project.parameters.get(name))
                .cloned()
        });

        if has_unresolved(&expanded) {
            debug!(location, %expanded, "location has unresolved variables");
            return None;
        }
        if !is_svn_url(&expanded) {
            debug!(location, %expanded, "location is not an svn URL");
            return None;
        }
        Some(expanded)
    }

    /// Expand the project's own location.
    pub fn resolve(&self, project: &Project) -> Option<String> {
        self.resolve_location(&project.location, project)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(location: &str) -> Project {
        let mut p = Project::new("b", location);
        p.parameters.insert("REPO".into(), "a".into());
        p.parameters.insert("PROJECT".into(), "b".into());
        p
    }

    #[test]
    fn test_expand_from_environment_table_and_parameters() {
        let mut env = BTreeMap::new();
        env.insert("ROOT_SVN_URL".to_string(), "root/".to_string());
        let resolver = LocationResolver::isolated(env);
        let p = project("https://${ROOT_SVN_URL}${REPO}/${PROJECT}/trunk");
        assert_eq!(resolver.resolve(&p).as_deref(), Some("https://root/a/b/trunk"));
    }

    #[test]
    fn test_environment_table_wins_over_parameters() {
        let mut env = BTreeMap::new();
        env.insert("REPO".to_string(), "from-node".to_string());
        let resolver = LocationResolver::isolated(env);
        let p = project("file:///svn/$REPO/trunk");
        assert_eq!(
            resolver.resolve(&p).as_deref(),
            Some("file:///svn/from-node/trunk")
        );
    }

    #[test]
    fn test_process_environment_is_consulted_first() {
        std::env::set_var("SVNMERGE_LOCATION_TEST_HOST", "svn.example.com");
        let mut env = BTreeMap::new();
        env.insert("SVNMERGE_LOCATION_TEST_HOST".to_string(), "ignored".to_string());
        let resolver = LocationResolver::new(env);
        let p = project("svn://${SVNMERGE_LOCATION_TEST_HOST}/repo/trunk");
        assert_eq!(
            resolver.resolve(&p).as_deref(),
            Some("svn://svn.example.com/repo/trunk")
        );
        std::env::remove_var("SVNMERGE_LOCATION_TEST_HOST");
    }

    #[test]
    fn test_unresolved_reference_yields_none() {
        let resolver = LocationResolver::isolated(BTreeMap::new());
        assert!(resolver.resolve(&project("https://${NOPE}/trunk")).is_none());
    }

    #[test]
    fn test_non_svn_location_yields_none() {
        let resolver = LocationResolver::isolated(BTreeMap::new());
        assert!(resolver.resolve(&project("/local/path/trunk")).is_none());
        assert!(resolver.resolve(&project("file:///r/trunk")).is_some());
    }

    #[test]
    fn test_expand_leaves_unknown_references() {
        let out = expand_variables("${A}-$B-${C}", |name| (name == "A").then(|| "x".to_string()));
        assert_eq!(out, "x-$B-${C}");
    }
}
