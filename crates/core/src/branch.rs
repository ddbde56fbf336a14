//! Branch links: creating feature branches, attaching them to an upstream,
//! and keeping links intact when an upstream is renamed.

use std::sync::{Arc, LazyLock};

use regex_lite::Regex;
use tracing::{info, warn};

use crate::db::Database;
use crate::errors::{BranchError, DatabaseError, MergeError};
use crate::models::{AuditEntry, Project};
use crate::svn::{LocationResolver, NodeKind, VcsBackend};

static KEYWORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/(trunk(/|$)|branches/)").expect("keyword pattern is valid"));

// ---------------------------------------------------------------------------
// Rename hook
// ---------------------------------------------------------------------------

/// Notified after a project has been renamed.
pub trait UpstreamRenameObserver: Send + Sync {
    fn on_renamed(
        &self,
        db: &Database,
        project: &Project,
        old_name: &str,
        new_name: &str,
    ) -> Result<(), DatabaseError>;
}

/// Rewrites branch links pointing at a renamed mainline project.
#[derive(Debug, Default)]
pub struct BranchLinkRenamer;

impl UpstreamRenameObserver for BranchLinkRenamer {
    fn on_renamed(
        &self,
        db: &Database,
        project: &Project,
        old_name: &str,
        new_name: &str,
    ) -> Result<(), DatabaseError> {
        if !project.integratable {
            return Ok(());
        }
        for link in db.list_branch_links_for(old_name)? {
            db.set_branch_link(&link.project_id, new_name)?;
            info!(branch = %link.project_id, old_name, new_name, "rewrote branch link");
        }
        Ok(())
    }
}

/// Observers wired at startup.
#[derive(Clone, Default)]
pub struct RenameObservers {
    observers: Vec<Arc<dyn UpstreamRenameObserver>>,
}

impl RenameObservers {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the branch link renamer.
    pub fn with_defaults() -> Self {
        let mut observers = Self::new();
        observers.register(Arc::new(BranchLinkRenamer));
        observers
    }

    pub fn register(&mut self, observer: Arc<dyn UpstreamRenameObserver>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Call every observer. A failing observer does not stop the others.
    pub fn notify(&self, db: &Database, project: &Project, old_name: &str, new_name: &str) {
        for observer in &self.observers {
            if let Err(e) = observer.on_renamed(db, project, old_name, new_name) {
                warn!(error = %e, old_name, new_name, "rename observer failed");
            }
        }
    }
}

/// Rename a project and notify the observers.
pub fn rename_project(
    db: &Database,
    observers: &RenameObservers,
    old_name: &str,
    new_name: &str,
) -> Result<Project, BranchError> {
    let new_name = new_name.trim();
    if new_name.is_empty() {
        return Err(BranchError::NameRequired);
    }
    let mut project = db
        .get_project_by_name(old_name)?
        .ok_or_else(|| BranchError::ProjectNotFound(old_name.to_string()))?;
    if old_name == new_name {
        return Ok(project);
    }
    if db.get_project_by_name(new_name)?.is_some() {
        return Err(BranchError::ProjectExists(new_name.to_string()));
    }

    db.rename_project(&project.id, new_name)?;
    project.name = new_name.to_string();
    observers.notify(db, &project, old_name, new_name);
    db.insert_audit_entry(
        &AuditEntry::success("project_renamed", &format!("{} -> {}", old_name, new_name))
            .for_project(&project.id),
    )?;
    Ok(project)
}

// ---------------------------------------------------------------------------
// Link resolution
// ---------------------------------------------------------------------------

/// The upstream project of `branch`, looked up by name on every call.
pub fn resolve_upstream(db: &Database, branch: &Project) -> Result<Project, MergeError> {
    let link = db
        .get_branch_link(&branch.id)?
        .ok_or_else(|| MergeError::NotABranch(branch.name.clone()))?;
    db.get_project_by_name(&link.upstream)?
        .ok_or_else(|| MergeError::UpstreamUnresolved {
            project: branch.name.clone(),
            upstream: link.upstream,
        })
}

/// Feature branch projects attached to `upstream`.
pub fn branches(db: &Database, upstream: &Project) -> Result<Vec<Project>, DatabaseError> {
    let mut projects = Vec::new();
    for link in db.list_branch_links_for(&upstream.name)? {
        if let Some(p) = db.get_project(&link.project_id)? {
            projects.push(p);
        }
    }
    projects.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(projects)
}

/// Attach an existing project to `upstream_name`.
pub fn attach(db: &Database, branch_name: &str, upstream_name: &str) -> Result<(), BranchError> {
    let branch = db
        .get_project_by_name(branch_name)?
        .ok_or_else(|| BranchError::ProjectNotFound(branch_name.to_string()))?;
    let upstream = db
        .get_project_by_name(upstream_name)?
        .ok_or_else(|| BranchError::ProjectNotFound(upstream_name.to_string()))?;
    if !upstream.integratable {
        return Err(BranchError::NotIntegratable(upstream.name));
    }
    db.set_branch_link(&branch.id, &upstream.name)?;
    db.insert_audit_entry(
        &AuditEntry::success("branch_attached", &format!("{} -> {}", branch.name, upstream.name))
            .for_project(&branch.id),
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Branch creation
// ---------------------------------------------------------------------------

/// Replace the `/trunk` or `/branches/...` segment of `location` with
/// `/branches/<name>`.
pub fn branch_location(location: &str, name: &str) -> Result<String, BranchError> {
    let m = KEYWORD
        .find(location)
        .ok_or_else(|| BranchError::CannotInferBranchUrl(location.to_string()))?;
    Ok(format!("{}/branches/{}", &location[..m.start()], name))
}

/// Name of the project registered for branch `name` of `upstream`.
pub fn branch_project_name(upstream: &str, name: &str) -> String {
    format!("{}-{}", upstream, name.replace('/', "-"))
}

/// Input of [`new_branch`].
#[derive(Debug, Clone)]
pub struct NewBranch<'a> {
    pub name: &'a str,
    /// Register the project for a branch that already exists.
    pub attach: bool,
    pub commit_message: Option<&'a str>,
    pub default_message: &'a str,
    pub auto_integrate: bool,
}

/// Create a feature branch of `upstream` and register its project.
pub async fn new_branch<B: VcsBackend + ?Sized>(
    db: &Database,
    backend: &B,
    resolver: &LocationResolver,
    upstream: &Project,
    request: &NewBranch<'_>,
) -> Result<Project, BranchError> {
    let name = request.name.trim();
    if name.is_empty() {
        return Err(BranchError::NameRequired);
    }
    if !upstream.integratable {
        return Err(BranchError::NotIntegratable(upstream.name.clone()));
    }
    let message = request
        .commit_message
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .unwrap_or(request.default_message);

    let project_name = branch_project_name(&upstream.name, name);
    if db.get_project_by_name(&project_name)?.is_some() {
        return Err(BranchError::ProjectExists(project_name));
    }

    let location = branch_location(&upstream.location, name)?;

    if !request.attach {
        let source = resolver
            .resolve(upstream)
            .ok_or_else(|| BranchError::CannotInferBranchUrl(upstream.location.clone()))?;
        let destination = branch_location(&source, name)?;

        if let Some(existing) = backend.exists(&destination).await? {
            return Err(match existing.kind {
                NodeKind::Dir => BranchError::AlreadyExistsAttach(destination),
                _ => BranchError::AlreadyExists(existing.url),
            });
        }
        let rev = backend.copy(&source, &destination, message).await?;
        info!(%source, %destination, rev, "created feature branch");
    }

    let mut project = Project::new(&project_name, &location);
    project.parameters = upstream.parameters.clone();
    project.auto_integrate = request.auto_integrate;
    db.insert_project(&project)?;
    db.set_branch_link(&project.id, &upstream.name)?;
    db.insert_audit_entry(
        &AuditEntry::success(
            "branch_created",
            &format!("{} from {} at {}", project.name, upstream.name, location),
        )
        .for_project(&project.id),
    )?;
    Ok(project)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    #[test]
    fn test_branch_location() {
        assert_eq!(
            branch_location("file:///r/trunk", "f1").unwrap(),
            "file:///r/branches/f1"
        );
        assert_eq!(
            branch_location("https://svn/p/trunk/module", "f1").unwrap(),
            "https://svn/p/branches/f1"
        );
        assert_eq!(
            branch_location("https://svn/p/branches/old/x", "f2").unwrap(),
            "https://svn/p/branches/f2"
        );
        assert!(matches!(
            branch_location("https://svn/p/trunkish", "f1"),
            Err(BranchError::CannotInferBranchUrl(_))
        ));
        assert_eq!(branch_project_name("trunk", "team/f1"), "trunk-team-f1");
    }

    #[test]
    fn test_rename_rewrites_links_of_integratable_upstream() {
        let db = db();
        let trunk = Project::new("trunk", "file:///r/trunk").integratable();
        let branch = Project::new("b1", "file:///r/branches/b1");
        db.insert_project(&trunk).unwrap();
        db.insert_project(&branch).unwrap();
        db.set_branch_link(&branch.id, "trunk").unwrap();

        let observers = RenameObservers::with_defaults();
        rename_project(&db, &observers, "trunk", "somethingElse").unwrap();

        assert_eq!(db.get_branch_link(&branch.id).unwrap().unwrap().upstream, "somethingElse");
        assert_eq!(resolve_upstream(&db, &branch).unwrap().id, trunk.id);
    }

    #[test]
    fn test_rename_of_plain_project_leaves_links_alone() {
        let db = db();
        let plain = Project::new("tools", "file:///r/tools/trunk");
        let branch = Project::new("b1", "file:///r/branches/b1");
        db.insert_project(&plain).unwrap();
        db.insert_project(&branch).unwrap();
        db.set_branch_link(&branch.id, "tools").unwrap();

        rename_project(&db, &RenameObservers::with_defaults(), "tools", "tools2").unwrap();
        assert_eq!(db.get_branch_link(&branch.id).unwrap().unwrap().upstream, "tools");
        assert!(matches!(
            resolve_upstream(&db, &branch),
            Err(MergeError::UpstreamUnresolved { .. })
        ));
    }

    #[test]
    fn test_rename_conflicts() {
        let db = db();
        db.insert_project(&Project::new("a", "file:///r/a/trunk")).unwrap();
        db.insert_project(&Project::new("b", "file:///r/b/trunk")).unwrap();
        let observers = RenameObservers::new();
        assert!(matches!(
            rename_project(&db, &observers, "a", "b"),
            Err(BranchError::ProjectExists(_))
        ));
        assert!(matches!(
            rename_project(&db, &observers, "nope", "c"),
            Err(BranchError::ProjectNotFound(_))
        ));
        assert!(matches!(
            rename_project(&db, &observers, "a", "  "),
            Err(BranchError::NameRequired)
        ));
    }

    #[test]
    fn test_attach_and_list_branches() {
        let db = db();
        let trunk = Project::new("trunk", "file:///r/trunk").integratable();
        db.insert_project(&trunk).unwrap();
        db.insert_project(&Project::new("b2", "file:///r/branches/b2")).unwrap();
        db.insert_project(&Project::new("b1", "file:///r/branches/b1")).unwrap();
        attach(&db, "b2", "trunk").unwrap();
        attach(&db, "b1", "trunk").unwrap();

        let names: Vec<String> = branches(&db, &trunk).unwrap().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["b1", "b2"]);
        assert!(matches!(
            attach(&db, "b1", "b2"),
            Err(BranchError::NotIntegratable(_))
        ));
    }

    #[test]
    fn test_unattached_project_is_not_a_branch() {
        let db = db();
        let p = Project::new("solo", "file:///r/solo/trunk");
        db.insert_project(&p).unwrap();
        assert!(matches!(resolve_upstream(&db, &p), Err(MergeError::NotABranch(_))));
    }
}
