//! In-memory Subversion double used by the integration tests.
//!
//! Repository paths hold flat file trees. Working copies are real directories
//! with a `.svn` marker so the reconciler treats them as checked out. Merges
//! are three-way over the tree recorded as the common ancestor of a branch
//! and its upstream; a record-only merge moves that ancestor forward the way
//! mergeinfo does.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use svnmerge_core::branch::{self, NewBranch};
use svnmerge_core::db::Database;
use svnmerge_core::errors::SvnError;
use svnmerge_core::models::Project;
use svnmerge_core::svn::{
    LocationResolver, LogControl, LogHandler, MergeEvent, MergeEventHandler, MergeRequest,
    NodeKind, SvnInfo, SvnLogEntry, VcsBackend,
};
use svnmerge_core::Reconciler;

pub const ROOT: &str = "file:///repo";

pub fn url(path: &str) -> String {
    format!("{}/{}", ROOT, path)
}

type Tree = BTreeMap<String, String>;

#[derive(Debug, Clone)]
struct Commit {
    revision: i64,
    path: String,
    message: String,
}

#[derive(Debug)]
struct WorkingCopy {
    path: String,
    revision: i64,
    pending_base: Option<(String, Tree)>,
    mergeinfo_changed: bool,
}

#[derive(Debug, Default)]
struct Repo {
    head: i64,
    nodes: BTreeMap<String, Vec<(i64, Tree)>>,
    commits: Vec<Commit>,
    bases: HashMap<String, Tree>,
    wcs: HashMap<PathBuf, WorkingCopy>,
}

impl Repo {
    fn tree_at(&self, path: &str, revision: Option<i64>) -> Result<Tree, SvnError> {
        let rev = revision.unwrap_or(self.head);
        self.nodes
            .get(path)
            .and_then(|history| history.iter().rev().find(|(r, _)| *r <= rev))
            .map(|(_, tree)| tree.clone())
            .ok_or_else(|| not_found(path))
    }

    fn commit_tree(&mut self, path: &str, tree: Tree, message: &str) -> i64 {
        self.head += 1;
        let rev = self.head;
        self.nodes
            .entry(path.to_string())
            .or_default()
            .push((rev, tree));
        self.commits.push(Commit {
            revision: rev,
            path: path.to_string(),
            message: message.to_string(),
        });
        rev
    }

    fn wc(&mut self, wc: &Path) -> Result<&mut WorkingCopy, SvnError> {
        self.wcs
            .get_mut(wc)
            .ok_or_else(|| SvnError::WorkingCopyError {
                path: wc.display().to_string(),
                detail: "not a working copy".into(),
            })
    }
}

fn not_found(path: &str) -> SvnError {
    SvnError::CommandFailed {
        exit_code: 1,
        stderr: format!("svn: E170000: URL '{}' doesn't exist", url(path)),
    }
}

fn path_of(target: &str) -> String {
    target
        .strip_prefix(ROOT)
        .unwrap_or(target)
        .trim_matches('/')
        .to_string()
}

fn read_tree(wc: &Path) -> Result<Tree, SvnError> {
    let mut tree = Tree::new();
    for entry in std::fs::read_dir(wc)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name == ".svn" {
            continue;
        }
        tree.insert(name, std::fs::read_to_string(entry.path())?);
    }
    Ok(tree)
}

fn write_tree(wc: &Path, tree: &Tree) -> Result<(), SvnError> {
    for (name, _) in read_tree(wc)? {
        if !tree.contains_key(&name) {
            std::fs::remove_file(wc.join(&name))?;
        }
    }
    for (name, content) in tree {
        std::fs::write(wc.join(name), content)?;
    }
    Ok(())
}

struct Ignore;

impl MergeEventHandler for Ignore {
    fn handle(&mut self, _event: &MergeEvent) {}
}

fn event(path: &str, content: char, tree: char) -> MergeEvent {
    MergeEvent {
        path: path.to_string(),
        content,
        props: ' ',
        tree,
    }
}

/// Apply the change `base -> source` onto `target`.
fn three_way(base: &Tree, source: &Tree, target: &Tree, events: &mut dyn MergeEventHandler) -> Tree {
    let mut out = target.clone();
    let keys: BTreeSet<&String> = base.keys().chain(source.keys()).chain(target.keys()).collect();
    for key in keys {
        let (b, s, t) = (base.get(key), source.get(key), target.get(key));
        if s == b || s == t {
            continue;
        }
        if t == b {
            match s {
                Some(content) => {
                    events.handle(&event(key, if t.is_none() { 'A' } else { 'U' }, ' '));
                    out.insert(key.clone(), content.clone());
                }
                None => {
                    events.handle(&event(key, 'D', ' '));
                    out.remove(key);
                }
            }
            continue;
        }
        match (s, t) {
            (Some(theirs), Some(mine)) => {
                events.handle(&event(key, 'C', ' '));
                out.insert(
                    key.clone(),
                    format!("<<<<<<< .working\n{}=======\n{}>>>>>>> .merge-right\n", mine, theirs),
                );
            }
            _ => events.handle(&event(key, ' ', 'C')),
        }
    }
    out
}

#[derive(Debug, Default)]
pub struct FakeSvn {
    repo: Mutex<Repo>,
    merge_delay: Mutex<Duration>,
    fail_merges: AtomicBool,
    panic_merges: AtomicBool,
    active: AtomicUsize,
    max_active: AtomicUsize,
    merges: AtomicUsize,
}

impl FakeSvn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_merge_delay(&self, delay: Duration) {
        *self.merge_delay.lock().unwrap() = delay;
    }

    pub fn fail_merges(&self, fail: bool) {
        self.fail_merges.store(fail, Ordering::SeqCst);
    }

    pub fn panic_on_merge(&self, panic: bool) {
        self.panic_merges.store(panic, Ordering::SeqCst);
    }

    pub fn max_concurrent_merges(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn merge_count(&self) -> usize {
        self.merges.load(Ordering::SeqCst)
    }

    pub fn head(&self) -> i64 {
        self.repo.lock().unwrap().head
    }

    /// Create `path` with the given files.
    pub fn import(&self, path: &str, files: &[(&str, &str)], message: &str) -> i64 {
        let tree = files
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.repo.lock().unwrap().commit_tree(path, tree, message)
    }

    /// Commit file edits straight to the repository.
    pub fn edit(&self, path: &str, files: &[(&str, &str)], message: &str) -> i64 {
        let mut repo = self.repo.lock().unwrap();
        let mut tree = repo.tree_at(path, None).unwrap();
        for (k, v) in files {
            tree.insert(k.to_string(), v.to_string());
        }
        repo.commit_tree(path, tree, message)
    }

    pub fn file(&self, path: &str, name: &str) -> Option<String> {
        let repo = self.repo.lock().unwrap();
        repo.tree_at(path, None).ok()?.get(name).cloned()
    }

    /// Commit messages of `path`, oldest first.
    pub fn messages(&self, path: &str) -> Vec<(i64, String)> {
        let repo = self.repo.lock().unwrap();
        repo.commits
            .iter()
            .filter(|c| c.path == path)
            .map(|c| (c.revision, c.message.clone()))
            .collect()
    }

    fn apply_merge(
        &self,
        wc: &Path,
        request: &MergeRequest,
        events: &mut dyn MergeEventHandler,
    ) -> Result<(), SvnError> {
        let mut repo = self.repo.lock().unwrap();
        let target_path = repo.wc(wc)?.path.clone();
        let disk = read_tree(wc)?;
        match request {
            MergeRequest::Range { source, to, .. } => {
                let source_tree = repo.tree_at(&path_of(source), *to)?;
                let base = repo.bases.get(&target_path).cloned().unwrap_or_default();
                write_tree(wc, &three_way(&base, &source_tree, &disk, events))?;
                let state = repo.wc(wc)?;
                state.mergeinfo_changed |= base != source_tree;
                state.pending_base = Some((target_path, source_tree));
            }
            MergeRequest::Reintegrate { source, revision } => {
                let source_path = path_of(source);
                let source_tree = repo.tree_at(&source_path, Some(*revision))?;
                let base = repo.bases.get(&source_path).cloned().unwrap_or_default();
                let merged = three_way(&base, &source_tree, &disk, events);
                write_tree(wc, &merged)?;
                // Nothing to commit when the upstream already has every change.
                repo.wc(wc)?.mergeinfo_changed |= merged != disk;
            }
            MergeRequest::RecordOnly { source, revision } => {
                let source_tree = repo.tree_at(&path_of(source), Some(*revision))?;
                let changed = repo.bases.get(&target_path) != Some(&source_tree);
                if changed {
                    events.handle(&MergeEvent {
                        path: ".".into(),
                        content: ' ',
                        props: 'U',
                        tree: ' ',
                    });
                }
                let state = repo.wc(wc)?;
                state.mergeinfo_changed |= changed;
                state.pending_base = Some((target_path, source_tree));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl VcsBackend for FakeSvn {
    async fn info(&self, target: &str) -> Result<SvnInfo, SvnError> {
        let mut repo = self.repo.lock().unwrap();
        if target.starts_with("file://") {
            let path = path_of(target);
            let last = repo
                .nodes
                .get(&path)
                .and_then(|h| h.last())
                .map(|(r, _)| *r)
                .ok_or_else(|| not_found(&path))?;
            return Ok(SvnInfo {
                url: url(&path),
                root_url: ROOT.into(),
                uuid: "fake-uuid".into(),
                revision: repo.head,
                last_changed_rev: last,
                kind: NodeKind::Dir,
            });
        }
        let state = repo.wc(Path::new(target))?;
        Ok(SvnInfo {
            url: url(&state.path),
            root_url: ROOT.into(),
            uuid: "fake-uuid".into(),
            revision: state.revision,
            last_changed_rev: state.revision,
            kind: NodeKind::Dir,
        })
    }

    async fn checkout(&self, target: &str, revision: Option<i64>, wc: &Path) -> Result<i64, SvnError> {
        let mut repo = self.repo.lock().unwrap();
        let path = path_of(target);
        let tree = repo.tree_at(&path, revision)?;
        let rev = revision.unwrap_or(repo.head);
        std::fs::create_dir_all(wc.join(".svn"))?;
        write_tree(wc, &tree)?;
        repo.wcs.insert(
            wc.to_path_buf(),
            WorkingCopy {
                path,
                revision: rev,
                pending_base: None,
                mergeinfo_changed: false,
            },
        );
        Ok(rev)
    }

    async fn update(&self, wc: &Path) -> Result<i64, SvnError> {
        let mut repo = self.repo.lock().unwrap();
        let head = repo.head;
        let (path, rev) = {
            let state = repo.wc(wc)?;
            (state.path.clone(), state.revision)
        };
        let old = repo.tree_at(&path, Some(rev))?;
        let new = repo.tree_at(&path, None)?;
        let disk = read_tree(wc)?;
        write_tree(wc, &three_way(&old, &new, &disk, &mut Ignore))?;
        repo.wc(wc)?.revision = head;
        Ok(head)
    }

    async fn switch(&self, wc: &Path, target: &str, revision: Option<i64>) -> Result<i64, SvnError> {
        let mut repo = self.repo.lock().unwrap();
        let path = path_of(target);
        let tree = repo.tree_at(&path, revision)?;
        let rev = revision.unwrap_or(repo.head);
        write_tree(wc, &tree)?;
        let state = repo.wc(wc)?;
        state.path = path;
        state.revision = rev;
        state.pending_base = None;
        state.mergeinfo_changed = false;
        Ok(rev)
    }

    async fn merge(
        &self,
        wc: &Path,
        request: &MergeRequest,
        events: &mut dyn MergeEventHandler,
    ) -> Result<(), SvnError> {
        if self.fail_merges.load(Ordering::SeqCst) {
            return Err(SvnError::CommandFailed {
                exit_code: 1,
                stderr: "svn: E155015: scripted merge failure".into(),
            });
        }
        if self.panic_merges.load(Ordering::SeqCst) {
            panic!("scripted merge panic");
        }
        let current = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(current, Ordering::SeqCst);
        let delay = *self.merge_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let result = self.apply_merge(wc, request, events);
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.merges.fetch_add(1, Ordering::SeqCst);
        result
    }

    async fn commit(&self, wc: &Path, message: &str) -> Result<i64, SvnError> {
        let mut repo = self.repo.lock().unwrap();
        let (path, rev, mergeinfo_changed) = {
            let state = repo.wc(wc)?;
            (state.path.clone(), state.revision, state.mergeinfo_changed)
        };
        let disk = read_tree(wc)?;
        if disk == repo.tree_at(&path, Some(rev))? && !mergeinfo_changed {
            return Ok(-1);
        }
        let committed = repo.commit_tree(&path, disk, message);
        let pending = {
            let state = repo.wc(wc)?;
            state.revision = committed;
            state.mergeinfo_changed = false;
            state.pending_base.take()
        };
        if let Some((branch, base)) = pending {
            repo.bases.insert(branch, base);
        }
        Ok(committed)
    }

    async fn revert(&self, wc: &Path) -> Result<(), SvnError> {
        let mut repo = self.repo.lock().unwrap();
        let (path, rev) = {
            let state = repo.wc(wc)?;
            state.pending_base = None;
            state.mergeinfo_changed = false;
            (state.path.clone(), state.revision)
        };
        // Like `svn revert`: restore versioned files, leave everything else.
        for (name, content) in repo.tree_at(&path, Some(rev))? {
            std::fs::write(wc.join(name), content)?;
        }
        Ok(())
    }

    async fn log(
        &self,
        target: &str,
        from: i64,
        to: Option<i64>,
        handler: &mut LogHandler<'_>,
    ) -> Result<(), SvnError> {
        let entries: Vec<SvnLogEntry> = {
            let repo = self.repo.lock().unwrap();
            let path = path_of(target);
            if !repo.nodes.contains_key(&path) {
                return Err(not_found(&path));
            }
            let to = to.unwrap_or(repo.head);
            repo.commits
                .iter()
                .filter(|c| c.path == path && c.revision >= from && c.revision <= to)
                .map(|c| SvnLogEntry {
                    revision: c.revision,
                    author: "dev".into(),
                    date: String::new(),
                    message: c.message.clone(),
                    changed_paths: Vec::new(),
                })
                .collect()
        };
        for entry in &entries {
            if handler(entry) == LogControl::Stop {
                break;
            }
        }
        Ok(())
    }

    async fn copy(&self, source: &str, destination: &str, message: &str) -> Result<i64, SvnError> {
        let mut repo = self.repo.lock().unwrap();
        let destination = path_of(destination);
        if repo.nodes.contains_key(&destination) {
            return Err(SvnError::CommandFailed {
                exit_code: 1,
                stderr: format!("svn: E160020: Path '{}' already exists", destination),
            });
        }
        let tree = repo.tree_at(&path_of(source), None)?;
        repo.bases.insert(destination.clone(), tree.clone());
        Ok(repo.commit_tree(&destination, tree, message))
    }
}

/// A trunk project with one feature branch `b1`, reconciled through
/// [`FakeSvn`].
pub struct Fixture {
    pub dir: TempDir,
    pub db: Arc<Database>,
    pub svn: Arc<FakeSvn>,
    pub reconciler: Arc<Reconciler<FakeSvn>>,
    pub trunk: Project,
    pub branch: Project,
}

pub async fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(Database::in_memory().unwrap());
    db.initialize().unwrap();
    let svn = Arc::new(FakeSvn::new());
    svn.import("trunk", &[("a", "alpha\n")], "initial import");

    let trunk = Project::new("trunk", &url("trunk")).integratable();
    db.insert_project(&trunk).unwrap();

    let resolver = LocationResolver::isolated(BTreeMap::new());
    let branch = branch::new_branch(
        &db,
        svn.as_ref(),
        &resolver,
        &trunk,
        &NewBranch {
            name: "b1",
            attach: false,
            commit_message: None,
            default_message: "Created a feature branch",
            auto_integrate: false,
        },
    )
    .await
    .unwrap();

    let reconciler = Arc::new(Reconciler::with_dirs(
        Arc::clone(&db),
        Arc::clone(&svn),
        resolver,
        dir.path().join("workspace"),
        dir.path().join("logs"),
    ));
    Fixture {
        dir,
        db,
        svn,
        reconciler,
        trunk,
        branch,
    }
}
