//! `svnmerge project ...` and `svnmerge branch ...`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};

use svnmerge_core::branch::{self, NewBranch, RenameObservers};
use svnmerge_core::config::AppConfig;
use svnmerge_core::db::Database;
use svnmerge_core::models::{AuditEntry, Project};
use svnmerge_core::svn::{LocationResolver, RepositoryLayoutInfo, SvnClient};

use crate::style;

#[derive(Subcommand, Debug)]
pub enum ProjectAction {
    /// Register a project.
    Add {
        name: String,

        /// svn location, `${VAR}` references allowed.
        location: String,

        /// Accept integrations from feature branches.
        #[arg(long)]
        integratable: bool,

        /// Project parameter used for `${VAR}` expansion (KEY=VALUE).
        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// Explicit working copy directory.
        #[arg(long)]
        working_copy: Option<PathBuf>,

        /// Integrate new successful builds automatically.
        #[arg(long)]
        auto_integrate: bool,

        /// Rebase automatically when the upstream builds.
        #[arg(long)]
        auto_rebase: bool,
    },

    /// List registered projects.
    List,

    /// Rename a project. Branches of a renamed mainline follow it.
    Rename { old: String, new: String },

    /// Turn automatic integration and rebase on or off.
    Automate {
        name: String,

        #[arg(long)]
        auto_integrate: Option<bool>,

        #[arg(long)]
        auto_rebase: Option<bool>,
    },

    /// Remove a project together with its builds and records.
    Remove { name: String },
}

#[derive(Subcommand, Debug)]
pub enum BranchAction {
    /// Create a feature branch of a mainline project and register it.
    Create {
        /// Mainline project.
        upstream: String,

        /// Branch name.
        name: String,

        /// Register a branch that already exists instead of copying.
        #[arg(long)]
        attach: bool,

        /// Commit message of the branch copy.
        #[arg(short, long)]
        message: Option<String>,

        #[arg(long)]
        auto_integrate: bool,
    },

    /// Attach an existing project to a mainline project.
    Attach { branch: String, upstream: String },

    /// List feature branches of a mainline project.
    List { upstream: String },

    /// Show the repository layout of a location or project and the
    /// default URL for new branches.
    Layout {
        /// svn URL or project name.
        target: String,
    },
}

// ---------------------------------------------------------------------------
// project
// ---------------------------------------------------------------------------

pub fn run_project(db: &Database, action: ProjectAction) -> Result<()> {
    match action {
        ProjectAction::Add {
            name,
            location,
            integratable,
            params,
            working_copy,
            auto_integrate,
            auto_rebase,
        } => {
            if db.get_project_by_name(&name)?.is_some() {
                anyhow::bail!("project '{}' already exists", name);
            }
            let mut project = Project::new(&name, &location);
            project.integratable = integratable;
            project.parameters = parse_params(&params)?;
            project.working_copy = working_copy;
            project.auto_integrate = auto_integrate;
            project.auto_rebase = auto_rebase;
            db.insert_project(&project).context("failed to register project")?;
            db.insert_audit_entry(
                &AuditEntry::success("project_added", &format!("{} at {}", name, location))
                    .for_project(&project.id),
            )?;
            println!("{}", style::success(&format!("Project '{}' registered", name)));
            Ok(())
        }
        ProjectAction::List => list_projects(db),
        ProjectAction::Rename { old, new } => {
            let project = branch::rename_project(db, &RenameObservers::with_defaults(), &old, &new)?;
            println!(
                "{}",
                style::success(&format!("Renamed '{}' to '{}'", old, project.name))
            );
            Ok(())
        }
        ProjectAction::Automate {
            name,
            auto_integrate,
            auto_rebase,
        } => {
            let project = find(db, &name)?;
            let auto_integrate = auto_integrate.unwrap_or(project.auto_integrate);
            let auto_rebase = auto_rebase.unwrap_or(project.auto_rebase);
            db.set_project_automation(&project.id, auto_integrate, auto_rebase)?;
            println!(
                "{}",
                style::success(&format!(
                    "{}: auto-integrate {}, auto-rebase {}",
                    name,
                    on_off(auto_integrate),
                    on_off(auto_rebase)
                ))
            );
            Ok(())
        }
        ProjectAction::Remove { name } => {
            let project = find(db, &name)?;
            let dependents = branch::branches(db, &project)?;
            if !dependents.is_empty() {
                println!(
                    "{}",
                    style::warn(&format!(
                        "{} branch(es) still point at '{}'",
                        dependents.len(),
                        name
                    ))
                );
            }
            db.delete_project(&project.id)?;
            db.insert_audit_entry(&AuditEntry::success("project_removed", &name))?;
            println!("{}", style::success(&format!("Project '{}' removed", name)));
            Ok(())
        }
    }
}

fn list_projects(db: &Database) -> Result<()> {
    let projects = db.list_projects()?;
    if projects.is_empty() {
        println!("No projects registered.");
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Name", "Location", "Kind", "Upstream", "Automation"]);

    for project in &projects {
        let upstream = db
            .get_branch_link(&project.id)?
            .map(|l| l.upstream)
            .unwrap_or_default();
        let kind = if project.integratable { "mainline" } else { "branch" };
        let mut automation = Vec::new();
        if project.auto_integrate {
            automation.push("integrate");
        }
        if project.auto_rebase {
            automation.push("rebase");
        }
        table.add_row(vec![
            project.name.clone(),
            project.location.clone(),
            kind.to_string(),
            upstream,
            automation.join(", "),
        ]);
    }

    println!("{table}");
    Ok(())
}

// ---------------------------------------------------------------------------
// branch
// ---------------------------------------------------------------------------

pub async fn run_branch(config: &AppConfig, db: Database, action: BranchAction) -> Result<()> {
    match action {
        BranchAction::Create {
            upstream,
            name,
            attach,
            message,
            auto_integrate,
        } => {
            let upstream = find(&db, &upstream)?;
            let svn = SvnClient::from_config(&config.svn);
            let resolver = LocationResolver::new(config.environment.clone());
            let project = branch::new_branch(
                &db,
                &svn,
                &resolver,
                &upstream,
                &NewBranch {
                    name: &name,
                    attach,
                    commit_message: message.as_deref(),
                    default_message: &config.merge.new_branch_message,
                    auto_integrate: auto_integrate || config.merge.auto_integrate,
                },
            )
            .await?;
            println!(
                "{}",
                style::success(&format!(
                    "Branch project '{}' at {}",
                    project.name, project.location
                ))
            );
            Ok(())
        }
        BranchAction::Attach { branch: name, upstream } => {
            branch::attach(&db, &name, &upstream)?;
            println!(
                "{}",
                style::success(&format!("'{}' now integrates into '{}'", name, upstream))
            );
            Ok(())
        }
        BranchAction::List { upstream } => {
            let upstream = find(&db, &upstream)?;
            let branches = branch::branches(&db, &upstream)?;
            if branches.is_empty() {
                println!("No feature branches of '{}'.", upstream.name);
                return Ok(());
            }
            println!("{}", style::header(&format!("Feature branches of {}", upstream.name)));
            for b in &branches {
                println!("  {:<30} {}", b.name, style::dim(&b.location));
            }
            Ok(())
        }
        BranchAction::Layout { target } => {
            let location = match db.get_project_by_name(&target)? {
                Some(project) => LocationResolver::new(config.environment.clone())
                    .resolve(&project)
                    .unwrap_or(project.location),
                None => target,
            };
            print_layout(&RepositoryLayoutInfo::new(&location));
            Ok(())
        }
    }
}

fn print_layout(info: &RepositoryLayoutInfo) {
    println!("{}", style::header(&info.location));
    println!("  Layout          : {}", info.layout);
    if let Some(sub) = &info.sub_project {
        println!("  Sub-project     : {}", sub);
    }
    println!("  New branch URL  : {}", info.default_new_branch_url);
    println!("  New dev tag URL : {}", info.default_new_dev_tag_url);
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub(crate) fn find(db: &Database, name: &str) -> Result<Project> {
    db.get_project_by_name(name)
        .context("database error")?
        .ok_or_else(|| anyhow::anyhow!("project '{}' not found", name))
}

fn parse_params(params: &[String]) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for param in params {
        let (key, value) = param
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("parameter '{}' is not KEY=VALUE", param))?;
        let key = key.trim();
        if key.is_empty() {
            anyhow::bail!("parameter '{}' has an empty name", param);
        }
        map.insert(key.to_string(), value.to_string());
    }
    Ok(map)
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "on"
    } else {
        "off"
    }
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
    fn test_parse_params() {
        let map = parse_params(&["REPO=file:///r".into(), "X=a=b".into()]).unwrap();
        assert_eq!(map["REPO"], "file:///r");
        assert_eq!(map["X"], "a=b");
        assert!(parse_params(&["novalue".into()]).is_err());
        assert!(parse_params(&["=v".into()]).is_err());
    }

    #[test]
    fn test_add_rename_and_remove() {
        let db = db();
        run_project(
            &db,
            ProjectAction::Add {
                name: "trunk".into(),
                location: "file:///repo/trunk".into(),
                integratable: true,
                params: vec![],
                working_copy: None,
                auto_integrate: false,
                auto_rebase: false,
            },
        )
        .unwrap();
        run_project(
            &db,
            ProjectAction::Add {
                name: "trunk-b1".into(),
                location: "file:///repo/branches/b1".into(),
                integratable: false,
                params: vec![],
                working_copy: None,
                auto_integrate: false,
                auto_rebase: false,
            },
        )
        .unwrap();
        branch::attach(&db, "trunk-b1", "trunk").unwrap();

        run_project(
            &db,
            ProjectAction::Rename {
                old: "trunk".into(),
                new: "main".into(),
            },
        )
        .unwrap();
        let b1 = find(&db, "trunk-b1").unwrap();
        assert_eq!(db.get_branch_link(&b1.id).unwrap().unwrap().upstream, "main");

        run_project(&db, ProjectAction::Remove { name: "trunk-b1".into() }).unwrap();
        assert!(db.get_project_by_name("trunk-b1").unwrap().is_none());
    }

    #[test]
    fn test_add_rejects_duplicates() {
        let db = db();
        let add = || ProjectAction::Add {
            name: "trunk".into(),
            location: "file:///repo/trunk".into(),
            integratable: true,
            params: vec![],
            working_copy: None,
            auto_integrate: false,
            auto_rebase: false,
        };
        run_project(&db, add()).unwrap();
        assert!(run_project(&db, add()).is_err());
    }

    #[test]
    fn test_automate_keeps_unspecified_flags() {
        let db = db();
        let mut project = Project::new("trunk-b1", "file:///repo/branches/b1");
        project.auto_rebase = true;
        db.insert_project(&project).unwrap();

        run_project(
            &db,
            ProjectAction::Automate {
                name: "trunk-b1".into(),
                auto_integrate: Some(true),
                auto_rebase: None,
            },
        )
        .unwrap();
        let stored = find(&db, "trunk-b1").unwrap();
        assert!(stored.auto_integrate);
        assert!(stored.auto_rebase);
    }
}
