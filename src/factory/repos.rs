//! Repo registration shared by the API and the CLI.

use tracing::info;

use super::db::DbHandle;
use super::models::{NewRepo, Repo, RepoUpdate, Source};
use super::workspace::check_branch_name;
use crate::errors::{ScoutError, ScoutResult};

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Trim and check a registration request. A missing name defaults to the
/// tracker identifier.
pub fn normalize(new: NewRepo) -> ScoutResult<NewRepo> {
    let source_id = new.source_id.trim().to_string();
    if source_id.is_empty() {
        return Err(ScoutError::Validation("source_id is required".into()));
    }
    if new.source == Source::Github && source_id.split('/').filter(|p| !p.is_empty()).count() != 2 {
        return Err(ScoutError::Validation(format!(
            "GitHub source_id must be owner/repo, got {}",
            source_id
        )));
    }
    let default_branch = non_blank(new.default_branch);
    if let Some(branch) = &default_branch {
        check_branch_name(branch)?;
    }
    Ok(NewRepo {
        source: new.source,
        name: non_blank(Some(new.name)).unwrap_or_else(|| source_id.clone()),
        source_id,
        local_path: non_blank(new.local_path),
        default_branch,
        default_mode: non_blank(new.default_mode),
        auto_create_pr: new.auto_create_pr,
    })
}

/// Trim and check an edit. A field that is present must not be blank.
pub fn normalize_update(update: RepoUpdate) -> ScoutResult<RepoUpdate> {
    let present = |field: &str, value: Option<String>| match value {
        None => Ok(None),
        Some(v) => match non_blank(Some(v)) {
            Some(v) => Ok(Some(v)),
            None => Err(ScoutError::Validation(format!("{} must not be blank", field))),
        },
    };
    let default_branch = present("default_branch", update.default_branch)?;
    if let Some(branch) = &default_branch {
        check_branch_name(branch)?;
    }
    Ok(RepoUpdate {
        local_path: present("local_path", update.local_path)?,
        default_branch,
        default_mode: present("default_mode", update.default_mode)?,
        auto_create_pr: update.auto_create_pr,
    })
}

/// Apply an operator edit to a registered repo.
pub async fn update_repo(db: &DbHandle, repo_id: i64, update: RepoUpdate) -> ScoutResult<Repo> {
    let update = normalize_update(update)?;
    let repo = db
        .call(move |db| db.update_repo(repo_id, &update))
        .await
        .map_err(ScoutError::Database)?
        .ok_or_else(|| ScoutError::not_found("Repo", repo_id))?;
    info!(repo_id, default_branch = %repo.default_branch, "repo updated");
    Ok(repo)
}

/// Register a repo. The same tracker identifier can't be registered twice.
pub async fn register_repo(db: &DbHandle, new: NewRepo) -> ScoutResult<Repo> {
    let new = normalize(new)?;
    let created = db
        .call(move |db| {
            if db.find_repo(new.source, &new.source_id)?.is_some() {
                return Ok(Err(new));
            }
            db.create_repo(&new).map(Ok)
        })
        .await
        .map_err(ScoutError::Database)?;
    match created {
        Ok(repo) => {
            info!(repo_id = repo.id, source = %repo.source, source_id = %repo.source_id, "repo registered");
            Ok(repo)
        }
        Err(new) => Err(ScoutError::Conflict(format!(
            "Repo {}:{} is already registered",
            new.source, new.source_id
        ))),
    }
}
