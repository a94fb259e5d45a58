//! Version control for session workspaces.
//!
//! The pipeline only needs two operations: initialize a repository when the
//! workspace is created, and commit whatever a task changed. [`GitService`]
//! does both in-process through libgit2.

use std::path::Path;

use crate::types::CommitRecord;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum VcsError {
    #[error("not a repository: {0}")]
    NotARepo(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("git: {0}")]
    Git(String),
}

#[cfg(feature = "libgit2")]
impl From<git2::Error> for VcsError {
    fn from(e: git2::Error) -> Self {
        VcsError::Git(e.message().to_string())
    }
}

pub type Result<T> = std::result::Result<T, VcsError>;

// ---------------------------------------------------------------------------
// VersionControl
// ---------------------------------------------------------------------------

pub trait VersionControl: Send + Sync {
    /// Create a repository in `path` with a README and an initial commit.
    fn init_repo(&self, path: &Path, goal: &str) -> Result<()>;

    /// Stage everything under `path` and commit it. Returns an empty record
    /// when the tree is unchanged.
    fn commit(&self, path: &Path, message: &str, agent_name: &str, task_id: &str)
        -> Result<CommitRecord>;
}

pub const INITIAL_COMMIT_MESSAGE: &str = "Project started!";

pub fn readme_contents(goal: &str) -> String {
    format!("# {goal}\n\nBuilt with Kiln.\n")
}

// ---------------------------------------------------------------------------
// GitService
// ---------------------------------------------------------------------------

/// libgit2-backed [`VersionControl`]. Stateless; the repository is opened
/// fresh for each call.
#[cfg(feature = "libgit2")]
#[derive(Debug, Clone)]
pub struct GitService {
    author_name: String,
    author_email: String,
}

#[cfg(feature = "libgit2")]
impl GitService {
    pub fn new() -> Self {
        Self {
            author_name: "Kiln".into(),
            author_email: "kiln@local".into(),
        }
    }

    pub fn with_author(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.author_name = name.into();
        self.author_email = email.into();
        self
    }

    fn signature(&self) -> Result<git2::Signature<'static>> {
        Ok(git2::Signature::now(&self.author_name, &self.author_email)?)
    }

    fn stage_all(repo: &git2::Repository) -> Result<git2::Oid> {
        let mut index = repo.index()?;
        index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;
        Ok(index.write_tree()?)
    }

    fn changed_paths(
        repo: &git2::Repository,
        parent: Option<&git2::Tree<'_>>,
        tree: &git2::Tree<'_>,
    ) -> Result<Vec<String>> {
        let diff = repo.diff_tree_to_tree(parent, Some(tree), None)?;
        let mut files = Vec::new();
        for delta in diff.deltas() {
            let path = delta.new_file().path().or_else(|| delta.old_file().path());
            if let Some(p) = path {
                files.push(p.to_string_lossy().replace('\\', "/"));
            }
        }
        Ok(files)
    }
}

#[cfg(feature = "libgit2")]
impl Default for GitService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "libgit2")]
impl VersionControl for GitService {
    fn init_repo(&self, path: &Path, goal: &str) -> Result<()> {
        let repo = git2::Repository::init(path)?;
        std::fs::write(path.join("README.md"), readme_contents(goal))?;

        let tree_id = Self::stage_all(&repo)?;
        let tree = repo.find_tree(tree_id)?;
        let sig = self.signature()?;
        repo.commit(Some("HEAD"), &sig, &sig, INITIAL_COMMIT_MESSAGE, &tree, &[])?;
        tracing::debug!(path = %path.display(), "initialized repository");
        Ok(())
    }

    fn commit(
        &self,
        path: &Path,
        message: &str,
        agent_name: &str,
        task_id: &str,
    ) -> Result<CommitRecord> {
        let repo = git2::Repository::open(path)
            .map_err(|_| VcsError::NotARepo(path.display().to_string()))?;

        let tree_id = Self::stage_all(&repo)?;
        let tree = repo.find_tree(tree_id)?;
        let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());

        if let Some(p) = &parent {
            if p.tree_id() == tree_id {
                return Ok(CommitRecord::empty(message, agent_name, task_id));
            }
        }

        let parent_tree = match &parent {
            Some(p) => Some(p.tree()?),
            None => None,
        };
        let files_changed = Self::changed_paths(&repo, parent_tree.as_ref(), &tree)?;

        let sig = self.signature()?;
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        let sha = oid.to_string();

        Ok(CommitRecord {
            short_sha: sha.chars().take(7).collect(),
            sha,
            message: message.to_string(),
            agent_name: agent_name.to_string(),
            task_id: task_id.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            files_changed,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(all(test, feature = "libgit2"))]
mod tests {
    use super::*;

    #[test]
    fn init_creates_readme_and_first_commit() {
        let dir = tempfile::tempdir().unwrap();
        GitService::new().init_repo(dir.path(), "A snake game").unwrap();

        let readme = std::fs::read_to_string(dir.path().join("README.md")).unwrap();
        assert_eq!(readme, "# A snake game\n\nBuilt with Kiln.\n");

        let repo = git2::Repository::open(dir.path()).unwrap();
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        assert_eq!(head.message(), Some(INITIAL_COMMIT_MESSAGE));
    }

    #[test]
    fn commit_records_changed_files() {
        let dir = tempfile::tempdir().unwrap();
        let git = GitService::new();
        git.init_repo(dir.path(), "goal").unwrap();

        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/app.py"), "print('hi')\n").unwrap();

        let record = git
            .commit(dir.path(), "Sparky: Build app", "Sparky", "t1")
            .unwrap();
        assert_eq!(record.sha.len(), 40);
        assert_eq!(record.short_sha, &record.sha[..7]);
        assert_eq!(record.files_changed, vec!["src/app.py"]);
        assert_eq!(record.task_id, "t1");
        assert!(chrono::DateTime::parse_from_rfc3339(&record.timestamp).is_ok());
    }

    #[test]
    fn commit_without_changes_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let git = GitService::new();
        git.init_repo(dir.path(), "goal").unwrap();

        let record = git.commit(dir.path(), "noop", "Sparky", "t1").unwrap();
        assert!(record.is_empty());
        assert!(record.files_changed.is_empty());
    }

    #[test]
    fn commit_outside_repo_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = GitService::new()
            .commit(dir.path(), "msg", "a", "t")
            .unwrap_err();
        assert!(matches!(err, VcsError::NotARepo(_)));
    }
}
