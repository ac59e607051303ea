use std::path::{Path, PathBuf};

use async_trait::async_trait;
use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{ConfigLevel, ErrorClass, ErrorCode, FetchOptions, Oid, Repository};

use crate::engine::models::{RepoRef, RunId};
use crate::errors::WorkspaceError;

/// Prefix of every directory this manager creates under its root.
const WORKSPACE_PREFIX: &str = "run-";

/// Isolated working directories, one per run.
#[async_trait]
pub trait WorkspaceProvider: Send + Sync {
    /// Create a fresh directory for the run and check `repo` out into it.
    /// On failure nothing is left behind.
    async fn prepare(&self, run_id: RunId, repo: &RepoRef) -> Result<PathBuf, WorkspaceError>;

    /// Remove a workspace. Removing a missing directory succeeds.
    async fn destroy(&self, path: &Path) -> Result<(), WorkspaceError>;

    /// Remove workspace directories for which `keep` is false. Returns what
    /// was removed.
    async fn sweep_orphans(
        &self,
        keep: &(dyn for<'p> Fn(&'p Path) -> bool + Send + Sync),
    ) -> Result<Vec<PathBuf>, WorkspaceError>;
}

#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    pub base_dir: PathBuf,
    /// Shallow clone depth for branch refs; 0 fetches full history.
    pub clone_depth: u32,
    pub git_user_name: Option<String>,
    pub git_user_email: Option<String>,
}

impl WorkspaceConfig {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            clone_depth: 1,
            git_user_name: None,
            git_user_email: None,
        }
    }
}

/// Lowercase, dash-separated, at most `max_len` bytes.
pub fn slugify(text: &str, max_len: usize) -> String {
    let mut slug = String::with_capacity(text.len());
    for c in text.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    let mut slug = slug.trim_end_matches('-').to_string();
    if slug.len() > max_len {
        slug.truncate(max_len);
        slug = slug.trim_end_matches('-').to_string();
    }
    if slug.is_empty() {
        "repo".to_string()
    } else {
        slug
    }
}

pub fn workspace_dir_name(run_id: RunId, repo: &RepoRef) -> String {
    format!(
        "{}{}-{}",
        WORKSPACE_PREFIX,
        run_id.simple(),
        slugify(repo.name(), 40)
    )
}

/// The run a workspace directory was created for, from its name.
pub fn run_id_of(path: &Path) -> Option<RunId> {
    let name = path.file_name()?.to_str()?.strip_prefix(WORKSPACE_PREFIX)?;
    let id = name.get(..32)?;
    RunId::try_parse(id).ok()
}

/// Clones into per-run directories under a single root with libgit2.
pub struct GitWorkspaceManager {
    config: WorkspaceConfig,
}

impl GitWorkspaceManager {
    pub fn new(config: WorkspaceConfig) -> Self {
        Self { config }
    }

    pub fn base_dir(&self) -> &Path {
        &self.config.base_dir
    }
}

/// libgit2's local transport cannot fetch shallow.
fn supports_shallow(url: &str) -> bool {
    !(url.starts_with("file://") || Path::new(url).exists())
}

fn is_missing_ref(err: &git2::Error) -> bool {
    err.code() == ErrorCode::NotFound || err.class() == ErrorClass::Reference
}

fn clone_error(repo: &RepoRef, err: git2::Error) -> WorkspaceError {
    WorkspaceError::Clone {
        url: repo.url.clone(),
        message: err.message().to_string(),
    }
}

fn remove_partial(path: &Path) {
    if let Err(e) = std::fs::remove_dir_all(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove partial workspace");
    }
}

fn detach_at(repository: &Repository, oid: Oid) -> Result<(), git2::Error> {
    let commit = repository.find_commit(oid)?;
    repository.checkout_tree(commit.as_object(), Some(CheckoutBuilder::new().force()))?;
    repository.set_head_detached(oid)
}

/// Full clone, then resolve a tag or commit and detach HEAD there.
fn clone_detached(repo: &RepoRef, path: &Path) -> Result<Repository, WorkspaceError> {
    let repository = RepoBuilder::new()
        .clone(&repo.url, path)
        .map_err(|e| clone_error(repo, e))?;

    let target = if repo.is_commit() {
        Oid::from_str(&repo.reference).ok()
    } else {
        [format!("refs/tags/{}", repo.reference), repo.reference.clone()]
            .iter()
            .find_map(|spec| repository.revparse_single(spec).ok())
            .and_then(|obj| obj.peel_to_commit().ok())
            .map(|commit| commit.id())
    };
    let invalid = || WorkspaceError::InvalidRef {
        url: repo.url.clone(),
        reference: repo.reference.clone(),
    };
    let oid = target.ok_or_else(invalid)?;
    detach_at(&repository, oid).map_err(|e| {
        if is_missing_ref(&e) {
            invalid()
        } else {
            clone_error(repo, e)
        }
    })?;
    Ok(repository)
}

fn clone_into(config: &WorkspaceConfig, repo: &RepoRef, path: &Path) -> Result<(), WorkspaceError> {
    let repository = if repo.is_commit() {
        clone_detached(repo, path)?
    } else {
        let mut fetch = FetchOptions::new();
        if config.clone_depth > 0 && supports_shallow(&repo.url) {
            fetch.depth(config.clone_depth as i32);
        }
        let mut builder = RepoBuilder::new();
        builder.fetch_options(fetch).branch(&repo.reference);
        match builder.clone(&repo.url, path) {
            Ok(repository) => repository,
            Err(e) if is_missing_ref(&e) => {
                // Not a branch. Retry as a tag or abbreviated commit.
                tracing::debug!(reference = %repo.reference, "ref is not a branch, resolving as tag or commit");
                remove_partial(path);
                std::fs::create_dir(path).map_err(|source| WorkspaceError::CreateDir {
                    path: path.to_path_buf(),
                    source,
                })?;
                clone_detached(repo, path)?
            }
            Err(e) => return Err(clone_error(repo, e)),
        }
    };

    if let (Some(name), Some(email)) = (&config.git_user_name, &config.git_user_email) {
        let identity = || -> Result<(), git2::Error> {
            let mut local = repository.config()?.open_level(ConfigLevel::Local)?;
            local.set_str("user.name", name)?;
            local.set_str("user.email", email)
        };
        identity().map_err(|e| WorkspaceError::Other(anyhow::anyhow!(
            "Failed to set git identity: {}",
            e.message()
        )))?;
    }
    Ok(())
}

#[async_trait]
impl WorkspaceProvider for GitWorkspaceManager {
    async fn prepare(&self, run_id: RunId, repo: &RepoRef) -> Result<PathBuf, WorkspaceError> {
        let base = self.config.base_dir.clone();
        let path = base.join(workspace_dir_name(run_id, repo));
        tokio::fs::create_dir_all(&base)
            .await
            .map_err(|source| WorkspaceError::CreateDir {
                path: base.clone(),
                source,
            })?;
        // create_dir, not create_dir_all: an existing directory is an error.
        tokio::fs::create_dir(&path)
            .await
            .map_err(|source| WorkspaceError::CreateDir {
                path: path.clone(),
                source,
            })?;

        tracing::info!(%run_id, url = %repo.url, reference = %repo.reference, path = %path.display(), "cloning workspace");
        let config = self.config.clone();
        let repo = repo.clone();
        let target = path.clone();
        let result = tokio::task::spawn_blocking(move || clone_into(&config, &repo, &target))
            .await
            .map_err(|e| WorkspaceError::Other(anyhow::anyhow!("Clone task panicked: {}", e)))
            .and_then(|r| r);

        match result {
            Ok(()) => Ok(path),
            Err(e) => {
                remove_partial(&path);
                Err(e)
            }
        }
    }

    async fn destroy(&self, path: &Path) -> Result<(), WorkspaceError> {
        if !path.starts_with(&self.config.base_dir) {
            return Err(WorkspaceError::Other(anyhow::anyhow!(
                "Refusing to remove {} outside the workspace root {}",
                path.display(),
                self.config.base_dir.display()
            )));
        }
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "workspace removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(WorkspaceError::Remove {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    async fn sweep_orphans(
        &self,
        keep: &(dyn for<'p> Fn(&'p Path) -> bool + Send + Sync),
    ) -> Result<Vec<PathBuf>, WorkspaceError> {
        let mut entries = match tokio::fs::read_dir(&self.config.base_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(WorkspaceError::Other(e.into())),
        };

        let mut removed = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| WorkspaceError::Other(e.into()))?
        {
            let path = entry.path();
            let is_workspace = entry
                .file_name()
                .to_str()
                .is_some_and(|n| n.starts_with(WORKSPACE_PREFIX));
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !is_workspace || !is_dir || keep(&path) {
                continue;
            }
            match self.destroy(&path).await {
                Ok(()) => {
                    tracing::info!(path = %path.display(), "removed orphaned workspace");
                    removed.push(path);
                }
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove orphaned workspace"),
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use git2::Signature;
    use tempfile::TempDir;
    use uuid::Uuid;

    /// A repository with one commit on `main` and a lightweight tag `v1`.
    /// Returns the directory and the commit id.
    pub(crate) fn source_repo() -> (TempDir, String) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        std::fs::write(dir.path().join("README.md"), "# widgets\n").unwrap();

        let mut index = repo.index().unwrap();
        index.add_path(Path::new("README.md")).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = Signature::now("test", "test@localhost").unwrap();
        let oid = repo
            .commit(Some("refs/heads/main"), &sig, &sig, "initial", &tree, &[])
            .unwrap();
        repo.set_head("refs/heads/main").unwrap();
        let commit = repo.find_commit(oid).unwrap();
        repo.tag_lightweight("v1", commit.as_object(), false).unwrap();
        (dir, oid.to_string())
    }

    fn manager(base: &Path) -> GitWorkspaceManager {
        GitWorkspaceManager::new(WorkspaceConfig {
            base_dir: base.to_path_buf(),
            clone_depth: 1,
            git_user_name: None,
            git_user_email: None,
        })
    }

    fn repo_ref(src: &TempDir, reference: &str) -> RepoRef {
        RepoRef::new(src.path().to_string_lossy(), reference)
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("My Widgets.git", 40), "my-widgets-git");
        assert_eq!(slugify("--weird__name--", 40), "weird-name");
        assert_eq!(slugify("a-very-long-repository-name", 10), "a-very-lon");
        assert_eq!(slugify("###", 10), "repo");
    }

    #[tokio::test]
    async fn test_prepare_clones_branch() {
        let (src, _) = source_repo();
        let base = TempDir::new().unwrap();
        let mgr = manager(base.path());

        let path = mgr.prepare(Uuid::new_v4(), &repo_ref(&src, "main")).await.unwrap();
        assert!(path.starts_with(base.path()));
        assert!(path.join("README.md").exists());
        let cloned = Repository::open(&path).unwrap();
        assert_eq!(cloned.head().unwrap().shorthand(), Some("main"));
    }

    #[tokio::test]
    async fn test_prepare_paths_are_unique() {
        let (src, _) = source_repo();
        let base = TempDir::new().unwrap();
        let mgr = manager(base.path());
        let repo = repo_ref(&src, "main");

        let a = mgr.prepare(Uuid::new_v4(), &repo).await.unwrap();
        let b = mgr.prepare(Uuid::new_v4(), &repo).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_prepare_commit_and_tag_detach_head() {
        let (src, sha) = source_repo();
        let base = TempDir::new().unwrap();
        let mgr = manager(base.path());

        let by_sha = mgr.prepare(Uuid::new_v4(), &repo_ref(&src, &sha)).await.unwrap();
        let repo = Repository::open(&by_sha).unwrap();
        assert!(repo.head_detached().unwrap());
        assert_eq!(repo.head().unwrap().target().unwrap().to_string(), sha);

        let by_tag = mgr.prepare(Uuid::new_v4(), &repo_ref(&src, "v1")).await.unwrap();
        let repo = Repository::open(&by_tag).unwrap();
        assert_eq!(repo.head().unwrap().target().unwrap().to_string(), sha);
    }

    #[tokio::test]
    async fn test_prepare_invalid_ref_leaves_nothing() {
        let (src, _) = source_repo();
        let base = TempDir::new().unwrap();
        let mgr = manager(base.path());

        let err = mgr
            .prepare(Uuid::new_v4(), &repo_ref(&src, "no-such-branch"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::InvalidRef { .. }), "got {:?}", err);
        assert_eq!(std::fs::read_dir(base.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_prepare_unreachable_repo_fails() {
        let base = TempDir::new().unwrap();
        let mgr = manager(base.path());
        let missing = base.path().join("missing-source");
        let repo = RepoRef::new(format!("file://{}", missing.display()), "main");

        assert!(mgr.prepare(Uuid::new_v4(), &repo).await.is_err());
        let leftovers: Vec<_> = std::fs::read_dir(base.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(WORKSPACE_PREFIX))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_prepare_sets_git_identity() {
        let (src, _) = source_repo();
        let base = TempDir::new().unwrap();
        let mgr = GitWorkspaceManager::new(WorkspaceConfig {
            base_dir: base.path().to_path_buf(),
            clone_depth: 0,
            git_user_name: Some("Conductor Bot".into()),
            git_user_email: Some("bot@example.com".into()),
        });

        let path = mgr.prepare(Uuid::new_v4(), &repo_ref(&src, "main")).await.unwrap();
        let repo = Repository::open(&path).unwrap();
        let config = repo.config().unwrap().open_level(ConfigLevel::Local).unwrap();
        assert_eq!(config.get_string("user.name").unwrap(), "Conductor Bot");
        assert_eq!(config.get_string("user.email").unwrap(), "bot@example.com");
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let (src, _) = source_repo();
        let base = TempDir::new().unwrap();
        let mgr = manager(base.path());
        let path = mgr.prepare(Uuid::new_v4(), &repo_ref(&src, "main")).await.unwrap();

        mgr.destroy(&path).await.unwrap();
        assert!(!path.exists());
        mgr.destroy(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_destroy_refuses_paths_outside_root() {
        let base = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        let mgr = manager(base.path());
        assert!(mgr.destroy(other.path()).await.is_err());
        assert!(other.path().exists());
    }

    #[tokio::test]
    async fn test_sweep_orphans_skips_lease_directory() {
        let base = TempDir::new().unwrap();
        let mgr = manager(base.path());
        let leases = base.path().join(".leases");
        std::fs::create_dir_all(&leases).unwrap();

        let removed = mgr.sweep_orphans(&|_: &Path| false).await.unwrap();
        assert!(removed.is_empty());
        assert!(leases.exists());
    }

    #[test]
    fn test_run_id_of_workspace_dir() {
        let run_id = Uuid::new_v4();
        let repo = RepoRef::new("https://github.com/acme/widgets.git", "main");
        let path = Path::new("/ws").join(workspace_dir_name(run_id, &repo));
        assert_eq!(run_id_of(&path), Some(run_id));
        assert_eq!(run_id_of(Path::new("/ws/run-orphan")), None);
        assert_eq!(run_id_of(Path::new("/ws/notes")), None);
    }

    #[tokio::test]
    async fn test_sweep_orphans_keeps_active() {
        let base = TempDir::new().unwrap();
        let mgr = manager(base.path());
        let active = base.path().join("run-active");
        let orphan = base.path().join("run-orphan");
        let unrelated = base.path().join("notes");
        for dir in [&active, &orphan, &unrelated] {
            std::fs::create_dir_all(dir).unwrap();
        }

        let removed = mgr.sweep_orphans(&|path: &Path| path == active).await.unwrap();
        assert_eq!(removed, vec![orphan.clone()]);
        assert!(active.exists());
        assert!(!orphan.exists());
        assert!(unrelated.exists());
    }
}
