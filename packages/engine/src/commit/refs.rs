use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::storage::StorageBackend;
use crate::ParqueError;

const HEAD_PATH: &str = "_meta/HEAD";
const DEFAULT_BRANCH: &str = "main";
const MAX_SYMBOLIC_HOPS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadState {
    Branch(String),
    Detached(String),
}

/// Named pointers into the commit DAG. Ref files hold either a commit
/// hash or another ref name (symbolic); `HEAD` is symbolic by default.
/// Updates to the same ref serialize through a per-ref lock; ref writes
/// themselves are atomic renames in the backend.
pub struct RefStore {
    storage: Arc<dyn StorageBackend>,
    ref_locks: Mutex<HashMap<String, Arc<futures_util::lock::Mutex<()>>>>,
}

impl RefStore {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            ref_locks: Mutex::new(HashMap::new()),
        }
    }

    fn ref_lock(&self, name: &str) -> Arc<futures_util::lock::Mutex<()>> {
        let mut locks = self.ref_locks.lock().unwrap();
        Arc::clone(locks.entry(name.to_string()).or_default())
    }

    /// Resolves `HEAD`, a short name (`main`), or a fully-qualified ref
    /// (`refs/heads/main`, `refs/tags/v1`) to a commit hash. Follows
    /// symbolic refs recursively with a hop cap; missing refs resolve to
    /// `None`.
    pub async fn resolve_ref(&self, name: &str) -> Result<Option<String>, ParqueError> {
        let mut current = name.to_string();
        for _ in 0..MAX_SYMBOLIC_HOPS {
            let Some(content) = self.read_ref_target(&current).await? else {
                return Ok(None);
            };
            if looks_like_hash(&content) {
                return Ok(Some(content));
            }
            current = content;
        }
        Err(ParqueError::invariant(format!(
            "symbolic ref chain exceeds {MAX_SYMBOLIC_HOPS} hops resolving '{name}'"
        )))
    }

    async fn read_ref_target(&self, name: &str) -> Result<Option<String>, ParqueError> {
        let Some(path) = self.qualify(name).await? else {
            return Ok(None);
        };
        match self.storage.read(&path).await {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).trim().to_string())),
            Err(error) if error.is_not_found() => {
                // A fresh HEAD points at an unborn default branch.
                if name == "HEAD" {
                    Ok(Some(format!("refs/heads/{DEFAULT_BRANCH}")))
                } else {
                    Ok(None)
                }
            }
            Err(error) => Err(error),
        }
    }

    /// Maps a ref name to its storage path: `HEAD` and fully-qualified
    /// names directly, short names through heads then tags.
    async fn qualify(&self, name: &str) -> Result<Option<String>, ParqueError> {
        if name == "HEAD" {
            return Ok(Some(HEAD_PATH.to_string()));
        }
        if name.starts_with("refs/") {
            return Ok(Some(format!("_meta/{name}")));
        }
        let head = format!("_meta/refs/heads/{name}");
        if self.storage.exists(&head).await? {
            return Ok(Some(head));
        }
        let tag = format!("_meta/refs/tags/{name}");
        if self.storage.exists(&tag).await? {
            return Ok(Some(tag));
        }
        Ok(None)
    }

    /// Points a branch or tag at a commit hash. Direct `HEAD` updates are
    /// rejected; use `set_head`/`detach_head`.
    pub async fn update_ref(&self, name: &str, hash: &str) -> Result<(), ParqueError> {
        if name == "HEAD" {
            return Err(ParqueError::invariant(
                "HEAD cannot be updated directly; use set_head or detach_head",
            ));
        }
        if !self
            .storage
            .exists(&super::commit_path(hash))
            .await?
        {
            return Err(ParqueError::not_found(format!("commit {hash}")));
        }

        let qualified = if name.starts_with("refs/") {
            name.to_string()
        } else {
            format!("refs/heads/{name}")
        };
        let lock = self.ref_lock(&qualified);
        let _guard = lock.lock().await;
        self.storage
            .write(&format!("_meta/{qualified}"), hash.as_bytes())
            .await
    }

    pub async fn delete_ref(&self, name: &str) -> Result<bool, ParqueError> {
        if name == "HEAD" {
            return Err(ParqueError::invariant("HEAD cannot be deleted"));
        }
        let Some(path) = self.qualify(name).await? else {
            return Ok(false);
        };
        let lock = self.ref_lock(name);
        let _guard = lock.lock().await;
        self.storage.delete(&path).await
    }

    pub async fn get_head(&self) -> Result<HeadState, ParqueError> {
        match self.storage.read(HEAD_PATH).await {
            Ok(bytes) => {
                let content = String::from_utf8_lossy(&bytes).trim().to_string();
                if let Some(branch) = content.strip_prefix("refs/heads/") {
                    Ok(HeadState::Branch(branch.to_string()))
                } else {
                    Ok(HeadState::Detached(content))
                }
            }
            Err(error) if error.is_not_found() => {
                Ok(HeadState::Branch(DEFAULT_BRANCH.to_string()))
            }
            Err(error) => Err(error),
        }
    }

    pub async fn set_head(&self, branch: &str) -> Result<(), ParqueError> {
        self.storage
            .write(HEAD_PATH, format!("refs/heads/{branch}").as_bytes())
            .await
    }

    pub async fn detach_head(&self, hash: &str) -> Result<(), ParqueError> {
        if !self.storage.exists(&super::commit_path(hash)).await? {
            return Err(ParqueError::not_found(format!("commit {hash}")));
        }
        self.storage.write(HEAD_PATH, hash.as_bytes()).await
    }

    /// All branch names under `refs/heads/`.
    pub async fn branches(&self) -> Result<Vec<String>, ParqueError> {
        let listed = self.storage.list("_meta/refs/heads/").await?;
        Ok(listed
            .into_iter()
            .filter_map(|path| {
                path.strip_prefix("_meta/refs/heads/")
                    .map(str::to_string)
            })
            .collect())
    }
}

fn looks_like_hash(content: &str) -> bool {
    content.len() == 64 && content.chars().all(|c| c.is_ascii_hexdigit())
}
