//! Service account catalog
//!
//! Maps each remote to the ordered list of credential files found in its
//! configured folders. Ordering is by the index embedded in the file name
//! (`sa1.json`, `sa2.json`, `sa10.json`) so rotation is reproducible across
//! runs. The catalog is filled once at startup and read-only afterwards.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::env::service_account_env_var;

/// Directory listing used to discover credential files.
pub trait PathLister: Send + Sync {
    /// Files directly inside `folder` (non-recursive).
    ///
    /// The returned order breaks ties between files with the same sequence
    /// number, so implementations should make it deterministic.
    fn list_files(&self, folder: &Path) -> std::io::Result<Vec<PathBuf>>;
}

/// Lists files from the local filesystem, sorted by path.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsLister;

impl PathLister for FsLister {
    fn list_files(&self, folder: &Path) -> std::io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(folder)? {
            let path = entry?.path();
            if path.is_file() {
                files.push(path);
            }
        }
        // read_dir order is platform dependent
        files.sort();
        Ok(files)
    }
}

/// A single service account file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    /// Absolute path of the credential file
    pub path: String,
    pub remote_name: String,
    /// Index parsed from the file name, for ordering only
    pub sequence_hint: u64,
}

/// Ordered credentials for one remote.
#[derive(Debug, Clone)]
pub struct RemoteCredentials {
    pub remote_name: String,
    /// Env var the chosen credential path is exported under
    pub env_var: String,
    pub credentials: Vec<Credential>,
}

/// Credential files per remote.
#[derive(Debug, Clone)]
pub struct Catalog {
    folders: HashMap<String, Vec<PathBuf>>,
    env_prefix: String,
    remotes: HashMap<String, RemoteCredentials>,
}

impl Catalog {
    /// Create an empty catalog from `remote -> folders` configuration.
    pub fn new(folders: HashMap<String, Vec<PathBuf>>, env_prefix: impl Into<String>) -> Self {
        Self {
            folders,
            env_prefix: env_prefix.into(),
            remotes: HashMap::new(),
        }
    }

    /// Load credentials for every distinct remote named in `remote_paths`.
    ///
    /// Remotes without configured folders, with no `.json` files, or already
    /// loaded are skipped. A folder that cannot be listed is logged and
    /// skipped so other folders and remotes still load. Returns the number of
    /// remotes newly loaded.
    pub fn load<S: AsRef<str>>(&mut self, lister: &dyn PathLister, remote_paths: &[S]) -> usize {
        trace!("loading service accounts");
        let mut loaded = 0;

        for remote_path in remote_paths {
            let remote_path = remote_path.as_ref();
            if remote_path.is_empty() {
                continue;
            }

            let remote_name = common::remote_name(remote_path);
            if self.remotes.contains_key(remote_name) {
                continue;
            }

            let Some(folders) = self.folders.get(remote_name) else {
                trace!(remote = remote_name, "no service account folders configured, skipping");
                continue;
            };

            let mut credentials = Vec::new();
            for folder in folders {
                let found = discover(lister, folder, remote_name);
                if found.is_empty() {
                    trace!(remote = remote_name, folder = %folder.display(), "no service accounts found in folder");
                    continue;
                }
                credentials.extend(found);
            }

            if credentials.is_empty() {
                trace!(remote = remote_name, "no service accounts found, skipping");
                continue;
            }

            let entry = RemoteCredentials {
                remote_name: remote_name.to_string(),
                env_var: service_account_env_var(&self.env_prefix, remote_name),
                credentials,
            };
            debug!(
                remote = remote_name,
                count = entry.credentials.len(),
                env = %entry.env_var,
                "loaded service accounts"
            );
            self.remotes.insert(remote_name.to_string(), entry);
            loaded += 1;
        }

        loaded
    }

    /// Credentials for a remote name (not a `remote:path`).
    pub fn get(&self, remote_name: &str) -> Option<&RemoteCredentials> {
        self.remotes.get(remote_name)
    }

    /// All loaded remotes, in no particular order.
    pub fn remotes(&self) -> impl Iterator<Item = &RemoteCredentials> {
        self.remotes.values()
    }

    /// Prefix of the env vars credentials are exported under.
    pub fn env_prefix(&self) -> &str {
        &self.env_prefix
    }

    /// Remote names with configured folders, sorted.
    pub fn configured_remotes(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.folders.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of distinct credential files across all remotes.
    ///
    /// A folder shared by two remotes counts once.
    pub fn count(&self) -> usize {
        self.remotes
            .values()
            .flat_map(|r| r.credentials.iter().map(|c| c.path.as_str()))
            .collect::<HashSet<_>>()
            .len()
    }
}

/// List one folder's credential files in rotation order.
fn discover(lister: &dyn PathLister, folder: &Path, remote_name: &str) -> Vec<Credential> {
    let files = match lister.list_files(folder) {
        Ok(files) => files,
        Err(e) => {
            trace!(remote = remote_name, folder = %folder.display(), error = %e, "failed listing service account folder");
            return Vec::new();
        }
    };

    let mut named: Vec<(String, PathBuf)> = files
        .into_iter()
        .filter_map(|path| {
            let name = path.file_name()?.to_string_lossy().into_owned();
            name.to_lowercase().ends_with(".json").then_some((name, path))
        })
        .collect();

    // Stable: equal hints keep folder order, then listing order
    named.sort_by_key(|(name, _)| common::sequence_hint(name));

    named
        .into_iter()
        .map(|(name, path)| {
            let path = std::path::absolute(&path).unwrap_or(path);
            Credential {
                path: path.to_string_lossy().into_owned(),
                remote_name: remote_name.to_string(),
                sequence_hint: common::sequence_hint(&name),
            }
        })
        .collect()
}
