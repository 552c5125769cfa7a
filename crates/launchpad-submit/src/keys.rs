//! Client public keys returned by remote initialisation.
//!
//! Each install target gets one key file,
//! `<service_dir>/client_public_keys/client_<target>.key`. The scheduler's
//! server only accepts connections from keys in the allowlist, which is
//! rebuilt from those files.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::{debug, info, warn};

pub const KEY_DIR: &str = "client_public_keys";

pub trait KeyStore: Send + Sync {
    /// Persist the key for `install_target` and make it acceptable to the
    /// server before returning.
    fn write_client_key(&self, install_target: &str, key: &str) -> io::Result<()>;

    /// Rebuild the allowlist from the persisted keys.
    fn reconfigure(&self) -> io::Result<usize>;

    /// True when a connection presenting `key` should be accepted.
    fn is_authorized(&self, key: &str) -> bool;
}

/// [`KeyStore`] keeping keys as files under the service directory.
pub struct FileKeyStore {
    dir: PathBuf,
    /// install target → key
    allowlist: RwLock<BTreeMap<String, String>>,
}

impl FileKeyStore {
    pub fn new(service_dir: &Path) -> Self {
        Self {
            dir: service_dir.join(KEY_DIR),
            allowlist: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn key_path(&self, install_target: &str) -> PathBuf {
        self.dir.join(format!("client_{install_target}.key"))
    }

    /// Install targets currently accepted.
    pub fn targets(&self) -> Vec<String> {
        self.allowlist
            .read()
            .expect("key allowlist lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    fn load(&self) -> io::Result<BTreeMap<String, String>> {
        let mut keys = BTreeMap::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let path = entry?.path();
            let Some(target) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("client_"))
                .and_then(|n| n.strip_suffix(".key"))
            else {
                continue;
            };
            match fs::read_to_string(&path) {
                Ok(key) => {
                    keys.insert(target.to_string(), key.trim().to_string());
                }
                Err(e) => warn!(path = %path.display(), error = %e, "unreadable client key"),
            }
        }
        Ok(keys)
    }
}

impl KeyStore for FileKeyStore {
    fn write_client_key(&self, install_target: &str, key: &str) -> io::Result<()> {
        // Hold the write lock across write + reload so no accept decision
        // sees the file without the allowlist entry.
        let mut allowlist = self.allowlist.write().expect("key allowlist lock poisoned");

        fs::create_dir_all(&self.dir)?;
        let path = self.key_path(install_target);
        let mut opts = fs::OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }
        let mut file = opts.open(&path)?;
        file.write_all(key.as_bytes())?;
        file.sync_all()?;

        *allowlist = self.load()?;
        info!(install_target, path = %path.display(), "client key installed");
        Ok(())
    }

    fn reconfigure(&self) -> io::Result<usize> {
        let mut allowlist = self.allowlist.write().expect("key allowlist lock poisoned");
        *allowlist = self.load()?;
        debug!(keys = allowlist.len(), "key allowlist reloaded");
        Ok(allowlist.len())
    }

    fn is_authorized(&self, key: &str) -> bool {
        let key = key.trim();
        self.allowlist
            .read()
            .expect("key allowlist lock poisoned")
            .values()
            .any(|k| k == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn written_key_is_authorized() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::new(dir.path());
        assert!(!store.is_authorized("abc123"));

        store.write_client_key("hpc", "abc123").unwrap();
        assert!(store.is_authorized("abc123"));
        assert_eq!(
            fs::read_to_string(store.key_path("hpc")).unwrap(),
            "abc123"
        );
        assert_eq!(store.targets(), ["hpc"]);
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::new(dir.path());
        store.write_client_key("hpc", "k").unwrap();
        let mode = fs::metadata(store.key_path("hpc")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn reconfigure_picks_up_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let keys = dir.path().join(KEY_DIR);
        fs::create_dir_all(&keys).unwrap();
        fs::write(keys.join("client_a.key"), "ka\n").unwrap();
        fs::write(keys.join("notes.txt"), "ignored").unwrap();

        let store = FileKeyStore::new(dir.path());
        assert_eq!(store.reconfigure().unwrap(), 1);
        assert!(store.is_authorized("ka"));
    }

    #[test]
    fn rewriting_replaces_old_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::new(dir.path());
        store.write_client_key("hpc", "old").unwrap();
        store.write_client_key("hpc", "new").unwrap();
        assert!(!store.is_authorized("old"));
        assert!(store.is_authorized("new"));
    }
}
