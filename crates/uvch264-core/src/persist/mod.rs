//! Parameter-set persistence.
//!
//! The cache is a blob per device identity: the current SPS NAL followed by
//! the current PPS NAL, both Annex-B framed. Persistence is best effort; a
//! missing or unreadable blob means "use the built-in defaults".

pub mod background;

use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::config::PersistenceConfig;
use crate::media::params::{self, MAX_PARAM_SET_LEN};

/// Upper bound on the bytes read back from a stored blob.
pub const MAX_BLOB_LEN: usize = MAX_PARAM_SET_LEN * 2;

/// Key-value storage for SPS/PPS blobs.
pub trait ParamSetStore: Send + Sync {
    /// Raw blob for `key`, `Ok(None)` when nothing has been stored yet.
    fn read(&self, key: &str) -> io::Result<Option<Vec<u8>>>;

    /// Replace the blob for `key`.
    fn write(&self, key: &str, blob: &[u8]) -> io::Result<()>;

    /// Stored `(sps, pps)` for `key`. Any failure, or a blob missing either
    /// set, is reported as `None`.
    fn load(&self, key: &str) -> Option<(Vec<u8>, Vec<u8>)> {
        let blob = match self.read(key) {
            Ok(Some(blob)) => blob,
            Ok(None) => {
                debug!("No stored parameter sets for device '{}'", key);
                return None;
            }
            Err(e) => {
                warn!("Failed to read stored parameter sets for '{}': {}", key, e);
                return None;
            }
        };
        match params::split_blob(&blob) {
            (Some(sps), Some(pps)) => Some((sps.to_vec(), pps.to_vec())),
            _ => {
                warn!(
                    "Stored parameter sets for '{}' are incomplete ({} bytes), ignoring",
                    key,
                    blob.len()
                );
                None
            }
        }
    }

    /// Persist `sps` followed by `pps` under `key`.
    fn store(&self, key: &str, sps: &[u8], pps: &[u8]) -> io::Result<()> {
        let mut blob = Vec::with_capacity(sps.len() + pps.len());
        blob.extend_from_slice(sps);
        blob.extend_from_slice(pps);
        self.write(key, &blob)
    }
}

/// Reduce a device identity to a single safe path component.
fn file_name(key: &str) -> String {
    let name: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match name.as_str() {
        "" | "." | ".." => "default".to_string(),
        _ => name,
    }
}

/// One file per device under a private directory (`$HOME/.spspps` by default).
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `$HOME/.spspps`, or `.spspps` relative to the working directory when
    /// `HOME` is unset.
    pub fn default_dir() -> PathBuf {
        match std::env::var_os("HOME") {
            Some(home) => Path::new(&home).join(".spspps"),
            None => {
                warn!("HOME is not set, storing parameter sets under ./.spspps");
                PathBuf::from(".spspps")
            }
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(file_name(key))
    }

    fn staging_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!(".{}.tmp", file_name(key)))
    }

    fn ensure_dir(&self) -> io::Result<()> {
        if self.dir.is_dir() {
            return Ok(());
        }
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        builder.create(&self.dir)?;
        debug!("Created parameter-set directory {}", self.dir.display());
        Ok(())
    }
}

impl ParamSetStore for FileStore {
    fn read(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        let file = match fs::File::open(self.path_for(key)) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let mut blob = Vec::new();
        file.take(MAX_BLOB_LEN as u64).read_to_end(&mut blob)?;
        Ok(Some(blob))
    }

    fn write(&self, key: &str, blob: &[u8]) -> io::Result<()> {
        self.ensure_dir()?;
        let path = self.path_for(key);
        // Write-then-rename so a reader never sees half a pair.
        let tmp = self.staging_path(key);
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(blob)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)
    }
}

/// Store described by `config`, or `None` when persistence is disabled.
pub fn open(config: &PersistenceConfig) -> io::Result<Option<Arc<dyn ParamSetStore>>> {
    if !config.enabled {
        info!("Parameter-set persistence disabled");
        return Ok(None);
    }
    let dir = config.dir.clone().unwrap_or_else(FileStore::default_dir);
    debug!("Parameter-set store at {}", dir.display());
    let files: Arc<dyn ParamSetStore> = Arc::new(FileStore::new(dir));
    if config.background {
        Ok(Some(Arc::new(background::BackgroundStore::spawn(files)?)))
    } else {
        Ok(Some(files))
    }
}

/// In-process store, for tests and for hosts that manage persistence
/// themselves.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ParamSetStore for MemoryStore {
    fn read(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        let blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
        Ok(blobs.get(key).cloned())
    }

    fn write(&self, key: &str, blob: &[u8]) -> io::Result<()> {
        let mut blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
        blobs.insert(key.to_string(), blob.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS: [u8; 8] = [0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1F];
    const PPS: [u8; 7] = [0x00, 0x00, 0x00, 0x01, 0x68, 0xCE, 0x38];

    #[test]
    fn file_name_is_a_single_component() {
        assert_eq!(file_name("0"), "0");
        assert_eq!(file_name("usb-1.2:cam"), "usb-1.2_cam");
        assert_eq!(file_name("../etc/passwd"), ".._etc_passwd");
        assert_eq!(file_name(".."), "default");
        assert_eq!(file_name(""), "default");
    }

    #[test]
    fn file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("spspps"));

        assert_eq!(store.load("0"), None);
        store.store("0", &SPS, &PPS).unwrap();
        assert_eq!(store.load("0"), Some((SPS.to_vec(), PPS.to_vec())));
        assert!(store.path_for("0").exists());
        assert!(!store.staging_path("0").exists());
    }

    #[test]
    fn file_store_loads_pps_first_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.store("cam", &PPS, &SPS).unwrap();
        assert_eq!(store.load("cam"), Some((SPS.to_vec(), PPS.to_vec())));
    }

    #[test]
    fn devices_do_not_clobber_each_other() {
        let store = MemoryStore::new();
        store.store("a", &SPS, &PPS).unwrap();
        let other_sps = [0x00, 0x00, 0x00, 0x01, 0x67, 0x4D];
        store.store("b", &other_sps, &PPS).unwrap();
        assert_eq!(store.load("a").map(|(s, _)| s), Some(SPS.to_vec()));
        assert_eq!(store.load("b").map(|(s, _)| s), Some(other_sps.to_vec()));
    }

    #[test]
    fn incomplete_blob_loads_as_none() {
        let store = MemoryStore::new();
        store.write("0", &SPS).unwrap();
        assert_eq!(store.load("0"), None);
    }

    #[test]
    fn unwritable_location_is_an_error_not_a_panic() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();
        let store = FileStore::new(blocker.join("nested"));
        assert!(store.store("0", &SPS, &PPS).is_err());
        assert_eq!(store.load("0"), None);
    }

    #[test]
    fn open_honours_config() {
        let dir = tempfile::tempdir().unwrap();
        let disabled = PersistenceConfig {
            enabled: false,
            ..PersistenceConfig::default()
        };
        assert!(open(&disabled).unwrap().is_none());

        for background in [false, true] {
            let config = PersistenceConfig {
                enabled: true,
                dir: Some(dir.path().to_path_buf()),
                background,
            };
            let key = if background { "bg" } else { "fg" };
            {
                let store = open(&config).unwrap().unwrap();
                store.store(key, &SPS, &PPS).unwrap();
            }
            let files = FileStore::new(dir.path());
            assert_eq!(files.load(key), Some((SPS.to_vec(), PPS.to_vec())));
        }
    }

    #[cfg(unix)]
    #[test]
    fn directory_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("private"));
        store.store("0", &SPS, &PPS).unwrap();
        let mode = fs::metadata(store.dir()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
