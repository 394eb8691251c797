//! A small persistent key-value store, one JSON file per key.

use std::fs;
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::warn;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{HyperError, Result};
use crate::Dict;

/// Hex encoded sha256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().iter().map(|b| format!("{:02x}", b)).collect()
}

/// Values stored under string keys, either in `directory` or, without one,
/// only in memory. Unreadable entries behave as missing.
#[derive(Debug)]
pub struct DiskDict<V> {
    directory: Option<PathBuf>,
    mem: Mutex<Dict<String, String>>,
    _value: PhantomData<fn() -> V>,
}

impl<V: Serialize + DeserializeOwned> DiskDict<V> {
    pub fn new(directory: Option<PathBuf>) -> Result<Self> {
        if let Some(dir) = &directory {
            fs::create_dir_all(dir)?;
        }
        Ok(DiskDict {
            directory,
            mem: Mutex::new(Dict::default()),
            _value: PhantomData,
        })
    }

    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    fn file(&self, key: &str) -> Option<PathBuf> {
        self.directory.as_ref().map(|dir| dir.join(format!("{}.json", key)))
    }

    fn check_key(key: &str) -> Result<()> {
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(HyperError::Cache(format!("invalid key '{}'", key)));
        }
        Ok(())
    }

    fn read_raw(&self, key: &str) -> Option<String> {
        match self.file(key) {
            Some(file) => fs::read_to_string(file).ok(),
            None => self.mem.lock().ok().and_then(|m| m.get(key).cloned()),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let raw = self.read_raw(key)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("ignoring corrupt cache entry {}: {}", key, e);
                None
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Store `value` under `key`, replacing any previous entry.
    pub fn insert(&self, key: &str, value: &V) -> Result<()> {
        Self::check_key(key)?;
        let raw = serde_json::to_string(value)?;
        match self.file(key) {
            Some(file) => {
                // write then rename so readers never see a partial entry
                let tmp = file.with_extension(format!("tmp{}", std::process::id()));
                let written = fs::File::create(&tmp)
                    .and_then(|mut f| {
                        f.write_all(raw.as_bytes())?;
                        f.sync_all()
                    })
                    .and_then(|_| fs::rename(&tmp, &file));
                if let Err(e) = written {
                    let _ = fs::remove_file(&tmp);
                    return Err(e.into());
                }
            }
            None => {
                self.mem
                    .lock()
                    .map_err(|_| HyperError::Cache("memory cache poisoned".to_string()))?
                    .insert(key.to_string(), raw);
            }
        }
        Ok(())
    }

    /// Remove every entry, and the directory itself if there is one.
    pub fn cleanup(&self) -> Result<()> {
        if let Some(dir) = &self.directory {
            if dir.exists() {
                fs::remove_dir_all(dir)?;
            }
        }
        if let Ok(mut m) = self.mem.lock() {
            m.clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store() {
        let d: DiskDict<Vec<u32>> = DiskDict::new(None).unwrap();
        assert!(!d.contains("abc"));
        d.insert("abc", &vec![1, 2, 3]).unwrap();
        assert_eq!(d.get("abc"), Some(vec![1, 2, 3]));
        assert!(d.insert("../escape", &vec![]).is_err());
        d.cleanup().unwrap();
        assert!(d.get("abc").is_none());
    }

    #[test]
    fn disk_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("paths");
        let key = sha256_hex(b"ab,bc->ac");
        assert_eq!(key.len(), 64);
        {
            let d: DiskDict<Vec<u32>> = DiskDict::new(Some(path.clone())).unwrap();
            d.insert(&key, &vec![4, 5]).unwrap();
        }
        let d: DiskDict<Vec<u32>> = DiskDict::new(Some(path.clone())).unwrap();
        assert_eq!(d.get(&key), Some(vec![4, 5]));
        assert_eq!(fs::read_dir(&path).unwrap().count(), 1);

        fs::write(path.join("broken.json"), "{not json").unwrap();
        assert!(d.get("broken").is_none());

        d.cleanup().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn failed_write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let d: DiskDict<Vec<u32>> = DiskDict::new(Some(dir.path().to_path_buf())).unwrap();
        // a directory in the way makes the final rename fail
        fs::create_dir(dir.path().join("taken.json")).unwrap();
        fs::write(dir.path().join("taken.json").join("inner"), "x").unwrap();
        assert!(d.insert("taken", &vec![1]).is_err());
        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["taken.json".to_string()]);
    }
}
