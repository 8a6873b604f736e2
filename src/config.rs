//! Flat key/value settings. Keys are matched case-insensitively and looked
//! up first under a caller-supplied prefix, then bare.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

#[derive(Clone, Default, Debug)]
pub struct Config {
    entries: HashMap<String, String>,
}

impl Config {
    pub fn new() -> Config {
        Config::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Config
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut cfg = Config::new();
        for (k, v) in pairs {
            cfg.set(k.into(), v.into());
        }
        cfg
    }

    /// Reads `key = value` lines. Blank lines and `#` comments are skipped;
    /// anything else without `=` is ignored with a warning.
    pub fn from_file(path: &Path) -> std::io::Result<Config> {
        let mut cfg = Config::new();
        for line in BufReader::new(File::open(path)?).lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            match line.split_once('=') {
                Some((k, v)) => cfg.set(k.trim().to_string(), v.trim().to_string()),
                None => warn!("ignoring config line without '=': {}", line),
            }
        }
        Ok(cfg)
    }

    pub fn set(&mut self, key: String, value: String) {
        self.entries.insert(key.to_ascii_lowercase(), value);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&key.to_ascii_lowercase())
            .map(|s| s.as_str())
    }

    /// `<prefix>.<key>` if present, then bare `<key>`.
    pub fn lookup(&self, prefix: Option<&str>, key: &str) -> Option<&str> {
        if let Some(pref) = prefix {
            if let Some(v) = self.get(&format!("{}.{}", pref, key)) {
                return Some(v);
            }
        }
        self.get(key)
    }

    pub fn lookup_bool(&self, prefix: Option<&str>, key: &str) -> bool {
        matches!(
            self.lookup(prefix, key).map(|v| v.to_ascii_lowercase()),
            Some(ref v) if v == "1" || v == "true" || v == "yes" || v == "on"
        )
    }

    /// Primary data directory for a partition prefix.
    pub fn data_dir(&self, prefix: Option<&str>) -> Option<PathBuf> {
        for key in [
            "activeDir",
            "dataDir1",
            "activeDirectory",
            "dataDir",
            "dataDirectory",
            "indexDirectory",
        ] {
            if let Some(v) = self.lookup(prefix, key) {
                return Some(PathBuf::from(v));
            }
        }
        None
    }

    /// Peer directory for a partition prefix.
    pub fn backup_dir(&self, prefix: Option<&str>) -> Option<PathBuf> {
        for key in ["backupDir", "dataDir2", "backupDirectory"] {
            if let Some(v) = self.lookup(prefix, key) {
                return Some(PathBuf::from(v));
            }
        }
        None
    }

    /// Whether backup-directory maintenance is enabled for the named table.
    pub fn use_backup_dir(&self, table: &str) -> bool {
        self.lookup_bool(None, &format!("table.{}.useBackupDir", table))
            || self.lookup_bool(None, &format!("table.{}.useShadowDir", table))
    }

    pub fn long_tests(&self, prefix: Option<&str>) -> bool {
        self.lookup_bool(prefix, "longTests")
    }

    pub fn test_index_speed(&self, prefix: Option<&str>) -> bool {
        self.lookup_bool(prefix, "testIndexSpeed")
    }

    pub fn random_tests(&self, prefix: Option<&str>) -> bool {
        self.lookup_bool(prefix, "randomTests")
    }

    /// Whether to synthesize row identifiers for the named partition.
    pub fn fill_rids(&self, name: &str) -> bool {
        self.lookup_bool(Some(name), "fillRIDs")
    }

    /// Target path for dumping index bitmaps on load, if configured.
    pub fn export_bitmap_as_csr(&self) -> Option<&str> {
        self.get("exportBitmapAsCsr")
    }
}
