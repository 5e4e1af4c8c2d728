use std::path::{Path, PathBuf};

use anyhow::Result;
use tempfile::TempDir;

pub struct TestDirs {
    _temp: TempDir,
    pub workspace: PathBuf,
    pub cache_dir: Option<PathBuf>,
}

impl TestDirs {
    pub fn new() -> Result<Self> {
        let temp = TempDir::new()?;
        let workspace = temp.path().to_path_buf();
        Ok(Self {
            _temp: temp,
            workspace,
            cache_dir: None,
        })
    }

    pub fn enable_cache_dir(&mut self) -> Result<&Path> {
        if self.cache_dir.is_none() {
            let cache_dir = self.workspace.join("http_cache");
            std::fs::create_dir_all(&cache_dir)?;
            self.cache_dir = Some(cache_dir);
        }
        Ok(self.cache_dir.as_deref().expect("cache_dir set"))
    }

    /// Count committed cache records (body files, excluding metadata) under
    /// the two-level shard layout.
    pub fn cache_record_count(&self) -> usize {
        let Some(cache_dir) = &self.cache_dir else {
            return 0;
        };
        let mut count = 0;
        let Ok(shard1_entries) = std::fs::read_dir(cache_dir) else {
            return 0;
        };
        for shard1 in shard1_entries.flatten() {
            if !shard1.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let Ok(shard2_entries) = std::fs::read_dir(shard1.path()) else {
                continue;
            };
            for shard2 in shard2_entries.flatten() {
                if !shard2.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    continue;
                }
                let Ok(files) = std::fs::read_dir(shard2.path()) else {
                    continue;
                };
                count += files
                    .flatten()
                    .filter(|file| {
                        file.path().extension().and_then(|ext| ext.to_str()) != Some("meta")
                    })
                    .count();
            }
        }
        count
    }
}
