//! Filesystem layout helpers and atomic write operations
//!
//! Layout under the kernel root:
//!
//! ```text
//! config.json            kernel configuration
//! log/tick-000042.jsonl  one sealed tick segment, one JSON record per line
//! meta/segments.index    one JSON segment header per sealed tick
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};

use super::KernelConfig;
use super::record::Tick;

const SEGMENT_PREFIX: &str = "tick-";
const SEGMENT_SUFFIX: &str = ".jsonl";

/// Storage manager for kernel persistence
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Create a new storage manager
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Get the root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the config file path
    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// Get the meta directory path
    pub fn meta_dir(&self) -> PathBuf {
        self.root.join("meta")
    }

    /// Get the log directory path
    pub fn log_dir(&self) -> PathBuf {
        self.root.join("log")
    }

    /// Path of the sealed segment header index
    pub fn segment_index_path(&self) -> PathBuf {
        self.meta_dir().join("segments.index")
    }

    /// Path of the segment file for a tick
    pub fn segment_path(&self, tick: Tick) -> PathBuf {
        self.log_dir()
            .join(format!("{SEGMENT_PREFIX}{tick:06}{SEGMENT_SUFFIX}"))
    }

    /// Tick encoded in a segment file name, if it is one
    pub fn segment_tick(path: &Path) -> Option<Tick> {
        path.file_name()?
            .to_str()?
            .strip_prefix(SEGMENT_PREFIX)?
            .strip_suffix(SEGMENT_SUFFIX)?
            .parse()
            .ok()
    }

    /// Write data atomically to a file
    ///
    /// Creates a temporary file, writes the data, syncs, then renames
    pub fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        let temp_path = path.with_extension("tmp");

        let mut file = File::create(&temp_path)
            .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;

        file.write_all(data)
            .context("Failed to write data")?;

        file.sync_all()
            .context("Failed to sync file")?;

        drop(file);

        fs::rename(&temp_path, path)
            .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;

        self.sync_parent(path)
    }

    /// Append one line to a file and fsync it
    pub fn append_line(&self, path: &Path, line: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open for append: {:?}", path))?;

        file.write_all(line.as_bytes())
            .and_then(|_| file.write_all(b"\n"))
            .with_context(|| format!("Failed to append to {:?}", path))?;

        file.sync_all()
            .context("Failed to sync file")?;

        Ok(())
    }

    fn sync_parent(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            let dir = OpenOptions::new()
                .read(true)
                .open(parent)
                .with_context(|| format!("Failed to open directory: {:?}", parent))?;

            dir.sync_all()
                .context("Failed to sync directory")?;
        }
        Ok(())
    }

    /// Read a file
    pub fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path)
            .with_context(|| format!("Failed to read file: {:?}", path))
    }

    /// Create a directory and all parent directories
    pub fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory: {:?}", path))
    }

    /// List files in a directory
    pub fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = Vec::new();

        for entry in fs::read_dir(path)
            .with_context(|| format!("Failed to read directory: {:?}", path))?
        {
            let entry = entry?;
            entries.push(entry.path());
        }

        Ok(entries)
    }
}

/// Initialize storage directories for a new kernel
pub fn init_storage(root: &Path) -> Result<()> {
    let storage = Storage::new(root.to_path_buf());

    storage.create_dir_all(root)?;
    storage.create_dir_all(&storage.meta_dir())?;
    storage.create_dir_all(&storage.log_dir())?;

    Ok(())
}

/// Write kernel configuration under `root`
pub fn write_config(root: &Path, config: &KernelConfig) -> Result<()> {
    let storage = Storage::new(root.to_path_buf());
    let config_path = storage.config_path();

    let json = serde_json::to_vec_pretty(config)
        .context("Failed to serialize config")?;

    storage.write_atomic(&config_path, &json)?;

    Ok(())
}

/// Load kernel configuration from `root`
pub fn load_config(root: &Path) -> Result<KernelConfig> {
    let storage = Storage::new(root.to_path_buf());
    let config_path = storage.config_path();

    let data = storage.read_file(&config_path)?;
    let config: KernelConfig = serde_json::from_slice(&data)
        .context("Failed to deserialize config")?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_storage() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();

        init_storage(root).unwrap();

        assert!(root.join("meta").exists());
        assert!(root.join("log").exists());
    }

    #[test]
    fn test_write_and_read_config() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();

        init_storage(&root).unwrap();

        let config = KernelConfig {
            root: Some(root.clone()),
            tick_interval_ms: 50,
            poll_deadline_ms: 20,
            public_verbs: vec!["publish".into(), "post".into()],
        };

        write_config(&root, &config).unwrap();
        let loaded = load_config(&root).unwrap();

        assert_eq!(loaded.tick_interval_ms, 50);
        assert_eq!(loaded.poll_deadline_ms, 20);
        assert_eq!(loaded.public_verbs, vec!["publish", "post"]);
    }

    #[test]
    fn test_segment_paths() {
        let storage = Storage::new(PathBuf::from("/tmp/o"));
        let path = storage.segment_path(42);
        assert!(path.ends_with("log/tick-000042.jsonl"));
        assert_eq!(Storage::segment_tick(&path), Some(42));
        assert_eq!(Storage::segment_tick(Path::new("log/notes.txt")), None);
    }

    #[test]
    fn test_atomic_write_and_append() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::new(temp.path().to_path_buf());
        let test_file = temp.path().join("test.dat");

        storage.write_atomic(&test_file, b"Hello").unwrap();
        storage.append_line(&test_file, ", world").unwrap();

        let read_data = storage.read_file(&test_file).unwrap();
        assert_eq!(&read_data[..], b"Hello, world\n");
    }
}
