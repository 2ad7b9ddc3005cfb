//! Deployment archive writer.
//!
//! Entries carry a fixed timestamp so identical inputs give identical bytes.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

/// Compiled binary entry.
pub const BINARY_ENTRY: &str = "Stratus.lambda.amd64";
/// Dispatch shim entry, the runtime's entry point.
pub const SHIM_ENTRY: &str = "bootstrap";

const EXECUTABLE: u32 = 0o755;
const REGULAR: u32 = 0o644;

/// Open archive accepting new entries until sealed.
pub struct ArchiveWriter {
    zip: ZipWriter<File>,
    path: PathBuf,
    entries: Vec<String>,
}

impl ArchiveWriter {
    pub fn create(path: &Path) -> Result<Self, String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("cannot create dir {}: {}", parent.display(), e))?;
        }
        let file = File::create(path)
            .map_err(|e| format!("cannot create archive {}: {}", path.display(), e))?;
        Ok(Self {
            zip: ZipWriter::new(file),
            path: path.to_path_buf(),
            entries: Vec::new(),
        })
    }

    fn options(mode: u32) -> SimpleFileOptions {
        SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(DateTime::default())
            .unix_permissions(mode)
    }

    fn add(&mut self, name: &str, bytes: &[u8], mode: u32) -> Result<(), String> {
        if self.entries.iter().any(|e| e == name) {
            return Err(format!("archive entry '{}' already written", name));
        }
        self.zip
            .start_file(name, Self::options(mode))
            .map_err(|e| format!("cannot start entry {}: {}", name, e))?;
        self.zip
            .write_all(bytes)
            .map_err(|e| format!("cannot write entry {}: {}", name, e))?;
        self.entries.push(name.to_string());
        Ok(())
    }

    /// Add a regular (non-executable) entry.
    pub fn add_bytes(&mut self, name: &str, bytes: &[u8]) -> Result<(), String> {
        self.add(name, bytes, REGULAR)
    }

    /// Add an executable entry.
    pub fn add_executable(&mut self, name: &str, bytes: &[u8]) -> Result<(), String> {
        self.add(name, bytes, EXECUTABLE)
    }

    /// Copy a local file into the archive.
    pub fn add_file(&mut self, name: &str, source: &Path, executable: bool) -> Result<(), String> {
        let bytes = std::fs::read(source)
            .map_err(|e| format!("cannot read {}: {}", source.display(), e))?;
        let mode = if executable { EXECUTABLE } else { REGULAR };
        self.add(name, &bytes, mode)
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Seal the archive and return its path.
    pub fn finish(self) -> Result<PathBuf, String> {
        self.zip
            .finish()
            .map_err(|e| format!("cannot finish archive {}: {}", self.path.display(), e))?;
        Ok(self.path)
    }
}

/// Zip every file under `dir`, keyed by its path relative to `dir`.
pub fn archive_directory(dir: &Path, output: &Path) -> Result<PathBuf, String> {
    let pattern = format!("{}/**/*", dir.display());
    let mut files: Vec<PathBuf> = glob::glob(&pattern)
        .map_err(|e| format!("invalid pattern {}: {}", pattern, e))?
        .filter_map(Result::ok)
        .filter(|p| p.is_file())
        .collect();
    files.sort();

    let mut writer = ArchiveWriter::create(output)?;
    for file in files {
        let relative = file
            .strip_prefix(dir)
            .map_err(|e| format!("cannot relativize {}: {}", file.display(), e))?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        writer.add_file(&name, &file, false)?;
    }
    writer.finish()
}
