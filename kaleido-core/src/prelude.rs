use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::CoreError;

/// Extension of kaleido source files.
pub const SOURCE_EXTENSION: &str = "kal";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreludeFile {
    /// Path relative to the prelude root.
    pub path: PathBuf,
    pub contents: String,
}

pub fn default_prelude_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../prelude")
}

/// Collect every `.kal` file below `root`, ordered by path.
pub fn load_prelude_files(root: impl AsRef<Path>) -> Result<Vec<PreludeFile>, CoreError> {
    let root = root.as_ref();
    if !root.is_dir() {
        return Err(CoreError::MissingPrelude(root.to_path_buf()));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let path = entry.path();
        if entry.file_type().is_file()
            && path.extension().is_some_and(|ext| ext == SOURCE_EXTENSION)
        {
            let contents = fs::read_to_string(path)?;
            let relative = path.strip_prefix(root).unwrap_or(path).to_path_buf();
            files.push(PreludeFile {
                path: relative,
                contents,
            });
        }
    }
    Ok(files)
}
