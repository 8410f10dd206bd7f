//! `.txt` directory loader.
//!
//! Walks a directory tree and yields one [`Document`] per `.txt` file. The
//! document id is the path relative to the root without extension, so a file
//! edited in place supersedes its previous chunks on re-ingestion. The parent
//! directory becomes the `category` facet.
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::traits::DocumentLoader;
use crate::types::{Document, Payload};

pub struct TxtDirectoryLoader {
    root: PathBuf,
    limit: Option<usize>,
}

impl TxtDirectoryLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), limit: None }
    }

    /// Only load the first `limit` files (in path order).
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn list_txt_files(&self) -> Vec<PathBuf> {
        let mut txt_files: Vec<PathBuf> = walkdir::WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|e| e.map_err(|err| warn!(error = %err, "skipping unreadable entry")).ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("txt"))
            .collect();
        txt_files.sort();
        if let Some(limit) = self.limit {
            txt_files.truncate(limit);
        }
        txt_files
    }

    fn read_file_content(&self, file_path: &Path) -> Result<String> {
        match fs::read_to_string(file_path) {
            Ok(content) => Ok(content),
            Err(_) => {
                let bytes = fs::read(file_path)
                    .map_err(|e| Error::Operation(format!("reading {}: {}", file_path.display(), e)))?;
                Ok(String::from_utf8_lossy(&bytes).to_string())
            }
        }
    }

    fn doc_id(&self, file_path: &Path) -> String {
        let relative = file_path.strip_prefix(&self.root).unwrap_or(file_path);
        relative.with_extension("").to_string_lossy().replace('\\', "/")
    }

    fn category(&self, file_path: &Path) -> String {
        let relative = file_path.strip_prefix(&self.root).unwrap_or(file_path);
        match relative.parent().and_then(|p| p.to_str()) {
            Some(facet) if !facet.is_empty() => facet.replace('\\', "/"),
            _ => "misc".to_string(),
        }
    }
}

impl DocumentLoader for TxtDirectoryLoader {
    fn load(&self) -> Result<Vec<Document>> {
        let files = self.list_txt_files();
        if files.is_empty() {
            info!(root = %self.root.display(), "no .txt files found");
            return Ok(Vec::new());
        }
        let mut documents = Vec::with_capacity(files.len());
        for (i, file_path) in files.iter().enumerate() {
            debug!(file = %file_path.display(), n = i + 1, total = files.len(), "loading");
            let content = self.read_file_content(file_path)?;
            let mut metadata = Payload::new();
            metadata.insert("path".into(), Value::from(file_path.to_string_lossy().to_string()));
            metadata.insert("category".into(), Value::from(self.category(file_path)));
            documents.push(Document::new(content).with_id(self.doc_id(file_path)).with_metadata(metadata));
        }
        info!(files = documents.len(), root = %self.root.display(), "loaded documents");
        Ok(documents)
    }
}
