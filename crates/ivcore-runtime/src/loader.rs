//! Protocol files on disk.
//!
//! Protocols live under one directory, optionally in sub-folders, as
//! `*.yaml`, `*.yml` or `*.json`.  A protocol's id is its path relative to
//! that directory without the extension, e.g. `"dark_iv"` or
//! `"users/alice/light_soak"`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use ivcore_types::IvError;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::protocol::{ProtocolDocument, ProtocolStep};

const EXTENSIONS: [&str; 3] = ["yaml", "yml", "json"];

/// One entry of [`ProtocolLoader::list`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProtocolSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub version: String,
    pub filename: String,
    pub steps: usize,
    /// Set when the file could not be parsed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A parsed protocol and where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedProtocol {
    pub id: String,
    pub path: PathBuf,
    pub document: ProtocolDocument,
}

pub struct ProtocolLoader {
    dir: PathBuf,
    cache: Mutex<HashMap<String, LoadedProtocol>>,
}

impl ProtocolLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Every protocol file under the directory, sorted by id.  Files that
    /// fail to parse are still listed, with `error` set.
    pub fn list(&self) -> Vec<ProtocolSummary> {
        if !self.dir.is_dir() {
            warn!(dir = %self.dir.display(), "protocols directory does not exist");
            return Vec::new();
        }
        let mut files = Vec::new();
        collect_files(&self.dir, &mut files);

        let mut out: Vec<ProtocolSummary> = files
            .into_iter()
            .filter_map(|path| {
                let id = self.id_for(&path)?;
                let filename = path.file_name()?.to_string_lossy().into_owned();
                Some(match self.load(&id) {
                    Ok(p) => ProtocolSummary {
                        id,
                        name: p.document.name,
                        description: p.document.description,
                        version: p.document.version,
                        filename,
                        steps: p.document.steps.len(),
                        error: None,
                    },
                    Err(e) => {
                        warn!(file = %path.display(), error = %e, "unreadable protocol");
                        ProtocolSummary {
                            name: path
                                .file_stem()
                                .map(|s| s.to_string_lossy().into_owned())
                                .unwrap_or_default(),
                            id,
                            description: format!("Error: {e}"),
                            version: "?".into(),
                            filename,
                            steps: 0,
                            error: Some(e.to_string()),
                        }
                    }
                })
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Load a protocol by id, from the cache when possible.
    ///
    /// # Errors
    ///
    /// [`IvError::InvalidArgument`] for ids escaping the directory or naming
    /// no file, [`IvError::Persistence`] when the file cannot be read and
    /// [`IvError::Protocol`] when it is not a valid protocol.
    pub fn load(&self, id: &str) -> Result<LoadedProtocol, IvError> {
        if let Some(hit) = self.cache.lock().get(id) {
            return Ok(hit.clone());
        }
        let loaded = self.read(id)?;
        info!(
            id,
            name = %loaded.document.name,
            steps = loaded.document.steps.len(),
            "loaded protocol"
        );
        self.cache.lock().insert(id.to_string(), loaded.clone());
        Ok(loaded)
    }

    /// Load bypassing (and refreshing) the cache.
    pub fn reload(&self, id: &str) -> Result<LoadedProtocol, IvError> {
        self.cache.lock().remove(id);
        self.load(id)
    }

    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    fn id_for(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.dir).ok()?.with_extension("");
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }

    fn read(&self, id: &str) -> Result<LoadedProtocol, IvError> {
        if id.is_empty() || id.split('/').any(|part| part.is_empty() || part == "..") {
            return Err(IvError::InvalidArgument(format!("invalid protocol id '{id}'")));
        }
        let path = EXTENSIONS
            .iter()
            .map(|ext| self.dir.join(format!("{id}.{ext}")))
            .find(|p| p.is_file())
            .ok_or_else(|| IvError::InvalidArgument(format!("Protocol not found: {id}")))?;

        let text = fs::read_to_string(&path)
            .map_err(|e| IvError::Persistence(format!("{}: {e}", path.display())))?;
        let is_json = path.extension().is_some_and(|e| e == "json");
        let document = parse_document(&text, is_json, id)?;
        Ok(LoadedProtocol {
            id: id.to_string(),
            path,
            document,
        })
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, out);
        } else if path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| EXTENSIONS.contains(&e))
        {
            out.push(path);
        }
    }
}

/// Parse and shape-check a protocol document.  `fallback_name` is used when
/// the file has no `name`.
///
/// # Errors
///
/// [`IvError::Protocol`] describing the first structural problem.
pub fn parse_document(text: &str, json: bool, fallback_name: &str) -> Result<ProtocolDocument, IvError> {
    let invalid = |step: &str, details: String| IvError::Protocol {
        step: step.to_string(),
        details,
    };
    let raw: Value = if json {
        serde_json::from_str(text).map_err(|e| invalid("-", format!("invalid JSON: {e}")))?
    } else {
        serde_yaml::from_str(text).map_err(|e| invalid("-", format!("invalid YAML: {e}")))?
    };

    let Value::Object(map) = raw else {
        return Err(invalid("-", "protocol must be a mapping".into()));
    };
    let Some(steps) = map.get("steps") else {
        return Err(invalid("-", "protocol must have a 'steps' field".into()));
    };
    let Value::Array(items) = steps else {
        return Err(invalid("-", "protocol 'steps' must be a list".into()));
    };

    let mut parsed = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let path = (i + 1).to_string();
        if !item.is_object() {
            return Err(invalid(&path, "step must be a mapping".into()));
        }
        if !item.get("action").is_some_and(Value::is_string) {
            return Err(invalid(&path, "step must have an 'action' field".into()));
        }
        let step: ProtocolStep =
            serde_json::from_value(item.clone()).map_err(|e| invalid(&path, e.to_string()))?;
        parsed.push(step);
    }

    let text_field = |key: &str| match map.get(key) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };
    Ok(ProtocolDocument {
        name: text_field("name").unwrap_or_else(|| fallback_name.to_string()),
        description: text_field("description").unwrap_or_default(),
        version: text_field("version").unwrap_or_else(|| "1.0".into()),
        steps: parsed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DARK_IV: &str = r#"
name: Dark IV
description: Forward sweep in the dark
version: 2
steps:
  - action: smu/connect
    params: { address: MOCK, mock: true }
  - action: smu/sweep
    params: { start: 0, stop: 1, points: 5 }
    capture_as: iv
  - action: loop
    params: { variable: px, items: [1, 2] }
    steps:
      - action: relays/pixel
        params: { pixel_id: "$px" }
"#;

    fn write(dir: &Path, rel: &str, text: &str) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, text).unwrap();
    }

    #[test]
    fn parses_yaml_documents() {
        let doc = parse_document(DARK_IV, false, "fallback").unwrap();
        assert_eq!(doc.name, "Dark IV");
        assert_eq!(doc.version, "2");
        assert_eq!(doc.steps.len(), 3);
        assert_eq!(doc.steps[1].capture_as.as_deref(), Some("iv"));
        assert_eq!(doc.steps[2].steps[0].params["pixel_id"], "$px");
    }

    #[test]
    fn shape_errors_name_the_step() {
        let err = parse_document("steps:\n  - action: wait\n  - params: {}\n", false, "x").unwrap_err();
        assert!(matches!(err, IvError::Protocol { ref step, .. } if step == "2"), "{err}");

        assert!(parse_document("name: no steps\n", false, "x").is_err());
        assert!(parse_document("steps: 3\n", false, "x").is_err());
        assert!(parse_document("[1, 2]", true, "x").is_err());
    }

    #[test]
    fn json_documents_use_fallback_name() {
        let doc = parse_document(r#"{"steps": [{"action": "wait"}]}"#, true, "quick").unwrap();
        assert_eq!(doc.name, "quick");
        assert_eq!(doc.version, "1.0");
    }

    #[test]
    fn lists_recursively_including_broken_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "dark_iv.yaml", DARK_IV);
        write(dir.path(), "users/alice/soak.json", r#"{"name": "Soak", "steps": []}"#);
        write(dir.path(), "broken.yml", "steps: [unclosed");
        write(dir.path(), "notes.txt", "ignored");

        let loader = ProtocolLoader::new(dir.path());
        let list = loader.list();
        let ids: Vec<&str> = list.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["broken", "dark_iv", "users/alice/soak"]);
        assert!(list[0].error.is_some());
        assert_eq!(list[1].steps, 3);
        assert_eq!(list[2].name, "Soak");
    }

    #[test]
    fn cache_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "p.yaml", "name: one\nsteps: []\n");
        let loader = ProtocolLoader::new(dir.path());
        assert_eq!(loader.load("p").unwrap().document.name, "one");

        write(dir.path(), "p.yaml", "name: two\nsteps: []\n");
        assert_eq!(loader.load("p").unwrap().document.name, "one");
        assert_eq!(loader.reload("p").unwrap().document.name, "two");

        write(dir.path(), "p.yaml", "name: three\nsteps: []\n");
        loader.clear_cache();
        assert_eq!(loader.load("p").unwrap().document.name, "three");
    }

    #[test]
    fn ids_cannot_escape_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ProtocolLoader::new(dir.path().join("protocols"));
        assert!(matches!(loader.load("../secret"), Err(IvError::InvalidArgument(_))));
        assert!(matches!(loader.load("missing"), Err(IvError::InvalidArgument(_))));
        assert!(loader.list().is_empty());
    }
}
