//! Input bundles: the compiler's virtual filesystem.
//!
//! A bundle parametrizes all file I/O so the rest of the pipeline is pure.
//! Two implementations: the real filesystem, and an in-memory map for
//! standard-JSON inputs.

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::CompileError;

/// Sentinel source id for files loaded from the embedded builtin package.
pub const BUILTIN: i32 = -2;

/// One resolved compiler input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInput {
    /// Unique id within the compilation (stable across re-loads of the
    /// same resolved path).
    pub source_id: i32,
    /// The path that was asked for.
    pub path: PathBuf,
    /// The path it resolved to.
    pub resolved_path: PathBuf,
    /// File contents.
    pub contents: String,
}

impl FileInput {
    /// Hex sha256 of the contents.
    pub fn sha256sum(&self) -> String {
        sha256sum(&self.contents)
    }

    /// Whether this input came from the builtin package.
    pub fn from_builtin(&self) -> bool {
        self.source_id == BUILTIN
    }
}

/// A JSON compiler input (ABI interface files).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonInput {
    /// The underlying file.
    pub file: FileInput,
    /// Parsed JSON payload.
    pub data: serde_json::Value,
}

/// Hex-encoded sha256 of a string, the hash the import system uses
/// throughout.
pub fn sha256sum(s: &str) -> String {
    hex::encode(Sha256::digest(s.as_bytes()))
}

/// The virtual filesystem interface.
pub trait InputBundle {
    /// Search for `path` along the bundle's search paths (last added wins)
    /// and load it.
    fn load_file(&mut self, path: &Path) -> Result<FileInput, CompileError>;

    /// Current search paths, lowest precedence first.
    fn search_paths(&self) -> Vec<PathBuf>;

    /// Replace the search paths, returning the previous set.
    fn set_search_paths(&mut self, paths: Vec<PathBuf>) -> Vec<PathBuf>;

    /// Load and parse a JSON file.
    fn load_json_file(&mut self, path: &Path) -> Result<JsonInput, CompileError> {
        let file = self.load_file(path)?;
        let data = serde_json::from_str(&file.contents).map_err(|e| {
            CompileError::json(format!(
                "invalid json in {}: {e}",
                file.resolved_path.display()
            ))
        })?;
        Ok(JsonInput { file, data })
    }

    /// Run `f` with a temporarily replaced search-path list.
    fn with_search_paths<T>(
        &mut self,
        paths: Vec<PathBuf>,
        f: impl FnOnce(&mut Self) -> T,
    ) -> T
    where
        Self: Sized,
    {
        let saved = self.set_search_paths(paths);
        let out = f(self);
        self.set_search_paths(saved);
        out
    }

    /// Run `f` with one extra search path of highest precedence.
    fn with_extra_search_path<T>(
        &mut self,
        path: PathBuf,
        f: impl FnOnce(&mut Self) -> T,
    ) -> T
    where
        Self: Sized,
    {
        let mut paths = self.search_paths();
        paths.push(path);
        self.with_search_paths(paths, f)
    }
}

// interns resolved paths to stable source ids
#[derive(Debug, Default)]
struct SourceIds {
    ids: HashMap<PathBuf, i32>,
    counter: i32,
}

impl SourceIds {
    fn get(&mut self, resolved: &Path) -> i32 {
        if let Some(&id) = self.ids.get(resolved) {
            return id;
        }
        let id = self.counter;
        self.counter += 1;
        self.ids.insert(resolved.to_path_buf(), id);
        id
    }
}

fn not_found(path: &Path, tried: &[PathBuf]) -> CompileError {
    let mut msg = format!(
        "could not find {} in any of the following locations:",
        path.display()
    );
    for t in tried {
        msg.push_str(&format!("\n  {}", t.display()));
    }
    CompileError::module_not_found(msg, None)
}

/// Bundle backed by the real filesystem.
#[derive(Debug, Default)]
pub struct FilesystemInputBundle {
    search_paths: Vec<PathBuf>,
    source_ids: SourceIds,
}

impl FilesystemInputBundle {
    /// A bundle with the given search paths (lowest precedence first).
    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        FilesystemInputBundle {
            search_paths,
            source_ids: SourceIds::default(),
        }
    }
}

impl InputBundle for FilesystemInputBundle {
    fn load_file(&mut self, path: &Path) -> Result<FileInput, CompileError> {
        let mut tried = Vec::new();
        for sp in self.search_paths.iter().rev() {
            let to_try = sp.join(path);
            let resolved = match to_try.canonicalize() {
                Ok(p) => p,
                Err(_) => {
                    tried.push(to_try);
                    continue;
                }
            };
            match std::fs::read_to_string(&resolved) {
                Ok(contents) => {
                    let source_id = self.source_ids.get(&resolved);
                    return Ok(FileInput {
                        source_id,
                        path: path.to_path_buf(),
                        resolved_path: resolved,
                        contents,
                    });
                }
                Err(_) => tried.push(to_try),
            }
        }
        Err(not_found(path, &tried))
    }

    fn search_paths(&self) -> Vec<PathBuf> {
        self.search_paths.clone()
    }

    fn set_search_paths(&mut self, paths: Vec<PathBuf>) -> Vec<PathBuf> {
        std::mem::replace(&mut self.search_paths, paths)
    }
}

// lexically normalize `a/b/../c` -> `a/c` (no filesystem access)
fn normpath(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Pure in-memory bundle for standard-JSON (solc-style) input. Values are
/// either `{"content": "..."}` or `{"abi": [...]}` objects.
#[derive(Debug, Default)]
pub struct JsonInputBundle {
    search_paths: Vec<PathBuf>,
    input_json: BTreeMap<PathBuf, serde_json::Value>,
    source_ids: SourceIds,
}

impl JsonInputBundle {
    /// Build from preloaded `path -> value` entries.
    pub fn new(
        input_json: impl IntoIterator<Item = (PathBuf, serde_json::Value)>,
        search_paths: Vec<PathBuf>,
    ) -> Result<Self, CompileError> {
        let mut map = BTreeMap::new();
        for (path, value) in input_json {
            let path = normpath(&path);
            if map.insert(path.clone(), value).is_some() {
                return Err(CompileError::json(format!(
                    "duplicate path in input bundle: {}",
                    path.display()
                )));
            }
        }
        Ok(JsonInputBundle {
            search_paths,
            input_json: map,
            source_ids: SourceIds::default(),
        })
    }
}

impl InputBundle for JsonInputBundle {
    fn load_file(&mut self, path: &Path) -> Result<FileInput, CompileError> {
        let mut tried = Vec::new();
        let candidates: Vec<PathBuf> = self
            .search_paths
            .iter()
            .rev()
            .map(|sp| normpath(&sp.join(path)))
            .chain(std::iter::once(normpath(path)))
            .collect();

        for resolved in candidates {
            let Some(value) = self.input_json.get(&resolved) else {
                tried.push(resolved);
                continue;
            };

            let contents = if let Some(content) =
                value.get("content").and_then(|v| v.as_str())
            {
                content.to_string()
            } else if value.get("abi").is_some() {
                value.to_string()
            } else {
                return Err(CompileError::json(format!(
                    "unexpected type in file: {}",
                    resolved.display()
                )));
            };

            let source_id = self.source_ids.get(&resolved);
            return Ok(FileInput {
                source_id,
                path: path.to_path_buf(),
                resolved_path: resolved,
                contents,
            });
        }
        Err(not_found(path, &tried))
    }

    fn search_paths(&self) -> Vec<PathBuf> {
        self.search_paths.clone()
    }

    fn set_search_paths(&mut self, paths: Vec<PathBuf>) -> Vec<PathBuf> {
        std::mem::replace(&mut self.search_paths, paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sha256_is_hex_of_contents() {
        assert_eq!(
            sha256sum(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn json_bundle_loads_content_entries() {
        let mut bundle = JsonInputBundle::new(
            [(
                PathBuf::from("contracts/a.vy"),
                json!({"content": "x: uint256\n"}),
            )],
            vec![PathBuf::from("contracts")],
        )
        .unwrap();

        let file = bundle.load_file(Path::new("a.vy")).unwrap();
        assert_eq!(file.contents, "x: uint256\n");
        assert_eq!(file.source_id, 0);

        // same resolved path, same id
        let again = bundle.load_file(Path::new("a.vy")).unwrap();
        assert_eq!(again.source_id, 0);
    }

    #[test]
    fn json_bundle_search_precedence_is_last_added() {
        let mut bundle = JsonInputBundle::new(
            [
                (PathBuf::from("a/m.vy"), json!({"content": "lo"})),
                (PathBuf::from("b/m.vy"), json!({"content": "hi"})),
            ],
            vec![PathBuf::from("a"), PathBuf::from("b")],
        )
        .unwrap();
        let file = bundle.load_file(Path::new("m.vy")).unwrap();
        assert_eq!(file.contents, "hi");
    }

    #[test]
    fn json_bundle_abi_entries_round_trip() {
        let abi = json!({"abi": [{"type": "function", "name": "f"}]});
        let mut bundle = JsonInputBundle::new(
            [(PathBuf::from("i.json"), abi)],
            vec![PathBuf::from(".")],
        )
        .unwrap();
        let json = bundle.load_json_file(Path::new("i.json")).unwrap();
        assert!(json.data.get("abi").is_some());
    }

    #[test]
    fn missing_file_lists_tried_locations() {
        let mut bundle =
            JsonInputBundle::new([], vec![PathBuf::from("x")]).unwrap();
        let err = bundle.load_file(Path::new("nope.vy")).unwrap_err();
        assert!(err.to_string().contains("could not find"));
    }

    #[test]
    fn normpath_is_lexical() {
        assert_eq!(
            normpath(Path::new("foo/bar/../x.vy")),
            PathBuf::from("foo/x.vy")
        );
        assert_eq!(normpath(Path::new("./a/./b")), PathBuf::from("a/b"));
    }
}
