//! Config resolution tree.
//!
//! The tree is an arena of nodes built from a directory of data files and YAML configs:
//!
//! - `_root.yml` marks the tree root (only honoured there) and `_dir.yml` overrides a folder
//! - `<file name>.yml` (or `<stem>.yml` when the stem is unique) attaches to one data file
//! - any other `*.yml` is a standalone config node, typically with a wildcard source URL
//!
//! Each node keeps its local documents; its resolved configs are the cartesian product of
//! its parent's resolved configs with its own documents, folded left (see [`super::merge`]).
//! [`ConfigTree::expand`] adds nodes for wildcard matches and for every table/sheet, after
//! which [`ConfigTree::leaves`] yields one [`LeafJob`] per table.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::backend::{self, BackendKind};
use crate::error::{IngestError, IngestResult};
use crate::io::Session;

use super::merge;
use super::model::{JobConfig, LeafJob, StringList, Target};
use super::placeholder::{self, NodeProps};

pub const ROOT_FILE: &str = "_root.yml";
pub const DIR_FILE: &str = "_dir.yml";
const CONFIG_EXTENSIONS: [&str; 2] = ["yml", "yaml"];
/// Script files live next to data but are not data.
const SCRIPT_EXTENSIONS: [&str; 2] = ["sql", "prql"];
const TABLES_KEY: &str = "tables";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Directory,
    /// A data file found on disk or matched by a wildcard.
    File,
    /// A config file that names its own source.
    Config,
    /// One table/sheet of a container.
    Table,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Directory => "dir",
            Self::File => "file",
            Self::Config => "config",
            Self::Table => "table",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct Node {
    key: String,
    kind: NodeKind,
    /// Directory, data file, config file; container path for tables.
    path: PathBuf,
    name: String,
    parent: Option<usize>,
    children: Vec<usize>,
    patches: Vec<Value>,
    /// Index of the single parent config this node derives from (expansion nodes).
    origin: Option<usize>,
    resolved: OnceLock<Vec<Value>>,
}

/// Arena-backed config tree.
#[derive(Debug)]
pub struct ConfigTree {
    root: PathBuf,
    nodes: Vec<Node>,
    overrides: Vec<Value>,
    expanded: bool,
}

fn config_error(path: &Path, message: impl fmt::Display) -> IngestError {
    IngestError::ConfigFile {
        path: path.to_path_buf(),
        message: message.to_string(),
    }
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

fn has_extension(path: &Path, exts: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| exts.iter().any(|x| x.eq_ignore_ascii_case(e)))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Whether a source URL is a file pattern to expand.
pub fn is_glob(url: &str) -> bool {
    !backend::has_scheme(url) && url.contains(['*', '?', '['])
}

/// Nearest ancestor of `path` holding a root marker, else the starting directory.
pub fn find_root(path: &Path) -> PathBuf {
    let start = if path.is_dir() {
        path.to_path_buf()
    } else {
        path.parent().map(Path::to_path_buf).unwrap_or_default()
    };
    start
        .ancestors()
        .find(|dir| root_file(dir).is_some())
        .map(Path::to_path_buf)
        .unwrap_or(start)
}

fn marker(dir: &Path, name: &str) -> Option<PathBuf> {
    let stem = name.trim_end_matches(".yml");
    CONFIG_EXTENSIONS
        .iter()
        .map(|ext| dir.join(format!("{stem}.{ext}")))
        .find(|p| p.is_file())
}

fn root_file(dir: &Path) -> Option<PathBuf> {
    marker(dir, ROOT_FILE)
}

fn dir_file(dir: &Path) -> Option<PathBuf> {
    marker(dir, DIR_FILE)
}

fn is_marker(path: &Path) -> bool {
    let name = file_name(path);
    has_extension(path, &CONFIG_EXTENSIONS)
        && (name.starts_with("_root.") || name.starts_with("_dir."))
}

/// Make a relative, scheme-less `source.url` absolute against `folder`.
fn absolutize_source_url(doc: &mut Value, folder: &Path) {
    let Some(url) = merge::get_str(doc, "source.url").map(str::to_string) else {
        return;
    };
    if backend::has_scheme(&url) || Path::new(&url).is_absolute() {
        return;
    }
    let abs = backend::resolve_path(folder, Path::new(&url));
    merge::set_path(doc, "source.url", Value::String(abs.display().to_string()));
}

/// Check a document against the config schema (including per-table overrides).
fn validate(path: &Path, doc: &Value) -> IngestResult<()> {
    let mut main = doc.clone();
    let tables = main.as_object_mut().and_then(|m| m.remove(TABLES_KEY));
    serde_json::from_value::<JobConfig>(main).map_err(|e| config_error(path, e))?;
    match tables {
        None | Some(Value::Null) => Ok(()),
        Some(Value::Object(map)) => {
            for (name, patch) in map {
                serde_json::from_value::<JobConfig>(patch)
                    .map_err(|e| config_error(path, format!("tables.{name}: {e}")))?;
            }
            Ok(())
        }
        Some(_) => Err(config_error(path, "`tables` must be a mapping of table name to config")),
    }
}

/// Load every YAML document of a config file.
///
/// Empty documents are skipped; relative source URLs are made absolute against the file's
/// folder.
pub fn load_docs(path: &Path) -> IngestResult<Vec<Value>> {
    let text = fs::read_to_string(path).map_err(|e| config_error(path, e))?;
    let folder = path.parent().unwrap_or_else(|| Path::new(""));
    let mut docs = Vec::new();
    for de in serde_yaml::Deserializer::from_str(&text) {
        let mut doc = Value::deserialize(de).map_err(|e| config_error(path, e))?;
        match doc {
            Value::Null => continue,
            Value::Object(_) => {}
            _ => return Err(config_error(path, "a config document must be a mapping")),
        }
        validate(path, &doc)?;
        absolutize_source_url(&mut doc, folder);
        docs.push(doc);
    }
    Ok(docs)
}

impl ConfigTree {
    /// Build the tree for `path` (a directory or a single data/config file).
    ///
    /// The root is found with [`find_root`]; folders between the root and `path` contribute
    /// their `_dir.yml`, but only `path` itself is walked.
    pub fn from_path(path: impl AsRef<Path>) -> IngestResult<Self> {
        let path = path.as_ref();
        let path = fs::canonicalize(path).map_err(|e| IngestError::Config {
            message: format!("cannot open '{}': {e}", path.display()),
        })?;
        let root = find_root(&path);

        let mut root_docs = match root_file(&root) {
            Some(p) => load_docs(&p)?,
            None => Vec::new(),
        };
        if let Some(p) = dir_file(&root) {
            root_docs = merge::combine(&root_docs, &load_docs(&p)?);
        }

        let mut tree = Self {
            root: root.clone(),
            nodes: Vec::new(),
            overrides: Vec::new(),
            expanded: false,
        };
        let root_idx = tree.push(None, NodeKind::Directory, root.clone(), file_name(&root), root_docs, None);

        let mut current = root_idx;
        let rel = path.strip_prefix(&root).unwrap_or(Path::new("")).to_path_buf();
        let mut dir = root.clone();
        let components: Vec<_> = rel.components().collect();
        for (i, comp) in components.iter().enumerate() {
            dir = dir.join(comp.as_os_str());
            let last = i + 1 == components.len();
            if last && !dir.is_dir() {
                tree.add_single(current, &dir)?;
                return Ok(tree);
            }
            let docs = match dir_file(&dir) {
                Some(p) => load_docs(&p)?,
                None => Vec::new(),
            };
            current = tree.push(Some(current), NodeKind::Directory, dir.clone(), file_name(&dir), docs, None);
        }
        tree.walk(current)?;
        Ok(tree)
    }

    fn push(
        &mut self,
        parent: Option<usize>,
        kind: NodeKind,
        path: PathBuf,
        name: String,
        patches: Vec<Value>,
        origin: Option<usize>,
    ) -> usize {
        let key = match (kind, parent) {
            (NodeKind::Table, Some(p)) => {
                let parent = &self.nodes[p].key;
                match origin {
                    Some(o) if self.resolved(p).len() > 1 => format!("{parent}[{o}]::{name}"),
                    _ => format!("{parent}::{name}"),
                }
            }
            _ => {
                let rel = path.strip_prefix(&self.root).unwrap_or(&path);
                let rel = rel.to_string_lossy().replace('\\', "/");
                if rel.is_empty() { ".".to_string() } else { rel }
            }
        };
        let idx = self.nodes.len();
        self.nodes.push(Node {
            key,
            kind,
            path,
            name,
            parent,
            children: Vec::new(),
            patches,
            origin,
            resolved: OnceLock::new(),
        });
        if let Some(p) = parent {
            self.nodes[p].children.push(idx);
        }
        idx
    }

    /// Resolved configs of a node, memoized.
    fn resolved(&self, idx: usize) -> &[Value] {
        self.nodes[idx].resolved.get_or_init(|| {
            let node = &self.nodes[idx];
            let bases: Vec<Value> = match node.parent {
                None => Vec::new(),
                Some(p) => {
                    let parent = self.resolved(p);
                    match node.origin {
                        Some(o) => parent.get(o).cloned().into_iter().collect(),
                        None => parent.to_vec(),
                    }
                }
            };
            merge::combine(&bases, &node.patches)
        })
    }

    /// Add a lone target file (data or config) below `parent`.
    fn add_single(&mut self, parent: usize, path: &Path) -> IngestResult<()> {
        let folder = path.parent().map(Path::to_path_buf).unwrap_or_default();
        if has_extension(path, &CONFIG_EXTENSIONS) {
            let docs = load_docs(path)?;
            self.push(Some(parent), NodeKind::Config, path.to_path_buf(), file_name(path), docs, None);
            return Ok(());
        }
        let siblings = self.list_dir(&folder)?;
        let data: Vec<&PathBuf> = siblings.iter().filter(|p| p.is_file() && !has_extension(p, &CONFIG_EXTENSIONS)).collect();
        let configs: Vec<&PathBuf> = siblings.iter().filter(|p| has_extension(p, &CONFIG_EXTENSIONS) && !is_marker(p)).collect();
        let adjacent = adjacent_configs(path, &data, &configs);
        self.add_data_file(parent, path, &adjacent)
    }

    fn list_dir(&self, dir: &Path) -> IngestResult<Vec<PathBuf>> {
        let mut out = Vec::new();
        for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| IngestError::Config {
                message: format!("cannot read '{}': {e}", dir.display()),
            })?;
            let name = entry.file_name().to_string_lossy();
            if is_hidden(&name) {
                continue;
            }
            out.push(entry.into_path());
        }
        Ok(out)
    }

    /// Add the children of directory node `dir_idx`, recursively.
    fn walk(&mut self, dir_idx: usize) -> IngestResult<()> {
        let dir = self.nodes[dir_idx].path.clone();
        let entries = self.list_dir(&dir)?;

        let data: Vec<&PathBuf> = entries
            .iter()
            .filter(|p| {
                p.is_file()
                    && !has_extension(p, &CONFIG_EXTENSIONS)
                    && !has_extension(p, &SCRIPT_EXTENSIONS)
            })
            .collect();
        let configs: Vec<&PathBuf> = entries
            .iter()
            .filter(|p| p.is_file() && has_extension(p, &CONFIG_EXTENSIONS) && !is_marker(p))
            .collect();

        let mut attached: Vec<&PathBuf> = Vec::new();
        for entry in &entries {
            if entry.is_dir() {
                let docs = match dir_file(entry) {
                    Some(p) => load_docs(&p)?,
                    None => Vec::new(),
                };
                let idx = self.push(Some(dir_idx), NodeKind::Directory, entry.clone(), file_name(entry), docs, None);
                self.walk(idx)?;
            } else if data.contains(&entry) {
                let adjacent = adjacent_configs(entry, &data, &configs);
                attached.extend(adjacent.iter().copied());
                self.add_data_file(dir_idx, entry, &adjacent)?;
            }
        }
        for cfg in configs {
            if attached.contains(&cfg) {
                continue;
            }
            let docs = load_docs(cfg)?;
            self.push(Some(dir_idx), NodeKind::Config, cfg.clone(), file_name(cfg), docs, None);
        }
        Ok(())
    }

    /// Add a data file node; adjacent docs naming another source become config nodes.
    fn add_data_file(&mut self, parent: usize, path: &Path, adjacent: &[&PathBuf]) -> IngestResult<()> {
        if BackendKind::from_path(path).is_none() {
            // An attached config may still declare the type explicitly.
            let typed = adjacent.iter().any(|cfg| {
                load_docs(cfg)
                    .map(|docs| docs.iter().any(|d| d.pointer("/source/type").is_some()))
                    .unwrap_or(false)
            });
            if !typed {
                return Err(IngestError::Config {
                    message: format!("no backend is registered for '{}'", path.display()),
                });
            }
        }

        let url = Value::String(path.display().to_string());
        let implicit = merge::patch("source.url", url);
        let mut own = Vec::new();
        for cfg in adjacent {
            let mut foreign = Vec::new();
            for doc in load_docs(cfg)? {
                match merge::get_str(&doc, "source.url") {
                    Some(u) if Path::new(u) != path => foreign.push(doc),
                    _ => own.push(merge::merged(&doc, &implicit)),
                }
            }
            if !foreign.is_empty() {
                self.push(Some(parent), NodeKind::Config, (*cfg).clone(), file_name(cfg), foreign, None);
            }
        }
        if own.is_empty() {
            own.push(implicit);
        }
        debug!(path = %path.display(), configs = own.len(), "data file");
        self.push(Some(parent), NodeKind::File, path.to_path_buf(), file_name(path), own, None);
        Ok(())
    }

    /// Rewrite every leaf to read at most `n` rows.
    pub fn force_sample(&mut self, n: usize) {
        self.overrides.push(merge::patch("source.limit", Value::from(n)));
    }

    /// Rewrite every leaf to write into the in-process table store.
    pub fn force_memory_target(&mut self) {
        let mut target = Map::new();
        target.insert("url".to_string(), Value::String("memory://".to_string()));
        target.insert("type".to_string(), Value::String("memory".to_string()));
        let mut patch = Map::new();
        patch.insert("target".to_string(), Value::Object(target));
        self.overrides.push(Value::Object(patch));
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Expand wildcard sources and enumerate tables.
    ///
    /// Containers without an explicit table are opened through `session` to list their
    /// children; they stay registered there for the run.
    pub fn expand(&mut self, session: &Session) -> IngestResult<()> {
        if self.expanded {
            return Ok(());
        }

        // Wildcards first, so their matches get tables below.
        let configs: Vec<usize> = (0..self.nodes.len())
            .filter(|&i| self.nodes[i].kind == NodeKind::Config)
            .collect();
        for idx in configs {
            let cfgs = self.resolved(idx).to_vec();
            for (o, cfg) in cfgs.iter().enumerate() {
                let Some(url) = merge::get_str(cfg, "source.url") else {
                    continue;
                };
                if !is_glob(url) {
                    continue;
                }
                let matches = glob::glob(url).map_err(|e| config_error(&self.nodes[idx].path, e))?;
                let mut count = 0;
                for m in matches {
                    let path = m.map_err(|e| config_error(&self.nodes[idx].path, e))?;
                    if !path.is_file() || is_hidden(&file_name(&path)) {
                        continue;
                    }
                    let patch = merge::patch("source.url", Value::String(path.display().to_string()));
                    self.push(Some(idx), NodeKind::File, path.clone(), file_name(&path), vec![patch], Some(o));
                    count += 1;
                }
                if count == 0 {
                    warn!(pattern = url, config = %self.nodes[idx].path.display(), "wildcard matched no files");
                }
            }
        }

        let containers: Vec<usize> = (0..self.nodes.len())
            .filter(|&i| matches!(self.nodes[i].kind, NodeKind::File | NodeKind::Config))
            .collect();
        for idx in containers {
            let cfgs = self.resolved(idx).to_vec();
            for (o, cfg) in cfgs.iter().enumerate() {
                let Some(url) = merge::get_str(cfg, "source.url") else {
                    return Err(config_error(&self.nodes[idx].path, "no source url"));
                };
                if is_glob(url) {
                    continue;
                }
                let (kind, names) = self.select_tables(idx, cfg, url, session)?;
                for name in names {
                    let mut patch = merge::patch("source.table", Value::String(name.clone()));
                    merge::merge_into(&mut patch, &merge::patch("source.type", serde_json::to_value(kind)?));
                    if let Some(table_patch) = cfg.get(TABLES_KEY).and_then(|t| t.get(&name)) {
                        merge::merge_into(&mut patch, table_patch);
                    }
                    let path = self.nodes[idx].path.clone();
                    self.push(Some(idx), NodeKind::Table, path, name, vec![patch], Some(o));
                }
            }
        }
        self.expanded = true;
        Ok(())
    }

    fn select_tables(
        &self,
        idx: usize,
        cfg: &Value,
        url: &str,
        session: &Session,
    ) -> IngestResult<(BackendKind, Vec<String>)> {
        let path = &self.nodes[idx].path;
        let kind = match cfg.pointer("/source/type") {
            Some(t) if !t.is_null() => serde_json::from_value(t.clone()).map_err(|e| config_error(path, e))?,
            _ => BackendKind::from_url(url)?,
        };
        if kind.is_single_table() {
            return Ok((kind, vec![backend::canonical_table(kind, url, "")]));
        }

        let table: Option<StringList> = match cfg.pointer("/source/table") {
            Some(t) if !t.is_null() => Some(serde_json::from_value(t.clone()).map_err(|e| config_error(path, e))?),
            _ => None,
        };
        let include_hidden = cfg
            .pointer("/source/options/include_hidden")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let list_children = || -> IngestResult<Vec<String>> {
            session.open(url, kind, false)?.children(include_hidden)
        };

        let names = match table {
            None => list_children()?,
            Some(StringList::Many(names)) => names,
            Some(StringList::One(name)) if name.contains(['*', '?', '[']) => {
                let pattern = glob::Pattern::new(&name).map_err(|e| config_error(path, e))?;
                list_children()?
                    .into_iter()
                    .filter(|n| pattern.matches(n))
                    .collect()
            }
            Some(StringList::One(name)) => vec![name],
        };
        Ok((kind, names))
    }

    /// One job per table node, in tree order.
    ///
    /// Call after [`ConfigTree::expand`].
    pub fn leaves(&self) -> IngestResult<Vec<LeafJob>> {
        let mut out = Vec::new();
        let mut stack = vec![0usize];
        while let Some(idx) = stack.pop() {
            let node = &self.nodes[idx];
            if node.kind == NodeKind::Table {
                out.push(self.leaf(idx)?);
            }
            stack.extend(node.children.iter().rev().copied());
        }
        Ok(out)
    }

    fn leaf(&self, idx: usize) -> IngestResult<LeafJob> {
        let node = &self.nodes[idx];
        let Some(mut cfg) = self.resolved(idx).first().cloned() else {
            return Err(config_error(&node.path, "table node without config"));
        };
        for o in &self.overrides {
            merge::merge_into(&mut cfg, o);
        }
        if let Some(map) = cfg.as_object_mut() {
            map.remove(TABLES_KEY);
        }

        let source_url = merge::get_str(&cfg, "source.url").unwrap_or_default().to_string();
        let props_path = if backend::has_scheme(&source_url) {
            node.path.clone()
        } else {
            PathBuf::from(&source_url)
        };
        let props = NodeProps::new(node.name.clone(), props_path, self.root.clone());
        placeholder::substitute(&mut cfg, &props);

        let job: JobConfig = serde_json::from_value(cfg).map_err(|e| config_error(&node.path, e))?;
        let mut target: Target = job.target.ok_or_else(|| {
            config_error(&node.path, format!("no target configured for '{}'", node.key))
        })?;

        match (&target.url, target.kind) {
            (None, Some(BackendKind::Memory)) => target.url = Some("memory://".to_string()),
            (None, _) => {
                return Err(config_error(&node.path, format!("no target url for '{}'", node.key)));
            }
            (Some(url), _) => {
                if !backend::has_scheme(url) && !Path::new(url).is_absolute() {
                    target.url = Some(backend::resolve_path(&self.root, Path::new(url)).display().to_string());
                }
            }
        }
        if target.kind.is_none() {
            let url = target.url.as_deref().unwrap_or_default();
            target.kind = Some(BackendKind::from_url(url)?);
        }

        let base_dir = node
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        Ok(LeafJob {
            key: node.key.clone(),
            name: node.name.clone(),
            target_name: node.name.clone(),
            source: job.source,
            target,
            transform: job.transform,
            base_dir,
        })
    }

    fn fmt_node(&self, f: &mut fmt::Formatter<'_>, idx: usize, depth: usize) -> fmt::Result {
        let node = &self.nodes[idx];
        let configs = self.resolved(idx).len();
        write!(f, "{:indent$}{} [{}]", "", node.name, node.kind, indent = depth * 2)?;
        if configs > 1 {
            write!(f, " x{configs}")?;
        }
        writeln!(f)?;
        for &child in &node.children {
            self.fmt_node(f, child, depth + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for ConfigTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nodes.is_empty() {
            return Ok(());
        }
        self.fmt_node(f, 0, 0)
    }
}

/// Config files attaching to `data_file`: `<file name>.yml`, or `<stem>.yml` when no other
/// data file shares the stem.
fn adjacent_configs<'a>(data_file: &Path, data: &[&PathBuf], configs: &[&'a PathBuf]) -> Vec<&'a PathBuf> {
    let name = file_name(data_file);
    let stem = data_file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem_unique = data
        .iter()
        .filter(|p| p.file_stem().is_some_and(|s| s.to_string_lossy() == stem))
        .count()
        == 1;

    configs
        .iter()
        .copied()
        .filter(|cfg| {
            let cfg_stem = cfg
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            cfg_stem == name || (stem_unique && cfg_stem == stem)
        })
        .collect()
}
