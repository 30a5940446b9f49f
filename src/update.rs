use std::env;
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::SystemTime;

use regex::Regex;
use tracing::{debug, error, warn};

use crate::binding::{resolve_binding, Binding};
use crate::builtins::DATADIR;
use crate::error::{ConfError, Result};
use crate::eval::Evaluator;
use crate::funcs::{FuncTable, SymbolTable};
use crate::lexer::Input;
use crate::parser::load;
use crate::search::search;
use crate::tree::{parse_integer, NodeId, NodeType, Tree};

/// Where the configuration file list comes from.
#[derive(Debug, Clone)]
pub struct UpdateSettings {
    /// Environment variable holding the file list.
    pub path_var: String,
    /// File list used when the variable is unset.
    pub default_path: String,
    /// Explicit file list; overrides the variable when set.
    pub paths: Option<String>,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        UpdateSettings {
            path_var: "ALSA_CONFIG_PATH".to_owned(),
            default_path: format!("{}/alsa.conf", DATADIR),
            paths: None,
        }
    }
}

impl UpdateSettings {
    /// Settings reading exactly the given file list.
    pub fn with_paths(paths: impl Into<String>) -> Self {
        UpdateSettings {
            paths: Some(paths.into()),
            ..Self::default()
        }
    }
}

/// Identity of a configuration file at the time it was read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: PathBuf,
    pub dev: u64,
    pub ino: u64,
    pub mtime: SystemTime,
}

impl FileInfo {
    pub fn stat(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let meta = fs::metadata(path)?;
        Ok(FileInfo {
            path: path.to_path_buf(),
            dev: meta.dev(),
            ino: meta.ino(),
            mtime: meta.modified()?,
        })
    }
}

/// Outcome of [`Config::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStatus {
    Unchanged,
    Rebuilt,
}

/// A loaded configuration together with the file identities it was built from.
///
/// `update` re-reads the files only when their identities changed. Handles
/// into the tree are invalidated whenever it returns `Rebuilt` or fails.
pub struct Config {
    tree: Tree,
    root: Option<NodeId>,
    files: Vec<FileInfo>,
    preloaded: Vec<FileInfo>,
    funcs: FuncTable,
    settings: UpdateSettings,
}

impl Config {
    /// A context with the built-in functions and nothing loaded yet.
    pub fn open(settings: UpdateSettings) -> Self {
        Self::with_funcs(settings, FuncTable::with_builtins())
    }

    pub fn with_funcs(settings: UpdateSettings, funcs: FuncTable) -> Self {
        Config {
            tree: Tree::new(),
            root: None,
            files: Vec::new(),
            preloaded: Vec::new(),
            funcs,
            settings,
        }
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut Tree {
        &mut self.tree
    }

    /// Root of the current configuration, if one is loaded.
    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn funcs(&self) -> &FuncTable {
        &self.funcs
    }

    pub fn funcs_mut(&mut self) -> &mut FuncTable {
        &mut self.funcs
    }

    pub fn settings(&self) -> &UpdateSettings {
        &self.settings
    }

    /// Top-level files of the current configuration, in load order.
    pub fn files(&self) -> &[FileInfo] {
        &self.files
    }

    pub fn preloaded_files(&self) -> &[FileInfo] {
        &self.preloaded
    }

    fn loaded_root(&self, name: &str) -> Result<NodeId> {
        self.root.ok_or_else(|| ConfError::not_found(name))
    }

    /// Expanded and evaluated copy of definition `name` (`key[:args]`).
    pub fn search_definition(&mut self, base: Option<&str>, name: &str) -> Result<NodeId> {
        let root = self.loaded_root(name)?;
        Evaluator::new(&self.funcs).search_definition(&mut self.tree, root, base, name)
    }

    /// Resolve the open handler for `name` in `category`.
    pub fn resolve_binding<F: Copy>(
        &mut self,
        category: &str,
        name: &str,
        handlers: &SymbolTable<F>,
    ) -> Result<Binding<F>> {
        let root = self.loaded_root(name)?;
        let mut evaluator = Evaluator::new(&self.funcs);
        resolve_binding(&mut evaluator, &mut self.tree, root, category, name, handlers)
    }

    /// Drop the tree and every recorded identity.
    ///
    /// Every handle into the old tree stops resolving.
    pub fn close(&mut self) {
        self.tree.clear();
        self.root = None;
        self.files.clear();
        self.preloaded.clear();
    }

    // ── Update ──────────────────────────────────────────────────────

    /// Re-read the configuration files if any of them changed.
    ///
    /// On error the context is left empty.
    pub fn update(&mut self) -> Result<UpdateStatus> {
        let result = self.try_update();
        if let Err(err) = &result {
            error!("{}", err);
            self.close();
        }
        result
    }

    fn try_update(&mut self) -> Result<UpdateStatus> {
        let files = self.current_files()?;
        if !self.needs_rebuild(&files) {
            debug!("configuration unchanged");
            return Ok(UpdateStatus::Unchanged);
        }
        debug!("rebuilding configuration from {} files", files.len());
        self.rebuild(files)?;
        Ok(UpdateStatus::Rebuilt)
    }

    /// The configured file list, expanded, without files that cannot be stat'ed.
    fn current_files(&self) -> Result<Vec<FileInfo>> {
        let list = match &self.settings.paths {
            Some(paths) => paths.clone(),
            None => env::var(&self.settings.path_var)
                .unwrap_or_else(|_| self.settings.default_path.clone()),
        };
        let mut files = Vec::new();
        for entry in list.split([':', ' ']).filter(|entry| !entry.is_empty()) {
            let path = expand_word(entry)?;
            match FileInfo::stat(&path) {
                Ok(info) => files.push(info),
                Err(err) => debug!("skipping {}: {}", path.display(), err),
            }
        }
        Ok(files)
    }

    fn needs_rebuild(&self, files: &[FileInfo]) -> bool {
        if self.root.is_none() || files != self.files.as_slice() {
            return true;
        }
        self.preloaded.iter().any(|known| match FileInfo::stat(&known.path) {
            Ok(current) => current != *known,
            Err(_) => false,
        })
    }

    fn rebuild(&mut self, files: Vec<FileInfo>) -> Result<()> {
        self.close();
        let root = self.tree.top();
        self.root = Some(root);
        for info in &files {
            self.load_tracked(root, &info.path)?;
        }
        let preloaded = self
            .preload(root)
            .inspect_err(|_| error!("preload failed, removing configuration"))?;
        self.files = files;
        self.preloaded = preloaded;
        Ok(())
    }

    /// Load one file into `root`. Files that cannot be opened are skipped.
    fn load_tracked(&mut self, root: NodeId, path: &Path) -> Result<()> {
        let mut input = match Input::open(path) {
            Ok(input) => input,
            Err(err) => {
                warn!("{}", err);
                return Ok(());
            }
        };
        load(&mut self.tree, root, &mut input).inspect_err(|_| {
            error!(
                "{} may be old or corrupted: consider to remove or fix it",
                path.display()
            )
        })
    }

    /// Load the files listed in `preload.filenames`, in index order.
    fn preload(&mut self, root: NodeId) -> Result<Vec<FileInfo>> {
        let Ok(section) = search(&self.tree, root, "preload") else {
            return Ok(Vec::new());
        };
        let filenames = search(&self.tree, section, "filenames").map_err(|_| {
            ConfError::invalid_definition("Unable to find filenames in the preload section")
        })?;
        let expanded = Evaluator::new(&self.funcs)
            .expand(&mut self.tree, filenames, root, None)
            .inspect_err(|_| error!("Unable to expand filenames in the preload section"))?;
        let names = preload_names(&self.tree, expanded);
        self.tree.delete(expanded);

        let mut infos = Vec::new();
        for name in names? {
            let path = expand_word(&name)?;
            match FileInfo::stat(&path) {
                Ok(info) => infos.push(info),
                Err(err) => debug!("skipping preload {}: {}", path.display(), err),
            }
        }
        for info in &infos {
            self.load_tracked(root, &info.path)?;
        }
        Ok(infos)
    }
}

/// File names of a `filenames` compound, ordered by their integer ids.
fn preload_names(tree: &Tree, filenames: NodeId) -> Result<Vec<String>> {
    if tree[filenames].node_type() != NodeType::Compound {
        return Err(ConfError::invalid_definition("Invalid type for field filenames"));
    }
    let mut indexed = Vec::new();
    for &entry in tree[filenames].children() {
        let node = &tree[entry];
        let id = node.display_id();
        let name = node
            .string()
            .map_err(|_| ConfError::invalid_definition(format!("Field {} is not a string", id)))?;
        let index = parse_integer(&id).ok_or_else(|| {
            ConfError::invalid_definition(format!("id of field {} is not an integer", id))
        })?;
        indexed.push((index, name.to_owned()));
    }
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, name)| name).collect())
}

// ── Word expansion ──────────────────────────────────────────────────

const VARIABLE: &str = r"\$(?:\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))";

static VARIABLES: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();

/// Expand `~`, `$VAR` and `${VAR}` in a path entry.
///
/// Command substitution and unquoted shell metacharacters are rejected, and
/// the result must be exactly one word.
pub fn expand_word(word: &str) -> Result<PathBuf> {
    let fail = |reason: &str| ConfError::PathExpansion {
        word: word.to_owned(),
        reason: reason.to_owned(),
    };
    let variables = VARIABLES
        .get_or_init(|| Regex::new(VARIABLE))
        .as_ref()
        .map_err(|err| fail(&err.to_string()))?;

    let bare = variables.replace_all(word, "");
    if bare.contains("$(") || bare.contains('`') {
        return Err(fail("command substitution is not allowed"));
    }
    if bare.contains(['|', '&', ';', '<', '>', '(', ')', '{', '}']) {
        return Err(fail("shell metacharacters are not allowed"));
    }

    let word = match word.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => {
            let home = env::var("HOME").map_err(|_| fail("HOME is not set"))?;
            format!("{}{}", home, rest)
        }
        Some(_) => return Err(fail("~user is not supported")),
        None => word.to_owned(),
    };
    let expanded = variables.replace_all(&word, |caps: &regex::Captures| {
        let name = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
        env::var(name).unwrap_or_default()
    });

    let mut words = expanded.split_whitespace();
    match (words.next(), words.next()) {
        (Some(single), None) => Ok(PathBuf::from(single)),
        (None, _) => Err(fail("expands to nothing")),
        (Some(_), Some(_)) => Err(fail("expands to more than one word")),
    }
}
