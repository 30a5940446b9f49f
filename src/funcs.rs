use std::any::Any;
use std::collections::HashMap;

use libloading::Library;
use tracing::debug;

use crate::error::{ConfError, Result};
use crate::tree::{NodeId, Tree};

/// Library name under which the built-in handlers are registered, and the
/// default `lib` of every function and device definition.
pub const BUILTIN_LIB: &str = "libasound.so.2";

/// A `@func` handler.
///
/// Called with the tree, the configuration root, the compound holding the
/// `@func` child and the caller's private context. A returned node is
/// substituted for the compound.
pub type ConfigFn =
    fn(&mut Tree, NodeId, NodeId, Option<&mut (dyn Any + 'static)>) -> Result<Option<NodeId>>;

/// Symbol table for `@func` handlers.
pub type FuncTable = SymbolTable<ConfigFn>;

/// Registry of entry points keyed by (library, symbol).
///
/// Statically registered entries are consulted first. Shared objects added
/// with [`SymbolTable::load_library`] stay loaded until the table is dropped.
pub struct SymbolTable<F: Copy> {
    builtin: String,
    symbols: HashMap<(String, String), F>,
    libraries: HashMap<String, Library>,
}

impl<F: Copy> Default for SymbolTable<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Copy> SymbolTable<F> {
    pub fn new() -> Self {
        SymbolTable {
            builtin: BUILTIN_LIB.to_owned(),
            symbols: HashMap::new(),
            libraries: HashMap::new(),
        }
    }

    pub fn builtin_lib(&self) -> &str {
        &self.builtin
    }

    /// Register `entry` as `symbol` in `lib` (the built-in library when `None`).
    pub fn register(&mut self, lib: Option<&str>, symbol: &str, entry: F) {
        let lib = lib.unwrap_or(&self.builtin).to_owned();
        self.symbols.insert((lib, symbol.to_owned()), entry);
    }

    /// Open a shared object and make its exports resolvable under `name`.
    ///
    /// # Safety
    ///
    /// Loading runs the library's initialisers. Every symbol later resolved
    /// from it must really have type `F`, and resolved entries must not be
    /// called after the table is dropped.
    pub unsafe fn load_library(&mut self, name: &str) -> Result<()> {
        if self.libraries.contains_key(name) {
            return Ok(());
        }
        let library = Library::new(name).map_err(|err| {
            debug!("cannot load {}: {}", name, err);
            ConfError::LibraryNotFound {
                lib: name.to_owned(),
            }
        })?;
        self.libraries.insert(name.to_owned(), library);
        Ok(())
    }

    fn knows_library(&self, lib: &str) -> bool {
        lib == self.builtin
            || self.libraries.contains_key(lib)
            || self.symbols.keys().any(|(known, _)| known == lib)
    }

    /// Look up `symbol` in `lib` (the built-in library when `None`).
    pub fn resolve(&self, lib: Option<&str>, symbol: &str) -> Result<F> {
        let lib = lib.unwrap_or(&self.builtin);
        if let Some(entry) = self.symbols.get(&(lib.to_owned(), symbol.to_owned())) {
            return Ok(*entry);
        }
        if let Some(library) = self.libraries.get(lib) {
            // The caller of `load_library` vouched for the symbol types.
            let found = unsafe { library.get::<F>(symbol.as_bytes()) };
            if let Ok(entry) = found {
                return Ok(*entry);
            }
        }
        if self.knows_library(lib) {
            Err(ConfError::SymbolNotFound {
                symbol: symbol.to_owned(),
                lib: lib.to_owned(),
            })
        } else {
            Err(ConfError::LibraryNotFound {
                lib: lib.to_owned(),
            })
        }
    }
}

impl FuncTable {
    /// A table holding the built-in `snd_func_*` handlers.
    pub fn with_builtins() -> Self {
        let mut table = Self::new();
        crate::builtins::register(&mut table);
        table
    }
}
