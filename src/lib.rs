//! Engine for the sound configuration language.
//!
//! Text is parsed into a [`Tree`] arena, looked up by dotted keys and string
//! aliases, expanded against `@args` parameter blocks and evaluated through
//! `@func` handlers registered in a [`FuncTable`]. [`Config`] keeps a loaded
//! configuration in sync with the files it came from.

pub mod args;
pub mod binding;
pub mod builtins;
pub mod error;
pub mod eval;
pub mod funcs;
pub mod json;
pub mod lexer;
pub mod parser;
pub mod save;
pub mod search;
pub mod tree;
pub mod update;
pub mod walk;

pub use binding::{resolve_binding, Binding};
pub use error::{ConfError, Result};
pub use eval::Evaluator;
pub use funcs::{ConfigFn, FuncTable, SymbolTable, BUILTIN_LIB};
pub use parser::{load, load_file, load_str};
pub use save::{save, save_string};
pub use search::{search, search_alias, searchv};
pub use tree::{NodeId, NodeType, Tree, Value};
pub use update::{Config, UpdateSettings, UpdateStatus};
pub use walk::{copy, walk, Visit, Walker};

// ── Convenience ─────────────────────────────────────────────────────

/// Parse `text` into a fresh tree, returning the tree and its root.
pub fn parse(text: &str) -> Result<(Tree, NodeId)> {
    let mut tree = Tree::new();
    let root = tree.top();
    load_str(&mut tree, root, text)?;
    Ok((tree, root))
}

#[cfg(test)]
mod tests;
