//! Handlers registered under the built-in library.
//!
//! Each handler reads plain fields of the compound it is called on and
//! returns a node carrying that compound's identifier. Fields are used as
//! written; they are not evaluated first.

use std::any::Any;
use std::env;
use std::os::unix::ffi::OsStringExt;

use crate::error::{ConfError, Result};
use crate::funcs::FuncTable;
use crate::search::search;
use crate::tree::{parse_integer, NodeId, Tree, Value};
use crate::walk::copy;

/// Directory holding the shipped configuration files.
pub const DATADIR: &str = "/usr/share/alsa";

pub(crate) fn register(table: &mut FuncTable) {
    table.register(None, "snd_func_getenv", snd_func_getenv);
    table.register(None, "snd_func_igetenv", snd_func_igetenv);
    table.register(None, "snd_func_concat", snd_func_concat);
    table.register(None, "snd_func_datadir", snd_func_datadir);
    table.register(None, "snd_func_refer", snd_func_refer);
}

fn field(tree: &Tree, src: NodeId, name: &str) -> Result<NodeId> {
    tree.find_child(src, name)
        .ok_or_else(|| ConfError::invalid_definition(format!("field {} not found", name)))
}

fn owned_id(tree: &Tree, src: NodeId) -> Option<Vec<u8>> {
    tree[src].id_bytes().map(<[u8]>::to_vec)
}

/// First set variable among `vars`, else `default`.
fn lookup_env(tree: &Tree, src: NodeId) -> Result<Vec<u8>> {
    let vars = field(tree, src, "vars")?;
    let default = field(tree, src, "default")?;
    for &var in tree[vars].children() {
        let name = tree[var].string()?;
        if let Some(value) = env::var_os(name) {
            if !value.is_empty() {
                return Ok(value.into_vec());
            }
        }
    }
    Ok(tree[default].ascii()?)
}

/// `{ @func getenv vars [ A B ] default "x" }` becomes a string.
pub fn snd_func_getenv(
    tree: &mut Tree,
    _root: NodeId,
    src: NodeId,
    _private: Option<&mut (dyn Any + 'static)>,
) -> Result<Option<NodeId>> {
    let value = lookup_env(tree, src)?;
    let id = owned_id(tree, src);
    Ok(Some(tree.make_raw(id.as_deref(), Value::String(value))))
}

/// Like [`snd_func_getenv`] but the result must be an integer.
pub fn snd_func_igetenv(
    tree: &mut Tree,
    _root: NodeId,
    src: NodeId,
    _private: Option<&mut (dyn Any + 'static)>,
) -> Result<Option<NodeId>> {
    let text = lookup_env(tree, src)?;
    let id = owned_id(tree, src);
    let value = std::str::from_utf8(&text)
        .ok()
        .and_then(parse_integer)
        .ok_or_else(|| ConfError::invalid_argument(tree[src].display_id(), "must be an integer"))?;
    Ok(Some(tree.make_raw(id.as_deref(), Value::Integer(value))))
}

/// Concatenate the text of every leaf in `strings`.
pub fn snd_func_concat(
    tree: &mut Tree,
    _root: NodeId,
    src: NodeId,
    _private: Option<&mut (dyn Any + 'static)>,
) -> Result<Option<NodeId>> {
    let strings = field(tree, src, "strings")?;
    let mut joined = Vec::new();
    for &part in tree[strings].children() {
        joined.extend(tree[part].ascii()?);
    }
    let id = owned_id(tree, src);
    Ok(Some(tree.make_raw(id.as_deref(), Value::String(joined))))
}

pub fn snd_func_datadir(
    tree: &mut Tree,
    _root: NodeId,
    src: NodeId,
    _private: Option<&mut (dyn Any + 'static)>,
) -> Result<Option<NodeId>> {
    let id = owned_id(tree, src);
    Ok(Some(tree.make_raw(id.as_deref(), Value::String(DATADIR.into()))))
}

/// Copy of the node at key `name` in the root.
pub fn snd_func_refer(
    tree: &mut Tree,
    root: NodeId,
    src: NodeId,
    _private: Option<&mut (dyn Any + 'static)>,
) -> Result<Option<NodeId>> {
    let name = tree[field(tree, src, "name")?].string()?.to_owned();
    let target = search(tree, root, &name)?;
    let result = copy(tree, target)?;
    let id = owned_id(tree, src);
    tree.set_id_raw(result, id.as_deref())?;
    Ok(Some(result))
}
