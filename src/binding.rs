use tracing::{debug, error};

use crate::error::{ConfError, Result};
use crate::eval::Evaluator;
use crate::funcs::SymbolTable;
use crate::tree::{NodeId, NodeType, Tree};

/// A device definition resolved to the entry point that opens it.
///
/// The engine stops here: calling `handler` with `definition` is the
/// device layer's job.
#[derive(Debug)]
pub struct Binding<F> {
    /// Expanded and evaluated definition, detached and owned by the binding.
    pub definition: NodeId,
    /// Value of the definition's `type` field.
    pub type_name: String,
    /// Library the handler came from; `None` means the built-in one.
    pub lib: Option<String>,
    pub symbol: String,
    pub handler: F,
}

impl<F> Binding<F> {
    /// Delete the definition tree.
    pub fn release(self, tree: &mut Tree) {
        tree.delete(self.definition);
    }
}

/// Look up `name` (`key` or `key:args`) in `category` and find its open handler.
///
/// The definition must be a compound with a string `type`. An optional
/// `<category>_type.<type>` definition may name the `lib` and the `open`
/// symbol; the symbol defaults to `_snd_<category>_<type>_open`.
pub fn resolve_binding<F: Copy>(
    evaluator: &mut Evaluator<'_>,
    tree: &mut Tree,
    root: NodeId,
    category: &str,
    name: &str,
    handlers: &SymbolTable<F>,
) -> Result<Binding<F>> {
    let definition = evaluator.search_definition(tree, root, Some(category), name)?;
    match bind_definition(evaluator, tree, root, category, name, definition, handlers) {
        Ok(binding) => Ok(binding),
        Err(err) => {
            error!("{}", err);
            tree.delete(definition);
            Err(err)
        }
    }
}

fn bind_definition<F: Copy>(
    evaluator: &mut Evaluator<'_>,
    tree: &mut Tree,
    root: NodeId,
    category: &str,
    name: &str,
    definition: NodeId,
    handlers: &SymbolTable<F>,
) -> Result<Binding<F>> {
    if tree[definition].node_type() != NodeType::Compound {
        return Err(ConfError::invalid_definition(format!(
            "Invalid type for {} {} definition",
            category.to_uppercase(),
            name
        )));
    }
    let type_node = tree
        .find_child(definition, "type")
        .ok_or_else(|| ConfError::not_found("type"))?;
    let type_name = tree[type_node].string()?.to_owned();

    let (lib, open) = type_definition(evaluator, tree, root, category, &type_name)?;
    let symbol = open.unwrap_or_else(|| format!("_snd_{}_{}_open", category, type_name));
    let handler = handlers.resolve(lib.as_deref(), &symbol)?;
    debug!("{} {} opens through {}", category, name, symbol);
    Ok(Binding {
        definition,
        type_name,
        lib,
        symbol,
        handler,
    })
}

/// The `lib` and `open` fields of `<category>_type.<type_name>`, if defined.
fn type_definition(
    evaluator: &mut Evaluator<'_>,
    tree: &mut Tree,
    root: NodeId,
    category: &str,
    type_name: &str,
) -> Result<(Option<String>, Option<String>)> {
    let base = format!("{}_type", category);
    let conf = match evaluator.search_definition(tree, root, Some(&base), type_name) {
        Ok(conf) => conf,
        Err(err) if err.is_not_found() => return Ok((None, None)),
        Err(err) => return Err(err),
    };
    let fields = read_type_fields(tree, conf, category, type_name);
    tree.delete(conf);
    fields
}

fn read_type_fields(
    tree: &Tree,
    conf: NodeId,
    category: &str,
    type_name: &str,
) -> Result<(Option<String>, Option<String>)> {
    if tree[conf].node_type() != NodeType::Compound {
        return Err(ConfError::invalid_definition(format!(
            "Invalid type for {} type {} definition",
            category.to_uppercase(),
            type_name
        )));
    }
    let (mut lib, mut open) = (None, None);
    for &field in tree[conf].children() {
        let node = &tree[field];
        match node.id() {
            Some("comment") => {}
            Some("lib") => lib = Some(node.string()?.to_owned()),
            Some("open") => open = Some(node.string()?.to_owned()),
            other => {
                return Err(ConfError::invalid_definition(format!(
                    "Unknown field {}",
                    other.unwrap_or_default()
                )))
            }
        }
    }
    Ok((lib, open))
}
