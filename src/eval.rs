use std::any::Any;

use tracing::{debug, error, warn};

use crate::args::{load_defaults, parse_args};
use crate::error::{ConfError, Result};
use crate::funcs::FuncTable;
use crate::search::{search, search_alias};
use crate::tree::{NodeId, NodeType, Tree};
use crate::walk::{copy, produced, walk, Visit, Walker};

/// Runs expansion and `@func` evaluation against a handler table.
///
/// The optional private context is handed to every handler it invokes.
pub struct Evaluator<'a> {
    funcs: &'a FuncTable,
    private: Option<&'a mut (dyn Any + 'static)>,
}

impl<'a> Evaluator<'a> {
    pub fn new(funcs: &'a FuncTable) -> Self {
        Evaluator {
            funcs,
            private: None,
        }
    }

    pub fn with_private(funcs: &'a FuncTable, private: &'a mut (dyn Any + 'static)) -> Self {
        Evaluator {
            funcs,
            private: Some(private),
        }
    }

    /// Resolve every `@func` compound in `config`, in place.
    pub fn evaluate(&mut self, tree: &mut Tree, config: NodeId, root: NodeId) -> Result<()> {
        let mut walker = EvaluateWalker {
            root,
            funcs: self.funcs,
            private: self.private.as_deref_mut(),
        };
        walk(tree, config, &mut walker).map(drop)
    }

    /// Produce an expanded, evaluated copy of `config`.
    ///
    /// With an `@args` block the argument string is bound to its parameters
    /// and every `$(name)` leaf is replaced; without one the copy is plain.
    /// The inputs are left untouched; the result is detached and owned by
    /// the caller.
    pub fn expand(
        &mut self,
        tree: &mut Tree,
        config: NodeId,
        root: NodeId,
        args: Option<&str>,
    ) -> Result<NodeId> {
        let defs = match search(tree, config, "@args") {
            Ok(defs) => Some(defs),
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err),
        };
        let expanded = match defs {
            None => copy(tree, config)?,
            Some(defs) => {
                let subs = tree.top();
                let result = self.substitute_args(tree, config, root, defs, subs, args);
                tree.delete(subs);
                result?
            }
        };
        if let Err(err) = self.evaluate(tree, expanded, root) {
            error!("Evaluate error: {}", err);
            tree.delete(expanded);
            return Err(err);
        }
        Ok(expanded)
    }

    fn substitute_args(
        &mut self,
        tree: &mut Tree,
        config: NodeId,
        root: NodeId,
        defs: NodeId,
        subs: NodeId,
        args: Option<&str>,
    ) -> Result<NodeId> {
        load_defaults(tree, subs, defs).inspect_err(|err| error!("Load defaults error: {}", err))?;
        parse_args(tree, subs, args, defs)
            .inspect_err(|err| error!("Parse arguments error: {}", err))?;
        self.evaluate(tree, subs, root)
            .inspect_err(|err| error!("Args evaluate error: {}", err))?;
        let expanded = walk(tree, config, &mut ExpandWalker { subs })
            .inspect_err(|err| error!("Expand error (walk): {}", err))?;
        produced(tree, config, expanded)
    }

    /// Look up `name` (`key` or `key:args`) under `root`, trying `base.key`
    /// as a fallback and following aliases, then expand it with the arguments.
    pub fn search_definition(
        &mut self,
        tree: &mut Tree,
        root: NodeId,
        base: Option<&str>,
        name: &str,
    ) -> Result<NodeId> {
        let (key, args) = match name.split_once(':') {
            Some((key, args)) => (key, Some(args)),
            None => (name, None),
        };
        let config = search_alias(tree, root, base, key)?;
        self.expand(tree, config, root, args)
    }
}

// ── Expand ──────────────────────────────────────────────────────────

/// Copy a definition, replacing `$(name)` leaves from the substitution tree.
struct ExpandWalker {
    subs: NodeId,
}

impl Walker for ExpandWalker {
    fn pre(&mut self, tree: &mut Tree, src: NodeId, dst: &mut Option<NodeId>) -> Result<Visit> {
        let node = &tree[src];
        if node.id() == Some("@args") {
            return Ok(Visit::Skip);
        }
        let id = node.id_bytes().map(<[u8]>::to_vec);
        let join = node.is_join();
        *dst = Some(tree.make_compound_raw(id.as_deref(), join));
        Ok(Visit::Continue)
    }

    fn leaf(&mut self, tree: &mut Tree, src: NodeId, dst: &mut Option<NodeId>) -> Result<Visit> {
        let node = &tree[src];
        let id = node.id_bytes().map(<[u8]>::to_vec);
        let variable = node
            .string()
            .ok()
            .and_then(|s| s.strip_prefix("$(")?.strip_suffix(')'))
            .map(str::to_owned);
        let Some(variable) = variable else {
            let value = node.value().shallow_copy();
            *dst = Some(tree.make_raw(id.as_deref(), value));
            return Ok(Visit::Continue);
        };
        let Ok(bound) = search(tree, self.subs, &variable) else {
            return Ok(Visit::Skip);
        };
        let replacement = copy(tree, bound)?;
        *dst = Some(replacement);
        tree.set_id_raw(replacement, id.as_deref())?;
        Ok(Visit::Continue)
    }
}

// ── Evaluate ────────────────────────────────────────────────────────

struct EvaluateWalker<'e> {
    root: NodeId,
    funcs: &'e FuncTable,
    private: Option<&'e mut (dyn Any + 'static)>,
}

impl EvaluateWalker<'_> {
    /// The `lib` and `open` a `func.<name>` definition sets, if any.
    fn func_definition(&self, tree: &mut Tree, name: &str) -> Result<(Option<String>, Option<String>)> {
        let mut lookup = Evaluator::new(self.funcs);
        let conf = match lookup.search_definition(tree, self.root, Some("func"), name) {
            Ok(conf) => conf,
            Err(err) if err.is_not_found() => return Ok((None, None)),
            Err(err) => return Err(err),
        };
        let fields = read_func_fields(tree, conf, name);
        tree.delete(conf);
        fields
    }
}

fn read_func_fields(tree: &Tree, conf: NodeId, name: &str) -> Result<(Option<String>, Option<String>)> {
    if tree[conf].node_type() != NodeType::Compound {
        return Err(ConfError::invalid_definition(format!(
            "Invalid type for func {} definition",
            name
        )));
    }
    let (mut lib, mut open) = (None, None);
    for &field in tree[conf].children() {
        let node = &tree[field];
        match node.id() {
            Some("comment") => {}
            Some("lib") => lib = Some(node.string()?.to_owned()),
            Some("open") => open = Some(node.string()?.to_owned()),
            _ => warn!("Unknown field {}", node.display_id()),
        }
    }
    Ok((lib, open))
}

impl Walker for EvaluateWalker<'_> {
    fn pre(&mut self, tree: &mut Tree, src: NodeId, _dst: &mut Option<NodeId>) -> Result<Visit> {
        let Some(func) = tree.find_child(src, "@func") else {
            return Ok(Visit::Continue);
        };
        let name = tree[func]
            .string()
            .inspect_err(|_| error!("Invalid type for @func"))?
            .to_owned();

        let (lib, open) = self.func_definition(tree, &name)?;
        let symbol = open.unwrap_or_else(|| format!("snd_func_{}", name));
        let handler = self
            .funcs
            .resolve(lib.as_deref(), &symbol)
            .inspect_err(|err| error!("{}", err))?;

        debug!("calling {} for {}", symbol, tree[src].display_id());
        let result = handler(tree, self.root, src, self.private.as_deref_mut()).map_err(|source| {
            error!("function {} returned error: {}", symbol, source);
            ConfError::Function {
                func: symbol.clone(),
                source: Box::new(source),
            }
        })?;
        if let Some(eval) = result {
            tree.substitute(src, eval).inspect_err(|_| tree.delete(eval))?;
        }
        Ok(Visit::Replace)
    }

    fn leaf(&mut self, _tree: &mut Tree, _src: NodeId, _dst: &mut Option<NodeId>) -> Result<Visit> {
        Ok(Visit::Continue)
    }
}
