use std::path::Path;

use tracing::error;

use crate::error::{ConfError, Result, SyntaxErrorKind};
use crate::lexer::Input;
use crate::tree::{Compound, NodeId, NodeType, Tree, Value};

/// One reversible change made while loading.
enum Undo {
    Created(NodeId),
    Value(NodeId, Value),
    Join(NodeId, bool),
}

/// Parser state: the tree being extended, the token source and the undo journal.
struct Parser<'a> {
    tree: &'a mut Tree,
    input: &'a mut Input,
    journal: Vec<Undo>,
}

/// Parse every definition in `input` into the compound `root`.
///
/// Loading is all-or-nothing: on error every node created by this call is
/// deleted and every overwritten value is restored before the error returns.
pub fn load(tree: &mut Tree, root: NodeId, input: &mut Input) -> Result<()> {
    let root_node = &tree[root];
    if root_node.node_type() != NodeType::Compound {
        return Err(ConfError::TypeMismatch {
            id: root_node.display_id(),
            expected: NodeType::Compound,
            found: root_node.node_type(),
        });
    }
    let mut parser = Parser {
        tree,
        input,
        journal: Vec::new(),
    };
    let result = parser.parse_top(root);
    if let Err(err) = &result {
        error!("{}", err);
        parser.rollback();
    }
    result
}

/// Parse a string into `root`.
pub fn load_str(tree: &mut Tree, root: NodeId, text: &str) -> Result<()> {
    load(tree, root, &mut Input::from_text(text))
}

/// Parse a file into `root`. Includes are resolved relative to the working directory.
pub fn load_file(tree: &mut Tree, root: NodeId, path: impl AsRef<Path>) -> Result<()> {
    let mut input = Input::open(path)?;
    load(tree, root, &mut input)
}

impl<'a> Parser<'a> {
    // ── Journal ─────────────────────────────────────────────────────

    fn rollback(&mut self) {
        while let Some(undo) = self.journal.pop() {
            match undo {
                Undo::Created(node) => self.tree.delete(node),
                Undo::Value(node, value) => {
                    if self.tree.contains(node) {
                        let _ = self.tree.replace_value(node, value);
                    }
                }
                Undo::Join(node, join) => {
                    if self.tree.contains(node) {
                        let _ = self.tree.set_join(node, join);
                    }
                }
            }
        }
    }

    /// Create a node under `parent`, recording it for rollback.
    fn create(&mut self, parent: NodeId, id: &[u8], value: Value) -> Result<NodeId> {
        let node = self.tree.make_raw(Some(id), value);
        self.journal.push(Undo::Created(node));
        self.tree.add(parent, node)?;
        Ok(node)
    }

    fn mismatch(&self, id: &[u8], expected: NodeType, found: NodeType) -> ConfError {
        ConfError::TypeMismatch {
            id: String::from_utf8_lossy(id).into_owned(),
            expected,
            found,
        }
    }

    // ── Definitions ─────────────────────────────────────────────────

    fn parse_top(&mut self, root: NodeId) -> Result<()> {
        self.parse_defs(root)?;
        match self.input.get_char()? {
            None => Ok(()),
            Some(_) => Err(self.input.error(SyntaxErrorKind::UnexpectedChar)),
        }
    }

    /// Zero or more definitions, up to end of input or a `}` (left unread).
    fn parse_defs(&mut self, parent: NodeId) -> Result<()> {
        loop {
            let ch = self.input.get_nonwhite()?;
            self.input.unget(ch);
            if matches!(ch, None | Some(b'}')) {
                return Ok(());
            }
            self.parse_def(parent)?;
        }
    }

    /// `id(.id)* [=] value [;|,]`
    fn parse_def(&mut self, parent: NodeId) -> Result<()> {
        let mut parent = parent;
        let (id, ch) = loop {
            let id = self.input.get_string(true)?;
            let ch = self.input.get_nonwhite()?;
            if ch != Some(b'.') {
                break (id, ch);
            }
            parent = self.enter_join(parent, &id)?;
        };
        let ch = match ch {
            Some(b'=') => self.input.get_nonwhite()?,
            other => other,
        };
        let existing = self.tree.find_child(parent, &id);
        self.parse_assignment(parent, &id, existing, ch)?;
        self.skip_separator()
    }

    /// Enter (or create) the compound named by one dotted-path segment.
    fn enter_join(&mut self, parent: NodeId, id: &[u8]) -> Result<NodeId> {
        match self.tree.find_child(parent, id) {
            Some(node) => {
                let found = self.tree[node].node_type();
                if found != NodeType::Compound {
                    return Err(self.mismatch(id, NodeType::Compound, found));
                }
                if !self.tree[node].is_join() {
                    self.journal.push(Undo::Join(node, false));
                    self.tree.set_join(node, true)?;
                }
                Ok(node)
            }
            None => self.create(parent, id, Value::Compound(Compound::new(true))),
        }
    }

    fn skip_separator(&mut self) -> Result<()> {
        match self.input.get_nonwhite()? {
            Some(b';' | b',') => {}
            other => self.input.unget(other),
        }
        Ok(())
    }

    /// Assign the value starting at `ch` to `id` under `parent`.
    fn parse_assignment(
        &mut self,
        parent: NodeId,
        id: &[u8],
        existing: Option<NodeId>,
        ch: Option<u8>,
    ) -> Result<()> {
        let (open, close) = match ch {
            Some(b'{') => (b'{', b'}'),
            Some(b'[') => (b'[', b']'),
            other => {
                self.input.unget(other);
                return self.parse_value(parent, id, existing);
            }
        };
        let node = match existing {
            Some(node) => {
                let found = self.tree[node].node_type();
                if found != NodeType::Compound {
                    return Err(self.mismatch(id, found, NodeType::Compound));
                }
                node
            }
            None => self.create(parent, id, Value::Compound(Compound::new(false)))?,
        };
        if open == b'{' {
            self.parse_defs(node)?;
        } else {
            self.parse_array_defs(node)?;
        }
        match self.input.get_nonwhite()? {
            Some(ch) if ch == close => Ok(()),
            None => Err(self.input.error(SyntaxErrorKind::UnexpectedEof)),
            Some(_) => Err(self.input.error(SyntaxErrorKind::UnexpectedChar)),
        }
    }

    // ── Arrays ──────────────────────────────────────────────────────

    fn parse_array_defs(&mut self, parent: NodeId) -> Result<()> {
        let mut index = 0usize;
        loop {
            let ch = self.input.get_nonwhite()?;
            self.input.unget(ch);
            if matches!(ch, None | Some(b']')) {
                return Ok(());
            }
            self.parse_array_def(parent, index)?;
            index += 1;
        }
    }

    /// An array element: a definition whose identifier is its position.
    fn parse_array_def(&mut self, parent: NodeId, index: usize) -> Result<()> {
        let id = index.to_string();
        let existing = self.tree.find_child(parent, &id);
        let ch = self.input.get_nonwhite()?;
        self.parse_assignment(parent, id.as_bytes(), existing, ch)?;
        self.skip_separator()
    }

    // ── Scalars ─────────────────────────────────────────────────────

    fn parse_value(&mut self, parent: NodeId, id: &[u8], existing: Option<NodeId>) -> Result<()> {
        let token = self.input.get_string(false)?;
        let value = Value::from_token(token);
        match existing {
            Some(node) => {
                let current = self.tree[node].node_type();
                if current != value.node_type() {
                    return Err(self.mismatch(id, current, value.node_type()));
                }
                let old = self.tree.replace_value(node, value)?;
                self.journal.push(Undo::Value(node, old));
            }
            None => {
                self.create(parent, id, value)?;
            }
        }
        Ok(())
    }
}
