use std::fmt;
use std::ops::Index;
use std::str::FromStr;

use crate::error::{ConfError, Result};

/// Handle to a node stored in a [`Tree`].
///
/// Handles are cheap to copy. A handle outlives the node it names: once the
/// node is deleted its slot generation moves on and the handle goes stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

/// The four kinds of node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Integer,
    Real,
    String,
    Compound,
}

impl NodeType {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeType::Integer => "integer",
            NodeType::Real => "real",
            NodeType::String => "string",
            NodeType::Compound => "compound",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = ConfError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "integer" => Ok(NodeType::Integer),
            "real" => Ok(NodeType::Real),
            "string" => Ok(NodeType::String),
            "compound" => Ok(NodeType::Compound),
            other => Err(ConfError::invalid_definition(format!(
                "unknown node type {}",
                other
            ))),
        }
    }
}

/// Child list of a compound node. Only [`Tree`] can change it.
#[derive(Debug, Default, PartialEq)]
pub struct Compound {
    children: Vec<NodeId>,
    join: bool,
}

impl Compound {
    pub fn new(join: bool) -> Self {
        Compound {
            children: Vec::new(),
            join,
        }
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// Set on compounds created by a dotted-path assignment.
    pub fn is_join(&self) -> bool {
        self.join
    }
}

/// Payload of a node.
#[derive(Debug, PartialEq)]
pub enum Value {
    Integer(i64),
    Real(f64),
    /// Raw bytes; the text format does not require UTF-8.
    String(Vec<u8>),
    Compound(Compound),
}

impl Value {
    pub fn node_type(&self) -> NodeType {
        match self {
            Value::Integer(_) => NodeType::Integer,
            Value::Real(_) => NodeType::Real,
            Value::String(_) => NodeType::String,
            Value::Compound(_) => NodeType::Compound,
        }
    }

    /// The zero value of a type: 0, 0.0, "" or an empty compound.
    pub fn zero(ty: NodeType) -> Self {
        match ty {
            NodeType::Integer => Value::Integer(0),
            NodeType::Real => Value::Real(0.0),
            NodeType::String => Value::String(Vec::new()),
            NodeType::Compound => Value::Compound(Compound::new(false)),
        }
    }

    /// Classify a scalar token: integer first, then real, else string.
    /// Only tokens starting with a digit or `-` are tried as numbers.
    pub fn from_token(token: Vec<u8>) -> Self {
        let numeric = matches!(token.first(), Some(b'0'..=b'9' | b'-'));
        if let (true, Ok(text)) = (numeric, std::str::from_utf8(&token)) {
            if let Some(i) = parse_integer(text) {
                return Value::Integer(i);
            }
            if let Some(r) = parse_real(text) {
                return Value::Real(r);
            }
        }
        Value::String(token)
    }

    /// Copy a scalar payload. Compounds come back empty with the same join flag.
    pub(crate) fn shallow_copy(&self) -> Self {
        match self {
            Value::Integer(i) => Value::Integer(*i),
            Value::Real(r) => Value::Real(*r),
            Value::String(s) => Value::String(s.clone()),
            Value::Compound(c) => Value::Compound(Compound::new(c.join)),
        }
    }
}

/// A single node: identifier, payload and parent back-reference.
#[derive(Debug)]
pub struct Node {
    id: Option<Vec<u8>>,
    value: Value,
    parent: Option<NodeId>,
}

impl Node {
    /// The identifier as text; `None` for anonymous nodes and for
    /// identifiers that are not UTF-8.
    pub fn id(&self) -> Option<&str> {
        self.id_bytes().and_then(|id| std::str::from_utf8(id).ok())
    }

    pub fn id_bytes(&self) -> Option<&[u8]> {
        self.id.as_deref()
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn node_type(&self) -> NodeType {
        self.value.node_type()
    }

    pub fn is_join(&self) -> bool {
        matches!(&self.value, Value::Compound(c) if c.join)
    }

    /// Children of a compound; empty for scalars.
    pub fn children(&self) -> &[NodeId] {
        match &self.value {
            Value::Compound(c) => &c.children,
            _ => &[],
        }
    }

    pub(crate) fn display_id(&self) -> String {
        lossy(self.id_bytes())
    }

    fn mismatch(&self, expected: NodeType) -> ConfError {
        ConfError::TypeMismatch {
            id: self.display_id(),
            expected,
            found: self.node_type(),
        }
    }

    pub fn integer(&self) -> Result<i64> {
        match self.value {
            Value::Integer(i) => Ok(i),
            _ => Err(self.mismatch(NodeType::Integer)),
        }
    }

    pub fn real(&self) -> Result<f64> {
        match self.value {
            Value::Real(r) => Ok(r),
            _ => Err(self.mismatch(NodeType::Real)),
        }
    }

    /// A string payload as text. Fails with `NotUtf8` on other bytes.
    pub fn string(&self) -> Result<&str> {
        std::str::from_utf8(self.bytes()?).map_err(|_| ConfError::NotUtf8 {
            id: self.display_id(),
        })
    }

    pub fn bytes(&self) -> Result<&[u8]> {
        match &self.value {
            Value::String(s) => Ok(s),
            _ => Err(self.mismatch(NodeType::String)),
        }
    }

    /// Render a scalar as text bytes. Compounds have no ASCII form.
    pub fn ascii(&self) -> Result<Vec<u8>> {
        match &self.value {
            Value::Integer(i) => Ok(i.to_string().into_bytes()),
            Value::Real(r) => Ok(format_real(*r).into_bytes()),
            Value::String(s) => Ok(s.clone()),
            Value::Compound(_) => Err(self.mismatch(NodeType::String)),
        }
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    node: Option<Node>,
}

/// Arena owning every node of one or more configuration trees.
///
/// Roots are simply nodes without a parent. Copies, expansions and argument
/// trees live in the same arena as the tree they were derived from.
#[derive(Debug, Default)]
pub struct Tree {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl Index<NodeId> for Tree {
    type Output = Node;

    /// # Panics
    ///
    /// Panics if the handle is stale.
    fn index(&self, id: NodeId) -> &Node {
        self.get(id).expect("stale node handle")
    }
}

impl Tree {
    pub fn new() -> Self {
        Tree::default()
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
            .expect("stale node handle")
    }

    fn compound_mut(&mut self, id: NodeId) -> Option<&mut Compound> {
        match &mut self.node_mut(id).value {
            Value::Compound(c) => Some(c),
            _ => None,
        }
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.node = Some(node);
            return NodeId {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            node: Some(node),
        });
        NodeId {
            index,
            generation: 0,
        }
    }

    // ── Construction ────────────────────────────────────────────────

    /// Create a detached node.
    pub fn make(&mut self, id: Option<&str>, value: Value) -> NodeId {
        self.make_raw(id.map(str::as_bytes), value)
    }

    /// Create a detached node whose identifier is arbitrary bytes.
    pub fn make_raw(&mut self, id: Option<&[u8]>, value: Value) -> NodeId {
        self.alloc(Node {
            id: id.map(<[u8]>::to_vec),
            value,
            parent: None,
        })
    }

    /// Create a detached node holding the zero value of `ty`.
    pub fn make_typed(&mut self, id: Option<&str>, ty: NodeType) -> NodeId {
        self.make(id, Value::zero(ty))
    }

    pub fn make_compound(&mut self, id: Option<&str>, join: bool) -> NodeId {
        self.make_compound_raw(id.map(str::as_bytes), join)
    }

    pub fn make_compound_raw(&mut self, id: Option<&[u8]>, join: bool) -> NodeId {
        self.make_raw(id, Value::Compound(Compound::new(join)))
    }

    /// Create an empty, unnamed root compound.
    pub fn top(&mut self) -> NodeId {
        self.make_compound_raw(None, false)
    }

    /// Delete every node. Handles taken before the call all go stale.
    pub fn clear(&mut self) {
        self.free.clear();
        for (index, slot) in self.slots.iter_mut().enumerate().rev() {
            if slot.node.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
            }
            self.free.push(index as u32);
        }
        self.live = 0;
    }

    // ── Structure ───────────────────────────────────────────────────

    /// Find a direct child by identifier.
    pub fn find_child(&self, parent: NodeId, id: impl AsRef<[u8]>) -> Option<NodeId> {
        let id = id.as_ref();
        self[parent]
            .children()
            .iter()
            .copied()
            .find(|&child| self[child].id_bytes() == Some(id))
    }

    /// Append a detached node to a compound.
    ///
    /// # Panics
    ///
    /// Panics if `child` is already attached somewhere.
    pub fn add(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        assert!(
            self[child].parent.is_none(),
            "node is already attached to a parent"
        );
        let parent_node = &self[parent];
        if parent_node.node_type() != NodeType::Compound {
            return Err(parent_node.mismatch(NodeType::Compound));
        }
        let child_id = self[child].id.clone();
        let clash = parent_node
            .children()
            .iter()
            .any(|&sibling| self[sibling].id == child_id);
        if clash {
            return Err(ConfError::Duplicate {
                id: lossy(child_id.as_deref()),
            });
        }
        if let Some(c) = self.compound_mut(parent) {
            c.children.push(child);
        }
        self.node_mut(child).parent = Some(parent);
        Ok(())
    }

    /// Unlink a node from its parent, keeping it alive.
    pub fn detach(&mut self, node: NodeId) {
        let Some(parent) = self.node_mut(node).parent.take() else {
            return;
        };
        if let Some(c) = self.compound_mut(parent) {
            c.children.retain(|&child| child != node);
        }
    }

    /// Delete a node and all its descendants. Stale handles are ignored.
    pub fn delete(&mut self, node: NodeId) {
        if !self.contains(node) {
            return;
        }
        let children = self[node].children().to_vec();
        for child in children {
            self.delete(child);
        }
        self.detach(node);
        let slot = &mut self.slots[node.index as usize];
        slot.node = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(node.index);
        self.live -= 1;
    }

    /// Rename a node. Attached nodes must stay unique among their siblings.
    pub fn set_id(&mut self, node: NodeId, id: Option<&str>) -> Result<()> {
        self.set_id_raw(node, id.map(str::as_bytes))
    }

    pub fn set_id_raw(&mut self, node: NodeId, id: Option<&[u8]>) -> Result<()> {
        if let Some(parent) = self[node].parent {
            let clash = self[parent]
                .children()
                .iter()
                .any(|&sibling| sibling != node && self[sibling].id_bytes() == id);
            if clash {
                return Err(ConfError::Duplicate {
                    id: lossy(id),
                });
            }
        }
        self.node_mut(node).id = id.map(<[u8]>::to_vec);
        Ok(())
    }

    pub fn set_join(&mut self, node: NodeId, join: bool) -> Result<()> {
        match self.compound_mut(node) {
            Some(c) => {
                c.join = join;
                Ok(())
            }
            None => Err(self[node].mismatch(NodeType::Compound)),
        }
    }

    /// Move `src`'s identifier and payload into `dst`, then free `src`.
    ///
    /// `dst` keeps its handle and its place in its parent; its old children
    /// are deleted and `src`'s children are re-parented onto it.
    pub fn substitute(&mut self, dst: NodeId, src: NodeId) -> Result<()> {
        let new_id = self[src].id.clone();
        if let Some(parent) = self[dst].parent {
            let clash = self[parent]
                .children()
                .iter()
                .any(|&sibling| sibling != dst && self[sibling].id == new_id);
            if clash {
                return Err(ConfError::Duplicate {
                    id: lossy(new_id.as_deref()),
                });
            }
        }
        self.detach(src);
        let old_children = self[dst].children().to_vec();
        for child in old_children {
            self.delete(child);
        }

        let slot = &mut self.slots[src.index as usize];
        let taken = slot.node.take().expect("stale node handle");
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(src.index);
        self.live -= 1;

        for &child in taken.children() {
            self.node_mut(child).parent = Some(dst);
        }
        let node = self.node_mut(dst);
        node.id = taken.id;
        node.value = taken.value;
        Ok(())
    }

    // ── Values ──────────────────────────────────────────────────────

    /// Swap in a new scalar payload of the same type, returning the old one.
    pub(crate) fn replace_value(&mut self, node: NodeId, value: Value) -> Result<Value> {
        let current = &self[node];
        if current.node_type() != value.node_type() || current.node_type() == NodeType::Compound {
            return Err(current.mismatch(current.node_type()));
        }
        Ok(std::mem::replace(&mut self.node_mut(node).value, value))
    }

    pub fn set_integer(&mut self, node: NodeId, value: i64) -> Result<()> {
        self.replace_value(node, Value::Integer(value))
            .map(drop)
            .map_err(|_| self[node].mismatch(NodeType::Integer))
    }

    pub fn set_real(&mut self, node: NodeId, value: f64) -> Result<()> {
        self.replace_value(node, Value::Real(value))
            .map(drop)
            .map_err(|_| self[node].mismatch(NodeType::Real))
    }

    pub fn set_string(&mut self, node: NodeId, value: &str) -> Result<()> {
        self.set_bytes(node, value.as_bytes())
    }

    pub fn set_bytes(&mut self, node: NodeId, value: &[u8]) -> Result<()> {
        self.replace_value(node, Value::String(value.to_vec()))
            .map(drop)
            .map_err(|_| self[node].mismatch(NodeType::String))
    }

    /// Parse `ascii` according to the node's current type and store it.
    pub fn set_ascii(&mut self, node: NodeId, ascii: &str) -> Result<()> {
        let ty = self[node].node_type();
        let value = match ty {
            NodeType::Integer => parse_integer(ascii).map(Value::Integer),
            NodeType::Real => parse_real(ascii).map(Value::Real),
            NodeType::String => Some(Value::String(ascii.as_bytes().to_vec())),
            NodeType::Compound => None,
        };
        match value {
            Some(value) => self.replace_value(node, value).map(drop),
            None => Err(ConfError::invalid_argument(
                self[node].display_id(),
                format!("cannot hold {:?} as {}", ascii, ty),
            )),
        }
    }

    // ── Comparison ──────────────────────────────────────────────────

    /// Deep comparison of identifiers, types, values, join flags and child order.
    pub fn structurally_eq(&self, a: NodeId, other: &Tree, b: NodeId) -> bool {
        let (left, right) = (&self[a], &other[b]);
        if left.id != right.id {
            return false;
        }
        match (&left.value, &right.value) {
            (Value::Compound(x), Value::Compound(y)) => {
                x.join == y.join
                    && x.children.len() == y.children.len()
                    && x
                        .children
                        .iter()
                        .zip(&y.children)
                        .all(|(&l, &r)| self.structurally_eq(l, other, r))
            }
            (x, y) => x == y,
        }
    }
}

/// Identifier bytes for messages.
fn lossy(id: Option<&[u8]>) -> String {
    String::from_utf8_lossy(id.unwrap_or_default()).into_owned()
}

// ── Number conversion ───────────────────────────────────────────────

/// Integer parsing with C `strtol` base-0 rules: `0x` hex, leading `0` octal.
pub fn parse_integer(text: &str) -> Option<i64> {
    let (negative, body) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let (radix, digits) = if let Some(hex) = body
        .strip_prefix("0x")
        .or_else(|| body.strip_prefix("0X"))
    {
        (16, hex)
    } else if body.len() > 1 && body.starts_with('0') {
        (8, &body[1..])
    } else {
        (10, body)
    };
    if digits.is_empty() || !digits.chars().all(|ch| ch.is_digit(radix)) {
        return None;
    }
    let magnitude = i128::from_str_radix(digits, radix).ok()?;
    let value = if negative { -magnitude } else { magnitude };
    i64::try_from(value).ok()
}

pub fn parse_real(text: &str) -> Option<f64> {
    if text.is_empty() {
        return None;
    }
    text.parse().ok()
}

/// Shortest text that reads back as the same real (always has `.` or an exponent).
pub fn format_real(value: f64) -> String {
    format!("{:?}", value)
}
