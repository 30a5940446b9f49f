use crate::error::{ConfError, Result};
use crate::tree::{NodeId, NodeType, Tree};

/// What the walk does after a callback returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    /// Keep going: descend into children (`pre`) or keep the result.
    Continue,
    /// Drop the destination built so far and do not descend.
    Skip,
    /// Keep the destination as it is and do not descend.
    Replace,
}

/// A traversal policy.
///
/// `dst` is the destination node built for `src`, if the policy builds one.
/// Children's destinations are added to their parent's destination.
pub trait Walker {
    /// Called on a compound before its children.
    fn pre(&mut self, _tree: &mut Tree, _src: NodeId, _dst: &mut Option<NodeId>) -> Result<Visit> {
        Ok(Visit::Continue)
    }

    /// Called on a compound after its children.
    fn post(&mut self, _tree: &mut Tree, _src: NodeId, _dst: &mut Option<NodeId>) -> Result<Visit> {
        Ok(Visit::Continue)
    }

    /// Called on every non-compound node.
    fn leaf(&mut self, tree: &mut Tree, src: NodeId, dst: &mut Option<NodeId>) -> Result<Visit>;
}

/// Walk `src` depth first and return the destination it produced, if any.
///
/// On error every destination node built so far is deleted.
pub fn walk<W: Walker + ?Sized>(tree: &mut Tree, src: NodeId, walker: &mut W) -> Result<Option<NodeId>> {
    let mut dst = None;
    let keep = walk_node(tree, src, &mut dst, walker)?;
    if !keep {
        discard(tree, &mut dst);
    }
    Ok(dst)
}

fn discard(tree: &mut Tree, dst: &mut Option<NodeId>) {
    if let Some(node) = dst.take() {
        tree.delete(node);
    }
}

/// Fold a callback result into the walk: `Ok(false)` means the subtree is dropped.
fn settle(tree: &mut Tree, dst: &mut Option<NodeId>, visit: Result<Visit>) -> Result<bool> {
    match visit {
        Ok(Visit::Skip) => {
            discard(tree, dst);
            Ok(false)
        }
        Ok(_) => Ok(true),
        Err(err) => {
            discard(tree, dst);
            Err(err)
        }
    }
}

fn walk_node<W: Walker + ?Sized>(
    tree: &mut Tree,
    src: NodeId,
    dst: &mut Option<NodeId>,
    walker: &mut W,
) -> Result<bool> {
    if tree[src].node_type() != NodeType::Compound {
        let visit = walker.leaf(tree, src, dst);
        return settle(tree, dst, visit);
    }

    let visit = walker.pre(tree, src, dst);
    let replaced = matches!(visit, Ok(Visit::Replace));
    if !settle(tree, dst, visit)? {
        return Ok(false);
    }
    if replaced {
        return Ok(true);
    }

    // Callbacks may restructure the tree; walk the children present at entry.
    let children = tree[src].children().to_vec();
    for child in children {
        if !tree.contains(child) {
            continue;
        }
        let mut child_dst = None;
        if let Err(err) = walk_child(tree, child, &mut child_dst, *dst, walker) {
            discard(tree, dst);
            return Err(err);
        }
    }

    let visit = walker.post(tree, src, dst);
    settle(tree, dst, visit)
}

fn walk_child<W: Walker + ?Sized>(
    tree: &mut Tree,
    child: NodeId,
    child_dst: &mut Option<NodeId>,
    parent_dst: Option<NodeId>,
    walker: &mut W,
) -> Result<()> {
    let keep = walk_node(tree, child, child_dst, walker)?;
    let Some(built) = child_dst.take() else {
        return Ok(());
    };
    match parent_dst {
        Some(parent) if keep => tree.add(parent, built).inspect_err(|_| tree.delete(built)),
        _ => {
            tree.delete(built);
            Ok(())
        }
    }
}

/// Unwrap the destination of a walk that must produce one.
pub(crate) fn produced(tree: &Tree, src: NodeId, dst: Option<NodeId>) -> Result<NodeId> {
    dst.ok_or_else(|| ConfError::not_found(tree[src].display_id()))
}

// ── Copy ────────────────────────────────────────────────────────────

/// Deep clone preserving identifiers, types, values and join flags.
pub struct CopyWalker;

impl Walker for CopyWalker {
    fn pre(&mut self, tree: &mut Tree, src: NodeId, dst: &mut Option<NodeId>) -> Result<Visit> {
        let node = &tree[src];
        let id = node.id_bytes().map(<[u8]>::to_vec);
        let join = node.is_join();
        *dst = Some(tree.make_compound_raw(id.as_deref(), join));
        Ok(Visit::Continue)
    }

    fn leaf(&mut self, tree: &mut Tree, src: NodeId, dst: &mut Option<NodeId>) -> Result<Visit> {
        let node = &tree[src];
        let id = node.id_bytes().map(<[u8]>::to_vec);
        let value = node.value().shallow_copy();
        *dst = Some(tree.make_raw(id.as_deref(), value));
        Ok(Visit::Continue)
    }
}

/// Return a detached deep copy of `src`.
pub fn copy(tree: &mut Tree, src: NodeId) -> Result<NodeId> {
    let dst = walk(tree, src, &mut CopyWalker)?;
    produced(tree, src, dst)
}
