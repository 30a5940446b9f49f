use std::collections::HashSet;

use crate::error::{ConfError, Result};
use crate::tree::{NodeId, NodeType, Tree};

/// Find the node at a dot-separated `key` below `node`.
pub fn search(tree: &Tree, node: NodeId, key: &str) -> Result<NodeId> {
    let mut current = node;
    for segment in key.split('.') {
        if tree[current].node_type() != NodeType::Compound {
            return Err(ConfError::not_found(key));
        }
        current = tree
            .find_child(current, segment)
            .ok_or_else(|| ConfError::not_found(key))?;
    }
    Ok(current)
}

/// Apply [`search`] with each key in turn, starting from the previous result.
pub fn searchv(tree: &Tree, node: NodeId, keys: &[&str]) -> Result<NodeId> {
    keys.iter()
        .try_fold(node, |current, key| search(tree, current, key))
}

/// Find `key`, falling back to `base.key`, and follow string aliases.
///
/// While the node found holds a string, that string is looked up again from
/// `node`. When a chased string is not itself a key, the string node is the
/// result. Only a missing first key is `NotFound`; revisiting a key is
/// `CyclicAlias`.
pub fn search_alias(tree: &Tree, node: NodeId, base: Option<&str>, key: &str) -> Result<NodeId> {
    let mut visited: HashSet<String> = HashSet::new();
    let mut key = key.to_owned();
    let mut found: Option<NodeId> = None;
    loop {
        if !visited.insert(key.clone()) {
            return Err(ConfError::CyclicAlias { key });
        }
        let hit = match search(tree, node, &key) {
            Ok(hit) => hit,
            Err(err) => {
                let fallback = match base {
                    Some(base) => searchv(tree, node, &[base, &key]),
                    None => Err(err),
                };
                match (fallback, found) {
                    (Ok(hit), _) => hit,
                    (Err(_), Some(last)) => return Ok(last),
                    (Err(err), None) => return Err(err),
                }
            }
        };
        found = Some(hit);
        match tree[hit].string() {
            Ok(alias) => key = alias.to_owned(),
            Err(_) => return Ok(hit),
        }
    }
}
