use std::io::{self, Write};

use crate::tree::{format_real, NodeId, Tree, Value};

/// Write `node` as configuration text.
///
/// A compound prints its children one per line at the outermost level; a
/// scalar prints just its value.
pub fn save(tree: &Tree, node: NodeId, out: &mut impl Write) -> io::Result<()> {
    match tree[node].value() {
        Value::Compound(_) => save_leaves(tree, node, out, 0, 0),
        _ => save_leaf(tree, node, out, 0),
    }
}

/// Render `node` to a string.
pub fn save_string(tree: &Tree, node: NodeId) -> String {
    let mut buf = Vec::new();
    // Writing into a Vec cannot fail.
    let _ = save(tree, node, &mut buf);
    String::from_utf8_lossy(&buf).into_owned()
}

fn indent(out: &mut impl Write, level: usize) -> io::Result<()> {
    for _ in 0..level {
        out.write_all(b"\t")?;
    }
    Ok(())
}

fn save_leaves(
    tree: &Tree,
    node: NodeId,
    out: &mut impl Write,
    level: usize,
    joins: usize,
) -> io::Result<()> {
    for &child in tree[node].children() {
        if tree[child].is_join() {
            save_leaves(tree, child, out, level, joins + 1)?;
            continue;
        }
        indent(out, level)?;
        write_id(tree, child, out, joins)?;
        out.write_all(b" ")?;
        save_leaf(tree, child, out, level)?;
        out.write_all(b"\n")?;
    }
    Ok(())
}

fn save_leaf(tree: &Tree, node: NodeId, out: &mut impl Write, level: usize) -> io::Result<()> {
    match tree[node].value() {
        Value::Integer(i) => write!(out, "{}", i),
        Value::Real(r) => out.write_all(format_real(*r).as_bytes()),
        Value::String(s) => write_string(out, s, false),
        Value::Compound(_) => {
            out.write_all(b"{\n")?;
            save_leaves(tree, node, out, level + 1, 0)?;
            indent(out, level)?;
            out.write_all(b"}")
        }
    }
}

/// Print the identifier, prefixed by the `joins` enclosing join compounds.
fn write_id(tree: &Tree, node: NodeId, out: &mut impl Write, joins: usize) -> io::Result<()> {
    if joins > 0 {
        if let Some(parent) = tree[node].parent() {
            write_id(tree, parent, out, joins - 1)?;
            out.write_all(b".")?;
        }
    }
    let id = tree[node].id_bytes().unwrap_or_default();
    write_string(out, id, true)
}

fn needs_quotes(text: &[u8], id: bool) -> bool {
    match text.first() {
        None | Some(b'<') => return true,
        Some(b'0'..=b'9' | b'-') if !id => return true,
        _ => {}
    }
    text.iter().any(|&b| {
        matches!(
            b,
            0..=32
                | 127..=255
                | b'='
                | b';'
                | b','
                | b'.'
                | b'{'
                | b'}'
                | b'['
                | b']'
                | b'\''
                | b'"'
                | b'\\'
                | b'#'
        )
    })
}

fn write_string(out: &mut impl Write, text: &[u8], id: bool) -> io::Result<()> {
    if !needs_quotes(text, id) {
        return out.write_all(text);
    }
    out.write_all(b"'")?;
    for &b in text {
        match b {
            b'\n' => out.write_all(b"\\n")?,
            b'\t' => out.write_all(b"\\t")?,
            b'\x0b' => out.write_all(b"\\v")?,
            b'\x08' => out.write_all(b"\\b")?,
            b'\r' => out.write_all(b"\\r")?,
            b'\x0c' => out.write_all(b"\\f")?,
            b'\'' => out.write_all(b"\\'")?,
            b'\\' => out.write_all(b"\\\\")?,
            32..=126 => out.write_all(&[b])?,
            _ => write!(out, "\\{:03o}", b)?,
        }
    }
    out.write_all(b"'")
}

