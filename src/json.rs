use std::fmt::Write;

use crate::tree::{format_real, NodeId, Tree, Value};

/// JSON formatting style.
#[derive(Clone, Copy)]
pub enum JsonStyle {
    /// Compact: no whitespace between tokens.
    Compact,
    /// Pretty: 2-space indented, one entry per line.
    Pretty,
}

struct JsonWriter<'t> {
    tree: &'t Tree,
    buf: String,
    style: JsonStyle,
    depth: usize,
}

impl<'t> JsonWriter<'t> {
    fn new(tree: &'t Tree, style: JsonStyle) -> Self {
        JsonWriter {
            tree,
            buf: String::new(),
            style,
            depth: 0,
        }
    }

    fn is_pretty(&self) -> bool {
        matches!(self.style, JsonStyle::Pretty)
    }

    fn newline(&mut self) {
        if self.is_pretty() {
            self.buf.push('\n');
            for _ in 0..self.depth {
                self.buf.push_str("  ");
            }
        }
    }

    fn space(&mut self) {
        if self.is_pretty() {
            self.buf.push(' ');
        }
    }

    fn write_node(&mut self, node: NodeId) {
        let tree = self.tree;
        match tree[node].value() {
            Value::Integer(i) => {
                let _ = write!(&mut self.buf, "{}", i);
            }
            // JSON has no NaN or infinity
            Value::Real(r) if !r.is_finite() => self.buf.push_str("null"),
            Value::Real(r) => self.buf.push_str(&format_real(*r)),
            Value::String(s) => self.write_string_value(&String::from_utf8_lossy(s)),
            Value::Compound(c) => {
                self.buf.push('{');
                self.depth += 1;
                let mut first = true;
                for &child in c.children() {
                    self.entry_sep(&mut first);
                    self.write_key(&tree[child].display_id());
                    self.write_node(child);
                }
                self.depth -= 1;
                if !c.children().is_empty() {
                    self.newline();
                }
                self.buf.push('}');
            }
        }
    }

    fn entry_sep(&mut self, first: &mut bool) {
        if *first {
            *first = false;
        } else {
            self.buf.push(',');
        }
        self.newline();
    }

    fn write_key(&mut self, key: &str) {
        self.write_string_value(key);
        self.buf.push(':');
        self.space();
    }

    fn write_string_value(&mut self, s: &str) {
        self.buf.push('"');
        for ch in s.chars() {
            match ch {
                '"' => self.buf.push_str("\\\""),
                '\\' => self.buf.push_str("\\\\"),
                '\n' => self.buf.push_str("\\n"),
                '\r' => self.buf.push_str("\\r"),
                '\t' => self.buf.push_str("\\t"),
                '\u{0008}' => self.buf.push_str("\\b"),
                '\u{000C}' => self.buf.push_str("\\f"),
                c if c < '\u{0020}' || c == '\u{007f}' => {
                    let _ = write!(&mut self.buf, "\\u{:04x}", c as u32);
                }
                c => self.buf.push(c),
            }
        }
        self.buf.push('"');
    }
}

/// Serialize a subtree to a compact JSON string.
///
/// Compounds become objects keyed by child identifier in insertion order;
/// array-style compounds stay objects keyed `"0"`, `"1"`, ...
pub fn to_json(tree: &Tree, node: NodeId) -> String {
    let mut w = JsonWriter::new(tree, JsonStyle::Compact);
    w.write_node(node);
    w.buf
}

/// Serialize a subtree to a pretty-printed JSON string (2-space indent).
pub fn to_json_pretty(tree: &Tree, node: NodeId) -> String {
    let mut w = JsonWriter::new(tree, JsonStyle::Pretty);
    w.write_node(node);
    w.buf
}
