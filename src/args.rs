use crate::error::{ConfError, Result};
use crate::lexer::unescape;
use crate::parser::load_str;
use crate::search::{search, search_alias};
use crate::tree::{parse_integer, parse_real, NodeId, NodeType, Tree, Value};
use crate::walk::copy;

/// Seed `subs` with the `default` of every parameter declared in `defs`.
pub fn load_defaults(tree: &mut Tree, subs: NodeId, defs: NodeId) -> Result<()> {
    for def in tree[defs].children().to_vec() {
        if tree[def].node_type() != NodeType::Compound {
            continue;
        }
        let param = tree[def].id_bytes().map(<[u8]>::to_vec);
        for field in tree[def].children().to_vec() {
            match tree[field].id() {
                Some("type") => {}
                Some("default") => {
                    let seeded = copy(tree, field)?;
                    tree.set_id_raw(seeded, param.as_deref())?;
                    tree.add(subs, seeded).inspect_err(|_| tree.delete(seeded))?;
                }
                _ => {
                    return Err(ConfError::invalid_definition(format!(
                        "Unknown field {}",
                        tree[field].display_id()
                    )))
                }
            }
        }
    }
    Ok(())
}

/// Bind an argument string against the parameters declared in `defs`.
///
/// Accepts `{ config text }`, `name=value, ...` and positional `value, ...`.
pub fn parse_args(tree: &mut Tree, subs: NodeId, args: Option<&str>, defs: NodeId) -> Result<()> {
    let Some(args) = args else {
        return Ok(());
    };
    let args = args.trim_start_matches(is_blank);
    if args.is_empty() {
        return Ok(());
    }
    if args.starts_with('{') {
        return parse_block(tree, subs, args, defs);
    }

    let mut cursor = ArgCursor::new(args);
    let mut position = 0usize;
    loop {
        let (name, value) = cursor.parse_arg(position)?;
        bind(tree, subs, defs, name, position, &value)?;
        cursor.skip_blank();
        match cursor.peek() {
            None => return Ok(()),
            Some(b',') => cursor.pos += 1,
            Some(_) => {
                return Err(ConfError::invalid_argument(
                    position.to_string(),
                    "must be followed by ','",
                ))
            }
        }
        position += 1;
    }
}

fn is_blank(ch: char) -> bool {
    matches!(ch, ' ' | '\x0c' | '\t' | '\n' | '\r')
}

/// The `{ ... }` form: parse with the config grammar, then check each entry.
fn parse_block(tree: &mut Tree, subs: NodeId, args: &str, defs: NodeId) -> Result<()> {
    let body = args.trim_end_matches(is_blank);
    let Some(inner) = body.strip_prefix('{').and_then(|b| b.strip_suffix('}')) else {
        return Err(ConfError::invalid_argument(args, "is not terminated by '}'"));
    };
    let parsed = tree.top();
    let result = load_str(tree, parsed, inner).and_then(|()| adopt_block(tree, subs, parsed, defs));
    tree.delete(parsed);
    result
}

fn adopt_block(tree: &mut Tree, subs: NodeId, parsed: NodeId, defs: NodeId) -> Result<()> {
    for entry in tree[parsed].children().to_vec() {
        let Some(param) = tree[entry].id().map(str::to_owned) else {
            return Err(ConfError::UnknownParameter {
                param: tree[entry].display_id(),
            });
        };
        let def = search(tree, defs, &param).map_err(|_| ConfError::UnknownParameter {
            param: param.clone(),
        })?;
        let typed = tree[def].node_type() == NodeType::Compound && tree.find_child(def, "type").is_some();
        if typed {
            let ty = declared_type(tree, def, &param)?;
            coerce(tree, entry, &param, ty)?;
        }
        tree.detach(entry);
        if let Some(old) = tree.find_child(subs, &param) {
            tree.delete(old);
        }
        tree.add(subs, entry).inspect_err(|_| tree.delete(entry))?;
    }
    Ok(())
}

/// Convert a parsed entry in place to the declared type.
fn coerce(tree: &mut Tree, entry: NodeId, param: &str, ty: NodeType) -> Result<()> {
    let found = tree[entry].node_type();
    if found == ty {
        return Ok(());
    }
    if found == NodeType::Compound {
        return Err(ConfError::invalid_argument(param, format!("must be a {}", ty)));
    }
    let text = tree[entry].ascii()?;
    let value = convert(param, &text, ty)?;
    let fresh = tree.make(Some(param), value);
    tree.substitute(entry, fresh)
}

fn declared_type(tree: &Tree, def: NodeId, param: &str) -> Result<NodeType> {
    tree.find_child(def, "type")
        .and_then(|typ| tree[typ].string().ok())
        .and_then(|name| name.parse().ok())
        .ok_or_else(|| {
            ConfError::invalid_definition(format!(
                "Parameter {} definition is missing a valid type info",
                param
            ))
        })
}

fn convert(param: &str, text: &[u8], ty: NodeType) -> Result<Value> {
    let numeric = std::str::from_utf8(text).ok();
    match ty {
        NodeType::Integer => numeric
            .and_then(parse_integer)
            .map(Value::Integer)
            .ok_or_else(|| ConfError::invalid_argument(param, "must be an integer")),
        NodeType::Real => numeric
            .and_then(parse_real)
            .map(Value::Real)
            .ok_or_else(|| ConfError::invalid_argument(param, "must be a real")),
        NodeType::String => Ok(Value::String(text.to_vec())),
        NodeType::Compound => Err(ConfError::invalid_definition(format!(
            "Parameter {} definition is missing a valid type info",
            param
        ))),
    }
}

/// Store one list-form argument under the parameter it names.
fn bind(
    tree: &mut Tree,
    subs: NodeId,
    defs: NodeId,
    name: Option<String>,
    position: usize,
    value: &[u8],
) -> Result<()> {
    let var = name.clone().unwrap_or_else(|| position.to_string());
    let def = match search_alias(tree, defs, None, &var) {
        Ok(def) => def,
        Err(err) if err.is_not_found() => {
            let positional = name.is_none().then(|| nth_parameter(tree, defs, position)).flatten();
            positional.ok_or(ConfError::UnknownParameter { param: var.clone() })?
        }
        Err(err) => return Err(err),
    };
    if tree[def].node_type() != NodeType::Compound {
        return Err(ConfError::invalid_definition(format!(
            "Parameter {} definition is not correct",
            var
        )));
    }
    let param = tree[def].display_id();
    let id = tree[def].id_bytes().unwrap_or_default().to_vec();
    let ty = declared_type(tree, def, &param)?;
    let value = convert(&param, value, ty)?;
    if let Some(old) = tree.find_child(subs, &id) {
        tree.delete(old);
    }
    let node = tree.make_raw(Some(&id), value);
    tree.add(subs, node).inspect_err(|_| tree.delete(node))
}

fn nth_parameter(tree: &Tree, defs: NodeId, position: usize) -> Option<NodeId> {
    tree[defs]
        .children()
        .iter()
        .copied()
        .filter(|&child| tree[child].node_type() == NodeType::Compound)
        .nth(position)
}

// ── Argument scanner ────────────────────────────────────────────────

struct ArgCursor<'s> {
    src: &'s str,
    text: &'s [u8],
    pos: usize,
}

impl<'s> ArgCursor<'s> {
    fn new(src: &'s str) -> Self {
        ArgCursor {
            src,
            text: src.as_bytes(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.text.get(self.pos).copied()
    }

    fn skip_blank(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\x0c' | b'\t' | b'\n' | b'\r')) {
            self.pos += 1;
        }
    }

    /// Text up to the next `,`, `=`, line break or end. Spaces do not stop it.
    fn parse_id(&mut self, position: usize) -> Result<&'s str> {
        if self.peek().is_none() {
            return Err(ConfError::invalid_argument(position.to_string(), "is missing"));
        }
        let start = self.pos;
        while !matches!(self.peek(), None | Some(b'\x0c' | b'\t' | b'\n' | b'\r' | b',' | b'=')) {
            self.pos += 1;
        }
        // Stops only on ASCII bytes, so both ends are char boundaries.
        Ok(self.src[start..self.pos].trim_matches(is_blank))
    }

    /// A `'...'` or `"..."` string with backslash escapes.
    fn parse_quoted(&mut self, position: usize) -> Result<Vec<u8>> {
        let delim = self.text[self.pos];
        self.pos += 1;
        let start = self.pos;
        loop {
            match self.peek() {
                None => {
                    return Err(ConfError::invalid_argument(
                        position.to_string(),
                        "has an unterminated string",
                    ))
                }
                Some(b'\\') => self.pos += 2,
                Some(ch) if ch == delim => break,
                Some(_) => self.pos += 1,
            }
        }
        let raw = &self.text[start..self.pos.min(self.text.len())];
        self.pos += 1;
        Ok(unescape(raw))
    }

    fn at_quote(&self) -> bool {
        matches!(self.peek(), Some(b'\'' | b'"'))
    }

    /// `name=value` or a bare `value`.
    fn parse_arg(&mut self, position: usize) -> Result<(Option<String>, Vec<u8>)> {
        self.skip_blank();
        if self.at_quote() {
            return Ok((None, self.parse_quoted(position)?));
        }
        let first = self.parse_id(position)?;
        self.skip_blank();
        if self.peek() != Some(b'=') {
            return Ok((None, first.as_bytes().to_vec()));
        }
        self.pos += 1;
        self.skip_blank();
        let value = if self.at_quote() {
            self.parse_quoted(position)?
        } else {
            self.parse_id(position)?.as_bytes().to_vec()
        };
        Ok((Some(first.to_owned()), value))
    }
}
