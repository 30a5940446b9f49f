use std::any::Any;
use std::fs::{self, File};
use std::time::{Duration, SystemTime};

use crate::error::{ConfError, Result, SyntaxErrorKind};
use crate::eval::Evaluator;
use crate::funcs::{FuncTable, SymbolTable};
use crate::json::{to_json, to_json_pretty};
use crate::lexer::TOPLEVEL_NAME;
use crate::parser::{load_file, load_str};
use crate::save::save_string;
use crate::search::{search, search_alias, searchv};
use crate::tree::{parse_integer, NodeId, NodeType, Tree, Value};
use crate::update::{expand_word, Config, UpdateSettings, UpdateStatus};
use crate::walk::{copy, walk, Visit, Walker};

// ── Shared fixture runners ──────────────────────────────────────────

const PARSE_FIXTURES: &str = include_str!("../test-data/fixtures/parse.json");
const PARSE_ERROR_FIXTURES: &str = include_str!("../test-data/fixtures/parse-errors.json");

fn parsed(text: &str) -> (Tree, NodeId) {
    crate::parse(text).unwrap()
}

fn json_value(tree: &Tree, node: NodeId) -> serde_json::Value {
    serde_json::from_str(&to_json(tree, node)).unwrap()
}

#[test]
fn test_parse_fixtures() {
    let fixtures: Vec<serde_json::Value> = serde_json::from_str(PARSE_FIXTURES).unwrap();
    for fixture in &fixtures {
        let name = fixture["name"].as_str().unwrap();
        let input = fixture["input"].as_str().unwrap();

        let result = crate::parse(input);
        assert!(result.is_ok(), "Fixture '{}': parse failed: {:?}", name, result.err());
        let (tree, root) = result.unwrap();
        assert_eq!(
            json_value(&tree, root),
            fixture["expected"],
            "Fixture '{}': unexpected tree",
            name
        );
    }
}

#[test]
fn test_parse_error_fixtures() {
    let fixtures: Vec<serde_json::Value> = serde_json::from_str(PARSE_ERROR_FIXTURES).unwrap();
    for fixture in &fixtures {
        let name = fixture["name"].as_str().unwrap();
        let input = fixture["input"].as_str().unwrap();

        match crate::parse(input) {
            Err(ConfError::Syntax {
                file,
                position,
                kind,
            }) => {
                assert_eq!(file, TOPLEVEL_NAME, "Fixture '{}': stream name", name);
                assert_eq!(
                    format!("{:?}", kind),
                    fixture["kind"].as_str().unwrap(),
                    "Fixture '{}': error kind",
                    name
                );
                assert_eq!(
                    position.line as u64,
                    fixture["line"].as_u64().unwrap(),
                    "Fixture '{}': line",
                    name
                );
                assert_eq!(
                    position.column as u64,
                    fixture["column"].as_u64().unwrap(),
                    "Fixture '{}': column",
                    name
                );
            }
            other => panic!("Fixture '{}': expected a syntax error, got {:?}", name, other),
        }
    }
}

// ── Parser ──────────────────────────────────────────────────────────

#[test]
fn test_reassign_with_different_type_fails() {
    let err = crate::parse("a 1 a x").unwrap_err();
    assert!(matches!(
        err,
        ConfError::TypeMismatch {
            expected: NodeType::Integer,
            found: NodeType::String,
            ..
        }
    ));
    assert_eq!(err.errno(), -22);
}

#[test]
fn test_scalar_cannot_become_compound() {
    let err = crate::parse("a 1 a { b 2 }").unwrap_err();
    assert!(matches!(err, ConfError::TypeMismatch { .. }));
}

#[test]
fn test_failed_load_rolls_back() {
    let (mut tree, root) = parsed("a 1 b { c 2 }");
    let before = json_value(&tree, root);
    let live = tree.len();

    let result = load_str(&mut tree, root, "a 5 b.d 3 b.c 4 e {");
    assert!(matches!(
        result,
        Err(ConfError::Syntax {
            kind: SyntaxErrorKind::UnexpectedEof,
            ..
        })
    ));

    assert_eq!(json_value(&tree, root), before);
    assert_eq!(tree.len(), live);
    let b = search(&tree, root, "b").unwrap();
    assert!(!tree[b].is_join());
}

#[test]
fn test_load_into_scalar_root_fails() {
    let mut tree = Tree::new();
    let scalar = tree.make(Some("s"), Value::Integer(1));
    assert!(matches!(
        load_str(&mut tree, scalar, "a 1"),
        Err(ConfError::TypeMismatch { .. })
    ));
}

#[test]
fn test_join_flags() {
    let (tree, root) = parsed("a.b.c 1 x { y 1 } n [ 1 ]");
    let a = search(&tree, root, "a").unwrap();
    let b = search(&tree, root, "a.b").unwrap();
    assert!(tree[a].is_join());
    assert!(tree[b].is_join());
    assert!(!tree[search(&tree, root, "x").unwrap()].is_join());
    assert!(!tree[search(&tree, root, "n").unwrap()].is_join());
}

#[test]
fn test_syntax_error_display() {
    let err = crate::parse("a \"abc").unwrap_err();
    assert_eq!(err.to_string(), "_toplevel_:1:6: Unterminated string");
    assert_eq!(err.errno(), -22);
}

#[test]
fn test_include_file() {
    let dir = tempfile::tempdir().unwrap();
    let included = dir.path().join("inc.conf");
    fs::write(&included, "inc 1\n").unwrap();

    let text = format!("<{}>\nafter 2", included.display());
    let (tree, root) = parsed(&text);
    assert_eq!(
        json_value(&tree, root),
        serde_json::json!({ "inc": 1, "after": 2 })
    );
}

#[test]
fn test_include_error_names_included_file() {
    let dir = tempfile::tempdir().unwrap();
    let included = dir.path().join("bad.conf");
    fs::write(&included, "x = }").unwrap();

    let text = format!("ok 1\n<{}>", included.display());
    match crate::parse(&text) {
        Err(ConfError::Syntax {
            file,
            position,
            kind,
        }) => {
            assert_eq!(file, included.display().to_string());
            assert_eq!(position.line, 1);
            assert_eq!(position.column, 5);
            assert_eq!(kind, SyntaxErrorKind::UnexpectedChar);
        }
        other => panic!("expected a syntax error, got {:?}", other),
    }
}

#[test]
fn test_missing_include_is_io_error() {
    let err = crate::parse("</nonexistent/sndconf/missing.conf>").unwrap_err();
    assert!(matches!(err, ConfError::Io { .. }));
    assert_eq!(err.errno(), -2);
}

#[test]
fn test_load_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("main.conf");
    fs::write(&path, "pcm.default { type hw card 0 }\n").unwrap();

    let mut tree = Tree::new();
    let root = tree.top();
    load_file(&mut tree, root, &path).unwrap();
    let card = search(&tree, root, "pcm.default.card").unwrap();
    assert_eq!(tree[card].integer().unwrap(), 0);

    let missing = load_file(&mut tree, root, dir.path().join("none.conf"));
    assert!(matches!(missing, Err(ConfError::Io { .. })));
}

// ── Tree ────────────────────────────────────────────────────────────

#[test]
fn test_add_duplicate_id_fails() {
    let mut tree = Tree::new();
    let root = tree.top();
    let first = tree.make(Some("a"), Value::Integer(1));
    tree.add(root, first).unwrap();
    let second = tree.make(Some("a"), Value::Integer(2));
    let err = tree.add(root, second).unwrap_err();
    assert!(matches!(err, ConfError::Duplicate { .. }));
    assert_eq!(err.errno(), -17);
    assert_eq!(tree[root].children().len(), 1);
}

#[test]
fn test_add_to_scalar_fails() {
    let mut tree = Tree::new();
    let scalar = tree.make(Some("s"), Value::String("x".into()));
    let child = tree.make(Some("c"), Value::Integer(1));
    assert!(matches!(
        tree.add(scalar, child),
        Err(ConfError::TypeMismatch { .. })
    ));
}

#[test]
fn test_delete_invalidates_handles() {
    let (mut tree, root) = parsed("a { b 1 c 2 }");
    let a = search(&tree, root, "a").unwrap();
    let b = search(&tree, root, "a.b").unwrap();
    tree.delete(a);

    assert!(!tree.contains(a));
    assert!(!tree.contains(b));
    assert!(tree.get(b).is_none());
    assert!(tree[root].children().is_empty());
    assert_eq!(tree.len(), 1);

    let reused = tree.make(Some("fresh"), Value::Integer(0));
    assert!(tree.contains(reused));
    assert!(!tree.contains(a));
    assert!(!tree.contains(b));
    tree.delete(a);
    assert!(tree.contains(reused));
}

#[test]
fn test_set_id_checks_siblings() {
    let (mut tree, root) = parsed("a 1 b 2");
    let b = search(&tree, root, "b").unwrap();
    assert!(matches!(
        tree.set_id(b, Some("a")),
        Err(ConfError::Duplicate { .. })
    ));
    tree.set_id(b, Some("c")).unwrap();
    assert_eq!(tree[b].id(), Some("c"));
}

#[test]
fn test_typed_accessors() {
    let (mut tree, root) = parsed("i 5 r 2.5 s text c {}");
    let i = search(&tree, root, "i").unwrap();
    let r = search(&tree, root, "r").unwrap();
    let s = search(&tree, root, "s").unwrap();
    let c = search(&tree, root, "c").unwrap();

    assert_eq!(tree[i].integer().unwrap(), 5);
    assert_eq!(tree[r].real().unwrap(), 2.5);
    assert_eq!(tree[s].string().unwrap(), "text");
    assert!(matches!(tree[s].integer(), Err(ConfError::TypeMismatch { .. })));
    assert_eq!(tree[s].bytes().unwrap(), b"text");
    assert_eq!(tree[r].ascii().unwrap(), b"2.5");
    assert_eq!(tree[i].ascii().unwrap(), b"5");
    assert!(tree[c].ascii().is_err());

    tree.set_integer(i, 7).unwrap();
    assert_eq!(tree[i].integer().unwrap(), 7);
    assert!(tree.set_string(i, "x").is_err());
    tree.set_ascii(r, "0.25").unwrap();
    assert_eq!(tree[r].real().unwrap(), 0.25);
    assert!(tree.set_ascii(i, "nope").is_err());
}

#[test]
fn test_substitute_keeps_handle_and_place() {
    let (mut tree, root) = parsed("a 1 b { x 1 } c 3");
    let b = search(&tree, root, "b").unwrap();
    let replacement = tree.make(Some("b"), Value::String("done".into()));
    tree.substitute(b, replacement).unwrap();

    assert!(!tree.contains(replacement));
    assert_eq!(tree[b].string().unwrap(), "done");
    assert_eq!(tree[root].children()[1], b);
    assert_eq!(tree.len(), 4);
}

#[test]
fn test_parse_integer_rules() {
    assert_eq!(parse_integer("0x1F"), Some(31));
    assert_eq!(parse_integer("-010"), Some(-8));
    assert_eq!(parse_integer("0"), Some(0));
    assert_eq!(parse_integer("-9223372036854775808"), Some(i64::MIN));
    assert_eq!(parse_integer("9223372036854775808"), None);
    assert_eq!(parse_integer(""), None);
    assert_eq!(parse_integer("12a"), None);
    assert_eq!(parse_integer("08"), None);
}

#[test]
fn test_node_type_names() {
    assert_eq!("integer".parse::<NodeType>().unwrap(), NodeType::Integer);
    assert_eq!("compound".parse::<NodeType>().unwrap(), NodeType::Compound);
    assert!("float".parse::<NodeType>().is_err());
    assert_eq!(NodeType::Real.to_string(), "real");
}

// ── Save ────────────────────────────────────────────────────────────

#[test]
fn test_save_flattens_joins() {
    let (tree, root) = parsed("a.b.c 1");
    assert_eq!(save_string(&tree, root), "a.b.c 1\n");
}

#[test]
fn test_save_nested_compound() {
    let (tree, root) = parsed("x { y 1 z 'two words' }");
    assert_eq!(save_string(&tree, root), "x {\n\ty 1\n\tz 'two words'\n}\n");
}

#[test]
fn test_save_array_and_join_inside_compound() {
    let (tree, root) = parsed("a [1 2] pcm.hw { type hw }");
    assert_eq!(
        save_string(&tree, root),
        "a {\n\t0 1\n\t1 2\n}\npcm.hw {\n\ttype hw\n}\n"
    );
}

#[test]
fn test_save_scalar_prints_value() {
    let (tree, root) = parsed("r 2.0 s word");
    assert_eq!(save_string(&tree, search(&tree, root, "r").unwrap()), "2.0");
    assert_eq!(save_string(&tree, search(&tree, root, "s").unwrap()), "word");
}

#[test]
fn test_save_quoting_and_escapes() {
    let mut tree = Tree::new();
    let cases = [
        ("", "''"),
        ("hw", "hw"),
        ("0x", "'0x'"),
        ("-flag", "'-flag'"),
        ("a b", "'a b'"),
        ("x#y", "'x#y'"),
        ("[x]", "'[x]'"),
        ("<inc>", "'<inc>'"),
        ("it's", "'it\\'s'"),
        ("a\\b", "'a\\\\b'"),
        ("line\nbreak", "'line\\nbreak'"),
        ("\x01", "'\\001'"),
    ];
    for (text, expected) in cases {
        let node = tree.make(Some("v"), Value::String(text.into()));
        assert_eq!(save_string(&tree, node), expected, "saving {:?}", text);
    }
}

#[test]
fn test_save_quotes_identifiers() {
    let mut tree = Tree::new();
    let root = tree.top();
    let dotted = tree.make(Some("a.b"), Value::Integer(1));
    tree.add(root, dotted).unwrap();
    let numeric = tree.make(Some("0"), Value::Integer(2));
    tree.add(root, numeric).unwrap();
    assert_eq!(save_string(&tree, root), "'a.b' 1\n0 2\n");
}

#[test]
fn test_save_round_trip() {
    let text = "pcm.hw { type hw card 0 device 'dev 1' rate 48000.5 names [ a b ] }\n\
                ctl.x { @args [ CARD ] @args.CARD { type string } card $(CARD) }\n\
                notes { escaped \"line\\nbreak\" include '<x>' empty '' quote \"it's\" }\n\
                ratio -0.5";
    let (tree, root) = parsed(text);
    let saved = save_string(&tree, root);
    let (reparsed, reroot) = parsed(&saved);
    assert!(
        tree.structurally_eq(root, &reparsed, reroot),
        "round trip changed the tree:\n{}",
        saved
    );
}

#[test]
fn test_non_utf8_bytes_survive_load_and_save() {
    let (tree, root) = parsed("s '\\351t\\377'\n'\\351d' 1");
    let s = search(&tree, root, "s").unwrap();
    assert_eq!(tree[s].bytes().unwrap(), b"\xe9t\xff");
    assert!(matches!(tree[s].string(), Err(ConfError::NotUtf8 { .. })));

    let odd = tree.find_child(root, b"\xe9d").unwrap();
    assert_eq!(tree[odd].id(), None);
    assert_eq!(tree[odd].id_bytes(), Some(&b"\xe9d"[..]));

    let saved = save_string(&tree, root);
    assert_eq!(saved, "s '\\351t\\377'\n'\\351d' 1\n");
    let (reparsed, reroot) = parsed(&saved);
    assert!(tree.structurally_eq(root, &reparsed, reroot));
}

// ── JSON ────────────────────────────────────────────────────────────

#[test]
fn test_json_output() {
    let (tree, root) = parsed("a 1 b { c 'x' } r 1.5");
    assert_eq!(to_json(&tree, root), r#"{"a":1,"b":{"c":"x"},"r":1.5}"#);

    let (empty, empty_root) = parsed("");
    assert_eq!(to_json(&empty, empty_root), "{}");
    assert_eq!(to_json_pretty(&empty, empty_root), "{}");

    let pretty: serde_json::Value = serde_json::from_str(&to_json_pretty(&tree, root)).unwrap();
    assert_eq!(pretty, json_value(&tree, root));
}

#[test]
fn test_json_escapes_strings() {
    let (tree, root) = parsed("s \"quote\\\"d\\ttab\"");
    assert_eq!(json_value(&tree, root), serde_json::json!({ "s": "quote\"d\ttab" }));
}

// ── Search ──────────────────────────────────────────────────────────

#[test]
fn test_search_paths() {
    let (tree, root) = parsed("pcm.hw { card 0 } scalar 1");
    let card = search(&tree, root, "pcm.hw.card").unwrap();
    assert_eq!(tree[card].integer().unwrap(), 0);
    assert_eq!(searchv(&tree, root, &["pcm", "hw.card"]).unwrap(), card);

    let err = search(&tree, root, "pcm.missing").unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(err.errno(), -2);
    assert!(search(&tree, root, "scalar.below").unwrap_err().is_not_found());
}

#[test]
fn test_alias_chain_resolves() {
    let (tree, root) = parsed("x \"y\"; y \"z\"; z 42");
    let found = search_alias(&tree, root, None, "x").unwrap();
    assert_eq!(tree[found].integer().unwrap(), 42);
}

#[test]
fn test_alias_cycle_is_detected() {
    let (tree, root) = parsed("x \"y\"; y \"x\"");
    let err = search_alias(&tree, root, None, "x").unwrap_err();
    assert!(matches!(err, ConfError::CyclicAlias { .. }));
    assert_eq!(err.errno(), -40);
}

#[test]
fn test_alias_self_reference_is_a_cycle() {
    let (tree, root) = parsed("x x");
    assert!(matches!(
        search_alias(&tree, root, None, "x"),
        Err(ConfError::CyclicAlias { .. })
    ));
}

#[test]
fn test_alias_to_unknown_key_returns_string() {
    let (tree, root) = parsed("x nowhere");
    let found = search_alias(&tree, root, None, "x").unwrap();
    assert_eq!(tree[found].string().unwrap(), "nowhere");
}

#[test]
fn test_alias_base_fallback() {
    let (tree, root) = parsed("pcm { hw { type hw } default hw }");
    let hw = search(&tree, root, "pcm.hw").unwrap();
    assert_eq!(search_alias(&tree, root, Some("pcm"), "hw").unwrap(), hw);
    assert_eq!(search_alias(&tree, root, Some("pcm"), "default").unwrap(), hw);
    assert!(search_alias(&tree, root, Some("pcm"), "missing")
        .unwrap_err()
        .is_not_found());
}

// ── Walk and copy ───────────────────────────────────────────────────

#[test]
fn test_copy_is_deep_and_detached() {
    let (mut tree, root) = parsed("d { a 1 b.c text }");
    let d = search(&tree, root, "d").unwrap();
    let copied = copy(&mut tree, d).unwrap();

    assert_ne!(copied, d);
    assert!(tree[copied].parent().is_none());
    assert!(tree.structurally_eq(d, &tree, copied));

    let inner = search(&tree, copied, "b.c").unwrap();
    tree.set_string(inner, "changed").unwrap();
    let original = search(&tree, root, "d.b.c").unwrap();
    assert_eq!(tree[original].string().unwrap(), "text");
}

/// Copies everything except leaves named `secret`; fails on leaves named `bad`.
struct Redact;

impl Walker for Redact {
    fn pre(&mut self, tree: &mut Tree, src: NodeId, dst: &mut Option<NodeId>) -> Result<Visit> {
        let id = tree[src].id().map(str::to_owned);
        *dst = Some(tree.make_compound(id.as_deref(), false));
        Ok(Visit::Continue)
    }

    fn leaf(&mut self, tree: &mut Tree, src: NodeId, dst: &mut Option<NodeId>) -> Result<Visit> {
        match tree[src].id() {
            Some("secret") => Ok(Visit::Skip),
            Some("bad") => Err(ConfError::External("bad leaf".into())),
            _ => {
                let id = tree[src].id().map(str::to_owned);
                let value = tree[src].value().shallow_copy();
                *dst = Some(tree.make(id.as_deref(), value));
                Ok(Visit::Continue)
            }
        }
    }
}

#[test]
fn test_walk_skip_drops_leaf() {
    let (mut tree, root) = parsed("keep 1 nested { secret 2 shown 3 }");
    let redacted = walk(&mut tree, root, &mut Redact).unwrap().unwrap();
    assert_eq!(
        json_value(&tree, redacted),
        serde_json::json!({ "keep": 1, "nested": { "shown": 3 } })
    );
}

#[test]
fn test_walk_error_deletes_partial_result() {
    let (mut tree, root) = parsed("a 1 b { c 2 bad 3 }");
    let live = tree.len();
    let err = walk(&mut tree, root, &mut Redact).unwrap_err();
    assert!(matches!(err, ConfError::External(_)));
    assert_eq!(tree.len(), live);
}

// ── Expansion and arguments ─────────────────────────────────────────

const COUNT_DEFINITION: &str = "
d {
    @args [ count ]
    @args.count { type integer default 1 }
    value $(count)
    fixed yes
}
";

fn expanded_value(name: &str) -> Result<i64> {
    let (mut tree, root) = parsed(COUNT_DEFINITION);
    let funcs = FuncTable::with_builtins();
    let result = Evaluator::new(&funcs).search_definition(&mut tree, root, None, name)?;
    assert!(tree.find_child(result, "@args").is_none());
    assert_eq!(tree[search(&tree, result, "fixed").unwrap()].string().unwrap(), "yes");
    tree[search(&tree, result, "value")?].integer()
}

#[test]
fn test_expand_argument_forms() {
    assert_eq!(expanded_value("d").unwrap(), 1);
    assert_eq!(expanded_value("d:5").unwrap(), 5);
    assert_eq!(expanded_value("d:count=5").unwrap(), 5);
    assert_eq!(expanded_value("d: count = 6 ").unwrap(), 6);
    assert_eq!(expanded_value("d:{ count 7 }").unwrap(), 7);
    assert_eq!(expanded_value("d:0x10").unwrap(), 16);
}

#[test]
fn test_expand_rejects_bad_arguments() {
    match expanded_value("d:bogus") {
        Err(ConfError::InvalidArgument { param, message }) => {
            assert_eq!(param, "count");
            assert_eq!(message, "must be an integer");
        }
        other => panic!("expected an invalid argument, got {:?}", other),
    }
    assert!(matches!(
        expanded_value("d:nope=1"),
        Err(ConfError::UnknownParameter { .. })
    ));
    assert!(matches!(
        expanded_value("d:{ other 1 }"),
        Err(ConfError::UnknownParameter { .. })
    ));
    assert!(matches!(
        expanded_value("d:{ count 7"),
        Err(ConfError::InvalidArgument { .. })
    ));
    assert!(matches!(
        expanded_value("d:5 6"),
        Err(ConfError::InvalidArgument { .. })
    ));
}

#[test]
fn test_expand_leaves_source_untouched() {
    let (mut tree, root) = parsed(COUNT_DEFINITION);
    let (pristine, pristine_root) = parsed(COUNT_DEFINITION);
    let live = tree.len();
    let funcs = FuncTable::with_builtins();

    let result = Evaluator::new(&funcs)
        .search_definition(&mut tree, root, None, "d:3")
        .unwrap();
    assert!(tree[result].parent().is_none());
    tree.delete(result);

    assert_eq!(tree.len(), live);
    assert!(tree.structurally_eq(root, &pristine, pristine_root));

    let failed = Evaluator::new(&funcs).search_definition(&mut tree, root, None, "d:bogus");
    assert!(failed.is_err());
    assert_eq!(tree.len(), live);
}

#[test]
fn test_expand_is_repeatable() {
    let (mut tree, root) = parsed(COUNT_DEFINITION);
    let funcs = FuncTable::with_builtins();
    let mut evaluator = Evaluator::new(&funcs);

    let first = evaluator.search_definition(&mut tree, root, None, "d:3").unwrap();
    let second = evaluator.search_definition(&mut tree, root, None, "d:3").unwrap();
    assert_ne!(first, second);
    assert!(tree.structurally_eq(first, &tree, second));
    assert_eq!(tree[search(&tree, second, "value").unwrap()].integer().unwrap(), 3);
}

#[test]
fn test_expand_without_args_is_plain_copy() {
    let (mut tree, root) = parsed("d { a 1 b $(x) }");
    let d = search(&tree, root, "d").unwrap();
    let funcs = FuncTable::with_builtins();
    let result = Evaluator::new(&funcs).expand(&mut tree, d, root, None).unwrap();
    assert_ne!(result, d);
    assert!(tree.structurally_eq(d, &tree, result));
}

const POSITIONAL_DEFINITION: &str = "
e {
    @args.first { type string }
    @args.second { type integer }
    @args.optional { type string }
    out.a $(first)
    out.b $(second)
    out.c $(optional)
}
";

#[test]
fn test_expand_positional_and_quoted_arguments() {
    let (mut tree, root) = parsed(POSITIONAL_DEFINITION);
    let funcs = FuncTable::with_builtins();
    let mut evaluator = Evaluator::new(&funcs);

    let result = evaluator
        .search_definition(&mut tree, root, None, "e:x,2")
        .unwrap();
    assert_eq!(tree[search(&tree, result, "out.a").unwrap()].string().unwrap(), "x");
    assert_eq!(tree[search(&tree, result, "out.b").unwrap()].integer().unwrap(), 2);
    assert!(search(&tree, result, "out.c").unwrap_err().is_not_found());

    let quoted = evaluator
        .search_definition(&mut tree, root, None, "e:'a,b',3,second=4")
        .unwrap();
    assert_eq!(tree[search(&tree, quoted, "out.a").unwrap()].string().unwrap(), "a,b");
    assert_eq!(tree[search(&tree, quoted, "out.b").unwrap()].integer().unwrap(), 4);

    let escaped = evaluator
        .search_definition(&mut tree, root, None, "e:'\\351t',1")
        .unwrap();
    assert_eq!(tree[search(&tree, escaped, "out.a").unwrap()].bytes().unwrap(), b"\xe9t");
}

#[test]
fn test_expand_through_base_and_alias() {
    let text = format!("pcm {{ {} default \"e\" }}", POSITIONAL_DEFINITION);
    let (mut tree, root) = parsed(&text);
    let funcs = FuncTable::with_builtins();
    let result = Evaluator::new(&funcs)
        .search_definition(&mut tree, root, Some("pcm"), "default:first=z")
        .unwrap();
    assert_eq!(tree[search(&tree, result, "out.a").unwrap()].string().unwrap(), "z");
}

#[test]
fn test_parameter_definitions_are_checked() {
    let funcs = FuncTable::with_builtins();

    let (mut tree, root) = parsed("f { @args.p { default 1 } v $(p) }");
    let err = Evaluator::new(&funcs)
        .search_definition(&mut tree, root, None, "f:p=2")
        .unwrap_err();
    assert!(matches!(err, ConfError::InvalidDefinition { .. }));

    let (mut tree, root) = parsed("g { @args.p { type integer bogus 1 } v $(p) }");
    let err = Evaluator::new(&funcs)
        .search_definition(&mut tree, root, None, "g")
        .unwrap_err();
    assert_eq!(err.to_string(), "Unknown field bogus");
}

// ── Evaluation ──────────────────────────────────────────────────────

fn snd_func_answer(
    tree: &mut Tree,
    _root: NodeId,
    src: NodeId,
    _private: Option<&mut (dyn Any + 'static)>,
) -> Result<Option<NodeId>> {
    let id = tree[src].id().map(str::to_owned);
    Ok(Some(tree.make(id.as_deref(), Value::Integer(42))))
}

fn snd_func_fail(
    _tree: &mut Tree,
    _root: NodeId,
    _src: NodeId,
    _private: Option<&mut (dyn Any + 'static)>,
) -> Result<Option<NodeId>> {
    Err(ConfError::External("boom".into()))
}

fn snd_func_count(
    _tree: &mut Tree,
    _root: NodeId,
    _src: NodeId,
    private: Option<&mut (dyn Any + 'static)>,
) -> Result<Option<NodeId>> {
    if let Some(counter) = private.and_then(|p| p.downcast_mut::<u32>()) {
        *counter += 1;
    }
    Ok(None)
}

fn test_funcs() -> FuncTable {
    let mut funcs = FuncTable::with_builtins();
    funcs.register(None, "snd_func_answer", snd_func_answer);
    funcs.register(None, "snd_func_fail", snd_func_fail);
    funcs.register(None, "snd_func_count", snd_func_count);
    funcs
}

#[test]
fn test_evaluate_replaces_func_compounds() {
    let (mut tree, root) = parsed("x { v { @func answer } w 1 }");
    let funcs = test_funcs();
    let v = search(&tree, root, "x.v").unwrap();
    Evaluator::new(&funcs).evaluate(&mut tree, root, root).unwrap();

    assert_eq!(search(&tree, root, "x.v").unwrap(), v);
    assert_eq!(tree[v].integer().unwrap(), 42);
    assert_eq!(
        json_value(&tree, root),
        serde_json::json!({ "x": { "v": 42, "w": 1 } })
    );
}

#[test]
fn test_search_definition_evaluates_result() {
    let (mut tree, root) = parsed("x { v { @func answer } }");
    let funcs = test_funcs();
    let result = Evaluator::new(&funcs)
        .search_definition(&mut tree, root, None, "x")
        .unwrap();
    assert_eq!(tree[search(&tree, result, "v").unwrap()].integer().unwrap(), 42);
    let original = search(&tree, root, "x.v").unwrap();
    assert_eq!(tree[original].node_type(), NodeType::Compound);
}

#[test]
fn test_func_definition_overrides_symbol() {
    let (mut tree, root) =
        parsed("func.f { open snd_func_answer comment 'x' extra 1 } y { @func f }");
    let funcs = test_funcs();
    Evaluator::new(&funcs).evaluate(&mut tree, root, root).unwrap();
    assert_eq!(tree[search(&tree, root, "y").unwrap()].integer().unwrap(), 42);
}

#[test]
fn test_unknown_function_is_symbol_not_found() {
    let (mut tree, root) = parsed("y { @func nosuch }");
    let funcs = test_funcs();
    let err = Evaluator::new(&funcs)
        .evaluate(&mut tree, root, root)
        .unwrap_err();
    assert!(matches!(err, ConfError::SymbolNotFound { .. }));
    assert_eq!(err.errno(), -6);
}

#[test]
fn test_unknown_library_is_library_not_found() {
    let (mut tree, root) = parsed("func.f { lib 'libnope.so' } y { @func f }");
    let funcs = test_funcs();
    let err = Evaluator::new(&funcs)
        .evaluate(&mut tree, root, root)
        .unwrap_err();
    assert!(matches!(err, ConfError::LibraryNotFound { .. }));
    assert_eq!(err.errno(), -2);
}

#[test]
fn test_func_name_must_be_string() {
    let (mut tree, root) = parsed("y { @func 5 }");
    let funcs = test_funcs();
    assert!(matches!(
        Evaluator::new(&funcs).evaluate(&mut tree, root, root),
        Err(ConfError::TypeMismatch { .. })
    ));
}

#[test]
fn test_function_errors_are_wrapped() {
    let (mut tree, root) = parsed("y { @func fail }");
    let funcs = test_funcs();
    match Evaluator::new(&funcs).evaluate(&mut tree, root, root) {
        Err(ConfError::Function { func, source }) => {
            assert_eq!(func, "snd_func_fail");
            assert!(matches!(*source, ConfError::External(_)));
        }
        other => panic!("expected a function error, got {:?}", other),
    }
}

#[test]
fn test_private_context_reaches_functions() {
    let (mut tree, root) = parsed("a { @func count } b { @func count }");
    let funcs = test_funcs();
    let mut counter: u32 = 0;
    Evaluator::with_private(&funcs, &mut counter)
        .evaluate(&mut tree, root, root)
        .unwrap();
    assert_eq!(counter, 2);
    assert!(search(&tree, root, "a.@func").is_ok());
}

#[test]
fn test_registered_and_loaded_libraries() {
    let mut funcs = FuncTable::new();
    funcs.register(Some("libextra.so"), "snd_func_answer", snd_func_answer);
    assert!(funcs.resolve(Some("libextra.so"), "snd_func_answer").is_ok());
    assert!(matches!(
        funcs.resolve(Some("libextra.so"), "other"),
        Err(ConfError::SymbolNotFound { .. })
    ));
    assert!(matches!(
        funcs.resolve(None, "snd_func_answer"),
        Err(ConfError::SymbolNotFound { .. })
    ));
    assert_eq!(funcs.builtin_lib(), "libasound.so.2");

    let loaded = unsafe { funcs.load_library("libsndconf-definitely-missing.so") };
    assert!(matches!(loaded, Err(ConfError::LibraryNotFound { .. })));
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
#[test]
fn test_loaded_library_symbols_resolve() {
    type GetPid = unsafe extern "C" fn() -> i32;
    let mut table: SymbolTable<GetPid> = SymbolTable::new();
    unsafe { table.load_library("libc.so.6") }.unwrap();
    // Loading twice is a no-op.
    unsafe { table.load_library("libc.so.6") }.unwrap();

    let getpid = table.resolve(Some("libc.so.6"), "getpid").unwrap();
    assert_eq!(unsafe { getpid() } as u32, std::process::id());
    assert!(matches!(
        table.resolve(Some("libc.so.6"), "sndconf_no_such_symbol"),
        Err(ConfError::SymbolNotFound { .. })
    ));
}

// ── Built-in functions ──────────────────────────────────────────────

#[test]
fn test_builtin_getenv() {
    std::env::set_var("SNDCONF_TEST_GETENV", "from env");
    std::env::set_var("SNDCONF_TEST_GETENV_EMPTY", "");
    let (mut tree, root) = parsed(
        "set { @func getenv vars [ SNDCONF_TEST_GETENV_EMPTY SNDCONF_TEST_GETENV ] default fallback }\n\
         unset { @func getenv vars [ SNDCONF_TEST_GETENV_UNSET ] default fallback }\n\
         number { @func igetenv vars [ SNDCONF_TEST_GETENV_UNSET ] default 12 }",
    );
    let funcs = FuncTable::with_builtins();
    Evaluator::new(&funcs).evaluate(&mut tree, root, root).unwrap();
    assert_eq!(
        json_value(&tree, root),
        serde_json::json!({ "set": "from env", "unset": "fallback", "number": 12 })
    );
}

#[test]
fn test_builtin_igetenv_requires_integer() {
    std::env::set_var("SNDCONF_TEST_IGETENV", "twelve");
    let (mut tree, root) =
        parsed("n { @func igetenv vars [ SNDCONF_TEST_IGETENV ] default 0 }");
    let funcs = FuncTable::with_builtins();
    let err = Evaluator::new(&funcs)
        .evaluate(&mut tree, root, root)
        .unwrap_err();
    assert!(matches!(
        err,
        ConfError::Function { ref source, .. } if matches!(**source, ConfError::InvalidArgument { .. })
    ));
}

#[test]
fn test_builtin_concat_datadir_refer() {
    let (mut tree, root) = parsed(
        "c { @func concat strings [ 'a' 1 'b' ] }\n\
         d { @func datadir }\n\
         target { x 1 }\n\
         r { @func refer name target.x }",
    );
    let funcs = FuncTable::with_builtins();
    Evaluator::new(&funcs).evaluate(&mut tree, root, root).unwrap();
    assert_eq!(
        json_value(&tree, root),
        serde_json::json!({
            "c": "a1b",
            "d": "/usr/share/alsa",
            "target": { "x": 1 },
            "r": 1
        })
    );
}

#[test]
fn test_builtin_missing_field() {
    let (mut tree, root) = parsed("c { @func concat }");
    let funcs = FuncTable::with_builtins();
    let err = Evaluator::new(&funcs)
        .evaluate(&mut tree, root, root)
        .unwrap_err();
    assert!(err.to_string().contains("field strings not found"));
}

#[test]
fn test_arguments_can_come_from_functions() {
    let (mut tree, root) = parsed(
        "d {\n\
             @args [ dir ]\n\
             @args.dir { type string default { @func datadir } }\n\
             path $(dir)\n\
         }",
    );
    let funcs = FuncTable::with_builtins();
    let result = Evaluator::new(&funcs)
        .search_definition(&mut tree, root, None, "d")
        .unwrap();
    assert_eq!(
        tree[search(&tree, result, "path").unwrap()].string().unwrap(),
        "/usr/share/alsa"
    );
}

// ── Bindings ────────────────────────────────────────────────────────

type OpenFn = fn() -> u32;

fn fake_open() -> u32 {
    7
}

fn null_open() -> u32 {
    0
}

const DEVICES: &str = "
pcm.default { type hw card 0 }
pcm.plain { type null }
pcm.bad 5
pcm.odd { type odd }
pcm.ghost { type ghost }
pcm.untyped { card 1 }
pcm_type.hw { lib 'libfake.so' open _fake_open comment 'test' }
pcm_type.odd { lib 'libfake.so' extra 1 }
";

fn handlers() -> SymbolTable<OpenFn> {
    let mut handlers = SymbolTable::new();
    handlers.register(Some("libfake.so"), "_fake_open", fake_open as OpenFn);
    handlers.register(None, "_snd_pcm_null_open", null_open as OpenFn);
    handlers
}

#[test]
fn test_binding_from_type_definition() {
    let (mut tree, root) = parsed(DEVICES);
    let funcs = FuncTable::with_builtins();
    let mut evaluator = Evaluator::new(&funcs);
    let live = tree.len();

    let binding =
        crate::resolve_binding(&mut evaluator, &mut tree, root, "pcm", "default", &handlers())
            .unwrap();
    assert_eq!(binding.type_name, "hw");
    assert_eq!(binding.lib.as_deref(), Some("libfake.so"));
    assert_eq!(binding.symbol, "_fake_open");
    assert_eq!((binding.handler)(), 7);
    let card = search(&tree, binding.definition, "card").unwrap();
    assert_eq!(tree[card].integer().unwrap(), 0);

    binding.release(&mut tree);
    assert_eq!(tree.len(), live);
}

#[test]
fn test_binding_default_symbol() {
    let (mut tree, root) = parsed(DEVICES);
    let funcs = FuncTable::with_builtins();
    let binding = crate::resolve_binding(
        &mut Evaluator::new(&funcs),
        &mut tree,
        root,
        "pcm",
        "plain",
        &handlers(),
    )
    .unwrap();
    assert_eq!(binding.lib, None);
    assert_eq!(binding.symbol, "_snd_pcm_null_open");
    assert_eq!((binding.handler)(), 0);
}

#[test]
fn test_binding_errors_clean_up() {
    let (mut tree, root) = parsed(DEVICES);
    let funcs = FuncTable::with_builtins();
    let live = tree.len();
    let table = handlers();
    let resolve = |tree: &mut Tree, name: &str| {
        crate::resolve_binding(&mut Evaluator::new(&funcs), tree, root, "pcm", name, &table)
            .map(|binding| binding.symbol)
    };

    assert!(matches!(
        resolve(&mut tree, "bad"),
        Err(ConfError::InvalidDefinition { .. })
    ));
    assert!(matches!(
        resolve(&mut tree, "odd"),
        Err(ConfError::InvalidDefinition { .. })
    ));
    assert!(matches!(
        resolve(&mut tree, "ghost"),
        Err(ConfError::SymbolNotFound { .. })
    ));
    assert!(resolve(&mut tree, "untyped").unwrap_err().is_not_found());
    assert!(resolve(&mut tree, "absent").unwrap_err().is_not_found());
    assert_eq!(tree.len(), live);
}

// ── Update ──────────────────────────────────────────────────────────

fn touch_later(path: &std::path::Path) {
    let file = File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(10))
        .unwrap();
}

#[test]
fn test_update_loads_and_caches() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.conf");
    let b = dir.path().join("b.conf");
    fs::write(&a, "a 1\n").unwrap();
    fs::write(&b, "b { c 2 }\n").unwrap();
    let missing = dir.path().join("missing.conf");

    let paths = format!("{}:{} {}", a.display(), missing.display(), b.display());
    let mut config = Config::open(UpdateSettings::with_paths(paths));
    assert!(config.root().is_none());

    assert_eq!(config.update().unwrap(), UpdateStatus::Rebuilt);
    let root = config.root().unwrap();
    assert_eq!(config.files().len(), 2);
    assert_eq!(config.files()[0].path, a);
    assert_eq!(
        json_value(config.tree(), root),
        serde_json::json!({ "a": 1, "b": { "c": 2 } })
    );

    assert_eq!(config.update().unwrap(), UpdateStatus::Unchanged);
    assert_eq!(config.root(), Some(root));
    assert_eq!(config.update().unwrap(), UpdateStatus::Unchanged);
    assert_eq!(config.root(), Some(root));

    touch_later(&a);
    assert_eq!(config.update().unwrap(), UpdateStatus::Rebuilt);
    assert!(config.root().is_some());
}

#[test]
fn test_rebuild_and_close_invalidate_handles() {
    let dir = tempfile::tempdir().unwrap();
    let main = dir.path().join("main.conf");
    fs::write(&main, "d { a 1 }\n").unwrap();

    let mut config = Config::open(UpdateSettings::with_paths(main.display().to_string()));
    assert_eq!(config.update().unwrap(), UpdateStatus::Rebuilt);
    let old_root = config.root().unwrap();
    let old_copy = config.search_definition(None, "d").unwrap();

    fs::write(&main, "d { a 2 }\n").unwrap();
    touch_later(&main);
    assert_eq!(config.update().unwrap(), UpdateStatus::Rebuilt);
    assert!(!config.tree().contains(old_root));
    assert!(!config.tree().contains(old_copy));

    let root = config.root().unwrap();
    let copy = config.search_definition(None, "d").unwrap();
    config.close();
    assert!(!config.tree().contains(root));
    assert!(!config.tree().contains(copy));
    assert!(config.tree().is_empty());
}

#[test]
fn test_update_parse_error_tears_down() {
    let dir = tempfile::tempdir().unwrap();
    let good = dir.path().join("good.conf");
    let bad = dir.path().join("bad.conf");
    fs::write(&good, "a 1\n").unwrap();
    fs::write(&bad, "a {\n").unwrap();

    let mut config = Config::open(UpdateSettings::with_paths(format!(
        "{}:{}",
        good.display(),
        bad.display()
    )));
    assert!(matches!(config.update(), Err(ConfError::Syntax { .. })));
    assert!(config.root().is_none());
    assert!(config.files().is_empty());
    assert!(config.tree().is_empty());

    fs::write(&bad, "b 2\n").unwrap();
    assert_eq!(config.update().unwrap(), UpdateStatus::Rebuilt);
}

#[test]
fn test_update_with_empty_path_list() {
    let mut config = Config::open(UpdateSettings::with_paths("::"));
    assert_eq!(config.update().unwrap(), UpdateStatus::Rebuilt);
    let root = config.root().unwrap();
    assert!(config.tree()[root].children().is_empty());
    assert_eq!(config.update().unwrap(), UpdateStatus::Unchanged);
}

#[test]
fn test_update_preloads_in_index_order() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("first.conf");
    let second = dir.path().join("second.conf");
    let main = dir.path().join("main.conf");
    fs::write(&first, "order first\np 0\n").unwrap();
    fs::write(&second, "order second\nq 2\n").unwrap();
    fs::write(
        &main,
        format!(
            "preload.filenames {{\n\t2 '{}'\n\t0 '{}'\n\t5 '{}'\n}}\n",
            second.display(),
            first.display(),
            dir.path().join("absent.conf").display()
        ),
    )
    .unwrap();

    let mut config = Config::open(UpdateSettings::with_paths(main.display().to_string()));
    assert_eq!(config.update().unwrap(), UpdateStatus::Rebuilt);
    let root = config.root().unwrap();
    let tree = config.tree();
    assert_eq!(tree[search(tree, root, "order").unwrap()].string().unwrap(), "second");
    assert!(search(tree, root, "p").is_ok());
    assert!(search(tree, root, "q").is_ok());

    let preloaded: Vec<_> = config.preloaded_files().iter().map(|f| f.path.clone()).collect();
    assert_eq!(preloaded, vec![first.clone(), second.clone()]);

    assert_eq!(config.update().unwrap(), UpdateStatus::Unchanged);
    touch_later(&second);
    assert_eq!(config.update().unwrap(), UpdateStatus::Rebuilt);
}

#[test]
fn test_update_preload_requires_filenames() {
    let dir = tempfile::tempdir().unwrap();
    let main = dir.path().join("main.conf");
    fs::write(&main, "preload.other 1\n").unwrap();

    let mut config = Config::open(UpdateSettings::with_paths(main.display().to_string()));
    assert!(matches!(
        config.update(),
        Err(ConfError::InvalidDefinition { .. })
    ));
    assert!(config.root().is_none());
}

#[test]
fn test_config_definitions_and_bindings() {
    let dir = tempfile::tempdir().unwrap();
    let main = dir.path().join("main.conf");
    fs::write(&main, DEVICES).unwrap();

    let mut config = Config::open(UpdateSettings::with_paths(main.display().to_string()));
    assert!(config.search_definition(Some("pcm"), "default").unwrap_err().is_not_found());

    config.update().unwrap();
    let definition = config.search_definition(Some("pcm"), "default").unwrap();
    assert_eq!(
        config.tree()[search(config.tree(), definition, "type").unwrap()].string().unwrap(),
        "hw"
    );
    let binding = config.resolve_binding("pcm", "default", &handlers()).unwrap();
    assert_eq!((binding.handler)(), 7);
    binding.release(config.tree_mut());

    config.close();
    assert!(config.root().is_none());
    assert!(config.files().is_empty());
}

#[test]
fn test_expand_word() {
    std::env::set_var("SNDCONF_TEST_DIR", "/opt/sound");
    std::env::set_var("SNDCONF_TEST_TWO", "a b");

    assert_eq!(
        expand_word("$SNDCONF_TEST_DIR/x.conf").unwrap(),
        std::path::PathBuf::from("/opt/sound/x.conf")
    );
    assert_eq!(
        expand_word("${SNDCONF_TEST_DIR}/y.conf").unwrap(),
        std::path::PathBuf::from("/opt/sound/y.conf")
    );
    match std::env::var("HOME") {
        Ok(home) => assert_eq!(
            expand_word("~/.asoundrc").unwrap(),
            std::path::PathBuf::from(format!("{}/.asoundrc", home))
        ),
        Err(_) => assert!(expand_word("~/.asoundrc").is_err()),
    }
    assert_eq!(
        expand_word("/plain/path.conf").unwrap(),
        std::path::PathBuf::from("/plain/path.conf")
    );

    for rejected in [
        "$(ls)",
        "`ls`",
        "a|b",
        "a;b",
        "~someone/x",
        "$SNDCONF_TEST_TWO",
        "$SNDCONF_TEST_UNSET_VAR",
    ] {
        let err = expand_word(rejected).unwrap_err();
        assert!(
            matches!(err, ConfError::PathExpansion { .. }),
            "expanding {:?} gave {:?}",
            rejected,
            err
        );
    }
}
