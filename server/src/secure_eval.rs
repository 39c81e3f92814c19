//! # Secure-Eval Static Policy
//!
//! Server-side layer of the two-layer eval policy: caller-supplied page
//! source is parsed to a syntax tree and scanned for blocked API usage
//! before it is ever dispatched to the extension. The extension's runtime
//! membrane is the second layer; both must approve.
//!
//! The verdict is a plain result variant, not an exception: callers
//! translate [`EvalVerdict::Blocked`] to the wire error themselves.

use tree_sitter::{Node, Parser};

use crate::error::{BridgeError, Result};

/// Globals that must not be reachable from evaluated code.
const BLOCKED_GLOBALS: &[&str] = &[
    // network I/O
    "fetch",
    "XMLHttpRequest",
    "WebSocket",
    "EventSource",
    "sendBeacon",
    // dynamic code
    "eval",
    "Function",
    // storage
    "localStorage",
    "sessionStorage",
    "indexedDB",
    // prototype reflection
    "Reflect",
    "Proxy",
    // workers / script loading
    "Worker",
    "SharedWorker",
    "importScripts",
];

/// Properties blocked on any receiver.
const BLOCKED_PROPS: &[&str] = &[
    "sendBeacon",
    "constructor",
    "__proto__",
    "getPrototypeOf",
    "setPrototypeOf",
    "defineProperty",
];

/// Properties blocked only on a specific receiver.
const BLOCKED_RECEIVER_PROPS: &[(&str, &str)] = &[
    ("window", "open"),
    ("location", "assign"),
    ("location", "replace"),
    ("document", "write"),
    ("document", "writeln"),
    ("document", "cookie"),
];

/// String-indexing count past which the source is considered obfuscated.
const SUBSCRIPT_DENSITY_LIMIT: usize = 12;

/// `String.fromCharCode` call count past which the source is considered
/// obfuscated.
const FROM_CHAR_CODE_LIMIT: usize = 3;

/// Outcome of the static scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalVerdict {
    Allowed,
    Blocked(String),
}

/// Parses `source` as JavaScript and scans the tree for blocked
/// patterns. Unparseable regions are scanned as far as the tree goes;
/// pure syntax errors are the extension layer's concern.
pub fn analyze(source: &str) -> Result<EvalVerdict> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_javascript::LANGUAGE.into())
        .map_err(|e| BridgeError::Io(format!("javascript grammar: {}", e)))?;
    let tree = match parser.parse(source, None) {
        Some(tree) => tree,
        None => return Ok(EvalVerdict::Allowed),
    };

    let bytes = source.as_bytes();
    let mut string_subscripts = 0usize;
    let mut from_char_code = 0usize;

    let mut stack = vec![tree.root_node()];
    while let Some(node) = stack.pop() {
        match node.kind() {
            "identifier" => {
                let name = text(node, bytes);
                if BLOCKED_GLOBALS.contains(&name) {
                    return Ok(EvalVerdict::Blocked(name.to_string()));
                }
            }
            "member_expression" => {
                if let Some(verdict) = check_member(node, bytes, &mut from_char_code) {
                    return Ok(verdict);
                }
            }
            "subscript_expression" => {
                if let Some(verdict) = check_subscript(node, bytes, &mut string_subscripts) {
                    return Ok(verdict);
                }
            }
            "call_expression" => {
                if let Some(verdict) = check_string_timer(node, bytes) {
                    return Ok(verdict);
                }
            }
            _ => {}
        }
        for i in 0..node.child_count() {
            if let Some(child) = node.child(i) {
                stack.push(child);
            }
        }
    }

    if from_char_code >= FROM_CHAR_CODE_LIMIT {
        return Ok(EvalVerdict::Blocked(
            "mass String.fromCharCode sequence".to_string(),
        ));
    }
    if string_subscripts >= SUBSCRIPT_DENSITY_LIMIT {
        return Ok(EvalVerdict::Blocked(
            "unusually dense bracket indexing".to_string(),
        ));
    }

    Ok(EvalVerdict::Allowed)
}

fn text<'a>(node: Node<'a>, bytes: &'a [u8]) -> &'a str {
    node.utf8_text(bytes).unwrap_or("")
}

fn check_member(
    node: Node<'_>,
    bytes: &[u8],
    from_char_code: &mut usize,
) -> Option<EvalVerdict> {
    let object = node.child_by_field_name("object")?;
    let property = node.child_by_field_name("property")?;
    let obj = text(object, bytes);
    let prop = text(property, bytes);

    if prop == "fromCharCode" {
        *from_char_code += 1;
    }
    if BLOCKED_PROPS.contains(&prop) {
        return Some(EvalVerdict::Blocked(format!("{}.{}", obj, prop)));
    }
    if BLOCKED_RECEIVER_PROPS.contains(&(obj, prop)) {
        return Some(EvalVerdict::Blocked(format!("{}.{}", obj, prop)));
    }
    None
}

fn check_subscript(
    node: Node<'_>,
    bytes: &[u8],
    string_subscripts: &mut usize,
) -> Option<EvalVerdict> {
    let index = node.child_by_field_name("index")?;
    if index.kind() != "string" {
        return None;
    }
    *string_subscripts += 1;

    // obj["cookie"] is the same access as obj.cookie; strip the quotes
    // and apply the property rules.
    let raw = text(index, bytes);
    let name = raw.trim_matches(|c| c == '"' || c == '\'' || c == '`');
    let obj = node
        .child_by_field_name("object")
        .map(|o| text(o, bytes))
        .unwrap_or("");

    if BLOCKED_GLOBALS.contains(&name) || BLOCKED_PROPS.contains(&name) {
        return Some(EvalVerdict::Blocked(format!("{}[{}]", obj, raw)));
    }
    if BLOCKED_RECEIVER_PROPS.contains(&(obj, name)) {
        return Some(EvalVerdict::Blocked(format!("{}[{}]", obj, raw)));
    }
    None
}

/// `setTimeout`/`setInterval` with a string first argument compiles code
/// at runtime and is treated as dynamic eval.
fn check_string_timer(node: Node<'_>, bytes: &[u8]) -> Option<EvalVerdict> {
    let function = node.child_by_field_name("function")?;
    if function.kind() != "identifier" {
        return None;
    }
    let name = text(function, bytes);
    if name != "setTimeout" && name != "setInterval" {
        return None;
    }
    let args = node.child_by_field_name("arguments")?;
    let first = args.named_child(0)?;
    if first.kind() == "string" || first.kind() == "template_string" {
        return Some(EvalVerdict::Blocked(format!("{} with string argument", name)));
    }
    None
}
