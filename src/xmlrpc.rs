//! A narrow XML-RPC codec: just enough of the wire format for the three
//! methods this system exposes (`register_challenge`, `connect_user`,
//! `disconnect_user`) and their parameter types (string, int, array, nil).
//!
//! The OpenVPN hook scripts speak `xmlrpc.client.ServerProxy` (Python's
//! standard library XML-RPC client), so the wire format is fixed external
//! behavior, not a free design choice — this module exists instead of
//! reaching for a JSON-RPC crate the hooks don't speak. Built on `quick-xml`,
//! the representative XML crate across the retrieved corpus; no dedicated
//! XML-RPC crate appears anywhere in it, so this is written the way the
//! teacher writes its other small protocol wrappers (`netlink.rs`): a
//! purpose-built module, not a general library.

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::io::Cursor;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Int(i32),
    Array(Vec<Value>),
    Struct(Vec<(String, Value)>),
    Nil,
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MethodCall {
    pub name: String,
    pub params: Vec<Value>,
}

#[derive(Debug, Clone)]
pub enum MethodResponse {
    Success(Value),
    Fault { code: i32, message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed xml-rpc payload: {0}")]
    Xml(String),
    #[error("unexpected xml-rpc shape: {0}")]
    Shape(String),
}

type Result<T> = std::result::Result<T, CodecError>;

// ---------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------

pub fn encode_call(call: &MethodCall) -> Vec<u8> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    write_decl(&mut writer);
    with_element(&mut writer, "methodCall", |w| {
        write_text_element(w, "methodName", &call.name);
        with_element(w, "params", |w| {
            for param in &call.params {
                with_element(w, "param", |w| write_value(w, param));
            }
        });
    });
    writer.into_inner().into_inner()
}

pub fn encode_response(response: &MethodResponse) -> Vec<u8> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    write_decl(&mut writer);
    with_element(&mut writer, "methodResponse", |w| match response {
        MethodResponse::Success(value) => {
            with_element(w, "params", |w| {
                with_element(w, "param", |w| write_value(w, value));
            });
        }
        MethodResponse::Fault { code, message } => {
            with_element(w, "fault", |w| {
                write_value(
                    w,
                    &Value::Struct(vec![
                        ("faultCode".to_string(), Value::Int(*code)),
                        ("faultString".to_string(), Value::String(message.clone())),
                    ]),
                );
            });
        }
    });
    writer.into_inner().into_inner()
}

fn write_decl(writer: &mut Writer<Cursor<Vec<u8>>>) {
    writer
        .write_event(Event::Decl(quick_xml::events::BytesDecl::new(
            "1.0", Some("utf-8"), None,
        )))
        .expect("writing to an in-memory buffer cannot fail");
}

fn with_element<F>(writer: &mut Writer<Cursor<Vec<u8>>>, name: &str, body: F)
where
    F: FnOnce(&mut Writer<Cursor<Vec<u8>>>),
{
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .expect("writing to an in-memory buffer cannot fail");
    body(writer);
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .expect("writing to an in-memory buffer cannot fail");
}

fn write_text_element(writer: &mut Writer<Cursor<Vec<u8>>>, name: &str, text: &str) {
    with_element(writer, name, |w| {
        w.write_event(Event::Text(BytesText::new(text)))
            .expect("writing to an in-memory buffer cannot fail");
    });
}

fn write_value(writer: &mut Writer<Cursor<Vec<u8>>>, value: &Value) {
    with_element(writer, "value", |w| match value {
        Value::String(s) => write_text_element(w, "string", s),
        Value::Int(n) => write_text_element(w, "int", &n.to_string()),
        Value::Nil => {
            w.write_event(Event::Empty(BytesStart::new("nil"))).ok();
        }
        Value::Array(items) => with_element(w, "array", |w| {
            with_element(w, "data", |w| {
                for item in items {
                    write_value(w, item);
                }
            });
        }),
        Value::Struct(members) => with_element(w, "struct", |w| {
            for (name, value) in members {
                with_element(w, "member", |w| {
                    write_text_element(w, "name", name);
                    write_value(w, value);
                });
            }
        }),
    });
}

// ---------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------

/// A minimal, non-validating tree of the elements this codec needs. XML-RPC
/// documents are shallow enough that a full DOM isn't worth pulling in a
/// second crate for.
struct Node {
    name: String,
    children: Vec<Node>,
    text: String,
}

fn parse_tree(xml: &[u8]) -> Result<Node> {
    // whitespace between tags only ever lands in a node's own `text` field
    // (never pushed as a child), and the only leaf elements this codec reads
    // text out of (methodName, string, int, name) never contain mixed
    // element/text content in anything this codec emits, so there's no need
    // to configure whitespace trimming on the reader.
    let mut reader = Reader::from_reader(xml);
    let mut stack: Vec<Node> = vec![Node {
        name: "#root".to_string(),
        children: Vec::new(),
        text: String::new(),
    }];

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(tag)) => {
                let name = String::from_utf8_lossy(tag.name().as_ref()).into_owned();
                stack.push(Node {
                    name,
                    children: Vec::new(),
                    text: String::new(),
                });
            }
            Ok(Event::Empty(tag)) => {
                let name = String::from_utf8_lossy(tag.name().as_ref()).into_owned();
                let node = Node {
                    name,
                    children: Vec::new(),
                    text: String::new(),
                };
                stack
                    .last_mut()
                    .expect("root never pops")
                    .children
                    .push(node);
            }
            Ok(Event::End(_)) => {
                let finished = stack.pop().ok_or_else(|| {
                    CodecError::Xml("unbalanced closing tag".to_string())
                })?;
                stack
                    .last_mut()
                    .expect("root never pops")
                    .children
                    .push(finished);
            }
            Ok(Event::Text(text)) => {
                let decoded = text
                    .unescape()
                    .map_err(|err| CodecError::Xml(err.to_string()))?;
                stack.last_mut().expect("root never pops").text.push_str(&decoded);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => return Err(CodecError::Xml(err.to_string())),
        }
        buf.clear();
    }

    let mut root = stack.pop().ok_or_else(|| CodecError::Xml("empty document".to_string()))?;
    root.children
        .pop()
        .ok_or_else(|| CodecError::Xml("no top-level element".to_string()))
}

fn child<'a>(node: &'a Node, name: &str) -> Option<&'a Node> {
    node.children.iter().find(|c| c.name == name)
}

fn decode_value(node: &Node) -> Result<Value> {
    // a <value> with no typed child is a bare string per the XML-RPC spec
    if node.children.is_empty() {
        return Ok(Value::String(node.text.clone()));
    }
    let typed = &node.children[0];
    match typed.name.as_str() {
        "string" => Ok(Value::String(typed.text.clone())),
        "int" | "i4" => typed
            .text
            .trim()
            .parse()
            .map(Value::Int)
            .map_err(|_| CodecError::Shape(format!("invalid integer {:?}", typed.text))),
        "nil" => Ok(Value::Nil),
        "array" => {
            let data = child(typed, "data")
                .ok_or_else(|| CodecError::Shape("array missing <data>".to_string()))?;
            let items = data
                .children
                .iter()
                .map(decode_value)
                .collect::<Result<Vec<_>>>()?;
            Ok(Value::Array(items))
        }
        "struct" => {
            let mut members = Vec::new();
            for member in &typed.children {
                if member.name != "member" {
                    continue;
                }
                let name = child(member, "name")
                    .ok_or_else(|| CodecError::Shape("member missing <name>".to_string()))?
                    .text
                    .clone();
                let value = child(member, "value")
                    .ok_or_else(|| CodecError::Shape("member missing <value>".to_string()))?;
                members.push((name, decode_value(value)?));
            }
            Ok(Value::Struct(members))
        }
        other => Err(CodecError::Shape(format!("unsupported value type {other:?}"))),
    }
}

pub fn decode_call(xml: &[u8]) -> Result<MethodCall> {
    let root = parse_tree(xml)?;
    if root.name != "methodCall" {
        return Err(CodecError::Shape(format!(
            "expected <methodCall>, got <{}>",
            root.name
        )));
    }
    let name = child(&root, "methodName")
        .ok_or_else(|| CodecError::Shape("missing <methodName>".to_string()))?
        .text
        .clone();
    let mut params = Vec::new();
    if let Some(params_node) = child(&root, "params") {
        for param in &params_node.children {
            if param.name != "param" {
                continue;
            }
            let value = child(param, "value")
                .ok_or_else(|| CodecError::Shape("param missing <value>".to_string()))?;
            params.push(decode_value(value)?);
        }
    }
    Ok(MethodCall { name, params })
}

pub fn decode_response(xml: &[u8]) -> Result<MethodResponse> {
    let root = parse_tree(xml)?;
    if root.name != "methodResponse" {
        return Err(CodecError::Shape(format!(
            "expected <methodResponse>, got <{}>",
            root.name
        )));
    }
    if let Some(fault) = child(&root, "fault") {
        let value = child(fault, "value")
            .ok_or_else(|| CodecError::Shape("fault missing <value>".to_string()))?;
        let decoded = decode_value(value)?;
        let members = match decoded {
            Value::Struct(members) => members,
            _ => return Err(CodecError::Shape("fault value must be a struct".to_string())),
        };
        let code = members
            .iter()
            .find(|(name, _)| name == "faultCode")
            .and_then(|(_, v)| v.as_int())
            .unwrap_or(0);
        let message = members
            .iter()
            .find(|(name, _)| name == "faultString")
            .and_then(|(_, v)| v.as_str())
            .unwrap_or_default()
            .to_string();
        return Ok(MethodResponse::Fault { code, message });
    }

    let params = child(&root, "params")
        .ok_or_else(|| CodecError::Shape("missing <params>".to_string()))?;
    let param = child(params, "param")
        .ok_or_else(|| CodecError::Shape("missing <param>".to_string()))?;
    let value = child(param, "value")
        .ok_or_else(|| CodecError::Shape("param missing <value>".to_string()))?;
    Ok(MethodResponse::Success(decode_value(value)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_method_call() {
        let call = MethodCall {
            name: "connect_user".to_string(),
            params: vec![
                Value::String("example".to_string()),
                Value::String("MFRGG".to_string()),
                Value::String("10.8.0.2".to_string()),
                Value::Int(49152),
            ],
        };
        let encoded = encode_call(&call);
        let decoded = decode_call(&encoded).unwrap();
        assert_eq!(decoded.name, "connect_user");
        assert_eq!(decoded.params, call.params);
    }

    #[test]
    fn round_trips_a_success_response() {
        let response = MethodResponse::Success(Value::Int(42));
        let encoded = encode_response(&response);
        match decode_response(&encoded).unwrap() {
            MethodResponse::Success(Value::Int(42)) => {}
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn round_trips_a_fault() {
        let response = MethodResponse::Fault {
            code: 1,
            message: "unknown challenge".to_string(),
        };
        let encoded = encode_response(&response);
        match decode_response(&encoded).unwrap() {
            MethodResponse::Fault { code, message } => {
                assert_eq!(code, 1);
                assert_eq!(message, "unknown challenge");
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn decodes_array_params() {
        let call = MethodCall {
            name: "register_challenge".to_string(),
            params: vec![
                Value::String("example".to_string()),
                Value::String("host0".to_string()),
                Value::Array(vec![Value::String("ex.yml".to_string())]),
            ],
        };
        let encoded = encode_call(&call);
        let decoded = decode_call(&encoded).unwrap();
        let files = decoded.params[2].as_array().unwrap();
        assert_eq!(files[0].as_str(), Some("ex.yml"));
    }
}
