//! Minimal XML property-list codec for mux payloads.
//!
//! Only the vocabulary that actually crosses the mux socket is supported:
//! dictionaries of strings, integers, nested dicts and arrays. The encoder is
//! the critical path (we build every request); the parser only needs to
//! handle the `MessageType`/`Number` shape of mux replies and the
//! `Attached`/`Detached` event dictionaries.

use std::fmt::Write as _;

use crate::error::{AppError, Result};

const XML_HEADER: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
<!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" \
\"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">\n\
<plist version=\"1.0\">\n";
const XML_FOOTER: &str = "</plist>\n";

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Integer(i64),
    Dict(Dict),
    Array(Vec<Value>),
}

/// An ordered dictionary with typed lookups. Order is preserved so encoded
/// payloads are deterministic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dict {
    pairs: Vec<(String, Value)>,
}

impl Dict {
    #[must_use]
    pub fn new() -> Self {
        Self { pairs: Vec::new() }
    }

    pub fn push(&mut self, key: impl Into<String>, value: Value) {
        self.pairs.push((key.into(), value));
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    #[must_use]
    pub fn as_string(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_int(&self, key: &str) -> Option<i64> {
        match self.get(key) {
            Some(Value::Integer(n)) => Some(*n),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_dict(&self, key: &str) -> Option<&Dict> {
        match self.get(key) {
            Some(Value::Dict(d)) => Some(d),
            _ => None,
        }
    }
}

impl FromIterator<(String, Value)> for Dict {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self {
            pairs: iter.into_iter().collect(),
        }
    }
}

/// Serialize an ordered list of pairs as an XML plist document.
#[must_use]
pub fn encode_dict(pairs: &[(&str, Value)]) -> Vec<u8> {
    let dict: Dict = pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect();
    let mut out = String::from(XML_HEADER);
    write_value(&mut out, &Value::Dict(dict), 0);
    out.push_str(XML_FOOTER);
    out.into_bytes()
}

fn write_value(out: &mut String, value: &Value, depth: usize) {
    let pad = "\t".repeat(depth);
    match value {
        Value::String(s) => {
            let _ = writeln!(out, "{}<string>{}</string>", pad, escape(s));
        }
        Value::Integer(n) => {
            let _ = writeln!(out, "{}<integer>{}</integer>", pad, n);
        }
        Value::Dict(dict) => {
            if dict.pairs.is_empty() {
                let _ = writeln!(out, "{}<dict/>", pad);
                return;
            }
            let _ = writeln!(out, "{}<dict>", pad);
            for (key, val) in &dict.pairs {
                let _ = writeln!(out, "{}\t<key>{}</key>", pad, escape(key));
                write_value(out, val, depth + 1);
            }
            let _ = writeln!(out, "{}</dict>", pad);
        }
        Value::Array(items) => {
            if items.is_empty() {
                let _ = writeln!(out, "{}<array/>", pad);
                return;
            }
            let _ = writeln!(out, "{}<array>", pad);
            for item in items {
                write_value(out, item, depth + 1);
            }
            let _ = writeln!(out, "{}</array>", pad);
        }
    }
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Parse an XML plist document whose root value is a dictionary.
pub fn parse_dict(bytes: &[u8]) -> Result<Dict> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| AppError::Plist(format!("payload is not UTF-8: {}", e)))?;

    // Apple plists carry a DOCTYPE line; roxmltree rejects DTDs unless asked.
    let options = roxmltree::ParsingOptions {
        allow_dtd: true,
        ..Default::default()
    };
    let doc = roxmltree::Document::parse_with_options(text, options)
        .map_err(|e| AppError::Plist(format!("invalid XML: {}", e)))?;

    let root = doc.root_element();
    if !root.has_tag_name("plist") {
        return Err(AppError::Plist(format!(
            "root element is <{}>, expected <plist>",
            root.tag_name().name()
        )));
    }

    let body = root
        .children()
        .find(|n| n.is_element())
        .ok_or_else(|| AppError::Plist("empty plist document".into()))?;

    match parse_value(body)? {
        Value::Dict(dict) => Ok(dict),
        other => Err(AppError::Plist(format!(
            "top-level plist value is {:?}, expected a dict",
            other
        ))),
    }
}

fn parse_value(node: roxmltree::Node<'_, '_>) -> Result<Value> {
    match node.tag_name().name() {
        "string" => Ok(Value::String(node.text().unwrap_or("").to_string())),
        "integer" => {
            let text = node.text().unwrap_or("").trim();
            let n = text
                .parse::<i64>()
                .map_err(|_| AppError::Plist(format!("invalid integer {:?}", text)))?;
            Ok(Value::Integer(n))
        }
        // Tolerated variants occasionally present in device property dicts.
        "real" => {
            let text = node.text().unwrap_or("").trim();
            let f = text
                .parse::<f64>()
                .map_err(|_| AppError::Plist(format!("invalid real {:?}", text)))?;
            Ok(Value::Integer(f as i64))
        }
        "true" => Ok(Value::Integer(1)),
        "false" => Ok(Value::Integer(0)),
        "dict" => {
            let mut dict = Dict::new();
            let mut children = node.children().filter(|n| n.is_element());
            while let Some(key_node) = children.next() {
                if !key_node.has_tag_name("key") {
                    return Err(AppError::Plist(format!(
                        "expected <key>, found <{}>",
                        key_node.tag_name().name()
                    )));
                }
                let key = key_node.text().unwrap_or("").to_string();
                let value_node = children
                    .next()
                    .ok_or_else(|| AppError::Plist(format!("key {:?} has no value", key)))?;
                dict.push(key, parse_value(value_node)?);
            }
            Ok(Value::Dict(dict))
        }
        "array" => {
            let items = node
                .children()
                .filter(|n| n.is_element())
                .map(parse_value)
                .collect::<Result<Vec<_>>>()?;
            Ok(Value::Array(items))
        }
        other => Err(AppError::Plist(format!("unsupported element <{}>", other))),
    }
}
