//! Document serialization.
//!
//! Namespace declarations are not stored on elements. Instead the writer
//! tracks which prefixes are in scope and declares a binding wherever an
//! element or attribute needs one, so subtrees copied between documents
//! always serialize to well-formed, correctly bound XML.
//!
//! Pretty printing indents only element-only content: as soon as an element
//! has a text child, its children are written exactly as they are.

use super::document::{Document, NodeId, NodeKind, QName, XML_NS};
use quick_xml::escape::{escape, partial_escape};

const INDENT: &str = "  ";

/// In-scope prefix bindings, innermost last. `None` is the default namespace.
struct Scope {
    bindings: Vec<(Option<String>, String)>,
}

impl Scope {
    fn lookup(&self, prefix: Option<&str>) -> Option<&str> {
        self.bindings
            .iter()
            .rev()
            .find(|(p, _)| p.as_deref() == prefix)
            .map(|(_, uri)| uri.as_str())
    }
}

impl Document {
    /// Serialize the whole document without an XML declaration.
    pub fn to_xml(&self, pretty: bool) -> String {
        self.node_to_xml(Self::ROOT, pretty)
    }

    /// Serialize with a leading UTF-8 XML declaration and trailing newline.
    pub fn to_xml_document(&self, pretty: bool) -> String {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        out.push_str(&self.to_xml(pretty));
        out.push('\n');
        out
    }

    /// Serialize one node and its subtree.
    pub fn node_to_xml(&self, id: NodeId, pretty: bool) -> String {
        let mut out = String::new();
        let mut scope = Scope {
            bindings: vec![(Some("xml".to_string()), XML_NS.to_string())],
        };
        if let NodeKind::Document = self.kind(id) {
            for (i, &child) in self.children(id).iter().enumerate() {
                if pretty && i > 0 {
                    out.push('\n');
                }
                self.write_node(&mut out, &mut scope, child, 0, pretty);
            }
        } else {
            self.write_node(&mut out, &mut scope, id, 0, pretty);
        }
        out
    }

    fn write_node(
        &self,
        out: &mut String,
        scope: &mut Scope,
        id: NodeId,
        depth: usize,
        pretty: bool,
    ) {
        match self.kind(id) {
            NodeKind::Document => {
                for &child in self.children(id) {
                    self.write_node(out, scope, child, depth, pretty);
                }
            }
            NodeKind::Text(t) => out.push_str(&partial_escape(t.as_str())),
            NodeKind::Comment(c) => {
                out.push_str("<!--");
                out.push_str(c);
                out.push_str("-->");
            }
            NodeKind::Element(element) => {
                let mark = scope.bindings.len();
                let tag = element.name.qualified();
                out.push('<');
                out.push_str(&tag);

                declare(out, scope, &element.name, false);
                for attr in &element.attributes {
                    declare(out, scope, &attr.name, true);
                }
                for attr in &element.attributes {
                    out.push(' ');
                    out.push_str(&attr.name.qualified());
                    out.push_str("=\"");
                    out.push_str(&escape(attr.value.as_str()));
                    out.push('"');
                }

                let children = self.children(id);
                if children.is_empty() {
                    out.push_str("/>");
                } else {
                    out.push('>');
                    let indent = pretty
                        && children
                            .iter()
                            .all(|&c| !matches!(self.kind(c), NodeKind::Text(_)));
                    for &child in children {
                        if indent {
                            out.push('\n');
                            out.push_str(&INDENT.repeat(depth + 1));
                        }
                        self.write_node(out, scope, child, depth + 1, pretty);
                    }
                    if indent {
                        out.push('\n');
                        out.push_str(&INDENT.repeat(depth));
                    }
                    out.push_str("</");
                    out.push_str(&tag);
                    out.push('>');
                }
                scope.bindings.truncate(mark);
            }
        }
    }
}

/// Emit an `xmlns` declaration when `name` is not bound as required.
fn declare(out: &mut String, scope: &mut Scope, name: &QName, is_attribute: bool) {
    let prefix = name.prefix.as_deref();
    match name.ns.as_deref() {
        Some(uri) => {
            if prefix == Some("xml") || scope.lookup(prefix) == Some(uri) {
                return;
            }
            // Attributes never pick up the default namespace.
            if is_attribute && prefix.is_none() {
                return;
            }
            push_binding(out, prefix, uri);
            scope
                .bindings
                .push((prefix.map(str::to_string), uri.to_string()));
        }
        None => {
            if !is_attribute && prefix.is_none() && scope.lookup(None).is_some_and(|u| !u.is_empty())
            {
                push_binding(out, None, "");
                scope.bindings.push((None, String::new()));
            }
        }
    }
}

fn push_binding(out: &mut String, prefix: Option<&str>, uri: &str) {
    match prefix {
        Some(p) => {
            out.push_str(" xmlns:");
            out.push_str(p);
        }
        None => out.push_str(" xmlns"),
    }
    out.push_str("=\"");
    out.push_str(&escape(uri));
    out.push('"');
}
