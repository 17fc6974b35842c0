//! Arena-backed XML document model.
//!
//! Every [`Document`] owns a flat vector of nodes addressed by [`NodeId`].
//! Slot 0 is always the document node; the document element and any
//! top-level comments hang off it. Parent and child links are plain indices,
//! which keeps path evaluation (`..`, `//`) cheap and lets subtrees be copied
//! between documents with [`Document::import`].
//!
//! ## Document order
//!
//! Node ids follow document order for every tree built front to back: the
//! parser, the stylesheet engine and the state publisher all append nodes in
//! pre-order. XInclude resolution splices foreign subtrees into the middle of
//! a tree, so it finishes with a [`Document::compact`] pass that rebuilds the
//! arena in pre-order. Path evaluation relies on this to sort node-sets by id.
//!
//! ## Parsing
//!
//! [`Document::parse_file`] reads a file (UTF-8, or UTF-16 with a BOM), builds
//! the tree with quick-xml's namespace-resolving reader and then resolves
//! `xi:include` elements relative to the including file. Processing
//! instructions and the DOCTYPE are dropped; CDATA sections become text.

use encoding_rs::{Encoding, UTF_8};
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::{PrefixDeclaration, ResolveResult};
use quick_xml::reader::NsReader;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Namespace of XInclude elements.
pub const XINCLUDE_NS: &str = "http://www.w3.org/2001/XInclude";

/// Namespace bound to the reserved `xml` prefix.
pub const XML_NS: &str = "http://www.w3.org/XML/1998/namespace";

#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("[{}, {line}, {column}] {message}", display_path(.path))]
    Syntax {
        path: Option<PathBuf>,
        line: usize,
        column: usize,
        message: String,
    },
    #[error("{}: not valid {encoding} text", path.display())]
    Encoding { path: PathBuf, encoding: &'static str },
    #[error("{}: document has no root element", display_path(.0))]
    NoRootElement(Option<PathBuf>),
    #[error("{}: xi:include {message}", path.display())]
    Include { path: PathBuf, message: String },
    #[error("{}: inclusion loop through {}", path.display(), target.display())]
    IncludeCycle { path: PathBuf, target: PathBuf },
}

fn display_path(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "<string>".to_string())
}

/// Index of a node inside its owning [`Document`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A namespace-qualified name.
///
/// `ns` is the resolved namespace URI; `prefix` is kept only so serialized
/// output reuses the author's prefixes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QName {
    pub ns: Option<String>,
    pub prefix: Option<String>,
    pub local: String,
}

impl QName {
    /// A name in no namespace.
    pub fn local(local: impl Into<String>) -> Self {
        Self {
            ns: None,
            prefix: None,
            local: local.into(),
        }
    }

    pub fn with_ns(ns: impl Into<String>, prefix: Option<&str>, local: impl Into<String>) -> Self {
        Self {
            ns: Some(ns.into()),
            prefix: prefix.map(str::to_string),
            local: local.into(),
        }
    }

    /// `prefix:local`, or just `local` when unprefixed.
    pub fn qualified(&self) -> String {
        match &self.prefix {
            Some(p) => format!("{}:{}", p, self.local),
            None => self.local.clone(),
        }
    }

    pub fn is(&self, ns: Option<&str>, local: &str) -> bool {
        self.ns.as_deref() == ns && self.local == local
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: QName,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub name: QName,
    pub attributes: Vec<Attribute>,
    /// `xmlns` declarations written on this element in the parsed text
    /// (`None` is the default namespace). The serializer does not use
    /// these; it declares whatever the names need.
    pub namespaces: Vec<(Option<String>, String)>,
}

impl Element {
    pub fn new(name: QName) -> Self {
        Self {
            name,
            attributes: Vec::new(),
            namespaces: Vec::new(),
        }
    }

    /// Value of an attribute in no namespace.
    pub fn attribute(&self, local: &str) -> Option<&str> {
        self.attribute_ns(None, local)
    }

    pub fn attribute_ns(&self, ns: Option<&str>, local: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.name.is(ns, local))
            .map(|a| a.value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Document,
    Element(Element),
    Text(String),
    Comment(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct NodeData {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// An XML document (or result tree).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    nodes: Vec<NodeData>,
    uri: Option<PathBuf>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    /// The document node.
    pub const ROOT: NodeId = NodeId(0);

    /// An empty document holding only the document node.
    pub fn new() -> Self {
        Self {
            nodes: vec![NodeData {
                kind: NodeKind::Document,
                parent: None,
                children: Vec::new(),
            }],
            uri: None,
        }
    }

    /// Path the document was loaded from, if any.
    pub fn uri(&self) -> Option<&Path> {
        self.uri.as_deref()
    }

    // =========================================================================
    // Navigation
    // =========================================================================

    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.nodes[id.0].kind
    }

    pub fn element(&self, id: NodeId) -> Option<&Element> {
        match &self.nodes[id.0].kind {
            NodeKind::Element(e) => Some(e),
            _ => None,
        }
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].children
    }

    /// The single top-level element.
    pub fn document_element(&self) -> Option<NodeId> {
        self.children(Self::ROOT)
            .iter()
            .copied()
            .find(|&c| self.element(c).is_some())
    }

    /// Namespace declarations in scope at `id`, innermost last.
    pub fn in_scope_namespaces(&self, id: NodeId) -> Vec<(Option<String>, String)> {
        let mut chain = Vec::new();
        let mut current = Some(id);
        while let Some(node) = current {
            chain.push(node);
            current = self.parent(node);
        }
        chain
            .iter()
            .rev()
            .filter_map(|&n| self.element(n))
            .flat_map(|e| e.namespaces.iter().cloned())
            .collect()
    }

    /// Local name of the document element.
    pub fn root_name(&self) -> Option<&str> {
        self.document_element()
            .and_then(|id| self.element(id))
            .map(|e| e.name.local.as_str())
    }

    /// All descendants of `id` in document order, excluding `id` itself.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.collect_descendants(id, &mut out);
        out
    }

    fn collect_descendants(&self, id: NodeId, out: &mut Vec<NodeId>) {
        for &child in self.children(id) {
            out.push(child);
            self.collect_descendants(child, out);
        }
    }

    /// True when `id` is reachable from the document node.
    pub fn is_attached(&self, id: NodeId) -> bool {
        let mut current = id;
        while let Some(parent) = self.parent(current) {
            current = parent;
        }
        current == Self::ROOT
    }

    /// XPath string-value: concatenated descendant text for documents and
    /// elements, the content itself for text and comments.
    pub fn string_value(&self, id: NodeId) -> String {
        match self.kind(id) {
            NodeKind::Text(t) | NodeKind::Comment(t) => t.clone(),
            NodeKind::Document | NodeKind::Element(_) => {
                let mut out = String::new();
                for d in self.descendants(id) {
                    if let NodeKind::Text(t) = self.kind(d) {
                        out.push_str(t);
                    }
                }
                out
            }
        }
    }

    // =========================================================================
    // Construction
    // =========================================================================

    /// Create a node with no parent. Attach it with [`Document::attach`].
    pub fn create(&mut self, kind: NodeKind) -> NodeId {
        self.nodes.push(NodeData {
            kind,
            parent: None,
            children: Vec::new(),
        });
        NodeId(self.nodes.len() - 1)
    }

    pub fn attach(&mut self, parent: NodeId, child: NodeId) {
        self.nodes[child.0].parent = Some(parent);
        self.nodes[parent.0].children.push(child);
    }

    pub fn append_element(&mut self, parent: NodeId, name: QName) -> NodeId {
        let id = self.create(NodeKind::Element(Element::new(name)));
        self.attach(parent, id);
        id
    }

    /// Append text, merging with a directly preceding text sibling.
    pub fn append_text(&mut self, parent: NodeId, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(&last) = self.nodes[parent.0].children.last()
            && let NodeKind::Text(existing) = &mut self.nodes[last.0].kind
        {
            existing.push_str(text);
            return;
        }
        let id = self.create(NodeKind::Text(text.to_string()));
        self.attach(parent, id);
    }

    pub fn append_comment(&mut self, parent: NodeId, text: &str) {
        let id = self.create(NodeKind::Comment(text.to_string()));
        self.attach(parent, id);
    }

    /// Set (or replace) an attribute on an element. No-op on other nodes.
    pub fn set_attribute(&mut self, id: NodeId, name: QName, value: impl Into<String>) {
        if let NodeKind::Element(e) = &mut self.nodes[id.0].kind {
            let value = value.into();
            match e
                .attributes
                .iter_mut()
                .find(|a| a.name.ns == name.ns && a.name.local == name.local)
            {
                Some(existing) => existing.value = value,
                None => e.attributes.push(Attribute { name, value }),
            }
        }
    }

    /// Deep-copy `src_id` from `src` and append the copy under `parent`.
    ///
    /// Copying a document node copies its children instead. Adjacent text
    /// is merged, so importing text next to text yields one node.
    pub fn import(&mut self, parent: NodeId, src: &Document, src_id: NodeId) {
        match src.kind(src_id) {
            NodeKind::Document => {
                for &child in src.children(src_id) {
                    self.import(parent, src, child);
                }
            }
            NodeKind::Text(t) => self.append_text(parent, t),
            NodeKind::Comment(c) => self.append_comment(parent, c),
            NodeKind::Element(e) => {
                let id = self.create(NodeKind::Element(e.clone()));
                self.attach(parent, id);
                for &child in src.children(src_id) {
                    self.import(id, src, child);
                }
            }
        }
    }

    /// A new document whose document node holds a copy of `id`.
    pub fn extract(&self, id: NodeId) -> Document {
        let mut doc = Document::new();
        doc.uri = self.uri.clone();
        doc.import(Self::ROOT, self, id);
        doc
    }

    /// Replace `old` in its parent's child list with `replacement`.
    fn replace(&mut self, old: NodeId, replacement: Vec<NodeId>) {
        let Some(parent) = self.parent(old) else {
            return;
        };
        for &r in &replacement {
            self.nodes[r.0].parent = Some(parent);
        }
        let siblings = &mut self.nodes[parent.0].children;
        if let Some(pos) = siblings.iter().position(|&c| c == old) {
            siblings.splice(pos..=pos, replacement);
        }
        self.nodes[old.0].parent = None;
    }

    /// Rebuild the arena in document order, dropping detached nodes.
    pub fn compact(&mut self) {
        let mut fresh = Document::new();
        fresh.uri = self.uri.take();
        fresh.import(Self::ROOT, self, Self::ROOT);
        *self = fresh;
    }

    // =========================================================================
    // Parsing
    // =========================================================================

    /// Parse a file and resolve its XInclude elements.
    pub fn parse_file(path: &Path) -> Result<Self, DocumentError> {
        let mut chain = Vec::new();
        Self::load(path, &mut chain)
    }

    /// Parse XML text. Inclusions are left untouched.
    pub fn parse_str(text: &str) -> Result<Self, DocumentError> {
        parse_text(text, None)
    }

    fn load(path: &Path, chain: &mut Vec<PathBuf>) -> Result<Self, DocumentError> {
        let canonical = fs::canonicalize(path).map_err(|source| DocumentError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if chain.contains(&canonical) {
            let including = chain.last().cloned().unwrap_or_else(|| canonical.clone());
            return Err(DocumentError::IncludeCycle {
                path: including,
                target: path.to_path_buf(),
            });
        }

        let text = read_text(path, None)?;
        let mut doc = parse_text(&text, Some(path))?;

        chain.push(canonical);
        let resolved = doc.resolve_includes(path, chain);
        chain.pop();
        resolved?;
        Ok(doc)
    }

    fn resolve_includes(
        &mut self,
        path: &Path,
        chain: &mut Vec<PathBuf>,
    ) -> Result<(), DocumentError> {
        let includes: Vec<NodeId> = self
            .descendants(Self::ROOT)
            .into_iter()
            .filter(|&id| {
                self.element(id)
                    .is_some_and(|e| e.name.is(Some(XINCLUDE_NS), "include"))
            })
            .collect();
        if includes.is_empty() {
            return Ok(());
        }

        let base = path.parent().unwrap_or_else(|| Path::new(""));
        let include_error = |message: String| DocumentError::Include {
            path: path.to_path_buf(),
            message,
        };

        for id in includes {
            if !self.is_attached(id) {
                continue;
            }
            let Some(element) = self.element(id) else {
                continue;
            };
            let href = element
                .attribute("href")
                .filter(|h| !h.is_empty())
                .ok_or_else(|| include_error("is missing href".into()))?
                .to_string();
            if element.attribute("xpointer").is_some() {
                return Err(include_error(format!("{href}: xpointer is not supported")));
            }
            let parse = element.attribute("parse").unwrap_or("xml").to_string();
            let encoding = element.attribute("encoding").map(str::to_string);
            let target = base.join(&href);

            if !target.exists() {
                let fallback = self.children(id).iter().copied().find(|&c| {
                    self.element(c)
                        .is_some_and(|e| e.name.is(Some(XINCLUDE_NS), "fallback"))
                });
                match fallback {
                    Some(fallback) => {
                        let content = self.children(fallback).to_vec();
                        self.replace(id, content);
                        continue;
                    }
                    None => {
                        return Err(include_error(format!("{href}: target does not exist")));
                    }
                }
            }

            let replacement = match parse.as_str() {
                "xml" => {
                    let included = Self::load(&target, chain)?;
                    match included.document_element() {
                        Some(root) => {
                            let detached = self.create(NodeKind::Document);
                            self.import(detached, &included, root);
                            let nodes = self.children(detached).to_vec();
                            self.nodes[detached.0].children.clear();
                            nodes
                        }
                        None => Vec::new(),
                    }
                }
                "text" => {
                    let text = read_text(&target, encoding.as_deref())?;
                    vec![self.create(NodeKind::Text(text))]
                }
                other => {
                    return Err(include_error(format!(
                        "{href}: unsupported parse mode `{other}`"
                    )));
                }
            };
            self.replace(id, replacement);
        }

        self.compact();
        Ok(())
    }
}

/// Read a file as text. UTF-16 is honoured when a BOM says so; otherwise
/// `label` (an encoding_rs label) or UTF-8 is used. Malformed input is an error.
fn read_text(path: &Path, label: Option<&str>) -> Result<String, DocumentError> {
    let bytes = fs::read(path).map_err(|source| DocumentError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let fallback = label.and_then(|l| Encoding::for_label(l.as_bytes())).unwrap_or(UTF_8);
    let (encoding, bom_len) = Encoding::for_bom(&bytes).unwrap_or((fallback, 0));
    encoding
        .decode_without_bom_handling_and_without_replacement(&bytes[bom_len..])
        .map(|text| text.into_owned())
        .ok_or_else(|| DocumentError::Encoding {
            path: path.to_path_buf(),
            encoding: encoding.name(),
        })
}

/// 1-based line and column of a byte offset.
fn line_column(text: &str, offset: usize) -> (usize, usize) {
    let offset = offset.min(text.len());
    let before = &text.as_bytes()[..offset];
    let line = before.iter().filter(|&&b| b == b'\n').count() + 1;
    let column = before.iter().rev().take_while(|&&b| b != b'\n').count() + 1;
    (line, column)
}

fn parse_text(text: &str, path: Option<&Path>) -> Result<Document, DocumentError> {
    let syntax = |offset: usize, message: String| {
        let (line, column) = line_column(text, offset);
        DocumentError::Syntax {
            path: path.map(Path::to_path_buf),
            line,
            column,
            message,
        }
    };

    let mut reader = NsReader::from_str(text);
    let mut doc = Document::new();
    doc.uri = path.map(Path::to_path_buf);
    let mut open = vec![Document::ROOT];

    loop {
        let event_start = reader.buffer_position() as usize;
        let (resolved, event) = match reader.read_resolved_event() {
            Ok(pair) => pair,
            Err(e) => return Err(syntax(event_start, e.to_string())),
        };
        let ns = match resolved {
            ResolveResult::Bound(ns) => Some(String::from_utf8_lossy(ns.as_ref()).into_owned()),
            ResolveResult::Unbound => None,
            ResolveResult::Unknown(prefix) => {
                return Err(syntax(
                    event_start,
                    format!("unbound prefix `{}`", String::from_utf8_lossy(&prefix)),
                ));
            }
        };
        let top = *open.last().unwrap_or(&Document::ROOT);

        match event {
            Event::Start(e) => {
                if top == Document::ROOT && doc.document_element().is_some() {
                    return Err(syntax(
                        event_start,
                        "more than one root element".into(),
                    ));
                }
                let element = read_element(&reader, ns, &e)
                    .map_err(|m| syntax(event_start, m))?;
                let id = doc.create(NodeKind::Element(element));
                doc.attach(top, id);
                open.push(id);
            }
            Event::Empty(e) => {
                if top == Document::ROOT && doc.document_element().is_some() {
                    return Err(syntax(
                        event_start,
                        "more than one root element".into(),
                    ));
                }
                let element = read_element(&reader, ns, &e)
                    .map_err(|m| syntax(event_start, m))?;
                let id = doc.create(NodeKind::Element(element));
                doc.attach(top, id);
            }
            Event::End(_) => {
                open.pop();
            }
            Event::Text(e) => {
                let content = e
                    .unescape()
                    .map_err(|err| syntax(event_start, err.to_string()))?;
                if top == Document::ROOT {
                    if !content.trim().is_empty() {
                        return Err(syntax(
                            event_start,
                            "text outside the root element".into(),
                        ));
                    }
                } else {
                    doc.append_text(top, &content);
                }
            }
            Event::CData(e) => {
                let content = String::from_utf8_lossy(&e).into_owned();
                doc.append_text(top, &content);
            }
            Event::Comment(e) => {
                let content = String::from_utf8_lossy(&e).into_owned();
                doc.append_comment(top, &content);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if open.len() > 1 {
        return Err(syntax(text.len(), "unexpected end of document".into()));
    }
    if doc.document_element().is_none() {
        return Err(DocumentError::NoRootElement(path.map(Path::to_path_buf)));
    }
    Ok(doc)
}

fn read_element(
    reader: &NsReader<&[u8]>,
    ns: Option<String>,
    start: &BytesStart,
) -> Result<Element, String> {
    let prefix = start
        .name()
        .prefix()
        .map(|p| String::from_utf8_lossy(p.as_ref()).into_owned());
    let local = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
    let mut element = Element::new(QName { ns, prefix, local });

    for attr in start.attributes() {
        let attr = attr.map_err(|e| e.to_string())?;
        if let Some(declaration) = attr.key.as_namespace_binding() {
            let prefix = match declaration {
                PrefixDeclaration::Default => None,
                PrefixDeclaration::Named(p) => Some(String::from_utf8_lossy(p).into_owned()),
            };
            let uri = attr.unescape_value().map_err(|e| e.to_string())?.into_owned();
            element.namespaces.push((prefix, uri));
            continue;
        }
        let (resolved, local) = reader.resolve_attribute(attr.key);
        let ns = match resolved {
            ResolveResult::Bound(ns) => Some(String::from_utf8_lossy(ns.as_ref()).into_owned()),
            ResolveResult::Unbound => None,
            ResolveResult::Unknown(prefix) => {
                let prefix = String::from_utf8_lossy(&prefix).into_owned();
                if prefix == "xml" {
                    Some(XML_NS.to_string())
                } else {
                    return Err(format!("unbound prefix `{prefix}`"));
                }
            }
        };
        let prefix = attr
            .key
            .prefix()
            .map(|p| String::from_utf8_lossy(p.as_ref()).into_owned());
        let value = attr.unescape_value().map_err(|e| e.to_string())?.into_owned();
        element.attributes.push(Attribute {
            name: QName {
                ns,
                prefix,
                local: String::from_utf8_lossy(local.as_ref()).into_owned(),
            },
            value,
        });
    }
    Ok(element)
}
