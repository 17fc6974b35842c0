//! Built-in stylesheet engine: a practical XSLT 1.0 subset.
//!
//! Supported top-level elements: `xsl:template` (`match` and/or `name`,
//! optional `priority`), `xsl:param` and `xsl:variable`; `xsl:output`,
//! `xsl:strip-space` and `xsl:preserve-space` are accepted and ignored.
//!
//! Match patterns are unions (`|`) of `/`, `name`, `prefix:name`, `*`,
//! `prefix:*`, `text()`, `comment()` and `node()`. When several templates
//! match, the highest priority wins and ties go to the template defined
//! last. Default priorities: `0` for names, `-0.25` for `prefix:*`, `-0.5`
//! for the other tests.
//!
//! Instructions: `apply-templates`, `call-template`, `with-param`, `param`
//! (leading a template), `value-of`, `copy-of`, `copy`, `for-each`, `sort`,
//! `if`, `choose`/`when`/`otherwise`, `text`, `element`, `attribute`,
//! `comment` and `variable`. Literal result elements accept attribute value
//! templates (`{expr}`, with `{{` and `}}` for literal braces).
//!
//! Variables bound with content instead of `select` hold the string value of
//! that content. Top-level `xsl:param` values come from the run's
//! [`Params`] and are always strings.
//!
//! A stylesheet that has neither a `/` template nor a template matching the
//! source's root element produces no output for that source.

use super::{Program, TransformEngine, TransformError};
use crate::params::Params;
use crate::xml::{
    CompiledPath, Document, Namespaces, NodeId, NodeKind, NodeRef, PathError, QName, Value,
    Variables,
};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Namespace of stylesheet instructions.
pub const XSL_NS: &str = "http://www.w3.org/1999/XSL/Transform";

/// Nesting limit for template application and named-template calls. Must
/// trip before a [`STACK_SIZE`](super::STACK_SIZE) stack runs out in an
/// unoptimized build.
const MAX_DEPTH: usize = 100;

/// Compiles stylesheet files into [`Stylesheet`] programs.
///
/// `namespaces` are the site-wide prefix bindings; a stylesheet's own
/// declarations take precedence over them.
#[derive(Debug, Clone, Default)]
pub struct StylesheetEngine {
    namespaces: Namespaces,
}

impl StylesheetEngine {
    pub fn new(namespaces: Namespaces) -> Self {
        Self { namespaces }
    }
}

impl TransformEngine for StylesheetEngine {
    fn compile(&self, path: &Path) -> Result<Box<dyn Program>, TransformError> {
        let doc = Document::parse_file(path)?;
        Ok(Box::new(Stylesheet::compile(&doc, path, &self.namespaces)?))
    }
}

// =============================================================================
// Compiled form
// =============================================================================

#[derive(Debug)]
enum Pattern {
    Root,
    Name { ns: Option<String>, local: String },
    NamespaceAny(String),
    AnyElement,
    Text,
    Comment,
    AnyNode,
}

impl Pattern {
    fn default_priority(&self) -> f64 {
        match self {
            Pattern::Root | Pattern::Name { .. } => 0.0,
            Pattern::NamespaceAny(_) => -0.25,
            _ => -0.5,
        }
    }

    fn matches(&self, doc: &Document, node: NodeRef) -> bool {
        let NodeRef::Node(id) = node else {
            return false;
        };
        match (self, doc.kind(id)) {
            (Pattern::Root, NodeKind::Document) => true,
            (Pattern::Name { ns, local }, NodeKind::Element(e)) => e.name.is(ns.as_deref(), local),
            (Pattern::NamespaceAny(ns), NodeKind::Element(e)) => {
                e.name.ns.as_deref() == Some(ns.as_str())
            }
            (Pattern::AnyElement, NodeKind::Element(_)) => true,
            (Pattern::Text, NodeKind::Text(_)) => true,
            (Pattern::Comment, NodeKind::Comment(_)) => true,
            (Pattern::AnyNode, kind) => !matches!(kind, NodeKind::Document),
            _ => false,
        }
    }
}

#[derive(Debug)]
struct MatchRule {
    pattern: Pattern,
    priority: f64,
    template: usize,
}

#[derive(Debug)]
struct Template {
    params: Vec<Binding>,
    body: Vec<Instruction>,
}

#[derive(Debug)]
struct Binding {
    name: String,
    value: VarValue,
}

#[derive(Debug)]
enum VarValue {
    Select(CompiledPath),
    Content(Vec<Instruction>),
    Empty,
}

#[derive(Debug)]
enum AvtPart {
    Literal(String),
    Expr(CompiledPath),
}

type Avt = Vec<AvtPart>;

#[derive(Debug)]
struct SortKey {
    select: CompiledPath,
    descending: bool,
    numeric: bool,
}

#[derive(Debug)]
enum Instruction {
    Text(String),
    Literal {
        name: QName,
        attributes: Vec<(QName, Avt)>,
        body: Vec<Instruction>,
    },
    ApplyTemplates {
        select: Option<CompiledPath>,
        sort: Vec<SortKey>,
        args: Vec<Binding>,
    },
    CallTemplate {
        template: usize,
        args: Vec<Binding>,
    },
    ValueOf(CompiledPath),
    CopyOf(CompiledPath),
    Copy(Vec<Instruction>),
    ForEach {
        select: CompiledPath,
        sort: Vec<SortKey>,
        body: Vec<Instruction>,
    },
    If {
        test: CompiledPath,
        body: Vec<Instruction>,
    },
    Choose {
        whens: Vec<(CompiledPath, Vec<Instruction>)>,
        otherwise: Vec<Instruction>,
    },
    Element {
        name: Avt,
        namespace: Option<Avt>,
        scope: Namespaces,
        body: Vec<Instruction>,
    },
    Attribute {
        name: Avt,
        namespace: Option<Avt>,
        scope: Namespaces,
        body: Vec<Instruction>,
    },
    Comment(Vec<Instruction>),
    Variable(Binding),
}

/// A compiled stylesheet.
#[derive(Debug)]
pub struct Stylesheet {
    path: PathBuf,
    globals: Vec<Global>,
    templates: Vec<Template>,
    rules: Vec<MatchRule>,
}

#[derive(Debug)]
struct Global {
    binding: Binding,
    is_param: bool,
}

// =============================================================================
// Compilation
// =============================================================================

struct Compiler<'a> {
    doc: &'a Document,
    path: &'a Path,
    defaults: &'a Namespaces,
    named: HashMap<String, usize>,
}

fn is_xsl(doc: &Document, id: NodeId, local: &str) -> bool {
    doc.element(id).is_some_and(|e| e.name.is(Some(XSL_NS), local))
}

impl Stylesheet {
    /// Compile a parsed stylesheet. `path` is used in error messages.
    pub fn compile(
        doc: &Document,
        path: &Path,
        namespaces: &Namespaces,
    ) -> Result<Self, TransformError> {
        let mut compiler = Compiler {
            doc,
            path,
            defaults: namespaces,
            named: HashMap::new(),
        };
        let root = doc
            .document_element()
            .filter(|&r| is_xsl(doc, r, "stylesheet") || is_xsl(doc, r, "transform"))
            .ok_or_else(|| compiler.invalid("root element must be xsl:stylesheet"))?;

        let top: Vec<NodeId> = doc
            .children(root)
            .iter()
            .copied()
            .filter(|&c| doc.element(c).is_some())
            .collect();

        // Names first, so call-template can refer forward.
        let mut template_count = 0;
        for &child in &top {
            if is_xsl(doc, child, "template") {
                if let Some(name) = compiler.attr(child, "name") {
                    compiler.named.insert(name.to_string(), template_count);
                }
                template_count += 1;
            }
        }

        let mut sheet = Stylesheet {
            path: path.to_path_buf(),
            globals: Vec::new(),
            templates: Vec::new(),
            rules: Vec::new(),
        };

        for child in top {
            let Some(element) = doc.element(child) else {
                continue;
            };
            if element.name.ns.as_deref() != Some(XSL_NS) {
                continue;
            }
            match element.name.local.as_str() {
                "template" => {
                    let index = sheet.templates.len();
                    let match_attr = compiler.attr(child, "match");
                    if match_attr.is_none() && compiler.attr(child, "name").is_none() {
                        return Err(compiler.invalid("xsl:template needs match or name"));
                    }
                    if let Some(patterns) = match_attr {
                        let explicit = compiler
                            .attr(child, "priority")
                            .map(|p| {
                                p.trim().parse::<f64>().map_err(|_| {
                                    compiler.invalid(format!("invalid priority `{p}`"))
                                })
                            })
                            .transpose()?;
                        for pattern in compiler.patterns(child, patterns)? {
                            sheet.rules.push(MatchRule {
                                priority: explicit.unwrap_or_else(|| pattern.default_priority()),
                                pattern,
                                template: index,
                            });
                        }
                    }
                    sheet.templates.push(compiler.template(child)?);
                }
                "param" | "variable" => {
                    sheet.globals.push(Global {
                        is_param: element.name.local == "param",
                        binding: compiler.binding(child)?,
                    });
                }
                "output" | "strip-space" | "preserve-space" => {}
                other => {
                    return Err(compiler.invalid(format!("unsupported top-level element xsl:{other}")));
                }
            }
        }
        Ok(sheet)
    }

    fn find(&self, doc: &Document, node: NodeRef) -> Option<usize> {
        self.rules
            .iter()
            .filter(|r| r.pattern.matches(doc, node))
            .max_by(|a, b| a.priority.total_cmp(&b.priority))
            .map(|r| r.template)
    }
}

impl<'a> Compiler<'a> {
    fn invalid(&self, message: impl Into<String>) -> TransformError {
        TransformError::Invalid {
            program: self.path.to_path_buf(),
            message: message.into(),
        }
    }

    fn attr(&self, id: NodeId, name: &str) -> Option<&'a str> {
        self.doc.element(id).and_then(|e| e.attribute(name))
    }

    fn required(&self, id: NodeId, name: &str) -> Result<&'a str, TransformError> {
        self.attr(id, name).ok_or_else(|| {
            let tag = self
                .doc
                .element(id)
                .map(|e| e.name.qualified())
                .unwrap_or_default();
            self.invalid(format!("{tag} is missing the `{name}` attribute"))
        })
    }

    /// Site bindings overlaid with the declarations in scope at `id`.
    fn scope(&self, id: NodeId) -> Namespaces {
        let mut ns = self.defaults.clone();
        for (prefix, uri) in self.doc.in_scope_namespaces(id) {
            if let Some(prefix) = prefix {
                ns.insert(prefix, uri);
            }
        }
        ns
    }

    fn path(&self, id: NodeId, expr: &str) -> Result<CompiledPath, TransformError> {
        CompiledPath::compile(expr, &self.scope(id)).map_err(|source| TransformError::Path {
            program: self.path.to_path_buf(),
            source,
        })
    }

    fn patterns(&self, id: NodeId, text: &str) -> Result<Vec<Pattern>, TransformError> {
        let scope = self.scope(id);
        let resolve = |prefix: &str| {
            scope.get(prefix).cloned().ok_or_else(|| TransformError::Path {
                program: self.path.to_path_buf(),
                source: PathError::UnknownPrefix(prefix.to_string()),
            })
        };
        text.split('|')
            .map(str::trim)
            .map(|alt| {
                Ok(match alt {
                    "/" => Pattern::Root,
                    "*" => Pattern::AnyElement,
                    "text()" => Pattern::Text,
                    "comment()" => Pattern::Comment,
                    "node()" => Pattern::AnyNode,
                    _ if alt.is_empty() || alt.contains(['/', '[', '@', '(', ' ']) => {
                        return Err(self.invalid(format!("unsupported match pattern `{alt}`")));
                    }
                    _ => match alt.split_once(':') {
                        Some((prefix, "*")) => Pattern::NamespaceAny(resolve(prefix)?),
                        Some((prefix, local)) => Pattern::Name {
                            ns: Some(resolve(prefix)?),
                            local: local.to_string(),
                        },
                        None => Pattern::Name {
                            ns: None,
                            local: alt.to_string(),
                        },
                    },
                })
            })
            .collect()
    }

    fn avt(&self, id: NodeId, text: &str) -> Result<Avt, TransformError> {
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut chars = text.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            match c {
                '{' if chars.peek().map(|&(_, n)| n) == Some('{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek().map(|&(_, n)| n) == Some('}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let start = i + 1;
                    let mut quote: Option<char> = None;
                    let mut end = None;
                    for (j, ch) in chars.by_ref() {
                        match (quote, ch) {
                            (Some(q), ch) if ch == q => quote = None,
                            (Some(_), _) => {}
                            (None, '\'' | '"') => quote = Some(ch),
                            (None, '}') => {
                                end = Some(j);
                                break;
                            }
                            _ => {}
                        }
                    }
                    let end = end.ok_or_else(|| {
                        self.invalid(format!("unterminated `{{` in attribute value `{text}`"))
                    })?;
                    if !literal.is_empty() {
                        parts.push(AvtPart::Literal(std::mem::take(&mut literal)));
                    }
                    parts.push(AvtPart::Expr(self.path(id, &text[start..end])?));
                }
                '}' => {
                    return Err(self.invalid(format!("unmatched `}}` in attribute value `{text}`")));
                }
                _ => literal.push(c),
            }
        }
        if !literal.is_empty() {
            parts.push(AvtPart::Literal(literal));
        }
        Ok(parts)
    }

    fn template(&self, id: NodeId) -> Result<Template, TransformError> {
        let children = self.doc.children(id);
        let mut params = Vec::new();
        let mut rest = 0;
        for (i, &child) in children.iter().enumerate() {
            if is_xsl(self.doc, child, "param") {
                params.push(self.binding(child)?);
                rest = i + 1;
            } else if self.doc.element(child).is_some() || !self.is_ignorable(child) {
                break;
            } else {
                rest = i + 1;
            }
        }
        let body = self.instructions(&children[rest..])?;
        Ok(Template { params, body })
    }

    /// Whitespace-only text and comments in the stylesheet.
    fn is_ignorable(&self, id: NodeId) -> bool {
        match self.doc.kind(id) {
            NodeKind::Text(t) => t.trim().is_empty(),
            NodeKind::Comment(_) => true,
            _ => false,
        }
    }

    fn binding(&self, id: NodeId) -> Result<Binding, TransformError> {
        let name = self.required(id, "name")?.to_string();
        let value = match self.attr(id, "select") {
            Some(select) => VarValue::Select(self.path(id, select)?),
            None if self.doc.children(id).is_empty() => VarValue::Empty,
            None => VarValue::Content(self.body(id)?),
        };
        Ok(Binding { name, value })
    }

    fn body(&self, id: NodeId) -> Result<Vec<Instruction>, TransformError> {
        self.instructions(self.doc.children(id))
    }

    fn instructions(&self, nodes: &[NodeId]) -> Result<Vec<Instruction>, TransformError> {
        let mut out = Vec::new();
        for &node in nodes {
            if self.is_ignorable(node) {
                continue;
            }
            match self.doc.kind(node) {
                NodeKind::Text(t) => out.push(Instruction::Text(t.clone())),
                NodeKind::Element(e) if e.name.ns.as_deref() == Some(XSL_NS) => {
                    out.push(self.instruction(node, &e.name.local)?);
                }
                NodeKind::Element(e) => {
                    let mut attributes = Vec::new();
                    for attr in &e.attributes {
                        if attr.name.ns.as_deref() == Some(XSL_NS) {
                            continue;
                        }
                        attributes.push((attr.name.clone(), self.avt(node, &attr.value)?));
                    }
                    out.push(Instruction::Literal {
                        name: e.name.clone(),
                        attributes,
                        body: self.body(node)?,
                    });
                }
                _ => {}
            }
        }
        Ok(out)
    }

    fn sort_key(&self, id: NodeId) -> Result<SortKey, TransformError> {
        Ok(SortKey {
            select: self.path(id, self.attr(id, "select").unwrap_or("."))?,
            descending: self.attr(id, "order") == Some("descending"),
            numeric: self.attr(id, "data-type") == Some("number"),
        })
    }

    /// Leading `xsl:sort` children, and the index of the first other child.
    fn sort_keys(&self, id: NodeId) -> Result<(Vec<SortKey>, usize), TransformError> {
        let children = self.doc.children(id);
        let mut keys = Vec::new();
        let mut rest = 0;
        for (i, &child) in children.iter().enumerate() {
            if is_xsl(self.doc, child, "sort") {
                keys.push(self.sort_key(child)?);
                rest = i + 1;
            } else if self.is_ignorable(child) {
                rest = i + 1;
            } else {
                break;
            }
        }
        Ok((keys, rest))
    }

    fn args(&self, id: NodeId) -> Result<Vec<Binding>, TransformError> {
        self.doc
            .children(id)
            .iter()
            .filter(|&&c| is_xsl(self.doc, c, "with-param"))
            .map(|&c| self.binding(c))
            .collect()
    }

    fn instruction(&self, id: NodeId, local: &str) -> Result<Instruction, TransformError> {
        Ok(match local {
            "apply-templates" => {
                // xsl:sort and xsl:with-param may come in any order here
                let sort = self
                    .doc
                    .children(id)
                    .iter()
                    .filter(|&&c| is_xsl(self.doc, c, "sort"))
                    .map(|&c| self.sort_key(c))
                    .collect::<Result<_, _>>()?;
                Instruction::ApplyTemplates {
                    select: self
                        .attr(id, "select")
                        .map(|s| self.path(id, s))
                        .transpose()?,
                    sort,
                    args: self.args(id)?,
                }
            }
            "call-template" => {
                let name = self.required(id, "name")?;
                let template = *self
                    .named
                    .get(name)
                    .ok_or_else(|| self.invalid(format!("no template named `{name}`")))?;
                Instruction::CallTemplate {
                    template,
                    args: self.args(id)?,
                }
            }
            "value-of" => Instruction::ValueOf(self.path(id, self.required(id, "select")?)?),
            "copy-of" => Instruction::CopyOf(self.path(id, self.required(id, "select")?)?),
            "copy" => Instruction::Copy(self.body(id)?),
            "for-each" => {
                let (sort, rest) = self.sort_keys(id)?;
                Instruction::ForEach {
                    select: self.path(id, self.required(id, "select")?)?,
                    sort,
                    body: self.instructions(&self.doc.children(id)[rest..])?,
                }
            }
            "if" => Instruction::If {
                test: self.path(id, self.required(id, "test")?)?,
                body: self.body(id)?,
            },
            "choose" => {
                let mut whens = Vec::new();
                let mut otherwise = Vec::new();
                for &child in self.doc.children(id) {
                    if is_xsl(self.doc, child, "when") {
                        whens.push((
                            self.path(child, self.required(child, "test")?)?,
                            self.body(child)?,
                        ));
                    } else if is_xsl(self.doc, child, "otherwise") {
                        otherwise = self.body(child)?;
                    } else if !self.is_ignorable(child) {
                        return Err(self.invalid("xsl:choose may only contain xsl:when and xsl:otherwise"));
                    }
                }
                if whens.is_empty() {
                    return Err(self.invalid("xsl:choose needs at least one xsl:when"));
                }
                Instruction::Choose { whens, otherwise }
            }
            "text" => Instruction::Text(self.doc.string_value(id)),
            "element" | "attribute" => {
                let name = self.avt(id, self.required(id, "name")?)?;
                let namespace = self
                    .attr(id, "namespace")
                    .map(|n| self.avt(id, n))
                    .transpose()?;
                let scope = self.scope(id);
                let body = self.body(id)?;
                if local == "element" {
                    Instruction::Element {
                        name,
                        namespace,
                        scope,
                        body,
                    }
                } else {
                    Instruction::Attribute {
                        name,
                        namespace,
                        scope,
                        body,
                    }
                }
            }
            "comment" => Instruction::Comment(self.body(id)?),
            "variable" => Instruction::Variable(self.binding(id)?),
            "param" => return Err(self.invalid("xsl:param must lead its template")),
            other => return Err(self.invalid(format!("unsupported instruction xsl:{other}"))),
        })
    }
}

// =============================================================================
// Execution
// =============================================================================

#[derive(Clone)]
struct Frame {
    node: NodeRef,
    position: usize,
    size: usize,
    vars: Rc<Variables>,
}

impl Frame {
    fn with_var(&self, name: &str, value: Value) -> Frame {
        let mut vars = (*self.vars).clone();
        vars.insert(name.to_string(), value);
        Frame {
            vars: Rc::new(vars),
            ..self.clone()
        }
    }
}

struct Exec<'a> {
    sheet: &'a Stylesheet,
    source: &'a Document,
    out: Document,
    globals: Rc<Variables>,
    depth: usize,
}

enum SortValue {
    Text(String),
    Number(f64),
}

fn compare_sort_values(a: &[SortValue], b: &[SortValue], keys: &[SortKey]) -> Ordering {
    for ((x, y), key) in a.iter().zip(b).zip(keys) {
        let ord = match (x, y) {
            (SortValue::Number(x), SortValue::Number(y)) => x
                .partial_cmp(y)
                .unwrap_or_else(|| x.is_nan().cmp(&y.is_nan()).reverse()),
            (SortValue::Text(x), SortValue::Text(y)) => x.cmp(y),
            _ => Ordering::Equal,
        };
        let ord = if key.descending { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

impl Program for Stylesheet {
    fn run(&self, source: &Document, params: &Params) -> Result<Option<Document>, TransformError> {
        let root = NodeRef::Node(Document::ROOT);
        let handles_root = self.find(source, root).is_some()
            || source
                .document_element()
                .is_some_and(|e| self.find(source, NodeRef::Node(e)).is_some());
        if !handles_root {
            return Ok(None);
        }

        let mut exec = Exec {
            sheet: self,
            source,
            out: Document::new(),
            globals: Rc::new(Variables::new()),
            depth: 0,
        };
        exec.bind_globals(params)?;
        exec.apply_one(root, (1, 1), &Variables::new(), Document::ROOT)?;

        let mut out = exec.out;
        out.compact();
        Ok(Some(out))
    }
}

impl Exec<'_> {
    fn runtime(&self, message: impl Into<String>) -> TransformError {
        TransformError::Runtime {
            program: self.sheet.path.clone(),
            message: message.into(),
        }
    }

    fn path_error(&self, source: PathError) -> TransformError {
        TransformError::Path {
            program: self.sheet.path.clone(),
            source,
        }
    }

    fn root_frame(&self) -> Frame {
        Frame {
            node: NodeRef::Node(Document::ROOT),
            position: 1,
            size: 1,
            vars: Rc::clone(&self.globals),
        }
    }

    fn bind_globals(&mut self, params: &Params) -> Result<(), TransformError> {
        let sheet = self.sheet;
        for global in &sheet.globals {
            let name = &global.binding.name;
            let value = match params.get(name) {
                Some(value) if global.is_param => Value::String(value.to_string()),
                _ => {
                    let frame = self.root_frame();
                    self.var_value(&global.binding.value, &frame)?
                }
            };
            let mut vars = (*self.globals).clone();
            vars.insert(name.clone(), value);
            self.globals = Rc::new(vars);
        }
        Ok(())
    }

    fn eval(&self, path: &CompiledPath, frame: &Frame) -> Result<Value, TransformError> {
        path.evaluate_at(
            self.source,
            frame.node,
            (frame.position, frame.size),
            &frame.vars,
        )
        .map_err(|e| self.path_error(e))
    }

    fn nodes(&self, path: &CompiledPath, frame: &Frame) -> Result<Vec<NodeRef>, TransformError> {
        self.eval(path, frame)?
            .into_nodes()
            .map_err(|e| self.path_error(e))
    }

    fn string(&self, path: &CompiledPath, frame: &Frame) -> Result<String, TransformError> {
        Ok(self.eval(path, frame)?.to_string_value(self.source))
    }

    fn avt(&self, avt: &Avt, frame: &Frame) -> Result<String, TransformError> {
        let mut out = String::new();
        for part in avt {
            match part {
                AvtPart::Literal(s) => out.push_str(s),
                AvtPart::Expr(path) => out.push_str(&self.string(path, frame)?),
            }
        }
        Ok(out)
    }

    fn var_value(&mut self, value: &VarValue, frame: &Frame) -> Result<Value, TransformError> {
        Ok(match value {
            VarValue::Select(path) => self.eval(path, frame)?,
            VarValue::Content(body) => Value::String(self.content_string(body, frame)?),
            VarValue::Empty => Value::String(String::new()),
        })
    }

    /// Run `body` into a detached holder and return its string value.
    fn content_string(&mut self, body: &[Instruction], frame: &Frame) -> Result<String, TransformError> {
        let holder = self.out.create(NodeKind::Document);
        self.exec_body(body, frame, holder)?;
        Ok(self.out.string_value(holder))
    }

    fn bind_args(&mut self, args: &[Binding], frame: &Frame) -> Result<Variables, TransformError> {
        let mut bound = Variables::new();
        for arg in args {
            let value = self.var_value(&arg.value, frame)?;
            bound.insert(arg.name.clone(), value);
        }
        Ok(bound)
    }

    fn sorted(
        &self,
        nodes: Vec<NodeRef>,
        keys: &[SortKey],
        frame: &Frame,
    ) -> Result<Vec<NodeRef>, TransformError> {
        if keys.is_empty() {
            return Ok(nodes);
        }
        let size = nodes.len();
        let mut keyed = Vec::with_capacity(size);
        for (i, node) in nodes.into_iter().enumerate() {
            let inner = Frame {
                node,
                position: i + 1,
                size,
                vars: Rc::clone(&frame.vars),
            };
            let mut values = Vec::with_capacity(keys.len());
            for key in keys {
                let text = self.string(&key.select, &inner)?;
                values.push(if key.numeric {
                    SortValue::Number(text.trim().parse().unwrap_or(f64::NAN))
                } else {
                    SortValue::Text(text)
                });
            }
            keyed.push((values, node));
        }
        keyed.sort_by(|a, b| compare_sort_values(&a.0, &b.0, keys));
        Ok(keyed.into_iter().map(|(_, node)| node).collect())
    }

    fn apply_one(
        &mut self,
        node: NodeRef,
        (position, size): (usize, usize),
        args: &Variables,
        parent: NodeId,
    ) -> Result<(), TransformError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.runtime("template nesting too deep (runaway recursion?)"));
        }
        let result = match self.sheet.find(self.source, node) {
            Some(template) => self.invoke(template, node, (position, size), args, parent),
            None => self.builtin(node, parent),
        };
        self.depth -= 1;
        result
    }

    fn builtin(&mut self, node: NodeRef, parent: NodeId) -> Result<(), TransformError> {
        match node {
            NodeRef::Attribute(..) => {
                let value = self.source.ref_string_value(node);
                self.out.append_text(parent, &value);
            }
            NodeRef::Node(id) => match self.source.kind(id) {
                NodeKind::Document | NodeKind::Element(_) => {
                    let children: Vec<NodeRef> =
                        self.source.children(id).iter().map(|&c| NodeRef::Node(c)).collect();
                    self.apply_all(children, &Variables::new(), parent)?;
                }
                NodeKind::Text(t) => self.out.append_text(parent, t),
                NodeKind::Comment(_) => {}
            },
        }
        Ok(())
    }

    fn apply_all(
        &mut self,
        nodes: Vec<NodeRef>,
        args: &Variables,
        parent: NodeId,
    ) -> Result<(), TransformError> {
        let size = nodes.len();
        for (i, node) in nodes.into_iter().enumerate() {
            self.apply_one(node, (i + 1, size), args, parent)?;
        }
        Ok(())
    }

    fn invoke(
        &mut self,
        template: usize,
        node: NodeRef,
        (position, size): (usize, usize),
        args: &Variables,
        parent: NodeId,
    ) -> Result<(), TransformError> {
        let sheet = self.sheet;
        let template = &sheet.templates[template];
        let mut frame = Frame {
            node,
            position,
            size,
            vars: Rc::clone(&self.globals),
        };
        for param in &template.params {
            let value = match args.get(&param.name) {
                Some(value) => value.clone(),
                None => self.var_value(&param.value, &frame)?,
            };
            frame = frame.with_var(&param.name, value);
        }
        self.exec_body(&template.body, &frame, parent)
    }

    fn exec_body(
        &mut self,
        body: &[Instruction],
        frame: &Frame,
        parent: NodeId,
    ) -> Result<(), TransformError> {
        let mut scoped: Option<Frame> = None;
        for instruction in body {
            let current = scoped.as_ref().unwrap_or(frame);
            if let Instruction::Variable(binding) = instruction {
                let value = self.var_value(&binding.value, current)?;
                let next = current.with_var(&binding.name, value);
                scoped = Some(next);
                continue;
            }
            self.exec(instruction, current, parent)?;
        }
        Ok(())
    }

    fn qname(
        &self,
        name: &str,
        namespace: Option<String>,
        scope: &Namespaces,
    ) -> Result<QName, TransformError> {
        let (prefix, local) = match name.split_once(':') {
            Some((p, l)) => (Some(p), l),
            None => (None, name),
        };
        if local.is_empty() {
            return Err(self.runtime(format!("invalid name `{name}`")));
        }
        let ns = match (namespace, prefix) {
            (Some(ns), _) if ns.is_empty() => None,
            (Some(ns), _) => Some(ns),
            (None, Some(p)) => Some(
                scope
                    .get(p)
                    .cloned()
                    .ok_or_else(|| self.runtime(format!("unknown prefix `{p}` in name `{name}`")))?,
            ),
            (None, None) => None,
        };
        Ok(match ns {
            Some(ns) => QName::with_ns(ns, prefix, local),
            None => QName::local(local),
        })
    }

    fn exec(
        &mut self,
        instruction: &Instruction,
        frame: &Frame,
        parent: NodeId,
    ) -> Result<(), TransformError> {
        match instruction {
            Instruction::Text(text) => self.out.append_text(parent, text),
            Instruction::Literal {
                name,
                attributes,
                body,
            } => {
                let element = self.out.append_element(parent, name.clone());
                for (attr_name, avt) in attributes {
                    let value = self.avt(avt, frame)?;
                    self.out.set_attribute(element, attr_name.clone(), value);
                }
                self.exec_body(body, frame, element)?;
            }
            Instruction::ApplyTemplates { select, sort, args } => {
                let nodes = match select {
                    Some(path) => self.nodes(path, frame)?,
                    None => match frame.node {
                        NodeRef::Node(id) => self
                            .source
                            .children(id)
                            .iter()
                            .map(|&c| NodeRef::Node(c))
                            .collect(),
                        NodeRef::Attribute(..) => Vec::new(),
                    },
                };
                let nodes = self.sorted(nodes, sort, frame)?;
                let args = self.bind_args(args, frame)?;
                self.apply_all(nodes, &args, parent)?;
            }
            Instruction::CallTemplate { template, args } => {
                let args = self.bind_args(args, frame)?;
                self.depth += 1;
                if self.depth > MAX_DEPTH {
                    return Err(self.runtime("template nesting too deep (runaway recursion?)"));
                }
                let result = self.invoke(
                    *template,
                    frame.node,
                    (frame.position, frame.size),
                    &args,
                    parent,
                );
                self.depth -= 1;
                result?;
            }
            Instruction::ValueOf(path) => {
                let text = self.string(path, frame)?;
                self.out.append_text(parent, &text);
            }
            Instruction::CopyOf(path) => match self.eval(path, frame)? {
                Value::Nodes(nodes) => {
                    for node in nodes {
                        self.copy_node(node, parent);
                    }
                }
                other => {
                    let text = other.to_string_value(self.source);
                    self.out.append_text(parent, &text);
                }
            },
            Instruction::Copy(body) => match frame.node {
                NodeRef::Node(id) => match self.source.kind(id) {
                    NodeKind::Document => self.exec_body(body, frame, parent)?,
                    NodeKind::Element(e) => {
                        let element = self.out.append_element(parent, e.name.clone());
                        self.exec_body(body, frame, element)?;
                    }
                    NodeKind::Text(_) | NodeKind::Comment(_) => self.copy_node(frame.node, parent),
                },
                NodeRef::Attribute(..) => self.copy_node(frame.node, parent),
            },
            Instruction::ForEach { select, sort, body } => {
                let nodes = self.nodes(select, frame)?;
                let nodes = self.sorted(nodes, sort, frame)?;
                let size = nodes.len();
                for (i, node) in nodes.into_iter().enumerate() {
                    let inner = Frame {
                        node,
                        position: i + 1,
                        size,
                        vars: Rc::clone(&frame.vars),
                    };
                    self.exec_body(body, &inner, parent)?;
                }
            }
            Instruction::If { test, body } => {
                if self.eval(test, frame)?.to_boolean() {
                    self.exec_body(body, frame, parent)?;
                }
            }
            Instruction::Choose { whens, otherwise } => {
                let mut chosen: &[Instruction] = otherwise;
                for (test, body) in whens {
                    if self.eval(test, frame)?.to_boolean() {
                        chosen = body;
                        break;
                    }
                }
                self.exec_body(chosen, frame, parent)?;
            }
            Instruction::Element {
                name,
                namespace,
                scope,
                body,
            } => {
                let name = self.avt(name, frame)?;
                let namespace = namespace.as_ref().map(|n| self.avt(n, frame)).transpose()?;
                let qname = self.qname(&name, namespace, scope)?;
                let element = self.out.append_element(parent, qname);
                self.exec_body(body, frame, element)?;
            }
            Instruction::Attribute {
                name,
                namespace,
                scope,
                body,
            } => {
                if self.out.element(parent).is_none() {
                    return Err(self.runtime("xsl:attribute used outside an element"));
                }
                let name = self.avt(name, frame)?;
                let namespace = namespace.as_ref().map(|n| self.avt(n, frame)).transpose()?;
                let qname = self.qname(&name, namespace, scope)?;
                let value = self.content_string(body, frame)?;
                self.out.set_attribute(parent, qname, value);
            }
            Instruction::Comment(body) => {
                let text = self.content_string(body, frame)?;
                self.out.append_comment(parent, &text);
            }
            // Bound by exec_body before dispatch.
            Instruction::Variable(_) => {}
        }
        Ok(())
    }

    fn copy_node(&mut self, node: NodeRef, parent: NodeId) {
        match node {
            NodeRef::Node(id) => self.out.import(parent, self.source, id),
            NodeRef::Attribute(owner, i) => {
                if let Some(attr) = self.source.element(owner).and_then(|e| e.attributes.get(i)) {
                    self.out
                        .set_attribute(parent, attr.name.clone(), attr.value.clone());
                }
            }
        }
    }
}
