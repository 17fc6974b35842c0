//! Path expressions: a compact XPath 1.0 subset.
//!
//! Expressions are compiled once against a prefix map ([`Namespaces`]) and
//! evaluated many times. Supported:
//!
//! - location paths, absolute and relative, with `//` abbreviation
//! - axes `child`, `attribute` (`@`), `self` (`.`), `parent` (`..`),
//!   `descendant`, `descendant-or-self`, `ancestor`
//! - node tests `name`, `p:name`, `*`, `p:*`, `text()`, `node()`, `comment()`
//! - predicates (a number selects by position, anything else is a boolean)
//! - `|`, `or`, `and`, `=`, `!=`, `<`, `<=`, `>`, `>=`, literals, `$variables`
//! - functions `string`, `concat`, `normalize-space`, `count`, `name`,
//!   `local-name`, `not`, `true`, `false`, `contains`, `starts-with`,
//!   `position`, `last`, `number`, plus `dirname` and `basename`, which split
//!   a `/` path at its last separator.
//!
//! Unprefixed name tests match elements in no namespace only, as in XPath 1.0.

use super::document::{Document, NodeId, NodeKind};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use thiserror::Error;

/// Prefix → namespace URI bindings used when compiling expressions.
pub type Namespaces = BTreeMap<String, String>;

/// Variable bindings visible to an expression.
pub type Variables = BTreeMap<String, Value>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PathError {
    #[error("syntax error in `{expr}` at offset {offset}: {message}")]
    Syntax {
        expr: String,
        offset: usize,
        message: String,
    },
    #[error("unknown namespace prefix `{0}`")]
    UnknownPrefix(String),
    #[error("unknown function `{0}()`")]
    UnknownFunction(String),
    #[error("function `{name}()` takes {expected} argument(s), got {found}")]
    Arity {
        name: String,
        expected: &'static str,
        found: usize,
    },
    #[error("undefined variable `${0}`")]
    UnknownVariable(String),
    #[error("expected a node-set, got a {0}")]
    NotANodeSet(&'static str),
}

/// A node reachable by path evaluation. Attributes are addressed by their
/// owning element and position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRef {
    Node(NodeId),
    Attribute(NodeId, usize),
}

impl NodeRef {
    /// Document-order key: an element's attributes sort after the element
    /// and before its first child.
    fn order_key(self) -> (usize, usize) {
        match self {
            NodeRef::Node(id) => (id.index(), 0),
            NodeRef::Attribute(id, i) => (id.index(), i + 1),
        }
    }

    /// The tree node itself, or the owning element of an attribute.
    pub fn node_id(self) -> NodeId {
        match self {
            NodeRef::Node(id) | NodeRef::Attribute(id, _) => id,
        }
    }
}

impl Ord for NodeRef {
    fn cmp(&self, other: &Self) -> Ordering {
        self.order_key().cmp(&other.order_key())
    }
}

impl PartialOrd for NodeRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One result of a selection: a node, or a plain string when the
/// expression produced an atomic value.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Node(NodeRef),
    Text(String),
}

/// An expression result.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nodes(Vec<NodeRef>),
    String(String),
    Number(f64),
    Boolean(bool),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Nodes(_) => "node-set",
            Value::String(_) => "string",
            Value::Number(_) => "number",
            Value::Boolean(_) => "boolean",
        }
    }

    pub fn to_string_value(&self, doc: &Document) -> String {
        match self {
            Value::Nodes(nodes) => nodes
                .first()
                .map(|&n| doc.ref_string_value(n))
                .unwrap_or_default(),
            Value::String(s) => s.clone(),
            Value::Number(n) => format_number(*n),
            Value::Boolean(b) => b.to_string(),
        }
    }

    pub fn to_number(&self, doc: &Document) -> f64 {
        match self {
            Value::Number(n) => *n,
            Value::Boolean(b) => f64::from(u8::from(*b)),
            other => parse_number(&other.to_string_value(doc)),
        }
    }

    pub fn to_boolean(&self) -> bool {
        match self {
            Value::Nodes(nodes) => !nodes.is_empty(),
            Value::String(s) => !s.is_empty(),
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::Boolean(b) => *b,
        }
    }

    pub fn into_nodes(self) -> Result<Vec<NodeRef>, PathError> {
        match self {
            Value::Nodes(nodes) => Ok(nodes),
            other => Err(PathError::NotANodeSet(other.type_name())),
        }
    }
}

fn parse_number(s: &str) -> f64 {
    s.trim().parse::<f64>().unwrap_or(f64::NAN)
}

fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

impl Document {
    /// String value of an element, text, comment or attribute reference.
    pub fn ref_string_value(&self, node: NodeRef) -> String {
        match node {
            NodeRef::Node(id) => self.string_value(id),
            NodeRef::Attribute(id, i) => self
                .element(id)
                .and_then(|e| e.attributes.get(i))
                .map(|a| a.value.clone())
                .unwrap_or_default(),
        }
    }

    /// String value of a selection item.
    pub fn item_string(&self, item: &Item) -> String {
        match item {
            Item::Node(node) => self.ref_string_value(*node),
            Item::Text(text) => text.clone(),
        }
    }

    /// Compile and evaluate `expr` against the document node.
    pub fn evaluate(&self, expr: &str, namespaces: &Namespaces) -> Result<Vec<Item>, PathError> {
        let path = CompiledPath::compile(expr, namespaces)?;
        path.select(self, NodeRef::Node(Self::ROOT), &Variables::new())
    }
}

// =============================================================================
// Syntax tree
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum Axis {
    Child,
    Attribute,
    SelfNode,
    Parent,
    Descendant,
    DescendantOrSelf,
    Ancestor,
}

#[derive(Debug, Clone, PartialEq)]
enum NodeTest {
    AnyName,
    Name { ns: Option<String>, local: String },
    NamespaceAny(String),
    Text,
    Comment,
    Node,
}

#[derive(Debug, Clone, PartialEq)]
struct Step {
    axis: Axis,
    test: NodeTest,
    predicates: Vec<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Function {
    String,
    Concat,
    NormalizeSpace,
    Count,
    Name,
    LocalName,
    Not,
    True,
    False,
    Contains,
    StartsWith,
    Position,
    Last,
    Number,
    Dirname,
    Basename,
}

impl Function {
    fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "string" => Self::String,
            "concat" => Self::Concat,
            "normalize-space" => Self::NormalizeSpace,
            "count" => Self::Count,
            "name" => Self::Name,
            "local-name" => Self::LocalName,
            "not" => Self::Not,
            "true" => Self::True,
            "false" => Self::False,
            "contains" => Self::Contains,
            "starts-with" => Self::StartsWith,
            "position" => Self::Position,
            "last" => Self::Last,
            "number" => Self::Number,
            "dirname" => Self::Dirname,
            "basename" => Self::Basename,
            _ => return None,
        })
    }

    /// Accepted argument counts as (min, max, description).
    fn arity(self) -> (usize, usize, &'static str) {
        match self {
            Self::True | Self::False | Self::Position | Self::Last => (0, 0, "0"),
            Self::String | Self::NormalizeSpace | Self::Name | Self::LocalName | Self::Number => {
                (0, 1, "0 or 1")
            }
            Self::Count | Self::Not | Self::Dirname | Self::Basename => (1, 1, "1"),
            Self::Contains | Self::StartsWith => (2, 2, "2"),
            Self::Concat => (2, usize::MAX, "2 or more"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
    Union(Box<Expr>, Box<Expr>),
    Literal(String),
    Number(f64),
    Variable(String),
    Call(Function, Vec<Expr>),
    Path { absolute: bool, steps: Vec<Step> },
    Filter {
        primary: Box<Expr>,
        predicates: Vec<Expr>,
        steps: Vec<Step>,
    },
}

// =============================================================================
// Tokenizer
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Slash,
    DoubleSlash,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    DotDot,
    At,
    Comma,
    Pipe,
    Dollar,
    ColonColon,
    Star,
    Op(CompareOp),
    Literal(String),
    Number(f64),
    /// An NCName or `prefix:local`; `prefix:*` is `Name("prefix:*")`.
    Name(String),
}

fn is_name_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.')
}

fn tokenize(src: &str) -> Result<Vec<(usize, Token)>, PathError> {
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let error = |offset: usize, message: &str| PathError::Syntax {
        expr: src.to_string(),
        offset,
        message: message.to_string(),
    };
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];
        let next = chars.get(i + 1).map(|&(_, c)| c);
        let token = match c {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '/' if next == Some('/') => {
                i += 2;
                Token::DoubleSlash
            }
            '/' => {
                i += 1;
                Token::Slash
            }
            '(' => {
                i += 1;
                Token::LParen
            }
            ')' => {
                i += 1;
                Token::RParen
            }
            '[' => {
                i += 1;
                Token::LBracket
            }
            ']' => {
                i += 1;
                Token::RBracket
            }
            '@' => {
                i += 1;
                Token::At
            }
            ',' => {
                i += 1;
                Token::Comma
            }
            '|' => {
                i += 1;
                Token::Pipe
            }
            '$' => {
                i += 1;
                Token::Dollar
            }
            '*' => {
                i += 1;
                Token::Star
            }
            ':' if next == Some(':') => {
                i += 2;
                Token::ColonColon
            }
            '=' => {
                i += 1;
                Token::Op(CompareOp::Eq)
            }
            '!' if next == Some('=') => {
                i += 2;
                Token::Op(CompareOp::Ne)
            }
            '<' | '>' => {
                let or_equal = next == Some('=');
                i += if or_equal { 2 } else { 1 };
                Token::Op(match (c, or_equal) {
                    ('<', false) => CompareOp::Lt,
                    ('<', true) => CompareOp::Le,
                    ('>', false) => CompareOp::Gt,
                    _ => CompareOp::Ge,
                })
            }
            '"' | '\'' => {
                let close = chars[i + 1..]
                    .iter()
                    .position(|&(_, ch)| ch == c)
                    .ok_or_else(|| error(offset, "unterminated string literal"))?;
                let literal: String = chars[i + 1..i + 1 + close].iter().map(|&(_, ch)| ch).collect();
                i += close + 2;
                Token::Literal(literal)
            }
            '.' if next == Some('.') => {
                i += 2;
                Token::DotDot
            }
            '.' if !next.is_some_and(|n| n.is_ascii_digit()) => {
                i += 1;
                Token::Dot
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].1.is_ascii_digit() || chars[i].1 == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().map(|&(_, ch)| ch).collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| error(offset, "malformed number"))?;
                Token::Number(value)
            }
            c if is_name_start(c) => {
                let start = i;
                while i < chars.len() && is_name_char(chars[i].1) {
                    i += 1;
                }
                let mut name: String = chars[start..i].iter().map(|&(_, ch)| ch).collect();
                // prefix:local or prefix:* (but not the axis separator `::`)
                if i + 1 < chars.len() && chars[i].1 == ':' && chars[i + 1].1 != ':' {
                    let after = chars[i + 1].1;
                    if after == '*' {
                        name.push_str(":*");
                        i += 2;
                    } else if is_name_start(after) {
                        i += 1;
                        let local_start = i;
                        while i < chars.len() && is_name_char(chars[i].1) {
                            i += 1;
                        }
                        let local: String =
                            chars[local_start..i].iter().map(|&(_, ch)| ch).collect();
                        name.push(':');
                        name.push_str(&local);
                    }
                }
                Token::Name(name)
            }
            _ => return Err(error(offset, &format!("unexpected character `{c}`"))),
        };
        tokens.push((offset, token));
    }
    Ok(tokens)
}

// =============================================================================
// Parser
// =============================================================================

struct Parser<'a> {
    src: &'a str,
    tokens: Vec<(usize, Token)>,
    pos: usize,
    namespaces: &'a Namespaces,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn peek_at(&self, ahead: usize) -> Option<&Token> {
        self.tokens.get(self.pos + ahead).map(|(_, t)| t)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|&(o, _)| o)
            .unwrap_or(self.src.len())
    }

    fn error(&self, message: impl Into<String>) -> PathError {
        PathError::Syntax {
            expr: self.src.to_string(),
            offset: self.offset(),
            message: message.into(),
        }
    }

    fn expect(&mut self, token: Token) -> Result<(), PathError> {
        if self.peek() == Some(&token) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected {token:?}")))
        }
    }

    fn is_keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Name(n)) if n == word)
    }

    fn parse_expr(&mut self) -> Result<Expr, PathError> {
        let mut left = self.parse_and()?;
        while self.is_keyword("or") {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, PathError> {
        let mut left = self.parse_equality()?;
        while self.is_keyword("and") {
            self.pos += 1;
            let right = self.parse_equality()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, PathError> {
        let mut left = self.parse_relational()?;
        while let Some(Token::Op(op @ (CompareOp::Eq | CompareOp::Ne))) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.parse_relational()?;
            left = Expr::Compare(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_relational(&mut self) -> Result<Expr, PathError> {
        let mut left = self.parse_union()?;
        while let Some(Token::Op(op @ (CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge))) =
            self.peek()
        {
            let op = *op;
            self.pos += 1;
            let right = self.parse_union()?;
            left = Expr::Compare(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_union(&mut self) -> Result<Expr, PathError> {
        let mut left = self.parse_path()?;
        while self.peek() == Some(&Token::Pipe) {
            self.pos += 1;
            let right = self.parse_path()?;
            left = Expr::Union(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn starts_primary(&self) -> bool {
        match self.peek() {
            Some(Token::Literal(_) | Token::Number(_) | Token::Dollar | Token::LParen) => true,
            Some(Token::Name(name)) => {
                self.peek_at(1) == Some(&Token::LParen)
                    && !matches!(name.as_str(), "text" | "node" | "comment")
            }
            _ => false,
        }
    }

    fn parse_path(&mut self) -> Result<Expr, PathError> {
        if self.starts_primary() {
            let primary = self.parse_primary()?;
            let predicates = self.parse_predicates()?;
            let steps = match self.peek() {
                Some(Token::Slash | Token::DoubleSlash) => self.parse_relative_steps(true)?,
                _ => Vec::new(),
            };
            if predicates.is_empty() && steps.is_empty() {
                return Ok(primary);
            }
            return Ok(Expr::Filter {
                primary: Box::new(primary),
                predicates,
                steps,
            });
        }

        match self.peek() {
            Some(Token::Slash) => {
                self.pos += 1;
                let steps = if self.starts_step() {
                    self.parse_relative_steps(false)?
                } else {
                    Vec::new()
                };
                Ok(Expr::Path {
                    absolute: true,
                    steps,
                })
            }
            Some(Token::DoubleSlash) => {
                let steps = self.parse_relative_steps(true)?;
                Ok(Expr::Path {
                    absolute: true,
                    steps,
                })
            }
            _ => {
                let steps = self.parse_relative_steps(false)?;
                Ok(Expr::Path {
                    absolute: false,
                    steps,
                })
            }
        }
    }

    fn starts_step(&self) -> bool {
        matches!(
            self.peek(),
            Some(Token::Dot | Token::DotDot | Token::At | Token::Star | Token::Name(_))
        )
    }

    /// Steps separated by `/` or `//`. With `leading_separator`, the first
    /// step must be preceded by a separator.
    fn parse_relative_steps(&mut self, leading_separator: bool) -> Result<Vec<Step>, PathError> {
        let mut steps = Vec::new();
        let mut need_separator = leading_separator;
        loop {
            if need_separator {
                match self.peek() {
                    Some(Token::Slash) => {
                        self.pos += 1;
                    }
                    Some(Token::DoubleSlash) => {
                        self.pos += 1;
                        steps.push(Step {
                            axis: Axis::DescendantOrSelf,
                            test: NodeTest::Node,
                            predicates: Vec::new(),
                        });
                    }
                    _ => break,
                }
            }
            steps.push(self.parse_step()?);
            need_separator = true;
        }
        Ok(steps)
    }

    fn parse_step(&mut self) -> Result<Step, PathError> {
        match self.peek() {
            Some(Token::Dot) => {
                self.pos += 1;
                return Ok(Step {
                    axis: Axis::SelfNode,
                    test: NodeTest::Node,
                    predicates: Vec::new(),
                });
            }
            Some(Token::DotDot) => {
                self.pos += 1;
                return Ok(Step {
                    axis: Axis::Parent,
                    test: NodeTest::Node,
                    predicates: Vec::new(),
                });
            }
            _ => {}
        }

        let mut axis = Axis::Child;
        if self.peek() == Some(&Token::At) {
            self.pos += 1;
            axis = Axis::Attribute;
        } else if let (Some(Token::Name(name)), Some(Token::ColonColon)) = (self.peek(), self.peek_at(1)) {
            axis = match name.as_str() {
                "child" => Axis::Child,
                "attribute" => Axis::Attribute,
                "self" => Axis::SelfNode,
                "parent" => Axis::Parent,
                "descendant" => Axis::Descendant,
                "descendant-or-self" => Axis::DescendantOrSelf,
                "ancestor" => Axis::Ancestor,
                other => return Err(self.error(format!("unsupported axis `{other}`"))),
            };
            self.pos += 2;
        }

        let test = self.parse_node_test()?;
        let predicates = self.parse_predicates()?;
        Ok(Step {
            axis,
            test,
            predicates,
        })
    }

    fn parse_node_test(&mut self) -> Result<NodeTest, PathError> {
        match self.advance() {
            Some(Token::Star) => Ok(NodeTest::AnyName),
            Some(Token::Name(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    let test = match name.as_str() {
                        "text" => NodeTest::Text,
                        "node" => NodeTest::Node,
                        "comment" => NodeTest::Comment,
                        other => return Err(self.error(format!("`{other}()` is not a node test"))),
                    };
                    self.pos += 1;
                    self.expect(Token::RParen)?;
                    return Ok(test);
                }
                match name.split_once(':') {
                    Some((prefix, "*")) => Ok(NodeTest::NamespaceAny(self.resolve(prefix)?)),
                    Some((prefix, local)) => Ok(NodeTest::Name {
                        ns: Some(self.resolve(prefix)?),
                        local: local.to_string(),
                    }),
                    None => Ok(NodeTest::Name {
                        ns: None,
                        local: name,
                    }),
                }
            }
            _ => {
                self.pos -= 1;
                Err(self.error("expected a node test"))
            }
        }
    }

    fn resolve(&self, prefix: &str) -> Result<String, PathError> {
        if prefix == "xml" {
            return Ok(super::document::XML_NS.to_string());
        }
        self.namespaces
            .get(prefix)
            .cloned()
            .ok_or_else(|| PathError::UnknownPrefix(prefix.to_string()))
    }

    fn parse_predicates(&mut self) -> Result<Vec<Expr>, PathError> {
        let mut predicates = Vec::new();
        while self.peek() == Some(&Token::LBracket) {
            self.pos += 1;
            predicates.push(self.parse_expr()?);
            self.expect(Token::RBracket)?;
        }
        Ok(predicates)
    }

    fn parse_primary(&mut self) -> Result<Expr, PathError> {
        match self.advance() {
            Some(Token::Literal(s)) => Ok(Expr::Literal(s)),
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Dollar) => match self.advance() {
                Some(Token::Name(name)) => Ok(Expr::Variable(name)),
                _ => {
                    self.pos -= 1;
                    Err(self.error("expected a variable name"))
                }
            },
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Name(name)) => {
                let function =
                    Function::lookup(&name).ok_or_else(|| PathError::UnknownFunction(name.clone()))?;
                self.expect(Token::LParen)?;
                let mut args = Vec::new();
                if self.peek() != Some(&Token::RParen) {
                    args.push(self.parse_expr()?);
                    while self.peek() == Some(&Token::Comma) {
                        self.pos += 1;
                        args.push(self.parse_expr()?);
                    }
                }
                self.expect(Token::RParen)?;
                let (min, max, expected) = function.arity();
                if args.len() < min || args.len() > max {
                    return Err(PathError::Arity {
                        name,
                        expected,
                        found: args.len(),
                    });
                }
                Ok(Expr::Call(function, args))
            }
            _ => {
                self.pos -= 1;
                Err(self.error("expected an expression"))
            }
        }
    }
}

// =============================================================================
// Evaluation
// =============================================================================

/// A compiled path expression.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledPath {
    source: String,
    expr: Expr,
}

struct Context<'a> {
    doc: &'a Document,
    node: NodeRef,
    position: usize,
    size: usize,
    variables: &'a Variables,
}

impl CompiledPath {
    pub fn compile(src: &str, namespaces: &Namespaces) -> Result<Self, PathError> {
        let tokens = tokenize(src)?;
        let mut parser = Parser {
            src,
            tokens,
            pos: 0,
            namespaces,
        };
        if parser.peek().is_none() {
            return Err(parser.error("empty expression"));
        }
        let expr = parser.parse_expr()?;
        if parser.peek().is_some() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(Self {
            source: src.to_string(),
            expr,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Evaluate with `context` as the context node.
    pub fn evaluate(
        &self,
        doc: &Document,
        context: NodeRef,
        variables: &Variables,
    ) -> Result<Value, PathError> {
        self.evaluate_at(doc, context, (1, 1), variables)
    }

    /// Evaluate with an explicit context position and size, as seen by
    /// `position()` and `last()` inside a `for-each`.
    pub fn evaluate_at(
        &self,
        doc: &Document,
        context: NodeRef,
        (position, size): (usize, usize),
        variables: &Variables,
    ) -> Result<Value, PathError> {
        let ctx = Context {
            doc,
            node: context,
            position,
            size,
            variables,
        };
        eval(&self.expr, &ctx)
    }

    /// Evaluate and flatten to items: one per node, or a single string for
    /// atomic results.
    pub fn select(
        &self,
        doc: &Document,
        context: NodeRef,
        variables: &Variables,
    ) -> Result<Vec<Item>, PathError> {
        Ok(match self.evaluate(doc, context, variables)? {
            Value::Nodes(nodes) => nodes.into_iter().map(Item::Node).collect(),
            other => vec![Item::Text(other.to_string_value(doc))],
        })
    }

    /// Evaluate to a string (first node's string value for node-sets).
    pub fn string(
        &self,
        doc: &Document,
        context: NodeRef,
        variables: &Variables,
    ) -> Result<String, PathError> {
        Ok(self.evaluate(doc, context, variables)?.to_string_value(doc))
    }

    pub fn boolean(
        &self,
        doc: &Document,
        context: NodeRef,
        variables: &Variables,
    ) -> Result<bool, PathError> {
        Ok(self.evaluate(doc, context, variables)?.to_boolean())
    }
}

fn eval(expr: &Expr, ctx: &Context) -> Result<Value, PathError> {
    match expr {
        Expr::Or(a, b) => Ok(Value::Boolean(
            eval(a, ctx)?.to_boolean() || eval(b, ctx)?.to_boolean(),
        )),
        Expr::And(a, b) => Ok(Value::Boolean(
            eval(a, ctx)?.to_boolean() && eval(b, ctx)?.to_boolean(),
        )),
        Expr::Compare(op, a, b) => {
            let left = eval(a, ctx)?;
            let right = eval(b, ctx)?;
            Ok(Value::Boolean(compare(ctx.doc, *op, &left, &right)))
        }
        Expr::Union(a, b) => {
            let mut nodes = eval(a, ctx)?.into_nodes()?;
            nodes.extend(eval(b, ctx)?.into_nodes()?);
            Ok(Value::Nodes(sorted(nodes)))
        }
        Expr::Literal(s) => Ok(Value::String(s.clone())),
        Expr::Number(n) => Ok(Value::Number(*n)),
        Expr::Variable(name) => ctx
            .variables
            .get(name)
            .cloned()
            .ok_or_else(|| PathError::UnknownVariable(name.clone())),
        Expr::Call(function, args) => call(*function, args, ctx),
        Expr::Path { absolute, steps } => {
            let start = if *absolute {
                NodeRef::Node(Document::ROOT)
            } else {
                ctx.node
            };
            apply_steps(ctx, vec![start], steps).map(Value::Nodes)
        }
        Expr::Filter {
            primary,
            predicates,
            steps,
        } => {
            let mut nodes = eval(primary, ctx)?.into_nodes()?;
            for predicate in predicates {
                nodes = filter(ctx, nodes, predicate)?;
            }
            apply_steps(ctx, nodes, steps).map(Value::Nodes)
        }
    }
}

fn sorted(mut nodes: Vec<NodeRef>) -> Vec<NodeRef> {
    nodes.sort();
    nodes.dedup();
    nodes
}

fn apply_steps(
    ctx: &Context,
    mut nodes: Vec<NodeRef>,
    steps: &[Step],
) -> Result<Vec<NodeRef>, PathError> {
    for step in steps {
        let mut next = Vec::new();
        for &node in &nodes {
            let mut selected: Vec<NodeRef> = axis_nodes(ctx.doc, node, step.axis)
                .into_iter()
                .filter(|&n| matches_test(ctx.doc, n, step.axis, &step.test))
                .collect();
            for predicate in &step.predicates {
                selected = filter(ctx, selected, predicate)?;
            }
            next.extend(selected);
        }
        nodes = sorted(next);
    }
    Ok(nodes)
}

/// Nodes along `axis`, in axis order (reverse document order for
/// `parent`/`ancestor`).
fn axis_nodes(doc: &Document, node: NodeRef, axis: Axis) -> Vec<NodeRef> {
    let id = match node {
        NodeRef::Node(id) => id,
        NodeRef::Attribute(owner, _) => {
            return match axis {
                Axis::SelfNode | Axis::DescendantOrSelf => vec![node],
                Axis::Parent => vec![NodeRef::Node(owner)],
                Axis::Ancestor => {
                    let mut out = vec![NodeRef::Node(owner)];
                    out.extend(ancestors(doc, owner));
                    out
                }
                _ => Vec::new(),
            };
        }
    };
    match axis {
        Axis::Child => doc.children(id).iter().map(|&c| NodeRef::Node(c)).collect(),
        Axis::Attribute => doc
            .element(id)
            .map(|e| (0..e.attributes.len()).map(|i| NodeRef::Attribute(id, i)).collect())
            .unwrap_or_default(),
        Axis::SelfNode => vec![node],
        Axis::Parent => doc.parent(id).map(NodeRef::Node).into_iter().collect(),
        Axis::Descendant => doc.descendants(id).into_iter().map(NodeRef::Node).collect(),
        Axis::DescendantOrSelf => std::iter::once(node)
            .chain(doc.descendants(id).into_iter().map(NodeRef::Node))
            .collect(),
        Axis::Ancestor => ancestors(doc, id),
    }
}

fn ancestors(doc: &Document, id: NodeId) -> Vec<NodeRef> {
    let mut out = Vec::new();
    let mut current = doc.parent(id);
    while let Some(parent) = current {
        out.push(NodeRef::Node(parent));
        current = doc.parent(parent);
    }
    out
}

fn matches_test(doc: &Document, node: NodeRef, axis: Axis, test: &NodeTest) -> bool {
    match node {
        NodeRef::Attribute(owner, i) => {
            // Attributes only satisfy name tests on the attribute axis.
            let Some(attr) = doc.element(owner).and_then(|e| e.attributes.get(i)) else {
                return false;
            };
            match test {
                NodeTest::Node => true,
                _ if axis != Axis::Attribute => false,
                NodeTest::AnyName => true,
                NodeTest::Name { ns, local } => attr.name.is(ns.as_deref(), local),
                NodeTest::NamespaceAny(ns) => attr.name.ns.as_deref() == Some(ns.as_str()),
                NodeTest::Text | NodeTest::Comment => false,
            }
        }
        NodeRef::Node(id) => match (test, doc.kind(id)) {
            (NodeTest::Node, _) => true,
            (NodeTest::Text, NodeKind::Text(_)) => true,
            (NodeTest::Comment, NodeKind::Comment(_)) => true,
            (NodeTest::AnyName, NodeKind::Element(_)) => true,
            (NodeTest::Name { ns, local }, NodeKind::Element(e)) => e.name.is(ns.as_deref(), local),
            (NodeTest::NamespaceAny(ns), NodeKind::Element(e)) => {
                e.name.ns.as_deref() == Some(ns.as_str())
            }
            _ => false,
        },
    }
}

fn filter(ctx: &Context, nodes: Vec<NodeRef>, predicate: &Expr) -> Result<Vec<NodeRef>, PathError> {
    let size = nodes.len();
    let mut kept = Vec::new();
    for (i, node) in nodes.into_iter().enumerate() {
        let inner = Context {
            doc: ctx.doc,
            node,
            position: i + 1,
            size,
            variables: ctx.variables,
        };
        let keep = match eval(predicate, &inner)? {
            Value::Number(n) => n == (i + 1) as f64,
            other => other.to_boolean(),
        };
        if keep {
            kept.push(node);
        }
    }
    Ok(kept)
}

fn compare(doc: &Document, op: CompareOp, left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Nodes(a), Value::Nodes(b)) => a.iter().any(|&x| {
            let xs = doc.ref_string_value(x);
            b.iter()
                .any(|&y| compare_atoms(op, &Value::String(xs.clone()), &Value::String(doc.ref_string_value(y)), doc))
        }),
        (Value::Nodes(a), other) => a
            .iter()
            .any(|&x| compare_atoms(op, &node_as(doc, x, other), other, doc)),
        (other, Value::Nodes(b)) => b
            .iter()
            .any(|&y| compare_atoms(op, other, &node_as(doc, y, other), doc)),
        (a, b) => compare_atoms(op, a, b, doc),
    }
}

/// Convert a node to the type it is compared against.
fn node_as(doc: &Document, node: NodeRef, other: &Value) -> Value {
    let s = doc.ref_string_value(node);
    match other {
        Value::Number(_) => Value::Number(parse_number(&s)),
        Value::Boolean(_) => Value::Boolean(true),
        _ => Value::String(s),
    }
}

fn compare_atoms(op: CompareOp, a: &Value, b: &Value, doc: &Document) -> bool {
    match op {
        CompareOp::Eq | CompareOp::Ne => {
            let equal = if matches!(a, Value::Boolean(_)) || matches!(b, Value::Boolean(_)) {
                a.to_boolean() == b.to_boolean()
            } else if matches!(a, Value::Number(_)) || matches!(b, Value::Number(_)) {
                a.to_number(doc) == b.to_number(doc)
            } else {
                a.to_string_value(doc) == b.to_string_value(doc)
            };
            equal == (op == CompareOp::Eq)
        }
        _ => {
            let (x, y) = (a.to_number(doc), b.to_number(doc));
            match op {
                CompareOp::Lt => x < y,
                CompareOp::Le => x <= y,
                CompareOp::Gt => x > y,
                _ => x >= y,
            }
        }
    }
}

fn call(function: Function, args: &[Expr], ctx: &Context) -> Result<Value, PathError> {
    let doc = ctx.doc;
    let string_arg = |i: usize| -> Result<String, PathError> {
        match args.get(i) {
            Some(arg) => Ok(eval(arg, ctx)?.to_string_value(doc)),
            None => Ok(doc.ref_string_value(ctx.node)),
        }
    };
    let first_node = |i: usize| -> Result<Option<NodeRef>, PathError> {
        match args.get(i) {
            Some(arg) => Ok(eval(arg, ctx)?.into_nodes()?.first().copied()),
            None => Ok(Some(ctx.node)),
        }
    };

    Ok(match function {
        Function::String => Value::String(string_arg(0)?),
        Function::Concat => {
            let mut out = String::new();
            for i in 0..args.len() {
                out.push_str(&string_arg(i)?);
            }
            Value::String(out)
        }
        Function::NormalizeSpace => {
            Value::String(string_arg(0)?.split_whitespace().collect::<Vec<_>>().join(" "))
        }
        Function::Count => Value::Number(eval(&args[0], ctx)?.into_nodes()?.len() as f64),
        Function::Name | Function::LocalName => {
            let name = first_node(0)?
                .and_then(|node| match node {
                    NodeRef::Node(id) => doc.element(id).map(|e| e.name.clone()),
                    NodeRef::Attribute(id, i) => doc
                        .element(id)
                        .and_then(|e| e.attributes.get(i))
                        .map(|a| a.name.clone()),
                })
                .map(|name| {
                    if function == Function::Name {
                        name.qualified()
                    } else {
                        name.local
                    }
                })
                .unwrap_or_default();
            Value::String(name)
        }
        Function::Not => Value::Boolean(!eval(&args[0], ctx)?.to_boolean()),
        Function::True => Value::Boolean(true),
        Function::False => Value::Boolean(false),
        Function::Contains => Value::Boolean(string_arg(0)?.contains(&string_arg(1)?)),
        Function::StartsWith => Value::Boolean(string_arg(0)?.starts_with(&string_arg(1)?)),
        Function::Position => Value::Number(ctx.position as f64),
        Function::Last => Value::Number(ctx.size as f64),
        Function::Number => match args.first() {
            Some(arg) => Value::Number(eval(arg, ctx)?.to_number(doc)),
            None => Value::Number(parse_number(&doc.ref_string_value(ctx.node))),
        },
        Function::Dirname => {
            let path = string_arg(0)?;
            Value::String(match path.rfind('/') {
                Some(pos) => path[..=pos].to_string(),
                None => String::new(),
            })
        }
        Function::Basename => {
            let path = string_arg(0)?;
            Value::String(match path.rfind('/') {
                Some(pos) => path[pos + 1..].to_string(),
                None => path,
            })
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOG: &str = r#"<blog xmlns:m="urn:meta">
        <post id="1" m:year="2020"><title>First</title><tag>Rust</tag><tag>xml</tag></post>
        <post id="2" m:year="2021"><title>Second</title><tag>xml</tag></post>
        <!-- draft -->
    </blog>"#;

    fn ns() -> Namespaces {
        Namespaces::from([("m".to_string(), "urn:meta".to_string())])
    }

    fn strings(doc: &Document, expr: &str) -> Vec<String> {
        doc.evaluate(expr, &ns())
            .unwrap()
            .iter()
            .map(|i| doc.item_string(i))
            .collect()
    }

    // =========================================================================
    // Location paths
    // =========================================================================

    #[test]
    fn absolute_child_path() {
        let doc = Document::parse_str(BLOG).unwrap();
        assert_eq!(strings(&doc, "/blog/post/title"), vec!["First", "Second"]);
    }

    #[test]
    fn descendant_abbreviation() {
        let doc = Document::parse_str(BLOG).unwrap();
        assert_eq!(strings(&doc, "//tag"), vec!["Rust", "xml", "xml"]);
    }

    #[test]
    fn attributes_with_and_without_prefix() {
        let doc = Document::parse_str(BLOG).unwrap();
        assert_eq!(strings(&doc, "//post/@id"), vec!["1", "2"]);
        assert_eq!(strings(&doc, "//post/@m:year"), vec!["2020", "2021"]);
        // unprefixed attribute test does not match namespaced attributes
        assert!(strings(&doc, "//post/@year").is_empty());
    }

    #[test]
    fn positional_and_boolean_predicates() {
        let doc = Document::parse_str(BLOG).unwrap();
        assert_eq!(strings(&doc, "//post[2]/title"), vec!["Second"]);
        assert_eq!(strings(&doc, "//post[@id='1']/title"), vec!["First"]);
        assert_eq!(strings(&doc, "//post[tag='Rust']/@id"), vec!["1"]);
        assert_eq!(strings(&doc, "//post[last()]/@id"), vec!["2"]);
    }

    #[test]
    fn parent_and_self_steps() {
        let doc = Document::parse_str(BLOG).unwrap();
        assert_eq!(strings(&doc, "//title[.='Second']/../@id"), vec!["2"]);
    }

    #[test]
    fn text_and_comment_tests() {
        let doc = Document::parse_str(BLOG).unwrap();
        assert_eq!(strings(&doc, "/blog/post[1]/title/text()"), vec!["First"]);
        assert_eq!(strings(&doc, "/blog/comment()"), vec![" draft "]);
    }

    #[test]
    fn union_is_in_document_order() {
        let doc = Document::parse_str(BLOG).unwrap();
        assert_eq!(
            strings(&doc, "//post[2]/title | //post[1]/title"),
            vec!["First", "Second"]
        );
    }

    #[test]
    fn relative_paths_from_context_node() {
        let doc = Document::parse_str(BLOG).unwrap();
        let posts = CompiledPath::compile("//post", &ns())
            .unwrap()
            .evaluate(&doc, NodeRef::Node(Document::ROOT), &Variables::new())
            .unwrap()
            .into_nodes()
            .unwrap();
        let title = CompiledPath::compile("title", &ns()).unwrap();
        let got = title.string(&doc, posts[1], &Variables::new()).unwrap();
        assert_eq!(got, "Second");
    }

    #[test]
    fn namespaced_elements_need_a_prefix() {
        let doc = Document::parse_str(r#"<r xmlns="urn:meta"><a>1</a></r>"#).unwrap();
        assert!(strings(&doc, "/r/a").is_empty());
        assert_eq!(strings(&doc, "/m:r/m:a"), vec!["1"]);
        assert_eq!(strings(&doc, "/m:*/*"), vec!["1"]);
    }

    // =========================================================================
    // Functions and values
    // =========================================================================

    #[test]
    fn string_functions() {
        let doc = Document::parse_str(BLOG).unwrap();
        assert_eq!(strings(&doc, "concat('a', 'b', 'c')"), vec!["abc"]);
        assert_eq!(strings(&doc, "normalize-space('  a   b ')"), vec!["a b"]);
        assert_eq!(strings(&doc, "count(//tag)"), vec!["3"]);
        assert_eq!(strings(&doc, "name(//post[1]/@m:year)"), vec!["m:year"]);
        assert_eq!(strings(&doc, "string(//post[1]/@id = 1)"), vec!["true"]);
        assert_eq!(strings(&doc, "dirname('a/b/c.xml')"), vec!["a/b/"]);
        assert_eq!(strings(&doc, "basename('a/b/c.xml')"), vec!["c.xml"]);
    }

    #[test]
    fn variables_resolve() {
        let doc = Document::parse_str(BLOG).unwrap();
        let mut vars = Variables::new();
        vars.insert("which".to_string(), Value::String("2".to_string()));
        let path = CompiledPath::compile("//post[@id = $which]/title", &ns()).unwrap();
        assert_eq!(
            path.string(&doc, NodeRef::Node(Document::ROOT), &vars).unwrap(),
            "Second"
        );
    }

    #[test]
    fn relational_comparisons_are_numeric() {
        let doc = Document::parse_str(BLOG).unwrap();
        assert_eq!(strings(&doc, "//post[@m:year >= 2021]/@id"), vec!["2"]);
        assert_eq!(strings(&doc, "//post[@id < 2 and @id > 0]/@id"), vec!["1"]);
    }

    // =========================================================================
    // Errors
    // =========================================================================

    #[test]
    fn unknown_prefix_is_error() {
        assert_eq!(
            CompiledPath::compile("/x:a", &ns()),
            Err(PathError::UnknownPrefix("x".to_string()))
        );
    }

    #[test]
    fn unknown_function_is_error() {
        assert!(matches!(
            CompiledPath::compile("frobnicate(1)", &ns()),
            Err(PathError::UnknownFunction(_))
        ));
    }

    #[test]
    fn arity_is_checked() {
        assert!(matches!(
            CompiledPath::compile("contains('a')", &ns()),
            Err(PathError::Arity { .. })
        ));
    }

    #[test]
    fn syntax_errors() {
        for bad in ["", "/a[", "a/", "'open", "a b"] {
            assert!(
                matches!(CompiledPath::compile(bad, &ns()), Err(PathError::Syntax { .. })),
                "expected syntax error for {bad:?}"
            );
        }
    }

    #[test]
    fn undefined_variable_is_error() {
        let doc = Document::parse_str(BLOG).unwrap();
        assert_eq!(
            doc.evaluate("$nope", &ns()),
            Err(PathError::UnknownVariable("nope".to_string()))
        );
    }
}
