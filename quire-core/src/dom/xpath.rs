//! A practical XPath 1.0 subset.
//!
//! Supports location paths with the common axes, predicates (boolean and
//! positional), unions, comparisons, boolean operators and the string
//! functions used in chapter and TOC expressions, plus the EXSLT
//! `re:test(string, pattern, flags)` extension. Namespace prefixes on name
//! tests are accepted and ignored, so `//h:h1` and `//h1` select the same
//! elements.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

use regex::{Regex, RegexBuilder};
use thiserror::Error;

use super::{local_part, Document, NodeData, NodeId};

/// A malformed expression
#[derive(Debug, Clone, Error, PartialEq)]
#[error("invalid XPath expression '{expr}': {message}")]
pub struct XPathError {
    pub expr: String,
    pub message: String,
}

/// A compiled expression
#[derive(Debug, Clone)]
pub struct XPath {
    source: String,
    expr: Expr,
}

impl XPath {
    pub fn parse(source: &str) -> Result<XPath, XPathError> {
        let fail = |message: String| XPathError {
            expr: source.to_string(),
            message,
        };
        let tokens = tokenize(source).map_err(fail)?;
        if tokens.is_empty() {
            return Err(fail("empty expression".into()));
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or().map_err(fail)?;
        if parser.pos != parser.tokens.len() {
            return Err(fail(format!(
                "unexpected token {:?}",
                parser.tokens[parser.pos]
            )));
        }
        Ok(XPath {
            source: source.to_string(),
            expr,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Nodes selected with `context` as the context node, in document order.
    /// Attribute results are dropped; non-node results select nothing.
    pub fn select(&self, doc: &Document, context: NodeId) -> Vec<NodeId> {
        let order = doc.document_order();
        let ctx = Ctx::new(doc, &order);
        let focus = Focus {
            item: Item::Node(context),
            position: 1,
            size: 1,
        };
        match ctx.eval(&self.expr, &focus) {
            Value::Nodes(items) => items
                .into_iter()
                .filter_map(|i| match i {
                    Item::Node(n) => Some(n),
                    Item::Attr(..) => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Evaluate to a boolean with `context` as the context node
    pub fn test(&self, doc: &Document, context: NodeId) -> bool {
        let order = doc.document_order();
        let ctx = Ctx::new(doc, &order);
        let focus = Focus {
            item: Item::Node(context),
            position: 1,
            size: 1,
        };
        let value = ctx.eval(&self.expr, &focus);
        ctx.boolean(&value)
    }

    /// Evaluate to a string with `context` as the context node
    pub fn string(&self, doc: &Document, context: NodeId) -> String {
        let order = doc.document_order();
        let ctx = Ctx::new(doc, &order);
        let focus = Focus {
            item: Item::Node(context),
            position: 1,
            size: 1,
        };
        let value = ctx.eval(&self.expr, &focus);
        ctx.string(&value)
    }
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Slash,
    DoubleSlash,
    LBracket,
    RBracket,
    LParen,
    RParen,
    At,
    Comma,
    Pipe,
    Dot,
    DotDot,
    Star,
    Plus,
    Minus,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    ColonColon,
    Name(String),
    Literal(String),
    Number(f64),
}

fn tokenize(src: &str) -> Result<Vec<Tok>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    let peek = |i: usize| chars.get(i).copied();
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '/' if peek(i + 1) == Some('/') => {
                out.push(Tok::DoubleSlash);
                i += 2;
            }
            '/' => {
                out.push(Tok::Slash);
                i += 1;
            }
            '[' => {
                out.push(Tok::LBracket);
                i += 1;
            }
            ']' => {
                out.push(Tok::RBracket);
                i += 1;
            }
            '(' => {
                out.push(Tok::LParen);
                i += 1;
            }
            ')' => {
                out.push(Tok::RParen);
                i += 1;
            }
            '@' => {
                out.push(Tok::At);
                i += 1;
            }
            ',' => {
                out.push(Tok::Comma);
                i += 1;
            }
            '|' => {
                out.push(Tok::Pipe);
                i += 1;
            }
            '*' => {
                out.push(Tok::Star);
                i += 1;
            }
            '+' => {
                out.push(Tok::Plus);
                i += 1;
            }
            '-' => {
                out.push(Tok::Minus);
                i += 1;
            }
            '=' => {
                out.push(Tok::Eq);
                i += 1;
            }
            '!' if peek(i + 1) == Some('=') => {
                out.push(Tok::Ne);
                i += 2;
            }
            '<' if peek(i + 1) == Some('=') => {
                out.push(Tok::Le);
                i += 2;
            }
            '<' => {
                out.push(Tok::Lt);
                i += 1;
            }
            '>' if peek(i + 1) == Some('=') => {
                out.push(Tok::Ge);
                i += 2;
            }
            '>' => {
                out.push(Tok::Gt);
                i += 1;
            }
            ':' if peek(i + 1) == Some(':') => {
                out.push(Tok::ColonColon);
                i += 2;
            }
            '.' if peek(i + 1) == Some('.') => {
                out.push(Tok::DotDot);
                i += 2;
            }
            '.' if !peek(i + 1).map(|c| c.is_ascii_digit()).unwrap_or(false) => {
                out.push(Tok::Dot);
                i += 1;
            }
            '"' | '\'' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&q| q == c)
                    .ok_or_else(|| "unterminated string literal".to_string())?;
                out.push(Tok::Literal(chars[i + 1..i + 1 + end].iter().collect()));
                i += end + 2;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| format!("bad number '{text}'"))?;
                out.push(Tok::Number(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() {
                    let ch = chars[i];
                    if ch.is_alphanumeric() || ch == '_' || ch == '-' || ch == '.' {
                        i += 1;
                    } else if ch == ':' && peek(i + 1) != Some(':') {
                        if peek(i + 1) == Some('*') {
                            i += 2;
                            break;
                        }
                        i += 1;
                    } else {
                        break;
                    }
                }
                out.push(Tok::Name(chars[start..i].iter().collect()));
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Syntax tree
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Axis {
    Child,
    Descendant,
    DescendantOrSelf,
    SelfAxis,
    Parent,
    Ancestor,
    AncestorOrSelf,
    FollowingSibling,
    PrecedingSibling,
    Attribute,
}

#[derive(Debug, Clone, PartialEq)]
enum NodeTest {
    Name(String),
    Any,
    Text,
    Node,
    Comment,
}

#[derive(Debug, Clone)]
struct Step {
    axis: Axis,
    test: NodeTest,
    predicates: Vec<Expr>,
}

#[derive(Debug, Clone)]
enum Start {
    Root,
    Context,
    Filter(Box<Expr>),
}

#[derive(Debug, Clone)]
enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Neg(Box<Expr>),
    Union(Vec<Expr>),
    Path(Start, Vec<Step>),
    Filter(Box<Expr>, Vec<Expr>),
    Literal(String),
    Number(f64),
    Call(String, Vec<Expr>),
}

struct Parser {
    tokens: Vec<Tok>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Tok> {
        self.tokens.get(self.pos + offset)
    }

    fn bump(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn expect(&mut self, tok: Tok) -> Result<(), String> {
        match self.bump() {
            Some(t) if t == tok => Ok(()),
            Some(t) => Err(format!("expected {tok:?}, found {t:?}")),
            None => Err(format!("expected {tok:?}, found end of expression")),
        }
    }

    fn peek_keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Tok::Name(n)) if n == word)
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        while self.peek_keyword("or") {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_equality()?;
        while self.peek_keyword("and") {
            self.pos += 1;
            let right = self.parse_equality()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_relational()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Eq) => CmpOp::Eq,
                Some(Tok::Ne) => CmpOp::Ne,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_relational()?;
            left = Expr::Cmp(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_relational(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Lt) => CmpOp::Lt,
                Some(Tok::Le) => CmpOp::Le,
                Some(Tok::Gt) => CmpOp::Gt,
                Some(Tok::Ge) => CmpOp::Ge,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_additive()?;
            left = Expr::Cmp(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_unary()?;
        loop {
            match self.peek() {
                Some(Tok::Plus) => {
                    self.pos += 1;
                    let right = self.parse_unary()?;
                    left = Expr::Add(Box::new(left), Box::new(right));
                }
                Some(Tok::Minus) => {
                    self.pos += 1;
                    let right = self.parse_unary()?;
                    left = Expr::Sub(Box::new(left), Box::new(right));
                }
                _ => return Ok(left),
            }
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if self.peek() == Some(&Tok::Minus) {
            self.pos += 1;
            return Ok(Expr::Neg(Box::new(self.parse_unary()?)));
        }
        self.parse_union()
    }

    fn parse_union(&mut self) -> Result<Expr, String> {
        let first = self.parse_path()?;
        if self.peek() != Some(&Tok::Pipe) {
            return Ok(first);
        }
        let mut parts = vec![first];
        while self.peek() == Some(&Tok::Pipe) {
            self.pos += 1;
            parts.push(self.parse_path()?);
        }
        Ok(Expr::Union(parts))
    }

    fn starts_step(&self) -> bool {
        match self.peek() {
            Some(Tok::Dot | Tok::DotDot | Tok::At | Tok::Star) => true,
            Some(Tok::Name(name)) => {
                let is_call = self.peek_at(1) == Some(&Tok::LParen)
                    && !matches!(name.as_str(), "text" | "node" | "comment");
                !is_call
            }
            _ => false,
        }
    }

    fn parse_path(&mut self) -> Result<Expr, String> {
        match self.peek() {
            Some(Tok::Slash) => {
                self.pos += 1;
                let mut steps = Vec::new();
                if self.starts_step() {
                    self.parse_relative(&mut steps)?;
                }
                Ok(Expr::Path(Start::Root, steps))
            }
            Some(Tok::DoubleSlash) => {
                self.pos += 1;
                let mut steps = vec![descendant_or_self()];
                self.parse_relative(&mut steps)?;
                Ok(Expr::Path(Start::Root, steps))
            }
            _ if self.starts_step() => {
                let mut steps = Vec::new();
                self.parse_relative(&mut steps)?;
                Ok(Expr::Path(Start::Context, steps))
            }
            _ => {
                let primary = self.parse_primary()?;
                let mut predicates = Vec::new();
                while self.peek() == Some(&Tok::LBracket) {
                    predicates.push(self.parse_predicate()?);
                }
                let filter = if predicates.is_empty() {
                    primary
                } else {
                    Expr::Filter(Box::new(primary), predicates)
                };
                match self.peek() {
                    Some(Tok::Slash) => {
                        self.pos += 1;
                        let mut steps = Vec::new();
                        self.parse_relative(&mut steps)?;
                        Ok(Expr::Path(Start::Filter(Box::new(filter)), steps))
                    }
                    Some(Tok::DoubleSlash) => {
                        self.pos += 1;
                        let mut steps = vec![descendant_or_self()];
                        self.parse_relative(&mut steps)?;
                        Ok(Expr::Path(Start::Filter(Box::new(filter)), steps))
                    }
                    _ => Ok(filter),
                }
            }
        }
    }

    fn parse_relative(&mut self, steps: &mut Vec<Step>) -> Result<(), String> {
        steps.push(self.parse_step()?);
        loop {
            match self.peek() {
                Some(Tok::Slash) => {
                    self.pos += 1;
                    steps.push(self.parse_step()?);
                }
                Some(Tok::DoubleSlash) => {
                    self.pos += 1;
                    steps.push(descendant_or_self());
                    steps.push(self.parse_step()?);
                }
                _ => return Ok(()),
            }
        }
    }

    fn parse_step(&mut self) -> Result<Step, String> {
        match self.peek() {
            Some(Tok::Dot) => {
                self.pos += 1;
                return Ok(Step {
                    axis: Axis::SelfAxis,
                    test: NodeTest::Node,
                    predicates: Vec::new(),
                });
            }
            Some(Tok::DotDot) => {
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
        if self.peek() == Some(&Tok::At) {
            self.pos += 1;
            axis = Axis::Attribute;
        } else if let (Some(Tok::Name(name)), Some(Tok::ColonColon)) = (self.peek(), self.peek_at(1)) {
            axis = match name.as_str() {
                "child" => Axis::Child,
                "descendant" => Axis::Descendant,
                "descendant-or-self" => Axis::DescendantOrSelf,
                "self" => Axis::SelfAxis,
                "parent" => Axis::Parent,
                "ancestor" => Axis::Ancestor,
                "ancestor-or-self" => Axis::AncestorOrSelf,
                "following-sibling" => Axis::FollowingSibling,
                "preceding-sibling" => Axis::PrecedingSibling,
                "attribute" => Axis::Attribute,
                other => return Err(format!("unsupported axis '{other}'")),
            };
            self.pos += 2;
        }

        let test = match self.bump() {
            Some(Tok::Star) => NodeTest::Any,
            Some(Tok::Name(name)) => {
                if self.peek() == Some(&Tok::LParen) {
                    self.pos += 1;
                    self.expect(Tok::RParen)?;
                    match name.as_str() {
                        "text" => NodeTest::Text,
                        "node" => NodeTest::Node,
                        "comment" => NodeTest::Comment,
                        other => return Err(format!("unknown node test '{other}()'")),
                    }
                } else if name.ends_with(":*") {
                    NodeTest::Any
                } else {
                    NodeTest::Name(local_part(&name).to_string())
                }
            }
            Some(t) => return Err(format!("expected a node test, found {t:?}")),
            None => return Err("expected a node test".to_string()),
        };

        let mut predicates = Vec::new();
        while self.peek() == Some(&Tok::LBracket) {
            predicates.push(self.parse_predicate()?);
        }
        Ok(Step {
            axis,
            test,
            predicates,
        })
    }

    fn parse_predicate(&mut self) -> Result<Expr, String> {
        self.expect(Tok::LBracket)?;
        let expr = self.parse_or()?;
        self.expect(Tok::RBracket)?;
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.bump() {
            Some(Tok::Literal(s)) => Ok(Expr::Literal(s)),
            Some(Tok::Number(n)) => Ok(Expr::Number(n)),
            Some(Tok::LParen) => {
                let expr = self.parse_or()?;
                self.expect(Tok::RParen)?;
                Ok(expr)
            }
            Some(Tok::Name(name)) => {
                self.expect(Tok::LParen)?;
                let mut args = Vec::new();
                if self.peek() != Some(&Tok::RParen) {
                    args.push(self.parse_or()?);
                    while self.peek() == Some(&Tok::Comma) {
                        self.pos += 1;
                        args.push(self.parse_or()?);
                    }
                }
                self.expect(Tok::RParen)?;
                Ok(Expr::Call(name, args))
            }
            Some(t) => Err(format!("unexpected token {t:?}")),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

fn descendant_or_self() -> Step {
    Step {
        axis: Axis::DescendantOrSelf,
        test: NodeTest::Node,
        predicates: Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Item {
    Node(NodeId),
    /// Owner element, attribute name, value
    Attr(NodeId, String, String),
}

#[derive(Debug, Clone)]
enum Value {
    Nodes(Vec<Item>),
    Str(String),
    Num(f64),
    Bool(bool),
}

struct Focus {
    item: Item,
    position: usize,
    size: usize,
}

struct Ctx<'a> {
    doc: &'a Document,
    order: &'a HashMap<NodeId, usize>,
    regexes: RefCell<HashMap<(String, bool), Option<Regex>>>,
}

impl<'a> Ctx<'a> {
    fn new(doc: &'a Document, order: &'a HashMap<NodeId, usize>) -> Self {
        Self {
            doc,
            order,
            regexes: RefCell::new(HashMap::new()),
        }
    }

    fn eval(&self, expr: &Expr, focus: &Focus) -> Value {
        match expr {
            Expr::Or(a, b) => {
                let left = self.eval(a, focus);
                Value::Bool(self.boolean(&left) || {
                    let right = self.eval(b, focus);
                    self.boolean(&right)
                })
            }
            Expr::And(a, b) => {
                let left = self.eval(a, focus);
                Value::Bool(self.boolean(&left) && {
                    let right = self.eval(b, focus);
                    self.boolean(&right)
                })
            }
            Expr::Cmp(op, a, b) => {
                let left = self.eval(a, focus);
                let right = self.eval(b, focus);
                Value::Bool(self.compare(*op, &left, &right))
            }
            Expr::Add(a, b) => {
                let left = self.eval(a, focus);
                let right = self.eval(b, focus);
                Value::Num(self.number(&left) + self.number(&right))
            }
            Expr::Sub(a, b) => {
                let left = self.eval(a, focus);
                let right = self.eval(b, focus);
                Value::Num(self.number(&left) - self.number(&right))
            }
            Expr::Neg(a) => {
                let v = self.eval(a, focus);
                Value::Num(-self.number(&v))
            }
            Expr::Union(parts) => {
                let mut seen = HashSet::new();
                let mut items = Vec::new();
                for part in parts {
                    if let Value::Nodes(nodes) = self.eval(part, focus) {
                        for item in nodes {
                            if seen.insert(item.clone()) {
                                items.push(item);
                            }
                        }
                    }
                }
                self.sort(&mut items);
                Value::Nodes(items)
            }
            Expr::Path(start, steps) => {
                let mut items = match start {
                    Start::Root => vec![Item::Node(self.doc.root())],
                    Start::Context => vec![focus.item.clone()],
                    Start::Filter(expr) => match self.eval(expr, focus) {
                        Value::Nodes(nodes) => nodes,
                        _ => Vec::new(),
                    },
                };
                for step in steps {
                    items = self.apply_step(items, step);
                }
                Value::Nodes(items)
            }
            Expr::Filter(primary, predicates) => match self.eval(primary, focus) {
                Value::Nodes(mut nodes) => {
                    self.sort(&mut nodes);
                    for pred in predicates {
                        nodes = self.apply_predicate(nodes, pred);
                    }
                    Value::Nodes(nodes)
                }
                other => other,
            },
            Expr::Literal(s) => Value::Str(s.clone()),
            Expr::Number(n) => Value::Num(*n),
            Expr::Call(name, args) => self.call(name, args, focus),
        }
    }

    fn apply_step(&self, items: Vec<Item>, step: &Step) -> Vec<Item> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for item in items {
            let Item::Node(node) = item else {
                continue;
            };
            let mut candidates = self.axis(node, step);
            for pred in &step.predicates {
                candidates = self.apply_predicate(candidates, pred);
            }
            for c in candidates {
                if seen.insert(c.clone()) {
                    out.push(c);
                }
            }
        }
        self.sort(&mut out);
        out
    }

    fn apply_predicate(&self, items: Vec<Item>, pred: &Expr) -> Vec<Item> {
        let size = items.len();
        items
            .into_iter()
            .enumerate()
            .filter(|(i, item)| {
                let focus = Focus {
                    item: item.clone(),
                    position: i + 1,
                    size,
                };
                match self.eval(pred, &focus) {
                    Value::Num(n) => (i + 1) as f64 == n,
                    other => self.boolean(&other),
                }
            })
            .map(|(_, item)| item)
            .collect()
    }

    fn axis(&self, node: NodeId, step: &Step) -> Vec<Item> {
        let doc = self.doc;
        if step.axis == Axis::Attribute {
            let Some(el) = doc.element(node) else {
                return Vec::new();
            };
            return el
                .attrs
                .iter()
                .filter(|a| match &step.test {
                    NodeTest::Name(local) => local_part(&a.name) == local.as_str(),
                    NodeTest::Any | NodeTest::Node => {
                        a.name != "xmlns" && !a.name.starts_with("xmlns:")
                    }
                    _ => false,
                })
                .map(|a| Item::Attr(node, a.name.clone(), a.value.clone()))
                .collect();
        }
        let nodes: Vec<NodeId> = match step.axis {
            Axis::Child => doc.children(node).to_vec(),
            Axis::Descendant => doc.descendants(node),
            Axis::DescendantOrSelf => {
                let mut v = vec![node];
                v.extend(doc.descendants(node));
                v
            }
            Axis::SelfAxis => vec![node],
            Axis::Parent => doc.parent(node).into_iter().collect(),
            Axis::Ancestor => doc.ancestors(node),
            Axis::AncestorOrSelf => {
                let mut v = vec![node];
                v.extend(doc.ancestors(node));
                v
            }
            Axis::FollowingSibling => match (doc.parent(node), doc.index_in_parent(node)) {
                (Some(p), Some(i)) => doc.children(p)[i + 1..].to_vec(),
                _ => Vec::new(),
            },
            Axis::PrecedingSibling => match (doc.parent(node), doc.index_in_parent(node)) {
                (Some(p), Some(i)) => doc.children(p)[..i].iter().rev().copied().collect(),
                _ => Vec::new(),
            },
            Axis::Attribute => Vec::new(),
        };
        nodes
            .into_iter()
            .filter(|&n| self.node_test(n, &step.test))
            .map(Item::Node)
            .collect()
    }

    fn node_test(&self, node: NodeId, test: &NodeTest) -> bool {
        match (test, self.doc.data(node)) {
            (NodeTest::Node, _) => true,
            (NodeTest::Any, NodeData::Element(_)) => true,
            (NodeTest::Name(name), NodeData::Element(el)) => {
                el.local_name().eq_ignore_ascii_case(name)
            }
            (NodeTest::Text, NodeData::Text(_)) => true,
            (NodeTest::Comment, NodeData::Comment(_)) => true,
            _ => false,
        }
    }

    fn sort(&self, items: &mut [Item]) {
        items.sort_by_key(|item| match item {
            Item::Node(n) => (self.order.get(n).copied().unwrap_or(usize::MAX), 0),
            Item::Attr(n, ..) => (self.order.get(n).copied().unwrap_or(usize::MAX), 1),
        });
    }

    fn item_string(&self, item: &Item) -> String {
        match item {
            Item::Node(n) => match self.doc.data(*n) {
                NodeData::Text(t) | NodeData::Comment(t) => t.clone(),
                _ => self.doc.text_content(*n),
            },
            Item::Attr(_, _, value) => value.clone(),
        }
    }

    fn string(&self, value: &Value) -> String {
        match value {
            Value::Nodes(items) => items
                .first()
                .map(|i| self.item_string(i))
                .unwrap_or_default(),
            Value::Str(s) => s.clone(),
            Value::Num(n) => format_number(*n),
            Value::Bool(b) => b.to_string(),
        }
    }

    fn number(&self, value: &Value) -> f64 {
        match value {
            Value::Num(n) => *n,
            Value::Bool(b) => f64::from(u8::from(*b)),
            other => self.string(other).trim().parse().unwrap_or(f64::NAN),
        }
    }

    fn boolean(&self, value: &Value) -> bool {
        match value {
            Value::Nodes(items) => !items.is_empty(),
            Value::Str(s) => !s.is_empty(),
            Value::Num(n) => *n != 0.0 && !n.is_nan(),
            Value::Bool(b) => *b,
        }
    }

    fn compare(&self, op: CmpOp, left: &Value, right: &Value) -> bool {
        match (left, right) {
            (Value::Nodes(a), Value::Nodes(b)) => a.iter().any(|x| {
                let xs = Value::Str(self.item_string(x));
                b.iter()
                    .any(|y| self.compare_atomic(op, &xs, &Value::Str(self.item_string(y))))
            }),
            (Value::Nodes(a), Value::Bool(_)) | (Value::Bool(_), Value::Nodes(a)) => {
                let nb = Value::Bool(!a.is_empty());
                let other = if matches!(left, Value::Nodes(_)) { right } else { left };
                self.compare_atomic(op, &nb, other)
            }
            (Value::Nodes(a), other) => a
                .iter()
                .any(|x| self.compare_atomic(op, &Value::Str(self.item_string(x)), other)),
            (other, Value::Nodes(b)) => b
                .iter()
                .any(|y| self.compare_atomic(op, other, &Value::Str(self.item_string(y)))),
            (a, b) => self.compare_atomic(op, a, b),
        }
    }

    fn compare_atomic(&self, op: CmpOp, a: &Value, b: &Value) -> bool {
        match op {
            CmpOp::Eq | CmpOp::Ne => {
                let equal = if matches!(a, Value::Bool(_)) || matches!(b, Value::Bool(_)) {
                    self.boolean(a) == self.boolean(b)
                } else if matches!(a, Value::Num(_)) || matches!(b, Value::Num(_)) {
                    self.number(a) == self.number(b)
                } else {
                    self.string(a) == self.string(b)
                };
                (op == CmpOp::Eq) == equal
            }
            CmpOp::Lt => self.number(a) < self.number(b),
            CmpOp::Le => self.number(a) <= self.number(b),
            CmpOp::Gt => self.number(a) > self.number(b),
            CmpOp::Ge => self.number(a) >= self.number(b),
        }
    }

    fn arg_string(&self, args: &[Expr], idx: usize, focus: &Focus) -> String {
        match args.get(idx) {
            Some(expr) => {
                let v = self.eval(expr, focus);
                self.string(&v)
            }
            None => self.item_string(&focus.item),
        }
    }

    fn call(&self, name: &str, args: &[Expr], focus: &Focus) -> Value {
        let arg = |i: usize| self.arg_string(args, i, focus);
        match name {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            "position" => Value::Num(focus.position as f64),
            "last" => Value::Num(focus.size as f64),
            "not" => {
                let v = args
                    .first()
                    .map(|e| self.eval(e, focus))
                    .unwrap_or(Value::Bool(false));
                Value::Bool(!self.boolean(&v))
            }
            "boolean" => {
                let v = args
                    .first()
                    .map(|e| self.eval(e, focus))
                    .unwrap_or(Value::Bool(false));
                Value::Bool(self.boolean(&v))
            }
            "count" => match args.first().map(|e| self.eval(e, focus)) {
                Some(Value::Nodes(items)) => Value::Num(items.len() as f64),
                _ => Value::Num(0.0),
            },
            "number" => {
                let v = match args.first() {
                    Some(e) => self.eval(e, focus),
                    None => Value::Str(self.item_string(&focus.item)),
                };
                Value::Num(self.number(&v))
            }
            "string" => Value::Str(arg(0)),
            "name" | "local-name" => {
                let item = match args.first().map(|e| self.eval(e, focus)) {
                    Some(Value::Nodes(items)) => items.into_iter().next(),
                    Some(_) => None,
                    None => Some(focus.item.clone()),
                };
                let qname = match item {
                    Some(Item::Node(n)) => self.doc.name(n).unwrap_or("").to_string(),
                    Some(Item::Attr(_, attr, _)) => attr,
                    None => String::new(),
                };
                if name == "local-name" {
                    Value::Str(local_part(&qname).to_string())
                } else {
                    Value::Str(qname)
                }
            }
            "concat" => Value::Str((0..args.len()).map(arg).collect()),
            "contains" => Value::Bool(arg(0).contains(&arg(1))),
            "starts-with" => Value::Bool(arg(0).starts_with(&arg(1))),
            "ends-with" => Value::Bool(arg(0).ends_with(&arg(1))),
            "string-length" => Value::Num(arg(0).chars().count() as f64),
            "normalize-space" => Value::Str(arg(0).split_whitespace().collect::<Vec<_>>().join(" ")),
            "lower-case" => Value::Str(arg(0).to_lowercase()),
            "upper-case" => Value::Str(arg(0).to_uppercase()),
            "translate" => {
                let from: Vec<char> = arg(1).chars().collect();
                let to: Vec<char> = arg(2).chars().collect();
                Value::Str(
                    arg(0)
                        .chars()
                        .filter_map(|c| match from.iter().position(|&f| f == c) {
                            Some(i) => to.get(i).copied(),
                            None => Some(c),
                        })
                        .collect(),
                )
            }
            "re:test" | "test" => {
                let flags = if args.len() > 2 { arg(2) } else { String::new() };
                let ignore_case = flags.contains('i');
                let pattern = arg(1);
                let subject = arg(0);
                let mut cache = self.regexes.borrow_mut();
                let re = cache
                    .entry((pattern.clone(), ignore_case))
                    .or_insert_with(|| {
                        RegexBuilder::new(&pattern)
                            .case_insensitive(ignore_case)
                            .build()
                            .ok()
                    });
                Value::Bool(re.as_ref().map(|r| r.is_match(&subject)).unwrap_or(false))
            }
            _ => {
                tracing::warn!(function = name, "unsupported XPath function");
                Value::Bool(false)
            }
        }
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> Document {
        Document::parse_html(
            r#"<html xmlns="http://www.w3.org/1999/xhtml"><head><title>T</title></head><body>
            <h1 id="c1">Chapter One</h1><p class="x">a</p>
            <h2 class="sub">Part A</h2>
            <h1 id="c2">Chapter Two</h1><p>b</p>
            <div><h1 id="c3">chapter three</h1></div>
            </body></html>"#,
        )
    }

    fn ids(doc: &Document, expr: &str) -> Vec<String> {
        let xp = XPath::parse(expr).unwrap();
        xp.select(doc, doc.root())
            .into_iter()
            .map(|n| doc.attr(n, "id").unwrap_or("-").to_string())
            .collect()
    }

    #[test]
    fn test_descendant_with_prefix() {
        let d = doc();
        assert_eq!(ids(&d, "//h:h1"), vec!["c1", "c2", "c3"]);
        assert_eq!(ids(&d, "//h1"), vec!["c1", "c2", "c3"]);
    }

    #[test]
    fn test_union_in_document_order() {
        let d = doc();
        assert_eq!(ids(&d, "//h:h2 | //h:h1").len(), 4);
        assert_eq!(ids(&d, "//h:h2 | //h:h1")[1], "-");
    }

    #[test]
    fn test_predicates_and_functions() {
        let d = doc();
        assert_eq!(ids(&d, "//*[name()='h1' or name()='h2'][@id]"), vec!["c1", "c2", "c3"]);
        assert_eq!(ids(&d, "//h:h1[contains(., 'Two')]"), vec!["c2"]);
        assert_eq!(
            ids(&d, r#"//h:h1[re:test(., "chapter\s+three", "i")]"#),
            vec!["c3"]
        );
        assert_eq!(ids(&d, "//h:body/h:h1[2]"), vec!["c2"]);
        assert_eq!(ids(&d, "//h:h1[not(@id='c1')]"), vec!["c2", "c3"]);
        assert_eq!(ids(&d, "(//h:h1)[last()]"), vec!["c3"]);
    }

    #[test]
    fn test_attribute_and_parent_steps() {
        let d = doc();
        assert_eq!(ids(&d, "//h:div/h:h1/.."), vec!["-"]);
        let xp = XPath::parse("//h:p/@class").unwrap();
        assert!(xp.select(&d, d.root()).is_empty());
        assert_eq!(xp.string(&d, d.root()), "x");
    }

    #[test]
    fn test_count_and_test() {
        let d = doc();
        assert!(XPath::parse("count(//h:h1) = 3").unwrap().test(&d, d.root()));
        assert!(!XPath::parse("//h:h3").unwrap().test(&d, d.root()));
    }

    #[test]
    fn test_parse_errors() {
        assert!(XPath::parse("").is_err());
        assert!(XPath::parse("//h1[").is_err());
        assert!(XPath::parse("//h1['open").is_err());
        assert!(XPath::parse("bogus::h1").is_err());
    }
}
