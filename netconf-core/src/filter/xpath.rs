//! XPath filter expressions.
//!
//! A subset of XPath 1.0 sufficient for NETCONF `select` expressions:
//!
//! - location paths: `/a/b`, `a/b`, `//b`, `.`, `..`, `*`, `p:*`, `@attr`
//! - axes: `child::`, `descendant::`, `descendant-or-self::`, `self::`,
//!   `parent::`, `attribute::`
//! - node tests: names, `text()`, `node()`
//! - predicates: `[2]`, `[name='fred']`, `[@type!='x' and count(y) > 1]`
//! - operators: `or`, `and`, `=`, `!=`, `<`, `<=`, `>`, `>=`, `|`
//! - functions: `not`, `count`, `position`, `last`, `contains`,
//!   `starts-with`, `string`, `number`, `local-name`, `true`, `false`
//!
//! Unprefixed name tests match the local name in any namespace. Prefixed
//! name tests are resolved against the bindings in scope at the `<filter>`.
//!
//! The output container passed to [`XPath::select`] plays the role of the
//! document node, so `/top` addresses its `<top>` child.

use netconf_protocol::xml::Element;
use netconf_protocol::RpcError;
use std::collections::{BTreeSet, HashMap};

/// A compiled XPath expression.
#[derive(Debug, Clone)]
pub struct XPath {
    source: String,
    expr: Expr,
}

impl XPath {
    /// Parses `select`, resolving prefixes against `namespaces`
    /// (`(prefix, uri)` pairs, later pairs shadow earlier ones).
    pub fn parse(select: &str, namespaces: &[(String, String)]) -> Result<Self, RpcError> {
        let bindings: HashMap<&str, &str> = namespaces
            .iter()
            .map(|(prefix, uri)| (prefix.as_str(), uri.as_str()))
            .collect();
        let invalid = |reason: String| {
            RpcError::invalid_value(format!("invalid XPath expression '{}': {}", select, reason))
        };

        let tokens = tokenize(select).map_err(invalid)?;
        if tokens.is_empty() {
            return Err(invalid("empty expression".to_string()));
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            namespaces: &bindings,
        };
        let expr = parser.parse_expr().map_err(invalid)?;
        if let Some(token) = parser.peek() {
            return Err(invalid(format!("unexpected {:?}", token)));
        }
        Ok(Self {
            source: select.to_string(),
            expr,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Evaluates against `root` and returns the child-index paths of the
    /// selected elements. Attribute and text results select their owning
    /// element.
    pub(crate) fn select(&self, root: &Element) -> Result<Vec<Vec<usize>>, RpcError> {
        let evaluator = Evaluator { root };
        let ctx = Context {
            node: Node::root(),
            position: 1,
            size: 1,
        };
        match evaluator.eval(&self.expr, &ctx)? {
            Value::Nodes(nodes) => Ok(nodes.into_iter().map(|n| n.path).collect()),
            _ => Err(RpcError::invalid_value(format!(
                "XPath expression '{}' does not select nodes",
                self.source
            ))),
        }
    }
}

// Lexer

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Slash,
    DoubleSlash,
    Dot,
    DotDot,
    At,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Pipe,
    Star,
    ColonColon,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Name(String),
    PrefixWildcard(String),
    Literal(String),
    Number(f64),
}

impl Token {
    /// Whether a following `*`, `and`, or `or` is an operand rather than an
    /// operator.
    fn expects_operand(&self) -> bool {
        matches!(
            self,
            Token::At
                | Token::ColonColon
                | Token::LParen
                | Token::LBracket
                | Token::Comma
                | Token::Slash
                | Token::DoubleSlash
                | Token::Pipe
                | Token::Eq
                | Token::Ne
                | Token::Lt
                | Token::Le
                | Token::Gt
                | Token::Ge
                | Token::And
                | Token::Or
        )
    }
}

fn is_name_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-' || c == '.'
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens: Vec<Token> = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
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
            '.' if next == Some('.') => {
                i += 2;
                Token::DotDot
            }
            '.' if !next.map_or(false, |n| n.is_ascii_digit()) => {
                i += 1;
                Token::Dot
            }
            '@' => {
                i += 1;
                Token::At
            }
            ',' => {
                i += 1;
                Token::Comma
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
            '|' => {
                i += 1;
                Token::Pipe
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
                Token::Eq
            }
            '!' if next == Some('=') => {
                i += 2;
                Token::Ne
            }
            '<' if next == Some('=') => {
                i += 2;
                Token::Le
            }
            '<' => {
                i += 1;
                Token::Lt
            }
            '>' if next == Some('=') => {
                i += 2;
                Token::Ge
            }
            '>' => {
                i += 1;
                Token::Gt
            }
            '\'' | '"' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&q| q == c)
                    .ok_or_else(|| "unterminated string literal".to_string())?;
                let literal: String = chars[i + 1..i + 1 + end].iter().collect();
                i += end + 2;
                Token::Literal(literal)
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                if i < chars.len() && chars[i] == '.' {
                    i += 1;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                Token::Number(text.parse().map_err(|_| format!("invalid number '{}'", text))?)
            }
            c if is_name_start(c) => {
                let start = i;
                while i < chars.len() && is_name_char(chars[i]) {
                    i += 1;
                }
                let mut name: String = chars[start..i].iter().collect();
                if chars.get(i) == Some(&':') && chars.get(i + 1) != Some(&':') {
                    match chars.get(i + 1) {
                        Some('*') => {
                            i += 2;
                            tokens.push(Token::PrefixWildcard(name));
                            continue;
                        }
                        Some(&n) if is_name_start(n) => {
                            i += 1;
                            let local_start = i;
                            while i < chars.len() && is_name_char(chars[i]) {
                                i += 1;
                            }
                            name.push(':');
                            name.extend(&chars[local_start..i]);
                        }
                        _ => return Err(format!("invalid qualified name after '{}:'", name)),
                    }
                }
                let operator_position = tokens.last().map_or(false, |t| !t.expects_operand());
                match name.as_str() {
                    "and" if operator_position => Token::And,
                    "or" if operator_position => Token::Or,
                    _ => Token::Name(name),
                }
            }
            other => return Err(format!("unexpected character '{}'", other)),
        };
        tokens.push(token);
    }

    Ok(tokens)
}

// Syntax tree

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Child,
    Descendant,
    DescendantOrSelf,
    SelfNode,
    Parent,
    Attribute,
}

#[derive(Debug, Clone, PartialEq)]
enum NodeTest {
    Any,
    Namespace(String),
    Name { ns: Option<String>, local: String },
    Text,
    Node,
}

#[derive(Debug, Clone)]
struct Step {
    axis: Axis,
    test: NodeTest,
    predicates: Vec<Expr>,
}

impl Step {
    fn descendant_or_self() -> Self {
        Step {
            axis: Axis::DescendantOrSelf,
            test: NodeTest::Node,
            predicates: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
    Union(Box<Expr>, Box<Expr>),
    Path { absolute: bool, steps: Vec<Step> },
    Filtered {
        primary: Box<Expr>,
        predicates: Vec<Expr>,
        steps: Vec<Step>,
    },
    Literal(String),
    Number(f64),
    Function(String, Vec<Expr>),
}

const FUNCTIONS: &[(&str, usize, usize)] = &[
    ("not", 1, 1),
    ("count", 1, 1),
    ("position", 0, 0),
    ("last", 0, 0),
    ("contains", 2, 2),
    ("starts-with", 2, 2),
    ("string", 0, 1),
    ("number", 0, 1),
    ("local-name", 0, 1),
    ("true", 0, 0),
    ("false", 0, 0),
];

/// Recursive descent parser over the token stream.
struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    namespaces: &'a HashMap<&'a str, &'a str>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> Result<(), String> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(format!("expected {:?}, found {:?}", token, self.peek()))
        }
    }

    fn resolve(&self, prefix: &str) -> Result<String, String> {
        self.namespaces
            .get(prefix)
            .map(|uri| uri.to_string())
            .ok_or_else(|| format!("undeclared namespace prefix '{}'", prefix))
    }

    fn parse_expr(&mut self) -> Result<Expr, String> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::Or) {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_equality()?;
        while self.eat(&Token::And) {
            let right = self.parse_equality()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_relational()?;
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => CmpOp::Eq,
                Some(Token::Ne) => CmpOp::Ne,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_relational()?;
            left = Expr::Compare(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_relational(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_union()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => CmpOp::Lt,
                Some(Token::Le) => CmpOp::Le,
                Some(Token::Gt) => CmpOp::Gt,
                Some(Token::Ge) => CmpOp::Ge,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_union()?;
            left = Expr::Compare(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_union(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_path()?;
        while self.eat(&Token::Pipe) {
            let right = self.parse_path()?;
            left = Expr::Union(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn starts_step(&self) -> bool {
        matches!(
            self.peek(),
            Some(Token::Name(_))
                | Some(Token::PrefixWildcard(_))
                | Some(Token::Star)
                | Some(Token::At)
                | Some(Token::Dot)
                | Some(Token::DotDot)
        )
    }

    fn starts_primary(&self) -> bool {
        match self.peek() {
            Some(Token::Literal(_)) | Some(Token::Number(_)) | Some(Token::LParen) => true,
            Some(Token::Name(name)) => {
                self.peek_at(1) == Some(&Token::LParen) && name != "text" && name != "node"
            }
            _ => false,
        }
    }

    fn parse_path(&mut self) -> Result<Expr, String> {
        match self.peek() {
            Some(Token::Slash) => {
                self.pos += 1;
                let mut steps = Vec::new();
                if self.starts_step() {
                    self.parse_relative(&mut steps)?;
                }
                Ok(Expr::Path {
                    absolute: true,
                    steps,
                })
            }
            Some(Token::DoubleSlash) => {
                self.pos += 1;
                let mut steps = vec![Step::descendant_or_self()];
                self.parse_relative(&mut steps)?;
                Ok(Expr::Path {
                    absolute: true,
                    steps,
                })
            }
            _ if self.starts_primary() => {
                let primary = self.parse_primary()?;
                let predicates = self.parse_predicates()?;
                let mut steps = Vec::new();
                match self.peek() {
                    Some(Token::Slash) => {
                        self.pos += 1;
                        self.parse_relative(&mut steps)?;
                    }
                    Some(Token::DoubleSlash) => {
                        self.pos += 1;
                        steps.push(Step::descendant_or_self());
                        self.parse_relative(&mut steps)?;
                    }
                    _ => {}
                }
                if predicates.is_empty() && steps.is_empty() {
                    Ok(primary)
                } else {
                    Ok(Expr::Filtered {
                        primary: Box::new(primary),
                        predicates,
                        steps,
                    })
                }
            }
            _ => {
                let mut steps = Vec::new();
                self.parse_relative(&mut steps)?;
                Ok(Expr::Path {
                    absolute: false,
                    steps,
                })
            }
        }
    }

    fn parse_relative(&mut self, steps: &mut Vec<Step>) -> Result<(), String> {
        steps.push(self.parse_step()?);
        loop {
            if self.eat(&Token::Slash) {
                steps.push(self.parse_step()?);
            } else if self.eat(&Token::DoubleSlash) {
                steps.push(Step::descendant_or_self());
                steps.push(self.parse_step()?);
            } else {
                return Ok(());
            }
        }
    }

    fn parse_step(&mut self) -> Result<Step, String> {
        if self.eat(&Token::Dot) {
            return Ok(Step {
                axis: Axis::SelfNode,
                test: NodeTest::Node,
                predicates: Vec::new(),
            });
        }
        if self.eat(&Token::DotDot) {
            return Ok(Step {
                axis: Axis::Parent,
                test: NodeTest::Node,
                predicates: Vec::new(),
            });
        }

        let axis = if self.eat(&Token::At) {
            Axis::Attribute
        } else if self.peek_at(1) == Some(&Token::ColonColon) {
            let axis = match self.advance() {
                Some(Token::Name(name)) => match name.as_str() {
                    "child" => Axis::Child,
                    "descendant" => Axis::Descendant,
                    "descendant-or-self" => Axis::DescendantOrSelf,
                    "self" => Axis::SelfNode,
                    "parent" => Axis::Parent,
                    "attribute" => Axis::Attribute,
                    other => return Err(format!("unsupported axis '{}'", other)),
                },
                other => return Err(format!("expected axis name, found {:?}", other)),
            };
            self.pos += 1;
            axis
        } else {
            Axis::Child
        };

        let test = match self.advance() {
            Some(Token::Star) => NodeTest::Any,
            Some(Token::PrefixWildcard(prefix)) => NodeTest::Namespace(self.resolve(&prefix)?),
            Some(Token::Name(name)) if self.peek() == Some(&Token::LParen) => {
                let test = match name.as_str() {
                    "text" => NodeTest::Text,
                    "node" => NodeTest::Node,
                    other => return Err(format!("unsupported node test '{}()'", other)),
                };
                self.expect(Token::LParen)?;
                self.expect(Token::RParen)?;
                test
            }
            Some(Token::Name(name)) => match name.split_once(':') {
                Some((prefix, local)) => NodeTest::Name {
                    ns: Some(self.resolve(prefix)?),
                    local: local.to_string(),
                },
                None => NodeTest::Name { ns: None, local: name },
            },
            other => return Err(format!("expected node test, found {:?}", other)),
        };

        Ok(Step {
            axis,
            test,
            predicates: self.parse_predicates()?,
        })
    }

    fn parse_predicates(&mut self) -> Result<Vec<Expr>, String> {
        let mut predicates = Vec::new();
        while self.eat(&Token::LBracket) {
            predicates.push(self.parse_expr()?);
            self.expect(Token::RBracket)?;
        }
        Ok(predicates)
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.advance() {
            Some(Token::Literal(s)) => Ok(Expr::Literal(s)),
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::LParen) => {
                let expr = self.parse_expr()?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            Some(Token::Name(name)) => {
                self.expect(Token::LParen)?;
                let mut args = Vec::new();
                if !self.eat(&Token::RParen) {
                    loop {
                        args.push(self.parse_expr()?);
                        if self.eat(&Token::RParen) {
                            break;
                        }
                        self.expect(Token::Comma)?;
                    }
                }
                let (_, min, max) = FUNCTIONS
                    .iter()
                    .find(|(f, _, _)| *f == name)
                    .ok_or_else(|| format!("unsupported function '{}()'", name))?;
                if args.len() < *min || args.len() > *max {
                    return Err(format!("wrong number of arguments to '{}()'", name));
                }
                Ok(Expr::Function(name, args))
            }
            other => Err(format!("unexpected {:?}", other)),
        }
    }
}

// Evaluation

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum NodeKind {
    Element,
    Attribute(usize),
    Text,
}

/// A node addressed by its element path from the root; the empty path is
/// the document node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct Node {
    path: Vec<usize>,
    kind: NodeKind,
}

impl Node {
    fn root() -> Self {
        Node {
            path: Vec::new(),
            kind: NodeKind::Element,
        }
    }

    fn element(path: Vec<usize>) -> Self {
        Node {
            path,
            kind: NodeKind::Element,
        }
    }

    fn is_root(&self) -> bool {
        self.path.is_empty() && self.kind == NodeKind::Element
    }
}

#[derive(Debug, Clone)]
enum Value {
    Nodes(Vec<Node>),
    Bool(bool),
    Number(f64),
    Str(String),
}

struct Context {
    node: Node,
    position: usize,
    size: usize,
}

struct Evaluator<'a> {
    root: &'a Element,
}

fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

fn parse_number(s: &str) -> f64 {
    s.trim().parse().unwrap_or(f64::NAN)
}

fn compare_atoms(op: CmpOp, left: &Value, right: &Value, strings: impl Fn(&Value) -> String) -> bool {
    match op {
        CmpOp::Eq | CmpOp::Ne => {
            let equal = match (left, right) {
                (Value::Bool(_), _) | (_, Value::Bool(_)) => boolean(left) == boolean(right),
                (Value::Number(_), _) | (_, Value::Number(_)) => {
                    number_of(left, &strings) == number_of(right, &strings)
                }
                _ => strings(left) == strings(right),
            };
            equal == (op == CmpOp::Eq)
        }
        _ => {
            let (l, r) = (number_of(left, &strings), number_of(right, &strings));
            match op {
                CmpOp::Lt => l < r,
                CmpOp::Le => l <= r,
                CmpOp::Gt => l > r,
                _ => l >= r,
            }
        }
    }
}

fn number_of(value: &Value, strings: &impl Fn(&Value) -> String) -> f64 {
    match value {
        Value::Number(n) => *n,
        Value::Bool(b) => f64::from(u8::from(*b)),
        other => parse_number(&strings(other)),
    }
}

fn boolean(value: &Value) -> bool {
    match value {
        Value::Nodes(nodes) => !nodes.is_empty(),
        Value::Bool(b) => *b,
        Value::Number(n) => *n != 0.0 && !n.is_nan(),
        Value::Str(s) => !s.is_empty(),
    }
}

impl<'a> Evaluator<'a> {
    fn element(&self, path: &[usize]) -> Option<&'a Element> {
        path.iter().try_fold(self.root, |el, &i| el.children.get(i))
    }

    fn string_value(&self, node: &Node) -> String {
        let Some(el) = self.element(&node.path) else {
            return String::new();
        };
        match node.kind {
            NodeKind::Element => {
                fn collect(el: &Element, out: &mut String) {
                    out.push_str(el.text());
                    for child in &el.children {
                        collect(child, out);
                    }
                }
                let mut out = String::new();
                collect(el, &mut out);
                out
            }
            NodeKind::Attribute(i) => el.attributes.get(i).map(|a| a.value.clone()).unwrap_or_default(),
            NodeKind::Text => el.text().to_string(),
        }
    }

    fn string(&self, value: &Value) -> String {
        match value {
            Value::Nodes(nodes) => nodes.first().map(|n| self.string_value(n)).unwrap_or_default(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::Str(s) => s.clone(),
        }
    }

    fn eval(&self, expr: &Expr, ctx: &Context) -> Result<Value, RpcError> {
        match expr {
            Expr::Or(l, r) => Ok(Value::Bool(
                boolean(&self.eval(l, ctx)?) || boolean(&self.eval(r, ctx)?),
            )),
            Expr::And(l, r) => Ok(Value::Bool(
                boolean(&self.eval(l, ctx)?) && boolean(&self.eval(r, ctx)?),
            )),
            Expr::Compare(op, l, r) => {
                let left = self.eval(l, ctx)?;
                let right = self.eval(r, ctx)?;
                Ok(Value::Bool(self.compare(*op, &left, &right)))
            }
            Expr::Union(l, r) => {
                let mut nodes: BTreeSet<Node> = self.node_set(self.eval(l, ctx)?)?.into_iter().collect();
                nodes.extend(self.node_set(self.eval(r, ctx)?)?);
                Ok(Value::Nodes(nodes.into_iter().collect()))
            }
            Expr::Path { absolute, steps } => {
                let start = if *absolute { Node::root() } else { ctx.node.clone() };
                Ok(Value::Nodes(self.eval_steps(vec![start], steps)?))
            }
            Expr::Filtered {
                primary,
                predicates,
                steps,
            } => {
                let mut nodes = self.node_set(self.eval(primary, ctx)?)?;
                for predicate in predicates {
                    nodes = self.apply_predicate(nodes, predicate)?;
                }
                Ok(Value::Nodes(self.eval_steps(nodes, steps)?))
            }
            Expr::Literal(s) => Ok(Value::Str(s.clone())),
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::Function(name, args) => self.call(name, args, ctx),
        }
    }

    fn node_set(&self, value: Value) -> Result<Vec<Node>, RpcError> {
        match value {
            Value::Nodes(nodes) => Ok(nodes),
            other => Err(RpcError::invalid_value(format!(
                "expected a node-set, found {:?}",
                other
            ))),
        }
    }

    fn compare(&self, op: CmpOp, left: &Value, right: &Value) -> bool {
        let strings = |v: &Value| self.string(v);
        match (left, right) {
            (Value::Nodes(a), Value::Nodes(b)) => a.iter().any(|x| {
                let x = Value::Str(self.string_value(x));
                b.iter()
                    .any(|y| compare_atoms(op, &x, &Value::Str(self.string_value(y)), strings))
            }),
            (Value::Nodes(a), Value::Bool(_)) | (Value::Bool(_), Value::Nodes(a)) => {
                let set = Value::Bool(!a.is_empty());
                if matches!(left, Value::Nodes(_)) {
                    compare_atoms(op, &set, right, strings)
                } else {
                    compare_atoms(op, left, &set, strings)
                }
            }
            (Value::Nodes(a), other) => a
                .iter()
                .any(|x| compare_atoms(op, &Value::Str(self.string_value(x)), other, strings)),
            (other, Value::Nodes(b)) => b
                .iter()
                .any(|y| compare_atoms(op, other, &Value::Str(self.string_value(y)), strings)),
            _ => compare_atoms(op, left, right, strings),
        }
    }

    fn call(&self, name: &str, args: &[Expr], ctx: &Context) -> Result<Value, RpcError> {
        let arg = |i: usize| self.eval(&args[i], ctx);
        let value = match name {
            "not" => Value::Bool(!boolean(&arg(0)?)),
            "count" => Value::Number(self.node_set(arg(0)?)?.len() as f64),
            "position" => Value::Number(ctx.position as f64),
            "last" => Value::Number(ctx.size as f64),
            "contains" => Value::Bool(self.string(&arg(0)?).contains(&self.string(&arg(1)?))),
            "starts-with" => Value::Bool(self.string(&arg(0)?).starts_with(&self.string(&arg(1)?))),
            "string" => match args.first() {
                Some(_) => Value::Str(self.string(&arg(0)?)),
                None => Value::Str(self.string_value(&ctx.node)),
            },
            "number" => {
                let value = match args.first() {
                    Some(_) => arg(0)?,
                    None => Value::Str(self.string_value(&ctx.node)),
                };
                Value::Number(number_of(&value, &|v: &Value| self.string(v)))
            }
            "local-name" => {
                let node = match args.first() {
                    Some(_) => self.node_set(arg(0)?)?.into_iter().next(),
                    None => Some(ctx.node.clone()),
                };
                Value::Str(node.map(|n| self.local_name(&n)).unwrap_or_default())
            }
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            other => {
                return Err(RpcError::invalid_value(format!(
                    "unsupported function '{}()'",
                    other
                )))
            }
        };
        Ok(value)
    }

    fn local_name(&self, node: &Node) -> String {
        if node.is_root() {
            return String::new();
        }
        match (self.element(&node.path), &node.kind) {
            (Some(el), NodeKind::Element) => el.name.clone(),
            (Some(el), NodeKind::Attribute(i)) => {
                el.attributes.get(*i).map(|a| a.name.clone()).unwrap_or_default()
            }
            _ => String::new(),
        }
    }

    fn eval_steps(&self, start: Vec<Node>, steps: &[Step]) -> Result<Vec<Node>, RpcError> {
        let mut current = start;
        for step in steps {
            let mut next = BTreeSet::new();
            for node in &current {
                let mut candidates: Vec<Node> = self
                    .axis(node, step.axis)
                    .into_iter()
                    .filter(|n| self.test(n, &step.test, step.axis))
                    .collect();
                for predicate in &step.predicates {
                    candidates = self.apply_predicate(candidates, predicate)?;
                }
                next.extend(candidates);
            }
            current = next.into_iter().collect();
        }
        Ok(current)
    }

    fn apply_predicate(&self, nodes: Vec<Node>, predicate: &Expr) -> Result<Vec<Node>, RpcError> {
        let size = nodes.len();
        let mut kept = Vec::new();
        for (i, node) in nodes.into_iter().enumerate() {
            let ctx = Context {
                node,
                position: i + 1,
                size,
            };
            let keep = match self.eval(predicate, &ctx)? {
                Value::Number(n) => (ctx.position as f64) == n,
                other => boolean(&other),
            };
            if keep {
                kept.push(ctx.node);
            }
        }
        Ok(kept)
    }

    fn children(&self, node: &Node, out: &mut Vec<Node>, recursive: bool) {
        if node.kind != NodeKind::Element {
            return;
        }
        let Some(el) = self.element(&node.path) else { return };
        if !node.is_root() && !el.text().is_empty() {
            out.push(Node {
                path: node.path.clone(),
                kind: NodeKind::Text,
            });
        }
        for i in 0..el.children.len() {
            let mut path = node.path.clone();
            path.push(i);
            let child = Node::element(path);
            out.push(child.clone());
            if recursive {
                self.children(&child, out, true);
            }
        }
    }

    fn axis(&self, node: &Node, axis: Axis) -> Vec<Node> {
        let mut out = Vec::new();
        match axis {
            Axis::Child => self.children(node, &mut out, false),
            Axis::Descendant => self.children(node, &mut out, true),
            Axis::DescendantOrSelf => {
                out.push(node.clone());
                self.children(node, &mut out, true);
            }
            Axis::SelfNode => out.push(node.clone()),
            Axis::Parent => match node.kind {
                NodeKind::Element if node.path.is_empty() => {}
                NodeKind::Element => {
                    out.push(Node::element(node.path[..node.path.len() - 1].to_vec()))
                }
                _ => out.push(Node::element(node.path.clone())),
            },
            Axis::Attribute => {
                if node.kind == NodeKind::Element && !node.is_root() {
                    if let Some(el) = self.element(&node.path) {
                        out.extend((0..el.attributes.len()).map(|i| Node {
                            path: node.path.clone(),
                            kind: NodeKind::Attribute(i),
                        }));
                    }
                }
            }
        }
        out
    }

    fn test(&self, node: &Node, test: &NodeTest, axis: Axis) -> bool {
        let principal = if axis == Axis::Attribute {
            matches!(node.kind, NodeKind::Attribute(_))
        } else {
            node.kind == NodeKind::Element && !node.is_root()
        };
        let name = || -> Option<(Option<&'a str>, &'a str)> {
            let el = self.element(&node.path)?;
            match node.kind {
                NodeKind::Element => Some((el.ns.as_deref(), el.name.as_str())),
                NodeKind::Attribute(i) => el
                    .attributes
                    .get(i)
                    .map(|a| (a.ns.as_deref(), a.name.as_str())),
                NodeKind::Text => None,
            }
        };
        match test {
            NodeTest::Node => true,
            NodeTest::Text => node.kind == NodeKind::Text,
            NodeTest::Any => principal,
            NodeTest::Namespace(uri) => {
                principal && name().map_or(false, |(ns, _)| ns == Some(uri.as_str()))
            }
            NodeTest::Name { ns, local } => {
                principal
                    && name().map_or(false, |(node_ns, node_local)| {
                        node_local == local
                            && ns.as_deref().map_or(true, |wanted| node_ns == Some(wanted))
                    })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::users;
    use super::super::Filter;
    use super::*;
    use netconf_protocol::ErrorTag;

    fn xpath(select: &str) -> Filter {
        Filter::XPath {
            select: select.to_string(),
            namespaces: vec![("t".to_string(), "http://example.com/schema/1.2/config".to_string())],
        }
    }

    fn user_names(out: &Element) -> Vec<String> {
        out.find(&["top", "users"])
            .map(|users| {
                users
                    .children
                    .iter()
                    .filter_map(|u| u.child("name").map(|n| n.text().to_string()))
                    .collect()
            })
            .unwrap_or_default()
    }

    #[test]
    fn test_predicate_selects_whole_entry() {
        let out = xpath("/top/users/user[name='fred']").apply(&users()).unwrap();
        assert_eq!(user_names(&out), vec!["fred"]);
        let fred = out.find(&["top", "users", "user"]).unwrap();
        assert_eq!(fred.children.len(), 4);
        assert_eq!(fred.find(&["company-info", "id"]).unwrap().text(), "2");
    }

    #[test]
    fn test_prefixed_names() {
        let out = xpath("/t:top/t:users/t:user[t:type='admin']/t:name")
            .apply(&users())
            .unwrap();
        assert_eq!(user_names(&out), vec!["fred", "barney"]);

        let none = Filter::XPath {
            select: "/t:top".to_string(),
            namespaces: vec![("t".to_string(), "urn:other".to_string())],
        }
        .apply(&users())
        .unwrap();
        assert!(none.children.is_empty());
    }

    #[test]
    fn test_descendant_and_position() {
        let out = xpath("//user[2]").apply(&users()).unwrap();
        assert_eq!(user_names(&out), vec!["fred"]);

        let out = xpath("//user[position() = last()]").apply(&users()).unwrap();
        assert_eq!(user_names(&out), vec!["barney"]);
    }

    #[test]
    fn test_union_and_boolean_operators() {
        let out = xpath("//user[name='root'] | //user[name='barney']")
            .apply(&users())
            .unwrap();
        assert_eq!(user_names(&out), vec!["root", "barney"]);

        let out = xpath("//user[type='admin' and not(starts-with(name, 'f'))]")
            .apply(&users())
            .unwrap();
        assert_eq!(user_names(&out), vec!["barney"]);

        let out = xpath("//user[company-info/id >= 2 or name = 'root']")
            .apply(&users())
            .unwrap();
        assert_eq!(user_names(&out).len(), 3);
    }

    #[test]
    fn test_text_and_attribute_results_select_owner() {
        let out = xpath("//user/name[contains(., 'ar')]/text()")
            .apply(&users())
            .unwrap();
        let user = out.find(&["top", "users", "user"]).unwrap();
        assert_eq!(user.children.len(), 1);
        assert_eq!(user.child("name").unwrap().text(), "barney");

        let data = Element::parse(
            r#"<data><ifs><if name="eth0"><mtu>1500</mtu></if><if name="eth1"/></ifs></data>"#,
        )
        .unwrap();
        let out = xpath("/ifs/if/@name[. = 'eth0']").apply(&data).unwrap();
        let ifs = out.child("ifs").unwrap();
        assert_eq!(ifs.children.len(), 1);
        assert_eq!(ifs.children[0].attr("name"), Some("eth0"));
        assert_eq!(ifs.children[0].child("mtu").unwrap().text(), "1500");
    }

    #[test]
    fn test_count_and_parent() {
        let out = xpath("/top/users[count(user) = 3]/user[1]/name/..")
            .apply(&users())
            .unwrap();
        assert_eq!(user_names(&out), vec!["root"]);
    }

    #[test]
    fn test_root_selects_everything() {
        let data = users();
        assert_eq!(xpath("/").apply(&data).unwrap(), data);
    }

    #[test]
    fn test_names_that_look_like_operators() {
        let data = Element::parse(r#"<data><and><or>1</or></and></data>"#).unwrap();
        let out = xpath("/and/or").apply(&data).unwrap();
        assert_eq!(out.find(&["and", "or"]).unwrap().text(), "1");
    }

    #[test]
    fn test_invalid_expressions() {
        for bad in ["", "/top[", "user[name=", "//", "foo(1)", "p:top", "/top/'x'", "a !b"] {
            let err = xpath(bad).apply(&users()).unwrap_err();
            assert_eq!(err.tag, ErrorTag::InvalidValue, "expression {:?}", bad);
        }
    }

    #[test]
    fn test_non_node_result_is_rejected() {
        let err = xpath("count(//user)").apply(&users()).unwrap_err();
        assert_eq!(err.tag, ErrorTag::InvalidValue);
    }

    #[test]
    fn test_parse_keeps_source() {
        let expr = XPath::parse("/top", &[]).unwrap();
        assert_eq!(expr.as_str(), "/top");
    }
}
