//! Relation expressions: `pets(onlyDogs).owner, movies.[actors, director]`.
//!
//! A path is a dot-separated list of relation names. Every segment may carry
//! a filter list `(f1, f2)` and a recursion marker (`^`, `^3`, or a leading
//! `+`). `.[a, b]` branches into several children and `*` matches every
//! relation of the owner.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{RelationError, Result};
use crate::filters::FilterFn;

pub const WILDCARD: &str = "*";

/// How many more times a self-referencing node repeats below itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recursion {
    Unbounded,
    Bounded(u32),
}

impl Recursion {
    fn step(self) -> Option<Recursion> {
        match self {
            Recursion::Unbounded => Some(Recursion::Unbounded),
            Recursion::Bounded(n) if n > 1 => Some(Recursion::Bounded(n - 1)),
            Recursion::Bounded(_) => None,
        }
    }

    fn covers(self, other: Recursion) -> bool {
        match (self, other) {
            (Recursion::Unbounded, _) => true,
            (Recursion::Bounded(_), Recursion::Unbounded) => false,
            (Recursion::Bounded(a), Recursion::Bounded(b)) => a >= b,
        }
    }

    fn widest(self, other: Recursion) -> Recursion {
        if self.covers(other) {
            self
        } else {
            other
        }
    }
}

#[derive(Clone, Default)]
pub struct RelationExpression {
    name: String,
    children: BTreeMap<String, RelationExpression>,
    args: Vec<String>,
    filters: Vec<FilterFn>,
    recursion: Option<Recursion>,
}

impl RelationExpression {
    /// An empty root expression.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        Parser::new(text).parse_root()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Named filters to apply to the query for this node.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Anonymous filters grafted with [`add_anonymous_filter_at_path`](Self::add_anonymous_filter_at_path).
    pub fn anonymous_filters(&self) -> &[FilterFn] {
        &self.filters
    }

    pub fn recursion(&self) -> Option<Recursion> {
        self.recursion
    }

    pub fn children(&self) -> impl Iterator<Item = &RelationExpression> {
        self.children.values()
    }

    pub fn child(&self, name: &str) -> Option<&RelationExpression> {
        self.children.get(name)
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    /// Nothing below this node: no children and no recursion.
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty() && self.recursion.is_none()
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        let arg = arg.into();
        if !self.args.contains(&arg) {
            self.args.push(arg);
        }
        self
    }

    pub fn with_recursion(mut self, recursion: Recursion) -> Self {
        self.recursion = Some(recursion);
        self
    }

    pub fn with_child(mut self, child: RelationExpression) -> Self {
        self.insert_child(child);
        self
    }

    /// Adds `child`, merging into an existing child of the same name.
    pub fn insert_child(&mut self, child: RelationExpression) {
        match self.children.get_mut(&child.name) {
            Some(existing) => existing.merge(&child),
            None => {
                self.children.insert(child.name.clone(), child);
            }
        }
    }

    /// Union of children; filters concatenated; the wider recursion wins.
    pub fn merge(&mut self, other: &RelationExpression) {
        for arg in &other.args {
            if !self.args.contains(arg) {
                self.args.push(arg.clone());
            }
        }
        self.filters.extend(other.filters.iter().cloned());
        self.recursion = match (self.recursion, other.recursion) {
            (Some(a), Some(b)) => Some(a.widest(b)),
            (a, b) => a.or(b),
        };
        for child in other.children.values() {
            self.insert_child(child.clone());
        }
    }

    /// The expression to apply to relation `name` one level down: the
    /// wildcard subtree, the specific child and, for a recursive node named
    /// `name`, the node itself with one less level of recursion.
    pub fn child_expression(&self, name: &str) -> Option<RelationExpression> {
        let mut out: Option<RelationExpression> = None;

        if let Some(wildcard) = self.children.get(WILDCARD) {
            let mut node = wildcard.clone();
            node.name = name.to_string();
            out = Some(node);
        }

        if name != WILDCARD {
            if let Some(specific) = self.children.get(name) {
                match out.as_mut() {
                    Some(node) => node.merge(specific),
                    None => out = Some(specific.clone()),
                }
            }
        }

        if self.name == name {
            if let Some(next) = self.recursion.and_then(Recursion::step) {
                let mut node = self.clone();
                node.recursion = Some(next);
                match out.as_mut() {
                    Some(existing) => existing.merge(&node),
                    None => out = Some(node),
                }
            }
        }

        out
    }

    /// Attaches `filter` to the node at the dotted `path`, creating missing
    /// nodes on the way.
    pub fn add_anonymous_filter_at_path(&mut self, path: &str, filter: FilterFn) -> Result<()> {
        let segments: Vec<&str> = path.split('.').map(str::trim).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(RelationError::ExpressionSyntax {
                expression: path.to_string(),
                position: 0,
                message: "empty segment in filter path".to_string(),
            });
        }

        let mut node = self;
        for segment in segments {
            node = node
                .children
                .entry(segment.to_string())
                .or_insert_with(|| RelationExpression::named(segment));
        }
        node.filters.push(filter);
        Ok(())
    }

    /// Every path and filter reachable in `self` is also reachable in `other`.
    pub fn is_subset_of(&self, other: &RelationExpression) -> bool {
        if !self.args.iter().all(|arg| other.args.contains(arg)) {
            return false;
        }
        match (self.recursion, other.recursion) {
            (None, _) => {}
            (Some(_), None) => return false,
            (Some(mine), Some(theirs)) => {
                if !theirs.covers(mine) {
                    return false;
                }
            }
        }
        self.children.values().all(|child| {
            other
                .child_expression(&child.name)
                .map(|allowed| child.is_subset_of(&allowed))
                .unwrap_or(false)
        })
    }

    fn write_node(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.args.is_empty() {
            write!(f, "({})", self.args.join(", "))?;
        }
        match self.recursion {
            Some(Recursion::Unbounded) => write!(f, "^")?,
            Some(Recursion::Bounded(n)) => write!(f, "^{}", n)?,
            None => {}
        }
        if !self.children.is_empty() {
            write!(f, ".")?;
            self.write_children(f)?;
        }
        Ok(())
    }

    fn write_children(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.children.len() == 1 {
            if let Some(child) = self.children.values().next() {
                return child.write_node(f);
            }
        }
        write!(f, "[")?;
        for (i, child) in self.children.values().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            child.write_node(f)?;
        }
        write!(f, "]")
    }
}

impl PartialEq for RelationExpression {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.args == other.args
            && self.recursion == other.recursion
            && self.filters.len() == other.filters.len()
            && self.children == other.children
    }
}

impl fmt::Display for RelationExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            if self.children.is_empty() {
                return Ok(());
            }
            return self.write_children(f);
        }
        self.write_node(f)
    }
}

impl fmt::Debug for RelationExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelationExpression")
            .field("name", &self.name)
            .field("args", &self.args)
            .field("recursion", &self.recursion)
            .field("filters", &self.filters.len())
            .field("children", &self.children)
            .finish()
    }
}

impl FromStr for RelationExpression {
    type Err = RelationError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

struct Parser<'a> {
    text: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            chars: text.chars().collect(),
            pos: 0,
        }
    }

    fn error(&self, message: impl Into<String>) -> RelationError {
        RelationError::ExpressionSyntax {
            expression: self.text.to_string(),
            position: self.pos,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().map_or(false, char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, c: char) -> bool {
        self.skip_ws();
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: char) -> Result<()> {
        if self.eat(c) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", c)))
        }
    }

    fn parse_root(mut self) -> Result<RelationExpression> {
        let mut root = RelationExpression::new();
        self.skip_ws();
        if self.peek().is_none() {
            return Ok(root);
        }
        if self.eat('[') {
            self.parse_list(&mut root, Some(']'))?;
        } else {
            self.parse_list(&mut root, None)?;
        }
        self.skip_ws();
        match self.peek() {
            None => Ok(root),
            Some(c) => Err(self.error(format!("unexpected '{}'", c))),
        }
    }

    fn parse_list(&mut self, parent: &mut RelationExpression, close: Option<char>) -> Result<()> {
        loop {
            if let Some(c) = close {
                if self.eat(c) {
                    return Ok(());
                }
            }
            let node = self.parse_path()?;
            parent.insert_child(node);
            if self.eat(',') {
                continue;
            }
            return match close {
                Some(c) => self.expect(c),
                None => Ok(()),
            };
        }
    }

    fn parse_path(&mut self) -> Result<RelationExpression> {
        let mut node = self.parse_segment()?;
        if self.eat('.') {
            if self.eat('[') {
                self.parse_list(&mut node, Some(']'))?;
            } else if self.eat('^') {
                let recursion = self.parse_depth()?;
                node.recursion = Some(recursion);
            } else {
                let child = self.parse_path()?;
                node.insert_child(child);
            }
        }
        Ok(node)
    }

    fn parse_segment(&mut self) -> Result<RelationExpression> {
        let recursive = self.eat('+');
        let name = self.parse_name()?;
        let mut node = RelationExpression::named(name);
        if recursive {
            node.recursion = Some(Recursion::Unbounded);
        }
        if self.eat('(') {
            loop {
                if self.eat(')') {
                    break;
                }
                let arg = self.parse_identifier("filter name")?;
                if !node.args.contains(&arg) {
                    node.args.push(arg);
                }
                if self.eat(',') {
                    continue;
                }
                self.expect(')')?;
                break;
            }
        }
        if self.eat('^') {
            node.recursion = Some(self.parse_depth()?);
        }
        Ok(node)
    }

    fn parse_name(&mut self) -> Result<String> {
        if self.eat('*') {
            return Ok(WILDCARD.to_string());
        }
        self.parse_identifier("relation name")
    }

    fn parse_identifier(&mut self, what: &str) -> Result<String> {
        self.skip_ws();
        let start = self.pos;
        while self
            .peek()
            .map_or(false, |c| c.is_alphanumeric() || c == '_' || c == '$')
        {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.error(format!("expected {}", what)));
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    fn parse_depth(&mut self) -> Result<Recursion> {
        let start = self.pos;
        while self.peek().map_or(false, |c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        if start == self.pos {
            return Ok(Recursion::Unbounded);
        }
        let digits: String = self.chars[start..self.pos].iter().collect();
        match digits.parse::<u32>() {
            Ok(0) => Err(self.error("recursion depth must be positive")),
            Ok(n) => Ok(Recursion::Bounded(n)),
            Err(_) => Err(self.error("recursion depth out of range")),
        }
    }
}
