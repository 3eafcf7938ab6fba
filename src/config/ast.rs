//! The abstract syntax tree produced by the configuration parser.

use std::fmt;

use serde::Serialize;

use super::value::Value;

/// Position of a syntactic element in the source document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Span {
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// A parsed configuration document: the component blocks, in source order.
#[derive(Debug, Clone, Default)]
pub struct SourceFile {
    pub components: Vec<Block>,
}

impl SourceFile {
    pub fn new(components: Vec<Block>) -> Self {
        Self { components }
    }
}

/// One component block: `<component_type> "<label>" { ... }`.
#[derive(Debug, Clone)]
pub struct Block {
    /// Dotted component type name, e.g. `remote.http`.
    pub name: String,
    /// User-chosen label. Together with `name` it forms the node ID.
    pub label: String,
    /// The block's attributes, in source order.
    pub body: Vec<Attribute>,
    pub span: Span,
}

impl Block {
    pub fn new(name: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            body: Vec::new(),
            span: Span { line: 0, column: 0 },
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: Expr) -> Self {
        let span = self.span;
        self.body.push(Attribute {
            name: name.into(),
            value,
            span,
        });
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }
}

/// A single `name = expr` attribute inside a block.
#[derive(Debug, Clone)]
pub struct Attribute {
    pub name: String,
    pub value: Expr,
    pub span: Span,
}

/// An expression tree.
///
/// References are the only non-literal leaves; the loader derives the
/// dependency edges of a block from the set of references its attributes
/// contain.
#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Value),
    /// A dotted path into another component's exports, such as
    /// `remote.http.users.content`.
    Reference(RefPath),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
}

impl Expr {
    pub fn literal(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    pub fn reference(path: &str) -> Self {
        Expr::Reference(RefPath::parse(path))
    }

    /// Appends every reference contained in this expression to `out`, in
    /// source order.
    pub fn references(&self, out: &mut Vec<RefPath>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Reference(path) => out.push(path.clone()),
            Expr::Array(items) => {
                for item in items {
                    item.references(out);
                }
            }
            Expr::Object(entries) => {
                for (_, value) in entries {
                    value.references(out);
                }
            }
        }
    }
}

/// A dotted reference path.
///
/// The leading segments name a component (the loader resolves the longest
/// prefix that matches a node ID); the remaining segments index into that
/// component's exports.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RefPath(Vec<String>);

impl RefPath {
    pub fn new(segments: Vec<String>) -> Self {
        Self(segments)
    }

    pub fn parse(path: &str) -> Self {
        Self(path.split('.').map(str::to_owned).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The dotted prefix formed by the first `n` segments.
    pub fn prefix(&self, n: usize) -> String {
        self.0[..n].join(".")
    }
}

impl fmt::Display for RefPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_references() {
        let expr = Expr::Object(vec![
            ("a".into(), Expr::reference("local.file.users.content")),
            ("b".into(), Expr::literal(1)),
            (
                "c".into(),
                Expr::Array(vec![Expr::reference("remote.http.token")]),
            ),
        ]);
        let mut refs = Vec::new();
        expr.references(&mut refs);
        assert_eq!(
            vec![
                RefPath::parse("local.file.users.content"),
                RefPath::parse("remote.http.token"),
            ],
            refs
        );
    }

    #[test]
    fn ref_path_prefix() {
        let path = RefPath::parse("local.file.users.content");
        assert_eq!("local.file.users", path.prefix(3));
        assert_eq!("local.file.users.content", path.to_string());
    }
}
