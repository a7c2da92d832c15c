// Token — Lexical tokens of the NNEF graph language
//
// Tokens fall into these categories:
//
//   1. Keywords      — version, extension, fragment, graph, for, in, yield, ...
//   2. Type names    — tensor, integer, scalar, logical, string
//   3. Builtins      — length_of, shape_of, range_of
//   4. Operators     — the two-character forms -> && || <= >= == !=
//   5. Literals      — quoted strings, decimal and fractional numbers
//   6. Identifiers   — user-defined names
//   7. Characters    — any other single byte, returned as-is
//
// Each token carries the Position of its first character.

use std::fmt;
use std::sync::Arc;

/// Source location of a token or expression.
///
/// `origin` chains the position of the invocation that caused a nested
/// evaluation, so errors raised inside an inlined fragment body can report
/// every call site that led to them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    /// Line number (1-based).
    pub line: usize,
    /// Column number (1-based, in bytes).
    pub column: usize,
    pub filename: Arc<str>,
    pub origin: Option<Box<Position>>,
}

impl Position {
    pub fn new(filename: Arc<str>, line: usize, column: usize) -> Self {
        Self {
            line,
            column,
            filename,
            origin: None,
        }
    }

    /// Return a copy of this position with `origin` appended at the end of
    /// its origin chain.
    pub fn with_origin(&self, origin: Position) -> Self {
        fn append(slot: &mut Option<Box<Position>>, origin: Position) {
            match slot {
                Some(next) => append(&mut next.origin, origin),
                None => *slot = Some(Box::new(origin)),
            }
        }

        let mut position = self.clone();
        append(&mut position.origin, origin.without_origin());
        position
    }

    /// The same location with the origin chain dropped.
    pub fn without_origin(&self) -> Self {
        Self {
            line: self.line,
            column: self.column,
            filename: self.filename.clone(),
            origin: None,
        }
    }

    /// Iterate over the origin chain, innermost call site first.
    pub fn origins(&self) -> impl Iterator<Item = &Position> {
        std::iter::successors(self.origin.as_deref(), |p| p.origin.as_deref())
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.filename, self.line, self.column)
    }
}

/// A token with its kind and source location.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub position: Position,
}

impl Token {
    pub fn new(kind: TokenKind, position: Position) -> Self {
        Self { kind, position }
    }
}

/// Every possible token kind in the NNEF language.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    //  Keywords
    Version,
    Extension,
    Fragment,
    Graph,
    For,
    In,
    If,
    Else,
    Yield,
    True,
    False,

    //  Type names (integer..string double as conversion builtins)
    Tensor,
    Integer,
    Scalar,
    Logical,
    String,

    //  Builtins
    LengthOf, // length_of
    ShapeOf,  // shape_of
    RangeOf,  // range_of

    //  Literals (raw text; the parser converts numbers)
    Characters(std::string::String),
    Decimal(std::string::String),
    Fractional(std::string::String),

    //  Two-character operators
    Arrow, // ->
    And,   // &&
    Or,    // ||
    Le,    // <=
    Ge,    // >=
    Eq,    // ==
    Ne,    // !=

    //  Identifiers
    Identifier(std::string::String),

    //  Any other single character: ( ) [ ] { } < > = + - * / ^ ! : ; , ?
    Char(char),

    //  Special
    Eof,
}

impl TokenKind {
    /// Whether `self` is the same kind of token as `other`. Literal and
    /// identifier payloads are ignored, single characters must match exactly.
    pub fn same_kind(&self, other: &TokenKind) -> bool {
        match (self, other) {
            (TokenKind::Char(a), TokenKind::Char(b)) => a == b,
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }

    /// Return the source text of a keyword token, `None` for everything else.
    pub fn keyword_str(&self) -> Option<&'static str> {
        match self {
            TokenKind::Version => Some("version"),
            TokenKind::Extension => Some("extension"),
            TokenKind::Fragment => Some("fragment"),
            TokenKind::Graph => Some("graph"),
            TokenKind::For => Some("for"),
            TokenKind::In => Some("in"),
            TokenKind::If => Some("if"),
            TokenKind::Else => Some("else"),
            TokenKind::Yield => Some("yield"),
            TokenKind::True => Some("true"),
            TokenKind::False => Some("false"),
            TokenKind::Tensor => Some("tensor"),
            TokenKind::Integer => Some("integer"),
            TokenKind::Scalar => Some("scalar"),
            TokenKind::Logical => Some("logical"),
            TokenKind::String => Some("string"),
            TokenKind::LengthOf => Some("length_of"),
            TokenKind::ShapeOf => Some("shape_of"),
            TokenKind::RangeOf => Some("range_of"),
            _ => None,
        }
    }

    /// Source text of the operator, for operator tokens.
    pub fn operator_str(&self) -> Option<&'static str> {
        match self {
            TokenKind::Arrow => Some("->"),
            TokenKind::And => Some("&&"),
            TokenKind::Or => Some("||"),
            TokenKind::Le => Some("<="),
            TokenKind::Ge => Some(">="),
            TokenKind::Eq => Some("=="),
            TokenKind::Ne => Some("!="),
            _ => None,
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(kw) = self.keyword_str() {
            return write!(f, "'{kw}'");
        }
        if let Some(op) = self.operator_str() {
            return write!(f, "'{op}'");
        }
        match self {
            TokenKind::Characters(s) => write!(f, "string literal '{s}'"),
            TokenKind::Decimal(s) | TokenKind::Fractional(s) => write!(f, "number {s}"),
            TokenKind::Identifier(s) => write!(f, "identifier '{s}'"),
            TokenKind::Char(c) => write!(f, "'{c}'"),
            TokenKind::Eof => write!(f, "end of input"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Look up a keyword from an identifier string.
/// Returns None if the string is a plain identifier.
pub fn keyword_lookup(s: &str) -> Option<TokenKind> {
    match s {
        "version" => Some(TokenKind::Version),
        "extension" => Some(TokenKind::Extension),
        "fragment" => Some(TokenKind::Fragment),
        "graph" => Some(TokenKind::Graph),
        "for" => Some(TokenKind::For),
        "in" => Some(TokenKind::In),
        "if" => Some(TokenKind::If),
        "else" => Some(TokenKind::Else),
        "yield" => Some(TokenKind::Yield),
        "true" => Some(TokenKind::True),
        "false" => Some(TokenKind::False),

        "tensor" => Some(TokenKind::Tensor),
        "integer" => Some(TokenKind::Integer),
        "scalar" => Some(TokenKind::Scalar),
        "logical" => Some(TokenKind::Logical),
        "string" => Some(TokenKind::String),

        "length_of" => Some(TokenKind::LengthOf),
        "shape_of" => Some(TokenKind::ShapeOf),
        "range_of" => Some(TokenKind::RangeOf),

        _ => None,
    }
}
