// AST — Type-resolved expression tree of NNEF fragment and graph bodies
//
// The parser type-checks while it builds the tree, so every node already
// carries its resolved Type and the Position it was parsed at. A body is a
// list of Assignments `lhs = rhs;` where the lhs is an identifier or an
// array/tuple pattern of identifiers.
//
// DESIGN: Operators applied to tensors never show up as Unary/Binary nodes.
// The parser rewrites them into Invocations of the matching primitive
// fragment (`x + y` becomes `add(x = x, y = y)`), so only constant
// arithmetic remains as Unary/Binary/Select.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::prototype::Prototype;
use crate::token::Position;
use crate::types::{TypeRef, Typename};
use crate::value::Value;

/// An expression with its resolved type and source position.
#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub ty: TypeRef,
    pub position: Position,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    /// Constant literal: integer, scalar, logical or string.
    Literal(Value),

    Identifier(String),

    /// `[a, b, c]`
    Array(Vec<Expr>),

    /// `(a, b, c)`
    Tuple(Vec<Expr>),

    /// `seq[i]` or `seq[i:j]` where either bound of a range may be omitted.
    Subscript {
        sequence: Box<Expr>,
        begin: Option<Box<Expr>>,
        end: Option<Box<Expr>>,
        range: bool,
    },

    /// `[for i in xs, j in ys if cond yield item]`
    Comprehension {
        iterators: Vec<String>,
        iterables: Vec<Expr>,
        condition: Option<Box<Expr>>,
        item: Box<Expr>,
    },

    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },

    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },

    /// `true_value if condition else false_value`
    Select {
        condition: Box<Expr>,
        true_value: Box<Expr>,
        false_value: Box<Expr>,
    },

    /// Invocation of a fragment with its explicitly passed arguments.
    /// `data_type` is the explicit or deduced generic data type; inside a
    /// generic fragment body it may itself be the generic primitive.
    Invocation {
        target: Arc<Prototype>,
        args: IndexMap<String, Expr>,
        data_type: Option<Typename>,
    },

    Builtin {
        op: BuiltinOp,
        arg: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Plus,
    Minus,
    Not,
}

impl UnaryOp {
    pub fn as_str(self) -> &'static str {
        match self {
            UnaryOp::Plus => "+",
            UnaryOp::Minus => "-",
            UnaryOp::Not => "!",
        }
    }

    /// Primitive fragment the operator maps to on tensor operands.
    pub fn tensor_op(self) -> &'static str {
        match self {
            UnaryOp::Plus => "copy",
            UnaryOp::Minus => "neg",
            UnaryOp::Not => "not",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    And,
    Or,
    In,
}

impl BinaryOp {
    pub fn as_str(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Pow => "^",
            BinaryOp::Lt => "<",
            BinaryOp::Gt => ">",
            BinaryOp::Le => "<=",
            BinaryOp::Ge => ">=",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
            BinaryOp::In => "in",
        }
    }

    /// Binding strength; higher binds tighter. All levels are left
    /// associative.
    pub fn precedence(self) -> u8 {
        match self {
            BinaryOp::In => 10,
            BinaryOp::And | BinaryOp::Or => 20,
            BinaryOp::Lt
            | BinaryOp::Gt
            | BinaryOp::Le
            | BinaryOp::Ge
            | BinaryOp::Eq
            | BinaryOp::Ne => 30,
            BinaryOp::Add | BinaryOp::Sub => 40,
            BinaryOp::Mul | BinaryOp::Div => 50,
            BinaryOp::Pow => 60,
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge | BinaryOp::Eq | BinaryOp::Ne
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }

    /// Primitive fragment the operator maps to on tensor operands. `in` has
    /// no tensor counterpart.
    pub fn tensor_op(self) -> Option<&'static str> {
        Some(match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Pow => "pow",
            BinaryOp::Lt => "lt",
            BinaryOp::Gt => "gt",
            BinaryOp::Le => "le",
            BinaryOp::Ge => "ge",
            BinaryOp::Eq => "eq",
            BinaryOp::Ne => "ne",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::In => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinOp {
    LengthOf,
    ShapeOf,
    RangeOf,
    Integer,
    Scalar,
    Logical,
    String,
}

impl BuiltinOp {
    pub fn as_str(self) -> &'static str {
        match self {
            BuiltinOp::LengthOf => "length_of",
            BuiltinOp::ShapeOf => "shape_of",
            BuiltinOp::RangeOf => "range_of",
            BuiltinOp::Integer => "integer",
            BuiltinOp::Scalar => "scalar",
            BuiltinOp::Logical => "logical",
            BuiltinOp::String => "string",
        }
    }
}

/// `lhs = rhs;`
#[derive(Debug, Clone)]
pub struct Assignment {
    pub lhs: Expr,
    pub rhs: Expr,
}

impl Expr {
    pub fn new(kind: ExprKind, ty: TypeRef, position: Position) -> Self {
        Self { kind, ty, position }
    }

    pub fn as_identifier(&self) -> Option<&str> {
        match &self.kind {
            ExprKind::Identifier(name) => Some(name),
            _ => None,
        }
    }

    /// Target of an invocation expression.
    pub fn invocation_target(&self) -> Option<&Prototype> {
        match &self.kind {
            ExprKind::Invocation { target, .. } => Some(target),
            _ => None,
        }
    }

    /// Visit this expression and all of its sub-expressions, parents first.
    pub fn traverse<'a>(&'a self, f: &mut impl FnMut(&'a Expr)) {
        f(self);
        match &self.kind {
            ExprKind::Literal(_) | ExprKind::Identifier(_) => {}
            ExprKind::Array(items) | ExprKind::Tuple(items) => {
                for item in items {
                    item.traverse(f);
                }
            }
            ExprKind::Subscript {
                sequence,
                begin,
                end,
                ..
            } => {
                sequence.traverse(f);
                if let Some(begin) = begin {
                    begin.traverse(f);
                }
                if let Some(end) = end {
                    end.traverse(f);
                }
            }
            ExprKind::Comprehension {
                iterables,
                condition,
                item,
                ..
            } => {
                for iterable in iterables {
                    iterable.traverse(f);
                }
                if let Some(condition) = condition {
                    condition.traverse(f);
                }
                item.traverse(f);
            }
            ExprKind::Unary { operand, .. } => operand.traverse(f),
            ExprKind::Binary { left, right, .. } => {
                left.traverse(f);
                right.traverse(f);
            }
            ExprKind::Select {
                condition,
                true_value,
                false_value,
            } => {
                condition.traverse(f);
                true_value.traverse(f);
                false_value.traverse(f);
            }
            ExprKind::Invocation { args, .. } => {
                for arg in args.values() {
                    arg.traverse(f);
                }
            }
            ExprKind::Builtin { arg, .. } => arg.traverse(f),
        }
    }

    /// Names of all identifiers in this expression, in source order.
    pub fn identifiers(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.traverse(&mut |e| {
            if let ExprKind::Identifier(name) = &e.kind {
                names.push(name.as_str());
            }
        });
        names
    }
}
