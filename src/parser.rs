// Parser — Recursive descent parser and type checker for NNEF documents
//
// The parser pulls tokens from the Lexer one at a time and type-checks as it
// goes: every Expr it returns already carries its resolved Type. It is a
// classic hand-written recursive descent parser, one method per grammar
// production:
//
//   document    := version extension* fragment* graph
//   version     := 'version' <major>.<minor> ';'
//   extension   := 'extension' name (',' name)* ';'
//   fragment    := 'fragment' name generic? params '->' results (body | ';')
//   graph       := 'graph' name params '->' results body
//   body        := '{' (lvalue '=' rvalue ';')* '}'
//
// OPERATOR PRECEDENCE (lowest to highest):
//   1. a if c else b       (only where a full expression is allowed)
//   2. in
//   3. && ||
//   4. < > <= >= == !=
//   5. + -
//   6. * /
//   7. ^
//   8. - + ! (unary prefix)
//   9. [] (subscript)
//
// All binary levels are left associative.
//
// TENSOR SUGAR: when an operator is applied to a tensor the parser builds an
// Invocation of the matching primitive (`a * b` becomes `mul(a, b)`,
// `t if c else f` with a tensor condition becomes `select(c, t, f)`), so
// every tensor-producing expression goes through one evaluation path.
//
// ERROR RECOVERY: none. The first error ends the parse.

use std::sync::Arc;

use indexmap::IndexMap;
use tracing::debug;

use crate::ast::{Assignment, BinaryOp, BuiltinOp, Expr, ExprKind, UnaryOp};
use crate::declarations::Declarations;
use crate::error::{Error, ErrorKind, Result};
use crate::eval::evaluate_constant;
use crate::lexer::Lexer;
use crate::prototype::{Fragment, FragmentTable, Param, Prototype, ResultParam};
use crate::token::{Position, TokenKind};
use crate::types::{self, DeductionConflict, Type, TypeInterner, TypeRef, Typename};
use crate::validate::{self, GraphValidator};
use crate::value::Value;

/// Enables `fragment` declarations in a document.
pub const FRAGMENT_DEFINITIONS: &str = "KHR_enable_fragment_definitions";

/// Enables operators and compound expressions in the graph body.
pub const OPERATOR_EXPRESSIONS: &str = "KHR_enable_operator_expressions";

/// The built-in extensions a document declared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Extensions {
    pub fragment_definitions: bool,
    pub operator_expressions: bool,
}

impl Extensions {
    pub fn all() -> Self {
        Self {
            fragment_definitions: true,
            operator_expressions: true,
        }
    }
}

/// A parsed `graph` declaration and its body.
#[derive(Debug, Clone)]
pub struct GraphDef {
    pub prototype: Arc<Prototype>,
    pub assignments: Vec<Assignment>,
}

/// Left-hand side of an assignment before its type is known.
enum Pattern {
    Identifier(String, Position),
    Array(Vec<Pattern>, Position),
    Tuple(Vec<Pattern>, Position),
}

pub struct Parser<'src, 't> {
    lexer: Lexer<'src>,
    types: &'t TypeInterner,
    fragments: FragmentTable,
    extensions: Extensions,
}

impl<'src, 't> Parser<'src, 't> {
    /// Create a parser over `source` that already knows `fragments`.
    pub fn new(
        source: &'src str,
        filename: impl Into<Arc<str>>,
        types: &'t TypeInterner,
        fragments: FragmentTable,
    ) -> Result<Self> {
        let mut lexer = Lexer::new(source, filename);
        lexer.next()?;
        Ok(Self {
            lexer,
            types,
            fragments,
            extensions: Extensions::default(),
        })
    }

    pub fn fragments(&self) -> &FragmentTable {
        &self.fragments
    }

    pub fn into_fragments(self) -> FragmentTable {
        self.fragments
    }

    pub fn extensions(&self) -> Extensions {
        self.extensions
    }

    pub fn set_extensions(&mut self, extensions: Extensions) {
        self.extensions = extensions;
    }

    // Document structure

    /// `version 1.0;`
    pub fn read_version(&mut self, max_version: (u32, u32)) -> Result<(u32, u32)> {
        self.lexer.read_token(&TokenKind::Version)?;
        let position = self.lexer.position().clone();
        let version = match self.kind() {
            TokenKind::Fractional(raw) => parse_version(&raw),
            _ => None,
        };
        let Some((major, minor)) = version else {
            return Err(self.unexpected("version number"));
        };
        self.lexer.next()?;
        self.lexer.read_token(&TokenKind::Char(';'))?;
        if (major, minor) > max_version {
            return Err(Error::new(ErrorKind::UnsupportedVersion { major, minor }, position));
        }
        debug!(major, minor, "read version");
        Ok((major, minor))
    }

    /// Zero or more `extension` clauses. Names other than the built-in
    /// extensions are offered to `handler`; a name nobody handles is an error.
    pub fn read_extensions(&mut self, handler: &mut dyn FnMut(&str) -> bool) -> Result<Extensions> {
        while self.lexer.read_if_token(&TokenKind::Extension)? {
            loop {
                let position = self.lexer.position().clone();
                let name = self.read_identifier()?;
                match name.as_str() {
                    FRAGMENT_DEFINITIONS => self.extensions.fragment_definitions = true,
                    OPERATOR_EXPRESSIONS => self.extensions.operator_expressions = true,
                    _ if handler(&name) => {}
                    _ => return Err(Error::new(ErrorKind::UnhandledExtension(name), position)),
                }
                debug!(extension = %name, "enabled extension");
                if !self.lexer.read_if_token(&TokenKind::Char(','))? {
                    break;
                }
            }
            self.lexer.read_token(&TokenKind::Char(';'))?;
        }
        Ok(self.extensions)
    }

    /// Every `fragment` declaration up to the next non-fragment token.
    pub fn parse_fragments(&mut self) -> Result<()> {
        while self.kind() == TokenKind::Fragment {
            if !self.extensions.fragment_definitions {
                return Err(Error::semantic(
                    format!("fragment definitions require extension {FRAGMENT_DEFINITIONS}"),
                    self.lexer.position(),
                ));
            }
            self.parse_fragment()?;
        }
        Ok(())
    }

    /// `graph name( inputs ) -> ( outputs ) { body }`
    pub fn parse_graph(&mut self) -> Result<GraphDef> {
        self.lexer.read_token(&TokenKind::Graph)?;
        let name = self.read_identifier()?;
        let params = self.parse_params(false)?;
        self.lexer.read_token(&TokenKind::Arrow)?;
        let results = self.parse_results(&params, false)?;
        let prototype = Arc::new(Prototype::new(name, params, results, None));
        debug!(graph = %prototype.name, "parsing graph body");

        self.lexer.read_token(&TokenKind::Char('{'))?;
        let mut decls = Declarations::new();
        for param in &prototype.params {
            decls.declare(param.name.clone(), param.ty.clone());
        }
        let mut validator = GraphValidator::new(prototype.clone());
        let expressions = self.extensions.operator_expressions;
        let mut assignments = Vec::new();
        while !self.lexer.read_if_token(&TokenKind::Char('}'))? {
            let assignment = self.parse_assignment(&mut decls, &prototype, false, expressions)?;
            validator.check(&assignment)?;
            assignments.push(assignment);
        }
        validate::check_results_assigned(&prototype, &decls, true, self.lexer.position())?;

        Ok(GraphDef {
            prototype,
            assignments,
        })
    }

    /// Fail unless the whole input has been consumed.
    pub fn expect_end(&mut self) -> Result<()> {
        if self.kind() != TokenKind::Eof {
            return Err(self.unexpected("end of input"));
        }
        Ok(())
    }

    // Fragments and prototypes

    fn parse_fragment(&mut self) -> Result<()> {
        self.lexer.read_token(&TokenKind::Fragment)?;
        let position = self.lexer.position().clone();
        let name = self.read_identifier()?;
        if self.fragments.contains_key(&name) {
            return Err(Error::new(
                ErrorKind::Duplicate {
                    what: "fragment",
                    name,
                },
                position,
            ));
        }

        let generic = if self.lexer.read_if_token(&TokenKind::Char('<'))? {
            self.lexer.read_token(&TokenKind::Char('?'))?;
            let default = if self.lexer.read_if_token(&TokenKind::Char('='))? {
                Some(self.read_typename()?)
            } else {
                None
            };
            self.lexer.read_token(&TokenKind::Char('>'))?;
            Some(default)
        } else {
            None
        };

        let params = self.parse_params(true)?;
        self.lexer.read_token(&TokenKind::Arrow)?;
        let results = self.parse_results(&params, true)?;
        let prototype = Prototype::new(name.clone(), params, results, generic.flatten());

        if prototype.is_generic() && generic.is_none() {
            return Err(Error::type_error(
                format!("fragment '{name}' uses generic types but is not declared generic"),
                &position,
            ));
        }
        if !prototype.is_generic() && generic.is_some() {
            return Err(Error::type_error(
                format!("fragment '{name}' is declared generic but uses no generic types"),
                &position,
            ));
        }
        let attribute_results = prototype.results.iter().filter(|r| r.ty.is_attribute()).count();
        if attribute_results != 0 && attribute_results != prototype.results.len() {
            return Err(Error::semantic(
                format!("results of fragment '{name}' must be all tensors or all attributes"),
                &position,
            ));
        }

        // registered before the body so the body may invoke it
        let prototype = Arc::new(prototype);
        self.fragments
            .insert(name.clone(), Fragment::primitive(prototype.clone()));

        if self.lexer.read_if_token(&TokenKind::Char(';'))? {
            return Ok(());
        }

        let assignments = self.parse_fragment_body(&prototype)?;
        if let Some(fragment) = self.fragments.get_mut(&name) {
            fragment.assignments = assignments;
        }
        Ok(())
    }

    fn parse_fragment_body(&mut self, prototype: &Arc<Prototype>) -> Result<Vec<Assignment>> {
        self.lexer.read_token(&TokenKind::Char('{'))?;
        let mut decls = Declarations::new();
        for param in &prototype.params {
            decls.declare(param.name.clone(), param.ty.clone());
        }
        let mut assignments = Vec::new();
        while !self.lexer.read_if_token(&TokenKind::Char('}'))? {
            let assignment = self.parse_assignment(&mut decls, prototype, true, true)?;
            validate::check_fragment_assignment(&assignment, prototype)?;
            assignments.push(assignment);
        }
        validate::check_results_assigned(prototype, &decls, false, self.lexer.position())?;
        Ok(assignments)
    }

    /// `( name: type = default, ... )`. Graph parameters are untyped
    /// tensors unless a type is given.
    fn parse_params(&mut self, fragment: bool) -> Result<Vec<Param>> {
        self.lexer.read_token(&TokenKind::Char('('))?;
        let mut params: Vec<Param> = Vec::new();
        let mut seen_attribute = false;
        if !self.lexer.read_if_token(&TokenKind::Char(')'))? {
            loop {
                let position = self.lexer.position().clone();
                let name = self.read_identifier()?;
                if params.iter().any(|p| p.name == name) {
                    return Err(Error::new(
                        ErrorKind::Duplicate {
                            what: "parameter",
                            name,
                        },
                        position,
                    ));
                }

                let ty = self.parse_declared_type(fragment)?;
                if fragment {
                    if ty.is_attribute() {
                        seen_attribute = true;
                    } else if seen_attribute {
                        return Err(Error::semantic(
                            format!("tensor parameter '{name}' must precede all attribute parameters"),
                            &position,
                        ));
                    }
                } else if !ty.is_tensor() {
                    return Err(Error::type_error(
                        format!("graph parameter '{name}' must be a tensor, found {ty}"),
                        &position,
                    ));
                }

                let default = if self.lexer.read_if_token(&TokenKind::Char('='))? {
                    if !fragment {
                        return Err(Error::semantic(
                            format!("graph parameter '{name}' cannot have a default value"),
                            &position,
                        ));
                    }
                    Some(self.parse_default(&name, &ty)?)
                } else {
                    None
                };

                params.push(Param { name, ty, default });
                if !self.lexer.read_if_token(&TokenKind::Char(','))? {
                    break;
                }
            }
            self.lexer.read_token(&TokenKind::Char(')'))?;
        }
        Ok(params)
    }

    fn parse_results(&mut self, params: &[Param], fragment: bool) -> Result<Vec<ResultParam>> {
        self.lexer.read_token(&TokenKind::Char('('))?;
        let mut results: Vec<ResultParam> = Vec::new();
        loop {
            let position = self.lexer.position().clone();
            let name = self.read_identifier()?;
            if results.iter().any(|r| r.name == name) || params.iter().any(|p| p.name == name) {
                return Err(Error::new(
                    ErrorKind::Duplicate {
                        what: "result",
                        name,
                    },
                    position,
                ));
            }
            let ty = self.parse_declared_type(fragment)?;
            if !fragment && !ty.is_tensor() {
                return Err(Error::type_error(
                    format!("graph result '{name}' must be a tensor, found {ty}"),
                    &position,
                ));
            }
            results.push(ResultParam { name, ty });
            if !self.lexer.read_if_token(&TokenKind::Char(','))? {
                break;
            }
        }
        self.lexer.read_token(&TokenKind::Char(')'))?;
        Ok(results)
    }

    /// `: type` (mandatory in fragments, `tensor<scalar>` by default in graphs).
    fn parse_declared_type(&mut self, fragment: bool) -> Result<TypeRef> {
        if self.lexer.read_if_token(&TokenKind::Char(':'))? {
            self.parse_type()
        } else if fragment {
            Err(self.unexpected("':'"))
        } else {
            Ok(self.types.tensor(Typename::Scalar))
        }
    }

    /// A default value is a constant expression castable to the parameter
    /// type; it is evaluated right away.
    fn parse_default(&mut self, name: &str, ty: &TypeRef) -> Result<Value> {
        let mut decls = Declarations::new();
        let expr = self.parse_expression(&mut decls, true)?;
        if !expr.ty.is_attribute() {
            return Err(Error::semantic(
                format!("default value of parameter '{name}' must be a constant"),
                &expr.position,
            ));
        }
        if !types::is_castable(&expr.ty, ty, true) {
            return Err(Error::type_error(
                format!(
                    "default value of type {} is not castable to type {ty} of parameter '{name}'",
                    expr.ty
                ),
                &expr.position,
            ));
        }
        evaluate_constant(&expr)
    }

    /// `tensor<T>`, `tensor<>`, a primitive, `?`, or a tuple, followed by
    /// any number of `[]`.
    fn parse_type(&mut self) -> Result<TypeRef> {
        let mut ty = match self.kind() {
            TokenKind::Tensor => {
                self.lexer.next()?;
                self.lexer.read_token(&TokenKind::Char('<'))?;
                let data = if self.lexer.read_if_token(&TokenKind::Char('>'))? {
                    None
                } else {
                    let data = self.parse_primitive_type()?;
                    self.lexer.read_token(&TokenKind::Char('>'))?;
                    Some(data)
                };
                self.types.tensor_of(data)
            }
            TokenKind::Char('(') => {
                self.lexer.next()?;
                let mut items = vec![self.parse_type()?];
                while self.lexer.read_if_token(&TokenKind::Char(','))? {
                    items.push(self.parse_type()?);
                }
                self.lexer.read_token(&TokenKind::Char(')'))?;
                self.types.tuple(items)
            }
            _ => self.parse_primitive_type()?,
        };
        while self.lexer.read_if_token(&TokenKind::Char('['))? {
            self.lexer.read_token(&TokenKind::Char(']'))?;
            ty = self.types.array(ty);
        }
        Ok(ty)
    }

    fn parse_primitive_type(&mut self) -> Result<TypeRef> {
        let name = if self.kind() == TokenKind::Char('?') {
            self.lexer.next()?;
            Typename::Generic
        } else {
            self.read_typename()?
        };
        Ok(self.types.primitive(name))
    }

    fn read_typename(&mut self) -> Result<Typename> {
        let name = match self.kind() {
            TokenKind::Integer => Typename::Integer,
            TokenKind::Scalar => Typename::Scalar,
            TokenKind::Logical => Typename::Logical,
            TokenKind::String => Typename::String,
            _ => return Err(self.unexpected("type name")),
        };
        self.lexer.next()?;
        Ok(name)
    }

    // Assignments

    fn parse_assignment(
        &mut self,
        decls: &mut Declarations,
        owner: &Prototype,
        fragment: bool,
        expressions: bool,
    ) -> Result<Assignment> {
        let pattern = self.parse_lvalue()?;
        self.lexer.read_token(&TokenKind::Char('='))?;
        let rhs = if expressions {
            self.parse_expression(decls, true)?
        } else {
            self.parse_flat_invocation(decls)?
        };
        self.lexer.read_token(&TokenKind::Char(';'))?;

        let lhs = self.bind_lvalue(pattern, &rhs.ty, decls, owner, fragment)?;
        let names = lhs.identifiers();
        for (i, name) in names.iter().enumerate() {
            if names[..i].contains(name) {
                return Err(Error::new(
                    ErrorKind::Duplicate {
                        what: "identifier",
                        name: name.to_string(),
                    },
                    lhs.position.clone(),
                ));
            }
        }
        Ok(Assignment { lhs, rhs })
    }

    fn parse_lvalue(&mut self) -> Result<Pattern> {
        let position = self.lexer.position().clone();
        match self.kind() {
            TokenKind::Identifier(name) => {
                self.lexer.next()?;
                Ok(Pattern::Identifier(name, position))
            }
            TokenKind::Char('[') => {
                self.lexer.next()?;
                let mut items = vec![self.parse_lvalue()?];
                while self.lexer.read_if_token(&TokenKind::Char(','))? {
                    items.push(self.parse_lvalue()?);
                }
                self.lexer.read_token(&TokenKind::Char(']'))?;
                Ok(Pattern::Array(items, position))
            }
            TokenKind::Char('(') => {
                self.lexer.next()?;
                let first = self.parse_lvalue()?;
                if !self.lexer.read_if_token(&TokenKind::Char(','))? {
                    self.lexer.read_token(&TokenKind::Char(')'))?;
                    return Ok(first);
                }
                let mut items = vec![first];
                loop {
                    items.push(self.parse_lvalue()?);
                    if !self.lexer.read_if_token(&TokenKind::Char(','))? {
                        break;
                    }
                }
                self.lexer.read_token(&TokenKind::Char(')'))?;
                Ok(Pattern::Tuple(items, position))
            }
            _ => Err(self.unexpected("identifier, array or tuple")),
        }
    }

    /// Give the pattern its type from the right-hand side and declare every
    /// identifier in it.
    fn bind_lvalue(
        &self,
        pattern: Pattern,
        ty: &TypeRef,
        decls: &mut Declarations,
        owner: &Prototype,
        fragment: bool,
    ) -> Result<Expr> {
        match pattern {
            Pattern::Identifier(name, position) => {
                if fragment {
                    if let Some(result) = owner.result(&name) {
                        if !types::is_castable(ty, &result.ty, false) {
                            return Err(Error::type_error(
                                format!(
                                    "result '{name}' of type {} cannot be assigned a value of type {ty}",
                                    result.ty
                                ),
                                &position,
                            ));
                        }
                    }
                }
                decls.declare(name.clone(), ty.clone());
                Ok(Expr::new(ExprKind::Identifier(name), ty.clone(), position))
            }
            Pattern::Array(items, position) => {
                let Type::Array(Some(item_ty)) = ty.as_ref() else {
                    return Err(Error::semantic(
                        format!("cannot assign a value of type {ty} to an array pattern"),
                        &position,
                    ));
                };
                let items = items
                    .into_iter()
                    .map(|item| self.bind_lvalue(item, item_ty, decls, owner, fragment))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Expr::new(ExprKind::Array(items), ty.clone(), position))
            }
            Pattern::Tuple(items, position) => {
                let item_types = match ty.as_ref() {
                    Type::Tuple(item_types) if item_types.len() == items.len() => item_types,
                    _ => {
                        return Err(Error::semantic(
                            format!(
                                "cannot assign a value of type {ty} to a tuple pattern of {} items",
                                items.len()
                            ),
                            &position,
                        ))
                    }
                };
                let items = items
                    .into_iter()
                    .zip(item_types)
                    .map(|(item, item_ty)| self.bind_lvalue(item, item_ty, decls, owner, fragment))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Expr::new(ExprKind::Tuple(items), ty.clone(), position))
            }
        }
    }

    // Expressions

    fn parse_expression(&mut self, decls: &mut Declarations, allow_select: bool) -> Result<Expr> {
        let expr = self.parse_binary(decls, 1)?;
        if allow_select && self.kind() == TokenKind::If {
            self.lexer.next()?;
            let condition = self.parse_binary(decls, 1)?;
            self.lexer.read_token(&TokenKind::Else)?;
            let false_value = self.parse_expression(decls, true)?;
            return self.make_select(condition, expr, false_value);
        }
        Ok(expr)
    }

    /// Precedence climbing over the binary operator table.
    fn parse_binary(&mut self, decls: &mut Declarations, min_precedence: u8) -> Result<Expr> {
        let mut left = self.parse_unary(decls)?;
        while let Some(op) = self.binary_operator() {
            let precedence = op.precedence();
            if precedence < min_precedence {
                break;
            }
            let position = self.lexer.position().clone();
            self.lexer.next()?;
            let right = self.parse_binary(decls, precedence + 1)?;
            left = self.make_binary(op, left, right, &position)?;
        }
        Ok(left)
    }

    fn binary_operator(&self) -> Option<BinaryOp> {
        Some(match self.lexer.kind() {
            TokenKind::Char('+') => BinaryOp::Add,
            TokenKind::Char('-') => BinaryOp::Sub,
            TokenKind::Char('*') => BinaryOp::Mul,
            TokenKind::Char('/') => BinaryOp::Div,
            TokenKind::Char('^') => BinaryOp::Pow,
            TokenKind::Char('<') => BinaryOp::Lt,
            TokenKind::Char('>') => BinaryOp::Gt,
            TokenKind::Le => BinaryOp::Le,
            TokenKind::Ge => BinaryOp::Ge,
            TokenKind::Eq => BinaryOp::Eq,
            TokenKind::Ne => BinaryOp::Ne,
            TokenKind::And => BinaryOp::And,
            TokenKind::Or => BinaryOp::Or,
            TokenKind::In => BinaryOp::In,
            _ => return None,
        })
    }

    fn parse_unary(&mut self, decls: &mut Declarations) -> Result<Expr> {
        let position = self.lexer.position().clone();
        let op = match self.kind() {
            TokenKind::Char('-') => UnaryOp::Minus,
            TokenKind::Char('+') => UnaryOp::Plus,
            TokenKind::Char('!') => UnaryOp::Not,
            _ => return self.parse_postfix(decls),
        };
        self.lexer.next()?;
        let operand = self.parse_unary(decls)?;
        self.make_unary(op, operand, position)
    }

    fn parse_postfix(&mut self, decls: &mut Declarations) -> Result<Expr> {
        let mut expr = self.parse_primary(decls)?;
        while self.kind() == TokenKind::Char('[') {
            expr = self.parse_subscript(decls, expr)?;
        }
        Ok(expr)
    }

    /// `seq[i]`, `seq[i:j]`, `seq[:j]`, `seq[i:]`
    fn parse_subscript(&mut self, decls: &mut Declarations, sequence: Expr) -> Result<Expr> {
        let position = self.lexer.read_token(&TokenKind::Char('['))?.position;
        let begin = if self.kind() == TokenKind::Char(':') {
            None
        } else {
            Some(self.parse_expression(decls, true)?)
        };
        let range = self.lexer.read_if_token(&TokenKind::Char(':'))?;
        let end = if range && self.kind() != TokenKind::Char(']') {
            Some(self.parse_expression(decls, true)?)
        } else {
            None
        };
        self.lexer.read_token(&TokenKind::Char(']'))?;

        for bound in begin.iter().chain(end.iter()) {
            if bound.ty.typename() != Some(Typename::Integer) {
                return Err(Error::type_error(
                    format!("subscript must be an integer, found {}", bound.ty),
                    &bound.position,
                ));
            }
        }

        let ty = match sequence.ty.as_ref() {
            Type::Array(_) if range => sequence.ty.clone(),
            Type::Array(Some(item)) => item.clone(),
            Type::Primitive(Typename::String) => self.types.string(),
            Type::Tuple(items) => {
                if range {
                    return Err(Error::type_error("tuples cannot be sliced", &position));
                }
                let index = match begin.as_ref().map(|b| &b.kind) {
                    Some(ExprKind::Literal(Value::Integer(index))) => *index,
                    _ => {
                        return Err(Error::type_error(
                            "tuple index must be an integer literal",
                            &position,
                        ))
                    }
                };
                let len = items.len() as i32;
                let wrapped = if index < 0 { index + len } else { index };
                if wrapped < 0 || wrapped >= len {
                    return Err(Error::type_error(
                        format!("tuple index {index} out of range for {}", sequence.ty),
                        &position,
                    ));
                }
                items[wrapped as usize].clone()
            }
            _ => {
                return Err(Error::type_error(
                    format!("value of type {} cannot be subscripted", sequence.ty),
                    &position,
                ))
            }
        };

        let expr_position = sequence.position.clone();
        Ok(Expr::new(
            ExprKind::Subscript {
                sequence: Box::new(sequence),
                begin: begin.map(Box::new),
                end: end.map(Box::new),
                range,
            },
            ty,
            expr_position,
        ))
    }

    fn parse_primary(&mut self, decls: &mut Declarations) -> Result<Expr> {
        let position = self.lexer.position().clone();
        match self.kind() {
            TokenKind::Decimal(raw) => {
                let value = raw
                    .parse::<i32>()
                    .map_err(|_| Error::new(ErrorKind::InvalidNumber(raw.clone()), position.clone()))?;
                self.lexer.next()?;
                Ok(self.literal(Value::Integer(value), position))
            }
            TokenKind::Fractional(raw) => {
                let value = raw
                    .parse::<f32>()
                    .map_err(|_| Error::new(ErrorKind::InvalidNumber(raw.clone()), position.clone()))?;
                self.lexer.next()?;
                Ok(self.literal(Value::Scalar(value), position))
            }
            TokenKind::Characters(s) => {
                self.lexer.next()?;
                Ok(self.literal(Value::String(s), position))
            }
            TokenKind::True | TokenKind::False => {
                let value = self.kind() == TokenKind::True;
                self.lexer.next()?;
                Ok(self.literal(Value::Logical(value), position))
            }
            TokenKind::Identifier(name) => {
                self.lexer.next()?;
                let is_invocation = match self.lexer.kind() {
                    TokenKind::Char('(') => true,
                    TokenKind::Char('<') => !decls.contains(&name) && self.fragments.contains_key(&name),
                    _ => false,
                };
                if is_invocation {
                    return self.parse_invocation(decls, name, position, false);
                }
                self.identifier(decls, name, position)
            }
            TokenKind::Char('[') => self.parse_array(decls),
            TokenKind::Char('(') => self.parse_tuple(decls),
            TokenKind::LengthOf
            | TokenKind::ShapeOf
            | TokenKind::RangeOf
            | TokenKind::Integer
            | TokenKind::Scalar
            | TokenKind::Logical
            | TokenKind::String => self.parse_builtin(decls),
            _ => Err(self.unexpected("expression")),
        }
    }

    fn literal(&self, value: Value, position: Position) -> Expr {
        let ty = match &value {
            Value::Integer(_) => self.types.integer(),
            Value::Scalar(_) => self.types.scalar(),
            Value::Logical(_) => self.types.logical(),
            _ => self.types.string(),
        };
        Expr::new(ExprKind::Literal(value), ty, position)
    }

    fn identifier(&self, decls: &Declarations, name: String, position: Position) -> Result<Expr> {
        match decls.get(&name) {
            Some(ty) => Ok(Expr::new(ExprKind::Identifier(name), ty.clone(), position)),
            None => Err(Error::new(
                ErrorKind::Undeclared {
                    what: "identifier",
                    name,
                },
                position,
            )),
        }
    }

    /// `[a, b, c]` or a comprehension.
    fn parse_array(&mut self, decls: &mut Declarations) -> Result<Expr> {
        let position = self.lexer.read_token(&TokenKind::Char('['))?.position;
        if self.kind() == TokenKind::For {
            return self.parse_comprehension(decls, position);
        }
        let mut items = Vec::new();
        if !self.lexer.read_if_token(&TokenKind::Char(']'))? {
            loop {
                items.push(self.parse_expression(decls, true)?);
                if !self.lexer.read_if_token(&TokenKind::Char(','))? {
                    break;
                }
            }
            self.lexer.read_token(&TokenKind::Char(']'))?;
        }
        let ty = self.array_type(&items, &position)?;
        Ok(Expr::new(ExprKind::Array(items), ty, position))
    }

    fn array_type(&self, items: &[Expr], position: &Position) -> Result<TypeRef> {
        let mut item_ty: Option<TypeRef> = None;
        for item in items {
            item_ty = Some(match item_ty {
                None => item.ty.clone(),
                Some(current) => types::common_type(&current, &item.ty, true).ok_or_else(|| {
                    Error::type_error(
                        format!("array items have incompatible types {current} and {}", item.ty),
                        position,
                    )
                })?,
            });
        }
        Ok(match item_ty {
            Some(item) => self.types.array(item),
            None => self.types.empty_array(),
        })
    }

    /// `(a, b)` or a parenthesized expression.
    fn parse_tuple(&mut self, decls: &mut Declarations) -> Result<Expr> {
        let position = self.lexer.read_token(&TokenKind::Char('('))?.position;
        let first = self.parse_expression(decls, true)?;
        if !self.lexer.read_if_token(&TokenKind::Char(','))? {
            self.lexer.read_token(&TokenKind::Char(')'))?;
            return Ok(first);
        }
        let mut items = vec![first];
        loop {
            items.push(self.parse_expression(decls, true)?);
            if !self.lexer.read_if_token(&TokenKind::Char(','))? {
                break;
            }
        }
        self.lexer.read_token(&TokenKind::Char(')'))?;
        let ty = self.types.tuple(items.iter().map(|item| item.ty.clone()).collect());
        Ok(Expr::new(ExprKind::Tuple(items), ty, position))
    }

    /// `[for i in xs, j in ys if cond yield item]`, after the opening `[`.
    ///
    /// Iterators are visible only inside the condition and the item.
    fn parse_comprehension(&mut self, decls: &mut Declarations, position: Position) -> Result<Expr> {
        self.lexer.read_token(&TokenKind::For)?;
        let mut iterators: Vec<String> = Vec::new();
        let mut iterables = Vec::new();
        let mut item_types = Vec::new();
        loop {
            let iterator_position = self.lexer.position().clone();
            let name = self.read_identifier()?;
            if decls.contains(&name) || iterators.contains(&name) {
                return Err(Error::new(
                    ErrorKind::Duplicate {
                        what: "iterator",
                        name,
                    },
                    iterator_position,
                ));
            }
            self.lexer.read_token(&TokenKind::In)?;
            let iterable = self.parse_expression(decls, false)?;
            let Some(item_ty) = iterable.ty.item_type().cloned() else {
                return Err(Error::type_error(
                    format!("cannot iterate over a value of type {}", iterable.ty),
                    &iterable.position,
                ));
            };
            iterators.push(name);
            iterables.push(iterable);
            item_types.push(item_ty);
            if !self.lexer.read_if_token(&TokenKind::Char(','))? {
                break;
            }
        }

        for (name, ty) in iterators.iter().zip(&item_types) {
            decls.declare(name.clone(), ty.clone());
        }
        let body = self.parse_comprehension_body(decls);
        for name in &iterators {
            decls.remove(name);
        }
        let (condition, item) = body?;

        let ty = self.types.array(item.ty.clone());
        Ok(Expr::new(
            ExprKind::Comprehension {
                iterators,
                iterables,
                condition: condition.map(Box::new),
                item: Box::new(item),
            },
            ty,
            position,
        ))
    }

    fn parse_comprehension_body(&mut self, decls: &mut Declarations) -> Result<(Option<Expr>, Expr)> {
        let condition = if self.lexer.read_if_token(&TokenKind::If)? {
            let condition = self.parse_expression(decls, false)?;
            if condition.ty.typename() != Some(Typename::Logical) {
                return Err(Error::type_error(
                    format!("comprehension condition must be logical, found {}", condition.ty),
                    &condition.position,
                ));
            }
            Some(condition)
        } else {
            None
        };
        self.lexer.read_token(&TokenKind::Yield)?;
        let item = self.parse_expression(decls, true)?;
        self.lexer.read_token(&TokenKind::Char(']'))?;
        Ok((condition, item))
    }

    /// `length_of(x)`, `range_of(x)` and the conversions `integer(x)`,
    /// `scalar(x)`, `logical(x)`, `string(x)`.
    fn parse_builtin(&mut self, decls: &mut Declarations) -> Result<Expr> {
        let position = self.lexer.position().clone();
        let op = match self.kind() {
            TokenKind::LengthOf => BuiltinOp::LengthOf,
            TokenKind::ShapeOf => BuiltinOp::ShapeOf,
            TokenKind::RangeOf => BuiltinOp::RangeOf,
            TokenKind::Integer => BuiltinOp::Integer,
            TokenKind::Scalar => BuiltinOp::Scalar,
            TokenKind::Logical => BuiltinOp::Logical,
            TokenKind::String => BuiltinOp::String,
            _ => return Err(self.unexpected("builtin function")),
        };
        if op == BuiltinOp::ShapeOf {
            return Err(Error::semantic(
                "shape_of is deprecated and not supported",
                &position,
            ));
        }
        self.lexer.next()?;
        self.lexer.read_token(&TokenKind::Char('('))?;
        let arg = self.parse_expression(decls, true)?;
        self.lexer.read_token(&TokenKind::Char(')'))?;

        let is_sequence = arg.ty.is_array() || arg.ty.typename() == Some(Typename::String);
        let ty = match op {
            BuiltinOp::LengthOf if is_sequence => Some(self.types.integer()),
            BuiltinOp::RangeOf if is_sequence => Some(self.types.array(self.types.integer())),
            BuiltinOp::Integer if arg.ty.is_primitive() => Some(self.types.integer()),
            BuiltinOp::Scalar if arg.ty.is_primitive() => Some(self.types.scalar()),
            BuiltinOp::Logical if arg.ty.is_primitive() => Some(self.types.logical()),
            BuiltinOp::String if arg.ty.is_primitive() => Some(self.types.string()),
            _ => None,
        };
        let Some(ty) = ty else {
            return Err(Error::type_error(
                format!("{} cannot be applied to a value of type {}", op.as_str(), arg.ty),
                &arg.position,
            ));
        };
        Ok(Expr::new(
            ExprKind::Builtin {
                op,
                arg: Box::new(arg),
            },
            ty,
            position,
        ))
    }

    // Invocations

    /// Arguments of an invocation of `name`, after the name itself.
    fn parse_invocation(
        &mut self,
        decls: &mut Declarations,
        name: String,
        position: Position,
        flat: bool,
    ) -> Result<Expr> {
        let Some(fragment) = self.fragments.get(&name) else {
            return Err(Error::new(
                ErrorKind::Undeclared {
                    what: "operation",
                    name,
                },
                position,
            ));
        };
        let prototype = fragment.prototype.clone();

        let explicit = if self.lexer.read_if_token(&TokenKind::Char('<'))? {
            let data_type = self.read_typename()?;
            self.lexer.read_token(&TokenKind::Char('>'))?;
            if !prototype.is_generic() {
                return Err(Error::type_error(
                    format!("operation '{name}' is not generic"),
                    &position,
                ));
            }
            Some(data_type)
        } else {
            None
        };

        self.lexer.read_token(&TokenKind::Char('('))?;
        let mut args: IndexMap<String, Expr> = IndexMap::new();
        let mut named_only = false;
        if !self.lexer.read_if_token(&TokenKind::Char(')'))? {
            loop {
                let arg_position = self.lexer.position().clone();
                let named = matches!(self.kind(), TokenKind::Identifier(_))
                    && *self.lexer.peek()? == TokenKind::Char('=');
                let param_name = if named {
                    let param_name = self.read_identifier()?;
                    self.lexer.next()?;
                    if prototype.param(&param_name).is_none() {
                        return Err(Error::new(
                            ErrorKind::Undeclared {
                                what: "parameter",
                                name: param_name,
                            },
                            arg_position,
                        ));
                    }
                    named_only = true;
                    param_name
                } else {
                    if named_only {
                        return Err(Error::semantic(
                            "expected named argument after a named or attribute argument",
                            &arg_position,
                        ));
                    }
                    let Some(param) = prototype.params.get(args.len()) else {
                        return Err(Error::semantic(
                            format!("too many arguments for operation '{name}'"),
                            &arg_position,
                        ));
                    };
                    if param.ty.is_attribute() {
                        named_only = true;
                    }
                    param.name.clone()
                };
                if args.contains_key(&param_name) {
                    return Err(Error::new(
                        ErrorKind::Duplicate {
                            what: "argument",
                            name: param_name,
                        },
                        arg_position,
                    ));
                }
                let arg = if flat {
                    self.parse_flat_argument(decls)?
                } else {
                    self.parse_expression(decls, true)?
                };
                args.insert(param_name, arg);
                if !self.lexer.read_if_token(&TokenKind::Char(','))? {
                    break;
                }
            }
            self.lexer.read_token(&TokenKind::Char(')'))?;
        }

        self.make_invocation(prototype, args, explicit, position)
    }

    /// Check the arguments against the prototype, resolve the generic data
    /// type and build the invocation with its result type.
    fn make_invocation(
        &self,
        prototype: Arc<Prototype>,
        args: IndexMap<String, Expr>,
        explicit: Option<Typename>,
        position: Position,
    ) -> Result<Expr> {
        for param in &prototype.params {
            if param.default.is_none() && !args.contains_key(&param.name) {
                return Err(Error::semantic(
                    format!(
                        "missing argument for parameter '{}' of operation '{}'",
                        param.name, prototype.name
                    ),
                    &position,
                ));
            }
        }

        let data_type = match explicit {
            Some(data_type) => Some(data_type),
            None if prototype.is_generic() => Some(self.deduce_data_type(&prototype, &args, &position)?),
            None => None,
        };
        let bind = |ty: &TypeRef| match data_type {
            Some(data_type) => self.types.bind_data_type(ty, data_type),
            None => ty.clone(),
        };

        for param in &prototype.params {
            let Some(arg) = args.get(&param.name) else {
                continue;
            };
            let param_ty = bind(&param.ty);
            if !types::is_castable_when_bound(&arg.ty, &param_ty, true) {
                return Err(Error::type_error(
                    format!(
                        "argument '{}' of operation '{}' has type {}, expected {param_ty}",
                        param.name, prototype.name, arg.ty
                    ),
                    &arg.position,
                ));
            }
        }

        let mut result_types: Vec<TypeRef> = prototype.results.iter().map(|r| bind(&r.ty)).collect();
        let ty = if result_types.len() == 1 {
            result_types.remove(0)
        } else {
            self.types.tuple(result_types)
        };

        Ok(Expr::new(
            ExprKind::Invocation {
                target: prototype,
                args,
                data_type,
            },
            ty,
            position,
        ))
    }

    /// Unify the generic parameters of `prototype` with the argument types,
    /// using default values for omitted arguments.
    fn deduce_data_type(
        &self,
        prototype: &Prototype,
        args: &IndexMap<String, Expr>,
        position: &Position,
    ) -> Result<Typename> {
        let pairs: Vec<(TypeRef, TypeRef)> = prototype
            .params
            .iter()
            .filter_map(|param| {
                let arg_ty = match args.get(&param.name) {
                    Some(arg) => Some(arg.ty.clone()),
                    None => param.default.as_ref().and_then(|v| v.type_of(self.types)),
                };
                arg_ty.map(|arg_ty| (param.ty.clone(), arg_ty))
            })
            .collect();

        match types::deduce_data_type(pairs.iter().map(|(param, arg)| (&**param, &**arg))) {
            Ok(Some(data_type)) => Ok(data_type),
            Ok(None) => prototype.generic_default.ok_or_else(|| {
                Error::type_error(
                    format!(
                        "could not deduce generic data type of operation '{}'",
                        prototype.name
                    ),
                    position,
                )
            }),
            Err(DeductionConflict(first, second)) => Err(Error::type_error(
                format!(
                    "ambiguous candidates for generic data type of operation '{}': {first} and {second}",
                    prototype.name
                ),
                position,
            )),
        }
    }

    fn tensor_operation(&self, name: &str, position: &Position) -> Result<Arc<Prototype>> {
        match self.fragments.get(name) {
            Some(fragment) => Ok(fragment.prototype.clone()),
            None => Err(Error::new(
                ErrorKind::Undeclared {
                    what: "operation",
                    name: name.to_string(),
                },
                position.clone(),
            )),
        }
    }

    /// Invocation of the primitive `name` with `operands` bound to its
    /// parameters in order.
    fn make_sugared_invocation(&self, name: &str, operands: Vec<Expr>, position: Position) -> Result<Expr> {
        let prototype = self.tensor_operation(name, &position)?;
        if operands.len() > prototype.params.len() {
            return Err(Error::type_error(
                format!(
                    "operation '{name}' takes {} arguments, {} given",
                    prototype.params.len(),
                    operands.len()
                ),
                &position,
            ));
        }
        let args = prototype
            .params
            .iter()
            .map(|param| param.name.clone())
            .zip(operands)
            .collect();
        self.make_invocation(prototype, args, None, position)
    }

    fn make_unary(&self, op: UnaryOp, operand: Expr, position: Position) -> Result<Expr> {
        if operand.ty.is_tensor() {
            return self.make_sugared_invocation(op.tensor_op(), vec![operand], position);
        }

        if op == UnaryOp::Minus {
            let negated = match &operand.kind {
                ExprKind::Literal(Value::Integer(v)) => Some(Value::Integer(-v)),
                ExprKind::Literal(Value::Scalar(v)) => Some(Value::Scalar(-v)),
                _ => None,
            };
            if let Some(value) = negated {
                return Ok(Expr::new(ExprKind::Literal(value), operand.ty, position));
            }
        }

        let valid = match op {
            UnaryOp::Plus | UnaryOp::Minus => is_numeric(&operand.ty),
            UnaryOp::Not => operand.ty.typename() == Some(Typename::Logical),
        };
        if !valid {
            return Err(Error::type_error(
                format!("operator '{}' cannot be applied to {}", op.as_str(), operand.ty),
                &position,
            ));
        }
        let ty = operand.ty.clone();
        Ok(Expr::new(
            ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            ty,
            position,
        ))
    }

    fn make_binary(&self, op: BinaryOp, left: Expr, right: Expr, op_position: &Position) -> Result<Expr> {
        let position = left.position.clone();
        if left.ty.is_tensor() || right.ty.is_tensor() {
            let Some(name) = op.tensor_op() else {
                return Err(Error::type_error(
                    format!("operator '{}' cannot be applied to tensors", op.as_str()),
                    op_position,
                ));
            };
            return self.make_sugared_invocation(name, vec![left, right], position);
        }

        let Some(ty) = self.binary_type(op, &left.ty, &right.ty) else {
            return Err(Error::type_error(
                format!(
                    "operator '{}' cannot be applied to {} and {}",
                    op.as_str(),
                    left.ty,
                    right.ty
                ),
                op_position,
            ));
        };
        Ok(Expr::new(
            ExprKind::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
            ty,
            position,
        ))
    }

    fn binary_type(&self, op: BinaryOp, left: &TypeRef, right: &TypeRef) -> Option<TypeRef> {
        let logical = self.types.logical();
        let same_numeric = || (left == right && is_numeric(left)).then(|| left.clone());
        let is_string = |ty: &TypeRef| ty.typename() == Some(Typename::String);
        let is_integer = |ty: &TypeRef| ty.typename() == Some(Typename::Integer);

        match op {
            BinaryOp::And | BinaryOp::Or => {
                (left.typename() == Some(Typename::Logical) && right.typename() == Some(Typename::Logical))
                    .then_some(logical)
            }
            BinaryOp::In => match right.as_ref() {
                Type::Array(None) => Some(logical),
                Type::Array(Some(item)) => types::common_type(left, item, false).map(|_| logical),
                _ => None,
            },
            BinaryOp::Eq | BinaryOp::Ne => types::common_type(left, right, false).map(|_| logical),
            BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge => {
                let common = types::common_type(left, right, false)?;
                (is_numeric(&common) || is_string(&common)).then_some(logical)
            }
            BinaryOp::Add => {
                if is_string(left) && is_string(right) {
                    Some(left.clone())
                } else if left.is_array() && right.is_array() {
                    types::common_type(left, right, false)
                } else {
                    same_numeric()
                }
            }
            BinaryOp::Mul => {
                if (left.is_array() || is_string(left)) && is_integer(right) {
                    Some(left.clone())
                } else if is_integer(left) && (right.is_array() || is_string(right)) {
                    Some(right.clone())
                } else {
                    same_numeric()
                }
            }
            BinaryOp::Sub | BinaryOp::Div | BinaryOp::Pow => same_numeric(),
        }
    }

    fn make_select(&self, condition: Expr, true_value: Expr, false_value: Expr) -> Result<Expr> {
        let position = true_value.position.clone();
        if condition.ty.is_tensor() {
            return self.make_sugared_invocation("select", vec![condition, true_value, false_value], position);
        }
        if condition.ty.typename() != Some(Typename::Logical) {
            return Err(Error::type_error(
                format!("condition must be logical, found {}", condition.ty),
                &condition.position,
            ));
        }
        let Some(ty) = types::common_type(&true_value.ty, &false_value.ty, true) else {
            return Err(Error::type_error(
                format!(
                    "branches of conditional expression have incompatible types {} and {}",
                    true_value.ty, false_value.ty
                ),
                &position,
            ));
        };
        Ok(Expr::new(
            ExprKind::Select {
                condition: Box::new(condition),
                true_value: Box::new(true_value),
                false_value: Box::new(false_value),
            },
            ty,
            position,
        ))
    }

    // Flat syntax (operator expressions disabled)

    /// The right-hand side of a flat assignment: a bare invocation.
    fn parse_flat_invocation(&mut self, decls: &mut Declarations) -> Result<Expr> {
        let position = self.lexer.position().clone();
        let TokenKind::Identifier(name) = self.kind() else {
            return Err(self.unexpected("operation invocation"));
        };
        self.lexer.next()?;
        if !matches!(self.kind(), TokenKind::Char('(') | TokenKind::Char('<')) {
            return Err(self.unexpected("'('"));
        }
        self.parse_invocation(decls, name, position, true)
    }

    /// Literals, identifiers and arrays/tuples of those.
    fn parse_flat_argument(&mut self, decls: &mut Declarations) -> Result<Expr> {
        let position = self.lexer.position().clone();
        match self.kind() {
            TokenKind::Char('-') => {
                self.lexer.next()?;
                if !matches!(self.kind(), TokenKind::Decimal(_) | TokenKind::Fractional(_)) {
                    return Err(self.unexpected("number"));
                }
                let number = self.parse_primary(decls)?;
                self.make_unary(UnaryOp::Minus, number, position)
            }
            TokenKind::Decimal(_)
            | TokenKind::Fractional(_)
            | TokenKind::Characters(_)
            | TokenKind::True
            | TokenKind::False => self.parse_primary(decls),
            TokenKind::Identifier(name) => {
                self.lexer.next()?;
                self.identifier(decls, name, position)
            }
            TokenKind::Char('[') => {
                self.lexer.next()?;
                let mut items = Vec::new();
                if !self.lexer.read_if_token(&TokenKind::Char(']'))? {
                    loop {
                        items.push(self.parse_flat_argument(decls)?);
                        if !self.lexer.read_if_token(&TokenKind::Char(','))? {
                            break;
                        }
                    }
                    self.lexer.read_token(&TokenKind::Char(']'))?;
                }
                let ty = self.array_type(&items, &position)?;
                Ok(Expr::new(ExprKind::Array(items), ty, position))
            }
            TokenKind::Char('(') => {
                self.lexer.next()?;
                let mut items = vec![self.parse_flat_argument(decls)?];
                while self.lexer.read_if_token(&TokenKind::Char(','))? {
                    items.push(self.parse_flat_argument(decls)?);
                }
                self.lexer.read_token(&TokenKind::Char(')'))?;
                let ty = self.types.tuple(items.iter().map(|item| item.ty.clone()).collect());
                Ok(Expr::new(ExprKind::Tuple(items), ty, position))
            }
            _ => Err(self.unexpected("literal, identifier, array or tuple")),
        }
    }

    // Token stream helpers

    fn kind(&self) -> TokenKind {
        self.lexer.kind().clone()
    }

    fn read_identifier(&mut self) -> Result<String> {
        match self.kind() {
            TokenKind::Identifier(name) => {
                self.lexer.next()?;
                Ok(name)
            }
            _ => Err(self.unexpected("identifier")),
        }
    }

    fn unexpected(&self, expected: &str) -> Error {
        Error::new(
            ErrorKind::UnexpectedToken {
                expected: expected.to_string(),
                found: self.lexer.kind().to_string(),
            },
            self.lexer.position().clone(),
        )
    }
}

fn is_numeric(ty: &Type) -> bool {
    matches!(
        ty.typename(),
        Some(Typename::Integer | Typename::Scalar | Typename::Generic)
    )
}

/// `1.0` → (1, 0). The lexer hands the version over as a fractional number.
fn parse_version(raw: &str) -> Option<(u32, u32)> {
    let (major, minor) = raw.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// Parse a list of fragment declarations (such as the standard library) on
/// top of `fragments`, with every built-in extension enabled.
pub fn parse_fragment_declarations(
    source: &str,
    filename: &str,
    types: &TypeInterner,
    fragments: FragmentTable,
) -> Result<FragmentTable> {
    let mut parser = Parser::new(source, filename, types, fragments)?;
    parser.set_extensions(Extensions::all());
    parser.parse_fragments()?;
    parser.expect_end()?;
    Ok(parser.into_fragments())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;

    const PRIMITIVES: &str = "
        fragment external<? = scalar>( shape: integer[] ) -> ( output: tensor<?> );
        fragment variable<? = scalar>( shape: integer[], label: string ) -> ( output: tensor<?> );
        fragment update<?>( variable: tensor<?>, value: tensor<?> ) -> ( result: tensor<?> );
        fragment copy<?>( x: tensor<?> ) -> ( y: tensor<?> );
        fragment neg( x: tensor<scalar> ) -> ( y: tensor<scalar> );
        fragment add( x: tensor<scalar>, y: tensor<scalar> ) -> ( z: tensor<scalar> );
        fragment mul( x: tensor<scalar>, y: tensor<scalar> ) -> ( z: tensor<scalar> );
        fragment lt( x: tensor<scalar>, y: tensor<scalar> ) -> ( z: tensor<logical> );
        fragment select<?>( condition: tensor<logical>, true_value: tensor<?>, false_value: tensor<?> )
            -> ( output: tensor<?> );
        fragment conv( input: tensor<scalar>, filter: tensor<scalar>, bias: tensor<scalar> = 0.0,
                       border: string = 'constant', stride: integer[] = [], groups: integer = 1 )
            -> ( output: tensor<scalar> );
        fragment split<?>( value: tensor<?>, axis: integer, ratios: integer[] ) -> ( values: tensor<?>[] );
    ";

    fn parse_doc(types: &TypeInterner, source: &str) -> Result<GraphDef> {
        let fragments = parse_fragment_declarations(PRIMITIVES, "stdlib", types, FragmentTable::new())?;
        let mut parser = Parser::new(source, "test", types, fragments)?;
        parser.read_version((1, 0))?;
        parser.read_extensions(&mut |_| false)?;
        parser.parse_fragments()?;
        let graph = parser.parse_graph()?;
        parser.expect_end()?;
        Ok(graph)
    }

    fn rhs_of(graph: &GraphDef, index: usize) -> &Expr {
        &graph.assignments[index].rhs
    }

    #[test]
    fn test_flat_invocation() {
        let t = TypeInterner::new();
        let graph = parse_doc(&t, "version 1.0; graph g( x ) -> ( y ) { y = add(x, x); }").unwrap();
        assert_eq!(graph.prototype.name, "g");
        let ExprKind::Invocation { target, args, data_type } = &rhs_of(&graph, 0).kind else {
            panic!("expected invocation");
        };
        assert_eq!(target.name, "add");
        assert_eq!(args.keys().collect::<Vec<_>>(), vec!["x", "y"]);
        assert_eq!(*data_type, None);
    }

    #[test]
    fn test_operator_becomes_invocation() {
        let t = TypeInterner::new();
        let src = "version 1.0; extension KHR_enable_operator_expressions;
                   graph g( x ) -> ( y ) { y = -x * x + x; }";
        let graph = parse_doc(&t, src).unwrap();
        let rhs = rhs_of(&graph, 0);
        assert_eq!(rhs.invocation_target().unwrap().name, "add");
        let ExprKind::Invocation { args, .. } = &rhs.kind else {
            panic!("expected invocation");
        };
        assert_eq!(args["x"].invocation_target().unwrap().name, "mul");
        let ExprKind::Invocation { args: inner, .. } = &args["x"].kind else {
            panic!("expected invocation");
        };
        assert_eq!(inner["x"].invocation_target().unwrap().name, "neg");
    }

    #[test]
    fn test_operators_require_extension() {
        let t = TypeInterner::new();
        let err = parse_doc(&t, "version 1.0; graph g( x ) -> ( y ) { y = x + x; }").unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Syntax);
    }

    #[test]
    fn test_constant_precedence() {
        let t = TypeInterner::new();
        let src = "version 1.0; extension KHR_enable_operator_expressions;
                   graph g( x ) -> ( y ) { n = 1 + 2 * 3 ^ 2 < 20 && true; y = x; }";
        let graph = parse_doc(&t, src).unwrap();
        let ExprKind::Binary { op, left, .. } = &rhs_of(&graph, 0).kind else {
            panic!("expected binary");
        };
        assert_eq!(*op, BinaryOp::And);
        let ExprKind::Binary { op, left, .. } = &left.kind else {
            panic!("expected comparison");
        };
        assert_eq!(*op, BinaryOp::Lt);
        let ExprKind::Binary { op, right, .. } = &left.kind else {
            panic!("expected addition");
        };
        assert_eq!(*op, BinaryOp::Add);
        let ExprKind::Binary { op, right, .. } = &right.kind else {
            panic!("expected multiplication");
        };
        assert_eq!(*op, BinaryOp::Mul);
        assert!(matches!(right.kind, ExprKind::Binary { op: BinaryOp::Pow, .. }));
    }

    #[test]
    fn test_left_associative() {
        let t = TypeInterner::new();
        let src = "version 1.0; extension KHR_enable_operator_expressions;
                   graph g( x ) -> ( y ) { n = 8 - 4 - 2; y = x; }";
        let graph = parse_doc(&t, src).unwrap();
        let ExprKind::Binary { left, right, .. } = &rhs_of(&graph, 0).kind else {
            panic!("expected binary");
        };
        assert!(matches!(left.kind, ExprKind::Binary { op: BinaryOp::Sub, .. }));
        assert!(matches!(right.kind, ExprKind::Literal(Value::Integer(2))));
    }

    #[test]
    fn test_generic_deduction_and_explicit_type() {
        let t = TypeInterner::new();
        let src = "version 1.0; graph g( x ) -> ( y, z ) {
                       x = external<integer>(shape = [1, 3]);
                       y = copy(x);
                       z = variable(shape = [1], label = 'z');
                   }";
        let graph = parse_doc(&t, src).unwrap();
        let data_type = |i: usize| match &rhs_of(&graph, i).kind {
            ExprKind::Invocation { data_type, .. } => *data_type,
            _ => panic!("expected invocation"),
        };
        assert_eq!(data_type(0), Some(Typename::Integer));
        assert_eq!(data_type(1), Some(Typename::Integer));
        assert_eq!(rhs_of(&graph, 1).ty, t.tensor(Typename::Integer));
        // falls back to the declared default
        assert_eq!(data_type(2), Some(Typename::Scalar));
    }

    #[test]
    fn test_ambiguous_deduction() {
        let t = TypeInterner::new();
        let src = "version 1.0; extension KHR_enable_operator_expressions;
                   graph g( x ) -> ( y ) {
                       x = external<scalar>(shape = [1]);
                       c = x < x;
                       y = select(c, x, c);
                   }";
        let err = parse_doc(&t, src).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Type);
        assert!(err.to_string().contains("ambiguous"), "{err}");
    }

    #[test]
    fn test_tensor_condition_becomes_select() {
        let t = TypeInterner::new();
        let src = "version 1.0; extension KHR_enable_operator_expressions;
                   graph g( x ) -> ( y ) { y = x if x < 0.0 else -x; }";
        let graph = parse_doc(&t, src).unwrap();
        let rhs = rhs_of(&graph, 0);
        assert_eq!(rhs.invocation_target().unwrap().name, "select");
        assert_eq!(rhs.ty, t.tensor(Typename::Scalar));
    }

    #[test]
    fn test_sticky_named_arguments() {
        let t = TypeInterner::new();
        let ok = "version 1.0; graph g( x, w ) -> ( y ) { y = conv(x, w, 0.0, 'constant', stride = [1, 1]); }";
        // the first attribute may still be positional
        assert!(parse_doc(&t, ok).is_ok());

        let err = parse_doc(
            &t,
            "version 1.0; graph g( x, w ) -> ( y ) { y = conv(x, w, border = 'constant', [1, 1]); }",
        )
        .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Semantic);

        let err = parse_doc(
            &t,
            "version 1.0; graph g( x, w ) -> ( y ) { y = conv(x, w, 0.0, 'same', [1, 1]); }",
        )
        .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Semantic);
    }

    #[test]
    fn test_duplicate_argument() {
        let t = TypeInterner::new();
        let err = parse_doc(&t, "version 1.0; graph g( x ) -> ( y ) { y = add(x, x = x); }").unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Duplicate { what: "argument", .. }));
    }

    #[test]
    fn test_incastable_argument() {
        let t = TypeInterner::new();
        let err = parse_doc(&t, "version 1.0; graph g( x ) -> ( y ) { y = add(x, 'a'); }").unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Type);
    }

    #[test]
    fn test_missing_argument() {
        let t = TypeInterner::new();
        let err = parse_doc(&t, "version 1.0; graph g( x ) -> ( y ) { y = conv(x); }").unwrap_err();
        assert!(err.to_string().contains("missing argument for parameter 'filter'"), "{err}");
    }

    #[test]
    fn test_undeclared_identifier_and_operation() {
        let t = TypeInterner::new();
        let err = parse_doc(&t, "version 1.0; graph g( x ) -> ( y ) { y = add(x, w); }").unwrap_err();
        assert_eq!(
            err.kind,
            ErrorKind::Undeclared {
                what: "identifier",
                name: "w".into()
            }
        );
        let err = parse_doc(&t, "version 1.0; graph g( x ) -> ( y ) { y = frobnicate(x); }").unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Scope);
    }

    #[test]
    fn test_version_checks() {
        let t = TypeInterner::new();
        let err = parse_doc(&t, "version 2.0; graph g( x ) -> ( y ) { y = copy(x); }").unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnsupportedVersion { major: 2, minor: 0 });
        let err = parse_doc(&t, "version 1; graph g( x ) -> ( y ) { y = copy(x); }").unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Syntax);
    }

    #[test]
    fn test_unhandled_extension() {
        let t = TypeInterner::new();
        let err = parse_doc(&t, "version 1.0; extension KHR_foo; graph g( x ) -> ( y ) { y = copy(x); }")
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnhandledExtension("KHR_foo".into()));
    }

    #[test]
    fn test_fragment_requires_extension() {
        let t = TypeInterner::new();
        let src = "version 1.0;
                   fragment f( x: tensor<scalar> ) -> ( y: tensor<scalar> ) { y = copy(x); }
                   graph g( x ) -> ( y ) { y = f(x); }";
        let err = parse_doc(&t, src).unwrap_err();
        assert!(err.to_string().contains(FRAGMENT_DEFINITIONS), "{err}");
    }

    #[test]
    fn test_generic_marker_rules() {
        let t = TypeInterner::new();
        let missing = "version 1.0; extension KHR_enable_fragment_definitions;
                       fragment f( x: tensor<?> ) -> ( y: tensor<?> ) { y = copy(x); }
                       graph g( x ) -> ( y ) { y = f(x); }";
        assert_eq!(parse_doc(&t, missing).unwrap_err().category(), ErrorCategory::Type);

        let extra = "version 1.0; extension KHR_enable_fragment_definitions;
                     fragment f<?>( x: tensor<scalar> ) -> ( y: tensor<scalar> ) { y = copy(x); }
                     graph g( x ) -> ( y ) { y = f(x); }";
        assert_eq!(parse_doc(&t, extra).unwrap_err().category(), ErrorCategory::Type);
    }

    #[test]
    fn test_generic_body_calls_concrete_operation() {
        let t = TypeInterner::new();
        let src = "version 1.0; extension KHR_enable_fragment_definitions;
                   fragment double<?>( x: tensor<?> ) -> ( y: tensor<?> ) { y = add(x, x); }
                   graph g( x ) -> ( y ) { y = double(x); }";
        let graph = parse_doc(&t, src).unwrap();
        assert_eq!(rhs_of(&graph, 0).invocation_target().unwrap().name, "double");

        let src = "version 1.0; extension KHR_enable_fragment_definitions;
                   fragment f<?>( x: tensor<?> ) -> ( y: tensor<?> ) { y = add(x, 'a'); }
                   graph g( x ) -> ( y ) { y = f(x); }";
        assert_eq!(parse_doc(&t, src).unwrap_err().category(), ErrorCategory::Type);
    }

    #[test]
    fn test_attribute_parameter_order() {
        let t = TypeInterner::new();
        let src = "version 1.0; extension KHR_enable_fragment_definitions;
                   fragment f( n: integer, x: tensor<scalar> ) -> ( y: tensor<scalar> ) { y = copy(x); }
                   graph g( x ) -> ( y ) { y = f(1, x); }";
        assert_eq!(parse_doc(&t, src).unwrap_err().category(), ErrorCategory::Semantic);
    }

    #[test]
    fn test_mixed_results() {
        let t = TypeInterner::new();
        let src = "version 1.0; extension KHR_enable_fragment_definitions;
                   fragment f( x: tensor<scalar> ) -> ( y: tensor<scalar>, n: integer ) { y = copy(x); n = 1; }
                   graph g( x ) -> ( y ) { (y, n) = f(x); }";
        let err = parse_doc(&t, src).unwrap_err();
        assert!(err.to_string().contains("all tensors or all attributes"), "{err}");
    }

    #[test]
    fn test_default_values_are_typed() {
        let t = TypeInterner::new();
        let fragments = parse_fragment_declarations(PRIMITIVES, "stdlib", &t, FragmentTable::new()).unwrap();
        let conv = &fragments["conv"].prototype;
        assert_eq!(conv.param("bias").unwrap().default, Some(Value::Scalar(0.0)));
        assert_eq!(conv.param("stride").unwrap().default, Some(Value::Array(vec![])));

        let err = parse_fragment_declarations(
            "fragment f( x: tensor<scalar>, n: integer = 'a' ) -> ( y: tensor<scalar> );",
            "stdlib",
            &t,
            FragmentTable::new(),
        )
        .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Type);
    }

    #[test]
    fn test_comprehension_scoping() {
        let t = TypeInterner::new();
        let src = "version 1.0; extension KHR_enable_operator_expressions;
                   graph g( x ) -> ( y ) {
                       a = [1, 2, 3];
                       b = [for i in range_of(a) if i != 1 yield a[i] * 2];
                       y = x;
                   }";
        let graph = parse_doc(&t, src).unwrap();
        assert_eq!(rhs_of(&graph, 1).ty, t.array(t.integer()));

        let leaked = "version 1.0; extension KHR_enable_operator_expressions;
                      graph g( x ) -> ( y ) { a = [for i in [1, 2] yield i]; b = i; y = x; }";
        let err = parse_doc(&t, leaked).unwrap_err();
        assert_eq!(
            err.kind,
            ErrorKind::Undeclared {
                what: "identifier",
                name: "i".into()
            }
        );
    }

    #[test]
    fn test_subscripts() {
        let t = TypeInterner::new();
        let src = "version 1.0; extension KHR_enable_operator_expressions;
                   graph g( x ) -> ( y ) {
                       p = (1, 'a', 2.0);
                       s = p[-1];
                       a = [1, 2, 3][1:];
                       c = 'abc'[0];
                       y = x;
                   }";
        let graph = parse_doc(&t, src).unwrap();
        assert_eq!(rhs_of(&graph, 1).ty, t.scalar());
        assert_eq!(rhs_of(&graph, 2).ty, t.array(t.integer()));
        assert_eq!(rhs_of(&graph, 3).ty, t.string());

        let bad = "version 1.0; extension KHR_enable_operator_expressions;
                   graph g( x ) -> ( y ) { p = (1, 2); i = 0; s = p[i]; y = x; }";
        assert_eq!(parse_doc(&t, bad).unwrap_err().category(), ErrorCategory::Type);
    }

    #[test]
    fn test_shape_of_is_rejected() {
        let t = TypeInterner::new();
        let src = "version 1.0; extension KHR_enable_operator_expressions;
                   graph g( x ) -> ( y ) { s = shape_of(x); y = x; }";
        let err = parse_doc(&t, src).unwrap_err();
        assert!(err.to_string().contains("shape_of"), "{err}");
    }

    #[test]
    fn test_array_pattern_declares_items() {
        let t = TypeInterner::new();
        let src = "version 1.0; graph g( x ) -> ( a, b ) { [a, b] = split(x, axis = 1, ratios = [1, 1]); }";
        let graph = parse_doc(&t, src).unwrap();
        let lhs = &graph.assignments[0].lhs;
        assert_eq!(lhs.identifiers(), vec!["a", "b"]);
        assert_eq!(lhs.ty, t.array(t.tensor(Typename::Scalar)));
    }

    #[test]
    fn test_flat_arguments_reject_expressions() {
        let t = TypeInterner::new();
        let err = parse_doc(
            &t,
            "version 1.0; graph g( x ) -> ( y ) { y = conv(x, x, groups = 1 + 1); }",
        )
        .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Syntax);
        // a leading minus on numbers is still allowed
        assert!(parse_doc(
            &t,
            "version 1.0; graph g( x ) -> ( y ) { y = conv(x, x, bias = -1.0); }"
        )
        .is_ok());
    }
}
