// Prototype — Operation signatures and fragment definitions
//
//   fragment conv( input: tensor<scalar>, ..., groups: integer = 1 )
//       -> ( output: tensor<scalar> );
//
// A Prototype is the signature part of a fragment or graph declaration. A
// Fragment pairs a Prototype with its body; primitives have an empty body.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::ast::Assignment;
use crate::types::{TypeRef, Typename};
use crate::value::Value;

/// A declared parameter: `name: type [= default]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub ty: TypeRef,
    pub default: Option<Value>,
}

/// A declared result: `name: type`.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultParam {
    pub name: String,
    pub ty: TypeRef,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prototype {
    pub name: String,
    pub params: Vec<Param>,
    pub results: Vec<ResultParam>,
    /// Default for the generic data type: `fragment f<? = scalar>(...)`.
    pub generic_default: Option<Typename>,
    has_generic_params: bool,
    has_generic_results: bool,
}

impl Prototype {
    pub fn new(
        name: impl Into<String>,
        params: Vec<Param>,
        results: Vec<ResultParam>,
        generic_default: Option<Typename>,
    ) -> Self {
        let has_generic_params = params.iter().any(|p| p.ty.is_generic());
        let has_generic_results = results.iter().any(|r| r.ty.is_generic());
        Self {
            name: name.into(),
            params,
            results,
            generic_default,
            has_generic_params,
            has_generic_results,
        }
    }

    pub fn param(&self, name: &str) -> Option<&Param> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn result(&self, name: &str) -> Option<&ResultParam> {
        self.results.iter().find(|r| r.name == name)
    }

    pub fn has_generic_params(&self) -> bool {
        self.has_generic_params
    }

    pub fn has_generic_results(&self) -> bool {
        self.has_generic_results
    }

    pub fn is_generic(&self) -> bool {
        self.has_generic_params || self.has_generic_results
    }
}

impl fmt::Display for Prototype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if self.is_generic() {
            match self.generic_default {
                Some(default) => write!(f, "<? = {default}>")?,
                None => write!(f, "<?>")?,
            }
        }
        write!(f, "( ")?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", param.name, param.ty)?;
            if let Some(default) = &param.default {
                write!(f, " = {default}")?;
            }
        }
        write!(f, " ) -> ( ")?;
        for (i, result) in self.results.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", result.name, result.ty)?;
        }
        write!(f, " )")
    }
}

/// A fragment declaration: its prototype and, for compound fragments, the
/// assignments making up its body.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub prototype: Arc<Prototype>,
    pub assignments: Vec<Assignment>,
}

impl Fragment {
    pub fn primitive(prototype: Arc<Prototype>) -> Self {
        Self {
            prototype,
            assignments: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.prototype.name
    }

    pub fn is_primitive(&self) -> bool {
        self.assignments.is_empty()
    }
}

/// Known fragments by name, in declaration order.
pub type FragmentTable = IndexMap<String, Fragment>;
