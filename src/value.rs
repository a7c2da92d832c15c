// Value — Results of evaluating NNEF expressions
//
// A Value is either a constant (integer, scalar, logical, string, arrays and
// tuples of those) or an Identifier naming a tensor of the flattened graph.
// Identifiers take part in equality, cloning and printing exactly like the
// constants do; the evaluator compares them to decide when an aliasing copy
// is needed.

use std::fmt;

use crate::types::{Type, TypeInterner, TypeRef, Typename};

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    None,
    Integer(i32),
    Scalar(f32),
    Logical(bool),
    String(String),
    /// Name of a tensor in the flattened graph.
    Identifier(String),
    Array(Vec<Value>),
    Tuple(Vec<Value>),
}

impl Value {
    pub fn identifier(name: impl Into<String>) -> Self {
        Value::Identifier(name.into())
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn as_integer(&self) -> Option<i32> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_scalar(&self) -> Option<f32> {
        match self {
            Value::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_logical(&self) -> Option<bool> {
        match self {
            Value::Logical(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_identifier(&self) -> Option<&str> {
        match self {
            Value::Identifier(id) => Some(id),
            _ => None,
        }
    }

    /// Items of an array or tuple.
    pub fn items(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) | Value::Tuple(items) => Some(items),
            _ => None,
        }
    }

    /// Primitive type name of a constant leaf, `None` for identifiers and
    /// compound values.
    pub fn typename(&self) -> Option<Typename> {
        match self {
            Value::Integer(_) => Some(Typename::Integer),
            Value::Scalar(_) => Some(Typename::Scalar),
            Value::Logical(_) => Some(Typename::Logical),
            Value::String(_) => Some(Typename::String),
            _ => None,
        }
    }

    /// Visit every identifier inside the value, depth first.
    pub fn for_each_identifier<'a>(&'a self, f: &mut impl FnMut(&'a str)) {
        match self {
            Value::Identifier(id) => f(id),
            Value::Array(items) | Value::Tuple(items) => {
                for item in items {
                    item.for_each_identifier(f);
                }
            }
            _ => {}
        }
    }

    /// The type a constant value has when it appears as a literal.
    ///
    /// Identifiers have no static type of their own and map to the unbound
    /// tensor type. Arrays take the common type of their items.
    pub fn type_of(&self, types: &TypeInterner) -> Option<TypeRef> {
        match self {
            Value::None => None,
            Value::Integer(_) => Some(types.integer()),
            Value::Scalar(_) => Some(types.scalar()),
            Value::Logical(_) => Some(types.logical()),
            Value::String(_) => Some(types.string()),
            Value::Identifier(_) => Some(types.unbound_tensor()),
            Value::Array(items) => {
                let mut item_type: Option<TypeRef> = None;
                for item in items {
                    let ty = item.type_of(types)?;
                    item_type = match item_type {
                        None => Some(ty),
                        Some(current) => Some(crate::types::common_type(&current, &ty, false)?),
                    };
                }
                Some(match item_type {
                    Some(item) => types.array(item),
                    None => types.empty_array(),
                })
            }
            Value::Tuple(items) => {
                let items = items
                    .iter()
                    .map(|item| item.type_of(types))
                    .collect::<Option<Vec<_>>>()?;
                Some(types.tuple(items))
            }
        }
    }

    /// Whether the value fits the shape of `ty` (tensors accept identifiers
    /// and primitive constants).
    pub fn conforms_to(&self, ty: &Type) -> bool {
        match (self, ty) {
            (Value::Identifier(_), Type::Tensor(_)) => true,
            (_, Type::Tensor(_)) => self.typename().is_some(),
            (Value::Array(items), Type::Array(item)) => match item {
                Some(item) => items.iter().all(|v| v.conforms_to(item)),
                None => items.is_empty(),
            },
            (Value::Tuple(items), Type::Tuple(types)) => {
                items.len() == types.len() && items.iter().zip(types).all(|(v, t)| v.conforms_to(t))
            }
            (_, Type::Primitive(Typename::Generic)) => self.typename().is_some(),
            (_, Type::Primitive(name)) => self.typename() == Some(*name),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "none"),
            Value::Integer(v) => write!(f, "{v}"),
            Value::Scalar(v) => write!(f, "{v:?}"),
            Value::Logical(v) => write!(f, "{v}"),
            Value::String(s) => write!(f, "'{s}'"),
            Value::Identifier(id) => write!(f, "{id}"),
            Value::Array(items) => {
                write!(f, "[")?;
                write_items(f, items)?;
                write!(f, "]")
            }
            Value::Tuple(items) => {
                write!(f, "(")?;
                write_items(f, items)?;
                write!(f, ")")
            }
        }
    }
}

fn write_items(f: &mut fmt::Formatter<'_>, items: &[Value]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}
