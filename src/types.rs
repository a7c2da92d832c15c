// Types — The closed type algebra of NNEF declarations and expressions
//
// A type is one of:
//
//   Primitive   integer | scalar | logical | string | ? (generic)
//   Tensor      tensor<T> over a primitive element type, or tensor<> unbound
//   Array       T[] (the item type is unbound for the empty array literal)
//   Tuple       (T1, T2, ...)
//
// Types are interned: a TypeInterner hands out one shared TypeRef per
// structurally distinct type, so two TypeRefs for the same type are always
// the same allocation. The interner is owned by one parse; nothing here is
// global.
//
// Generic fragments mention the `?` primitive. `bind_data_type` substitutes
// a concrete primitive for it, `deduce_data_type` recovers that primitive by
// walking a declared parameter type against an actual argument type.

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;

/// Name of a primitive type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Typename {
    Integer,
    Scalar,
    Logical,
    String,
    Generic,
}

impl Typename {
    pub fn as_str(self) -> &'static str {
        match self {
            Typename::Integer => "integer",
            Typename::Scalar => "scalar",
            Typename::Logical => "logical",
            Typename::String => "string",
            Typename::Generic => "?",
        }
    }
}

impl fmt::Display for Typename {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared handle to an interned type.
pub type TypeRef = Arc<Type>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Primitive(Typename),
    Tensor(Option<TypeRef>),
    Array(Option<TypeRef>),
    Tuple(Vec<TypeRef>),
}

impl Type {
    pub fn is_primitive(&self) -> bool {
        matches!(self, Type::Primitive(_))
    }

    pub fn is_tensor(&self) -> bool {
        matches!(self, Type::Tensor(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Type::Array(_))
    }

    pub fn is_tuple(&self) -> bool {
        matches!(self, Type::Tuple(_))
    }

    /// The primitive name, for primitive types.
    pub fn typename(&self) -> Option<Typename> {
        match self {
            Type::Primitive(name) => Some(*name),
            _ => None,
        }
    }

    /// Item type of an array, `None` for non-arrays and the empty array.
    pub fn item_type(&self) -> Option<&TypeRef> {
        match self {
            Type::Array(item) => item.as_ref(),
            _ => None,
        }
    }

    /// Element type name of a tensor, if bound.
    pub fn tensor_data_type(&self) -> Option<Typename> {
        match self {
            Type::Tensor(Some(data)) => data.typename(),
            _ => None,
        }
    }

    /// True if the generic primitive occurs anywhere inside the type.
    pub fn is_generic(&self) -> bool {
        match self {
            Type::Primitive(name) => *name == Typename::Generic,
            Type::Tensor(data) | Type::Array(data) => data.as_ref().is_some_and(|t| t.is_generic()),
            Type::Tuple(items) => items.iter().any(|t| t.is_generic()),
        }
    }

    /// True for non-tensor leaves and arrays/tuples built only from them.
    pub fn is_attribute(&self) -> bool {
        match self {
            Type::Primitive(_) => true,
            Type::Tensor(_) => false,
            Type::Array(item) => item.as_ref().map_or(true, |t| t.is_attribute()),
            Type::Tuple(items) => items.iter().all(|t| t.is_attribute()),
        }
    }

    /// True if a tensor type occurs anywhere inside the type.
    pub fn contains_tensor(&self) -> bool {
        match self {
            Type::Primitive(_) => false,
            Type::Tensor(_) => true,
            Type::Array(item) => item.as_ref().is_some_and(|t| t.contains_tensor()),
            Type::Tuple(items) => items.iter().any(|t| t.contains_tensor()),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Primitive(name) => write!(f, "{name}"),
            Type::Tensor(Some(data)) => write!(f, "tensor<{data}>"),
            Type::Tensor(None) => write!(f, "tensor<>"),
            Type::Array(Some(item)) => write!(f, "{item}[]"),
            Type::Array(None) => write!(f, "[]"),
            Type::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Per-parse cache of interned types.
///
/// Lookups take `&self` so the interner can be shared by the parser, the
/// prototypes it builds and the evaluator. It is not `Sync`: concurrent
/// parses each own an interner.
pub struct TypeInterner {
    cache: RefCell<FxHashMap<Type, TypeRef>>,
}

impl Default for TypeInterner {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeInterner {
    pub fn new() -> Self {
        Self {
            cache: RefCell::new(FxHashMap::default()),
        }
    }

    /// Return the shared instance for `ty`.
    pub fn intern(&self, ty: Type) -> TypeRef {
        let mut cache = self.cache.borrow_mut();
        if let Some(existing) = cache.get(&ty) {
            return existing.clone();
        }
        let shared = Arc::new(ty.clone());
        cache.insert(ty, shared.clone());
        shared
    }

    /// Number of distinct types created so far.
    pub fn len(&self) -> usize {
        self.cache.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.borrow().is_empty()
    }

    pub fn primitive(&self, name: Typename) -> TypeRef {
        self.intern(Type::Primitive(name))
    }

    pub fn integer(&self) -> TypeRef {
        self.primitive(Typename::Integer)
    }

    pub fn scalar(&self) -> TypeRef {
        self.primitive(Typename::Scalar)
    }

    pub fn logical(&self) -> TypeRef {
        self.primitive(Typename::Logical)
    }

    pub fn string(&self) -> TypeRef {
        self.primitive(Typename::String)
    }

    pub fn generic(&self) -> TypeRef {
        self.primitive(Typename::Generic)
    }

    /// `tensor<name>`.
    pub fn tensor(&self, name: Typename) -> TypeRef {
        let data = self.primitive(name);
        self.intern(Type::Tensor(Some(data)))
    }

    /// `tensor<>` with no element type.
    pub fn unbound_tensor(&self) -> TypeRef {
        self.intern(Type::Tensor(None))
    }

    pub fn tensor_of(&self, data: Option<TypeRef>) -> TypeRef {
        self.intern(Type::Tensor(data))
    }

    pub fn array(&self, item: TypeRef) -> TypeRef {
        self.intern(Type::Array(Some(item)))
    }

    /// Type of the empty array literal.
    pub fn empty_array(&self) -> TypeRef {
        self.intern(Type::Array(None))
    }

    pub fn tuple(&self, items: Vec<TypeRef>) -> TypeRef {
        self.intern(Type::Tuple(items))
    }

    /// Substitute `data_type` for every generic primitive inside `ty`.
    ///
    /// Returns `ty` itself when it is not generic or when `data_type` is
    /// itself the generic primitive.
    pub fn bind_data_type(&self, ty: &TypeRef, data_type: Typename) -> TypeRef {
        if !ty.is_generic() || data_type == Typename::Generic {
            return ty.clone();
        }
        match ty.as_ref() {
            Type::Primitive(Typename::Generic) => self.primitive(data_type),
            Type::Primitive(_) => ty.clone(),
            Type::Tensor(data) => {
                let data = data.as_ref().map(|d| self.bind_data_type(d, data_type));
                self.tensor_of(data)
            }
            Type::Array(item) => match item {
                Some(item) => self.array(self.bind_data_type(item, data_type)),
                None => ty.clone(),
            },
            Type::Tuple(items) => {
                let items = items
                    .iter()
                    .map(|t| self.bind_data_type(t, data_type))
                    .collect();
                self.tuple(items)
            }
        }
    }
}

/// Whether a value of type `from` may be used where `to` is expected.
///
/// An unbound tensor element type on the target side matches any tensor.
/// An unbound array item type on either side matches any array, so the
/// empty array literal fits every array type. With `allow_primitive_to_tensor`,
/// a primitive may stand in for a tensor of a compatible element type.
pub fn is_castable(from: &Type, to: &Type, allow_primitive_to_tensor: bool) -> bool {
    castable(from, to, allow_primitive_to_tensor, false)
}

/// Like [`is_castable`], except that a generic primitive in `from` matches
/// any primitive of `to`.
///
/// Inside a generic fragment body the argument types still carry `?`; the
/// real check happens when the fragment is instantiated with a concrete
/// data type.
pub fn is_castable_when_bound(from: &Type, to: &Type, allow_primitive_to_tensor: bool) -> bool {
    castable(from, to, allow_primitive_to_tensor, true)
}

fn castable(from: &Type, to: &Type, allow_primitive_to_tensor: bool, defer_generic: bool) -> bool {
    if from == to {
        return true;
    }
    let recurse = |a: &Type, b: &Type| castable(a, b, allow_primitive_to_tensor, defer_generic);
    match (from, to) {
        (Type::Primitive(a), Type::Primitive(b)) => {
            a == b || *b == Typename::Generic || (defer_generic && *a == Typename::Generic)
        }
        (Type::Tensor(a), Type::Tensor(b)) => match (a, b) {
            (Some(a), Some(b)) => recurse(a, b),
            (_, None) => true,
            (None, Some(_)) => false,
        },
        (Type::Array(a), Type::Array(b)) => match (a, b) {
            (Some(a), Some(b)) => recurse(a, b),
            (None, _) | (_, None) => true,
        },
        (Type::Tuple(a), Type::Tuple(b)) => a.len() == b.len() && a.iter().zip(b).all(|(a, b)| recurse(a, b)),
        (Type::Primitive(_), Type::Tensor(data)) if allow_primitive_to_tensor => match data {
            Some(data) => recurse(from, data),
            None => true,
        },
        _ => false,
    }
}

/// The type both `a` and `b` can be cast to: `b` if `a` casts to `b`, else
/// `a` if `b` casts to `a`. When both directions hold, the type with bound
/// array items wins.
pub fn common_type(a: &TypeRef, b: &TypeRef, allow_primitive_to_tensor: bool) -> Option<TypeRef> {
    match (
        is_castable(a, b, allow_primitive_to_tensor),
        is_castable(b, a, allow_primitive_to_tensor),
    ) {
        (true, true) if has_unbound_items(b) && !has_unbound_items(a) => Some(a.clone()),
        (true, _) => Some(b.clone()),
        (false, true) => Some(a.clone()),
        (false, false) => None,
    }
}

fn has_unbound_items(ty: &Type) -> bool {
    match ty {
        Type::Primitive(_) => false,
        Type::Tensor(data) => data.as_ref().is_some_and(|t| has_unbound_items(t)),
        Type::Array(item) => item.as_ref().map_or(true, |t| has_unbound_items(t)),
        Type::Tuple(items) => items.iter().any(|t| has_unbound_items(t)),
    }
}

/// Two different primitives deduced for the same generic parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeductionConflict(pub Typename, pub Typename);

/// Walk `param` against `arg` in lock-step and record the primitive the
/// argument supplies wherever the parameter exposes the generic primitive.
pub fn deduce_param_data_type(
    param: &Type,
    arg: &Type,
    candidate: &mut Option<Typename>,
) -> std::result::Result<(), DeductionConflict> {
    match (param, arg) {
        (Type::Primitive(Typename::Generic), Type::Primitive(name)) => record(candidate, *name),
        (Type::Tensor(Some(data)), Type::Tensor(Some(arg_data))) => {
            deduce_param_data_type(data, arg_data, candidate)
        }
        (Type::Tensor(Some(data)), Type::Primitive(_)) => deduce_param_data_type(data, arg, candidate),
        (Type::Array(Some(item)), Type::Array(Some(arg_item))) => {
            deduce_param_data_type(item, arg_item, candidate)
        }
        (Type::Tuple(items), Type::Tuple(arg_items)) => {
            for (item, arg_item) in items.iter().zip(arg_items) {
                deduce_param_data_type(item, arg_item, candidate)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Unify several (parameter, argument) type pairs into one generic data
/// type. `Ok(None)` means no argument constrained the generic.
pub fn deduce_data_type<'a>(
    pairs: impl IntoIterator<Item = (&'a Type, &'a Type)>,
) -> std::result::Result<Option<Typename>, DeductionConflict> {
    let mut candidate = None;
    for (param, arg) in pairs {
        if param.is_generic() {
            deduce_param_data_type(param, arg, &mut candidate)?;
        }
    }
    Ok(candidate)
}

pub(crate) fn record(
    candidate: &mut Option<Typename>,
    name: Typename,
) -> std::result::Result<(), DeductionConflict> {
    match *candidate {
        None => {
            *candidate = Some(name);
            Ok(())
        }
        Some(existing) if existing == name => Ok(()),
        Some(existing) => Err(DeductionConflict(existing, name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_types(t: &TypeInterner) -> Vec<TypeRef> {
        vec![
            t.integer(),
            t.scalar(),
            t.logical(),
            t.string(),
            t.generic(),
            t.tensor(Typename::Scalar),
            t.tensor(Typename::Generic),
            t.unbound_tensor(),
            t.array(t.integer()),
            t.empty_array(),
            t.array(t.tensor(Typename::Scalar)),
            t.tuple(vec![t.integer(), t.integer()]),
        ]
    }

    #[test]
    fn test_interning_shares_instances() {
        let t = TypeInterner::new();
        let a = t.array(t.tuple(vec![t.integer(), t.integer()]));
        let b = t.array(t.tuple(vec![t.integer(), t.integer()]));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&t.tensor(Typename::Scalar), &t.tensor(Typename::Integer)));
    }

    #[test]
    fn test_castable_is_reflexive() {
        let t = TypeInterner::new();
        for ty in sample_types(&t) {
            assert!(is_castable(&ty, &ty, false), "{ty}");
            assert!(is_castable(&ty, &ty, true), "{ty}");
        }
    }

    #[test]
    fn test_common_type_of_same_type_is_itself() {
        let t = TypeInterner::new();
        for ty in sample_types(&t) {
            let common = common_type(&ty, &ty, true).unwrap();
            assert!(Arc::ptr_eq(&common, &ty));
        }
    }

    #[test]
    fn test_common_type_is_symmetric() {
        let t = TypeInterner::new();
        let types = sample_types(&t);
        for a in &types {
            for b in &types {
                assert_eq!(common_type(a, b, true), common_type(b, a, true), "{a} vs {b}");
            }
        }
    }

    #[test]
    fn test_primitive_castability() {
        let t = TypeInterner::new();
        assert!(is_castable(&t.integer(), &t.generic(), false));
        assert!(!is_castable(&t.integer(), &t.scalar(), false));
        assert!(!is_castable(&t.generic(), &t.integer(), false));
    }

    #[test]
    fn test_tensor_castability() {
        let t = TypeInterner::new();
        let scalar_tensor = t.tensor(Typename::Scalar);
        assert!(is_castable(&scalar_tensor, &t.unbound_tensor(), false));
        assert!(!is_castable(&t.unbound_tensor(), &scalar_tensor, false));
        assert!(is_castable(&scalar_tensor, &t.tensor(Typename::Generic), false));
        assert!(!is_castable(&t.tensor(Typename::Integer), &scalar_tensor, false));
    }

    #[test]
    fn test_primitive_to_tensor() {
        let t = TypeInterner::new();
        let scalar_tensor = t.tensor(Typename::Scalar);
        assert!(is_castable(&t.scalar(), &scalar_tensor, true));
        assert!(!is_castable(&t.scalar(), &scalar_tensor, false));
        assert!(!is_castable(&t.integer(), &scalar_tensor, true));
        assert!(is_castable(&t.integer(), &t.unbound_tensor(), true));
        assert_eq!(
            common_type(&t.scalar(), &scalar_tensor, true),
            Some(scalar_tensor.clone())
        );
    }

    #[test]
    fn test_empty_array_casts_to_any_array() {
        let t = TypeInterner::new();
        let pairs = t.array(t.tuple(vec![t.integer(), t.integer()]));
        assert!(is_castable(&t.empty_array(), &pairs, false));
        assert!(is_castable(&pairs, &t.empty_array(), false));
        assert!(!is_castable(&t.array(t.integer()), &t.array(t.scalar()), false));
        assert_eq!(common_type(&t.empty_array(), &pairs, false), Some(pairs.clone()));
        assert_eq!(common_type(&pairs, &t.empty_array(), false), Some(pairs.clone()));
    }

    #[test]
    fn test_generic_arguments_cast_once_bound() {
        let t = TypeInterner::new();
        let generic_tensor = t.tensor(Typename::Generic);
        let scalar_tensor = t.tensor(Typename::Scalar);
        assert!(!is_castable(&generic_tensor, &scalar_tensor, true));
        assert!(is_castable_when_bound(&generic_tensor, &scalar_tensor, true));
        assert!(is_castable_when_bound(&t.array(generic_tensor.clone()), &t.array(scalar_tensor), true));
        assert!(!is_castable_when_bound(&generic_tensor, &t.scalar(), true));
        assert!(!is_castable_when_bound(&t.integer(), &t.scalar(), true));
    }

    #[test]
    fn test_tuple_castability() {
        let t = TypeInterner::new();
        let a = t.tuple(vec![t.integer(), t.scalar()]);
        let b = t.tuple(vec![t.integer(), t.generic()]);
        let c = t.tuple(vec![t.integer()]);
        assert!(is_castable(&a, &b, false));
        assert!(!is_castable(&a, &c, false));
    }

    #[test]
    fn test_attribute_and_generic_flags() {
        let t = TypeInterner::new();
        assert!(t.array(t.tuple(vec![t.integer(), t.integer()])).is_attribute());
        assert!(!t.array(t.tensor(Typename::Scalar)).is_attribute());
        assert!(t.array(t.generic()).is_generic());
        assert!(t.tuple(vec![t.integer(), t.tensor(Typename::Generic)]).is_generic());
        assert!(!t.tensor(Typename::Scalar).is_generic());
    }

    #[test]
    fn test_bind_data_type() {
        let t = TypeInterner::new();
        let generic_array = t.array(t.tensor(Typename::Generic));
        let bound = t.bind_data_type(&generic_array, Typename::Integer);
        assert!(Arc::ptr_eq(&bound, &t.array(t.tensor(Typename::Integer))));

        // identity on non-generic types
        let concrete = t.tensor(Typename::Scalar);
        assert!(Arc::ptr_eq(&t.bind_data_type(&concrete, Typename::Integer), &concrete));

        // binding to the generic primitive leaves the type alone
        assert!(Arc::ptr_eq(
            &t.bind_data_type(&generic_array, Typename::Generic),
            &generic_array
        ));

        // idempotent
        let twice = t.bind_data_type(&bound, Typename::Integer);
        assert!(Arc::ptr_eq(&twice, &bound));
    }

    #[test]
    fn test_deduce_single_type() {
        let t = TypeInterner::new();
        let param = t.tensor(Typename::Generic);
        let arg = t.tensor(Typename::Logical);
        let deduced = deduce_data_type([(&*param, &*arg), (&*param, &*arg)]).unwrap();
        assert_eq!(deduced, Some(Typename::Logical));
    }

    #[test]
    fn test_deduce_through_arrays_and_literals() {
        let t = TypeInterner::new();
        let values = t.array(t.generic());
        let deduced = deduce_data_type([(&*values, &*t.array(t.scalar()))]).unwrap();
        assert_eq!(deduced, Some(Typename::Scalar));

        let tensor = t.tensor(Typename::Generic);
        let deduced = deduce_data_type([(&*tensor, &*t.integer())]).unwrap();
        assert_eq!(deduced, Some(Typename::Integer));
    }

    #[test]
    fn test_deduce_conflict_reports_pair() {
        let t = TypeInterner::new();
        let param = t.tensor(Typename::Generic);
        let err = deduce_data_type([
            (&*param, &*t.tensor(Typename::Scalar)),
            (&*param, &*t.tensor(Typename::Integer)),
        ])
        .unwrap_err();
        assert_eq!(err, DeductionConflict(Typename::Scalar, Typename::Integer));
    }

    #[test]
    fn test_deduce_ignores_unbound() {
        let t = TypeInterner::new();
        let param = t.tensor(Typename::Generic);
        let deduced = deduce_data_type([(&*param, &*t.unbound_tensor())]).unwrap();
        assert_eq!(deduced, None);
    }

    #[test]
    fn test_display() {
        let t = TypeInterner::new();
        assert_eq!(t.tensor(Typename::Generic).to_string(), "tensor<?>");
        assert_eq!(
            t.array(t.tuple(vec![t.integer(), t.integer()])).to_string(),
            "(integer,integer)[]"
        );
        assert_eq!(t.unbound_tensor().to_string(), "tensor<>");
    }
}
