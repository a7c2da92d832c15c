// Evaluator — Flattens type-checked bodies into primitive operations
//
// The evaluator walks the assignments of the graph body in source order and
// computes a Value for every right-hand side. Constant expressions fold to
// plain values. Invocations either
//
//   - get reported to the ParserCallback as one operation, with fresh or
//     caller-chosen identifiers for their tensor results, or
//   - get lowered: the fragment body is evaluated in place (recursively)
//     so that only what it bottoms out in is reported.
//
// CONTEXT: the left-hand side of the assignment being evaluated is passed
// down as a Value (identifiers, arrays and tuples of them). A reported
// operation names its results after the context when there is one, so
// `y = conv(x, w);` produces a tensor called `y` rather than `conv1`.
//
// ALIASING: assigning a new value to a name that already holds tensor
// identifiers does not rebind it. A `copy` from the new value into the
// tensor it holds is reported instead.
//
// IDENTIFIERS: synthesized names are `<operation><n>` with a counter per
// operation name, skipping anything in the reserved set (every name the
// document itself assigns at top level).

use std::cmp::Ordering;

use indexmap::IndexMap;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

use crate::ast::{Assignment, BinaryOp, BuiltinOp, Expr, ExprKind, UnaryOp};
use crate::callback::{ParserCallback, ShouldLower};
use crate::error::{Error, ErrorKind, Result};
use crate::prototype::{Fragment, FragmentTable, Prototype};
use crate::token::Position;
use crate::types::{self, DeductionConflict, Type, Typename};
use crate::value::Value;

/// Values bound to the names of one scope.
pub type Values = FxHashMap<String, Value>;

pub struct Evaluator<'a> {
    fragments: &'a FragmentTable,
    lowering: &'a dyn ShouldLower,
    callback: &'a mut dyn ParserCallback,
    dtypes: IndexMap<String, Typename>,
    reserved: FxHashSet<String>,
    counters: FxHashMap<String, usize>,
    depth: usize,
    max_depth: usize,
}

impl<'a> Evaluator<'a> {
    pub fn new(
        fragments: &'a FragmentTable,
        lowering: &'a dyn ShouldLower,
        callback: &'a mut dyn ParserCallback,
        max_depth: usize,
    ) -> Self {
        Self {
            fragments,
            lowering,
            callback,
            dtypes: IndexMap::new(),
            reserved: FxHashSet::default(),
            counters: FxHashMap::default(),
            depth: 0,
            max_depth,
        }
    }

    /// Names synthesized identifiers must never take.
    pub fn reserve<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reserved.extend(names.into_iter().map(Into::into));
    }

    /// Declare the element type of a tensor identifier.
    pub fn declare_dtype(&mut self, id: impl Into<String>, dtype: Typename) {
        self.dtypes.insert(id.into(), dtype);
    }

    pub fn dtypes(&self) -> &IndexMap<String, Typename> {
        &self.dtypes
    }

    pub fn into_dtypes(self) -> IndexMap<String, Typename> {
        self.dtypes
    }

    /// Evaluate `assignment.rhs` and bind the result to its left-hand side.
    ///
    /// `top_level` is true for the graph body, where every name on the
    /// left-hand side is its own context.
    pub fn evaluate_assign(
        &mut self,
        assignment: &Assignment,
        values: &mut Values,
        dtype: Option<Typename>,
        top_level: bool,
    ) -> Result<()> {
        let context = context_of(&assignment.lhs, values, top_level);
        let value = self.evaluate(&assignment.rhs, values, dtype, &context)?;
        self.assign(&assignment.lhs, value, values)
    }

    // Assignment

    fn assign(&mut self, lhs: &Expr, value: Value, values: &mut Values) -> Result<()> {
        match &lhs.kind {
            ExprKind::Identifier(name) => {
                match values.get(name) {
                    Some(existing) if has_identifiers(existing) && *existing != value => {
                        let existing = existing.clone();
                        self.insert_copy(&existing, &value, &lhs.position)?;
                    }
                    _ => {
                        values.insert(name.clone(), value);
                    }
                }
                Ok(())
            }
            ExprKind::Array(items) | ExprKind::Tuple(items) => {
                let parts = match value {
                    Value::Array(parts) | Value::Tuple(parts) if parts.len() == items.len() => parts,
                    other => {
                        return Err(Error::semantic(
                            format!(
                                "cannot assign {other} to a pattern of {} items",
                                items.len()
                            ),
                            &lhs.position,
                        ))
                    }
                };
                for (item, part) in items.iter().zip(parts) {
                    self.assign(item, part, values)?;
                }
                Ok(())
            }
            _ => Err(Error::assertion("assignment to a non-identifier pattern")),
        }
    }

    /// Report `copy` operations making `lvalue` an alias of `rvalue`.
    fn insert_copy(&mut self, lvalue: &Value, rvalue: &Value, position: &Position) -> Result<()> {
        match (lvalue, rvalue) {
            (Value::Array(ls), Value::Array(rs)) | (Value::Tuple(ls), Value::Tuple(rs)) if ls.len() == rs.len() => {
                for (l, r) in ls.iter().zip(rs) {
                    self.insert_copy(l, r, position)?;
                }
                Ok(())
            }
            (Value::Identifier(target), _) => {
                let fragments = self.fragments;
                let copy = fragments.get("copy").map(|f| &f.prototype).ok_or_else(|| {
                    Error::new(
                        ErrorKind::Undeclared {
                            what: "operation",
                            name: "copy".to_string(),
                        },
                        position.clone(),
                    )
                })?;
                let (Some(input), Some(output)) = (copy.params.first(), copy.results.first()) else {
                    return Err(Error::assertion("copy must take one parameter and one result"));
                };

                let dtype = match rvalue {
                    Value::Identifier(id) => self.dtypes.get(id).copied(),
                    other => other.typename(),
                };
                if let Some(dtype) = dtype {
                    self.dtypes.insert(target.clone(), dtype);
                }

                let mut args = IndexMap::new();
                args.insert(input.name.clone(), rvalue.clone());
                args.insert(output.name.clone(), lvalue.clone());
                debug!(from = %rvalue, to = %target, "aliasing with copy");
                self.callback
                    .operation(copy, &args, &self.dtypes)
                    .map_err(|e| locate(e, position))
            }
            _ if lvalue == rvalue => Ok(()),
            _ => Err(Error::semantic(
                format!("cannot alias {rvalue} into {lvalue}"),
                position,
            )),
        }
    }

    // Expressions

    fn evaluate(
        &mut self,
        expr: &Expr,
        values: &mut Values,
        dtype: Option<Typename>,
        context: &Value,
    ) -> Result<Value> {
        match &expr.kind {
            ExprKind::Literal(value) => Ok(value.clone()),
            ExprKind::Identifier(name) => values.get(name).cloned().ok_or_else(|| {
                Error::evaluation(format!("identifier '{name}' has no value"), &expr.position)
            }),
            ExprKind::Array(items) => Ok(Value::Array(self.evaluate_items(items, values, dtype, context)?)),
            ExprKind::Tuple(items) => Ok(Value::Tuple(self.evaluate_items(items, values, dtype, context)?)),
            ExprKind::Subscript {
                sequence,
                begin,
                end,
                range,
            } => {
                let sequence = self.evaluate(sequence, values, dtype, &Value::None)?;
                let begin = self.evaluate_index(begin.as_deref(), values, dtype)?;
                let end = self.evaluate_index(end.as_deref(), values, dtype)?;
                subscript(sequence, begin, end, *range, &expr.position)
            }
            ExprKind::Comprehension {
                iterators,
                iterables,
                condition,
                item,
            } => self.evaluate_comprehension(
                iterators,
                iterables,
                condition.as_deref(),
                item,
                values,
                dtype,
                context,
                &expr.position,
            ),
            ExprKind::Unary { op, operand } => {
                let operand = self.evaluate(operand, values, dtype, &Value::None)?;
                apply_unary(*op, operand, &expr.position)
            }
            ExprKind::Binary { op, left, right } => {
                let left = self.evaluate(left, values, dtype, &Value::None)?;
                // && and || do not evaluate the right operand unless needed
                match (op, left.as_logical()) {
                    (BinaryOp::And, Some(false)) => return Ok(Value::Logical(false)),
                    (BinaryOp::Or, Some(true)) => return Ok(Value::Logical(true)),
                    _ => {}
                }
                let right = self.evaluate(right, values, dtype, &Value::None)?;
                apply_binary(*op, left, right, &expr.position)
            }
            ExprKind::Select {
                condition,
                true_value,
                false_value,
            } => {
                let condition = self.evaluate(condition, values, dtype, &Value::None)?;
                match condition.as_logical() {
                    Some(true) => self.evaluate(true_value, values, dtype, context),
                    Some(false) => self.evaluate(false_value, values, dtype, context),
                    None => Err(Error::evaluation(
                        format!("condition evaluated to {condition}, expected a logical"),
                        &expr.position,
                    )),
                }
            }
            ExprKind::Invocation {
                target,
                args,
                data_type,
            } => self.evaluate_invocation(expr, target, args, *data_type, values, dtype, context),
            ExprKind::Builtin { op, arg } => {
                let arg = self.evaluate(arg, values, dtype, &Value::None)?;
                apply_builtin(*op, arg, &expr.position)
            }
        }
    }

    /// Items of an array or tuple literal, each with its slice of the context.
    fn evaluate_items(
        &mut self,
        items: &[Expr],
        values: &mut Values,
        dtype: Option<Typename>,
        context: &Value,
    ) -> Result<Vec<Value>> {
        let contexts = context.items().filter(|c| c.len() == items.len());
        items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                let context = contexts.and_then(|c| c.get(i)).cloned().unwrap_or_default();
                self.evaluate(item, values, dtype, &context)
            })
            .collect()
    }

    fn evaluate_index(
        &mut self,
        index: Option<&Expr>,
        values: &mut Values,
        dtype: Option<Typename>,
    ) -> Result<Option<i32>> {
        let Some(index) = index else {
            return Ok(None);
        };
        match self.evaluate(index, values, dtype, &Value::None)? {
            Value::Integer(i) => Ok(Some(i)),
            other => Err(Error::evaluation(
                format!("subscript evaluated to {other}, expected an integer"),
                &index.position,
            )),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn evaluate_comprehension(
        &mut self,
        iterators: &[String],
        iterables: &[Expr],
        condition: Option<&Expr>,
        item: &Expr,
        values: &mut Values,
        dtype: Option<Typename>,
        context: &Value,
        position: &Position,
    ) -> Result<Value> {
        let mut sequences = Vec::with_capacity(iterables.len());
        for iterable in iterables {
            match self.evaluate(iterable, values, dtype, &Value::None)? {
                Value::Array(items) => sequences.push(items),
                other => {
                    return Err(Error::evaluation(
                        format!("cannot iterate over {other}"),
                        &iterable.position,
                    ))
                }
            }
        }
        let length = sequences.first().map_or(0, Vec::len);
        if let Some(other) = sequences.iter().find(|s| s.len() != length) {
            return Err(Error::semantic(
                format!(
                    "iterables of comprehension have different lengths ({length} and {})",
                    other.len()
                ),
                position,
            ));
        }

        let contexts = context.items();
        let mut results = Vec::new();
        for i in 0..length {
            let shadowed: Vec<Option<Value>> = iterators
                .iter()
                .zip(&sequences)
                .map(|(name, sequence)| values.insert(name.clone(), sequence[i].clone()))
                .collect();

            let outcome = self.evaluate_comprehension_item(condition, item, values, dtype, contexts, results.len());

            for (name, previous) in iterators.iter().zip(shadowed) {
                match previous {
                    Some(previous) => values.insert(name.clone(), previous),
                    None => values.remove(name),
                };
            }
            if let Some(value) = outcome? {
                results.push(value);
            }
        }
        Ok(Value::Array(results))
    }

    fn evaluate_comprehension_item(
        &mut self,
        condition: Option<&Expr>,
        item: &Expr,
        values: &mut Values,
        dtype: Option<Typename>,
        contexts: Option<&[Value]>,
        index: usize,
    ) -> Result<Option<Value>> {
        if let Some(condition) = condition {
            let keep = self.evaluate(condition, values, dtype, &Value::None)?;
            match keep.as_logical() {
                Some(true) => {}
                Some(false) => return Ok(None),
                None => {
                    return Err(Error::evaluation(
                        format!("comprehension condition evaluated to {keep}"),
                        &condition.position,
                    ))
                }
            }
        }
        let context = contexts.and_then(|c| c.get(index)).cloned().unwrap_or_default();
        self.evaluate(item, values, dtype, &context).map(Some)
    }

    // Invocations

    #[allow(clippy::too_many_arguments)]
    fn evaluate_invocation(
        &mut self,
        expr: &Expr,
        target: &Prototype,
        args: &IndexMap<String, Expr>,
        data_type: Option<Typename>,
        values: &mut Values,
        dtype: Option<Typename>,
        context: &Value,
    ) -> Result<Value> {
        let position = &expr.position;
        let mut arg_values: IndexMap<String, Value> = IndexMap::with_capacity(target.params.len());
        for param in &target.params {
            let value = match (args.get(&param.name), &param.default) {
                (Some(arg), _) => self.evaluate(arg, values, dtype, &Value::None)?,
                (None, Some(default)) => default.clone(),
                (None, None) => {
                    return Err(Error::assertion(format!(
                        "argument '{}' of '{}' neither given nor defaulted",
                        param.name, target.name
                    )))
                }
            };
            arg_values.insert(param.name.clone(), value);
        }

        let resolved = self.resolve_data_type(target, data_type, dtype, &arg_values, position)?;
        for param in &target.params {
            let Some(value) = arg_values.get(&param.name) else {
                continue;
            };
            if let Some((id, actual, expected)) = mismatched_dtype(&param.ty, value, resolved, &self.dtypes) {
                return Err(Error::type_error(
                    format!(
                        "argument '{}' of operation '{}' is tensor '{id}' of type {actual}, expected {expected}",
                        param.name, target.name
                    ),
                    position,
                ));
            }
        }

        let fragments = self.fragments;
        match fragments.get(&target.name) {
            Some(fragment) if self.is_lowered(fragment) => {
                self.lower(fragment, arg_values, resolved, context, position)
            }
            _ => self.emit(target, arg_values, resolved, context, position),
        }
    }

    /// Fragments with attribute results cannot be reported as operations and
    /// are always evaluated in place.
    fn is_lowered(&self, fragment: &Fragment) -> bool {
        !fragment.is_primitive()
            && (fragment.prototype.results.iter().any(|r| r.ty.is_attribute())
                || self.lowering.should_lower(fragment.name()))
    }

    /// Explicit data type first, then the caller's, then deduction from the
    /// argument values, then the declared default.
    fn resolve_data_type(
        &self,
        target: &Prototype,
        data_type: Option<Typename>,
        dtype: Option<Typename>,
        args: &IndexMap<String, Value>,
        position: &Position,
    ) -> Result<Option<Typename>> {
        if !target.is_generic() {
            return Ok(None);
        }
        match (data_type, dtype) {
            (Some(Typename::Generic), Some(dtype)) => return Ok(Some(dtype)),
            (Some(Typename::Generic), None) | (None, _) => {}
            (Some(data_type), _) => return Ok(Some(data_type)),
        }

        let mut candidate = None;
        for param in target.params.iter().filter(|p| p.ty.is_generic()) {
            if let Some(value) = args.get(&param.name) {
                deduce_from_value(&param.ty, value, &self.dtypes, &mut candidate).map_err(
                    |DeductionConflict(first, second)| {
                        Error::type_error(
                            format!(
                                "ambiguous candidates for generic data type of operation '{}': {first} and {second}",
                                target.name
                            ),
                            position,
                        )
                    },
                )?;
            }
        }
        match candidate.or(target.generic_default) {
            Some(resolved) => Ok(Some(resolved)),
            None => Err(Error::evaluation(
                format!("could not deduce generic data type of operation '{}'", target.name),
                position,
            )),
        }
    }

    /// Evaluate the body of `fragment` in place of the invocation.
    fn lower(
        &mut self,
        fragment: &Fragment,
        args: IndexMap<String, Value>,
        dtype: Option<Typename>,
        context: &Value,
        position: &Position,
    ) -> Result<Value> {
        let prototype = &fragment.prototype;
        if self.depth >= self.max_depth {
            return Err(Error::semantic(
                format!(
                    "maximum lowering depth exceeded while lowering '{}'",
                    prototype.name
                ),
                position,
            ));
        }
        debug!(fragment = %prototype.name, depth = self.depth, "lowering fragment");

        let mut body_values: Values = args.into_iter().collect();
        for (result, context) in prototype.results.iter().zip(result_contexts(prototype, context)) {
            body_values.insert(result.name.clone(), context);
        }

        self.depth += 1;
        let mut outcome = Ok(());
        for assignment in &fragment.assignments {
            outcome = self.evaluate_assign(assignment, &mut body_values, dtype, false);
            if outcome.is_err() {
                break;
            }
        }
        self.depth -= 1;
        outcome.map_err(|e| e.chained(position))?;

        let mut results: Vec<Value> = prototype
            .results
            .iter()
            .map(|r| body_values.remove(&r.name).unwrap_or_default())
            .collect();
        Ok(if results.len() == 1 {
            results.remove(0)
        } else {
            Value::Tuple(results)
        })
    }

    /// Report the invocation as one operation.
    fn emit(
        &mut self,
        target: &Prototype,
        mut args: IndexMap<String, Value>,
        dtype: Option<Typename>,
        context: &Value,
        position: &Position,
    ) -> Result<Value> {
        let mut results = Vec::with_capacity(target.results.len());
        for (result, context) in target.results.iter().zip(result_contexts(target, context)) {
            let value = self.fill_identifiers(context, &result.ty, &target.name);
            if value.is_none() || !value.conforms_to(&result.ty) {
                return Err(Error::evaluation(
                    format!(
                        "cannot name result '{}' of operation '{}'; assign it to an array of identifiers",
                        result.name, target.name
                    ),
                    position,
                ));
            }
            self.record_dtypes(&value, &result.ty, dtype);
            args.insert(result.name.clone(), value.clone());
            results.push(value);
        }

        trace!(op = %target.name, results = ?results, "operation");
        self.callback
            .operation(target, &args, &self.dtypes)
            .map_err(|e| locate(e, position))?;

        Ok(if results.len() == 1 {
            results.remove(0)
        } else {
            Value::Tuple(results)
        })
    }

    /// Replace every missing tensor in `value` with a synthesized identifier.
    fn fill_identifiers(&mut self, value: Value, ty: &Type, operation: &str) -> Value {
        match (value, ty) {
            (Value::None, Type::Tensor(_)) => Value::Identifier(self.make_id(operation)),
            (Value::Array(items), Type::Array(Some(item))) => Value::Array(
                items
                    .into_iter()
                    .map(|v| self.fill_identifiers(v, item, operation))
                    .collect(),
            ),
            (Value::Tuple(items), Type::Tuple(types)) if items.len() == types.len() => Value::Tuple(
                items
                    .into_iter()
                    .zip(types)
                    .map(|(v, t)| self.fill_identifiers(v, t, operation))
                    .collect(),
            ),
            (value, _) => value,
        }
    }

    fn record_dtypes(&mut self, value: &Value, ty: &Type, dtype: Option<Typename>) {
        match (value, ty) {
            (Value::Identifier(id), Type::Tensor(data)) => {
                let name = match data.as_ref().and_then(|d| d.typename()) {
                    Some(Typename::Generic) => dtype,
                    other => other,
                };
                if let Some(name) = name {
                    self.dtypes.insert(id.clone(), name);
                }
            }
            (Value::Array(items), Type::Array(Some(item))) => {
                for v in items {
                    self.record_dtypes(v, item, dtype);
                }
            }
            (Value::Tuple(items), Type::Tuple(types)) => {
                for (v, t) in items.iter().zip(types) {
                    self.record_dtypes(v, t, dtype);
                }
            }
            _ => {}
        }
    }

    fn make_id(&mut self, operation: &str) -> String {
        let counter = self.counters.entry(operation.to_string()).or_insert(0);
        loop {
            *counter += 1;
            let id = format!("{operation}{counter}");
            if self.reserved.insert(id.clone()) {
                trace!(id = %id, "synthesized identifier");
                return id;
            }
        }
    }
}

/// The value a left-hand side provides as context. At top level every name
/// stands for itself; inside a lowered body only the results seeded from
/// the caller carry a name.
fn context_of(lhs: &Expr, values: &Values, top_level: bool) -> Value {
    match &lhs.kind {
        ExprKind::Identifier(name) if top_level => Value::Identifier(name.clone()),
        ExprKind::Identifier(name) => values.get(name).cloned().unwrap_or_default(),
        ExprKind::Array(items) => Value::Array(items.iter().map(|i| context_of(i, values, top_level)).collect()),
        ExprKind::Tuple(items) => Value::Tuple(items.iter().map(|i| context_of(i, values, top_level)).collect()),
        _ => Value::None,
    }
}

/// One context per result: the whole context for a single result, the
/// matching item otherwise.
fn result_contexts(prototype: &Prototype, context: &Value) -> Vec<Value> {
    let count = prototype.results.len();
    if count == 1 {
        return vec![context.clone()];
    }
    match context.items() {
        Some(items) if items.len() == count => items.to_vec(),
        _ => vec![Value::None; count],
    }
}

/// The first tensor identifier in `value` whose recorded element type is
/// not the one `ty` asks for once its generic is bound to `dtype`.
fn mismatched_dtype(
    ty: &Type,
    value: &Value,
    dtype: Option<Typename>,
    dtypes: &IndexMap<String, Typename>,
) -> Option<(String, Typename, Typename)> {
    match (ty, value) {
        (Type::Tensor(Some(data)), Value::Identifier(id)) => {
            let expected = match data.typename()? {
                Typename::Generic => dtype?,
                name => name,
            };
            let actual = *dtypes.get(id)?;
            (actual != expected).then(|| (id.clone(), actual, expected))
        }
        (Type::Array(Some(item)), Value::Array(items)) => {
            items.iter().find_map(|v| mismatched_dtype(item, v, dtype, dtypes))
        }
        (Type::Tuple(types), Value::Tuple(items)) => types
            .iter()
            .zip(items)
            .find_map(|(t, v)| mismatched_dtype(t, v, dtype, dtypes)),
        _ => None,
    }
}

fn has_identifiers(value: &Value) -> bool {
    let mut found = false;
    value.for_each_identifier(&mut |_| found = true);
    found
}

/// Errors from the callback carry the position of the invocation unless
/// they already have one.
fn locate(err: Error, position: &Position) -> Error {
    match err.position {
        Some(_) => err,
        None => Error {
            position: Some(position.clone()),
            ..err
        },
    }
}

fn deduce_from_value(
    param: &Type,
    value: &Value,
    dtypes: &IndexMap<String, Typename>,
    candidate: &mut Option<Typename>,
) -> std::result::Result<(), DeductionConflict> {
    match (param, value) {
        (Type::Primitive(Typename::Generic), value) => match value.typename() {
            Some(name) => types::record(candidate, name),
            None => Ok(()),
        },
        (Type::Tensor(Some(data)), Value::Identifier(id)) => match (data.typename(), dtypes.get(id)) {
            (Some(Typename::Generic), Some(name)) => types::record(candidate, *name),
            _ => Ok(()),
        },
        (Type::Tensor(Some(data)), value) => deduce_from_value(data, value, dtypes, candidate),
        (Type::Array(Some(item)), Value::Array(items)) => {
            for v in items {
                deduce_from_value(item, v, dtypes, candidate)?;
            }
            Ok(())
        }
        (Type::Tuple(types), Value::Tuple(items)) => {
            for (t, v) in types.iter().zip(items) {
                deduce_from_value(t, v, dtypes, candidate)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

// Constant operators

fn apply_unary(op: UnaryOp, operand: Value, position: &Position) -> Result<Value> {
    match (op, operand) {
        (UnaryOp::Plus, v @ (Value::Integer(_) | Value::Scalar(_))) => Ok(v),
        (UnaryOp::Minus, Value::Integer(v)) => v
            .checked_neg()
            .map(Value::Integer)
            .ok_or_else(|| Error::evaluation("integer overflow", position)),
        (UnaryOp::Minus, Value::Scalar(v)) => Ok(Value::Scalar(-v)),
        (UnaryOp::Not, Value::Logical(v)) => Ok(Value::Logical(!v)),
        (op, operand) => Err(Error::evaluation(
            format!("operator '{}' cannot be applied to {operand}", op.as_str()),
            position,
        )),
    }
}

fn apply_binary(op: BinaryOp, left: Value, right: Value, position: &Position) -> Result<Value> {
    use Value::{Array, Integer, Logical, Scalar, String};

    let overflow = || Error::evaluation("integer overflow", position);
    let value = match (op, left, right) {
        (BinaryOp::Add, Integer(a), Integer(b)) => Integer(a.checked_add(b).ok_or_else(overflow)?),
        (BinaryOp::Sub, Integer(a), Integer(b)) => Integer(a.checked_sub(b).ok_or_else(overflow)?),
        (BinaryOp::Mul, Integer(a), Integer(b)) => Integer(a.checked_mul(b).ok_or_else(overflow)?),
        (BinaryOp::Div, Integer(_), Integer(0)) => {
            return Err(Error::evaluation("integer division by zero", position))
        }
        (BinaryOp::Div, Integer(a), Integer(b)) => Integer(a.checked_div(b).ok_or_else(overflow)?),
        (BinaryOp::Pow, Integer(_), Integer(b)) if b < 0 => {
            return Err(Error::evaluation(
                format!("negative exponent {b} in integer power"),
                position,
            ))
        }
        (BinaryOp::Pow, Integer(a), Integer(b)) => Integer(a.checked_pow(b as u32).ok_or_else(overflow)?),

        (BinaryOp::Add, Scalar(a), Scalar(b)) => Scalar(a + b),
        (BinaryOp::Sub, Scalar(a), Scalar(b)) => Scalar(a - b),
        (BinaryOp::Mul, Scalar(a), Scalar(b)) => Scalar(a * b),
        (BinaryOp::Div, Scalar(a), Scalar(b)) => Scalar(a / b),
        (BinaryOp::Pow, Scalar(a), Scalar(b)) => Scalar(a.powf(b)),

        (BinaryOp::Add, String(a), String(b)) => String(a + &b),
        (BinaryOp::Add, Array(mut a), Array(b)) => {
            a.extend(b);
            Array(a)
        }
        (BinaryOp::Mul, String(s), Integer(n)) | (BinaryOp::Mul, Integer(n), String(s)) => {
            String(s.repeat(repeat_count(n, position)?))
        }
        (BinaryOp::Mul, Array(items), Integer(n)) | (BinaryOp::Mul, Integer(n), Array(items)) => {
            let count = repeat_count(n, position)?;
            Array(items.iter().cloned().cycle().take(items.len() * count).collect())
        }

        (BinaryOp::And, Logical(a), Logical(b)) => Logical(a && b),
        (BinaryOp::Or, Logical(a), Logical(b)) => Logical(a || b),
        (BinaryOp::Eq, a, b) => Logical(a == b),
        (BinaryOp::Ne, a, b) => Logical(a != b),
        (BinaryOp::In, item, Array(items)) => Logical(items.contains(&item)),

        (op @ (BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge), a, b) => {
            let Some(ordering) = compare(&a, &b) else {
                return Err(Error::evaluation(
                    format!("cannot compare {a} and {b}"),
                    position,
                ));
            };
            Logical(match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::Gt => ordering == Ordering::Greater,
                BinaryOp::Le => ordering != Ordering::Greater,
                _ => ordering != Ordering::Less,
            })
        }

        (op, left, right) => {
            return Err(Error::evaluation(
                format!("operator '{}' cannot be applied to {left} and {right}", op.as_str()),
                position,
            ))
        }
    };
    Ok(value)
}

fn repeat_count(n: i32, position: &Position) -> Result<usize> {
    usize::try_from(n).map_err(|_| Error::evaluation(format!("negative repeat count {n}"), position))
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
        (Value::Scalar(a), Value::Scalar(b)) => a.partial_cmp(b),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn apply_builtin(op: BuiltinOp, arg: Value, position: &Position) -> Result<Value> {
    let invalid = |arg: &Value| {
        Error::evaluation(
            format!("{} cannot be applied to {arg}", op.as_str()),
            position,
        )
    };
    let length = |arg: &Value| match arg {
        Value::Array(items) => Some(items.len()),
        Value::String(s) => Some(s.chars().count()),
        _ => None,
    };

    match op {
        BuiltinOp::LengthOf => {
            let len = length(&arg).ok_or_else(|| invalid(&arg))?;
            Ok(Value::Integer(to_i32(len, position)?))
        }
        BuiltinOp::RangeOf => {
            let len = length(&arg).ok_or_else(|| invalid(&arg))?;
            Ok(Value::Array((0..to_i32(len, position)?).map(Value::Integer).collect()))
        }
        BuiltinOp::ShapeOf => Err(Error::semantic(
            "shape_of is deprecated and not supported",
            position,
        )),
        BuiltinOp::Integer => match arg {
            Value::Integer(v) => Ok(Value::Integer(v)),
            Value::Scalar(v) => Ok(Value::Integer(v as i32)),
            Value::Logical(v) => Ok(Value::Integer(v as i32)),
            Value::String(ref s) => s.trim().parse().map(Value::Integer).map_err(|_| invalid(&arg)),
            _ => Err(invalid(&arg)),
        },
        BuiltinOp::Scalar => match arg {
            Value::Integer(v) => Ok(Value::Scalar(v as f32)),
            Value::Scalar(v) => Ok(Value::Scalar(v)),
            Value::Logical(v) => Ok(Value::Scalar(if v { 1.0 } else { 0.0 })),
            Value::String(ref s) => s.trim().parse().map(Value::Scalar).map_err(|_| invalid(&arg)),
            _ => Err(invalid(&arg)),
        },
        BuiltinOp::Logical => match arg {
            Value::Integer(v) => Ok(Value::Logical(v != 0)),
            Value::Scalar(v) => Ok(Value::Logical(v != 0.0)),
            Value::Logical(v) => Ok(Value::Logical(v)),
            Value::String(ref s) => match s.trim() {
                "true" => Ok(Value::Logical(true)),
                "false" => Ok(Value::Logical(false)),
                _ => Err(invalid(&arg)),
            },
            _ => Err(invalid(&arg)),
        },
        BuiltinOp::String => match arg {
            Value::String(s) => Ok(Value::String(s)),
            v @ (Value::Integer(_) | Value::Scalar(_) | Value::Logical(_)) => Ok(Value::String(v.to_string())),
            _ => Err(invalid(&arg)),
        },
    }
}

fn to_i32(len: usize, position: &Position) -> Result<i32> {
    i32::try_from(len).map_err(|_| Error::evaluation("sequence too long", position))
}

/// Wrap a negative index around `len`; `end` bounds may equal `len`.
fn wrap_index(index: i32, len: usize, end: bool, position: &Position) -> Result<usize> {
    let len_i = to_i32(len, position)?;
    let wrapped = if index < 0 { index + len_i } else { index };
    let limit = if end { len_i } else { len_i - 1 };
    if wrapped < 0 || wrapped > limit {
        return Err(Error::evaluation(
            format!("index {index} out of range for length {len}"),
            position,
        ));
    }
    Ok(wrapped as usize)
}

fn subscript(
    sequence: Value,
    begin: Option<i32>,
    end: Option<i32>,
    range: bool,
    position: &Position,
) -> Result<Value> {
    let (items, chars): (&[Value], Vec<char>) = match &sequence {
        Value::Array(items) | Value::Tuple(items) => (items.as_slice(), Vec::new()),
        Value::String(s) => (&[][..], s.chars().collect()),
        other => {
            return Err(Error::evaluation(
                format!("cannot subscript {other}"),
                position,
            ))
        }
    };
    let is_string = matches!(sequence, Value::String(_));
    let len = if is_string { chars.len() } else { items.len() };

    if !range {
        let index = wrap_index(begin.unwrap_or(0), len, false, position)?;
        return Ok(if is_string {
            Value::String(chars[index].to_string())
        } else {
            items[index].clone()
        });
    }

    let first = match begin {
        Some(b) => wrap_index(b, len, true, position)?,
        None => 0,
    };
    let last = match end {
        Some(e) => wrap_index(e, len, true, position)?,
        None => len,
    };
    let last = last.max(first);
    Ok(match &sequence {
        Value::String(_) => Value::String(chars[first..last].iter().collect()),
        Value::Tuple(_) => Value::Tuple(items[first..last].to_vec()),
        _ => Value::Array(items[first..last].to_vec()),
    })
}

/// Evaluate an expression that needs no fragments and produces no
/// operations, such as a parameter default.
pub fn evaluate_constant(expr: &Expr) -> Result<Value> {
    struct NoOperations;

    impl ParserCallback for NoOperations {
        fn operation(
            &mut self,
            proto: &Prototype,
            _args: &IndexMap<String, Value>,
            _dtypes: &IndexMap<String, Typename>,
        ) -> Result<()> {
            Err(Error::assertion(format!(
                "constant expression invoked operation '{}'",
                proto.name
            )))
        }
    }

    let fragments = FragmentTable::new();
    let never = |_: &str| false;
    let mut callback = NoOperations;
    let mut evaluator = Evaluator::new(&fragments, &never, &mut callback, 0);
    evaluator.evaluate(expr, &mut Values::default(), None, &Value::None)
}
