// Validation — Structural rules on fragment and graph bodies
//
// Type checking happens while parsing; these are the rules that look at a
// whole assignment (or a whole body) rather than one expression:
//
//   1. Fragment bodies never assign their own parameters
//   2. external, variable and update appear only in the graph body
//   3. external and variable are the entire right-hand side of an assignment
//   4. Graph parameters are defined by external, and external defines only
//      graph parameters
//   5. update writes to a tensor previously defined by variable
//   6. Every declared result is assigned somewhere in the body

use std::sync::Arc;

use rustc_hash::FxHashSet;

use crate::ast::{Assignment, Expr, ExprKind};
use crate::declarations::Declarations;
use crate::error::{Error, Result};
use crate::prototype::Prototype;
use crate::token::Position;

const EXTERNAL: &str = "external";
const VARIABLE: &str = "variable";
const UPDATE: &str = "update";

/// Rules 1 and 2 for one assignment of a fragment body.
pub fn check_fragment_assignment(assignment: &Assignment, fragment: &Prototype) -> Result<()> {
    for name in assignment.lhs.identifiers() {
        if fragment.param(name).is_some() {
            return Err(Error::semantic(
                format!("parameter '{name}' of fragment '{}' cannot be assigned", fragment.name),
                &assignment.lhs.position,
            ));
        }
    }

    let mut offending: Option<&Expr> = None;
    assignment.rhs.traverse(&mut |e| {
        if offending.is_none() && is_graph_only(e) {
            offending = Some(e);
        }
    });
    if let Some(e) = offending {
        let name = e.invocation_target().map_or("", |p| p.name.as_str());
        return Err(Error::semantic(
            format!("operation '{name}' is not allowed inside fragment '{}'", fragment.name),
            &e.position,
        ));
    }
    Ok(())
}

/// Rule 6. Graph results must in addition hold tensors.
pub fn check_results_assigned(
    owner: &Prototype,
    decls: &Declarations,
    graph: bool,
    position: &Position,
) -> Result<()> {
    for result in &owner.results {
        let Some(ty) = decls.get(&result.name) else {
            return Err(Error::semantic(
                format!("result '{}' of '{}' is never assigned", result.name, owner.name),
                position,
            ));
        };
        if graph && !ty.is_tensor() {
            return Err(Error::type_error(
                format!("graph result '{}' must be a tensor, found {ty}", result.name),
                position,
            ));
        }
    }
    Ok(())
}

fn is_graph_only(e: &Expr) -> bool {
    e.invocation_target()
        .is_some_and(|p| matches!(p.name.as_str(), EXTERNAL | VARIABLE | UPDATE))
}

/// Rules 3 to 5, checked assignment by assignment in body order.
pub struct GraphValidator {
    graph: Arc<Prototype>,
    variables: FxHashSet<String>,
}

impl GraphValidator {
    pub fn new(graph: Arc<Prototype>) -> Self {
        Self {
            graph,
            variables: FxHashSet::default(),
        }
    }

    pub fn check(&mut self, assignment: &Assignment) -> Result<()> {
        let lhs = &assignment.lhs;
        let rhs = &assignment.rhs;
        let top = rhs.invocation_target().map(|p| p.name.as_str());

        let mut nested: Option<&Expr> = None;
        let mut updates: Vec<&Expr> = Vec::new();
        rhs.traverse(&mut |e| match e.invocation_target().map(|p| p.name.as_str()) {
            Some(EXTERNAL | VARIABLE) if !std::ptr::eq(e, rhs) && nested.is_none() => nested = Some(e),
            Some(UPDATE) => updates.push(e),
            _ => {}
        });
        if let Some(e) = nested {
            let name = e.invocation_target().map_or("", |p| p.name.as_str());
            return Err(Error::semantic(
                format!("operation '{name}' must be the entire right-hand side of an assignment"),
                &e.position,
            ));
        }

        if top == Some(EXTERNAL) {
            let is_param = lhs
                .as_identifier()
                .is_some_and(|name| self.graph.param(name).is_some());
            if !is_param {
                return Err(Error::semantic(
                    "external may only define parameters of the graph",
                    &lhs.position,
                ));
            }
        } else {
            for name in lhs.identifiers() {
                if self.graph.param(name).is_some() {
                    return Err(Error::semantic(
                        format!("graph parameter '{name}' must be defined by external"),
                        &lhs.position,
                    ));
                }
            }
        }

        for update in updates {
            self.check_update(update)?;
        }

        if top == Some(VARIABLE) {
            for name in lhs.identifiers() {
                self.variables.insert(name.to_string());
            }
        }
        Ok(())
    }

    fn check_update(&self, update: &Expr) -> Result<()> {
        let ExprKind::Invocation { target, args, .. } = &update.kind else {
            return Ok(());
        };
        let target_arg = target
            .params
            .first()
            .and_then(|param| args.get(&param.name))
            .and_then(Expr::as_identifier);
        match target_arg {
            Some(name) if self.variables.contains(name) => Ok(()),
            _ => Err(Error::semantic(
                "first argument of update must be a tensor defined by variable",
                &update.position,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use crate::parser::{parse_fragment_declarations, Parser};
    use crate::prototype::FragmentTable;
    use crate::types::TypeInterner;

    const PRIMITIVES: &str = "
        fragment external<? = scalar>( shape: integer[] ) -> ( output: tensor<?> );
        fragment variable<? = scalar>( shape: integer[], label: string ) -> ( output: tensor<?> );
        fragment update<?>( variable: tensor<?>, value: tensor<?> ) -> ( result: tensor<?> );
        fragment copy<?>( x: tensor<?> ) -> ( y: tensor<?> );
        fragment add( x: tensor<scalar>, y: tensor<scalar> ) -> ( z: tensor<scalar> );
    ";

    fn parse(source: &str) -> Result<()> {
        let types = TypeInterner::new();
        let fragments = parse_fragment_declarations(PRIMITIVES, "stdlib", &types, FragmentTable::new())?;
        let mut parser = Parser::new(source, "test", &types, fragments)?;
        parser.read_version((1, 0))?;
        parser.read_extensions(&mut |_| false)?;
        parser.parse_fragments()?;
        parser.parse_graph()?;
        parser.expect_end()
    }

    fn semantic_error(source: &str) -> String {
        let err = parse(source).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Semantic, "{err}");
        err.to_string()
    }

    #[test]
    fn test_well_formed_graph() {
        parse(
            "version 1.0;
             graph g( x ) -> ( y ) {
                 x = external(shape = [1]);
                 v = variable(shape = [1], label = 'v');
                 s = add(x, v);
                 y = update(v, s);
             }",
        )
        .unwrap();
    }

    #[test]
    fn test_external_defines_only_params() {
        let msg = semantic_error(
            "version 1.0; graph g( x ) -> ( y ) { x = external(shape = [1]); y = external(shape = [1]); }",
        );
        assert!(msg.contains("external may only define"), "{msg}");

        let msg = semantic_error("version 1.0; graph g( x ) -> ( y ) { x = copy(x); y = copy(x); }");
        assert!(msg.contains("must be defined by external"), "{msg}");
    }

    #[test]
    fn test_external_not_nested() {
        let msg = semantic_error(
            "version 1.0; extension KHR_enable_operator_expressions;
             graph g( x ) -> ( y ) { x = external(shape = [1]); y = x + external(shape = [1]); }",
        );
        assert!(msg.contains("entire right-hand side"), "{msg}");
    }

    #[test]
    fn test_update_requires_variable() {
        let msg = semantic_error(
            "version 1.0; graph g( x ) -> ( y ) { x = external(shape = [1]); y = update(x, x); }",
        );
        assert!(msg.contains("update"), "{msg}");
    }

    #[test]
    fn test_fragment_rules() {
        let msg = semantic_error(
            "version 1.0; extension KHR_enable_fragment_definitions;
             fragment f( x: tensor<scalar> ) -> ( y: tensor<scalar> ) { x = copy(x); y = copy(x); }
             graph g( x ) -> ( y ) { x = external(shape = [1]); y = f(x); }",
        );
        assert!(msg.contains("parameter 'x'"), "{msg}");

        let msg = semantic_error(
            "version 1.0; extension KHR_enable_fragment_definitions;
             fragment f( x: tensor<scalar> ) -> ( y: tensor<scalar> ) { y = variable(shape = [1], label = 'v'); }
             graph g( x ) -> ( y ) { x = external(shape = [1]); y = f(x); }",
        );
        assert!(msg.contains("not allowed inside fragment"), "{msg}");
    }

    #[test]
    fn test_results_must_be_assigned() {
        let msg = semantic_error(
            "version 1.0; graph g( x ) -> ( y, z ) { x = external(shape = [1]); y = copy(x); }",
        );
        assert!(msg.contains("result 'z'"), "{msg}");
    }
}
