// Driver — One document from source text to callback events
//
//   version ─► extensions ─► stdlib + fragments ─► graph ─► evaluation
//
// The driver owns every piece of per-document state: the type interner, the
// fragment table, the evaluator with its identifier counters. Nothing
// outlives the call, so independent documents can be parsed concurrently.
//
// USAGE:
//   let mut options = ParseOptions::with_defaults();
//   options.lowered(LoweringPolicy::only(["relu"]));
//   let graph = nnef_parser::parse_graph(source, &options)?;
//   println!("{}", graph.dump());

use tracing::debug;

use crate::callback::ParserCallback;
use crate::error::Result;
use crate::eval::{Evaluator, Values};
use crate::graph::{Graph, GraphBuilder};
use crate::options::ParseOptions;
use crate::parser::Parser;
use crate::stdlib;
use crate::types::TypeInterner;
use crate::value::Value;

/// Parse and flatten `source`, reporting its contents to `callback`.
///
/// The document is all or nothing: on error, operations already reported
/// to the callback belong to an invalid document.
pub fn parse_document(source: &str, options: &ParseOptions, callback: &mut dyn ParserCallback) -> Result<()> {
    let types = TypeInterner::new();
    let filename = options.filename_str();
    let stdlib = stdlib::load(options.stdlib.as_deref(), &types)?;
    let builtin_count = stdlib.len();

    let mut parser = Parser::new(source, filename, &types, stdlib)?;
    let version = parser.read_version(options.max_version)?;
    debug!(filename, major = version.0, minor = version.1, "document");
    callback.begin_document(filename, version)?;

    let extensions = parser.read_extensions(&mut |name| callback.handle_extension(name))?;
    debug!(?extensions, "extensions");

    parser.parse_fragments()?;
    let graph = parser.parse_graph()?;
    parser.expect_end()?;
    let fragments = parser.into_fragments();
    debug!(
        graph = %graph.prototype.name,
        fragments = fragments.len() - builtin_count,
        assignments = graph.assignments.len(),
        "parsed"
    );

    let prototype = graph.prototype.as_ref();
    callback.begin_graph(prototype, &fragments)?;

    let mut evaluator = Evaluator::new(
        &fragments,
        options.lowering_policy(),
        &mut *callback,
        options.max_lowering_depth,
    );
    evaluator.reserve(prototype.params.iter().map(|p| p.name.as_str()));
    evaluator.reserve(prototype.results.iter().map(|r| r.name.as_str()));
    for assignment in &graph.assignments {
        evaluator.reserve(assignment.lhs.identifiers());
    }

    let mut values = Values::default();
    for param in &prototype.params {
        values.insert(param.name.clone(), Value::identifier(&param.name));
        if let Some(dtype) = param.ty.tensor_data_type() {
            evaluator.declare_dtype(&param.name, dtype);
        }
    }
    for assignment in &graph.assignments {
        evaluator.evaluate_assign(assignment, &mut values, None, true)?;
    }
    let dtypes = evaluator.into_dtypes();

    callback.end_graph(prototype, &dtypes)?;
    callback.end_document(filename)?;
    debug!(tensors = dtypes.len(), "document done");
    Ok(())
}

/// Parse `source` into a [`Graph`].
pub fn parse_graph(source: &str, options: &ParseOptions) -> Result<Graph> {
    let mut builder = GraphBuilder::new();
    parse_document(source, options, &mut builder)?;
    Ok(builder.finish())
}
