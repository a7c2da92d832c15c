// Callback — The effect boundary between the front end and its consumer
//
// Parsing a document produces no data structure of its own. Instead the
// driver reports what it finds through a ParserCallback:
//
//   begin_document ─► begin_graph ─► operation* ─► end_graph ─► end_document
//
// `operation` is called once per primitive (or non-lowered) invocation of
// the flattened graph, in evaluation order. If parsing fails part-way, any
// operations already reported belong to an invalid document.

use indexmap::IndexMap;

use crate::error::Result;
use crate::prototype::{FragmentTable, Prototype};
use crate::types::Typename;
use crate::value::Value;

/// Receives the flattened contents of an NNEF document.
pub trait ParserCallback {
    fn begin_document(&mut self, _filename: &str, _version: (u32, u32)) -> Result<()> {
        Ok(())
    }

    fn end_document(&mut self, _filename: &str) -> Result<()> {
        Ok(())
    }

    /// Called for every extension the front end does not know itself.
    /// Returning `false` rejects the document.
    fn handle_extension(&mut self, _name: &str) -> bool {
        false
    }

    /// Called once the graph declaration has been parsed, with every
    /// fragment known to the document (standard library included).
    fn begin_graph(&mut self, _graph: &Prototype, _fragments: &FragmentTable) -> Result<()> {
        Ok(())
    }

    /// Called after the last operation. `dtypes` holds the element type of
    /// every tensor identifier that was produced.
    fn end_graph(&mut self, _graph: &Prototype, _dtypes: &IndexMap<String, Typename>) -> Result<()> {
        Ok(())
    }

    /// One operation of the flattened graph. `args` maps every parameter and
    /// result name of `proto` to its value; result values are identifiers
    /// (or arrays/tuples of identifiers) of the tensors produced.
    fn operation(
        &mut self,
        proto: &Prototype,
        args: &IndexMap<String, Value>,
        dtypes: &IndexMap<String, Typename>,
    ) -> Result<()>;
}

/// Decides which compound fragments are inlined into their callers instead
/// of being reported as a single operation.
pub trait ShouldLower {
    fn should_lower(&self, fragment: &str) -> bool;
}

impl<F> ShouldLower for F
where
    F: Fn(&str) -> bool,
{
    fn should_lower(&self, fragment: &str) -> bool {
        self(fragment)
    }
}
