// Graph — A flattened NNEF document as plain data
//
// GraphBuilder is a ParserCallback that records what the evaluator reports
// instead of acting on it. The resulting Graph lists operations in the order
// they were flattened, which is always a valid execution order: an operation
// reads only tensors produced by an earlier operation.
//
// A name rebound to a different value keeps its tensor. The evaluator
// reports a `copy` into that tensor instead, which becomes its last producer.
//
//   graph g( input ) -> ( output )
//   {
//       input = external(shape = [1, 3, 224, 224]);       ─►  external   → input
//       filter = variable(shape = [8, 3, 3, 3], ...);     ─►  variable   → filter
//       output = relu(conv(input, filter));               ─►  conv       → conv1
//   }                                                         relu       → output
//
// Arguments are split by the declared parameter type: tensor parameters are
// `inputs` (graph edges), everything else is an attribute.

use std::fmt;

use indexmap::IndexMap;

use crate::callback::ParserCallback;
use crate::error::Result;
use crate::prototype::{FragmentTable, Prototype};
use crate::types::Typename;
use crate::value::Value;

/// A tensor of the flattened graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub name: String,
    pub dtype: Typename,
}

/// One reported operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub name: String,
    /// Generic data type the operation was instantiated with.
    pub dtype: Option<Typename>,
    pub attribs: IndexMap<String, Value>,
    pub inputs: IndexMap<String, Value>,
    pub outputs: IndexMap<String, Value>,
}

impl Operation {
    /// Every tensor identifier read by the operation.
    pub fn input_ids(&self) -> Vec<&str> {
        let mut ids = Vec::new();
        for value in self.inputs.values() {
            value.for_each_identifier(&mut |id| ids.push(id));
        }
        ids
    }

    /// Every tensor identifier produced by the operation.
    pub fn output_ids(&self) -> Vec<&str> {
        let mut ids = Vec::new();
        for value in self.outputs.values() {
            value.for_each_identifier(&mut |id| ids.push(id));
        }
        ids
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut outputs = self.outputs.values();
        match (outputs.next(), self.outputs.len()) {
            (Some(output), 1) => write!(f, "{output}")?,
            _ => {
                let outputs: Vec<String> = self.outputs.values().map(ToString::to_string).collect();
                write!(f, "({})", outputs.join(", "))?;
            }
        }
        write!(f, " = {}", self.name)?;
        if let Some(dtype) = self.dtype {
            write!(f, "<{dtype}>")?;
        }
        let args: Vec<String> = self
            .inputs
            .values()
            .map(ToString::to_string)
            .chain(self.attribs.iter().map(|(name, value)| format!("{name} = {value}")))
            .collect();
        write!(f, "({})", args.join(", "))
    }
}

/// A flattened document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Graph {
    pub name: String,
    pub version: (u32, u32),
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub tensors: IndexMap<String, Tensor>,
    pub operations: Vec<Operation>,
}

impl Graph {
    /// Operations producing `tensor`, in order. The first one defines it;
    /// later ones come from rebinding a name that already held it.
    pub fn producers(&self, tensor: &str) -> Vec<&Operation> {
        self.operations
            .iter()
            .filter(|op| op.output_ids().contains(&tensor))
            .collect()
    }

    /// Operations reading `tensor`, in order.
    pub fn consumers(&self, tensor: &str) -> Vec<&Operation> {
        self.operations
            .iter()
            .filter(|op| op.input_ids().contains(&tensor))
            .collect()
    }

    /// Readable listing for debugging.
    pub fn dump(&self) -> String {
        let mut out = format!(
            "=== Graph: {} ({} operations, {} tensors) ===\n",
            self.name,
            self.operations.len(),
            self.tensors.len()
        );
        for op in &self.operations {
            out.push_str(&format!("  {op}\n"));
        }
        let tensors: Vec<String> = self
            .tensors
            .values()
            .map(|t| format!("{}: {}", t.name, t.dtype))
            .collect();
        out.push_str(&format!("  tensors: [{}]\n", tensors.join(", ")));
        out.push_str(&format!("  inputs:  {:?}\n", self.inputs));
        out.push_str(&format!("  outputs: {:?}\n", self.outputs));
        out
    }
}

/// Collects callback events into a [`Graph`].
#[derive(Debug, Default)]
pub struct GraphBuilder {
    graph: Graph,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finish(self) -> Graph {
        self.graph
    }
}

impl ParserCallback for GraphBuilder {
    fn begin_document(&mut self, _filename: &str, version: (u32, u32)) -> Result<()> {
        self.graph = Graph {
            version,
            ..Graph::default()
        };
        Ok(())
    }

    fn begin_graph(&mut self, graph: &Prototype, _fragments: &FragmentTable) -> Result<()> {
        self.graph.name = graph.name.clone();
        self.graph.inputs = graph.params.iter().map(|p| p.name.clone()).collect();
        self.graph.outputs = graph.results.iter().map(|r| r.name.clone()).collect();
        Ok(())
    }

    fn end_graph(&mut self, _graph: &Prototype, dtypes: &IndexMap<String, Typename>) -> Result<()> {
        self.graph.tensors = dtypes
            .iter()
            .map(|(name, &dtype)| {
                (
                    name.clone(),
                    Tensor {
                        name: name.clone(),
                        dtype,
                    },
                )
            })
            .collect();
        Ok(())
    }

    fn operation(
        &mut self,
        proto: &Prototype,
        args: &IndexMap<String, Value>,
        dtypes: &IndexMap<String, Typename>,
    ) -> Result<()> {
        let mut attribs = IndexMap::new();
        let mut inputs = IndexMap::new();
        for param in &proto.params {
            let value = args.get(&param.name).cloned().unwrap_or_default();
            if param.ty.is_attribute() {
                attribs.insert(param.name.clone(), value);
            } else {
                inputs.insert(param.name.clone(), value);
            }
        }
        let outputs: IndexMap<String, Value> = proto
            .results
            .iter()
            .map(|r| (r.name.clone(), args.get(&r.name).cloned().unwrap_or_default()))
            .collect();

        let dtype = if proto.is_generic() {
            let mut first = None;
            for value in outputs.values() {
                value.for_each_identifier(&mut |id| {
                    if first.is_none() {
                        first = dtypes.get(id).copied();
                    }
                });
            }
            first
        } else {
            None
        };

        self.graph.operations.push(Operation {
            name: proto.name.clone(),
            dtype,
            attribs,
            inputs,
            outputs,
        });
        Ok(())
    }
}
