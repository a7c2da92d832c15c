// Standard library — Bundled NNEF 1.0 operation declarations
//
// The declarations live in `stdlib.nnef` and go through the regular parser
// (with every built-in extension enabled) to seed the fragment table before
// a document is parsed. Documents may then invoke any of them, and may
// declare their own fragments on top when fragment definitions are enabled.

use crate::error::Result;
use crate::parser::parse_fragment_declarations;
use crate::prototype::FragmentTable;
use crate::types::TypeInterner;

/// Source text of the bundled standard library.
pub const STDLIB_SOURCE: &str = include_str!("stdlib.nnef");

/// Parse `source` (or the bundled library when `None`) into a fragment table.
pub fn load(source: Option<&str>, types: &TypeInterner) -> Result<FragmentTable> {
    let (source, filename) = match source {
        Some(source) => (source, "<stdlib>"),
        None => (STDLIB_SOURCE, "stdlib.nnef"),
    };
    parse_fragment_declarations(source, filename, types, FragmentTable::new())
}

/// The bundled standard library.
pub fn standard_fragments(types: &TypeInterner) -> Result<FragmentTable> {
    load(None, types)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Typename;
    use crate::value::Value;

    #[test]
    fn test_bundled_library_parses() {
        let types = TypeInterner::new();
        let fragments = standard_fragments(&types).unwrap();
        for name in ["external", "variable", "constant", "update", "copy", "select", "conv", "split"] {
            assert!(fragments[name].is_primitive(), "{name} should be primitive");
        }
        for name in ["relu", "sigmoid", "softmax", "linear", "add_n", "copy_n", "moments"] {
            assert!(!fragments[name].is_primitive(), "{name} should be compound");
        }
    }

    #[test]
    fn test_operator_primitives_exist() {
        let types = TypeInterner::new();
        let fragments = standard_fragments(&types).unwrap();
        for name in [
            "neg", "not", "add", "sub", "mul", "div", "pow", "lt", "gt", "le", "ge", "eq", "ne", "and", "or",
        ] {
            assert!(fragments.contains_key(name), "missing {name}");
        }
        let lt = &fragments["lt"].prototype;
        assert_eq!(lt.results[0].ty.tensor_data_type(), Some(Typename::Logical));
    }

    #[test]
    fn test_declared_defaults() {
        let types = TypeInterner::new();
        let fragments = standard_fragments(&types).unwrap();
        let reshape = &fragments["reshape"].prototype;
        assert_eq!(reshape.param("axis_count").unwrap().default, Some(Value::Integer(-1)));
        let external = &fragments["external"].prototype;
        assert_eq!(external.generic_default, Some(Typename::Scalar));
    }

    #[test]
    fn test_custom_library() {
        let types = TypeInterner::new();
        let fragments = load(
            Some("fragment identity<?>( x: tensor<?> ) -> ( y: tensor<?> );"),
            &types,
        )
        .unwrap();
        assert_eq!(fragments.len(), 1);
        assert!(fragments.contains_key("identity"));
    }
}
