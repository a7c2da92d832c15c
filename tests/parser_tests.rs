// Integration tests for parsing whole NNEF documents

use indexmap::IndexMap;
use nnef_parser::{
    parse_document, ErrorCategory, ParseOptions, ParserCallback, Prototype, Result, Typename, Value,
};

#[derive(Default)]
struct Recorder {
    ops: Vec<(String, IndexMap<String, Value>)>,
    dtypes: IndexMap<String, Typename>,
}

impl ParserCallback for Recorder {
    fn end_graph(&mut self, _graph: &Prototype, dtypes: &IndexMap<String, Typename>) -> Result<()> {
        self.dtypes = dtypes.clone();
        Ok(())
    }

    fn operation(
        &mut self,
        proto: &Prototype,
        args: &IndexMap<String, Value>,
        _dtypes: &IndexMap<String, Typename>,
    ) -> Result<()> {
        self.ops.push((proto.name.clone(), args.clone()));
        Ok(())
    }
}

fn options() -> ParseOptions {
    let mut options = ParseOptions::with_defaults();
    options.filename("net.nnef");
    options
}

fn run(source: &str) -> Result<Recorder> {
    let mut recorder = Recorder::default();
    parse_document(source, &options(), &mut recorder)?;
    Ok(recorder)
}

fn id(name: &str) -> Value {
    Value::identifier(name)
}

// Invocations

#[test]
fn test_single_invocation() {
    let rec = run("version 1.0; graph g( x ) -> ( y ) { y = add(x, x); }").unwrap();
    let expected = IndexMap::from([
        ("x".to_string(), id("x")),
        ("y".to_string(), id("x")),
        ("z".to_string(), id("y")),
    ]);
    assert_eq!(rec.ops, [("add".to_string(), expected)]);
}

#[test]
fn test_operator_matches_invocation() {
    let plain = run("version 1.0; graph g( x ) -> ( y ) { y = add(x, x); }").unwrap();
    let sugared = run(
        "version 1.0;
         extension KHR_enable_operator_expressions;
         graph g( x ) -> ( y ) { y = x + x; }",
    )
    .unwrap();
    assert_eq!(plain.ops, sugared.ops);
}

#[test]
fn test_flat_negative_literal() {
    let rec = run(
        "version 1.0;
         graph g( x ) -> ( y ) {
             x = external(shape = [1, 2]);
             y = pad(x, padding = [(0, 0), (1, 1)], value = -1.0);
         }",
    )
    .unwrap();
    let (name, args) = &rec.ops[1];
    assert_eq!(name, "pad");
    assert_eq!(args["value"], Value::Scalar(-1.0));
    assert_eq!(args["border"], Value::String("constant".into()));
    assert_eq!(
        args["padding"],
        Value::Array(vec![
            Value::Tuple(vec![Value::Integer(0), Value::Integer(0)]),
            Value::Tuple(vec![Value::Integer(1), Value::Integer(1)]),
        ])
    );
}

#[test]
fn test_constant_attribute_expressions() {
    let rec = run(
        "version 1.0;
         extension KHR_enable_operator_expressions;
         graph g( x ) -> ( y ) {
             x = external(shape = [2, 3]);
             n = 2 * 3;
             y = reshape(x, shape = [n, -1]);
         }",
    )
    .unwrap();
    assert_eq!(rec.ops.len(), 2);
    assert_eq!(
        rec.ops[1].1["shape"],
        Value::Array(vec![Value::Integer(6), Value::Integer(-1)])
    );
}

#[test]
fn test_generic_types_propagate() {
    let rec = run(
        "version 1.0;
         graph g( x ) -> ( y ) {
             x = external<integer>(shape = [4]);
             y = copy(x);
         }",
    )
    .unwrap();
    assert_eq!(rec.dtypes["x"], Typename::Integer);
    assert_eq!(rec.dtypes["y"], Typename::Integer);

    let rec = run("version 1.0; graph g( x ) -> ( y ) { x = external(shape = [4]); y = copy(x); }").unwrap();
    assert_eq!(rec.dtypes["y"], Typename::Scalar);
}

#[test]
fn test_synthesized_ids_avoid_source_names() {
    let rec = run(
        "version 1.0;
         extension KHR_enable_operator_expressions;
         graph g( exp1 ) -> ( y ) {
             exp1 = external(shape = [1]);
             y = exp(exp(exp1));
         }",
    )
    .unwrap();
    assert_eq!(rec.ops[1].1["y"], id("exp2"));
    assert_eq!(rec.ops[2].1["x"], id("exp2"));
    assert_eq!(rec.ops[2].1["y"], id("y"));
}

#[test]
fn test_variable_and_update() {
    let rec = run(
        "version 1.0;
         extension KHR_enable_operator_expressions;
         graph g( x ) -> ( y ) {
             x = external(shape = [1]);
             v = variable(shape = [1], label = 'state/v');
             y = update(v, add(v, x));
         }",
    )
    .unwrap();
    let names: Vec<&str> = rec.ops.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, ["external", "variable", "add", "update"]);
    assert_eq!(rec.ops[1].1["label"], Value::String("state/v".into()));
    assert_eq!(rec.ops[3].1["value"], id("add1"));
}

#[test]
fn test_custom_stdlib() {
    let mut options = options();
    options.stdlib("fragment twice( x: tensor<scalar> ) -> ( y: tensor<scalar> );");
    let mut rec = Recorder::default();
    parse_document("version 1.0; graph g( x ) -> ( y ) { y = twice(x); }", &options, &mut rec).unwrap();
    assert_eq!(rec.ops[0].0, "twice");

    let err = parse_document("version 1.0; graph g( x ) -> ( y ) { y = relu(x); }", &options, &mut rec)
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Scope);
}

// Errors

#[test]
fn test_error_categories() {
    let cases = [
        ("version 1.0; graph g( x ) -> ( y ) { y = copy('x); }", ErrorCategory::Lexical),
        ("version 1.0; graph g( x ) -> ( y ) { y = copy(x) }", ErrorCategory::Syntax),
        ("version 1.0; graph g( x ) -> ( y ) { y = copy(w); }", ErrorCategory::Scope),
        ("version 1.0; graph g( x ) -> ( y ) { y = add(x, 'a'); }", ErrorCategory::Type),
        ("version 1.0; graph g( x ) -> ( y ) { y = external(shape = [1]); }", ErrorCategory::Semantic),
        (
            "version 1.0; graph g( x ) -> ( y ) { y = reshape(x, shape = [1], shape = [2]); }",
            ErrorCategory::Scope,
        ),
    ];
    for (source, category) in cases {
        let err = run(source).err().unwrap_or_else(|| panic!("expected an error for {source}"));
        assert_eq!(err.category(), category, "{source}: {err}");
    }
}

#[test]
fn test_error_positions() {
    let err = run("version 1.0;\ngraph g( x ) -> ( y )\n{\n    y = copy(w);\n}").err().unwrap();
    assert_eq!(err.to_string(), "net.nnef:4:14: undeclared identifier 'w'");
    let position = err.position.unwrap();
    assert_eq!((position.line, position.column), (4, 14));
    assert_eq!(position.origins().count(), 0);
}

#[test]
fn test_graph_results_must_be_tensors() {
    let err = run(
        "version 1.0;
         extension KHR_enable_operator_expressions;
         graph g( x ) -> ( y ) { y = 1 + 2; }",
    )
    .err()
    .unwrap();
    assert_eq!(err.category(), ErrorCategory::Type);
}

#[test]
fn test_ambiguous_generic_arguments() {
    let err = run(
        "version 1.0;
         graph g( x, c, i ) -> ( y ) {
             x = external(shape = [1]);
             c = external<logical>(shape = [1]);
             i = external<integer>(shape = [1]);
             y = select(c, x, i);
         }",
    )
    .err()
    .unwrap();
    assert_eq!(err.category(), ErrorCategory::Type);
    assert!(err.to_string().contains("ambiguous"), "{err}");
}
