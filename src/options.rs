// Options — Configuration of a parse
//
// ParseOptions is built once and may be reused for any number of documents:
//
//   let mut options = ParseOptions::with_defaults();
//   options.lowered(LoweringPolicy::only(["relu", "linear"]));
//   let graph = nnef_parser::parse_graph(source, &options)?;

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashSet;

use crate::callback::ShouldLower;

/// Highest NNEF version understood by default.
pub const DEFAULT_MAX_VERSION: (u32, u32) = (1, 0);

/// Default bound on nested fragment inlining. Must fit a 2 MiB thread stack.
pub const DEFAULT_MAX_LOWERING_DEPTH: usize = 32;

/// Which compound fragments are inlined during evaluation.
#[derive(Clone, Default)]
pub enum LoweringPolicy {
    /// Report every invocation as an operation.
    #[default]
    None,
    /// Inline every fragment that has a body.
    All,
    /// Inline only the named fragments.
    Only(FxHashSet<String>),
    Custom(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl LoweringPolicy {
    pub fn none() -> Self {
        LoweringPolicy::None
    }

    pub fn all() -> Self {
        LoweringPolicy::All
    }

    pub fn only<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        LoweringPolicy::Only(names.into_iter().map(Into::into).collect())
    }

    pub fn custom(f: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        LoweringPolicy::Custom(Arc::new(f))
    }
}

impl ShouldLower for LoweringPolicy {
    fn should_lower(&self, fragment: &str) -> bool {
        match self {
            LoweringPolicy::None => false,
            LoweringPolicy::All => true,
            LoweringPolicy::Only(names) => names.contains(fragment),
            LoweringPolicy::Custom(f) => f(fragment),
        }
    }
}

impl fmt::Debug for LoweringPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoweringPolicy::None => write!(f, "None"),
            LoweringPolicy::All => write!(f, "All"),
            LoweringPolicy::Only(names) => {
                let mut names: Vec<_> = names.iter().collect();
                names.sort();
                f.debug_tuple("Only").field(&names).finish()
            }
            LoweringPolicy::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Options which customize how documents are parsed and flattened.
#[derive(Clone, Debug)]
pub struct ParseOptions {
    pub(crate) lowered: LoweringPolicy,
    pub(crate) max_lowering_depth: usize,
    pub(crate) stdlib: Option<String>,
    pub(crate) max_version: (u32, u32),
    pub(crate) filename: String,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ParseOptions {
    /// Bundled standard library, no lowering, version 1.0.
    pub fn with_defaults() -> ParseOptions {
        ParseOptions {
            lowered: LoweringPolicy::None,
            max_lowering_depth: DEFAULT_MAX_LOWERING_DEPTH,
            stdlib: None,
            max_version: DEFAULT_MAX_VERSION,
            filename: "<input>".to_string(),
        }
    }

    /// Set which compound fragments are inlined.
    pub fn lowered(&mut self, policy: LoweringPolicy) -> &mut Self {
        self.lowered = policy;
        self
    }

    /// Set how deeply lowered fragments may nest before evaluation fails.
    pub fn max_lowering_depth(&mut self, depth: usize) -> &mut Self {
        self.max_lowering_depth = depth;
        self
    }

    /// Replace the bundled standard library with `source`, a list of
    /// fragment declarations.
    pub fn stdlib(&mut self, source: impl Into<String>) -> &mut Self {
        self.stdlib = Some(source.into());
        self
    }

    /// Set the highest accepted `version` of documents.
    pub fn max_version(&mut self, major: u32, minor: u32) -> &mut Self {
        self.max_version = (major, minor);
        self
    }

    /// Set the file name reported in error positions.
    pub fn filename(&mut self, filename: impl Into<String>) -> &mut Self {
        self.filename = filename.into();
        self
    }

    pub fn lowering_policy(&self) -> &LoweringPolicy {
        &self.lowered
    }

    pub fn filename_str(&self) -> &str {
        &self.filename
    }
}
