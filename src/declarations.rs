// Declarations — Identifier scope used while parsing one body
//
// Maps identifier names to their resolved types. A fresh table is created
// for every fragment body and for the graph body, so the scopes never see
// each other. Comprehension iterators are declared for the duration of the
// comprehension and removed on exit.

use rustc_hash::FxHashMap;

use crate::types::TypeRef;

#[derive(Debug, Default)]
pub struct Declarations {
    entries: FxHashMap<String, TypeRef>,
}

impl Declarations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `name` with type `ty`, replacing any previous declaration.
    /// Returns the previous type, if there was one.
    pub fn declare(&mut self, name: impl Into<String>, ty: TypeRef) -> Option<TypeRef> {
        self.entries.insert(name.into(), ty)
    }

    pub fn remove(&mut self, name: &str) -> Option<TypeRef> {
        self.entries.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&TypeRef> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TypeInterner, Typename};

    #[test]
    fn test_declare_and_remove() {
        let t = TypeInterner::new();
        let mut decls = Declarations::new();
        assert!(decls.declare("x", t.tensor(Typename::Scalar)).is_none());
        assert!(decls.contains("x"));
        let previous = decls.declare("x", t.integer());
        assert_eq!(previous, Some(t.tensor(Typename::Scalar)));
        assert_eq!(decls.get("x"), Some(&t.integer()));
        decls.remove("x");
        assert!(decls.is_empty());
    }
}
