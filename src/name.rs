//! Object names: the identifiers bindings and proxies are keyed by.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

/// Identifier of a bound object on a particular connection.
///
/// Either a user-supplied token (explicit binding) or an engine-generated
/// token (implicit binding). Names are opaque on the wire; equality and
/// hashing are structural.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Name(String);

impl Name {
    /// Wrap an explicit, user-supplied name.
    #[must_use]
    pub fn explicit(token: impl Into<String>) -> Self { Self(token.into()) }

    /// Borrow the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for Name {
    fn from(value: &str) -> Self { Self(value.to_owned()) }
}

impl From<String> for Name {
    fn from(value: String) -> Self { Self(value) }
}

/// Allocates implicit Names for a single connection.
///
/// Names need only be stable for the lifetime of a binding, not globally
/// unique, so a per-connection monotonic counter is sufficient (per
/// `SPEC_FULL.md` §9's "Global identifier policy").
#[derive(Debug, Default)]
pub struct ImplicitNameAllocator {
    next: AtomicU64,
}

impl ImplicitNameAllocator {
    /// Create a fresh allocator starting at zero.
    #[must_use]
    pub const fn new() -> Self { Self { next: AtomicU64::new(0) } }

    /// Allocate the next implicit name, e.g. `"#0"`, `"#1"`, ...
    #[must_use]
    pub fn allocate(&self) -> Name {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        Name(format!("#{n}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn implicit_names_are_distinct_and_stable_in_order() {
        let alloc = ImplicitNameAllocator::new();
        let a = alloc.allocate();
        let b = alloc.allocate();
        assert_ne!(a, b);
        assert_eq!(a.as_str(), "#0");
        assert_eq!(b.as_str(), "#1");
    }

    #[test]
    fn explicit_names_compare_structurally() {
        assert_eq!(Name::explicit("counter"), Name::from("counter"));
    }
}
