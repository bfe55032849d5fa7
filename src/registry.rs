//! The object registry: the map from [`Name`] to bound application object on
//! one side of a connection.

use std::{collections::HashMap, sync::Arc};

use crate::{dispatch::Dispatch, name::Name};

/// How a binding entered the registry.
///
/// Explicit bindings are created by the application (e.g. the root object
/// handed to a new connection) and survive until explicitly released.
/// Implicit bindings are created automatically whenever a `Value::Proxy` is
/// about to cross the wire for an object with no existing binding, and are
/// dropped once the last proxy referencing them is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    /// Created by the application; never auto-released.
    Explicit,
    /// Created to hand out a proxy; released when its proxies are dropped.
    Implicit,
}

struct Binding {
    object: Arc<dyn Dispatch>,
    kind: BindingKind,
}

/// Maps [`Name`]s to bound [`Dispatch`] objects for one side of a connection.
#[derive(Default)]
pub struct ObjectRegistry {
    bindings: HashMap<Name, Binding>,
}

impl ObjectRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Bind `object` under `name` explicitly. Overwrites any existing
    /// binding at `name`, including an implicit one (last write wins).
    pub fn bind_explicit(&mut self, name: Name, object: Arc<dyn Dispatch>) {
        self.bindings.insert(name, Binding { object, kind: BindingKind::Explicit });
    }

    /// Bind `object` under `name` implicitly, as when handing out a fresh
    /// proxy for a returned value.
    ///
    /// Overwrites any existing `Implicit` binding at `name`, but never
    /// downgrades an `Explicit` one: rebinding a name the application bound
    /// on purpose must not make it eligible for automatic release.
    pub fn bind_implicit(&mut self, name: Name, object: Arc<dyn Dispatch>) {
        if matches!(self.bindings.get(&name), Some(b) if b.kind == BindingKind::Explicit) {
            return;
        }
        self.bindings.insert(name, Binding { object, kind: BindingKind::Implicit });
    }

    /// Look up the object bound under `name`, if any.
    #[must_use]
    pub fn lookup(&self, name: &Name) -> Option<Arc<dyn Dispatch>> {
        self.bindings.get(name).map(|b| Arc::clone(&b.object))
    }

    /// Remove the binding at `name` if it is [`BindingKind::Implicit`].
    ///
    /// Explicit bindings are never removed by this call; only the
    /// application can retract those.
    pub fn release_implicit(&mut self, name: &Name) {
        if matches!(self.bindings.get(name), Some(b) if b.kind == BindingKind::Implicit) {
            self.bindings.remove(name);
        }
    }

    /// Remove any binding at `name` regardless of kind.
    #[must_use]
    pub fn unbind(&mut self, name: &Name) -> bool { self.bindings.remove(name).is_some() }

    /// Number of currently-bound names, for diagnostics and tests.
    #[must_use]
    pub fn len(&self) -> usize { self.bindings.len() }

    /// `true` if no names are currently bound.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.bindings.is_empty() }
}
