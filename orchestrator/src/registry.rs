//! Compile-time registry of in-process module implementations
//!
//! Configurations select an implementation by its string identifier; unknown
//! identifiers are rejected at configuration load, never at run time.
use std::collections::HashMap;
use std::sync::Arc;

use hermes_core::backplane::Backplane;
use hermes_core::error::TypedResult;
use hermes_core::problem;
use once_cell::sync::Lazy;

use crate::module::InprocModule;
use crate::modules::injection::Injection;
use crate::modules::mock_physics::MockPhysics;

/// Everything an in-process implementation receives at construction
pub struct InprocContext {
    /// Module name, used as the signal prefix
    pub module_name: String,
    pub backplane: Arc<Backplane>,
    /// Qualified names of the signals declared by this module
    pub signals: Vec<String>,
}

pub type Constructor = fn(InprocContext) -> Box<dyn InprocModule>;

static REGISTRY: Lazy<HashMap<&'static str, Constructor>> = Lazy::new(|| {
    HashMap::from([
        ("mock_physics", MockPhysics::construct as Constructor),
        ("injection", Injection::construct as Constructor),
    ])
});

/// Whether an implementation is registered under this identifier
pub fn contains(id: &str) -> bool {
    REGISTRY.contains_key(id)
}

/// All registered identifiers, for diagnostics
pub fn known_ids() -> Vec<&'static str> {
    let mut ids: Vec<_> = REGISTRY.keys().copied().collect();
    ids.sort_unstable();
    ids
}

/// Constructs the implementation registered under `id`
pub fn construct(id: &str, ctx: InprocContext) -> TypedResult<Box<dyn InprocModule>> {
    let constructor = REGISTRY
        .get(id)
        .ok_or_else(|| problem!(Config, "Unknown inproc implementation: {id}"))?;
    Ok(constructor(ctx))
}
