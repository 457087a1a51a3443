//! Capability compilation — building engines with a closed namespace
//!
//! Execution engines start from `Engine::new_raw()`, which knows nothing:
//! no standard library, no module resolver, no host environment. The
//! namespace is then populated with exactly the whitelisted packages below
//! plus the host-bridge functions. Nothing else is reachable under any
//! name, so there is no implicit leakage of globals, configuration, or
//! credentials into sandboxed code.

use rhai::packages::{
    ArithmeticPackage, BasicArrayPackage, BasicIteratorPackage, BasicMapPackage, BasicMathPackage,
    BasicStringPackage, LanguageCorePackage, LogicPackage, MoreStringPackage, Package,
};
use rhai::{Engine, AST};

use crate::limits::ExecutionLimits;
use crate::types::{Violation, ViolationKind};

/// Builds capability-scoped engines and confirms validated sources bind
/// inside them.
#[derive(Debug, Clone, Default)]
pub struct CapabilityCompiler;

impl CapabilityCompiler {
    pub fn new() -> Self {
        Self
    }

    /// Build an engine whose free namespace contains only the whitelisted
    /// value/collection primitives, with the given limits applied.
    ///
    /// Bridge functions are registered on top of this by the executor, per
    /// execution, so each engine carries exactly one caller identity.
    pub fn capability_engine(limits: &ExecutionLimits) -> Engine {
        let mut engine = Engine::new_raw();

        // The whitelist. Each package is a fixed set of pure
        // value/collection operations; none touches the file system,
        // processes, or the network.
        engine.register_global_module(LanguageCorePackage::new().as_shared_module());
        engine.register_global_module(ArithmeticPackage::new().as_shared_module());
        engine.register_global_module(LogicPackage::new().as_shared_module());
        engine.register_global_module(BasicMathPackage::new().as_shared_module());
        engine.register_global_module(BasicStringPackage::new().as_shared_module());
        engine.register_global_module(MoreStringPackage::new().as_shared_module());
        engine.register_global_module(BasicArrayPackage::new().as_shared_module());
        engine.register_global_module(BasicMapPackage::new().as_shared_module());
        engine.register_global_module(BasicIteratorPackage::new().as_shared_module());

        // eval is implemented by the engine itself, not a package; a raw
        // engine still honors it unless the symbol is disabled. No module
        // resolver is installed, so import can never bind either.
        engine.disable_symbol("eval");

        engine.set_max_operations(limits.max_operations());
        engine.set_max_string_size(limits.max_string_size());
        engine.set_max_array_size(limits.max_array_size());
        engine.set_max_map_size(limits.max_map_size());
        engine.set_max_call_levels(limits.max_call_depth);
        engine.set_max_expr_depths(limits.max_expr_depth, limits.max_expr_depth);

        engine
    }

    /// Confirm that validated source still parses inside the capability
    /// engine.
    ///
    /// A construct that validated but cannot be bound here is a namespace
    /// leak and is treated as a validation failure.
    pub fn compile_check(
        &self,
        source: &str,
        limits: &ExecutionLimits,
    ) -> Result<AST, Violation> {
        let engine = Self::capability_engine(limits);
        engine.compile(source).map_err(|err| {
            Violation::new(
                ViolationKind::NamespaceLeak,
                "<compile>",
                err.1.line(),
                err.1.position(),
                format!("source does not bind in the capability namespace: {err}"),
            )
        })
    }
}
