//! Declarative compartmental models.
//!
//! A [ModelDefinition] is assembled with a [ModelBuilder] from compartments,
//! parameters, covariates and [expr] logic, and is checked for reference
//! closure when it is built. [library] bundles ready-made models.
pub mod definition;
pub mod expr;
pub mod library;
pub(crate) mod validation;

pub use definition::*;
pub use expr::{Expr, ZeroPowerPolicy};
