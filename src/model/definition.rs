use serde::{Deserialize, Serialize};

use crate::model::expr::{Expr, Slot, Symbol, ZeroPowerPolicy};
use crate::model::validation;
use crate::PharmsimError;

/// A modeled pool of drug mass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Compartment {
    pub name: String,
    pub initial: f64,
}

/// A named structural parameter with its population (typical) value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: f64,
}

/// One step of the per-record evaluation pass (a `MAIN` statement)
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub name: String,
    pub expr: Expr<Slot>,
}

/// A value reported for every output row
#[derive(Debug, Clone, PartialEq)]
pub struct Capture {
    pub name: String,
    pub expr: Expr<Slot>,
    /// Whether the residual error model applies to this value
    pub residual: bool,
}

/// What happens when a record carries an occasion value outside the declared table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OccasionPolicy {
    /// Fail the run with [PharmsimError::UnknownOccasion]
    #[default]
    Strict,
    /// Use zero between-occasion effects
    ZeroEffect,
}

/// Declared occasions and the matrix their random effects are drawn from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OccasionSpec {
    pub matrix: String,
    /// Index of the covariate carrying the occasion value
    pub covariate: usize,
    /// Valid occasion values; position is the occasion slot
    pub occasions: Vec<f64>,
    pub policy: OccasionPolicy,
}

impl OccasionSpec {
    /// Slot of the occasion with the given covariate value
    pub fn slot(&self, value: f64) -> Option<usize> {
        self.occasions.iter().position(|&occasion| occasion == value)
    }
}

/// Which entries of the residual error matrix drive additive and proportional error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResidualSpec {
    pub matrix: String,
    pub additive: Option<usize>,
    pub proportional: Option<usize>,
}

/// Immutable description of a compartmental model
///
/// Every name used by the model logic has been resolved to a typed slot, so a
/// definition that exists is closed over its references. Build one with
/// [ModelDefinition::builder]; share it read-only across simulations.
#[derive(Debug, Clone)]
pub struct ModelDefinition {
    pub(crate) name: String,
    pub(crate) compartments: Vec<Compartment>,
    pub(crate) parameters: Vec<Parameter>,
    pub(crate) covariates: Vec<String>,
    pub(crate) main: Vec<Assignment>,
    pub(crate) odes: Vec<Expr<Slot>>,
    pub(crate) captures: Vec<Capture>,
    pub(crate) iiv: Option<String>,
    pub(crate) iov: Option<OccasionSpec>,
    pub(crate) residual: Option<ResidualSpec>,
    pub(crate) zero_power: ZeroPowerPolicy,
    pub(crate) iiv_used: usize,
    pub(crate) iov_used: usize,
}

impl ModelDefinition {
    pub fn builder(name: &str) -> ModelBuilder {
        ModelBuilder {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn compartments(&self) -> &[Compartment] {
        &self.compartments
    }

    pub fn nstates(&self) -> usize {
        self.compartments.len()
    }

    pub fn compartment_index(&self, name: &str) -> Option<usize> {
        self.compartments.iter().position(|c| c.name == name)
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub fn parameter_index(&self, name: &str) -> Option<usize> {
        self.parameters.iter().position(|p| p.name == name)
    }

    /// Population values in declaration order
    pub fn population_values(&self) -> Vec<f64> {
        self.parameters.iter().map(|p| p.value).collect()
    }

    pub fn covariates(&self) -> &[String] {
        &self.covariates
    }

    pub fn assignments(&self) -> &[Assignment] {
        &self.main
    }

    pub fn captures(&self) -> &[Capture] {
        &self.captures
    }

    pub fn iiv_matrix(&self) -> Option<&str> {
        self.iiv.as_deref()
    }

    pub fn occasions(&self) -> Option<&OccasionSpec> {
        self.iov.as_ref()
    }

    pub fn residual(&self) -> Option<&ResidualSpec> {
        self.residual.as_ref()
    }

    pub fn zero_power(&self) -> ZeroPowerPolicy {
        self.zero_power
    }

    /// Number of between-subject etas the model logic reads
    pub fn iiv_dimension(&self) -> usize {
        self.iiv_used
    }

    /// Number of between-occasion etas per occasion the model logic reads
    pub fn iov_dimension(&self) -> usize {
        self.iov_used
    }
}

/// Collects declarations and logic for a [ModelDefinition]
///
/// Nothing is checked until [ModelBuilder::build], which resolves every
/// reference and rejects the model if any of them is unknown.
#[derive(Debug, Clone, Default)]
pub struct ModelBuilder {
    pub(crate) name: String,
    pub(crate) compartments: Vec<Compartment>,
    pub(crate) parameters: Vec<Parameter>,
    pub(crate) covariates: Vec<String>,
    pub(crate) main: Vec<(String, Expr<Symbol>)>,
    pub(crate) defines: Vec<(String, Expr<Symbol>)>,
    pub(crate) odes: Vec<(String, Expr<Symbol>)>,
    pub(crate) tables: Vec<(String, Expr<Symbol>, bool)>,
    pub(crate) captures: Vec<String>,
    pub(crate) iiv: Option<String>,
    pub(crate) iov: Option<(String, String, Vec<f64>)>,
    pub(crate) occasion_policy: OccasionPolicy,
    pub(crate) residual: Option<ResidualSpec>,
    pub(crate) zero_power: ZeroPowerPolicy,
}

impl ModelBuilder {
    pub fn compartment(self, name: &str) -> Self {
        self.compartment_with_initial(name, 0.0)
    }

    pub fn compartment_with_initial(mut self, name: &str, initial: f64) -> Self {
        self.compartments.push(Compartment {
            name: name.to_string(),
            initial,
        });
        self
    }

    pub fn parameter(mut self, name: &str, value: f64) -> Self {
        self.parameters.push(Parameter {
            name: name.to_string(),
            value,
        });
        self
    }

    pub fn covariate(mut self, name: &str) -> Self {
        self.covariates.push(name.to_string());
        self
    }

    /// Append a statement to the per-record evaluation pass
    pub fn assign(mut self, name: &str, expr: Expr) -> Self {
        self.main.push((name.to_string(), expr));
        self
    }

    /// Name an expression to be inlined in differential equations and tables
    pub fn define(mut self, name: &str, expr: Expr) -> Self {
        self.defines.push((name.to_string(), expr));
        self
    }

    /// Set the right-hand side of a compartment's differential equation
    pub fn ode(mut self, compartment: &str, expr: Expr) -> Self {
        self.odes.push((compartment.to_string(), expr));
        self
    }

    /// Declare a derived output without residual error
    pub fn table(mut self, name: &str, expr: Expr) -> Self {
        self.tables.push((name.to_string(), expr, false));
        self
    }

    /// Declare a derived output whose observed value carries residual error
    pub fn observed(mut self, name: &str, expr: Expr) -> Self {
        self.tables.push((name.to_string(), expr, true));
        self
    }

    /// Report `name` in every output row; without any capture every table output is reported
    pub fn capture(mut self, name: &str) -> Self {
        self.captures.push(name.to_string());
        self
    }

    /// Matrix the between-subject etas are drawn from
    pub fn iiv(mut self, matrix: &str) -> Self {
        self.iiv = Some(matrix.to_string());
        self
    }

    /// Matrix the per-occasion etas are drawn from, the covariate carrying the
    /// occasion value, and the valid occasion values
    pub fn iov(mut self, matrix: &str, covariate: &str, occasions: &[f64]) -> Self {
        self.iov = Some((matrix.to_string(), covariate.to_string(), occasions.to_vec()));
        self
    }

    /// Policy for occasion values outside the declared table
    ///
    /// May be set before or after [ModelBuilder::iov]; a model without
    /// occasions ignores it.
    pub fn occasion_policy(mut self, policy: OccasionPolicy) -> Self {
        self.occasion_policy = policy;
        self
    }

    /// Residual error matrix with the positions of its additive and proportional entries
    pub fn residual_error(
        mut self,
        matrix: &str,
        additive: Option<usize>,
        proportional: Option<usize>,
    ) -> Self {
        self.residual = Some(ResidualSpec {
            matrix: matrix.to_string(),
            additive,
            proportional,
        });
        self
    }

    pub fn zero_power(mut self, policy: ZeroPowerPolicy) -> Self {
        self.zero_power = policy;
        self
    }

    /// Resolve every reference and freeze the model
    pub fn build(self) -> Result<ModelDefinition, PharmsimError> {
        let model = validation::resolve(self)?;
        tracing::debug!(
            model = %model.name,
            compartments = model.compartments.len(),
            parameters = model.parameters.len(),
            assignments = model.main.len(),
            "model built"
        );
        Ok(model)
    }
}
