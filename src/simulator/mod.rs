//! Per-individual simulation.
//!
//! A [Simulator] ties a [ModelDefinition] and its [VarianceComponents] to a
//! [SimulationConfig]. Each call to [Simulator::simulate] runs the whole
//! pipeline for one [Individual]: random effects are drawn, parameters are
//! resolved for every record, the [integrator::Integrator] produces a
//! [integrator::Trajectory], and the [output::OutputStage] turns it into an
//! [output::ObservationSeries]. A simulator only borrows shared read-only
//! state, so one instance can serve many threads at once.
pub mod integrator;
pub mod output;
pub mod resolver;
pub mod system;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::data::Individual;
use crate::model::ModelDefinition;
use crate::variance::{RandomEffectVector, VarianceComponents};
use crate::PharmsimError;

use integrator::{CancellationToken, Integrator, Schedule, SolverOptions, Trajectory};
use output::{ObservationSeries, OutputStage, ResidualErrorModel};
use resolver::{ParameterResolver, ResolvedParameterSet};
use system::OdeSystem;

/// Numeric settings shared by every run of a [Simulator]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub solver: SolverOptions,
    /// Add a row with the post-dose state for every dose
    pub record_doses: bool,
    /// Times reported in addition to observation events
    pub output_times: Vec<f64>,
}

impl SimulationConfig {
    pub fn with_solver(mut self, solver: SolverOptions) -> Self {
        self.solver = solver;
        self
    }

    pub fn with_dose_records(mut self, record_doses: bool) -> Self {
        self.record_doses = record_doses;
        self
    }

    pub fn with_output_times(mut self, output_times: Vec<f64>) -> Self {
        self.output_times = output_times;
        self
    }
}

/// Random effects of one individual
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RandomEffects {
    /// Between-subject etas, drawn once
    pub iiv: RandomEffectVector,
    /// Between-occasion etas, one vector per declared occasion
    pub iov: Vec<RandomEffectVector>,
}

impl RandomEffects {
    /// All-zero effects sized for `model`
    pub fn zeros(model: &ModelDefinition) -> Self {
        let occasions = model.occasions().map_or(0, |spec| spec.occasions.len());
        RandomEffects {
            iiv: vec![0.0; model.iiv_dimension()],
            iov: vec![vec![0.0; model.iov_dimension()]; occasions],
        }
    }

    /// Draw between-subject effects, then one between-occasion vector per
    /// occasion in declaration order
    pub fn sample<R: Rng + ?Sized>(
        model: &ModelDefinition,
        variance: &VarianceComponents,
        rng: &mut R,
    ) -> Result<Self, PharmsimError> {
        let iiv = match model.iiv_matrix() {
            Some(name) => variance.sample(name, rng)?,
            None => Vec::new(),
        };
        let iov = match model.occasions() {
            Some(spec) => spec
                .occasions
                .iter()
                .map(|_| variance.sample(&spec.matrix, rng))
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };
        Ok(RandomEffects { iiv, iov })
    }

    fn check(&self, model: &ModelDefinition) -> Result<(), PharmsimError> {
        let mismatch = |what: &str, expected: usize, actual: usize| {
            Err(PharmsimError::InputMismatch {
                what: what.to_string(),
                expected,
                actual,
            })
        };
        if self.iiv.len() < model.iiv_dimension() {
            return mismatch("IIV effects", model.iiv_dimension(), self.iiv.len());
        }
        if let Some(spec) = model.occasions() {
            if self.iov.len() != spec.occasions.len() {
                return mismatch("IOV occasions", spec.occasions.len(), self.iov.len());
            }
            if let Some(short) = self.iov.iter().find(|v| v.len() < model.iov_dimension()) {
                return mismatch("IOV effects", model.iov_dimension(), short.len());
            }
        }
        Ok(())
    }
}

/// Everything one run produced
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Simulation {
    id: String,
    effects: RandomEffects,
    parameters: Vec<ResolvedParameterSet>,
    trajectory: Trajectory,
    series: ObservationSeries,
}

impl Simulation {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn effects(&self) -> &RandomEffects {
        &self.effects
    }

    /// Resolved parameters, one set per record
    pub fn parameters(&self) -> &[ResolvedParameterSet] {
        &self.parameters
    }

    pub fn trajectory(&self) -> &Trajectory {
        &self.trajectory
    }

    pub fn series(&self) -> &ObservationSeries {
        &self.series
    }
}

/// Result of one individual within a population run
#[derive(Debug, Clone, PartialEq)]
pub struct IndividualOutcome {
    pub id: String,
    pub result: Result<Simulation, PharmsimError>,
}

impl IndividualOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn simulation(&self) -> Option<&Simulation> {
        self.result.as_ref().ok()
    }

    pub fn error(&self) -> Option<&PharmsimError> {
        self.result.as_ref().err()
    }
}

/// Runs a model for individuals
///
/// # Examples
///
/// ```
/// use pharmsim::prelude::*;
/// use rand::SeedableRng;
///
/// let model = library::han_2011()?;
/// let variance = library::han_2011_variance()?;
/// let simulator = Simulator::new(&model, &variance, SimulationConfig::default())?;
///
/// let individual = Individual::builder("1")
///     .covariate("POD", 3.0)
///     .covariate("HCT", 30.0)
///     .covariate("WT", 70.0)
///     .covariate("CYP3A5", 3.0)
///     .bolus(0.0, 5.0, 0)
///     .observation(12.0)
///     .build();
///
/// let mut rng = rand::rngs::StdRng::seed_from_u64(42);
/// let simulation = simulator.simulate(&individual, &mut rng)?;
/// assert_eq!(simulation.series().len(), 1);
/// # Ok::<(), PharmsimError>(())
/// ```
#[derive(Debug, Clone)]
pub struct Simulator<'a> {
    model: &'a ModelDefinition,
    variance: &'a VarianceComponents,
    config: SimulationConfig,
    population: Vec<f64>,
    residual: ResidualErrorModel,
    cancellation: Option<CancellationToken>,
}

impl<'a> Simulator<'a> {
    /// Check that `variance` holds every matrix `model` draws from, in a large enough size
    pub fn new(
        model: &'a ModelDefinition,
        variance: &'a VarianceComponents,
        config: SimulationConfig,
    ) -> Result<Self, PharmsimError> {
        config.solver.validate()?;
        let matrices = model
            .iiv_matrix()
            .map(|name| (name, model.iiv_dimension()))
            .into_iter()
            .chain(
                model
                    .occasions()
                    .map(|spec| (spec.matrix.as_str(), model.iov_dimension())),
            );
        for (name, needed) in matrices {
            let matrix = variance
                .get(name)
                .ok_or_else(|| PharmsimError::UnknownMatrix(name.to_string()))?;
            if matrix.dim() < needed {
                return Err(PharmsimError::DimensionMismatch {
                    what: format!("variance matrix '{}'", name),
                    expected: needed,
                    actual: matrix.dim(),
                });
            }
        }
        let residual = ResidualErrorModel::from_spec(model.residual(), variance)?;
        tracing::debug!(
            model = model.name(),
            residual = ?residual,
            "simulator ready"
        );
        Ok(Simulator {
            model,
            variance,
            config,
            population: model.population_values(),
            residual,
            cancellation: None,
        })
    }

    /// Replace the population parameter values, in declaration order
    pub fn with_population(mut self, population: Vec<f64>) -> Result<Self, PharmsimError> {
        if population.len() != self.model.parameters().len() {
            return Err(PharmsimError::DimensionMismatch {
                what: "population parameters".to_string(),
                expected: self.model.parameters().len(),
                actual: population.len(),
            });
        }
        self.population = population;
        Ok(self)
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn model(&self) -> &ModelDefinition {
        self.model
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn residual(&self) -> ResidualErrorModel {
        self.residual
    }

    pub fn sample_effects<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
    ) -> Result<RandomEffects, PharmsimError> {
        RandomEffects::sample(self.model, self.variance, rng)
    }

    /// Draw random effects and residual error from `rng` and simulate `individual`
    pub fn simulate<R: Rng + ?Sized>(
        &self,
        individual: &Individual,
        rng: &mut R,
    ) -> Result<Simulation, PharmsimError> {
        let effects = self.sample_effects(rng)?;
        self.simulate_with(individual, effects, rng)
    }

    /// Simulate with given random effects; residual error is still drawn from `rng`
    pub fn simulate_with<R: Rng + ?Sized>(
        &self,
        individual: &Individual,
        effects: RandomEffects,
        rng: &mut R,
    ) -> Result<Simulation, PharmsimError> {
        let parameters = self.resolve(individual, &effects)?;
        let trajectory = self.integrate(individual, &parameters)?;
        let sigma = match self.model.residual() {
            Some(spec) if !self.residual.is_none() => (0..trajectory.len())
                .map(|_| self.variance.sample(&spec.matrix, rng))
                .collect::<Result<Vec<_>, _>>()?,
            _ => Vec::new(),
        };
        let series =
            OutputStage::new(self.model, self.residual).observe(&trajectory, &parameters, &sigma)?;
        tracing::debug!(id = individual.id(), rows = series.len(), "individual simulated");
        Ok(Simulation {
            id: individual.id().to_string(),
            effects,
            parameters,
            trajectory,
            series,
        })
    }

    /// Noiseless run: observed values equal the predictions
    pub fn predict(
        &self,
        individual: &Individual,
        effects: RandomEffects,
    ) -> Result<Simulation, PharmsimError> {
        let parameters = self.resolve(individual, &effects)?;
        let trajectory = self.integrate(individual, &parameters)?;
        let series = OutputStage::new(self.model, ResidualErrorModel::None)
            .observe(&trajectory, &parameters, &[])?;
        Ok(Simulation {
            id: individual.id().to_string(),
            effects,
            parameters,
            trajectory,
            series,
        })
    }

    /// Simulate individuals one after another, seeding each from `base_seed` plus its position
    ///
    /// A failing individual is reported in its [IndividualOutcome] and does
    /// not stop the others.
    pub fn simulate_population(
        &self,
        individuals: &[Individual],
        base_seed: u64,
    ) -> Vec<IndividualOutcome> {
        individuals
            .iter()
            .enumerate()
            .map(|(i, individual)| {
                let mut rng = StdRng::seed_from_u64(base_seed.wrapping_add(i as u64));
                let result = self.simulate(individual, &mut rng);
                if let Err(err) = &result {
                    tracing::warn!(id = individual.id(), error = %err, "individual failed");
                }
                IndividualOutcome {
                    id: individual.id().to_string(),
                    result,
                }
            })
            .collect()
    }

    fn resolve(
        &self,
        individual: &Individual,
        effects: &RandomEffects,
    ) -> Result<Vec<ResolvedParameterSet>, PharmsimError> {
        effects.check(self.model)?;
        if individual.records().is_empty() {
            return Err(PharmsimError::InvalidEvent {
                time: 0.0,
                reason: format!("individual '{}' has no records", individual.id()),
            });
        }
        let resolver = ParameterResolver::new(self.model);
        individual
            .records()
            .iter()
            .map(|record| {
                let covariates = record
                    .covariates()
                    .dense(self.model.covariates(), record.time())?;
                let occasion = self.model.occasions().map(|spec| covariates[spec.covariate]);
                resolver.resolve(
                    &self.population,
                    &covariates,
                    &effects.iiv,
                    &effects.iov,
                    occasion,
                )
            })
            .collect()
    }

    fn integrate(
        &self,
        individual: &Individual,
        parameters: &[ResolvedParameterSet],
    ) -> Result<Trajectory, PharmsimError> {
        let start = individual
            .start_time()
            .into_iter()
            .chain(self.config.output_times.iter().copied())
            .fold(f64::INFINITY, f64::min);
        let mut systems = individual
            .records()
            .iter()
            .zip(parameters)
            .map(|(record, params)| (record.time(), OdeSystem::new(self.model, params)));
        let Some((_, first)) = systems.next() else {
            return Ok(Trajectory::default());
        };
        let schedule = systems.fold(Schedule::new(start, first), |schedule, (from, system)| {
            schedule.then(from, system)
        });

        let initial: Vec<f64> = self.model.compartments().iter().map(|c| c.initial).collect();
        let events: Vec<_> = individual.events().into_iter().map(|(_, event)| event).collect();

        let mut integrator =
            Integrator::new(self.config.solver).with_dose_records(self.config.record_doses);
        if let Some(token) = &self.cancellation {
            integrator = integrator.with_cancellation(token.clone());
        }
        integrator.run(&schedule, &initial, &events, &self.config.output_times)
    }
}
