pub mod data;
pub mod error;
pub mod model;
pub mod simulator;
pub mod variance;

pub use crate::data::*;
pub use crate::model::library;
pub use crate::model::{ModelBuilder, ModelDefinition, OccasionPolicy, ZeroPowerPolicy};
pub use crate::simulator::integrator::{CancellationToken, SolverOptions, Trajectory};
pub use crate::simulator::output::{ObservationSeries, ResidualErrorModel};
pub use crate::simulator::resolver::ResolvedParameterSet;
pub use crate::simulator::{
    IndividualOutcome, RandomEffects, Simulation, SimulationConfig, Simulator,
};
pub use crate::variance::{RandomEffectVector, VarianceComponents, VarianceMatrix};
pub use error::PharmsimError;
pub use nalgebra::dmatrix;

pub mod prelude {
    pub mod data {
        pub use crate::data::{Covariates, Event, Individual, IndividualBuilder, Record};
    }
    pub mod simulator {
        pub use crate::simulator::{
            integrator::{Integrator, Schedule, Snapshot, SnapshotKind},
            output::{ObservationRow, OutputStage},
            resolver::ParameterResolver,
            system::OdeSystem,
        };
    }

    pub use crate::data::*;
    pub use crate::model::expr::*;
    pub use crate::model::{library, ModelBuilder, ModelDefinition, OccasionPolicy};
    pub use crate::simulator::integrator::{CancellationToken, SolverOptions, Trajectory};
    pub use crate::simulator::output::{ObservationSeries, ResidualErrorModel};
    pub use crate::simulator::resolver::ResolvedParameterSet;
    pub use crate::simulator::{
        IndividualOutcome, RandomEffects, Simulation, SimulationConfig, Simulator,
    };
    pub use crate::variance::{VarianceComponents, VarianceMatrix};
    pub use crate::PharmsimError;
}
