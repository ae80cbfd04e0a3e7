use serde::{Deserialize, Serialize};

use crate::model::{ModelDefinition, ResidualSpec};
use crate::simulator::integrator::Trajectory;
use crate::simulator::resolver::ResolvedParameterSet;
use crate::variance::{RandomEffectVector, VarianceComponents};
use crate::PharmsimError;

/// How residual error turns a prediction into an observed value
///
/// The variant is chosen from which of the declared entries of the residual
/// error matrix have a non-zero variance. Indices point into one draw from
/// that matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResidualErrorModel {
    /// Observed equals predicted
    #[default]
    None,
    /// `IPRED + eps_add`
    Additive { index: usize },
    /// `IPRED * (1 + eps_prop)`
    Proportional { index: usize },
    /// `IPRED * (1 + eps_prop) + eps_add`
    Combined { additive: usize, proportional: usize },
}

impl ResidualErrorModel {
    pub fn from_spec(
        spec: Option<&ResidualSpec>,
        variance: &VarianceComponents,
    ) -> Result<Self, PharmsimError> {
        let Some(spec) = spec else {
            return Ok(ResidualErrorModel::None);
        };
        let matrix = variance
            .get(&spec.matrix)
            .ok_or_else(|| PharmsimError::UnknownMatrix(spec.matrix.clone()))?;
        let active = |index: Option<usize>| -> Result<Option<usize>, PharmsimError> {
            match index {
                None => Ok(None),
                Some(i) => match matrix.variance(i) {
                    Some(v) => Ok((v > 0.0).then_some(i)),
                    None => Err(PharmsimError::DimensionMismatch {
                        what: format!("residual error matrix '{}'", spec.matrix),
                        expected: i + 1,
                        actual: matrix.dim(),
                    }),
                },
            }
        };
        Ok(match (active(spec.additive)?, active(spec.proportional)?) {
            (None, None) => ResidualErrorModel::None,
            (Some(index), None) => ResidualErrorModel::Additive { index },
            (None, Some(index)) => ResidualErrorModel::Proportional { index },
            (Some(additive), Some(proportional)) => ResidualErrorModel::Combined {
                additive,
                proportional,
            },
        })
    }

    pub fn is_none(&self) -> bool {
        *self == ResidualErrorModel::None
    }

    /// Apply one residual error draw to a prediction
    pub fn apply(&self, ipred: f64, eps: &[f64]) -> f64 {
        let eps = |i: usize| eps.get(i).copied().unwrap_or(f64::NAN);
        match *self {
            ResidualErrorModel::None => ipred,
            ResidualErrorModel::Additive { index } => ipred + eps(index),
            ResidualErrorModel::Proportional { index } => ipred * (1.0 + eps(index)),
            ResidualErrorModel::Combined {
                additive,
                proportional,
            } => ipred * (1.0 + eps(proportional)) + eps(additive),
        }
    }
}

/// One output row: every captured value at one snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationRow {
    pub time: f64,
    /// 1 for dose rows, 0 otherwise
    pub evid: u8,
    /// Noiseless values, in capture order
    pub predicted: Vec<f64>,
    /// Values after residual error; equal to `predicted` for captures without it
    pub observed: Vec<f64>,
}

/// Captured values of one individual, one row per trajectory snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservationSeries {
    names: Vec<String>,
    rows: Vec<ObservationRow>,
}

impl ObservationSeries {
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn rows(&self) -> &[ObservationRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn times(&self) -> Vec<f64> {
        self.rows.iter().map(|row| row.time).collect()
    }

    fn index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Noiseless values of one capture across all rows
    pub fn predicted(&self, name: &str) -> Option<Vec<f64>> {
        let i = self.index(name)?;
        Some(self.rows.iter().map(|row| row.predicted[i]).collect())
    }

    /// Observed values of one capture across all rows
    pub fn observed(&self, name: &str) -> Option<Vec<f64>> {
        let i = self.index(name)?;
        Some(self.rows.iter().map(|row| row.observed[i]).collect())
    }
}

/// Evaluates captures on a trajectory and applies residual error
#[derive(Debug, Clone, Copy)]
pub struct OutputStage<'a> {
    model: &'a ModelDefinition,
    residual: ResidualErrorModel,
}

impl<'a> OutputStage<'a> {
    pub fn new(model: &'a ModelDefinition, residual: ResidualErrorModel) -> Self {
        OutputStage { model, residual }
    }

    pub fn residual(&self) -> ResidualErrorModel {
        self.residual
    }

    /// Build the observation series of a run
    ///
    /// `params` are indexed by the snapshots' segments. `sigma` holds one
    /// residual error draw per snapshot and may be empty when the residual
    /// error model is [ResidualErrorModel::None].
    pub fn observe(
        &self,
        trajectory: &Trajectory,
        params: &[ResolvedParameterSet],
        sigma: &[RandomEffectVector],
    ) -> Result<ObservationSeries, PharmsimError> {
        if !self.residual.is_none() && sigma.len() != trajectory.len() {
            return Err(PharmsimError::InputMismatch {
                what: "residual error draws".to_string(),
                expected: trajectory.len(),
                actual: sigma.len(),
            });
        }
        let captures = self.model.captures();
        let mut rows = Vec::with_capacity(trajectory.len());
        for (i, snapshot) in trajectory.iter().enumerate() {
            let p = params
                .get(snapshot.segment)
                .ok_or_else(|| PharmsimError::InputMismatch {
                    what: "parameter segments".to_string(),
                    expected: snapshot.segment + 1,
                    actual: params.len(),
                })?;
            let env = p.env(self.model, &snapshot.state, snapshot.time);
            let eps = sigma.get(i).map(Vec::as_slice).unwrap_or(&[]);

            let predicted: Vec<f64> = captures.iter().map(|c| c.expr.eval(&env)).collect();
            let observed = captures
                .iter()
                .zip(&predicted)
                .map(|(capture, &ipred)| {
                    if capture.residual {
                        self.residual.apply(ipred, eps)
                    } else {
                        ipred
                    }
                })
                .collect();
            rows.push(ObservationRow {
                time: snapshot.time,
                evid: snapshot.kind.evid(),
                predicted,
                observed,
            });
        }
        Ok(ObservationSeries {
            names: captures.iter().map(|c| c.name.clone()).collect(),
            rows,
        })
    }
}
