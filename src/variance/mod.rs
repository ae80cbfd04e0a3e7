//! Covariance matrices for random effects and residual error.
//!
//! Each matrix is validated and factorized once, when the [VarianceComponents]
//! are built. Sampling draws standard normals from a caller-supplied random
//! source and maps them through the lower-triangular factor, so the same seed
//! always yields the same vector.
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use std::collections::BTreeMap;

use crate::PharmsimError;

/// An ordered draw of random effects (ETAs or EPSs)
pub type RandomEffectVector = Vec<f64>;

/// A validated symmetric positive-semidefinite covariance matrix
#[derive(Debug, Clone, PartialEq)]
pub struct VarianceMatrix {
    covariance: DMatrix<f64>,
    factor: DMatrix<f64>,
}

impl VarianceMatrix {
    /// Validate `covariance` and compute its factor
    ///
    /// Zero variances are allowed (the corresponding draws are exactly zero),
    /// negative diagonal entries, asymmetry, non-finite entries and indefinite
    /// matrices are not.
    pub fn new(name: &str, covariance: DMatrix<f64>) -> Result<Self, PharmsimError> {
        let factor = factorize(name, &covariance)?;
        Ok(VarianceMatrix { covariance, factor })
    }

    pub fn dim(&self) -> usize {
        self.covariance.nrows()
    }

    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    /// Lower-triangular `L` with `L * L^T` equal to the covariance
    pub fn factor(&self) -> &DMatrix<f64> {
        &self.factor
    }

    pub fn variance(&self, index: usize) -> Option<f64> {
        (index < self.dim()).then(|| self.covariance[(index, index)])
    }

    /// Draw one zero-mean correlated normal vector
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> RandomEffectVector {
        let z = DVector::from_iterator(
            self.dim(),
            (0..self.dim()).map(|_| -> f64 { StandardNormal.sample(&mut *rng) }),
        );
        (&self.factor * z).iter().copied().collect()
    }
}

fn invalid(name: &str, reason: impl Into<String>) -> PharmsimError {
    PharmsimError::InvalidMatrix {
        name: name.to_string(),
        reason: reason.into(),
    }
}

/// Cholesky factorization tolerant of zero pivots
fn factorize(name: &str, cov: &DMatrix<f64>) -> Result<DMatrix<f64>, PharmsimError> {
    let n = cov.nrows();
    if cov.ncols() != n {
        return Err(invalid(
            name,
            format!("matrix must be square, got {}x{}", n, cov.ncols()),
        ));
    }
    if cov.iter().any(|v| !v.is_finite()) {
        return Err(invalid(name, "entries must be finite"));
    }
    for i in 0..n {
        if cov[(i, i)] < 0.0 {
            return Err(invalid(name, format!("diagonal entry {} is negative", i)));
        }
        for j in 0..i {
            let (a, b) = (cov[(i, j)], cov[(j, i)]);
            if (a - b).abs() > 1e-10 * a.abs().max(b.abs()).max(1.0) {
                return Err(invalid(name, format!("entries ({i},{j}) and ({j},{i}) differ")));
            }
        }
    }
    if n == 0 {
        return Ok(DMatrix::zeros(0, 0));
    }
    if let Some(l) = cov
        .clone()
        .cholesky()
        .map(|chol| chol.l())
        .filter(|l| l.iter().all(|v| v.is_finite()))
    {
        return Ok(l);
    }

    let scale = (0..n).map(|i| cov[(i, i)]).fold(1.0_f64, f64::max);
    let tol = 1e-10 * scale;
    let mut l = DMatrix::<f64>::zeros(n, n);
    for j in 0..n {
        let pivot = cov[(j, j)] - (0..j).map(|k| l[(j, k)].powi(2)).sum::<f64>();
        if pivot < -tol {
            return Err(invalid(name, "matrix is not positive semidefinite"));
        }
        if pivot <= tol {
            // a zero pivot forces the rest of the column to vanish
            for i in (j + 1)..n {
                let s = cov[(i, j)] - (0..j).map(|k| l[(i, k)] * l[(j, k)]).sum::<f64>();
                if s.abs() > tol {
                    return Err(invalid(name, "matrix is not positive semidefinite"));
                }
            }
            continue;
        }
        let d = pivot.sqrt();
        l[(j, j)] = d;
        for i in (j + 1)..n {
            let s = cov[(i, j)] - (0..j).map(|k| l[(i, k)] * l[(j, k)]).sum::<f64>();
            l[(i, j)] = s / d;
        }
    }
    Ok(l)
}

/// Named covariance matrices (between-subject, between-occasion, residual)
///
/// Immutable once built and safe to share across concurrent simulations.
///
/// ```
/// use pharmsim::VarianceComponents;
///
/// let variance = VarianceComponents::builder()
///     .diagonal("IIV", &[0.248, 0.237])
///     .diagonal("SIGMA", &[0.0, 0.16])
///     .build()
///     .unwrap();
/// assert_eq!(variance.get("IIV").unwrap().dim(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct VarianceComponents {
    matrices: BTreeMap<String, VarianceMatrix>,
}

impl VarianceComponents {
    pub fn builder() -> VarianceBuilder {
        VarianceBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<&VarianceMatrix> {
        self.matrices.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.matrices.keys().map(String::as_str)
    }

    /// Draw one vector from the named matrix
    pub fn sample<R: Rng + ?Sized>(
        &self,
        name: &str,
        rng: &mut R,
    ) -> Result<RandomEffectVector, PharmsimError> {
        self.matrices
            .get(name)
            .map(|matrix| matrix.sample(rng))
            .ok_or_else(|| PharmsimError::UnknownMatrix(name.to_string()))
    }
}

/// Collects matrices for [VarianceComponents]; validation happens in [VarianceBuilder::build]
#[derive(Debug, Clone, Default)]
pub struct VarianceBuilder {
    pending: Vec<(String, DMatrix<f64>)>,
}

impl VarianceBuilder {
    pub fn matrix(mut self, name: &str, covariance: DMatrix<f64>) -> Self {
        self.pending.push((name.to_string(), covariance));
        self
    }

    pub fn diagonal(self, name: &str, variances: &[f64]) -> Self {
        let covariance = DMatrix::from_diagonal(&DVector::from_column_slice(variances));
        self.matrix(name, covariance)
    }

    /// A full block given by its lower triangle, row by row (`OMEGA @block`)
    pub fn lower_triangle(self, name: &str, dim: usize, values: &[f64]) -> Self {
        let mut covariance = DMatrix::from_element(dim, dim, f64::NAN);
        let mut entries = values.iter();
        for i in 0..dim {
            for j in 0..=i {
                if let Some(&value) = entries.next() {
                    covariance[(i, j)] = value;
                    covariance[(j, i)] = value;
                }
            }
        }
        self.matrix(name, covariance)
    }

    /// Independent blocks placed along the diagonal
    pub fn block_diagonal(self, name: &str, blocks: &[DMatrix<f64>]) -> Self {
        let dim = blocks.iter().map(|b| b.nrows()).sum();
        let mut covariance = DMatrix::zeros(dim, dim);
        let mut offset = 0;
        for block in blocks {
            let (rows, cols) = block.shape();
            if rows != cols {
                // keep the shape error for build
                return self.matrix(name, block.clone());
            }
            covariance
                .view_mut((offset, offset), (rows, cols))
                .copy_from(block);
            offset += rows;
        }
        self.matrix(name, covariance)
    }

    /// `copies` identical blocks along the diagonal
    pub fn repeated_block(self, name: &str, block: &DMatrix<f64>, copies: usize) -> Self {
        let blocks = vec![block.clone(); copies];
        self.block_diagonal(name, &blocks)
    }

    pub fn build(self) -> Result<VarianceComponents, PharmsimError> {
        let mut matrices = BTreeMap::new();
        for (name, covariance) in self.pending {
            if matrices.contains_key(&name) {
                return Err(PharmsimError::DuplicateName(name));
            }
            let matrix = VarianceMatrix::new(&name, covariance)?;
            tracing::debug!(matrix = %name, dim = matrix.dim(), "variance matrix factorized");
            matrices.insert(name, matrix);
        }
        Ok(VarianceComponents { matrices })
    }
}
