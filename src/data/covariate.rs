use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::PharmsimError;

/// Covariate values supplied by a single record
///
/// A snapshot holds one value per covariate name. Values do not carry over
/// between records on their own; the record builder copies the previous
/// snapshot when a new record is opened.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Covariates {
    values: BTreeMap<String, f64>,
}

impl Covariates {
    pub fn new() -> Self {
        Covariates::default()
    }

    /// Set the value of a covariate, replacing any previous value
    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        self.values.insert(name.into(), value);
    }

    /// Builder-style variant of [Covariates::insert]
    pub fn with(mut self, name: impl Into<String>, value: f64) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Lay the snapshot out in the order given by `names`
    ///
    /// Fails with [PharmsimError::MissingCovariate] if any declared covariate
    /// is absent. Names not listed are ignored.
    pub(crate) fn dense(&self, names: &[String], time: f64) -> Result<Vec<f64>, PharmsimError> {
        names
            .iter()
            .map(|name| {
                self.get(name).ok_or_else(|| PharmsimError::MissingCovariate {
                    name: name.clone(),
                    time,
                })
            })
            .collect()
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for Covariates {
    fn from_iter<I: IntoIterator<Item = (K, f64)>>(iter: I) -> Self {
        let mut covariates = Covariates::new();
        for (name, value) in iter {
            covariates.insert(name, value);
        }
        covariates
    }
}

impl fmt::Display for Covariates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .values
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        write!(f, "{}", parts.join(", "))
    }
}
