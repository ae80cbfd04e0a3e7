use crate::data::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The input of a single simulation run
///
/// An [Individual] is identified by a string and holds its [Record]s in time
/// order. Use [Individual::builder] to assemble one.
///
/// # Examples
///
/// ```
/// use pharmsim::*;
///
/// let individual = Individual::builder("patient_001")
///     .covariate("WT", 70.0)
///     .bolus(0.0, 5.0, 0)
///     .observation(1.0)
///     .observation(2.0)
///     .build();
///
/// assert_eq!(individual.records().len(), 1);
/// assert_eq!(individual.events().len(), 3);
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Individual {
    id: String,
    records: Vec<Record>,
}

impl Individual {
    /// Create an individual, ordering its records by time
    pub fn new(id: impl Into<String>, mut records: Vec<Record>) -> Self {
        records.sort_by(|a, b| a.time.total_cmp(&b.time));
        Individual {
            id: id.into(),
            records,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// All events of all records in schedule order, each tagged with the index
    /// of the record that carries it
    pub fn events(&self) -> Vec<(usize, Event)> {
        let mut events: Vec<(usize, Event)> = self
            .records
            .iter()
            .enumerate()
            .flat_map(|(index, record)| record.events.iter().map(move |e| (index, e.clone())))
            .collect();
        events.sort_by(|a, b| a.1.schedule_cmp(&b.1));
        events
    }

    /// Earliest time mentioned by a record or one of its events
    pub(crate) fn start_time(&self) -> Option<f64> {
        self.records
            .iter()
            .flat_map(|r| std::iter::once(r.time).chain(r.events.iter().map(|e| e.time())))
            .min_by(|a, b| a.total_cmp(b))
    }
}

/// One row of input: a time, a covariate snapshot and the events it carries
///
/// Structural parameters are resolved once per record. The values resolved for
/// a record stay in effect from its time until the time of the next record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Record {
    time: f64,
    covariates: Covariates,
    events: Vec<Event>,
}

impl Record {
    pub fn new(time: f64, covariates: Covariates, events: Vec<Event>) -> Self {
        Record {
            time,
            covariates,
            events,
        }
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn covariates(&self) -> &Covariates {
        &self.covariates
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub(crate) fn covariates_mut(&mut self) -> &mut Covariates {
        &mut self.covariates
    }

    pub(crate) fn add_event(&mut self, event: Event) {
        self.events.push(event);
    }

    pub(crate) fn last_event(&self) -> Option<&Event> {
        self.events.last()
    }
}

impl fmt::Display for Individual {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Individual ID: {}", self.id)?;
        for record in &self.records {
            writeln!(f, "  Record @ {:.2}: {}", record.time, record.covariates)?;
            for event in &record.events {
                writeln!(f, "    {}", event)?;
            }
        }
        Ok(())
    }
}
