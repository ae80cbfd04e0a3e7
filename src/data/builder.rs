use crate::data::*;

impl Individual {
    /// Start building an individual with the given identifier
    ///
    /// The builder opens an initial record at time 0. Covariates and events are
    /// added to the current record; [IndividualBuilder::record] opens the next one.
    pub fn builder(id: impl Into<String>) -> IndividualBuilder {
        IndividualBuilder {
            id: id.into(),
            records: Vec::new(),
            current: Record::new(0.0, Covariates::new(), Vec::new()),
            implicit: true,
        }
    }
}

/// Fluent constructor for [Individual]
#[derive(Debug, Clone)]
pub struct IndividualBuilder {
    id: String,
    records: Vec<Record>,
    current: Record,
    implicit: bool,
}

impl IndividualBuilder {
    /// Open a new record at `time`, carrying over the current covariate values
    pub fn record(mut self, time: f64) -> Self {
        let covariates = self.current.covariates().clone();
        let next = Record::new(time, covariates, Vec::new());
        if self.implicit && self.current.events().is_empty() {
            self.current = next;
        } else {
            let previous = std::mem::replace(&mut self.current, next);
            self.records.push(previous);
        }
        self.implicit = false;
        self
    }

    /// Set a covariate value on the current record
    pub fn covariate(mut self, name: &str, value: f64) -> Self {
        self.current.covariates_mut().insert(name, value);
        self
    }

    pub fn event(mut self, event: Event) -> Self {
        self.current.add_event(event);
        self
    }

    pub fn bolus(self, time: f64, amount: f64, input: usize) -> Self {
        self.event(Event::Bolus(Bolus::new(time, amount, input)))
    }

    pub fn infusion(self, time: f64, amount: f64, input: usize, duration: f64) -> Self {
        self.event(Event::Infusion(Infusion::new(time, amount, input, duration)))
    }

    pub fn observation(self, time: f64) -> Self {
        self.event(Event::Observation(Observation::new(time)))
    }

    /// Repeat the last event of the current record `n` more times, `delta` apart
    ///
    /// # Panics
    ///
    /// Panics if the current record has no event to repeat.
    pub fn repeat(mut self, n: usize, delta: f64) -> Self {
        let last_event = match self.current.last_event() {
            Some(event) => event.clone(),
            None => panic!("There is no event to repeat"),
        };
        for i in 1..=n {
            let mut event = last_event.clone();
            event.inc_time(delta * i as f64);
            self = self.event(event);
        }
        self
    }

    pub fn build(mut self) -> Individual {
        self.records.push(self.current);
        Individual::new(self.id, self.records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_carries_covariates_into_new_records() {
        let individual = Individual::builder("test")
            .covariate("OCC", 1.0)
            .covariate("WT", 70.0)
            .bolus(0.0, 5.0, 0)
            .observation(1.0)
            .repeat(2, 1.0)
            .record(24.0)
            .covariate("OCC", 2.0)
            .bolus(24.0, 5.0, 0)
            .build();

        assert_eq!(individual.id(), "test");
        assert_eq!(individual.records().len(), 2);
        let second = &individual.records()[1];
        assert_eq!(second.covariates().get("OCC"), Some(2.0));
        assert_eq!(second.covariates().get("WT"), Some(70.0));
        assert_eq!(individual.records()[0].events().len(), 4);
        assert_eq!(individual.records()[0].events()[3].time(), 3.0);
    }

    #[test]
    fn first_record_call_replaces_the_implicit_record() {
        let individual = Individual::builder("late")
            .covariate("WT", 80.0)
            .record(5.0)
            .bolus(5.0, 1.0, 0)
            .build();
        assert_eq!(individual.records().len(), 1);
        assert_eq!(individual.records()[0].time(), 5.0);
        assert_eq!(individual.records()[0].covariates().get("WT"), Some(80.0));
    }

    #[test]
    fn events_are_merged_in_schedule_order() {
        let individual = Individual::builder("merge")
            .observation(12.0)
            .record(12.0)
            .bolus(12.0, 1.0, 0)
            .build();
        let events = individual.events();
        assert!(matches!(events[0].1, Event::Bolus(_)));
        assert_eq!(events[0].0, 1);
        assert!(matches!(events[1].1, Event::Observation(_)));
        assert_eq!(events[1].0, 0);
    }
}
