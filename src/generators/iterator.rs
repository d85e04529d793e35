use serde_json::{Map, Value};

use super::attack::AttackType;
use super::PayloadGenerator;

/// Independent cursor over the combinations of a [`PayloadGenerator`].
///
/// Exhaustion is signalled by `None`, never by an error. Each iterator keeps
/// its own position, so many may run over one generator concurrently.
pub struct PayloadIterator<'a> {
    generator: &'a PayloadGenerator,
    position: usize,
    odometer: Vec<usize>,
    total: usize,
}

impl<'a> PayloadIterator<'a> {
    pub(super) fn new(generator: &'a PayloadGenerator) -> Self {
        Self {
            generator,
            position: 0,
            odometer: vec![0; generator.payloads().len()],
            total: generator.total(),
        }
    }

    /// Total combinations this iterator yields from the start.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Combinations left before exhaustion.
    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.position)
    }

    /// Rewind to the first combination.
    pub fn reset(&mut self) {
        self.position = 0;
        self.odometer.iter_mut().for_each(|i| *i = 0);
    }

    /// The next combination, or `None` once exhausted.
    pub fn value(&mut self) -> Option<Map<String, Value>> {
        if self.position >= self.total {
            return None;
        }
        let payloads = self.generator.payloads();
        let mut values = Map::new();

        match self.generator.attack() {
            AttackType::Batteringram => {
                for (name, list) in payloads.iter().filter(|(_, list)| !list.is_empty()) {
                    let item = &list[self.position % list.len()];
                    values.insert(name.clone(), Value::String(item.clone()));
                }
            }
            AttackType::Pitchfork => {
                for (name, list) in payloads {
                    values.insert(name.clone(), Value::String(list[self.position].clone()));
                }
            }
            AttackType::Clusterbomb => {
                for ((name, list), index) in payloads.iter().zip(&self.odometer) {
                    values.insert(name.clone(), Value::String(list[*index].clone()));
                }
                self.advance_odometer();
            }
        }

        self.position += 1;
        Some(values)
    }

    fn advance_odometer(&mut self) {
        let payloads = self.generator.payloads();
        for slot in (0..self.odometer.len()).rev() {
            self.odometer[slot] += 1;
            if self.odometer[slot] < payloads[slot].1.len() {
                return;
            }
            self.odometer[slot] = 0;
        }
    }
}

impl Iterator for PayloadIterator<'_> {
    type Item = Map<String, Value>;

    fn next(&mut self) -> Option<Self::Item> {
        self.value()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining(), Some(self.remaining()))
    }
}
