use std::time::{Duration, Instant};
use types::GenerationStats;

use crate::genome::Individual;

#[derive(Clone, Copy, Debug, Default)]
pub struct OpCounters {
    pub crossovers_attempted: u32,
    pub crossovers_accepted: u32,
    pub mutations_attempted: u32,
    pub mutations_accepted: u32,
}

/// Per-generation statistics; the termination check reads the clock from
/// here, the caller gets the whole series back.
pub struct Monitor {
    started: Instant,
    pub generations: Vec<GenerationStats>,
}

impl Monitor {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            generations: Vec::new(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn record(
        &mut self,
        generation: u32,
        population: &[Individual],
        counters: OpCounters,
        stagnation: u32,
    ) {
        let best = population.iter().map(|i| i.fitness).max().unwrap_or(0);
        let worst = population.iter().map(|i| i.fitness).min().unwrap_or(0);
        let avg = if population.is_empty() {
            0.0
        } else {
            population.iter().map(|i| i.fitness as f64).sum::<f64>() / population.len() as f64
        };
        self.generations.push(GenerationStats {
            generation,
            best,
            avg,
            worst,
            crossovers_attempted: counters.crossovers_attempted,
            crossovers_accepted: counters.crossovers_accepted,
            mutations_attempted: counters.mutations_attempted,
            mutations_accepted: counters.mutations_accepted,
            stagnation,
            elapsed_ms: self.elapsed().as_millis() as u64,
        });
    }
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}
