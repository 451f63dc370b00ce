//! Generational loop: select → crossover → mutate → repair → truncate,
//! with stagnation/target/time termination checked once per generation.

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::HashSet;
use tracing::{debug, info};
use ttable_core::matrix::ElementKey;
use ttable_core::rules::Rule;
use types::{GaParams, GenerationStats, ScheduleInput, TimeSlot, VenueId};

use crate::genome::{Gene, Individual};
use crate::monitor::{Monitor, OpCounters};
use crate::repair::resolve_conflicts;

pub struct SolverContext {
    pub input: ScheduleInput,
    pub rules: Vec<Rule>,
    pub params: GaParams,
}

pub struct GaOutcome {
    pub best: Option<Individual>,
    pub best_generation: u32,
    pub generations: Vec<GenerationStats>,
}

pub struct GaDriver<'a> {
    ctx: &'a SolverContext,
    rng: ChaCha8Rng,
    population: Vec<Individual>,
    monitor: Monitor,
    best: Option<Individual>,
    best_generation: u32,
    stagnation: u32,
}

impl<'a> GaDriver<'a> {
    pub fn new(ctx: &'a SolverContext, population: Vec<Individual>, rng: ChaCha8Rng) -> Self {
        Self {
            ctx,
            rng,
            population,
            monitor: Monitor::new(),
            best: None,
            best_generation: 0,
            stagnation: 0,
        }
    }

    pub fn run(mut self) -> anyhow::Result<GaOutcome> {
        let params = self.ctx.params.clone();
        self.sort_population();
        self.refresh_best(0);

        let mut generation = 0u32;
        loop {
            generation += 1;
            let mut counters = OpCounters::default();

            let selected = self.select();
            if selected.is_empty() {
                debug!(generation, "zero total fitness; generation advances idle");
            } else {
                let mut offspring = self.crossover(selected, &mut counters)?;
                self.mutate(&mut offspring, &mut counters)?;
                for ind in &mut offspring {
                    let report = resolve_conflicts(ind, &self.ctx.input.grid);
                    if report.moved > 0 {
                        ind.evaluate(&self.ctx.input, &self.ctx.rules)?;
                    }
                }
                // (mu + lambda): merge and keep the strongest pop_size
                self.population.extend(offspring);
                self.sort_population();
                self.population.truncate(params.pop_size);
            }

            let improved = self.refresh_best(generation);
            if improved {
                self.stagnation = 0;
            } else {
                self.stagnation += 1;
            }
            self.monitor
                .record(generation, &self.population, counters, self.stagnation);

            if generation >= params.max_generations {
                info!(generation, "stopping: generation limit");
                break;
            }
            if let (Some(target), Some(best)) = (params.target_fitness, self.best.as_ref()) {
                if best.fitness >= target {
                    info!(generation, fitness = best.fitness, "stopping: target fitness");
                    break;
                }
            }
            if self.stagnation >= params.max_stagnation {
                info!(generation, stagnation = self.stagnation, "stopping: stagnation");
                break;
            }
            if let Some(limit) = params.time_limit_sec {
                if self.monitor.elapsed().as_secs() >= limit {
                    info!(generation, "stopping: time budget");
                    break;
                }
            }
        }

        Ok(GaOutcome {
            best: self.best,
            best_generation: self.best_generation,
            generations: self.monitor.generations,
        })
    }

    fn sort_population(&mut self) {
        self.population
            .sort_by(|a, b| b.rank_key().cmp(&a.rank_key()));
    }

    /// Replace the best only on strict improvement; infeasible or
    /// conflict-carrying individuals never qualify.
    fn refresh_best(&mut self, generation: u32) -> bool {
        let candidate = self
            .population
            .iter()
            .filter(|i| i.is_best_candidate())
            .max_by_key(|i| i.fitness);
        match candidate {
            Some(c) if self.best.as_ref().map_or(true, |b| c.fitness > b.fitness) => {
                self.best = Some(c.clone());
                self.best_generation = generation;
                true
            }
            _ => false,
        }
    }

    /// Elitist head plus binary tournament for the rest. A population whose
    /// fitness sums to zero selects nothing and the generation idles.
    fn select(&mut self) -> Vec<Individual> {
        let total: i128 = self.population.iter().map(|i| i.fitness as i128).sum();
        if total == 0 {
            return Vec::new();
        }
        let params = &self.ctx.params;
        let elite = ((params.best_ratio * params.pop_size as f64).round() as usize)
            .min(self.population.len());
        let mut selected: Vec<Individual> = self.population[..elite].to_vec();
        let n = self.population.len();
        while selected.len() < params.pop_size {
            let a = self.rng.gen_range(0..n);
            let b = self.rng.gen_range(0..n);
            let winner = if self.population[a].fitness >= self.population[b].fitness {
                a
            } else {
                b
            };
            selected.push(self.population[winner].clone());
        }
        selected
    }

    /// Single cut point, suffix swap, processed pairwise. Offspring are kept
    /// only when their SN sequences still agree and no rebuilt gene score
    /// went negative; otherwise the parents survive untouched.
    fn crossover(
        &mut self,
        selected: Vec<Individual>,
        counters: &mut OpCounters,
    ) -> anyhow::Result<Vec<Individual>> {
        let mut offspring = Vec::with_capacity(selected.len());
        let mut iter = selected.into_iter();
        while let Some(a) = iter.next() {
            let Some(b) = iter.next() else {
                offspring.push(a);
                break;
            };
            let n = a.chromosomes.len();
            if n > 1
                && n == b.chromosomes.len()
                && self.rng.gen::<f64>() < self.ctx.params.crossover_rate
            {
                counters.crossovers_attempted += 1;
                let cut = self.rng.gen_range(1..n);
                let mut c = a.clone();
                let mut d = b.clone();
                for i in cut..n {
                    std::mem::swap(&mut c.chromosomes[i], &mut d.chromosomes[i]);
                }
                if c.sn_sequence() == d.sn_sequence()
                    && self.accept_offspring(&mut c)?
                    && self.accept_offspring(&mut d)?
                {
                    counters.crossovers_accepted += 1;
                    offspring.push(c);
                    offspring.push(d);
                } else {
                    offspring.push(a);
                    offspring.push(b);
                }
            } else {
                offspring.push(a);
                offspring.push(b);
            }
        }
        Ok(offspring)
    }

    fn accept_offspring(&self, ind: &mut Individual) -> anyhow::Result<bool> {
        let m = ind.rebuild_matrix(&self.ctx.input, &self.ctx.rules)?;
        let mut total = 0i64;
        for e in m.used_elements() {
            if !e.score.is_feasible() || e.score.score() < 0 {
                return Ok(false);
            }
            total += e.score.score();
        }
        ind.fitness = total;
        ind.feasible = true;
        Ok(true)
    }

    fn mutate(
        &mut self,
        offspring: &mut [Individual],
        counters: &mut OpCounters,
    ) -> anyhow::Result<()> {
        for ind in offspring.iter_mut() {
            if self.rng.gen::<f64>() >= self.ctx.params.mutation_rate {
                continue;
            }
            counters.mutations_attempted += 1;
            if self.try_mutate(ind)? {
                counters.mutations_accepted += 1;
            }
        }
        Ok(())
    }

    /// Random gene, random unused (teacher, venue, slot) combination; the
    /// replacement sticks only when its rebuilt element scores come out
    /// strictly positive.
    fn try_mutate(&mut self, ind: &mut Individual) -> anyhow::Result<bool> {
        if ind.chromosomes.is_empty() {
            return Ok(false);
        }
        let ci = self.rng.gen_range(0..ind.chromosomes.len());
        if ind.chromosomes[ci].genes.is_empty() {
            return Ok(false);
        }
        let gi = self.rng.gen_range(0..ind.chromosomes[ci].genes.len());
        let sn = ind.chromosomes[ci].sn;

        let Some(task) = self.ctx.input.tasks.iter().find(|t| t.sn() == sn) else {
            return Ok(false);
        };
        let venues: Vec<VenueId> = self
            .ctx
            .input
            .venue_bindings
            .iter()
            .find(|b| b.sn() == sn)
            .map(|b| b.venues.clone())
            .unwrap_or_default();
        if venues.is_empty() {
            return Ok(false);
        }

        let mut taken: HashSet<TimeSlot> = HashSet::new();
        for (i, g) in ind.chromosomes[ci].genes.iter().enumerate() {
            if i == gi {
                continue;
            }
            taken.extend(g.slots());
        }
        let old = ind.chromosomes[ci].genes[gi].clone();
        let grid = &self.ctx.input.grid;

        let mut candidates: Vec<Gene> = Vec::new();
        for teacher in &task.teachers {
            for venue in &venues {
                if old.is_connected() {
                    for s in grid.slots() {
                        let s2 = TimeSlot(s.0 + 1);
                        if !grid.is_section_pair(s, s2) || taken.contains(&s) || taken.contains(&s2)
                        {
                            continue;
                        }
                        let g = Gene {
                            teacher: teacher.clone(),
                            venue: venue.clone(),
                            first: s,
                            second: Some(s2),
                        };
                        if g != old {
                            candidates.push(g);
                        }
                    }
                } else {
                    for s in grid.slots() {
                        if taken.contains(&s) {
                            continue;
                        }
                        let g = Gene {
                            teacher: teacher.clone(),
                            venue: venue.clone(),
                            first: s,
                            second: None,
                        };
                        if g != old {
                            candidates.push(g);
                        }
                    }
                }
            }
        }
        if candidates.is_empty() {
            return Ok(false);
        }
        let pick = candidates.swap_remove(self.rng.gen_range(0..candidates.len()));
        ind.chromosomes[ci].genes[gi] = pick.clone();

        let m = ind.rebuild_matrix(&self.ctx.input, &self.ctx.rules)?;
        let ok = pick.slots().all(|slot| {
            m.element(&ElementKey {
                sn,
                teacher: pick.teacher.clone(),
                venue: pick.venue.clone(),
                slot,
            })
            .map_or(false, |e| e.score.is_feasible() && e.score.score() > 0)
        });
        if !ok {
            ind.chromosomes[ci].genes[gi] = old;
            return Ok(false);
        }
        let (fitness, feasible) = m.fitness();
        ind.fitness = fitness;
        ind.feasible = feasible;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use ttable_core::matrix::AdaptMatrix;
    use ttable_core::rules::build_catalog;
    use types::{
        ClassId, ClassSn, GradeId, RuleBook, ScheduleInput, SlotRef, Subject, SubjectId, Teacher,
        TeacherId, TeachingTask, Venue, VenueBinding, VenueId, WeekGrid,
    };

    fn tid(s: &str) -> TeacherId {
        TeacherId(s.to_string())
    }
    fn vid(s: &str) -> VenueId {
        VenueId(s.to_string())
    }

    fn input() -> ScheduleInput {
        let grid = WeekGrid {
            workdays: 5,
            morning_reading: 0,
            forenoon: 4,
            afternoon: 4,
            evening: 0,
        };
        let tasks = vec![
            TeachingTask {
                subject: SubjectId(1),
                grade: GradeId(1),
                class: ClassId(1),
                teachers: vec![tid("t1")],
                weekly_hours: 4,
                double_periods: 0,
            },
            TeachingTask {
                subject: SubjectId(2),
                grade: GradeId(1),
                class: ClassId(1),
                teachers: vec![tid("t2")],
                weekly_hours: 3,
                double_periods: 0,
            },
            TeachingTask {
                subject: SubjectId(3),
                grade: GradeId(1),
                class: ClassId(1),
                teachers: vec![tid("t1")],
                weekly_hours: 2,
                double_periods: 1,
            },
        ];
        let mut rules = RuleBook::default();
        // something to optimize toward, so fitness is not flat zero
        rules.class_slots.push(types::ClassSlotRule {
            grade: Some(GradeId(1)),
            class: Some(ClassId(1)),
            subject: None,
            teacher: None,
            slots: (0..4).map(|p| SlotRef { day: 0, period: p }).collect(),
            policy: types::SlotPolicy::Prefer,
            hard: false,
            params: Default::default(),
        });
        ScheduleInput {
            grid,
            subjects: vec![
                Subject {
                    id: SubjectId(1),
                    name: "maths".into(),
                    groups: vec![],
                },
                Subject {
                    id: SubjectId(2),
                    name: "art".into(),
                    groups: vec![],
                },
                Subject {
                    id: SubjectId(3),
                    name: "sport".into(),
                    groups: vec![],
                },
            ],
            teachers: vec![
                Teacher {
                    id: tid("t1"),
                    groups: vec![],
                },
                Teacher {
                    id: tid("t2"),
                    groups: vec![],
                },
            ],
            venues: vec![Venue {
                id: vid("v1"),
                name: None,
            }],
            venue_bindings: tasks
                .iter()
                .map(|t| VenueBinding {
                    subject: t.subject,
                    grade: t.grade,
                    class: t.class,
                    venues: vec![vid("v1")],
                })
                .collect(),
            tasks,
            rules,
        }
    }

    fn ctx() -> SolverContext {
        let input = input();
        let rules = build_catalog(&input).unwrap();
        SolverContext {
            input,
            rules,
            params: GaParams {
                pop_size: 6,
                max_generations: 8,
                crossover_rate: 1.0,
                mutation_rate: 0.5,
                best_ratio: 0.2,
                max_stagnation: 50,
                ..GaParams::default()
            },
        }
    }

    fn seed_population(ctx: &SolverContext, rng: &mut ChaCha8Rng) -> Vec<Individual> {
        let sns: Vec<ClassSn> = ctx.input.tasks.iter().map(|t| t.sn()).collect();
        let mut pop = Vec::new();
        while pop.len() < ctx.params.pop_size {
            let mut m = AdaptMatrix::init(&ctx.input).unwrap();
            m.calc_fixed_scores(&ctx.rules).unwrap();
            let mut order = sns.clone();
            use rand::seq::SliceRandom;
            order.shuffle(rng);
            m.allocate(&order, &ctx.rules, rng).unwrap();
            let mut ind = Individual::from_matrix(&m);
            let (fitness, feasible) = m.fitness();
            ind.fitness = fitness;
            ind.feasible = feasible;
            pop.push(ind);
        }
        pop
    }

    #[test]
    fn crossover_preserves_sn_sequence() {
        let ctx = ctx();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let pop = seed_population(&ctx, &mut rng);
        let parents_seq = pop[0].sn_sequence();
        let mut driver = GaDriver::new(&ctx, pop.clone(), rng);
        let mut counters = OpCounters::default();
        let offspring = driver.crossover(pop, &mut counters).unwrap();
        assert!(counters.crossovers_attempted > 0);
        for ind in &offspring {
            assert_eq!(ind.sn_sequence(), parents_seq);
            assert_eq!(ind.hour_count(), 9);
        }
    }

    #[test]
    fn terminates_at_generation_limit() {
        let ctx = ctx();
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let pop = seed_population(&ctx, &mut rng);
        let driver = GaDriver::new(&ctx, pop, rng);
        let outcome = driver.run().unwrap();
        assert!(!outcome.generations.is_empty());
        assert!(outcome.generations.len() as u32 <= ctx.params.max_generations);
        let best = outcome.best.expect("feasible input yields a best");
        assert!(best.is_best_candidate());
        assert!(outcome.best_generation <= ctx.params.max_generations);
    }

    #[test]
    fn zero_fitness_population_idles() {
        let ctx = SolverContext {
            params: GaParams {
                pop_size: 4,
                max_generations: 3,
                max_stagnation: 2,
                ..GaParams::default()
            },
            ..ctx()
        };
        // strip the prefer rule so every element scores zero
        let mut ctx = ctx;
        ctx.input.rules.class_slots.clear();
        ctx.rules = build_catalog(&ctx.input).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let pop = seed_population(&ctx, &mut rng);
        let driver = GaDriver::new(&ctx, pop, rng);
        let outcome = driver.run().unwrap();
        for g in &outcome.generations {
            assert_eq!(g.crossovers_attempted, 0);
            assert_eq!(g.mutations_attempted, 0);
        }
        // stagnates by construction
        assert!(outcome.generations.len() as u32 <= 3);
    }

    #[test]
    fn reproducible_with_same_seed() {
        let ctx = ctx();
        let run = |seed: u64| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let pop = seed_population(&ctx, &mut rng);
            let driver = GaDriver::new(&ctx, pop, rng);
            let outcome = driver.run().unwrap();
            outcome.best.map(|b| (b.fitness, b.to_placements().len()))
        };
        assert_eq!(run(42), run(42));
    }
}
