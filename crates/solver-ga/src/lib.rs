pub mod driver;
pub mod genome;
pub mod monitor;
pub mod repair;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, warn};
use ttable_core::matrix::{AdaptMatrix, AllocError};
use ttable_core::rules::build_catalog;
use ttable_core::{SolveRequest, SolveResult, Solver};
use types::ClassSn;

use driver::{GaDriver, SolverContext};
use genome::Individual;

pub struct GaSolver;

impl GaSolver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for GaSolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Solver for GaSolver {
    async fn solve(&self, req: SolveRequest) -> anyhow::Result<SolveResult> {
        let SolveRequest { input, params } = req;
        ttable_core::validate(&input)?;
        let rules = build_catalog(&input)?;
        info!(
            tasks = input.tasks.len(),
            rules = rules.len(),
            pop = params.pop_size,
            seed = params.seed,
            "starting GA solve"
        );
        let ctx = SolverContext {
            input,
            rules,
            params,
        };
        let mut rng = ChaCha8Rng::seed_from_u64(ctx.params.seed);

        let sns: Vec<ClassSn> = ctx.input.tasks.iter().map(|t| t.sn()).collect();
        let mut population = Vec::new();
        let mut failed_builds = 0u32;
        for _ in 0..ctx.params.pop_size {
            match build_individual(&ctx, &sns, &mut rng)? {
                Some(ind) => population.push(ind),
                None => failed_builds += 1,
            }
        }
        if failed_builds > 0 {
            warn!(
                failed_builds,
                effective_pop = population.len(),
                "some individuals could not be constructed"
            );
        }
        if population.is_empty() {
            return Ok(SolveResult {
                status: "infeasible".into(),
                fitness: 0,
                found_at_generation: 0,
                unresolved_conflicts: 0,
                placements: vec![],
                generations: vec![],
                stats: serde_json::json!({
                    "method": "ga",
                    "note": "failed to construct any individual",
                    "failed_builds": failed_builds,
                }),
            });
        }

        let driver = GaDriver::new(&ctx, population, rng);
        let outcome = driver.run()?;

        let stats = serde_json::json!({
            "method": "ga",
            "seed": ctx.params.seed,
            "failed_builds": failed_builds,
            "generations_run": outcome.generations.len(),
        });
        Ok(match outcome.best {
            Some(best) => SolveResult {
                status: "solved".into(),
                fitness: best.fitness,
                found_at_generation: outcome.best_generation,
                unresolved_conflicts: best.unresolved,
                placements: best.to_placements(),
                generations: outcome.generations,
                stats,
            },
            None => SolveResult {
                status: "infeasible".into(),
                fitness: 0,
                found_at_generation: 0,
                unresolved_conflicts: 0,
                placements: vec![],
                generations: outcome.generations,
                stats,
            },
        })
    }
}

/// One individual via the slot allocator; on exhaustion the class order is
/// reshuffled and allocation restarts, up to the configured retry budget.
fn build_individual(
    ctx: &SolverContext,
    sns: &[ClassSn],
    rng: &mut ChaCha8Rng,
) -> anyhow::Result<Option<Individual>> {
    for attempt in 0..=ctx.params.max_alloc_retries {
        let mut order = sns.to_vec();
        order.shuffle(rng);
        let mut m = AdaptMatrix::init(&ctx.input)?;
        m.calc_fixed_scores(&ctx.rules)?;
        match m.allocate(&order, &ctx.rules, rng) {
            Ok(_) => {
                let mut ind = Individual::from_matrix(&m);
                let (fitness, feasible) = m.fitness();
                ind.fitness = fitness;
                ind.feasible = feasible;
                return Ok(Some(ind));
            }
            Err(AllocError::Exhausted { sn, remaining }) => {
                debug!(%sn, remaining, attempt, "allocation dead-ended; reshuffling class order");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use types::{
        ClassId, GradeId, Placement, RuleBook, ScheduleInput, SlotRef, Subject, SubjectId,
        Teacher, TeacherId, TeachingTask, TimeSlot, Venue, VenueBinding, VenueId,
        WeekGrid,
    };

    fn tid(s: &str) -> TeacherId {
        TeacherId(s.to_string())
    }
    fn vid(s: &str) -> VenueId {
        VenueId(s.to_string())
    }

    fn school_input() -> ScheduleInput {
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
                weekly_hours: 5,
                double_periods: 1,
            },
            TeachingTask {
                subject: SubjectId(2),
                grade: GradeId(1),
                class: ClassId(1),
                teachers: vec![tid("t2")],
                weekly_hours: 5,
                double_periods: 0,
            },
            TeachingTask {
                subject: SubjectId(3),
                grade: GradeId(1),
                class: ClassId(1),
                teachers: vec![tid("t1")],
                weekly_hours: 3,
                double_periods: 0,
            },
            TeachingTask {
                subject: SubjectId(1),
                grade: GradeId(1),
                class: ClassId(2),
                teachers: vec![tid("t1")],
                weekly_hours: 4,
                double_periods: 0,
            },
        ];
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
                    name: "language".into(),
                    groups: vec![],
                },
                Subject {
                    id: SubjectId(3),
                    name: "science".into(),
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
            venues: vec![
                Venue {
                    id: vid("v1"),
                    name: None,
                },
                Venue {
                    id: vid("v2"),
                    name: None,
                },
            ],
            venue_bindings: tasks
                .iter()
                .map(|t| VenueBinding {
                    subject: t.subject,
                    grade: t.grade,
                    class: t.class,
                    venues: vec![if t.class.0 == 1 { vid("v1") } else { vid("v2") }],
                })
                .collect(),
            tasks,
            rules: RuleBook::default(),
        }
    }

    fn assert_no_overlaps(placements: &[Placement]) {
        let mut teacher: HashMap<(String, TimeSlot), u32> = HashMap::new();
        let mut venue: HashMap<(String, TimeSlot), u32> = HashMap::new();
        let mut class: HashMap<(u16, u16, TimeSlot), u32> = HashMap::new();
        for p in placements {
            for s in &p.slots {
                *teacher.entry((p.teacher.0.clone(), *s)).or_default() += 1;
                *venue.entry((p.venue.0.clone(), *s)).or_default() += 1;
                *class
                    .entry((p.sn.grade.0, p.sn.class.0, *s))
                    .or_default() += 1;
            }
        }
        assert!(teacher.values().all(|c| *c == 1), "teacher double-booked");
        assert!(venue.values().all(|c| *c == 1), "venue double-booked");
        assert!(class.values().all(|c| *c == 1), "class double-booked");
    }

    #[tokio::test]
    async fn solves_small_school() {
        let input = school_input();
        let params = types::GaParams {
            pop_size: 8,
            max_generations: 10,
            seed: 42,
            ..Default::default()
        };
        let res = GaSolver::new()
            .solve(SolveRequest { input, params })
            .await
            .unwrap();
        assert_eq!(res.status, "solved");
        assert_eq!(res.unresolved_conflicts, 0);
        // 5 + 5 + 3 + 4 scheduled lesson-hours
        let hours: usize = res.placements.iter().map(|p| p.slots.len()).sum();
        assert_eq!(hours, 17);
        assert_no_overlaps(&res.placements);
        assert!(!res.generations.is_empty());
        assert!(res.generations.len() <= 10);
        // the connected pair survived as a contiguous pair
        let pair = res
            .placements
            .iter()
            .find(|p| p.connected)
            .expect("one double period");
        assert_eq!(pair.slots.len(), 2);
        assert_eq!(pair.slots[1].0, pair.slots[0].0 + 1);
    }

    #[tokio::test]
    async fn hard_forbidden_slot_never_used() {
        let mut input = school_input();
        input.rules.class_slots.push(types::ClassSlotRule {
            grade: None,
            class: None,
            subject: None,
            teacher: Some(tid("t1")),
            slots: vec![SlotRef { day: 0, period: 3 }],
            policy: types::SlotPolicy::Forbid,
            hard: true,
            params: Default::default(),
        });
        let banned = input.grid.slot(0, 3);
        let params = types::GaParams {
            pop_size: 8,
            max_generations: 10,
            seed: 7,
            ..Default::default()
        };
        let res = GaSolver::new()
            .solve(SolveRequest { input, params })
            .await
            .unwrap();
        assert_eq!(res.status, "solved");
        for p in &res.placements {
            if p.teacher == tid("t1") {
                assert!(p.slots.iter().all(|s| *s != banned));
            }
        }
    }

    #[tokio::test]
    async fn invalid_input_is_an_error() {
        let mut input = school_input();
        input.venue_bindings.clear();
        let res = GaSolver::new()
            .solve(SolveRequest {
                input,
                params: Default::default(),
            })
            .await;
        assert!(res.is_err());
    }
}
