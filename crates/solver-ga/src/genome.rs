//! Gene / Chromosome / Individual: the representation the search works on.
//! Chromosomes stay in canonical SN order so two individuals are always
//! positionally comparable, which single-point crossover relies on.

use std::collections::BTreeMap;
use ttable_core::matrix::{AdaptMatrix, ElementKey, PairRole};
use ttable_core::rules::Rule;
use types::{ClassSn, Placement, ScheduleInput, TeacherId, TimeSlot, VenueId};

/// One scheduled lesson-hour occurrence; two slots when connected.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Gene {
    pub teacher: TeacherId,
    pub venue: VenueId,
    pub first: TimeSlot,
    pub second: Option<TimeSlot>,
}

impl Gene {
    pub fn is_connected(&self) -> bool {
        self.second.is_some()
    }

    pub fn slots(&self) -> impl Iterator<Item = TimeSlot> {
        std::iter::once(self.first).chain(self.second)
    }
}

/// All genes of one class unit.
#[derive(Clone, Debug)]
pub struct Chromosome {
    pub sn: ClassSn,
    pub genes: Vec<Gene>,
}

/// One full candidate timetable.
#[derive(Clone, Debug)]
pub struct Individual {
    pub chromosomes: Vec<Chromosome>,
    pub fitness: i64,
    pub feasible: bool,
    pub unresolved: u32,
}

impl Individual {
    /// Scan a matrix's used elements into genes, one chromosome per SN.
    /// Pair tails are folded into their head's gene.
    pub fn from_matrix(m: &AdaptMatrix) -> Self {
        let mut per_sn: BTreeMap<ClassSn, Vec<Gene>> = BTreeMap::new();
        for e in m.used_elements() {
            let second = match e.pair {
                Some(PairRole::Tail(_)) => continue,
                Some(PairRole::Head(t)) => Some(t),
                None => None,
            };
            per_sn.entry(e.sn).or_default().push(Gene {
                teacher: e.teacher.clone(),
                venue: e.venue.clone(),
                first: e.slot,
                second,
            });
        }
        let chromosomes = per_sn
            .into_iter()
            .map(|(sn, mut genes)| {
                genes.sort_by_key(|g| g.first);
                Chromosome { sn, genes }
            })
            .collect();
        Self {
            chromosomes,
            fitness: 0,
            feasible: true,
            unresolved: 0,
        }
    }

    /// Fresh matrix with this individual's genes applied; the basis of every
    /// re-score after an operator touched the genes.
    pub fn rebuild_matrix(
        &self,
        input: &ScheduleInput,
        rules: &[Rule],
    ) -> anyhow::Result<AdaptMatrix> {
        let mut m = AdaptMatrix::init(input)?;
        m.calc_fixed_scores(rules)?;
        for ch in &self.chromosomes {
            for g in &ch.genes {
                let head = ElementKey {
                    sn: ch.sn,
                    teacher: g.teacher.clone(),
                    venue: g.venue.clone(),
                    slot: g.first,
                };
                match g.second {
                    Some(s2) => {
                        let tail = ElementKey {
                            slot: s2,
                            ..head.clone()
                        };
                        m.mark_used(&head, Some(PairRole::Head(s2)))?;
                        m.mark_used(&tail, Some(PairRole::Tail(g.first)))?;
                    }
                    None => m.mark_used(&head, None)?,
                }
            }
        }
        m.recalc_dynamic_scores(rules)?;
        Ok(m)
    }

    pub fn evaluate(&mut self, input: &ScheduleInput, rules: &[Rule]) -> anyhow::Result<()> {
        let m = self.rebuild_matrix(input, rules)?;
        let (fitness, feasible) = m.fitness();
        self.fitness = fitness;
        self.feasible = feasible;
        Ok(())
    }

    pub fn sn_sequence(&self) -> Vec<ClassSn> {
        self.chromosomes.iter().map(|c| c.sn).collect()
    }

    pub fn gene_count(&self) -> usize {
        self.chromosomes.iter().map(|c| c.genes.len()).sum()
    }

    pub fn hour_count(&self) -> usize {
        self.chromosomes
            .iter()
            .flat_map(|c| c.genes.iter())
            .map(|g| g.slots().count())
            .sum()
    }

    /// Only feasible, fully repaired individuals may become the best.
    pub fn is_best_candidate(&self) -> bool {
        self.feasible && self.unresolved == 0
    }

    pub fn rank_key(&self) -> (bool, i64) {
        (self.is_best_candidate(), self.fitness)
    }

    pub fn to_placements(&self) -> Vec<Placement> {
        self.chromosomes
            .iter()
            .flat_map(|ch| {
                ch.genes.iter().map(move |g| Placement {
                    sn: ch.sn,
                    teacher: g.teacher.clone(),
                    venue: g.venue.clone(),
                    slots: g.slots().collect(),
                    connected: g.is_connected(),
                })
            })
            .collect()
    }
}
