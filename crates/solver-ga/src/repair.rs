//! Post-operator conflict resolver. Crossover and mutation validate only the
//! new gene's own score; cross-chromosome double bookings are cleaned up here.

use std::collections::HashSet;
use types::{ClassId, ClassSn, GradeId, TeacherId, TimeSlot, VenueId, WeekGrid};

use crate::genome::{Gene, Individual};

#[derive(Clone, Copy, Debug, Default)]
pub struct RepairReport {
    pub moved: u32,
    pub unresolved: u32,
}

#[derive(Default)]
struct Occupancy {
    class: HashSet<(GradeId, ClassId, TimeSlot)>,
    teacher: HashSet<(TeacherId, TimeSlot)>,
    venue: HashSet<(VenueId, TimeSlot)>,
}

impl Occupancy {
    fn slot_free(&self, sn: ClassSn, gene: &Gene, slot: TimeSlot) -> bool {
        !self.class.contains(&(sn.grade, sn.class, slot))
            && !self.teacher.contains(&(gene.teacher.clone(), slot))
            && !self.venue.contains(&(gene.venue.clone(), slot))
    }

    fn conflicts(&self, sn: ClassSn, gene: &Gene) -> bool {
        gene.slots().any(|t| !self.slot_free(sn, gene, t))
    }

    fn insert(&mut self, sn: ClassSn, gene: &Gene) {
        for t in gene.slots() {
            self.class.insert((sn.grade, sn.class, t));
            self.teacher.insert((gene.teacher.clone(), t));
            self.venue.insert((gene.venue.clone(), t));
        }
    }
}

/// Detects collisions keyed by (grade, class), teacher and venue; the loser
/// of each collision is the later gene in (chromosome index, gene index)
/// order. Connected genes are registered first and always move as a whole
/// contiguous same-section pair. Gene count is never changed; a gene with no
/// free slot left is counted as unresolved.
pub fn resolve_conflicts(ind: &mut Individual, grid: &WeekGrid) -> RepairReport {
    let mut occ = Occupancy::default();
    let mut losers: Vec<(usize, usize)> = Vec::new();

    for connected in [true, false] {
        for (ci, ch) in ind.chromosomes.iter().enumerate() {
            for (gi, g) in ch
                .genes
                .iter()
                .enumerate()
                .filter(|(_, g)| g.is_connected() == connected)
            {
                if occ.conflicts(ch.sn, g) {
                    losers.push((ci, gi));
                } else {
                    occ.insert(ch.sn, g);
                }
            }
        }
    }

    let mut report = RepairReport::default();
    for (ci, gi) in losers {
        let sn = ind.chromosomes[ci].sn;
        let gene = ind.chromosomes[ci].genes[gi].clone();
        let mut placed = false;

        if gene.is_connected() {
            for s in grid.slots() {
                let s2 = TimeSlot(s.0 + 1);
                if !grid.is_section_pair(s, s2) {
                    continue;
                }
                if occ.slot_free(sn, &gene, s) && occ.slot_free(sn, &gene, s2) {
                    let g = &mut ind.chromosomes[ci].genes[gi];
                    g.first = s;
                    g.second = Some(s2);
                    let g = ind.chromosomes[ci].genes[gi].clone();
                    occ.insert(sn, &g);
                    placed = true;
                    break;
                }
            }
        } else {
            for s in grid.slots() {
                if occ.slot_free(sn, &gene, s) {
                    let g = &mut ind.chromosomes[ci].genes[gi];
                    g.first = s;
                    let g = ind.chromosomes[ci].genes[gi].clone();
                    occ.insert(sn, &g);
                    placed = true;
                    break;
                }
            }
        }

        if placed {
            report.moved += 1;
        } else {
            report.unresolved += 1;
        }
    }

    ind.unresolved = report.unresolved;
    report
}

/// Collision count over all genes of an individual.
pub fn count_collisions(ind: &Individual) -> u32 {
    let mut occ = Occupancy::default();
    let mut collisions = 0u32;
    for ch in &ind.chromosomes {
        for g in &ch.genes {
            if occ.conflicts(ch.sn, g) {
                collisions += 1;
            } else {
                occ.insert(ch.sn, g);
            }
        }
    }
    collisions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genome::Chromosome;

    fn gene(teacher: &str, venue: &str, first: u16, second: Option<u16>) -> Gene {
        Gene {
            teacher: TeacherId(teacher.to_string()),
            venue: VenueId(venue.to_string()),
            first: TimeSlot(first),
            second: second.map(TimeSlot),
        }
    }

    fn grid() -> WeekGrid {
        WeekGrid {
            workdays: 5,
            morning_reading: 0,
            forenoon: 4,
            afternoon: 4,
            evening: 0,
        }
    }

    fn individual(chromosomes: Vec<Chromosome>) -> Individual {
        Individual {
            chromosomes,
            fitness: 0,
            feasible: true,
            unresolved: 0,
        }
    }

    #[test]
    fn moves_teacher_collision_to_free_slot() {
        // two class units share a teacher at slot 0
        let mut ind = individual(vec![
            Chromosome {
                sn: "1_1_1".parse().unwrap(),
                genes: vec![gene("t1", "v1", 0, None)],
            },
            Chromosome {
                sn: "2_1_2".parse().unwrap(),
                genes: vec![gene("t1", "v2", 0, None)],
            },
        ]);
        let before = ind.gene_count();
        let report = resolve_conflicts(&mut ind, &grid());
        assert_eq!(report.moved, 1);
        assert_eq!(report.unresolved, 0);
        assert_eq!(ind.gene_count(), before);
        assert_eq!(count_collisions(&ind), 0);
        // the first-registered gene kept its slot
        assert_eq!(ind.chromosomes[0].genes[0].first, TimeSlot(0));
        assert_ne!(ind.chromosomes[1].genes[0].first, TimeSlot(0));
    }

    #[test]
    fn connected_gene_moves_as_a_pair() {
        // class collision: both chromosomes belong to grade 1 class 1
        let mut ind = individual(vec![
            Chromosome {
                sn: "1_1_1".parse().unwrap(),
                genes: vec![gene("t1", "v1", 0, Some(1))],
            },
            Chromosome {
                sn: "2_1_1".parse().unwrap(),
                genes: vec![gene("t2", "v2", 1, Some(2))],
            },
        ]);
        let report = resolve_conflicts(&mut ind, &grid());
        assert_eq!(report.unresolved, 0);
        assert_eq!(count_collisions(&ind), 0);
        let moved = &ind.chromosomes[1].genes[0];
        let second = moved.second.expect("still connected");
        assert!(grid().is_section_pair(moved.first, second));
    }

    #[test]
    fn reports_unresolved_when_no_slot_remains() {
        let tiny = WeekGrid {
            workdays: 1,
            morning_reading: 0,
            forenoon: 1,
            afternoon: 0,
            evening: 0,
        };
        let mut ind = individual(vec![
            Chromosome {
                sn: "1_1_1".parse().unwrap(),
                genes: vec![gene("t1", "v1", 0, None)],
            },
            Chromosome {
                sn: "2_1_1".parse().unwrap(),
                genes: vec![gene("t2", "v2", 0, None)],
            },
        ]);
        let before = ind.gene_count();
        let report = resolve_conflicts(&mut ind, &tiny);
        assert_eq!(report.unresolved, 1);
        assert_eq!(ind.unresolved, 1);
        assert_eq!(ind.gene_count(), before);
    }
}
