//! The class-adaptability matrix: every legal (class unit, teacher, venue,
//! slot) candidate point, its score state, and the greedy allocator that
//! turns an empty matrix into one feasible timetable.

use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;
use tracing::debug;
use types::{
    ClassId, ClassSn, GradeId, LoadSection, ScheduleInput, TeacherId, TeachingTask, TimeSlot,
    VenueBinding, VenueId, WeekGrid,
};

use crate::rules::{EvalCtx, Outcome, Rule, RuleError, RuleKind};

#[derive(Debug, Error)]
pub enum MatrixError {
    #[error("class unit {sn} has no eligible teachers")]
    NoTeachers { sn: ClassSn },
    #[error("class unit {sn} has no eligible venues")]
    NoVenues { sn: ClassSn },
    #[error("unknown element {sn} teacher={teacher} venue={venue} slot={slot}")]
    UnknownElement {
        sn: ClassSn,
        teacher: TeacherId,
        venue: VenueId,
        slot: TimeSlot,
    },
}

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("no feasible candidate for class unit {sn}; {remaining} hour(s) unassigned")]
    Exhausted { sn: ClassSn, remaining: u8 },
    #[error(transparent)]
    Rule(#[from] RuleError),
    #[error(transparent)]
    Matrix(#[from] MatrixError),
}

#[derive(Clone, Debug, Default)]
pub struct RuleTrace {
    pub passed: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
}

/// Score state of one element. Fixed and dynamic parts are kept apart so the
/// dynamic side can be wiped and recomputed without touching the fixed side.
/// A hard-rule violation raises an infeasible flag instead of a numeric
/// penalty, so no sentinel constant ever enters the arithmetic.
#[derive(Clone, Debug, Default)]
pub struct ScoreInfo {
    pub fixed: i64,
    pub dynamic: i64,
    pub fixed_infeasible: bool,
    pub dynamic_infeasible: bool,
    pub fixed_trace: RuleTrace,
    pub dynamic_trace: RuleTrace,
}

impl ScoreInfo {
    pub fn score(&self) -> i64 {
        self.fixed + self.dynamic
    }

    pub fn is_feasible(&self) -> bool {
        !self.fixed_infeasible && !self.dynamic_infeasible
    }
}

/// Linkage between the two halves of a connected lesson.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PairRole {
    Head(TimeSlot),
    Tail(TimeSlot),
}

#[derive(Clone, Debug)]
pub struct Element {
    pub sn: ClassSn,
    pub teacher: TeacherId,
    pub venue: VenueId,
    pub slot: TimeSlot,
    pub used: bool,
    pub pair: Option<PairRole>,
    pub score: ScoreInfo,
}

impl Element {
    fn new(sn: ClassSn, teacher: TeacherId, venue: VenueId, slot: TimeSlot) -> Self {
        Self {
            sn,
            teacher,
            venue,
            slot,
            used: false,
            pair: None,
            score: ScoreInfo::default(),
        }
    }

    pub fn pair_partner(&self) -> Option<TimeSlot> {
        match self.pair {
            Some(PairRole::Head(t)) | Some(PairRole::Tail(t)) => Some(t),
            None => None,
        }
    }

    pub fn key(&self) -> ElementKey {
        ElementKey {
            sn: self.sn,
            teacher: self.teacher.clone(),
            venue: self.venue.clone(),
            slot: self.slot,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ElementKey {
    pub sn: ClassSn,
    pub teacher: TeacherId,
    pub venue: VenueId,
    pub slot: TimeSlot,
}

/// Used-pattern of a matrix, rebuilt before every dynamic re-score and read
/// by the dynamic rules.
#[derive(Clone, Debug, Default)]
pub struct OccupancyView {
    teacher_slots: HashMap<TeacherId, HashSet<TimeSlot>>,
    class_day: HashMap<(GradeId, ClassId, u8), Vec<DayEntry>>,
}

#[derive(Clone, Debug)]
pub struct DayEntry {
    pub subject: types::SubjectId,
    pub slot: TimeSlot,
    pub pair_with: Option<TimeSlot>,
}

impl OccupancyView {
    pub fn class_day_entries(&self, grade: GradeId, class: ClassId, day: u8) -> &[DayEntry] {
        self.class_day
            .get(&(grade, class, day))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn teacher_busy_at(&self, teacher: &TeacherId, slot: TimeSlot) -> bool {
        self.teacher_slots
            .get(teacher)
            .map_or(false, |s| s.contains(&slot))
    }

    pub fn teacher_active_on(&self, grid: &WeekGrid, teacher: &TeacherId, day: u8) -> bool {
        self.teacher_slots
            .get(teacher)
            .map_or(false, |s| s.iter().any(|t| grid.day_of(*t) == day))
    }

    /// Occurrences of `sn`'s subject for its class at lesson number `period`
    /// across the whole week, excluding `exclude`.
    pub fn subject_period_uses(
        &self,
        grid: &WeekGrid,
        sn: ClassSn,
        period: u8,
        exclude: TimeSlot,
    ) -> u32 {
        self.class_day
            .iter()
            .filter(|((g, c, _), _)| *g == sn.grade && *c == sn.class)
            .flat_map(|(_, entries)| entries.iter())
            .filter(|x| {
                x.subject == sn.subject && x.slot != exclude && grid.period_of(x.slot) == period
            })
            .count() as u32
    }

    /// Slots the teacher already holds on `day` within `section`, excluding
    /// `exclude`.
    pub fn teacher_day_count(
        &self,
        grid: &WeekGrid,
        teacher: &TeacherId,
        day: u8,
        section: LoadSection,
        exclude: TimeSlot,
    ) -> u32 {
        let in_section = |t: TimeSlot| match section {
            LoadSection::WholeDay => true,
            LoadSection::Forenoon => grid.section_of(t) == types::DaySection::Forenoon,
            LoadSection::Afternoon => grid.section_of(t) == types::DaySection::Afternoon,
            LoadSection::Evening => grid.section_of(t) == types::DaySection::Evening,
        };
        self.teacher_slots.get(teacher).map_or(0, |s| {
            s.iter()
                .filter(|t| grid.day_of(**t) == day && **t != exclude && in_section(**t))
                .count() as u32
        })
    }
}

pub struct AllocationReport {
    pub assigned_hours: u32,
}

/// ClassSn → teacher → venue → slot, flattened to one composite-keyed map.
/// Elements are owned exclusively by the matrix; candidate enumeration per
/// class unit keeps a stable order so seeded runs reproduce.
pub struct AdaptMatrix {
    grid: WeekGrid,
    tasks: BTreeMap<ClassSn, TeachingTask>,
    elements: HashMap<ElementKey, Element>,
    by_sn: BTreeMap<ClassSn, Vec<ElementKey>>,
}

impl AdaptMatrix {
    pub fn init(input: &ScheduleInput) -> Result<Self, MatrixError> {
        let bindings: HashMap<ClassSn, &VenueBinding> = input
            .venue_bindings
            .iter()
            .map(|b| (b.sn(), b))
            .collect();

        let mut elements = HashMap::new();
        let mut by_sn = BTreeMap::new();
        let mut tasks = BTreeMap::new();

        for task in &input.tasks {
            let sn = task.sn();
            if task.teachers.is_empty() {
                return Err(MatrixError::NoTeachers { sn });
            }
            let venues: &[VenueId] = bindings
                .get(&sn)
                .map(|b| b.venues.as_slice())
                .unwrap_or(&[]);
            if venues.is_empty() {
                return Err(MatrixError::NoVenues { sn });
            }
            let mut keys =
                Vec::with_capacity(task.teachers.len() * venues.len() * input.grid.total_slots() as usize);
            for teacher in &task.teachers {
                for venue in venues {
                    for slot in input.grid.slots() {
                        let key = ElementKey {
                            sn,
                            teacher: teacher.clone(),
                            venue: venue.clone(),
                            slot,
                        };
                        elements.insert(
                            key.clone(),
                            Element::new(sn, teacher.clone(), venue.clone(), slot),
                        );
                        keys.push(key);
                    }
                }
            }
            by_sn.insert(sn, keys);
            tasks.insert(sn, task.clone());
        }

        Ok(Self {
            grid: input.grid,
            tasks,
            elements,
            by_sn,
        })
    }

    pub fn grid(&self) -> &WeekGrid {
        &self.grid
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn sns(&self) -> impl Iterator<Item = &ClassSn> {
        self.by_sn.keys()
    }

    pub fn task(&self, sn: &ClassSn) -> Option<&TeachingTask> {
        self.tasks.get(sn)
    }

    pub fn keys_for(&self, sn: &ClassSn) -> &[ElementKey] {
        self.by_sn.get(sn).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn element(&self, key: &ElementKey) -> Option<&Element> {
        self.elements.get(key)
    }

    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.elements.values()
    }

    pub fn used_elements(&self) -> impl Iterator<Item = &Element> {
        self.elements.values().filter(|e| e.used)
    }

    pub fn mark_used(&mut self, key: &ElementKey, pair: Option<PairRole>) -> Result<(), MatrixError> {
        let e = self
            .elements
            .get_mut(key)
            .ok_or_else(|| MatrixError::UnknownElement {
                sn: key.sn,
                teacher: key.teacher.clone(),
                venue: key.venue.clone(),
                slot: key.slot,
            })?;
        e.used = true;
        e.pair = pair;
        Ok(())
    }

    /// Fixed rules read no occupancy, so the score each element gets here is
    /// independent of any later allocation order.
    pub fn calc_fixed_scores(&mut self, rules: &[Rule]) -> Result<(), RuleError> {
        let grid = self.grid;
        let occ = OccupancyView::default();
        let ctx = EvalCtx {
            grid: &grid,
            occ: &occ,
        };
        for e in self.elements.values_mut() {
            e.score.fixed = 0;
            e.score.fixed_infeasible = false;
            e.score.fixed_trace = RuleTrace::default();
            for r in rules.iter().filter(|r| r.kind == RuleKind::Fixed) {
                match r.evaluate(&ctx, e)? {
                    Outcome::Rewarded => {
                        e.score.fixed += r.score * r.weight;
                        e.score.fixed_trace.passed.push(r.name.clone());
                    }
                    Outcome::Violated => {
                        e.score.fixed_trace.failed.push(r.name.clone());
                        if r.hard {
                            e.score.fixed_infeasible = true;
                        } else {
                            e.score.fixed -= r.penalty * r.weight;
                        }
                    }
                    Outcome::Neutral | Outcome::Skipped => {
                        e.score.fixed_trace.skipped.push(r.name.clone());
                    }
                }
            }
        }
        Ok(())
    }

    pub fn occupancy(&self) -> OccupancyView {
        let mut v = OccupancyView::default();
        for e in self.elements.values().filter(|e| e.used) {
            v.teacher_slots
                .entry(e.teacher.clone())
                .or_default()
                .insert(e.slot);
            let day = self.grid.day_of(e.slot);
            v.class_day
                .entry((e.sn.grade, e.sn.class, day))
                .or_default()
                .push(DayEntry {
                    subject: e.sn.subject,
                    slot: e.slot,
                    pair_with: e.pair_partner(),
                });
        }
        v
    }

    /// Dynamic rules read the whole used pattern; this must run after every
    /// change to it, or scores are stale.
    pub fn recalc_dynamic_scores(&mut self, rules: &[Rule]) -> Result<(), RuleError> {
        let grid = self.grid;
        let occ = self.occupancy();
        let ctx = EvalCtx {
            grid: &grid,
            occ: &occ,
        };
        for e in self.elements.values_mut() {
            e.score.dynamic = 0;
            e.score.dynamic_infeasible = false;
            e.score.dynamic_trace = RuleTrace::default();
            for r in rules.iter().filter(|r| r.kind == RuleKind::Dynamic) {
                match r.evaluate(&ctx, e)? {
                    Outcome::Rewarded => {
                        e.score.dynamic += r.score * r.weight;
                        e.score.dynamic_trace.passed.push(r.name.clone());
                    }
                    Outcome::Violated => {
                        e.score.dynamic_trace.failed.push(r.name.clone());
                        if r.hard {
                            e.score.dynamic_infeasible = true;
                        } else {
                            e.score.dynamic -= r.penalty * r.weight;
                        }
                    }
                    Outcome::Neutral | Outcome::Skipped => {
                        e.score.dynamic_trace.skipped.push(r.name.clone());
                    }
                }
            }
        }
        Ok(())
    }

    /// Sum of used element scores, plus whether every used element passed all
    /// hard rules.
    pub fn fitness(&self) -> (i64, bool) {
        let mut total = 0i64;
        let mut feasible = true;
        for e in self.elements.values().filter(|e| e.used) {
            total += e.score.score();
            feasible &= e.score.is_feasible();
        }
        (total, feasible)
    }

    /// Assign every required lesson-hour of every class unit in `order`.
    /// Greedy on the current score; falls back to a uniform draw among
    /// zero-scored candidates rather than forcing a negative-score pick.
    pub fn allocate<R: Rng>(
        &mut self,
        order: &[ClassSn],
        rules: &[Rule],
        rng: &mut R,
    ) -> Result<AllocationReport, AllocError> {
        let mut class_used: HashSet<(GradeId, ClassId, TimeSlot)> = HashSet::new();
        let mut teacher_used: HashSet<(TeacherId, TimeSlot)> = HashSet::new();
        let mut venue_used: HashSet<(VenueId, TimeSlot)> = HashSet::new();
        let mut assigned = 0u32;

        for sn in order {
            let Some(task) = self.tasks.get(sn).cloned() else {
                continue;
            };
            let mut remaining = task.weekly_hours;

            for _ in 0..task.double_periods {
                let (head, tail) = self
                    .pick_pair(sn, &class_used, &teacher_used, &venue_used, rng)
                    .ok_or(AllocError::Exhausted {
                        sn: *sn,
                        remaining,
                    })?;
                self.mark_used(&head, Some(PairRole::Head(tail.slot)))?;
                self.mark_used(&tail, Some(PairRole::Tail(head.slot)))?;
                for k in [&head, &tail] {
                    class_used.insert((sn.grade, sn.class, k.slot));
                    teacher_used.insert((k.teacher.clone(), k.slot));
                    venue_used.insert((k.venue.clone(), k.slot));
                }
                remaining -= 2;
                assigned += 2;
                self.recalc_dynamic_scores(rules)?;
            }

            while remaining > 0 {
                let key = self
                    .pick_single(sn, &class_used, &teacher_used, &venue_used, rng)
                    .ok_or(AllocError::Exhausted {
                        sn: *sn,
                        remaining,
                    })?;
                self.mark_used(&key, None)?;
                class_used.insert((sn.grade, sn.class, key.slot));
                teacher_used.insert((key.teacher.clone(), key.slot));
                venue_used.insert((key.venue.clone(), key.slot));
                remaining -= 1;
                assigned += 1;
                self.recalc_dynamic_scores(rules)?;
            }
            debug!(%sn, hours = task.weekly_hours, "class unit allocated");
        }

        Ok(AllocationReport {
            assigned_hours: assigned,
        })
    }

    fn candidate_free(
        &self,
        e: &Element,
        class_used: &HashSet<(GradeId, ClassId, TimeSlot)>,
        teacher_used: &HashSet<(TeacherId, TimeSlot)>,
        venue_used: &HashSet<(VenueId, TimeSlot)>,
    ) -> bool {
        !e.used
            && e.score.is_feasible()
            && !class_used.contains(&(e.sn.grade, e.sn.class, e.slot))
            && !teacher_used.contains(&(e.teacher.clone(), e.slot))
            && !venue_used.contains(&(e.venue.clone(), e.slot))
    }

    fn pick_single<R: Rng>(
        &self,
        sn: &ClassSn,
        class_used: &HashSet<(GradeId, ClassId, TimeSlot)>,
        teacher_used: &HashSet<(TeacherId, TimeSlot)>,
        venue_used: &HashSet<(VenueId, TimeSlot)>,
        rng: &mut R,
    ) -> Option<ElementKey> {
        let keys = self.by_sn.get(sn)?;
        let mut best: Option<(&ElementKey, i64)> = None;
        let mut zeros: Vec<&ElementKey> = Vec::new();
        for k in keys {
            let e = &self.elements[k];
            if !self.candidate_free(e, class_used, teacher_used, venue_used) {
                continue;
            }
            let s = e.score.score();
            if s == 0 {
                zeros.push(k);
            }
            if best.map_or(true, |(_, bs)| s > bs) {
                best = Some((k, s));
            }
        }
        let (bk, bs) = best?;
        if bs > 0 {
            Some(bk.clone())
        } else if !zeros.is_empty() {
            Some(zeros[rng.gen_range(0..zeros.len())].clone())
        } else {
            // only negative-scoring candidates remain
            None
        }
    }

    fn pick_pair<R: Rng>(
        &self,
        sn: &ClassSn,
        class_used: &HashSet<(GradeId, ClassId, TimeSlot)>,
        teacher_used: &HashSet<(TeacherId, TimeSlot)>,
        venue_used: &HashSet<(VenueId, TimeSlot)>,
        rng: &mut R,
    ) -> Option<(ElementKey, ElementKey)> {
        let keys = self.by_sn.get(sn)?;
        let mut best: Option<(&ElementKey, ElementKey, i64)> = None;
        let mut zeros: Vec<(&ElementKey, ElementKey)> = Vec::new();
        for k1 in keys {
            let e1 = &self.elements[k1];
            let second = TimeSlot(e1.slot.0 + 1);
            if !self.grid.is_section_pair(e1.slot, second) {
                continue;
            }
            let k2 = ElementKey {
                sn: *sn,
                teacher: e1.teacher.clone(),
                venue: e1.venue.clone(),
                slot: second,
            };
            let Some(e2) = self.elements.get(&k2) else {
                continue;
            };
            if !self.candidate_free(e1, class_used, teacher_used, venue_used)
                || !self.candidate_free(e2, class_used, teacher_used, venue_used)
            {
                continue;
            }
            let s = e1.score.score() + e2.score.score();
            if s == 0 {
                zeros.push((k1, k2.clone()));
            }
            if best.as_ref().map_or(true, |(_, _, bs)| s > *bs) {
                best = Some((k1, k2, s));
            }
        }
        let (bk1, bk2, bs) = best?;
        if bs > 0 {
            Some((bk1.clone(), bk2))
        } else if !zeros.is_empty() {
            let (k1, k2) = zeros.swap_remove(rng.gen_range(0..zeros.len()));
            Some((k1.clone(), k2))
        } else {
            None
        }
    }
}
