pub mod matrix;
pub mod rules;

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;

pub use types::{
    ClassSn, GaParams, Placement, ScheduleInput, SlotRef, SolveRequest, SolveResult, TeachingTask,
    TimeSlot, WeekGrid,
};

use matrix::{AdaptMatrix, ElementKey, PairRole};
use rules::build_catalog;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("invalid input: {0}")]
    Msg(String),
}

pub fn validate(inst: &ScheduleInput) -> Result<(), ValidationError> {
    let mut errors: Vec<String> = Vec::new();
    let grid = &inst.grid;

    if grid.workdays == 0 || grid.workdays > 7 {
        errors.push(format!("workdays must be 1..=7, got {}", grid.workdays));
    }
    if grid.periods_per_day() == 0 {
        errors.push("grid has zero periods per day".into());
    }

    fn chk_unique<I: ToString>(name: &str, ids: impl Iterator<Item = I>, errors: &mut Vec<String>) {
        let mut seen = HashSet::new();
        for id in ids {
            let s = id.to_string();
            if !seen.insert(s.clone()) {
                errors.push(format!("duplicate {name} id: {s}"));
            }
        }
    }
    chk_unique("subject", inst.subjects.iter().map(|x| x.id), &mut errors);
    chk_unique("teacher", inst.teachers.iter().map(|x| &x.id.0), &mut errors);
    chk_unique("venue", inst.venues.iter().map(|x| &x.id.0), &mut errors);
    chk_unique("task", inst.tasks.iter().map(|x| x.sn()), &mut errors);
    chk_unique(
        "venue binding",
        inst.venue_bindings.iter().map(|x| x.sn()),
        &mut errors,
    );

    let subjects: HashSet<u16> = inst.subjects.iter().map(|s| s.id.0).collect();
    let teachers: HashSet<&str> = inst.teachers.iter().map(|t| t.id.0.as_str()).collect();
    let venues: HashSet<&str> = inst.venues.iter().map(|v| v.id.0.as_str()).collect();
    let bindings: HashMap<ClassSn, &types::VenueBinding> =
        inst.venue_bindings.iter().map(|b| (b.sn(), b)).collect();
    let subject_groups: HashSet<&str> = inst
        .subjects
        .iter()
        .flat_map(|s| s.groups.iter().map(|g| g.0.as_str()))
        .collect();
    let teacher_groups: HashSet<&str> = inst
        .teachers
        .iter()
        .flat_map(|t| t.groups.iter().map(|g| g.0.as_str()))
        .collect();

    let total_slots = grid.total_slots();
    let mut hours_per_class: BTreeMap<(u16, u16), u32> = BTreeMap::new();

    for t in &inst.tasks {
        let sn = t.sn();
        if !subjects.contains(&t.subject.0) {
            errors.push(format!("task {sn} references missing subject {}", t.subject));
        }
        if t.teachers.is_empty() {
            errors.push(format!("task {sn} has no teachers"));
        }
        for teacher in &t.teachers {
            if !teachers.contains(teacher.0.as_str()) {
                errors.push(format!("task {sn} references missing teacher {teacher}"));
            }
        }
        if t.weekly_hours == 0 {
            errors.push(format!("task {sn} has weekly_hours=0"));
        }
        if t.weekly_hours as u16 > total_slots {
            errors.push(format!(
                "task {sn} requires {} hours but the week has {total_slots} slots",
                t.weekly_hours
            ));
        }
        if t.normal_hours() < 0 {
            errors.push(format!(
                "task {sn} has more double-period hours than weekly hours"
            ));
        }
        if t.weekly_hours > grid.workdays {
            let needed = t.weekly_hours - grid.workdays;
            if t.double_periods < needed {
                errors.push(format!(
                    "task {sn}: {} hours over {} days needs at least {needed} double period(s)",
                    t.weekly_hours, grid.workdays
                ));
            }
        }
        match bindings.get(&sn) {
            None => errors.push(format!("task {sn} has no venue binding")),
            Some(b) => {
                if b.venues.is_empty() {
                    errors.push(format!("task {sn} has an empty venue binding"));
                }
                for v in &b.venues {
                    if !venues.contains(v.0.as_str()) {
                        errors.push(format!("task {sn} references missing venue {v}"));
                    }
                }
            }
        }
        *hours_per_class.entry((t.grade.0, t.class.0)).or_default() += t.weekly_hours as u32;
    }

    for ((grade, class), hours) in &hours_per_class {
        if *hours > total_slots as u32 {
            errors.push(format!(
                "class {grade}/{class} requires {hours} hours but the week has {total_slots} slots"
            ));
        }
    }

    let mut chk_slot = |what: &str, r: &SlotRef| {
        if grid.resolve(*r).is_none() {
            errors.push(format!(
                "{what} references slot day {} period {} outside the grid",
                r.day, r.period
            ));
        }
    };
    for (i, r) in inst.rules.class_slots.iter().enumerate() {
        for s in &r.slots {
            chk_slot(&format!("class slot rule #{i}"), s);
        }
    }
    for (i, r) in inst.rules.subject_group_slots.iter().enumerate() {
        for s in &r.slots {
            chk_slot(&format!("subject group slot rule #{i}"), s);
        }
    }
    for (i, r) in inst.rules.teacher_group_slots.iter().enumerate() {
        for s in &r.slots {
            chk_slot(&format!("teacher group slot rule #{i}"), s);
        }
    }

    for (i, r) in inst.rules.class_slots.iter().enumerate() {
        if let Some(s) = r.subject {
            if !subjects.contains(&s.0) {
                errors.push(format!("class slot rule #{i} references missing subject {s}"));
            }
        }
        if let Some(t) = &r.teacher {
            if !teachers.contains(t.0.as_str()) {
                errors.push(format!("class slot rule #{i} references missing teacher {t}"));
            }
        }
    }
    for (i, r) in inst.rules.subject_group_slots.iter().enumerate() {
        if !subject_groups.contains(r.group.0.as_str()) {
            errors.push(format!(
                "subject group slot rule #{i} references unknown group {}",
                r.group
            ));
        }
    }
    for (i, r) in inst.rules.teacher_group_slots.iter().enumerate() {
        if !teacher_groups.contains(r.group.0.as_str()) {
            errors.push(format!(
                "teacher group slot rule #{i} references unknown group {}",
                r.group
            ));
        }
    }
    for (i, r) in inst.rules.subject_exclusions.iter().enumerate() {
        for s in [r.first, r.second] {
            if !subjects.contains(&s.0) {
                errors.push(format!(
                    "subject exclusion #{i} references missing subject {s}"
                ));
            }
        }
    }
    for (i, r) in inst.rules.subject_orders.iter().enumerate() {
        for s in [r.before, r.after] {
            if !subjects.contains(&s.0) {
                errors.push(format!("subject order #{i} references missing subject {s}"));
            }
        }
    }
    for (i, r) in inst.rules.period_caps.iter().enumerate() {
        if r.period >= grid.periods_per_day() {
            errors.push(format!(
                "period cap #{i} references period {} outside the day",
                r.period
            ));
        }
    }
    for (i, r) in inst.rules.teacher_loads.iter().enumerate() {
        if let Some(t) = &r.teacher {
            if !teachers.contains(t.0.as_str()) {
                errors.push(format!("teacher load #{i} references missing teacher {t}"));
            }
        }
        if let Some(g) = &r.group {
            if !teacher_groups.contains(g.0.as_str()) {
                errors.push(format!("teacher load #{i} references unknown group {g}"));
            }
        }
    }
    for (i, r) in inst.rules.teacher_exclusions.iter().enumerate() {
        for t in [&r.first, &r.second] {
            if !teachers.contains(t.0.as_str()) {
                errors.push(format!(
                    "teacher exclusion #{i} references missing teacher {t}"
                ));
            }
        }
    }
    for (i, r) in inst.rules.noon_breaks.iter().enumerate() {
        for t in &r.teachers {
            if !teachers.contains(t.0.as_str()) {
                errors.push(format!("noon break #{i} references missing teacher {t}"));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::Msg(errors.join("; ")))
    }
}

#[async_trait]
pub trait Solver: Send + Sync + 'static {
    async fn solve(&self, req: SolveRequest) -> anyhow::Result<SolveResult>;
}

/// Rule-level breakdown of one finished timetable.
#[derive(Clone, Debug, Default)]
pub struct Explanation {
    pub fitness: i64,
    pub feasible: bool,
    pub rule_passed: BTreeMap<String, u32>,
    pub rule_failed: BTreeMap<String, u32>,
}

/// Re-score a set of placements from scratch and aggregate which rules
/// rewarded or penalized them.
pub fn explain(input: &ScheduleInput, placements: &[Placement]) -> anyhow::Result<Explanation> {
    let rules = build_catalog(input)?;
    let mut m = AdaptMatrix::init(input)?;
    m.calc_fixed_scores(&rules)?;

    let key = |p: &Placement, slot: TimeSlot| ElementKey {
        sn: p.sn,
        teacher: p.teacher.clone(),
        venue: p.venue.clone(),
        slot,
    };
    for p in placements {
        match p.slots.as_slice() {
            [one] => m.mark_used(&key(p, *one), None)?,
            [a, b] => {
                m.mark_used(&key(p, *a), Some(PairRole::Head(*b)))?;
                m.mark_used(&key(p, *b), Some(PairRole::Tail(*a)))?;
            }
            _ => anyhow::bail!("placement for {} must carry one or two slots", p.sn),
        }
    }
    m.recalc_dynamic_scores(&rules)?;

    let (fitness, feasible) = m.fitness();
    let mut out = Explanation {
        fitness,
        feasible,
        ..Explanation::default()
    };
    for e in m.used_elements() {
        for name in e
            .score
            .fixed_trace
            .passed
            .iter()
            .chain(&e.score.dynamic_trace.passed)
        {
            *out.rule_passed.entry(name.clone()).or_default() += 1;
        }
        for name in e
            .score
            .fixed_trace
            .failed
            .iter()
            .chain(&e.score.dynamic_trace.failed)
        {
            *out.rule_failed.entry(name.clone()).or_default() += 1;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::{
        ClassId, GradeId, RuleBook, Subject, SubjectId, Teacher, TeacherId, Venue, VenueBinding,
        VenueId,
    };

    fn small_input() -> ScheduleInput {
        ScheduleInput {
            grid: WeekGrid {
                workdays: 5,
                morning_reading: 0,
                forenoon: 4,
                afternoon: 4,
                evening: 0,
            },
            subjects: vec![Subject {
                id: SubjectId(1),
                name: "maths".into(),
                groups: vec![],
            }],
            teachers: vec![Teacher {
                id: TeacherId("t1".into()),
                groups: vec![],
            }],
            venues: vec![Venue {
                id: VenueId("v1".into()),
                name: None,
            }],
            venue_bindings: vec![VenueBinding {
                subject: SubjectId(1),
                grade: GradeId(1),
                class: ClassId(1),
                venues: vec![VenueId("v1".into())],
            }],
            tasks: vec![TeachingTask {
                subject: SubjectId(1),
                grade: GradeId(1),
                class: ClassId(1),
                teachers: vec![TeacherId("t1".into())],
                weekly_hours: 4,
                double_periods: 0,
            }],
            rules: RuleBook::default(),
        }
    }

    #[test]
    fn accepts_consistent_input() {
        assert!(validate(&small_input()).is_ok());
    }

    #[test]
    fn rejects_missing_references() {
        let mut input = small_input();
        input.tasks[0].teachers = vec![TeacherId("ghost".into())];
        input.venue_bindings.clear();
        let ValidationError::Msg(msg) = validate(&input).unwrap_err();
        assert!(msg.contains("missing teacher ghost"));
        assert!(msg.contains("no venue binding"));
    }

    #[test]
    fn rejects_undersized_double_period_budget() {
        let mut input = small_input();
        input.tasks[0].weekly_hours = 7;
        input.tasks[0].double_periods = 1;
        let ValidationError::Msg(msg) = validate(&input).unwrap_err();
        assert!(msg.contains("needs at least 2 double period"));
    }

    #[test]
    fn explain_reports_failed_rules() {
        let mut input = small_input();
        input.rules.class_slots.push(types::ClassSlotRule {
            grade: None,
            class: None,
            subject: Some(SubjectId(1)),
            teacher: None,
            slots: vec![SlotRef { day: 0, period: 0 }],
            policy: types::SlotPolicy::Forbid,
            hard: false,
            params: Default::default(),
        });
        let placements = vec![Placement {
            sn: "1_1_1".parse().unwrap(),
            teacher: TeacherId("t1".into()),
            venue: VenueId("v1".into()),
            slots: vec![TimeSlot(0)],
            connected: false,
        }];
        let ex = explain(&input, &placements).unwrap();
        assert!(ex.feasible);
        assert_eq!(ex.rule_failed.get("class_forbid_slot#0"), Some(&1));
        assert!(ex.fitness < 0);
    }
}
