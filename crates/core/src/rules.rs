//! The constraint catalog. Tables from the input are compiled into a flat
//! list of [`Rule`]s; each rule is a pure function of the grid, the current
//! occupancy and one candidate element.

use std::collections::{HashMap, HashSet};
use thiserror::Error;
use types::{
    ClassId, DaySection, GradeId, LoadSection, ScheduleInput, SlotPolicy, SlotRef, SubjectGroupId,
    SubjectId, TeacherGroupId, TeacherId, TimeSlot, WeekGrid,
};

use crate::matrix::{Element, OccupancyView};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuleKind {
    /// Depends only on structural facts; evaluated once per element.
    Fixed,
    /// Reads the used pattern of the whole matrix; re-evaluated on every
    /// occupancy change.
    Dynamic,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Precheck failed: the rule does not concern this element.
    Skipped,
    Rewarded,
    /// Applicable, but neither rewarded nor penalized.
    Neutral,
    Violated,
}

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("rule `{rule}` references slot day {day} period {period} outside the grid")]
    BadSlot { rule: String, day: u8, period: u8 },
    #[error("rule `{rule}` references unknown group `{group}`")]
    UnknownGroup { rule: String, group: String },
    #[error("rule `{rule}` evaluated against slot {slot} outside the grid")]
    SlotOutOfGrid { rule: String, slot: TimeSlot },
}

#[derive(Clone, Debug, Default)]
pub struct Scope {
    pub grade: Option<GradeId>,
    pub class: Option<ClassId>,
    pub subjects: Option<HashSet<SubjectId>>,
    pub teachers: Option<HashSet<TeacherId>>,
}

impl Scope {
    fn matches(&self, e: &Element) -> bool {
        self.grade.map_or(true, |g| e.sn.grade == g)
            && self.class.map_or(true, |c| e.sn.class == c)
            && self
                .subjects
                .as_ref()
                .map_or(true, |s| s.contains(&e.sn.subject))
            && self
                .teachers
                .as_ref()
                .map_or(true, |t| t.contains(&e.teacher))
    }
}

#[derive(Clone, Debug)]
enum RuleBody {
    SlotList {
        scope: Scope,
        slots: HashSet<TimeSlot>,
        policy: SlotPolicy,
    },
    SubjectExclusion {
        first: SubjectId,
        second: SubjectId,
    },
    SubjectOrder {
        before: SubjectId,
        after: SubjectId,
    },
    DayRepeat,
    PeriodCap {
        subject: Option<SubjectId>,
        period: u8,
        max_per_week: u8,
    },
    TeacherLoad {
        teachers: Option<HashSet<TeacherId>>,
        section: LoadSection,
        max_per_day: u8,
    },
    TeacherExclusion {
        first: TeacherId,
        second: TeacherId,
    },
    NoonBreak {
        teachers: Option<HashSet<TeacherId>>,
    },
}

#[derive(Clone, Debug)]
pub struct Rule {
    pub name: String,
    pub kind: RuleKind,
    pub hard: bool,
    pub score: i64,
    pub penalty: i64,
    pub weight: i64,
    pub priority: u8,
    body: RuleBody,
}

pub struct EvalCtx<'a> {
    pub grid: &'a WeekGrid,
    pub occ: &'a OccupancyView,
}

fn slot_in_section(grid: &WeekGrid, slot: TimeSlot, section: LoadSection) -> bool {
    match section {
        LoadSection::WholeDay => true,
        LoadSection::Forenoon => grid.section_of(slot) == DaySection::Forenoon,
        LoadSection::Afternoon => grid.section_of(slot) == DaySection::Afternoon,
        LoadSection::Evening => grid.section_of(slot) == DaySection::Evening,
    }
}

impl Rule {
    pub fn evaluate(&self, ctx: &EvalCtx<'_>, e: &Element) -> Result<Outcome, RuleError> {
        if !ctx.grid.contains(e.slot) {
            return Err(RuleError::SlotOutOfGrid {
                rule: self.name.clone(),
                slot: e.slot,
            });
        }
        let day = ctx.grid.day_of(e.slot);
        let out = match &self.body {
            RuleBody::SlotList {
                scope,
                slots,
                policy,
            } => {
                if !scope.matches(e) {
                    Outcome::Skipped
                } else {
                    let hit = slots.contains(&e.slot);
                    match policy {
                        SlotPolicy::Require | SlotPolicy::Prefer => {
                            if hit {
                                Outcome::Rewarded
                            } else {
                                Outcome::Neutral
                            }
                        }
                        SlotPolicy::Forbid => {
                            if hit {
                                Outcome::Violated
                            } else {
                                Outcome::Neutral
                            }
                        }
                    }
                }
            }
            RuleBody::SubjectExclusion { first, second } => {
                let own = e.sn.subject;
                if own != *first && own != *second {
                    Outcome::Skipped
                } else {
                    let other = if own == *first { *second } else { *first };
                    let hit = ctx
                        .occ
                        .class_day_entries(e.sn.grade, e.sn.class, day)
                        .iter()
                        .any(|x| x.subject == other);
                    if hit {
                        Outcome::Violated
                    } else {
                        Outcome::Neutral
                    }
                }
            }
            RuleBody::SubjectOrder { before, after } => {
                let own = e.sn.subject;
                if own != *before && own != *after {
                    Outcome::Skipped
                } else {
                    let entries = ctx.occ.class_day_entries(e.sn.grade, e.sn.class, day);
                    let mut violated = false;
                    if own == *after && e.slot.0 > 0 {
                        let prev = TimeSlot(e.slot.0 - 1);
                        if ctx.grid.day_of(prev) == day {
                            violated |= entries.iter().any(|x| x.subject == *before && x.slot == prev);
                        }
                    }
                    if own == *before {
                        let next = TimeSlot(e.slot.0 + 1);
                        if ctx.grid.contains(next) && ctx.grid.day_of(next) == day {
                            violated |= entries.iter().any(|x| x.subject == *after && x.slot == next);
                        }
                    }
                    if violated {
                        Outcome::Violated
                    } else {
                        Outcome::Neutral
                    }
                }
            }
            RuleBody::DayRepeat => {
                let partner = e.pair_partner();
                let hit = ctx
                    .occ
                    .class_day_entries(e.sn.grade, e.sn.class, day)
                    .iter()
                    .any(|x| x.subject == e.sn.subject && x.slot != e.slot && Some(x.slot) != partner);
                if hit {
                    Outcome::Violated
                } else {
                    Outcome::Neutral
                }
            }
            RuleBody::PeriodCap {
                subject,
                period,
                max_per_week,
            } => {
                if subject.map_or(false, |s| e.sn.subject != s) {
                    Outcome::Skipped
                } else if ctx.grid.period_of(e.slot) != *period {
                    Outcome::Skipped
                } else {
                    let uses = ctx.occ.subject_period_uses(ctx.grid, e.sn, *period, e.slot);
                    if uses + 1 > *max_per_week as u32 {
                        Outcome::Violated
                    } else {
                        Outcome::Neutral
                    }
                }
            }
            RuleBody::TeacherLoad {
                teachers,
                section,
                max_per_day,
            } => {
                if teachers.as_ref().map_or(false, |s| !s.contains(&e.teacher)) {
                    Outcome::Skipped
                } else if !slot_in_section(ctx.grid, e.slot, *section) {
                    Outcome::Skipped
                } else {
                    let count =
                        ctx.occ
                            .teacher_day_count(ctx.grid, &e.teacher, day, *section, e.slot);
                    if count + 1 > *max_per_day as u32 {
                        Outcome::Violated
                    } else {
                        Outcome::Neutral
                    }
                }
            }
            RuleBody::TeacherExclusion { first, second } => {
                if e.teacher != *first && e.teacher != *second {
                    Outcome::Skipped
                } else {
                    let other = if e.teacher == *first { second } else { first };
                    if ctx.occ.teacher_active_on(ctx.grid, other, day) {
                        Outcome::Violated
                    } else {
                        Outcome::Neutral
                    }
                }
            }
            RuleBody::NoonBreak { teachers } => {
                if teachers.as_ref().map_or(false, |s| !s.contains(&e.teacher)) {
                    Outcome::Skipped
                } else {
                    match (
                        ctx.grid.last_forenoon_period(),
                        ctx.grid.first_afternoon_period(),
                    ) {
                        (Some(lf), Some(fa)) => {
                            let period = ctx.grid.period_of(e.slot);
                            let opposite = if period == lf {
                                Some(fa)
                            } else if period == fa {
                                Some(lf)
                            } else {
                                None
                            };
                            match opposite {
                                Some(p) => {
                                    let other_slot = ctx.grid.slot(day, p);
                                    if ctx.occ.teacher_busy_at(&e.teacher, other_slot)
                                        && other_slot != e.slot
                                    {
                                        Outcome::Violated
                                    } else {
                                        Outcome::Neutral
                                    }
                                }
                                None => Outcome::Skipped,
                            }
                        }
                        _ => Outcome::Skipped,
                    }
                }
            }
        };
        Ok(out)
    }
}

fn resolve_slots(
    grid: &WeekGrid,
    rule: &str,
    refs: &[SlotRef],
) -> Result<HashSet<TimeSlot>, RuleError> {
    let mut out = HashSet::with_capacity(refs.len());
    for r in refs {
        let slot = grid.resolve(*r).ok_or_else(|| RuleError::BadSlot {
            rule: rule.to_string(),
            day: r.day,
            period: r.period,
        })?;
        out.insert(slot);
    }
    Ok(out)
}

fn policy_label(p: SlotPolicy) -> &'static str {
    match p {
        SlotPolicy::Require => "require",
        SlotPolicy::Prefer => "prefer",
        SlotPolicy::Forbid => "forbid",
    }
}

fn section_label(s: LoadSection) -> &'static str {
    match s {
        LoadSection::Forenoon => "forenoon",
        LoadSection::Afternoon => "afternoon",
        LoadSection::WholeDay => "whole_day",
        LoadSection::Evening => "evening",
    }
}

/// Compile the input's constraint tables into the flat rule list the matrix
/// evaluates. Group references are expanded to member sets here so that
/// evaluation never touches the registries.
pub fn build_catalog(input: &ScheduleInput) -> Result<Vec<Rule>, RuleError> {
    let grid = &input.grid;
    let book = &input.rules;

    let mut subject_groups: HashMap<&SubjectGroupId, HashSet<SubjectId>> = HashMap::new();
    for s in &input.subjects {
        for g in &s.groups {
            subject_groups.entry(g).or_default().insert(s.id);
        }
    }
    let mut teacher_groups: HashMap<&TeacherGroupId, HashSet<TeacherId>> = HashMap::new();
    for t in &input.teachers {
        for g in &t.groups {
            teacher_groups.entry(g).or_default().insert(t.id.clone());
        }
    }

    let mut rules = Vec::new();

    for (i, r) in book.class_slots.iter().enumerate() {
        let name = format!("class_{}_slot#{i}", policy_label(r.policy));
        let slots = resolve_slots(grid, &name, &r.slots)?;
        rules.push(Rule {
            name,
            kind: RuleKind::Fixed,
            hard: r.hard,
            score: r.params.score,
            penalty: r.params.penalty,
            weight: r.params.weight,
            priority: r.params.priority,
            body: RuleBody::SlotList {
                scope: Scope {
                    grade: r.grade,
                    class: r.class,
                    subjects: r.subject.map(|s| HashSet::from([s])),
                    teachers: r.teacher.clone().map(|t| HashSet::from([t])),
                },
                slots,
                policy: r.policy,
            },
        });
    }

    for (i, r) in book.subject_group_slots.iter().enumerate() {
        let name = format!("subject_group_{}:{}#{i}", policy_label(r.policy), r.group);
        let members = subject_groups
            .get(&r.group)
            .cloned()
            .ok_or_else(|| RuleError::UnknownGroup {
                rule: name.clone(),
                group: r.group.to_string(),
            })?;
        let slots = resolve_slots(grid, &name, &r.slots)?;
        rules.push(Rule {
            name,
            kind: RuleKind::Fixed,
            hard: r.hard,
            score: r.params.score,
            penalty: r.params.penalty,
            weight: r.params.weight,
            priority: r.params.priority,
            body: RuleBody::SlotList {
                scope: Scope {
                    subjects: Some(members),
                    ..Scope::default()
                },
                slots,
                policy: r.policy,
            },
        });
    }

    for (i, r) in book.teacher_group_slots.iter().enumerate() {
        let name = format!("teacher_group_{}:{}#{i}", policy_label(r.policy), r.group);
        let members = teacher_groups
            .get(&r.group)
            .cloned()
            .ok_or_else(|| RuleError::UnknownGroup {
                rule: name.clone(),
                group: r.group.to_string(),
            })?;
        let slots = resolve_slots(grid, &name, &r.slots)?;
        rules.push(Rule {
            name,
            kind: RuleKind::Fixed,
            hard: r.hard,
            score: r.params.score,
            penalty: r.params.penalty,
            weight: r.params.weight,
            priority: r.params.priority,
            body: RuleBody::SlotList {
                scope: Scope {
                    teachers: Some(members),
                    ..Scope::default()
                },
                slots,
                policy: r.policy,
            },
        });
    }

    for r in &book.subject_exclusions {
        rules.push(Rule {
            name: format!("subject_excl:{}-{}", r.first, r.second),
            kind: RuleKind::Dynamic,
            hard: false,
            score: r.params.score,
            penalty: r.params.penalty,
            weight: r.params.weight,
            priority: r.params.priority,
            body: RuleBody::SubjectExclusion {
                first: r.first,
                second: r.second,
            },
        });
    }

    for r in &book.subject_orders {
        rules.push(Rule {
            name: format!("subject_order:{}->{}", r.before, r.after),
            kind: RuleKind::Dynamic,
            hard: false,
            score: r.params.score,
            penalty: r.params.penalty,
            weight: r.params.weight,
            priority: r.params.priority,
            body: RuleBody::SubjectOrder {
                before: r.before,
                after: r.after,
            },
        });
    }

    // Always present; the repeat-with-pair exemption is what makes connected
    // lessons legal at all.
    let day_repeat = book.day_repeat.clone().unwrap_or_default();
    rules.push(Rule {
        name: "same_day_repeat".to_string(),
        kind: RuleKind::Dynamic,
        hard: day_repeat.hard,
        score: day_repeat.params.score,
        penalty: day_repeat.params.penalty,
        weight: day_repeat.params.weight,
        priority: day_repeat.params.priority,
        body: RuleBody::DayRepeat,
    });

    for (i, r) in book.period_caps.iter().enumerate() {
        rules.push(Rule {
            name: format!("period_cap:p{}#{i}", r.period),
            kind: RuleKind::Dynamic,
            hard: false,
            score: r.params.score,
            penalty: r.params.penalty,
            weight: r.params.weight,
            priority: r.params.priority,
            body: RuleBody::PeriodCap {
                subject: r.subject,
                period: r.period,
                max_per_week: r.max_per_week,
            },
        });
    }

    for (i, r) in book.teacher_loads.iter().enumerate() {
        let name = format!("teacher_load:{}#{i}", section_label(r.section));
        let teachers = match (&r.teacher, &r.group) {
            (Some(t), _) => Some(HashSet::from([t.clone()])),
            (None, Some(g)) => Some(teacher_groups.get(g).cloned().ok_or_else(|| {
                RuleError::UnknownGroup {
                    rule: name.clone(),
                    group: g.to_string(),
                }
            })?),
            (None, None) => None,
        };
        rules.push(Rule {
            name,
            kind: RuleKind::Dynamic,
            hard: false,
            score: r.params.score,
            penalty: r.params.penalty,
            weight: r.params.weight,
            priority: r.params.priority,
            body: RuleBody::TeacherLoad {
                teachers,
                section: r.section,
                max_per_day: r.max_per_day,
            },
        });
    }

    for r in &book.teacher_exclusions {
        rules.push(Rule {
            name: format!("teacher_excl:{}-{}", r.first, r.second),
            kind: RuleKind::Dynamic,
            hard: false,
            score: r.params.score,
            penalty: r.params.penalty,
            weight: r.params.weight,
            priority: r.params.priority,
            body: RuleBody::TeacherExclusion {
                first: r.first.clone(),
                second: r.second.clone(),
            },
        });
    }

    for (i, r) in book.noon_breaks.iter().enumerate() {
        rules.push(Rule {
            name: format!("noon_break#{i}"),
            kind: RuleKind::Dynamic,
            hard: false,
            score: r.params.score,
            penalty: r.params.penalty,
            weight: r.params.weight,
            priority: r.params.priority,
            body: RuleBody::NoonBreak {
                teachers: if r.teachers.is_empty() {
                    None
                } else {
                    Some(r.teachers.iter().cloned().collect())
                },
            },
        });
    }

    Ok(rules)
}
