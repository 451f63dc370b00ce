mod grid;
mod sn;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use utoipa::ToSchema;

pub use grid::{DaySection, SlotRef, TimeSlot, WeekGrid};
pub use sn::{ClassSn, SnParseError};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Clone, Debug, Serialize, Deserialize, ToSchema, JsonSchema, Eq, PartialEq, Hash,
            PartialOrd, Ord,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

macro_rules! num_id_newtype {
    ($name:ident) => {
        #[derive(
            Clone, Copy, Debug, Serialize, Deserialize, ToSchema, JsonSchema, Eq, PartialEq, Hash,
            PartialOrd, Ord,
        )]
        #[serde(transparent)]
        pub struct $name(pub u16);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

num_id_newtype!(SubjectId);
num_id_newtype!(GradeId);
num_id_newtype!(ClassId);
id_newtype!(TeacherId);
id_newtype!(VenueId);
id_newtype!(SubjectGroupId);
id_newtype!(TeacherGroupId);

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct Subject {
    pub id: SubjectId,
    pub name: String,
    #[serde(default)]
    pub groups: Vec<SubjectGroupId>,
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct Teacher {
    pub id: TeacherId,
    #[serde(default)]
    pub groups: Vec<TeacherGroupId>,
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct Venue {
    pub id: VenueId,
    #[serde(default)]
    pub name: Option<String>,
}

/// Venues a class unit may be taught in, keyed by (subject, grade, class).
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct VenueBinding {
    pub subject: SubjectId,
    pub grade: GradeId,
    pub class: ClassId,
    pub venues: Vec<VenueId>,
}

impl VenueBinding {
    pub fn sn(&self) -> ClassSn {
        ClassSn::new(self.subject, self.grade, self.class)
    }
}

/// One class unit with its weekly hour requirement. `double_periods` of the
/// weekly hours must be delivered as contiguous pairs, the rest as singles.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct TeachingTask {
    pub subject: SubjectId,
    pub grade: GradeId,
    pub class: ClassId,
    pub teachers: Vec<TeacherId>,
    pub weekly_hours: u8,
    #[serde(default)]
    pub double_periods: u8,
}

impl TeachingTask {
    pub fn sn(&self) -> ClassSn {
        ClassSn::new(self.subject, self.grade, self.class)
    }

    pub fn normal_hours(&self) -> i16 {
        self.weekly_hours as i16 - 2 * self.double_periods as i16
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, ToSchema, JsonSchema, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum SlotPolicy {
    Require,
    Prefer,
    Forbid,
}

fn default_score() -> i64 {
    2
}
fn default_penalty() -> i64 {
    2
}
fn default_weight() -> i64 {
    1
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct RuleParams {
    #[serde(default = "default_score")]
    pub score: i64,
    #[serde(default = "default_penalty")]
    pub penalty: i64,
    #[serde(default = "default_weight")]
    pub weight: i64,
    #[serde(default)]
    pub priority: u8,
}

impl Default for RuleParams {
    fn default() -> Self {
        Self {
            score: default_score(),
            penalty: default_penalty(),
            weight: default_weight(),
            priority: 0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct ClassSlotRule {
    #[serde(default)]
    pub grade: Option<GradeId>,
    #[serde(default)]
    pub class: Option<ClassId>,
    #[serde(default)]
    pub subject: Option<SubjectId>,
    #[serde(default)]
    pub teacher: Option<TeacherId>,
    pub slots: Vec<SlotRef>,
    pub policy: SlotPolicy,
    #[serde(default)]
    pub hard: bool,
    #[serde(default)]
    pub params: RuleParams,
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct SubjectGroupSlotRule {
    pub group: SubjectGroupId,
    pub slots: Vec<SlotRef>,
    pub policy: SlotPolicy,
    #[serde(default)]
    pub hard: bool,
    #[serde(default)]
    pub params: RuleParams,
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct TeacherGroupSlotRule {
    pub group: TeacherGroupId,
    pub slots: Vec<SlotRef>,
    pub policy: SlotPolicy,
    #[serde(default)]
    pub hard: bool,
    #[serde(default)]
    pub params: RuleParams,
}

/// The two subjects must not both occur for one class on the same day.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct SubjectExclusionRule {
    pub first: SubjectId,
    pub second: SubjectId,
    #[serde(default)]
    pub params: RuleParams,
}

/// `before` must not immediately precede `after` within one day.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct SubjectOrderRule {
    pub before: SubjectId,
    pub after: SubjectId,
    #[serde(default)]
    pub params: RuleParams,
}

fn default_true() -> bool {
    true
}

/// Same subject repeated for one class on one day, unless the repeat is the
/// second half of a connected pair.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct DayRepeatRule {
    #[serde(default = "default_true")]
    pub hard: bool,
    #[serde(default)]
    pub params: RuleParams,
}

impl Default for DayRepeatRule {
    fn default() -> Self {
        Self {
            hard: true,
            params: RuleParams::default(),
        }
    }
}

/// Caps how often one (class, subject) may sit at the same lesson number
/// across the week.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct PeriodCapRule {
    pub period: u8,
    pub max_per_week: u8,
    #[serde(default)]
    pub subject: Option<SubjectId>,
    #[serde(default)]
    pub params: RuleParams,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, ToSchema, JsonSchema, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LoadSection {
    Forenoon,
    Afternoon,
    WholeDay,
    Evening,
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct TeacherLoadRule {
    #[serde(default)]
    pub teacher: Option<TeacherId>,
    #[serde(default)]
    pub group: Option<TeacherGroupId>,
    pub section: LoadSection,
    pub max_per_day: u8,
    #[serde(default)]
    pub params: RuleParams,
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct TeacherExclusionRule {
    pub first: TeacherId,
    pub second: TeacherId,
    #[serde(default)]
    pub params: RuleParams,
}

/// No teacher takes both the last forenoon and the first afternoon period of
/// one day. An empty teacher list applies the rule to everyone.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct NoonBreakRule {
    #[serde(default)]
    pub teachers: Vec<TeacherId>,
    #[serde(default)]
    pub params: RuleParams,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct RuleBook {
    #[serde(default)]
    pub class_slots: Vec<ClassSlotRule>,
    #[serde(default)]
    pub subject_group_slots: Vec<SubjectGroupSlotRule>,
    #[serde(default)]
    pub teacher_group_slots: Vec<TeacherGroupSlotRule>,
    #[serde(default)]
    pub subject_exclusions: Vec<SubjectExclusionRule>,
    #[serde(default)]
    pub subject_orders: Vec<SubjectOrderRule>,
    #[serde(default)]
    pub day_repeat: Option<DayRepeatRule>,
    #[serde(default)]
    pub period_caps: Vec<PeriodCapRule>,
    #[serde(default)]
    pub teacher_loads: Vec<TeacherLoadRule>,
    #[serde(default)]
    pub teacher_exclusions: Vec<TeacherExclusionRule>,
    #[serde(default)]
    pub noon_breaks: Vec<NoonBreakRule>,
}

fn default_pop_size() -> usize {
    40
}
fn default_max_generations() -> u32 {
    200
}
fn default_crossover_rate() -> f64 {
    0.8
}
fn default_mutation_rate() -> f64 {
    0.1
}
fn default_best_ratio() -> f64 {
    0.1
}
fn default_max_stagnation() -> u32 {
    30
}
fn default_max_alloc_retries() -> u32 {
    10
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct GaParams {
    #[serde(default = "default_pop_size")]
    pub pop_size: usize,
    #[serde(default = "default_max_generations")]
    pub max_generations: u32,
    #[serde(default = "default_crossover_rate")]
    pub crossover_rate: f64,
    #[serde(default = "default_mutation_rate")]
    pub mutation_rate: f64,
    /// Fraction of the population kept unconditionally each generation.
    #[serde(default = "default_best_ratio")]
    pub best_ratio: f64,
    #[serde(default = "default_max_stagnation")]
    pub max_stagnation: u32,
    #[serde(default)]
    pub target_fitness: Option<i64>,
    #[serde(default)]
    pub time_limit_sec: Option<u64>,
    #[serde(default = "default_max_alloc_retries")]
    pub max_alloc_retries: u32,
    #[serde(default)]
    pub seed: u64,
}

impl Default for GaParams {
    fn default() -> Self {
        Self {
            pop_size: default_pop_size(),
            max_generations: default_max_generations(),
            crossover_rate: default_crossover_rate(),
            mutation_rate: default_mutation_rate(),
            best_ratio: default_best_ratio(),
            max_stagnation: default_max_stagnation(),
            target_fitness: None,
            time_limit_sec: None,
            max_alloc_retries: default_max_alloc_retries(),
            seed: 0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct ScheduleInput {
    pub grid: WeekGrid,
    pub subjects: Vec<Subject>,
    pub teachers: Vec<Teacher>,
    pub venues: Vec<Venue>,
    pub venue_bindings: Vec<VenueBinding>,
    pub tasks: Vec<TeachingTask>,
    #[serde(default)]
    pub rules: RuleBook,
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct SolveRequest {
    pub input: ScheduleInput,
    #[serde(default)]
    pub params: GaParams,
}

/// One scheduled occurrence of a class unit; two slots when connected.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct Placement {
    pub sn: ClassSn,
    pub teacher: TeacherId,
    pub venue: VenueId,
    pub slots: Vec<TimeSlot>,
    pub connected: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct GenerationStats {
    pub generation: u32,
    pub best: i64,
    pub avg: f64,
    pub worst: i64,
    pub crossovers_attempted: u32,
    pub crossovers_accepted: u32,
    pub mutations_attempted: u32,
    pub mutations_accepted: u32,
    pub stagnation: u32,
    pub elapsed_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct SolveResult {
    pub status: String,
    pub fitness: i64,
    pub found_at_generation: u32,
    pub unresolved_conflicts: u32,
    pub placements: Vec<Placement>,
    pub generations: Vec<GenerationStats>,
    pub stats: serde_json::Value,
}

/// Render placements as a plain-text weekly grid, one row per day.
pub fn render_week(grid: &WeekGrid, placements: &[Placement]) -> String {
    let mut by_slot: BTreeMap<u16, Vec<String>> = BTreeMap::new();
    for p in placements {
        for s in &p.slots {
            by_slot
                .entry(s.0)
                .or_default()
                .push(format!("{} {}", p.sn, p.teacher));
        }
    }
    let mut out = String::new();
    for day in 0..grid.workdays {
        out.push_str(&format!("day {day}:"));
        for period in 0..grid.periods_per_day() {
            let slot = grid.slot(day, period);
            let cell = by_slot
                .get(&slot.0)
                .map(|v| v.join(", "))
                .unwrap_or_else(|| "-".to_string());
            out.push_str(&format!(" [{period}: {cell}]"));
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ga_params_defaults_from_empty_json() {
        let p: GaParams = serde_json::from_str("{}").unwrap();
        assert_eq!(p.pop_size, 40);
        assert_eq!(p.max_generations, 200);
        assert!(p.target_fitness.is_none());
        assert_eq!(p.seed, 0);
    }

    #[test]
    fn normal_hours_accounts_for_doubles() {
        let t = TeachingTask {
            subject: SubjectId(1),
            grade: GradeId(5),
            class: ClassId(2),
            teachers: vec![TeacherId("t1".into())],
            weekly_hours: 5,
            double_periods: 1,
        };
        assert_eq!(t.normal_hours(), 3);
    }

    #[test]
    fn render_week_marks_empty_slots() {
        let grid = WeekGrid {
            workdays: 1,
            morning_reading: 0,
            forenoon: 2,
            afternoon: 0,
            evening: 0,
        };
        let p = Placement {
            sn: "1_1_1".parse().unwrap(),
            teacher: TeacherId("t1".into()),
            venue: VenueId("v1".into()),
            slots: vec![TimeSlot(0)],
            connected: false,
        };
        let text = render_week(&grid, &[p]);
        assert!(text.contains("[0: 1_1_1 t1]"));
        assert!(text.contains("[1: -]"));
    }
}
