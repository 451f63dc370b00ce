use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, ToSchema, JsonSchema, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DaySection {
    MorningReading,
    Forenoon,
    Afternoon,
    Evening,
}

/// Absolute slot index: `day * periods_per_day + period`.
#[derive(
    Clone, Copy, Debug, Serialize, Deserialize, ToSchema, JsonSchema, Eq, PartialEq, Hash,
    PartialOrd, Ord,
)]
#[serde(transparent)]
pub struct TimeSlot(pub u16);

impl fmt::Display for TimeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A (day, period) reference as constraint tables write it.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, ToSchema, JsonSchema, Eq, PartialEq, Hash)]
pub struct SlotRef {
    pub day: u8,
    pub period: u8,
}

/// Weekly geometry: workdays and per-day period counts for the four
/// named sections of a school day.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, ToSchema, JsonSchema, PartialEq, Eq)]
pub struct WeekGrid {
    pub workdays: u8,
    #[serde(default)]
    pub morning_reading: u8,
    pub forenoon: u8,
    pub afternoon: u8,
    #[serde(default)]
    pub evening: u8,
}

impl WeekGrid {
    pub fn periods_per_day(&self) -> u8 {
        self.morning_reading + self.forenoon + self.afternoon + self.evening
    }

    pub fn total_slots(&self) -> u16 {
        self.workdays as u16 * self.periods_per_day() as u16
    }

    pub fn slot(&self, day: u8, period: u8) -> TimeSlot {
        TimeSlot(day as u16 * self.periods_per_day() as u16 + period as u16)
    }

    pub fn day_of(&self, t: TimeSlot) -> u8 {
        (t.0 / self.periods_per_day() as u16) as u8
    }

    pub fn period_of(&self, t: TimeSlot) -> u8 {
        (t.0 % self.periods_per_day() as u16) as u8
    }

    pub fn contains(&self, t: TimeSlot) -> bool {
        t.0 < self.total_slots()
    }

    pub fn resolve(&self, r: SlotRef) -> Option<TimeSlot> {
        (r.day < self.workdays && r.period < self.periods_per_day()).then(|| self.slot(r.day, r.period))
    }

    pub fn section_of_period(&self, period: u8) -> DaySection {
        let end_mr = self.morning_reading;
        let end_fn = end_mr + self.forenoon;
        let end_af = end_fn + self.afternoon;
        if period < end_mr {
            DaySection::MorningReading
        } else if period < end_fn {
            DaySection::Forenoon
        } else if period < end_af {
            DaySection::Afternoon
        } else {
            DaySection::Evening
        }
    }

    pub fn section_of(&self, t: TimeSlot) -> DaySection {
        self.section_of_period(self.period_of(t))
    }

    /// True when `a`/`b` are contiguous, on the same day, inside the same
    /// named section — the only legal shape for a connected lesson.
    pub fn is_section_pair(&self, a: TimeSlot, b: TimeSlot) -> bool {
        b.0 == a.0 + 1 && self.day_of(a) == self.day_of(b) && self.section_of(a) == self.section_of(b)
    }

    pub fn slots(&self) -> impl Iterator<Item = TimeSlot> {
        (0..self.total_slots()).map(TimeSlot)
    }

    pub fn last_forenoon_period(&self) -> Option<u8> {
        (self.forenoon > 0).then(|| self.morning_reading + self.forenoon - 1)
    }

    pub fn first_afternoon_period(&self) -> Option<u8> {
        (self.afternoon > 0).then(|| self.morning_reading + self.forenoon)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn grid() -> WeekGrid {
        WeekGrid {
            workdays: 5,
            morning_reading: 1,
            forenoon: 4,
            afternoon: 3,
            evening: 0,
        }
    }

    #[test]
    fn slot_index_roundtrip() {
        let g = grid();
        assert_eq!(g.periods_per_day(), 8);
        assert_eq!(g.total_slots(), 40);
        let t = g.slot(3, 6);
        assert_eq!(t, TimeSlot(30));
        assert_eq!(g.day_of(t), 3);
        assert_eq!(g.period_of(t), 6);
    }

    #[test]
    fn sections() {
        let g = grid();
        assert_eq!(g.section_of_period(0), DaySection::MorningReading);
        assert_eq!(g.section_of_period(1), DaySection::Forenoon);
        assert_eq!(g.section_of_period(4), DaySection::Forenoon);
        assert_eq!(g.section_of_period(5), DaySection::Afternoon);
        assert_eq!(g.last_forenoon_period(), Some(4));
        assert_eq!(g.first_afternoon_period(), Some(5));
    }

    #[test]
    fn section_pairs() {
        let g = grid();
        // inside forenoon
        assert!(g.is_section_pair(g.slot(0, 1), g.slot(0, 2)));
        // spans the forenoon/afternoon boundary
        assert!(!g.is_section_pair(g.slot(0, 4), g.slot(0, 5)));
        // spans a day boundary
        assert!(!g.is_section_pair(g.slot(0, 7), g.slot(1, 0)));
        // not contiguous
        assert!(!g.is_section_pair(g.slot(0, 1), g.slot(0, 3)));
    }

    proptest! {
        #[test]
        fn day_period_roundtrip(day in 0u8..5, period in 0u8..8) {
            let g = grid();
            let t = g.slot(day, period);
            prop_assert!(g.contains(t));
            prop_assert_eq!(g.day_of(t), day);
            prop_assert_eq!(g.period_of(t), period);
        }
    }
}
