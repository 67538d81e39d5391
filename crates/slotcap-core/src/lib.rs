//! Core domain model for slot capacity provisioning: templates, date
//! snapshots, provisioning windows and the per-date reconciliation rule.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Days, Months, NaiveDate};
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

pub const CRATE_NAME: &str = "slotcap-core";

/// One default capacity row of the template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotLimit {
    #[serde(rename = "time_slot")]
    pub slot: String,
    #[serde(rename = "limit_count")]
    pub limit: u32,
}

impl SlotLimit {
    pub fn new(slot: impl Into<String>, limit: u32) -> Self {
        Self {
            slot: slot.into(),
            limit,
        }
    }
}

/// Global default `{slot -> limit}` mapping copied onto newly provisioned dates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapacityTemplate {
    slots: BTreeMap<String, u32>,
}

impl CapacityTemplate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later rows win when a slot name repeats.
    pub fn from_limits(limits: impl IntoIterator<Item = SlotLimit>) -> Self {
        Self {
            slots: limits.into_iter().map(|l| (l.slot, l.limit)).collect(),
        }
    }

    pub fn set(&mut self, slot: impl Into<String>, limit: u32) {
        self.slots.insert(slot.into(), limit);
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &BTreeMap<String, u32> {
        &self.slots
    }

    /// Snapshot the template onto `date`. The result does not track later template edits.
    pub fn snapshot_for(&self, date: NaiveDate) -> DateCapacity {
        DateCapacity {
            date,
            slots: self.slots.clone(),
        }
    }
}

/// Realized capacity for one calendar date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateCapacity {
    pub date: NaiveDate,
    #[serde(rename = "time_limits")]
    pub slots: BTreeMap<String, u32>,
}

impl DateCapacity {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            slots: BTreeMap::new(),
        }
    }

    pub fn with_slot(mut self, slot: impl Into<String>, limit: u32) -> Self {
        self.slots.insert(slot.into(), limit);
        self
    }
}

/// Calendar month key used to group overrides, rendered as `YYYY-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

impl YearMonth {
    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl Serialize for YearMonth {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid year-month {0:?}, expected YYYY-MM")]
pub struct YearMonthParseError(pub String);

impl FromStr for YearMonth {
    type Err = YearMonthParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || YearMonthParseError(s.to_string());
        let (year, month) = s.trim().split_once('-').ok_or_else(err)?;
        let year: i32 = year.parse().map_err(|_| err())?;
        let month: u32 = month.parse().map_err(|_| err())?;
        if !(1..=12).contains(&month) {
            return Err(err());
        }
        Ok(Self { year, month })
    }
}

/// Sparse `year-month -> date -> slot -> limit` view of configured dates.
///
/// A month with no dates, or a date with no slots, counts as not configured.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct OverrideCalendar {
    months: BTreeMap<YearMonth, BTreeMap<NaiveDate, BTreeMap<String, u32>>>,
}

impl OverrideCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, date: NaiveDate, slot: impl Into<String>, limit: u32) {
        self.entry(date).insert(slot.into(), limit);
    }

    /// Slot map for `date`, created empty if missing.
    pub fn entry(&mut self, date: NaiveDate) -> &mut BTreeMap<String, u32> {
        self.months
            .entry(YearMonth::of(date))
            .or_default()
            .entry(date)
            .or_default()
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        let Some(dates) = self.months.get(&YearMonth::of(date)) else {
            return false;
        };
        match dates.get(&date) {
            Some(slots) => !slots.is_empty(),
            None => false,
        }
    }

    pub fn slots_for(&self, date: NaiveDate) -> Option<&BTreeMap<String, u32>> {
        self.months
            .get(&YearMonth::of(date))
            .and_then(|dates| dates.get(&date))
            .filter(|slots| !slots.is_empty())
    }

    pub fn month(&self, month: YearMonth) -> Option<&BTreeMap<NaiveDate, BTreeMap<String, u32>>> {
        self.months.get(&month).filter(|dates| !dates.is_empty())
    }

    /// Configured dates in ascending order.
    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.months
            .values()
            .flat_map(|dates| dates.iter())
            .filter(|(_, slots)| !slots.is_empty())
            .map(|(date, _)| *date)
    }

    pub fn is_empty(&self) -> bool {
        self.dates().next().is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported provisioning period: {0:?}")]
pub struct PeriodError(pub String);

/// Symbolic length of a provisioning window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Period {
    OneWeek,
    TwoWeeks,
    OneMonth,
    TwoMonths,
}

impl Period {
    pub const ALL: [Period; 4] = [
        Period::OneWeek,
        Period::TwoWeeks,
        Period::OneMonth,
        Period::TwoMonths,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Period::OneWeek => "oneWeek",
            Period::TwoWeeks => "twoWeeks",
            Period::OneMonth => "oneMonth",
            Period::TwoMonths => "twoMonths",
        }
    }

    /// Exclusive end of a window starting at `start`.
    pub fn end_after(self, start: NaiveDate) -> NaiveDate {
        let end = match self {
            Period::OneWeek => start.checked_add_days(Days::new(7)),
            Period::TwoWeeks => start.checked_add_days(Days::new(14)),
            Period::OneMonth => start.checked_add_months(Months::new(1)),
            Period::TwoMonths => start.checked_add_months(Months::new(2)),
        };
        end.unwrap_or(NaiveDate::MAX)
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Period {
    type Err = PeriodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Period::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| PeriodError(s.to_string()))
    }
}

/// Half-open date range `[start, end)` plus the overwrite policy for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub overwrite_existing: bool,
}

impl ProvisioningWindow {
    pub fn new(period: Period, today: NaiveDate, overwrite_existing: bool) -> Self {
        Self {
            start: today,
            end: period.end_after(today),
            overwrite_existing,
        }
    }

    /// Fresh ascending iterator over the window; callers may iterate it repeatedly.
    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d < end)
    }

    pub fn day_count(&self) -> usize {
        (self.end - self.start).num_days().max(0) as usize
    }
}

/// Parse `period` and expand it from `now` into ascending, end-exclusive dates.
pub fn generate_window(
    period: &str,
    now: NaiveDate,
) -> Result<impl Iterator<Item = NaiveDate>, PeriodError> {
    let period: Period = period.parse()?;
    Ok(ProvisioningWindow::new(period, now, false).dates())
}

/// Per-date outcome of reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Skip,
    WriteSnapshot(DateCapacity),
}

/// Decide whether `date` gets the current template snapshot.
///
/// Without `overwrite`, a date already present in `existing` is never touched.
pub fn reconcile(
    date: NaiveDate,
    existing: &OverrideCalendar,
    template: &CapacityTemplate,
    overwrite: bool,
) -> Action {
    if !overwrite && existing.contains(date) {
        return Action::Skip;
    }
    Action::WriteSnapshot(template.snapshot_for(date))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn template(pairs: &[(&str, u32)]) -> CapacityTemplate {
        CapacityTemplate::from_limits(pairs.iter().map(|(s, l)| SlotLimit::new(*s, *l)))
    }

    #[test]
    fn one_week_covers_exactly_seven_days() {
        let start = d(2024, 3, 10);
        let dates: Vec<_> = generate_window("oneWeek", start).unwrap().collect();
        assert_eq!(dates.len(), 7);
        assert_eq!(dates.first(), Some(&start));
        assert_eq!(dates.last(), Some(&d(2024, 3, 16)));
        assert!(!dates.contains(&d(2024, 3, 17)));
    }

    #[test]
    fn two_weeks_covers_fourteen_days() {
        let dates: Vec<_> = generate_window("twoWeeks", d(2024, 12, 25)).unwrap().collect();
        assert_eq!(dates.len(), 14);
        assert_eq!(dates.last(), Some(&d(2025, 1, 7)));
    }

    #[test]
    fn month_windows_use_calendar_arithmetic() {
        let window = ProvisioningWindow::new(Period::OneMonth, d(2024, 2, 10), false);
        assert_eq!(window.end, d(2024, 3, 10));
        assert_eq!(window.day_count(), 29);

        let window = ProvisioningWindow::new(Period::TwoMonths, d(2024, 6, 15), false);
        assert_eq!(window.end, d(2024, 8, 15));
    }

    #[test]
    fn month_end_is_clamped() {
        assert_eq!(Period::OneMonth.end_after(d(2024, 1, 31)), d(2024, 2, 29));
        assert_eq!(Period::OneMonth.end_after(d(2023, 1, 31)), d(2023, 2, 28));
        assert_eq!(Period::TwoMonths.end_after(d(2024, 12, 31)), d(2025, 2, 28));
    }

    #[test]
    fn window_iteration_is_restartable() {
        let window = ProvisioningWindow::new(Period::OneWeek, d(2024, 5, 1), true);
        let first: Vec<_> = window.dates().collect();
        let second: Vec<_> = window.dates().collect();
        assert_eq!(first, second);
        assert!(first.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn unknown_period_is_rejected() {
        let err = generate_window("nextCentury", d(2024, 1, 1)).err().unwrap();
        assert_eq!(err, PeriodError("nextCentury".into()));
        assert!("".parse::<Period>().is_err());
        assert!("OneWeek".parse::<Period>().is_err());
    }

    #[test]
    fn period_strings_round_trip_through_serde() {
        for period in Period::ALL {
            let json = serde_json::to_string(&period).unwrap();
            assert_eq!(json, format!("\"{}\"", period.as_str()));
            assert_eq!(period.as_str().parse::<Period>().unwrap(), period);
        }
    }

    #[test]
    fn calendar_lookup_treats_missing_levels_as_absent() {
        let mut calendar = OverrideCalendar::new();
        calendar.insert(d(2024, 4, 2), "morning", 5);
        calendar.entry(d(2024, 4, 3));

        assert!(calendar.contains(d(2024, 4, 2)));
        assert!(!calendar.contains(d(2024, 4, 3)), "empty date is not configured");
        assert!(!calendar.contains(d(2024, 4, 4)));
        assert!(!calendar.contains(d(2024, 5, 2)), "month without dates");
        assert_eq!(calendar.dates().collect::<Vec<_>>(), vec![d(2024, 4, 2)]);
        assert!(calendar.slots_for(d(2024, 4, 3)).is_none());
    }

    #[test]
    fn calendar_serializes_as_nested_month_map() {
        let mut calendar = OverrideCalendar::new();
        calendar.insert(d(2024, 1, 2), "morning", 5);
        let json = serde_json::to_value(&calendar).unwrap();
        assert_eq!(json["2024-01"]["2024-01-02"]["morning"], 5);
    }

    #[test]
    fn year_month_parses_and_formats() {
        let ym: YearMonth = "2024-01".parse().unwrap();
        assert_eq!(ym, YearMonth { year: 2024, month: 1 });
        assert_eq!(ym.to_string(), "2024-01");
        assert!("2024-13".parse::<YearMonth>().is_err());
        assert!("2024".parse::<YearMonth>().is_err());
    }

    #[test]
    fn reconcile_skips_existing_dates_without_overwrite() {
        let mut existing = OverrideCalendar::new();
        existing.insert(d(2024, 4, 2), "morning", 5);
        let tpl = template(&[("morning", 10), ("evening", 8)]);

        assert_eq!(reconcile(d(2024, 4, 2), &existing, &tpl, false), Action::Skip);

        let Action::WriteSnapshot(snapshot) = reconcile(d(2024, 4, 2), &existing, &tpl, true) else {
            panic!("overwrite must write");
        };
        assert_eq!(snapshot.slots, tpl.slots().clone());
    }

    #[test]
    fn reconcile_writes_missing_dates() {
        let tpl = template(&[("a", 1), ("b", 2)]);
        let action = reconcile(d(2024, 4, 9), &OverrideCalendar::new(), &tpl, false);
        assert_eq!(
            action,
            Action::WriteSnapshot(DateCapacity::new(d(2024, 4, 9)).with_slot("a", 1).with_slot("b", 2))
        );
    }

    #[test]
    fn snapshot_does_not_follow_template_edits() {
        let mut tpl = template(&[("a", 1), ("b", 2)]);
        let snapshot = tpl.snapshot_for(d(2024, 4, 9));
        tpl.set("c", 3);
        assert_eq!(snapshot.slots.len(), 2);
        assert!(!snapshot.slots.contains_key("c"));
    }
}
