//! Exclusion policy: sticky manual overrides plus automated staleness detection.

use chrono::{Datelike, Duration, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use std::ops::Range;

use crate::record::Exclusion;

pub const OUTDATED_CATEGORY: &str = "Outdated Content";

const MONTHS: &str = "january|february|march|april|may|june|july|august|september|october|\
                      november|december|jan|feb|mar|apr|jun|jul|aug|sept|sep|oct|nov|dec";

static ISO_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{4})-(\d{1,2})-(\d{1,2})\b").expect("iso date regex"));
static US_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{1,2})/(\d{1,2})/(\d{4})\b").expect("us date regex"));
static MONTH_DAY_YEAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)\b({})\.?\s+(\d{{1,2}})(?:st|nd|rd|th)?,?\s+(\d{{4}})\b",
        MONTHS
    ))
    .expect("month day year regex")
});
static DAY_MONTH_YEAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)\b(\d{{1,2}})(?:st|nd|rd|th)?\s+({})\.?,?\s+(\d{{4}})\b",
        MONTHS
    ))
    .expect("day month year regex")
});
static MONTH_YEAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?i)\b({})\.?,?\s+(\d{{4}})\b", MONTHS)).expect("month year regex")
});

/// Combine the current flag with the outcome of a staleness check.
///
/// `manual` is returned unchanged whatever the check says, and an existing `automatic`
/// flag is not lowered by a later non-stale result.
pub fn merge(current: Option<Exclusion>, stale: bool) -> Option<Exclusion> {
    match current {
        Some(Exclusion::Manual) => Some(Exclusion::Manual),
        Some(Exclusion::Automatic) => Some(Exclusion::Automatic),
        None if stale => Some(Exclusion::Automatic),
        None => None,
    }
}

/// Effective read-time exclusion.
pub fn is_excluded(flag: Option<Exclusion>) -> bool {
    flag.is_some()
}

/// Final staleness decision. A local date check wins; the backend's opinion only counts
/// when the content carries no usable date.
pub fn is_stale(local: Option<bool>, backend_says_stale: bool) -> bool {
    match local {
        Some(stale) => stale,
        None => backend_says_stale,
    }
}

/// Whether the newest date claimed by the content is older than the threshold.
///
/// Returns `None` when neither the text nor `page_date` yields a date on or before
/// `run_date`.
pub fn stale_by_dates(
    text: &str,
    page_date: Option<NaiveDate>,
    run_date: NaiveDate,
    threshold_days: i64,
) -> Option<bool> {
    let newest = find_dates(text)
        .into_iter()
        .chain(page_date)
        .filter(plausible)
        .filter(|d| *d <= run_date)
        .max()?;
    Some(run_date - newest > Duration::days(threshold_days))
}

fn month_number(name: &str) -> Option<u32> {
    let lower = name.to_lowercase();
    let month = match lower.get(..3)? {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    Some(month)
}

fn last_day_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)?.pred_opt()
}

fn overlaps(taken: &[Range<usize>], span: &Range<usize>) -> bool {
    taken
        .iter()
        .any(|t| t.start < span.end && span.start < t.end)
}

/// Every calendar date mentioned in `text`, in match order.
///
/// A bare `Month YYYY` counts as the last day of that month. Matches are not
/// double-counted: "10 October 2025" is one date, not also "October 2025".
pub fn find_dates(text: &str) -> Vec<NaiveDate> {
    let mut taken: Vec<Range<usize>> = Vec::new();
    let mut dates = Vec::new();

    for caps in ISO_DATE.captures_iter(text) {
        let (Ok(y), Ok(m), Ok(d)) = (
            caps[1].parse::<i32>(),
            caps[2].parse::<u32>(),
            caps[3].parse::<u32>(),
        ) else {
            continue;
        };
        if let Some(date) = NaiveDate::from_ymd_opt(y, m, d) {
            taken.push(caps.get(0).map(|whole| whole.range()).unwrap_or_default());
            dates.push(date);
        }
    }

    for caps in US_DATE.captures_iter(text) {
        let (Ok(m), Ok(d), Ok(y)) = (
            caps[1].parse::<u32>(),
            caps[2].parse::<u32>(),
            caps[3].parse::<i32>(),
        ) else {
            continue;
        };
        if let Some(date) = NaiveDate::from_ymd_opt(y, m, d) {
            taken.push(caps.get(0).map(|whole| whole.range()).unwrap_or_default());
            dates.push(date);
        }
    }

    for caps in MONTH_DAY_YEAR.captures_iter(text) {
        let (Some(m), Ok(d), Ok(y)) = (
            month_number(&caps[1]),
            caps[2].parse::<u32>(),
            caps[3].parse::<i32>(),
        ) else {
            continue;
        };
        if let Some(date) = NaiveDate::from_ymd_opt(y, m, d) {
            taken.push(caps.get(0).map(|whole| whole.range()).unwrap_or_default());
            dates.push(date);
        }
    }

    for caps in DAY_MONTH_YEAR.captures_iter(text) {
        let span = caps.get(0).map(|whole| whole.range()).unwrap_or_default();
        if overlaps(&taken, &span) {
            continue;
        }
        let (Ok(d), Some(m), Ok(y)) = (
            caps[1].parse::<u32>(),
            month_number(&caps[2]),
            caps[3].parse::<i32>(),
        ) else {
            continue;
        };
        if let Some(date) = NaiveDate::from_ymd_opt(y, m, d) {
            taken.push(span);
            dates.push(date);
        }
    }

    for caps in MONTH_YEAR.captures_iter(text) {
        let span = caps.get(0).map(|whole| whole.range()).unwrap_or_default();
        if overlaps(&taken, &span) {
            continue;
        }
        let (Some(m), Ok(y)) = (month_number(&caps[1]), caps[2].parse::<i32>()) else {
            continue;
        };
        if let Some(date) = last_day_of_month(y, m) {
            taken.push(span);
            dates.push(date);
        }
    }

    dates
}

/// Older matches are usually statute or form numbers.
fn plausible(date: &NaiveDate) -> bool {
    date.year() >= 1990
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn manual_is_sticky() {
        assert_eq!(merge(Some(Exclusion::Manual), true), Some(Exclusion::Manual));
        assert_eq!(merge(Some(Exclusion::Manual), false), Some(Exclusion::Manual));
        assert_eq!(merge(None, true), Some(Exclusion::Automatic));
        assert_eq!(merge(None, false), None);
        assert_eq!(
            merge(Some(Exclusion::Automatic), false),
            Some(Exclusion::Automatic)
        );
    }

    #[test]
    fn filed_month_year_is_stale() {
        let run = ymd(2025, 10, 10);
        assert_eq!(find_dates("filed August 2023"), vec![ymd(2023, 8, 31)]);
        assert_eq!(stale_by_dates("filed August 2023", None, run, 60), Some(true));
    }

    #[test]
    fn recognises_each_format() {
        assert_eq!(find_dates("Updated 2025-10-01."), vec![ymd(2025, 10, 1)]);
        assert_eq!(find_dates("as of 9/30/2025"), vec![ymd(2025, 9, 30)]);
        assert_eq!(find_dates("Posted Oct. 3, 2025"), vec![ymd(2025, 10, 3)]);
        assert_eq!(find_dates("on the 3rd October 2025"), vec![ymd(2025, 10, 3)]);
        assert_eq!(find_dates("Sept 2024 report"), vec![ymd(2024, 9, 30)]);
        assert!(find_dates("no dates at all, 13/45/2025 either").is_empty());
    }

    #[test]
    fn full_dates_are_not_counted_again_as_month_year() {
        assert_eq!(find_dates("10 October 2025"), vec![ymd(2025, 10, 10)]);
    }

    #[test]
    fn newest_date_decides() {
        let run = ymd(2025, 10, 10);
        let text = "Originally published March 1, 2020. Last updated October 1, 2025.";
        assert_eq!(stale_by_dates(text, None, run, 60), Some(false));
    }

    #[test]
    fn future_dates_are_ignored_for_staleness() {
        let run = ymd(2025, 10, 10);
        assert_eq!(
            stale_by_dates("Public hearing on December 5, 2025", None, run, 60),
            None
        );
        assert_eq!(
            stale_by_dates("Hearing December 5, 2025", Some(ymd(2024, 1, 2)), run, 60),
            Some(true)
        );
    }

    #[test]
    fn local_check_wins_over_backend() {
        assert!(!is_stale(Some(false), true));
        assert!(is_stale(Some(true), false));
        assert!(is_stale(None, true));
        assert!(!is_stale(None, false));
    }
}
