use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::{Date, Duration, Month, OffsetDateTime, Time};

use crate::KernelError;

/// Retention period measured from a step's anchor date.
///
/// Text form is `none`, `immediately`, or `unit|count` where unit is one of
/// `day`, `week`, `month`, `quarter`, `year`, `monthend`, `quarterend`, `yearend`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(try_from = "String", into = "String")]
pub enum Period {
    None,
    Immediately,
    Days(u32),
    Weeks(u32),
    Months(u32),
    Quarters(u32),
    Years(u32),
    MonthEnd(u32),
    QuarterEnd(u32),
    YearEnd(u32),
}

impl Period {
    #[must_use]
    pub fn has_time_component(self) -> bool {
        !matches!(self, Self::None)
    }

    /// Compute the date this period elapses when measured from `anchor`.
    ///
    /// Returns `Ok(None)` for [`Period::None`].
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when the result leaves the supported date range.
    pub fn next_date(self, anchor: OffsetDateTime) -> Result<Option<OffsetDateTime>, KernelError> {
        let next = match self {
            Self::None => return Ok(None),
            Self::Immediately => anchor,
            Self::Days(count) => add_duration(anchor, Duration::days(i64::from(count)))?,
            Self::Weeks(count) => add_duration(anchor, Duration::weeks(i64::from(count)))?,
            Self::Months(count) => shift_months(anchor, i64::from(count))?,
            Self::Quarters(count) => shift_months(anchor, i64::from(count) * 3)?,
            Self::Years(count) => shift_months(anchor, i64::from(count) * 12)?,
            Self::MonthEnd(count) => {
                let shifted = shift_months(anchor, i64::from(count.saturating_sub(1)))?;
                end_of_month(shifted)?
            }
            Self::QuarterEnd(count) => {
                let month = u8::from(anchor.month());
                let to_quarter_end = i64::from(2 - (month - 1) % 3);
                let shifted = shift_months(
                    anchor,
                    to_quarter_end + i64::from(count.saturating_sub(1)) * 3,
                )?;
                end_of_month(shifted)?
            }
            Self::YearEnd(count) => {
                let month = i64::from(u8::from(anchor.month()));
                let shifted =
                    shift_months(anchor, (12 - month) + i64::from(count.saturating_sub(1)) * 12)?;
                end_of_month(shifted)?
            }
        };
        Ok(Some(next))
    }
}

impl Display for Period {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Immediately => write!(f, "immediately"),
            Self::Days(count) => write!(f, "day|{count}"),
            Self::Weeks(count) => write!(f, "week|{count}"),
            Self::Months(count) => write!(f, "month|{count}"),
            Self::Quarters(count) => write!(f, "quarter|{count}"),
            Self::Years(count) => write!(f, "year|{count}"),
            Self::MonthEnd(count) => write!(f, "monthend|{count}"),
            Self::QuarterEnd(count) => write!(f, "quarterend|{count}"),
            Self::YearEnd(count) => write!(f, "yearend|{count}"),
        }
    }
}

impl FromStr for Period {
    type Err = KernelError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        let (unit, count) = match trimmed.split_once('|') {
            Some((unit, count)) => {
                let count = count.trim().parse::<u32>().map_err(|err| {
                    KernelError::Validation(format!("period count MUST be a non-negative integer in {raw}: {err}"))
                })?;
                (unit.trim().to_ascii_lowercase(), Some(count))
            }
            None => (trimmed.to_ascii_lowercase(), None),
        };

        match (unit.as_str(), count) {
            ("none", None | Some(0)) => Ok(Self::None),
            ("immediately", None | Some(0)) => Ok(Self::Immediately),
            ("day", Some(count)) => Ok(Self::Days(count)),
            ("week", Some(count)) => Ok(Self::Weeks(count)),
            ("month", Some(count)) => Ok(Self::Months(count)),
            ("quarter", Some(count)) => Ok(Self::Quarters(count)),
            ("year", Some(count)) => Ok(Self::Years(count)),
            ("monthend" | "quarterend" | "yearend", Some(0)) => Err(KernelError::Validation(
                format!("end-of-period count MUST be >= 1: {raw}"),
            )),
            ("monthend", Some(count)) => Ok(Self::MonthEnd(count)),
            ("quarterend", Some(count)) => Ok(Self::QuarterEnd(count)),
            ("yearend", Some(count)) => Ok(Self::YearEnd(count)),
            _ => Err(KernelError::Validation(format!("unsupported period expression: {raw}"))),
        }
    }
}

impl TryFrom<String> for Period {
    type Error = KernelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Period> for String {
    fn from(value: Period) -> Self {
        value.to_string()
    }
}

fn out_of_range() -> KernelError {
    KernelError::Validation("period arithmetic left the supported date range".to_string())
}

fn add_duration(anchor: OffsetDateTime, duration: Duration) -> Result<OffsetDateTime, KernelError> {
    anchor.checked_add(duration).ok_or_else(out_of_range)
}

fn shift_months(value: OffsetDateTime, months: i64) -> Result<OffsetDateTime, KernelError> {
    let date = value.date();
    let index = i64::from(date.year()) * 12 + i64::from(u8::from(date.month())) - 1 + months;
    let year = i32::try_from(index.div_euclid(12)).map_err(|_| out_of_range())?;
    let month_number = u8::try_from(index.rem_euclid(12) + 1).map_err(|_| out_of_range())?;
    let month = Month::try_from(month_number).map_err(|_| out_of_range())?;
    let day = date.day().min(time::util::days_in_year_month(year, month));
    let shifted = Date::from_calendar_date(year, month, day).map_err(|_| out_of_range())?;
    Ok(value.replace_date(shifted))
}

fn end_of_month(value: OffsetDateTime) -> Result<OffsetDateTime, KernelError> {
    let date = value.date();
    let last_day = time::util::days_in_year_month(date.year(), date.month());
    let last = Date::from_calendar_date(date.year(), date.month(), last_day)
        .map_err(|_| out_of_range())?;
    let end_of_day = Time::from_hms(23, 59, 59).map_err(|_| out_of_range())?;
    Ok(value.replace_date(last).replace_time(end_of_day))
}
