use chrono::{DateTime, Duration, TimeZone, Utc};

use backlog_core::{BacklogError, Clock};

use crate::error::Result;

/// When a dispatched job becomes due, in whatever form the caller has it.
///
/// | Variant  | Resolves to                                   |
/// |----------|-----------------------------------------------|
/// | `Now`    | the clock's current instant                   |
/// | `Epoch`  | seconds since the Unix epoch                  |
/// | `At`     | the instant itself                            |
/// | `Text`   | [`Clock::parse`] (absolute or relative text)  |
/// | `After`  | now plus the offset                           |
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Schedule {
    #[default]
    Now,
    Epoch(i64),
    At(DateTime<Utc>),
    Text(String),
    After(Duration),
}

impl Schedule {
    /// Normalise to an absolute UTC instant.
    pub fn resolve(&self, clock: &dyn Clock) -> Result<DateTime<Utc>> {
        match self {
            Schedule::Now => Ok(clock.now()),
            Schedule::Epoch(secs) => Utc
                .timestamp_opt(*secs, 0)
                .single()
                .ok_or_else(|| BacklogError::InvalidSchedule(format!("epoch out of range: {secs}")).into()),
            Schedule::At(at) => Ok(*at),
            Schedule::Text(text) => Ok(clock.parse(text)?),
            Schedule::After(offset) => clock
                .now()
                .checked_add_signed(*offset)
                .ok_or_else(|| BacklogError::InvalidSchedule(format!("offset out of range: {offset}")).into()),
        }
    }
}

impl From<DateTime<Utc>> for Schedule {
    fn from(at: DateTime<Utc>) -> Self {
        Schedule::At(at)
    }
}

impl From<i64> for Schedule {
    fn from(secs: i64) -> Self {
        Schedule::Epoch(secs)
    }
}

impl From<Duration> for Schedule {
    fn from(offset: Duration) -> Self {
        Schedule::After(offset)
    }
}

impl From<&str> for Schedule {
    fn from(text: &str) -> Self {
        Schedule::Text(text.to_string())
    }
}

impl From<String> for Schedule {
    fn from(text: String) -> Self {
        Schedule::Text(text)
    }
}

/// `None` means "now".
impl<T: Into<Schedule>> From<Option<T>> for Schedule {
    fn from(value: Option<T>) -> Self {
        value.map_or(Schedule::Now, Into::into)
    }
}
