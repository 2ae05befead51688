use std::fmt;

use crate::core::domain::{LimitOverrides, ResourceLimits, Seconds};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Unit {
    Seconds,
    Kilobytes,
    Count,
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unit::Seconds => write!(f, " seconds"),
            Unit::Kilobytes => write!(f, " kilobytes"),
            Unit::Count => Ok(()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum LimitError {
    #[error("{field} can't exceed {max}{unit}")]
    Exceeded {
        field: &'static str,
        max: String,
        unit: Unit,
    },
    #[error("{field} can't be negative")]
    Negative { field: &'static str },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Run,
    Compile,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Run => write!(f, "run"),
            Stage::Compile => write!(f, "compile"),
        }
    }
}

/// Checks every supplied field against `maxima` and fills the gaps from it.
///
/// Fields are checked in a fixed order and the first violation wins, so the
/// reported error is deterministic for a given request.
pub fn resolve(
    overrides: &LimitOverrides,
    maxima: &ResourceLimits,
) -> Result<ResourceLimits, LimitError> {
    Ok(ResourceLimits {
        wall_time: check_time("wall_time", overrides.wall_time, maxima.wall_time)?,
        cpu_time: check_time("cpu_time", overrides.cpu_time, maxima.cpu_time)?,
        extra_time: check_time("extra_time", overrides.extra_time, maxima.extra_time)?,
        memory: check("memory", overrides.memory, maxima.memory, Unit::Kilobytes)?,
        max_open_files: check(
            "max_open_files",
            overrides.max_open_files,
            maxima.max_open_files,
            Unit::Count,
        )?,
        max_file_size: check(
            "max_file_size",
            overrides.max_file_size,
            maxima.max_file_size,
            Unit::Kilobytes,
        )?,
        max_number_of_processes: check(
            "max_number_of_processes",
            overrides.max_number_of_processes,
            maxima.max_number_of_processes,
            Unit::Count,
        )?,
    })
}

/// Checks `overrides` against `maxima` without building the resolved set.
pub fn validate(overrides: &LimitOverrides, maxima: &ResourceLimits) -> Result<(), LimitError> {
    resolve(overrides, maxima).map(drop)
}

fn check_time(
    field: &'static str,
    value: Option<Seconds>,
    max: Seconds,
) -> Result<Seconds, LimitError> {
    match value {
        Some(v) if v.is_nan() || v < 0.0 => Err(LimitError::Negative { field }),
        other => check(field, other, max, Unit::Seconds),
    }
}

fn check<T>(field: &'static str, value: Option<T>, max: T, unit: Unit) -> Result<T, LimitError>
where
    T: PartialOrd + Copy + fmt::Display,
{
    match value {
        Some(v) if v > max => Err(LimitError::Exceeded {
            field,
            max: max.to_string(),
            unit,
        }),
        Some(v) => Ok(v),
        None => Ok(max),
    }
}
