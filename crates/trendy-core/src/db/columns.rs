//! Row decoding helpers shared by the repositories

use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::Row;

use crate::util::from_millis;

/// Read a text column and parse it into `T`, reporting bad values as a
/// conversion failure instead of substituting a default.
pub fn parse_text<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|error: T::Err| conversion_error(idx, &error))
}

/// Nullable variant of [`parse_text`].
pub fn parse_optional_text<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    let raw: Option<String> = row.get(idx)?;
    raw.map(|value| {
        value
            .parse()
            .map_err(|error: T::Err| conversion_error(idx, &error))
    })
    .transpose()
}

/// Read a Unix-millisecond column as a timestamp.
pub fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    Ok(from_millis(row.get(idx)?))
}

/// Nullable variant of [`timestamp`].
pub fn optional_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(row.get::<_, Option<i64>>(idx)?.map(from_millis))
}

/// Read an integer flag column.
pub fn flag(row: &Row<'_>, idx: usize) -> rusqlite::Result<bool> {
    Ok(row.get::<_, i32>(idx)? != 0)
}

fn conversion_error(idx: usize, error: &impl Display) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, error.to_string().into())
}
