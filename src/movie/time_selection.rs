use thiserror::Error;

/// A time selection error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeSelectionError {
    /// The selection could not be parsed.
    #[error("invalid time selection {0:?}")]
    InvalidSyntax(String),
    /// A slice with a zero step.
    #[error("time slice {0:?} has a zero step")]
    ZeroStep(String),
    /// A discrete index outside the time axis.
    #[error("time index {index} is out of range for {len} time points")]
    IndexOutOfRange {
        /// The index as given.
        index: i64,
        /// The length of the time axis.
        len: u64,
    },
}

/// Parse a time selection into ascending, de-duplicated time indices of an axis of length `len`.
///
/// A selection is `all`, or a comma separated list of items where each item is either
/// - an index, with negative indices counting back from the end, or
/// - a slice `start:stop` or `start:stop:step` with the semantics of a Python slice: bounds may be omitted or negative, and are clamped to the axis.
///
/// For example, with `len = 10`, `"0:10:3"` selects `[0, 3, 6, 9]`, `"-2:"` selects `[8, 9]`, and `"1,3,-1"` selects `[1, 3, 9]`.
///
/// An empty selection (e.g. `"5:2"`) is not an error.
///
/// # Errors
/// Returns a [`TimeSelectionError`] if the selection cannot be parsed, a slice has a zero step, or a discrete index is out of range.
pub fn parse_time_selection(selection: &str, len: u64) -> Result<Vec<u64>, TimeSelectionError> {
    let selection = selection.trim();
    if selection.eq_ignore_ascii_case("all") {
        return Ok((0..len).collect());
    }
    if selection.is_empty() {
        return Err(TimeSelectionError::InvalidSyntax(selection.to_string()));
    }

    let mut indices = Vec::new();
    for item in selection.split(',') {
        let item = item.trim();
        if item.contains(':') {
            indices.extend(parse_slice(item, len)?);
        } else {
            indices.push(parse_index(item, len)?);
        }
    }
    indices.sort_unstable();
    indices.dedup();
    Ok(indices)
}

fn parse_int(s: &str, item: &str) -> Result<i64, TimeSelectionError> {
    s.trim()
        .parse()
        .map_err(|_| TimeSelectionError::InvalidSyntax(item.to_string()))
}

fn parse_index(item: &str, len: u64) -> Result<u64, TimeSelectionError> {
    let index = parse_int(item, item)?;
    let len_i = i64::try_from(len).unwrap_or(i64::MAX);
    let resolved = if index < 0 { index + len_i } else { index };
    if (0..len_i).contains(&resolved) {
        Ok(resolved as u64)
    } else {
        Err(TimeSelectionError::IndexOutOfRange { index, len })
    }
}

fn parse_slice(item: &str, len: u64) -> Result<Vec<u64>, TimeSelectionError> {
    let parts: Vec<&str> = item.split(':').collect();
    if parts.len() > 3 {
        return Err(TimeSelectionError::InvalidSyntax(item.to_string()));
    }
    let bound = |i: usize| -> Result<Option<i64>, TimeSelectionError> {
        match parts.get(i).map(|s| s.trim()) {
            None | Some("") => Ok(None),
            Some(s) => parse_int(s, item).map(Some),
        }
    };
    let (start, stop, step) = (bound(0)?, bound(1)?, bound(2)?.unwrap_or(1));
    if step == 0 {
        return Err(TimeSelectionError::ZeroStep(item.to_string()));
    }

    let len = i64::try_from(len).unwrap_or(i64::MAX);
    let (lower, upper) = if step < 0 { (-1, len - 1) } else { (0, len) };
    let clamp = |bound: i64| {
        if bound < 0 {
            (bound + len).max(lower)
        } else {
            bound.min(upper)
        }
    };
    let start = start.map_or(if step < 0 { upper } else { lower }, clamp);
    let stop = stop.map_or(if step < 0 { lower } else { upper }, clamp);

    let mut indices = Vec::new();
    let mut i = start;
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        indices.push(i as u64);
        match i.checked_add(step) {
            Some(next) => i = next,
            None => break,
        }
    }
    Ok(indices)
}
