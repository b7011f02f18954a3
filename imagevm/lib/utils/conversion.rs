use std::ops::{Bound, RangeBounds};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Converts a range bound to a u64 start and end value.
///
/// ## Examples
///
/// ```
/// use imagevm::utils::convert_bounds;
///
/// let (start, end) = convert_bounds(1..10);
/// assert_eq!(start, 1);
/// assert_eq!(end, 9);
///
/// let (start, end) = convert_bounds(512..);
/// assert_eq!(start, 512);
/// assert_eq!(end, u64::MAX);
/// ```
pub fn convert_bounds(range: impl RangeBounds<u64>) -> (u64, u64) {
    let start = match range.start_bound() {
        Bound::Included(&start) => start,
        Bound::Excluded(&start) => start.saturating_add(1),
        Bound::Unbounded => 0,
    };

    let end = match range.end_bound() {
        Bound::Included(&end) => end,
        Bound::Excluded(&end) => end.saturating_sub(1),
        Bound::Unbounded => u64::MAX,
    };

    (start, end)
}

/// Formats a range as the value of an HTTP `Range` header.
pub fn to_range_header(range: impl RangeBounds<u64>) -> String {
    let (start, end) = convert_bounds(range);
    if end == u64::MAX {
        format!("bytes={start}-")
    } else {
        format!("bytes={start}-{end}")
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_header() {
        assert_eq!(to_range_header(0..), "bytes=0-");
        assert_eq!(to_range_header(100..200), "bytes=100-199");
        assert_eq!(to_range_header(..=9), "bytes=0-9");
    }
}
