use axum::http::HeaderValue;

/// Build the `Content-Range` header of a search response.
///
/// # Arguments
///
/// * `offset` - The starting point of the range.
/// * `limit` - The maximum number of items in the range, `None` for all.
/// * `total_count` - The number of matches ignoring paging.
/// * `resource_name` - The name of the resource being paginated.
///
/// # Returns
///
/// `"{resource} {offset}-{last}/{total}"`, or `None` when the resource name
/// is not a valid header value.
#[must_use]
pub fn content_range(
    offset: u64,
    limit: Option<u64>,
    total_count: u64,
    resource_name: &str,
) -> Option<HeaderValue> {
    let last = match limit {
        Some(limit) => offset.saturating_add(limit).saturating_sub(1),
        None => total_count.saturating_sub(1),
    }
    .min(total_count);
    HeaderValue::from_str(&format!("{resource_name} {offset}-{last}/{total_count}")).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_within_total() {
        let header = content_range(0, Some(10), 100, "post").unwrap();
        assert_eq!(header, "post 0-9/100");
    }

    #[test]
    fn test_range_clamped_to_total() {
        let header = content_range(20, Some(50), 30, "post").unwrap();
        assert_eq!(header, "post 20-30/30");
    }

    #[test]
    fn test_unlimited_range() {
        let header = content_range(0, None, 5, "post").unwrap();
        assert_eq!(header, "post 0-4/5");
    }

    #[test]
    fn test_invalid_resource_name() {
        assert!(content_range(0, Some(1), 1, "bad\nname").is_none());
    }
}
