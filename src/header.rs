//! Joining multi-valued headers into a single string.
//!
//! This is a formatting helper for request pipelines built on top of the
//! tunnel; connection establishment never uses it.

use http::header::{self, HeaderMap, HeaderName, HeaderValue};

/// Headers whose values are joined with `", "` rather than a space.
fn is_comma_joined(name: &HeaderName) -> bool {
    *name == header::ACCEPT || *name == header::ACCEPT_ENCODING
}

/// Join the values of one header.
///
/// Zero values produce an empty string and a single value is returned as-is.
/// Several values are joined with `", "` for `Accept` and `Accept-Encoding`,
/// and with a single space for every other header.
pub fn join_values<I, V>(name: &HeaderName, values: I) -> String
where
    I: IntoIterator<Item = V>,
    V: AsRef<str>,
{
    let separator = if is_comma_joined(name) { ", " } else { " " };

    let mut joined = String::new();
    for (idx, value) in values.into_iter().enumerate() {
        if idx > 0 {
            joined.push_str(separator);
        }
        joined.push_str(value.as_ref());
    }
    joined
}

/// Join every value stored under `name` in `headers`.
///
/// Values which are not visible ASCII are skipped.
pub fn header_string(headers: &HeaderMap, name: &HeaderName) -> String {
    let values = headers
        .get_all(name)
        .iter()
        .filter_map(|value: &HeaderValue| value.to_str().ok());
    join_values(name, values)
}
