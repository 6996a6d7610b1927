//! Cache key construction.

use std::fmt::Display;

/// Joins key parts with `:`, e.g. `make_key(["val", "100"])` → `"val:100"`.
pub fn make_key<I, T>(parts: I) -> String
where
    I: IntoIterator<Item = T>,
    T: Display,
{
    parts
        .into_iter()
        .map(|part| part.to_string())
        .collect::<Vec<_>>()
        .join(":")
}
