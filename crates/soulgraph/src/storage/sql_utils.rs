/// `?, ?, ?` for an `IN (...)` list of `n` bound parameters.
pub fn placeholders(n: usize) -> String {
    std::iter::repeat_n("?", n.max(1))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Bind parameters for `soul = ?1 AND field IN (?2, ...)`.
pub fn soul_and_fields<'a>(soul: &'a str, fields: &'a [String]) -> impl Iterator<Item = &'a str> + 'a {
    std::iter::once(soul).chain(fields.iter().map(String::as_str))
}
