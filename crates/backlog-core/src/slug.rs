/// Normalise a job name into its lookup key.
///
/// Lowercases and joins alphanumeric runs with `-`, so the result only ever
/// contains `[a-z0-9-]` (plus lowercase non-ASCII letters) and is safe as a
/// filename component. Leading/trailing separators are dropped.
pub fn slugify(name: &str) -> String {
    name.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(|word| word.to_lowercase())
        .collect::<Vec<_>>()
        .join("-")
}
