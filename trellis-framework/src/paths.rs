//! Node path helpers.

use uuid::Uuid;

/// Prefix marking a node name as protected.
pub const PROTECTED_PREFIX: &str = "_c_";

/// Width of the counter the ensemble appends to sequential nodes.
pub const SEQUENCE_WIDTH: usize = 10;

const UUID_WIDTH: usize = 36;

/// Join `parent` and `child` with exactly one separator.
pub fn make_path(parent: &str, child: &str) -> String {
    let parent = parent.trim_end_matches('/');
    let child = child.trim_start_matches('/');

    match (parent.is_empty(), child.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{child}"),
        (false, true) => parent.to_string(),
        (false, false) => format!("{parent}/{child}"),
    }
}

/// Split a path into parent path and node name.
///
/// ```
/// use trellis_framework::paths::split_path;
///
/// assert_eq!(split_path("/a/b/c"), ("/a/b", "c"));
/// assert_eq!(split_path("/a"), ("/", "a"));
/// ```
pub fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(index) => (&path[..index], &path[index + 1..]),
        None => ("/", path),
    }
}

/// Last component of `path`.
pub fn node_name(path: &str) -> &str {
    split_path(path).1
}

/// Trailing sequence counter of a node name or path.
pub fn sequence_of(name: &str) -> Option<u64> {
    let digits = name.get(name.len().checked_sub(SEQUENCE_WIDTH)?..)?;
    if digits.bytes().all(|b| b.is_ascii_digit()) {
        digits.parse().ok()
    } else {
        None
    }
}

/// Sort names by their sequence counter. Names without one sort last, by
/// name.
pub fn sort_by_sequence(names: &mut [String]) {
    names.sort_by(|a, b| match (sequence_of(a), sequence_of(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.cmp(b),
    });
}

/// Name `name` as protected by `id`.
pub fn protected_name(id: &Uuid, name: &str) -> String {
    format!("{PROTECTED_PREFIX}{id}-{name}")
}

/// The protection id of `name`, if it carries one.
pub fn protected_id(name: &str) -> Option<&str> {
    let rest = name.strip_prefix(PROTECTED_PREFIX)?;
    let id = rest.get(..UUID_WIDTH)?;
    (rest.as_bytes().get(UUID_WIDTH) == Some(&b'-') && Uuid::parse_str(id).is_ok()).then_some(id)
}

/// `name` without its protection prefix.
pub fn strip_protection(name: &str) -> &str {
    match protected_id(name) {
        Some(_) => &name[PROTECTED_PREFIX.len() + UUID_WIDTH + 1..],
        None => name,
    }
}

/// Every ancestor of `path`, outermost first, excluding the root.
pub(crate) fn ancestors(path: &str) -> Vec<String> {
    let mut current = String::new();
    let mut result = Vec::new();
    let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();

    for component in components.iter().take(components.len().saturating_sub(1)) {
        current.push('/');
        current.push_str(component);
        result.push(current.clone());
    }
    result
}
