//! Attribution of generated images to a reply.

use std::collections::HashSet;

/// Images present in `current` but not in `previous`, in `current`'s order.
#[must_use]
pub fn diff_images(previous: &[String], current: &[String]) -> Vec<String> {
    let before: HashSet<&str> = previous.iter().map(String::as_str).collect();
    let mut seen = HashSet::new();
    current
        .iter()
        .filter(|name| !before.contains(name.as_str()) && seen.insert(name.as_str()))
        .cloned()
        .collect()
}
