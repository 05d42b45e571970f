//! Path pattern normalization and overlap for file reservations.
//!
//! Overlap rule: a pattern is reduced to its literal path components (lexically
//! normalized, glob components and everything after them dropped); two patterns
//! overlap when one component list is a prefix of the other. `src/**` and
//! `src/lib.rs` overlap, `src/a.rs` and `src/b.rs` do not, and a pure glob such
//! as `**/*.rs` covers the whole project.

const GLOB_CHARS: [char; 4] = ['*', '?', '[', '{'];

/// Lexically normalize a pattern: unify separators, drop `.` and empty
/// components, resolve `..`. Leading `/` and `./` are stripped so patterns are
/// always project-relative.
pub fn normalize_pattern(raw: &str) -> String {
    let unified = raw.trim().replace('\\', "/");
    let mut components: Vec<&str> = Vec::new();
    for component in unified.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                components.pop();
            }
            c => components.push(c),
        }
    }
    components.join("/")
}

/// Literal component prefix of a normalized pattern.
pub fn literal_components(pattern: &str) -> Vec<&str> {
    pattern
        .split('/')
        .filter(|c| !c.is_empty())
        .take_while(|c| !c.contains(GLOB_CHARS))
        .collect()
}

pub fn patterns_overlap(a: &str, b: &str) -> bool {
    let a_norm = normalize_pattern(a);
    let b_norm = normalize_pattern(b);
    let a_parts = literal_components(&a_norm);
    let b_parts = literal_components(&b_norm);
    let shared = a_parts.len().min(b_parts.len());
    a_parts[..shared] == b_parts[..shared]
}

/// Trim, normalize and de-duplicate a requested pattern set, keeping order.
/// Patterns that normalize to nothing (e.g. `.` or `..`) are rejected by the
/// caller; a bare glob like `**` is kept verbatim.
pub fn normalize_pattern_set(raw: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(raw.len());
    for p in raw {
        let norm = normalize_pattern(p);
        if norm.is_empty() {
            continue;
        }
        if !out.contains(&norm) {
            out.push(norm);
        }
    }
    out
}
