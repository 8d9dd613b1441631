//! Kind priority table used by the ordered instantiator.

use std::cmp::Ordering;

/// Lower applies first. Platform-specific kinds start at 100.
const PRIORITY: &[(&str, u32)] = &[
    ("secret", 1),
    ("configmap", 2),
    ("service", 3),
    ("metric", 4),
    ("ingress", 5),
    ("deployment", 10),
    ("application", 11),
    ("daemonset", 12),
    ("statefulset", 13),
    ("job", 14),
    ("hpa", 100),
    ("servicemonitor", 101),
    ("gamedeployment", 102),
    ("gamestatefulset", 103),
];

/// Workloads are never pushed on the rollback stack.
const TERMINAL: &[&str] = &["deployment", "application", "daemonset", "statefulset", "job"];

/// Normalized registry/table name for a kind ("ConfigMap" -> "configmap").
pub fn normalize(kind: &str) -> String {
    kind.trim().to_ascii_lowercase()
}

/// Priority of a kind, `None` when the table does not list it.
pub fn priority(kind: &str) -> Option<u32> {
    let k = normalize(kind);
    PRIORITY.iter().find(|(name, _)| *name == k).map(|(_, p)| *p)
}

/// Total order: tabled kinds by priority, unlisted kinds after all of them.
pub fn compare(a: &str, b: &str) -> Ordering {
    match (priority(a), priority(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Stable sort by priority; ties keep insertion order.
pub fn sort_by_priority<T>(items: &mut [T], kind_of: impl Fn(&T) -> &str) {
    items.sort_by(|a, b| compare(kind_of(a), kind_of(b)));
}

pub fn is_terminal(kind: &str) -> bool {
    let k = normalize(kind);
    TERMINAL.iter().any(|t| *t == k)
}

/// Every kind listed in the priority table.
pub fn tabled_kinds() -> impl Iterator<Item = &'static str> {
    PRIORITY.iter().map(|(k, _)| *k)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlisted_kinds_sort_after_every_tabled_kind() {
        for tabled in tabled_kinds() {
            assert_eq!(compare(tabled, "Widget"), Ordering::Less, "{tabled}");
            assert_eq!(compare("Widget", tabled), Ordering::Greater, "{tabled}");
        }
        assert_eq!(compare("Widget", "Gadget"), Ordering::Equal);
    }

    #[test]
    fn sort_is_stable_and_case_insensitive() {
        let mut kinds = vec!["Deployment", "zeta", "ConfigMap", "alpha", "Secret", "service"];
        sort_by_priority(&mut kinds, |k| *k);
        assert_eq!(kinds, vec!["Secret", "ConfigMap", "service", "Deployment", "zeta", "alpha"]);
    }

    #[test]
    fn workloads_are_terminal() {
        assert!(is_terminal("Deployment"));
        assert!(is_terminal("application"));
        assert!(!is_terminal("configmap"));
        assert!(!is_terminal("hpa"));
    }
}
