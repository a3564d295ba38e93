//! Ordered, case-preserving environment mapping with diff and merge.
//!
//! Hooks mutate the job environment by running in a child shell; the
//! runtime captures a dump of the environment before and after, diffs
//! the two, and merges the result back. This crate is that data model:
//! an insertion-ordered name→value mapping whose name comparison is
//! case-insensitive on Windows and case-sensitive elsewhere, plus the
//! dump format the hook wrapper writes.

use serde::{Deserialize, Serialize};

/// Compare environment variable names per platform convention.
#[cfg(windows)]
fn key_eq(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

#[cfg(not(windows))]
fn key_eq(a: &str, b: &str) -> bool {
    a == b
}

/// An insertion-ordered environment mapping. Names preserve the case
/// they were first set with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    entries: Vec<(String, String)>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the calling process environment.
    pub fn from_process() -> Self {
        std::env::vars().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| key_eq(k, name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Set `name` to `value`. An existing entry keeps its position (and
    /// its original name casing on Windows); a new one is appended.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| key_eq(k, &name)) {
            Some((_, v)) => *v = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Set `name` only when absent.
    pub fn set_default(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        if !self.contains(&name) {
            self.set(name, value);
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let idx = self.entries.iter().position(|(k, _)| key_eq(k, name))?;
        Some(self.entries.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Merge every entry of `other` into `self` (set semantics).
    pub fn merge(&mut self, other: &Environment) {
        for (k, v) in other.iter() {
            self.set(k, v);
        }
    }

    /// Set-difference against an older snapshot: what was added, what
    /// changed, and what disappeared since `before`.
    pub fn diff(&self, before: &Environment) -> Diff {
        let mut diff = Diff::default();
        for (k, v) in self.iter() {
            match before.get(k) {
                None => diff.added.push((k.to_string(), v.to_string())),
                Some(old) if old != v => diff.changed.push((k.to_string(), v.to_string())),
                Some(_) => {}
            }
        }
        for (k, _) in before.iter() {
            if !self.contains(k) {
                diff.removed.push(k.to_string());
            }
        }
        diff
    }

    /// Apply a captured diff: additions and changes are set, removals
    /// are dropped.
    pub fn apply(&mut self, diff: &Diff) {
        for (k, v) in diff.added.iter().chain(diff.changed.iter()) {
            self.set(k.clone(), v.clone());
        }
        for k in &diff.removed {
            self.remove(k);
        }
    }

    /// Render the dump format consumed by [`Environment::parse_dump`]:
    /// one `NAME=value` line per entry. Values containing newlines span
    /// several physical lines, exactly as `env(1)` prints them.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (k, v) in self.iter() {
            out.push_str(k);
            out.push('=');
            out.push_str(v);
            out.push('\n');
        }
        out
    }

    /// Parse an `env(1)`-style dump. A line without `=` is a
    /// continuation of the previous entry's value.
    pub fn parse_dump(dump: &str) -> Self {
        let mut env = Environment::new();
        let mut current: Option<(String, String)> = None;
        // The dump ends in a newline that terminates the last entry; it
        // is not an empty continuation line.
        let dump = dump.strip_suffix('\n').unwrap_or(dump);
        for line in dump.split('\n') {
            match line.split_once('=') {
                Some((name, value)) if is_valid_name(name) => {
                    if let Some((k, v)) = current.take() {
                        env.set(k, v);
                    }
                    current = Some((name.to_string(), value.to_string()));
                }
                _ => {
                    // Continuation of a multi-line value. Stray leading
                    // lines without a current entry are dropped.
                    if let Some((_, v)) = current.as_mut() {
                        v.push('\n');
                        v.push_str(line);
                    }
                }
            }
        }
        if let Some((k, v)) = current.take() {
            env.set(k, v);
        }
        env
    }
}

impl FromIterator<(String, String)> for Environment {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut env = Environment::new();
        for (k, v) in iter {
            env.set(k, v);
        }
        env
    }
}

impl<'a> IntoIterator for &'a Environment {
    type Item = (&'a str, &'a str);
    type IntoIter = Box<dyn Iterator<Item = (&'a str, &'a str)> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }
}

/// Shell variable names: alphanumerics and underscores, not starting
/// with a digit. Anything else on a dump line is treated as value
/// continuation.
fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Result of [`Environment::diff`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diff {
    pub added: Vec<(String, String)>,
    pub changed: Vec<(String, String)>,
    pub removed: Vec<String>,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }

    /// Names touched by this diff (added or changed), with their new
    /// values.
    pub fn touched(&self) -> impl Iterator<Item = (&str, &str)> {
        self.added
            .iter()
            .chain(self.changed.iter())
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Environment {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn set_preserves_insertion_order() {
        let mut e = Environment::new();
        e.set("B", "1");
        e.set("A", "2");
        e.set("B", "3");
        let keys: Vec<&str> = e.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["B", "A"]);
        assert_eq!(e.get("B"), Some("3"));
    }

    #[test]
    fn set_default_only_fills_gaps() {
        let mut e = env(&[("PATH", "/bin")]);
        e.set_default("PATH", "/other");
        e.set_default("HOME", "/root");
        assert_eq!(e.get("PATH"), Some("/bin"));
        assert_eq!(e.get("HOME"), Some("/root"));
    }

    #[test]
    fn diff_classifies_added_changed_removed() {
        let before = env(&[("KEEP", "same"), ("CHANGE", "old"), ("DROP", "x")]);
        let after = env(&[("KEEP", "same"), ("CHANGE", "new"), ("ADD", "y")]);
        let d = after.diff(&before);
        assert_eq!(d.added, vec![("ADD".to_string(), "y".to_string())]);
        assert_eq!(d.changed, vec![("CHANGE".to_string(), "new".to_string())]);
        assert_eq!(d.removed, vec!["DROP".to_string()]);
    }

    #[test]
    fn apply_realises_the_diff() {
        let before = env(&[("KEEP", "same"), ("CHANGE", "old"), ("DROP", "x")]);
        let after = env(&[("KEEP", "same"), ("CHANGE", "new"), ("ADD", "y")]);
        let d = after.diff(&before);

        let mut target = before.clone();
        target.apply(&d);
        assert_eq!(target.get("CHANGE"), Some("new"));
        assert_eq!(target.get("ADD"), Some("y"));
        assert_eq!(target.get("DROP"), None);
    }

    #[test]
    fn merge_overwrites_and_appends() {
        let mut base = env(&[("A", "1"), ("B", "2")]);
        base.merge(&env(&[("B", "20"), ("C", "3")]));
        assert_eq!(base.get("A"), Some("1"));
        assert_eq!(base.get("B"), Some("20"));
        assert_eq!(base.get("C"), Some("3"));
    }

    #[test]
    fn dump_then_parse_roundtrips() {
        let e = env(&[("SIMPLE", "value"), ("EMPTY", ""), ("SPACED", "a b c")]);
        assert_eq!(Environment::parse_dump(&e.dump()), e);
    }

    #[test]
    fn parse_joins_multiline_values() {
        let e = env(&[
            ("KEY", "-----BEGIN-----\nabc\n-----END-----"),
            ("AFTER", "1"),
        ]);
        let parsed = Environment::parse_dump(&e.dump());
        assert_eq!(parsed, e);
    }

    #[test]
    fn parse_ignores_leading_noise() {
        let parsed = Environment::parse_dump("not a var line\nREAL=1\n");
        assert_eq!(parsed.get("REAL"), Some("1"));
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn value_with_equals_keeps_remainder() {
        let parsed = Environment::parse_dump("CONN=host=db;port=5432\n");
        assert_eq!(parsed.get("CONN"), Some("host=db;port=5432"));
    }

    #[cfg(windows)]
    #[test]
    fn lookup_is_case_insensitive_on_windows() {
        let mut e = Environment::new();
        e.set("Path", "C:\\bin");
        assert_eq!(e.get("PATH"), Some("C:\\bin"));
        e.set("PATH", "C:\\other");
        assert_eq!(e.len(), 1);
    }

    #[cfg(not(windows))]
    #[test]
    fn lookup_is_case_sensitive_elsewhere() {
        let mut e = Environment::new();
        e.set("Path", "/bin");
        assert_eq!(e.get("PATH"), None);
    }
}

#[cfg(test)]
mod properties {
    use super::*;
    use proptest::prelude::*;

    fn name_strategy() -> impl Strategy<Value = String> {
        "[A-Z_][A-Z0-9_]{0,15}"
    }

    fn value_strategy() -> impl Strategy<Value = String> {
        // Values may contain anything printable, including newlines and
        // equals signs.
        "[ -~\n]{0,30}"
    }

    proptest! {
        /// parse(dump(env)) == env, modulo ordering (ordering is in fact
        /// preserved, so plain equality holds).
        #[test]
        fn dump_parse_roundtrip(
            pairs in prop::collection::btree_map(name_strategy(), value_strategy(), 0..10)
        ) {
            // Values whose trailing lines look like NAME= lines are
            // legitimately ambiguous in env(1) output; the dump format
            // is only required to round-trip values that do not embed a
            // full assignment line.
            let safe = pairs.iter().all(|(_, v)| {
                v.split('\n').skip(1).all(|l| l.split_once('=').is_none_or(|(n, _)| !super::is_valid_name(n)))
            });
            prop_assume!(safe);

            let env: Environment = pairs
                .into_iter()
                .collect();
            let parsed = Environment::parse_dump(&env.dump());
            prop_assert_eq!(parsed, env);
        }

        /// Applying a diff of (after, before) onto before yields after,
        /// modulo ordering.
        #[test]
        fn diff_apply_recovers_after(
            before in prop::collection::btree_map(name_strategy(), "[a-z]{0,8}", 0..8),
            after in prop::collection::btree_map(name_strategy(), "[a-z]{0,8}", 0..8),
        ) {
            let before: Environment = before.into_iter().collect();
            let after: Environment = after.into_iter().collect();
            let diff = after.diff(&before);

            let mut rebuilt = before.clone();
            rebuilt.apply(&diff);

            let mut rebuilt_pairs: Vec<_> = rebuilt.iter().collect();
            let mut after_pairs: Vec<_> = after.iter().collect();
            rebuilt_pairs.sort();
            after_pairs.sort();
            prop_assert_eq!(rebuilt_pairs, after_pairs);
        }
    }
}
