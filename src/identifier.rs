use crate::errors::EngineResult;
use crate::models::CategoryId;
use crate::store::Store;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

// ASCII only: `\d` would also accept other Unicode digit classes.
static TRAILING_DIGITS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^(.*?)([0-9]+)$").expect("valid regex"));

/// Adds one to a decimal digit string with carry. Width is kept unless the carry
/// overflows the leftmost digit.
fn increment_digits(digits: &str) -> String {
    let mut bytes = digits.as_bytes().to_vec();
    for byte in bytes.iter_mut().rev() {
        if *byte == b'9' {
            *byte = b'0';
        } else {
            *byte += 1;
            return String::from_utf8_lossy(&bytes).into_owned();
        }
    }
    let mut widened = String::with_capacity(bytes.len() + 1);
    widened.push('1');
    widened.push_str(&String::from_utf8_lossy(&bytes));
    widened
}

/// Increments the trailing digit run of `candidate`, or `None` when it has none.
pub fn increment_identifier(candidate: &str) -> Option<String> {
    let captures = TRAILING_DIGITS.captures(candidate)?;
    let prefix = captures.get(1).map_or("", |m| m.as_str());
    let digits = captures.get(2)?.as_str();
    Some(format!("{}{}", prefix, increment_digits(digits)))
}

/// Next identifier after `candidate` that is not in `taken`. The candidate itself
/// is never returned.
pub fn next_unused_in(candidate: Option<&str>, taken: &HashSet<String>) -> Option<String> {
    let mut current = increment_identifier(candidate?)?;
    while taken.contains(&current) {
        current = increment_identifier(&current)?;
    }
    Some(current)
}

/// `<identifier>_<n>` with the smallest free `n`.
pub fn suffixed_unused_in(identifier: &str, taken: &HashSet<String>) -> String {
    let mut n = 1u64;
    loop {
        let proposal = format!("{}_{}", identifier, n);
        if !taken.contains(&proposal) {
            return proposal;
        }
        n += 1;
    }
}

pub struct IdentifierResolver<'a, S: Store> {
    store: &'a S,
    suffix_fallback: bool,
}

impl<'a, S: Store> IdentifierResolver<'a, S> {
    pub fn new(store: &'a S, suffix_fallback: bool) -> Self {
        Self { store, suffix_fallback }
    }

    pub fn next_unused(&self, candidate: Option<&str>, category_id: CategoryId) -> EngineResult<Option<String>> {
        let Some(candidate) = candidate else {
            return Ok(None);
        };
        let taken = self.store.list_identifiers_in_category(category_id)?;
        Ok(next_unused_in(Some(candidate), &taken))
    }

    /// Replacement for an identifier that is already used in the destination.
    /// `None` means the identifier has to be cleared.
    pub fn resolve_collision(&self, identifier: &str, taken: &HashSet<String>) -> Option<String> {
        next_unused_in(Some(identifier), taken).or_else(|| {
            self.suffix_fallback
                .then(|| suffixed_unused_in(identifier, taken))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewCategory, ScopeKind};
    use crate::store::SqliteStore;

    fn taken(values: &[&str]) -> HashSet<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn increments_the_trailing_digit_run_as_a_string() {
        let cases: [(Option<&str>, Option<&str>); 15] = [
            (None, None),
            (Some("id"), None),
            (Some("id1a"), None),
            (Some(""), None),
            (Some("id001"), Some("id002")),
            (Some("id9"), Some("id10")),
            (Some("id009"), Some("id010")),
            (Some("id999"), Some("id1000")),
            (Some("0"), Some("1")),
            (Some("-1"), Some("-2")),
            (Some("09"), Some("10")),
            (Some("1.0E+29"), Some("1.0E+30")),
            (Some("1.0E-29"), Some("1.0E-30")),
            (Some("10.9"), Some("10.10")),
            (Some("99"), Some("100")),
        ];
        let empty = HashSet::new();
        for (input, expected) in cases {
            assert_eq!(
                next_unused_in(input, &empty).as_deref(),
                expected,
                "input {:?}",
                input
            );
        }
    }

    #[test]
    fn increment_is_not_bounded_by_machine_integers() {
        let huge = "x99999999999999999999999999999999";
        assert_eq!(
            increment_identifier(huge).as_deref(),
            Some("x100000000000000000000000000000000")
        );
    }

    #[test]
    fn skips_identifiers_already_in_use() {
        let used = taken(&["id9", "id10", "id010"]);
        assert_eq!(next_unused_in(Some("id9"), &used).as_deref(), Some("id11"));
        assert_eq!(next_unused_in(Some("id8"), &used).as_deref(), Some("id11"));
        assert_eq!(next_unused_in(Some("id009"), &used).as_deref(), Some("id011"));
    }

    #[test]
    fn collision_without_digits_falls_back_to_suffix() {
        let store = SqliteStore::open_in_memory().expect("store");
        let used = taken(&["intro", "intro_1"]);

        let resolver = IdentifierResolver::new(&store, true);
        assert_eq!(resolver.resolve_collision("intro", &used).as_deref(), Some("intro_2"));
        assert_eq!(resolver.resolve_collision("q7", &taken(&["q7"])).as_deref(), Some("q8"));

        let strict = IdentifierResolver::new(&store, false);
        assert_eq!(strict.resolve_collision("intro", &used), None);
    }

    #[test]
    fn probes_only_the_requested_category() {
        let store = SqliteStore::open_in_memory().expect("store");
        let scope = store.insert_scope(ScopeKind::Global, None).expect("scope");
        let new_category = |name: &str| NewCategory {
            scope_id: scope.id,
            parent_id: None,
            name: name.to_string(),
            is_top: false,
        };
        let category = store.insert_category(&new_category("a")).expect("a");
        let other = store.insert_category(&new_category("b")).expect("b");
        store.insert_item(category.id, Some("id9"), "truefalse").expect("item");
        store.insert_item(category.id, Some("id10"), "truefalse").expect("item");
        store.insert_item(other.id, Some("id11"), "truefalse").expect("item");

        let resolver = IdentifierResolver::new(&store, true);
        assert_eq!(
            resolver.next_unused(Some("id9"), category.id).expect("resolve").as_deref(),
            Some("id11")
        );
        assert_eq!(
            resolver.next_unused(Some("id009"), category.id).expect("resolve").as_deref(),
            Some("id010")
        );
        assert_eq!(resolver.next_unused(None, category.id).expect("resolve"), None);
    }
}
