//! Platform-aware map resolution.
//!
//! Inputs may multiplex values per platform under keyword keys
//! (`darwin`, `linux`, ...). Given an ordered selector list
//! (most-specific first), the resolver collapses each keyword-bearing
//! map to the value under the first matching selector; keyword-free
//! maps keep their shape with children resolved recursively.

use std::collections::HashSet;

/// Keyword set recognised by default.
pub const DEFAULT_KEYWORDS: &[&str] = &[
    "all", "any", "unix", "posix", "linux", "darwin", "macos", "windows",
];

#[derive(Debug, Clone)]
pub struct PlatformResolver {
    keywords: HashSet<String>,
    /// Most-specific first, e.g. `["darwin", "unix", "all"]`.
    selectors: Vec<String>,
}

impl PlatformResolver {
    pub fn new<S: AsRef<str>>(selectors: &[S]) -> Self {
        Self::with_keywords(selectors, DEFAULT_KEYWORDS)
    }

    pub fn with_keywords<S: AsRef<str>, K: AsRef<str>>(selectors: &[S], keywords: &[K]) -> Self {
        Self {
            keywords: keywords.iter().map(|k| k.as_ref().to_string()).collect(),
            selectors: selectors.iter().map(|s| s.as_ref().to_string()).collect(),
        }
    }

    /// Reduce a map to the single variant matching this resolver's
    /// selectors. `None` means the position resolves to absence: a
    /// null value, or keyword siblings none of which match.
    pub fn resolve(&self, value: &serde_json::Value) -> Option<serde_json::Value> {
        match value {
            serde_json::Value::Null => None,
            serde_json::Value::Object(fields) => {
                let has_keyword = fields.keys().any(|k| self.keywords.contains(k));
                if has_keyword {
                    // First selector present wins; non-matching keyword
                    // siblings (and any stray non-keyword siblings at
                    // this level) are discarded.
                    for selector in &self.selectors {
                        if let Some(chosen) = fields.get(selector) {
                            return self.resolve(chosen);
                        }
                    }
                    None
                } else {
                    let mut resolved = serde_json::Map::new();
                    for (key, sub) in fields {
                        if let Some(kept) = self.resolve(sub) {
                            resolved.insert(key.clone(), kept);
                        }
                    }
                    Some(serde_json::Value::Object(resolved))
                }
            }
            other => Some(other.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resolver() -> PlatformResolver {
        PlatformResolver::with_keywords(
            &["darwin", "unix", "all"],
            &["darwin", "linux", "unix", "windows", "all"],
        )
    }

    #[test]
    fn first_matching_selector_wins() {
        let input = json!({
            "key1": {"darwin": "v1", "linux": "v2"},
            "key2": {"linux": "v2", "unix": "u2"},
            "key3": {"windows": "w3", "all": "a3"},
            "key4": {"windows": {"sub": "w4"}},
        });
        let resolved = resolver().resolve(&input).unwrap();
        assert_eq!(
            resolved,
            json!({"key1": "v1", "key2": "u2", "key3": "a3"})
        );
    }

    #[test]
    fn keyword_free_maps_keep_their_shape() {
        let input = json!({"nested": {"plain": {"all": 5}}, "scalar": 1});
        let resolved = resolver().resolve(&input).unwrap();
        assert_eq!(resolved, json!({"nested": {"plain": 5}, "scalar": 1}));
    }

    #[test]
    fn null_resolves_to_absence() {
        let input = json!({"gone": null, "kept": 1});
        let resolved = resolver().resolve(&input).unwrap();
        assert_eq!(resolved, json!({"kept": 1}));

        let input = json!({"sel": {"darwin": null}});
        let resolved = resolver().resolve(&input).unwrap();
        assert_eq!(resolved, json!({}));
    }

    #[test]
    fn selection_short_circuits_on_most_specific() {
        let input = json!({"k": {"unix": "generic", "darwin": "specific"}});
        let resolved = resolver().resolve(&input).unwrap();
        assert_eq!(resolved, json!({"k": "specific"}));
    }

    #[test]
    fn default_keywords_cover_common_platforms() {
        let resolver = PlatformResolver::new(&["linux", "posix", "all"]);
        let input = json!({"k": {"posix": 1, "windows": 2}});
        assert_eq!(resolver.resolve(&input).unwrap(), json!({"k": 1}));
    }
}
