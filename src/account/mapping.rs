//! Model mapping resolution
//!
//! Maps a client-requested model id onto the official id an account actually
//! targets. Resolution order: exact account mapping, longest wildcard
//! pattern, the platform's supported set (identity), the platform prefix
//! table (longest prefix first), and finally the platform default.

use std::collections::HashMap;

use super::Platform;

/// Default model for Antigravity when nothing else resolves.
pub const ANTIGRAVITY_DEFAULT_MODEL: &str = "claude-sonnet-4-5";

/// Model ids the platform serves directly; requests for these pass through
/// unchanged.
fn supported_set(platform: Platform) -> &'static [&'static str] {
    match platform {
        Platform::Antigravity => &[
            "claude-sonnet-4-5",
            "claude-sonnet-4-5-thinking",
            "claude-haiku-4-5",
            "claude-opus-4-1",
            "gemini-2.5-flash",
            "gemini-2.5-pro",
            "gemini-2.5-flash-image",
            "gemini-3-pro-preview",
        ],
        Platform::Anthropic => &[
            "claude-sonnet-4-5",
            "claude-haiku-4-5",
            "claude-opus-4-1",
            "claude-3-5-haiku-20241022",
        ],
        Platform::Gemini => &[
            "gemini-2.5-flash",
            "gemini-2.5-pro",
            "gemini-3-pro-preview",
        ],
        Platform::OpenAI => &["gpt-5", "gpt-5-codex", "gpt-4.1", "o3"],
        Platform::Sora => &["sora-2", "sora-2-pro"],
    }
}

/// Longest-prefix fallback table per platform.
fn prefix_table(platform: Platform) -> &'static [(&'static str, &'static str)] {
    match platform {
        Platform::Antigravity => &[
            ("claude-sonnet-4", "claude-sonnet-4-5"),
            ("claude-sonnet", "claude-sonnet-4-5"),
            ("claude-haiku", "claude-haiku-4-5"),
            ("claude-opus", "claude-opus-4-1"),
            ("claude-3-5-haiku", "claude-haiku-4-5"),
            ("claude", "claude-sonnet-4-5"),
        ],
        Platform::Anthropic => &[
            ("claude-sonnet", "claude-sonnet-4-5"),
            ("claude-haiku", "claude-haiku-4-5"),
            ("claude-opus", "claude-opus-4-1"),
        ],
        _ => &[],
    }
}

/// Loose support predicate used by transformers: the id belongs to a family
/// the platform can serve at all.
pub fn is_model_supported(platform: Platform, model: &str) -> bool {
    match platform {
        Platform::Antigravity => {
            model.starts_with("claude-") || model.starts_with("gemini-")
        }
        Platform::Anthropic => model.starts_with("claude-"),
        Platform::Gemini => model.starts_with("gemini-"),
        Platform::OpenAI => model.starts_with("gpt-") || model.starts_with('o'),
        Platform::Sora => model.starts_with("sora"),
    }
}

fn platform_fallback(platform: Platform, requested: &str) -> String {
    match platform {
        Platform::Antigravity => {
            // Unlisted gemini ids pass through raw; everything else lands on
            // the default model.
            if requested.starts_with("gemini-") {
                requested.to_string()
            } else {
                ANTIGRAVITY_DEFAULT_MODEL.to_string()
            }
        }
        // Other platforms pass the request through and let the upstream
        // reject unknown ids.
        _ => requested.to_string(),
    }
}

/// Longest wildcard pattern that matches; ties resolved by lexicographic
/// pattern order so resolution is deterministic.
fn wildcard_match<'a>(mapping: &'a HashMap<String, String>, model: &str) -> Option<&'a str> {
    let mut best: Option<(&str, &str)> = None;
    for (pattern, target) in mapping {
        let Some(prefix) = pattern.strip_suffix('*') else {
            continue;
        };
        if !model.starts_with(prefix) {
            continue;
        }
        match best {
            None => best = Some((pattern, target)),
            Some((current, _)) => {
                let longer = pattern.len() > current.len();
                let tie_break = pattern.len() == current.len() && pattern.as_str() < current;
                if longer || tie_break {
                    best = Some((pattern, target));
                }
            }
        }
    }
    best.map(|(_, target)| target)
}

/// Resolve `requested` for an account on `platform` with the account's
/// `mapping` (possibly empty).
pub fn resolve(platform: Platform, mapping: &HashMap<String, String>, requested: &str) -> String {
    if let Some(target) = mapping.get(requested) {
        return target.clone();
    }

    if let Some(target) = wildcard_match(mapping, requested) {
        return target.to_string();
    }

    if supported_set(platform).contains(&requested) {
        return requested.to_string();
    }

    let mut candidates: Vec<_> = prefix_table(platform)
        .iter()
        .filter(|(prefix, _)| requested.starts_with(prefix))
        .collect();
    candidates.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    if let Some((_, target)) = candidates.first() {
        return target.to_string();
    }

    platform_fallback(platform, requested)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_exact_beats_wildcard() {
        let m = mapping(&[
            ("claude-sonnet-4-5", "claude-opus-4-1"),
            ("claude-*", "claude-haiku-4-5"),
        ]);
        assert_eq!(
            resolve(Platform::Antigravity, &m, "claude-sonnet-4-5"),
            "claude-opus-4-1"
        );
    }

    #[test]
    fn test_longest_wildcard_wins() {
        let m = mapping(&[("claude-*", "short"), ("claude-sonnet-*", "long")]);
        assert_eq!(
            resolve(Platform::Antigravity, &m, "claude-sonnet-4-5"),
            "long"
        );
    }

    #[test]
    fn test_wildcard_tie_breaks_lexicographically() {
        let m = mapping(&[("gemini-a*", "a-target"), ("gemini-b*", "b-target")]);
        // Neither matches, both same length otherwise; with a model matching
        // both equal-length patterns, the lexicographically first wins.
        let both = mapping(&[("claude-s*", "s-target"), ("claude-a*", "never")]);
        assert_eq!(resolve(Platform::Antigravity, &m, "gemini-a-x"), "a-target");
        assert_eq!(
            resolve(Platform::Antigravity, &both, "claude-sonnet"),
            "s-target"
        );
    }

    #[test]
    fn test_supported_identity_passthrough() {
        let empty = HashMap::new();
        assert_eq!(
            resolve(Platform::Antigravity, &empty, "gemini-2.5-pro"),
            "gemini-2.5-pro"
        );
        assert_eq!(
            resolve(Platform::Anthropic, &empty, "claude-haiku-4-5"),
            "claude-haiku-4-5"
        );
    }

    #[test]
    fn test_prefix_table_longest_first() {
        let empty = HashMap::new();
        // "claude-sonnet-4-20250514" is not in the supported set; the longest
        // prefix entry ("claude-sonnet-4") must win over the generic one.
        assert_eq!(
            resolve(Platform::Antigravity, &empty, "claude-sonnet-4-20250514"),
            "claude-sonnet-4-5"
        );
        assert_eq!(
            resolve(Platform::Antigravity, &empty, "claude-3-5-haiku-20241022"),
            "claude-haiku-4-5"
        );
    }

    #[test]
    fn test_platform_fallback() {
        let empty = HashMap::new();
        assert_eq!(
            resolve(Platform::Antigravity, &empty, "gpt-4.1"),
            ANTIGRAVITY_DEFAULT_MODEL
        );
        assert_eq!(
            resolve(Platform::Antigravity, &empty, "gemini-exp-1206"),
            "gemini-exp-1206"
        );
        assert_eq!(resolve(Platform::OpenAI, &empty, "gpt-5-codex"), "gpt-5-codex");
    }

    #[test]
    fn test_resolution_is_idempotent_on_supported_results() {
        let m = mapping(&[("claude-3-haiku", "claude-haiku-4-5")]);
        let once = resolve(Platform::Antigravity, &m, "claude-3-haiku");
        let twice = resolve(Platform::Antigravity, &m, &once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_is_model_supported_families() {
        assert!(is_model_supported(Platform::Antigravity, "claude-x"));
        assert!(is_model_supported(Platform::Antigravity, "gemini-x"));
        assert!(!is_model_supported(Platform::Antigravity, "gpt-4"));
        assert!(!is_model_supported(Platform::Anthropic, "gemini-x"));
    }
}
