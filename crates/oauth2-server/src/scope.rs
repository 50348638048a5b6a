//! Hierarchical scope matching.
//!
//! Scopes are colon-delimited segments (`user:profile:read`); scope lists are
//! space-delimited. A segment that is exactly `*` matches any one segment,
//! and a trailing `*` also covers everything nested below it. The pattern
//! `a:*` therefore matches `a:b` and `a:b:c` but not `a` itself. The bare
//! pattern `*` matches every scope.

const WILDCARD: &str = "*";

/// Split a space-delimited scope list into trimmed, non-empty tokens.
pub fn tokens(list: &str) -> impl Iterator<Item = &str> {
    list.split_whitespace()
}

/// Normalize a scope list: collapse whitespace, keep order.
pub fn normalize(list: &str) -> String {
    tokens(list).collect::<Vec<_>>().join(" ")
}

fn pattern_covers(pattern: &str, required: &str) -> bool {
    if pattern == WILDCARD {
        return true;
    }

    let pat: Vec<&str> = pattern.split(':').collect();
    let req: Vec<&str> = required.split(':').collect();
    if req.len() < pat.len() {
        return false;
    }

    let prefix_ok = pat
        .iter()
        .zip(&req)
        .all(|(p, r)| *p == WILDCARD || p == r);
    if !prefix_ok {
        return false;
    }

    req.len() == pat.len() || pat.last() == Some(&WILDCARD)
}

/// Does one required scope fall under `allowed`?
///
/// An empty `required` is always satisfied. A non-empty one against an empty
/// or blank `allowed` never is.
pub fn match_scope(required: &str, allowed: &str) -> bool {
    let required = required.trim();
    if required.is_empty() {
        return true;
    }
    tokens(allowed).any(|pattern| pattern_covers(pattern, required))
}

/// Every token of `required` must be covered by `allowed`.
///
/// An empty list on either side is a rejection.
pub fn match_scopes_strict(required: &str, allowed: &str) -> bool {
    let mut required = tokens(required).peekable();
    if required.peek().is_none() || tokens(allowed).next().is_none() {
        return false;
    }
    required.all(|r| match_scope(r, allowed))
}

/// At least one token of `required` must be covered by `allowed`.
pub fn match_scopes(required: &str, allowed: &str) -> bool {
    if tokens(allowed).next().is_none() {
        return false;
    }
    tokens(required).any(|r| match_scope(r, allowed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_and_list_membership() {
        assert!(match_scope("user:read", "user:read user:write"));
        assert!(match_scope("merchant:member", "merchant:member"));
        assert!(!match_scope("user:delete", "user:read user:write"));
    }

    #[test]
    fn test_trailing_wildcard_covers_descendants() {
        assert!(match_scope("user:read", "user:*"));
        assert!(match_scope("user:read:1", "user:read:*"));
        assert!(match_scope("merchant:member", "merchant:*"));
        assert!(match_scope("merchant:member:read", "merchant:*"));
        assert!(match_scope("merchant:member:read", "merchant:member:*"));
    }

    #[test]
    fn test_wildcard_does_not_cover_parent() {
        assert!(!match_scope("merchant", "merchant:*"));
        assert!(!match_scope("a", "a:*"));
        assert!(match_scope("a:b:c", "a:*"));
    }

    #[test]
    fn test_inner_wildcard_is_single_segment() {
        assert!(match_scope("merchant:member:read", "merchant:*:*"));
        assert!(match_scope("merchant:member:read", "merchant:*:read"));
        assert!(!match_scope("merchant:member:write", "merchant:*:read"));
        assert!(!match_scope("merchant:member:read:x", "merchant:*:read"));
    }

    #[test]
    fn test_bare_wildcard_matches_everything() {
        assert!(match_scope("merchant:member:read", "*"));
        assert!(match_scope("x", "user:read *"));
    }

    #[test]
    fn test_star_inside_segment_is_literal() {
        assert!(!match_scope("user:read", "user:re*"));
        assert!(match_scope("user:re*", "user:re*"));
    }

    #[test]
    fn test_empty_inputs() {
        assert!(match_scope("", ""));
        assert!(match_scope("  ", "user:read"));
        assert!(!match_scope("merchant:member", ""));
        assert!(!match_scope("merchant:member", " "));
    }

    #[test]
    fn test_strict_requires_every_token() {
        assert!(match_scopes_strict("user:read user:write", "user:*"));
        assert!(!match_scopes_strict("user:read client:read", "user:*"));
        assert!(!match_scopes_strict("", "user:*"));
        assert!(!match_scopes_strict("user:read", "   "));
    }

    #[test]
    fn test_strict_tolerates_messy_whitespace() {
        assert!(match_scopes_strict("  user:read   user:write ", "user:read  user:write"));
    }

    #[test]
    fn test_any_requires_one_token() {
        assert!(match_scopes("user:read client:delete", "user:*"));
        assert!(!match_scopes("client:delete", "user:*"));
        assert!(!match_scopes("user:read", ""));
        assert!(!match_scopes("", "user:*"));
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  user:read   user:write "), "user:read user:write");
        assert_eq!(normalize(""), "");
    }
}
