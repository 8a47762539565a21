//! Pool slugs.
//!
//! A slug is a lowercase identifier (`[a-z0-9][a-z0-9_-]{0,63}`), optionally
//! scoped to a host as `u{ownerId}__{slug}` for private pools.

use std::fmt;

use crate::error::PolicyError;

pub const GENERAL_POOL: &str = "general";

const SCOPE_SEPARATOR: &str = "__";
const MAX_SLUG_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolSlug {
    owner: Option<i64>,
    base: String,
}

impl PoolSlug {
    /// Parse a shared or already-scoped slug
    pub fn parse(raw: &str) -> Result<Self, PolicyError> {
        if let Some((owner, base)) = split_scope(raw)? {
            if !is_valid_base(base) {
                return Err(PolicyError::InvalidSlug(raw.to_string()));
            }
            return Ok(Self {
                owner: Some(owner),
                base: base.to_string(),
            });
        }

        if !is_valid_base(raw) {
            return Err(PolicyError::InvalidSlug(raw.to_string()));
        }
        Ok(Self {
            owner: None,
            base: raw.to_string(),
        })
    }

    pub fn general() -> Self {
        Self {
            owner: None,
            base: GENERAL_POOL.to_string(),
        }
    }

    /// Owner-private pool for `base`
    pub fn scoped(owner: i64, base: &str) -> Result<Self, PolicyError> {
        if owner < 0 || !is_valid_base(base) {
            return Err(PolicyError::InvalidSlug(format!("u{}{}{}", owner, SCOPE_SEPARATOR, base)));
        }
        Ok(Self {
            owner: Some(owner),
            base: base.to_string(),
        })
    }

    pub fn owner(&self) -> Option<i64> {
        self.owner
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Human-facing name used when the pool is first created
    pub fn display_name(&self) -> String {
        let title = self
            .base
            .split(['-', '_'])
            .filter(|part| !part.is_empty())
            .map(|part| {
                let mut chars = part.chars();
                match chars.next() {
                    Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ");

        match self.owner {
            Some(owner) => format!("{} (host {})", title, owner),
            None => title,
        }
    }
}

impl fmt::Display for PoolSlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.owner {
            Some(owner) => write!(f, "u{}{}{}", owner, SCOPE_SEPARATOR, self.base),
            None => f.write_str(&self.base),
        }
    }
}

/// Work out which pool a credit lands in.
///
/// An explicit owner, or one recovered from an already-scoped slug, routes
/// to that owner's private pool. Without either the shared pool is used.
pub fn resolve_target_pool(
    requested: Option<&str>,
    owner_user_id: Option<i64>,
    default_slug: &str,
) -> Result<PoolSlug, PolicyError> {
    let raw = requested
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(default_slug);
    let parsed = PoolSlug::parse(raw)?;

    match (owner_user_id, parsed.owner) {
        (Some(requested_owner), Some(scoped)) if requested_owner != scoped => {
            Err(PolicyError::OwnerMismatch {
                slug: raw.to_string(),
                scoped,
                requested: requested_owner,
            })
        }
        (Some(owner), _) => PoolSlug::scoped(owner, &parsed.base),
        (None, _) => Ok(parsed),
    }
}

/// `u<digits>__` prefix split off; an owner id out of range is malformed
fn split_scope(raw: &str) -> Result<Option<(i64, &str)>, PolicyError> {
    let Some((owner, base)) = raw
        .strip_prefix('u')
        .and_then(|rest| rest.split_once(SCOPE_SEPARATOR))
    else {
        return Ok(None);
    };
    if owner.is_empty() || !owner.chars().all(|c| c.is_ascii_digit()) {
        return Ok(None);
    }
    owner
        .parse::<i64>()
        .map(|owner| Some((owner, base)))
        .map_err(|_| PolicyError::InvalidSlug(raw.to_string()))
}

fn is_valid_base(value: &str) -> bool {
    let mut chars = value.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    value.len() <= MAX_SLUG_LEN
        && (first.is_ascii_lowercase() || first.is_ascii_digit())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_shared_and_scoped() {
        let shared = PoolSlug::parse("retreat").unwrap();
        assert_eq!(shared.owner(), None);
        assert_eq!(shared.to_string(), "retreat");

        let scoped = PoolSlug::parse("u7__retreat").unwrap();
        assert_eq!(scoped.owner(), Some(7));
        assert_eq!(scoped.base(), "retreat");
        assert_eq!(scoped.to_string(), "u7__retreat");
    }

    #[test]
    fn test_rejects_malformed_slugs() {
        let too_long = "x".repeat(65);
        for bad in ["", " general", "General", "a b", "u7__", "-lead", "pool!", too_long.as_str()] {
            assert!(PoolSlug::parse(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_out_of_range_owner_is_not_a_shared_slug() {
        let err = PoolSlug::parse("u99999999999999999999__x").unwrap_err();
        assert!(matches!(err, PolicyError::InvalidSlug(_)));
        assert!(resolve_target_pool(Some("u99999999999999999999__x"), None, GENERAL_POOL).is_err());
    }

    #[test]
    fn test_owner_routes_to_scoped_pool() {
        let slug = resolve_target_pool(Some("retreat"), Some(7), GENERAL_POOL).unwrap();
        assert_eq!(slug.to_string(), "u7__retreat");

        let recovered = resolve_target_pool(Some("u7__retreat"), None, GENERAL_POOL).unwrap();
        assert_eq!(recovered.owner(), Some(7));

        let same = resolve_target_pool(Some("u7__retreat"), Some(7), GENERAL_POOL).unwrap();
        assert_eq!(same.to_string(), "u7__retreat");
    }

    #[test]
    fn test_no_owner_defaults_to_general() {
        let slug = resolve_target_pool(None, None, GENERAL_POOL).unwrap();
        assert_eq!(slug.to_string(), "general");

        let blank = resolve_target_pool(Some("  "), None, GENERAL_POOL).unwrap();
        assert_eq!(blank.to_string(), "general");
    }

    #[test]
    fn test_owner_conflict_is_rejected() {
        let err = resolve_target_pool(Some("u7__retreat"), Some(8), GENERAL_POOL).unwrap_err();
        assert!(matches!(err, PolicyError::OwnerMismatch { scoped: 7, requested: 8, .. }));
    }

    #[test]
    fn test_display_name() {
        assert_eq!(PoolSlug::general().display_name(), "General");
        assert_eq!(
            PoolSlug::parse("u3__spring-retreat").unwrap().display_name(),
            "Spring Retreat (host 3)"
        );
    }
}
