//! Version constraint resolution

use anyhow::{bail, Context, Result};
use semver::{Version, VersionReq};

/// Pick the highest version in `available` satisfying `constraint`.
///
/// `constraint` is `latest` (or empty) or a semver requirement such as `^1.0`.
/// Prereleases are only considered when no stable version qualifies.
/// Unparseable entries in `available` are ignored.
pub fn resolve_version(constraint: &str, available: &[&str]) -> Result<String> {
    let constraint = constraint.trim();
    let req = if constraint.is_empty() || constraint == "latest" {
        None
    } else {
        Some(
            VersionReq::parse(constraint)
                .with_context(|| format!("invalid version constraint '{}'", constraint))?,
        )
    };

    let mut parsed: Vec<Version> = available
        .iter()
        .filter_map(|v| Version::parse(v.trim()).ok())
        .collect();
    parsed.sort();

    let satisfies = |v: &Version, allow_pre: bool| match &req {
        Some(req) => {
            if allow_pre && !v.pre.is_empty() {
                // VersionReq only admits prereleases on a matching comparator
                let stable = Version::new(v.major, v.minor, v.patch);
                req.matches(v) || req.matches(&stable)
            } else {
                req.matches(v)
            }
        }
        None => true,
    };

    let stable = parsed
        .iter()
        .rev()
        .find(|v| v.pre.is_empty() && satisfies(v, false));
    if let Some(v) = stable {
        return Ok(v.to_string());
    }

    let pre = parsed
        .iter()
        .rev()
        .find(|v| !v.pre.is_empty() && satisfies(v, true));
    if let Some(v) = pre {
        return Ok(v.to_string());
    }

    bail!(
        "no version satisfies '{}' (available: {})",
        if constraint.is_empty() { "latest" } else { constraint },
        available.join(", ")
    )
}

/// Whether `version` satisfies `constraint`; bad input never satisfies
pub fn satisfies(version: &str, constraint: &str) -> bool {
    match (Version::parse(version), VersionReq::parse(constraint)) {
        (Ok(v), Ok(req)) => req.matches(&v),
        _ => false,
    }
}
