//! Dot-separated numeric version helpers used for upgrade checks.

/// Split a version string into numeric components.
///
/// A leading `v` is ignored and any pre-release/build suffix
/// (`1.2.3-beta`, `1.2.3+7`) is dropped; non-numeric components count as 0.
fn components(version: &str) -> Vec<u64> {
    let trimmed = version.trim();
    let trimmed = trimmed
        .strip_prefix(['v', 'V'])
        .unwrap_or(trimmed);
    let core = trimmed.split(['-', '+']).next().unwrap_or_default();
    core.split('.')
        .map(|part| part.trim().parse::<u64>().unwrap_or(0))
        .collect()
}

/// Returns true when `actual` is greater than or equal to `required`.
///
/// `*` as `actual` satisfies any requirement. Missing trailing components are
/// treated as 0, so `1.2` equals `1.2.0`.
pub fn compare(required: &str, actual: &str) -> bool {
    if actual.trim() == "*" || required.trim() == actual.trim() {
        return true;
    }
    let req = components(required);
    let act = components(actual);
    let len = req.len().max(act.len());
    for i in 0..len {
        let r = req.get(i).copied().unwrap_or(0);
        let a = act.get(i).copied().unwrap_or(0);
        if a != r {
            return a > r;
        }
    }
    true
}

/// Increment the patch component of `x.y.z`. Versions with fewer than three
/// components are returned unchanged.
pub fn bump_patch(version: &str) -> String {
    let mut parts: Vec<String> = version.split('.').map(str::to_string).collect();
    if let Some(patch) = parts.get_mut(2) {
        let digits: String = patch.chars().take_while(|c| c.is_ascii_digit()).collect();
        if let Ok(n) = digits.parse::<u64>() {
            *patch = n.saturating_add(1).to_string();
        }
    }
    parts.join(".")
}
