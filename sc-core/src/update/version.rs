//! Dotted version comparison.
//!
//! Versions are compared numerically segment by segment (`1.10.0 > 1.9.3`),
//! missing segments count as zero, a leading `v` is ignored, and a
//! pre-release suffix (`1.2.0-beta`) sorts before the plain release.

use std::cmp::Ordering;

fn split(version: &str) -> (Vec<u64>, Option<&str>) {
    let v = version.trim();
    let v = v.strip_prefix(['v', 'V']).unwrap_or(v);
    let v = v.split('+').next().unwrap_or(v);
    let (core, pre) = match v.split_once('-') {
        Some((core, pre)) => (core, Some(pre)),
        None => (v, None),
    };
    let nums = core
        .split('.')
        .map(|seg| {
            let digits: String = seg.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().unwrap_or(0)
        })
        .collect();
    (nums, pre)
}

pub fn compare(a: &str, b: &str) -> Ordering {
    let (na, pa) = split(a);
    let (nb, pb) = split(b);
    let len = na.len().max(nb.len());
    for i in 0..len {
        let x = na.get(i).copied().unwrap_or(0);
        let y = nb.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    match (pa, pb) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(x), Some(y)) => x.cmp(y),
    }
}

/// `true` when `candidate` is strictly newer than `current`.
pub fn is_newer(candidate: &str, current: &str) -> bool {
    compare(candidate, current) == Ordering::Greater
}

const MAX_VERSION_LEN: usize = 64;

/// Whether a manifest version is safe to put in file names and install
/// scripts: 1..=64 characters from `[0-9A-Za-z.+-]`.
pub fn is_valid(version: &str) -> bool {
    !version.is_empty()
        && version.len() <= MAX_VERSION_LEN
        && version
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '+' | '-'))
}

/// File-system safe form of a version, used for staging directories and
/// script names.
pub fn sanitize(version: &str) -> String {
    version
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_not_lexical() {
        assert!(is_newer("1.10.0", "1.9.3"));
        assert!(!is_newer("1.9.3", "1.10.0"));
    }

    #[test]
    fn missing_segments_are_zero() {
        assert_eq!(compare("1.2", "1.2.0"), Ordering::Equal);
        assert!(!is_newer("1.2", "1.2.0"));
    }

    #[test]
    fn prefix_and_build_metadata() {
        assert_eq!(compare("v2.0.1", "2.0.1+abc"), Ordering::Equal);
    }

    #[test]
    fn shell_metacharacters_are_invalid() {
        assert!(is_valid("2.4.1"));
        assert!(is_valid("v2.4.1-rc.2+build.7"));
        assert!(!is_valid(""));
        assert!(!is_valid(r#"9.0.0"; touch /tmp/pwned; echo ""#));
        assert!(!is_valid("1.0.0 && reboot"));
        assert!(!is_valid("1.0.0\nrm -rf /"));
        assert!(!is_valid("1.0.0%PATH%"));
        assert!(!is_valid(&"1".repeat(65)));
    }

    #[test]
    fn sanitize_replaces_separators() {
        assert_eq!(sanitize("1.2.0/../x"), "1.2.0_.._x");
        assert_eq!(sanitize(r#"9.0.0"; touch"#), "9.0.0___touch");
    }

    #[test]
    fn prerelease_sorts_first() {
        assert!(is_newer("1.2.0", "1.2.0-beta"));
        assert!(is_newer("1.2.0-rc.1", "1.1.9"));
    }
}
