//! Authority-domain validation and similarity
//!
//! An authority domain is the externally advertised name of a remote
//! cluster and the primary key of a site. Syntactically it is a DNS-style
//! name: non-empty dot-separated labels.

/// Maximum length of a full domain name.
const MAX_DOMAIN_LEN: usize = 253;

/// Maximum length of a single label.
const MAX_LABEL_LEN: usize = 63;

/// Check that `name` is a syntactically valid authority domain.
///
/// Labels must be non-empty, at most 63 characters, consist of ASCII
/// alphanumerics and hyphens, and must not start or end with a hyphen.
pub fn is_valid_domain_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_DOMAIN_LEN {
        return false;
    }
    name.split('.').all(is_valid_label)
}

fn is_valid_label(label: &str) -> bool {
    if label.is_empty() || label.len() > MAX_LABEL_LEN {
        return false;
    }
    if label.starts_with('-') || label.ends_with('-') {
        return false;
    }
    label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// Count the trailing dot-separated labels two domain names share.
///
/// `trailing_label_similarity("a.b.c", "x.b.c")` is 2: both end in
/// `b.c`. Zero means not even the top label matches.
pub fn trailing_label_similarity(a: &str, b: &str) -> usize {
    let left: Vec<&str> = a.split('.').collect();
    let right: Vec<&str> = b.split('.').collect();

    left.iter()
        .rev()
        .zip(right.iter().rev())
        .take_while(|(l, r)| l == r)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_domains() {
        assert!(is_valid_domain_name("example.com"));
        assert!(is_valid_domain_name("east.example.com"));
        assert!(is_valid_domain_name("single"));
        assert!(is_valid_domain_name("a-b.c-d.e"));
        assert!(is_valid_domain_name("x1.y2.z3"));
    }

    #[test]
    fn test_invalid_domains() {
        assert!(!is_valid_domain_name(""));
        assert!(!is_valid_domain_name("."));
        assert!(!is_valid_domain_name(".example.com"));
        assert!(!is_valid_domain_name("example..com"));
        assert!(!is_valid_domain_name("example.com."));
        assert!(!is_valid_domain_name("-leading.example.com"));
        assert!(!is_valid_domain_name("trailing-.example.com"));
        assert!(!is_valid_domain_name("under_score.example.com"));
        assert!(!is_valid_domain_name("spa ce.example.com"));
    }

    #[test]
    fn test_label_too_long() {
        let label = "a".repeat(64);
        assert!(!is_valid_domain_name(&format!("{label}.com")));
        assert!(is_valid_domain_name(&format!("{}.com", "a".repeat(63))));
    }

    #[test]
    fn test_similarity_counts_trailing_labels() {
        assert_eq!(trailing_label_similarity("a.b.c", "x.b.c"), 2);
        assert_eq!(trailing_label_similarity("a.b.c", "y.c"), 1);
        assert_eq!(trailing_label_similarity("a.b.c", "z.d"), 0);
        assert_eq!(trailing_label_similarity("a.b.c", "a.b.c"), 3);
        assert_eq!(
            trailing_label_similarity("cache.prod.example.com", "app.prod.example.com"),
            3
        );
    }

    #[test]
    fn test_similarity_is_symmetric() {
        assert_eq!(
            trailing_label_similarity("a.b.c", "b.c"),
            trailing_label_similarity("b.c", "a.b.c"),
        );
    }
}
