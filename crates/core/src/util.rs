use std::path::{Path, PathBuf};

/// Join two paths, only including the normal components of `path`. `..` and
/// absolute prefixes in `path` cannot escape `base`.
pub fn join_normalized(base: impl AsRef<Path>, path: impl AsRef<Path>) -> PathBuf {
    let mut out = base.as_ref().to_path_buf();
    out.extend(path.as_ref().components().filter(|v| matches!(v, std::path::Component::Normal(_))));
    out
}

/// Replace path-hostile characters in a single path component.
pub fn sanitize_component(value: &str) -> String {
    value.replace(['/', '\\', ':', '*', '?', '"', '<', '>', '|'], "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_normalized_strips_escapes() {
        let cases: &[(&str, &str)] = &[
            ("org/repo", "base/org/repo"),
            ("../../etc/passwd", "base/etc/passwd"),
            ("/abs/path", "base/abs/path"),
            ("./dot/repo", "base/dot/repo"),
        ];
        for &(input, expected) in cases {
            assert_eq!(join_normalized("base", input), PathBuf::from(expected));
        }
    }

    #[test]
    fn sanitize_component_replaces_separators() {
        assert_eq!(sanitize_component("a/b:c"), "a_b_c");
        assert_eq!(sanitize_component("plain"), "plain");
    }
}
