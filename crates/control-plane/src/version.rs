//! Build metadata written by `build.rs`.

include!(concat!(env!("OUT_DIR"), "/version.rs"));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_version_carries_build_metadata() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
        assert!(FULL_VERSION.starts_with(VERSION));
        assert!(FULL_VERSION.contains(GIT_SHA));
        assert_eq!(FULL_VERSION.contains("-dirty"), GIT_DIRTY);
        chrono::DateTime::parse_from_rfc3339(BUILD_TIMESTAMP).expect("rfc3339 timestamp");
    }
}
