use std::sync::LazyLock;

use regex::Regex;

use crate::errors::BranchError;

pub const BRANCH_PREFIX: &str = "feature/";
const WAVE_MARKER: &str = "-wave-";

static DATE_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{4}-\d{2}-\d{2}|\d{8})-").unwrap());

/// Normalize a raw spec identifier into a branch-safe component.
///
/// Lowercases, maps every run of non-alphanumerics to a single `-`, trims
/// dashes and strips a leading `YYYY-MM-DD-` or `YYYYMMDD-` date.
pub fn normalize_spec_id(raw: &str) -> String {
    let slug = raw
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");

    DATE_PREFIX.replace(&slug, "").into_owned()
}

/// Branch names of one pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchNames {
    spec: String,
}

impl BranchNames {
    pub fn new(raw_spec: &str) -> Result<Self, BranchError> {
        let spec = normalize_spec_id(raw_spec);
        if spec.is_empty() {
            return Err(BranchError::InvalidSpec {
                spec: raw_spec.to_string(),
            });
        }
        Ok(Self { spec })
    }

    pub fn spec(&self) -> &str {
        &self.spec
    }

    /// `feature/<spec>`
    pub fn integration(&self) -> String {
        format!("{}{}", BRANCH_PREFIX, self.spec)
    }

    /// `feature/<spec>-wave-<n>`
    pub fn wave(&self, number: u32) -> String {
        format!("{}{}{}{}", BRANCH_PREFIX, self.spec, WAVE_MARKER, number)
    }

    /// Split a wave branch into its spec component and wave number.
    pub fn parse_wave(branch: &str) -> Option<(String, u32)> {
        let rest = branch.strip_prefix(BRANCH_PREFIX)?;
        let (spec, number) = rest.rsplit_once(WAVE_MARKER)?;
        let number: u32 = number.parse().ok()?;
        if spec.is_empty() || number == 0 || normalize_spec_id(spec) != spec {
            return None;
        }
        Some((spec.to_string(), number))
    }

    /// Check if `branch` has the shape of an integration branch.
    pub fn is_integration(branch: &str) -> bool {
        branch
            .strip_prefix(BRANCH_PREFIX)
            .is_some_and(|spec| !spec.is_empty() && normalize_spec_id(spec) == spec)
            && Self::parse_wave(branch).is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_spec_id() {
        assert_eq!(normalize_spec_id("User Auth"), "user-auth");
        assert_eq!(normalize_spec_id("  API__v2!! "), "api-v2");
        assert_eq!(normalize_spec_id("2024-06-01-user-auth"), "user-auth");
        assert_eq!(normalize_spec_id("20240601-User_Auth.md"), "user-auth-md");
        assert_eq!(normalize_spec_id("2024"), "2024");
    }

    #[test]
    fn test_branch_names() {
        let names = BranchNames::new("2024-06-01 User Auth").unwrap();
        assert_eq!(names.integration(), "feature/user-auth");
        assert_eq!(names.wave(3), "feature/user-auth-wave-3");
    }

    #[test]
    fn test_empty_spec_rejected() {
        assert!(matches!(
            BranchNames::new("!!!"),
            Err(BranchError::InvalidSpec { .. })
        ));
    }

    #[test]
    fn test_parse_wave() {
        assert_eq!(
            BranchNames::parse_wave("feature/user-auth-wave-12"),
            Some(("user-auth".to_string(), 12))
        );
        // the last marker wins, so specs may themselves contain "-wave-"
        assert_eq!(
            BranchNames::parse_wave("feature/new-wave-ui-wave-2"),
            Some(("new-wave-ui".to_string(), 2))
        );
        assert_eq!(BranchNames::parse_wave("feature/user-auth"), None);
        assert_eq!(BranchNames::parse_wave("feature/user-auth-wave-0"), None);
        assert_eq!(BranchNames::parse_wave("bugfix/x-wave-1"), None);
        assert_eq!(BranchNames::parse_wave("feature/x-wave-one"), None);
    }

    #[test]
    fn test_is_integration() {
        assert!(BranchNames::is_integration("feature/user-auth"));
        assert!(!BranchNames::is_integration("feature/user-auth-wave-1"));
        assert!(!BranchNames::is_integration("main"));
        assert!(!BranchNames::is_integration("feature/"));
        assert!(!BranchNames::is_integration("feature/Mixed_Case"));
    }
}
