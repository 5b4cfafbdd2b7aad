//! Request classification
//!
//! Maps a request path to an API class and its timeout budget. Rules
//! are matched in priority order, first match wins; unmatched paths
//! fall into the `default` class. The table is configuration, not
//! logic: write-heavy classes get 20-30s, simple lookups 5-15s.

use std::time::Duration;

use regex::Regex;

use crate::error::GuardError;

/// Name of the fallthrough class for unmatched paths
pub const DEFAULT_CLASS: &str = "default";

/// One classification rule: pattern, class name and timeout budget
#[derive(Debug, Clone)]
pub struct ClassRule {
    pub name: String,
    pub pattern: Regex,
    pub timeout: Duration,
}

/// Result of classifying a request path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub class: String,
    pub timeout: Duration,
}

/// Ordered classification table
#[derive(Debug, Clone)]
pub struct ApiClassifier {
    rules: Vec<ClassRule>,
    default_timeout: Duration,
}

impl ApiClassifier {
    /// Empty classifier; everything falls into `default`
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            default_timeout: Duration::from_secs(60),
        }
    }

    /// Append a rule. Priority is registration order.
    pub fn rule(mut self, name: &str, pattern: &str, timeout: Duration) -> Result<Self, GuardError> {
        let pattern = Regex::new(pattern).map_err(|source| GuardError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        self.rules.push(ClassRule {
            name: name.to_string(),
            pattern,
            timeout,
        });
        Ok(self)
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// The production classification table. Save/delete patterns come
    /// before the generic get pattern so a write path can never be
    /// misfiled under a looser read rule.
    pub fn service_defaults() -> Self {
        Self::new()
            .rule("save-record", r"^/api/[a-z-]+/save", Duration::from_secs(30))
            .and_then(|c| c.rule("update-record", r"^/api/[a-z-]+/update", Duration::from_secs(20)))
            .and_then(|c| c.rule("delete-record", r"^/api/[a-z-]+/delete", Duration::from_secs(20)))
            .and_then(|c| c.rule("document-scan", r"^/api/documents/scan", Duration::from_secs(30)))
            .and_then(|c| c.rule("requisition", r"^/api/requisitions", Duration::from_secs(15)))
            .and_then(|c| c.rule("patient-lookup", r"^/api/patients", Duration::from_secs(10)))
            .and_then(|c| c.rule("queue-display", r"^/api/queue", Duration::from_secs(5)))
            .and_then(|c| c.rule("get-records", r"^/api/", Duration::from_secs(15)))
            .expect("default classification table patterns are valid")
    }

    /// Classify a path; deterministic, first matching rule wins
    pub fn classify(&self, path: &str) -> Classification {
        for rule in &self.rules {
            if rule.pattern.is_match(path) {
                return Classification {
                    class: rule.name.clone(),
                    timeout: rule.timeout,
                };
            }
        }
        Classification {
            class: DEFAULT_CLASS.to_string(),
            timeout: self.default_timeout,
        }
    }

    pub fn rules(&self) -> &[ClassRule] {
        &self.rules
    }
}

impl Default for ApiClassifier {
    fn default() -> Self {
        Self::service_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_matching_rule_wins() {
        let classifier = ApiClassifier::new()
            .rule("delete-record", r"/delete", Duration::from_secs(20))
            .and_then(|c| c.rule("get-records", r"^/api/", Duration::from_secs(15)))
            .unwrap();

        // matches both rules; the one listed first resolves it
        let c = classifier.classify("/api/patients/delete");
        assert_eq!(c.class, "delete-record");
        assert_eq!(c.timeout, Duration::from_secs(20));
    }

    #[test]
    fn test_classification_is_deterministic() {
        let classifier = ApiClassifier::service_defaults();
        let first = classifier.classify("/api/patients/1234");
        for _ in 0..10 {
            assert_eq!(classifier.classify("/api/patients/1234"), first);
        }
        assert_eq!(first.class, "patient-lookup");
    }

    #[test]
    fn test_save_path_beats_generic_get_pattern() {
        let classifier = ApiClassifier::service_defaults();
        let c = classifier.classify("/api/requisitions/save");
        assert_eq!(c.class, "save-record");
        assert_eq!(c.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_unmatched_path_falls_into_default() {
        let classifier = ApiClassifier::service_defaults();
        let c = classifier.classify("/healthz");
        assert_eq!(c.class, DEFAULT_CLASS);
        assert_eq!(c.timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let err = ApiClassifier::new()
            .rule("broken", r"([unclosed", Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, GuardError::InvalidPattern { .. }));
    }
}
