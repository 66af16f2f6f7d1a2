use serde::{Deserialize, Serialize};

/// Rule used by a cue to recognise an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Contains,
    Xpath,
    Regex,
    Id,
}

impl MatchType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Contains => "contains",
            Self::Xpath => "xpath",
            Self::Regex => "regex",
            Self::Id => "id",
        }
    }
}

/// Condition checked by an assert step against the last observed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssertionType {
    Contains,
    Xpath,
    Regex,
    Equals,
}

impl AssertionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Contains => "contains",
            Self::Xpath => "xpath",
            Self::Regex => "regex",
            Self::Equals => "equals",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Passed,
    Failed,
    Error,
    Skipped,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Error => "error",
            Self::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceStatus {
    Passed,
    Failed,
}

impl PerformanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Connected,
    #[default]
    Disconnected,
    Error,
}

impl PeerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AssertionType, MatchType, StepStatus};

    #[test]
    fn wire_names_match_serde_names() {
        for kind in [
            MatchType::Contains,
            MatchType::Xpath,
            MatchType::Regex,
            MatchType::Id,
        ] {
            let json = serde_json::to_string(&kind).expect("serialize");
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
        let equals: AssertionType = serde_json::from_str("\"equals\"").expect("equals");
        assert_eq!(equals, AssertionType::Equals);
        assert!(serde_json::from_str::<AssertionType>("\"id\"").is_err());
        assert_eq!(
            serde_json::to_string(&StepStatus::Skipped).expect("serialize"),
            format!("\"{}\"", StepStatus::Skipped.as_str())
        );
    }

    #[test]
    fn serde_uses_lowercase_names() {
        let json = serde_json::to_string(&MatchType::Xpath).expect("serialize");
        assert_eq!(json, "\"xpath\"");
    }
}
