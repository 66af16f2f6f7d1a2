use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConductorError {
    #[error("io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("cli error: {0}")]
    Cli(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("a composing session is already active")]
    AlreadyComposing,
    #[error("invalid composition: {0}")]
    InvalidComposition(String),
    #[error("peer unavailable: {0}")]
    PeerUnavailable(String),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("cue timed out: {0}")]
    CueTimeout(String),
    #[error("match evaluation error: {0}")]
    MatchEvaluation(String),
    #[error("performance cancelled: {0}")]
    Cancelled(String),
}

impl ConductorError {
    /// Short machine-readable kind, stored alongside the message in step results.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::ConfigParse(_) => "config_parse",
            Self::InvalidConfig(_) => "invalid_config",
            Self::Cli(_) => "cli",
            Self::Database(_) => "database",
            Self::AlreadyComposing => "already_composing",
            Self::InvalidComposition(_) => "invalid_composition",
            Self::PeerUnavailable(_) => "peer_unavailable",
            Self::SendFailed(_) => "send_failed",
            Self::CueTimeout(_) => "cue_timeout",
            Self::MatchEvaluation(_) => "match_evaluation",
            Self::Cancelled(_) => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ConductorError;

    #[test]
    fn display_prefixes_carry_the_taxonomy() {
        let err = ConductorError::CueTimeout("no match for \"pong\" within 1000ms".to_string());
        assert_eq!(
            err.to_string(),
            "cue timed out: no match for \"pong\" within 1000ms"
        );
        assert_eq!(err.kind(), "cue_timeout");
        assert_eq!(ConductorError::AlreadyComposing.kind(), "already_composing");
    }
}
