//! Recorded scripts: steps, account references and the composition itself.

use crate::errors::ConductorError;
use crate::types::{AssertionType, MatchType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountReference {
    pub alias: String,
    /// Account identifier (a JID or endpoint name); empty when never connected.
    #[serde(default)]
    pub identifier: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendPayload {
    pub xml: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub generated_ids: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CuePayload {
    pub match_type: MatchType,
    pub match_expression: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssertPayload {
    pub assertion_type: AssertionType,
    pub expression: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
}

/// What a step does; serialized as `{"type": ..., "payload": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum StepAction {
    Connect,
    Disconnect,
    Send(SendPayload),
    Cue(CuePayload),
    Assert(AssertPayload),
}

impl StepAction {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Send(_) => "send",
            Self::Cue(_) => "cue",
            Self::Assert(_) => "assert",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    pub account_alias: String,
    #[serde(default)]
    pub description: String,
    #[serde(flatten)]
    pub action: StepAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Composition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: u32,
    pub created: i64,
    pub updated: i64,
    pub accounts: Vec<AccountReference>,
    pub steps: Vec<Step>,
    /// Template defaults, available to placeholders and id cues from the first step.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

fn default_version() -> u32 {
    1
}

impl Composition {
    /// Structural checks run before any step of a performance executes.
    pub fn validate(&self) -> Result<(), ConductorError> {
        if self.steps.is_empty() {
            return Err(invalid("composition has no steps"));
        }

        let mut aliases = HashSet::new();
        for account in &self.accounts {
            if account.alias.trim().is_empty() {
                return Err(invalid("account alias must not be empty"));
            }
            if !aliases.insert(account.alias.as_str()) {
                return Err(invalid(&format!("duplicate account alias {}", account.alias)));
            }
        }

        let mut step_ids = HashSet::new();
        let mut produced: HashSet<&str> = self.variables.keys().map(String::as_str).collect();
        let mut generated: HashSet<&str> = HashSet::new();

        for (index, step) in self.steps.iter().enumerate() {
            let at = format!("step #{} ({})", index + 1, step.id);
            if !step_ids.insert(step.id.as_str()) {
                return Err(invalid(&format!("{at}: duplicate step id")));
            }
            if !aliases.contains(step.account_alias.as_str()) {
                return Err(invalid(&format!(
                    "{at}: unknown account alias {}",
                    step.account_alias
                )));
            }
            match &step.action {
                StepAction::Connect | StepAction::Disconnect => {}
                StepAction::Send(payload) => {
                    for name in payload.generated_ids.keys() {
                        if !generated.insert(name.as_str()) {
                            return Err(invalid(&format!(
                                "{at}: generated id {name} is declared twice"
                            )));
                        }
                        produced.insert(name.as_str());
                    }
                }
                StepAction::Cue(payload) => {
                    if payload.timeout_ms == 0 {
                        return Err(invalid(&format!("{at}: cue timeout must be positive")));
                    }
                    if payload.match_type == MatchType::Id
                        && !produced.contains(payload.match_expression.as_str())
                    {
                        return Err(invalid(&format!(
                            "{at}: id cue references {} before any send produced it",
                            payload.match_expression
                        )));
                    }
                    if payload.match_type == MatchType::Regex {
                        check_regex(&at, &payload.match_expression)?;
                    }
                }
                StepAction::Assert(payload) => {
                    if payload.assertion_type == AssertionType::Equals
                        && payload.expected.is_none()
                    {
                        return Err(invalid(&format!(
                            "{at}: equals assertion requires an expected value"
                        )));
                    }
                    if payload.assertion_type == AssertionType::Regex {
                        check_regex(&at, &payload.expression)?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn check_regex(at: &str, pattern: &str) -> Result<(), ConductorError> {
    regex::Regex::new(pattern)
        .map(|_| ())
        .map_err(|e| invalid(&format!("{at}: invalid regex: {e}")))
}

fn invalid(message: &str) -> ConductorError {
    ConductorError::InvalidComposition(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, alias: &str, action: StepAction) -> Step {
        Step {
            id: id.to_string(),
            account_alias: alias.to_string(),
            description: String::new(),
            action,
        }
    }

    fn composition(steps: Vec<Step>) -> Composition {
        Composition {
            id: "comp-1".to_string(),
            name: "ping pong".to_string(),
            description: String::new(),
            version: 1,
            created: 0,
            updated: 0,
            accounts: vec![AccountReference {
                alias: "alice".to_string(),
                identifier: "alice@example.com".to_string(),
            }],
            steps,
            variables: BTreeMap::new(),
            tags: BTreeSet::new(),
        }
    }

    fn id_cue(name: &str) -> StepAction {
        StepAction::Cue(CuePayload {
            match_type: MatchType::Id,
            match_expression: name.to_string(),
            timeout_ms: 1000,
        })
    }

    #[test]
    fn steps_serialize_with_type_and_payload_keys() {
        let send = step(
            "s1",
            "alice",
            StepAction::Send(SendPayload {
                xml: "<iq id='abc123'/>".to_string(),
                generated_ids: BTreeMap::from([("corrId".to_string(), "abc123".to_string())]),
            }),
        );
        let value = serde_json::to_value(&send).expect("serialize");
        assert_eq!(value["type"], "send");
        assert_eq!(value["accountAlias"], "alice");
        assert_eq!(value["payload"]["generatedIds"]["corrId"], "abc123");

        let connect: Step = serde_json::from_value(serde_json::json!({
            "id": "s0",
            "type": "connect",
            "accountAlias": "alice",
            "description": "Connect alice"
        }))
        .expect("deserialize connect");
        assert_eq!(connect.action, StepAction::Connect);
    }

    #[test]
    fn unknown_alias_is_rejected() {
        let comp = composition(vec![step("s1", "mallory", StepAction::Connect)]);
        let err = comp.validate().expect_err("must reject");
        assert!(err.to_string().contains("unknown account alias mallory"));
    }

    #[test]
    fn id_cue_must_follow_the_producing_send() {
        let forward = composition(vec![
            step("s1", "alice", id_cue("corrId")),
            step(
                "s2",
                "alice",
                StepAction::Send(SendPayload {
                    xml: "<iq/>".to_string(),
                    generated_ids: BTreeMap::from([("corrId".to_string(), "x".to_string())]),
                }),
            ),
        ]);
        assert!(forward.validate().is_err());

        let mut templated = composition(vec![step("s1", "alice", id_cue("room"))]);
        templated
            .variables
            .insert("room".to_string(), "lobby".to_string());
        templated.validate().expect("template variables are in scope");
    }

    #[test]
    fn duplicate_generated_ids_and_missing_expected_are_rejected() {
        let send = |id: &str| {
            step(
                id,
                "alice",
                StepAction::Send(SendPayload {
                    xml: "<iq/>".to_string(),
                    generated_ids: BTreeMap::from([("corrId".to_string(), id.to_string())]),
                }),
            )
        };
        assert!(composition(vec![send("s1"), send("s2")]).validate().is_err());

        let equals = composition(vec![step(
            "s1",
            "alice",
            StepAction::Assert(AssertPayload {
                assertion_type: AssertionType::Equals,
                expression: "/iq/@type".to_string(),
                expected: None,
            }),
        )]);
        let err = equals.validate().expect_err("must reject");
        assert!(err.to_string().contains("requires an expected value"));
    }

    #[test]
    fn empty_compositions_are_invalid() {
        assert!(composition(Vec::new()).validate().is_err());
    }
}
