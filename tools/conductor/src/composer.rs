//! Recording side: accumulates steps while a session is open and produces a
//! composition when it stops.

use crate::composition::{
    AccountReference, AssertPayload, Composition, CuePayload, SendPayload, Step, StepAction,
};
use crate::config::ComposerConfig;
use crate::errors::ConductorError;
use crate::identity;
use crate::logging::append_run_log;
use crate::runtime::Clock;
use crate::types::{AssertionType, MatchType};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

const UNTITLED: &str = "Untitled composition";

#[derive(Debug, Clone)]
struct Session {
    base: Option<Composition>,
    name: String,
    description: String,
    accounts: Vec<AccountReference>,
    steps: Vec<Step>,
}

impl Session {
    fn touch_account(&mut self, alias: &str, identifier: Option<&str>) {
        match self.accounts.iter_mut().find(|a| a.alias == alias) {
            Some(account) => {
                if let Some(identifier) = identifier {
                    account.identifier = identifier.to_string();
                }
            }
            None => self.accounts.push(AccountReference {
                alias: alias.to_string(),
                identifier: identifier.unwrap_or_default().to_string(),
            }),
        }
    }
}

pub struct Composer {
    clock: Arc<dyn Clock>,
    config: ComposerConfig,
    session: Option<Session>,
}

impl Composer {
    pub fn new(clock: Arc<dyn Clock>, config: ComposerConfig) -> Self {
        Self {
            clock,
            config,
            session: None,
        }
    }

    pub fn is_composing(&self) -> bool {
        self.session.is_some()
    }

    pub fn start(&mut self) -> Result<(), ConductorError> {
        self.open(Session {
            base: None,
            name: UNTITLED.to_string(),
            description: String::new(),
            accounts: Vec::new(),
            steps: Vec::new(),
        })
    }

    /// Continue recording on top of `composition`. The composition produced by
    /// `stop` keeps the original id.
    pub fn start_from_existing(&mut self, composition: &Composition) -> Result<(), ConductorError> {
        self.open(Session {
            base: Some(composition.clone()),
            name: composition.name.clone(),
            description: composition.description.clone(),
            accounts: composition.accounts.clone(),
            steps: composition.steps.clone(),
        })
    }

    pub fn set_details(&mut self, name: &str, description: &str) {
        if let Some(session) = self.session.as_mut() {
            session.name = name.to_string();
            session.description = description.to_string();
        }
    }

    pub fn step_count(&self) -> usize {
        self.session.as_ref().map_or(0, |session| session.steps.len())
    }

    pub fn capture_connect(&mut self, alias: &str, identifier: &str) -> Option<String> {
        self.append(
            alias,
            Some(identifier),
            format!("Connect {alias}"),
            StepAction::Connect,
        )
    }

    pub fn capture_disconnect(&mut self, alias: &str) -> Option<String> {
        self.append(
            alias,
            None,
            format!("Disconnect {alias}"),
            StepAction::Disconnect,
        )
    }

    pub fn capture_send(
        &mut self,
        alias: &str,
        xml: &str,
        generated_ids: BTreeMap<String, String>,
    ) -> Option<String> {
        let description = format!("Send <{}> as {alias}", root_element(xml));
        self.append(
            alias,
            None,
            description,
            StepAction::Send(SendPayload {
                xml: xml.to_string(),
                generated_ids,
            }),
        )
    }

    /// A zero timeout takes the configured default.
    pub fn add_cue(
        &mut self,
        alias: &str,
        match_type: MatchType,
        expression: &str,
        timeout_ms: u64,
    ) -> Option<String> {
        let timeout_ms = if timeout_ms == 0 {
            self.config.default_cue_timeout_ms
        } else {
            timeout_ms
        };
        let description = format!(
            "Wait up to {timeout_ms}ms for {} {expression:?} on {alias}",
            match_type.as_str()
        );
        self.append(
            alias,
            None,
            description,
            StepAction::Cue(CuePayload {
                match_type,
                match_expression: expression.to_string(),
                timeout_ms,
            }),
        )
    }

    pub fn add_assertion(
        &mut self,
        alias: &str,
        assertion_type: AssertionType,
        expression: &str,
        expected: Option<&str>,
    ) -> Option<String> {
        let description = match expected {
            Some(expected) => format!(
                "Assert {} {expression:?} is {expected:?} on {alias}",
                assertion_type.as_str()
            ),
            None => format!("Assert {} {expression:?} on {alias}", assertion_type.as_str()),
        };
        self.append(
            alias,
            None,
            description,
            StepAction::Assert(AssertPayload {
                assertion_type,
                expression: expression.to_string(),
                expected: expected.map(ToString::to_string),
            }),
        )
    }

    pub fn cancel(&mut self) {
        if let Some(session) = self.session.take() {
            append_run_log(
                "info",
                "composer.session.cancelled",
                json!({ "discarded_steps": session.steps.len() }),
            );
        }
    }

    /// Close the session. Returns `None` when nothing was recorded.
    pub fn stop(&mut self) -> Option<Composition> {
        let session = self.session.take()?;
        if session.steps.is_empty() {
            append_run_log("info", "composer.session.empty", json!({}));
            return None;
        }
        let now = self.clock.now_ms();
        let composition = match session.base {
            Some(base) => Composition {
                id: base.id,
                name: session.name,
                description: session.description,
                version: base.version.saturating_add(1),
                created: base.created,
                updated: now.max(base.updated.saturating_add(1)),
                accounts: session.accounts,
                steps: session.steps,
                variables: base.variables,
                tags: base.tags,
            },
            None => Composition {
                id: identity::composition_id(),
                name: session.name,
                description: session.description,
                version: 1,
                created: now,
                updated: now,
                accounts: session.accounts,
                steps: session.steps,
                variables: BTreeMap::new(),
                tags: BTreeSet::new(),
            },
        };
        append_run_log(
            "info",
            "composer.session.stopped",
            json!({
                "composition_id": composition.id,
                "steps": composition.steps.len(),
                "accounts": composition.accounts.len(),
            }),
        );
        Some(composition)
    }

    fn open(&mut self, session: Session) -> Result<(), ConductorError> {
        if self.session.is_some() {
            return Err(ConductorError::AlreadyComposing);
        }
        append_run_log(
            "info",
            "composer.session.started",
            json!({
                "base": session.base.as_ref().map(|c| c.id.clone()),
                "seeded_steps": session.steps.len(),
            }),
        );
        self.session = Some(session);
        Ok(())
    }

    fn append(
        &mut self,
        alias: &str,
        identifier: Option<&str>,
        description: String,
        action: StepAction,
    ) -> Option<String> {
        let session = self.session.as_mut()?;
        session.touch_account(alias, identifier);
        let id = identity::step_id();
        session.steps.push(Step {
            id: id.clone(),
            account_alias: alias.to_string(),
            description,
            action,
        });
        Some(id)
    }
}

fn root_element(xml: &str) -> &str {
    let trimmed = xml.trim_start();
    let body = trimmed.strip_prefix('<').unwrap_or(trimmed);
    let end = body
        .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
        .unwrap_or(body.len());
    &body[..end]
}
