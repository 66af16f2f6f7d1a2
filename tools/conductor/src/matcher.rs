//! Stateless evaluation of cue rules and assertions against one raw message.
//!
//! Expressions may reference captured values with `{{name}}` placeholders,
//! which are resolved from the variable store before evaluation. XPath
//! expressions are evaluated with XPath 1.0 semantics; a leading `@name` is a
//! shorthand for an attribute of the document element (`/*/@name`).

use crate::errors::ConductorError;
use crate::types::{AssertionType, MatchType};
use crate::variables::VariableStore;
use regex::Regex;
use sxd_document::dom::Document;
use sxd_document::parser;
use sxd_xpath::{evaluate_xpath, Value};

const ACTUAL_EXCERPT_CHARS: usize = 200;

/// A cue rule with its expression already resolved and compiled.
#[derive(Debug, Clone)]
pub enum Rule {
    Contains(String),
    Regex(Regex),
    Xpath(String),
}

impl Rule {
    pub fn compile(
        match_type: MatchType,
        expression: &str,
        variables: &VariableStore,
    ) -> Result<Self, ConductorError> {
        match match_type {
            MatchType::Contains => Ok(Self::Contains(resolve(expression, variables))),
            MatchType::Regex => compile_regex(&resolve(expression, variables)).map(Self::Regex),
            MatchType::Xpath => {
                let xpath = normalize_pointer(&resolve(expression, variables));
                check_xpath(&xpath)?;
                Ok(Self::Xpath(xpath))
            }
            MatchType::Id => variables
                .get(expression)
                .map(|value| Self::Contains(value.to_string()))
                .ok_or_else(|| {
                    ConductorError::MatchEvaluation(format!(
                        "variable {expression} has not been captured"
                    ))
                }),
        }
    }

    pub fn matches(&self, candidate: &str) -> Result<bool, ConductorError> {
        match self {
            Self::Contains(needle) => Ok(candidate.contains(needle.as_str())),
            Self::Regex(regex) => Ok(regex.is_match(candidate)),
            Self::Xpath(xpath) => with_document(candidate, |document| {
                evaluate(document, xpath).map(|value| truthy(&value))
            }),
        }
    }
}

pub fn matches(
    match_type: MatchType,
    expression: &str,
    candidate: &str,
    variables: &VariableStore,
) -> Result<bool, ConductorError> {
    Rule::compile(match_type, expression, variables)?.matches(candidate)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssertionOutcome {
    pub passed: bool,
    pub actual: Option<String>,
}

pub fn evaluate_assertion(
    assertion_type: AssertionType,
    expression: &str,
    expected: Option<&str>,
    candidate: &str,
    variables: &VariableStore,
) -> Result<AssertionOutcome, ConductorError> {
    let expression = resolve(expression, variables);
    let expected = expected.map(|value| resolve(value, variables));

    match assertion_type {
        AssertionType::Contains => Ok(AssertionOutcome {
            passed: candidate.contains(expression.as_str()),
            actual: Some(excerpt(candidate)),
        }),
        AssertionType::Regex => {
            let regex = compile_regex(&expression)?;
            let actual = regex.captures(candidate).and_then(|caps| {
                caps.get(1)
                    .or_else(|| caps.get(0))
                    .map(|m| m.as_str().to_string())
            });
            Ok(refine(actual, expected.as_deref()))
        }
        AssertionType::Xpath => {
            let xpath = normalize_pointer(&expression);
            let (holds, actual) = with_document(candidate, |document| {
                evaluate(document, &xpath).map(|value| (truthy(&value), first_string(&value)))
            })?;
            let passed = match expected.as_deref() {
                Some(expected) => actual.as_deref() == Some(expected),
                None => holds,
            };
            Ok(AssertionOutcome { passed, actual })
        }
        AssertionType::Equals => {
            let expected = expected.ok_or_else(|| {
                ConductorError::MatchEvaluation(
                    "equals assertion requires an expected value".to_string(),
                )
            })?;
            let xpath = normalize_pointer(&expression);
            check_xpath(&xpath)?;
            // An unparseable candidate or a pointer that resolves to nothing is a
            // reported mismatch, not an evaluation error.
            let Ok(package) = parser::parse(candidate) else {
                return Ok(AssertionOutcome {
                    passed: false,
                    actual: None,
                });
            };
            let document = package.as_document();
            let actual = evaluate(&document, &xpath).map(|value| first_string(&value))?;
            Ok(AssertionOutcome {
                passed: actual.as_deref() == Some(expected.as_str()),
                actual,
            })
        }
    }
}

/// Check that `xml` parses as a well-formed document.
pub fn check_well_formed(xml: &str) -> Result<(), String> {
    parser::parse(xml)
        .map(|_| ())
        .map_err(|e| format!("not well-formed XML: {e:?}"))
}

fn refine(actual: Option<String>, expected: Option<&str>) -> AssertionOutcome {
    let passed = match expected {
        Some(expected) => actual.as_deref() == Some(expected),
        None => actual.is_some(),
    };
    AssertionOutcome { passed, actual }
}

fn resolve(expression: &str, variables: &VariableStore) -> String {
    variables.substitute(expression).text
}

fn compile_regex(pattern: &str) -> Result<Regex, ConductorError> {
    Regex::new(pattern)
        .map_err(|e| ConductorError::MatchEvaluation(format!("invalid regex {pattern:?}: {e}")))
}

fn normalize_pointer(expression: &str) -> String {
    let trimmed = expression.trim();
    if trimmed.starts_with('@') {
        format!("/*/{trimmed}")
    } else {
        trimmed.to_string()
    }
}

fn check_xpath(xpath: &str) -> Result<(), ConductorError> {
    with_document("<check/>", |document| evaluate(document, xpath).map(|_| ()))
}

fn with_document<T>(
    candidate: &str,
    apply: impl FnOnce(&Document<'_>) -> Result<T, ConductorError>,
) -> Result<T, ConductorError> {
    let package = parser::parse(candidate).map_err(|e| {
        ConductorError::MatchEvaluation(format!("candidate is not well-formed XML: {e:?}"))
    })?;
    let document = package.as_document();
    apply(&document)
}

fn evaluate<'d>(document: &'d Document<'d>, xpath: &str) -> Result<Value<'d>, ConductorError> {
    evaluate_xpath(document, xpath)
        .map_err(|e| ConductorError::MatchEvaluation(format!("invalid xpath {xpath:?}: {e:?}")))
}

fn truthy(value: &Value<'_>) -> bool {
    match value {
        Value::Nodeset(nodes) => nodes.size() > 0,
        Value::Boolean(flag) => *flag,
        Value::Number(number) => *number != 0.0 && !number.is_nan(),
        Value::String(text) => !text.is_empty(),
    }
}

fn first_string(value: &Value<'_>) -> Option<String> {
    match value {
        Value::Nodeset(nodes) => nodes.document_order_first().map(|node| node.string_value()),
        Value::Boolean(flag) => Some(flag.to_string()),
        Value::Number(number) => Some(number_string(*number)),
        Value::String(text) => Some(text.clone()),
    }
}

/// XPath `string()` of a number: integral values print without a fraction.
fn number_string(number: f64) -> String {
    if number.is_nan() {
        "NaN".to_string()
    } else if number.is_infinite() {
        if number > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if number == 0.0 {
        "0".to_string()
    } else {
        number.to_string()
    }
}

fn excerpt(candidate: &str) -> String {
    if candidate.chars().count() <= ACTUAL_EXCERPT_CHARS {
        return candidate.to_string();
    }
    let head = candidate.chars().take(ACTUAL_EXCERPT_CHARS).collect::<String>();
    format!("{head}...")
}
