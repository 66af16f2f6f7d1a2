use crate::composition::Composition;
use crate::errors::ConductorError;
use crate::performance::{AssertionResult, Performance};
use crate::types::StepStatus;

/// Plain-text report: a header line, then one line per step with indented
/// error and assertion detail.
pub fn render_text(performance: &Performance, composition: Option<&Composition>) -> Vec<String> {
    let mut lines = Vec::with_capacity(performance.step_results.len() + 1);
    let title = composition
        .map(|c| format!("{} ({})", c.name, performance.composition_id))
        .unwrap_or_else(|| performance.composition_id.clone());
    lines.push(format!(
        "{} {} passed={} failed={} total={} duration={}ms",
        title,
        performance.status.as_str().to_uppercase(),
        performance.summary.passed,
        performance.summary.failed,
        performance.summary.total,
        performance.duration_ms
    ));

    for (index, result) in performance.step_results.iter().enumerate() {
        let description = composition
            .and_then(|c| c.steps.iter().find(|step| step.id == result.step_id))
            .map(|step| step.description.as_str())
            .filter(|description| !description.is_empty())
            .unwrap_or(result.step_id.as_str());
        lines.push(format!(
            "#{:<3} {:<7} {:>6}ms  {}",
            index + 1,
            result.status.as_str(),
            result.duration_ms,
            description
        ));
        if let Some(error) = &result.error {
            lines.push(format!("      error: {}", error.message));
        }
        if result.status == StepStatus::Failed {
            for assertion in result.assertion_results.iter().flatten() {
                if !assertion.passed {
                    lines.push(format!("      {}", describe_mismatch(assertion)));
                }
            }
        }
    }
    lines
}

fn describe_mismatch(assertion: &AssertionResult) -> String {
    format!(
        "expected {}, actual {}",
        quoted(assertion.expected.as_deref()),
        quoted(assertion.actual.as_deref())
    )
}

fn quoted(value: Option<&str>) -> String {
    value.map_or_else(|| "<none>".to_string(), |value| format!("{value:?}"))
}

pub fn render_json(performance: &Performance) -> Result<String, ConductorError> {
    serde_json::to_string_pretty(performance).map_err(|e| ConductorError::Io(e.to_string()))
}
