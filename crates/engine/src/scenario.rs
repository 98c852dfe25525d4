//! Scenario runner – execute scripted tool flows from YAML files.

use crate::context::ToolContext;
use crate::tools::ToolRegistry;
use crate::types::*;
use serde_json::json;
use std::time::Duration;

/// Load a scenario from a YAML string.
pub fn load_scenario(yaml: &str) -> Result<Scenario, String> {
    serde_yaml::from_str(yaml).map_err(|e| format!("failed to parse scenario YAML: {}", e))
}

/// Execute a scenario and return the overall result.
///
/// Every step runs even after a mismatch, so the report shows the whole flow.
pub async fn run_scenario(
    scenario: &Scenario,
    ctx: &ToolContext,
    registry: &ToolRegistry,
) -> ScenarioResult {
    let mut step_results = Vec::new();
    let mut overall = ScenarioStatus::Pass;

    for (i, step) in scenario.steps.iter().enumerate() {
        let result = match step {
            ScenarioStep::Call {
                call,
                args,
                expect,
                timeout_ms,
            } => {
                let limit = Duration::from_millis(*timeout_ms);
                let r = registry.execute_with_timeout(call, args, ctx, limit).await;
                let actual = if r.is_success() {
                    Expectation::Success
                } else {
                    Expectation::Failure
                };
                if actual != *expect {
                    tracing::warn!(
                        step = i,
                        tool = %call,
                        expected = ?expect,
                        actual = ?actual,
                        "scenario step outcome mismatch"
                    );
                    overall = ScenarioStatus::Fail;
                }
                r
            }
            ScenarioStep::Reset { reset } => {
                if *reset {
                    tracing::info!(step = i, "scenario resetting engine");
                    ctx.engine().reset();
                }
                ToolResult::ok(json!({ "reset": reset }))
            }
        };
        step_results.push(result);
    }

    ScenarioResult {
        name: scenario.name.clone(),
        overall_status: overall,
        step_results,
    }
}
