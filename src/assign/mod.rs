//! AI case-assignment client.
//!
//! Calls the external classification endpoint with a case's title and
//! description, resolves the suggested agent email to an internal id, and
//! writes the assignment back onto the case. No retry; a failure leaves the
//! case unassigned and is surfaced to the caller.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::{AssignmentFields, CaseRecord, Database};
use crate::error::AssignError;

/// Wire response from `POST {base}/assign`.
///
/// `assigned_agent_id` is the agent's email, not an internal id; resolution
/// happens on our side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseAssignmentResponse {
    pub assigned_agent_id: String,
    pub confidence_score: f64,
    pub reasoning: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Serialize)]
struct AssignRequest<'a> {
    title: &'a str,
    description: &'a str,
}

#[derive(Debug, Deserialize)]
struct AssignErrorBody {
    detail: String,
}

/// Trace id attached to each request via `x-trace-id`; used only for log
/// correlation with the AI service.
fn generate_trace_id() -> String {
    format!("trace-{}", Uuid::new_v4())
}

#[derive(Clone)]
pub struct AssignClient {
    http: reqwest::Client,
    base_url: String,
}

impl AssignClient {
    const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Self::REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    /// Ask the classification service which agent should take the case.
    pub async fn assign_case(
        &self,
        title: &str,
        description: &str,
    ) -> Result<CaseAssignmentResponse, AssignError> {
        let trace_id = generate_trace_id();
        let url = format!("{}/assign", self.base_url);
        tracing::debug!(%trace_id, %url, "requesting AI case assignment");

        let response = self
            .http
            .post(&url)
            .header("x-trace-id", &trace_id)
            .json(&AssignRequest { title, description })
            .send()
            .await
            .map_err(|e| AssignError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = match response.json::<AssignErrorBody>().await {
                Ok(body) => body.detail,
                Err(_) => format!("AI service returned {status}"),
            };
            tracing::warn!(%trace_id, %status, %detail, "AI assignment request rejected");
            return Err(AssignError::Service { detail });
        }

        let assignment: CaseAssignmentResponse = response
            .json()
            .await
            .map_err(|e| AssignError::Request(format!("invalid AI response: {e}")))?;
        tracing::info!(
            %trace_id,
            agent = %assignment.assigned_agent_id,
            confidence = assignment.confidence_score,
            "received AI case assignment"
        );
        Ok(assignment)
    }
}

/// Run the full assignment flow for a case: classify, resolve the agent
/// email, and persist the assignment.
///
/// Returns the updated case. On any error the case is left untouched.
pub async fn run_assignment(
    client: &AssignClient,
    db: &Arc<dyn Database>,
    case: &CaseRecord,
) -> Result<CaseRecord, AssignError> {
    let assignment = client
        .assign_case(&case.title, case.description.as_deref().unwrap_or(""))
        .await?;

    let agent = db
        .find_user_by_email(&assignment.assigned_agent_id)
        .await?
        .ok_or_else(|| AssignError::AgentNotFound {
            email: assignment.assigned_agent_id.clone(),
        })?;
    if !agent.role.is_staff() {
        return Err(AssignError::NotAnAgent {
            email: assignment.assigned_agent_id.clone(),
        });
    }

    let fields = AssignmentFields {
        assigned_agent_id: agent.id,
        explanation: assignment.reasoning,
        confidence_score: assignment.confidence_score,
        tags: assignment.tags,
    };
    let updated = db
        .apply_assignment(case.id, &fields)
        .await?
        .ok_or(AssignError::Database(
            crate::error::DatabaseError::NotFound { entity: "case" },
        ))?;

    tracing::info!(case_id = %case.id, agent_id = %agent.id, "case assigned");
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_ids_are_unique_and_prefixed() {
        let a = generate_trace_id();
        let b = generate_trace_id();
        assert!(a.starts_with("trace-"));
        assert_ne!(a, b);
    }

    #[test]
    fn assignment_response_round_trips() {
        let json = r#"{
            "assigned_agent_id": "agent@firm.example",
            "confidence_score": 0.92,
            "reasoning": "handles vehicle injury intake",
            "tags": ["personal-injury", "vehicle"]
        }"#;
        let parsed: CaseAssignmentResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.assigned_agent_id, "agent@firm.example");
        assert_eq!(parsed.tags.len(), 2);
    }

    #[test]
    fn error_body_parses_detail() {
        let body: AssignErrorBody =
            serde_json::from_str(r#"{"detail":"no agents available"}"#).unwrap();
        assert_eq!(body.detail, "no agents available");
    }
}
