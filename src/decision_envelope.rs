// =============================================================================
// Decision Envelope — auditable record of every signal admission decision
// =============================================================================
//
// Every normalized signal runs the three-gate filter and (when admitted) the
// state machine's entry check. The envelope captures each verdict so the
// status surface can answer "why did signal X not trade" after the fact.
// =============================================================================

use serde::Serialize;

use crate::signal::Signal;
use crate::types::TradeAction;

/// Complete auditable record of one signal's trip through the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionEnvelope {
    /// Unique identifier for this decision (UUID v4).
    pub id: String,

    /// Id of the signal this decision pertains to.
    pub signal_id: String,

    pub kind: String,
    pub direction: String,
    pub confidence: f64,

    /// Gate verdicts ("PASS" / "FAIL" / "SKIP").
    pub signal_gate: String,
    pub execution_gate: String,
    pub environment_gate: String,

    /// Final decision: "ADMIT", "REJECT", "CLOSE", "SHADOW".
    pub final_decision: String,

    /// Which gate (or check) blocked the signal, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocking_gate: Option<String>,

    /// Human-readable reason for the decision.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// ISO 8601 timestamp of when this decision was created.
    pub created_at: String,
}

impl DecisionEnvelope {
    fn base(signal: &Signal) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            signal_id: signal.id.clone(),
            kind: signal.kind.to_string(),
            direction: signal.direction.to_string(),
            confidence: signal.confidence,
            signal_gate: "PASS".to_string(),
            execution_gate: "PASS".to_string(),
            environment_gate: "PASS".to_string(),
            final_decision: "ADMIT".to_string(),
            blocking_gate: None,
            reason: None,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// All gates passed; the signal reached the observation buffer.
    pub fn admitted(signal: &Signal) -> Self {
        Self::base(signal)
    }

    /// A gate (or the entry check) blocked the signal.
    pub fn rejected(
        signal: &Signal,
        blocking_gate: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        let gate = blocking_gate.into();
        let mut envelope = Self::base(signal);
        match gate.as_str() {
            "signal" => envelope.signal_gate = "FAIL".to_string(),
            "execution" => {
                envelope.execution_gate = "FAIL".to_string();
            }
            "environment" => {
                envelope.environment_gate = "FAIL".to_string();
            }
            _ => {}
        }
        envelope.final_decision = "REJECT".to_string();
        envelope.blocking_gate = Some(gate);
        envelope.reason = Some(reason.into());
        envelope
    }

    /// A bearish signal produced a close action against the live long.
    pub fn close_action(signal: &Signal, action: TradeAction, reason: impl Into<String>) -> Self {
        let mut envelope = Self::base(signal);
        envelope.final_decision = action.to_string();
        envelope.reason = Some(reason.into());
        envelope
    }

    /// A short signal while flat/paused became a paper shadow short.
    pub fn shadowed(signal: &Signal) -> Self {
        let mut envelope = Self::base(signal);
        envelope.final_decision = "SHADOW".to_string();
        envelope.reason = Some("short recorded as paper trade".to_string());
        envelope
    }
}
