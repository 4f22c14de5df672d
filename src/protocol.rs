//! Wire-visible message types for the ordered operation stream.
//!
//! The ordering service assigns every op a total-order `sequence_number` and
//! broadcasts it to all clients. The summarizer cares about three of these
//! message types in particular: `summarize` (a proposal broadcast back to its
//! sender), `summaryAck`, and `summaryNack` (the server's adjudication, which
//! points back at the proposal through `summaryProposal.summarySequenceNumber`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message types observed on the ordered stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpType {
    /// A regular document operation.
    #[serde(rename = "op")]
    Operation,
    /// Client request for an immediate summary.
    #[serde(rename = "save")]
    Save,
    /// Quorum op: a client joined.
    #[serde(rename = "join")]
    ClientJoin,
    /// Quorum op: a client left. Contents carry the leaver's client id.
    #[serde(rename = "leave")]
    ClientLeave,
    /// Quorum op: a proposal was made.
    #[serde(rename = "propose")]
    Propose,
    /// Quorum op: a proposal was rejected.
    #[serde(rename = "reject")]
    Reject,
    /// A summary proposal broadcast back by the ordering service.
    #[serde(rename = "summarize")]
    Summarize,
    /// The server accepted a summary proposal.
    #[serde(rename = "summaryAck")]
    SummaryAck,
    /// The server rejected a summary proposal.
    #[serde(rename = "summaryNack")]
    SummaryNack,
}

impl OpType {
    /// Quorum ops are delivered through the system-op path rather than the
    /// regular op path.
    pub fn is_quorum(self) -> bool {
        matches!(
            self,
            OpType::ClientJoin | OpType::ClientLeave | OpType::Propose | OpType::Reject
        )
    }

    pub fn is_summary_family(self) -> bool {
        matches!(
            self,
            OpType::Summarize | OpType::SummaryAck | OpType::SummaryNack
        )
    }
}

/// A single sequenced op as delivered by the ordering service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequencedOp {
    #[serde(rename = "type")]
    pub op_type: OpType,
    /// Position assigned by the server in the total order.
    pub sequence_number: u64,
    /// Locally-assigned submission id, used to correlate a submitted op with
    /// its stream echo. Zero for server-originated ops.
    #[serde(default)]
    pub client_sequence_number: u64,
    /// Stream position the op was authored against.
    #[serde(default)]
    pub reference_sequence_number: u64,
    /// Sender's client id. Absent for server-originated ops.
    #[serde(default)]
    pub client_id: Option<String>,
    /// Server wall-clock stamp for the op.
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub contents: Value,
}

impl SequencedOp {
    /// Typed view of a summarize op's contents.
    pub fn summarize_contents(&self) -> Option<SummarizeContents> {
        serde_json::from_value(self.contents.clone()).ok()
    }

    /// Typed view of an ack or nack op's contents.
    pub fn ack_nack_contents(&self) -> Option<AckNackContents> {
        serde_json::from_value(self.contents.clone()).ok()
    }

    /// For leave ops the contents are the leaver's client id as a string.
    pub fn leaving_client_id(&self) -> Option<&str> {
        self.contents.as_str()
    }
}

/// Contents of a summarize op: where the summary blob lives and what it spans.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummarizeContents {
    /// Storage handle of the uploaded summary tree.
    pub handle: String,
    #[serde(default)]
    pub head: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub parents: Vec<String>,
}

/// Back-reference from an ack or nack to the proposal it adjudicates.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryProposal {
    /// The summarize op's own position in the stream.
    pub summary_sequence_number: u64,
}

/// Contents of a summary-ack or summary-nack op.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckNackContents {
    /// Storage handle of the committed summary. Present on acks.
    #[serde(default)]
    pub handle: Option<String>,
    /// Server's rejection message. Present on nacks.
    #[serde(default)]
    pub error_message: Option<String>,
    pub summary_proposal: SummaryProposal,
}

/// One delivery from the runtime's batch-end emitter. An error marks the op
/// as poisoned; the summarizer drops such deliveries without inspecting them.
#[derive(Debug, Clone)]
pub struct OpEvent {
    pub error: Option<String>,
    pub op: SequencedOp,
}

impl OpEvent {
    pub fn op(op: SequencedOp) -> Self {
        Self { error: None, op }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_op(op_type: OpType, seq: u64) -> SequencedOp {
        SequencedOp {
            op_type,
            sequence_number: seq,
            client_sequence_number: 0,
            reference_sequence_number: 0,
            client_id: None,
            timestamp: Utc::now(),
            contents: Value::Null,
        }
    }

    #[test]
    fn test_op_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&OpType::SummaryAck).unwrap(),
            "\"summaryAck\""
        );
        assert_eq!(
            serde_json::to_string(&OpType::SummaryNack).unwrap(),
            "\"summaryNack\""
        );
        assert_eq!(
            serde_json::to_string(&OpType::ClientLeave).unwrap(),
            "\"leave\""
        );
    }

    #[test]
    fn test_quorum_classification() {
        assert!(OpType::ClientJoin.is_quorum());
        assert!(OpType::ClientLeave.is_quorum());
        assert!(OpType::Propose.is_quorum());
        assert!(OpType::Reject.is_quorum());
        assert!(!OpType::Summarize.is_quorum());
        assert!(!OpType::Save.is_quorum());
    }

    #[test]
    fn test_ack_contents_points_back_at_proposal() {
        let mut op = base_op(OpType::SummaryAck, 12);
        op.contents = json!({
            "handle": "storage://abc",
            "summaryProposal": { "summarySequenceNumber": 11 }
        });

        let contents = op.ack_nack_contents().unwrap();
        assert_eq!(contents.handle.as_deref(), Some("storage://abc"));
        assert_eq!(contents.summary_proposal.summary_sequence_number, 11);
        assert!(contents.error_message.is_none());
    }

    #[test]
    fn test_nack_contents_carry_error_message() {
        let mut op = base_op(OpType::SummaryNack, 20);
        op.contents = json!({
            "errorMessage": "stale",
            "summaryProposal": { "summarySequenceNumber": 17 }
        });

        let contents = op.ack_nack_contents().unwrap();
        assert_eq!(contents.error_message.as_deref(), Some("stale"));
        assert_eq!(contents.summary_proposal.summary_sequence_number, 17);
    }

    #[test]
    fn test_leave_contents_is_leaver_id() {
        let mut op = base_op(OpType::ClientLeave, 5);
        op.contents = json!("client-abc");
        assert_eq!(op.leaving_client_id(), Some("client-abc"));
    }

    #[test]
    fn test_sequenced_op_round_trip() {
        let mut op = base_op(OpType::Summarize, 11);
        op.client_id = Some("summarizer-1".to_string());
        op.client_sequence_number = 3;
        op.reference_sequence_number = 10;
        op.contents = json!({ "handle": "storage://s1" });

        let encoded = serde_json::to_string(&op).unwrap();
        assert!(encoded.contains("\"type\":\"summarize\""));
        assert!(encoded.contains("\"clientSequenceNumber\":3"));

        let decoded: SequencedOp = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.sequence_number, 11);
        assert_eq!(decoded.summarize_contents().unwrap().handle, "storage://s1");
    }
}
