//! Interface contracts negotiated between workers.
//!
//! A contract's negotiation history is append-only. Every entry that moved
//! the contract to a new status records that status, so the live status can
//! always be replayed from history.

use crate::core::WorkerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Metadata key set on `response` entries that signal agreement.
pub const AGREED_KEY: &str = "agreed";

/// Unique identifier for a contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContractId(pub Uuid);

impl ContractId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for ContractId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ContractId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ContractId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s.trim())?))
    }
}

/// Negotiation status. VERIFIED and DEPRECATED are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContractStatus {
    Negotiating,
    Agreed,
    Implemented,
    Verified,
    Disputed,
    Deprecated,
}

impl ContractStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ContractStatus::Verified | ContractStatus::Deprecated)
    }

    /// Agreed or further along the happy path.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            ContractStatus::Agreed | ContractStatus::Implemented | ContractStatus::Verified
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContractStatus::Negotiating => "NEGOTIATING",
            ContractStatus::Agreed => "AGREED",
            ContractStatus::Implemented => "IMPLEMENTED",
            ContractStatus::Verified => "VERIFIED",
            ContractStatus::Disputed => "DISPUTED",
            ContractStatus::Deprecated => "DEPRECATED",
        }
    }
}

impl std::fmt::Display for ContractStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ContractStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NEGOTIATING" => Ok(ContractStatus::Negotiating),
            "AGREED" => Ok(ContractStatus::Agreed),
            "IMPLEMENTED" => Ok(ContractStatus::Implemented),
            "VERIFIED" => Ok(ContractStatus::Verified),
            "DISPUTED" => Ok(ContractStatus::Disputed),
            "DEPRECATED" => Ok(ContractStatus::Deprecated),
            other => Err(format!("unknown contract status: {}", other)),
        }
    }
}

/// Kind of a negotiation history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationAction {
    Proposal,
    Response,
    Counter,
    Resolution,
    Implementation,
    Verification,
    Dispute,
    Deprecation,
}

impl NegotiationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            NegotiationAction::Proposal => "proposal",
            NegotiationAction::Response => "response",
            NegotiationAction::Counter => "counter",
            NegotiationAction::Resolution => "resolution",
            NegotiationAction::Implementation => "implementation",
            NegotiationAction::Verification => "verification",
            NegotiationAction::Dispute => "dispute",
            NegotiationAction::Deprecation => "deprecation",
        }
    }
}

impl std::fmt::Display for NegotiationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NegotiationAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "proposal" => Ok(NegotiationAction::Proposal),
            "response" => Ok(NegotiationAction::Response),
            "counter" => Ok(NegotiationAction::Counter),
            "resolution" => Ok(NegotiationAction::Resolution),
            "implementation" => Ok(NegotiationAction::Implementation),
            "verification" => Ok(NegotiationAction::Verification),
            "dispute" => Ok(NegotiationAction::Dispute),
            "deprecation" => Ok(NegotiationAction::Deprecation),
            other => Err(format!("unknown negotiation action: {}", other)),
        }
    }
}

/// One step in a contract's negotiation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegotiationEntry {
    pub worker: WorkerId,
    pub timestamp: DateTime<Utc>,
    pub action: NegotiationAction,
    pub content: String,
    pub code: Option<String>,
    /// Quality score as a whole percentage.
    pub quality: Option<u8>,
    /// Status this entry moved the contract to, if it caused a transition.
    pub transition: Option<ContractStatus>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl NegotiationEntry {
    pub fn new(worker: &str, action: NegotiationAction, content: &str) -> Self {
        Self {
            worker: worker.to_string(),
            timestamp: Utc::now(),
            action,
            content: content.to_string(),
            code: None,
            quality: None,
            transition: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_code(mut self, code: Option<&str>) -> Self {
        self.code = code.map(str::to_string);
        self
    }

    /// Record a `[0, 1]` quality score as a whole percentage.
    pub fn with_quality(mut self, quality: Option<f64>) -> Self {
        self.quality = quality.map(quality_percent);
        self
    }

    pub fn with_transition(mut self, status: Option<ContractStatus>) -> Self {
        self.transition = status;
        self
    }

    pub fn with_meta(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn signals_agreement(&self) -> bool {
        self.metadata.get(AGREED_KEY).is_some_and(|v| v == "true")
    }
}

/// Convert a `[0, 1]` score into a whole percentage.
pub fn quality_percent(quality: f64) -> u8 {
    (crate::util::clamp_unit(quality) * 100.0).round() as u8
}

/// Which side of a contract a worker is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractRole {
    Proposer,
    Implementer,
    All,
}

/// A structured agreement between workers about an interface or data shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub id: ContractId,
    pub name: String,
    /// Free-form kind, e.g. `api`, `schema`, `component`.
    pub contract_type: String,
    pub proposer: WorkerId,
    pub implementer: Option<WorkerId>,
    pub status: ContractStatus,
    pub history: Vec<NegotiationEntry>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<ContractId>,
    pub implementation_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub agreed_at: Option<DateTime<Utc>>,
    pub implemented_at: Option<DateTime<Utc>>,
    pub verified_at: Option<DateTime<Utc>>,
}

impl Contract {
    /// Status replayed from the latest transition-causing history entry.
    pub fn derived_status(&self) -> Option<ContractStatus> {
        self.history.iter().rev().find_map(|entry| entry.transition)
    }

    pub fn involves(&self, worker: &str, role: ContractRole) -> bool {
        let is_proposer = self.proposer == worker;
        let is_implementer = self.implementer.as_deref() == Some(worker);
        match role {
            ContractRole::Proposer => is_proposer,
            ContractRole::Implementer => is_implementer,
            ContractRole::All => {
                is_proposer || is_implementer || self.history.iter().any(|e| e.worker == worker)
            }
        }
    }

    /// Most recent code sample in the history.
    pub fn latest_code(&self) -> Option<&str> {
        self.history.iter().rev().find_map(|e| e.code.as_deref())
    }

    pub fn last_entry(&self) -> Option<&NegotiationEntry> {
        self.history.last()
    }
}
