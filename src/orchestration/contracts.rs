//! Contract negotiation between workers.
//!
//! Contracts move through NEGOTIATING, AGREED, IMPLEMENTED and VERIFIED, with
//! DISPUTED as the rework state and DEPRECATED as logical deletion. Every
//! operation appends one history entry; entries that change the status carry
//! the new status so it can be replayed.

use crate::core::contract::AGREED_KEY;
use crate::core::{
    Contract, ContractId, ContractRole, ContractStatus, NegotiationAction, NegotiationEntry,
};
use crate::error::{Error, Result};
use crate::{clog, clog_debug};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};

/// Author recorded on entries the coordinator writes itself.
pub const SYSTEM_WORKER: &str = "system";

/// How a worker answers a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespondAction {
    Response,
    Counter,
    Agree,
    Dispute,
}

impl std::str::FromStr for RespondAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "response" | "respond" => Ok(RespondAction::Response),
            "counter" => Ok(RespondAction::Counter),
            "agree" => Ok(RespondAction::Agree),
            "dispute" => Ok(RespondAction::Dispute),
            other => Err(format!("unknown response action: {}", other)),
        }
    }
}

fn single_line(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Validation(format!("{} must not be empty", field)));
    }
    if value.contains(['\n', '\r']) {
        return Err(Error::Validation(format!("{} must be a single line", field)));
    }
    Ok(())
}

/// Registry of contracts and the only place their status changes.
#[derive(Debug, Default)]
pub struct ContractManager {
    contracts: BTreeMap<ContractId, Contract>,
}

impl ContractManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted contracts.
    pub fn restore(contracts: Vec<Contract>) -> Self {
        Self {
            contracts: contracts.into_iter().map(|c| (c.id, c)).collect(),
        }
    }

    pub fn all(&self) -> impl Iterator<Item = &Contract> {
        self.contracts.values()
    }

    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }

    /// Open a new contract in NEGOTIATING.
    pub fn propose(
        &mut self,
        worker: &str,
        name: &str,
        contract_type: &str,
        content: &str,
        code: Option<&str>,
    ) -> Result<&Contract> {
        single_line("worker", worker)?;
        single_line("contract name", name)?;
        single_line("contract type", contract_type)?;
        if self.by_name(name).is_some() {
            return Err(Error::ContractExists(name.trim().to_string()));
        }

        let now = Utc::now();
        let entry = NegotiationEntry::new(worker, NegotiationAction::Proposal, content)
            .with_code(code)
            .with_transition(Some(ContractStatus::Negotiating));
        let contract = Contract {
            id: ContractId::new(),
            name: name.trim().to_string(),
            contract_type: contract_type.trim().to_string(),
            proposer: worker.to_string(),
            implementer: None,
            status: ContractStatus::Negotiating,
            history: vec![entry],
            tags: Vec::new(),
            dependencies: Vec::new(),
            implementation_path: None,
            created_at: now,
            updated_at: now,
            agreed_at: None,
            implemented_at: None,
            verified_at: None,
        };
        let id = contract.id;
        clog!("Contract '{}' ({}) proposed by {}", contract.name, id.short(), worker);
        self.contracts.insert(id, contract);
        Ok(&self.contracts[&id])
    }

    fn mutable(&mut self, id: ContractId) -> Result<Option<&mut Contract>> {
        match self.contracts.get_mut(&id) {
            Some(contract) if contract.status.is_terminal() => Err(Error::ContractImmutable {
                id,
                status: contract.status,
            }),
            other => Ok(other),
        }
    }

    /// Append a worker's answer.
    ///
    /// `Dispute` always moves to DISPUTED. `Agree` moves to AGREED when the
    /// responder is not the proposer, or once two distinct workers have
    /// agreed. `Counter` reopens an AGREED or DISPUTED contract.
    pub fn respond(
        &mut self,
        worker: &str,
        id: ContractId,
        content: &str,
        code: Option<&str>,
        action: RespondAction,
    ) -> Result<Option<&Contract>> {
        single_line("worker", worker)?;
        let Some(contract) = self.mutable(id)? else {
            return Ok(None);
        };

        let entry = match action {
            RespondAction::Response => NegotiationEntry::new(worker, NegotiationAction::Response, content),
            RespondAction::Counter => NegotiationEntry::new(worker, NegotiationAction::Counter, content),
            RespondAction::Dispute => NegotiationEntry::new(worker, NegotiationAction::Dispute, content),
            RespondAction::Agree => NegotiationEntry::new(worker, NegotiationAction::Response, content)
                .with_meta(AGREED_KEY, "true"),
        }
        .with_code(code);

        let next = match action {
            RespondAction::Response => None,
            RespondAction::Dispute => Some(ContractStatus::Disputed),
            RespondAction::Counter => matches!(
                contract.status,
                ContractStatus::Agreed | ContractStatus::Disputed
            )
            .then_some(ContractStatus::Negotiating),
            RespondAction::Agree => {
                let open = matches!(
                    contract.status,
                    ContractStatus::Negotiating | ContractStatus::Disputed
                );
                // Agreements given before the latest counter were for other terms.
                let since = contract
                    .history
                    .iter()
                    .rposition(|e| e.action == NegotiationAction::Counter)
                    .map_or(0, |i| i + 1);
                let mut agreeing: BTreeSet<&str> = contract.history[since..]
                    .iter()
                    .filter(|e| e.signals_agreement())
                    .map(|e| e.worker.as_str())
                    .collect();
                agreeing.insert(worker);
                (open && (worker != contract.proposer || agreeing.len() >= 2))
                    .then_some(ContractStatus::Agreed)
            }
        };

        if action == RespondAction::Agree
            && contract.implementer.is_none()
            && worker != contract.proposer
        {
            contract.implementer = Some(worker.to_string());
        }
        Self::append(contract, entry, next);
        Ok(Some(&*contract))
    }

    /// Mediator decision: always ends in AGREED.
    pub fn resolve(
        &mut self,
        mediator: &str,
        id: ContractId,
        resolution: &str,
        code: Option<&str>,
    ) -> Result<Option<&Contract>> {
        single_line("worker", mediator)?;
        let Some(contract) = self.mutable(id)? else {
            return Ok(None);
        };
        let entry =
            NegotiationEntry::new(mediator, NegotiationAction::Resolution, resolution).with_code(code);
        Self::append(contract, entry, Some(ContractStatus::Agreed));
        Ok(Some(&*contract))
    }

    /// Record an implementation. Allowed from any non-terminal status.
    #[allow(clippy::too_many_arguments)]
    pub fn implement(
        &mut self,
        worker: &str,
        id: ContractId,
        details: &str,
        file_path: Option<&str>,
        code: Option<&str>,
        quality: f64,
    ) -> Result<Option<&Contract>> {
        single_line("worker", worker)?;
        if let Some(path) = file_path {
            single_line("implementation path", path)?;
        }
        let Some(contract) = self.mutable(id)? else {
            return Ok(None);
        };
        let mut entry = NegotiationEntry::new(worker, NegotiationAction::Implementation, details)
            .with_code(code)
            .with_quality(Some(quality));
        if let Some(path) = file_path {
            entry = entry.with_meta("file_path", path);
            contract.implementation_path = Some(path.to_string());
        }
        contract.implementer = Some(worker.to_string());
        Self::append(contract, entry, Some(ContractStatus::Implemented));
        Ok(Some(&*contract))
    }

    /// Check an implementation: VERIFIED on success, DISPUTED for rework.
    pub fn verify(
        &mut self,
        worker: &str,
        id: ContractId,
        verified: bool,
        notes: &str,
        quality: Option<f64>,
    ) -> Result<Option<&Contract>> {
        single_line("worker", worker)?;
        let Some(contract) = self.mutable(id)? else {
            return Ok(None);
        };
        let entry = NegotiationEntry::new(worker, NegotiationAction::Verification, notes)
            .with_quality(quality)
            .with_meta("verified", if verified { "true" } else { "false" });
        let next = if verified {
            ContractStatus::Verified
        } else {
            ContractStatus::Disputed
        };
        Self::append(contract, entry, Some(next));
        Ok(Some(&*contract))
    }

    /// Retire a contract. History is kept; the name becomes free again.
    pub fn deprecate(&mut self, id: ContractId, reason: &str) -> Result<Option<&Contract>> {
        let Some(contract) = self.contracts.get_mut(&id) else {
            return Ok(None);
        };
        if contract.status == ContractStatus::Deprecated {
            return Err(Error::ContractImmutable {
                id,
                status: contract.status,
            });
        }
        let entry = NegotiationEntry::new(SYSTEM_WORKER, NegotiationAction::Deprecation, reason);
        Self::append(contract, entry, Some(ContractStatus::Deprecated));
        Ok(Some(&*contract))
    }

    /// Administrative hard delete.
    pub fn delete(&mut self, id: ContractId) -> Option<Contract> {
        let removed = self.contracts.remove(&id);
        if let Some(contract) = &removed {
            clog!("Contract '{}' ({}) deleted", contract.name, id.short());
        }
        removed
    }

    /// Replace tags. Tags are single words or phrases without commas.
    pub fn set_tags(&mut self, id: ContractId, tags: Vec<String>) -> Result<Option<&Contract>> {
        for tag in &tags {
            single_line("tag", tag)?;
            if tag.contains(',') {
                return Err(Error::Validation(format!("tag '{}' contains a comma", tag)));
            }
        }
        let Some(contract) = self.mutable(id)? else {
            return Ok(None);
        };
        contract.tags = tags.into_iter().map(|t| t.trim().to_string()).collect();
        contract.updated_at = Utc::now();
        Ok(Some(&*contract))
    }

    /// Declare that `id` builds on `depends_on`. Unknown ids are not found.
    pub fn add_dependency(
        &mut self,
        id: ContractId,
        depends_on: ContractId,
    ) -> Result<Option<&Contract>> {
        if id == depends_on {
            return Err(Error::Validation("a contract cannot depend on itself".to_string()));
        }
        if !self.contracts.contains_key(&depends_on) {
            return Ok(None);
        }
        let Some(contract) = self.mutable(id)? else {
            return Ok(None);
        };
        if !contract.dependencies.contains(&depends_on) {
            contract.dependencies.push(depends_on);
            contract.updated_at = Utc::now();
        }
        Ok(Some(&*contract))
    }

    fn append(contract: &mut Contract, entry: NegotiationEntry, next: Option<ContractStatus>) {
        let now = entry.timestamp;
        let action = entry.action;
        let worker = entry.worker.clone();
        contract.history.push(entry.with_transition(next));
        contract.updated_at = now;

        let Some(status) = next else {
            clog_debug!(
                "Contract {} {} by {} (status stays {})",
                contract.id.short(),
                action,
                worker,
                contract.status
            );
            return;
        };
        match status {
            ContractStatus::Agreed => contract.agreed_at = Some(now),
            ContractStatus::Implemented => contract.implemented_at = Some(now),
            ContractStatus::Verified => contract.verified_at = Some(now),
            _ => {}
        }
        clog!(
            "Contract '{}' {} -> {} ({} by {})",
            contract.name,
            contract.status,
            status,
            action,
            worker
        );
        contract.status = status;
    }

    pub fn get(&self, id: ContractId) -> Option<&Contract> {
        self.contracts.get(&id)
    }

    /// Live (non-deprecated) contract with this name, ignoring case.
    pub fn by_name(&self, name: &str) -> Option<&Contract> {
        let wanted = name.trim().to_lowercase();
        self.contracts.values().find(|c| {
            c.status != ContractStatus::Deprecated && c.name.to_lowercase() == wanted
        })
    }

    /// Resolve an id, an 8-character id prefix, or a name.
    pub fn lookup(&self, reference: &str) -> Option<&Contract> {
        let reference = reference.trim();
        if let Ok(id) = reference.parse::<ContractId>() {
            return self.get(id);
        }
        self.by_name(reference).or_else(|| {
            let mut matches = self
                .contracts
                .values()
                .filter(|c| reference.len() >= 8 && c.id.to_string().starts_with(reference));
            let first = matches.next();
            first.filter(|_| matches.next().is_none())
        })
    }

    pub fn by_status(&self, status: ContractStatus) -> Vec<&Contract> {
        self.contracts.values().filter(|c| c.status == status).collect()
    }

    pub fn for_worker(&self, worker: &str, role: ContractRole) -> Vec<&Contract> {
        self.contracts
            .values()
            .filter(|c| c.involves(worker, role))
            .collect()
    }

    /// Contracts still needing action: NEGOTIATING ones, plus AGREED ones
    /// awaiting implementation by `worker` (or by anyone when unassigned).
    pub fn pending(&self, worker: Option<&str>) -> Vec<&Contract> {
        self.contracts
            .values()
            .filter(|c| match c.status {
                ContractStatus::Negotiating => true,
                ContractStatus::Agreed => match (worker, c.implementer.as_deref()) {
                    (None, _) | (_, None) => true,
                    (Some(w), Some(implementer)) => w == implementer,
                },
                _ => false,
            })
            .collect()
    }
}
