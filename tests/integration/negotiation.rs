//! Contract negotiation lifecycle tests.

use concord::core::{ContractRole, ContractStatus, NegotiationAction};
use concord::orchestration::{ContractManager, RespondAction, SYSTEM_WORKER};
use concord::Error;
use tokio_test::{assert_err, assert_ok};

const SCHEMA: &str = "{ \"user\": { \"id\": \"string\" } }";

/// Given a proposal from T1
/// When T2 disputes it and a mediator resolves it
/// Then the contract ends AGREED with every step kept in order
#[test]
fn test_dispute_then_resolution() {
    let mut contracts = ContractManager::new();
    let id = assert_ok!(contracts.propose("T1", "User API", "api", "Initial shape", Some(SCHEMA))).id;

    let disputed = assert_ok!(contracts.respond("T2", id, "ids must be numeric", None, RespondAction::Dispute))
        .expect("contract exists");
    assert_eq!(disputed.status, ContractStatus::Disputed);

    let resolved = assert_ok!(contracts.resolve("T0", id, "numeric ids, string names", None))
        .expect("contract exists");
    assert_eq!(resolved.status, ContractStatus::Agreed);

    let actions: Vec<NegotiationAction> = resolved.history.iter().map(|e| e.action).collect();
    assert_eq!(
        actions,
        vec![
            NegotiationAction::Proposal,
            NegotiationAction::Dispute,
            NegotiationAction::Resolution
        ]
    );
    assert_eq!(resolved.latest_code(), Some(SCHEMA));
}

#[test]
fn test_full_lifecycle_to_verified() {
    let mut contracts = ContractManager::new();
    let id = assert_ok!(contracts.propose("T1", "Auth tokens", "data", "JWT layout", None)).id;

    let agreed = assert_ok!(contracts.respond("T2", id, "works for me", None, RespondAction::Agree)).unwrap();
    assert_eq!(agreed.status, ContractStatus::Agreed);
    assert_eq!(agreed.implementer.as_deref(), Some("T2"));
    assert!(agreed.agreed_at.is_some());

    let implemented = assert_ok!(contracts.implement(
        "T2",
        id,
        "token module",
        Some("src/auth/token.rs"),
        Some("pub struct Token;"),
        0.9
    ))
    .unwrap();
    assert_eq!(implemented.status, ContractStatus::Implemented);
    assert_eq!(implemented.implementation_path.as_deref(), Some("src/auth/token.rs"));

    let verified = assert_ok!(contracts.verify("T1", id, true, "matches", Some(1.0))).unwrap();
    assert_eq!(verified.status, ContractStatus::Verified);
    assert_eq!(verified.history.len(), 4);

    assert_eq!(contracts.for_worker("T2", ContractRole::Implementer).len(), 1);
    assert!(contracts.pending(None).is_empty());
}

/// Given T2 agreed to T1's proposal and then countered it
/// When the proposer T1 agrees to the countered terms
/// Then T2's earlier agreement does not complete the quorum
#[test]
fn test_counter_discards_earlier_agreement() {
    let mut contracts = ContractManager::new();
    let id = assert_ok!(contracts.propose("T1", "Auth tokens", "data", "JWT layout", None)).id;
    assert_ok!(contracts.respond("T2", id, "works for me", None, RespondAction::Agree));
    let countered = assert_ok!(contracts.respond("T2", id, "add expiry", None, RespondAction::Counter)).unwrap();
    assert_eq!(countered.status, ContractStatus::Negotiating);

    let after = assert_ok!(contracts.respond("T1", id, "expiry added", None, RespondAction::Agree)).unwrap();
    assert_eq!(after.status, ContractStatus::Negotiating);

    let agreed = assert_ok!(contracts.respond("T2", id, "good", None, RespondAction::Agree)).unwrap();
    assert_eq!(agreed.status, ContractStatus::Agreed);
}

#[test]
fn test_history_is_append_only() {
    let mut contracts = ContractManager::new();
    let id = assert_ok!(contracts.propose("T1", "Events", "protocol", "v1", None)).id;
    let first = contracts.get(id).unwrap().history[0].clone();

    for (i, action) in [RespondAction::Response, RespondAction::Counter, RespondAction::Dispute]
        .into_iter()
        .enumerate()
    {
        let contract = assert_ok!(contracts.respond("T2", id, &format!("note {}", i), None, action)).unwrap();
        assert_eq!(contract.history.len(), i + 2);
        assert_eq!(contract.history[0], first);
    }
}

#[test]
fn test_verified_contracts_are_immutable() {
    let mut contracts = ContractManager::new();
    let id = assert_ok!(contracts.propose("T1", "Config", "data", "keys", None)).id;
    assert_ok!(contracts.implement("T2", id, "done", None, None, 1.0));
    assert_ok!(contracts.verify("T1", id, true, "ok", None));

    let err = assert_err!(contracts.respond("T3", id, "late", None, RespondAction::Counter));
    assert!(matches!(
        err,
        Error::ContractImmutable { status: ContractStatus::Verified, .. }
    ));
    assert_err!(contracts.resolve("T0", id, "too late", None));
    assert_eq!(contracts.get(id).unwrap().history.len(), 3);

    // Deprecation is still allowed and is written by the system.
    let deprecated = assert_ok!(contracts.deprecate(id, "superseded")).unwrap();
    assert_eq!(deprecated.status, ContractStatus::Deprecated);
    assert_eq!(deprecated.last_entry().map(|e| e.worker.as_str()), Some(SYSTEM_WORKER));
    assert_err!(contracts.deprecate(id, "again"));
}

#[test]
fn test_duplicate_names_until_deprecated() {
    let mut contracts = ContractManager::new();
    let id = assert_ok!(contracts.propose("T1", "User API", "api", "v1", None)).id;

    let err = assert_err!(contracts.propose("T2", "user api", "api", "v2", None));
    assert!(matches!(err, Error::ContractExists(_)));

    assert_ok!(contracts.deprecate(id, "rewrite"));
    assert_ok!(contracts.propose("T2", "User API", "api", "v2", None));
    assert_eq!(contracts.len(), 2);
}

#[test]
fn test_unknown_contract_is_none() {
    let mut contracts = ContractManager::new();
    let ghost = concord::core::ContractId::new();
    assert!(assert_ok!(contracts.respond("T1", ghost, "hello", None, RespondAction::Response)).is_none());
    assert!(assert_ok!(contracts.verify("T1", ghost, true, "", None)).is_none());
    assert!(contracts.delete(ghost).is_none());
}
