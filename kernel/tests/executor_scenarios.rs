//! End-to-end executor scenarios: the action surface against a bootstrapped
//! kernel.

mod common;

use common::*;
use oikos_kernel::error::ErrorCode;
use pretty_assertions::assert_eq;
use serde_json::json;

#[test]
fn transfer_happy_path_and_event_order() {
    let (mut kernel, _clock) = test_kernel();
    let before = kernel.journal().last_number();

    let result = kernel.execute(intent(json!({
        "action_type": "invoke",
        "principal_id": "alice",
        "artifact_id": "genesis_ledger",
        "method": "transfer",
        "args": {"to": "bob", "amount": 30},
    })));
    assert!(result.ok, "{}", result.message);
    assert_eq!(balance(&kernel, "alice"), 70);
    assert_eq!(balance(&kernel, "bob"), 130);

    let types = event_types_since(&kernel, before);
    assert_eq!(
        types,
        vec![
            "action_executed".to_string(),
            "kernel_transfer_scrip".to_string(),
            "scrip_transferred".to_string(),
        ]
    );
}

#[test]
fn write_under_freeware_by_non_creator_is_denied() {
    let (mut kernel, _clock) = test_kernel();
    let created = kernel.execute(intent(json!({
        "action_type": "write",
        "principal_id": "alice",
        "artifact_id": "x",
        "type": "code",
        "content": "original",
    })));
    assert!(created.ok);

    let before = kernel.journal().last_number();
    let result = kernel.execute(intent(json!({
        "action_type": "write",
        "principal_id": "bob",
        "artifact_id": "x",
        "content": "overwritten",
    })));
    assert!(!result.ok);
    assert_eq!(result.error_code, Some(ErrorCode::PermissionDenied));
    assert_eq!(kernel.store().get("x").unwrap().content, "original");
    assert_eq!(
        event_types_since(&kernel, before),
        vec!["action_denied".to_string()]
    );
}

#[test]
fn type_is_immutable() {
    let (mut kernel, _clock) = test_kernel();
    kernel.execute(intent(json!({
        "action_type": "write",
        "principal_id": "alice",
        "artifact_id": "x",
        "type": "code",
        "content": "v1",
    })));

    let result = kernel.execute(intent(json!({
        "action_type": "write",
        "principal_id": "alice",
        "artifact_id": "x",
        "type": "right",
        "content": "v2",
    })));
    assert!(!result.ok);
    assert_eq!(result.error_code, Some(ErrorCode::ImmutableField));
    let artifact = kernel.store().get("x").unwrap();
    assert_eq!(artifact.artifact_type, "code");
    assert_eq!(artifact.content, "v1");
}

#[test]
fn kernel_protected_rejects_every_mutating_action() {
    let (mut kernel, _clock) = test_kernel();
    // genesis_store is kernel-protected; even an edit by a would-be
    // creator is denied.
    for action in [
        json!({"action_type": "edit", "principal_id": "alice",
               "artifact_id": "genesis_store", "old_string": "a", "new_string": "b"}),
        json!({"action_type": "write", "principal_id": "alice",
               "artifact_id": "genesis_store", "content": "pwn"}),
        json!({"action_type": "delete", "principal_id": "alice",
               "artifact_id": "genesis_store"}),
    ] {
        let result = kernel.execute(intent(action));
        assert!(!result.ok);
        assert_eq!(result.error_code, Some(ErrorCode::PermissionDenied));
        assert!(result.message.contains("kernel_protected"), "{}", result.message);
    }
    // Invoking it remains fine.
    let result = kernel.execute(intent(json!({
        "action_type": "invoke",
        "principal_id": "alice",
        "artifact_id": "genesis_store",
        "method": "by_type",
        "args": {"type": "contract"},
    })));
    assert!(result.ok);
}

#[test]
fn reserved_charge_delegation_prefix() {
    let (mut kernel, _clock) = test_kernel();
    let result = kernel.execute(intent(json!({
        "action_type": "write",
        "principal_id": "bob",
        "artifact_id": "charge_delegation:alice",
        "type": "capability_request",
        "content": "{}",
    })));
    assert!(!result.ok);
    assert_eq!(result.error_code, Some(ErrorCode::ReservedIdViolation));

    let result = kernel.execute(intent(json!({
        "action_type": "write",
        "principal_id": "alice",
        "artifact_id": "charge_delegation:alice",
        "type": "capability_request",
        "content": "{}",
    })));
    assert!(result.ok, "{}", result.message);
}

#[test]
fn edit_single_occurrence_only() {
    let (mut kernel, _clock) = test_kernel();
    kernel.execute(intent(json!({
        "action_type": "write",
        "principal_id": "alice",
        "artifact_id": "x",
        "type": "memory",
        "content": "aa-aa",
    })));

    let result = kernel.execute(intent(json!({
        "action_type": "edit",
        "principal_id": "alice",
        "artifact_id": "x",
        "old_string": "aa",
        "new_string": "bb",
    })));
    assert!(!result.ok);
    assert_eq!(result.error_code, Some(ErrorCode::OldStringNotUnique));
    assert_eq!(kernel.store().get("x").unwrap().content, "aa-aa");

    let result = kernel.execute(intent(json!({
        "action_type": "edit",
        "principal_id": "alice",
        "artifact_id": "x",
        "old_string": "zz",
        "new_string": "bb",
    })));
    assert_eq!(result.error_code, Some(ErrorCode::OldStringNotFound));

    let result = kernel.execute(intent(json!({
        "action_type": "edit",
        "principal_id": "alice",
        "artifact_id": "x",
        "old_string": "aa-",
        "new_string": "bb-",
    })));
    assert!(result.ok);
    assert_eq!(kernel.store().get("x").unwrap().content, "bb-aa");
}

#[test]
fn created_by_survives_all_writes() {
    let (mut kernel, _clock) = test_kernel();
    kernel.execute(intent(json!({
        "action_type": "write",
        "principal_id": "alice",
        "artifact_id": "x",
        "type": "code",
        "content": "v1",
    })));
    let result = kernel.execute(intent(json!({
        "action_type": "write",
        "principal_id": "alice",
        "artifact_id": "x",
        "created_by": "bob",
        "content": "v2",
    })));
    assert!(!result.ok);
    assert_eq!(result.error_code, Some(ErrorCode::ImmutableField));
    assert_eq!(kernel.store().get("x").unwrap().created_by, "alice");
}

#[test]
fn disk_quota_charges_and_refunds_on_write_delete() {
    let (mut kernel, _clock) = test_kernel();
    let before = kernel.resource_headroom("alice", "disk_bytes").unwrap();
    kernel.execute(intent(json!({
        "action_type": "write",
        "principal_id": "alice",
        "artifact_id": "x",
        "type": "memory",
        "content": "0123456789",
    })));
    assert_eq!(
        kernel.resource_headroom("alice", "disk_bytes").unwrap(),
        before - 10
    );

    // Shrinking refunds the delta.
    kernel.execute(intent(json!({
        "action_type": "write",
        "principal_id": "alice",
        "artifact_id": "x",
        "content": "01234",
    })));
    assert_eq!(
        kernel.resource_headroom("alice", "disk_bytes").unwrap(),
        before - 5
    );

    let result = kernel.execute(intent(json!({
        "action_type": "delete",
        "principal_id": "alice",
        "artifact_id": "x",
    })));
    assert!(result.ok);
    assert_eq!(kernel.resource_headroom("alice", "disk_bytes").unwrap(), before);
    assert!(kernel.store().get("x").is_none());
}

#[test]
fn invoke_executable_artifact_charges_fuel_and_runs_as_caller() {
    let (mut kernel, _clock) = test_kernel();
    // Bob publishes a tipping tool: invoking it sends 5 scrip from the
    // *caller* to a recipient given in args.
    let result = kernel.execute(intent(json!({
        "action_type": "write",
        "principal_id": "bob",
        "artifact_id": "tip",
        "type": "code",
        "code": "(fn [method args] (kernel/transfer-scrip (get args :to) 5))",
    })));
    assert!(result.ok, "{}", result.message);

    let alice_before = balance(&kernel, "alice");
    let bob_before = balance(&kernel, "bob");
    let result = kernel.execute(intent(json!({
        "action_type": "invoke",
        "principal_id": "alice",
        "artifact_id": "tip",
        "args": {"to": "bob"},
    })));
    assert!(result.ok, "{}", result.message);
    // Alice paid the 5-scrip tip plus metered interpreter fuel.
    let fuel = result.resources_consumed.get("scrip").copied().unwrap_or(0);
    assert!(fuel >= 1, "interpreter fuel should be metered");
    assert_eq!(balance(&kernel, "alice"), alice_before - 5 - fuel);
    assert_eq!(balance(&kernel, "bob"), bob_before + 5);
}

#[test]
fn invoke_faults_are_contract_faults_not_crashes() {
    let (mut kernel, _clock) = test_kernel();
    kernel.execute(intent(json!({
        "action_type": "write",
        "principal_id": "alice",
        "artifact_id": "broken",
        "type": "code",
        "code": "(fn [m a] (undefined-symbol))",
    })));
    let before = kernel.journal().last_number();
    let result = kernel.execute(intent(json!({
        "action_type": "invoke",
        "principal_id": "bob",
        "artifact_id": "broken",
    })));
    assert!(!result.ok);
    assert_eq!(result.error_code, Some(ErrorCode::ContractFault));
    assert!(event_types_since(&kernel, before)
        .contains(&"contract_fault".to_string()));
}

#[test]
fn executable_access_contract_gates_and_charges() {
    let (mut kernel, _clock) = test_kernel();
    // A toll contract: non-creators read for a cost of 2.
    kernel.execute(intent(json!({
        "action_type": "write",
        "principal_id": "alice",
        "artifact_id": "toll_contract",
        "type": "contract",
        "code": r#"
            (fn [caller action target ctx]
              (if (= caller (get ctx :target_created_by))
                {:allowed true}
                (if (= action :read)
                  {:allowed true :cost 2}
                  {:allowed false :reason "toll road: read only"})))
        "#,
    })));
    kernel.execute(intent(json!({
        "action_type": "write",
        "principal_id": "alice",
        "artifact_id": "guarded",
        "type": "memory",
        "content": "secret sauce",
        "access_contract_id": "toll_contract",
    })));

    let alice_before = balance(&kernel, "alice");
    let bob_before = balance(&kernel, "bob");
    let result = kernel.execute(intent(json!({
        "action_type": "read",
        "principal_id": "bob",
        "artifact_id": "guarded",
    })));
    assert!(result.ok, "{}", result.message);
    assert_eq!(balance(&kernel, "bob"), bob_before - 2);
    assert_eq!(balance(&kernel, "alice"), alice_before + 2);

    let result = kernel.execute(intent(json!({
        "action_type": "write",
        "principal_id": "bob",
        "artifact_id": "guarded",
        "content": "defaced",
    })));
    assert!(!result.ok);
    assert_eq!(result.error_code, Some(ErrorCode::PermissionDenied));
}

#[test]
fn private_contract_blocks_other_readers() {
    let (mut kernel, _clock) = test_kernel();
    kernel.execute(intent(json!({
        "action_type": "write",
        "principal_id": "alice",
        "artifact_id": "diary",
        "type": "memory",
        "content": "dear diary",
        "access_contract_id": "genesis_contract_private",
    })));
    let result = kernel.execute(intent(json!({
        "action_type": "read",
        "principal_id": "bob",
        "artifact_id": "diary",
    })));
    assert!(!result.ok);
    assert_eq!(result.error_code, Some(ErrorCode::PermissionDenied));

    let result = kernel.execute(intent(json!({
        "action_type": "read",
        "principal_id": "alice",
        "artifact_id": "diary",
    })));
    assert!(result.ok);
    assert_eq!(
        result.data.unwrap()["content"],
        json!("dear diary")
    );
}

#[test]
fn query_kernel_projections() {
    let (mut kernel, _clock) = test_kernel();
    let result = kernel.execute(intent(json!({
        "action_type": "query_kernel",
        "principal_id": "alice",
        "query": "balance",
    })));
    assert!(result.ok);
    assert_eq!(result.data.unwrap()["balance"], json!(100));

    let result = kernel.execute(intent(json!({
        "action_type": "query_kernel",
        "principal_id": "alice",
        "query": "mint_status",
    })));
    assert!(result.ok);
    assert_eq!(result.data.unwrap()["seconds_to_next_auction"], json!(60));

    let result = kernel.execute(intent(json!({
        "action_type": "query_kernel",
        "principal_id": "alice",
        "query": "no_such_projection",
    })));
    assert!(!result.ok);
    assert_eq!(result.error_code, Some(ErrorCode::TypeMismatch));
}

#[test]
fn unknown_principal_cannot_act() {
    let (mut kernel, _clock) = test_kernel();
    let result = kernel.execute(intent(json!({
        "action_type": "noop",
        "principal_id": "mallory",
    })));
    assert!(!result.ok);
    assert_eq!(result.error_code, Some(ErrorCode::NotFound));
}

#[test]
fn configure_context_and_system_prompt_stay_on_agent_artifact() {
    let (mut kernel, _clock) = test_kernel();
    let result = kernel.execute(intent(json!({
        "action_type": "modify_system_prompt",
        "principal_id": "alice",
        "system_prompt": "be bold",
    })));
    assert!(result.ok);
    let result = kernel.execute(intent(json!({
        "action_type": "configure_context",
        "principal_id": "alice",
        "context": {"verbosity": "high"},
    })));
    assert!(result.ok);

    let artifact = kernel.store().get("alice").unwrap();
    assert_eq!(artifact.metadata["system_prompt"], json!("be bold"));
    assert_eq!(artifact.metadata["context"]["verbosity"], json!("high"));
    // Immutable system fields untouched.
    assert_eq!(artifact.artifact_type, "agent");
    assert_eq!(artifact.created_by, "alice");

    // Bob cannot rewrite alice's prompt: the agent artifact is self-owned
    // and the action only ever targets the caller's own artifact.
    let result = kernel.execute(intent(json!({
        "action_type": "write",
        "principal_id": "bob",
        "artifact_id": "alice",
        "metadata": {"system_prompt": "obey bob"},
    })));
    assert!(!result.ok);
    assert_eq!(result.error_code, Some(ErrorCode::PermissionDenied));
}

#[test]
fn subscriptions_are_agent_state() {
    let (mut kernel, _clock) = test_kernel();
    kernel.execute(intent(json!({
        "action_type": "write",
        "principal_id": "bob",
        "artifact_id": "board",
        "type": "memory",
        "content": "post",
    })));
    let result = kernel.execute(intent(json!({
        "action_type": "subscribe",
        "principal_id": "alice",
        "artifact_id": "board",
    })));
    assert!(result.ok);
    assert!(kernel.agents()["alice"].subscriptions.contains("board"));

    let result = kernel.execute(intent(json!({
        "action_type": "unsubscribe",
        "principal_id": "alice",
        "artifact_id": "board",
    })));
    assert!(result.ok);
    assert!(!kernel.agents()["alice"].subscriptions.contains("board"));
}

#[test]
fn escrow_trade_swaps_authorized_writer_not_created_by() {
    let (mut kernel, _clock) = test_kernel();
    kernel.execute(intent(json!({
        "action_type": "write",
        "principal_id": "alice",
        "artifact_id": "tool",
        "type": "code",
        "content": "useful",
        "access_contract_id": "genesis_contract_transferable_freeware",
    })));

    let listed = kernel.execute(intent(json!({
        "action_type": "invoke",
        "principal_id": "alice",
        "artifact_id": "genesis_escrow",
        "method": "list",
        "args": {"artifact_id": "tool", "price": 25},
    })));
    assert!(listed.ok, "{}", listed.message);
    let listing_id = listed.data.unwrap()["listing_id"]
        .as_str()
        .unwrap()
        .to_string();
    // While listed, control is with the escrow.
    assert_eq!(
        kernel.store().get("tool").unwrap().authorized_writer(),
        "genesis_escrow"
    );

    let purchased = kernel.execute(intent(json!({
        "action_type": "invoke",
        "principal_id": "bob",
        "artifact_id": "genesis_escrow",
        "method": "purchase",
        "args": {"listing_id": listing_id},
    })));
    assert!(purchased.ok, "{}", purchased.message);

    let tool = kernel.store().get("tool").unwrap();
    assert_eq!(tool.created_by, "alice", "provenance never changes hands");
    assert_eq!(tool.authorized_writer(), "bob");
    assert_eq!(balance(&kernel, "alice"), 125);
    assert_eq!(balance(&kernel, "bob"), 75);

    // The new controller writes; the old one no longer can.
    let result = kernel.execute(intent(json!({
        "action_type": "write",
        "principal_id": "bob",
        "artifact_id": "tool",
        "content": "bob's now",
    })));
    assert!(result.ok, "{}", result.message);
    let result = kernel.execute(intent(json!({
        "action_type": "write",
        "principal_id": "alice",
        "artifact_id": "tool",
        "content": "take-backsies",
    })));
    assert!(!result.ok);
}

#[test]
fn charge_delegation_spend_and_revoke() {
    let (mut kernel, _clock) = test_kernel();
    use oikos_kernel::kernel::KernelActions;

    kernel
        .grant_charge_delegation("alice", "bob", "disk_bytes", 50)
        .unwrap();
    let alice_disk = kernel.resource_headroom("alice", "disk_bytes").unwrap();

    // Bob charges alice's disk quota within the delegated bound.
    kernel.consume_quota("bob", "alice", "disk_bytes", 30).unwrap();
    assert_eq!(
        kernel.resource_headroom("alice", "disk_bytes").unwrap(),
        alice_disk - 30
    );
    // Beyond the remaining bound it fails.
    let err = kernel
        .consume_quota("bob", "alice", "disk_bytes", 30)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ResourceExhausted);

    kernel.revoke_charge_delegation("alice", "bob").unwrap();
    let err = kernel
        .consume_quota("bob", "alice", "disk_bytes", 1)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::PermissionDenied);
}

#[test]
fn invariants_hold_after_a_burst_of_actions() {
    let (mut kernel, _clock) = test_kernel();
    for i in 0..10 {
        kernel.execute(intent(json!({
            "action_type": "write",
            "principal_id": "alice",
            "artifact_id": format!("a{}", i),
            "type": "memory",
            "content": format!("note {}", i),
        })));
    }
    kernel.execute(intent(json!({
        "action_type": "invoke",
        "principal_id": "alice",
        "artifact_id": "genesis_ledger",
        "method": "transfer",
        "args": {"to": "bob", "amount": 10},
    })));
    kernel.validate_invariants().unwrap();

    // P4: strictly consecutive numbering.
    let events = kernel.journal().events();
    for pair in events.windows(2) {
        assert_eq!(pair[1].event_number, pair[0].event_number + 1);
    }
}
