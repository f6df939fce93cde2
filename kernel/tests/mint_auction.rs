//! Full-kernel mint cycles: escrowed bids, second-price clearing, refunds,
//! backlog draining.

mod common;

use common::*;
use pretty_assertions::assert_eq;
use serde_json::json;

fn submit(kernel: &mut Kernel, who: &str, artifact: &str, bid: u64) -> String {
    let result = kernel.execute(intent(json!({
        "action_type": "invoke",
        "principal_id": who,
        "artifact_id": "genesis_mint",
        "method": "submit",
        "args": {"artifact_id": artifact, "bid": bid},
    })));
    assert!(result.ok, "{}", result.message);
    result.data.unwrap()["submission_id"]
        .as_str()
        .unwrap()
        .to_string()
}

fn publish(kernel: &mut Kernel, who: &str, id: &str) {
    let result = kernel.execute(intent(json!({
        "action_type": "write",
        "principal_id": who,
        "artifact_id": id,
        "type": "code",
        "content": "artifact up for minting",
    })));
    assert!(result.ok, "{}", result.message);
}

#[test]
fn vickrey_cycle_matches_the_worked_example() {
    let (mut kernel, clock) = test_kernel();
    publish(&mut kernel, "alice", "a");
    publish(&mut kernel, "bob", "b");

    // t=5s: alice bids 10; t=20s: bob bids 15.
    clock.set_ms(START_MS + 5_000);
    submit(&mut kernel, "alice", "a", 10);
    clock.set_ms(START_MS + 20_000);
    submit(&mut kernel, "bob", "b", 15);

    // Bids are escrowed immediately.
    assert_eq!(balance(&kernel, "alice"), 90);
    assert_eq!(balance(&kernel, "bob"), 85);

    // t=60s: resolution. Winner bob at the second price of 10.
    clock.set_ms(START_MS + 60_000);
    let before = kernel.journal().last_number();
    assert_eq!(kernel.resolve_due_auctions().unwrap(), 1);

    assert_eq!(balance(&kernel, "bob"), 90, "paid 10, refunded 5 over-hold");
    assert_eq!(balance(&kernel, "alice"), 100, "loser fully refunded");

    let types = event_types_since(&kernel, before);
    assert!(types.contains(&"mint_resolution".to_string()));
    let resolution = kernel.mint().history(1).last().unwrap().clone();
    assert_eq!(resolution.winner, "bob");
    assert_eq!(resolution.price, 10);

    // The clearing price stays with the mint principal.
    assert_eq!(balance(&kernel, "genesis_mint"), 10);
    kernel.validate_invariants().unwrap();
}

#[test]
fn cancellation_releases_escrow() {
    let (mut kernel, _clock) = test_kernel();
    publish(&mut kernel, "alice", "a");
    let submission_id = submit(&mut kernel, "alice", "a", 10);
    assert_eq!(balance(&kernel, "alice"), 90);

    // Only the submitter may cancel.
    let result = kernel.execute(intent(json!({
        "action_type": "invoke",
        "principal_id": "bob",
        "artifact_id": "genesis_mint",
        "method": "cancel",
        "args": {"submission_id": submission_id},
    })));
    assert!(!result.ok);

    let result = kernel.execute(intent(json!({
        "action_type": "invoke",
        "principal_id": "alice",
        "artifact_id": "genesis_mint",
        "method": "cancel",
        "args": {"submission_id": submission_id},
    })));
    assert!(result.ok, "{}", result.message);
    assert_eq!(balance(&kernel, "alice"), 100);
    assert!(kernel.mint().pending().is_empty());
}

#[test]
fn missed_periods_drain_without_double_settling() {
    let (mut kernel, clock) = test_kernel();
    publish(&mut kernel, "alice", "a");
    clock.set_ms(START_MS + 5_000);
    submit(&mut kernel, "alice", "a", 10);

    // The clock jumps four periods; everything settles exactly once.
    clock.set_ms(START_MS + 250_000);
    let applied = kernel.resolve_due_auctions().unwrap();
    assert_eq!(applied, 1);
    assert_eq!(balance(&kernel, "alice"), 99, "single bidder pays the minimum");
    assert!(!kernel.mint().is_due(clock.now_ms()));
    kernel.validate_invariants().unwrap();
}

#[test]
fn reward_mints_new_scrip_only_at_resolution() {
    let clock = oikos_kernel::types::ManualClock::new(START_MS);
    let mut config = base_config(std::env::temp_dir().join("oikos-unused"));
    config.mint.reward_amount = 40;
    let mut kernel = Kernel::in_memory(config, clock.clone()).unwrap();
    let total_before: u64 = kernel.ledger().total_scrip();

    publish(&mut kernel, "alice", "a");
    submit(&mut kernel, "alice", "a", 10);
    assert_eq!(kernel.ledger().total_scrip(), total_before, "escrow conserves");

    clock.set_ms(START_MS + 60_000);
    kernel.resolve_due_auctions().unwrap();
    assert_eq!(
        kernel.ledger().total_scrip(),
        total_before + 40,
        "reward is the only new scrip"
    );
    assert_eq!(balance(&kernel, "alice"), 100 - 1 + 40);
    kernel.validate_invariants().unwrap();
}

#[test]
fn status_reports_time_to_next_auction() {
    let (mut kernel, clock) = test_kernel();
    clock.set_ms(START_MS + 45_000);
    let result = kernel.execute(intent(json!({
        "action_type": "invoke",
        "principal_id": "alice",
        "artifact_id": "genesis_mint",
        "method": "status",
    })));
    assert!(result.ok);
    assert_eq!(result.data.unwrap()["seconds_to_next_auction"], json!(15));
}
