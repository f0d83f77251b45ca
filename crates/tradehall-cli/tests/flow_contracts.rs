//! End-to-end flows through the library API, wiring the lease, the record
//! stores, and the ledger together the way a front-end delivery loop does.

use std::fs;
use std::path::{Path, PathBuf};

use tradehall_core::{
    CreateEscortRequest, CreateTradeRequest, ItemCatalog, RatingSentiment, RecordSelector,
    SubmitRatingRequest, TradeStatus, TradehallError,
};
use tradehall_store_json::{LeaseDir, TradeHall};
use ulid::Ulid;

fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("test failure: {err}"),
    }
}

fn must_some<T>(value: Option<T>) -> T {
    match value {
        Some(inner) => inner,
        None => panic!("expected Some(..), got None"),
    }
}

fn scratch_dir(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("tradehall-flow-{label}-{}", Ulid::new()))
}

fn fixture_hall(dir: &Path) -> TradeHall {
    TradeHall::with_catalog(
        dir,
        ItemCatalog::new(vec![
            "ARC Alloy".to_string(),
            "ARC Powercell".to_string(),
            "Mechanical Components".to_string(),
        ]),
    )
}

#[test]
fn redelivered_request_is_deduplicated_by_lease_and_interaction_id() {
    let dir = scratch_dir("redelivery");
    let hall = fixture_hall(&dir);
    let leases = LeaseDir::new(dir.join("locks"));

    // First delivery wins the lease and creates the trade.
    let lease = must_some(must(leases.acquire("req-42")));
    let request = CreateTradeRequest {
        interaction_id: Some("req-42".to_string()),
        buyer_id: "buyer-1".to_string(),
        item_input: "arc alloy".to_string(),
        price: None,
        notes: None,
        channel_id: "chan-1".to_string(),
        thread_id: "thread-42".to_string(),
        summary_message_id: None,
    };

    // A concurrent redelivery loses the lease while the first is in flight.
    assert!(must(leases.acquire("req-42")).is_none());

    let reply = must(hall.create_trade("seller-1", &request));
    must(lease.release());

    // A late redelivery gets the lease but is stopped by the recorded
    // interaction id.
    let lease = must_some(must(leases.acquire("req-42")));
    let repeat = hall.create_trade("seller-1", &request);
    assert!(matches!(repeat, Err(TradehallError::Duplicate(_))));
    must(lease.release());

    assert_eq!(hall.trades().list().len(), 1);
    assert_eq!(
        must_some(hall.trades().get_by_interaction_id("req-42")).id,
        reply.trade.id
    );
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn thread_scoped_commands_drive_a_trade_to_completion() {
    let dir = scratch_dir("thread-flow");
    let hall = fixture_hall(&dir);

    let request = CreateTradeRequest {
        interaction_id: None,
        buyer_id: "buyer-1".to_string(),
        item_input: "arc powrcell".to_string(),
        price: Some("two crates of alloy".to_string()),
        notes: None,
        channel_id: "chan-1".to_string(),
        thread_id: "ops-thread-1".to_string(),
        summary_message_id: None,
    };
    let opened = must(hall.create_trade("seller-1", &request));
    assert_eq!(opened.trade.matched_items[0].matched, "ARC Powercell");

    let in_thread = RecordSelector::by_thread("ops-thread-1");
    let completed = must(hall.mark_trade_complete("seller-1", &in_thread));
    assert_eq!(completed.trade.status, TradeStatus::AwaitingRating);

    let buyer_review = must(hall.submit_rating(
        "buyer-1",
        &SubmitRatingRequest {
            trade: in_thread.clone(),
            target_role: None,
            sentiment: RatingSentiment::Positive,
            comments: Some("smooth handoff".to_string()),
        },
    ));
    assert!(!buyer_review.trade_completed);

    let seller_review = must(hall.submit_rating(
        "seller-1",
        &SubmitRatingRequest {
            trade: in_thread,
            target_role: None,
            sentiment: RatingSentiment::Positive,
            comments: None,
        },
    ));
    assert!(seller_review.trade_completed);
    assert_eq!(seller_review.trade.status, TradeStatus::Completed);

    assert_eq!(hall.rep().summary_for_user("seller-1").total, 1);
    assert_eq!(hall.rep().summary_for_user("buyer-1").total, 1);
    assert_eq!(hall.ratings().list().len(), 2);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn escort_rewards_survive_a_redelivered_completion() {
    let dir = scratch_dir("escort-redelivery");
    let hall = fixture_hall(&dir);
    let leases = LeaseDir::new(dir.join("locks"));

    let opened = must(hall.create_escort(
        "escort-1",
        &CreateEscortRequest {
            interaction_id: None,
            client_id: "client-1".to_string(),
            route: "north ridge to the buried city".to_string(),
            payment: None,
            notes: None,
            channel_id: "chan-1".to_string(),
            thread_id: "escort-thread-1".to_string(),
        },
    ));

    let selector = RecordSelector::by_thread("escort-thread-1");

    let lease = must_some(must(leases.acquire("req-escort-1")));
    let first = must(hall.complete_escort("client-1", &selector));
    must(lease.release());
    assert_eq!(first.escort.id, opened.escort.id);

    // The retry arrives after release; the completed status blocks a second
    // reward issue.
    let lease = must_some(must(leases.acquire("req-escort-1")));
    let repeat = hall.complete_escort("client-1", &selector);
    assert!(matches!(repeat, Err(TradehallError::Duplicate(_))));
    must(lease.release());

    assert_eq!(hall.rep().summary_for_user("escort-1").total, 1);
    assert_eq!(hall.rep().summary_for_user("client-1").total, 1);
    assert_eq!(hall.rep().list().len(), 2);
    let _ = fs::remove_dir_all(&dir);
}
