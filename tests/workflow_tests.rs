//! End-to-end workflow tests over a mocked mail store.
//!
//! These drive full batches through the state machine the way the terminal
//! UI would, checking phase order, queue ordering, the follow-up actions
//! and the cancellation paths.

mod common;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use common::{
    body_with_link, body_without_link, create_empty_sender, create_test_sender, dual_header,
    mailto_header, post_header, quiet_ui, selection_of, MockMailStore,
};
use gmail_unsubscriber::config::Config;
use gmail_unsubscriber::workflow::{
    BlockGate, LinkGate, UnsubscribeWorkflow, WorkflowOptions, WorkflowOutcome, WorkflowPhase,
};
use rand::seq::SliceRandom;
use rand::SeedableRng;

// ============================================================================
// Full mixed batch
// ============================================================================

/// Two senders unsubscribe by mail, two need a browser visit, two offer
/// nothing. The user continues through both links, skips blocking eve and
/// blocks frank, and the run finishes with the bulk delete.
#[tokio::test]
async fn test_mixed_batch_walks_every_queue_in_order() {
    let senders = vec![
        create_test_sender("alice@shop.example.com", 32),
        create_test_sender("bob@deals.example.com", 78),
        create_test_sender("carol@news.example.com", 12),
        create_test_sender("dave@digest.example.com", 9),
        create_test_sender("eve@blast.example.com", 51),
        create_test_sender("frank@noise.example.com", 44),
    ];
    let selection = selection_of(&senders);

    let mut store = MockMailStore::new();
    store.expect_get_unsubscribe_header().returning(|id| {
        Ok(match id {
            "m-alice" => Some(mailto_header("leave@shop.example.com")),
            "m-bob" => Some(dual_header(
                "https://deals.example.com/u",
                "leave@deals.example.com",
            )),
            _ => None,
        })
    });
    store.expect_get_message_body().returning(|id| {
        Ok(match id {
            "m-carol" => body_with_link("https://news.example.com/u/77"),
            "m-dave" => body_with_link("https://digest.example.com/u/3"),
            _ => body_without_link(),
        })
    });
    store.expect_send_mail().times(2).returning(|_, _, _| Ok(()));
    store
        .expect_create_block_filter()
        .withf(|email| email == "frank@noise.example.com")
        .times(1)
        .returning(|_| Ok("filter-frank".to_string()));
    store
        .expect_trash_messages()
        .times(1)
        .withf(|emails| {
            emails.iter().map(String::as_str).eq([
                "alice@shop.example.com",
                "bob@deals.example.com",
                "carol@news.example.com",
                "dave@digest.example.com",
                "eve@blast.example.com",
                "frank@noise.example.com",
            ])
        })
        .returning(|_| Ok(226));

    let visited_links = Arc::new(Mutex::new(Vec::new()));
    let visited_blocks = Arc::new(Mutex::new(Vec::new()));

    let mut ui = quiet_ui();
    ui.expect_open_link().times(2).return_const(());
    {
        let visited = Arc::clone(&visited_links);
        ui.expect_wait_link_gate().returning(move |_, total, sender, _| {
            assert_eq!(total, 2);
            visited.lock().unwrap().push(sender.to_string());
            LinkGate::Continue
        });
    }
    {
        let visited = Arc::clone(&visited_blocks);
        ui.expect_wait_block_gate().returning(move |_, total, sender| {
            assert_eq!(total, 2);
            visited.lock().unwrap().push(sender.to_string());
            if sender == "frank@noise.example.com" {
                BlockGate::Block
            } else {
                BlockGate::Skip
            }
        });
    }

    let mut workflow =
        UnsubscribeWorkflow::new(Arc::new(store), ui, senders, &Config::default());

    let phases = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&phases);
        workflow.set_observer(move |state| {
            seen.lock().unwrap().push(state.phase);
        });
    }

    let report = workflow
        .run(selection, WorkflowOptions::default())
        .await
        .unwrap();

    assert_eq!(report.outcome, WorkflowOutcome::Completed);
    assert_eq!(report.selected, 6);
    assert_eq!(report.auto_unsubscribed, 2);
    assert_eq!(report.links_opened, 2);
    assert_eq!(report.blocked, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.messages_trashed, 226);
    assert_eq!(report.filters_created, 1);

    // Both manual queues were walked in selection order
    assert_eq!(
        *visited_links.lock().unwrap(),
        vec!["carol@news.example.com", "dave@digest.example.com"]
    );
    assert_eq!(
        *visited_blocks.lock().unwrap(),
        vec!["eve@blast.example.com", "frank@noise.example.com"]
    );

    // Phase order, with consecutive duplicates from cursor movement folded
    let mut sequence = phases.lock().unwrap().clone();
    sequence.dedup();
    assert_eq!(
        sequence,
        vec![
            WorkflowPhase::AutoRunning,
            WorkflowPhase::ManualLinkStep,
            WorkflowPhase::BlockOfferStep,
            WorkflowPhase::Deleting,
            WorkflowPhase::Success,
            WorkflowPhase::Idle,
        ]
    );
}

// ============================================================================
// Follow-up action toggles
// ============================================================================

/// With delete_after off the mailbox is left untouched: no trash call is
/// mocked, so reaching for one would panic the test.
#[tokio::test]
async fn test_delete_after_off_leaves_messages_alone() {
    let senders = vec![create_test_sender("alice@shop.example.com", 32)];
    let selection = selection_of(&senders);

    let mut store = MockMailStore::new();
    store
        .expect_get_unsubscribe_header()
        .returning(|_| Ok(Some(mailto_header("leave@shop.example.com"))));
    store.expect_send_mail().returning(|_, _, _| Ok(()));

    let mut workflow =
        UnsubscribeWorkflow::new(Arc::new(store), quiet_ui(), senders, &Config::default());

    let options = WorkflowOptions {
        delete_after: false,
        block_after: false,
    };
    let report = workflow.run(selection, options).await.unwrap();

    assert_eq!(report.outcome, WorkflowOutcome::Completed);
    assert_eq!(report.auto_unsubscribed, 1);
    assert_eq!(report.messages_trashed, 0);
}

/// block_after creates one filter per selected sender, on top of any
/// filters created at the block-offer gates.
#[tokio::test]
async fn test_block_after_filters_every_selected_sender() {
    let senders = vec![
        create_test_sender("alice@shop.example.com", 32),
        create_test_sender("bob@deals.example.com", 78),
    ];
    let selection = selection_of(&senders);

    let mut store = MockMailStore::new();
    store
        .expect_get_unsubscribe_header()
        .returning(|_| Ok(Some(mailto_header("leave@example.com"))));
    store.expect_send_mail().returning(|_, _, _| Ok(()));

    let filtered = Arc::new(Mutex::new(Vec::new()));
    {
        let filtered = Arc::clone(&filtered);
        store
            .expect_create_block_filter()
            .times(2)
            .returning(move |email| {
                filtered.lock().unwrap().push(email.to_string());
                Ok(format!("filter-{}", email))
            });
    }

    let mut workflow =
        UnsubscribeWorkflow::new(Arc::new(store), quiet_ui(), senders, &Config::default());

    let options = WorkflowOptions {
        delete_after: false,
        block_after: true,
    };
    let report = workflow.run(selection, options).await.unwrap();

    assert_eq!(report.outcome, WorkflowOutcome::Completed);
    assert_eq!(report.filters_created, 2);
    assert_eq!(
        *filtered.lock().unwrap(),
        vec!["alice@shop.example.com", "bob@deals.example.com"]
    );
}

// ============================================================================
// Cancellation
// ============================================================================

/// Cancelling at a block gate ends the run before the bulk delete, even
/// though delete_after was requested.
#[tokio::test]
async fn test_cancel_at_block_gate_skips_the_delete() {
    let senders = vec![create_test_sender("eve@blast.example.com", 51)];
    let selection = selection_of(&senders);

    let mut store = MockMailStore::new();
    store.expect_get_unsubscribe_header().returning(|_| Ok(None));
    store
        .expect_get_message_body()
        .returning(|_| Ok(body_without_link()));
    // No trash_messages expectation: a cancelled run must never get there.

    let mut ui = quiet_ui();
    ui.expect_wait_block_gate()
        .returning(|_, _, _| BlockGate::Cancel);

    let mut workflow =
        UnsubscribeWorkflow::new(Arc::new(store), ui, senders, &Config::default());

    let report = workflow
        .run(selection, WorkflowOptions::default())
        .await
        .unwrap();

    assert_eq!(report.outcome, WorkflowOutcome::Cancelled);
    assert_eq!(report.messages_trashed, 0);
    assert_eq!(workflow.state().phase, WorkflowPhase::Idle);
    assert!(workflow.state().pending_block.is_empty());
}

/// An external cancel (the Ctrl-C path) lands before the first gate, so
/// the UI is never consulted and nothing is mutated.
#[tokio::test]
async fn test_external_cancel_stops_before_any_gate() {
    let senders = vec![create_test_sender("carol@news.example.com", 12)];
    let selection = selection_of(&senders);

    let mut store = MockMailStore::new();
    store.expect_get_unsubscribe_header().returning(|_| Ok(None));
    store
        .expect_get_message_body()
        .returning(|_| Ok(body_with_link("https://news.example.com/u/77")));

    // quiet_ui has no gate expectations, so any gate call panics
    let mut workflow =
        UnsubscribeWorkflow::new(Arc::new(store), quiet_ui(), senders, &Config::default());

    workflow.cancel_handle().cancel();

    let report = workflow
        .run(selection, WorkflowOptions::default())
        .await
        .unwrap();

    assert_eq!(report.outcome, WorkflowOutcome::Cancelled);
    assert_eq!(report.links_opened, 0);
    assert_eq!(report.messages_trashed, 0);
    assert_eq!(workflow.state().phase, WorkflowPhase::Idle);
}

// ============================================================================
// Demotion into the block-offer queue
// ============================================================================

/// A failing one-click POST endpoint is not retried at the workflow level;
/// the sender falls through to the block offer.
#[tokio::test]
async fn test_post_failure_lands_in_block_offer() {
    let senders = vec![create_test_sender("bob@deals.example.com", 78)];
    let selection = selection_of(&senders);

    let mut store = MockMailStore::new();
    store
        .expect_get_unsubscribe_header()
        .returning(|_| Ok(Some(post_header("https://deals.example.com/u"))));
    store
        .expect_get_message_body()
        .returning(|_| Ok(body_without_link()));
    store.expect_post_to().returning(|_| {
        Err(gmail_unsubscriber::error::UnsubscribeError::ServerError {
            status: 503,
            message: "unavailable".to_string(),
        })
    });

    let mut ui = quiet_ui();
    ui.expect_wait_block_gate()
        .returning(|_, _, _| BlockGate::Skip);

    let mut workflow =
        UnsubscribeWorkflow::new(Arc::new(store), ui, senders, &Config::default());

    let options = WorkflowOptions {
        delete_after: false,
        block_after: false,
    };
    let report = workflow.run(selection, options).await.unwrap();

    assert_eq!(report.outcome, WorkflowOutcome::Completed);
    assert_eq!(report.auto_unsubscribed, 0);
    assert_eq!(report.skipped, 1);
}

/// A working one-click POST endpoint needs no user interaction at all.
#[tokio::test]
async fn test_post_success_is_fully_automatic() {
    let senders = vec![create_test_sender("bob@deals.example.com", 78)];
    let selection = selection_of(&senders);

    let mut store = MockMailStore::new();
    store
        .expect_get_unsubscribe_header()
        .returning(|_| Ok(Some(post_header("https://deals.example.com/u"))));
    store
        .expect_get_message_body()
        .returning(|_| Ok(body_without_link()));
    store
        .expect_post_to()
        .withf(|url| url == "https://deals.example.com/u")
        .times(1)
        .returning(|_| Ok(()));

    let mut workflow =
        UnsubscribeWorkflow::new(Arc::new(store), quiet_ui(), senders, &Config::default());

    let options = WorkflowOptions {
        delete_after: false,
        block_after: false,
    };
    let report = workflow.run(selection, options).await.unwrap();

    assert_eq!(report.outcome, WorkflowOutcome::Completed);
    assert_eq!(report.auto_unsubscribed, 1);
    assert_eq!(report.links_opened, 0);
}

/// Senders the scan never saw a message for, or that are missing from the
/// aggregation index entirely, end up in the block-offer queue instead of
/// being silently dropped.
#[tokio::test]
async fn test_unresolvable_senders_get_the_block_offer() {
    let senders = vec![create_empty_sender("ghost@old.example.com")];
    let mut selection = selection_of(&senders);
    selection.push(gmail_unsubscriber::models::SelectedSender {
        email: "unknown@stale.example.com".to_string(),
        message_count: 3,
    });

    // No store expectations: neither sender has a message to probe.
    let store = MockMailStore::new();

    let visited = Arc::new(Mutex::new(Vec::new()));
    let mut ui = quiet_ui();
    {
        let visited = Arc::clone(&visited);
        ui.expect_wait_block_gate().returning(move |_, _, sender| {
            visited.lock().unwrap().push(sender.to_string());
            BlockGate::Skip
        });
    }

    let mut workflow =
        UnsubscribeWorkflow::new(Arc::new(store), ui, senders, &Config::default());

    let options = WorkflowOptions {
        delete_after: false,
        block_after: false,
    };
    let report = workflow.run(selection, options).await.unwrap();

    assert_eq!(report.outcome, WorkflowOutcome::Completed);
    assert_eq!(report.skipped, 2);
    assert_eq!(
        *visited.lock().unwrap(),
        vec!["ghost@old.example.com", "unknown@stale.example.com"]
    );
}

// ============================================================================
// Ordering at scale
// ============================================================================

/// Sixty senders in a shuffled selection: the manual queues must come out
/// in selection order even though resolution runs concurrently.
#[tokio::test]
async fn test_large_shuffled_batch_preserves_selection_order() {
    let mut senders = Vec::new();
    let mut headers: HashMap<String, Option<String>> = HashMap::new();
    let mut bodies: HashMap<String, String> = HashMap::new();
    let mut kinds: HashMap<String, &'static str> = HashMap::new();

    for i in 0..60 {
        let email = format!("s{}@list.example.com", i);
        let message_id = format!("m-s{}", i);
        senders.push(create_test_sender(&email, 10 + i as u64));

        match i % 3 {
            0 => {
                headers.insert(
                    message_id,
                    Some(mailto_header(&format!("leave-{}@list.example.com", i))),
                );
                kinds.insert(email, "mailto");
            }
            1 => {
                headers.insert(message_id.clone(), None);
                bodies.insert(
                    message_id,
                    body_with_link(&format!("https://list.example.com/u/{}", i)),
                );
                kinds.insert(email, "link");
            }
            _ => {
                headers.insert(message_id, None);
                kinds.insert(email, "none");
            }
        }
    }

    let mut selection = selection_of(&senders);
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    selection.shuffle(&mut rng);

    let expected_links: Vec<String> = selection
        .iter()
        .filter(|s| kinds[&s.email] == "link")
        .map(|s| s.email.clone())
        .collect();
    let expected_blocks: Vec<String> = selection
        .iter()
        .filter(|s| kinds[&s.email] == "none")
        .map(|s| s.email.clone())
        .collect();

    let mut store = MockMailStore::new();
    {
        let headers = Arc::new(headers);
        store
            .expect_get_unsubscribe_header()
            .returning(move |id| Ok(headers.get(id).cloned().flatten()));
    }
    {
        let bodies = Arc::new(bodies);
        store
            .expect_get_message_body()
            .returning(move |id| Ok(bodies.get(id).cloned().unwrap_or_else(body_without_link)));
    }
    store.expect_send_mail().times(20).returning(|_, _, _| Ok(()));

    let visited_links = Arc::new(Mutex::new(Vec::new()));
    let visited_blocks = Arc::new(Mutex::new(Vec::new()));

    let mut ui = quiet_ui();
    ui.expect_open_link().return_const(());
    {
        let visited = Arc::clone(&visited_links);
        ui.expect_wait_link_gate().returning(move |_, _, sender, _| {
            visited.lock().unwrap().push(sender.to_string());
            LinkGate::Continue
        });
    }
    {
        let visited = Arc::clone(&visited_blocks);
        ui.expect_wait_block_gate().returning(move |_, _, sender| {
            visited.lock().unwrap().push(sender.to_string());
            BlockGate::Skip
        });
    }

    let mut workflow =
        UnsubscribeWorkflow::new(Arc::new(store), ui, senders, &Config::default());

    let options = WorkflowOptions {
        delete_after: false,
        block_after: false,
    };
    let report = workflow.run(selection, options).await.unwrap();

    assert_eq!(report.outcome, WorkflowOutcome::Completed);
    assert_eq!(report.auto_unsubscribed, 20);
    assert_eq!(report.links_opened, 20);
    assert_eq!(report.skipped, 20);
    assert_eq!(report.blocked, 0);

    assert_eq!(*visited_links.lock().unwrap(), expected_links);
    assert_eq!(*visited_blocks.lock().unwrap(), expected_blocks);
}
