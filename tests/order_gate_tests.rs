//! Cart mutation through the gate: bounds, matching and concurrent calls.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use voice_order_session::core::order::{
    ModifierArg, MutationOutcome, OrderGateConfig, OrderGateWorker, OrderMutationGate,
    OutcomeCallback, PendingFunctionCall,
};
use voice_order_session::MutationError;

fn gate() -> OrderMutationGate {
    OrderMutationGate::new(Arc::new(common::menu()), OrderGateConfig::default())
}

#[tokio::test]
async fn test_quantity_zero_becomes_one() {
    let cart = gate().add_item("espresso", 0, None, &[]).await.unwrap();
    assert_eq!(cart.items()[0].quantity, 1);
}

#[tokio::test]
async fn test_quantity_is_capped() {
    let gate = gate();
    let cart = gate.add_item("espresso", 1000, None, &[]).await.unwrap();
    assert_eq!(cart.items()[0].quantity, 100);

    let cart = gate.update_quantity("espresso", -3).await.unwrap();
    assert_eq!(cart.items()[0].quantity, 1);
}

#[tokio::test]
async fn test_negative_modifier_price_is_zero() {
    let modifier = ModifierArg::Detailed {
        name: "staff discount".to_string(),
        price_adjustment: Some(-500),
    };
    let cart = gate()
        .add_item("falafel wrap", 1, None, &[modifier])
        .await
        .unwrap();

    let line = &cart.items()[0];
    assert_eq!(line.modifiers[0].name, "staff discount");
    assert_eq!(line.modifiers[0].price_cents, 0);
    assert_eq!(cart.subtotal_cents(), 1095);
}

#[tokio::test]
async fn test_greek_bowls_one_without_feta() {
    let gate = gate();
    gate.add_item("Greek Bowls", 1, None, &[]).await.unwrap();
    let cart = gate
        .add_item(
            "greek bowl",
            1,
            None,
            &[ModifierArg::Name("no feta".to_string())],
        )
        .await
        .unwrap();

    assert_eq!(cart.items().len(), 2);
    assert_eq!(cart.items()[0].modifiers.len(), 0);
    assert_eq!(cart.items()[1].modifiers[0].name, "no feta");
    assert_eq!(cart.item_count(), 2);
    assert_eq!(cart.subtotal_cents(), 2590);
}

#[tokio::test]
async fn test_model_numbers_are_clamped_not_rejected() {
    let gate = gate();

    let mut call = PendingFunctionCall::new(
        "call_1",
        "add_to_order",
        r#"{"id":"espresso","quantity":1e20}"#,
    );
    let cart = gate.execute(&mut call).await.unwrap();
    assert_eq!(cart.items()[0].quantity, 100);

    let mut call = PendingFunctionCall::new(
        "call_2",
        "add_to_order",
        r#"{"id":"falafel wrap","quantity":2.0,"modifiers":[{"name":"staff discount","price_adjustment":-500.0}]}"#,
    );
    let cart = gate.execute(&mut call).await.unwrap();
    let line = &cart.items()[1];
    assert_eq!(line.quantity, 2);
    assert_eq!(line.modifiers[0].price_cents, 0);

    let mut call = PendingFunctionCall::new(
        "call_3",
        "update_item_quantity",
        r#"{"item_id":"line-1","quantity":-4.5}"#,
    );
    let cart = gate.execute(&mut call).await.unwrap();
    assert_eq!(cart.items()[0].quantity, 1);
}

#[tokio::test]
async fn test_two_calls_three_greek_bowls_with_note() {
    let gate = gate();
    let mut first = PendingFunctionCall::new(
        "call_1",
        "add_to_order",
        r#"{"id":"Greek Bowls","quantity":2}"#,
    );
    let mut second = PendingFunctionCall::new(
        "call_2",
        "add_to_order",
        r#"{"id":"greek bowl","quantity":1,"notes":"no feta"}"#,
    );
    gate.execute(&mut first).await.unwrap();
    let cart = gate.execute(&mut second).await.unwrap();

    assert_eq!(cart.items().len(), 2);
    assert_eq!(cart.item_count(), 3);
    assert_eq!(cart.items()[0].quantity, 2);
    assert_eq!(cart.items()[0].notes, None);
    assert_eq!(cart.items()[1].quantity, 1);
    assert_eq!(cart.items()[1].notes.as_deref(), Some("no feta"));
    assert_eq!(cart.subtotal_cents(), 3 * 1295);
}

#[tokio::test]
async fn test_misheard_item_resolves_through_alias() {
    let cart = gate().add_item("chicken fahitas", 2, None, &[]).await.unwrap();
    assert_eq!(cart.items()[0].menu_item_id, "chicken-fajitas");
}

#[tokio::test]
async fn test_unknown_item_needs_clarification() {
    let err = gate()
        .add_item("lobster thermidor", 1, None, &[])
        .await
        .unwrap_err();
    assert!(matches!(err, MutationError::MenuItemNotFound { .. }));
    assert!(err.needs_clarification());
    assert!(!err.is_fatal());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_adds_serialize() {
    let gate = gate();
    let references = [
        "greek bowl",
        "falafel wrap",
        "espresso",
        "chicken fajitas",
        "greek salad bowl",
        "espresso",
        "falafel wrap",
        "greek bowl",
    ];

    let tasks: Vec<_> = references
        .iter()
        .map(|reference| {
            let gate = gate.clone();
            let reference = reference.to_string();
            tokio::spawn(async move { gate.add_item(&reference, 1, None, &[]).await })
        })
        .collect();

    let mut snapshot_sizes = BTreeSet::new();
    for task in tasks {
        let cart = task.await.unwrap().unwrap();
        snapshot_sizes.insert(cart.items().len());
    }

    // Each call saw the cart right after its own mutation: one snapshot per size.
    assert_eq!(snapshot_sizes, (1..=references.len()).collect());

    let cart = gate.snapshot().await.unwrap();
    let line_ids: Vec<&str> = cart.items().iter().map(|line| line.id.as_str()).collect();
    let expected: Vec<String> = (1..=references.len()).map(|n| format!("line-{n}")).collect();
    assert_eq!(line_ids, expected);
    assert_eq!(cart.item_count() as usize, references.len());
}

#[tokio::test]
async fn test_worker_applies_calls_in_submission_order() {
    let gate = gate();
    let (tx, mut rx) = mpsc::unbounded_channel::<MutationOutcome>();
    let on_outcome: OutcomeCallback = Arc::new(move |outcome| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(outcome);
        })
    });
    let cancel = CancellationToken::new();
    let (handle, worker) = OrderGateWorker::spawn(gate.clone(), on_outcome, cancel.clone());

    handle
        .submit(PendingFunctionCall::new(
            "call_a",
            "add_to_order",
            r#"{"id":"espresso","quantity":2}"#,
        ))
        .unwrap();
    handle
        .submit(PendingFunctionCall::new(
            "call_b",
            "update_item_quantity",
            r#"{"item_id":"espresso","quantity":3}"#,
        ))
        .unwrap();
    handle
        .submit(PendingFunctionCall::new("call_c", "order_pizza", "{}"))
        .unwrap();

    let first = rx.recv().await.unwrap();
    let second = rx.recv().await.unwrap();
    let third = rx.recv().await.unwrap();

    assert_eq!(first.call.call_id, "call_a");
    assert!(first.call.mutex_acquired_at.is_some());
    assert_eq!(second.call.call_id, "call_b");
    assert_eq!(second.result.as_ref().unwrap().items()[0].quantity, 3);
    assert!(matches!(
        third.result,
        Err(MutationError::UnknownFunction(ref name)) if name == "order_pizza"
    ));

    let output: serde_json::Value = serde_json::from_str(&second.output_json()).unwrap();
    assert_eq!(output["success"], true);
    assert_eq!(output["cart"]["items"][0]["quantity"], 3);

    cancel.cancel();
    worker.await.unwrap();
}
