use std::time::Duration;

use tokio::time;

use super::support::within;
use crate::{
    CancellationReceiverStrategy, CancellationSenderStrategy, CancellationSource,
    MessageSenderStrategy, RequestId, SharedCancellationCells, SharedCellReceiverStrategy,
    SharedCellSenderStrategy,
};

#[tokio::test]
async fn token_is_monotonic_and_fires_once() {
    let source = CancellationSource::new();
    let token = source.token();
    assert!(!token.is_cancelled());

    let waiter = token.clone();
    let wait = tokio::spawn(async move { waiter.cancelled().await });

    source.cancel();
    within(wait).await.expect("waiter");
    assert!(token.is_cancelled());

    // A second cancel is a no-op and the token stays cancelled.
    source.cancel();
    assert!(token.is_cancelled());
    within(token.cancelled()).await;
}

#[tokio::test]
async fn message_sender_requests_the_inline_notification() {
    let id = RequestId::Number(1);
    let sender = MessageSenderStrategy;
    sender.enable_cancellation(&id);
    assert!(sender.cancel(&id));
    sender.cleanup(&id);
}

#[tokio::test]
async fn shared_cell_crosses_without_a_message() {
    let cells = SharedCancellationCells::new();
    let sender = SharedCellSenderStrategy::new(cells.clone());
    let receiver = SharedCellReceiverStrategy::new(cells);
    let id = RequestId::Number(42);

    sender.enable_cancellation(&id);
    let source = receiver.create_source(&id);
    let token = source.token();
    assert!(!token.is_cancelled());

    // The cell flip replaces the `$/cancelRequest` round-trip.
    assert!(!sender.cancel(&id));
    assert!(token.is_cancelled());
    within(token.cancelled()).await;

    sender.cleanup(&id);
}

#[tokio::test]
async fn cell_backed_wait_observes_a_late_flip() {
    let cells = SharedCancellationCells::new();
    let sender = SharedCellSenderStrategy::new(cells.clone());
    let receiver = SharedCellReceiverStrategy::new(cells);
    let id = RequestId::Number(7);

    sender.enable_cancellation(&id);
    let token = receiver.create_source(&id).token();

    let waiter = token.clone();
    let wait = tokio::spawn(async move { waiter.cancelled().await });
    time::sleep(Duration::from_millis(20)).await;
    assert!(!sender.cancel(&id));
    within(wait).await.expect("waiter");
}

#[tokio::test]
async fn receiver_falls_back_without_a_cell() {
    let cells = SharedCancellationCells::new();
    let receiver = SharedCellReceiverStrategy::new(cells);
    let source = receiver.create_source(&RequestId::Number(9));
    let token = source.token();
    assert!(!token.is_cancelled());
    source.cancel();
    assert!(token.is_cancelled());
}
