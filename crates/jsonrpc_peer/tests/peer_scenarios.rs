use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time;

use jsonrpc_peer::{
    error_codes, shared_cell_strategy, CancellationSource, Connection, ConnectionOptions,
    MethodType, ParameterStructures, ResponseError, Runtime, SendError,
    SharedCancellationCells,
};

fn pair() -> (Connection, Connection) {
    pair_with_options(ConnectionOptions::default(), ConnectionOptions::default())
}

fn pair_with_options(
    client_options: ConnectionOptions,
    server_options: ConnectionOptions,
) -> (Connection, Connection) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client_io);
    let (server_read, server_write) = tokio::io::split(server_io);
    (
        Connection::with_options(client_read, client_write, Runtime::new(), client_options),
        Connection::with_options(server_read, server_write, Runtime::new(), server_options),
    )
}

fn listening_pair() -> (Connection, Connection) {
    let (client, server) = pair();
    client.listen().expect("client listen");
    server.listen().expect("server listen");
    (client, server)
}

async fn within<T>(future: impl Future<Output = T>) -> T {
    time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

fn rejection(err: SendError) -> ResponseError {
    match err {
        SendError::Rejected(response) => response,
        other => panic!("expected rejection, got {other:?}"),
    }
}

/// S1: a request round-trips and resolves with the handler's value.
#[tokio::test]
async fn echo_request_resolves_with_the_handler_value() {
    let (client, server) = listening_pair();
    server.on_request("echo", |args, _token| async move {
        Ok(args.first().unwrap_or(Value::Null))
    });

    let value = within(client.send_request("echo", vec![json!("foo")])).await.expect("reply");
    assert_eq!(value, json!("foo"));
}

/// S2: a missing handler rejects the caller's future.
#[tokio::test]
async fn absent_methods_reject_with_method_not_found() {
    let (client, _server) = listening_pair();
    let err = client
        .send_request("absent", vec![json!(1)])
        .await
        .expect_err("no handler");
    let response = rejection(err);
    assert_eq!(response.code, error_codes::METHOD_NOT_FOUND);
    assert_eq!(response.message, "Unhandled method absent");
}

/// S3: a byPosition method wraps a single object argument in an array and
/// the handler receives the object unwrapped.
#[tokio::test]
async fn by_position_objects_arrive_unwrapped() {
    let (client, server) = listening_pair();
    let ty = MethodType::new("echo", ParameterStructures::ByPosition, 1);
    server.on_request(ty.clone(), |args, _token| async move {
        let first = args
            .positional()
            .and_then(|values| values.first().cloned())
            .unwrap_or(Value::Null);
        Ok(first)
    });

    let value = within(client.send_request(ty, vec![json!({"value": true})]))
        .await
        .expect("reply");
    assert_eq!(value, json!({"value": true}));
}

/// S4: responses are emitted in handler resolution order, not arrival order.
#[tokio::test]
async fn responses_follow_resolution_order() {
    let (client, server) = listening_pair();
    server.on_request("one", |_args, _token| async move {
        time::sleep(Duration::from_millis(100)).await;
        Ok(json!("one"))
    });
    server.on_request("two", |_args, _token| async move { Ok(json!("two")) });
    server.on_request("three", |_args, _token| async move {
        time::sleep(Duration::from_millis(50)).await;
        Ok(json!("three"))
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    for method in ["one", "two", "three"] {
        let client = client.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let value = client.send_request(method, vec![]).await.expect("reply");
            let _ = tx.send(value);
        });
    }
    drop(tx);

    let mut order = Vec::new();
    while let Some(value) = within(rx.recv()).await {
        order.push(value);
    }
    assert_eq!(order, vec![json!("two"), json!("three"), json!("one")]);
}

/// S5: a cancelled request is observed by the handler at a suspension point
/// and the caller's future rejects with `RequestCancelled`.
#[tokio::test]
async fn cancellation_reaches_the_running_handler() {
    let (client, server) = listening_pair();
    server.on_request("slow", |_args, token| async move {
        for _ in 0..200 {
            if token.is_cancelled() {
                return Err(
                    ResponseError::new(error_codes::REQUEST_CANCELLED, "request cancelled").into(),
                );
            }
            time::sleep(Duration::from_millis(5)).await;
        }
        Ok(json!("finished"))
    });

    let source = CancellationSource::new();
    let token = source.token();
    let requester = client.clone();
    let request =
        tokio::spawn(async move { requester.send_request_with_token("slow", vec![], token).await });

    time::sleep(Duration::from_millis(10)).await;
    source.cancel();

    let outcome = within(request).await.expect("task");
    let response = rejection(outcome.expect_err("cancelled"));
    assert_eq!(response.code, error_codes::REQUEST_CANCELLED);
}

/// S6: progress updates arrive in order, then the final result.
#[tokio::test]
async fn progress_streams_in_order_before_the_result() {
    let (client, server) = listening_pair();

    let server_handle = server.clone();
    server.on_request("index", move |args, _token| {
        let connection = server_handle.clone();
        async move {
            let token = args
                .named()
                .and_then(|map| map.get("workDoneToken"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            for stage in ["begin", "report", "end"] {
                connection
                    .send_progress(token.as_str(), json!({"stage": stage}))
                    .await?;
            }
            Ok(json!("indexed"))
        }
    });

    let stages = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&stages);
    client
        .on_progress("W1", move |value| {
            sink.lock().expect("stages").push(value);
        })
        .expect("register progress");

    let value = within(client.send_request("index", vec![json!({"workDoneToken": "W1"})]))
        .await
        .expect("reply");
    assert_eq!(value, json!("indexed"));

    let seen = stages.lock().expect("stages").clone();
    assert_eq!(
        seen,
        vec![
            json!({"stage": "begin"}),
            json!({"stage": "report"}),
            json!({"stage": "end"})
        ]
    );
}

/// The shared-cell strategy cancels across the in-process boundary without
/// an inline `$/cancelRequest`.
#[tokio::test]
async fn shared_cells_cancel_without_a_wire_round_trip() {
    let cells = SharedCancellationCells::new();
    let client_options = ConnectionOptions {
        cancellation: shared_cell_strategy(Arc::clone(&cells)),
        ..ConnectionOptions::default()
    };
    let server_options = ConnectionOptions {
        cancellation: shared_cell_strategy(cells),
        ..ConnectionOptions::default()
    };
    let (client, server) = pair_with_options(client_options, server_options);
    client.listen().expect("client listen");
    server.listen().expect("server listen");

    server.on_request("spin", |_args, token| async move {
        // A polling loop, as a tight worker would run it.
        for _ in 0..500 {
            if token.is_cancelled() {
                return Err(
                    ResponseError::new(error_codes::REQUEST_CANCELLED, "request cancelled").into(),
                );
            }
            time::sleep(Duration::from_millis(2)).await;
        }
        Ok(json!("done"))
    });

    let source = CancellationSource::new();
    let token = source.token();
    let requester = client.clone();
    let request =
        tokio::spawn(async move { requester.send_request_with_token("spin", vec![], token).await });

    time::sleep(Duration::from_millis(20)).await;
    source.cancel();

    let outcome = within(request).await.expect("task");
    let response = rejection(outcome.expect_err("cancelled"));
    assert_eq!(response.code, error_codes::REQUEST_CANCELLED);
}

#[tokio::test]
async fn typed_results_deserialize() {
    let (client, server) = listening_pair();
    server.on_request("version", |_args, _token| async move { Ok(json!("1.2.3")) });

    let version: String = within(client.send_request_as("version", vec![]))
        .await
        .expect("typed reply");
    assert_eq!(version, "1.2.3");
}

/// Request/notification traffic keeps flowing both ways on one connection.
#[tokio::test]
async fn both_sides_may_initiate() {
    let (left, right) = listening_pair();
    left.on_request("left/name", |_args, _token| async move { Ok(json!("left")) });
    right.on_request("right/name", |_args, _token| async move { Ok(json!("right")) });

    let from_left = within(left.send_request("right/name", vec![])).await.expect("reply");
    let from_right = within(right.send_request("left/name", vec![])).await.expect("reply");
    assert_eq!(from_left, json!("right"));
    assert_eq!(from_right, json!("left"));
}
