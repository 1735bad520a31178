use serde_json::{json, Value};

use crate::{
    error_codes, Arguments, Message, MethodType, ParameterStructures, Params, ProgressToken,
    RequestId, ResponseError,
};

#[test]
fn discriminates_requests() {
    let message = Message::from_value(json!({
        "jsonrpc": "2.0", "id": 1, "method": "echo", "params": ["foo"]
    }));
    let Message::Request(request) = message else {
        panic!("expected request: {message:?}");
    };
    assert_eq!(request.id, RequestId::Number(1));
    assert_eq!(request.method, "echo");
    assert_eq!(request.params, Some(Params::Array(vec![json!("foo")])));
}

#[test]
fn discriminates_notifications() {
    let message = Message::from_value(json!({"jsonrpc": "2.0", "method": "ping"}));
    let Message::Notification(notification) = message else {
        panic!("expected notification: {message:?}");
    };
    assert_eq!(notification.method, "ping");
    assert!(notification.params.is_none());
}

#[test]
fn discriminates_responses_and_null_ids() {
    let message = Message::from_value(json!({"jsonrpc": "2.0", "id": 4, "result": null}));
    let Message::Response(response) = message else {
        panic!("expected response: {message:?}");
    };
    assert_eq!(response.id, Some(RequestId::Number(4)));
    assert_eq!(response.outcome, Ok(Value::Null));

    // id null marks a parse-level failure; it still parses as a response.
    let message = Message::from_value(json!({
        "jsonrpc": "2.0", "id": null,
        "error": {"code": -32700, "message": "parse error"}
    }));
    let Message::Response(response) = message else {
        panic!("expected response: {message:?}");
    };
    assert_eq!(response.id, None);
    assert_eq!(
        response.outcome,
        Err(ResponseError::new(error_codes::PARSE_ERROR, "parse error"))
    );
}

#[test]
fn request_discrimination_wins_over_result() {
    let message = Message::from_value(json!({
        "jsonrpc": "2.0", "id": 2, "method": "odd", "result": true
    }));
    assert!(matches!(message, Message::Request(_)));
}

#[test]
fn malformed_envelopes_keep_a_recoverable_id() {
    let message = Message::from_value(json!({"jsonrpc": "2.0", "id": 9}));
    let Message::Malformed(malformed) = message else {
        panic!("expected malformed: {message:?}");
    };
    assert_eq!(malformed.id, Some(RequestId::Number(9)));

    assert!(matches!(
        Message::from_value(json!(["not", "an", "object"])),
        Message::Malformed(_)
    ));
}

#[test]
fn round_trips_through_wire_values() {
    let messages = vec![
        Message::from_value(json!({"jsonrpc": "2.0", "id": "a", "method": "m", "params": {"k": 1}})),
        Message::from_value(json!({"jsonrpc": "2.0", "method": "n"})),
        Message::from_value(json!({"jsonrpc": "2.0", "id": 1, "result": {"ok": true}})),
    ];
    for message in messages {
        assert_eq!(Message::from_value(message.to_value()), message);
    }
}

#[test]
fn zero_params_omit_the_field() {
    let ty = MethodType::new("m", ParameterStructures::Auto, 0);
    assert_eq!(ty.encode_args(vec![]).expect("encode"), None);

    let request = Message::Request(crate::RequestMessage {
        id: RequestId::Number(1),
        method: "m".to_string(),
        params: None,
    });
    assert!(request.to_value().get("params").is_none());
}

#[test]
fn single_param_follows_declared_structure() {
    let auto = MethodType::new("m", ParameterStructures::Auto, 1);
    assert_eq!(
        auto.encode_args(vec![json!({"value": true})]).expect("encode"),
        Some(Params::Object(
            json!({"value": true}).as_object().cloned().expect("object")
        ))
    );
    assert_eq!(
        auto.encode_args(vec![json!("foo")]).expect("encode"),
        Some(Params::Array(vec![json!("foo")]))
    );
    assert_eq!(
        auto.encode_args(vec![]).expect("encode"),
        Some(Params::Array(vec![json!(null)]))
    );

    let by_name = MethodType::new("m", ParameterStructures::ByName, 1);
    let err = by_name.encode_args(vec![json!(1)]).expect_err("not an object");
    assert_eq!(err.code, error_codes::INVALID_PARAMS);

    let by_position = MethodType::new("m", ParameterStructures::ByPosition, 1);
    assert_eq!(
        by_position
            .encode_args(vec![json!({"value": true})])
            .expect("encode"),
        Some(Params::Array(vec![json!({"value": true})]))
    );
}

#[test]
fn surplus_and_missing_positional_args() {
    let ty = MethodType::new("m", ParameterStructures::Auto, 3);
    assert_eq!(
        ty.encode_args(vec![json!(1)]).expect("encode"),
        Some(Params::Array(vec![json!(1), json!(null), json!(null)]))
    );

    let ty = MethodType::new("m", ParameterStructures::Auto, 2);
    assert_eq!(
        ty.encode_args(vec![json!(1), json!(2), json!(3)]).expect("encode"),
        Some(Params::Array(vec![json!(1), json!(2)]))
    );
}

#[test]
fn shape_validation_is_strict_for_requests_only() {
    let by_name = MethodType::new("m", ParameterStructures::ByName, 1);
    let positional = Some(Params::Array(vec![json!(1)]));

    let err = by_name
        .convert_params(positional.clone(), true)
        .expect_err("strict mismatch");
    assert_eq!(err.code, error_codes::INVALID_PARAMS);

    // Notifications still dispatch with the wire shape.
    assert_eq!(
        by_name.convert_params(positional, false).expect("lenient"),
        Arguments::Positional(vec![json!(1)])
    );

    let by_position = MethodType::new("m", ParameterStructures::ByPosition, 1);
    let named = Some(Params::Object(
        json!({"k": 1}).as_object().cloned().expect("object"),
    ));
    assert!(by_position.convert_params(named, true).is_err());
}

#[test]
fn ids_and_tokens_accept_numbers_and_strings() {
    assert_eq!(
        serde_json::from_value::<RequestId>(json!(7)).expect("number id"),
        RequestId::Number(7)
    );
    assert_eq!(
        serde_json::from_value::<RequestId>(json!("abc")).expect("string id"),
        RequestId::String("abc".to_string())
    );
    assert_eq!(
        serde_json::from_value::<ProgressToken>(json!("W1")).expect("token"),
        ProgressToken::String("W1".to_string())
    );
    assert_eq!(serde_json::to_value(RequestId::Number(7)).expect("value"), json!(7));
}

#[test]
fn response_error_omits_absent_data() {
    let error = ResponseError::new(-32603, "boom");
    assert_eq!(
        serde_json::to_value(&error).expect("value"),
        json!({"code": -32603, "message": "boom"})
    );
    assert_eq!(error.to_string(), "jsonrpc error -32603: boom");
}
