use serde_json::json;

use crate::{
    accept_encoding_value, content_type_matches, header_value, FramingBuffer, FramingError,
    JsonContentCodec, ContentTypeCodec, Message, NotificationMessage, Params, RequestId,
    RequestMessage, ResponseError, ResponseMessage, DEFAULT_CONTENT_TYPE,
};

#[test]
fn headers_parse_across_chunk_boundaries() {
    let mut buffer = FramingBuffer::new();
    buffer.append(b"Content-Le");
    assert!(buffer.try_read_headers().expect("scan").is_none());

    buffer.append(b"ngth: 10\r\nContent-Type: application/json; charset=utf-8\r\n\r\nrest");
    let headers = buffer.try_read_headers().expect("scan").expect("complete");
    assert_eq!(header_value(&headers, "content-length"), Some("10"));
    assert_eq!(
        header_value(&headers, "CONTENT-TYPE"),
        Some("application/json; charset=utf-8")
    );
    // Only the body remainder stays buffered.
    assert_eq!(buffer.len(), 4);
}

#[test]
fn header_line_without_colon_is_an_error() {
    let mut buffer = FramingBuffer::new();
    buffer.append(b"NoColonHere\r\n\r\n");
    match buffer.try_read_headers() {
        Err(FramingError::MalformedHeader(line)) => assert_eq!(line, "NoColonHere"),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn body_is_released_only_when_complete() {
    let mut buffer = FramingBuffer::new();
    for byte in b"0123456789" {
        assert!(buffer.try_read_body(10).is_none());
        buffer.append(&[*byte]);
    }
    assert_eq!(buffer.try_read_body(10).expect("complete body"), b"0123456789");
    assert!(buffer.is_empty());
}

#[test]
fn buffer_capacity_grows_in_quanta() {
    let mut buffer = FramingBuffer::new();
    buffer.append(&vec![0u8; 10_000]);
    assert_eq!(buffer.len(), 10_000);
    // ⌈10000/8192⌉·8192 + 8192
    assert_eq!(buffer.capacity(), 24_576);
    assert_eq!(buffer.try_read_body(10_000).expect("body").len(), 10_000);
}

#[test]
fn json_codec_round_trips_every_variant() {
    let codec = JsonContentCodec;
    let messages = vec![
        Message::Request(RequestMessage {
            id: RequestId::Number(7),
            method: "echo".to_string(),
            params: Some(Params::Array(vec![json!("foo"), json!(null)])),
        }),
        Message::Notification(NotificationMessage {
            method: "update".to_string(),
            params: Some(Params::Object(
                json!({"uri": "file:///x"}).as_object().cloned().expect("object"),
            )),
        }),
        Message::Response(ResponseMessage {
            id: Some(RequestId::String("r1".to_string())),
            outcome: Ok(json!(null)),
        }),
        Message::Response(ResponseMessage {
            id: Some(RequestId::Number(3)),
            outcome: Err(ResponseError::new(-32601, "Unhandled method x")),
        }),
    ];
    for message in messages {
        let bytes = codec.encode(&message).expect("encode");
        let decoded = codec.decode(&bytes).expect("decode");
        assert_eq!(decoded, message);
    }
}

#[test]
fn accept_encoding_ladder_pins_the_lowest_to_zero() {
    assert_eq!(accept_encoding_value(&["gzip"]), "gzip");
    assert_eq!(accept_encoding_value(&["gzip", "deflate"]), "gzip, deflate;q=0");
    assert_eq!(
        accept_encoding_value(&["a", "b", "c"]),
        "a, b;q=0.5, c;q=0"
    );
    assert_eq!(
        accept_encoding_value(&["a", "b", "c", "d"]),
        "a, b;q=0.6, c;q=0.3, d;q=0"
    );
}

#[test]
fn content_type_compatibility() {
    assert!(content_type_matches(DEFAULT_CONTENT_TYPE, DEFAULT_CONTENT_TYPE));
    assert!(content_type_matches("application/json", DEFAULT_CONTENT_TYPE));
    assert!(content_type_matches(
        "Application/JSON; charset=UTF-8",
        DEFAULT_CONTENT_TYPE
    ));
    assert!(!content_type_matches("text/plain", DEFAULT_CONTENT_TYPE));
    assert!(!content_type_matches(
        "application/json; charset=latin-1",
        DEFAULT_CONTENT_TYPE
    ));
}
