//! Conventional Handler Tests
//!
//! Version three requests are decoded into verb calls by
//! `ConventionalRequestHandler`; the responses it writes are read back with
//! `ProtocolThreeResponseHandler`.

use std::sync::Arc;

use bytes::Bytes;
use smartwire::bencode::byte_list;
use smartwire::message::{
    ConventionalRequestHandler, Expecting, ProtocolThreeResponseHandler, Requester,
    ResponseHandler,
};
use smartwire::protocol::{
    Headers, ProtocolThreeDecoder, ProtocolThreeEncoder, ProtocolThreeRequester,
    ProtocolThreeResponder,
};
use smartwire::request::{SmartServerRequestHandler, StreamChunk};
use smartwire::{
    MemoryChannel, Result, SmartClientMedium, SmartError, SmartServerRequest,
    SmartServerResponse, Value, VerbRegistry,
};

// =============================================================================
// Helpers
// =============================================================================

/// `concat` answers with its body and the number of bytes received.
struct Concat;

impl SmartServerRequest for Concat {
    fn execute(&mut self, _args: &[Value]) -> Result<Option<SmartServerResponse>> {
        Ok(None)
    }

    fn do_body(&mut self, body: Bytes) -> Result<Option<SmartServerResponse>> {
        let len = body.len() as i64;
        Ok(Some(
            SmartServerResponse::success(vec![Value::from("ok"), Value::Int(len)]).with_body(body),
        ))
    }
}

/// `stream_then_fail` sends one chunk and then aborts its body.
struct StreamThenFail;

impl SmartServerRequest for StreamThenFail {
    fn execute(&mut self, _args: &[Value]) -> Result<Option<SmartServerResponse>> {
        let chunks: Vec<Result<StreamChunk>> = vec![
            Ok(StreamChunk::Bytes(Bytes::from_static(b"partial"))),
            Ok(StreamChunk::Failed(byte_list(["ShortReadvError", "f"]))),
        ];
        Ok(Some(
            SmartServerResponse::success(byte_list(["ok"]))
                .with_body_stream(Box::new(chunks.into_iter())),
        ))
    }
}

fn registry() -> Arc<VerbRegistry> {
    let mut registry = VerbRegistry::with_defaults();
    registry.register(b"concat", || Box::new(Concat));
    registry.register(b"stream_then_fail", || Box::new(StreamThenFail));
    Arc::new(registry)
}

type ServerDecoder = ProtocolThreeDecoder<ConventionalRequestHandler<SmartServerRequestHandler, Vec<u8>>>;

fn server_decoder() -> ServerDecoder {
    let handler = SmartServerRequestHandler::new(registry());
    let responder = ProtocolThreeResponder::new(Vec::new(), Headers::new());
    ProtocolThreeDecoder::new(ConventionalRequestHandler::new(handler, responder), true)
}

/// Decode a whole request and return the bytes of the response.
fn serve(request: &[u8]) -> Vec<u8> {
    let mut decoder = server_decoder();
    decoder.accept_bytes(request).unwrap();
    assert_eq!(decoder.message_handler().expecting(), Expecting::Nothing);
    decoder.into_message_handler().into_responder().into_sink()
}

/// Start encoding a request with empty headers and the given args.
fn request(args: &[&str]) -> ProtocolThreeEncoder<Vec<u8>> {
    let mut encoder = ProtocolThreeEncoder::new(Vec::new());
    encoder.write_protocol_version().unwrap();
    encoder.write_headers(&Headers::new()).unwrap();
    encoder.write_structure(&byte_list(args)).unwrap();
    encoder
}

/// A response handler reading `reply` off a fresh memory medium.
fn response_handler(reply: Vec<u8>) -> ProtocolThreeResponseHandler {
    let channel = MemoryChannel::new();
    channel.push_reply(reply);
    let medium = SmartClientMedium::new(channel, "memory:///");
    let mut request = medium.get_request().unwrap();
    request.finished_writing().unwrap();
    ProtocolThreeResponseHandler::new(request)
}

// =============================================================================
// Request Handler Tests
// =============================================================================

#[test]
fn test_body_parts_are_joined() {
    let mut encoder = request(&["concat"]);
    encoder.write_prefixed_body(b"abc").unwrap();
    encoder.write_prefixed_body(b"def").unwrap();
    encoder.write_end().unwrap();

    let mut handler = response_handler(serve(&encoder.into_sink()));
    assert_eq!(
        handler.read_response_tuple(true).unwrap(),
        vec![Value::from("ok"), Value::Int(6)]
    );
    assert_eq!(handler.read_body_bytes(None).unwrap(), &b"abcdef"[..]);
}

#[test]
fn test_body_with_success_status() {
    let mut encoder = request(&["concat"]);
    encoder.write_prefixed_body(b"xyz").unwrap();
    encoder.write_success_status().unwrap();
    encoder.write_end().unwrap();

    let mut handler = response_handler(serve(&encoder.into_sink()));
    handler.read_response_tuple(true).unwrap();
    assert_eq!(handler.read_body_bytes(Some(2)).unwrap(), &b"xy"[..]);
    assert_eq!(handler.read_body_bytes(Some(2)).unwrap(), &b"z"[..]);
}

#[test]
fn test_aborted_request_body_returns_client_error() {
    let mut encoder = request(&["concat"]);
    encoder.write_prefixed_body(b"half").unwrap();
    encoder.write_error_status().unwrap();
    encoder.write_structure(&byte_list(["error"])).unwrap();
    encoder.write_end().unwrap();

    let mut handler = response_handler(serve(&encoder.into_sink()));
    let err = handler.read_response_tuple(false).unwrap_err();
    assert!(matches!(err, SmartError::ErrorFromServer(args) if args == byte_list(["error"])));
}

#[test]
fn test_unknown_verb_response() {
    let mut encoder = request(&["frobnicate", "arg"]);
    encoder.write_end().unwrap();

    let mut decoder = server_decoder();
    decoder.accept_bytes(&encoder.into_sink()).unwrap();
    let reply = decoder.into_message_handler().into_responder().into_sink();

    let mut handler = response_handler(reply);
    let err = handler.read_response_tuple(false).unwrap_err();
    assert!(matches!(err, SmartError::UnknownMethod(v) if v == "frobnicate"));
}

#[test]
fn test_premature_end_is_reported() {
    let mut encoder = ProtocolThreeEncoder::new(Vec::new());
    encoder.write_protocol_version().unwrap();
    encoder.write_headers(&Headers::new()).unwrap();
    encoder.write_end().unwrap();

    let mut decoder = server_decoder();
    decoder.accept_bytes(&encoder.into_sink()).unwrap();
    assert!(decoder.message_handler().responder().response_sent());
    let reply = decoder.into_message_handler().into_responder().into_sink();

    let mut handler = response_handler(reply);
    match handler.read_response_tuple(false).unwrap_err() {
        SmartError::ErrorFromServer(args) => {
            assert_eq!(args[0], "error");
            let message = args[1].as_bytes().unwrap();
            assert!(String::from_utf8_lossy(message).contains("prematurely"));
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn test_second_args_structure_is_rejected() {
    let mut encoder = request(&["concat"]);
    encoder.write_structure(&byte_list(["again"])).unwrap();
    encoder.write_end().unwrap();

    let mut decoder = server_decoder();
    decoder.accept_bytes(&encoder.into_sink()).unwrap();
    let reply = decoder.into_message_handler().into_responder().into_sink();

    let mut handler = response_handler(reply);
    let err = handler.read_response_tuple(false).unwrap_err();
    assert!(matches!(err, SmartError::ErrorFromServer(_)));
}

#[test]
fn test_response_headers_are_exposed() {
    let mut encoder = request(&["hello"]);
    encoder.write_end().unwrap();
    let handler = SmartServerRequestHandler::new(registry());
    let mut headers = Headers::new();
    headers.insert(Bytes::from_static(b"Software version"), Value::from("test"));
    let responder = ProtocolThreeResponder::new(Vec::new(), headers.clone());
    let mut decoder =
        ProtocolThreeDecoder::new(ConventionalRequestHandler::new(handler, responder), true);
    decoder.accept_bytes(&encoder.into_sink()).unwrap();
    let reply = decoder.into_message_handler().into_responder().into_sink();

    let mut handler = response_handler(reply);
    assert_eq!(handler.read_response_tuple(false).unwrap(), byte_list(["ok", "2"]));
    assert_eq!(handler.headers(), Some(&headers));
}

// =============================================================================
// Response Handler Tests
// =============================================================================

#[test]
fn test_streamed_response_body_error() {
    let mut encoder = request(&["stream_then_fail"]);
    encoder.write_end().unwrap();

    let mut handler = response_handler(serve(&encoder.into_sink()));
    assert_eq!(handler.read_response_tuple(true).unwrap(), byte_list(["ok"]));
    let items: Vec<Result<Bytes>> = handler.read_streamed_body().collect();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].as_ref().unwrap(), &Bytes::from_static(b"partial"));
    assert!(matches!(
        &items[1],
        Err(SmartError::ErrorFromServer(args)) if args[0] == "ShortReadvError"
    ));
}

#[test]
fn test_read_body_bytes_raises_body_error() {
    let mut encoder = request(&["stream_then_fail"]);
    encoder.write_end().unwrap();

    let mut handler = response_handler(serve(&encoder.into_sink()));
    handler.read_response_tuple(true).unwrap();
    assert!(matches!(
        handler.read_body_bytes(None),
        Err(SmartError::ErrorFromServer(_))
    ));
}

#[test]
fn test_truncated_response_is_connection_reset() {
    let mut encoder = request(&["concat"]);
    encoder.write_prefixed_body(b"abc").unwrap();
    encoder.write_end().unwrap();
    let mut reply = serve(&encoder.into_sink());
    reply.truncate(reply.len() - 3);

    let mut handler = response_handler(reply);
    handler.read_response_tuple(true).unwrap();
    let err = handler.read_body_bytes(None).unwrap_err();
    assert!(err.is_connection_reset());
}

#[test]
fn test_requester_output_is_served() {
    let channel = MemoryChannel::new();
    let medium = SmartClientMedium::new(channel.clone(), "memory:///");
    let mut requester = ProtocolThreeRequester::new(medium.get_request().unwrap());
    requester.set_headers(&Headers::new());
    requester
        .call_with_body_bytes(&[Bytes::from_static(b"concat")], b"sent by requester")
        .unwrap();
    let written = channel.written()[0].clone();

    let mut handler = response_handler(serve(&written));
    handler.read_response_tuple(true).unwrap();
    assert_eq!(handler.read_body_bytes(None).unwrap(), &b"sent by requester"[..]);
}

#[test]
fn test_requester_stream_error_is_sent() {
    let channel = MemoryChannel::new();
    let medium = SmartClientMedium::new(channel.clone(), "memory:///");
    let mut requester = ProtocolThreeRequester::new(medium.get_request().unwrap());
    let mut stream = vec![
        Ok(Bytes::from_static(b"one")),
        Err(SmartError::BodyStream("disk on fire".to_string())),
    ]
    .into_iter();
    let err = requester
        .call_with_body_stream(&[Bytes::from_static(b"concat")], &mut stream)
        .unwrap_err();
    assert!(matches!(err, SmartError::BodyStream(_)));
    assert!(requester.body_stream_started());

    let written = channel.written()[0].clone();
    assert!(written.ends_with(b"b\x00\x00\x00\x03oneoEs\x00\x00\x00\x09l5:erroree"));
    let mut handler = response_handler(serve(&written));
    let err = handler.read_response_tuple(false).unwrap_err();
    assert!(matches!(err, SmartError::ErrorFromServer(args) if args == byte_list(["error"])));
}
