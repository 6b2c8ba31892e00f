//! Version One and Two Tests
//!
//! Server replies are produced by `LegacyServerProtocol` and replayed to
//! `LegacyClientProtocol` through a memory channel.

use std::sync::Arc;

use bytes::Bytes;
use smartwire::bencode::byte_list;
use smartwire::message::{Requester, ResponseHandler};
use smartwire::protocol::{LegacyClientProtocol, LegacyServerProtocol, ProtocolVersion};
use smartwire::request::{SmartServerRequestHandler, StreamChunk};
use smartwire::{
    MemoryChannel, Result, SmartClientMedium, SmartError, SmartServerRequest,
    SmartServerResponse, Value, VerbRegistry,
};

// =============================================================================
// Helpers
// =============================================================================

/// `upper` takes a body and answers with it upper-cased.
struct Upper;

impl SmartServerRequest for Upper {
    fn execute(&mut self, _args: &[Value]) -> Result<Option<SmartServerResponse>> {
        Ok(None)
    }

    fn do_body(&mut self, body: Bytes) -> Result<Option<SmartServerResponse>> {
        Ok(Some(
            SmartServerResponse::success(byte_list(["ok"]))
                .with_body(Bytes::from(body.to_ascii_uppercase())),
        ))
    }
}

/// `count_to n` streams the numbers 1..=n as chunks.
struct CountTo;

impl SmartServerRequest for CountTo {
    fn execute(&mut self, args: &[Value]) -> Result<Option<SmartServerResponse>> {
        let n: usize = args
            .first()
            .and_then(|v| v.as_bytes())
            .and_then(|b| std::str::from_utf8(b).ok())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| SmartError::ErrorFromServer(byte_list(["BadArgs"])))?;
        let chunks: Vec<Result<StreamChunk>> = (1..=n)
            .map(|i| Ok(StreamChunk::Bytes(Bytes::from(i.to_string()))))
            .collect();
        Ok(Some(
            SmartServerResponse::success(byte_list(["ok"]))
                .with_body_stream(Box::new(chunks.into_iter())),
        ))
    }
}

fn registry() -> Arc<VerbRegistry> {
    let mut registry = VerbRegistry::with_defaults();
    registry.register(b"upper", || Box::new(Upper));
    registry.register(b"count_to", || Box::new(CountTo));
    Arc::new(registry)
}

/// Run one request through a server protocol and return what it wrote.
fn serve(version: ProtocolVersion, request: &[u8]) -> Vec<u8> {
    let handler = SmartServerRequestHandler::new(registry());
    let mut protocol = LegacyServerProtocol::new(version, handler, Vec::new());
    protocol.accept_bytes(request).unwrap();
    assert!(protocol.finished());
    protocol.into_sink()
}

fn client(version: ProtocolVersion, reply: Vec<u8>) -> (LegacyClientProtocol, MemoryChannel) {
    let channel = MemoryChannel::new();
    channel.push_reply(reply);
    let medium = SmartClientMedium::new(channel.clone(), "memory:///");
    let request = medium.get_request().unwrap();
    (LegacyClientProtocol::new(version, request), channel)
}

// =============================================================================
// Server Tests
// =============================================================================

#[test]
fn test_server_v1_body_request() {
    let out = serve(ProtocolVersion::One, b"upper\n3\nabcdone\n");
    assert_eq!(out, b"ok\n3\nABCdone\n");
}

#[test]
fn test_server_v2_body_in_pieces() {
    let handler = SmartServerRequestHandler::new(registry());
    let mut protocol = LegacyServerProtocol::new(ProtocolVersion::Two, handler, Vec::new());
    for piece in [&b"upp"[..], b"er\n", b"5\nhe", b"llo", b"do", b"ne\n"] {
        assert!(!protocol.finished());
        protocol.accept_bytes(piece).unwrap();
    }
    assert!(protocol.finished());
    assert_eq!(
        protocol.into_sink(),
        b"bzr response 2\nsuccess\nok\n5\nHELLOdone\n"
    );
}

#[test]
fn test_server_v2_streamed_response() {
    let out = serve(ProtocolVersion::Two, b"count_to\x013\n");
    assert_eq!(
        out,
        b"bzr response 2\nsuccess\nok\nchunked\n1\n11\n21\n3END\n"
    );
}

#[test]
fn test_server_v1_refuses_streamed_response() {
    let handler = SmartServerRequestHandler::new(registry());
    let mut protocol = LegacyServerProtocol::new(ProtocolVersion::One, handler, Vec::new());
    protocol.accept_bytes(b"count_to\x012\n").unwrap();
    assert!(protocol.finished());
    assert_eq!(
        protocol.into_sink(),
        b"error\x01Generic bzr smart protocol error: protocol version one cannot send a streamed body\n"
    );
}

#[test]
fn test_server_v2_verb_error_is_failed_status() {
    let out = serve(ProtocolVersion::Two, b"count_to\x01lots\n");
    assert_eq!(out, b"bzr response 2\nfailed\nBadArgs\n");
}

#[test]
fn test_server_v2_unknown_verb() {
    let out = serve(ProtocolVersion::Two, b"frobnicate\n");
    assert_eq!(
        out,
        b"bzr response 2\nfailed\nerror\x01Generic bzr smart protocol error: bad request 'frobnicate'\n"
    );
}

// =============================================================================
// Client/Server Round Trips
// =============================================================================

#[test]
fn test_v2_body_round_trip() {
    let (mut client, channel) = client(
        ProtocolVersion::Two,
        serve(ProtocolVersion::Two, b"upper\n4\nwiredone\n"),
    );
    client
        .call_with_body_bytes(&[Bytes::from_static(b"upper")], b"wire")
        .unwrap();
    assert_eq!(channel.written()[0], &b"bzr request 2\nupper\n4\nwiredone\n"[..]);
    assert_eq!(client.read_response_tuple(true).unwrap(), byte_list(["ok"]));
    assert_eq!(client.read_body_bytes(None).unwrap(), &b"WIRE"[..]);
}

#[test]
fn test_v2_streamed_round_trip() {
    let (mut client, _) = client(
        ProtocolVersion::Two,
        serve(ProtocolVersion::Two, b"count_to\x014\n"),
    );
    client
        .call(&[Bytes::from_static(b"count_to"), Bytes::from_static(b"4")])
        .unwrap();
    client.read_response_tuple(true).unwrap();
    let chunks: Vec<Bytes> = client.read_streamed_body().collect::<Result<_>>().unwrap();
    assert_eq!(
        chunks,
        vec![
            Bytes::from_static(b"1"),
            Bytes::from_static(b"2"),
            Bytes::from_static(b"3"),
            Bytes::from_static(b"4"),
        ]
    );
}

#[test]
fn test_v2_unknown_verb_round_trip() {
    let (mut client, _) = client(
        ProtocolVersion::Two,
        serve(ProtocolVersion::Two, b"frobnicate\n"),
    );
    client.call(&[Bytes::from_static(b"frobnicate")]).unwrap();
    let err = client.read_response_tuple(false).unwrap_err();
    assert!(matches!(err, SmartError::UnknownMethod(v) if v == "frobnicate"));
}

#[test]
fn test_v1_unicode_unknown_verb() {
    let (mut client, _) = client(
        ProtocolVersion::One,
        b"error\x01Generic bzr smart protocol error: bad request u'frob'\n".to_vec(),
    );
    client.call(&[Bytes::from_static(b"frob")]).unwrap();
    let err = client.read_response_tuple(false).unwrap_err();
    assert!(matches!(err, SmartError::UnknownMethod(_)));
}

#[test]
fn test_v1_readv_body() {
    let (mut client, channel) = client(ProtocolVersion::One, b"readv\n5\nabcdedone\n".to_vec());
    client
        .call_with_body_readv_array(&[Bytes::from_static(b"readv"), Bytes::from_static(b"f")], &[(0, 2), (8, 3)])
        .unwrap();
    assert_eq!(channel.written()[0], &b"readv\x01f\n7\n0,2\n8,3done\n"[..]);
    assert_eq!(client.read_response_tuple(true).unwrap(), byte_list(["readv"]));
    assert_eq!(client.read_body_bytes(None).unwrap(), &b"abcde"[..]);
}

#[test]
fn test_body_lost_mid_read() {
    let (mut client, _) = client(ProtocolVersion::One, b"ok\n10\nabc".to_vec());
    client.call(&[Bytes::from_static(b"get")]).unwrap();
    client.read_response_tuple(true).unwrap();
    let err = client.read_body_bytes(None).unwrap_err();
    assert!(err.is_connection_reset());
}

#[test]
fn test_v2_bad_status_line() {
    let (mut client, _) = client(ProtocolVersion::Two, b"bzr response 2\nmaybe\nok\n".to_vec());
    client.call(&[Bytes::from_static(b"get")]).unwrap();
    let err = client.read_response_tuple(false).unwrap_err();
    assert!(matches!(err, SmartError::Protocol(msg) if msg.contains("bad protocol status")));
}

#[test]
fn test_query_version_v1() {
    let (mut client, channel) = client(ProtocolVersion::One, serve(ProtocolVersion::One, b"hello\n"));
    assert_eq!(client.query_version().unwrap(), 2);
    assert_eq!(channel.written()[0], &b"hello\n"[..]);
}

#[test]
fn test_v2_oversized_body_length_is_rejected() {
    let reply = format!("bzr response 2\nsuccess\nok\n{}\n", usize::MAX);
    let (mut client, _) = client(ProtocolVersion::Two, reply.into_bytes());
    client.call(&[Bytes::from_static(b"get")]).unwrap();
    client.read_response_tuple(true).unwrap();
    let err = client.read_body_bytes(None).unwrap_err();
    assert!(matches!(err, SmartError::Protocol(msg) if msg.contains("body length")));
}

#[test]
fn test_v2_oversized_chunk_length_is_rejected() {
    let reply = format!("bzr response 2\nsuccess\nok\nchunked\n{:x}\n", usize::MAX);
    let (mut client, _) = client(ProtocolVersion::Two, reply.into_bytes());
    client.call(&[Bytes::from_static(b"get")]).unwrap();
    client.read_response_tuple(true).unwrap();
    let err = client
        .read_streamed_body()
        .collect::<Result<Vec<Bytes>>>()
        .unwrap_err();
    assert!(matches!(err, SmartError::Protocol(msg) if msg.contains("chunk length")));
}

#[test]
fn test_server_oversized_request_body_length() {
    let handler = SmartServerRequestHandler::new(registry());
    let mut protocol = LegacyServerProtocol::new(ProtocolVersion::One, handler, Vec::new());
    let request = format!("upper\n{}\n", usize::MAX);
    assert!(protocol.accept_bytes(request.as_bytes()).is_err());
}
