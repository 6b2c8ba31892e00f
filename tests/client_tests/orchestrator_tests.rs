//! Client Orchestrator Tests
//!
//! Version detection, resends after a reset, streamed request bodies and
//! call hooks, driven over scripted memory connections.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use smartwire::bencode::byte_list;
use smartwire::protocol::{Headers, ProtocolThreeResponder, MESSAGE_VERSION_THREE, REQUEST_VERSION_TWO};
use smartwire::{
    install_call_hook, MemoryChannel, ProtocolVersion, Result, SmartClient, SmartClientMedium,
    SmartError, SmartServerResponse, Value,
};

// =============================================================================
// Helpers
// =============================================================================

fn v3_reply(response: SmartServerResponse) -> Bytes {
    let mut responder = ProtocolThreeResponder::new(Vec::new(), Headers::new());
    responder.send_response(response).unwrap();
    Bytes::from(responder.into_sink())
}

fn ok_reply() -> Bytes {
    v3_reply(SmartServerResponse::success(byte_list(["ok"])))
}

/// What a server without version three says to a version three request.
const OLD_SERVER_REPLY: &[u8] =
    b"error\x01Generic bzr smart protocol error: bad request 'bzr message 3 (bzr 1.6)'\n";

fn client(channel: &MemoryChannel) -> SmartClient {
    SmartClient::new(SmartClientMedium::new(channel.clone(), "memory:///"))
}

fn pinned_client(channel: &MemoryChannel, version: ProtocolVersion) -> SmartClient {
    let client = client(channel);
    client.medium().set_protocol_version(version);
    client
}

// =============================================================================
// Version Detection Tests
// =============================================================================

#[test]
fn test_detects_version_three() {
    let channel = MemoryChannel::new();
    channel.push_reply(v3_reply(SmartServerResponse::success(byte_list(["ok", "2"]))));
    let client = client(&channel);

    assert_eq!(client.call(b"hello", &[]).unwrap(), byte_list(["ok", "2"]));
    assert_eq!(client.medium().protocol_version(), Some(ProtocolVersion::Three));
    assert!(channel.written()[0].starts_with(MESSAGE_VERSION_THREE));
    assert_eq!(channel.disconnect_count(), 0);
}

#[test]
fn test_falls_back_to_version_two() {
    let channel = MemoryChannel::new();
    channel
        .push_reply(OLD_SERVER_REPLY)
        .push_reply(&b"bzr response 2\nsuccess\nok\x012\n"[..]);
    let client = client(&channel);

    assert_eq!(client.call(b"hello", &[]).unwrap(), byte_list(["ok", "2"]));
    assert_eq!(client.medium().protocol_version(), Some(ProtocolVersion::Two));
    assert!(client.medium().is_remote_before((1, 6)));
    assert_eq!(channel.disconnect_count(), 1);

    let written = channel.written();
    assert_eq!(written.len(), 2);
    assert!(written[0].starts_with(MESSAGE_VERSION_THREE));
    assert_eq!(&written[1][..], &b"bzr request 2\nhello\n"[..]);
}

#[test]
fn test_second_call_uses_detected_version() {
    let channel = MemoryChannel::new();
    channel.push_reply(OLD_SERVER_REPLY).push_reply(
        &b"bzr response 2\nsuccess\nok\x012\nbzr response 2\nsuccess\nyes\n"[..],
    );
    let client = client(&channel);

    client.call(b"hello", &[]).unwrap();
    assert_eq!(client.call(b"has", &[&b"file"[..]]).unwrap(), byte_list(["yes"]));
    assert_eq!(channel.connect_count(), 2);
    assert_eq!(
        &channel.written()[1][..],
        &b"bzr request 2\nhello\nbzr request 2\nhas\x01file\n"[..]
    );
}

#[test]
fn test_not_a_bazaar_server() {
    let channel = MemoryChannel::new();
    channel
        .push_reply(&b"HTTP/1.1 400 Bad Request\r\n\r\n"[..])
        .push_reply(&b"HTTP/1.1 400 Bad Request\r\n\r\n"[..]);
    let client = client(&channel);

    let err = client.call(b"hello", &[]).unwrap_err();
    assert!(matches!(err, SmartError::Protocol(msg) if msg.contains("not a Bazaar server")));
    assert_eq!(client.medium().protocol_version(), None);
    assert!(!client.medium().has_current_request());
}

#[test]
fn test_error_from_server_pins_version() {
    let channel = MemoryChannel::new();
    channel.push_reply(v3_reply(SmartServerResponse::failure(byte_list([
        "NoSuchFile",
        "missing",
    ]))));
    let client = client(&channel);

    let err = client.call(b"get", &[&b"missing"[..]]).unwrap_err();
    assert!(matches!(err, SmartError::ErrorFromServer(args) if args[0] == "NoSuchFile"));
    assert_eq!(client.medium().protocol_version(), Some(ProtocolVersion::Three));
}

#[test]
fn test_pinned_version_skips_detection() {
    let channel = MemoryChannel::new();
    channel.push_reply(&b"bzr response 2\nsuccess\nok\n"[..]);
    let client = pinned_client(&channel, ProtocolVersion::Two);

    client.call(b"get", &[&b"f"[..]]).unwrap();
    assert!(channel.written()[0].starts_with(REQUEST_VERSION_TWO));
    assert_eq!(channel.connect_count(), 1);
}

// =============================================================================
// Resend Tests
// =============================================================================

#[test]
fn test_read_verb_is_resent_after_reset() {
    let channel = MemoryChannel::new();
    channel.push_reply(Bytes::new()).push_reply(ok_reply());
    let client = pinned_client(&channel, ProtocolVersion::Three);

    assert_eq!(client.call(b"get", &[&b"f"[..]]).unwrap(), byte_list(["ok"]));
    let written = channel.written();
    assert_eq!(written.len(), 2);
    assert_eq!(written[0], written[1]);
    assert_eq!(channel.disconnect_count(), 1);
}

#[test]
fn test_mutating_verb_is_not_resent_after_reset() {
    let channel = MemoryChannel::new();
    channel.push_reply(Bytes::new()).push_reply(ok_reply());
    let client = pinned_client(&channel, ProtocolVersion::Three);

    let err = client
        .call_with_body_bytes(b"append", &[&b"f"[..]], b"data")
        .unwrap_err();
    assert!(err.is_connection_reset());
    assert_eq!(channel.written().len(), 1);
    assert!(!client.medium().has_current_request());
}

#[test]
fn test_unclassified_verb_is_not_resent() {
    let channel = MemoryChannel::new();
    channel.push_reply(Bytes::new()).push_reply(ok_reply());
    let client = pinned_client(&channel, ProtocolVersion::Three);

    assert!(client.call(b"Custom.verb", &[]).unwrap_err().is_connection_reset());
    assert_eq!(channel.connect_count(), 1);
}

#[test]
fn test_send_failure_is_retried_once() {
    let channel = MemoryChannel::new();
    channel.push_send_failure().push_reply(ok_reply());
    let client = pinned_client(&channel, ProtocolVersion::Three);

    let result = client
        .call_with_body_bytes(b"append", &[&b"f"[..]], b"data")
        .unwrap();
    assert_eq!(result, byte_list(["ok"]));
    let written = channel.written();
    assert_eq!(written.len(), 2);
    assert!(written[0].is_empty());
    assert!(written[1].ends_with(b"b\x00\x00\x00\x04datae"));
}

#[test]
fn test_second_send_failure_is_raised() {
    let channel = MemoryChannel::new();
    channel.push_send_failure().push_send_failure();
    let client = pinned_client(&channel, ProtocolVersion::Three);

    assert!(client.call(b"get", &[]).unwrap_err().is_connection_reset());
    assert_eq!(channel.connect_count(), 2);
    assert!(!client.medium().has_current_request());
}

// =============================================================================
// Body Tests
// =============================================================================

#[test]
fn test_readv_body_and_response_body() {
    let channel = MemoryChannel::new();
    channel.push_reply(v3_reply(
        SmartServerResponse::success(byte_list(["readv"])).with_body(Bytes::from_static(b"hello")),
    ));
    let client = pinned_client(&channel, ProtocolVersion::Three);

    let (result, mut handler) = client
        .call_with_body_readv_array(b"readv", &[&b"f"[..]], &[(0, 3), (10, 2)])
        .unwrap();
    assert_eq!(result, byte_list(["readv"]));
    assert_eq!(handler.read_body_bytes(None).unwrap(), &b"hello"[..]);
    assert!(channel.written()[0].ends_with(b"b\x00\x00\x00\x080,3\n10,2e"));
    assert!(!client.medium().has_current_request());
}

#[test]
fn test_stream_body_error_ends_request() {
    let channel = MemoryChannel::new();
    channel.push_reply(v3_reply(SmartServerResponse::failure(byte_list(["error"]))));
    let client = pinned_client(&channel, ProtocolVersion::Three);

    let stream = vec![
        Ok(Bytes::from_static(b"chunk")),
        Err(SmartError::BodyStream("source failed".to_string())),
    ];
    let err = client
        .call_with_body_stream(b"Repository.insert_stream", &[], stream)
        .err()
        .unwrap();
    assert!(matches!(err, SmartError::BodyStream(_)));
    assert!(channel.written()[0].ends_with(b"b\x00\x00\x00\x05chunkoEs\x00\x00\x00\x09l5:erroree"));
    assert!(!client.medium().has_current_request());
}

#[test]
fn test_stream_is_resent_if_send_fails_before_it_starts() {
    let channel = MemoryChannel::new();
    channel.push_send_failure().push_reply(ok_reply());
    let client = pinned_client(&channel, ProtocolVersion::Three);

    let stream: Vec<Result<Bytes>> = vec![Ok(Bytes::from_static(b"a")), Ok(Bytes::from_static(b"b"))];
    let (result, _) = client
        .call_with_body_stream(b"Repository.insert_stream", &[], stream)
        .unwrap();
    assert_eq!(result, byte_list(["ok"]));
    let written = channel.written();
    assert!(written[1].ends_with(b"b\x00\x00\x00\x01ab\x00\x00\x00\x01be"));
}

#[test]
fn test_stream_body_needs_version_three() {
    let channel = MemoryChannel::new();
    let client = pinned_client(&channel, ProtocolVersion::Two);

    let stream: Vec<Result<Bytes>> = vec![Ok(Bytes::from_static(b"a"))];
    let err = client
        .call_with_body_stream(b"Repository.insert_stream", &[], stream)
        .err()
        .unwrap();
    assert!(matches!(err, SmartError::UnknownMethod(v) if v == "Repository.insert_stream"));
    assert!(!client.medium().has_current_request());
}

// =============================================================================
// Call Hook Tests
// =============================================================================

type Seen = Arc<Mutex<Vec<(Bytes, Vec<Bytes>, Option<Vec<u8>>)>>>;

#[test]
fn test_call_hooks_see_each_call() {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    install_call_hook(move |params| {
        if params.method != b"hook.test.verb" {
            return;
        }
        assert_eq!(params.medium.base(), "memory:///");
        sink.lock().push((
            Bytes::copy_from_slice(params.method),
            params.args.to_vec(),
            params.body.map(|b| b.to_vec()),
        ));
    });

    let channel = MemoryChannel::new();
    channel.push_reply(ok_reply()).push_reply(ok_reply());
    let client = pinned_client(&channel, ProtocolVersion::Three);
    client
        .call_with_body_bytes(b"hook.test.verb", &[&b"a1"[..]], b"payload")
        .unwrap();
    client.call(b"hook.test.verb", &[]).unwrap();

    let seen = seen.lock();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].0, Bytes::from_static(b"hook.test.verb"));
    assert_eq!(seen[0].1, vec![Bytes::from_static(b"a1")]);
    assert_eq!(seen[0].2.as_deref(), Some(&b"payload"[..]));
    assert!(seen[1].1.is_empty());
    assert_eq!(seen[1].2, None);
}

#[test]
fn test_custom_headers_are_sent() {
    let channel = MemoryChannel::new();
    channel.push_reply(ok_reply());
    let mut headers = Headers::new();
    headers.insert(Bytes::from_static(b"x"), Value::from("y"));
    let client = pinned_client(&channel, ProtocolVersion::Three).with_headers(headers);

    client.call(b"get", &[]).unwrap();
    let written = channel.written();
    let after_marker = &written[0][MESSAGE_VERSION_THREE.len()..];
    assert!(after_marker.starts_with(b"\x00\x00\x00\x08d1:x1:ye"));
}
