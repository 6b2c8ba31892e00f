//! Medium Tests
//!
//! Tests for request sequencing on a client medium and its channels.

use std::io::Cursor;

use bytes::Bytes;
use smartwire::medium::PipeChannel;
use smartwire::protocol::ProtocolVersion;
use smartwire::{MemoryChannel, SmartClientMedium, SmartError};

fn memory_medium(reply: &'static [u8]) -> (SmartClientMedium, MemoryChannel) {
    let channel = MemoryChannel::new();
    channel.push_reply(reply);
    (SmartClientMedium::new(channel.clone(), "memory:///"), channel)
}

// =============================================================================
// Request Sequencing Tests
// =============================================================================

#[test]
fn test_requests_run_one_after_another() {
    let (medium, channel) = memory_medium(b"first\nsecond\n");

    let mut request = medium.get_request().unwrap();
    request.accept_bytes(b"one\n").unwrap();
    request.finished_writing().unwrap();
    assert_eq!(request.read_line().unwrap(), &b"first\n"[..]);
    request.finished_reading().unwrap();

    let mut request = medium.get_request().unwrap();
    request.accept_bytes(b"two\n").unwrap();
    request.finished_writing().unwrap();
    assert_eq!(request.read_line().unwrap(), &b"second\n"[..]);
    request.finished_reading().unwrap();

    assert_eq!(channel.written(), vec![Bytes::from_static(b"one\ntwo\n")]);
    assert_eq!(channel.connect_count(), 1);
}

#[test]
fn test_concurrent_request_is_refused() {
    let (medium, _) = memory_medium(b"");
    let _request = medium.get_request().unwrap();
    let other = medium.clone();
    assert!(matches!(
        other.get_request(),
        Err(SmartError::TooManyConcurrentRequests)
    ));
}

#[test]
fn test_read_bytes_honours_max_read_size() {
    let channel = MemoryChannel::new();
    channel.push_reply(&b"abcdefgh"[..]);
    let medium = SmartClientMedium::new(channel, "memory:///").with_max_read_size(3);
    let mut request = medium.get_request().unwrap();
    request.finished_writing().unwrap();
    assert_eq!(request.read_bytes(100).unwrap(), &b"abc"[..]);
    assert_eq!(request.read_bytes(2).unwrap(), &b"de"[..]);
}

#[test]
fn test_push_back_is_served_first() {
    let (medium, _) = memory_medium(b"rest");
    let mut request = medium.get_request().unwrap();
    request.finished_writing().unwrap();
    request.push_back(Bytes::from_static(b"early ")).unwrap();
    assert!(request.push_back(Bytes::from_static(b"twice")).is_err());
    assert_eq!(request.read_bytes(1).unwrap(), &b"early "[..]);
    assert_eq!(request.read_bytes(10).unwrap(), &b"rest"[..]);
}

#[test]
fn test_disconnect_drops_push_back_and_reconnects() {
    let channel = MemoryChannel::new();
    channel.push_reply(&b"one"[..]).push_reply(&b"two"[..]);
    let medium = SmartClientMedium::new(channel.clone(), "memory:///");
    medium.push_back(Bytes::from_static(b"stale")).unwrap();
    medium.disconnect();
    assert_eq!(medium.read_bytes(10).unwrap(), &b"one"[..]);
    medium.disconnect();
    assert_eq!(medium.read_bytes(10).unwrap(), &b"two"[..]);
    assert_eq!(channel.connect_count(), 2);
    assert_eq!(channel.disconnect_count(), 2);
}

#[test]
fn test_protocol_version_is_shared_by_clones() {
    let (medium, _) = memory_medium(b"");
    let clone = medium.clone();
    assert_eq!(medium.protocol_version(), None);
    clone.set_protocol_version(ProtocolVersion::Two);
    assert_eq!(medium.protocol_version(), Some(ProtocolVersion::Two));
    assert_eq!(medium.base(), "memory:///");
}

// =============================================================================
// Pipe Channel Tests
// =============================================================================

#[test]
fn test_pipe_channel_request() {
    let reader = Cursor::new(b"bzr response 2\nsuccess\nok\n".to_vec());
    let medium = SmartClientMedium::new(PipeChannel::new(reader, Vec::new()), "bzr+ssh://host/");
    let mut request = medium.get_request().unwrap();
    request.accept_bytes(b"bzr request 2\nget\n").unwrap();
    request.finished_writing().unwrap();
    assert_eq!(request.read_line().unwrap(), &b"bzr response 2\n"[..]);
    assert_eq!(request.read_line().unwrap(), &b"success\n"[..]);
    assert_eq!(request.read_line().unwrap(), &b"ok\n"[..]);
    assert!(request.read_bytes(1).unwrap().is_empty());
    request.finished_reading().unwrap();
}
