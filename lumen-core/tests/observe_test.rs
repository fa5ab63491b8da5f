mod support;

use lumen_coap::{Code, ContentFormat, Message, MsgType};
use lumen_core::{SessionState, Value};
use std::time::Duration;
use support::*;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[test]
fn test_observe_initial_response_and_pmin_deferral() {
    // P4 lower bound: a trigger inside the pmin window is deferred.
    let mut h = harness();
    h.register();

    let mut observe = h.con_request(Code::GET, 0x0800, &[1, 2, 3, 4, 5, 6, 7, 8], "/1/1/5");
    observe.options.set_observe(0);
    observe.options.push_uri_query("pmin=10");
    observe.options.push_uri_query("pmax=50");
    let initial = h.roundtrip(&observe);
    assert_eq!(initial.code, Code::CONTENT);
    assert_eq!(initial.options.observe().unwrap(), Some(0));
    assert_eq!(initial.payload, b"60");
    assert_eq!(h.session.observation_count(), 1);

    // Value changes 1 s in: too early, nothing goes out.
    h.advance(Duration::from_secs(1));
    h.server_obj.set_value(1, 5, Value::Int(61));
    touch(&mut h.session, "/1/1/5");
    h.steps(2);
    assert!(h.tx().is_empty());

    // At the pmin deadline the deferred notification fires.
    h.advance(Duration::from_secs(9));
    h.steps(1);
    let msgs = h.tx();
    assert_eq!(msgs.len(), 1);
    let notify = &msgs[0];
    assert_eq!(notify.msg_type, MsgType::NonConfirmable);
    assert_eq!(notify.token, observe.token);
    assert_eq!(notify.options.observe().unwrap(), Some(1));
    assert_eq!(notify.payload, b"61");
}

#[test]
fn test_pmax_upper_bound_fires_periodically() {
    // P4 upper bound: without changes, pmax paces the notifications.
    let mut h = harness();
    h.register();

    let mut observe = h.con_request(Code::GET, 0x0801, &[8; 8], "/1/1/5");
    observe.options.set_observe(0);
    observe.options.push_uri_query("pmax=30");
    h.roundtrip(&observe);

    h.advance(Duration::from_secs(29));
    h.steps(2);
    assert!(h.tx().is_empty());

    h.advance(Duration::from_secs(1));
    h.steps(1);
    let first = h.tx();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].options.observe().unwrap(), Some(1));

    h.advance(Duration::from_secs(30));
    h.steps(1);
    let second = h.tx();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].options.observe().unwrap(), Some(2));
}

#[test]
fn test_composite_observation_snapshots_all_paths() {
    // S4 shape: Observe-Composite via FETCH, trigger at t=101, then the
    // pmax refresh carrying the full snapshot.
    let mut h = harness_with(|c| c.account.lifetime = 1_000_000);
    h.register();

    let mut fetch = h.con_request(Code::FETCH, 0x0900, &[9; 8], "");
    fetch.options.set_observe(0);
    fetch.options.set_content_format(ContentFormat::SENML_CBOR);
    fetch.options.set_accept(ContentFormat::SENML_CBOR);
    fetch.options.push_uri_query("pmin=100");
    fetch.options.push_uri_query("pmax=300");
    fetch.payload = b"/1/1/5\n/1/1/1\n".to_vec();
    let initial = h.roundtrip(&fetch);
    assert_eq!(initial.code, Code::CONTENT);
    assert_eq!(initial.options.observe().unwrap(), Some(0));
    let body = String::from_utf8(initial.payload.clone()).unwrap();
    assert!(body.contains("/1/1/5=60"));
    assert!(body.contains("/1/1/1=1000000"));

    // Trigger after pmin has passed: fires immediately with ALL paths.
    h.advance(Duration::from_secs(101));
    h.server_obj.set_value(1, 5, Value::Int(30));
    touch(&mut h.session, "/1/1/5");
    h.steps(1);
    let msgs = h.tx();
    assert_eq!(msgs.len(), 1);
    let notify = &msgs[0];
    assert_eq!(notify.options.observe().unwrap(), Some(1));
    let body = String::from_utf8(notify.payload.clone()).unwrap();
    assert!(body.contains("/1/1/5=30"));
    assert!(body.contains("/1/1/1=1000000"), "composite carries every path");

    // No further change: the pmax deadline refreshes the whole snapshot.
    h.advance(Duration::from_secs(300));
    h.steps(1);
    let msgs = h.tx();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].options.observe().unwrap(), Some(2));
}

#[test]
fn test_cancel_observe_and_rst() {
    let mut h = harness();
    h.register();

    // First observation, cancelled with Observe(1).
    let mut observe = h.con_request(Code::GET, 0x0a00, &[0xA; 8], "/1/1/5");
    observe.options.set_observe(0);
    h.roundtrip(&observe);
    assert_eq!(h.session.observation_count(), 1);

    let mut cancel = h.con_request(Code::GET, 0x0a01, &[0xA; 8], "/1/1/5");
    cancel.options.set_observe(1);
    let reply = h.roundtrip(&cancel);
    assert_eq!(reply.code, Code::CONTENT);
    assert_eq!(reply.options.observe().unwrap(), None);
    assert_eq!(h.session.observation_count(), 0);

    // Second observation, killed by RST against its notification.
    let mut observe = h.con_request(Code::GET, 0x0a02, &[0xB; 8], "/1/1/5");
    observe.options.set_observe(0);
    h.roundtrip(&observe);
    h.server_obj.set_value(1, 5, Value::Int(99));
    touch(&mut h.session, "/1/1/5");
    h.steps(1);
    let notify = h.tx().remove(0);
    assert_eq!(notify.msg_type, MsgType::NonConfirmable);

    h.push_rx(&Message::reset(notify.msg_id));
    h.steps(1);
    assert_eq!(h.session.observation_count(), 0);
}

#[test]
fn test_notification_forced_confirmable_after_a_day() {
    let mut h = harness_with(|c| c.account.lifetime = 10 * 24 * 60 * 60);
    h.register();

    let mut observe = h.con_request(Code::GET, 0x0b00, &[0xC; 8], "/1/1/5");
    observe.options.set_observe(0);
    h.roundtrip(&observe);

    // Within the first day notifications stay non-confirmable.
    h.advance(Duration::from_secs(60));
    h.server_obj.set_value(1, 5, Value::Int(1));
    touch(&mut h.session, "/1/1/5");
    h.steps(1);
    let early = h.tx().remove(0);
    assert_eq!(early.msg_type, MsgType::NonConfirmable);

    // A day later the next one is forced confirmable.
    h.advance(DAY);
    h.server_obj.set_value(1, 5, Value::Int(2));
    touch(&mut h.session, "/1/1/5");
    h.steps(1);
    let forced = h.tx().remove(0);
    assert_eq!(forced.msg_type, MsgType::Confirmable);

    h.push_rx(&Message::empty_ack(forced.msg_id));
    h.steps(1);
    assert_eq!(h.session.state(), SessionState::Registered);
    assert_eq!(h.session.observation_count(), 1);
}

#[test]
fn test_gt_threshold_gates_notifications() {
    let mut h = harness();
    h.register();

    let mut observe = h.con_request(Code::GET, 0x0c00, &[0xD; 8], "/1/1/5");
    observe.options.set_observe(0);
    observe.options.push_uri_query("gt=100");
    h.roundtrip(&observe);

    // 60 -> 90 does not cross gt=100.
    h.server_obj.set_value(1, 5, Value::Int(90));
    touch(&mut h.session, "/1/1/5");
    h.steps(2);
    assert!(h.tx().is_empty());

    // 90 -> 150 crosses upward.
    h.server_obj.set_value(1, 5, Value::Int(150));
    touch(&mut h.session, "/1/1/5");
    h.steps(1);
    let msgs = h.tx();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].payload, b"150");
}

#[test]
fn test_write_attributes_inherited_by_observation() {
    let mut h = harness();
    h.register();

    // Attributes are stored at the instance and inherited downwards.
    let mut put = h.con_request(Code::PUT, 0x0d00, &[0xE; 8], "/1/1");
    put.options.push_uri_query("pmin=30");
    let reply = h.roundtrip(&put);
    assert_eq!(reply.code, Code::CHANGED);

    let mut observe = h.con_request(Code::GET, 0x0d01, &[0xF; 8], "/1/1/5");
    observe.options.set_observe(0);
    h.roundtrip(&observe);

    h.server_obj.set_value(1, 5, Value::Int(61));
    touch(&mut h.session, "/1/1/5");
    h.steps(2);
    assert!(h.tx().is_empty(), "inherited pmin must defer the send");

    h.advance(Duration::from_secs(30));
    h.steps(1);
    assert_eq!(h.tx().len(), 1);
}

#[test]
fn test_invalid_attributes_rejected() {
    let mut h = harness();
    h.register();

    // lt must stay below gt.
    let mut put = h.con_request(Code::PUT, 0x0e00, &[0x10; 8], "/1/1/5");
    put.options.push_uri_query("lt=10");
    put.options.push_uri_query("gt=5");
    let reply = h.roundtrip(&put);
    assert_eq!(reply.code, Code::BAD_REQUEST);

    // Value attributes above resource depth are rejected.
    let mut put = h.con_request(Code::PUT, 0x0e01, &[0x11; 8], "/1/1");
    put.options.push_uri_query("gt=5");
    let reply = h.roundtrip(&put);
    assert_eq!(reply.code, Code::BAD_REQUEST);
}

#[test]
fn test_deleted_path_drops_observation_silently() {
    let mut h = harness();
    h.register();

    let mut observe = h.con_request(Code::GET, 0x0f00, &[0x12; 8], "/1/1/5");
    observe.options.set_observe(0);
    h.roundtrip(&observe);
    assert_eq!(h.session.observation_count(), 1);

    h.session
        .data_model_changed("/1/1".parse().unwrap(), lumen_core::ChangeKind::Removed);
    h.steps(1);
    assert_eq!(h.session.observation_count(), 0);
    // A registration update may go out (the tree changed), but nothing is
    // sent towards the dead observation: no 4.04, no reuse of its token.
    let msgs = h.tx();
    assert!(
        msgs.iter()
            .all(|m| m.code != Code::NOT_FOUND && m.token != observe.token)
    );
}
