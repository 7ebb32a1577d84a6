use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use berylmgr::core::agent::msg::{
    AGENT_MSG_COMMAND, AGENT_MSG_RESULT, AgentMsg, AgentMsgCodec, split_result_values,
};
use berylmgr::core::agent::{AgentCmd, CommandPayload, ConfEdit, HbaLine};
use berylmgr::core::catalog::NodeFamily;

#[test]
fn frame_layout_is_length_le_then_type_then_payload() {
    let mut codec = AgentMsgCodec;
    let mut buf = BytesMut::new();
    codec
        .encode(
            AgentMsg::new(AGENT_MSG_COMMAND, Bytes::from_static(b"abc")),
            &mut buf,
        )
        .unwrap();
    assert_eq!(&buf[..], &[3, 0, 0, 0, b'C', b'a', b'b', b'c']);
}

#[test]
fn decode_roundtrip() {
    let mut codec = AgentMsgCodec;
    let mut buf = BytesMut::new();
    let msg = AgentMsg::new(AGENT_MSG_RESULT, Bytes::from_static(b"hello\0world"));
    codec.encode(msg.clone(), &mut buf).unwrap();
    let decoded = codec.decode(&mut buf).unwrap().unwrap();
    assert_eq!(decoded, msg);
    assert!(buf.is_empty());
}

#[test]
fn decode_waits_for_a_full_frame() {
    let mut codec = AgentMsgCodec;
    let mut buf = BytesMut::new();
    // Declares 5 payload bytes but carries only 2.
    buf.extend_from_slice(&[5, 0, 0, 0, b'R', b'x', b'y']);
    assert!(codec.decode(&mut buf).unwrap().is_none());
    buf.extend_from_slice(b"zzz");
    let decoded = codec.decode(&mut buf).unwrap().unwrap();
    assert_eq!(decoded.payload, Bytes::from_static(b"xyzzz"));
}

#[test]
fn decode_rejects_oversized_frames() {
    let mut codec = AgentMsgCodec;
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&u32::MAX.to_le_bytes());
    buf.extend_from_slice(&[b'R']);
    assert!(codec.decode(&mut buf).is_err());
}

#[test]
fn command_payload_layout() {
    let msg = CommandPayload::new(AgentCmd::DnStop)
        .arg("/data/dn1")
        .arg("immediate")
        .into_msg();
    assert_eq!(msg.msg_type, AGENT_MSG_COMMAND);
    let mut expected = vec![23u8];
    expected.extend_from_slice(b"/data/dn1\0immediate\0");
    assert_eq!(&msg.payload[..], &expected[..]);
}

#[test]
fn command_codes_are_role_keyed() {
    assert_eq!(AgentCmd::init(NodeFamily::Coordinator).code(), 11);
    assert_eq!(AgentCmd::promote(NodeFamily::Datanode).code(), 26);
    assert_eq!(AgentCmd::clean_dir(NodeFamily::Gtm).code(), 37);
    assert_eq!(AgentCmd::GetSqlStrings.code(), 75);
}

#[test]
fn conf_edit_payload_is_nul_terminated_tokens() {
    let edit = ConfEdit::new("/data/dn1/postgresql.conf")
        .set("port", "5432")
        .set("hot_standby", "on");
    assert_eq!(
        &edit.payload()[..],
        b"/data/dn1/postgresql.conf\0port\05432\0hot_standby\0on\0"
    );
}

#[test]
fn conf_edit_keeps_empty_values() {
    let edit = ConfEdit::new("/d/postgresql.conf").set("synchronous_standby_names", "");
    assert_eq!(
        &edit.payload()[..],
        b"/d/postgresql.conf\0synchronous_standby_names\0\0"
    );
}

#[test]
fn hba_payload_is_the_fixed_tuple() {
    let line = HbaLine::trust("postgres", "beryl", "10.0.0.5", 31);
    let payload = HbaLine::payload_for("/data/c1/pg_hba.conf", std::slice::from_ref(&line));
    assert_eq!(
        &payload[..],
        b"/data/c1/pg_hba.conf\0host\0postgres\0beryl\010.0.0.5\031\0trust\0"
    );
}

#[test]
fn result_values_split_on_nul() {
    assert_eq!(
        split_result_values(b"one\0two\0"),
        vec!["one".to_string(), "two".to_string()]
    );
    assert_eq!(split_result_values(b""), Vec::<String>::new());
    // An empty value in the middle survives.
    assert_eq!(
        split_result_values(b"a\0\0b\0"),
        vec!["a".to_string(), String::new(), "b".to_string()]
    );
}
