mod common;

use berylmgr::core::agent::{AgentClient, AgentCmd};
use berylmgr::core::errors::BerylMgrError;
use bytes::{BufMut, BytesMut};
use common::free_port;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Serves exactly one connection: reads one command frame, then plays the
/// scripted reply frames and closes.
async fn scripted_agent(replies: Vec<(u8, &'static [u8])>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut len_buf = [0u8; 4];
        socket.read_exact(&mut len_buf).await.unwrap();
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut rest = vec![0u8; 1 + len];
        socket.read_exact(&mut rest).await.unwrap();

        let mut out = BytesMut::new();
        for (msg_type, payload) in replies {
            out.put_u32_le(payload.len() as u32);
            out.put_u8(msg_type);
            out.extend_from_slice(payload);
        }
        socket.write_all(&out).await.unwrap();
    });
    port
}

#[tokio::test]
async fn notices_are_skipped_and_result_is_kept_until_idle() {
    let port = scripted_agent(vec![
        (b'N', b"starting the node"),
        (b'R', b"all good"),
        (b'Z', b""),
    ])
    .await;
    let mut client = AgentClient::connect("127.0.0.1", port).await.unwrap();
    let result = client.run(AgentCmd::DnStart, &["/data/dn1"]).await.unwrap();
    assert_eq!(&result[..], b"all good");
}

#[tokio::test]
async fn idle_without_result_is_an_empty_success() {
    let port = scripted_agent(vec![(b'Z', b"")]).await;
    let mut client = AgentClient::connect("127.0.0.1", port).await.unwrap();
    let result = client.run(AgentCmd::AgentPing, &[]).await.unwrap();
    assert!(result.is_empty());
}

#[tokio::test]
async fn error_reply_carries_the_agent_text() {
    let port = scripted_agent(vec![(b'E', b"initdb failed: directory not empty")]).await;
    let mut client = AgentClient::connect("127.0.0.1", port).await.unwrap();
    let err = client.run(AgentCmd::DnInit, &["/data/dn1"]).await.unwrap_err();
    match err {
        BerylMgrError::RemoteCommandFailed(text) => {
            assert!(text.contains("directory not empty"));
        }
        other => panic!("expected RemoteCommandFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn unexpected_message_type_is_a_protocol_violation() {
    let port = scripted_agent(vec![(b'Q', b"what")]).await;
    let mut client = AgentClient::connect("127.0.0.1", port).await.unwrap();
    let err = client.run(AgentCmd::AgentPing, &[]).await.unwrap_err();
    assert!(matches!(err, BerylMgrError::ProtocolViolation(_)));
}

#[tokio::test]
async fn eof_before_any_terminator_is_transient() {
    let port = scripted_agent(vec![(b'N', b"half a reply")]).await;
    let mut client = AgentClient::connect("127.0.0.1", port).await.unwrap();
    let err = client.run(AgentCmd::AgentPing, &[]).await.unwrap_err();
    assert!(matches!(err, BerylMgrError::TransientNetwork(_)));
}

#[tokio::test]
async fn refused_connection_is_agent_down() {
    let port = free_port().await;
    let err = AgentClient::connect("127.0.0.1", port).await.unwrap_err();
    assert!(matches!(err, BerylMgrError::AgentDown(_)));
}
