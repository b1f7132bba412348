// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::ipc::{read_frame, write_frame};
use crate::test_support::{fake_pty, fake_supervisor, FakePtyHandle};

struct TestClient {
    stream: UnixStream,
    shutdown: CancellationToken,
    handle: FakePtyHandle,
    supervisor: Arc<PtySupervisor>,
}

/// Wire a Connection to one end of a socketpair and hand back the other.
fn connect(pre_output: &[&[u8]]) -> anyhow::Result<TestClient> {
    let (client, server) = UnixStream::pair()?;
    let (pty, handle) = fake_pty(Some(0));
    let supervisor = fake_supervisor("cafe0123", pty);

    // Output produced before the client handshakes; it must arrive via
    // replay, not as live frames.
    supervisor.start_read_loop();
    for chunk in pre_output {
        handle.emit(chunk);
    }

    let shutdown = CancellationToken::new();
    let conn = Connection {
        stream: Arc::new(server),
        supervisor: Arc::clone(&supervisor),
        token: shutdown.child_token(),
        shutdown: shutdown.clone(),
        write_lock: Arc::new(tokio::sync::Mutex::new(())),
        log_level: None,
    };
    tokio::spawn(conn.run());

    Ok(TestClient { stream: client, shutdown, handle, supervisor })
}

async fn recv(stream: &UnixStream) -> anyhow::Result<(MsgType, bytes::Bytes)> {
    let frame = tokio::time::timeout(Duration::from_secs(2), read_frame(stream)).await??;
    Ok(frame)
}

async fn wait_for_cursor(supervisor: &Arc<PtySupervisor>, cursor: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while supervisor.output_cursor() < cursor && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn handshake_replays_buffered_output() -> anyhow::Result<()> {
    let client = connect(&[b"early ", b"output"])?;
    wait_for_cursor(&client.supervisor, 12).await;

    write_frame(&client.stream, MsgType::GetInfo, &[]).await?;

    let (msg, payload) = recv(&client.stream).await?;
    assert_eq!(msg, MsgType::Info);
    let info = protocol::decode_info(&payload)?;
    assert_eq!(info.id, "cafe0123");
    assert!(info.is_running);

    // Replay carries everything written before the handshake.
    let (msg, payload) = recv(&client.stream).await?;
    assert_eq!(msg, MsgType::Output);
    let (cols, rows, data) = protocol::decode_output(&payload)?;
    assert_eq!((cols, rows), (80, 24));
    assert_eq!(&data[..], b"early output");
    Ok(())
}

#[tokio::test]
async fn live_output_not_duplicated_after_replay() -> anyhow::Result<()> {
    let client = connect(&[b"before"])?;
    wait_for_cursor(&client.supervisor, 6).await;

    write_frame(&client.stream, MsgType::GetInfo, &[]).await?;
    let (msg, _) = recv(&client.stream).await?;
    assert_eq!(msg, MsgType::Info);

    let (msg, payload) = recv(&client.stream).await?;
    assert_eq!(msg, MsgType::Output);
    let (_, _, data) = protocol::decode_output(&payload)?;
    assert_eq!(&data[..], b"before");

    // Bytes emitted after the handshake arrive exactly once, live.
    client.handle.emit(b"after");
    let (msg, payload) = recv(&client.stream).await?;
    assert_eq!(msg, MsgType::Output);
    let (_, _, data) = protocol::decode_output(&payload)?;
    assert_eq!(&data[..], b"after");
    Ok(())
}

#[tokio::test]
async fn requests_are_acked_in_order() -> anyhow::Result<()> {
    let client = connect(&[])?;
    write_frame(&client.stream, MsgType::GetInfo, &[]).await?;
    let (msg, _) = recv(&client.stream).await?;
    assert_eq!(msg, MsgType::Info);

    write_frame(&client.stream, MsgType::Resize, &protocol::encode_resize(120, 40)).await?;
    let (msg, _) = recv(&client.stream).await?;
    assert_eq!(msg, MsgType::ResizeAck);

    write_frame(&client.stream, MsgType::SetName, &protocol::encode_set_name(Some("x"), true))
        .await?;
    let (msg, _) = recv(&client.stream).await?;
    assert_eq!(msg, MsgType::SetNameAck);

    // A refreshed Info reflects both mutations.
    write_frame(&client.stream, MsgType::GetInfo, &[]).await?;
    let (msg, payload) = recv(&client.stream).await?;
    assert_eq!(msg, MsgType::Info);
    let info = protocol::decode_info(&payload)?;
    assert_eq!((info.cols, info.rows), (120, 40));
    assert_eq!(info.name.as_deref(), Some("x"));
    assert!(info.manually_named);
    Ok(())
}

#[tokio::test]
async fn get_buffer_returns_snapshot() -> anyhow::Result<()> {
    let client = connect(&[b"scroll", b"back"])?;
    wait_for_cursor(&client.supervisor, 10).await;

    write_frame(&client.stream, MsgType::GetInfo, &[]).await?;
    let _info = recv(&client.stream).await?;
    let _replay = recv(&client.stream).await?;

    write_frame(&client.stream, MsgType::GetBuffer, &[]).await?;
    let (msg, payload) = recv(&client.stream).await?;
    assert_eq!(msg, MsgType::Buffer);
    assert_eq!(&payload[..], b"scrollback");
    Ok(())
}

#[tokio::test]
async fn input_is_forwarded_without_ack() -> anyhow::Result<()> {
    let client = connect(&[])?;
    write_frame(&client.stream, MsgType::GetInfo, &[]).await?;
    let _info = recv(&client.stream).await?;

    write_frame(&client.stream, MsgType::Input, b"ls\n").await?;

    // No ack for Input; the next response belongs to the next request.
    write_frame(&client.stream, MsgType::GetBuffer, &[]).await?;
    let (msg, _) = recv(&client.stream).await?;
    assert_eq!(msg, MsgType::Buffer);
    Ok(())
}

#[tokio::test]
async fn close_acks_then_cancels_shutdown() -> anyhow::Result<()> {
    let client = connect(&[])?;
    write_frame(&client.stream, MsgType::GetInfo, &[]).await?;
    let _info = recv(&client.stream).await?;

    write_frame(&client.stream, MsgType::Close, &[]).await?;
    let (msg, _) = recv(&client.stream).await?;
    assert_eq!(msg, MsgType::CloseAck);

    tokio::time::timeout(Duration::from_secs(2), client.shutdown.cancelled()).await?;
    Ok(())
}

#[test]
fn replay_gate_drops_pre_handshake_events() {
    let mut gate = ReplayGate::default();
    assert_eq!(gate.on_event(10, 10), None);

    gate.commit(10);
    // Fully replayed event dropped, partial overlap sliced, new passed.
    assert_eq!(gate.on_event(8, 8), None);
    assert_eq!(gate.on_event(14, 8), Some(4));
    assert_eq!(gate.on_event(20, 6), Some(0));
}

#[test]
fn replay_gate_high_water_never_regresses() {
    let mut gate = ReplayGate::default();
    gate.commit(20);
    gate.commit(10);
    assert_eq!(gate.on_event(15, 5), None);
    assert_eq!(gate.on_event(25, 5), Some(0));
}
