//! Media connection tests: RFC 4571 framing, SSRC binding, RTCP discard
//! and pack statistics, with a scripted sender on the other socket.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use gblink_session_core::{CoreConfig, GbManager, MediaTcpConn};

const SSRC: u32 = 200001234;

fn test_config() -> CoreConfig {
    CoreConfig {
        drive_interval: Duration::from_millis(50),
        // A port that refuses immediately, so the muxer's connect attempts
        // fail fast instead of waiting on a real RTMP origin.
        output: "rtmp://127.0.0.1:1/live/[stream]".to_string(),
        ..CoreConfig::default()
    }
}

async fn spawn_conn(manager: &Arc<GbManager>) -> (Arc<MediaTcpConn>, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (server, peer) = listener.accept().await.unwrap();

    let conn = MediaTcpConn::new(manager, peer);
    tokio::spawn(conn.clone().cycle(server));
    (conn, client)
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// A minimal MPEG-2 pack header (no stuffing).
fn pack_header(scr_base: u64) -> Vec<u8> {
    let s = scr_base;
    vec![
        0x00,
        0x00,
        0x01,
        0xba,
        0x44 | (((s >> 30) & 0x07) as u8) << 3 | ((s >> 28) & 0x03) as u8,
        ((s >> 20) & 0xff) as u8,
        ((((s >> 15) & 0x1f) as u8) << 3) | 0x04 | ((s >> 13) & 0x03) as u8,
        ((s >> 5) & 0xff) as u8,
        (((s & 0x1f) as u8) << 3) | 0x04,
        0x01,
        0x00,
        0x00,
        0x03,
        0xf8,
    ]
}

/// A bounded video PES with a PTS and the given payload.
fn video_pes(pts: u64, payload: &[u8]) -> Vec<u8> {
    let packet_len = 3 + 5 + payload.len();
    let mut out = vec![0x00, 0x00, 0x01, 0xe0];
    out.push((packet_len >> 8) as u8);
    out.push((packet_len & 0xff) as u8);
    out.extend_from_slice(&[0x80, 0x80, 0x05]);
    out.extend_from_slice(&[
        0x21 | ((((pts >> 30) & 0x07) as u8) << 1),
        ((pts >> 22) & 0xff) as u8,
        ((((pts >> 15) & 0x7f) as u8) << 1) | 0x01,
        ((pts >> 7) & 0xff) as u8,
        (((pts & 0x7f) as u8) << 1) | 0x01,
    ]);
    out.extend_from_slice(payload);
    out
}

fn rtp_packet(ssrc: u32, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0x80, 96, (seq >> 8) as u8, (seq & 0xff) as u8];
    out.extend_from_slice(&[0, 0, 0, 0]); // timestamp
    out.extend_from_slice(&ssrc.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

async fn send_framed(client: &mut TcpStream, packet: &[u8]) {
    let len = (packet.len() as u16).to_be_bytes();
    client.write_all(&len).await.unwrap();
    client.write_all(packet).await.unwrap();
}

#[tokio::test]
async fn binds_by_ssrc_and_counts_packs() {
    let manager = GbManager::new(test_config());
    let session = manager.find_or_create_session("34020000001320000001");
    session.bind_ssrc(SSRC);

    let (conn, mut client) = spawn_conn(&manager).await;

    let mut ps = pack_header(90_000);
    ps.extend_from_slice(&video_pes(90_000, &[0, 0, 0, 1, 0x65, 1, 2, 3]));
    send_framed(&mut client, &rtp_packet(SSRC, 1, &ps)).await;
    wait_until("media bound", || conn.is_connected()).await;
    assert_eq!(conn.ssrc(), SSRC);

    // The first pack flushes when the second one arrives.
    let ps2 = pack_header(93_600);
    send_framed(&mut client, &rtp_packet(SSRC, 2, &ps2)).await;
    wait_until("two packs", || conn.pack_stats().packs >= 2).await;
    assert_eq!(conn.pack_stats().msgs, 1);
    assert!(conn.pack_stats().reserved >= 24);

    session.dispose();
}

#[tokio::test]
async fn rtcp_is_counted_and_discarded() {
    let manager = GbManager::new(test_config());
    let session = manager.find_or_create_session("34020000001320000001");
    session.bind_ssrc(SSRC);

    let (conn, mut client) = spawn_conn(&manager).await;

    // A receiver report (PT 201) must never reach the PS decoder.
    let mut rtcp = vec![0x80, 201, 0x00, 0x01];
    rtcp.extend_from_slice(&[0, 0, 0, 0]);
    rtcp.extend_from_slice(&SSRC.to_be_bytes());
    send_framed(&mut client, &rtcp).await;

    let ps = pack_header(90_000);
    send_framed(&mut client, &rtp_packet(SSRC, 1, &ps)).await;
    wait_until("media bound", || conn.is_connected()).await;
    assert_eq!(conn.pack_stats().packs, 1);

    session.dispose();
}

#[tokio::test]
async fn unknown_ssrc_creates_a_session() {
    let manager = GbManager::new(test_config());
    let (conn, mut client) = spawn_conn(&manager).await;

    let ps = pack_header(0);
    send_framed(&mut client, &rtp_packet(424242, 1, &ps)).await;
    wait_until("media bound", || conn.is_connected()).await;

    let session = manager
        .sessions()
        .find("0000424242")
        .expect("session created from media");
    assert!(manager.sessions().find_fast(424242).is_some());

    session.dispose();
}

#[tokio::test]
async fn garbage_payload_recovers_instead_of_failing() {
    let manager = GbManager::new(test_config());
    let session = manager.find_or_create_session("34020000001320000001");
    session.bind_ssrc(SSRC);

    let (conn, mut client) = spawn_conn(&manager).await;

    send_framed(&mut client, &rtp_packet(SSRC, 1, &[0xde; 64])).await;
    let ps = pack_header(90_000);
    send_framed(&mut client, &rtp_packet(SSRC, 2, &ps)).await;

    wait_until("recovered", || conn.pack_stats().recovered >= 1).await;
    assert!(conn.is_connected(), "corrupt payload must not drop the stream");
    assert_eq!(conn.pack_stats().packs, 1);

    session.dispose();
}
