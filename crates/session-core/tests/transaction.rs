//! SIP transaction state machine tests over real sockets: the device side
//! is scripted byte-for-byte, the gateway side runs the production
//! connection task.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use gblink_session_core::{CoreConfig, GbManager, SipState, SipTcpConn};
use gblink_sip_core::{token, SipFramer, SipMessage, SipMethod};

const DEVICE: &str = "34020000001320000001";
const DOMAIN: &str = "3402000000";

fn test_config() -> CoreConfig {
    CoreConfig {
        // Park the session driver so tests drive the FSM deterministically.
        drive_interval: Duration::from_secs(3600),
        ..CoreConfig::default()
    }
}

async fn spawn_conn(manager: &Arc<GbManager>) -> (Arc<SipTcpConn>, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (server, peer) = listener.accept().await.unwrap();
    let local = server.local_addr().unwrap();

    let conn = SipTcpConn::new(manager, local, peer);
    tokio::spawn(conn.clone().cycle(server));
    (conn, client)
}

async fn read_msg(client: &mut TcpStream, framer: &mut SipFramer) -> SipMessage {
    loop {
        if let Some(raw) = framer.next_message().unwrap() {
            return SipMessage::parse(&raw).unwrap();
        }
        let mut buf = [0u8; 4096];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("timed out waiting for sip bytes")
            .unwrap();
        assert!(n > 0, "gateway closed the connection");
        framer.extend(&buf[..n]);
    }
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

fn register_request(cseq: u32) -> SipMessage {
    let mut reg = SipMessage::request(SipMethod::Register, DEVICE, DOMAIN);
    reg.via = format!("SIP/2.0/TCP 127.0.0.1:5060;rport;branch={}", token::branch());
    reg.from = format!("<sip:{DEVICE}@{DOMAIN}>;tag=dev{cseq}");
    reg.to = format!("<sip:{DEVICE}@{DOMAIN}>");
    reg.call_id = "reg-call-1".to_string();
    reg.cseq_number = cseq;
    reg.expires = Some(3600);
    reg
}

async fn register(conn: &Arc<SipTcpConn>, client: &mut TcpStream, framer: &mut SipFramer) {
    client
        .write_all(register_request(1).to_wire().as_bytes())
        .await
        .unwrap();
    let resp = read_msg(client, framer).await;
    assert_eq!(resp.status, 200);
    assert_eq!(resp.cseq_method, "REGISTER");
    assert_eq!(conn.state(), SipState::Registered);
}

/// Walk register → invite → 100 → 200/ACK, returning the parsed INVITE.
async fn establish(
    conn: &Arc<SipTcpConn>,
    client: &mut TcpStream,
    framer: &mut SipFramer,
) -> SipMessage {
    register(conn, client, framer).await;

    let ssrc = conn.invite_request(0, "203.0.113.9").unwrap();
    assert!(ssrc > 0);
    assert_eq!(conn.state(), SipState::Inviting);

    let invite = read_msg(client, framer).await;
    assert!(invite.is_invite());
    assert_eq!(invite.request_uri_user, DEVICE);
    assert_eq!(invite.content_type, "application/sdp");
    let ssrc_line = format!("y={ssrc:010}");
    assert!(invite.body.contains(&ssrc_line), "sdp missing {ssrc_line}");
    assert!(invite.body.contains("m=video"));
    assert!(invite.body.contains("TCP/RTP/AVP 96"));
    assert!(invite.body.contains("c=IN IP4 203.0.113.9"));
    assert!(invite.via_branch.starts_with("z9hG4bK"));
    assert_eq!(invite.ssrc_domain_id(), format!("{ssrc:010}"));

    let trying = SipMessage::reply_to(&invite, 100);
    client.write_all(trying.to_wire().as_bytes()).await.unwrap();
    wait_until("state trying", || conn.state() == SipState::Trying).await;

    let mut ok = SipMessage::reply_to(&invite, 200);
    ok.contact = format!("<sip:{DEVICE}@127.0.0.1:5061>");
    ok.content_type = "application/sdp".to_string();
    ok.set_body("v=0\r\n".to_string());
    client.write_all(ok.to_wire().as_bytes()).await.unwrap();

    let ack = read_msg(client, framer).await;
    assert_eq!(ack.method, Some(SipMethod::Ack));
    assert_eq!(ack.cseq_number, invite.cseq_number);
    assert_eq!(conn.state(), SipState::Stable);
    invite
}

#[tokio::test]
async fn register_creates_session_and_gets_200() {
    let manager = GbManager::new(test_config());
    let (conn, mut client) = spawn_conn(&manager).await;
    let mut framer = SipFramer::new();

    register(&conn, &mut client, &mut framer).await;
    assert_eq!(conn.device_id(), DEVICE);

    let session = manager.sessions().find(DEVICE).expect("session bound");
    assert_eq!(session.device_id(), DEVICE);
    session.dispose();
}

#[tokio::test]
async fn invite_dialog_reaches_stable() {
    let manager = GbManager::new(test_config());
    let (conn, mut client) = spawn_conn(&manager).await;
    let mut framer = SipFramer::new();

    establish(&conn, &mut client, &mut framer).await;

    if let Some(session) = manager.sessions().find(DEVICE) {
        session.dispose();
    }
}

#[tokio::test]
async fn bye_from_device_is_answered_and_terminal() {
    let manager = GbManager::new(test_config());
    let (conn, mut client) = spawn_conn(&manager).await;
    let mut framer = SipFramer::new();

    let invite = establish(&conn, &mut client, &mut framer).await;

    let mut bye = SipMessage::request(SipMethod::Bye, DEVICE, DOMAIN);
    bye.via = format!("SIP/2.0/TCP 127.0.0.1:5060;rport;branch={}", token::branch());
    bye.from = format!("<sip:{DEVICE}@{DOMAIN}>;tag=dev1");
    bye.to = invite.from.clone();
    bye.call_id = invite.call_id.clone();
    bye.cseq_number = 9;
    client.write_all(bye.to_wire().as_bytes()).await.unwrap();

    let resp = read_msg(&mut client, &mut framer).await;
    assert_eq!(resp.status, 200);
    assert_eq!(resp.cseq_method, "BYE");
    assert_eq!(conn.state(), SipState::Bye);
    assert!(conn.is_bye());

    if let Some(session) = manager.sessions().find(DEVICE) {
        session.dispose();
    }
}

#[tokio::test]
async fn keepalive_on_reconnect_goes_straight_to_stable() {
    let manager = GbManager::new(test_config());
    let (conn, mut client) = spawn_conn(&manager).await;
    let mut framer = SipFramer::new();

    let mut msg = SipMessage::request(SipMethod::Message, DEVICE, DOMAIN);
    msg.via = format!("SIP/2.0/TCP 127.0.0.1:5060;rport;branch={}", token::branch());
    msg.from = format!("<sip:{DEVICE}@{DOMAIN}>;tag=dev1");
    msg.to = format!("<sip:{DEVICE}@{DOMAIN}>");
    msg.call_id = "ka-call-1".to_string();
    msg.cseq_number = 20;
    msg.content_type = "Application/MANSCDP+xml".to_string();
    msg.set_body("<Notify><CmdType>Keepalive</CmdType></Notify>\n".to_string());
    client.write_all(msg.to_wire().as_bytes()).await.unwrap();

    let resp = read_msg(&mut client, &mut framer).await;
    assert_eq!(resp.status, 200);
    assert_eq!(conn.state(), SipState::Stable);
    assert!(manager.sessions().find(DEVICE).is_some());

    if let Some(session) = manager.sessions().find(DEVICE) {
        session.dispose();
    }
}

#[tokio::test]
async fn reset_to_register_sends_bye_then_reinvites_with_same_ssrc() {
    let manager = GbManager::new(test_config());
    let (conn, mut client) = spawn_conn(&manager).await;
    let mut framer = SipFramer::new();

    let invite = establish(&conn, &mut client, &mut framer).await;
    let first_ssrc = invite.ssrc_domain_id().to_string();

    conn.reset_to_register();
    assert_eq!(conn.state(), SipState::Reinviting);

    let bye = read_msg(&mut client, &mut framer).await;
    assert!(bye.is_bye());

    let bye_ok = SipMessage::reply_to(&bye, 200);
    client.write_all(bye_ok.to_wire().as_bytes()).await.unwrap();

    let reinvite = read_msg(&mut client, &mut framer).await;
    assert!(reinvite.is_invite());
    assert_eq!(reinvite.ssrc_domain_id(), first_ssrc);
    assert!(reinvite.cseq_number > invite.cseq_number);
    assert_eq!(conn.state(), SipState::Inviting);

    if let Some(session) = manager.sessions().find(DEVICE) {
        session.dispose();
    }
}
