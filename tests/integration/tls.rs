//! Mutual TLS plus token handshake over real loopback sockets.

use std::time::Duration;

use hive_core::message::{Message, Ping, Role};
use hive_services::transport::ClientChannel;
use hive_services::{NodeInfo, Transport, TransportError};

use crate::{token, Pki, TestMaster, TestWorker, WorkerOptions, WORKER_SERVER_NAME};

fn master_transport(pki: &Pki, secret: &str, with_client_cert: bool) -> Transport {
    let info = NodeInfo {
        node_id: "master@tls".into(),
        role: Role::Master,
        hostname: "tls".into(),
        listen_port: 0,
    };
    Transport::client(
        &pki.master_tls(with_client_cert).unwrap(),
        token(secret),
        info,
        WORKER_SERVER_NAME,
    )
    .unwrap()
}

fn refused(result: Result<ClientChannel, TransportError>) -> TransportError {
    match result {
        Ok(channel) => panic!("connected to {}", channel.peer().node_id),
        Err(e) => e,
    }
}

#[tokio::test]
async fn authenticated_channel_carries_messages() {
    let pki = Pki::generate().unwrap();
    let worker = TestWorker::spawn(&pki, "tls-ok", WorkerOptions::new(token("s3cret")))
        .await
        .unwrap();

    let channel = master_transport(&pki, "s3cret", true)
        .connect(worker.addr)
        .await
        .unwrap();
    assert_eq!(channel.peer().role, Role::Worker);
    assert_eq!(channel.peer().node_id, "tls-ok");

    let (_, mut reader, mut writer) = channel.into_split();
    // The worker opens with its resource report.
    match reader.recv().await.unwrap() {
        Message::ResourceReport(r) => assert_eq!(r.hostname, "tls-ok"),
        other => panic!("expected resource report, got {other:?}"),
    }

    writer.send(Message::Ping(Ping { ts_us: 42 })).await.unwrap();
    loop {
        let next = tokio::time::timeout(Duration::from_secs(5), reader.recv())
            .await
            .unwrap()
            .unwrap();
        match next {
            Message::Pong(p) => break assert_eq!(p.ts_us, 42),
            // Periodic reports may interleave.
            Message::ResourceReport(_) => continue,
            other => panic!("expected pong, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn wrong_token_is_refused_and_worker_not_registered() {
    let pki = Pki::generate().unwrap();
    let worker = TestWorker::spawn(&pki, "tls-token", WorkerOptions::new(token("right")))
        .await
        .unwrap();

    let err = refused(master_transport(&pki, "wrong", true).connect(worker.addr).await);
    assert!(err.is_auth(), "expected auth failure, got {err}");

    let master = TestMaster::new(&pki, token("wrong"), true).unwrap();
    assert!(master.connect(&worker).await.is_err());
    assert!(master.dispatcher.registry().is_empty());
    assert!(master.cooling_down(&worker));
}

#[tokio::test]
async fn untrusted_worker_certificate_is_rejected() {
    let trusted = Pki::generate().unwrap();
    let rogue = Pki::generate().unwrap();
    let worker = TestWorker::spawn(&rogue, "tls-rogue", WorkerOptions::new(token("s")))
        .await
        .unwrap();

    let err = refused(master_transport(&trusted, "s", true).connect(worker.addr).await);
    assert!(!err.is_auth());
    assert!(matches!(err, TransportError::Conn(_) | TransportError::Closed));
}

#[tokio::test]
async fn client_certificate_required_when_configured() {
    let pki = Pki::generate().unwrap();
    let mut opts = WorkerOptions::new(token("s"));
    opts.require_client_cert = true;
    let worker = TestWorker::spawn(&pki, "tls-mtls", opts).await.unwrap();

    assert!(master_transport(&pki, "s", false)
        .connect(worker.addr)
        .await
        .is_err());

    let channel = master_transport(&pki, "s", true)
        .connect(worker.addr)
        .await
        .unwrap();
    assert_eq!(channel.peer().node_id, "tls-mtls");
}

#[tokio::test]
async fn plaintext_client_gets_nothing() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let pki = Pki::generate().unwrap();
    let worker = TestWorker::spawn(&pki, "tls-plain", WorkerOptions::new(token("s")))
        .await
        .unwrap();

    let mut tcp = tokio::net::TcpStream::connect(worker.addr).await.unwrap();
    let frame = br#"{"kind":"hello","seq":0,"body":{}}"#;
    tcp.write_all(&(frame.len() as u32).to_be_bytes()).await.unwrap();
    tcp.write_all(frame).await.unwrap();

    let mut buf = [0u8; 64];
    let read = tokio::time::timeout(Duration::from_secs(10), tcp.read(&mut buf)).await;
    // Either the worker hangs up or sends a TLS alert; never a framed reply.
    if let Ok(Ok(n)) = read {
        assert!(n == 0 || buf[0] == 0x15, "unexpected plaintext reply");
    }
}
