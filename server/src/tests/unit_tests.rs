//! End-to-end coverage of the pre-session command set and a full handshake → dispatch
//! round trip, run over an in-memory duplex pipe rather than a real socket.

use crate::accounts::Accounts;
use crate::dispatch::Dispatch;
use crate::relay_spool::RelaySpool;
use crate::rendezvous::Rendezvous;
use protocol::handshake;
use protocol::identity::FullIdentity;
use protocol::wire::{PreSessionCommand, PreSessionReply, WireMessage};
use std::sync::Arc;

fn tempdir(label: &str) -> std::path::PathBuf {
    let mut dir = std::env::temp_dir();
    dir.push(format!("server-unit-test-{label}-{}", uuid::Uuid::new_v4()));
    dir
}

#[tokio::test]
async fn identify_reveals_the_servers_own_identity() {
    let (mut client, mut server) = tokio::io::duplex(8192).into_split();
    let server_identity = FullIdentity::generate("relay", "relay");
    let fingerprint = server_identity.public().fingerprint_hex();

    let handle = tokio::spawn(async move {
        let command = protocol::presession::recv_command(&mut server).await.unwrap();
        assert!(matches!(command, PreSessionCommand::Identify));
        let reply = PreSessionReply::Identify { identity: server_identity.public().clone() };
        protocol::presession::send_reply(&mut server, &reply).await.unwrap();
    });

    protocol::presession::send_command(&mut client, &PreSessionCommand::Identify).await.unwrap();
    let reply = protocol::presession::recv_reply(&mut client).await.unwrap();
    match reply {
        PreSessionReply::Identify { identity } => assert_eq!(identity.fingerprint_hex(), fingerprint),
        _ => panic!("wrong reply"),
    }
    handle.await.unwrap();
}

#[tokio::test]
async fn create_account_then_full_pq_session_delivers_a_welcome_and_a_push() {
    let accounts = Arc::new(Accounts::new());
    let rendezvous = Arc::new(Rendezvous::new());
    let spool = Arc::new(RelaySpool::new(tempdir("pq-session")));
    let dispatch = Arc::new(Dispatch::new(accounts.clone(), rendezvous, spool.clone(), protocol::constants::TAG_DEPTH_DEFAULT, None));
    let ephemeral_pool = protocol::session::EphemeralKemPool::new();
    let server_identity = Arc::new(FullIdentity::generate("relay", "relay"));
    let alice = FullIdentity::generate("alice", "al");
    let alice_fp = alice.public().fingerprint_hex();
    let alice_pub = alice.public().clone();

    // Stage an already-spooled message so the session's opening push is exercised too.
    spool.deliver(&alice_fp, "bob".to_string(), b"waiting for you".to_vec(), false).await.unwrap();

    let (mut client, mut server_stream) = tokio::io::duplex(32768).into_split();
    let server_identity_for_task = server_identity.clone();
    let server_task = tokio::spawn(async move {
        let command = protocol::presession::recv_command(&mut server_stream).await.unwrap();
        match command {
            PreSessionCommand::CreateAccount { identity, .. } => {
                accounts.register(identity).unwrap();
                protocol::presession::send_reply(&mut server_stream, &PreSessionReply::CreateAccount { error: None })
                    .await
                    .unwrap();
            }
            _ => panic!("expected CreateAccount"),
        }
        let command = protocol::presession::recv_command(&mut server_stream).await.unwrap();
        let fingerprint = match command {
            PreSessionCommand::Session { fingerprint } => fingerprint,
            _ => panic!("expected Session"),
        };
        protocol::presession::send_reply(&mut server_stream, &PreSessionReply::ProceedToHandshake).await.unwrap();
        let peer_pub = fips203::ml_kem_768::EncapsKey::try_from_bytes(
            alice_pub.kem_key.as_slice().try_into().unwrap(),
        )
        .unwrap();
        let mut session =
            handshake::respond_pq(&mut server_stream, &server_identity_for_task, &peer_pub, &ephemeral_pool).await.unwrap();
        dispatch.run(&fingerprint, &mut session, &mut server_stream).await.unwrap();
    });

    protocol::presession::send_command(
        &mut client,
        &PreSessionCommand::CreateAccount { token: None, identity: alice.public().clone() },
    )
    .await
    .unwrap();
    match protocol::presession::recv_reply(&mut client).await.unwrap() {
        PreSessionReply::CreateAccount { error } => assert!(error.is_none()),
        _ => panic!("wrong reply"),
    }

    protocol::presession::send_command(&mut client, &PreSessionCommand::Session { fingerprint: alice_fp.clone() })
        .await
        .unwrap();
    assert!(matches!(
        protocol::presession::recv_reply(&mut client).await.unwrap(),
        PreSessionReply::ProceedToHandshake
    ));

    let server_kem_pub =
        fips203::ml_kem_768::EncapsKey::try_from_bytes(server_identity.public().kem_key.as_slice().try_into().unwrap()).unwrap();
    let mut session = handshake::initiate_pq(&mut client, &alice, &server_kem_pub).await.unwrap();

    let welcome = session.read_frame(&mut client).await.unwrap();
    assert!(matches!(
        serde_json::from_slice::<WireMessage>(&welcome).unwrap(),
        WireMessage::Welcome { .. }
    ));

    let pushed = session.read_frame(&mut client).await.unwrap();
    match serde_json::from_slice::<WireMessage>(&pushed).unwrap() {
        WireMessage::Push { sealed, .. } => assert_eq!(sealed, b"waiting for you"),
        other => panic!("expected a push, got something else: discriminant {:?}", std::mem::discriminant(&other)),
    }

    server_task.abort();
}
