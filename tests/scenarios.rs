//! End-to-end scenarios: a real client talking to a real server over
//! loopback TCP, covering the encrypted RPC round trip, auth
//! acceptance/rejection, multi-channel pipelining, and liveness.
//!
//! Each test binds to its own fixed loopback port to avoid needing the
//! server to report back its OS-assigned port.

use std::sync::Arc;
use std::time::Duration;

use relaylink::auth::RsaAuthProvider;
use relaylink::client::session::Session;
use relaylink::client::{ClientConfig, ProxyConfig};
use relaylink::crypto::aes::{self, AesKey};
use relaylink::crypto::rsa::KeyPair;
use relaylink::server::{Server, ServerConfig};
use relaylink::timeouts::Timeouts;

async fn start_server(port: u16, config: ServerConfig) -> Arc<Server> {
    let server = Server::new(config);
    server.start_server("127.0.0.1", port).await.unwrap();
    // give the accept loop a moment to actually be listening
    tokio::time::sleep(Duration::from_millis(50)).await;
    server
}

/// Scenario A: no auth, no proxy — client sends an RPC request and
/// gets the server's reply back over the encrypted channel.
#[tokio::test]
async fn scenario_a_encrypted_rpc_echo() {
    let server = start_server(18201, ServerConfig::default()).await;

    let session = Session::new(ClientConfig::new("127.0.0.1:18201"));
    session.connect().await.unwrap();
    assert!(session.client().is_encrypted());

    let echo_task = {
        let server = server.clone();
        tokio::spawn(async move {
            let (peer, chan_id, payload) = server.receive_message().await.unwrap();
            server.send_reply(peer, chan_id, payload).await.unwrap();
        })
    };

    let reply = session
        .client()
        .send_message(b"hello".to_vec(), true)
        .await
        .unwrap();
    assert_eq!(reply, Some(b"hello".to_vec()));

    echo_task.await.unwrap();
    session.disconnect().await;
    server.stop_server();
}

/// Scenario B: the server demands signed auth; a client with the
/// matching key pair is accepted, one without any provider is
/// rejected.
#[tokio::test]
async fn scenario_b_auth_accept_and_reject() {
    let server_kp = KeyPair::generate().unwrap();
    let client_kp = KeyPair::generate().unwrap();
    let client_pk = client_kp.public_key();

    let server_auth = Arc::new(RsaAuthProvider::verify_only(client_pk));
    let mut config = ServerConfig::default();
    config.auth = Some(server_auth);
    let server = start_server(18202, config).await;

    let mut accepted_config = ClientConfig::new("127.0.0.1:18202");
    accepted_config.auth = Some(Arc::new(RsaAuthProvider::sign_only(client_kp)));
    let accepted = Session::new(accepted_config);
    accepted.connect().await.expect("authenticated client should connect");
    accepted.disconnect().await;

    let rejected = Session::new(ClientConfig::new("127.0.0.1:18202"));
    let err = rejected.connect().await.expect_err("client with no auth provider should be rejected");
    assert_eq!(err, relaylink::handshake::FailedOn::AuthAddressRequired);

    let _ = server_kp;
    server.stop_server();
}

/// Scenario C: server A relays to server B; after the splice, the
/// client completes a full handshake with B directly, then an RPC
/// echoes through A -> B.
#[tokio::test]
async fn scenario_c_forwarding() {
    let server_b = start_server(18203, ServerConfig::default()).await;
    let server_a = start_server(18205, ServerConfig::default()).await;

    let mut config = ClientConfig::new("127.0.0.1:18205");
    config.proxy = Some(ProxyConfig {
        target: "127.0.0.1".to_string(),
        port: 18203,
        tls: None,
    });
    let session = Session::new(config);
    session.connect().await.unwrap();
    assert!(session.client().is_encrypted());

    let proxy_source = session
        .client()
        .proxy_source()
        .await
        .expect("client should observe A's outbound sockname");
    assert!(proxy_source.ip().is_loopback());
    assert_ne!(proxy_source.port(), 18205);
    assert_ne!(proxy_source.port(), 18203);

    let echo_task = {
        let server_b = server_b.clone();
        tokio::spawn(async move {
            let (peer, chan_id, payload) = server_b.receive_message().await.unwrap();
            server_b.send_reply(peer, chan_id, payload).await.unwrap();
        })
    };

    let reply = session
        .client()
        .send_message(b"through-a-to-b".to_vec(), true)
        .await
        .unwrap();
    assert_eq!(reply, Some(b"through-a-to-b".to_vec()));

    echo_task.await.unwrap();
    session.disconnect().await;
    server_a.stop_server();
    server_b.stop_server();
}

/// Scenario E: after a steady-state RPC, the client triggers an AES
/// rekey; the session key changes, ciphertext captured under the old
/// key can't be opened with the new one, and RPC traffic keeps
/// working afterward.
#[tokio::test]
async fn scenario_e_rekey() {
    let server = start_server(18208, ServerConfig::default()).await;

    let session = Session::new(ClientConfig::new("127.0.0.1:18208"));
    session.connect().await.unwrap();

    let responder = {
        let server = server.clone();
        tokio::spawn(async move {
            let (peer, chan_id, payload) = server.receive_message().await.unwrap();
            server.send_reply(peer, chan_id, payload).await.unwrap();
        })
    };
    let reply = session.client().send_message(b"pre-rekey".to_vec(), true).await.unwrap();
    assert_eq!(reply, Some(b"pre-rekey".to_vec()));
    responder.await.unwrap();

    let before_hex = session.client().session_key_hex().await.unwrap();
    let before_key = AesKey::from_hex(&before_hex).unwrap();
    let (nonce, tag, ciphertext) = aes::encrypt(&before_key, b"captured before rekey").unwrap();

    session.client().rekey().await.unwrap();

    let after_hex = session.client().session_key_hex().await.unwrap();
    assert_ne!(before_hex, after_hex);
    let after_key = AesKey::from_hex(&after_hex).unwrap();
    assert!(aes::decrypt(&after_key, &nonce, &tag, &ciphertext).is_err());

    let responder = {
        let server = server.clone();
        tokio::spawn(async move {
            let (peer, chan_id, payload) = server.receive_message().await.unwrap();
            server.send_reply(peer, chan_id, payload).await.unwrap();
        })
    };
    let reply = session.client().send_message(b"post-rekey".to_vec(), true).await.unwrap();
    assert_eq!(reply, Some(b"post-rekey".to_vec()));
    responder.await.unwrap();

    session.disconnect().await;
    server.stop_server();
}

/// Scenario D: four channels pipelining requests concurrently, each
/// correlated to its own reply independent of send order.
#[tokio::test]
async fn scenario_d_channel_pipelining() {
    let server = start_server(18204, ServerConfig::default()).await;

    let session = Arc::new(Session::new(ClientConfig::new("127.0.0.1:18204")));
    session.connect().await.unwrap();
    for _ in 0..3 {
        session.connect().await.unwrap();
    }

    let responder = {
        let server = server.clone();
        tokio::spawn(async move {
            for _ in 0..4 {
                let (peer, chan_id, payload) = server.receive_message().await.unwrap();
                let mut reply = payload;
                reply.push(b'!');
                server.send_reply(peer, chan_id, reply).await.unwrap();
            }
        })
    };

    let mut tasks = Vec::new();
    for i in 0..4u8 {
        let session = session.clone();
        tasks.push(tokio::spawn(async move {
            session.client().send_message(vec![b'a' + i], true).await.unwrap()
        }));
    }
    for (i, task) in tasks.into_iter().enumerate() {
        let reply = task.await.unwrap();
        assert_eq!(reply, Some(vec![b'a' + i as u8, b'!']));
    }

    responder.await.unwrap();
    server.stop_server();
}

/// Scenario F: a dead connection is detected by `ensure_connected`'s
/// liveness probe and transparently redialed.
#[tokio::test]
async fn scenario_f_liveness_detects_and_recovers() {
    let server = start_server(18206, ServerConfig::default()).await;

    let session = Session::new(ClientConfig::new("127.0.0.1:18206"));
    session.connect().await.unwrap();
    assert!(session.client().writeable().await);

    server.stop_server();
    // the old socket is now dead from the server's side; a fresh probe
    // should fail, and ensure_connected should redial once the server
    // (re)started.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let restarted = start_server(18206, ServerConfig::default()).await;
    let mut timeouts = Timeouts::default();
    timeouts.liveness_backoff = Duration::from_millis(50);
    tokio::time::timeout(Duration::from_secs(5), session.ensure_connected(&timeouts))
        .await
        .expect("ensure_connected should recover once the server is back");
    assert!(session.client().writeable().await);

    restarted.stop_server();
}
