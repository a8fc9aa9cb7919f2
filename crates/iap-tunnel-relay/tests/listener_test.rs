//! Binding behaviour of the local listener set

use iap_tunnel_relay::{ListenerSet, RelayError};
use std::time::Duration;
use tokio::net::TcpStream;

#[tokio::test]
async fn test_second_bind_on_same_port_fails() {
    let first = ListenerSet::bind("127.0.0.1", 0).await.unwrap();
    let port = first.port();

    let (a, b) = tokio::join!(
        ListenerSet::bind("127.0.0.1", port),
        ListenerSet::bind("127.0.0.1", port)
    );

    for result in [a, b] {
        match result {
            Err(RelayError::LocalPortUnavailable { .. })
            | Err(RelayError::UnableToOpenPort { .. }) => {}
            other => panic!("expected a bind failure, got {:?}", other),
        }
    }

    // The original listener still owns the port and accepts.
    let _client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let accepted = first.accept_next(Duration::from_secs(2)).await.unwrap();
    assert!(accepted.is_some());
}

#[tokio::test]
async fn test_failed_bind_leaves_nothing_open() {
    let mut first = ListenerSet::bind("localhost", 0).await.unwrap();
    let port = first.port();

    assert!(ListenerSet::bind("localhost", port).await.is_err());

    // Once the first set is gone the port is completely free again, so the
    // failed attempt did not keep any listener of its own.
    first.close_all();
    let again = ListenerSet::bind("localhost", port).await.unwrap();
    assert_eq!(again.port(), port);
    assert!(again.local_addrs().iter().all(|addr| addr.port() == port));
}

#[tokio::test]
async fn test_accept_from_any_family() {
    let listeners = ListenerSet::bind("localhost", 0).await.unwrap();
    let port = listeners.port();

    for addr in listeners.local_addrs() {
        let _client = TcpStream::connect(addr).await.unwrap();
        let (_stream, peer) = listeners
            .accept_next(Duration::from_secs(2))
            .await
            .unwrap()
            .expect("pending connection");
        assert_eq!(peer.is_ipv6(), addr.is_ipv6());
        assert_eq!(addr.port(), port);
    }
}
