use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;

use multipaxos::{socket, ClientRequest, ClientResponse, Config, Ledger, Message};

fn pick_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

async fn connect(addr: SocketAddr) -> TcpStream {
    for _ in 0..100 {
        if let Ok(stream) = TcpStream::connect(addr).await {
            return stream
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("server at {} never came up", addr);
}

/// Submits `value` until some attempt is committed.
async fn commit(addr: SocketAddr, value: i64) -> ClientResponse {
    let (mut rx, mut tx) = socket::split(connect(addr).await);
    for correlation_id in 0..20 {
        let request = ClientRequest { correlation_id, requested_value: value };
        tx.send(&Message::ClientRequest(request)).await.unwrap();
        match tokio::time::timeout(Duration::from_secs(10), rx.recv()).await {
        | Ok(Some(Message::ClientResponse(response))) if !response.is_rejected() => return response,
        | Ok(Some(Message::ClientResponse(_))) => tokio::time::sleep(Duration::from_millis(50)).await,
        | other => panic!("unexpected {:?}", other),
        }
    }
    panic!("{} was never committed", value);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_servers_commit_over_tcp() {
    let dir = tempfile::tempdir().unwrap();
    let peers: Vec<SocketAddr> = (0..3).map(|_| pick_addr()).collect();
    let clients: Vec<SocketAddr> = (0..3).map(|_| pick_addr()).collect();

    for id in 0..3 {
        let config = Config::new(id, peers.clone(), clients[id as usize])
            .with_ledger_dir(dir.path())
            .with_timeout(Duration::from_millis(20))
            .with_tick(Duration::from_millis(1));
        tokio::spawn(config.run());
    }

    assert_eq!(commit(clients[0], 42).await, ClientResponse { decree_num: 0, value: 42 });
    assert_eq!(commit(clients[1], 43).await, ClientResponse { decree_num: 1, value: 43 });

    // The leader of the second request committed both decrees before answering
    let ledger = Ledger::open(dir.path(), "ledger-01.paxos", 1).unwrap();
    assert_eq!(ledger.outcome(0).unwrap(), Some(42));
    assert_eq!(ledger.outcome(1).unwrap(), Some(43));
}
