//! End-to-end exercises over loopback UDP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use aqueduct::{
    congestion::BbrConfig, EndpointConfig, QuicClient, QuicServer, ReadError, Session, Stream,
    TransportConfig, VarInt,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

async fn pair(config: TransportConfig) -> (QuicServer, Session, QuicClient) {
    let server = QuicServer::bind_with(
        "127.0.0.1:0".parse().unwrap(),
        EndpointConfig::default(),
        config.clone(),
    )
    .await
    .expect("bind");
    let addr = server.local_addr().unwrap();
    let accept = {
        let server = server.clone();
        tokio::spawn(async move { server.accept().await })
    };
    let client = QuicClient::connect_with(addr, EndpointConfig::default(), config)
        .await
        .expect("connect");
    let server_session = accept.await.unwrap().expect("accept");
    (server, server_session, client)
}

async fn read_to_end(stream: &Stream) -> Result<Vec<u8>, ReadError> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(ReadError::Finished) => return Ok(out),
            Err(e) => return Err(e),
        }
    }
}

#[tokio::test]
async fn single_stream_round_trip() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let (_server, server_session, client) = pair(TransportConfig::default()).await;

        let stream = client.open_stream().await.expect("open");
        stream.write_all(&[0x48, 0x49]).await.expect("write");
        stream.close().expect("close");

        let incoming = server_session.accept_stream().await.expect("accept stream");
        let data = read_to_end(&incoming).await.expect("read");
        assert_eq!(data, vec![0x48, 0x49]);
        // EOF is sticky
        let mut buf = [0u8; 1];
        assert_eq!(incoming.read(&mut buf).await, Err(ReadError::Finished));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn bidirectional_echo() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let (_server, server_session, client) = pair(TransportConfig::default()).await;

        tokio::spawn(async move {
            let stream = server_session.accept_stream().await.expect("accept stream");
            let data = read_to_end(&stream).await.expect("server read");
            stream.write_all(&data).await.expect("server write");
            stream.close().expect("server close");
        });

        let payload: Vec<u8> = (0..64 * 1024u32).map(|i| (i % 251) as u8).collect();
        let stream = client.open_stream().await.expect("open");
        stream.write_all(&payload).await.expect("client write");
        stream.close().expect("client close");

        let echoed = read_to_end(&stream).await.expect("client read");
        assert_eq!(echoed.len(), payload.len());
        assert_eq!(echoed, payload);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn multiple_streams_round_robin() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let (_server, server_session, client) = pair(TransportConfig::default()).await;
        const STREAMS: usize = 4;

        let server_task = tokio::spawn(async move {
            let mut seen = Vec::new();
            for _ in 0..STREAMS {
                let stream = server_session.accept_stream().await.expect("accept stream");
                let data = read_to_end(&stream).await.expect("read");
                seen.push((stream.id().index(), data));
            }
            seen.sort();
            seen
        });

        let mut handles = Vec::new();
        for i in 0..STREAMS {
            let stream = client.open_stream().await.expect("open");
            let payload = vec![i as u8; 8 * 1024];
            handles.push(tokio::spawn(async move {
                stream.write_all(&payload).await.expect("write");
                stream.close().expect("close");
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let seen = server_task.await.unwrap();
        assert_eq!(seen.len(), STREAMS);
        for (index, data) in seen {
            assert_eq!(data, vec![index as u8; 8 * 1024]);
        }
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn flow_control_blocking_and_release() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        // Tiny symmetric windows: the first kilobyte flows, then the sender
        // stalls until the reader's window updates release the rest.
        let mut config = TransportConfig::default();
        config
            .stream_receive_window(1024)
            .receive_window(1024)
            .send_buffer_size(4096);
        let (_server, server_session, client) = pair(config).await;

        let stream = client.open_stream().await.expect("open");
        let payload = vec![0xabu8; 2048];
        let writer = {
            let stream = stream.clone();
            let payload = payload.clone();
            tokio::spawn(async move {
                stream.write_all(&payload).await.expect("write");
                stream.close().expect("close");
            })
        };

        let incoming = server_session.accept_stream().await.expect("accept stream");
        // Give the sender a moment to hit the window edge
        tokio::time::sleep(Duration::from_millis(100)).await;
        let data = read_to_end(&incoming).await.expect("read");
        assert_eq!(data, payload);
        writer.await.unwrap();
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn stream_limit_gates_open() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let mut config = TransportConfig::default();
        config.max_concurrent_bidi_streams(1);
        let (_server, server_session, client) = pair(config).await;

        let first = client.open_stream().await.expect("open first");
        first.write_all(b"one").await.unwrap();
        first.close().unwrap();

        // The second open stalls until the server accepts the first,
        // granting MAX_STREAMS credit
        let second_open = {
            let session = client.session();
            tokio::spawn(async move { session.open_stream().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!second_open.is_finished());

        let incoming = server_session.accept_stream().await.expect("accept");
        assert_eq!(read_to_end(&incoming).await.unwrap(), b"one");

        let second = second_open.await.unwrap().expect("open second");
        second.write_all(b"two").await.unwrap();
        second.close().unwrap();
        let incoming = server_session.accept_stream().await.expect("accept second");
        assert_eq!(read_to_end(&incoming).await.unwrap(), b"two");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn cancel_write_resets_peer() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let (_server, server_session, client) = pair(TransportConfig::default()).await;

        let stream = client.open_stream().await.expect("open");
        stream.write_all(b"partial").await.unwrap();
        stream.cancel_write(VarInt::from_u32(42));

        let incoming = server_session.accept_stream().await.expect("accept");
        let mut buf = [0u8; 64];
        let err = loop {
            match incoming.read(&mut buf).await {
                Ok(_) => continue,
                Err(e) => break e,
            }
        };
        assert_eq!(err, ReadError::Reset(VarInt::from_u32(42)));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn connection_close_wakes_everything() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let (_server, server_session, client) = pair(TransportConfig::default()).await;

        let stream = client.open_stream().await.expect("open");
        stream.write_all(b"hello").await.unwrap();
        let incoming = server_session.accept_stream().await.expect("accept");
        let mut buf = [0u8; 8];
        let n = incoming.read(&mut buf).await.expect("read");
        assert_eq!(&buf[..n], b"hello");

        // A reader blocked on the server side when the client closes
        let blocked_read = {
            let incoming = incoming.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                incoming.read(&mut buf).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        client.session().close(VarInt::from_u32(0), b"bye");

        let err = blocked_read.await.unwrap().expect_err("read fails");
        assert_eq!(err, ReadError::Shutdown);
        // The session is dead on both sides; no further streams arrive
        assert!(server_session.accept_stream().await.is_err());
        assert!(!server_session.is_alive());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn connect_timeout_against_silent_peer() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        // A bound socket that never answers
        let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = silent.local_addr().unwrap();

        let mut config = TransportConfig::default();
        config.handshake_timeout(Duration::from_millis(300));
        let result =
            QuicClient::connect_with(addr, EndpointConfig::default(), config).await;
        assert!(result.is_err());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn bbr_round_trip() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let mut config = TransportConfig::default();
        config.congestion_controller_factory(Arc::new(BbrConfig::default()));
        let (_server, server_session, client) = pair(config).await;

        tokio::spawn(async move {
            let stream = server_session.accept_stream().await.expect("accept");
            let data = read_to_end(&stream).await.expect("read");
            stream.write_all(&data).await.expect("write");
            stream.close().expect("close");
        });

        let payload: Vec<u8> = (0..32 * 1024u32).map(|i| (i % 127) as u8).collect();
        let stream = client.open_stream().await.expect("open");
        stream.write_all(&payload).await.expect("write");
        stream.close().expect("close");
        assert_eq!(read_to_end(&stream).await.expect("read"), payload);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn stats_reflect_traffic() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let (_server, server_session, client) = pair(TransportConfig::default()).await;
        let stream = client.open_stream().await.expect("open");
        stream.write_all(&[0u8; 4096]).await.unwrap();
        stream.close().unwrap();
        let incoming = server_session.accept_stream().await.expect("accept");
        read_to_end(&incoming).await.expect("read");

        let stats = client.session().stats();
        assert!(stats.bytes_sent >= 4096);
        assert!(stats.congestion_window > 0);
        let stats = server_session.stats();
        assert!(stats.bytes_received >= 4096);
    })
    .await
    .expect("test timed out");
}
