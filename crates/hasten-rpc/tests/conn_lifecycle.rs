//! Connection lifetime: reply ordering, draining on shutdown, and what a
//! stalled write does to either end.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{duplex, BufReader, DuplexStream};
use tokio::time::{sleep, timeout};

use hasten_core::protocol::{new_codec, Codec, CodecConfig, CodecExt, CodecType, Handshake, Header};
use hasten_core::RpcError;
use hasten_rpc::{Client, ClientOptions, RpcService, Server, ServerOptions, ServiceBuilder};

/// Replies of arbitrary size.
struct Blob;

impl RpcService for Blob {
    fn register_methods(methods: ServiceBuilder<Self>) -> ServiceBuilder<Self> {
        methods
            .method("Big", |_: &Blob, len: u32, out: &mut Vec<u8>| {
                *out = vec![7u8; len as usize];
                Ok::<(), String>(())
            })
            .method("Small", |_: &Blob, n: u32, out: &mut u32| {
                *out = n;
                Ok::<(), String>(())
            })
    }
}

/// One method that blocks its worker for a while, one that answers at once.
struct Pace;

impl RpcService for Pace {
    fn register_methods(methods: ServiceBuilder<Self>) -> ServiceBuilder<Self> {
        methods
            .method("Slow", |_: &Pace, n: u32, out: &mut u32| {
                std::thread::sleep(Duration::from_millis(300));
                *out = n;
                Ok::<(), String>(())
            })
            .method("Fast", |_: &Pace, n: u32, out: &mut u32| {
                *out = n;
                Ok::<(), String>(())
            })
    }
}

fn spawn_server(opts: ServerOptions, stream: DuplexStream) -> tokio::task::JoinHandle<hasten_core::Result<()>> {
    let server = Server::new(opts);
    server.register_service(Blob).unwrap();
    server.register_service(Pace).unwrap();
    tokio::spawn(async move { server.serve_stream(stream).await })
}

/// Client end of a duplex pair after the handshake, without a reader task.
async fn raw_client(stream: DuplexStream) -> Arc<dyn Codec> {
    let (r, mut w) = tokio::io::split(stream);
    Handshake::default().write_to(&mut w).await.unwrap();
    new_codec(r, w, CodecType::Bincode, CodecConfig::default()).unwrap()
}

#[tokio::test]
async fn stalled_reply_write_closes_the_connection() {
    let (client_side, server_side) = duplex(256);
    let opts = ServerOptions {
        write_timeout: Some(Duration::from_millis(50)),
        ..ServerOptions::default()
    };
    let server = spawn_server(opts, server_side);
    let codec = raw_client(client_side).await;

    codec.write_value(&Header::request("Blob.Big", 1), &100_000u32).await.unwrap();
    // Leave the reply unread well past the server's write deadline.
    sleep(Duration::from_millis(300)).await;

    let served = timeout(Duration::from_secs(2), server)
        .await
        .expect("server must give up on the connection")
        .unwrap();
    assert!(served.is_ok(), "{served:?}");

    // Whatever made it onto the wire ends in a broken frame, not a hang.
    let err = timeout(Duration::from_secs(2), async {
        loop {
            if let Err(e) = codec.read_header().await {
                return e;
            }
            if let Err(e) = codec.read_body().await {
                return e;
            }
        }
    })
    .await
    .expect("client must see the connection end");
    assert!(err.is_fatal(), "{err}");

    let second = codec.write_value(&Header::request("Blob.Small", 2), &1u32).await;
    assert!(second.is_err());
}

#[tokio::test]
async fn abandoned_send_still_writes_a_whole_frame() {
    let (client_side, server_side) = duplex(256);
    let client = Client::new(client_side, ClientOptions::default()).await.unwrap();

    let big = vec![1u8; 64 * 1024];
    let abandoned = timeout(Duration::from_millis(50), client.go("Blob.Big", &big)).await;
    assert!(abandoned.is_err(), "nobody is reading yet; the send cannot finish");
    assert!(client.is_available());
    assert_eq!(client.pending_calls(), 0);

    let peer = tokio::spawn(async move {
        let (r, w) = tokio::io::split(server_side);
        let mut r = BufReader::new(r);
        Handshake::read_from(&mut r).await.unwrap().validate().unwrap();
        let codec = new_codec(r, w, CodecType::Bincode, CodecConfig::default()).unwrap();
        let mut seen = Vec::new();
        for _ in 0..2 {
            let header = codec.read_header().await.unwrap();
            let body = codec.read_body().await.unwrap();
            seen.push((header.method, body.len()));
        }
        seen
    });

    let _small = client.go("Blob.Small", &7u32).await.unwrap();
    let seen = timeout(Duration::from_secs(2), peer).await.unwrap().unwrap();
    // bincode: u64 length prefix, then the bytes.
    assert_eq!(seen[0], ("Blob.Big".to_string(), 8 + 64 * 1024));
    assert_eq!(seen[1].0, "Blob.Small");
    assert!(client.is_available());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fast_reply_overtakes_a_slow_one() {
    let (client_side, server_side) = duplex(64 * 1024);
    let _server = spawn_server(ServerOptions::default(), server_side);
    let client = Client::new(client_side, ClientOptions::default()).await.unwrap();

    let slow = client.go("Pace.Slow", &1u32).await.unwrap().reply::<u32>();
    let fast = client.go("Pace.Fast", &2u32).await.unwrap().reply::<u32>();
    tokio::pin!(slow, fast);

    let first = tokio::select! {
        r = &mut slow => ("slow", r.unwrap()),
        r = &mut fast => ("fast", r.unwrap()),
    };
    assert_eq!(first, ("fast", 2));
    assert_eq!(slow.await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn replies_in_flight_are_sent_before_the_server_closes() {
    let (client_side, server_side) = duplex(64 * 1024);
    let server = spawn_server(ServerOptions::default(), server_side);
    let codec = raw_client(client_side).await;

    codec.write_value(&Header::request("Pace.Slow", 9), &42u32).await.unwrap();
    // No more requests: the server reads EOF while Slow is still running.
    codec.close().await.unwrap();

    let header = codec.read_header().await.unwrap();
    assert_eq!((header.seq, header.error.as_str()), (9, ""));
    let n: u32 = codec.read_body_as().await.unwrap();
    assert_eq!(n, 42);

    let end = codec.read_header().await.unwrap_err();
    assert!(end.is_eof(), "{end}");
    assert!(server.await.unwrap().is_ok());
}

#[tokio::test]
async fn silent_connection_fails_the_handshake_deadline() {
    let (_client_side, server_side) = duplex(1024);
    let opts = ServerOptions {
        handshake_timeout: Duration::from_millis(50),
        ..ServerOptions::default()
    };
    let server = spawn_server(opts, server_side);

    let res = timeout(Duration::from_secs(2), server)
        .await
        .expect("server must not wait forever for a handshake")
        .unwrap();
    assert!(matches!(res, Err(RpcError::Timeout)), "{res:?}");
}
