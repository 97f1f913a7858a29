//! Frame-level codec tests over in-memory streams.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{duplex, BufReader};

use hasten_core::protocol::{new_codec, Codec, CodecConfig, CodecExt, CodecType, Handshake, Header};
use hasten_core::RpcError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TwoOperands {
    a: i64,
    b: i64,
}

fn codec_pair() -> (Arc<dyn Codec>, Arc<dyn Codec>) {
    let (a_r, b_w) = duplex(64 * 1024);
    let (b_r, a_w) = duplex(64 * 1024);
    let a = new_codec(a_r, a_w, CodecType::Bincode, CodecConfig::default()).unwrap();
    let b = new_codec(b_r, b_w, CodecType::Bincode, CodecConfig::default()).unwrap();
    (a, b)
}

#[tokio::test]
async fn struct_and_primitive_bodies_roundtrip() {
    let (a, b) = codec_pair();
    let args = TwoOperands { a: 1, b: 2 };

    a.write_value(&Header::request("ComputeS1.Add", 1), &args).await.unwrap();
    a.write_value(&Header::request("ComputeS1.Echo", 2), "hello").await.unwrap();

    let h1 = b.read_header().await.unwrap();
    let got: TwoOperands = b.read_body_as().await.unwrap();
    assert_eq!((h1.seq, got), (1, args));

    let h2 = b.read_header().await.unwrap();
    let s: String = b.read_body_as().await.unwrap();
    assert_eq!((h2.method.as_str(), s.as_str()), ("ComputeS1.Echo", "hello"));
}

#[tokio::test]
async fn concurrent_writers_never_interleave() {
    let (a, b) = codec_pair();

    let mut tasks = Vec::new();
    for i in 1..=64u64 {
        let a = Arc::clone(&a);
        tasks.push(tokio::spawn(async move {
            let body = vec![i as u8; 512];
            a.write_value(&Header::request("Svc.M", i), &body).await.unwrap();
        }));
    }

    let reader = tokio::spawn(async move {
        let mut seen = Vec::new();
        for _ in 0..64 {
            let h = b.read_header().await.unwrap();
            let body: Vec<u8> = b.read_body_as().await.unwrap();
            assert_eq!(body.len(), 512);
            assert!(body.iter().all(|x| *x == h.seq as u8));
            seen.push(h.seq);
        }
        seen
    });

    for t in tasks {
        t.await.unwrap();
    }
    let mut seen = reader.await.unwrap();
    seen.sort_unstable();
    assert_eq!(seen, (1..=64).collect::<Vec<_>>());
}

#[tokio::test]
async fn handshake_precedes_frames_on_one_stream() {
    let (client, server) = duplex(4096);
    let (c_r, mut c_w) = tokio::io::split(client);
    let (s_r, s_w) = tokio::io::split(server);

    Handshake::default().write_to(&mut c_w).await.unwrap();
    let client_codec = new_codec(c_r, c_w, CodecType::Bincode, CodecConfig::default()).unwrap();
    client_codec
        .write_value(&Header::request("ComputeS1.Add", 1), &TwoOperands { a: 3, b: 4 })
        .await
        .unwrap();

    let mut s_r = BufReader::new(s_r);
    let hs = Handshake::read_from(&mut s_r).await.unwrap();
    let codec_type = hs.validate().unwrap();
    let server_codec = new_codec(s_r, s_w, codec_type, CodecConfig::default()).unwrap();

    let h = server_codec.read_header().await.unwrap();
    let args: TwoOperands = server_codec.read_body_as().await.unwrap();
    assert_eq!(h.method, "ComputeS1.Add");
    assert_eq!(args, TwoOperands { a: 3, b: 4 });
}

#[tokio::test]
async fn unit_placeholder_body_then_clean_close() {
    let (a, b) = codec_pair();
    let mut failed = Header::request("Svc.M", 9);
    failed.error = "rpc server: service Svc not found".into();
    a.write_value(&failed, &()).await.unwrap();
    a.close().await.unwrap();

    let h = b.read_header().await.unwrap();
    assert!(h.is_error());
    let body = b.read_body().await.unwrap();
    assert!(body.is_empty());
    assert!(matches!(b.read_header().await, Err(RpcError::ConnectionClosed)));
}
