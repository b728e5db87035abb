//! End-to-end pipe routing through the broker tasks.

use bytes::Bytes;

use pipe_broker::channel::Frame;
use pipe_broker::types::PipeId;

use crate::common::{TestEndpoint, Tree};

#[tokio::test]
async fn test_child_to_child_pipe() {
    let mut tree = Tree::new();
    let seven = tree.launch(7).await;
    let nine = tree.launch(9).await;
    let (x, mut x_seen) = TestEndpoint::create();
    let (y, mut y_seen) = TestEndpoint::create();

    seven.connect(PipeId(100), x).await.unwrap();
    nine.connect(PipeId(100), y).await.unwrap();

    let x_channel = x_seen.attached().await;
    let y_channel = y_seen.attached().await;

    x_channel
        .write(PipeId(100).route(), Frame::new(Bytes::from_static(b"ping")))
        .unwrap();
    assert_eq!(y_seen.message().await, Bytes::from_static(b"ping"));

    y_channel
        .write(PipeId(100).route(), Frame::new(Bytes::from_static(b"pong")))
        .unwrap();
    assert_eq!(x_seen.message().await, Bytes::from_static(b"pong"));
}

#[tokio::test]
async fn test_parent_to_child_pipe() {
    let mut tree = Tree::new();
    let nine = tree.launch(9).await;
    let (p, mut p_seen) = TestEndpoint::create();
    let (w, mut w_seen) = TestEndpoint::create();

    tree.host.connect(PipeId(5), p).await.unwrap();
    nine.connect(PipeId(5), w).await.unwrap();

    let p_channel = p_seen.attached().await;
    w_seen.attached().await;
    p_channel
        .write(PipeId(5).route(), Frame::new(Bytes::from_static(b"hi")))
        .unwrap();
    assert_eq!(w_seen.message().await, Bytes::from_static(b"hi"));
}

#[tokio::test]
async fn test_child_before_parent_endpoint() {
    let mut tree = Tree::new();
    let nine = tree.launch(9).await;
    let (p, mut p_seen) = TestEndpoint::create();
    let (w, mut w_seen) = TestEndpoint::create();

    nine.connect(PipeId(5), w).await.unwrap();
    tree.host.connect(PipeId(5), p).await.unwrap();

    let w_channel = w_seen.attached().await;
    p_seen.attached().await;

    w_channel
        .write(PipeId(5).route(), Frame::new(Bytes::from_static(b"up")))
        .unwrap();
    assert_eq!(p_seen.message().await, Bytes::from_static(b"up"));
}

#[tokio::test]
async fn test_both_ends_in_one_child() {
    let mut tree = Tree::new();
    let seven = tree.launch(7).await;
    let (x, mut x_seen) = TestEndpoint::create();
    let (y, mut y_seen) = TestEndpoint::create();

    seven.connect(PipeId(42), x).await.unwrap();
    seven.connect(PipeId(42), y).await.unwrap();

    let x_channel = x_seen.attached().await;
    y_seen.attached().await;
    x_channel
        .write(PipeId(42).route(), Frame::new(Bytes::from_static(b"local")))
        .unwrap();
    assert_eq!(y_seen.message().await, Bytes::from_static(b"local"));
}

#[tokio::test]
async fn test_many_pipes_share_one_link() {
    let mut tree = Tree::new();
    let seven = tree.launch(7).await;
    let nine = tree.launch(9).await;

    let mut channels = Vec::new();
    for pipe in 1000..1010 {
        let (x, mut x_seen) = TestEndpoint::create();
        let (y, mut y_seen) = TestEndpoint::create();
        seven.connect(PipeId(pipe), x).await.unwrap();
        nine.connect(PipeId(pipe), y).await.unwrap();
        channels.push(x_seen.attached().await.id());
        y_seen.attached().await;
    }

    channels.dedup();
    assert_eq!(channels.len(), 1);
}

#[tokio::test]
async fn test_frames_arrive_in_order() {
    let mut tree = Tree::new();
    let seven = tree.launch(7).await;
    let nine = tree.launch(9).await;
    let (x, mut x_seen) = TestEndpoint::create();
    let (y, mut y_seen) = TestEndpoint::create();
    seven.connect(PipeId(7), x).await.unwrap();
    nine.connect(PipeId(7), y).await.unwrap();
    let channel = x_seen.attached().await;
    y_seen.attached().await;

    for i in 0u8..20 {
        channel
            .write(PipeId(7).route(), Frame::new(Bytes::from(vec![i])))
            .unwrap();
    }
    for i in 0u8..20 {
        assert_eq!(y_seen.message().await, Bytes::from(vec![i]));
    }
}
