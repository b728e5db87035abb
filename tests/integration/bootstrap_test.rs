//! Connects issued before the child's parent channel exists.

use bytes::Bytes;

use pipe_broker::channel::Frame;
use pipe_broker::types::PipeId;

use crate::common::{TestEndpoint, Tree};

#[tokio::test]
async fn test_connects_before_bootstrap_are_flushed() {
    let mut tree = Tree::new();
    let nine = tree.launch(9).await;
    let (seven, bootstrap) = tree.launch_unbootstrapped(7).await;
    let (x, mut x_seen) = TestEndpoint::create();
    let (y, mut y_seen) = TestEndpoint::create();

    seven.connect(PipeId(100), x).await.unwrap();
    nine.connect(PipeId(100), y).await.unwrap();
    assert!(x_seen.is_quiet());

    seven.set_host_handle(bootstrap).await.unwrap();

    let channel = x_seen.attached().await;
    y_seen.attached().await;
    channel
        .write(PipeId(100).route(), Frame::new(Bytes::from_static(b"late")))
        .unwrap();
    assert_eq!(y_seen.message().await, Bytes::from_static(b"late"));
}

#[tokio::test]
async fn test_local_pair_before_bootstrap_waits_for_channel() {
    let mut tree = Tree::new();
    let (seven, bootstrap) = tree.launch_unbootstrapped(7).await;
    let (x, mut x_seen) = TestEndpoint::create();
    let (y, mut y_seen) = TestEndpoint::create();

    seven.connect(PipeId(42), x).await.unwrap();
    seven.connect(PipeId(42), y).await.unwrap();
    assert!(x_seen.is_quiet());
    assert!(y_seen.is_quiet());

    seven.set_host_handle(bootstrap).await.unwrap();

    x_seen.attached().await;
    y_seen.attached().await;
}
