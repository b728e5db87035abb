//! Process death during and after pipe routing.

use pipe_broker::error::EndpointError;
use pipe_broker::types::PipeId;

use crate::common::{TestEndpoint, Tree};

#[tokio::test]
async fn test_peer_dies_before_connecting() {
    let mut tree = Tree::new();
    let seven = tree.launch(7).await;
    let nine = tree.launch(9).await;
    let (x, _x_seen) = TestEndpoint::create();
    let (y, mut y_seen) = TestEndpoint::create();

    seven.connect(PipeId(100), x).await.unwrap();
    tree.kill(7);

    nine.connect(PipeId(100), y).await.unwrap();

    assert_eq!(y_seen.error().await, EndpointError::PeerUnreachable);
}

#[tokio::test]
async fn test_parent_loss_fails_pending_connect() {
    let mut tree = Tree::new();
    let seven = tree.launch(7).await;
    let (x, mut x_seen) = TestEndpoint::create();

    seven.connect(PipeId(3), x).await.unwrap();
    tree.kill(7);

    assert_eq!(x_seen.error().await, EndpointError::PeerUnreachable);
}

#[tokio::test]
async fn test_connected_pipe_sees_shutdown_when_peer_dies() {
    let mut tree = Tree::new();
    let seven = tree.launch(7).await;
    let nine = tree.launch(9).await;
    let (x, mut x_seen) = TestEndpoint::create();
    let (y, mut y_seen) = TestEndpoint::create();
    seven.connect(PipeId(100), x).await.unwrap();
    nine.connect(PipeId(100), y).await.unwrap();
    x_seen.attached().await;
    y_seen.attached().await;

    tree.kill(7);

    assert_eq!(y_seen.error().await, EndpointError::ReadShutdown);
}
