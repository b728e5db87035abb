//! Sandboxed children bootstrapping over the synchronous token service.

use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;

use bytes::Bytes;

use pipe_broker::channel::{ChannelFactory, Frame};
use pipe_broker::runtime::spawn_sandboxed_child_broker;
use pipe_broker::sync::{IdentityDuplicator, SynchronousService, TokenServer, TokenTable};
use pipe_broker::types::{PipeId, PlatformHandle, ProcessId};
use pipe_broker::Config;

use crate::common::{TestEndpoint, Tree};

#[tokio::test]
async fn test_sandboxed_child_routes_through_sync_bootstrap() {
    let mut tree = Tree::new();
    let nine = tree.launch(9).await;

    let (host_end, child_end) = tree.transport.create_pair().unwrap();
    tree.host.add_child(ProcessId(7), host_end).await.unwrap();

    let (sync_child, mut sync_parent) = UnixStream::pair().unwrap();
    let tokens = TokenTable::new();
    let server = TokenServer::new(
        tokens.clone(),
        Arc::new(IdentityDuplicator),
        Arc::new(tree.transport.clone()),
        8,
    );
    let server = thread::spawn(move || {
        TokenServer::bootstrap(&mut sync_parent, child_end)?;
        server.serve(&mut sync_parent)
    });

    let mut config = Config::for_test();
    config.broker.sync_channel = true;
    let (seven, client, task) =
        spawn_sandboxed_child_broker::<UnixStream>(&config, Arc::new(tree.transport.clone()))
            .unwrap();
    seven
        .bootstrap_sandboxed(client.clone(), sync_child)
        .await
        .unwrap();

    // Routed pipe to another child over the async channel.
    let (x, mut x_seen) = TestEndpoint::create();
    let (y, mut y_seen) = TestEndpoint::create();
    seven.connect(PipeId(100), x).await.unwrap();
    nine.connect(PipeId(100), y).await.unwrap();
    let channel = x_seen.attached().await;
    y_seen.attached().await;
    channel
        .write(PipeId(100).route(), Frame::new(Bytes::from_static(b"sandboxed")))
        .unwrap();
    assert_eq!(y_seen.message().await, Bytes::from_static(b"sandboxed"));

    // Local pair created by the parent on the child's behalf.
    let (a, mut a_seen) = TestEndpoint::create();
    let (b, mut b_seen) = TestEndpoint::create();
    seven.connect(PipeId(42), a).await.unwrap();
    seven.connect(PipeId(42), b).await.unwrap();
    a_seen.attached().await;
    b_seen.attached().await;

    // Token exchange on the same pipe.
    let issued = client.handle_to_token(&[PlatformHandle(77)]).unwrap();
    assert_eq!(tokens.len(), 1);
    assert_eq!(
        client.token_to_handle(&issued).unwrap(),
        vec![PlatformHandle(77)]
    );

    // The server loop ends once every holder of the sync pipe is gone.
    drop(seven);
    task.await.unwrap();
    drop(client);
    assert!(server.join().unwrap().is_ok());
}
