//! Tokio drivers for the broker state machines.
//!
//! Each broker is moved into one task that owns it outright. Embedder calls
//! arrive as commands on one queue and channel events on another; the task
//! applies them one at a time, so the state is never shared.
//!
//! A fatal error caused by a channel event closes that channel. A fatal
//! error caused by a command is returned to the caller.

use std::io::{Read, Write};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::channel::{event_queue, ChannelEvent, ChannelFactory, ChannelId, EventReceiver};
use crate::child::ChildBroker;
use crate::config::{Config, ConfigError};
use crate::endpoint::EndpointRef;
use crate::error::{BrokerError, Result};
use crate::host::HostBroker;
use crate::sync::{SyncChannelClient, SynchronousService};
use crate::types::{PipeId, PlatformHandle, ProcessId};

type Reply = oneshot::Sender<Result<()>>;

/// Log a failed event and tear down the channel it came from if fatal.
fn report_event_error(error: &BrokerError, channel: ChannelId, disconnect: impl FnOnce(ChannelId)) {
    if error.is_fatal() {
        error!(%channel, error = %error, "Fatal broker error");
        disconnect(channel);
    } else {
        warn!(%channel, error = %error, "Broker event failed");
    }
}

fn event_channel(event: &ChannelEvent) -> ChannelId {
    match event {
        ChannelEvent::Message { channel, .. } | ChannelEvent::Destroyed { channel } => *channel,
    }
}

async fn call<C>(commands: &mpsc::UnboundedSender<C>, build: impl FnOnce(Reply) -> C) -> Result<()> {
    let (reply, rx) = oneshot::channel();
    commands
        .send(build(reply))
        .map_err(|_| BrokerError::Shutdown)?;
    rx.await.map_err(|_| BrokerError::Shutdown)?
}

// ============================================================================
// Child
// ============================================================================

enum ChildCommand {
    SetHostHandle {
        handle: PlatformHandle,
        reply: Reply,
    },
    Connect {
        pipe_id: PipeId,
        endpoint: EndpointRef,
        reply: Reply,
    },
    Close {
        pipe_id: PipeId,
        endpoint: EndpointRef,
        reply: Reply,
    },
}

/// Cloneable front end of a running child broker.
#[derive(Clone)]
pub struct ChildBrokerHandle {
    commands: mpsc::UnboundedSender<ChildCommand>,
}

impl ChildBrokerHandle {
    /// Deliver the bootstrap channel handle. Call once.
    pub async fn set_host_handle(&self, handle: PlatformHandle) -> Result<()> {
        call(&self.commands, |reply| ChildCommand::SetHostHandle { handle, reply }).await
    }

    /// Connect `endpoint` as one side of `pipe_id`.
    pub async fn connect(&self, pipe_id: PipeId, endpoint: EndpointRef) -> Result<()> {
        call(&self.commands, |reply| ChildCommand::Connect {
            pipe_id,
            endpoint,
            reply,
        })
        .await
    }

    pub async fn close(&self, pipe_id: PipeId, endpoint: EndpointRef) -> Result<()> {
        call(&self.commands, |reply| ChildCommand::Close {
            pipe_id,
            endpoint,
            reply,
        })
        .await
    }

    /// Sandboxed bootstrap: install the sync pipe, read the async channel
    /// handle from it, and hand that to the broker.
    pub async fn bootstrap_sandboxed<S>(
        &self,
        client: Arc<SyncChannelClient<S>>,
        stream: S,
    ) -> Result<()>
    where
        S: Read + Write + Send + 'static,
    {
        let handle = tokio::task::spawn_blocking(move || client.bootstrap(stream))
            .await
            .map_err(|_| BrokerError::Shutdown)??;
        self.set_host_handle(handle).await
    }
}

/// Start an unsandboxed child broker task.
///
/// The task runs until every [`ChildBrokerHandle`] is dropped. Fails when
/// `broker.sync_channel` is set: sandboxed children need a sync client, so
/// use [`spawn_sandboxed_child_broker`].
pub fn spawn_child_broker(
    config: &Config,
    factory: Arc<dyn ChannelFactory>,
) -> std::result::Result<(ChildBrokerHandle, JoinHandle<()>), ConfigError> {
    if config.broker.sync_channel {
        return Err(ConfigError::Invalid(
            "broker.sync_channel is set; sandboxed children need a sync client".to_string(),
        ));
    }
    Ok(start_child(config, factory, None))
}

/// Start a child broker that reaches the parent's token service over a
/// synchronous pipe of type `S`. Requires `broker.sync_channel`.
///
/// Bootstrap it with [`ChildBrokerHandle::bootstrap_sandboxed`] using the
/// returned client.
pub fn spawn_sandboxed_child_broker<S>(
    config: &Config,
    factory: Arc<dyn ChannelFactory>,
) -> std::result::Result<(ChildBrokerHandle, Arc<SyncChannelClient<S>>, JoinHandle<()>), ConfigError>
where
    S: Read + Write + Send + 'static,
{
    if !config.broker.sync_channel {
        return Err(ConfigError::Invalid(
            "broker.sync_channel is not set; start the child unsandboxed".to_string(),
        ));
    }
    let client = Arc::new(SyncChannelClient::new(config.sync.max_handles_per_request));
    let sync: Arc<dyn SynchronousService> = client.clone();
    let (handle, task) = start_child(config, factory, Some(sync));
    info!("Sandboxed child broker starting");
    Ok((handle, client, task))
}

fn start_child(
    config: &Config,
    factory: Arc<dyn ChannelFactory>,
    sync: Option<Arc<dyn SynchronousService>>,
) -> (ChildBrokerHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = event_queue();
    let broker = ChildBroker::new(&config.broker, factory, events_tx, sync);
    let task = tokio::spawn(run_child(broker, rx, events_rx));
    (ChildBrokerHandle { commands: tx }, task)
}

async fn run_child(
    mut broker: ChildBroker,
    mut commands: mpsc::UnboundedReceiver<ChildCommand>,
    mut events: EventReceiver,
) {
    info!("Child broker started");
    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                match command {
                    ChildCommand::SetHostHandle { handle, reply } => {
                        let _ = reply.send(broker.set_host_handle(handle));
                    }
                    ChildCommand::Connect { pipe_id, endpoint, reply } => {
                        let _ = reply.send(broker.connect(pipe_id, endpoint));
                    }
                    ChildCommand::Close { pipe_id, endpoint, reply } => {
                        let _ = reply.send(broker.close(pipe_id, &endpoint));
                    }
                }
            }
            Some(event) = events.recv() => {
                let channel = event_channel(&event);
                if let Err(e) = broker.handle_event(event) {
                    report_event_error(&e, channel, |c| broker.disconnect(c));
                }
            }
        }
    }
    info!("Child broker stopped");
}

// ============================================================================
// Host
// ============================================================================

enum HostCommand {
    AddChild {
        process_id: ProcessId,
        handle: PlatformHandle,
        reply: Reply,
    },
    Connect {
        pipe_id: PipeId,
        endpoint: EndpointRef,
        reply: Reply,
    },
    Close {
        pipe_id: PipeId,
        endpoint: EndpointRef,
        reply: Reply,
    },
}

/// Cloneable front end of a running parent broker.
#[derive(Clone)]
pub struct HostBrokerHandle {
    commands: mpsc::UnboundedSender<HostCommand>,
}

impl HostBrokerHandle {
    /// Register a launched child whose bootstrap channel is `handle`.
    pub async fn add_child(&self, process_id: ProcessId, handle: PlatformHandle) -> Result<()> {
        call(&self.commands, |reply| HostCommand::AddChild {
            process_id,
            handle,
            reply,
        })
        .await
    }

    /// Connect an endpoint living in the parent.
    pub async fn connect(&self, pipe_id: PipeId, endpoint: EndpointRef) -> Result<()> {
        call(&self.commands, |reply| HostCommand::Connect {
            pipe_id,
            endpoint,
            reply,
        })
        .await
    }

    pub async fn close(&self, pipe_id: PipeId, endpoint: EndpointRef) -> Result<()> {
        call(&self.commands, |reply| HostCommand::Close {
            pipe_id,
            endpoint,
            reply,
        })
        .await
    }
}

/// Start the parent broker task.
pub fn spawn_host_broker(
    config: &Config,
    factory: Arc<dyn ChannelFactory>,
) -> (HostBrokerHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = event_queue();
    let broker = HostBroker::new(&config.broker, factory, events_tx);
    let task = tokio::spawn(run_host(broker, rx, events_rx));
    (HostBrokerHandle { commands: tx }, task)
}

async fn run_host(
    mut broker: HostBroker,
    mut commands: mpsc::UnboundedReceiver<HostCommand>,
    mut events: EventReceiver,
) {
    info!("Host broker started");
    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                match command {
                    HostCommand::AddChild { process_id, handle, reply } => {
                        let _ = reply.send(broker.add_child(process_id, handle));
                    }
                    HostCommand::Connect { pipe_id, endpoint, reply } => {
                        let _ = reply.send(broker.connect(pipe_id, endpoint));
                    }
                    HostCommand::Close { pipe_id, endpoint, reply } => {
                        let _ = reply.send(broker.close(pipe_id, &endpoint));
                    }
                }
            }
            Some(event) = events.recv() => {
                let channel = event_channel(&event);
                if let Err(e) = broker.handle_event(event) {
                    report_event_error(&e, channel, |c| broker.disconnect(c));
                }
            }
        }
    }
    info!("Host broker stopped");
}
