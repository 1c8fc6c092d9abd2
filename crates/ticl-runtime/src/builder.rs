//! Runtime Builder API
//!
//! Provides a builder-style API for applications (CLI, tests) to start a
//! client on its own thread and get an async handle to it.

use rand_core::RngCore;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use ticl_core::{
    AckHandle, ApplicationClientId, ClientBuilder, ClientConfig, ClientEvent, ClientState, EventSink, ObjectId,
    Storage, SystemResources,
};

use crate::error::{RuntimeError, RuntimeResult};
use crate::listener::{AppEvent, ChannelListener};
use crate::resources::{channel_network, ChannelEventSink, ChannelNetwork, MemoryStorage, NetworkHandle, TokioScheduler};
use crate::task::{ClientSnapshot, ClientTask, Command, Reply};

// ----------------------------------------------------------------------------
// Runtime Builder
// ----------------------------------------------------------------------------

/// Builder for a client running on a dedicated thread
pub struct RuntimeBuilder {
    client_id: ApplicationClientId,
    config: ClientConfig,
    storage: Option<Arc<dyn Storage>>,
    saved_state: Option<ClientState>,
    rng: Option<Box<dyn RngCore + Send>>,
    command_buffer_size: usize,
}

impl RuntimeBuilder {
    pub fn new(client_id: ApplicationClientId) -> Self {
        Self {
            client_id,
            config: ClientConfig::default(),
            storage: None,
            saved_state: None,
            rng: None,
            command_buffer_size: 100,
        }
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Storage for the persisted token; in-memory when not set
    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Resume a client marshalled by [`RuntimeHandle::marshal`]
    pub fn with_state(mut self, state: ClientState) -> Self {
        self.saved_state = Some(state);
        self
    }

    pub fn with_rng(mut self, rng: Box<dyn RngCore + Send>) -> Self {
        self.rng = Some(rng);
        self
    }

    pub fn command_buffer_size(mut self, size: usize) -> Self {
        self.command_buffer_size = size.max(1);
        self
    }

    /// Spawn the client thread and wait until the client is built
    pub async fn build_and_start(self) -> RuntimeResult<RuntimeHandle> {
        info!("Building invalidation client runtime");
        self.config.validate()?;

        let (command_sender, command_receiver) = mpsc::channel(self.command_buffer_size);
        let (event_sender, event_receiver) = mpsc::unbounded_channel();
        let (app_event_sender, app_event_receiver) = mpsc::unbounded_channel();
        let (network, network_handle, outbound_receiver) = channel_network();
        let (ready_sender, ready_receiver) = oneshot::channel();

        let setup = ClientThread {
            client_id: self.client_id,
            config: self.config,
            storage: self
                .storage
                .unwrap_or_else(|| Arc::new(MemoryStorage::new()) as Arc<dyn Storage>),
            saved_state: self.saved_state,
            rng: self.rng,
            network,
            sink: Arc::new(ChannelEventSink::new(event_sender)),
            listener: ChannelListener::new(app_event_sender),
            command_receiver,
            event_receiver,
        };
        let thread = std::thread::Builder::new()
            .name("ticl-client".into())
            .spawn(move || setup.run(ready_sender))?;

        match ready_receiver.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => return Err(RuntimeError::startup("client thread exited during startup")),
        }

        info!("Invalidation client runtime started");
        Ok(RuntimeHandle {
            command_sender,
            app_event_receiver: Some(app_event_receiver),
            outbound_receiver: Some(outbound_receiver),
            network: network_handle,
            thread: Some(thread),
        })
    }
}

/// Everything the client thread needs, moved onto it at spawn
struct ClientThread {
    client_id: ApplicationClientId,
    config: ClientConfig,
    storage: Arc<dyn Storage>,
    saved_state: Option<ClientState>,
    rng: Option<Box<dyn RngCore + Send>>,
    network: ChannelNetwork,
    sink: Arc<dyn EventSink>,
    listener: ChannelListener,
    command_receiver: mpsc::Receiver<Command>,
    event_receiver: mpsc::UnboundedReceiver<ClientEvent>,
}

impl ClientThread {
    fn run(self, ready: oneshot::Sender<RuntimeResult<()>>) -> RuntimeResult<()> {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(e) => {
                let _ = ready.send(Err(RuntimeError::startup(e.to_string())));
                return Err(e.into());
            }
        };

        runtime.block_on(async move {
            let scheduler = Arc::new(TokioScheduler::new(Handle::current(), Arc::clone(&self.sink)));
            let resources = Arc::new(SystemResources::new(
                scheduler,
                self.storage,
                Arc::new(self.network),
                self.sink,
            ));
            resources.start();

            let mut builder = ClientBuilder::new(resources, self.client_id).with_config(self.config);
            if let Some(rng) = self.rng {
                builder = builder.with_rng(rng);
            }
            if let Some(state) = self.saved_state {
                builder = builder.with_state(state);
            }
            let client = match builder.build(self.listener) {
                Ok(client) => client,
                Err(e) => {
                    let _ = ready.send(Err(RuntimeError::startup(e.to_string())));
                    return Err(e.into());
                }
            };
            let _ = ready.send(Ok(()));

            ClientTask::new(client, self.command_receiver, self.event_receiver)
                .run()
                .await
        })
    }
}

// ----------------------------------------------------------------------------
// Runtime Handle
// ----------------------------------------------------------------------------

/// Handle to a client running on its own thread
pub struct RuntimeHandle {
    command_sender: mpsc::Sender<Command>,
    app_event_receiver: Option<mpsc::UnboundedReceiver<AppEvent>>,
    outbound_receiver: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    network: NetworkHandle,
    thread: Option<JoinHandle<RuntimeResult<()>>>,
}

impl RuntimeHandle {
    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> RuntimeResult<T> {
        let (reply, response) = oneshot::channel();
        self.command_sender
            .send(command(reply))
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        response.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    pub async fn start(&self) -> RuntimeResult<()> {
        self.request(|reply| Command::Start { reply }).await
    }

    pub async fn stop(&self) -> RuntimeResult<()> {
        self.request(|reply| Command::Stop { reply }).await
    }

    pub async fn register(&self, objects: Vec<ObjectId>) -> RuntimeResult<()> {
        self.request(|reply| Command::Register { objects, reply }).await
    }

    pub async fn unregister(&self, objects: Vec<ObjectId>) -> RuntimeResult<()> {
        self.request(|reply| Command::Unregister { objects, reply }).await
    }

    pub async fn acknowledge(&self, ack_handle: AckHandle) -> RuntimeResult<()> {
        self.request(|reply| Command::Acknowledge { ack_handle, reply }).await
    }

    pub async fn snapshot(&self) -> RuntimeResult<ClientSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Marshalled client state, for [`RuntimeBuilder::with_state`]
    pub async fn marshal(&self) -> RuntimeResult<ClientState> {
        self.request(|reply| Command::Marshal { reply }).await
    }

    /// Take the listener event receiver (can only be called once)
    pub fn take_app_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<AppEvent>> {
        self.app_event_receiver.take()
    }

    /// Take the receiver of messages the client sends (can only be called once)
    pub fn take_outbound_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.outbound_receiver.take()
    }

    /// Inbound side of the client's network channel
    pub fn network(&self) -> NetworkHandle {
        self.network.clone()
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|thread| !thread.is_finished())
    }

    /// Wait for the client task to end and return its outcome
    pub async fn wait(&mut self) -> RuntimeResult<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        let joined = tokio::task::spawn_blocking(move || thread.join())
            .await
            .map_err(|e| RuntimeError::TaskPanicked {
                reason: e.to_string(),
            })?;
        match joined {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::TaskPanicked {
                reason: "client thread panicked".into(),
            }),
        }
    }

    /// Stop the client task and wait for its thread
    pub async fn shutdown(&mut self) -> RuntimeResult<()> {
        info!("Shutting down invalidation client runtime");
        if self.command_sender.send(Command::Shutdown).await.is_err() {
            warn!("Client task already stopped");
        }
        self.wait().await
    }
}
