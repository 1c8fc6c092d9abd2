//! Client Task Implementation
//!
//! The single owner of an [`InvalidationClient`]. Application commands and
//! client events arrive on two channels and are handled one at a time on the
//! client thread.

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use ticl_core::registration::RegistrationManager;
use ticl_core::{AckHandle, ClientEvent, ClientState, ClientToken, InvalidationClient, ObjectId, RunState};

use crate::error::{RuntimeError, RuntimeResult};
use crate::listener::ChannelListener;

/// Reply channel for one command
pub type Reply<T> = oneshot::Sender<RuntimeResult<T>>;

// ----------------------------------------------------------------------------
// Commands
// ----------------------------------------------------------------------------

/// Requests from the application to the client task
#[derive(Debug)]
pub enum Command {
    Start { reply: Reply<()> },
    Stop { reply: Reply<()> },
    Register { objects: Vec<ObjectId>, reply: Reply<()> },
    Unregister { objects: Vec<ObjectId>, reply: Reply<()> },
    Acknowledge { ack_handle: AckHandle, reply: Reply<()> },
    Snapshot { reply: Reply<ClientSnapshot> },
    Marshal { reply: Reply<ClientState> },
    Shutdown,
}

/// Point-in-time view of a running client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientSnapshot {
    pub run_state: RunState,
    pub client_token: Option<ClientToken>,
    pub is_online: bool,
    pub registered_objects: usize,
    pub in_sync_with_server: bool,
    pub statistics: Vec<(String, u64)>,
}

impl ClientSnapshot {
    pub fn capture(client: &InvalidationClient<ChannelListener>) -> Self {
        Self {
            run_state: client.run_state(),
            client_token: client.client_token().cloned(),
            is_online: client.is_online(),
            registered_objects: client.registration_manager().len(),
            in_sync_with_server: client.registration_manager().is_state_in_sync_with_server(),
            statistics: client.statistics().non_zero_statistics(),
        }
    }
}

// ----------------------------------------------------------------------------
// Client Task
// ----------------------------------------------------------------------------

pub struct ClientTask {
    client: InvalidationClient<ChannelListener>,
    command_receiver: mpsc::Receiver<Command>,
    event_receiver: mpsc::UnboundedReceiver<ClientEvent>,
    running: bool,
}

impl ClientTask {
    pub fn new(
        client: InvalidationClient<ChannelListener>,
        command_receiver: mpsc::Receiver<Command>,
        event_receiver: mpsc::UnboundedReceiver<ClientEvent>,
    ) -> Self {
        Self {
            client,
            command_receiver,
            event_receiver,
            running: true,
        }
    }

    /// Run until shutdown, until the command channel closes, or until the
    /// client reports a fatal error, which is returned
    pub async fn run(mut self) -> RuntimeResult<()> {
        info!("Client task starting");

        while self.running {
            tokio::select! {
                command = self.command_receiver.recv() => {
                    match command {
                        Some(command) => self.process_command(command)?,
                        None => {
                            info!("Command channel closed, shutting down");
                            break;
                        }
                    }
                }

                event = self.event_receiver.recv() => {
                    match event {
                        Some(event) => {
                            debug!("Handling {:?}", event);
                            if let Err(e) = self.client.handle_event(event) {
                                return Err(self.fail(e));
                            }
                        }
                        None => {
                            info!("Event channel closed, shutting down");
                            break;
                        }
                    }
                }
            }
        }

        info!("Client task stopped");
        Ok(())
    }

    fn process_command(&mut self, command: Command) -> RuntimeResult<()> {
        match command {
            Command::Start { reply } => {
                let result = self.client.start();
                self.respond(result, reply)
            }
            Command::Stop { reply } => {
                let result = self.client.stop();
                self.respond(result, reply)
            }
            Command::Register { objects, reply } => {
                let result = self.client.register_all(&objects);
                self.respond(result, reply)
            }
            Command::Unregister { objects, reply } => {
                let result = self.client.unregister_all(&objects);
                self.respond(result, reply)
            }
            Command::Acknowledge { ack_handle, reply } => {
                let result = self.client.acknowledge(&ack_handle);
                self.respond(result, reply)
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(Ok(ClientSnapshot::capture(&self.client)));
                Ok(())
            }
            Command::Marshal { reply } => {
                let _ = reply.send(Ok(self.client.marshal()));
                Ok(())
            }
            Command::Shutdown => {
                info!("Shutdown requested");
                self.running = false;
                Ok(())
            }
        }
    }

    /// Pass a command result back; a fatal error also ends the task
    fn respond<T>(&mut self, result: ticl_core::Result<T>, reply: Reply<T>) -> RuntimeResult<()> {
        match result {
            Err(e) if e.is_fatal() => {
                let _ = reply.send(Err(RuntimeError::Fatal {
                    reason: e.to_string(),
                }));
                Err(self.fail(e))
            }
            result => {
                let _ = reply.send(result.map_err(RuntimeError::from));
                Ok(())
            }
        }
    }

    fn fail(&mut self, e: ticl_core::TiclError) -> RuntimeError {
        error!("Unrecoverable client error, shutting down client task: {}", e);
        self.running = false;
        RuntimeError::Client(e)
    }
}
