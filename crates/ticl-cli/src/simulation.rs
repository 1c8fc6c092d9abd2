//! Simulated client run
//!
//! Starts a client runtime, plays the application side (re-registering on
//! request, acknowledging every invalidation) and wires its network channel
//! to a [`LoopbackServer`].

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};

use ticl_core::protocol::wire::ServerToClientMessage;
use ticl_core::ObjectId;
use ticl_runtime::{AppEvent, ClientSnapshot, FileStorage, NetworkHandle, RuntimeBuilder, RuntimeHandle};

use crate::config::CliConfig;
use crate::error::{CliError, Result};
use crate::server::LoopbackServer;

/// Outcome of a finished run
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub invalidations_received: usize,
    pub acknowledged_by_server: usize,
    pub registered_on_server: usize,
    pub snapshot: ClientSnapshot,
}

#[derive(Debug, Default)]
struct Progress {
    ready: bool,
    invalidations_sent: bool,
    invalidations_received: usize,
}

pub struct Simulation {
    config: CliConfig,
    object_ids: Vec<ObjectId>,
    invalidations: usize,
    server: LoopbackServer,
    progress: Progress,
}

impl Simulation {
    pub fn new(config: CliConfig, objects: usize, invalidations: usize) -> Self {
        let object_ids = (0..objects)
            .map(|i| ObjectId::new(config.simulation.object_source, format!("object-{}", i)))
            .collect();
        Self {
            config,
            object_ids,
            invalidations,
            server: LoopbackServer::new(),
            progress: Progress::default(),
        }
    }

    /// Run to completion, passing every listener event to `on_event`
    pub async fn run(mut self, mut on_event: impl FnMut(&AppEvent)) -> Result<SimulationReport> {
        let mut builder = RuntimeBuilder::new(self.config.simulation.client_id())
            .with_config(self.config.client.clone());
        if let Some(dir) = &self.config.simulation.state_dir {
            std::fs::create_dir_all(dir)?;
            builder = builder.with_storage(Arc::new(FileStorage::new(dir)));
        }
        let mut runtime = builder.build_and_start().await?;

        let outcome = self.drive(&mut runtime, &mut on_event).await;
        let report = match outcome {
            Ok(()) => Ok(SimulationReport {
                invalidations_received: self.progress.invalidations_received,
                acknowledged_by_server: self.server.acknowledged(),
                registered_on_server: self.server.registered_count(),
                snapshot: runtime.snapshot().await?,
            }),
            Err(e) => Err(e),
        };
        runtime.shutdown().await?;
        report
    }

    async fn drive(&mut self, runtime: &mut RuntimeHandle, on_event: &mut impl FnMut(&AppEvent)) -> Result<()> {
        let mut outbound = take(runtime.take_outbound_receiver(), "outbound")?;
        let mut events = take(runtime.take_app_event_receiver(), "listener event")?;
        let network = runtime.network();

        runtime.start().await?;
        info!(
            "Simulating {} objects and {} invalidations",
            self.object_ids.len(),
            self.invalidations
        );

        let timeout = self.config.simulation.timeout();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        while !self.is_complete() {
            tokio::select! {
                Some(bytes) = outbound.recv() => {
                    if let Some(reply) = self.server.handle_message(&bytes)? {
                        deliver(&network, reply)?;
                    }
                    self.maybe_send_invalidations(&network)?;
                }

                Some(event) = events.recv() => {
                    on_event(&event);
                    self.handle_event(runtime, &event).await?;
                }

                _ = &mut deadline => {
                    return Err(CliError::Simulation(format!("not finished after {:?}", timeout)));
                }
            }
        }

        info!("Simulation complete");
        Ok(())
    }

    async fn handle_event(&mut self, runtime: &RuntimeHandle, event: &AppEvent) -> Result<()> {
        match event {
            AppEvent::Ready => self.progress.ready = true,
            AppEvent::ReissueRegistrations { .. } => {
                if !self.object_ids.is_empty() {
                    runtime.register(self.object_ids.clone()).await?;
                }
            }
            AppEvent::Invalidate { .. }
            | AppEvent::InvalidateUnknownVersion { .. }
            | AppEvent::InvalidateAll { .. } => self.progress.invalidations_received += 1,
            AppEvent::RegistrationFailure { object_id, message, .. } => {
                warn!("Registration of {} failed: {}", object_id, message);
            }
            AppEvent::Error(info) => warn!("Client reported {:?}: {}", info.reason, info.message),
            AppEvent::RegistrationStatus { .. } => {}
        }

        if let Some(ack_handle) = event.ack_handle() {
            runtime.acknowledge(ack_handle.clone()).await?;
        }
        Ok(())
    }

    /// Invalidations go out once the server holds every registration
    fn maybe_send_invalidations(&mut self, network: &NetworkHandle) -> Result<()> {
        if self.progress.invalidations_sent
            || self.object_ids.is_empty()
            || self.server.registered_count() < self.object_ids.len()
        {
            return Ok(());
        }
        for message in self.server.invalidate_registered(self.invalidations) {
            deliver(network, message)?;
        }
        self.progress.invalidations_sent = true;
        Ok(())
    }

    fn is_complete(&self) -> bool {
        if self.object_ids.is_empty() {
            return self.progress.ready;
        }
        self.progress.invalidations_sent && self.server.acknowledged() >= self.invalidations
    }
}

fn take<T>(receiver: Option<UnboundedReceiver<T>>, name: &str) -> Result<UnboundedReceiver<T>> {
    receiver.ok_or_else(|| CliError::Simulation(format!("{} receiver already taken", name)))
}

fn deliver(network: &NetworkHandle, message: ServerToClientMessage) -> Result<()> {
    if !network.deliver(message.to_binary()?) {
        warn!("Client is not listening, dropped server message");
    }
    Ok(())
}
