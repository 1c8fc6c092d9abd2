//! Loopback Server
//!
//! A minimal in-process stand-in for the invalidation server. It hands out
//! tokens, accepts every registration, asks for a registration sync when
//! its count disagrees with the client's summary and counts invalidation
//! acks. Invalidations are only sent when
//! asked for with [`LoopbackServer::invalidate_registered`].

use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use ticl_core::protocol::wire::{
    ClientToServerMessage, RegistrationStatus, RegistrationSummary, ServerHeader, ServerToClientMessage,
    Status, TokenControlMessage, PROTOCOL_VERSION,
};
use ticl_core::{ClientToken, Invalidation, ObjectId, RegistrationOp};

use crate::error::Result;

/// What the server knows about one client token
#[derive(Debug, Default)]
struct ServerSession {
    registered: BTreeSet<ObjectId>,
    summary: RegistrationSummary,
}

#[derive(Debug, Default)]
pub struct LoopbackServer {
    sessions: BTreeMap<Vec<u8>, ServerSession>,
    issued_tokens: u64,
    server_time_ms: u64,
    next_version: i64,
    acknowledged: usize,
}

impl LoopbackServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process one encoded client message and build the reply, if any
    pub fn handle_message(&mut self, bytes: &[u8]) -> Result<Option<ServerToClientMessage>> {
        let message = ClientToServerMessage::from_binary(bytes)?;
        self.server_time_ms += 1;

        if message.header.protocol_version.major != PROTOCOL_VERSION.major {
            warn!(
                "Ignoring message with protocol version {}",
                message.header.protocol_version.major
            );
            return Ok(None);
        }

        if let Some(initialize) = &message.initialize {
            self.issued_tokens += 1;
            let token = ClientToken::new(format!("loopback-{}", self.issued_tokens));
            info!("Issuing token {} to client type {}", token, initialize.client_type);
            self.sessions.insert(token.as_bytes().to_vec(), ServerSession::default());

            // A new session holds no registrations
            let mut reply = self.reply_to(
                initialize.nonce.as_bytes().to_vec(),
                Some(RegistrationSummary::default()),
            );
            reply.token_control = Some(TokenControlMessage {
                new_token: Some(token),
            });
            return Ok(Some(reply));
        }

        let Some(token) = message.header.client_token.as_ref() else {
            warn!("Ignoring message without a token");
            return Ok(None);
        };
        let Some(session) = self.sessions.get_mut(token.as_bytes()) else {
            info!("Destroying unknown token {}", token);
            let mut reply = self.reply_to(token.as_bytes().to_vec(), None);
            reply.token_control = Some(TokenControlMessage { new_token: None });
            return Ok(Some(reply));
        };

        for subtree in message.registration_sync.iter().flatten() {
            session.registered.extend(subtree.registered_objects.iter().cloned());
        }

        let mut statuses = Vec::new();
        for registration in message.registrations.iter().flatten() {
            match registration.op {
                RegistrationOp::Register => {
                    session.registered.insert(registration.object_id.clone());
                }
                RegistrationOp::Unregister => {
                    session.registered.remove(&registration.object_id);
                }
            }
            statuses.push(RegistrationStatus {
                registration: registration.clone(),
                status: Status::success(),
            });
        }
        // Digests are not recomputed here; the client's summary is trusted
        // once the counts agree, otherwise the full set is requested
        let client_summary = &message.header.registration_summary;
        let in_sync = client_summary.num_registrations as usize == session.registered.len();
        session.summary = if in_sync {
            client_summary.clone()
        } else {
            RegistrationSummary {
                num_registrations: session.registered.len() as u32,
                registration_digest: Vec::new(),
            }
        };
        let summary = session.summary.clone();

        let acks = message.invalidation_acks.as_ref().map_or(0, Vec::len);
        if acks > 0 {
            debug!("Received {} invalidation acks", acks);
            self.acknowledged += acks;
        }

        let mut reply = self.reply_to(token.as_bytes().to_vec(), Some(summary));
        if !statuses.is_empty() {
            reply.registration_statuses = Some(statuses);
        }
        if !in_sync {
            debug!("Requesting registration sync");
            reply.registration_sync_request = true;
        }
        Ok(Some(reply))
    }

    /// Send `count` invalidations round-robin over every registered object
    pub fn invalidate_registered(&mut self, count: usize) -> Vec<ServerToClientMessage> {
        let targets: Vec<(Vec<u8>, ObjectId, RegistrationSummary)> = self
            .sessions
            .iter()
            .flat_map(|(token, session)| {
                session
                    .registered
                    .iter()
                    .map(move |object| (token.clone(), object.clone(), session.summary.clone()))
            })
            .collect();
        if targets.is_empty() {
            return Vec::new();
        }

        let mut messages = Vec::with_capacity(count);
        for (token, object_id, summary) in targets.into_iter().cycle().take(count) {
            self.server_time_ms += 1;
            self.next_version += 1;
            let invalidation = Invalidation::new(object_id, self.next_version)
                .with_payload(format!("version {}", self.next_version));
            let mut message = self.reply_to(token, Some(summary));
            message.invalidations = Some(vec![invalidation]);
            messages.push(message);
        }
        messages
    }

    /// Total invalidation acks received
    pub fn acknowledged(&self) -> usize {
        self.acknowledged
    }

    pub fn registered_count(&self) -> usize {
        self.sessions.values().map(|session| session.registered.len()).sum()
    }

    fn reply_to(&self, addressee: Vec<u8>, summary: Option<RegistrationSummary>) -> ServerToClientMessage {
        ServerToClientMessage {
            header: ServerHeader {
                protocol_version: PROTOCOL_VERSION,
                client_token: addressee,
                registration_summary: summary,
                server_time_ms: self.server_time_ms,
                message_id: None,
            },
            token_control: None,
            invalidations: None,
            registration_statuses: None,
            registration_sync_request: false,
            info_request: None,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ticl_core::protocol::wire::{ClientHeader, InitializeMessage, Registration, RegistrationSubtree};
    use ticl_core::{ApplicationClientId, Nonce};

    fn client_message(token: Option<&ClientToken>) -> ClientToServerMessage {
        ClientToServerMessage {
            header: ClientHeader {
                protocol_version: PROTOCOL_VERSION,
                client_token: token.cloned(),
                registration_summary: RegistrationSummary {
                    num_registrations: 1,
                    registration_digest: vec![7; 4],
                },
                client_time_ms: 10,
                max_known_server_time_ms: 0,
                message_id: "1".to_string(),
            },
            initialize: None,
            registrations: None,
            registration_sync: None,
            invalidation_acks: None,
            info: None,
        }
    }

    fn exchange(server: &mut LoopbackServer, message: &ClientToServerMessage) -> ServerToClientMessage {
        server
            .handle_message(&message.to_binary().unwrap())
            .unwrap()
            .expect("server reply")
    }

    fn acquire(server: &mut LoopbackServer) -> ClientToken {
        let mut message = client_message(None);
        message.initialize = Some(InitializeMessage {
            client_type: 4,
            nonce: Nonce::new(b"1234".to_vec()),
            application_client_id: ApplicationClientId::new(4, b"app".to_vec()),
        });
        let reply = exchange(server, &message);
        assert_eq!(reply.header.client_token, b"1234".to_vec());
        assert_eq!(reply.header.registration_summary, Some(RegistrationSummary::default()));
        reply.token_control.unwrap().new_token.unwrap()
    }

    #[test]
    fn test_issues_distinct_tokens() {
        let mut server = LoopbackServer::new();
        assert_ne!(acquire(&mut server), acquire(&mut server));
    }

    #[test]
    fn test_registrations_are_acked_with_summary() {
        let mut server = LoopbackServer::new();
        let token = acquire(&mut server);
        let object = ObjectId::new(4, "a");

        let mut message = client_message(Some(&token));
        message.registrations = Some(vec![Registration {
            object_id: object.clone(),
            op: RegistrationOp::Register,
        }]);
        let reply = exchange(&mut server, &message);

        assert_eq!(reply.header.client_token, token.as_bytes().to_vec());
        assert_eq!(
            reply.header.registration_summary,
            Some(message.header.registration_summary.clone())
        );
        let statuses = reply.registration_statuses.unwrap();
        assert_eq!(statuses.len(), 1);
        assert!(statuses[0].status.is_success());
        assert_eq!(server.registered_count(), 1);

        message.registrations = Some(vec![Registration {
            object_id: object,
            op: RegistrationOp::Unregister,
        }]);
        exchange(&mut server, &message);
        assert_eq!(server.registered_count(), 0);
    }

    #[test]
    fn test_count_mismatch_requests_sync() {
        let mut server = LoopbackServer::new();
        let token = acquire(&mut server);

        // The client claims one registration the server never saw
        let reply = exchange(&mut server, &client_message(Some(&token)));
        assert!(reply.registration_sync_request);
        assert_eq!(reply.header.registration_summary.unwrap().num_registrations, 0);

        let mut message = client_message(Some(&token));
        message.registration_sync = Some(vec![RegistrationSubtree {
            registered_objects: vec![ObjectId::new(4, "a")],
        }]);
        let reply = exchange(&mut server, &message);
        assert!(!reply.registration_sync_request);
        assert_eq!(server.registered_count(), 1);
    }

    #[test]
    fn test_unknown_token_is_destroyed() {
        let mut server = LoopbackServer::new();
        let stale = ClientToken::new(b"stale".to_vec());
        let reply = exchange(&mut server, &client_message(Some(&stale)));
        assert_eq!(reply.token_control, Some(TokenControlMessage { new_token: None }));
    }

    #[test]
    fn test_invalidations_cycle_over_registered_objects() {
        let mut server = LoopbackServer::new();
        assert!(server.invalidate_registered(3).is_empty());

        let token = acquire(&mut server);
        let mut message = client_message(Some(&token));
        message.registrations = Some(
            ["a", "b"]
                .iter()
                .map(|name| Registration {
                    object_id: ObjectId::new(4, *name),
                    op: RegistrationOp::Register,
                })
                .collect(),
        );
        exchange(&mut server, &message);

        let sent = server.invalidate_registered(3);
        let invalidations: Vec<Invalidation> = sent
            .iter()
            .flat_map(|message| message.invalidations.clone().unwrap())
            .collect();
        assert_eq!(invalidations.len(), 3);
        assert_eq!(invalidations[0].object_id, ObjectId::new(4, "a"));
        assert_eq!(invalidations[1].object_id, ObjectId::new(4, "b"));
        assert_eq!(invalidations[2].object_id, ObjectId::new(4, "a"));
        assert!(invalidations.windows(2).all(|pair| pair[0].version < pair[1].version));
        assert!(sent.windows(2).all(|pair| pair[0].header.server_time_ms < pair[1].header.server_time_ms));
    }

    #[test]
    fn test_counts_acks_and_rejects_other_versions() {
        let mut server = LoopbackServer::new();
        let token = acquire(&mut server);

        let mut message = client_message(Some(&token));
        message.invalidation_acks = Some(vec![Invalidation::new(ObjectId::new(4, "a"), 1)]);
        exchange(&mut server, &message);
        assert_eq!(server.acknowledged(), 1);

        message.header.protocol_version.major += 1;
        let reply = server.handle_message(&message.to_binary().unwrap()).unwrap();
        assert!(reply.is_none());
        assert_eq!(server.acknowledged(), 1);
    }
}
