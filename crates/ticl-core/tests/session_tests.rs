//! End-to-end tests of the session state machine over the simulation harness

use std::time::Duration;

use ticl_core::persistence::deserialize_state;
use ticl_core::protocol::wire::{AckHandlePayload, ClientToServerMessage, Status, StatusCode};
use ticl_core::protocol::InfoType;
use ticl_core::registration::RegistrationManager;
use ticl_core::statistics::{ClientErrorType, IncomingOperationType, ListenerEventType, ReceivedMessageType};
use ticl_core::testing::{ListenerCall, RecordingListener, ServerMessageBuilder, SimulatedEnvironment};
use ticl_core::{
    AckHandle, ClientConfig, ClientEvent, ErrorInfo, ErrorReason, Invalidation, InvalidationClient, ObjectId,
    RegistrationOp, RegistrationState, RunState, StorageError, TaskName, TiclError,
};

type Client = InvalidationClient<RecordingListener>;

const TOKEN: &[u8] = b"token-1";

fn test_config() -> ClientConfig {
    ClientConfig {
        smear_percent: 0,
        ..ClientConfig::for_test()
    }
}

fn new_client(env: &SimulatedEnvironment) -> Client {
    env.client_builder()
        .with_config(test_config())
        .build(RecordingListener::new())
        .unwrap()
}

/// Start a fresh client, flush its token request and answer it
fn started_client(env: &SimulatedEnvironment) -> Client {
    let mut client = new_client(env);
    client.start().unwrap();
    env.run_until_idle(&mut client).unwrap();
    env.advance(&mut client, Duration::from_millis(100)).unwrap();

    let nonce = client.nonce().cloned().unwrap();
    let reply = ServerMessageBuilder::new(nonce.as_bytes().to_vec())
        .new_token(TOKEN.to_vec())
        .encode();
    assert!(env.deliver_message(reply));
    env.run_until_idle(&mut client).unwrap();
    assert!(client.is_started());
    client
}

fn object(name: &str) -> ObjectId {
    ObjectId::new(4, name)
}

fn from_server() -> ServerMessageBuilder {
    ServerMessageBuilder::new(TOKEN.to_vec())
}

// ----------------------------------------------------------------------------
// Startup
// ----------------------------------------------------------------------------

#[test]
fn test_fresh_start_acquires_token() {
    let env = SimulatedEnvironment::new();
    let mut client = new_client(&env);

    client.start().unwrap();
    assert!(client.nonce().is_some());
    env.run_until_idle(&mut client).unwrap();

    // Token request ran immediately and is queued for the batcher
    assert_eq!(client.run_state(), RunState::NotStarted);
    assert!(client.client_token().is_none());
    assert!(client.tasks().is_scheduled(TaskName::AcquireToken));
    assert!(client.tasks().is_scheduled(TaskName::Batching));
    assert!(client.listener().calls.is_empty());

    env.advance(&mut client, Duration::from_millis(100)).unwrap();
    let sent = env.take_sent_messages();
    assert_eq!(sent.len(), 1);
    let initialize = sent[0].initialize.clone().unwrap();
    assert_eq!(Some(&initialize.nonce), client.nonce());
    assert!(sent[0].header.client_token.is_none());

    let reply = ServerMessageBuilder::new(initialize.nonce.as_bytes().to_vec())
        .new_token(TOKEN.to_vec())
        .encode();
    env.deliver_message(reply);
    env.run_until_idle(&mut client).unwrap();

    assert_eq!(client.run_state(), RunState::Started);
    assert_eq!(client.client_token().unwrap().as_bytes(), TOKEN);
    assert!(client.nonce().is_none());
    assert_eq!(
        client.listener().calls,
        vec![ListenerCall::Ready, ListenerCall::ReissueRegistrations(vec![], 0)]
    );
    assert!(client.should_send_registrations());

    // The new token is written out right away
    let stored = env.storage_value("ClientToken").unwrap();
    assert_eq!(deserialize_state(&stored).unwrap().client_token.as_bytes(), TOKEN);
    assert!(client.tasks().is_scheduled(TaskName::Heartbeat));
}

#[test]
fn test_unanswered_token_request_is_retried() {
    let env = SimulatedEnvironment::new();
    let mut client = new_client(&env);
    client.start().unwrap();
    env.advance(&mut client, Duration::from_millis(100)).unwrap();
    assert_eq!(env.take_sent_messages().len(), 1);

    // Network timeout plus the first backoff step
    env.advance(&mut client, Duration::from_secs(5)).unwrap();
    let retries = env.take_sent_messages();
    assert_eq!(retries.len(), 1);
    assert!(retries[0].initialize.is_some());
    assert!(client.client_token().is_none());
}

#[test]
fn test_start_preconditions() {
    let env = SimulatedEnvironment::new();
    let mut client = new_client(&env);

    env.resources().stop();
    assert!(matches!(client.start(), Err(TiclError::ResourcesNotStarted)));
    env.resources().start();

    client.start().unwrap();
    assert!(matches!(client.start(), Err(TiclError::AlreadyStarted)));
}

#[test]
fn test_calls_off_internal_thread_are_fatal() {
    let env = SimulatedEnvironment::new();
    let mut client = started_client(&env);

    env.set_on_internal_thread(false);
    let err = client.register(object("a")).unwrap_err();
    assert!(matches!(err, TiclError::Precondition { .. }));
    assert!(err.is_fatal());
    assert!(client.registration_manager().is_empty());
}

#[test]
fn test_restart_from_persisted_token() {
    let env = SimulatedEnvironment::new();
    {
        let _first = started_client(&env);
    }
    let persisted = env.storage_value("ClientToken").unwrap();

    let env = SimulatedEnvironment::new();
    env.set_storage_value("ClientToken", persisted);
    let mut client = new_client(&env);
    client.start().unwrap();
    env.run_until_idle(&mut client).unwrap();

    assert!(client.is_started());
    assert_eq!(client.client_token().unwrap().as_bytes(), TOKEN);
    assert!(client.nonce().is_none());
    assert!(!client.should_send_registrations());
    assert!(!client.tasks().is_scheduled(TaskName::AcquireToken));
    assert_eq!(
        env.next_firing(TaskName::InitialPersistentHeartbeat),
        Some(env.now() + test_config().initial_persistent_heartbeat_delay())
    );

    // The one-off heartbeat asks for the server's registration summary
    env.advance(&mut client, Duration::from_millis(2_100)).unwrap();
    let sent = env.take_sent_messages();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].info.as_ref().unwrap().server_registration_summary_requested);
    assert_eq!(sent[0].header.client_token.as_ref().unwrap().as_bytes(), TOKEN);
    assert!(!client.tasks().is_scheduled(TaskName::InitialPersistentHeartbeat));
}

#[test]
fn test_corrupt_persisted_state_falls_back_to_token_request() {
    let env = SimulatedEnvironment::new();
    env.set_storage_value("ClientToken", b"not a state".to_vec());
    let mut client = new_client(&env);
    client.start().unwrap();
    env.run_until_idle(&mut client).unwrap();

    assert_eq!(client.statistics().errors(ClientErrorType::PersistentDeserializationFailure), 1);
    assert!(client.client_token().is_none());
    assert!(client.tasks().is_scheduled(TaskName::AcquireToken));
}

#[test]
fn test_failed_read_is_counted() {
    let env = SimulatedEnvironment::new();
    env.fail_reads(Some(StorageError::Unavailable));
    let mut client = new_client(&env);
    client.start().unwrap();
    env.run_until_idle(&mut client).unwrap();

    assert_eq!(client.statistics().errors(ClientErrorType::PersistentReadFailure), 1);
    assert!(client.nonce().is_some());
}

// ----------------------------------------------------------------------------
// Registrations
// ----------------------------------------------------------------------------

#[test]
fn test_register_before_start_is_rejected() {
    let env = SimulatedEnvironment::new();
    let mut client = new_client(&env);

    assert!(matches!(client.register(object("a")), Err(TiclError::NotStarted)));
    assert!(client.listener().calls.is_empty());
    assert!(client.registration_manager().is_empty());
    assert!(env.pending_timers().is_empty());
}

#[test]
fn test_register_reports_and_sends() {
    let env = SimulatedEnvironment::new();
    let mut client = started_client(&env);
    client.listener_mut().take();
    env.take_sent_messages();

    client.register_all(&[object("a"), object("b")]).unwrap();
    assert_eq!(
        client.listener().calls,
        vec![
            ListenerCall::RegistrationStatus(object("a"), RegistrationState::Registered),
            ListenerCall::RegistrationStatus(object("b"), RegistrationState::Registered),
        ]
    );
    assert_eq!(client.statistics().incoming_operations(IncomingOperationType::Registration), 2);
    assert_eq!(client.registration_manager().len(), 2);

    env.advance(&mut client, Duration::from_millis(100)).unwrap();
    let sent = env.take_sent_messages();
    assert_eq!(sent.len(), 1);
    let registrations = sent[0].registrations.clone().unwrap();
    assert_eq!(registrations.len(), 2);
    assert!(registrations.iter().all(|r| r.op == RegistrationOp::Register));
    assert_eq!(sent[0].header.registration_summary.num_registrations, 2);
}

#[test]
fn test_empty_object_set_is_rejected() {
    let env = SimulatedEnvironment::new();
    let mut client = started_client(&env);
    assert!(matches!(client.register_all(&[]), Err(TiclError::EmptyObjectSet)));
    assert!(matches!(client.unregister_all(&[]), Err(TiclError::EmptyObjectSet)));
}

#[test]
fn test_register_after_stop_is_dropped() {
    let env = SimulatedEnvironment::new();
    let mut client = started_client(&env);
    client.listener_mut().take();

    client.stop().unwrap();
    assert_eq!(client.run_state(), RunState::Stopped);
    client.register(object("a")).unwrap();
    assert!(client.listener().calls.is_empty());
    assert!(client.registration_manager().is_empty());

    // Stopped is final
    assert!(matches!(client.start(), Err(TiclError::AlreadyStarted)));
    assert_eq!(client.run_state(), RunState::Stopped);
}

#[test]
fn test_registration_sync_heartbeat_is_armed_once() {
    let env = SimulatedEnvironment::new();
    let mut client = started_client(&env);

    client.register(object("a")).unwrap();
    client.register(object("b")).unwrap();
    let armed = env
        .pending_timers()
        .into_iter()
        .filter(|(_, name)| *name == TaskName::RegSyncHeartbeat)
        .count();
    assert_eq!(armed, 1);
}

#[test]
fn test_registrations_held_until_server_summary_after_restart() {
    let env = SimulatedEnvironment::new();
    {
        let _first = started_client(&env);
    }
    let persisted = env.storage_value("ClientToken").unwrap();
    let env = SimulatedEnvironment::new();
    env.set_storage_value("ClientToken", persisted);
    let mut client = new_client(&env);
    client.start().unwrap();
    env.run_until_idle(&mut client).unwrap();

    client.register(object("a")).unwrap();
    assert!(!client.protocol_handler().has_pending());

    let summary = client.registration_manager().registration_summary();
    env.deliver_message(from_server().summary(summary).encode());
    env.run_until_idle(&mut client).unwrap();
    assert!(client.should_send_registrations());
    assert!(client.registration_manager().is_state_in_sync_with_server());
}

#[test]
fn test_failed_registration_status_is_reported() {
    let env = SimulatedEnvironment::new();
    let mut client = started_client(&env);
    client.register_all(&[object("a"), object("b")]).unwrap();
    client.listener_mut().take();

    let reply = from_server()
        .registration_status(object("a"), RegistrationOp::Register, Status::success())
        .registration_status(
            object("b"),
            RegistrationOp::Register,
            Status::failure(StatusCode::PermanentFailure, "quota exceeded"),
        )
        .encode();
    env.deliver_message(reply);
    env.run_until_idle(&mut client).unwrap();

    assert_eq!(
        client.listener().registration_failures(),
        vec![(object("b"), false, "quota exceeded".to_string())]
    );
    assert!(client.registration_manager().contains(&object("a")));
    assert!(!client.registration_manager().contains(&object("b")));
}

#[test]
fn test_registration_discrepancy_is_reported() {
    let env = SimulatedEnvironment::new();
    let mut client = started_client(&env);
    client.listener_mut().take();

    // The server says registered; the application never asked
    let reply = from_server()
        .registration_status(object("ghost"), RegistrationOp::Register, Status::success())
        .encode();
    env.deliver_message(reply);
    env.run_until_idle(&mut client).unwrap();

    assert_eq!(
        client.listener().registration_failures(),
        vec![(object("ghost"), true, "Registration discrepancy detected".to_string())]
    );
    assert_eq!(client.statistics().errors(ClientErrorType::RegistrationDiscrepancy), 1);
}

#[test]
fn test_auth_failure_drops_all_registrations() {
    let env = SimulatedEnvironment::new();
    let mut client = started_client(&env);
    client.register_all(&[object("a"), object("b")]).unwrap();
    client.listener_mut().take();

    env.deliver_message(from_server().error(ErrorReason::AuthFailure, "bad credentials").encode());
    env.run_until_idle(&mut client).unwrap();

    let calls = client.listener().calls.clone();
    assert_eq!(
        calls[0],
        ListenerCall::Error(ErrorInfo {
            reason: ErrorReason::AuthFailure,
            is_transient: false,
            message: "bad credentials".to_string(),
        })
    );
    let mut failures = client.listener().registration_failures();
    failures.sort();
    assert_eq!(
        failures,
        vec![
            (object("a"), false, "Auth error: bad credentials".to_string()),
            (object("b"), false, "Auth error: bad credentials".to_string()),
        ]
    );
    assert!(client.registration_manager().is_empty());
    assert_eq!(client.statistics().received_messages(ReceivedMessageType::Error), 1);
}

#[test]
fn test_unknown_error_keeps_registrations() {
    let env = SimulatedEnvironment::new();
    let mut client = started_client(&env);
    client.register(object("a")).unwrap();
    client.listener_mut().take();

    env.deliver_message(from_server().error(ErrorReason::UnknownFailure, "oops").encode());
    env.run_until_idle(&mut client).unwrap();

    assert_eq!(client.listener().calls.len(), 1);
    assert!(client.registration_manager().contains(&object("a")));
}

// ----------------------------------------------------------------------------
// Server Messages
// ----------------------------------------------------------------------------

#[test]
fn test_token_mismatch_is_dropped() {
    let env = SimulatedEnvironment::new();
    let mut client = started_client(&env);
    client.listener_mut().take();

    let reply = ServerMessageBuilder::new(b"someone-else".to_vec())
        .invalidation(Invalidation::new(object("a"), 3))
        .encode();
    env.deliver_message(reply);
    env.run_until_idle(&mut client).unwrap();

    assert_eq!(client.statistics().errors(ClientErrorType::TokenMismatch), 1);
    assert!(client.listener().calls.is_empty());
}

#[test]
fn test_nonce_mismatch_is_dropped() {
    let env = SimulatedEnvironment::new();
    let mut client = new_client(&env);
    client.start().unwrap();
    env.run_until_idle(&mut client).unwrap();

    let reply = ServerMessageBuilder::new(b"stale-nonce".to_vec())
        .new_token(TOKEN.to_vec())
        .encode();
    env.deliver_message(reply);
    env.run_until_idle(&mut client).unwrap();

    assert_eq!(client.statistics().errors(ClientErrorType::NonceMismatch), 1);
    assert!(client.client_token().is_none());
    assert!(client.nonce().is_some());
}

#[test]
fn test_token_destroyed_by_server() {
    let env = SimulatedEnvironment::new();
    let mut client = started_client(&env);
    env.take_sent_messages();

    env.deliver_message(from_server().destroy_token().encode());
    env.run_until_idle(&mut client).unwrap();

    // Exactly one of token and nonce is held; the run state never goes back
    assert!(client.client_token().is_none());
    assert!(client.nonce().is_some());
    assert_eq!(client.run_state(), RunState::Started);

    // The token request still pending from startup carries the new nonce
    assert!(client.tasks().is_scheduled(TaskName::AcquireToken));
    env.advance(&mut client, Duration::from_secs(5)).unwrap();
    let sent = env.take_sent_messages();
    assert!(sent.iter().any(|message| message.initialize.is_some()));

    // A second token does not fire ready again
    let nonce = client.nonce().cloned().unwrap();
    env.deliver_message(
        ServerMessageBuilder::new(nonce.as_bytes().to_vec())
            .new_token(b"token-2".to_vec())
            .encode(),
    );
    env.run_until_idle(&mut client).unwrap();
    assert_eq!(client.client_token().unwrap().as_bytes(), b"token-2");
    assert_eq!(client.listener().ready_count(), 1);
}

#[test]
fn test_invalidations_reach_listener() {
    let env = SimulatedEnvironment::new();
    let mut client = started_client(&env);
    client.listener_mut().take();

    let reply = from_server()
        .invalidation(Invalidation::new(object("a"), 7).with_payload(b"payload".to_vec()))
        .invalidation(Invalidation::new(object("b"), 0).unknown_version())
        .invalidation(Invalidation::new(ObjectId::all_objects(), 0))
        .encode();
    env.deliver_message(reply);
    env.run_until_idle(&mut client).unwrap();

    let calls = client.listener().calls.clone();
    assert_eq!(calls.len(), 3);
    assert!(matches!(&calls[0], ListenerCall::Invalidate(inv, _) if inv.version == 7 && inv.payload.is_some()));
    assert!(matches!(&calls[1], ListenerCall::InvalidateUnknownVersion(id, _) if *id == object("b")));
    assert!(matches!(&calls[2], ListenerCall::InvalidateAll(_)));
    assert_eq!(client.statistics().listener_events(ListenerEventType::Invalidate), 1);
    assert_eq!(client.statistics().received_messages(ReceivedMessageType::Invalidation), 1);
}

#[test]
fn test_acknowledge_sends_ack_without_payload() {
    let env = SimulatedEnvironment::new();
    let mut client = started_client(&env);
    env.take_sent_messages();

    let invalidation = Invalidation::new(object("a"), 7).with_payload(b"payload".to_vec());
    env.deliver_message(from_server().invalidation(invalidation.clone()).encode());
    env.run_until_idle(&mut client).unwrap();

    let handle = client.listener().ack_handles().remove(0);
    client.acknowledge(&handle).unwrap();
    assert_eq!(client.statistics().incoming_operations(IncomingOperationType::Acknowledge), 1);

    env.advance(&mut client, Duration::from_millis(100)).unwrap();
    let sent = env.take_sent_messages();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].invalidation_acks, Some(vec![invalidation.without_payload()]));
}

#[test]
fn test_malformed_ack_handle_is_counted() {
    let env = SimulatedEnvironment::new();
    let mut client = started_client(&env);

    client.acknowledge(&AckHandle::new(b"junk".to_vec())).unwrap();
    assert_eq!(client.statistics().errors(ClientErrorType::AcknowledgeHandleFailure), 1);
    assert!(!client.protocol_handler().has_pending());
}

#[test]
fn test_info_request_sends_counters() {
    let env = SimulatedEnvironment::new();
    let mut client = started_client(&env);
    env.take_sent_messages();

    env.deliver_message(
        from_server()
            .info_request(vec![InfoType::GetPerformanceCounters])
            .encode(),
    );
    env.run_until_idle(&mut client).unwrap();
    env.advance(&mut client, Duration::from_millis(100)).unwrap();

    let sent = env.take_sent_messages();
    let info = sent[0].info.clone().unwrap();
    assert!(!info.performance_counters.is_empty());
    assert!(info
        .config_parameters
        .iter()
        .any(|(name, value)| name == "heartbeat_interval_ms" && *value == 5_000));
}

#[test]
fn test_registration_sync_request_sends_subtree() {
    let env = SimulatedEnvironment::new();
    let mut client = started_client(&env);
    client.register_all(&[object("a"), object("b")]).unwrap();
    env.advance(&mut client, Duration::from_millis(100)).unwrap();
    env.take_sent_messages();

    env.deliver_message(from_server().sync_request().encode());
    env.run_until_idle(&mut client).unwrap();
    env.advance(&mut client, Duration::from_millis(100)).unwrap();

    let sent = env.take_sent_messages();
    let subtrees = sent[0].registration_sync.clone().unwrap();
    assert_eq!(subtrees.len(), 1);
    assert_eq!(subtrees[0].registered_objects.len(), 2);
}

// ----------------------------------------------------------------------------
// Heartbeats and Network Status
// ----------------------------------------------------------------------------

#[test]
fn test_heartbeat_repeats() {
    let env = SimulatedEnvironment::new();
    let mut client = started_client(&env);
    env.take_sent_messages();

    env.advance(&mut client, Duration::from_millis(5_100)).unwrap();
    assert!(env.take_sent_messages().iter().any(|m| m.info.is_some()));
    assert!(client.tasks().is_scheduled(TaskName::Heartbeat));

    env.advance(&mut client, Duration::from_millis(5_100)).unwrap();
    assert!(env.take_sent_messages().iter().any(|m| m.info.is_some()));
}

#[test]
fn test_coming_online_after_silence_sends_heartbeat() {
    let env = SimulatedEnvironment::new();
    let mut client = started_client(&env);

    client.handle_event(ClientEvent::OnlineStatusChanged(false)).unwrap();
    assert!(!client.is_online());
    client.handle_event(ClientEvent::OnlineStatusChanged(true)).unwrap();
    assert!(!client.protocol_handler().has_pending());

    client.handle_event(ClientEvent::OnlineStatusChanged(false)).unwrap();
    env.advance_clock(Duration::from_secs(61));
    client.handle_event(ClientEvent::OnlineStatusChanged(true)).unwrap();
    assert!(client.is_online());
    assert!(client.protocol_handler().has_pending());
}

#[test]
fn test_firing_without_pending_run_is_ignored() {
    let env = SimulatedEnvironment::new();
    let mut client = started_client(&env);
    let before = client.marshal();

    client.handle_event(ClientEvent::TaskFired(TaskName::Batching)).unwrap();
    assert_eq!(client.marshal(), before);
}

// ----------------------------------------------------------------------------
// Persistence
// ----------------------------------------------------------------------------

#[test]
fn test_failed_write_is_retried() {
    let env = SimulatedEnvironment::new();
    env.fail_writes(Some(StorageError::Io {
        reason: "disk full".into(),
    }));
    let mut client = started_client(&env);

    assert_eq!(client.statistics().errors(ClientErrorType::PersistentWriteFailure), 1);
    assert!(env.storage_value("ClientToken").is_none());

    env.fail_writes(None);
    env.advance(&mut client, Duration::from_secs(3)).unwrap();
    let stored = env.storage_value("ClientToken").unwrap();
    assert_eq!(deserialize_state(&stored).unwrap().client_token.as_bytes(), TOKEN);
    assert_eq!(client.statistics().errors(ClientErrorType::PersistentWriteFailure), 1);
}

#[test]
fn test_offline_delivery_persists_send_time() {
    let env = SimulatedEnvironment::new();
    let config = ClientConfig {
        channel_supports_offline_delivery: true,
        ..test_config()
    };
    let mut client = env
        .client_builder()
        .with_config(config)
        .build(RecordingListener::new())
        .unwrap();
    client.start().unwrap();
    env.advance(&mut client, Duration::from_millis(100)).unwrap();
    let nonce = client.nonce().cloned().unwrap();
    env.deliver_message(
        ServerMessageBuilder::new(nonce.as_bytes().to_vec())
            .new_token(TOKEN.to_vec())
            .encode(),
    );
    env.run_until_idle(&mut client).unwrap();

    env.advance(&mut client, Duration::from_millis(5_200)).unwrap();
    env.advance(&mut client, Duration::from_secs(2)).unwrap();
    let stored = deserialize_state(&env.storage_value("ClientToken").unwrap()).unwrap();
    assert_eq!(
        stored.last_message_send_time_ms,
        client.last_message_send_time().as_millis()
    );
}

// ----------------------------------------------------------------------------
// Marshalling
// ----------------------------------------------------------------------------

#[test]
fn test_marshalled_client_resumes() {
    let env = SimulatedEnvironment::new();
    let mut client = started_client(&env);
    client.register_all(&[object("a"), object("b")]).unwrap();
    env.take_sent_messages();

    // Marshalled while the registrations still wait in the batch
    let state = client.marshal();
    assert!(client.tasks().is_scheduled(TaskName::Batching));
    let bytes = state.encode().unwrap();

    // Same wall clock in the new process
    let resumed_env = SimulatedEnvironment::new();
    resumed_env.advance_clock(Duration::from_millis(env.now() - resumed_env.now()));
    let mut resumed = resumed_env
        .client_builder()
        .with_config(test_config())
        .with_state(ticl_core::ClientState::decode(&bytes).unwrap())
        .build(RecordingListener::new())
        .unwrap();

    assert_eq!(resumed.client_token().unwrap().as_bytes(), TOKEN);
    assert_eq!(resumed.run_state(), RunState::Started);
    assert!(resumed.registration_manager().contains(&object("a")));
    assert!(resumed.registration_manager().contains(&object("b")));
    assert_eq!(resumed.statistics(), client.statistics());

    let resumed_state = resumed.marshal();
    assert_eq!(resumed_state.registration_manager, state.registration_manager);
    assert_eq!(resumed_state.protocol_handler, state.protocol_handler);
    assert_eq!(resumed_state.statistics, state.statistics);

    for name in TaskName::ALL {
        assert_eq!(
            resumed.tasks().is_scheduled(name),
            client.tasks().is_scheduled(name),
            "{name}"
        );
        assert_eq!(resumed_env.next_firing(name), env.next_firing(name), "{name}");
    }

    env.advance(&mut client, Duration::from_millis(100)).unwrap();
    resumed_env.advance(&mut resumed, Duration::from_millis(100)).unwrap();
    let registrations = |messages: Vec<ClientToServerMessage>| -> Vec<_> {
        messages.into_iter().map(|message| message.registrations).collect()
    };
    let sent = registrations(env.take_sent_messages());
    assert!(sent.iter().any(|batch| batch.as_ref().map(Vec::len) == Some(2)));
    assert_eq!(registrations(resumed_env.take_sent_messages()), sent);
}

#[test]
fn test_ack_before_start_is_queued_then_dropped_without_token() {
    let env = SimulatedEnvironment::new();
    let mut client = new_client(&env);
    let handle = AckHandlePayload::for_invalidation(&Invalidation::new(object("a"), 2))
        .to_handle()
        .unwrap();

    client.acknowledge(&handle).unwrap();
    assert!(client.protocol_handler().has_pending());
    assert_eq!(
        client.statistics().incoming_operations(IncomingOperationType::Acknowledge),
        1
    );

    env.advance(&mut client, Duration::from_millis(100)).unwrap();
    assert!(env.sent_messages().is_empty());
    assert_eq!(client.statistics().errors(ClientErrorType::TokenMissingFailure), 1);
}
