#[cfg(test)]
mod support {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use lumen_common::config::{CreditConfig, SessionConfig};

    use crate::session::{detached_factory, ClientSession};
    use crate::testing::MockRemote;

    /// Producer windows are unbounded unless a test is about credits.
    pub fn config() -> SessionConfig {
        SessionConfig {
            producer_window_size: -1,
            ..SessionConfig::default()
        }
    }

    pub fn session_with(config: SessionConfig) -> (Arc<ClientSession>, Arc<MockRemote>) {
        session_with_credits(config, CreditConfig::default())
    }

    pub fn session_with_credits(
        config: SessionConfig,
        credits: CreditConfig,
    ) -> (Arc<ClientSession>, Arc<MockRemote>) {
        let remote = Arc::new(MockRemote::new());
        let session = ClientSession::new(
            "test-session",
            None,
            None,
            config,
            &credits,
            remote.clone(),
            detached_factory(),
        )
        .unwrap();
        (session, remote)
    }

    pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }
}

#[cfg(test)]
mod session_tests {
    use lumen_common::config::SessionConfig;
    use lumen_common::error::{ErrorKind, TransportErrorKind};

    use super::support::{config, session_with};
    use crate::message::ClientMessage;

    #[test]
    fn test_operations_after_close_fail_with_session_closed() {
        let (session, remote) = session_with(config());
        let consumer = session.create_consumer("q").unwrap();
        let producer = session.create_producer(Some("orders")).unwrap();

        session.close();
        assert!(session.is_closed());
        assert!(consumer.is_closed());
        assert!(producer.is_closed());
        assert_eq!(remote.count("close_consumer"), 1);
        assert_eq!(remote.count("session_close"), 1);
        assert_eq!(remote.count("cleanup"), 1);

        let err = session.create_consumer("q").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionClosed);
        assert_eq!(session.commit().unwrap_err().kind(), ErrorKind::SessionClosed);
        assert_eq!(session.start().unwrap_err().kind(), ErrorKind::SessionClosed);
        let err = producer.send(ClientMessage::new(false)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionClosed);

        remote.clear_calls();
        let closed = |r: lumen_common::error::LumenResult<()>| {
            assert_eq!(r.unwrap_err().kind(), ErrorKind::SessionClosed);
        };
        closed(session.add_metadata("k", "v"));
        closed(session.rollback());
        closed(session.stop());
        closed(session.create_queue("orders", "q2", true));
        closed(session.create_temporary_queue("orders", "tmp", None));
        closed(session.create_shared_queue("orders", "shared", None, true));
        closed(session.delete_queue("q"));
        closed(session.create_producer(None).map(|_| ()));
        assert!(remote.calls().is_empty());
        assert!(session.metadata().is_empty());
    }

    #[test]
    fn test_failed_initial_credits_leave_no_consumer_behind() {
        let (session, remote) = session_with(config());
        remote.fail_next("consumer_credits", TransportErrorKind::Disconnected, 1);

        let err = session.create_consumer("q").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(session.consumer_count(), 0);

        remote.clear_calls();
        session.handle_failover(
            &crate::remote::ConnectionInfo::new(2, "mock://broker-2"),
            &lumen_common::error::TransportError::unblocked("failed over"),
        );
        assert_eq!(remote.count("recreate_consumer"), 0);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (session, remote) = session_with(config());
        session.close();
        session.close();
        assert_eq!(remote.count("session_close"), 1);
    }

    #[test]
    fn test_close_survives_broker_error() {
        let (session, remote) = session_with(config());
        remote.fail_next("session_close", TransportErrorKind::Disconnected, 1);
        session.close();
        assert!(session.is_closed());
        assert_eq!(remote.count("cleanup"), 1);
    }

    #[test]
    fn test_cleanup_closes_without_wire_traffic() {
        let (session, remote) = session_with(config());
        let consumer = session.create_consumer("q").unwrap();
        session.cleanup(false);

        assert!(session.is_closed());
        assert!(consumer.is_closed());
        assert_eq!(session.consumer_count(), 0);
        assert_eq!(remote.count("session_close"), 0);
        assert_eq!(remote.count("close_consumer"), 0);

        // Second cleanup is a no-op.
        session.cleanup(false);
        assert_eq!(remote.count("cleanup"), 1);
    }

    #[test]
    fn test_rollback_empties_consumer_buffers() {
        let (session, remote) = session_with(SessionConfig::transacted());
        let consumer = session.create_consumer("q").unwrap();
        session.start().unwrap();
        for i in 1..=3 {
            session.handle_receive_message(consumer.id(), ClientMessage::delivered(i, b"x".to_vec()));
        }
        assert_eq!(consumer.buffered(), 3);

        remote.clear_calls();
        session.rollback().unwrap();

        assert_eq!(consumer.buffered(), 0);
        assert!(session.is_started());
        let calls = remote.calls();
        let stop = calls.iter().position(|c| c == "session_stop").unwrap();
        let rollback = calls.iter().position(|c| c == "rollback:false").unwrap();
        let start = calls.iter().position(|c| c == "session_start").unwrap();
        assert!(stop < rollback && rollback < start);
    }

    #[test]
    fn test_commit_on_rollback_only_session_rolls_back() {
        let (session, remote) = session_with(SessionConfig::transacted());
        session.shared().set_rollback_only(true);

        let err = session.commit().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransactionRolledBack);
        assert_eq!(remote.count("commit"), 0);
        assert_eq!(remote.count("rollback"), 1);
        assert!(!session.is_rollback_only());

        // The session is usable again.
        session.commit().unwrap();
        assert_eq!(remote.count("commit"), 1);
    }

    #[test]
    fn test_commit_interrupted_by_failover_reports_unknown_outcome() {
        let (session, remote) = session_with(SessionConfig::transacted());
        remote.fail_next("commit", TransportErrorKind::Unblocked, 1);

        let err = session.commit().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransactionOutcomeUnknown);
        assert!(err.is_outcome_unknown());
        assert_eq!(remote.count("rollback"), 1);
    }

    #[test]
    fn test_commit_other_transport_error_propagates() {
        let (session, remote) = session_with(SessionConfig::transacted());
        remote.fail_next("commit", TransportErrorKind::Disconnected, 1);

        let err = session.commit().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(remote.count("rollback"), 0);
    }

    #[test]
    fn test_commit_flushes_pending_acks_first() {
        let (session, remote) = session_with(SessionConfig::transacted());
        let consumer = session.create_consumer("q").unwrap();
        let message = ClientMessage::delivered(7, b"x".to_vec());
        consumer.acknowledge(&message).unwrap();
        assert!(consumer.has_pending_ack());

        session.commit().unwrap();
        let calls = remote.calls();
        let ack = calls.iter().position(|c| c == "ack:false:1:7").unwrap();
        let commit = calls.iter().position(|c| c == "commit").unwrap();
        assert!(ack < commit);
        assert!(!session.is_work_done());
    }

    #[test]
    fn test_reset_if_needed_rolls_back_only_when_marked() {
        let (session, remote) = session_with(SessionConfig::transacted());
        session.reset_if_needed().unwrap();
        assert_eq!(remote.count("rollback"), 0);

        session.shared().set_rollback_only(true);
        session.reset_if_needed().unwrap();
        assert_eq!(remote.count("rollback"), 1);
        assert!(!session.is_rollback_only());
    }

    #[test]
    fn test_temporary_queue_is_never_durable() {
        let (session, remote) = session_with(config());
        session.create_temporary_queue("addr", "tmp", None).unwrap();
        session.create_queue("addr", "durable", true).unwrap();
        assert_eq!(
            remote.calls_of("create_queue"),
            vec!["create_queue:tmp:false:true", "create_queue:durable:true:false"]
        );
    }

    #[test]
    fn test_start_stop_toggle_once() {
        let (session, remote) = session_with(config());
        session.start().unwrap();
        session.start().unwrap();
        assert_eq!(remote.count("session_start"), 1);
        session.stop().unwrap();
        session.stop().unwrap();
        assert_eq!(remote.count("session_stop"), 1);
        assert!(!session.is_started());
    }

    #[test]
    fn test_create_message_uses_grown_packet_size() {
        let (session, _remote) = session_with(config());
        let initial = session.initial_message_packet_size();
        session.set_packet_size(initial * 2);
        assert!(session.initial_message_packet_size() >= initial * 2);
        let message = session.create_message(true);
        assert!(message.body.capacity() >= initial * 2);
    }
}

#[cfg(test)]
mod failover_tests {
    use lumen_common::config::{CreditConfig, SessionConfig};
    use lumen_common::error::{ErrorKind, TransportError, TransportErrorKind};

    use super::support::{config, session_with, session_with_credits};
    use crate::message::ClientMessage;
    use crate::remote::ConnectionInfo;
    use crate::session::FailoverOutcome;

    fn new_connection() -> ConnectionInfo {
        ConnectionInfo::new(2, "mock://broker-2")
    }

    fn unblocked() -> TransportError {
        TransportError::unblocked("connection failed over")
    }

    #[test]
    fn test_reattach_keeps_session_state() {
        let (session, remote) = session_with(SessionConfig {
            producer_window_size: -1,
            ..SessionConfig::transacted()
        });
        let consumer = session.create_consumer("q").unwrap();
        session.create_consumer("q2").unwrap();
        session.create_consumer("q3").unwrap();
        session.handle_receive_message(consumer.id(), ClientMessage::delivered(1, b"x".to_vec()));
        let producer = session.create_producer(Some("orders")).unwrap();
        producer.send(ClientMessage::new(true)).unwrap();
        remote.set_reattach(true);
        let ids_before = session.consumer_ids();

        let outcome = session.handle_failover(&new_connection(), &unblocked());

        assert_eq!(outcome, FailoverOutcome::Reattached);
        assert_eq!(session.consumer_ids(), ids_before);
        assert_eq!(ids_before.len(), 3);
        assert_eq!(remote.count("recreate_consumer"), 0);
        assert_eq!(consumer.buffered(), 1);
        assert!(!session.is_rollback_only());
        assert_eq!(remote.count("recreate_session"), 0);
        assert_eq!(remote.count("return_blocking"), 0);
        assert_eq!(remote.count("release_communications"), 1);
        assert_eq!(session.connection(), new_connection());
    }

    #[test]
    fn test_recreate_replays_consumers_in_creation_order() {
        let (session, remote) = session_with(config());
        let consumers: Vec<_> = ["q1", "q2", "q3"]
            .iter()
            .map(|q| session.create_consumer(q).unwrap())
            .collect();
        for c in &consumers {
            session.handle_receive_message(c.id(), ClientMessage::delivered(1, b"x".to_vec()));
        }
        remote.clear_calls();

        let outcome = session.handle_failover(&new_connection(), &unblocked());

        assert_eq!(outcome, FailoverOutcome::Recreated);
        assert_eq!(
            remote.calls_of("recreate_consumer"),
            vec!["recreate_consumer:1", "recreate_consumer:2", "recreate_consumer:3"]
        );
        let window = SessionConfig::default().consumer_window_size;
        let calls = remote.calls();
        for id in 1..=3 {
            let recreate = calls
                .iter()
                .position(|c| *c == format!("recreate_consumer:{}", id))
                .unwrap();
            assert_eq!(calls[recreate + 1], format!("consumer_credits:{}:{}", id, window));
        }
        assert!(consumers.iter().all(|c| c.buffered() == 0));
        assert_eq!(session.consumer_ids().len(), 3);
        assert_eq!(remote.calls_of("return_blocking"), vec!["return_blocking:UNBLOCKED"]);
        assert_eq!(remote.count("xa_failed"), 0);
        assert_eq!(remote.count("restart_session"), 0);
    }

    #[test]
    fn test_recreate_restarts_started_session() {
        let (session, remote) = session_with(config());
        session.create_consumer("q").unwrap();
        session.start().unwrap();

        let outcome = session.handle_failover(&new_connection(), &unblocked());

        assert_eq!(outcome, FailoverOutcome::Recreated);
        assert_eq!(remote.count("restart_session"), 1);
        assert!(session.is_started());
    }

    #[test]
    fn test_transacted_work_lost_in_failover_forces_rollback() {
        let (session, remote) = session_with(SessionConfig {
            producer_window_size: -1,
            ..SessionConfig::transacted()
        });
        let producer = session.create_producer(Some("orders")).unwrap();
        for _ in 0..3 {
            producer.send(ClientMessage::new(true)).unwrap();
        }
        assert!(session.is_work_done());

        let outcome = session.handle_failover(&new_connection(), &unblocked());
        assert_eq!(outcome, FailoverOutcome::Recreated);
        assert!(session.is_rollback_only());

        let err = session.commit().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransactionRolledBack);
        assert_eq!(remote.count("commit"), 0);
    }

    #[test]
    fn test_failover_without_work_keeps_transaction() {
        let (session, remote) = session_with(SessionConfig::transacted());
        session.handle_failover(&new_connection(), &unblocked());
        assert!(!session.is_rollback_only());
        session.commit().unwrap();
        assert_eq!(remote.count("commit"), 1);
    }

    #[test]
    fn test_failover_with_active_xid_marks_branch_failed() {
        let (session, remote) = session_with(SessionConfig::xa());
        let xa = session.xa_resource();
        let xid = lumen_common::types::Xid::generate();
        crate::xa::XaResource::start(&xa, &xid, lumen_common::types::TMNOFLAGS).unwrap();

        session.handle_failover(&new_connection(), &unblocked());

        assert_eq!(remote.count("xa_failed"), 1);
        assert!(session.is_rollback_only());
    }

    #[test]
    fn test_stop_signal_only_unblocks() {
        let (session, remote) = session_with(config());
        session.set_stop_signal();

        let outcome = session.handle_failover(&new_connection(), &unblocked());

        assert_eq!(outcome, FailoverOutcome::UnblockedOnly);
        assert_eq!(remote.count("recreate_session"), 0);
        assert_eq!(remote.count("return_blocking"), 1);
    }

    #[test]
    fn test_failover_after_close_is_skipped() {
        let (session, remote) = session_with(config());
        session.close();
        remote.clear_calls();

        let outcome = session.handle_failover(&new_connection(), &unblocked());

        assert_eq!(outcome, FailoverOutcome::Skipped);
        assert!(remote.calls().is_empty());
    }

    #[test]
    fn test_failed_recreate_still_releases_communications() {
        let (session, remote) = session_with(config());
        remote.fail_next("recreate_session", TransportErrorKind::Disconnected, 1);

        let outcome = session.handle_failover(&new_connection(), &unblocked());

        assert_eq!(outcome, FailoverOutcome::Failed);
        assert_eq!(remote.count("release_communications"), 1);
    }

    #[test]
    fn test_failover_resends_metadata() {
        let (session, remote) = session_with(config());
        session.add_metadata("client", "billing").unwrap();
        session.handle_failover(&new_connection(), &unblocked());
        assert_eq!(remote.calls_of("reset_metadata"), vec!["reset_metadata:1"]);
    }

    #[test]
    fn test_recreate_resets_producer_credits() {
        let (session, remote) = session_with_credits(
            SessionConfig {
                producer_window_size: 1024,
                ..SessionConfig::default()
            },
            CreditConfig::default(),
        );
        let producer = session.create_producer(Some("orders")).unwrap();
        assert_eq!(remote.calls_of("producer_credits"), vec!["producer_credits:orders:1024"]);
        session.handle_receive_producer_credits("orders", 1024);
        producer.send(ClientMessage::new(false).with_body(b"hello".to_vec())).unwrap();

        session.handle_failover(&new_connection(), &unblocked());

        assert_eq!(remote.count("producer_credits"), 2);
        let snapshot = session.credit_manager().credits_for("orders").unwrap().snapshot();
        assert_eq!(snapshot.available, 0);
        assert_eq!(snapshot.arriving, 1024);
    }
}

#[cfg(test)]
mod consumer_tests {
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;

    use lumen_common::config::SessionConfig;
    use lumen_common::error::ErrorKind;

    use super::support::{config, session_with, wait_until};
    use crate::message::ClientMessage;
    use crate::session::ConsumerOptions;

    #[test]
    fn test_handler_receives_messages_in_order() {
        let (session, _remote) = session_with(config());
        let consumer = session.create_consumer("q").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        consumer
            .set_message_handler(Some(Arc::new(move |m: ClientMessage| {
                sink.lock().push(m.id.map(|id| id.0));
            })))
            .unwrap();
        session.start().unwrap();

        for i in 1..=5 {
            session.handle_receive_message(consumer.id(), ClientMessage::delivered(i, b"x".to_vec()));
        }

        assert!(wait_until(Duration::from_secs(2), || seen.lock().len() == 5));
        let ids: Vec<u64> = seen.lock().iter().map(|id| id.unwrap()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(consumer.delivered_count(), 5);
    }

    #[test]
    fn test_stopped_session_holds_deliveries() {
        let (session, _remote) = session_with(config());
        let consumer = session.create_consumer("q").unwrap();
        session.handle_receive_message(consumer.id(), ClientMessage::delivered(1, b"x".to_vec()));

        assert!(consumer.receive_immediate().unwrap().is_none());
        assert_eq!(consumer.buffered(), 1);

        session.start().unwrap();
        let message = consumer.receive(Duration::from_millis(500)).unwrap().unwrap();
        assert_eq!(message.id.unwrap().0, 1);
    }

    #[test]
    fn test_receive_wakes_on_arrival() {
        let (session, _remote) = session_with(config());
        let consumer = session.create_consumer("q").unwrap();
        session.start().unwrap();

        let s = session.clone();
        let id = consumer.id();
        let feeder = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            s.handle_receive_message(id, ClientMessage::delivered(9, b"x".to_vec()));
        });
        let message = consumer.receive(Duration::from_secs(2)).unwrap();
        feeder.join().unwrap();
        assert_eq!(message.unwrap().id.unwrap().0, 9);
    }

    #[test]
    fn test_receive_with_handler_is_rejected() {
        let (session, _remote) = session_with(config());
        let consumer = session.create_consumer("q").unwrap();
        consumer
            .set_message_handler(Some(Arc::new(|_m: ClientMessage| {})))
            .unwrap();
        let err = consumer.receive_immediate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_zero_window_pulls_one_message_per_receive() {
        let (session, remote) = session_with(config());
        let consumer = session
            .create_consumer_with(
                "slow",
                ConsumerOptions {
                    window_size: Some(0),
                    ..ConsumerOptions::default()
                },
            )
            .unwrap();
        assert_eq!(remote.count("consumer_credits"), 0);

        session.start().unwrap();
        assert!(consumer.receive_immediate().unwrap().is_none());
        assert_eq!(remote.calls_of("consumer_credits"), vec!["consumer_credits:1:1"]);
    }

    #[test]
    fn test_credits_returned_after_half_window() {
        let (session, remote) = session_with(config());
        let consumer = session
            .create_consumer_with(
                "q",
                ConsumerOptions {
                    window_size: Some(200),
                    ..ConsumerOptions::default()
                },
            )
            .unwrap();
        session.start().unwrap();
        remote.clear_calls();

        // 64 header bytes + 40 body bytes = 104 >= 100.
        session.handle_receive_message(consumer.id(), ClientMessage::delivered(1, vec![0u8; 40]));
        consumer.receive_immediate().unwrap().unwrap();
        assert_eq!(remote.calls_of("consumer_credits"), vec!["consumer_credits:1:104"]);
    }

    #[test]
    fn test_acks_are_batched() {
        let (session, remote) = session_with(SessionConfig {
            ack_batch_size: 100,
            ..config()
        });
        let consumer = session.create_consumer("q").unwrap();
        let first = ClientMessage::delivered(1, vec![0u8; 10]);
        let second = ClientMessage::delivered(2, vec![0u8; 10]);

        consumer.acknowledge(&first).unwrap();
        assert_eq!(remote.count("ack"), 0);
        consumer.acknowledge(&second).unwrap();
        assert_eq!(remote.calls_of("ack"), vec!["ack:false:1:2"]);
        assert!(!consumer.has_pending_ack());
    }

    #[test]
    fn test_individual_ack_flushes_batch_first() {
        let (session, remote) = session_with(config());
        let consumer = session.create_consumer("q").unwrap();
        consumer.acknowledge(&ClientMessage::delivered(1, b"x".to_vec())).unwrap();
        consumer
            .individual_acknowledge(&ClientMessage::delivered(2, b"x".to_vec()))
            .unwrap();
        assert_eq!(remote.calls_of("ack"), vec!["ack:false:1:1", "ack:true:1:2"]);
    }

    #[test]
    fn test_pre_acknowledge_skips_acks() {
        let (session, remote) = session_with(SessionConfig {
            pre_acknowledge: true,
            ..config()
        });
        let consumer = session.create_consumer("q").unwrap();
        let message = ClientMessage::delivered(1, b"x".to_vec());
        consumer.acknowledge(&message).unwrap();
        consumer.individual_acknowledge(&message).unwrap();
        consumer.expire(&message).unwrap();
        consumer.flush_acks().unwrap();
        assert_eq!(remote.count("ack"), 0);
        assert_eq!(remote.count("expire"), 0);
    }

    #[test]
    fn test_transacted_ack_marks_work_done() {
        let (session, _remote) = session_with(SessionConfig::transacted());
        let consumer = session.create_consumer("q").unwrap();
        assert!(!session.is_work_done());
        consumer.acknowledge(&ClientMessage::delivered(1, b"x".to_vec())).unwrap();
        assert!(session.is_work_done());
    }

    #[test]
    fn test_ack_requires_delivered_message() {
        let (session, _remote) = session_with(config());
        let consumer = session.create_consumer("q").unwrap();
        let err = consumer.acknowledge(&ClientMessage::new(false)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_close_flushes_pending_ack_and_unregisters() {
        let (session, remote) = session_with(config());
        let consumer = session.create_consumer("q").unwrap();
        consumer.acknowledge(&ClientMessage::delivered(3, b"x".to_vec())).unwrap();

        consumer.close().unwrap();

        let calls = remote.calls();
        let ack = calls.iter().position(|c| c == "ack:false:1:3").unwrap();
        let close = calls.iter().position(|c| c == "close_consumer:1").unwrap();
        assert!(ack < close);
        assert_eq!(session.consumer_count(), 0);
        let err = consumer.receive_immediate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionClosed);
    }

    #[test]
    fn test_broker_disconnect_closes_consumer() {
        let (session, remote) = session_with(config());
        let consumer = session.create_consumer("q").unwrap();
        session.handle_consumer_disconnect(consumer.id());
        assert!(wait_until(Duration::from_secs(2), || session.consumer_count() == 0));
        assert!(consumer.is_closed());
        assert_eq!(remote.count("close_consumer"), 1);
    }
}

#[cfg(test)]
mod producer_tests {
    use lumen_common::config::{CreditConfig, SessionConfig};
    use lumen_common::error::{ErrorKind, FlowControlError, LumenError};

    use super::support::{config, session_with, session_with_credits};
    use crate::message::ClientMessage;
    use crate::producer::GROUP_ID_PROPERTY;

    #[test]
    fn test_anonymous_producer_needs_an_address() {
        let (session, remote) = session_with(config());
        let producer = session.create_producer(None).unwrap();

        let err = producer.send(ClientMessage::new(false)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        producer
            .send(ClientMessage::new(false).with_address("audit"))
            .unwrap();
        producer.send_to("orders", ClientMessage::new(false)).unwrap();
        assert_eq!(remote.calls_of("send"), vec!["send:audit:false", "send:orders:false"]);
    }

    #[test]
    fn test_durable_sends_block_under_auto_commit() {
        let (session, remote) = session_with(config());
        let producer = session.create_producer(Some("orders")).unwrap();
        producer.send(ClientMessage::new(true)).unwrap();
        producer.send(ClientMessage::new(false)).unwrap();
        // Only the first message carries the session's default address.
        assert_eq!(remote.calls_of("send"), vec!["send:orders:true", "send:-:false"]);
        assert_eq!(producer.sent_count(), 2);
    }

    #[test]
    fn test_transacted_sends_never_block() {
        let (session, remote) = session_with(SessionConfig {
            producer_window_size: -1,
            ..SessionConfig::transacted()
        });
        let producer = session.create_producer(Some("orders")).unwrap();
        producer.send(ClientMessage::new(true)).unwrap();
        assert_eq!(remote.calls_of("send"), vec!["send:orders:false"]);
    }

    #[test]
    fn test_auto_group_sets_group_property() {
        let (session, remote) = session_with(SessionConfig {
            auto_group: true,
            ..config()
        });
        let producer = session.create_producer(Some("orders")).unwrap();
        producer.send(ClientMessage::new(false)).unwrap();
        producer.send(ClientMessage::new(false)).unwrap();
        let sent = remote.sent();
        let group = sent[0].properties.get(GROUP_ID_PROPERTY).unwrap();
        assert_eq!(sent[1].properties.get(GROUP_ID_PROPERTY), Some(group));
    }

    #[test]
    fn test_closed_producer_rejects_sends() {
        let (session, _remote) = session_with(config());
        let producer = session.create_producer(Some("orders")).unwrap();
        producer.close();
        assert_eq!(session.producer_count(), 0);
        let err = producer.send(ClientMessage::new(false)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionClosed);
    }

    #[test]
    fn test_rate_limited_producer_reports_rate() {
        let (session, remote) = session_with(config());
        let producer = session.create_producer_with_rate(Some("orders"), 1000).unwrap();
        assert_eq!(producer.max_rate(), 1000);
        producer.send(ClientMessage::new(false)).unwrap();
        assert_eq!(remote.count("send"), 1);

        let unlimited = session.create_producer(Some("orders")).unwrap();
        assert_eq!(unlimited.max_rate(), -1);
    }

    #[test]
    fn test_send_times_out_without_credits() {
        let (session, remote) = session_with_credits(
            SessionConfig {
                producer_window_size: 1024,
                ..SessionConfig::default()
            },
            CreditConfig {
                max_wait_ms: 30,
                ..CreditConfig::default()
            },
        );
        let producer = session.create_producer(Some("orders")).unwrap();
        let err = producer.send(ClientMessage::new(false)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FlowControlTimeout);
        assert_eq!(remote.count("send"), 0);
    }

    #[test]
    fn test_fail_credits_reject_next_send() {
        let (session, remote) = session_with(SessionConfig {
            producer_window_size: 1024,
            ..SessionConfig::default()
        });
        let producer = session.create_producer(Some("orders")).unwrap();
        session.handle_receive_producer_fail_credits("orders", 1024);

        let err = producer.send(ClientMessage::new(false)).unwrap_err();
        assert!(matches!(
            err,
            LumenError::FlowControl(FlowControlError::AddressFull { .. })
        ));
        assert_eq!(remote.count("send"), 0);
    }

    #[test]
    fn test_closing_producer_returns_credits() {
        let (session, _remote) = session_with(SessionConfig {
            producer_window_size: 1024,
            ..SessionConfig::default()
        });
        let producer = session.create_producer(Some("orders")).unwrap();
        assert_eq!(session.credit_manager().unreferenced_count(), 0);
        producer.close();
        assert_eq!(session.credit_manager().unreferenced_count(), 1);
    }
}

#[cfg(test)]
mod xa_tests {
    use std::sync::Arc;

    use lumen_common::config::{LumenConfig, SessionConfig};
    use lumen_common::error::{ErrorKind, TransportErrorKind, XaErrorCode};
    use lumen_common::types::{Xid, TMNOFLAGS, TMSTARTRSCAN, TMSUCCESS};

    use super::support::session_with;
    use crate::factory::ClientSessionFactory;
    use crate::remote::PrepareVote;
    use crate::testing::MockConnector;
    use crate::xa::{ResourceIdentity, XaResource, XaSession};

    fn xa_session() -> (XaSession, Arc<crate::testing::MockRemote>) {
        let (session, remote) = session_with(SessionConfig::xa());
        (session.xa_resource(), remote)
    }

    fn code_of<T: std::fmt::Debug>(result: lumen_common::error::LumenResult<T>) -> XaErrorCode {
        result.unwrap_err().xa_code().unwrap()
    }

    #[test]
    fn test_start_records_current_xid() {
        let (xa, remote) = xa_session();
        let xid = Xid::generate();
        xa.start(&xid, TMNOFLAGS).unwrap();
        assert_eq!(xa.session().current_xid(), Some(xid));
        assert_eq!(remote.count("xa_start"), 1);
    }

    #[test]
    fn test_xa_calls_after_close_fail_with_session_closed() {
        let (xa, remote) = xa_session();
        xa.session().close();
        remote.clear_calls();
        let xid = Xid::generate();
        let closed = |kind: ErrorKind| assert_eq!(kind, ErrorKind::SessionClosed);

        closed(xa.start(&xid, TMNOFLAGS).unwrap_err().kind());
        closed(xa.end(&xid, TMSUCCESS).unwrap_err().kind());
        closed(xa.prepare(&xid).unwrap_err().kind());
        closed(xa.commit(&xid, false).unwrap_err().kind());
        closed(xa.rollback(&xid).unwrap_err().kind());
        closed(xa.forget(&xid).unwrap_err().kind());
        closed(xa.recover(TMSTARTRSCAN).unwrap_err().kind());
        closed(xa.transaction_timeout().unwrap_err().kind());
        closed(xa.set_transaction_timeout(30).unwrap_err().kind());

        assert_eq!(xa.session().current_xid(), None);
        assert!(remote.calls().is_empty());
    }

    #[test]
    fn test_start_retries_once_after_unblock() {
        let (xa, remote) = xa_session();
        remote.fail_next("xa_start", TransportErrorKind::Unblocked, 1);
        let xid = Xid::generate();
        xa.start(&xid, TMNOFLAGS).unwrap();
        assert_eq!(remote.count("xa_start"), 2);
        assert_eq!(xa.session().current_xid(), Some(xid));
    }

    #[test]
    fn test_start_failed_retry_is_resource_error() {
        let (xa, remote) = xa_session();
        remote.fail_next("xa_start", TransportErrorKind::Unblocked, 2);
        let xid = Xid::generate();
        assert_eq!(code_of(xa.start(&xid, TMNOFLAGS)), XaErrorCode::ResourceError);
        assert_eq!(xa.session().current_xid(), None);
    }

    #[test]
    fn test_start_passes_broker_code_through() {
        let (xa, remote) = xa_session();
        remote.fail_next(
            "xa_start",
            TransportErrorKind::XaRejected(XaErrorCode::DuplicateId),
            1,
        );
        assert_eq!(
            code_of(xa.start(&Xid::generate(), TMNOFLAGS)),
            XaErrorCode::DuplicateId
        );
        assert_eq!(remote.count("xa_start"), 1);
    }

    #[test]
    fn test_end_clears_current_xid() {
        let (xa, remote) = xa_session();
        let xid = Xid::generate();
        xa.start(&xid, TMNOFLAGS).unwrap();
        xa.end(&xid, TMSUCCESS).unwrap();
        assert_eq!(xa.session().current_xid(), None);
        assert_eq!(remote.count("xa_end"), 1);
    }

    #[test]
    fn test_end_failure_still_clears_current_xid() {
        let (xa, remote) = xa_session();
        let xid = Xid::generate();
        xa.start(&xid, TMNOFLAGS).unwrap();
        remote.fail_next("xa_end", TransportErrorKind::Disconnected, 1);
        assert_eq!(code_of(xa.end(&xid, TMSUCCESS)), XaErrorCode::ResourceError);
        assert_eq!(xa.session().current_xid(), None);
    }

    #[test]
    fn test_end_on_rollback_only_session_rolls_back_locally() {
        let (xa, remote) = xa_session();
        let xid = Xid::generate();
        xa.start(&xid, TMNOFLAGS).unwrap();
        xa.session().shared().set_rollback_only(true);

        assert_eq!(code_of(xa.end(&xid, TMSUCCESS)), XaErrorCode::RollbackOther);
        assert_eq!(remote.count("xa_end"), 0);
        assert_eq!(remote.count("rollback"), 1);
        assert_eq!(xa.session().current_xid(), None);
    }

    #[test]
    fn test_prepare_returns_vote() {
        let (xa, remote) = xa_session();
        remote.set_vote(PrepareVote::ReadOnly);
        assert_eq!(xa.prepare(&Xid::generate()).unwrap(), PrepareVote::ReadOnly);
    }

    #[test]
    fn test_prepare_retries_once_after_unblock() {
        let (xa, remote) = xa_session();
        remote.fail_next("xa_prepare", TransportErrorKind::Unblocked, 1);
        assert_eq!(xa.prepare(&Xid::generate()).unwrap(), PrepareVote::Ok);
        assert_eq!(remote.count("xa_prepare"), 2);
        assert_eq!(remote.count("rollback"), 0);
    }

    #[test]
    fn test_prepare_unblocked_twice_rolls_back_branch() {
        let (xa, remote) = xa_session();
        remote.fail_next("xa_prepare", TransportErrorKind::Unblocked, 2);

        let err = xa.prepare(&Xid::generate()).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::RollbackOnOtherBranch);
        assert_eq!(err.xa_code(), Some(XaErrorCode::RollbackOther));
        assert_eq!(remote.count("xa_prepare"), 2);
        assert_eq!(remote.count("rollback"), 1);
        match err {
            lumen_common::error::LumenError::Xa(e) => assert!(e.cause.is_some()),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_prepare_on_rollback_only_session() {
        let (xa, remote) = xa_session();
        xa.session().shared().set_rollback_only(true);
        assert_eq!(
            code_of(xa.prepare(&Xid::generate())),
            XaErrorCode::RollbackOther
        );
        assert_eq!(remote.count("xa_prepare"), 0);
    }

    #[test]
    fn test_prepare_other_failure_is_resource_error() {
        let (xa, remote) = xa_session();
        remote.fail_next("xa_prepare", TransportErrorKind::ConnectionTimedOut, 1);
        assert_eq!(
            code_of(xa.prepare(&Xid::generate())),
            XaErrorCode::ResourceError
        );
        assert_eq!(remote.count("xa_prepare"), 1);
    }

    #[test]
    fn test_commit_interrupted_asks_for_retry() {
        let (xa, remote) = xa_session();
        remote.fail_next("xa_commit", TransportErrorKind::Unblocked, 1);
        let err = xa.commit(&Xid::generate(), false).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.xa_code(), Some(XaErrorCode::Retry));
    }

    #[test]
    fn test_commit_passes_heuristic_through() {
        let (xa, remote) = xa_session();
        remote.fail_next(
            "xa_commit",
            TransportErrorKind::XaRejected(XaErrorCode::HeuristicMixed),
            1,
        );
        assert_eq!(
            code_of(xa.commit(&Xid::generate(), true)),
            XaErrorCode::HeuristicMixed
        );
    }

    #[test]
    fn test_commit_after_failover_still_goes_out() {
        let (xa, remote) = xa_session();
        xa.session().shared().set_rollback_only(true);
        xa.session().shared().mark_work_done();
        xa.commit(&Xid::generate(), false).unwrap();
        assert_eq!(remote.calls_of("xa_commit"), vec!["xa_commit:false"]);
        assert!(!xa.session().is_work_done());
    }

    #[test]
    fn test_rollback_stops_and_restarts_delivery() {
        let (xa, remote) = xa_session();
        xa.session().start().unwrap();
        remote.clear_calls();

        xa.rollback(&Xid::generate()).unwrap();

        let calls = remote.calls();
        let stop = calls.iter().position(|c| c == "session_stop").unwrap();
        let rollback = calls.iter().position(|c| c == "xa_rollback:true").unwrap();
        let start = calls.iter().position(|c| c == "session_start").unwrap();
        assert!(stop < rollback && rollback < start);
        assert!(xa.session().is_started());
    }

    #[test]
    fn test_rollback_of_stopped_session() {
        let (xa, remote) = xa_session();
        xa.rollback(&Xid::generate()).unwrap();
        assert_eq!(remote.calls_of("xa_rollback"), vec!["xa_rollback:false"]);
        assert_eq!(remote.count("session_start"), 0);
    }

    #[test]
    fn test_rollback_unblocked_asks_for_retry_and_restarts() {
        let (xa, remote) = xa_session();
        xa.session().start().unwrap();
        remote.fail_next("xa_rollback", TransportErrorKind::Unblocked, 1);

        let err = xa.rollback(&Xid::generate()).unwrap_err();

        assert_eq!(err.xa_code(), Some(XaErrorCode::Retry));
        assert!(xa.session().is_started());
    }

    #[test]
    fn test_forget_maps_errors() {
        let (xa, remote) = xa_session();
        xa.forget(&Xid::generate()).unwrap();
        remote.fail_next("xa_forget", TransportErrorKind::Internal, 1);
        assert_eq!(
            code_of(xa.forget(&Xid::generate())),
            XaErrorCode::ResourceError
        );
    }

    #[test]
    fn test_recover_only_scans_on_start_flag() {
        let (xa, remote) = xa_session();
        let prepared = vec![Xid::generate(), Xid::generate()];
        remote.set_scan(prepared.clone());

        assert!(xa.recover(TMNOFLAGS).unwrap().is_empty());
        assert_eq!(remote.count("xa_scan"), 0);

        assert_eq!(xa.recover(TMSTARTRSCAN).unwrap(), prepared);
        assert_eq!(remote.count("xa_scan"), 1);
    }

    #[test]
    fn test_transaction_timeout_round_trip() {
        let (xa, remote) = xa_session();
        assert!(xa.set_transaction_timeout(30).unwrap());
        assert_eq!(xa.transaction_timeout().unwrap(), 30);
        remote.fail_next("xa_get_timeout", TransportErrorKind::Disconnected, 1);
        assert_eq!(code_of(xa.transaction_timeout()), XaErrorCode::ResourceError);
    }

    #[test]
    fn test_non_xa_session_is_rejected() {
        let (session, remote) = session_with(SessionConfig::default());
        let xa = session.xa_resource();
        let err = xa.start(&Xid::generate(), TMNOFLAGS).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotXa);
        assert_eq!(err.xa_code(), Some(XaErrorCode::ResourceError));
        assert_eq!(remote.count("xa_start"), 0);
    }

    struct Wrapped(XaSession);

    impl XaResource for Wrapped {
        fn start(&self, xid: &Xid, flags: i32) -> lumen_common::error::LumenResult<()> {
            self.0.start(xid, flags)
        }
        fn end(&self, xid: &Xid, flags: i32) -> lumen_common::error::LumenResult<()> {
            self.0.end(xid, flags)
        }
        fn prepare(&self, xid: &Xid) -> lumen_common::error::LumenResult<PrepareVote> {
            self.0.prepare(xid)
        }
        fn commit(&self, xid: &Xid, one_phase: bool) -> lumen_common::error::LumenResult<()> {
            self.0.commit(xid, one_phase)
        }
        fn rollback(&self, xid: &Xid) -> lumen_common::error::LumenResult<()> {
            self.0.rollback(xid)
        }
        fn forget(&self, xid: &Xid) -> lumen_common::error::LumenResult<()> {
            self.0.forget(xid)
        }
        fn recover(&self, flags: i32) -> lumen_common::error::LumenResult<Vec<Xid>> {
            self.0.recover(flags)
        }
        fn transaction_timeout(&self) -> lumen_common::error::LumenResult<u32> {
            self.0.transaction_timeout()
        }
        fn set_transaction_timeout(&self, seconds: u32) -> lumen_common::error::LumenResult<bool> {
            self.0.set_transaction_timeout(seconds)
        }
        fn is_same_rm(&self, other: &dyn XaResource) -> lumen_common::error::LumenResult<bool> {
            self.0.is_same_rm(other)
        }
        fn resource_identity(&self) -> Option<ResourceIdentity> {
            self.0.resource_identity()
        }
    }

    struct Foreign;

    impl XaResource for Foreign {
        fn start(&self, _: &Xid, _: i32) -> lumen_common::error::LumenResult<()> {
            Ok(())
        }
        fn end(&self, _: &Xid, _: i32) -> lumen_common::error::LumenResult<()> {
            Ok(())
        }
        fn prepare(&self, _: &Xid) -> lumen_common::error::LumenResult<PrepareVote> {
            Ok(PrepareVote::Ok)
        }
        fn commit(&self, _: &Xid, _: bool) -> lumen_common::error::LumenResult<()> {
            Ok(())
        }
        fn rollback(&self, _: &Xid) -> lumen_common::error::LumenResult<()> {
            Ok(())
        }
        fn forget(&self, _: &Xid) -> lumen_common::error::LumenResult<()> {
            Ok(())
        }
        fn recover(&self, _: i32) -> lumen_common::error::LumenResult<Vec<Xid>> {
            Ok(Vec::new())
        }
        fn transaction_timeout(&self) -> lumen_common::error::LumenResult<u32> {
            Ok(0)
        }
        fn set_transaction_timeout(&self, _: u32) -> lumen_common::error::LumenResult<bool> {
            Ok(false)
        }
        fn is_same_rm(&self, _: &dyn XaResource) -> lumen_common::error::LumenResult<bool> {
            Ok(false)
        }
    }

    fn factory() -> Arc<ClientSessionFactory> {
        ClientSessionFactory::new(Arc::new(MockConnector::new()), LumenConfig::default())
    }

    #[test]
    fn test_same_rm_by_factory_identity() {
        let f = factory();
        let a = f.create_xa_session(None, None).unwrap().xa_resource();
        let b = f.create_xa_session(None, None).unwrap().xa_resource();
        assert!(a.is_same_rm(&b).unwrap());

        let other = factory().create_xa_session(None, None).unwrap().xa_resource();
        assert!(!a.is_same_rm(&other).unwrap());
    }

    #[test]
    fn test_same_rm_by_live_node_id() {
        let f1 = factory();
        let f2 = factory();
        f1.set_live_node_id(Some("node-a".into()));
        f2.set_live_node_id(Some("node-a".into()));
        let a = f1.create_xa_session(None, None).unwrap().xa_resource();
        let b = f2.create_xa_session(None, None).unwrap().xa_resource();
        assert!(a.is_same_rm(&b).unwrap());

        f2.set_live_node_id(Some("node-b".into()));
        assert!(!a.is_same_rm(&b).unwrap());
    }

    #[test]
    fn test_same_rm_sees_through_wrappers() {
        let f = factory();
        let a = f.create_xa_session(None, None).unwrap().xa_resource();
        let b = Wrapped(f.create_xa_session(None, None).unwrap().xa_resource());
        assert!(a.is_same_rm(&b).unwrap());
        assert!(!a.is_same_rm(&Foreign).unwrap());
    }

    #[test]
    fn test_forced_not_same_rm() {
        let f = factory();
        let a = f.create_xa_session(None, None).unwrap().xa_resource();
        let b = f.create_xa_session(None, None).unwrap().xa_resource();
        a.set_force_not_same_rm(true);
        assert!(!a.is_same_rm(&b).unwrap());
    }
}

#[cfg(test)]
mod factory_tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use lumen_common::config::LumenConfig;
    use lumen_common::error::{ErrorKind, TransportError};

    use crate::factory::{ClientSessionFactory, ConnectionEvent};
    use crate::remote::ConnectionInfo;
    use crate::session::FailoverOutcome;
    use crate::testing::MockConnector;

    fn factory() -> (Arc<ClientSessionFactory>, Arc<MockConnector>) {
        let connector = Arc::new(MockConnector::new());
        let factory = ClientSessionFactory::new(connector.clone(), LumenConfig::default());
        (factory, connector)
    }

    #[test]
    fn test_fail_over_moves_every_session() {
        let (factory, connector) = factory();
        factory.create_session(None, None).unwrap();
        factory.create_session(None, None).unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        factory.add_connection_listener(Arc::new(move |e: &ConnectionEvent| sink.lock().push(e.clone())));

        let connection = ConnectionInfo::new(2, "mock://broker-2");
        let outcomes = factory.fail_over(
            connection.clone(),
            TransportError::unblocked("failover"),
            Some("node-b".into()),
        );

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|(_, o)| *o == FailoverOutcome::Recreated));
        for remote in connector.remotes() {
            let calls = remote.calls();
            let lock = calls.iter().position(|c| c == "lock_communications").unwrap();
            let reattach = calls.iter().position(|c| c.starts_with("reattach")).unwrap();
            assert!(lock < reattach);
        }
        assert_eq!(factory.connection(), Some(connection.clone()));
        assert_eq!(
            crate::factory::SessionFactory::live_node_id(factory.as_ref()),
            Some("node-b".to_string())
        );
        assert_eq!(
            events.lock().as_slice(),
            &[ConnectionEvent::FailoverCompleted { connection }]
        );
    }

    #[test]
    fn test_connection_failed_cleans_up_sessions() {
        let (factory, connector) = factory();
        let session = factory.create_session(None, None).unwrap();
        let events = Arc::new(Mutex::new(0usize));
        let sink = events.clone();
        let id = factory.add_connection_listener(Arc::new(move |_e: &ConnectionEvent| *sink.lock() += 1));

        factory.connection_failed(TransportError::disconnected("gone"));

        assert!(session.is_closed());
        assert_eq!(factory.session_count(), 0);
        assert_eq!(connector.remotes()[0].count("session_close"), 0);
        assert_eq!(*events.lock(), 1);

        assert!(factory.remove_connection_listener(id));
        factory.connection_failed(TransportError::disconnected("gone"));
        assert_eq!(*events.lock(), 1);
    }

    #[test]
    fn test_closed_session_leaves_factory() {
        let (factory, _connector) = factory();
        let session = factory.create_session(None, None).unwrap();
        assert_eq!(factory.session_count(), 1);
        session.close();
        assert_eq!(factory.session_count(), 0);
    }

    #[test]
    fn test_closed_factory_refuses_sessions() {
        let (factory, _connector) = factory();
        let session = factory.create_session(None, None).unwrap();
        factory.close();
        assert!(session.is_closed());
        let err = factory.create_session(None, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionClosed);
    }

    #[test]
    fn test_xa_session_defaults() {
        let (factory, _connector) = factory();
        let session = factory.create_xa_session(None, None).unwrap();
        assert!(session.is_xa());
        assert!(!session.is_auto_commit_sends());
        assert!(!session.is_auto_commit_acks());
    }
}
