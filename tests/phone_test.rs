mod common;

use common::*;
use sip_agent::media::{MediaHandle, MediaTrack, TrackSet};
use sip_agent::session::{Direction, SessionState};
use sip_agent::signaling::{SessionId, SignalingEvent};
use sip_agent::{CallError, ConfigError, Credentials, PhoneEvent, RegistrationError, SipError};
use std::sync::Arc;

fn invited_id(h: &Harness) -> SessionId {
    h.signaling
        .ops()
        .into_iter()
        .find_map(|op| match op {
            Op::Invite(id, _) => Some(id),
            _ => None,
        })
        .expect("no INVITE sent")
}

#[tokio::test]
async fn test_login_registers_once() {
    let mut h = harness();
    h.phone.login(credentials()).await.unwrap();
    settle().await;

    let events = h.drain();
    assert_eq!(registered_count(&events), 1);
    assert!(has_debug(&events, "[INFO] Registered successfully!"));
    assert!(h.phone.is_registered());
    assert!(h.phone.is_connected());
    assert_eq!(h.signaling.ops(), vec![Op::Connect, Op::Register]);
}

#[tokio::test]
async fn test_repeated_login_is_noop() {
    let mut h = logged_in().await;
    h.phone.login(credentials()).await.unwrap();
    settle().await;

    assert_eq!(h.signaling.connects(), 1);
    assert_eq!(registered_count(&h.drain()), 0);
}

#[tokio::test]
async fn test_login_rejects_missing_credentials() {
    let mut h = harness();
    let result = h.phone.login(Credentials::new("1001", "", "Agent")).await;

    assert!(matches!(
        result,
        Err(SipError::Config(ConfigError::Missing(_)))
    ));
    assert!(has_debug(&h.drain(), "[Error] Missing extension or password"));
    assert!(h.signaling.ops().is_empty());
    assert!(h.phone.registration_state().is_none());
}

#[tokio::test]
async fn test_registration_failure_is_reported() {
    let mut h = harness();
    h.signaling.fail_register(RegistrationError::Rejected {
        code: 403,
        reason: "Forbidden".to_string(),
    });

    h.phone.login(credentials()).await.unwrap();
    settle().await;

    let events = h.drain();
    assert!(events.iter().any(|e| matches!(
        e,
        PhoneEvent::RegistrationFailed(RegistrationError::Rejected { code: 403, .. })
    )));
    assert_eq!(registered_count(&events), 0);
    assert!(!h.phone.is_registered());
    // 连接仍然保持
    assert!(h.phone.is_connected());
}

#[tokio::test]
async fn test_call_without_login() {
    let h = harness();
    let result = h.phone.call("1002").await;
    assert!(matches!(result, Err(CallError::NotInitialized)));
    assert!(h.signaling.ops().is_empty());
}

#[tokio::test]
async fn test_invalid_destination_sends_nothing() {
    let mut h = logged_in().await;

    let result = h.phone.call("bad user").await;
    assert!(matches!(result, Err(CallError::InvalidDestination { .. })));
    assert_eq!(h.signaling.count(|op| matches!(op, Op::Invite(..))), 0);
    assert!(h.phone.active_session().is_none());
    assert!(has_debug(&h.drain(), "[Error] Invalid destination URI."));
}

#[tokio::test]
async fn test_outgoing_call_lifecycle() {
    let mut h = logged_in().await;

    let session = h.phone.call("1002").await.unwrap();
    assert_eq!(session.direction(), Direction::Outgoing);
    assert_eq!(session.state(), SessionState::Establishing);
    assert_eq!(
        h.signaling.ops().last(),
        Some(&Op::Invite(
            session.id().clone(),
            "sip:1002@pbx.example.com".to_string()
        ))
    );
    assert!(has_debug(&h.drain(), "[INFO] Calling extension 1002..."));

    let media = TrackSet::audio();
    media.receivers[0].set_enabled(false);
    h.emit(SignalingEvent::Established {
        id: session.id().clone(),
        media: Some(media.clone() as Arc<dyn MediaHandle>),
    });
    settle().await;

    assert_eq!(session.state(), SessionState::Established);
    assert!(media.receivers[0].is_enabled());
    let events = h.drain();
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, PhoneEvent::CallEstablished(_)))
            .count(),
        1
    );

    h.phone.hangup(None).await;

    assert_eq!(
        session.state_history(),
        vec![
            SessionState::Initial,
            SessionState::Establishing,
            SessionState::Established,
            SessionState::Terminating,
            SessionState::Terminated,
        ]
    );
    assert_eq!(h.signaling.count(|op| *op == Op::Bye(session.id().clone())), 1);
    assert!(media.senders[0].is_stopped());
    assert!(media.receivers[0].is_stopped());
    assert!(h.phone.active_session().is_none());
    assert_eq!(call_ended_count(&h.drain()), 1);
}

#[tokio::test]
async fn test_double_hangup_ends_once() {
    let mut h = logged_in().await;
    let session = h.phone.call("1002").await.unwrap();
    h.emit(SignalingEvent::Established {
        id: session.id().clone(),
        media: Some(TrackSet::audio()),
    });
    settle().await;
    h.drain();

    h.phone.hangup(Some(session.clone())).await;
    h.phone.hangup(Some(session.clone())).await;

    assert_eq!(session.state(), SessionState::Terminated);
    assert_eq!(h.signaling.count(|op| matches!(op, Op::Bye(_))), 1);
    let events = h.drain();
    assert_eq!(call_ended_count(&events), 1);
    assert!(has_debug(&events, "already terminating or terminated"));
}

#[tokio::test]
async fn test_hangup_while_ringing_cancels() {
    let mut h = logged_in().await;
    let session = h.phone.call("1002").await.unwrap();

    h.phone.hangup(None).await;

    assert_eq!(session.state(), SessionState::Terminated);
    assert_eq!(
        h.signaling.count(|op| *op == Op::Cancel(session.id().clone())),
        1
    );
    assert_eq!(h.signaling.count(|op| matches!(op, Op::Bye(_))), 0);
    assert_eq!(call_ended_count(&h.drain()), 1);
}

#[tokio::test]
async fn test_hangup_without_session_is_silent() {
    let mut h = logged_in().await;
    h.phone.hangup(None).await;
    assert!(h.drain().is_empty());
}

#[tokio::test]
async fn test_new_call_replaces_active_call() {
    let mut h = logged_in().await;
    let first = h.phone.call("1002").await.unwrap();
    let second = h.phone.call("1003").await.unwrap();

    assert_eq!(first.state(), SessionState::Terminated);
    assert_eq!(h.signaling.count(|op| *op == Op::Cancel(first.id().clone())), 1);
    assert_eq!(
        h.phone.active_session().map(|s| s.id().clone()),
        Some(second.id().clone())
    );
    assert_eq!(call_ended_count(&h.drain()), 1);
}

#[tokio::test]
async fn test_outgoing_call_rejected_by_remote() {
    let mut h = logged_in().await;
    let session = h.phone.call("1002").await.unwrap();
    let id = invited_id(&h);

    h.emit(SignalingEvent::Failed {
        id,
        code: Some(486),
        reason: "Busy Here".to_string(),
    });
    settle().await;

    assert_eq!(session.state(), SessionState::Terminated);
    assert!(h.phone.active_session().is_none());
    let events = h.drain();
    assert_eq!(call_ended_count(&events), 1);
    assert!(has_debug(&events, "486"));
}

#[tokio::test]
async fn test_remote_bye_ends_call() {
    let mut h = logged_in().await;
    let session = h.phone.call("1002").await.unwrap();
    h.emit(SignalingEvent::Established {
        id: session.id().clone(),
        media: None,
    });
    h.emit(SignalingEvent::RemoteBye {
        id: session.id().clone(),
    });
    settle().await;

    assert_eq!(
        &session.state_history()[2..],
        &[
            SessionState::Established,
            SessionState::Terminating,
            SessionState::Terminated
        ]
    );
    assert_eq!(h.signaling.count(|op| matches!(op, Op::Bye(_))), 0);
    assert_eq!(call_ended_count(&h.drain()), 1);
}

#[tokio::test]
async fn test_incoming_call_reject_uses_480() {
    let mut h = logged_in().await;
    let id = SessionId::from("incoming-1");
    h.emit(SignalingEvent::IncomingInvite {
        id: id.clone(),
        caller: "2002".to_string(),
    });
    settle().await;

    let events = h.drain();
    let session = events
        .iter()
        .find_map(|e| match e {
            PhoneEvent::IncomingCall { session, caller } if caller == "2002" => {
                Some(session.clone())
            }
            _ => None,
        })
        .expect("no incoming call event");
    assert_eq!(session.direction(), Direction::Incoming);
    assert_eq!(session.remote_identity(), "2002");
    assert_eq!(
        h.phone.active_session().map(|s| s.id().clone()),
        Some(id.clone())
    );

    h.phone.reject_call(&session).await;

    assert_eq!(session.state(), SessionState::Terminated);
    assert_eq!(h.signaling.count(|op| *op == Op::Reject(id.clone(), 480)), 1);
    assert!(h.phone.active_session().is_none());
    assert_eq!(call_ended_count(&h.drain()), 1);

    // 已结束的会话再次拒接为空操作
    h.phone.reject_call(&session).await;
    assert_eq!(h.signaling.count(|op| matches!(op, Op::Reject(..))), 1);
    assert!(h.drain().is_empty());
}

#[tokio::test]
async fn test_incoming_call_accept() {
    let mut h = logged_in().await;
    let id = SessionId::from("incoming-2");
    h.emit(SignalingEvent::IncomingInvite {
        id: id.clone(),
        caller: "2002".to_string(),
    });
    settle().await;
    h.drain();

    let session = h.phone.active_session().unwrap();
    h.phone.accept_call(&session).await.unwrap();
    assert_eq!(session.state(), SessionState::Establishing);
    assert_eq!(h.signaling.count(|op| *op == Op::Answer(id.clone())), 1);

    h.emit(SignalingEvent::Established {
        id: id.clone(),
        media: Some(TrackSet::audio()),
    });
    settle().await;
    assert_eq!(session.state(), SessionState::Established);
    assert!(h
        .drain()
        .iter()
        .any(|e| matches!(e, PhoneEvent::CallEstablished(_))));

    // 接通后不能再次接听
    let err = h.phone.accept_call(&session).await.unwrap_err();
    assert!(matches!(err, CallError::InvalidSessionOperation { .. }));
}

#[tokio::test]
async fn test_accept_with_microphone_denied() {
    let mut h = logged_in().await;
    h.media.deny_microphone();
    h.emit(SignalingEvent::IncomingInvite {
        id: SessionId::from("incoming-3"),
        caller: "2002".to_string(),
    });
    settle().await;
    h.drain();

    let session = h.phone.active_session().unwrap();
    let err = h.phone.accept_call(&session).await.unwrap_err();

    assert!(matches!(err, CallError::MediaAccessDenied { .. }));
    assert_eq!(session.state(), SessionState::Initial);
    assert_eq!(h.signaling.count(|op| matches!(op, Op::Answer(_))), 0);
    assert!(has_debug(&h.drain(), "[ERROR] Microphone access failed"));
}

#[tokio::test]
async fn test_remote_cancel_of_incoming_call() {
    let mut h = logged_in().await;
    let id = SessionId::from("incoming-4");
    h.emit(SignalingEvent::IncomingInvite {
        id: id.clone(),
        caller: "2002".to_string(),
    });
    h.emit(SignalingEvent::RemoteCancel { id });
    settle().await;

    assert!(h.phone.active_session().is_none());
    assert_eq!(call_ended_count(&h.drain()), 1);
}

#[tokio::test]
async fn test_concurrent_incoming_call_keeps_active_call() {
    let mut h = logged_in().await;
    let current = h.phone.call("1002").await.unwrap();
    h.emit(SignalingEvent::IncomingInvite {
        id: SessionId::from("incoming-5"),
        caller: "3003".to_string(),
    });
    settle().await;

    assert_eq!(
        h.phone.active_session().map(|s| s.id().clone()),
        Some(current.id().clone())
    );
    assert!(h
        .drain()
        .iter()
        .any(|e| matches!(e, PhoneEvent::IncomingCall { caller, .. } if caller == "3003")));
}

#[tokio::test]
async fn test_toggle_mute() {
    let h = logged_in().await;
    // 没有通话时为空操作
    h.phone.toggle_mute(true);

    let session = h.phone.call("1002").await.unwrap();
    let media = TrackSet::audio();
    h.emit(SignalingEvent::Established {
        id: session.id().clone(),
        media: Some(media.clone() as Arc<dyn MediaHandle>),
    });
    settle().await;

    h.phone.toggle_mute(true);
    assert!(!media.senders[0].is_enabled());
    assert!(media.receivers[0].is_enabled());
    assert_eq!(session.state(), SessionState::Established);

    h.phone.toggle_mute(false);
    assert!(media.senders[0].is_enabled());
}

#[tokio::test]
async fn test_logout_hangs_up_and_unregisters() {
    let mut h = logged_in().await;
    let session = h.phone.call("1002").await.unwrap();
    h.emit(SignalingEvent::Established {
        id: session.id().clone(),
        media: None,
    });
    settle().await;
    h.drain();

    h.phone.logout().await;

    let ops = h.signaling.ops();
    let bye = ops.iter().position(|op| matches!(op, Op::Bye(_))).unwrap();
    let unregister = ops.iter().position(|op| *op == Op::Unregister).unwrap();
    let disconnect = ops.iter().position(|op| *op == Op::Disconnect).unwrap();
    assert!(bye < unregister && unregister < disconnect);

    let events = h.drain();
    assert_eq!(call_ended_count(&events), 1);
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, PhoneEvent::Unregistered))
            .count(),
        1
    );
    assert!(has_debug(&events, "[INFO] Logged out successfully."));
    assert!(h.phone.registration_state().is_none());
    assert!(!h.phone.is_connected());

    // 会话持有的连接已关闭
    assert!(matches!(
        session.connection(),
        Err(CallError::NotInitialized)
    ));
    assert!(matches!(
        h.phone.call("1002").await,
        Err(CallError::NotInitialized)
    ));
}

#[tokio::test]
async fn test_logout_twice_is_noop() {
    let mut h = logged_in().await;
    h.phone.logout().await;
    h.drain();

    h.phone.logout().await;
    assert!(h.drain().is_empty());
    assert_eq!(h.signaling.count(|op| *op == Op::Disconnect), 1);
}

#[tokio::test]
async fn test_answer_arriving_during_cancel_is_ignored() {
    let mut h = logged_in().await;
    let session = h.phone.call("1002").await.unwrap();
    h.signaling.slow_ops(10);

    // 200 OK 已排队，CANCEL 发送期间才被处理
    h.emit(SignalingEvent::Established {
        id: session.id().clone(),
        media: Some(TrackSet::audio()),
    });
    h.phone.hangup(None).await;
    settle().await;

    assert_eq!(session.state(), SessionState::Terminated);
    assert_eq!(
        session.state_history(),
        vec![
            SessionState::Initial,
            SessionState::Establishing,
            SessionState::Terminated
        ]
    );
    assert!(session.media().is_none());
    assert_eq!(h.signaling.count(|op| matches!(op, Op::Cancel(_))), 1);

    let events = h.drain();
    assert!(!events
        .iter()
        .any(|e| matches!(e, PhoneEvent::CallEstablished(_))));
    assert_eq!(call_ended_count(&events), 1);
    assert!(has_debug(&events, "[WARNING] Ignoring answer"));
    assert!(h.phone.active_session().is_none());
}

#[tokio::test]
async fn test_remote_cancel_during_reject_ends_once() {
    let mut h = logged_in().await;
    let id = SessionId::from("incoming-6");
    h.emit(SignalingEvent::IncomingInvite {
        id: id.clone(),
        caller: "2002".to_string(),
    });
    settle().await;
    let session = h.phone.active_session().unwrap();
    h.drain();
    h.signaling.slow_ops(10);

    h.emit(SignalingEvent::RemoteCancel { id: id.clone() });
    h.phone.reject_call(&session).await;
    settle().await;

    assert_eq!(
        session.state_history(),
        vec![SessionState::Initial, SessionState::Terminated]
    );
    assert_eq!(
        h.signaling.count(|op| *op == Op::Reject(id.clone(), 480)),
        1
    );
    assert_eq!(call_ended_count(&h.drain()), 1);
    assert!(h.phone.active_session().is_none());
}

#[tokio::test]
async fn test_remote_bye_during_hangup_ends_once() {
    let mut h = logged_in().await;
    let session = h.phone.call("1002").await.unwrap();
    h.emit(SignalingEvent::Established {
        id: session.id().clone(),
        media: Some(TrackSet::audio()),
    });
    settle().await;
    h.drain();
    h.signaling.slow_ops(10);

    h.emit(SignalingEvent::RemoteBye {
        id: session.id().clone(),
    });
    h.phone.hangup(None).await;
    settle().await;

    assert_eq!(
        session.state_history(),
        vec![
            SessionState::Initial,
            SessionState::Establishing,
            SessionState::Established,
            SessionState::Terminating,
            SessionState::Terminated
        ]
    );
    assert_eq!(h.signaling.count(|op| matches!(op, Op::Bye(_))), 1);
    let events = h.drain();
    assert_eq!(call_ended_count(&events), 1);
    assert!(!has_debug(&events, "[WARNING]"));
}

#[tokio::test]
async fn test_logout_rejects_waiting_incoming_call() {
    let mut h = logged_in().await;
    let current = h.phone.call("1002").await.unwrap();
    h.emit(SignalingEvent::Established {
        id: current.id().clone(),
        media: None,
    });
    let waiting_id = SessionId::from("incoming-7");
    h.emit(SignalingEvent::IncomingInvite {
        id: waiting_id.clone(),
        caller: "3003".to_string(),
    });
    settle().await;
    let waiting = h
        .drain()
        .into_iter()
        .find_map(|e| match e {
            PhoneEvent::IncomingCall { session, .. } => Some(session),
            _ => None,
        })
        .unwrap();
    assert_eq!(waiting.direction(), Direction::Incoming);

    h.phone.logout().await;

    assert_eq!(current.state(), SessionState::Terminated);
    assert_eq!(waiting.state(), SessionState::Terminated);
    let ops = h.signaling.ops();
    let reject = ops
        .iter()
        .position(|op| *op == Op::Reject(waiting_id.clone(), 480))
        .unwrap();
    let unregister = ops.iter().position(|op| *op == Op::Unregister).unwrap();
    assert!(reject < unregister);
    assert_eq!(h.signaling.count(|op| matches!(op, Op::Bye(_))), 1);
    assert_eq!(call_ended_count(&h.drain()), 2);
}
