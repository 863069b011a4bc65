#![allow(dead_code)]

use async_trait::async_trait;
use sip_agent::error::MediaError;
use sip_agent::events::{self, PhoneEvent};
use sip_agent::media::{MediaHandle, MediaTransport, TrackSet};
use sip_agent::signaling::{
    event_channel, Identity, SessionId, Signaling, SignalingEvent, SignalingEventReceiver,
    SignalingEventSender,
};
use sip_agent::{CallResult, Config, ConnectError, Credentials, Phone, RegistrationError};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedReceiver;

/// 模拟信令上记录的操作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Connect,
    Disconnect,
    Register,
    Unregister,
    Invite(SessionId, String),
    Answer(SessionId),
    Reject(SessionId, u16),
    Cancel(SessionId),
    Bye(SessionId),
}

/// 内存中的信令实现，记录所有调用
pub struct MockSignaling {
    events: SignalingEventSender,
    ops: Mutex<Vec<Op>>,
    connect_failures: AtomicU32,
    op_yields: AtomicU32,
    register_error: Mutex<Option<RegistrationError>>,
}

impl MockSignaling {
    pub fn new() -> (Arc<Self>, SignalingEventReceiver) {
        let (events, receiver) = event_channel();
        let signaling = Arc::new(Self {
            events,
            ops: Mutex::new(Vec::new()),
            connect_failures: AtomicU32::new(0),
            op_yields: AtomicU32::new(0),
            register_error: Mutex::new(None),
        });
        (signaling, receiver)
    }

    /// 接下来 `count` 次 connect 失败
    pub fn fail_connect(&self, count: u32) {
        self.connect_failures.store(count, Ordering::SeqCst);
    }

    /// 通话操作（answer/reject/cancel/bye）在返回前让出 `yields` 次，
    /// 让事件处理任务有机会在操作进行中处理排队的事件
    pub fn slow_ops(&self, yields: u32) {
        self.op_yields.store(yields, Ordering::SeqCst);
    }

    async fn in_flight(&self) {
        for _ in 0..self.op_yields.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
    }

    pub fn fail_register(&self, error: RegistrationError) {
        *self.register_error.lock().unwrap() = Some(error);
    }

    /// 模拟信令层上报事件
    pub fn emit(&self, event: SignalingEvent) {
        self.events.send(event).unwrap();
    }

    pub fn ops(&self) -> Vec<Op> {
        self.ops.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Op) -> bool) -> usize {
        self.ops.lock().unwrap().iter().filter(|op| pred(op)).count()
    }

    pub fn connects(&self) -> usize {
        self.count(|op| *op == Op::Connect)
    }

    fn record(&self, op: Op) {
        self.ops.lock().unwrap().push(op);
    }
}

#[async_trait]
impl Signaling for MockSignaling {
    async fn connect(&self, _identity: &Identity) -> Result<(), ConnectError> {
        self.record(Op::Connect);
        let failing = self
            .connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ConnectError::Transport("connection refused".to_string()));
        }
        let _ = self.events.send(SignalingEvent::Connected);
        Ok(())
    }

    async fn disconnect(&self) {
        self.record(Op::Disconnect);
        let _ = self.events.send(SignalingEvent::Disconnected { error: None });
    }

    async fn register(&self, _identity: &Identity) -> Result<(), RegistrationError> {
        self.record(Op::Register);
        match self.register_error.lock().unwrap().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn unregister(&self, _identity: &Identity) -> Result<(), RegistrationError> {
        self.record(Op::Unregister);
        Ok(())
    }

    async fn invite(&self, id: &SessionId, target: &rsip::Uri) -> CallResult<()> {
        self.record(Op::Invite(id.clone(), target.to_string()));
        Ok(())
    }

    async fn answer(&self, id: &SessionId) -> CallResult<()> {
        self.record(Op::Answer(id.clone()));
        self.in_flight().await;
        Ok(())
    }

    async fn reject(&self, id: &SessionId, code: u16) -> CallResult<()> {
        self.record(Op::Reject(id.clone(), code));
        self.in_flight().await;
        Ok(())
    }

    async fn cancel(&self, id: &SessionId) -> CallResult<()> {
        self.record(Op::Cancel(id.clone()));
        self.in_flight().await;
        Ok(())
    }

    async fn bye(&self, id: &SessionId) -> CallResult<()> {
        self.record(Op::Bye(id.clone()));
        self.in_flight().await;
        Ok(())
    }
}

/// 可以拒绝麦克风权限的媒体实现
#[derive(Default)]
pub struct MockMedia {
    deny_microphone: AtomicBool,
}

impl MockMedia {
    pub fn deny_microphone(&self) {
        self.deny_microphone.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaTransport for MockMedia {
    async fn acquire_microphone(&self) -> Result<(), MediaError> {
        if self.deny_microphone.load(Ordering::SeqCst) {
            return Err(MediaError::AccessDenied("permission denied".to_string()));
        }
        Ok(())
    }

    async fn local_description(&self) -> Result<String, MediaError> {
        Ok("v=0\r\nm=audio 20000 RTP/AVP 0\r\n".to_string())
    }

    async fn apply_remote_description(
        &self,
        _sdp: &str,
    ) -> Result<Arc<dyn MediaHandle>, MediaError> {
        Ok(TrackSet::audio())
    }
}

pub struct Harness {
    pub phone: Phone,
    pub signaling: Arc<MockSignaling>,
    pub media: Arc<MockMedia>,
    pub events: UnboundedReceiver<PhoneEvent>,
}

pub fn config() -> Config {
    Config::new("pbx.example.com").unwrap()
}

pub fn credentials() -> Credentials {
    Credentials::new("1001", "secret", "Agent 1001")
}

pub fn harness() -> Harness {
    let (signaling, signaling_events) = MockSignaling::new();
    let media = Arc::new(MockMedia::default());
    let (listener, events) = events::channel();
    let phone = Phone::new(
        config(),
        signaling.clone(),
        signaling_events,
        media.clone(),
        listener,
    );
    Harness {
        phone,
        signaling,
        media,
        events,
    }
}

/// 登录完成并处理完初始事件
pub async fn logged_in() -> Harness {
    let mut h = harness();
    h.phone.login(credentials()).await.unwrap();
    settle().await;
    h.drain();
    h
}

/// 让事件处理任务处理完已排队的事件
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

impl Harness {
    /// 取出目前收到的全部事件
    pub fn drain(&mut self) -> Vec<PhoneEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    pub fn emit(&self, event: SignalingEvent) {
        self.signaling.emit(event);
    }
}

pub fn call_ended_count(events: &[PhoneEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, PhoneEvent::CallEnded))
        .count()
}

pub fn registered_count(events: &[PhoneEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, PhoneEvent::Registered))
        .count()
}

pub fn has_debug(events: &[PhoneEvent], needle: &str) -> bool {
    events
        .iter()
        .any(|e| matches!(e, PhoneEvent::Debug(m) if m.contains(needle)))
}
