/// 事件分发
///
/// 把注册/呼叫状态变化通知给界面或存储层，核心不依赖任何展示层。
/// 回调在信令事件处理过程中同步调用，实现方不得阻塞，耗时工作应自行转交到其他任务。
use crate::error::RegistrationError;
use crate::session::SessionRef;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// 订阅方接口，未实现的回调默认忽略
pub trait PhoneEvents: Send + Sync {
    fn on_registered(&self) {}

    fn on_unregistered(&self) {}

    fn on_registration_failed(&self, _error: &RegistrationError) {}

    fn on_incoming_call(&self, _session: &SessionRef, _caller: &str) {}

    fn on_call_established(&self, _session: &SessionRef) {}

    fn on_call_ended(&self) {}

    fn on_debug(&self, _message: &str) {}
}

/// 不关心任何事件的订阅方
pub struct NoopEvents;

impl PhoneEvents for NoopEvents {}

/// 管理器内部使用的分发器
#[derive(Clone)]
pub struct EventDispatcher {
    listener: Arc<dyn PhoneEvents>,
}

impl EventDispatcher {
    pub fn new(listener: Arc<dyn PhoneEvents>) -> Self {
        Self { listener }
    }

    pub fn registered(&self) {
        self.listener.on_registered();
    }

    pub fn unregistered(&self) {
        self.listener.on_unregistered();
    }

    pub fn registration_failed(&self, error: &RegistrationError) {
        self.listener.on_registration_failed(error);
    }

    pub fn incoming_call(&self, session: &SessionRef, caller: &str) {
        self.listener.on_incoming_call(session, caller);
    }

    pub fn call_established(&self, session: &SessionRef) {
        self.listener.on_call_established(session);
    }

    pub fn call_ended(&self) {
        self.listener.on_call_ended();
    }

    /// 诊断信息，同时写入日志
    pub fn debug(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        debug!(target: "sip_agent::diagnostic", "{}", message);
        self.listener.on_debug(message);
    }
}

/// 以消息形式投递的事件
#[derive(Debug, Clone)]
pub enum PhoneEvent {
    Registered,
    Unregistered,
    RegistrationFailed(RegistrationError),
    IncomingCall { session: SessionRef, caller: String },
    CallEstablished(SessionRef),
    CallEnded,
    Debug(String),
}

/// 把回调转发到 mpsc 通道
pub struct ChannelEvents {
    sender: mpsc::UnboundedSender<PhoneEvent>,
}

/// 创建通道形式的订阅方
pub fn channel() -> (Arc<ChannelEvents>, mpsc::UnboundedReceiver<PhoneEvent>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (Arc::new(ChannelEvents { sender }), receiver)
}

impl ChannelEvents {
    fn send(&self, event: PhoneEvent) {
        // 接收端已关闭时直接丢弃
        let _ = self.sender.send(event);
    }
}

impl PhoneEvents for ChannelEvents {
    fn on_registered(&self) {
        self.send(PhoneEvent::Registered);
    }

    fn on_unregistered(&self) {
        self.send(PhoneEvent::Unregistered);
    }

    fn on_registration_failed(&self, error: &RegistrationError) {
        self.send(PhoneEvent::RegistrationFailed(error.clone()));
    }

    fn on_incoming_call(&self, session: &SessionRef, caller: &str) {
        self.send(PhoneEvent::IncomingCall {
            session: session.clone(),
            caller: caller.to_string(),
        });
    }

    fn on_call_established(&self, session: &SessionRef) {
        self.send(PhoneEvent::CallEstablished(session.clone()));
    }

    fn on_call_ended(&self) {
        self.send(PhoneEvent::CallEnded);
    }

    fn on_debug(&self, message: &str) {
        self.send(PhoneEvent::Debug(message.to_string()));
    }
}
