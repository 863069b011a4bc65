/// 软电话核心
///
/// 登录时建立信令连接并注册，登出时注销并关闭连接。
/// 信令事件由单个任务按到达顺序处理，分发给注册管理器、重连策略和会话管理器。
use crate::config::Config;
use crate::error::{CallResult, ConfigError, SipError};
use crate::events::{EventDispatcher, PhoneEvents};
use crate::media::MediaTransport;
use crate::reconnect::{ReconnectOutcome, ReconnectionPolicy};
use crate::registration::{RegistrationManager, RegistrationState};
use crate::session::SessionRef;
use crate::session_manager::SessionManager;
use crate::signaling::{Credentials, Identity, Signaling, SignalingEvent, SignalingEventReceiver};
use crate::transport::TransportConnection;
use std::sync::{Arc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 一次登录对应的连接和注册状态
#[derive(Clone)]
struct ConnectionContext {
    connection: Arc<TransportConnection>,
    registration: Arc<RegistrationManager>,
}

struct PhoneInner {
    config: Config,
    signaling: Arc<dyn Signaling>,
    events: EventDispatcher,
    sessions: SessionManager,
    reconnection: Arc<ReconnectionPolicy>,
    context: RwLock<Option<ConnectionContext>>,
    login_lock: tokio::sync::Mutex<()>,
}

pub struct Phone {
    inner: Arc<PhoneInner>,
    cancel_token: CancellationToken,
}

impl Phone {
    /// 创建软电话并启动信令事件处理任务，需要在 tokio 运行时中调用
    pub fn new(
        config: Config,
        signaling: Arc<dyn Signaling>,
        signaling_events: SignalingEventReceiver,
        media: Arc<dyn MediaTransport>,
        listener: Arc<dyn PhoneEvents>,
    ) -> Self {
        let events = EventDispatcher::new(listener);
        let inner = Arc::new(PhoneInner {
            sessions: SessionManager::new(config.domain.clone(), media, events.clone()),
            reconnection: ReconnectionPolicy::new(config.reconnection, events.clone()),
            config,
            signaling,
            events,
            context: RwLock::new(None),
            login_lock: tokio::sync::Mutex::new(()),
        });
        let cancel_token = CancellationToken::new();

        Self::start_event_handler(signaling_events, inner.clone(), cancel_token.clone());

        Self {
            inner,
            cancel_token,
        }
    }

    /// 启动信令事件处理器
    fn start_event_handler(
        mut signaling_events: SignalingEventReceiver,
        inner: Arc<PhoneInner>,
        cancel_token: CancellationToken,
    ) {
        tokio::spawn(async move {
            while let Some(event) = tokio::select! {
                ev = signaling_events.recv() => ev,
                _ = cancel_token.cancelled() => None,
            } {
                inner.handle_event(event);
            }
            debug!("信令事件处理器退出");
        });
    }

    /// 登录：建立信令连接并注册
    ///
    /// 已登录时为空操作。注册失败通过 `on_registration_failed` 上报，不作为错误返回。
    pub async fn login(&self, credentials: Credentials) -> Result<(), SipError> {
        let inner = &self.inner;
        let _guard = inner.login_lock.lock().await;

        if let Some(existing) = inner.context() {
            if !existing.connection.is_closed() && !inner.reconnection.is_exhausted() {
                debug!("已登录，忽略重复登录");
                return Ok(());
            }
            // 重连耗尽后重新登录，先清理旧连接
            inner.teardown(existing).await;
        }

        if credentials.extension.trim().is_empty() || credentials.password.is_empty() {
            inner.events.debug("[Error] Missing extension or password");
            return Err(ConfigError::Missing("extension or password".to_string()).into());
        }

        let identity = Identity::new(credentials, &inner.config.domain)?;
        info!("登录: {} -> {}", identity.uri, inner.config.endpoint_url());

        let connection = match TransportConnection::connect(
            identity,
            inner.config.endpoint_url(),
            inner.signaling.clone(),
        )
        .await
        {
            Ok(conn) => conn,
            Err(e) => {
                warn!("信令连接失败: {}", e);
                inner.events.debug(format!("[ERROR] Connection failed: {}", e));
                return Err(e.into());
            }
        };
        inner.events.debug("[DEBUG] WebSocket connected.");

        let registration = Arc::new(RegistrationManager::new(inner.events.clone()));
        *inner.context.write().unwrap_or_else(|p| p.into_inner()) = Some(ConnectionContext {
            connection: connection.clone(),
            registration: registration.clone(),
        });
        inner.sessions.attach(connection.clone());
        inner.reconnection.arm();

        // 失败已经通过事件上报
        let _ = registration.register(&connection).await;
        Ok(())
    }

    /// 登出：停止重连、结束所有通话、注销并关闭连接
    pub async fn logout(&self) {
        let inner = &self.inner;
        let _guard = inner.login_lock.lock().await;

        inner.reconnection.disarm();
        let Some(context) = inner.take_context() else {
            debug!("未登录，忽略登出");
            return;
        };
        inner.teardown(context).await;
        inner.events.debug("[INFO] Logged out successfully.");
    }

    pub async fn call(&self, destination: &str) -> CallResult<SessionRef> {
        self.inner.sessions.call(destination).await
    }

    pub async fn accept_call(&self, session: &SessionRef) -> CallResult<()> {
        self.inner.sessions.accept_call(session).await
    }

    pub async fn reject_call(&self, session: &SessionRef) {
        self.inner.sessions.reject_call(session).await
    }

    pub async fn hangup(&self, session: Option<SessionRef>) {
        self.inner.sessions.hangup(session).await
    }

    pub fn toggle_mute(&self, muted: bool) {
        self.inner.sessions.toggle_mute(muted)
    }

    /// 网络恢复通知（如系统的 online 事件），连接存活时为空操作
    pub fn network_online(&self) -> Option<JoinHandle<ReconnectOutcome>> {
        let context = self.inner.context()?;
        self.inner
            .reconnection
            .attempt_reconnection(context.connection)
    }

    pub fn active_session(&self) -> Option<SessionRef> {
        self.inner.sessions.active_session()
    }

    /// 当前注册状态，未登录时为 `None`
    pub fn registration_state(&self) -> Option<RegistrationState> {
        self.inner.context().map(|c| c.registration.state())
    }

    pub fn is_registered(&self) -> bool {
        self.registration_state()
            .map(RegistrationState::is_registered)
            .unwrap_or(false)
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .context()
            .map(|c| c.connection.is_connected())
            .unwrap_or(false)
    }

    pub fn reconnection(&self) -> &Arc<ReconnectionPolicy> {
        &self.inner.reconnection
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// 登出并停止事件处理
    pub async fn shutdown(&self) {
        self.logout().await;
        self.cancel_token.cancel();
    }
}

impl Drop for Phone {
    fn drop(&mut self) {
        self.inner.reconnection.disarm();
        self.cancel_token.cancel();
    }
}

impl PhoneInner {
    fn context(&self) -> Option<ConnectionContext> {
        self.context.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn take_context(&self) -> Option<ConnectionContext> {
        self.context.write().unwrap_or_else(|p| p.into_inner()).take()
    }

    async fn teardown(&self, context: ConnectionContext) {
        self.sessions.hangup_all().await;
        context
            .registration
            .unregister(Some(&context.connection))
            .await;
        context.connection.disconnect().await;
        self.sessions.detach();
        let mut slot = self.context.write().unwrap_or_else(|p| p.into_inner());
        if slot
            .as_ref()
            .map(|c| Arc::ptr_eq(&c.connection, &context.connection))
            .unwrap_or(false)
        {
            *slot = None;
        }
    }

    fn handle_event(&self, event: SignalingEvent) {
        match event {
            SignalingEvent::Connected => {
                let Some(context) = self.context() else {
                    return;
                };
                context.connection.mark_connected();
                self.events.debug("[DEBUG] WebSocket connected.");

                // 重新注册需要网络往返，不阻塞事件处理
                tokio::spawn(async move {
                    context
                        .registration
                        .on_transport_connected(&context.connection)
                        .await;
                });
            }
            // 本地主动关闭，状态已由登出/重新登录处理；此时槽里可能已是新连接
            SignalingEvent::Disconnected { error: None } => {
                self.events.debug("[DEBUG] WebSocket disconnected.");
            }
            SignalingEvent::Disconnected { error: Some(error) } => {
                let Some(context) = self.context() else {
                    return;
                };
                context.connection.mark_disconnected();
                self.events
                    .debug(format!("[DEBUG] WebSocket disconnected. {}", error));
                context.registration.on_transport_lost();
                self.sessions.on_transport_lost();
                self.reconnection.attempt_reconnection(context.connection);
            }
            other => self.sessions.handle_signal(other),
        }
    }
}
