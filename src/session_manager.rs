/// 会话管理器
///
/// 创建呼出会话、接收来电、驱动会话状态机，并提供接听/拒接/挂断/静音。
/// 同一时刻只有一个“当前通话”；当前通话槽只由本管理器写入，
/// 并且总是在 `on_call_ended` 通知之前清空。
use crate::error::{CallError, CallResult};
use crate::events::EventDispatcher;
use crate::media::{stop_all_tracks, MediaHandle, MediaTransport, TrackKind};
use crate::session::{Direction, Session, SessionRef, SessionState};
use crate::signaling::{build_sip_uri, SessionId, SignalingEvent};
use crate::transport::TransportConnection;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// 拒接来电使用的状态码（Temporarily Unavailable）
pub const REJECT_STATUS_CODE: u16 = 480;

pub struct SessionManager {
    domain: String,
    connection: RwLock<Option<Arc<TransportConnection>>>,
    active: Mutex<Option<SessionRef>>,
    sessions: Mutex<HashMap<SessionId, SessionRef>>,
    media: Arc<dyn MediaTransport>,
    events: EventDispatcher,
}

impl SessionManager {
    pub fn new(domain: impl Into<String>, media: Arc<dyn MediaTransport>, events: EventDispatcher) -> Self {
        Self {
            domain: domain.into(),
            connection: RwLock::new(None),
            active: Mutex::new(None),
            sessions: Mutex::new(HashMap::new()),
            media,
            events,
        }
    }

    /// 绑定新的信令连接
    pub fn attach(&self, connection: Arc<TransportConnection>) {
        *self.connection.write().unwrap_or_else(|p| p.into_inner()) = Some(connection);
    }

    /// 解绑信令连接；已有会话随之不可用
    pub fn detach(&self) {
        *self.connection.write().unwrap_or_else(|p| p.into_inner()) = None;
    }

    /// 当前通话
    pub fn active_session(&self) -> Option<SessionRef> {
        self.active.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn session(&self, id: &SessionId) -> Option<SessionRef> {
        self.sessions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .cloned()
    }

    fn live_connection(&self) -> CallResult<Arc<TransportConnection>> {
        match self
            .connection
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
        {
            Some(conn) if !conn.is_closed() => Ok(conn.clone()),
            _ => Err(CallError::NotInitialized),
        }
    }

    /// 发起呼叫
    ///
    /// 目标地址为 `sip:<destination>@<domain>`，无法构造时在发送任何信令之前失败。
    /// 已有通话时先挂断当前通话。
    pub async fn call(&self, destination: &str) -> CallResult<SessionRef> {
        let connection = self.live_connection()?;
        let target = build_sip_uri(destination.trim(), &self.domain).map_err(|e| {
            self.events.debug("[Error] Invalid destination URI.");
            e
        })?;

        if let Some(current) = self.active_session() {
            if !current.state().is_terminal() {
                info!("发起新呼叫前挂断当前通话: {}", current.id());
                self.hangup(Some(current)).await;
            }
        }

        let session = Session::new(
            SessionId::generate(),
            Direction::Outgoing,
            destination.trim(),
            &connection,
        );
        self.track(&session);
        self.set_active(Some(session.clone()));
        session.transition(SessionState::Establishing)?;

        info!("📞发起呼叫到: {} (Call-ID: {})", target, session.id());
        self.events
            .debug(format!("[INFO] Calling extension {}...", destination.trim()));

        let sent = match connection.signaling() {
            Ok(signaling) => signaling.invite(session.id(), &target).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            warn!("INVITE 发送失败: {}", e);
            self.events.debug(format!("[Error] Failed to make call: {}", e));
            if session.transition(SessionState::Terminated).is_ok() {
                self.finish(&session);
            }
            return Err(e);
        }

        Ok(session)
    }

    /// 接听来电
    ///
    /// 只能在来电处于 Initial 时调用。先获取麦克风权限，失败时不改变会话状态。
    pub async fn accept_call(&self, session: &SessionRef) -> CallResult<()> {
        let state = session.state();
        if session.direction() != Direction::Incoming || state != SessionState::Initial {
            let err = CallError::InvalidSessionOperation {
                session: session.id().to_string(),
                operation: "accept",
                state: state.to_string(),
            };
            self.events.debug(format!("[WARNING] {}", err));
            return Err(err);
        }
        let connection = session.connection()?;

        if let Err(e) = self.media.acquire_microphone().await {
            warn!("麦克风权限获取失败: {}", e);
            self.events
                .debug(format!("[ERROR] Microphone access failed: {}", e));
            return Err(CallError::media_access_denied(e.to_string()));
        }

        if let Some(current) = self.active_session() {
            if current.id() != session.id() && !current.state().is_terminal() {
                info!("接听前挂断当前通话: {}", current.id());
                self.hangup(Some(current)).await;
            }
        }

        session.transition(SessionState::Establishing)?;
        self.set_active(Some(session.clone()));
        info!("接听来电: {} ({})", session.remote_identity(), session.id());

        let answered = match connection.signaling() {
            Ok(signaling) => signaling.answer(session.id()).await,
            Err(e) => Err(e),
        };
        if let Err(e) = answered {
            warn!("接听失败: {}", e);
            self.events.debug(format!("[ERROR] Failed to accept call: {}", e));
            if session.transition(SessionState::Terminated).is_ok() {
                self.finish(&session);
            }
            return Err(e);
        }
        Ok(())
    }

    /// 拒接来电（480 Temporarily Unavailable）
    ///
    /// 已结束的会话为空操作；其他不适用的状态只记录诊断。
    pub async fn reject_call(&self, session: &SessionRef) {
        let state = session.state();
        if state.is_ending() {
            debug!("会话 {} 已结束，忽略拒接", session.id());
            return;
        }
        if session.direction() != Direction::Incoming || state != SessionState::Initial {
            self.events.debug(format!(
                "[WARNING] Cannot reject session {} in state {}",
                session.id(),
                state
            ));
            return;
        }

        info!("拒接来电: {} ({})", session.remote_identity(), session.id());
        // 先进入终态，等待信令期间到达的事件不再推进会话
        if !self.advance(session, SessionState::Terminated) {
            return;
        }
        self.send_reject(session).await;
        self.finish(session);
    }

    /// 挂断指定会话，未指定时挂断当前通话
    ///
    /// 根据状态发送 CANCEL、拒接或 BYE，结束前停止所有本地媒体轨道。
    /// 每个会话的 `on_call_ended` 最多通知一次；没有目标会话时不产生任何事件。
    pub async fn hangup(&self, session: Option<SessionRef>) {
        let Some(session) = session.or_else(|| self.active_session()) else {
            debug!("没有可挂断的通话");
            return;
        };

        self.events.debug("[INFO] Hanging up...");
        let state = session.state();
        // 状态先于信令推进：CANCEL 发出后迟到的应答只会被忽略
        match (state, session.direction()) {
            (SessionState::Initial | SessionState::Establishing, Direction::Outgoing) => {
                self.release_media(&session);
                if self.advance(&session, SessionState::Terminated) {
                    self.send_cancel(&session).await;
                }
            }
            (SessionState::Initial | SessionState::Establishing, Direction::Incoming) => {
                self.release_media(&session);
                if self.advance(&session, SessionState::Terminated) {
                    self.send_reject(&session).await;
                }
            }
            (SessionState::Established, _) => {
                self.release_media(&session);
                if self.advance(&session, SessionState::Terminating) {
                    self.events.debug("[INFO] Sending BYE request...");
                    self.send_bye(&session).await;
                    self.advance(&session, SessionState::Terminated);
                }
            }
            (SessionState::Terminating | SessionState::Terminated, _) => {
                self.events
                    .debug("[INFO] Session already terminating or terminated");
            }
        }

        self.finish(&session);
    }

    /// 静音/取消静音当前通话的发送音频轨道，不改变会话状态
    pub fn toggle_mute(&self, muted: bool) {
        let Some(media) = self.active_session().and_then(|s| s.media()) else {
            return;
        };
        for track in media.senders() {
            if track.kind() == TrackKind::Audio {
                track.set_enabled(!muted);
            }
        }
        debug!("静音: {}", muted);
    }

    /// 结束所有未结束的会话并清空会话表，登出时调用
    pub async fn hangup_all(&self) {
        for session in self.tracked() {
            if !session.state().is_terminal() {
                self.hangup(Some(session)).await;
            }
        }
        self.sessions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }

    /// 信令连接丢失：对话已不可用，不发送信令直接结束所有会话
    pub fn on_transport_lost(&self) {
        for session in self.tracked() {
            if session.state().is_terminal() {
                continue;
            }
            info!("连接丢失，结束通话: {}", session.id());
            self.events.debug(format!(
                "[WARNING] Call {} lost: connection dropped",
                session.id()
            ));
            self.end_remotely(&session);
        }
    }

    /// 处理与会话相关的信令事件
    pub fn handle_signal(&self, event: SignalingEvent) {
        match event {
            SignalingEvent::IncomingInvite { id, caller } => self.ingest_invite(id, caller),
            SignalingEvent::Established { id, media } => self.on_established(&id, media),
            SignalingEvent::Failed { id, code, reason } => {
                let Some(session) = self.session(&id) else {
                    return;
                };
                info!("呼叫失败: {} ({:?} {})", id, code, reason);
                self.events.debug(match code {
                    Some(code) => format!("[INFO] Call failed: {} {}", code, reason),
                    None => format!("[INFO] Call failed: {}", reason),
                });
                self.end_remotely(&session);
            }
            SignalingEvent::RemoteBye { id } => {
                let Some(session) = self.session(&id) else {
                    return;
                };
                info!("对端主动挂断: {}", id);
                self.events.debug("[INFO] Remote party hung up.");
                self.end_remotely(&session);
            }
            SignalingEvent::RemoteCancel { id } => {
                let Some(session) = self.session(&id) else {
                    return;
                };
                info!("来电已被对端取消: {}", id);
                self.events.debug("[INFO] Caller cancelled the call.");
                self.end_remotely(&session);
            }
            SignalingEvent::Connected | SignalingEvent::Disconnected { .. } => {}
        }
    }

    fn ingest_invite(&self, id: SessionId, caller: String) {
        let connection = match self.live_connection() {
            Ok(conn) => conn,
            Err(_) => {
                warn!("收到来电但没有可用连接: {}", id);
                return;
            }
        };
        if self.session(&id).is_some() {
            debug!("重复的来电: {}", id);
            return;
        }

        let session = Session::new(id, Direction::Incoming, caller.clone(), &connection);
        self.track(&session);

        // 有通话进行中时不占用当前通话槽，由用户决定是否接听
        let busy = self
            .active_session()
            .map(|s| !s.state().is_terminal())
            .unwrap_or(false);
        if !busy {
            self.set_active(Some(session.clone()));
        }

        info!("收到来电: {} ({})", caller, session.id());
        self.events
            .debug(format!("[INFO] Incoming call from {}", caller));
        self.events.incoming_call(&session, &caller);
    }

    fn on_established(&self, id: &SessionId, media: Option<Arc<dyn MediaHandle>>) {
        let Some(session) = self.session(id) else {
            debug!("未知会话的接通事件: {}", id);
            return;
        };
        if let Err(e) = session.transition(SessionState::Established) {
            self.events.debug(format!("[WARNING] Ignoring answer: {}", e));
            return;
        }

        if let Some(media) = media {
            // 接通后开启远端音频
            for receiver in media.receivers() {
                receiver.set_enabled(true);
            }
            session.set_media(media);
        }

        info!("✅ 通话已建立: {} ({})", session.remote_identity(), id);
        if session.mark_established_notified() {
            self.events.debug("[INFO] Call established.");
            self.events.call_established(&session);
        }
    }

    /// 对端结束或失败：沿状态图走到 Terminated
    fn end_remotely(&self, session: &SessionRef) {
        match session.state() {
            SessionState::Established => {
                self.advance(session, SessionState::Terminating);
            }
            SessionState::Terminated => return,
            _ => {}
        }
        self.release_media(session);
        if self.advance(session, SessionState::Terminated) {
            self.finish(session);
        }
    }

    /// 沿状态图推进会话；已结束的会话保持不变，非法转换记录诊断
    fn advance(&self, session: &SessionRef, next: SessionState) -> bool {
        if session.state() == SessionState::Terminated {
            return false;
        }
        match session.transition(next) {
            Ok(_) => true,
            Err(e) => {
                warn!("会话状态转换失败: {}", e);
                self.events.debug(format!("[WARNING] {}", e));
                false
            }
        }
    }

    /// 会话结束：停止媒体，移出当前通话槽，然后通知一次
    fn finish(&self, session: &SessionRef) {
        self.release_media(session);
        self.sessions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(session.id());
        {
            let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
            if active.as_ref().map(|s| s.id() == session.id()).unwrap_or(false) {
                *active = None;
            }
        }
        if session.mark_ended_notified() {
            info!("通话结束: {} (时长 {:?})", session.id(), session.duration());
            self.events.debug("[INFO] Call ended.");
            self.events.call_ended();
        }
    }

    fn release_media(&self, session: &SessionRef) {
        if let Some(media) = session.media() {
            stop_all_tracks(media.as_ref());
        }
    }

    async fn send_cancel(&self, session: &SessionRef) {
        match session.connection().and_then(|c| c.signaling().cloned()) {
            Ok(signaling) => {
                if let Err(e) = signaling.cancel(session.id()).await {
                    warn!("CANCEL 失败: {}", e);
                    self.events.debug(format!("[ERROR] Failed to hangup: {}", e));
                }
            }
            Err(e) => self.events.debug(format!("[ERROR] Failed to hangup: {}", e)),
        }
    }

    async fn send_reject(&self, session: &SessionRef) {
        match session.connection().and_then(|c| c.signaling().cloned()) {
            Ok(signaling) => {
                if let Err(e) = signaling.reject(session.id(), REJECT_STATUS_CODE).await {
                    warn!("拒接失败: {}", e);
                    self.events.debug(format!("[ERROR] Failed to reject: {}", e));
                }
            }
            Err(e) => self.events.debug(format!("[ERROR] Failed to reject: {}", e)),
        }
    }

    async fn send_bye(&self, session: &SessionRef) {
        match session.connection().and_then(|c| c.signaling().cloned()) {
            Ok(signaling) => {
                if let Err(e) = signaling.bye(session.id()).await {
                    warn!("BYE 失败: {}", e);
                    self.events.debug(format!("[ERROR] Failed to hangup: {}", e));
                }
            }
            Err(e) => self.events.debug(format!("[ERROR] Failed to hangup: {}", e)),
        }
    }

    fn tracked(&self) -> Vec<SessionRef> {
        self.sessions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn track(&self, session: &SessionRef) {
        self.sessions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(session.id().clone(), session.clone());
    }

    fn set_active(&self, session: Option<SessionRef>) {
        *self.active.lock().unwrap_or_else(|p| p.into_inner()) = session;
    }
}
