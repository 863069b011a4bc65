/// 呼叫会话
///
/// 呼出和呼入共用同一个状态机，只用 `Direction` 区分构造方式和
/// 挂断时的信令分支（CANCEL/拒接/BYE）。
use crate::error::{CallError, CallResult};
use crate::media::MediaHandle;
use crate::signaling::SessionId;
use crate::transport::TransportConnection;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tracing::debug;

pub type SessionRef = Arc<Session>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Initial,
    Establishing,
    Established,
    Terminating,
    Terminated,
}

impl SessionState {
    /// 合法的状态迁移
    ///
    /// ```text
    /// Initial      -> Establishing | Terminated
    /// Establishing -> Established  | Terminated
    /// Established  -> Terminating
    /// Terminating  -> Terminated
    /// ```
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Initial, Establishing)
                | (Initial, Terminated)
                | (Establishing, Established)
                | (Establishing, Terminated)
                | (Established, Terminating)
                | (Terminating, Terminated)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == SessionState::Terminated
    }

    /// 正在挂断或已结束
    pub fn is_ending(self) -> bool {
        matches!(self, SessionState::Terminating | SessionState::Terminated)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Initial => "Initial",
            SessionState::Establishing => "Establishing",
            SessionState::Established => "Established",
            SessionState::Terminating => "Terminating",
            SessionState::Terminated => "Terminated",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct SessionInner {
    state: SessionState,
    media: Option<Arc<dyn MediaHandle>>,
    established_at: Option<Instant>,
    ended_at: Option<Instant>,
    history: Vec<SessionState>,
}

pub struct Session {
    id: SessionId,
    direction: Direction,
    remote_identity: String,
    connection: Weak<TransportConnection>,
    inner: Mutex<SessionInner>,
    established_notified: AtomicBool,
    ended_notified: AtomicBool,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        direction: Direction,
        remote_identity: impl Into<String>,
        connection: &Arc<TransportConnection>,
    ) -> SessionRef {
        Arc::new(Self {
            id,
            direction,
            remote_identity: remote_identity.into(),
            connection: Arc::downgrade(connection),
            inner: Mutex::new(SessionInner {
                state: SessionState::Initial,
                media: None,
                established_at: None,
                ended_at: None,
                history: vec![SessionState::Initial],
            }),
            established_notified: AtomicBool::new(false),
            ended_notified: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn remote_identity(&self) -> &str {
        &self.remote_identity
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// 依次经过的状态，第一个总是 `Initial`
    pub fn state_history(&self) -> Vec<SessionState> {
        self.lock().history.clone()
    }

    pub fn media(&self) -> Option<Arc<dyn MediaHandle>> {
        self.lock().media.clone()
    }

    /// 通话时长，未接通时为零
    pub fn duration(&self) -> Duration {
        let inner = self.lock();
        match (inner.established_at, inner.ended_at) {
            (Some(start), Some(end)) => end.saturating_duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }

    /// 会话所在的连接；连接已销毁或关闭时返回 `NotInitialized`
    pub fn connection(&self) -> CallResult<Arc<TransportConnection>> {
        match self.connection.upgrade() {
            Some(conn) if !conn.is_closed() => Ok(conn),
            _ => Err(CallError::NotInitialized),
        }
    }

    /// 按状态图迁移，返回迁移前的状态
    pub(crate) fn transition(&self, next: SessionState) -> CallResult<SessionState> {
        let mut inner = self.lock();
        let current = inner.state;
        if !current.can_transition_to(next) {
            return Err(CallError::InvalidSessionOperation {
                session: self.id.to_string(),
                operation: "transition",
                state: current.to_string(),
            });
        }

        inner.state = next;
        inner.history.push(next);
        match next {
            SessionState::Established => inner.established_at = Some(Instant::now()),
            SessionState::Terminated => inner.ended_at = Some(Instant::now()),
            _ => {}
        }
        debug!("会话 {} 状态: {} -> {}", self.id, current, next);
        Ok(current)
    }

    pub(crate) fn set_media(&self, media: Arc<dyn MediaHandle>) {
        self.lock().media = Some(media);
    }

    /// 标记已通知接通，只有第一次返回 true
    pub(crate) fn mark_established_notified(&self) -> bool {
        !self.established_notified.swap(true, Ordering::SeqCst)
    }

    /// 标记已通知结束，只有第一次返回 true
    pub(crate) fn mark_ended_notified(&self) -> bool {
        !self.ended_notified.swap(true, Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        // 临界区内不会 panic，锁中毒时沿用内部数据
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("remote_identity", &self.remote_identity)
            .field("state", &self.state())
            .finish()
    }
}
