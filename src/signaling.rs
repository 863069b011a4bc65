/// 信令层抽象
///
/// 会话/注册管理器只依赖这里的 `Signaling` trait，具体的线路编码
/// （SIP over WebSocket/UDP/TCP）由实现方负责，见 `sip_client::SipClient`。
use crate::error::{CallError, CallResult, ConnectError, RegistrationError};
use crate::media::MediaHandle;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// 会话标识（即 SIP Call-ID）
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// 生成新的会话标识
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 认证服务提供的登录信息，核心只当作不透明字符串
#[derive(Clone)]
pub struct Credentials {
    pub extension: String,
    pub password: String,
    pub display_name: String,
}

impl Credentials {
    pub fn new(
        extension: impl Into<String>,
        password: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            extension: extension.into(),
            password: password.into(),
            display_name: display_name.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("extension", &self.extension)
            .field("password", &"***")
            .field("display_name", &self.display_name)
            .finish()
    }
}

/// 本地身份：`sip:<extension>@<domain>` + 认证信息
#[derive(Debug, Clone)]
pub struct Identity {
    pub uri: rsip::Uri,
    pub credentials: Credentials,
}

impl Identity {
    pub fn new(credentials: Credentials, domain: &str) -> Result<Self, ConnectError> {
        let uri = build_sip_uri(&credentials.extension, domain)
            .map_err(|_| ConnectError::InvalidIdentity(format!("{}@{}", credentials.extension, domain)))?;
        Ok(Self { uri, credentials })
    }

    pub fn extension(&self) -> &str {
        &self.credentials.extension
    }
}

/// 由用户部分和域名构造 SIP URI
///
/// 用户部分只允许 RFC 3261 的 user 字符集，空串、空白、`@`、`:` 都会被拒绝。
pub fn build_sip_uri(user: &str, domain: &str) -> CallResult<rsip::Uri> {
    if !is_valid_user_part(user) || domain.is_empty() {
        return Err(CallError::invalid_destination(user));
    }
    rsip::Uri::try_from(format!("sip:{}@{}", user, domain).as_str())
        .map_err(|_| CallError::invalid_destination(user))
}

fn is_valid_user_part(user: &str) -> bool {
    static USER_PART: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = USER_PART.get_or_init(|| {
        regex::Regex::new(r"^(?:[A-Za-z0-9\-_.!~*'()&=+$,;?/]|%[0-9A-Fa-f]{2})+$")
            .expect("static regex")
    });
    re.is_match(user)
}

/// 信令层上报的事件，按到达顺序串行处理
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// 信令通道已连接
    Connected,

    /// 信令通道断开；`error` 为 `None` 表示本地主动关闭
    Disconnected { error: Option<String> },

    /// 收到来电
    IncomingInvite { id: SessionId, caller: String },

    /// 会话建立（呼出收到 200 OK，呼入收到 ACK）
    Established {
        id: SessionId,
        media: Option<Arc<dyn MediaHandle>>,
    },

    /// 呼出被拒绝或失败
    Failed {
        id: SessionId,
        code: Option<u16>,
        reason: String,
    },

    /// 对端发送 BYE
    RemoteBye { id: SessionId },

    /// 来电在接听前被对端取消
    RemoteCancel { id: SessionId },
}

pub type SignalingEventSender = mpsc::UnboundedSender<SignalingEvent>;
pub type SignalingEventReceiver = mpsc::UnboundedReceiver<SignalingEvent>;

/// 创建信令事件通道
pub fn event_channel() -> (SignalingEventSender, SignalingEventReceiver) {
    mpsc::unbounded_channel()
}

/// 信令协议的抽象操作
///
/// 所有方法都是一次网络往返；实现方通过构造时拿到的
/// `SignalingEventSender` 异步上报连接和会话事件。
#[async_trait]
pub trait Signaling: Send + Sync {
    /// 建立信令通道，成功后应上报 `SignalingEvent::Connected`
    async fn connect(&self, identity: &Identity) -> Result<(), ConnectError>;

    /// 关闭信令通道，重复调用无副作用
    async fn disconnect(&self);

    async fn register(&self, identity: &Identity) -> Result<(), RegistrationError>;

    async fn unregister(&self, identity: &Identity) -> Result<(), RegistrationError>;

    /// 发送 INVITE；最终结果通过 `Established`/`Failed` 事件上报
    async fn invite(&self, id: &SessionId, target: &rsip::Uri) -> CallResult<()>;

    /// 接听来电
    async fn answer(&self, id: &SessionId) -> CallResult<()>;

    /// 拒接来电（`code` 通常为 480）
    async fn reject(&self, id: &SessionId, code: u16) -> CallResult<()>;

    /// 取消尚未接通的呼出
    async fn cancel(&self, id: &SessionId) -> CallResult<()>;

    /// 结束已建立的会话
    async fn bye(&self, id: &SessionId) -> CallResult<()>;
}
