use thiserror::Error;

/// 顶层错误类型，汇总各子系统错误
#[derive(Error, Debug)]
pub enum SipError {
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Connect error: {0}")]
    Connect(#[from] ConnectError),

    #[error("Registration failed: {0}")]
    Registration(#[from] RegistrationError),

    #[error("Call failed: {0}")]
    Call(#[from] CallError),

    #[error("Reconnection error: {0}")]
    Reconnect(#[from] ReconnectError),

    #[error("Unknown error: {0}")]
    Other(String),
}

impl From<Box<dyn std::error::Error>> for SipError {
    fn from(err: Box<dyn std::error::Error>) -> Self {
        SipError::Other(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Missing required field: {0}")]
    Missing(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<&str> for ConfigError {
    fn from(s: &str) -> Self {
        ConfigError::Parse(s.to_string())
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

/// 信令通道建立失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("无效的身份 URI: {0}")]
    InvalidIdentity(String),

    #[error("传输层连接失败: {0}")]
    Transport(String),

    #[error("握手失败: {0}")]
    Handshake(String),

    #[error("连接已关闭")]
    Closed,
}

/// 注册失败，只上报不自动重试
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("注册被拒绝: {code} {reason}")]
    Rejected { code: u16, reason: String },

    #[error("认证失败: {reason}")]
    AuthenticationFailed { reason: String },

    #[error("注册事务失败: {0}")]
    Transport(String),

    #[error("信令连接不存在")]
    NotInitialized,

    #[error("注册已终止")]
    Terminated,
}

/// SIP呼叫操作的Result类型别名
pub type CallResult<T> = Result<T, CallError>;

/// SIP呼叫相关错误类型
#[derive(Error, Debug)]
pub enum CallError {
    /// SIP协议相关错误
    #[error("SIP协议错误: {0}")]
    SipProtocol(#[from] rsipstack::Error),

    /// URI解析错误
    #[error("URI解析错误: {0}")]
    UriParse(#[from] rsip::Error),

    /// 呼叫目标无法构造成 SIP 地址
    #[error("呼叫目标无效: {target}")]
    InvalidDestination { target: String },

    /// 没有可用的信令连接
    #[error("SIP客户端未初始化")]
    NotInitialized,

    /// 麦克风/媒体权限被拒绝
    #[error("媒体访问被拒绝: {reason}")]
    MediaAccessDenied { reason: String },

    /// 当前会话状态不允许该操作
    #[error("会话 {session} 处于 {state} 状态，不能执行 {operation}")]
    InvalidSessionOperation {
        session: String,
        operation: &'static str,
        state: String,
    },

    #[error("呼叫被拒绝: {code} {phrase}")]
    CallRejected { code: u16, phrase: String },

    #[error("信令失败: {0}")]
    Signaling(String),

    #[error("系统错误: {0}")]
    System(#[from] std::io::Error),
}

impl CallError {
    /// 判断错误是否可恢复（可用于重试逻辑）
    pub fn is_recoverable(&self) -> bool {
        match self {
            CallError::SipProtocol(_) => false,
            CallError::UriParse(_) => false,
            CallError::InvalidDestination { .. } => false,
            CallError::NotInitialized => false,
            CallError::MediaAccessDenied { .. } => true,
            CallError::InvalidSessionOperation { .. } => false,
            CallError::CallRejected { .. } => false,
            CallError::Signaling(_) => true,
            CallError::System(_) => true,
        }
    }

    /// 获取标准错误代码，用于日志分析和监控
    pub fn error_code(&self) -> &'static str {
        match self {
            CallError::SipProtocol(_) => "SIP_PROTOCOL_ERROR",
            CallError::UriParse(_) => "URI_PARSE_ERROR",
            CallError::InvalidDestination { .. } => "INVALID_DESTINATION",
            CallError::NotInitialized => "NOT_INITIALIZED",
            CallError::MediaAccessDenied { .. } => "MEDIA_ACCESS_DENIED",
            CallError::InvalidSessionOperation { .. } => "INVALID_SESSION_OPERATION",
            CallError::CallRejected { .. } => "CALL_REJECTED",
            CallError::Signaling(_) => "SIGNALING_ERROR",
            CallError::System(_) => "SYSTEM_ERROR",
        }
    }

    /// 获取SIP状态码（如果有）
    pub fn sip_status_code(&self) -> Option<u16> {
        match self {
            CallError::CallRejected { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// 创建无效目标错误
    pub fn invalid_destination(target: impl Into<String>) -> Self {
        CallError::InvalidDestination {
            target: target.into(),
        }
    }

    /// 创建媒体权限错误
    pub fn media_access_denied(reason: impl Into<String>) -> Self {
        CallError::MediaAccessDenied {
            reason: reason.into(),
        }
    }

    /// 创建信令错误
    pub fn signaling(msg: impl Into<String>) -> Self {
        CallError::Signaling(msg.into())
    }
}

/// 重连失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconnectError {
    #[error("Maximum reconnection attempts reached ({attempts})")]
    Exhausted { attempts: u32 },

    #[error("Reconnection cancelled")]
    Cancelled,
}

/// 媒体协作方返回的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Microphone access failed: {0}")]
    AccessDenied(String),

    #[error("SDP error: {0}")]
    Sdp(String),
}

impl From<MediaError> for CallError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::AccessDenied(reason) => CallError::MediaAccessDenied { reason },
            MediaError::Sdp(reason) => CallError::Signaling(reason),
        }
    }
}
