/// 客户端配置
///
/// 信令服务器地址、传输方式以及重连参数
use crate::error::ConfigError;
use rsip::transport::Transport;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// 默认 WebSocket 端口
pub const DEFAULT_PORT: u16 = 8089;

/// 最大重连次数
pub const RECONNECTION_ATTEMPTS: u32 = 3;

/// 两次重连之间的间隔
pub const RECONNECTION_DELAY: Duration = Duration::from_secs(4);

/// 重连策略参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// 最多尝试次数（第一次立即执行）
    pub max_attempts: u32,

    /// 第二次及以后每次尝试前的等待时间
    pub delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: RECONNECTION_ATTEMPTS,
            delay: RECONNECTION_DELAY,
        }
    }
}

/// 客户端配置
#[derive(Debug, Clone)]
pub struct Config {
    /// 信令服务器主机
    pub server: String,

    /// 信令服务器端口
    pub port: u16,

    /// 传输协议（默认 wss）
    pub transport: Transport,

    /// 呼叫目标使用的域名后缀，默认与服务器相同
    pub domain: String,

    /// WebSocket 路径
    pub ws_path: String,

    /// 显示名称
    pub display_name: String,

    /// User-Agent字符串
    pub user_agent: String,

    /// REGISTER 的 Expires（秒）
    pub register_expires: u32,

    /// OPTIONS 保活间隔，为零时不发送保活
    pub keep_alive_interval: Duration,

    /// Outbound 代理（`host:port`，可选）
    pub outbound_proxy: Option<String>,

    pub reconnection: ReconnectConfig,
}

/// 运行时 config.json
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    #[serde(rename = "API_URL", default)]
    pub api_url: Option<String>,

    #[serde(rename = "SIP_SERVER")]
    pub sip_server: String,

    #[serde(rename = "SIP_PORT", default)]
    pub sip_port: Option<String>,
}

impl Config {
    /// 创建配置，`server` 可以带端口（`host:port`）
    pub fn new(server: &str) -> Result<Self, ConfigError> {
        let server = server.trim();
        if server.is_empty() {
            return Err(ConfigError::Missing("server".to_string()));
        }

        let (host, port) = match server.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| ConfigError::Invalid(format!("invalid port: {}", port)))?;
                (host.to_string(), port)
            }
            _ => (server.to_string(), DEFAULT_PORT),
        };

        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(ConfigError::Invalid(format!("invalid server host: {}", host)));
        }

        Ok(Self {
            domain: host.clone(),
            server: host,
            port,
            transport: Transport::Wss,
            ws_path: "/ws".to_string(),
            display_name: "Unknown".to_string(),
            user_agent: format!("sip-agent/{}", crate::VERSION),
            register_expires: 600,
            keep_alive_interval: Duration::from_secs(10),
            outbound_proxy: None,
            reconnection: ReconnectConfig::default(),
        })
    }

    /// 读取运行时 config.json
    pub fn from_runtime_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_runtime_json(&content)
    }

    pub fn from_runtime_json(content: &str) -> Result<Self, ConfigError> {
        let runtime: RuntimeConfig = serde_json::from_str(content)?;
        let mut config = Self::new(&runtime.sip_server)?;
        if let Some(port) = runtime.sip_port.as_deref().filter(|p| !p.is_empty()) {
            config.port = port
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("invalid SIP_PORT: {}", port)))?;
        }
        Ok(config)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// 设置传输协议（udp/tcp/ws/wss）
    pub fn with_transport(mut self, transport: &str) -> Result<Self, ConfigError> {
        self.transport = match transport.to_ascii_lowercase().as_str() {
            "udp" => Transport::Udp,
            "tcp" => Transport::Tcp,
            "ws" => Transport::Ws,
            "wss" => Transport::Wss,
            other => {
                return Err(ConfigError::Invalid(format!(
                    "unsupported transport: {}",
                    other
                )))
            }
        };
        Ok(self)
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    pub fn with_outbound_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.outbound_proxy = Some(proxy.into());
        self
    }

    pub fn with_reconnection(mut self, reconnection: ReconnectConfig) -> Self {
        self.reconnection = reconnection;
        self
    }

    /// 信令服务器 URI，如 `sip:pbx.example.com:8089;transport=wss`
    pub fn server_uri(&self) -> Result<rsip::Uri, ConfigError> {
        let uri = format!(
            "sip:{}:{};transport={}",
            self.server,
            self.port,
            self.transport.to_string().to_ascii_lowercase()
        );
        rsip::Uri::try_from(uri.as_str())
            .map_err(|e| ConfigError::Invalid(format!("invalid server URI {}: {}", uri, e)))
    }

    /// Outbound 代理 URI，沿用服务器的传输协议并带 `lr`
    pub fn outbound_proxy_uri(&self) -> Result<Option<rsip::Uri>, ConfigError> {
        let Some(proxy) = self.outbound_proxy.as_deref() else {
            return Ok(None);
        };
        let uri = format!(
            "sip:{};transport={};lr",
            proxy,
            self.transport.to_string().to_ascii_lowercase()
        );
        rsip::Uri::try_from(uri.as_str())
            .map(Some)
            .map_err(|e| ConfigError::Invalid(format!("invalid proxy URI {}: {}", uri, e)))
    }

    /// 信令端点地址，WebSocket 时为 `wss://host:port/ws`
    pub fn endpoint_url(&self) -> String {
        match self.transport {
            Transport::Ws => format!("ws://{}:{}{}", self.server, self.port, self.ws_path),
            Transport::Wss => format!("wss://{}:{}{}", self.server, self.port, self.ws_path),
            _ => format!("{}:{}", self.server, self.port),
        }
    }
}
