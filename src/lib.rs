// 声明所有模块
pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod phone;
pub mod reconnect;
pub mod registration;
pub mod session;
pub mod session_manager;
pub mod signaling;
pub mod sip_client;
pub mod sip_transport;
pub mod transport;
pub mod utils;

/// 重新导出thiserror错误类型
pub use crate::error::{
    CallError, CallResult, ConfigError, ConnectError, MediaError, ReconnectError,
    RegistrationError, SipError,
};

/// 主要API重新导出，简化使用
pub use crate::config::{Config, ReconnectConfig};
pub use crate::events::{ChannelEvents, NoopEvents, PhoneEvent, PhoneEvents};
pub use crate::media::{MediaHandle, MediaTrack, MediaTransport, SdpOnlyMedia};
pub use crate::phone::Phone;
pub use crate::reconnect::{ReconnectOutcome, ReconnectionPolicy};
pub use crate::registration::RegistrationState;
pub use crate::session::{Direction, Session, SessionRef, SessionState};
pub use crate::signaling::{Credentials, SessionId, Signaling, SignalingEvent};
pub use crate::sip_client::{SipClient, SipClientConfig};

use std::sync::Arc;

/// SIP Agent 库的版本信息
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 无界面运行时本地 SDP 声明的 RTP 端口
pub const DEFAULT_RTP_PORT: u16 = 20000;

/// 便捷函数：用 rsipstack 信令和仅 SDP 的媒体创建软电话
///
/// 需要在 tokio 运行时中调用。
pub fn create_phone(config: Config, listener: Arc<dyn PhoneEvents>) -> Result<Phone, SipError> {
    let local_ip = utils::get_first_non_loopback_interface()?;
    let media: Arc<dyn MediaTransport> = Arc::new(SdpOnlyMedia::new(local_ip, DEFAULT_RTP_PORT));

    let client_config = SipClientConfig::from_config(&config)?;
    let (client, signaling_events) = SipClient::new(client_config, media.clone());

    Ok(Phone::new(
        config,
        Arc::new(client),
        signaling_events,
        media,
        listener,
    ))
}
