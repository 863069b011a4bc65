/// SIP 工具函数模块
///
/// 日志初始化、本地地址探测以及 rsipstack 之上的小工具
use rsip::transport::Transport;
use std::net::IpAddr;
use tracing::Level;
use uuid::Uuid;

/// 初始化日志系统
///
/// 重复调用时保留第一次的设置
pub fn initialize_logging(log_level: &str) {
    let level = match log_level.to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .try_init();
}

/// 获取第一个非回环的网络接口 IP 地址
///
/// 遍历系统所有网络接口，返回第一个非回环的 IPv4 地址
///
/// # 示例
/// ```rust,no_run
/// use sip_agent::utils::get_first_non_loopback_interface;
///
/// let local_ip = get_first_non_loopback_interface().unwrap();
/// println!("本地IP: {}", local_ip);
/// ```
pub fn get_first_non_loopback_interface() -> Result<IpAddr, Box<dyn std::error::Error>> {
    for interface in get_if_addrs::get_if_addrs()? {
        if !interface.is_loopback() {
            match interface.addr {
                get_if_addrs::IfAddr::V4(ref addr) => return Ok(IpAddr::V4(addr.ip)),
                _ => continue,
            }
        }
    }
    Err("未找到 IPv4 接口".into())
}

/// 生成基于 UUID 的 Call-ID
///
/// # 示例
/// ```rust
/// use sip_agent::utils::make_call_id;
///
/// let call_id = make_call_id(Some("example.com"));
/// assert!(call_id.to_string().ends_with("@example.com"));
/// ```
pub fn make_call_id(domain: Option<&str>) -> rsip::headers::CallId {
    let uuid = Uuid::new_v4();

    match domain {
        Some(d) => format!("{}@{}", uuid, d).into(),
        None => uuid.to_string().into(),
    }
}

/// 从 URI 的 `transport` 参数中取出传输协议，缺省为 UDP
pub fn extract_protocol_from_uri(uri: &rsip::Uri) -> Transport {
    uri.params
        .iter()
        .find_map(|p| match p {
            rsip::Param::Transport(t) => Some(t.clone()),
            _ => None,
        })
        .unwrap_or(Transport::Udp)
}

/// 注册用的 URI：去掉 `transport` 参数，registrar 不需要
pub fn registrar_uri(server: &rsip::Uri) -> rsip::Uri {
    let mut uri = server.clone();
    uri.params
        .retain(|p| !matches!(p, rsip::Param::Transport(_)));
    uri
}
