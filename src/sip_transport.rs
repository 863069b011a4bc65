/// SIP 传输连接工厂
///
/// 按协议创建 rsipstack 的 UDP/TCP/WebSocket 连接
use rsip::transport::Transport;
use rsipstack::transport::{
    tcp::TcpConnection, udp::UdpConnection, websocket::WebSocketConnection, SipAddr,
    SipConnection,
};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// 创建到 `target` 的传输连接
///
/// UDP 绑定到 `local_addr`；TCP 和 WebSocket 主动连接 `target`。
pub async fn create_transport_connection(
    protocol: Transport,
    local_addr: SocketAddr,
    target: &rsip::HostWithPort,
    cancel_token: CancellationToken,
) -> rsipstack::Result<SipConnection> {
    let remote = SipAddr {
        r#type: Some(protocol.clone().into()),
        addr: target.clone(),
    };

    let connection: SipConnection = match protocol {
        Transport::Udp => {
            let conn =
                UdpConnection::create_connection(local_addr, None, Some(cancel_token)).await?;
            conn.into()
        }
        Transport::Tcp => TcpConnection::connect(&remote, Some(cancel_token))
            .await?
            .into(),
        Transport::Ws | Transport::Wss => {
            WebSocketConnection::connect(&remote, Some(cancel_token))
                .await?
                .into()
        }
        other => {
            return Err(rsipstack::Error::TransportLayerError(
                format!("不支持的传输协议: {}", other),
                remote,
            ))
        }
    };

    info!("已创建 {} 传输连接 -> {}", protocol, target);
    Ok(connection)
}
