/// 信令传输连接
///
/// 登录时创建，登出或致命错误时销毁。会话只持有它的弱引用，
/// 连接销毁后会话上的操作返回 `NotInitialized` 而不是悬空。
use crate::error::{CallError, CallResult, ConnectError};
use crate::signaling::{Identity, Signaling};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct TransportConnection {
    identity: Identity,
    endpoint: String,
    signaling: Arc<dyn Signaling>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl TransportConnection {
    /// 建立信令通道
    pub async fn connect(
        identity: Identity,
        endpoint: impl Into<String>,
        signaling: Arc<dyn Signaling>,
    ) -> Result<Arc<Self>, ConnectError> {
        let endpoint = endpoint.into();
        info!("正在连接信令服务器: {} ({})", endpoint, identity.uri);

        signaling.connect(&identity).await?;

        info!("✔ 信令通道已建立: {}", endpoint);
        Ok(Arc::new(Self {
            identity,
            endpoint,
            signaling,
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }))
    }

    /// 在同一身份上重新建立通道
    pub async fn reconnect(&self) -> Result<(), ConnectError> {
        if self.is_closed() {
            return Err(ConnectError::Closed);
        }
        debug!("重新连接信令服务器: {}", self.endpoint);
        self.signaling.connect(&self.identity).await?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// 关闭通道，可重复调用
    pub async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("信令通道已关闭，忽略重复 disconnect");
            return;
        }
        self.connected.store(false, Ordering::SeqCst);
        self.signaling.disconnect().await;
        info!("信令通道已关闭: {}", self.endpoint);
    }

    pub fn is_connected(&self) -> bool {
        !self.is_closed() && self.connected.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// 已关闭的连接不再提供信令句柄
    pub fn signaling(&self) -> CallResult<&Arc<dyn Signaling>> {
        if self.is_closed() {
            warn!("信令通道已关闭: {}", self.endpoint);
            return Err(CallError::NotInitialized);
        }
        Ok(&self.signaling)
    }

    pub(crate) fn mark_connected(&self) {
        if !self.is_closed() {
            self.connected.store(true, Ordering::SeqCst);
        }
    }

    pub(crate) fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for TransportConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConnection")
            .field("identity", &self.identity.uri.to_string())
            .field("endpoint", &self.endpoint)
            .field("connected", &self.is_connected())
            .field("closed", &self.is_closed())
            .finish()
    }
}
