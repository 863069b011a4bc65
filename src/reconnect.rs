/// 断线重连策略
///
/// 同一时刻最多只有一个重连流程。第一次尝试立即执行，之后每次
/// 等待固定间隔，超过最大次数后放弃并上报，直到用户重新登录。
/// 登出时先取消意图令牌，进行中的尝试完成后不会复活已关闭的连接。
use crate::config::ReconnectConfig;
use crate::error::ReconnectError;
use crate::events::EventDispatcher;
use crate::transport::TransportConnection;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 一次重连流程的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectOutcome {
    /// 第 `attempt` 次尝试成功
    Reconnected { attempt: u32 },
    /// 连接已被其他途径恢复
    AlreadyConnected,
    Failed(ReconnectError),
}

pub struct ReconnectionPolicy {
    config: ReconnectConfig,
    in_flight: AtomicBool,
    exhausted: AtomicBool,
    intent: Mutex<CancellationToken>,
    events: EventDispatcher,
}

/// 流程结束（包括任务被中止）时清除单飞标记
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ReconnectionPolicy {
    pub fn new(config: ReconnectConfig, events: EventDispatcher) -> Arc<Self> {
        let intent = CancellationToken::new();
        // 登录前不应重连
        intent.cancel();
        Arc::new(Self {
            config,
            in_flight: AtomicBool::new(false),
            exhausted: AtomicBool::new(false),
            intent: Mutex::new(intent),
            events,
        })
    }

    /// 登录后启用重连，同时清除之前的耗尽状态
    pub fn arm(&self) {
        let mut intent = self.lock_intent();
        intent.cancel();
        *intent = CancellationToken::new();
        self.exhausted.store(false, Ordering::SeqCst);
        debug!("重连策略已启用");
    }

    /// 登出前调用，进行中的尝试会在完成后作废
    pub fn disarm(&self) {
        self.lock_intent().cancel();
        debug!("重连策略已停用");
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::SeqCst)
    }

    /// 触发重连（传输错误或网络恢复）
    ///
    /// 未启用、已耗尽、连接仍存活或已有流程在进行时返回 `None`。
    pub fn attempt_reconnection(
        self: &Arc<Self>,
        connection: Arc<TransportConnection>,
    ) -> Option<JoinHandle<ReconnectOutcome>> {
        let intent = self.lock_intent().clone();
        if intent.is_cancelled() {
            debug!("未启用重连，忽略");
            return None;
        }
        if self.is_exhausted() {
            debug!("重连次数已耗尽，需重新登录");
            return None;
        }
        if connection.is_connected() {
            debug!("连接仍然存活，无需重连");
            return None;
        }
        if connection.is_closed() {
            return None;
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("重连已在进行中");
            return None;
        }

        let policy = Arc::clone(self);
        Some(tokio::spawn(async move {
            let _guard = InFlightGuard(&policy.in_flight);
            policy.run(connection, intent).await
        }))
    }

    async fn run(&self, connection: Arc<TransportConnection>, intent: CancellationToken) -> ReconnectOutcome {
        for attempt in 1..=self.config.max_attempts {
            let delay = if attempt == 1 {
                Duration::ZERO
            } else {
                self.config.delay
            };

            tokio::select! {
                _ = intent.cancelled() => {
                    debug!("重连已取消 (第 {} 次尝试前)", attempt);
                    return ReconnectOutcome::Failed(ReconnectError::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }

            if connection.is_connected() {
                return ReconnectOutcome::AlreadyConnected;
            }

            info!("第 {} 次重连尝试 ({})", attempt, connection.endpoint());
            match connection.reconnect().await {
                Ok(()) if intent.is_cancelled() => {
                    // 用户已登出，关闭刚恢复的连接
                    warn!("重连完成时已登出，关闭连接");
                    connection.disconnect().await;
                    return ReconnectOutcome::Failed(ReconnectError::Cancelled);
                }
                Ok(()) => {
                    info!("✔ 重连成功 (第 {} 次)", attempt);
                    self.events.debug("[INFO] Reconnection successful");
                    return ReconnectOutcome::Reconnected { attempt };
                }
                Err(e) => {
                    warn!("第 {} 次重连失败: {}", attempt, e);
                    self.events
                        .debug(format!("[ERROR] Reconnection attempt {} failed", attempt));
                    if intent.is_cancelled() {
                        return ReconnectOutcome::Failed(ReconnectError::Cancelled);
                    }
                }
            }
        }

        self.exhausted.store(true, Ordering::SeqCst);
        let err = ReconnectError::Exhausted {
            attempts: self.config.max_attempts,
        };
        error!("{}", err);
        self.events.debug(format!("[ERROR] {}", err));
        ReconnectOutcome::Failed(err)
    }

    fn lock_intent(&self) -> std::sync::MutexGuard<'_, CancellationToken> {
        self.intent.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
