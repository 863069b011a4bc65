/// 注册管理器
///
/// 在存活的信令连接上注册/注销身份。注册失败只上报不重试；
/// 传输层重连后若之前注册过，会自动重新注册。
use super::state::RegistrationState;
use crate::error::RegistrationError;
use crate::events::EventDispatcher;
use crate::transport::TransportConnection;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{debug, info, warn};

pub struct RegistrationManager {
    state: Mutex<RegistrationState>,
    /// 曾经注册成功且之后没有注销
    had_registration: AtomicBool,
    /// 自动重新注册进行中
    reregistering: AtomicBool,
    /// 注销流程已开始
    unregistering: AtomicBool,
    events: EventDispatcher,
}

impl RegistrationManager {
    pub fn new(events: EventDispatcher) -> Self {
        Self {
            state: Mutex::new(RegistrationState::Initial),
            had_registration: AtomicBool::new(false),
            reregistering: AtomicBool::new(false),
            unregistering: AtomicBool::new(false),
            events,
        }
    }

    pub fn state(&self) -> RegistrationState {
        *self.lock()
    }

    pub fn is_registered(&self) -> bool {
        self.state().is_registered()
    }

    /// 在连接上执行注册
    pub async fn register(&self, connection: &TransportConnection) -> Result<(), RegistrationError> {
        if self.state() == RegistrationState::Terminated {
            return Err(RegistrationError::Terminated);
        }
        let signaling = connection
            .signaling()
            .map_err(|_| RegistrationError::NotInitialized)?;

        info!("正在注册到 SIP 服务器: {}", connection.identity().uri);
        match signaling.register(connection.identity()).await {
            Ok(()) => match self.transition(RegistrationState::Registered) {
                Ok(_) => {
                    self.had_registration.store(true, Ordering::SeqCst);
                    info!("✔ 注册成功: {}", connection.identity().uri);
                    self.events.debug("[INFO] Registered successfully!");
                    self.events.registered();
                    Ok(())
                }
                Err(RegistrationState::Registered) => {
                    debug!("已处于注册状态，忽略重复的注册成功");
                    Ok(())
                }
                Err(current) => {
                    warn!("注册成功但状态已是 {}，忽略", current);
                    Err(RegistrationError::Terminated)
                }
            },
            Err(e) => {
                warn!("注册失败: {}", e);
                // 失败时回到 Unregistered（Terminated 之后保持不变）
                let _ = self.transition(RegistrationState::Unregistered);
                self.events.debug(format!("[ERROR] Registration failed: {}", e));
                self.events.registration_failed(&e);
                Err(e)
            }
        }
    }

    /// 传输层连接建立
    ///
    /// 之前注册过且当前未注册时重新注册，重新注册不会并发执行。
    pub async fn on_transport_connected(&self, connection: &TransportConnection) {
        if !self.had_registration.load(Ordering::SeqCst)
            || self.state() != RegistrationState::Unregistered
        {
            return;
        }
        if self.reregistering.swap(true, Ordering::SeqCst) {
            debug!("重新注册已在进行中");
            return;
        }

        info!("信令重连后重新注册");
        // 失败已通过 on_registration_failed 上报
        let _ = self.register(connection).await;
        self.reregistering.store(false, Ordering::SeqCst);
    }

    /// 传输层断开：已注册时标记为未注册
    pub fn on_transport_lost(&self) {
        if self.transition(RegistrationState::Unregistered).is_ok() {
            info!("信令断开，注册失效");
            self.events.debug("[INFO] Unregistered.");
            self.events.unregistered();
        }
    }

    /// 注销
    ///
    /// 状态先确定地变为 Unregistered 并通知一次，注销握手完成后变为 Terminated。
    /// 已终止或注销进行中时为空操作。
    pub async fn unregister(&self, connection: Option<&TransportConnection>) {
        if self.state() == RegistrationState::Terminated
            || self.unregistering.swap(true, Ordering::SeqCst)
        {
            debug!("注销已完成或正在进行，忽略");
            return;
        }

        self.had_registration.store(false, Ordering::SeqCst);
        let previous = self.force_unregistered();
        info!("正在从SIP服务器注销 (之前状态: {})", previous);
        self.events.debug("[INFO] Unregistered.");
        self.events.unregistered();

        if let Some(connection) = connection {
            match connection.signaling() {
                Ok(signaling) if previous.is_registered() => {
                    if let Err(e) = signaling.unregister(connection.identity()).await {
                        warn!("注销请求失败: {}", e);
                        self.events.debug(format!("[WARN] Unregister request failed: {}", e));
                    }
                }
                Ok(_) => debug!("未注册，跳过注销请求"),
                Err(_) => debug!("信令通道已关闭，跳过注销请求"),
            }
        }

        let _ = self.transition(RegistrationState::Terminated);
        info!("✔ 注销完成");
    }

    fn transition(&self, next: RegistrationState) -> Result<RegistrationState, RegistrationState> {
        let mut state = self.lock();
        let current = *state;
        if !current.can_transition_to(next) {
            return Err(current);
        }
        *state = next;
        debug!("注册状态: {} -> {}", current, next);
        Ok(current)
    }

    fn force_unregistered(&self) -> RegistrationState {
        let mut state = self.lock();
        let previous = *state;
        if previous != RegistrationState::Terminated {
            *state = RegistrationState::Unregistered;
        }
        previous
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistrationState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
