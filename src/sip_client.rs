/// SIP 客户端核心模块
///
/// 基于 rsipstack 的 `Signaling` 实现：建立传输和端点、注册、呼叫控制，
/// 并把对话状态变化翻译成 `SignalingEvent` 上报给软电话核心。
use crate::config::Config;
use crate::error::{CallError, CallResult, ConfigError, ConnectError, RegistrationError};
use crate::media::{MediaHandle, MediaTransport};
use crate::signaling::{
    event_channel, Identity, SessionId, Signaling, SignalingEvent, SignalingEventReceiver,
    SignalingEventSender,
};
use crate::sip_transport::create_transport_connection;
use crate::utils;
use async_trait::async_trait;
use rsip::{headers::ToTypedHeader, prelude::HeadersExt, Response, SipMessage, StatusCode};
use rsipstack::{
    dialog::{
        authenticate::Credential,
        client_dialog::ClientInviteDialog,
        dialog::{Dialog, DialogState, DialogStateReceiver, DialogStateSender},
        dialog_layer::DialogLayer,
        invitation::InviteOption,
        registration::Registration,
        server_dialog::ServerInviteDialog,
        DialogId,
    },
    transaction::{
        key::{TransactionKey, TransactionRole},
        make_tag,
        transaction::Transaction,
        Endpoint, TransactionReceiver,
    },
    transport::{SipAddr, TransportLayer},
    EndpointBuilder,
};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 单次 OPTIONS 保活的最长等待时间
const KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(8);

/// SIP 客户端配置
#[derive(Debug, Clone)]
pub struct SipClientConfig {
    /// 服务器 URI (例如 "sip:example.com:8089;transport=wss")
    pub server: rsip::Uri,

    /// Outbound 代理 URI（可选）
    /// 完整URI格式，如 "sip:proxy.example.com:5060;transport=udp;lr"
    pub outbound_proxy: Option<rsip::Uri>,

    /// User-Agent字符串
    pub user_agent: String,

    /// REGISTER 的 Expires（秒）
    pub register_expires: u32,

    /// OPTIONS 保活间隔
    pub keep_alive_interval: Duration,
}

impl SipClientConfig {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            server: config.server_uri()?,
            outbound_proxy: config.outbound_proxy_uri()?,
            user_agent: config.user_agent.clone(),
            register_expires: config.register_expires,
            keep_alive_interval: config.keep_alive_interval,
        })
    }
}

/// 一路通话在 rsipstack 中的对话句柄
#[derive(Clone)]
enum LegDialog {
    /// INVITE 已发出，对话尚未创建
    Pending,
    Outgoing(ClientInviteDialog),
    Incoming(ServerInviteDialog),
}

struct CallLeg {
    dialog: LegDialog,
    /// 来电 INVITE 携带的 SDP
    offer: Vec<u8>,
    /// 接听时协商出的媒体，ACK 到达后随 Established 上报
    media: Option<Arc<dyn MediaHandle>>,
    confirmed: bool,
}

impl CallLeg {
    fn new(dialog: LegDialog) -> Self {
        Self {
            dialog,
            offer: Vec::new(),
            media: None,
            confirmed: false,
        }
    }
}

/// 一次连接对应的端点和对话层
///
/// 重连时整体替换，旧端点随取消令牌退出。
struct Stack {
    endpoint: Endpoint,
    dialog_layer: Arc<DialogLayer>,
    state_sender: DialogStateSender,
    cancel_token: CancellationToken,
    identity: Identity,
    server: rsip::Uri,
    registration: tokio::sync::Mutex<Option<Registration>>,
    refresh_started: AtomicBool,
    lost: AtomicBool,
}

impl Stack {
    fn local_addr(&self) -> CallResult<rsip::HostWithPort> {
        Ok(self
            .endpoint
            .get_addrs()
            .first()
            .ok_or(CallError::NotInitialized)?
            .addr
            .clone())
    }

    fn contact_uri(&self) -> CallResult<rsip::Uri> {
        let contact = format!("sip:{}@{}", self.identity.extension(), self.local_addr()?);
        Ok(contact.as_str().try_into()?)
    }

    fn credential(&self) -> Credential {
        Credential {
            username: self.identity.extension().to_string(),
            password: self.identity.credentials.password.clone(),
            realm: None, // 将从 401/407 响应自动提取
        }
    }

    /// 上报一次连接丢失，同一连接只上报一次
    fn report_lost(&self, events: &SignalingEventSender, reason: String) {
        if self.lost.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!("SIP 连接丢失: {}", reason);
        self.cancel_token.cancel();
        let _ = events.send(SignalingEvent::Disconnected {
            error: Some(reason),
        });
    }
}

/// 多个后台任务共享的状态
struct Shared {
    config: SipClientConfig,
    media: Arc<dyn MediaTransport>,
    events: SignalingEventSender,
    legs: Mutex<HashMap<SessionId, CallLeg>>,
    /// 对话创建前就被取消的呼出
    abandoned: Mutex<HashSet<SessionId>>,
}

/// SIP 客户端
pub struct SipClient {
    shared: Arc<Shared>,
    stack: Mutex<Option<Arc<Stack>>>,
}

impl SipClient {
    /// 创建客户端，返回的接收端交给 `Phone`
    pub fn new(
        config: SipClientConfig,
        media: Arc<dyn MediaTransport>,
    ) -> (Self, SignalingEventReceiver) {
        let (events, receiver) = event_channel();
        let client = Self {
            shared: Arc::new(Shared {
                config,
                media,
                events,
                legs: Mutex::new(HashMap::new()),
                abandoned: Mutex::new(HashSet::new()),
            }),
            stack: Mutex::new(None),
        };
        (client, receiver)
    }

    fn current_stack(&self) -> Option<Arc<Stack>> {
        self.stack
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn stack(&self) -> CallResult<Arc<Stack>> {
        self.current_stack().ok_or(CallError::NotInitialized)
    }

    fn replace_stack(&self, stack: Option<Arc<Stack>>) -> Option<Arc<Stack>> {
        let mut slot = self.stack.lock().unwrap_or_else(|p| p.into_inner());
        std::mem::replace(&mut *slot, stack)
    }

    /// 创建传输层和端点
    async fn build_stack(
        &self,
        identity: &Identity,
    ) -> Result<(Arc<Stack>, TransactionReceiver, DialogStateReceiver), ConnectError> {
        let config = &self.shared.config;
        let cancel_token = CancellationToken::new();

        // 获取本地IP
        let local_ip = utils::get_first_non_loopback_interface()
            .map_err(|e| ConnectError::Transport(e.to_string()))?;
        info!("检测到本地出口IP: {}", local_ip);

        let mut transport_layer = TransportLayer::new(cancel_token.clone());

        // 有 outbound 代理时连接代理，否则直连服务器
        let target = config.outbound_proxy.as_ref().unwrap_or(&config.server);
        let protocol = utils::extract_protocol_from_uri(target);

        if let Some(ref outbound_proxy) = config.outbound_proxy {
            transport_layer.outbound = Some(SipAddr {
                r#type: Some(protocol.clone().into()),
                addr: outbound_proxy.host_with_port.clone(),
            });
            info!(
                "配置 Outbound 代理: {} (transport: {})",
                outbound_proxy.host_with_port, protocol
            );
        }

        let local_addr = SocketAddr::new(local_ip, 0);
        let connection = create_transport_connection(
            protocol,
            local_addr,
            &target.host_with_port,
            cancel_token.clone(),
        )
        .await
        .map_err(|e| ConnectError::Transport(e.to_string()))?;

        transport_layer.add_transport(connection);

        let mut endpoint_builder = EndpointBuilder::new();
        endpoint_builder
            .with_cancel_token(cancel_token.clone())
            .with_transport_layer(transport_layer)
            .with_user_agent(&config.user_agent);
        let endpoint = endpoint_builder.build();

        let incoming = endpoint
            .incoming_transactions()
            .map_err(|e| ConnectError::Handshake(e.to_string()))?;

        let dialog_layer = Arc::new(DialogLayer::new(endpoint.inner.clone()));
        let (state_sender, state_receiver) = dialog_layer.new_dialog_state_channel();

        let stack = Arc::new(Stack {
            endpoint,
            dialog_layer,
            state_sender,
            cancel_token,
            identity: identity.clone(),
            server: config.server.clone(),
            registration: tokio::sync::Mutex::new(None),
            refresh_started: AtomicBool::new(false),
            lost: AtomicBool::new(false),
        });
        Ok((stack, incoming, state_receiver))
    }

    /// 启动端点服务；非主动关闭时退出视为连接丢失
    fn start_endpoint(shared: Arc<Shared>, stack: Arc<Stack>) {
        tokio::spawn(async move {
            let result = stack.endpoint.inner.serve().await;
            if stack.cancel_token.is_cancelled() {
                debug!("SIP 端点已停止");
                return;
            }
            let reason = match result {
                Ok(_) => "SIP 端点意外退出".to_string(),
                Err(e) => e.to_string(),
            };
            stack.report_lost(&shared.events, reason);
        });
    }

    /// 启动传入请求处理器
    fn start_incoming_handler(
        mut incoming: TransactionReceiver,
        shared: Arc<Shared>,
        stack: Arc<Stack>,
    ) {
        tokio::spawn(async move {
            while let Some(mut transaction) = tokio::select! {
                tx = incoming.recv() => tx,
                _ = stack.cancel_token.cancelled() => None,
            } {
                let method = transaction.original.method;
                debug!("收到传入请求: {}", method);

                if let Some(mut dialog) = stack.dialog_layer.match_dialog(&transaction.original) {
                    tokio::spawn(async move {
                        if let Err(e) = dialog.handle(&mut transaction).await {
                            error!("处理 {} 请求失败: {}", method, e);
                        }
                    });
                    continue;
                }

                match method {
                    rsip::Method::Invite => shared.on_new_invite(&stack, transaction),
                    rsip::Method::Cancel => shared.on_unmatched_cancel(transaction).await,
                    rsip::Method::Options => {
                        if let Err(e) = transaction.reply(StatusCode::OK).await {
                            warn!("回复 OPTIONS 失败: {}", e);
                        }
                    }
                    _ => {
                        warn!("未找到匹配的对话: {}", method);
                        if let Err(e) = transaction
                            .reply(StatusCode::CallTransactionDoesNotExist)
                            .await
                        {
                            warn!("回复 {} 失败: {}", method, e);
                        }
                    }
                }
            }
            debug!("传入请求处理器退出");
        });
    }

    /// 启动对话状态监听
    fn start_dialog_state_handler(
        mut states: DialogStateReceiver,
        shared: Arc<Shared>,
        stack: Arc<Stack>,
    ) {
        tokio::spawn(async move {
            while let Some(state) = tokio::select! {
                st = states.recv() => st,
                _ = stack.cancel_token.cancelled() => None,
            } {
                match state {
                    DialogState::Calling(id, ..) => shared.on_calling(&stack, &id).await,
                    DialogState::Confirmed(id, ..) => shared.on_confirmed(&id),
                    DialogState::Terminated(id, ..) => shared.on_terminated(&id),
                    _ => {}
                }
            }
        });
    }

    /// 定期发送 OPTIONS，失败或超时视为连接丢失
    fn start_keep_alive(shared: Arc<Shared>, stack: Arc<Stack>) {
        let interval = shared.config.keep_alive_interval;
        if interval.is_zero() {
            return;
        }
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stack.cancel_token.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }

                match tokio::time::timeout(KEEP_ALIVE_TIMEOUT, send_options(&stack)).await {
                    Ok(Ok(resp)) => debug!("保活响应: {}", resp.status_code),
                    Ok(Err(e)) => {
                        stack.report_lost(&shared.events, format!("保活失败: {}", e));
                        return;
                    }
                    Err(_) => {
                        stack.report_lost(&shared.events, "保活超时".to_string());
                        return;
                    }
                }
            }
        });
    }

    /// 注册成功后按 Expires 的八成周期刷新
    fn start_registration_refresh(shared: Arc<Shared>, stack: Arc<Stack>) {
        if stack.refresh_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let period = Duration::from_secs(u64::from(shared.config.register_expires) * 4 / 5);
        if period.is_zero() {
            return;
        }
        let register_uri = utils::registrar_uri(&stack.server);
        let expires = shared.config.register_expires;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stack.cancel_token.cancelled() => return,
                    _ = tokio::time::sleep(period) => {}
                }

                let mut guard = stack.registration.lock().await;
                let Some(registration) = guard.as_mut() else {
                    debug!("已注销，停止注册刷新");
                    return;
                };
                match registration.register(register_uri.clone(), Some(expires)).await {
                    Ok(resp) if resp.status_code == StatusCode::OK => debug!("注册已刷新"),
                    Ok(resp) => warn!("注册刷新响应: {}", resp.status_code),
                    Err(e) => warn!("注册刷新失败: {}", e),
                }
            }
        });
    }

    /// 关闭客户端
    pub async fn shutdown(&self) {
        self.disconnect().await;
    }
}

impl Shared {
    fn legs(&self) -> MutexGuard<'_, HashMap<SessionId, CallLeg>> {
        self.legs.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn abandoned(&self) -> MutexGuard<'_, HashSet<SessionId>> {
        self.abandoned.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn emit(&self, event: SignalingEvent) {
        if self.events.send(event).is_err() {
            debug!("信令事件接收端已关闭");
        }
    }

    /// 新来电：创建服务端对话，等待接听或拒接
    fn on_new_invite(&self, stack: &Arc<Stack>, mut tx: Transaction) {
        let contact = stack.contact_uri().ok();
        let dialog = match stack.dialog_layer.get_or_create_server_invite(
            &tx,
            stack.state_sender.clone(),
            Some(stack.credential()),
            contact,
        ) {
            Ok(dialog) => dialog,
            Err(e) => {
                error!("创建来电对话失败: {}", e);
                tokio::spawn(async move {
                    if let Err(e) = tx.reply(StatusCode::ServerInternalError).await {
                        warn!("回复 INVITE 失败: {}", e);
                    }
                });
                return;
            }
        };

        let id = SessionId::from(dialog.id().call_id.clone());
        let caller = caller_of(&tx.original);
        info!("📞 来电: {} (Call-ID: {})", caller, id);

        let mut leg = CallLeg::new(LegDialog::Incoming(dialog.clone()));
        leg.offer = tx.original.body.clone();
        self.legs().insert(id.clone(), leg);

        let mut handle = dialog;
        tokio::spawn(async move {
            if let Err(e) = handle.handle(&mut tx).await {
                warn!("来电对话处理失败: {}", e);
            }
        });

        self.emit(SignalingEvent::IncomingInvite { id, caller });
    }

    /// 对话层未认领的 CANCEL：按 Call-ID 找到振铃中的来电
    async fn on_unmatched_cancel(&self, mut tx: Transaction) {
        let id = match tx.original.call_id_header() {
            Ok(call_id) => SessionId::from(call_id.to_string()),
            Err(_) => {
                if let Err(e) = tx.reply(StatusCode::BadRequest).await {
                    warn!("回复 CANCEL 失败: {}", e);
                }
                return;
            }
        };

        let dialog = {
            let mut legs = self.legs();
            match legs.get(&id) {
                Some(CallLeg {
                    dialog: LegDialog::Incoming(dialog),
                    confirmed: false,
                    ..
                }) => {
                    let dialog = dialog.clone();
                    legs.remove(&id);
                    Some(dialog)
                }
                _ => None,
            }
        };

        let Some(dialog) = dialog else {
            if let Err(e) = tx.reply(StatusCode::CallTransactionDoesNotExist).await {
                warn!("回复 CANCEL 失败: {}", e);
            }
            return;
        };

        if let Err(e) = tx.reply(StatusCode::OK).await {
            warn!("回复 CANCEL 失败: {}", e);
        }
        if let Err(e) = dialog.reject(Some(StatusCode::RequestTerminated), None) {
            debug!("回复 487 失败: {}", e);
        }
        info!("来电已被对端取消: {}", id);
        self.emit(SignalingEvent::RemoteCancel { id });
    }

    /// 呼出对话已创建，补上句柄；已放弃的呼出立即取消
    async fn on_calling(&self, stack: &Stack, dialog_id: &DialogId) {
        let id = SessionId::from(dialog_id.call_id.clone());
        let Some(Dialog::ClientInvite(dialog)) = stack.dialog_layer.get_dialog(dialog_id) else {
            return;
        };

        let abandoned = self.abandoned().remove(&id);
        if abandoned {
            info!("呼叫在对话建立前已取消，发送 CANCEL: {}", id);
            if let Err(e) = dialog.cancel().await {
                warn!("发送 CANCEL 失败: {}", e);
            }
            return;
        }

        if let Some(leg) = self.legs().get_mut(&id) {
            if matches!(leg.dialog, LegDialog::Pending) {
                leg.dialog = LegDialog::Outgoing(dialog);
            }
        }
    }

    /// 来电收到 ACK
    fn on_confirmed(&self, dialog_id: &DialogId) {
        let id = SessionId::from(dialog_id.call_id.clone());
        let media = {
            let mut legs = self.legs();
            match legs.get_mut(&id) {
                Some(leg) if matches!(leg.dialog, LegDialog::Incoming(_)) && !leg.confirmed => {
                    leg.confirmed = true;
                    leg.media.clone()
                }
                _ => return,
            }
        };
        info!("✅ 来电已接通: {}", id);
        self.emit(SignalingEvent::Established { id, media });
    }

    /// 对话结束；本地发起的结束已先移除通话，这里只处理对端发起的
    fn on_terminated(&self, dialog_id: &DialogId) {
        let id = SessionId::from(dialog_id.call_id.clone());
        let event = {
            let mut legs = self.legs();
            let Some(leg) = legs.get(&id) else {
                return;
            };
            let event = match (&leg.dialog, leg.confirmed) {
                (_, true) => SignalingEvent::RemoteBye { id: id.clone() },
                (LegDialog::Incoming(_), false) => SignalingEvent::RemoteCancel { id: id.clone() },
                // 未接通的呼出由 INVITE 任务上报结果
                _ => return,
            };
            legs.remove(&id);
            event
        };
        info!("对端结束通话: {}", id);
        self.emit(event);
    }

    /// 发送 INVITE 并等待最终响应
    async fn drive_invite(self: Arc<Self>, stack: Arc<Stack>, id: SessionId, option: InviteOption) {
        let result = stack
            .dialog_layer
            .do_invite(option, stack.state_sender.clone())
            .await;
        let still_active = self.legs().contains_key(&id);

        match result {
            Ok((dialog, Some(resp))) if is_success(&resp) => {
                if !still_active {
                    info!("呼叫已结束，挂断迟到的应答: {}", id);
                    self.abandoned().remove(&id);
                    if let Err(e) = dialog.bye().await {
                        warn!("发送 BYE 失败: {}", e);
                    }
                    return;
                }

                let media = if resp.body.is_empty() {
                    None
                } else {
                    let answer = String::from_utf8_lossy(&resp.body).to_string();
                    match self.media.apply_remote_description(&answer).await {
                        Ok(media) => Some(media),
                        Err(e) => {
                            warn!("应用 SDP Answer 失败: {}", e);
                            None
                        }
                    }
                };

                let attached = match self.legs().get_mut(&id) {
                    Some(leg) => {
                        leg.dialog = LegDialog::Outgoing(dialog.clone());
                        leg.confirmed = true;
                        true
                    }
                    None => false,
                };
                if !attached {
                    // 处理应答期间呼叫已被取消
                    info!("呼叫已结束，挂断迟到的应答: {}", id);
                    self.abandoned().remove(&id);
                    if let Err(e) = dialog.bye().await {
                        warn!("发送 BYE 失败: {}", e);
                    }
                    return;
                }
                info!("✅ 呼叫已接通: {}", id);
                self.emit(SignalingEvent::Established { id, media });
            }
            Ok((_, resp)) => {
                self.abandoned().remove(&id);
                if !still_active {
                    return;
                }
                self.legs().remove(&id);
                let (code, reason) = match resp {
                    Some(resp) => (Some(resp.status_code.code()), resp.status_code.to_string()),
                    None => (None, "no final response".to_string()),
                };
                warn!("呼叫失败: {} ({})", id, reason);
                self.emit(SignalingEvent::Failed { id, code, reason });
            }
            Err(e) => {
                self.abandoned().remove(&id);
                if !still_active {
                    return;
                }
                self.legs().remove(&id);
                error!("INVITE 失败: {} ({})", id, e);
                self.emit(SignalingEvent::Failed {
                    id,
                    code: None,
                    reason: e.to_string(),
                });
            }
        }
    }
}

#[async_trait]
impl Signaling for SipClient {
    async fn connect(&self, identity: &Identity) -> Result<(), ConnectError> {
        let (stack, incoming, states) = self.build_stack(identity).await?;

        if let Some(old) = self.replace_stack(Some(stack.clone())) {
            // 旧连接上的通话随端点一起失效
            old.lost.store(true, Ordering::SeqCst);
            old.cancel_token.cancel();
            self.shared.legs().clear();
        }

        Self::start_endpoint(self.shared.clone(), stack.clone());
        Self::start_incoming_handler(incoming, self.shared.clone(), stack.clone());
        Self::start_dialog_state_handler(states, self.shared.clone(), stack.clone());
        Self::start_keep_alive(self.shared.clone(), stack);

        info!("✔ SIP 端点已启动: {}", self.shared.config.server);
        self.shared.emit(SignalingEvent::Connected);
        Ok(())
    }

    async fn disconnect(&self) {
        let Some(stack) = self.replace_stack(None) else {
            return;
        };
        stack.lost.store(true, Ordering::SeqCst);
        stack.registration.lock().await.take();
        stack.cancel_token.cancel();
        self.shared.legs().clear();
        self.shared.abandoned().clear();
        info!("SIP 客户端已关闭");
        self.shared
            .emit(SignalingEvent::Disconnected { error: None });
    }

    async fn register(&self, identity: &Identity) -> Result<(), RegistrationError> {
        let stack = self
            .current_stack()
            .ok_or(RegistrationError::NotInitialized)?;
        let register_uri = utils::registrar_uri(&stack.server);
        info!("正在注册到 SIP 服务器... {} ({})", register_uri, identity.uri);

        let response = {
            let mut guard = stack.registration.lock().await;
            let registration = guard.get_or_insert_with(|| {
                let mut registration =
                    Registration::new(stack.endpoint.inner.clone(), Some(stack.credential()));
                registration.call_id = utils::make_call_id(None);
                registration
            });
            registration
                .register(register_uri, Some(self.shared.config.register_expires))
                .await
                .map_err(|e| RegistrationError::Transport(e.to_string()))?
        };

        check_register_response(&response)?;
        info!("✔ 注册成功,响应状态: {}", response.status_code);
        Self::start_registration_refresh(self.shared.clone(), stack);
        Ok(())
    }

    async fn unregister(&self, identity: &Identity) -> Result<(), RegistrationError> {
        let stack = self
            .current_stack()
            .ok_or(RegistrationError::NotInitialized)?;
        let register_uri = utils::registrar_uri(&stack.server);
        info!("正在从SIP服务器注销... {}", identity.uri);

        let mut registration = stack.registration.lock().await.take().unwrap_or_else(|| {
            let mut registration =
                Registration::new(stack.endpoint.inner.clone(), Some(stack.credential()));
            registration.call_id = utils::make_call_id(None);
            registration
        });

        // expires=0 表示注销
        let response = registration
            .register(register_uri, Some(0))
            .await
            .map_err(|e| RegistrationError::Transport(e.to_string()))?;

        check_register_response(&response)?;
        info!("✔ 注销成功,响应状态: {}", response.status_code);
        Ok(())
    }

    async fn invite(&self, id: &SessionId, target: &rsip::Uri) -> CallResult<()> {
        let stack = self.stack()?;
        info!("📞发起呼叫到: {}", target);

        let offer = self.shared.media.local_description().await?;
        let identity = &stack.identity;

        let invite_opt = InviteOption {
            caller: identity.uri.clone(),
            callee: target.clone(),
            contact: stack.contact_uri()?,
            credential: Some(stack.credential()),
            caller_display_name: Some(identity.credentials.display_name.clone()),
            caller_params: vec![],
            destination: None,
            content_type: Some("application/sdp".to_string()),
            offer: Some(offer.into_bytes()),
            headers: None,
            support_prack: false,
            call_id: Some(id.to_string()),
        };

        self.shared
            .legs()
            .insert(id.clone(), CallLeg::new(LegDialog::Pending));
        tokio::spawn(
            self.shared
                .clone()
                .drive_invite(stack, id.clone(), invite_opt),
        );
        Ok(())
    }

    async fn answer(&self, id: &SessionId) -> CallResult<()> {
        let (dialog, offer) = match self.shared.legs().get(id) {
            Some(CallLeg {
                dialog: LegDialog::Incoming(dialog),
                offer,
                ..
            }) => (dialog.clone(), offer.clone()),
            _ => return Err(CallError::signaling(format!("没有待接听的来电: {}", id))),
        };

        let media = if offer.is_empty() {
            None
        } else {
            let offer = String::from_utf8_lossy(&offer).to_string();
            Some(self.shared.media.apply_remote_description(&offer).await?)
        };
        let answer = self.shared.media.local_description().await?;

        match self.shared.legs().get_mut(id) {
            Some(leg) => leg.media = media,
            None => return Err(CallError::signaling(format!("来电已结束: {}", id))),
        }

        let headers = vec![rsip::headers::ContentType::from("application/sdp").into()];
        dialog.accept(Some(headers), Some(answer.into_bytes()))?;
        info!("已接听来电: {}", id);
        Ok(())
    }

    async fn reject(&self, id: &SessionId, code: u16) -> CallResult<()> {
        let leg = self.shared.legs().remove(id);
        match leg.map(|l| l.dialog) {
            Some(LegDialog::Incoming(dialog)) => {
                dialog.reject(Some(StatusCode::from(code)), None)?;
                info!("已拒接来电: {} ({})", id, code);
                Ok(())
            }
            Some(_) => Err(CallError::signaling(format!("不是来电: {}", id))),
            None => {
                debug!("来电已结束，忽略拒接: {}", id);
                Ok(())
            }
        }
    }

    async fn cancel(&self, id: &SessionId) -> CallResult<()> {
        let leg = self.shared.legs().remove(id);
        match leg.map(|l| (l.dialog, l.confirmed)) {
            Some((LegDialog::Outgoing(dialog), true)) => {
                // 200 OK 已到达，CANCEL 不再生效
                dialog.bye().await?;
                info!("呼叫已接通，改为挂断: {}", id);
                Ok(())
            }
            Some((LegDialog::Outgoing(dialog), false)) => {
                dialog.cancel().await?;
                info!("已取消呼叫: {}", id);
                Ok(())
            }
            Some((LegDialog::Pending, _)) => {
                // 对话创建后再发送 CANCEL
                self.shared.abandoned().insert(id.clone());
                Ok(())
            }
            Some((LegDialog::Incoming(_), _)) => {
                Err(CallError::signaling(format!("不是呼出: {}", id)))
            }
            None => {
                debug!("呼叫已结束，忽略取消: {}", id);
                Ok(())
            }
        }
    }

    async fn bye(&self, id: &SessionId) -> CallResult<()> {
        let leg = self.shared.legs().remove(id);
        match leg.map(|l| l.dialog) {
            Some(LegDialog::Outgoing(dialog)) => dialog.bye().await?,
            Some(LegDialog::Incoming(dialog)) => dialog.bye().await?,
            Some(LegDialog::Pending) | None => {
                debug!("通话已结束，忽略 BYE: {}", id);
                return Ok(());
            }
        }
        info!("已挂断: {}", id);
        Ok(())
    }
}

fn is_success(resp: &Response) -> bool {
    (200..300).contains(&resp.status_code.code())
}

/// 注册响应映射为注册错误
fn check_register_response(resp: &Response) -> Result<(), RegistrationError> {
    if is_success(resp) {
        return Ok(());
    }
    warn!("注册响应: {}", resp.status_code);
    match resp.status_code {
        StatusCode::Unauthorized
        | StatusCode::ProxyAuthenticationRequired
        | StatusCode::Forbidden => Err(RegistrationError::AuthenticationFailed {
            reason: resp.status_code.to_string(),
        }),
        _ => Err(RegistrationError::Rejected {
            code: resp.status_code.code(),
            reason: resp.status_code.to_string(),
        }),
    }
}

/// 主叫分机号，取 From 头的用户部分
fn caller_of(request: &rsip::Request) -> String {
    request
        .from_header()
        .ok()
        .and_then(|from| from.typed().ok())
        .and_then(|from| from.uri.auth.map(|auth| auth.user))
        .unwrap_or_else(|| "unknown".to_string())
}

/// 发送一次 OPTIONS 并等待最终响应
async fn send_options(stack: &Stack) -> rsipstack::Result<Response> {
    let endpoint = &stack.endpoint.inner;
    let server = utils::registrar_uri(&stack.server);

    let to = rsip::typed::To {
        display_name: None,
        uri: server.clone(),
        params: vec![],
    };
    let from = rsip::typed::From {
        display_name: None,
        uri: stack.identity.uri.clone(),
        params: vec![],
    }
    .with_tag(make_tag());

    let via = endpoint.get_via(None, None)?;
    let mut request =
        endpoint.make_request(rsip::Method::Options, server, via, from, to, 1, None);
    request
        .headers
        .unique_push(utils::make_call_id(None).into());

    let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
    let mut tx = Transaction::new_client(key, request, endpoint.clone(), None);
    tx.send().await?;

    while let Some(msg) = tx.receive().await {
        match msg {
            SipMessage::Response(resp) if resp.status_code == StatusCode::Trying => continue,
            SipMessage::Response(resp) => return Ok(resp),
            _ => break,
        }
    }

    Err(rsipstack::Error::DialogError(
        "OPTIONS transaction is already terminated".to_string(),
        DialogId::try_from(&tx.original)?,
        StatusCode::RequestTimeout,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status_code: StatusCode) -> Response {
        Response {
            status_code,
            version: rsip::Version::V2,
            headers: Default::default(),
            body: vec![],
        }
    }

    #[test]
    fn test_register_response_mapping() {
        assert!(check_register_response(&response(StatusCode::OK)).is_ok());
        assert!(matches!(
            check_register_response(&response(StatusCode::Forbidden)),
            Err(RegistrationError::AuthenticationFailed { .. })
        ));
        assert!(matches!(
            check_register_response(&response(StatusCode::ServiceUnavailable)),
            Err(RegistrationError::Rejected { code: 503, .. })
        ));
    }

    #[test]
    fn test_client_config_from_config() {
        let config = Config::new("pbx.example.com").unwrap();
        let client_config = SipClientConfig::from_config(&config).unwrap();
        assert_eq!(
            client_config.server.to_string(),
            "sip:pbx.example.com:8089;transport=wss"
        );
        assert!(client_config.outbound_proxy.is_none());
        assert_eq!(client_config.register_expires, 600);
    }

    #[test]
    fn test_caller_of() {
        let request = rsip::Request::try_from(
            "INVITE sip:1001@pbx.example.com SIP/2.0\r\n\
             Via: SIP/2.0/WSS 10.0.0.2:8089;branch=z9hG4bK776asdhds\r\n\
             From: \"Agent\" <sip:2002@pbx.example.com>;tag=1928301774\r\n\
             To: <sip:1001@pbx.example.com>\r\n\
             Call-ID: a84b4c76e66710\r\n\
             CSeq: 1 INVITE\r\n\
             Content-Length: 0\r\n\r\n",
        )
        .unwrap();
        assert_eq!(caller_of(&request), "2002");
    }
}
