/// 媒体协作方接口
///
/// 核心只负责开关/停止媒体轨道，不参与媒体协商。
/// SDP 的生成与解析由 `MediaTransport` 实现方负责。
use crate::error::MediaError;
use async_trait::async_trait;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// 轨道类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// 单条媒体轨道
pub trait MediaTrack: fmt::Debug + Send + Sync {
    fn kind(&self) -> TrackKind;

    fn is_enabled(&self) -> bool;

    fn set_enabled(&self, enabled: bool);

    /// 停止轨道，停止后不可恢复
    fn stop(&self);

    fn is_stopped(&self) -> bool;
}

/// 已协商的媒体句柄
pub trait MediaHandle: fmt::Debug + Send + Sync {
    /// 本地发送轨道
    fn senders(&self) -> Vec<Arc<dyn MediaTrack>>;

    /// 远端接收轨道
    fn receivers(&self) -> Vec<Arc<dyn MediaTrack>>;
}

/// 媒体传输协作方
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// 获取麦克风权限，接听前调用
    async fn acquire_microphone(&self) -> Result<(), MediaError>;

    /// 生成本地 SDP（呼出时为 offer，接听时为 answer）
    async fn local_description(&self) -> Result<String, MediaError>;

    /// 应用远端 SDP，返回协商后的媒体句柄
    async fn apply_remote_description(&self, sdp: &str) -> Result<Arc<dyn MediaHandle>, MediaError>;
}

/// 停止会话的所有媒体：发送轨道先禁用再停止，接收轨道直接停止
pub fn stop_all_tracks(handle: &dyn MediaHandle) {
    for sender in handle.senders() {
        sender.set_enabled(false);
        sender.stop();
    }
    for receiver in handle.receivers() {
        receiver.stop();
    }
}

/// 只保存开关状态的轨道
#[derive(Debug)]
pub struct LocalTrack {
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl LocalTrack {
    pub fn new(kind: TrackKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        })
    }
}

impl MediaTrack for LocalTrack {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        if !self.is_stopped() {
            self.enabled.store(enabled, Ordering::SeqCst);
        }
    }

    fn stop(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// 由固定轨道组成的媒体句柄
#[derive(Debug, Default)]
pub struct TrackSet {
    pub senders: Vec<Arc<LocalTrack>>,
    pub receivers: Vec<Arc<LocalTrack>>,
}

impl TrackSet {
    /// 一收一发的音频句柄
    pub fn audio() -> Arc<Self> {
        Arc::new(Self {
            senders: vec![LocalTrack::new(TrackKind::Audio)],
            receivers: vec![LocalTrack::new(TrackKind::Audio)],
        })
    }
}

impl MediaHandle for TrackSet {
    fn senders(&self) -> Vec<Arc<dyn MediaTrack>> {
        self.senders
            .iter()
            .map(|t| t.clone() as Arc<dyn MediaTrack>)
            .collect()
    }

    fn receivers(&self) -> Vec<Arc<dyn MediaTrack>> {
        self.receivers
            .iter()
            .map(|t| t.clone() as Arc<dyn MediaTrack>)
            .collect()
    }
}

/// 只做 SDP 交换、不收发 RTP 的媒体实现，用于无界面运行
pub struct SdpOnlyMedia {
    local_ip: IpAddr,
    rtp_port: u16,
}

impl SdpOnlyMedia {
    pub fn new(local_ip: IpAddr, rtp_port: u16) -> Self {
        Self { local_ip, rtp_port }
    }
}

#[async_trait]
impl MediaTransport for SdpOnlyMedia {
    async fn acquire_microphone(&self) -> Result<(), MediaError> {
        Ok(())
    }

    async fn local_description(&self) -> Result<String, MediaError> {
        let family = if self.local_ip.is_ipv6() { "IP6" } else { "IP4" };
        let session_id = uuid::Uuid::new_v4().as_u128() as u32;
        Ok(format!(
            "v=0\r\n\
             o=- {id} {id} IN {family} {ip}\r\n\
             s=sip-agent\r\n\
             c=IN {family} {ip}\r\n\
             t=0 0\r\n\
             m=audio {port} RTP/AVP 0 8 101\r\n\
             a=rtpmap:0 PCMU/8000\r\n\
             a=rtpmap:8 PCMA/8000\r\n\
             a=rtpmap:101 telephone-event/8000\r\n\
             a=sendrecv\r\n",
            id = session_id,
            family = family,
            ip = self.local_ip,
            port = self.rtp_port,
        ))
    }

    async fn apply_remote_description(&self, sdp: &str) -> Result<Arc<dyn MediaHandle>, MediaError> {
        if !sdp.lines().any(|line| line.starts_with("m=audio")) {
            return Err(MediaError::Sdp("remote description has no audio stream".into()));
        }
        debug!("remote SDP accepted ({} bytes)", sdp.len());
        Ok(TrackSet::audio())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_all_tracks() {
        let handle = TrackSet::audio();
        stop_all_tracks(handle.as_ref());
        assert!(handle.senders.iter().all(|t| t.is_stopped() && !t.is_enabled()));
        assert!(handle.receivers.iter().all(|t| t.is_stopped()));
    }

    #[test]
    fn test_stopped_track_stays_disabled() {
        let track = LocalTrack::new(TrackKind::Audio);
        track.stop();
        track.set_enabled(true);
        assert!(!track.is_enabled());
    }

    #[tokio::test]
    async fn test_sdp_only_media() {
        let media = SdpOnlyMedia::new("192.168.1.10".parse().unwrap(), 4000);
        let sdp = media.local_description().await.unwrap();
        assert!(sdp.contains("c=IN IP4 192.168.1.10"));
        assert!(sdp.contains("m=audio 4000 RTP/AVP"));

        let handle = media.apply_remote_description(&sdp).await.unwrap();
        assert_eq!(handle.senders().len(), 1);
        assert!(media.apply_remote_description("v=0\r\n").await.is_err());
    }
}
