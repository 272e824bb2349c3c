//! Media engine boundary
//!
//! Audio capture, playback and RTP live outside this crate. The call
//! controller only tells the engine when to start and stop streaming.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Where the far end wants its RTP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaEndpoint {
    pub local_rtp_port: u16,
    pub remote_address: String,
    pub remote_rtp_port: u16,
}

/// Media engine invoked once a call is connected
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait MediaEngine: Send + Sync {
    /// Start sending and receiving audio; `false` if the engine could not
    async fn start_streaming(
        &self,
        call_id: &str,
        local_rtp_port: u16,
        remote_address: &str,
        remote_rtp_port: u16,
    ) -> bool;

    /// Stop the streams of a call; `false` if none were running
    async fn stop_streaming(&self, call_id: &str) -> bool;
}

/// Engine that moves no audio and only records what it was asked to do
#[derive(Clone, Default)]
pub struct NullMediaEngine {
    streams: Arc<RwLock<HashMap<String, MediaEndpoint>>>,
}

impl NullMediaEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn active_streams(&self) -> usize {
        self.streams.read().await.len()
    }

    pub async fn endpoint(&self, call_id: &str) -> Option<MediaEndpoint> {
        self.streams.read().await.get(call_id).cloned()
    }
}

#[async_trait::async_trait]
impl MediaEngine for NullMediaEngine {
    async fn start_streaming(
        &self,
        call_id: &str,
        local_rtp_port: u16,
        remote_address: &str,
        remote_rtp_port: u16,
    ) -> bool {
        info!(
            "Media for call {}: local :{} <-> {}:{} (no audio device)",
            call_id, local_rtp_port, remote_address, remote_rtp_port
        );
        let endpoint = MediaEndpoint {
            local_rtp_port,
            remote_address: remote_address.to_string(),
            remote_rtp_port,
        };
        self.streams
            .write()
            .await
            .insert(call_id.to_string(), endpoint);
        true
    }

    async fn stop_streaming(&self, call_id: &str) -> bool {
        match self.streams.write().await.remove(call_id) {
            Some(_) => {
                info!("Media for call {} stopped", call_id);
                true
            }
            None => {
                warn!("No media running for call {}", call_id);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_null_engine_tracks_streams() {
        let engine = NullMediaEngine::new();
        assert!(engine.start_streaming("c1", 10000, "198.51.100.5", 40000).await);
        assert_eq!(engine.active_streams().await, 1);
        assert_eq!(
            engine.endpoint("c1").await.unwrap().remote_address,
            "198.51.100.5"
        );

        assert!(engine.stop_streaming("c1").await);
        assert!(!engine.stop_streaming("c1").await);
        assert_eq!(engine.active_streams().await, 0);
    }
}
