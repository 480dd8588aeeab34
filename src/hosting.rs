//! Audio clip hosting
//!
//! The satellite plays responses by fetching a URL through its media player,
//! so finished response audio has to live somewhere the device can reach.
//! [`AudioHost`] is that boundary; [`ClipHost`] is the in-process
//! implementation, wrapping PCM clips as WAV and serving them over a small
//! axum router at `GET /clips/{id}.wav`. Only the most recent clips are
//! retained.

use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::audio::bytes_to_samples;
use crate::{Error, Result};

/// A published clip the device can stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioClip {
    pub id: String,
    pub url: String,
}

/// Where finished response audio goes so the device can fetch it.
#[async_trait]
pub trait AudioHost: Send + Sync {
    /// Publish one finished clip of mono pcm16 at `sample_rate`.
    ///
    /// # Errors
    ///
    /// Returns an error when the clip is empty or cannot be encoded.
    async fn publish(&self, pcm: &[u8], sample_rate: u32) -> Result<AudioClip>;
}

/// Recent clips in insertion order; the oldest fall off at the cap.
struct ClipStore {
    cap: usize,
    order: VecDeque<String>,
    clips: HashMap<String, Bytes>,
}

impl ClipStore {
    fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            order: VecDeque::new(),
            clips: HashMap::new(),
        }
    }

    fn insert(&mut self, id: String, wav: Bytes) {
        while self.order.len() >= self.cap {
            match self.order.pop_front() {
                Some(old) => {
                    self.clips.remove(&old);
                }
                None => break,
            }
        }
        self.order.push_back(id.clone());
        self.clips.insert(id, wav);
    }

    fn get(&self, id: &str) -> Option<Bytes> {
        self.clips.get(id).cloned()
    }
}

type SharedClips = Arc<Mutex<ClipStore>>;

/// In-process clip server.
#[derive(Clone)]
pub struct ClipHost {
    clips: SharedClips,
    public_base: String,
    bind: SocketAddr,
}

impl ClipHost {
    /// `public_base` is the URL prefix the *device* can reach the bridge
    /// at, e.g. `http://192.168.1.50:8350`.
    #[must_use]
    pub fn new(bind: SocketAddr, public_base: &str, clip_cap: usize) -> Self {
        Self {
            clips: Arc::new(Mutex::new(ClipStore::new(clip_cap))),
            public_base: public_base.trim_end_matches('/').to_string(),
            bind,
        }
    }

    #[must_use]
    pub fn url_for(&self, id: &str) -> String {
        format!("{}/clips/{id}.wav", self.public_base)
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/clips/{name}", get(get_clip))
            .with_state(self.clips.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Serve clips until the task is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Hosting`] when binding or serving fails.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.bind)
            .await
            .map_err(|e| Error::Hosting(format!("failed to bind clip host: {e}")))?;
        tracing::info!(addr = %self.bind, base = %self.public_base, "clip host listening");
        axum::serve(listener, self.router())
            .await
            .map_err(|e| Error::Hosting(format!("clip host error: {e}")))?;
        Ok(())
    }

    /// Run the clip server in a background task.
    #[must_use]
    pub fn spawn(&self) -> JoinHandle<Result<()>> {
        let host = self.clone();
        tokio::spawn(async move { host.run().await })
    }
}

#[async_trait]
impl AudioHost for ClipHost {
    async fn publish(&self, pcm: &[u8], sample_rate: u32) -> Result<AudioClip> {
        if pcm.is_empty() {
            return Err(Error::Hosting("refusing to publish an empty clip".to_string()));
        }
        let wav = Bytes::from(wav_bytes(pcm, sample_rate)?);
        let id = Uuid::new_v4().to_string();
        let url = self.url_for(&id);

        let duration_ms = (pcm.len() as u64 / 2) * 1000 / u64::from(sample_rate);
        tracing::info!(clip = %id, bytes = wav.len(), duration_ms, "clip published");

        self.clips
            .lock()
            .map_err(|_| Error::Hosting("clip store poisoned".to_string()))?
            .insert(id.clone(), wav);
        Ok(AudioClip { id, url })
    }
}

async fn get_clip(State(clips): State<SharedClips>, Path(name): Path<String>) -> Response {
    let id = name.strip_suffix(".wav").unwrap_or(&name);
    let Some(wav) = clips.lock().ok().and_then(|store| store.get(id)) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    ([(header::CONTENT_TYPE, "audio/wav")], wav).into_response()
}

/// Wrap raw mono pcm16 in a WAV container.
fn wav_bytes(pcm: &[u8], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
    for sample in bytes_to_samples(pcm) {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(cursor.into_inner())
}

/// Pick the local address the device can reach the bridge at, by routing
/// a UDP socket toward the device. No packets are sent.
#[must_use]
pub fn advertised_host(device_host: &str, device_port: u16) -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    socket.connect((device_host, device_port)).ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::audio::samples_to_bytes;

    fn host() -> ClipHost {
        ClipHost::new(
            "127.0.0.1:0".parse().unwrap(),
            "http://10.0.0.2:8350/",
            4,
        )
    }

    fn tone(samples: usize) -> Vec<u8> {
        let pcm: Vec<i16> = (0..samples).map(|i| ((i % 80) as i16 - 40) * 500).collect();
        samples_to_bytes(&pcm)
    }

    #[tokio::test]
    async fn published_clip_is_a_parseable_wav() {
        let host = host();
        let clip = host.publish(&tone(1600), 16_000).await.unwrap();
        assert_eq!(clip.url, format!("http://10.0.0.2:8350/clips/{}.wav", clip.id));

        let wav = host.clips.lock().unwrap().get(&clip.id).unwrap();
        let reader = hound::WavReader::new(Cursor::new(wav.to_vec())).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.sample_rate, 16_000);
        assert_eq!(spec.bits_per_sample, 16);
        assert_eq!(reader.len(), 1600);
    }

    #[tokio::test]
    async fn empty_clips_are_rejected() {
        let host = host();
        assert!(host.publish(&[], 16_000).await.is_err());
    }

    #[tokio::test]
    async fn oldest_clips_are_evicted_at_the_cap() {
        let host = host();
        let mut ids = Vec::new();
        for _ in 0..6 {
            ids.push(host.publish(&tone(160), 16_000).await.unwrap().id);
        }
        let store = host.clips.lock().unwrap();
        assert!(store.get(&ids[0]).is_none());
        assert!(store.get(&ids[1]).is_none());
        for id in &ids[2..] {
            assert!(store.get(id).is_some());
        }
    }

    #[tokio::test]
    async fn served_clip_round_trips_over_http() {
        let host = host();
        let clip = host.publish(&tone(320), 16_000).await.unwrap();

        let response = host
            .router()
            .oneshot(
                Request::builder()
                    .uri(format!("/clips/{}.wav", clip.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "audio/wav"
        );
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(body.starts_with(b"RIFF"));
    }

    #[tokio::test]
    async fn missing_clip_is_not_found() {
        let response = host()
            .router()
            .oneshot(
                Request::builder()
                    .uri("/clips/nope.wav")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
