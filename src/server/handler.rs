//! Per-stream fragment handling.
//!
//! Each stream owns its own [`SessionRegistry`]; sessions never cross
//! streams and need no locking. CPU-heavy steps (decompression, model
//! execution) run on the blocking pool with the session moved into the
//! blocking task and back.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::state::ServerStats;
use crate::config::{EvictionPolicy, SessionConfig};
use crate::error::{OffloadError, Result};
use crate::protocol::{
    Action, ActionSet, Applied, Fragment, InferenceBackend, Response, Session, SessionStats,
};
use crate::transport::{read_frame, write_frame, DEFAULT_MAX_FRAME_BYTES};

/// Frames decoded ahead of the handler
const READ_AHEAD: usize = 8;

/// Sessions owned by one stream, keyed by id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, Session>,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the session for `id` out of the registry, creating it when the
    /// id is unknown. Returns whether it was created.
    pub fn take_or_create(&mut self, id: &str) -> (Session, bool) {
        match self.sessions.remove(id) {
            Some(session) => (session, false),
            None => {
                tracing::debug!(session = %id, "unknown session id, initialising");
                (Session::new(id), true)
            },
        }
    }

    /// Put a session (back) into the registry
    pub fn insert(&mut self, session: Session) {
        self.sessions.insert(session.id().to_string(), session);
    }

    /// Look up a session
    pub fn get(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id)
    }

    /// Forget a session
    pub fn remove(&mut self, id: &str) -> Option<Session> {
        self.sessions.remove(id)
    }

    /// Remove sessions idle longer than `timeout`, returning their ids.
    pub fn evict_idle(&mut self, timeout: Duration) -> Vec<String> {
        let expired: Vec<String> = self
            .sessions
            .values()
            .filter(|s| s.is_idle(timeout))
            .map(|s| s.id().to_string())
            .collect();
        for id in &expired {
            self.sessions.remove(id);
        }
        expired
    }

    /// Drop everything, returning how many sessions were held.
    pub fn clear(&mut self) -> usize {
        let count = self.sessions.len();
        self.sessions.clear();
        count
    }

    /// Statistics for every held session
    pub fn stats(&self) -> Vec<SessionStats> {
        self.sessions.values().map(Session::stats).collect()
    }

    /// Number of sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Drives one bidirectional stream.
pub struct StreamHandler<B: ?Sized> {
    backend: Arc<B>,
    stats: Arc<ServerStats>,
    registry: SessionRegistry,
    session_config: SessionConfig,
    max_frame_bytes: usize,
}

impl<B> StreamHandler<B>
where
    B: InferenceBackend + ?Sized + 'static,
{
    /// Handler with default session settings
    pub fn new(backend: Arc<B>, stats: Arc<ServerStats>) -> Self {
        Self {
            backend,
            stats,
            registry: SessionRegistry::new(),
            session_config: SessionConfig::default(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    /// Set idle timeout and eviction policy
    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    /// Set the largest accepted frame
    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    /// Sessions held by this stream
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Apply one fragment to its session.
    ///
    /// Per-fragment failures come back as an error [`Response`]; the session
    /// stays in the registry. Any other error ends the stream.
    pub async fn handle_fragment(&mut self, fragment: Fragment) -> Result<Option<Response>> {
        let id = fragment.id.clone();
        let actions = fragment.action;
        let (mut session, created) = self.registry.take_or_create(&id);
        if created {
            self.stats.session_opened();
        }
        self.stats.record_fragment();

        let (session, outcome) = if needs_blocking(actions) {
            let backend = Arc::clone(&self.backend);
            tokio::task::spawn_blocking(move || {
                let outcome = session.apply(&fragment, backend.as_ref());
                (session, outcome)
            })
            .await
            .map_err(|e| {
                self.stats.sessions_closed(1);
                OffloadError::Server(format!("Session task for '{id}' failed: {e}"))
            })?
        } else {
            let outcome = session.apply(&fragment, self.backend.as_ref());
            (session, outcome)
        };

        match outcome {
            Ok(Applied::Continue(response)) => {
                self.registry.insert(session);
                if response.is_some() {
                    self.stats.record_inference();
                }
                Ok(response)
            },
            Ok(Applied::Terminated) => {
                tracing::debug!(session = %id, "session ended");
                self.stats.sessions_closed(1);
                Ok(None)
            },
            Err(e) if e.is_per_fragment() => {
                tracing::warn!(session = %id, actions = %actions, "fragment failed: {e}");
                self.registry.insert(session);
                self.stats.record_error();
                Ok(Some(Response::error(id, actions, &e)))
            },
            Err(e) => {
                self.registry.insert(session);
                Err(e)
            },
        }
    }

    /// Evict sessions idle past the configured timeout.
    ///
    /// Returns timeout notices when the policy is [`EvictionPolicy::Notify`].
    pub fn evict_idle(&mut self) -> Vec<Response> {
        let Some(timeout) = self.session_config.idle_timeout() else {
            return Vec::new();
        };
        let expired = self.registry.evict_idle(timeout);
        if expired.is_empty() {
            return Vec::new();
        }

        self.stats.record_evictions(expired.len());
        for id in &expired {
            tracing::warn!(session = %id, "evicting idle session after {:?}", timeout);
        }
        match self.session_config.eviction {
            EvictionPolicy::Drop => Vec::new(),
            EvictionPolicy::Notify => expired.into_iter().map(Response::timeout).collect(),
        }
    }

    /// Serve the stream until the peer closes it, a transport error occurs
    /// or `shutdown` fires. Sessions still held are dropped unprocessed.
    pub async fn run<R, W>(
        mut self,
        reader: R,
        mut writer: W,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin,
    {
        let mut frames = spawn_reader(reader, self.max_frame_bytes);
        let mut sweep = tokio::time::interval(self.session_config.sweep_interval());
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let result = loop {
            if *shutdown.borrow() {
                break Ok(());
            }
            tokio::select! {
                frame = frames.recv() => {
                    let body = match frame {
                        None => break Ok(()),
                        Some(Err(e)) => break Err(e),
                        Some(Ok(body)) => body,
                    };
                    let fragment = match Fragment::decode(&body) {
                        Ok(fragment) => fragment,
                        Err(e) => break Err(e),
                    };
                    tracing::debug!(
                        session = %fragment.id,
                        actions = %fragment.action,
                        bytes = fragment.chunk.len(),
                        layer = fragment.layer,
                        "fragment received"
                    );
                    match self.handle_fragment(fragment).await {
                        Ok(Some(response)) => {
                            if let Err(e) = write_frame(&mut writer, &response.encode()).await {
                                break Err(e);
                            }
                        }
                        Ok(None) => {}
                        Err(e) => break Err(e),
                    }
                }
                _ = sweep.tick() => {
                    let mut failed = None;
                    for notice in self.evict_idle() {
                        if let Err(e) = write_frame(&mut writer, &notice.encode()).await {
                            failed = Some(e);
                            break;
                        }
                    }
                    if let Some(e) = failed {
                        break Err(e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                }
            }
        };

        drop(frames);
        if let Err(e) = writer.shutdown().await {
            tracing::debug!("stream shutdown failed: {e}");
        }
        self.finish(result)
    }

    fn finish(mut self, result: Result<()>) -> Result<()> {
        let dropped = self.registry.clear();
        self.stats.sessions_closed(dropped);
        if dropped > 0 {
            tracing::info!("dropping {dropped} unfinished sessions");
        }
        result
    }
}

/// Decompression and inference are CPU-bound; plain receives are not.
fn needs_blocking(actions: ActionSet) -> bool {
    if actions.contains(Action::End) {
        return false;
    }
    actions.contains(Action::Inference)
        || (actions.contains(Action::Append) && actions.contains(Action::Compressed))
}

/// Frames decoded by the reader task. Dropping it aborts the task, which
/// releases the read half of the stream.
struct FrameReader {
    frames: mpsc::Receiver<Result<Vec<u8>>>,
    task: JoinHandle<()>,
}

impl FrameReader {
    async fn recv(&mut self) -> Option<Result<Vec<u8>>> {
        self.frames.recv().await
    }
}

impl Drop for FrameReader {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Read frames on their own task so the handler loop can select on a
/// cancel-safe channel.
fn spawn_reader<R>(mut reader: R, max_frame_bytes: usize) -> FrameReader
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, frames) = mpsc::channel(READ_AHEAD);
    let task = tokio::spawn(async move {
        loop {
            let frame = match read_frame(&mut reader, max_frame_bytes).await {
                Ok(Some(body)) => Ok(body),
                Ok(None) => break,
                Err(e) => Err(e),
            };
            let failed = frame.is_err();
            if tx.send(frame).await.is_err() || failed {
                break;
            }
        }
    });
    FrameReader { frames, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{InferenceOutput, SessionState};
    use bytes::Bytes;

    /// Echoes the payload back; "decompresses" by reversing the bytes.
    struct Echo;

    impl InferenceBackend for Echo {
        fn decompress(&self, payload: &[u8]) -> Result<Bytes> {
            Ok(payload.iter().rev().copied().collect::<Vec<u8>>().into())
        }

        fn infer(&self, payload: &[u8], layer: i32) -> Result<InferenceOutput> {
            if layer < 0 {
                return Err(OffloadError::ModelExecution("negative layer".into()));
            }
            let mut output = InferenceOutput {
                results: Bytes::copy_from_slice(payload),
                ..Default::default()
            };
            output.keypairs.insert("start_layer".into(), layer);
            Ok(output)
        }
    }

    fn handler() -> StreamHandler<Echo> {
        StreamHandler::new(Arc::new(Echo), Arc::new(ServerStats::new()))
    }

    #[tokio::test]
    async fn test_unknown_id_initialises_session() {
        let mut handler = handler();
        let fragment = Fragment::new("cam-1").with_chunk(Bytes::from_static(b"ab"));
        assert!(handler.handle_fragment(fragment).await.unwrap().is_none());

        let session = handler.registry().get("cam-1").unwrap();
        assert_eq!(session.state(), SessionState::Accumulating);
        assert_eq!(session.buffer().len(), 1);
    }

    #[tokio::test]
    async fn test_error_contained() {
        let mut handler = handler();
        let fragment = Fragment::new("cam-1")
            .with_chunk(Bytes::from_static(b"ab"))
            .with_action(Action::Inference);
        let response = handler.handle_fragment(fragment).await.unwrap().unwrap();

        assert!(response.is_error());
        assert_eq!(response.keypairs["error"], 1);
        assert!(response.actions.contains(Action::Inference));
        assert!(handler.registry().get("cam-1").is_some());
    }

    #[tokio::test]
    async fn test_end_forgets_session() {
        let mut handler = handler();
        handler
            .handle_fragment(Fragment::new("a").with_chunk(Bytes::from_static(b"x")))
            .await
            .unwrap();
        let end = Fragment::new("a").with_action(Action::End);
        assert!(handler.handle_fragment(end).await.unwrap().is_none());
        assert!(handler.registry().is_empty());
    }

    #[tokio::test]
    async fn test_compressed_inference_on_blocking_pool() {
        let mut handler = handler();
        handler
            .handle_fragment(Fragment::new("a").with_chunk(Bytes::from_static(b"cba")))
            .await
            .unwrap();
        let fragment = Fragment::new("a")
            .with_action(Action::Append)
            .with_action(Action::Compressed)
            .with_action(Action::Inference)
            .with_layer(2);
        let response = handler.handle_fragment(fragment).await.unwrap().unwrap();
        assert_eq!(response.results, Bytes::from_static(b"abc"));
        assert_eq!(response.keypairs["start_layer"], 2);
    }

    #[tokio::test]
    async fn test_evict_idle_notify() {
        let config = SessionConfig {
            idle_timeout_secs: 1,
            eviction: EvictionPolicy::Notify,
            sweep_interval_ms: 10,
        };
        let mut handler = handler().with_session_config(config);
        handler
            .handle_fragment(Fragment::new("a").with_chunk(Bytes::from_static(b"x")))
            .await
            .unwrap();
        assert!(handler.evict_idle().is_empty());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let notices = handler.evict_idle();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].id, "a");
        assert_eq!(notices[0].keypairs["error"], 4);
        assert!(handler.registry().is_empty());
    }

    #[tokio::test]
    async fn test_run_releases_read_half() {
        let (client, server) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server);
        let (_client_read, mut client_write) = tokio::io::split(client);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(handler().run(server_read, server_write, shutdown_rx));
        write_frame(
            &mut client_write,
            &Fragment::new("a").with_chunk(Bytes::from_static(b"x")).encode(),
        )
        .await
        .unwrap();
        shutdown_tx.send_replace(true);
        task.await.unwrap().unwrap();

        // The peer never closed its side; once the reader task is gone the
        // server end of the stream is dropped and writes fail.
        let closed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if client_write.write_all(b"x").await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(closed.is_ok(), "read half still held after run returned");
    }

    #[test]
    fn test_needs_blocking() {
        assert!(!needs_blocking(ActionSet::from(Action::Append)));
        assert!(needs_blocking(ActionSet::from(Action::Inference)));
        assert!(needs_blocking(
            [Action::Append, Action::Compressed].into_iter().collect()
        ));
        assert!(!needs_blocking(
            [Action::End, Action::Inference].into_iter().collect()
        ));
    }
}
