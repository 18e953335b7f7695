//! Download tee
//!
//! Forwards an upstream body to the client while copying it into a pending
//! cache file. The copy is published only when the upstream finished cleanly
//! with the advertised length; any failure or an abandoned response drops
//! the pending file, which removes it from disk.

use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::cache::{ContentCache, PendingFile};
use crate::graph::ByteStream;

struct Tee {
    upstream: ByteStream,
    sink: Option<PendingFile>,
    cache: Arc<ContentCache>,
    expected: Option<u64>,
    finished: bool,
}

/// Wrap `upstream` so every chunk is also written to `sink`
///
/// With no sink the body is passed through untouched.
pub fn tee(
    upstream: ByteStream,
    sink: Option<PendingFile>,
    cache: Arc<ContentCache>,
    expected: Option<u64>,
) -> ByteStream {
    let Some(sink) = sink else {
        return upstream;
    };

    let state = Tee {
        upstream,
        sink: Some(sink),
        cache,
        expected,
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }

        match state.upstream.next().await {
            Some(Ok(chunk)) => {
                if let Some(sink) = state.sink.as_mut() {
                    if let Err(e) = sink.write(&chunk).await {
                        warn!(key = %sink.key().display(), error = %e, "Cache write failed, continuing uncached");
                        state.sink = None;
                    }
                }
                // The server may stop polling once the advertised length is sent
                let complete = state
                    .sink
                    .as_ref()
                    .is_some_and(|sink| Some(sink.written()) == state.expected);
                if complete {
                    if let Some(sink) = state.sink.take() {
                        spawn_publish(state.cache.clone(), sink, state.expected);
                    }
                }
                Some((Ok(chunk), state))
            }
            Some(Err(e)) => {
                if let Some(sink) = state.sink.take() {
                    warn!(key = %sink.key().display(), error = %e, "Download failed, discarding partial cache file");
                }
                state.finished = true;
                Some((Err(e), state))
            }
            None => {
                state.finished = true;
                if let Some(sink) = state.sink.take() {
                    spawn_publish(state.cache.clone(), sink, state.expected);
                }
                None
            }
        }
    })
    .boxed()
}

/// Commit off the response path so the last chunk never waits on an fsync
fn spawn_publish(cache: Arc<ContentCache>, sink: PendingFile, expected: Option<u64>) {
    tokio::spawn(async move { publish(&cache, sink, expected).await });
}

async fn publish(cache: &ContentCache, sink: PendingFile, expected: Option<u64>) {
    if let Some(expected) = expected {
        if sink.written() != expected {
            warn!(
                key = %sink.key().display(),
                expected = expected,
                written = sink.written(),
                "Download ended short, discarding cache file"
            );
            return;
        }
    }

    let key = sink.key().to_path_buf();
    match cache.commit(sink).await {
        Ok(size) => info!(key = %key.display(), size = size, "Cached downloaded file"),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            debug!(key = %key.display(), "File was cached by a concurrent download");
        }
        Err(e) => warn!(key = %key.display(), error = %e, "Failed to publish cache file"),
    }
}
