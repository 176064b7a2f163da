//! Scripted in-memory `Ingest` for supervisor tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use hls2rtsp::ingest::{Ingest, IngestEvent, IngestSession};
use hls2rtsp::{Error, Result};

pub struct Script {
    pub events: Vec<IngestEvent>,
    /// Keeps the session open until fired or dropped.
    pub hold: Option<oneshot::Receiver<()>>,
}

/// Replays one queued script per connection; fails when none is queued.
pub struct ScriptedIngest {
    scripts: Mutex<mpsc::UnboundedReceiver<Script>>,
    opened: AtomicUsize,
}

impl ScriptedIngest {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedSender<Script>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ingest = Arc::new(Self {
            scripts: Mutex::new(rx),
            opened: AtomicUsize::new(0),
        });
        (ingest, tx)
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl Ingest for ScriptedIngest {
    fn open(&self, _url: &str, cancel: CancellationToken) -> Result<IngestSession> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.lock().try_recv().ok();
        Ok(IngestSession::spawn(cancel, move |tx| async move {
            let Some(script) = script else {
                return Err(Error::Playlist("origin unreachable".into()));
            };
            for event in script.events {
                tx.send(event).await.map_err(|_| Error::Cancelled)?;
            }
            if let Some(hold) = script.hold {
                let _ = hold.await;
            }
            Ok(())
        }))
    }
}
