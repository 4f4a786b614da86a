//! Blocking Unix-domain-socket transport to an out-of-process provider.
//!
//! Requests are framed onto the stream; a dedicated reader thread pumps
//! responses back into the messenger. When the stream breaks (provider
//! death), every outstanding wait is aborted so intercepted operations
//! proceed un-hydrated instead of hanging.

use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    read_frame, write_frame, MessageSink, ProviderMessenger, ProviderRequest,
    ProviderResponse, Result,
};

/// Outbound socket half shared by all sending threads.
pub struct SocketTransport {
    writer: Mutex<UnixStream>,
    reader: UnixStream,
}

impl SocketTransport {
    pub fn connect<P: AsRef<Path>>(path: P) -> Result<Arc<Self>> {
        let writer = UnixStream::connect(path.as_ref())?;
        let reader = writer.try_clone()?;
        debug!(path = %path.as_ref().display(), "connected to provider");
        Ok(Arc::new(Self {
            writer: Mutex::new(writer),
            reader,
        }))
    }

    /// Spawn the response pump feeding `messenger`. Runs until the stream
    /// errors or closes, then aborts all outstanding waits.
    pub fn spawn_reader(
        self: &Arc<Self>,
        messenger: Arc<ProviderMessenger>,
    ) -> JoinHandle<()> {
        let mut stream = match self.reader.try_clone() {
            Ok(s) => s,
            Err(err) => {
                // No reader means no responses will ever arrive.
                warn!(error = %err, "cloning provider stream failed; aborting waits");
                messenger.abort_all_outstanding();
                return thread::spawn(|| {});
            }
        };
        thread::spawn(move || loop {
            match read_frame::<_, ProviderResponse>(&mut stream) {
                Ok(response) => {
                    messenger.complete(response);
                }
                Err(err) => {
                    debug!(error = %err, "provider stream closed; aborting outstanding waits");
                    messenger.abort_all_outstanding();
                    break;
                }
            }
        })
    }
}

impl MessageSink for SocketTransport {
    fn deliver(&self, request: &ProviderRequest) -> Result<()> {
        let mut writer = self.writer.lock();
        write_frame(&mut *writer, request)
    }
}
