//! Disposal.

use crate::types::TransferStatus;

use super::Downloader;
use super::supervisor::transition;

impl Downloader {
    /// Release the transfer
    ///
    /// This method performs the disposal sequence:
    /// 1. Cancels every running block and waits for the workers to exit
    /// 2. Records the confirmed offsets (see [`context`](Self::context))
    /// 3. Moves to `Disposed` and emits that as the final event
    /// 4. Waits for the supervisor tasks to finish
    ///
    /// Once this returns, no further progress or status event is emitted and
    /// every connection and file handle has been released. Later calls to
    /// `activate` and `suspend` return [`Error::Disposed`](crate::Error::Disposed).
    /// Calling `dispose` again only waits for the same tasks.
    pub async fn dispose(&self) {
        let shared = &self.shared;
        {
            let mut state = shared.state.lock().await;
            if state.status != TransferStatus::Disposed {
                tracing::info!(transfer_id = %shared.id, "Disposing transfer");

                if let Some(run) = &state.run {
                    run.stop().await;
                }
                state.capture_checkpoints();
                shared.root.cancel();
                transition(shared, &mut state, TransferStatus::Disposed);
            }
        }

        shared.tasks.close();
        shared.tasks.wait().await;
        tracing::debug!(transfer_id = %shared.id, "Transfer disposed");
    }
}
