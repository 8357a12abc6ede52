//! Runtime configuration updates.

use super::Downloader;

impl Downloader {
    /// Get the current bandwidth limit
    ///
    /// Returns the limit in bytes per second shared by all blocks of this
    /// transfer, or None if unlimited.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use segment_dl::{Config, Downloader};
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// # let downloader = Downloader::new("https://example.com/a.bin", "a.bin", Config::default())?;
    /// if let Some(bps) = downloader.get_speed_limit().await {
    ///     println!("Current speed limit: {} bytes/sec", bps);
    /// } else {
    ///     println!("No speed limit (unlimited)");
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub async fn get_speed_limit(&self) -> Option<u64> {
        self.shared.speed_limiter.limit_bps().await
    }

    /// Set the bandwidth limit
    ///
    /// Applies to running blocks from their next chunk on, and to every later
    /// run of this transfer.
    ///
    /// # Arguments
    ///
    /// * `limit_bps` - New speed limit in bytes per second (None = unlimited)
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use segment_dl::{Config, Downloader};
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// # let downloader = Downloader::new("https://example.com/a.bin", "a.bin", Config::default())?;
    /// // Set to 10 MB/s
    /// downloader.set_speed_limit(Some(10_000_000)).await;
    ///
    /// // Remove speed limit (unlimited)
    /// downloader.set_speed_limit(None).await;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn set_speed_limit(&self, limit_bps: Option<u64>) {
        self.shared.speed_limiter.set_limit(limit_bps).await;

        self.shared.emit_event(crate::types::Event::SpeedLimitChanged {
            id: self.shared.id,
            limit_bps,
        });

        tracing::info!(
            transfer_id = %self.shared.id,
            limit_bps = ?limit_bps,
            "Speed limit changed"
        );
    }
}
