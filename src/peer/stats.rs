use std::time::{Duration, Instant};

use crate::constants::RATE_WINDOW;

/// Exponentially decayed transfer rate.
///
/// Every sample adds `bytes / window` to the rate after decaying the previous
/// value by `exp(-elapsed / window)`, so a steady flow of `r` bytes per second
/// converges to a rate of `r` and an idle peer fades towards zero.
#[derive(Debug, Clone)]
pub struct RateMeter {
    rate: f64,
    window: f64,
    last_update: Instant,
}

impl RateMeter {
    pub fn new(window: Duration) -> Self {
        Self::starting_at(window, Instant::now())
    }

    pub fn starting_at(window: Duration, now: Instant) -> Self {
        Self {
            rate: 0.0,
            window: window.as_secs_f64().max(f64::EPSILON),
            last_update: now,
        }
    }

    pub fn record(&mut self, bytes: u64) {
        self.record_at(bytes, Instant::now());
    }

    pub fn record_at(&mut self, bytes: u64, now: Instant) {
        self.rate = self.decayed(now) + bytes as f64 / self.window;
        self.last_update = self.last_update.max(now);
    }

    /// Bytes per second as of now.
    pub fn rate(&self) -> f64 {
        self.rate_at(Instant::now())
    }

    pub fn rate_at(&self, now: Instant) -> f64 {
        self.decayed(now)
    }

    fn decayed(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.rate * (-elapsed / self.window).exp()
    }
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::new(RATE_WINDOW)
    }
}

/// Byte counters and rates of one connection.
#[derive(Debug, Clone, Default)]
pub struct TransferStats {
    pub downloaded: u64,
    pub uploaded: u64,
    download: RateMeter,
    upload: RateMeter,
}

impl TransferStats {
    pub fn record_download(&mut self, bytes: u64) {
        self.downloaded += bytes;
        self.download.record(bytes);
    }

    pub fn record_upload(&mut self, bytes: u64) {
        self.uploaded += bytes;
        self.upload.record(bytes);
    }

    pub fn download_rate(&self) -> f64 {
        self.download.rate()
    }

    pub fn upload_rate(&self) -> f64 {
        self.upload.rate()
    }
}
