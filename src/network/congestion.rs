//! Congestion and quality monitoring
//!
//! `PacketStats` counts received and lost AV packets per stream and feeds
//! the congestion reporter, which tells the console every 200 ms how much
//! arrived. `QualityMonitor` keeps the console's recent quality reports
//! and exposes their average to whoever adapts the bitrate.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn, Instrument};

use super::av::RawPath;
use super::sequence_tracker::SequenceTracker;
use crate::protocol::{AvKind, ConnectionQuality, CongestionReport};

/// Number of quality reports averaged
pub const QUALITY_SAMPLE_COUNT: usize = 10;

/// Interval between congestion reports
pub const CONGESTION_INTERVAL: Duration = Duration::from_millis(200);

/// Average over the recent quality reports
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct QualityAverage {
    pub target_bitrate: f64,
    pub upstream_bitrate: f64,
    pub upstream_loss: f64,
    pub rtt: f64,
    pub loss: f64,
    pub samples: usize,
}

/// Rolling window of the last `QUALITY_SAMPLE_COUNT` quality reports
#[derive(Debug, Default)]
pub struct QualityMonitor {
    samples: Mutex<VecDeque<ConnectionQuality>>,
}

impl QualityMonitor {
    pub fn new() -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(QUALITY_SAMPLE_COUNT)),
        }
    }

    pub fn push(&self, sample: ConnectionQuality) {
        let mut samples = self.samples.lock();
        if samples.len() >= QUALITY_SAMPLE_COUNT {
            samples.pop_front();
        }
        samples.push_back(sample);
        trace!(
            "Quality sample: target {} kbps, rtt {:.1} ms, loss {}",
            sample.target_bitrate,
            sample.rtt,
            sample.loss
        );
    }

    /// Mean of the window, `None` before the first report
    pub fn average(&self) -> Option<QualityAverage> {
        let samples = self.samples.lock();
        if samples.is_empty() {
            return None;
        }
        let n = samples.len() as f64;
        let mut avg = QualityAverage {
            samples: samples.len(),
            ..QualityAverage::default()
        };
        for s in samples.iter() {
            avg.target_bitrate += f64::from(s.target_bitrate) / n;
            avg.upstream_bitrate += f64::from(s.upstream_bitrate) / n;
            avg.upstream_loss += f64::from(s.upstream_loss) / n;
            avg.rtt += s.rtt / n;
            avg.loss += s.loss as f64 / n;
        }
        Some(avg)
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }
}

#[derive(Debug, Default)]
struct StatsInner {
    video: SequenceTracker,
    audio: SequenceTracker,
    haptics: SequenceTracker,
    interval_received: u64,
    interval_lost: u64,
    undecryptable: u64,
}

/// Received/lost counters for the AV streams
#[derive(Debug, Default)]
pub struct PacketStats {
    inner: Mutex<StatsInner>,
}

impl PacketStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, kind: AvKind, packet_index: u16) {
        let mut inner = self.inner.lock();
        let tracker = match kind {
            AvKind::Video => &mut inner.video,
            AvKind::Audio => &mut inner.audio,
            AvKind::Haptics => &mut inner.haptics,
        };
        let before = tracker.packets_received();
        let lost = tracker.record(packet_index).len() as u64;
        let received = tracker.packets_received() - before;
        inner.interval_received += received;
        inner.interval_lost += lost;
    }

    /// Count a packet that arrived before the stream keys existed
    pub fn record_undecryptable(&self) {
        self.inner.lock().undecryptable += 1;
    }

    pub fn undecryptable(&self) -> u64 {
        self.inner.lock().undecryptable
    }

    /// Totals over the session: (received, lost)
    pub fn totals(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        let received = inner.video.packets_received()
            + inner.audio.packets_received()
            + inner.haptics.packets_received();
        let lost =
            inner.video.packets_lost() + inner.audio.packets_lost() + inner.haptics.packets_lost();
        (received, lost)
    }

    /// Counters since the previous call, with the loss share clamped to
    /// `packet_loss_max`
    pub fn take_interval(&self, packet_loss_max: f64) -> CongestionReport {
        let mut inner = self.inner.lock();
        let received = std::mem::take(&mut inner.interval_received);
        let mut lost = std::mem::take(&mut inner.interval_lost);

        let total = received + lost;
        if total > 0 && lost as f64 / total as f64 > packet_loss_max {
            lost = (total as f64 * packet_loss_max) as u64;
        }
        CongestionReport {
            received: received.min(u64::from(u16::MAX)) as u16,
            lost: lost.min(u64::from(u16::MAX)) as u16,
        }
    }
}

/// Spawn the task that reports packet counters to the console until
/// `cancel` fires
pub fn spawn_congestion_reporter(
    path: RawPath,
    stats: Arc<PacketStats>,
    packet_loss_max: f64,
    cancel: CancellationToken,
    span: tracing::Span,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            let mut ticker = interval(CONGESTION_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let report = stats.take_interval(packet_loss_max);
                if let Err(e) = path.send(&report.to_bytes()).await {
                    warn!("Congestion report failed: {}", e);
                    if e.is_fatal() {
                        break;
                    }
                }
            }
            debug!("Congestion reporter stopped");
        }
        .instrument(span),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(target_bitrate: u32, rtt: f64) -> ConnectionQuality {
        ConnectionQuality {
            target_bitrate,
            rtt,
            ..ConnectionQuality::default()
        }
    }

    #[test]
    fn test_average_empty() {
        assert!(QualityMonitor::new().average().is_none());
    }

    #[test]
    fn test_average_window() {
        let monitor = QualityMonitor::new();
        for i in 0..15 {
            monitor.push(sample(1000 * i, f64::from(i)));
        }
        assert_eq!(monitor.len(), QUALITY_SAMPLE_COUNT);

        // Samples 5..15 remain
        let avg = monitor.average().unwrap();
        assert_eq!(avg.samples, QUALITY_SAMPLE_COUNT);
        assert!((avg.rtt - 9.5).abs() < 1e-9);
        assert!((avg.target_bitrate - 9500.0).abs() < 1e-6);
    }

    #[test]
    fn test_packet_stats_interval() {
        let stats = PacketStats::new();
        stats.record(AvKind::Video, 0);
        stats.record(AvKind::Video, 1);
        stats.record(AvKind::Video, 4);
        stats.record(AvKind::Audio, 100);

        let report = stats.take_interval(1.0);
        assert_eq!(report.received, 4);
        assert_eq!(report.lost, 2);

        // Counters restart after each report
        let report = stats.take_interval(1.0);
        assert_eq!((report.received, report.lost), (0, 0));
        assert_eq!(stats.totals(), (4, 2));
    }

    #[test]
    fn test_loss_is_clamped() {
        let stats = PacketStats::new();
        stats.record(AvKind::Video, 0);
        stats.record(AvKind::Video, 10);

        // 2 received, 9 lost: clamp to 5% of 11
        let report = stats.take_interval(0.05);
        assert_eq!(report.received, 2);
        assert_eq!(report.lost, 0);

        stats.record(AvKind::Video, 20);
        let report = stats.take_interval(0.5);
        assert_eq!(report.lost, 5);
    }
}
