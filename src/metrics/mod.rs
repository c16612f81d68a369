use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::breaker::{BreakerEvent, BreakerState};
use crate::stages::{Stage, StageAttempt};

/// Duration samples kept per stage.
const DURATION_SAMPLES_PER_STAGE: usize = 256;

/// Breaker events kept.
const EVENT_CAPACITY: usize = 128;

/// Entries kept in the last-successful-stage map.
const LAST_SUCCESS_CAPACITY: usize = 1024;

/// Below this many samples the p95 falls back to the observed max.
const PERCENTILE_MIN_SAMPLES: usize = 10;

const STAGE_ORDER: [Stage; 4] = [
    Stage::CaptionsApi,
    Stage::Timedtext,
    Stage::PlayerScrape,
    Stage::AudioPipeline,
];

#[derive(Debug, Clone, Copy, Serialize)]
pub struct StagePercentiles {
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub p50_ms: Option<u64>,
    pub p95_ms: Option<u64>,
    pub sample_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerReport {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub recent_events: Vec<BreakerEvent>,
}

/// Full observability report, serializable for a surrounding health or
/// metrics endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub generated_at: DateTime<Utc>,
    pub stages: Vec<StageReport>,
    pub breaker: BreakerReport,
    pub last_successful_stage: HashMap<String, Stage>,
}

#[derive(Default)]
struct StageStats {
    durations: VecDeque<u64>,
    attempts: u64,
    successes: u64,
    failures: u64,
}

#[derive(Default)]
struct MetricsInner {
    stages: HashMap<Stage, StageStats>,
    events: VecDeque<BreakerEvent>,
    last_success: HashMap<String, Stage>,
    last_success_order: VecDeque<String>,
}

/// Accumulates per-stage samples and breaker events under one mutex with
/// append-only critical sections. All buffers are bounded, oldest evicted.
#[derive(Default)]
pub struct MetricsRecorder {
    inner: Mutex<MetricsInner>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_stage(&self, video_id: &str, attempt: &StageAttempt) {
        let mut inner = self.lock();

        let stats = inner.stages.entry(attempt.stage).or_default();
        stats.attempts += 1;
        if attempt.success {
            stats.successes += 1;
        } else {
            stats.failures += 1;
        }
        stats.durations.push_back(attempt.duration_ms);
        while stats.durations.len() > DURATION_SAMPLES_PER_STAGE {
            stats.durations.pop_front();
        }

        if attempt.success {
            if !inner.last_success.contains_key(video_id) {
                inner.last_success_order.push_back(video_id.to_string());
            }
            inner.last_success.insert(video_id.to_string(), attempt.stage);
            while inner.last_success.len() > LAST_SUCCESS_CAPACITY {
                if let Some(evicted) = inner.last_success_order.pop_front() {
                    inner.last_success.remove(&evicted);
                } else {
                    break;
                }
            }
        }
    }

    pub fn record_breaker_event(&self, event: BreakerEvent) {
        let mut inner = self.lock();
        inner.events.push_back(event);
        while inner.events.len() > EVENT_CAPACITY {
            inner.events.pop_front();
        }
    }

    /// Nearest-rank percentiles for one stage, None when no samples exist.
    pub fn percentiles(&self, stage: Stage) -> Option<StagePercentiles> {
        let inner = self.lock();
        let stats = inner.stages.get(&stage)?;
        percentiles_of(&stats.durations)
    }

    /// Breaker state is owned by the breaker itself; the caller reads it
    /// first and passes it in, which keeps the two locks independent.
    pub fn snapshot(&self, breaker_state: BreakerState, breaker_failures: u32) -> MetricsSnapshot {
        let inner = self.lock();

        let stages = STAGE_ORDER
            .iter()
            .map(|stage| {
                let stats = inner.stages.get(stage);
                let pct = stats.and_then(|s| percentiles_of(&s.durations));
                StageReport {
                    stage: *stage,
                    attempts: stats.map(|s| s.attempts).unwrap_or(0),
                    successes: stats.map(|s| s.successes).unwrap_or(0),
                    failures: stats.map(|s| s.failures).unwrap_or(0),
                    p50_ms: pct.map(|p| p.p50_ms),
                    p95_ms: pct.map(|p| p.p95_ms),
                    sample_count: pct.map(|p| p.count).unwrap_or(0),
                }
            })
            .collect();

        MetricsSnapshot {
            generated_at: Utc::now(),
            stages,
            breaker: BreakerReport {
                state: breaker_state,
                consecutive_failures: breaker_failures,
                recent_events: inner.events.iter().cloned().collect(),
            },
            last_successful_stage: inner.last_success.clone(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MetricsInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn percentiles_of(durations: &VecDeque<u64>) -> Option<StagePercentiles> {
    if durations.is_empty() {
        return None;
    }
    let mut sorted: Vec<u64> = durations.iter().copied().collect();
    sorted.sort_unstable();

    let count = sorted.len();
    let p50_ms = nearest_rank(&sorted, 50.0);
    let p95_ms = if count < PERCENTILE_MIN_SAMPLES {
        sorted[count - 1]
    } else {
        nearest_rank(&sorted, 95.0)
    };
    Some(StagePercentiles {
        p50_ms,
        p95_ms,
        count,
    })
}

fn nearest_rank(sorted: &[u64], percentile: f64) -> u64 {
    let rank = ((percentile / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(stage: Stage, success: bool, duration_ms: u64) -> StageAttempt {
        StageAttempt {
            stage,
            started_at: Utc::now(),
            duration_ms,
            success,
            fail_class: None,
            proxy_used: true,
            cookies_used: false,
        }
    }

    #[test]
    fn test_percentiles_nearest_rank() {
        let recorder = MetricsRecorder::new();
        for ms in 1..=100 {
            recorder.record_stage("vid", &attempt(Stage::Timedtext, true, ms));
        }
        let pct = recorder.percentiles(Stage::Timedtext).unwrap();
        assert_eq!(pct.p50_ms, 50);
        assert_eq!(pct.p95_ms, 95);
        assert_eq!(pct.count, 100);
    }

    #[test]
    fn test_percentiles_small_sample_uses_max_for_p95() {
        let recorder = MetricsRecorder::new();
        for ms in [10, 20, 30, 40, 50] {
            recorder.record_stage("vid", &attempt(Stage::CaptionsApi, true, ms));
        }
        let pct = recorder.percentiles(Stage::CaptionsApi).unwrap();
        assert_eq!(pct.p50_ms, 30);
        assert_eq!(pct.p95_ms, 50);
        assert_eq!(pct.count, 5);
    }

    #[test]
    fn test_percentiles_none_without_samples() {
        let recorder = MetricsRecorder::new();
        assert!(recorder.percentiles(Stage::AudioPipeline).is_none());
    }

    #[test]
    fn test_duration_ring_buffer_evicts_oldest() {
        let recorder = MetricsRecorder::new();
        for ms in 1..=300 {
            recorder.record_stage("vid", &attempt(Stage::PlayerScrape, true, ms));
        }
        let pct = recorder.percentiles(Stage::PlayerScrape).unwrap();
        assert_eq!(pct.count, 256);
        // Window now holds 45..=300; nearest-rank median is the 128th.
        assert_eq!(pct.p50_ms, 172);
    }

    #[test]
    fn test_event_buffer_bounded() {
        let recorder = MetricsRecorder::new();
        for _ in 0..200 {
            recorder.record_breaker_event(BreakerEvent {
                at: Utc::now(),
                stage: Stage::PlayerScrape,
                kind: crate::breaker::BreakerEventKind::FailureRecorded,
                previous_state: BreakerState::Closed,
                new_state: BreakerState::Closed,
                consecutive_failures: 1,
            });
        }
        let snapshot = recorder.snapshot(BreakerState::Closed, 0);
        assert_eq!(snapshot.breaker.recent_events.len(), 128);
    }

    #[test]
    fn test_last_success_map_bounded() {
        let recorder = MetricsRecorder::new();
        for i in 0..1100 {
            let video = format!("video-{:05}", i);
            recorder.record_stage(&video, &attempt(Stage::Timedtext, true, 10));
        }
        let snapshot = recorder.snapshot(BreakerState::Closed, 0);
        assert_eq!(snapshot.last_successful_stage.len(), 1024);
        // Oldest entries were evicted first.
        assert!(!snapshot.last_successful_stage.contains_key("video-00000"));
        assert!(snapshot.last_successful_stage.contains_key("video-01099"));
    }

    #[test]
    fn test_last_success_tracks_latest_stage() {
        let recorder = MetricsRecorder::new();
        recorder.record_stage("vid", &attempt(Stage::CaptionsApi, true, 5));
        recorder.record_stage("vid", &attempt(Stage::AudioPipeline, true, 900));
        let snapshot = recorder.snapshot(BreakerState::Closed, 0);
        assert_eq!(
            snapshot.last_successful_stage.get("vid"),
            Some(&Stage::AudioPipeline)
        );
    }

    #[test]
    fn test_failed_attempts_do_not_enter_success_map() {
        let recorder = MetricsRecorder::new();
        recorder.record_stage("vid", &attempt(Stage::Timedtext, false, 12));
        let snapshot = recorder.snapshot(BreakerState::Closed, 0);
        assert!(snapshot.last_successful_stage.is_empty());
    }

    #[test]
    fn test_snapshot_counts() {
        let recorder = MetricsRecorder::new();
        recorder.record_stage("a", &attempt(Stage::Timedtext, true, 10));
        recorder.record_stage("b", &attempt(Stage::Timedtext, true, 20));
        recorder.record_stage("c", &attempt(Stage::Timedtext, false, 30));

        let snapshot = recorder.snapshot(BreakerState::Closed, 0);
        let report = snapshot
            .stages
            .iter()
            .find(|r| r.stage == Stage::Timedtext)
            .unwrap();
        assert_eq!(report.attempts, 3);
        assert_eq!(report.successes, 2);
        assert_eq!(report.failures, 1);
        assert_eq!(report.sample_count, 3);

        // Untouched stages appear with zero counts.
        let audio = snapshot
            .stages
            .iter()
            .find(|r| r.stage == Stage::AudioPipeline)
            .unwrap();
        assert_eq!(audio.attempts, 0);
        assert!(audio.p50_ms.is_none());
    }
}
