// src/downloader/throughput.rs

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

const RECENT_WEIGHT: f64 = 0.7;

/// 下载速度估算：近几秒的滑动窗口速度与整体平均速度加权。
pub(crate) struct ThroughputMeter {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
}

impl ThroughputMeter {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    pub(crate) fn record(&mut self, bytes_written: u64) {
        self.record_at(Instant::now(), bytes_written);
    }

    fn record_at(&mut self, now: Instant, bytes_written: u64) {
        self.samples.push_back((now, bytes_written));
        while let Some(&(t, _)) = self.samples.front() {
            if now.duration_since(t) > self.window && self.samples.len() > 2 {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// 进度回退（如整体重下）后丢弃旧样本。
    pub(crate) fn reset(&mut self) {
        self.samples.clear();
    }

    fn recent_rate(&self) -> Option<f64> {
        let (t0, b0) = *self.samples.front()?;
        let (t1, b1) = *self.samples.back()?;
        let secs = t1.duration_since(t0).as_secs_f64();
        (secs > 0.0).then(|| b1.saturating_sub(b0) as f64 / secs)
    }

    pub(crate) fn estimate(&self, bytes_written: u64, active_secs: f64) -> f64 {
        let average = if active_secs > 0.0 {
            bytes_written as f64 / active_secs
        } else {
            0.0
        };
        match self.recent_rate() {
            Some(recent) if average > 0.0 => RECENT_WEIGHT * recent + (1.0 - RECENT_WEIGHT) * average,
            Some(recent) => recent,
            None => average,
        }
    }
}
