//! 位置上报线程
//!
//! 每个流一个后台线程，只通过 `ServiceStream` 的公开接口访问流，
//! 所以它和客户端请求线程一样竞争同一把流锁。
//! 到期就 `report_data`，否则 park 到下一次到期（或空闲周期）。
//! stop/join 在调用方不持有流锁时进行。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::{ReportOutcome, ServiceStream, StreamState};
use crate::audio::timing::Clock;
use crate::error::StreamError;

struct ReporterState {
    running: AtomicBool,
    ticks: AtomicU64,
}

/// 上报线程句柄
///
/// Drop 时停止并等待线程退出
pub struct StreamReporter {
    state: Arc<ReporterState>,
    thread: Option<JoinHandle<()>>,
}

impl StreamReporter {
    /// 启动上报线程
    ///
    /// `idle_period_ns`：流不在 Started 时的轮询间隔
    pub fn spawn(
        stream: Arc<dyn ServiceStream>,
        clock: Arc<dyn Clock>,
        idle_period_ns: u64,
    ) -> Result<Self, StreamError> {
        let state = Arc::new(ReporterState {
            running: AtomicBool::new(true),
            ticks: AtomicU64::new(0),
        });

        let thread_state = Arc::clone(&state);
        let thread = thread::Builder::new()
            .name(format!("{}-reporter", stream.type_text().to_lowercase()))
            .spawn(move || Self::reporter_main(stream, clock, idle_period_ns, thread_state))
            .map_err(|e| StreamError::Internal(format!("failed to spawn reporter: {}", e)))?;

        Ok(Self {
            state,
            thread: Some(thread),
        })
    }

    fn reporter_main(
        stream: Arc<dyn ServiceStream>,
        clock: Arc<dyn Clock>,
        idle_period_ns: u64,
        state: Arc<ReporterState>,
    ) {
        log::debug!("Reporter thread started");

        while state.running.load(Ordering::Acquire) {
            let now = clock.now_ns();
            match stream.next_data_report_time() {
                Some(due) if due <= now => {
                    state.ticks.fetch_add(1, Ordering::Relaxed);
                    if stream.report_data() == ReportOutcome::Disconnected {
                        log::warn!("Reporter observed disconnect");
                    }
                }
                Some(due) => thread::park_timeout(Duration::from_nanos(due - now)),
                None => {
                    if stream.state() == StreamState::Closed {
                        break;
                    }
                    thread::park_timeout(Duration::from_nanos(idle_period_ns));
                }
            }
        }

        log::debug!(
            "Reporter thread finished after {} ticks",
            state.ticks.load(Ordering::Relaxed)
        );
    }

    /// 唤醒线程，让它立即重新检查流状态（例如刚 start）
    pub fn wake(&self) {
        if let Some(thread) = &self.thread {
            thread.thread().unpark();
        }
    }

    /// 已执行的上报次数
    pub fn ticks(&self) -> u64 {
        self.state.ticks.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// 停止并等待线程退出
    pub fn stop(&mut self) {
        self.state.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            if thread.join().is_err() {
                log::error!("Reporter thread panicked");
            }
        }
    }
}

impl Drop for StreamReporter {
    fn drop(&mut self) {
        self.stop();
    }
}
