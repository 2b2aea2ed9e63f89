use crate::config::PollingConfig;
use crate::earth_engine::{EarthEngineOps, ExportTask, TaskState};
use crate::error::GlobeError;
use anyhow::Result;
use std::time::Duration;
use tokio::time::{sleep, Instant};

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Grows `current` by the multiplier, never below 1ms nor above the configured cap.
pub fn next_interval(current: Duration, config: &PollingConfig) -> Duration {
    let max = config.max_interval();
    let multiplier = if config.multiplier.is_finite() {
        config.multiplier.max(1.0)
    } else {
        1.0
    };
    Duration::try_from_secs_f64(current.as_secs_f64() * multiplier)
        .unwrap_or(max)
        .clamp(MIN_INTERVAL, max.max(MIN_INTERVAL))
}

/// Polls every unfinished task until all of them are completed, failed or cancelled.
/// Rounds are spaced with exponential backoff; the optional timeout bounds the whole wait.
pub async fn wait_for_tasks(
    ee: &impl EarthEngineOps,
    tasks: &mut [ExportTask],
    config: &PollingConfig,
) -> Result<()> {
    let started = Instant::now();
    let mut interval = config.initial_interval();

    loop {
        for task in tasks.iter_mut().filter(|t| !t.state.is_terminal()) {
            let status = ee.task_status(&task.id).await?;
            match status.state {
                TaskState::Failed => log::error!(
                    "Export of {} failed: {}",
                    task.file_name,
                    status.error.as_deref().unwrap_or("no reason given")
                ),
                TaskState::Cancelled => log::warn!("Export of {} was cancelled", task.file_name),
                _ => {}
            }
            task.state = status.state;
            task.error = status.error;
        }

        let finished = tasks.iter().filter(|t| t.state.is_terminal()).count();
        log::info!("Image Processed: {}/{}", finished, tasks.len());
        if finished == tasks.len() {
            return Ok(());
        }

        if let Some(timeout) = config.timeout() {
            if started.elapsed() >= timeout {
                return Err(GlobeError::PollTimeout(timeout).into());
            }
        }
        sleep(interval).await;
        interval = next_interval(interval, config);
    }
}
