//! One-shot acquisition: arm the instrument, wait out the hardware timing,
//! retrieve the buffer, package a record.

use crate::link::{DeviceLink, ReadStatus};
use crate::parameter::ParameterSet;
use crate::trace::{TraceRecord, TraceStatus};
use chrono::Utc;
use log::{debug, warn};
use std::time::Duration;

/// Over-wait multiplier applied to the computed trace duration before
/// polling for data. The trace is hardware-timed, so a conservative sleep
/// absorbs firmware and host scheduling jitter; the cost is latency, the
/// payoff is far fewer spurious retrieval timeouts.
const WAIT_FACTOR_NUM: u64 = 3;
const WAIT_FACTOR_DEN: u64 = 2;

/// One acquisition's record plus what the link managed to deliver.
pub struct TraceRun {
    pub record: TraceRecord,
    /// Whether the instrument is known to hold the trace parameters: either
    /// no push was requested, or the push write went through. Callers use
    /// this to re-push before the next trace.
    pub params_pushed: bool,
}

/// Runs exactly one acquisition per call against a shared [`DeviceLink`].
pub struct TraceSession {
    link: DeviceLink,
    adc_timeout: Duration,
}

impl TraceSession {
    pub fn new(link: DeviceLink) -> Self {
        let adc_timeout = link.adc_timeout();
        Self { link, adc_timeout }
    }

    /// Hardware duration of a trace: `num_points * (pulse_interval +
    /// pulse_length)` microseconds.
    pub fn expected_duration(params: &ParameterSet) -> Duration {
        let micros = u64::from(params.num_points)
            * (u64::from(params.pulse_interval) + u64::from(params.pulse_length));
        Duration::from_micros(micros)
    }

    /// How long to sleep between arming the trace and asking for data:
    /// 1.5x the expected duration.
    pub fn pre_retrieve_wait(params: &ParameterSet) -> Duration {
        Duration::from_micros(
            Self::expected_duration(params).as_micros() as u64 * WAIT_FACTOR_NUM
                / WAIT_FACTOR_DEN,
        )
    }

    /// Run one full acquisition and return its record.
    ///
    /// Never fails: every outcome, including link loss mid-trace, becomes a
    /// record whose status tells the story. `push_params` re-sends the
    /// parameter set first (used when it changed since the last trace, or a
    /// previous push failed).
    pub async fn run_trace(
        &self,
        params: &ParameterSet,
        push_params: bool,
        trace_num: u32,
        rep: u32,
    ) -> TraceRun {
        // The watchdog guarantees the link comes back eventually; block
        // here until it has.
        if let Err(e) = self.link.connect().await {
            warn!("trace {trace_num}: connect failed: {e}");
        }

        if let Err(e) = self.link.flush().await {
            warn!("trace {trace_num}: flush failed: {e}");
        }

        let trace_begun = Utc::now();
        let param_string = params.canonical_string(self.link.protocol_rev());

        let mut params_pushed = !push_params;
        let armed = {
            let pushed = if push_params {
                let result = self.link.send_params(params).await;
                params_pushed = result.is_ok();
                result
            } else {
                Ok(())
            };
            match pushed {
                Ok(()) => self.link.execute_trace().await,
                Err(e) => Err(e),
            }
        };

        let outcome = match armed {
            Ok(()) => {
                let wait = Self::pre_retrieve_wait(params);
                debug!("trace {trace_num}: armed, waiting {wait:?}");
                tokio::time::sleep(wait).await;

                match self.link.request_data(params.num_points).await {
                    Ok(()) => self.link.read_with_timeout(self.adc_timeout).await,
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        };

        let trace_end = Utc::now();

        let (status, buffer) = match outcome {
            Ok(outcome) => {
                let status = match outcome.status {
                    ReadStatus::Complete | ReadStatus::TimedOutWithData => {
                        TraceStatus::Completed
                    }
                    ReadStatus::TimedOutShort => {
                        warn!(
                            "trace {trace_num}: retrieval timed out with {} bytes",
                            outcome.buffer.len()
                        );
                        TraceStatus::TimedOut
                    }
                };
                (status, outcome.buffer)
            }
            Err(e) => {
                warn!("trace {trace_num}: link error during acquisition: {e}");
                (TraceStatus::TimedOut, String::new())
            }
        };

        TraceRun {
            record: TraceRecord {
                trace_num,
                rep,
                buffer,
                param_string,
                note: params.trace_note.clone(),
                trace_begun,
                trace_end,
                status,
            },
            params_pushed,
        }
    }
}
