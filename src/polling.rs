//! A background polling processor that periodically fetches a full rule
//! data snapshot and stores it. The fallback transport for environments
//! where streaming is disabled.
use std::sync::{mpsc::RecvTimeoutError, Arc};
use std::time::Duration;

use rand::{thread_rng, Rng};

use crate::requestor::Requestor;
use crate::signal::InitSignal;
use crate::store::DataStore;
use crate::{Error, Result};

/// Configuration for [`PollingProcessor`].
#[derive(Debug, Clone)]
pub struct PollingProcessorConfig {
    /// Interval to wait between snapshot requests. Values below
    /// [`PollingProcessorConfig::MIN_POLL_INTERVAL`] are raised to it.
    pub interval: Duration,
    /// Jitter applies a randomized duration to wait between requests. This
    /// helps to avoid multiple server instances synchronizing and
    /// producing spiky network load.
    pub jitter: Duration,
}

impl PollingProcessorConfig {
    /// Default and minimum value for [`PollingProcessorConfig::interval`].
    pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(30);
    /// Default value for [`PollingProcessorConfig::jitter`].
    pub const DEFAULT_POLL_JITTER: Duration = Duration::from_secs(3);

    pub fn new() -> PollingProcessorConfig {
        PollingProcessorConfig::default()
    }

    pub fn with_interval(mut self, interval: Duration) -> PollingProcessorConfig {
        self.interval = interval.max(PollingProcessorConfig::MIN_POLL_INTERVAL);
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> PollingProcessorConfig {
        self.jitter = jitter;
        self
    }
}

impl Default for PollingProcessorConfig {
    fn default() -> PollingProcessorConfig {
        PollingProcessorConfig {
            interval: PollingProcessorConfig::MIN_POLL_INTERVAL,
            jitter: PollingProcessorConfig::DEFAULT_POLL_JITTER,
        }
    }
}

/// A polling update processor.
///
/// The processor polls the control service periodically using
/// [`Requestor`] and replaces the store contents with each snapshot.
/// Recoverable request errors keep the loop running; a non-recoverable
/// error (bad SDK key, unusable endpoint) ends it.
pub struct PollingProcessor {
    join_handle: std::thread::JoinHandle<()>,

    /// Used to send a stop command to the polling thread.
    stop_sender: std::sync::mpsc::SyncSender<()>,

    init: Arc<InitSignal>,
}

impl PollingProcessor {
    /// Start the polling thread.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the thread failed to start.
    pub fn start(
        mut requestor: Requestor,
        store: Arc<dyn DataStore>,
        config: PollingProcessorConfig,
    ) -> std::io::Result<PollingProcessor> {
        // Using `sync_channel` as it makes `stop_sender` `Sync` (shareable
        // between threads). Buffer size of 1 is enough: we can `try_send()`
        // and ignore a full buffer (another thread has sent a stop command
        // already).
        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);

        let init = Arc::new(InitSignal::new());

        let join_handle = {
            let init = Arc::clone(&init);

            std::thread::Builder::new()
                .name("flagstream-poller".to_owned())
                .spawn(move || {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        let runtime = match tokio::runtime::Builder::new_current_thread()
                            .enable_all()
                            .build()
                        {
                            Ok(runtime) => runtime,
                            Err(err) => {
                                init.offer(Err(Error::from(err)));
                                return;
                            }
                        };

                        loop {
                            log::debug!(target: "flagstream", "polling for new rule data");
                            match runtime.block_on(requestor.request_all_data()) {
                                Ok(data) => {
                                    store.init(data);
                                    init.offer(Ok(()));
                                }
                                Err(err) if !err.is_recoverable() => {
                                    log::error!(target: "flagstream", "polling failed permanently: {err}");
                                    init.offer(Err(err));
                                    return;
                                }
                                Err(err) => {
                                    log::warn!(target: "flagstream", "polling failed, will retry: {err}");
                                }
                            }

                            let timeout = jitter(config.interval, config.jitter);
                            match stop_receiver.recv_timeout(timeout) {
                                Err(RecvTimeoutError::Timeout) => {
                                    // Timed out. Loop back for a new snapshot.
                                }
                                Ok(()) => {
                                    log::debug!(target: "flagstream", "polling thread received stop command");
                                    return;
                                }
                                Err(RecvTimeoutError::Disconnected) => {
                                    // When the other end of channel
                                    // disconnects, .recv_timeout() returns
                                    // immediately. Stop the thread.
                                    log::debug!(target: "flagstream", "polling thread disconnected");
                                    return;
                                }
                            }
                        }
                    }));

                    // If catch_unwind returns Err, a panic occurred.
                    if result.is_err() {
                        init.offer(Err(Error::ProcessorPanicked));
                    } else {
                        // Unblock any waiter if we exited before ever
                        // completing a poll.
                        init.offer(Err(Error::ClosedBeforeInitialization));
                    }
                })?
        };

        Ok(PollingProcessor {
            join_handle,
            stop_sender,
            init,
        })
    }

    /// Block until the first snapshot has been stored, or the processor
    /// failed permanently.
    pub fn wait_for_initialization(&self) -> Result<()> {
        self.init.wait()
    }

    /// Whether a snapshot has been stored.
    pub fn initialized(&self) -> bool {
        self.init.ready()
    }

    /// Stop the polling thread without waiting for it to exit.
    pub fn stop(&self) {
        // Error means the receiver was dropped (thread exited) or the
        // buffer is full (a stop command is already pending). Both are
        // fine to ignore.
        let _ = self.stop_sender.try_send(());
    }

    /// Stop the polling thread and block waiting for it to exit.
    pub fn shutdown(self) -> Result<()> {
        self.stop();
        self.join_handle
            .join()
            .map_err(|_| Error::ProcessorPanicked)?;
        Ok(())
    }
}

/// Apply randomized `jitter` to `interval`.
pub(crate) fn jitter(interval: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return interval;
    }
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}
