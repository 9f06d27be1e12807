use crate::error::{Error, Result};
use crate::link::{write_frame, Opener};
use crate::protocol::{SlaveResponse, TELEMETRY_QUERY};
use crate::reader::FrameReader;
use std::time::Duration;

/// Pause after an attempt that got no reply at all.
pub const NO_RESPONSE_RETRY_DELAY: Duration = Duration::from_millis(500);
/// Pause after an attempt that got an unusable reply.
pub const INVALID_RESPONSE_RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveQueryConfig {
    /// Total number of attempts, at least one.
    pub attempts: u32,
    /// Time allowed for one reply to arrive.
    pub response_timeout: Duration,
    pub poll_interval: Duration,
    pub verify_checksum: bool,
}

/// Queries the real slave device with the telemetry service command.
#[derive(Debug)]
pub struct SlaveQuery<O> {
    opener: O,
    config: SlaveQueryConfig,
}

impl<O: Opener> SlaveQuery<O> {
    pub fn new(opener: O, config: SlaveQueryConfig) -> Self {
        Self { opener, config }
    }

    /// Sends the telemetry query and returns the first valid reply.
    ///
    /// The slave link is opened for this call only. Open failures and
    /// exhausted attempts are per-cycle errors, broken links are fatal.
    pub async fn query(&self, address: u8) -> Result<SlaveResponse> {
        log::debug!(
            "Querying slave at address {address} on {}",
            self.opener.describe()
        );
        let stream = self.opener.open()?;
        let mut reader = FrameReader::new(stream, self.config.poll_interval);
        let attempts = self.config.attempts.max(1);

        for attempt in 1..=attempts {
            log::debug!("Sending command to slave (attempt {attempt}/{attempts})");
            write_frame(reader.get_mut(), TELEMETRY_QUERY, "slave").await?;

            let retry_delay = match reader.read_frame_within(self.config.response_timeout).await? {
                Some(frame) if frame.len() > 1 => {
                    log::trace!("Raw bytes from slave: {frame:02X?}");
                    match SlaveResponse::validate(frame, self.config.verify_checksum) {
                        Ok(response) => {
                            log::debug!(
                                "Valid slave response: {}",
                                response.as_bytes().escape_ascii()
                            );
                            return Ok(response);
                        }
                        Err(err) => {
                            log::warn!("Unusable slave response on attempt {attempt}: {err}");
                            INVALID_RESPONSE_RETRY_DELAY
                        }
                    }
                }
                _ => {
                    log::warn!("No response from slave on attempt {attempt}");
                    NO_RESPONSE_RETRY_DELAY
                }
            };
            if attempt < attempts {
                tokio::time::sleep(retry_delay).await;
            }
        }
        Err(Error::SlaveNoResponse(attempts))
    }
}
