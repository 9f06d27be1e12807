use anyhow::{Context, Result};
use basenbridge_lib::config::BridgeConfig;
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::time::Duration;

const fn about_text() -> &'static str {
    "Daren to SNS BMS protocol bridge"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// YAML configuration file; command line options override its values
    #[arg(short, long)]
    pub config: Option<String>,

    /// Serial device facing the Daren master (e.g., /dev/ttyUSB0 on Linux, COM1 on Windows)
    #[arg(long)]
    pub master_device: Option<String>,

    /// Baud rate of the master link
    #[arg(long)]
    pub master_baud: Option<u32>,

    /// Serial device facing the SNS slave
    #[arg(long)]
    pub slave_device: Option<String>,

    /// Baud rate of the slave link
    #[arg(long)]
    pub slave_baud: Option<u32>,

    /// Comma-separated slave addresses to answer for (0-31, e.g. "8" or "2,8")
    #[arg(short, long, use_value_delimiter = true)]
    pub addresses: Option<Vec<u8>>,

    /// Reopen the master link after this long without traffic (e.g., "10s")
    #[arg(value_parser = humantime::parse_duration, long)]
    pub idle_timeout: Option<Duration>,

    /// Upper bound of a single read on either link (e.g., "100ms")
    #[arg(value_parser = humantime::parse_duration, long)]
    pub poll_interval: Option<Duration>,

    /// Time allowed for the slave to answer one query (e.g., "1s")
    #[arg(value_parser = humantime::parse_duration, long)]
    pub response_timeout: Option<Duration>,

    /// Number of attempts for a slave query
    #[arg(long)]
    pub attempts: Option<u32>,

    /// Maximum number of polls handled concurrently
    #[arg(long)]
    pub max_in_flight: Option<usize>,

    /// Accept slave frames with a wrong checksum
    #[arg(long, action)]
    pub no_verify_checksum: bool,

    /// Shell command executed once when the bridge terminates with an error
    /// (e.g. "killall -9 socat" to release a virtual serial helper)
    #[arg(long)]
    pub on_fatal: Option<String>,
}

impl CliArgs {
    /// Merges the configuration file, if any, with the command line.
    pub fn bridge_config(&self) -> Result<BridgeConfig> {
        let mut config = match &self.config {
            Some(path) => BridgeConfig::load(path)
                .with_context(|| format!("Cannot load config file '{path}'"))?,
            None => BridgeConfig::default(),
        };
        if let Some(device) = &self.master_device {
            config.master.device = device.clone();
        }
        if let Some(baud_rate) = self.master_baud {
            config.master.baud_rate = baud_rate;
        }
        if let Some(device) = &self.slave_device {
            config.slave.device = device.clone();
        }
        if let Some(baud_rate) = self.slave_baud {
            config.slave.baud_rate = baud_rate;
        }
        if let Some(addresses) = &self.addresses {
            config.addresses = addresses.clone();
        }
        if let Some(idle_timeout) = self.idle_timeout {
            config.idle_timeout = idle_timeout;
        }
        if let Some(poll_interval) = self.poll_interval {
            config.poll_interval = poll_interval;
        }
        if let Some(response_timeout) = self.response_timeout {
            config.response_timeout = response_timeout;
        }
        if let Some(attempts) = self.attempts {
            config.attempts = attempts;
        }
        if let Some(max_in_flight) = self.max_in_flight {
            config.max_in_flight = max_in_flight;
        }
        if self.no_verify_checksum {
            config.verify_checksum = false;
        }
        config.validate().with_context(|| "Invalid bridge configuration")?;
        Ok(config)
    }
}
