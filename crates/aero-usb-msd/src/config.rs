use std::env;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Default number of attempts a CBW or CSW phase gets before reset recovery.
pub const DEFAULT_RETRY_BUDGET: u8 = 3;

/// Default NAK retry count programmed into bulk pipes.
pub const DEFAULT_NAK_COUNT: u16 = 3000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MsdConfig {
    /// Retry budget set at the start of every command.
    ///
    /// Each stall or generic error in the CBW/CSW phases consumes one unit; the failure that
    /// brings the budget to zero escalates to reset recovery.
    pub retry_budget: u8,
    pub nak_count: u16,
    /// Restart a command from its CBW after a successful reset recovery that was caused by an
    /// exhausted retry budget, instead of failing it.
    pub restart_after_recovery: bool,
}

impl Default for MsdConfig {
    fn default() -> Self {
        Self {
            retry_budget: DEFAULT_RETRY_BUDGET,
            nak_count: DEFAULT_NAK_COUNT,
            restart_after_recovery: false,
        }
    }
}

impl MsdConfig {
    /// Defaults overridden by `AERO_USB_MSD_*` environment variables.
    ///
    /// - `AERO_USB_MSD_RETRY_BUDGET`
    /// - `AERO_USB_MSD_NAK_COUNT`
    /// - `AERO_USB_MSD_RESTART_AFTER_RECOVERY` (`true`/`false`/`1`/`0`)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            retry_budget: parse_env("AERO_USB_MSD_RETRY_BUDGET").unwrap_or(defaults.retry_budget),
            nak_count: parse_env("AERO_USB_MSD_NAK_COUNT").unwrap_or(defaults.nak_count),
            restart_after_recovery: env::var("AERO_USB_MSD_RESTART_AFTER_RECOVERY")
                .ok()
                .and_then(|v| parse_bool("AERO_USB_MSD_RESTART_AFTER_RECOVERY", &v))
                .unwrap_or(defaults.restart_after_recovery),
        }
    }

    pub fn with_retry_budget(mut self, retry_budget: u8) -> Self {
        self.retry_budget = retry_budget;
        self
    }

    pub fn with_nak_count(mut self, nak_count: u16) -> Self {
        self.nak_count = nak_count;
        self
    }

    pub fn with_restart_after_recovery(mut self, restart: bool) -> Self {
        self.restart_after_recovery = restart;
        self
    }
}

fn parse_env<T: FromStr>(var: &str) -> Option<T> {
    let value = env::var(var).ok()?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(var, value = %value, "ignoring unparsable MSD config override");
            None
        }
    }
}

fn parse_bool(var: &str, value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            tracing::warn!(var, value, "ignoring unparsable MSD config override");
            None
        }
    }
}
