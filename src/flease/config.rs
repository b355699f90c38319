//! Timing and behavior configuration shared by all cells of a lease stage.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::utils::FleaseError;

use serde::{Deserialize, Serialize};

/// Configuration parameters struct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleaseConfig {
    /// Identity of this node; becomes the lease holder name.
    pub identity: String,

    /// Lease duration of every newly proposed lease.
    pub max_lease_timeout_ms: u64,

    /// Upper bound on clock drift between any two nodes.
    pub dmax_ms: u64,

    /// Messages older than this are dropped by both roles.
    pub message_timeout_ms: u64,

    /// Consecutive failed rounds tolerated before reporting lease failure.
    pub max_retries: u32,

    /// Broadcast LEARN messages after a successful round.
    pub send_learn_messages: bool,

    /// Lead time before a lease timeout at which the expiry notification
    /// is raised.
    pub to_notification_ms: u64,

    /// Trace every protocol message at DEBUG level.
    pub debug_print_messages: bool,

    /// Directory holding the crash-recovery lock file; no lock file if
    /// `None`.
    pub lockfile_dir: Option<String>,

    /// Remove a stale lock file instead of entering the recovery period.
    pub ignore_lockfile_for_testing: bool,

    /// Install a `SummaryStats` collector when none is given explicitly.
    pub collect_stats: bool,
}

/// Upper bound of every timing field, keeping derived values within `i64`.
pub(crate) const MAX_TIMING_MS: u64 = 1 << 40;

impl Default for FleaseConfig {
    fn default() -> Self {
        FleaseConfig {
            identity: "flease-node".into(),
            max_lease_timeout_ms: 15000,
            dmax_ms: 1000,
            message_timeout_ms: 500,
            max_retries: 3,
            send_learn_messages: true,
            to_notification_ms: 0,
            debug_print_messages: false,
            lockfile_dir: None,
            ignore_lockfile_for_testing: false,
            collect_stats: false,
        }
    }
}

impl FleaseConfig {
    /// Creates a validated config with given identity and timing constants,
    /// other fields taking their default values.
    pub fn new(
        identity: impl Into<String>,
        max_lease_timeout_ms: u64,
        dmax_ms: u64,
        message_timeout_ms: u64,
    ) -> Result<Self, FleaseError> {
        let config = FleaseConfig {
            identity: identity.into(),
            max_lease_timeout_ms,
            dmax_ms,
            message_timeout_ms,
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Composes a validated config from defaults overwritten by the given
    /// TOML string.
    pub fn from_toml(config_str: Option<&str>) -> Result<Self, FleaseError> {
        let config = parsed_config!(config_str => FleaseConfig;
                                    identity, max_lease_timeout_ms, dmax_ms,
                                    message_timeout_ms, max_retries,
                                    send_learn_messages, to_notification_ms,
                                    debug_print_messages, lockfile_dir,
                                    ignore_lockfile_for_testing,
                                    collect_stats)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the timing relationships that make the protocol safe.
    pub fn validate(&self) -> Result<(), FleaseError> {
        if self.identity.is_empty() {
            return logged_err!("identity must not be empty");
        }
        if self.message_timeout_ms == 0 {
            return logged_err!("message_timeout_ms must be positive");
        }
        for (name, value) in [
            ("max_lease_timeout_ms", self.max_lease_timeout_ms),
            ("dmax_ms", self.dmax_ms),
            ("message_timeout_ms", self.message_timeout_ms),
            ("to_notification_ms", self.to_notification_ms),
        ] {
            if value > MAX_TIMING_MS {
                return logged_err!("{} {} exceeds {}", name, value, MAX_TIMING_MS);
            }
        }
        let Some(two_dmax) = self.dmax_ms.checked_mul(2) else {
            return logged_err!("dmax_ms {} overflows", self.dmax_ms);
        };
        if self.max_lease_timeout_ms < two_dmax {
            return logged_err!(
                "max_lease_timeout_ms {} < 2 * dmax_ms {}",
                self.max_lease_timeout_ms,
                self.dmax_ms
            );
        }
        let min_lease = self
            .message_timeout_ms
            .checked_mul(4)
            .and_then(|rounds| rounds.checked_add(two_dmax));
        match min_lease {
            Some(min_lease) if self.max_lease_timeout_ms >= min_lease => {}
            _ => {
                return logged_err!(
                    "max_lease_timeout_ms {} < 2 * dmax_ms {} + 2 * round timeout of {} ms messages",
                    self.max_lease_timeout_ms,
                    self.dmax_ms,
                    self.message_timeout_ms
                );
            }
        }
        Ok(())
    }

    /// Round timeout: `2 * message_timeout`.
    #[inline]
    pub fn round_timeout_ms(&self) -> u64 {
        2 * self.message_timeout_ms
    }

    /// Acceptor cell GC timeout: `2 * max_lease_timeout`.
    #[inline]
    pub fn cell_timeout_ms(&self) -> u64 {
        2 * self.max_lease_timeout_ms
    }

    /// Recovery period after a crash:
    /// `max_lease_timeout + 2 * dmax + message_timeout`.
    #[inline]
    pub fn restart_wait_ms(&self) -> u64 {
        self.max_lease_timeout_ms + 2 * self.dmax_ms + self.message_timeout_ms
    }

    /// Stable per-identity ID used as the ballot tie-breaker.
    pub fn sender_id(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.identity.hash(&mut hasher);
        hasher.finish()
    }

    // signed shorthands for clock arithmetic

    #[inline]
    pub(crate) fn dmax(&self) -> i64 {
        self.dmax_ms as i64
    }

    #[inline]
    pub(crate) fn max_lease(&self) -> i64 {
        self.max_lease_timeout_ms as i64
    }

    #[inline]
    pub(crate) fn message_timeout(&self) -> i64 {
        self.message_timeout_ms as i64
    }

    #[inline]
    pub(crate) fn round_timeout(&self) -> i64 {
        self.round_timeout_ms() as i64
    }

    #[inline]
    pub(crate) fn cell_timeout(&self) -> i64 {
        self.cell_timeout_ms() as i64
    }
}
