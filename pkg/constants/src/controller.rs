//! Controller runtime defaults.

/// Upper bound on concurrent reconciles per controller.
pub const MAX_CONCURRENT_RECONCILES: usize = 10;

/// Resync period of a converged IamRoleServiceAccount, in seconds.
pub const RESYNC_INTERVAL_SECS: u64 = 20;

/// How often a Role polls its sibling Policy for a resolved ARN, in seconds.
pub const POLICY_POLL_INTERVAL_SECS: u64 = 2;

/// Delay between detach rounds while tearing a role down, in seconds.
pub const DETACH_RETRY_INTERVAL_SECS: u64 = 5;

/// Delay before retrying a pass that returned an error, in seconds.
pub const ERROR_BACKOFF_SECS: u64 = 5;
