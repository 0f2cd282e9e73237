//! Transfer configuration.
//!
//! A [`Config`] is supplied once per transfer and is immutable for its
//! lifetime. The defaults suit large objects on fat pipes; small-object
//! workloads usually want a smaller part size and less concurrency.

use std::fmt;
use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::error::{Result, S3Error};

/// Default number of concurrent part operations.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Default part size: 20 MiB.
pub const DEFAULT_PART_SIZE: u64 = 20 * 1024 * 1024;

/// Default attempt budget per part operation.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// URL scheme requests are sent over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Plain HTTP; only sensible against local or test stores.
    Http,
    /// HTTPS, the default.
    Https,
}

impl Scheme {
    /// The scheme as it appears in a URL.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transfer configuration.
///
/// Built with a builder; every field has a default. [`Config::validate`]
/// enforces the bounds at stream creation, never mid-transfer.
///
/// # Examples
///
/// ```
/// use s3jet::Config;
///
/// let config = Config::builder()
///     .concurrency(4)
///     .part_size(5 * 1024 * 1024)
///     .build();
/// assert_eq!(config.max_attempts, 10);
/// config.validate().unwrap();
/// ```
#[derive(Debug, Clone, TypedBuilder)]
pub struct Config {
    /// Maximum part operations in flight at once. Must be at least 1.
    #[builder(default = DEFAULT_CONCURRENCY)]
    pub concurrency: usize,

    /// Size of each transferred part in bytes. Must be positive. The store
    /// may reject multipart parts smaller than its own minimum (5 MiB on
    /// AWS) except for the final part.
    #[builder(default = DEFAULT_PART_SIZE)]
    pub part_size: u64,

    /// Attempt budget per part operation, counting the first attempt.
    /// Must be at least 1.
    #[builder(default = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: u32,

    /// Whether to maintain and verify content checksums via sidecar objects.
    #[builder(default = true)]
    pub verify_checksums: bool,

    /// URL scheme for every request.
    #[builder(default = Scheme::Https)]
    pub scheme: Scheme,

    /// Force path-style addressing (`https://domain/bucket/key`) instead of
    /// virtual-hosted style. Bucket names containing dots always use
    /// path-style regardless of this flag.
    #[builder(default = false)]
    pub path_style: bool,

    /// Per-request timeout on the shared HTTP client. A timed-out request
    /// counts as a transient failure against the part's attempt budget.
    #[builder(default = DEFAULT_TIMEOUT)]
    pub timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            part_size: DEFAULT_PART_SIZE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            verify_checksums: true,
            scheme: Scheme::Https,
            path_style: false,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl Config {
    /// Check the configuration bounds.
    ///
    /// # Errors
    ///
    /// Returns [`S3Error::Config`] when concurrency is zero, the part size is
    /// zero, or the attempt budget is zero.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(S3Error::Config {
                reason: "concurrency must be at least 1".to_owned(),
            });
        }
        if self.part_size == 0 {
            return Err(S3Error::Config {
                reason: "part size must be positive".to_owned(),
            });
        }
        if self.max_attempts == 0 {
            return Err(S3Error::Config {
                reason: "max attempts must be at least 1".to_owned(),
            });
        }
        Ok(())
    }
}
