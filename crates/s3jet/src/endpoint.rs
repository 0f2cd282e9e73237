//! Endpoint and region resolution.
//!
//! An [`Endpoint`] names the store a [`crate::Bucket`] talks to and answers
//! two questions: which host a request goes to, and which region its
//! signature is scoped to. Region resolution never guesses silently; when a
//! region cannot be determined the operation fails before any request is
//! signed or sent.

use std::env;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Result, S3Error};

/// Domain of the default public store.
const DEFAULT_DOMAIN: &str = "s3.amazonaws.com";

/// Domain used by transfer acceleration.
const ACCELERATE_DOMAIN: &str = "s3-accelerate.amazonaws.com";

/// Extracts the region embedded in regional store domains, e.g.
/// `s3-us-west-2.amazonaws.com` or `s3.eu-central-1.amazonaws.com`.
static REGION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^s3[-.]([a-z0-9-]+)\.amazonaws\.com").expect("region pattern is valid")
});

/// Where requests are addressed and which region signs them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// An AWS S3 domain, regional or global.
    Standard {
        /// Store domain, e.g. `s3.amazonaws.com` or `s3.eu-west-1.amazonaws.com`.
        domain: String,
    },
    /// The transfer-acceleration edge network. The signing region comes from
    /// `AWS_REGION`.
    Accelerated,
    /// Any S3-compatible store; both fields are explicit, nothing is inferred.
    Custom {
        /// Store domain, host name with optional port.
        domain: String,
        /// Region used in the signing scope.
        region: String,
    },
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::Standard {
            domain: DEFAULT_DOMAIN.to_owned(),
        }
    }
}

impl Endpoint {
    /// The bare store domain, without any bucket prefix.
    #[must_use]
    pub fn domain(&self) -> &str {
        match self {
            Self::Standard { domain } => domain,
            Self::Accelerated => ACCELERATE_DOMAIN,
            Self::Custom { domain, .. } => domain,
        }
    }

    /// The virtual-hosted-style domain for a bucket.
    #[must_use]
    pub fn domain_for_bucket(&self, bucket: &str) -> String {
        format!("{bucket}.{}", self.domain())
    }

    /// The region requests to this endpoint are signed for.
    ///
    /// Standard endpoints resolve `s3.amazonaws.com` and
    /// `s3-external-1.amazonaws.com` to `us-east-1`, extract the region from
    /// regional domains, and otherwise fall back to `AWS_REGION`. The
    /// accelerated endpoint always requires `AWS_REGION`, since its domain
    /// carries no region. Custom endpoints return their explicit region.
    ///
    /// # Errors
    ///
    /// Returns [`S3Error::RegionNotFound`] when no rule applies and
    /// `AWS_REGION` is unset.
    pub fn region(&self) -> Result<String> {
        match self {
            Self::Custom { region, .. } => Ok(region.clone()),
            Self::Accelerated => env_region().ok_or_else(|| S3Error::RegionNotFound {
                domain: ACCELERATE_DOMAIN.to_owned(),
            }),
            Self::Standard { domain } => match domain.as_str() {
                "s3.amazonaws.com" | "s3-external-1.amazonaws.com" => Ok("us-east-1".to_owned()),
                other => {
                    if let Some(captures) = REGION_PATTERN.captures(other) {
                        Ok(captures[1].to_owned())
                    } else {
                        env_region().ok_or_else(|| S3Error::RegionNotFound {
                            domain: other.to_owned(),
                        })
                    }
                }
            },
        }
    }
}

fn env_region() -> Option<String> {
    env::var("AWS_REGION").ok().filter(|r| !r.is_empty())
}
