//-
// Copyright (c) 2023, 2024, Jason Lingle
//
// This file is part of Spfeval.
//
// Spfeval is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Spfeval is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Spfeval. If not, see <http://www.gnu.org/licenses/>.

//! The DNS boundary of the SPF evaluator.
//!
//! The evaluator only ever talks to a `Resolver`. `HickoryResolver` is the
//! production implementation; tests substitute an in-memory one.

use std::future::Future;
use std::net::IpAddr;
use std::time::Duration;

use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::TokioAsyncResolver;
use thiserror::Error;

use super::error::Error;
use super::system_config::DnsConfig;

/// Why a DNS query produced no usable answer.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum DnsError {
    /// The name does not exist or has no records of the requested type.
    #[error("no such DNS record")]
    NotFound,
    /// Anything else: timeouts, server failures, malformed responses.
    #[error("DNS query failed: {0}")]
    Failed(String),
}

/// The three queries SPF evaluation needs.
///
/// Names are passed without a trailing dot and are always treated as fully
/// qualified.
pub trait Resolver {
    /// Returns every TXT record at `name`, each one's character-strings
    /// concatenated.
    fn lookup_txt(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Vec<String>, DnsError>>;

    /// Returns every A and AAAA record at `name`.
    fn lookup_addresses(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Vec<IpAddr>, DnsError>>;

    /// Returns the `(preference, exchange)` pairs of every MX record at
    /// `name`.
    fn lookup_mx(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Vec<(u16, String)>, DnsError>>;
}

/// A `Resolver` backed by `hickory-resolver` on the contextual tokio runtime.
///
/// Each query is bounded by its own timeout on top of whatever the upstream
/// configuration does.
pub struct HickoryResolver {
    inner: TokioAsyncResolver,
    timeout: Duration,
}

impl HickoryResolver {
    pub fn new(config: &DnsConfig) -> Result<Self, Error> {
        let inner = if config.use_system_config {
            TokioAsyncResolver::tokio_from_system_conf()?
        } else {
            TokioAsyncResolver::tokio(Default::default(), Default::default())
        };

        Ok(Self {
            inner,
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    async fn bounded<T>(
        &self,
        query: impl Future<Output = Result<T, ResolveError>>,
    ) -> Result<T, DnsError> {
        match tokio::time::timeout(self.timeout, query).await {
            Ok(r) => r.map_err(to_dns_error),
            Err(_) => Err(DnsError::Failed("query timed out".to_owned())),
        }
    }
}

impl Resolver for HickoryResolver {
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        let name = fqdn(name);
        let lookup = self.bounded(self.inner.txt_lookup(&*name)).await?;
        Ok(lookup
            .iter()
            .map(|parts| {
                let len = parts.iter().map(|p| p.len()).sum();
                let mut combined = Vec::with_capacity(len);
                for part in parts.iter() {
                    combined.extend_from_slice(part);
                }

                String::from_utf8(combined).unwrap_or_else(|e| {
                    String::from_utf8_lossy(e.as_bytes()).into_owned()
                })
            })
            .collect())
    }

    async fn lookup_addresses(
        &self,
        name: &str,
    ) -> Result<Vec<IpAddr>, DnsError> {
        let name = fqdn(name);
        let (v4, v6) = tokio::join!(
            self.bounded(self.inner.ipv4_lookup(&*name)),
            self.bounded(self.inner.ipv6_lookup(&*name)),
        );

        let v4 = v4.map(|r| r.iter().map(|a| IpAddr::V4(a.0)).collect());
        let v6 = v6.map(|r| r.iter().map(|a| IpAddr::V6(a.0)).collect());
        merge_address_answers(v4, v6)
    }

    async fn lookup_mx(
        &self,
        name: &str,
    ) -> Result<Vec<(u16, String)>, DnsError> {
        let name = fqdn(name);
        let lookup = self.bounded(self.inner.mx_lookup(&*name)).await?;
        Ok(lookup
            .iter()
            .map(|mx| (mx.preference(), mx.exchange().to_ascii()))
            .collect())
    }
}

fn fqdn(name: &str) -> String {
    format!("{}.", name.trim_end_matches('.'))
}

/// Combines the separate A and AAAA answers for one name.
///
/// Any addresses found win over an error on the other family, since the
/// evaluator only cares whether the client's address is among them.
fn merge_address_answers(
    v4: Result<Vec<IpAddr>, DnsError>,
    v6: Result<Vec<IpAddr>, DnsError>,
) -> Result<Vec<IpAddr>, DnsError> {
    match (v4, v6) {
        (Ok(mut v4), Ok(v6)) => {
            v4.extend(v6);
            Ok(v4)
        },
        (Ok(found), Err(DnsError::NotFound))
        | (Err(DnsError::NotFound), Ok(found)) => Ok(found),
        (Ok(found), Err(e)) | (Err(e), Ok(found)) => {
            if found.is_empty() {
                Err(e)
            } else {
                Ok(found)
            }
        },
        (Err(DnsError::NotFound), Err(DnsError::NotFound)) => {
            Err(DnsError::NotFound)
        },
        (Err(e @ DnsError::Failed(..)), Err(_))
        | (Err(DnsError::NotFound), Err(e)) => Err(e),
    }
}

fn to_dns_error(e: ResolveError) -> DnsError {
    match *e.kind() {
        ResolveErrorKind::NoRecordsFound { .. } => DnsError::NotFound,
        _ => DnsError::Failed(e.to_string()),
    }
}
