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

//! The SPF evaluation engine.
//!
//! Evaluation walks the directives of one domain's record in source order,
//! descending into `include` and `redirect` targets as it goes. All DNS
//! queries go through a `Resolver`, and every query beyond the first policy
//! fetch is charged against a fixed budget shared by the whole tree.

use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;

use futures::future::join_all;
use log::{debug, info, warn};
use thiserror::Error;

use super::macros;
use super::matcher;
use super::syntax::{self as s, Kind, Qualifier};
use crate::support::dns::{DnsError, Resolver};
use crate::support::log_prefix::LogPrefix;

// RFC 7208 § 4.6.4
/// The default maximum number of DNS-querying terms one check may evaluate.
pub const DEFAULT_LOOKUP_LIMIT: u32 = 10;
/// The default maximum number of records an MX query may return.
pub const DEFAULT_MX_LIMIT: usize = 10;

const MAX_DOMAIN_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// The fundamental SPF result types.
///
/// RFC 7208 § 2.6
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Verdict {
    None,
    Neutral,
    Pass,
    Fail,
    SoftFail,
    TempError,
    PermError,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match *self {
            Self::None => "none",
            Self::Neutral => "neutral",
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::SoftFail => "softfail",
            Self::TempError => "temperror",
            Self::PermError => "permerror",
        };
        f.write_str(s)
    }
}

impl From<Qualifier> for Verdict {
    fn from(q: Qualifier) -> Self {
        match q {
            Qualifier::Pass => Self::Pass,
            Qualifier::Fail => Self::Fail,
            Qualifier::SoftFail => Self::SoftFail,
            Qualifier::Neutral => Self::Neutral,
        }
    }
}

/// Why an evaluation ended in `permerror`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum PermErrorCause {
    #[error("DNS lookup limit exceeded")]
    LookupLimit,
    #[error("policy refers back to a domain already evaluated")]
    Loop,
    #[error("malformed policy: {0}")]
    Syntax(s::Error),
    #[error("invalid target domain")]
    InvalidDomain,
    #[error("too many MX records")]
    TooManyMx,
    #[error("redirect target has no policy")]
    RedirectWithoutPolicy,
}

/// Resource limits for one check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limits {
    /// The lookup budget shared by the whole evaluation tree.
    pub lookups: u32,
    /// The most MX records one `mx` mechanism tolerates.
    pub mx_records: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            lookups: DEFAULT_LOOKUP_LIMIT,
            mx_records: DEFAULT_MX_LIMIT,
        }
    }
}

/// Immutable facts about the message being checked.
///
/// The only field that changes during evaluation is `domain`, which is
/// replaced in a derived context when descending into `include` or
/// `redirect`.
#[derive(Clone, Debug)]
pub struct Context<'a> {
    /// The full `MAIL FROM` address, with the implicit `postmaster` local
    /// part filled in if absent.
    pub sender: Cow<'a, str>,
    /// The local part of `sender`.
    pub sender_local: Cow<'a, str>,
    /// The domain part of `sender`.
    pub sender_domain: Cow<'a, str>,
    /// The `HELO` domain.
    pub helo_domain: Cow<'a, str>,
    /// The client IP address. IPv4-mapped IPv6 addresses are stored as IPv4.
    pub ip: IpAddr,
    /// The domain whose policy is currently being evaluated.
    pub domain: Cow<'a, str>,
}

impl<'a> Context<'a> {
    /// Sets up the context for checking mail from `sender`, sent from `ip`,
    /// against the policy of `domain`.
    ///
    /// An empty `sender`, or one without a local part, is treated as
    /// `postmaster` at the sender's domain. The `HELO` domain defaults to
    /// `domain`.
    pub fn new(ip: IpAddr, domain: &'a str, sender: &'a str) -> Self {
        let (local, sender_domain) = match sender.rsplit_once('@') {
            Some((local, dom)) if !dom.is_empty() => (local, dom),
            Some((local, _)) => (local, domain),
            None if sender.is_empty() => ("", domain),
            None => ("", sender),
        };
        let sender_local = if local.is_empty() { "postmaster" } else { local };
        let full_sender = match sender.rsplit_once('@') {
            Some((l, d)) if !l.is_empty() && !d.is_empty() => {
                Cow::Borrowed(sender)
            },
            _ => Cow::Owned(format!("{sender_local}@{sender_domain}")),
        };

        Self {
            sender: full_sender,
            sender_local: Cow::Borrowed(sender_local),
            sender_domain: Cow::Borrowed(sender_domain),
            helo_domain: Cow::Borrowed(domain),
            ip: ip.to_canonical(),
            domain: Cow::Borrowed(domain),
        }
    }

    pub fn with_helo(mut self, helo_domain: &'a str) -> Self {
        self.helo_domain = Cow::Borrowed(helo_domain);
        self
    }

    /// Derives the context for evaluating the policy of `domain` on behalf of
    /// this one.
    pub fn descend<'s>(&'s self, domain: &'s str) -> Context<'s> {
        Context {
            sender: Cow::Borrowed(&self.sender),
            sender_local: Cow::Borrowed(&self.sender_local),
            sender_domain: Cow::Borrowed(&self.sender_domain),
            helo_domain: Cow::Borrowed(&self.helo_domain),
            ip: self.ip,
            domain: Cow::Borrowed(domain),
        }
    }
}

/// The directive that produced a definitive match.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchedDirective {
    /// The domain whose record contains the directive.
    pub domain: String,
    pub kind: Kind,
    pub qualifier: Qualifier,
    /// The directive as written in the record.
    pub text: String,
}

/// The result of one top-level check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outcome {
    pub verdict: Verdict,
    /// Set if and only if `verdict` is `PermError`.
    pub cause: Option<PermErrorCause>,
    /// The number of budgeted lookups consumed.
    pub lookups: u32,
    /// The directive responsible for the verdict, if a directive matched.
    pub matched: Option<MatchedDirective>,
    /// The top-level policy text, if one was found.
    pub record: Option<String>,
}

impl Outcome {
    /// An outcome reached without (or without finishing) evaluation.
    pub fn bare(verdict: Verdict) -> Self {
        Self {
            verdict,
            cause: None,
            lookups: 0,
            matched: None,
            record: None,
        }
    }
}

/// Evaluates the policy of `ctx.domain` for the client `ctx.ip`.
///
/// This never fails: DNS problems, malformed policies and budget exhaustion
/// are all reflected in the returned verdict.
pub async fn evaluate<R: Resolver>(
    resolver: &R,
    ctx: &Context<'_>,
    limits: Limits,
) -> Outcome {
    let log_prefix = LogPrefix::new(ctx.ip, &ctx.domain)
        .with_sender(&ctx.sender)
        .with_helo(&ctx.helo_domain);
    let mut evaluator = Evaluator {
        resolver,
        state: EvaluationState::new(limits),
        log_prefix,
    };

    let result = evaluator.eval_domain(ctx, &ctx.domain, Origin::Top).await;
    evaluator.finish(result)
}

/// Checks whether `ip` may send mail as `sender` on behalf of `domain`, with
/// the default limits.
pub async fn check<R: Resolver>(
    resolver: &R,
    ip: IpAddr,
    domain: &str,
    sender: &str,
) -> Outcome {
    evaluate(resolver, &Context::new(ip, domain, sender), Limits::default())
        .await
}

/// Mutable state shared by the whole evaluation tree of one check.
struct EvaluationState {
    lookups: u32,
    limits: Limits,
    /// Normalised names of every domain whose policy has been fetched.
    visited: HashSet<String>,
    matched: Option<MatchedDirective>,
    record: Option<String>,
}

impl EvaluationState {
    fn new(limits: Limits) -> Self {
        Self {
            lookups: 0,
            limits,
            visited: HashSet::new(),
            matched: None,
            record: None,
        }
    }

    /// Charges one lookup against the budget, failing without charging if
    /// the budget is already spent.
    fn consume_lookup(&mut self) -> Result<(), PermErrorCause> {
        if self.lookups >= self.limits.lookups {
            return Err(PermErrorCause::LookupLimit);
        }

        self.lookups += 1;
        Ok(())
    }

    /// Charges up to `n` lookups, returning how many the budget allowed.
    fn reserve_lookups(&mut self, n: usize) -> usize {
        let available =
            usize::try_from(self.limits.lookups.saturating_sub(self.lookups))
                .unwrap_or(usize::MAX);
        let n = n.min(available);
        // n <= available, which came from a u32
        self.lookups += n as u32;
        n
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DirectiveError {
    /// The directive could not be evaluated conclusively. Scanning continues.
    TempFail,
    /// The directive did not match, but a nested check ended in the given
    /// verdict, which becomes the running verdict of the record.
    Unmatched(Verdict),
    /// The whole evaluation tree fails.
    PermFail(PermErrorCause),
}

impl From<PermErrorCause> for DirectiveError {
    fn from(cause: PermErrorCause) -> Self {
        Self::PermFail(cause)
    }
}

/// How a domain's policy came to be evaluated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Origin {
    Top,
    Include,
    Redirect,
}

struct Evaluator<'r, R> {
    resolver: &'r R,
    state: EvaluationState,
    log_prefix: LogPrefix,
}

impl<'r, R: Resolver> Evaluator<'r, R> {
    /// Fetches and evaluates the policy of `domain`.
    ///
    /// `Ok(Verdict::None)` means the domain has no policy. A redirect target
    /// without a policy is a permerror instead.
    async fn eval_domain(
        &mut self,
        ctx: &Context<'_>,
        domain: &str,
        origin: Origin,
    ) -> Result<Verdict, PermErrorCause> {
        let Some(domain) = normalise_domain(domain) else {
            return if Origin::Top == origin {
                info!("{} invalid domain {domain:?}", self.log_prefix);
                Ok(Verdict::None)
            } else {
                Err(PermErrorCause::InvalidDomain)
            };
        };

        if !self.state.visited.insert(domain.clone()) {
            debug!("{} {domain} was already evaluated", self.log_prefix);
            return Err(PermErrorCause::Loop);
        }

        if Origin::Top != origin {
            self.state.consume_lookup()?;
        }

        let txt_records = match self.resolver.lookup_txt(&domain).await {
            Ok(records) => records,
            Err(DnsError::NotFound) => return no_policy(origin),
            Err(DnsError::Failed(e)) => {
                warn!(
                    "{} TXT lookup for {domain} failed: {e}",
                    self.log_prefix,
                );
                return Ok(Verdict::TempError);
            },
        };

        let Some(txt) = s::select_record(&txt_records) else {
            debug!("{} {domain} has no SPF record", self.log_prefix);
            return no_policy(origin);
        };

        if Origin::Top == origin {
            self.state.record = Some(txt.to_owned());
        }

        let record = match s::Record::parse(txt) {
            Ok(record) => record,
            Err(e) if Verdict::None == e.verdict() => {
                return no_policy(origin)
            },
            Err(e) => {
                info!("{} bad SPF record at {domain}: {e}", self.log_prefix);
                return Err(PermErrorCause::Syntax(e));
            },
        };

        let ctx = ctx.descend(&domain);
        let mut provisional = Verdict::Neutral;
        for directive in record.mechanisms() {
            match self.eval_directive(&ctx, directive).await {
                Ok(false) => {},
                Ok(true) => {
                    let qualifier =
                        directive.qualifier.unwrap_or(Qualifier::Pass);
                    let verdict = Verdict::from(qualifier);
                    debug!(
                        "{} {domain}: {} matched, {verdict}",
                        self.log_prefix, directive.text,
                    );
                    self.state.matched = Some(MatchedDirective {
                        domain: domain.clone(),
                        kind: directive.kind,
                        qualifier,
                        text: directive.text.to_owned(),
                    });
                    return Ok(verdict);
                },
                Err(DirectiveError::TempFail) => {
                    debug!(
                        "{} {domain}: {} inconclusive",
                        self.log_prefix, directive.text,
                    );
                    provisional = Verdict::TempError;
                },
                Err(DirectiveError::Unmatched(verdict)) => {
                    provisional = verdict;
                },
                Err(DirectiveError::PermFail(cause)) => {
                    debug!(
                        "{} {domain}: {} failed: {cause}",
                        self.log_prefix, directive.text,
                    );
                    return Err(cause);
                },
            }
        }

        // `all` would have matched above, but only its absence lets
        // `redirect` apply.
        if let Some(redirect) = record.redirect().filter(|_| !record.has_all())
        {
            let target =
                target_domain(&ctx, &macros::expand(redirect.value, &ctx))?;
            debug!("{} {domain}: redirect to {target}", self.log_prefix);
            return Box::pin(self.eval_domain(&ctx, &target, Origin::Redirect))
                .await;
        }

        Ok(provisional)
    }

    /// Evaluates one mechanism, returning whether it matched.
    async fn eval_directive(
        &mut self,
        ctx: &Context<'_>,
        directive: &s::Directive<'_>,
    ) -> Result<bool, DirectiveError> {
        let value = macros::expand(directive.value, ctx);

        match directive.kind {
            Kind::All => Ok(true),
            Kind::Ip4 => matcher::matches_ip4(ctx.ip, &value)
                .map_err(|e| self.malformed(directive, e)),
            Kind::Ip6 => matcher::matches_ip6(ctx.ip, &value)
                .map_err(|e| self.malformed(directive, e)),
            Kind::A => self.eval_a(ctx, directive, &value).await,
            Kind::Mx => self.eval_mx(ctx, directive, &value).await,
            // Reverse DNS is never consulted.
            Kind::Ptr => Ok(false),
            Kind::Include => self.eval_include(ctx, &value).await,
            Kind::Exists => self.eval_exists(ctx, &value).await,
            Kind::Redirect | Kind::Explanation | Kind::UnknownModifier => {
                Ok(false)
            },
        }
    }

    fn malformed(
        &self,
        directive: &s::Directive<'_>,
        e: matcher::Error,
    ) -> DirectiveError {
        info!("{} {}: {e}", self.log_prefix, directive.text);
        DirectiveError::TempFail
    }

    async fn eval_a(
        &mut self,
        ctx: &Context<'_>,
        directive: &s::Directive<'_>,
        value: &str,
    ) -> Result<bool, DirectiveError> {
        let (domain, cidr) = matcher::split_dual_cidr(value)
            .map_err(|e| self.malformed(directive, e))?;
        let domain = target_domain(ctx, domain)?;
        self.state.consume_lookup()?;

        match self.resolver.lookup_addresses(&domain).await {
            Ok(addrs) => Ok(addrs
                .iter()
                .any(|&a| matcher::matches_address(ctx.ip, a, cidr))),
            Err(DnsError::NotFound) => Ok(false),
            Err(DnsError::Failed(e)) => {
                info!("{} address lookup for {domain}: {e}", self.log_prefix);
                Err(DirectiveError::TempFail)
            },
        }
    }

    async fn eval_mx(
        &mut self,
        ctx: &Context<'_>,
        directive: &s::Directive<'_>,
        value: &str,
    ) -> Result<bool, DirectiveError> {
        let (domain, cidr) = matcher::split_dual_cidr(value)
            .map_err(|e| self.malformed(directive, e))?;
        let domain = target_domain(ctx, domain)?;
        self.state.consume_lookup()?;

        let mut exchanges = match self.resolver.lookup_mx(&domain).await {
            Ok(exchanges) => exchanges,
            Err(DnsError::NotFound) => return Ok(false),
            Err(DnsError::Failed(e)) => {
                info!("{} MX lookup for {domain}: {e}", self.log_prefix);
                return Err(DirectiveError::TempFail);
            },
        };

        if exchanges.len() > self.state.limits.mx_records {
            return Err(PermErrorCause::TooManyMx.into());
        }

        exchanges.sort_by_key(|&(preference, _)| preference);
        // The null MX (a bare ".") and garbage names have no addresses.
        let hosts = exchanges
            .iter()
            .filter_map(|(_, host)| normalise_domain(host))
            .collect::<Vec<_>>();

        // Each host costs its own lookup. Hosts past the end of the budget
        // are never queried, and only matter if no earlier host matches.
        let affordable = self.state.reserve_lookups(hosts.len());
        let resolver = self.resolver;
        let answers = join_all(
            hosts[..affordable]
                .iter()
                .map(|host| resolver.lookup_addresses(host)),
        )
        .await;

        let mut inconclusive = false;
        for (host, answer) in hosts.iter().zip(answers) {
            match answer {
                Ok(addrs) => {
                    if addrs
                        .iter()
                        .any(|&a| matcher::matches_address(ctx.ip, a, cidr))
                    {
                        return Ok(true);
                    }
                },
                Err(DnsError::NotFound) => {},
                Err(DnsError::Failed(e)) => {
                    info!(
                        "{} address lookup for MX {host}: {e}",
                        self.log_prefix,
                    );
                    inconclusive = true;
                },
            }
        }

        if affordable < hosts.len() {
            Err(PermErrorCause::LookupLimit.into())
        } else if inconclusive {
            Err(DirectiveError::TempFail)
        } else {
            Ok(false)
        }
    }

    async fn eval_include(
        &mut self,
        ctx: &Context<'_>,
        value: &str,
    ) -> Result<bool, DirectiveError> {
        let target = target_domain(ctx, value)?;
        let verdict =
            Box::pin(self.eval_domain(ctx, &target, Origin::Include)).await?;

        match verdict {
            Verdict::Pass => Ok(true),
            Verdict::TempError => {
                self.state.matched = None;
                Err(DirectiveError::TempFail)
            },
            _ => {
                debug!(
                    "{} include:{target} gave {verdict}, continuing",
                    self.log_prefix,
                );
                self.state.matched = None;
                Err(DirectiveError::Unmatched(verdict))
            },
        }
    }

    async fn eval_exists(
        &mut self,
        ctx: &Context<'_>,
        value: &str,
    ) -> Result<bool, DirectiveError> {
        let domain = target_domain(ctx, value)?;
        self.state.consume_lookup()?;

        match self.resolver.lookup_addresses(&domain).await {
            Ok(addrs) => Ok(!addrs.is_empty()),
            Err(e) => {
                debug!("{} exists:{domain}: {e}", self.log_prefix);
                Ok(false)
            },
        }
    }

    fn finish(self, result: Result<Verdict, PermErrorCause>) -> Outcome {
        let Self {
            state, log_prefix, ..
        } = self;

        let (verdict, cause, matched) = match result {
            Ok(verdict) => (verdict, None, state.matched),
            Err(cause) => {
                warn!("{} permerror: {cause}", log_prefix);
                (Verdict::PermError, Some(cause), None)
            },
        };

        info!(
            "{} spf={verdict} lookups={}/{}",
            log_prefix, state.lookups, state.limits.lookups,
        );

        Outcome {
            verdict,
            cause,
            lookups: state.lookups,
            matched,
            record: state.record,
        }
    }
}

/// Resolves the (already expanded) domain part of a directive to the name to
/// query.
///
/// An empty value means the current domain. Over-long names lose labels from
/// the left until they fit (RFC 7208 § 7.3).
fn target_domain(
    ctx: &Context<'_>,
    expanded: &str,
) -> Result<String, PermErrorCause> {
    let mut name = if expanded.is_empty() {
        &*ctx.domain
    } else {
        expanded.trim_end_matches('.')
    };

    while name.len() > MAX_DOMAIN_LEN {
        match name.split_once('.') {
            Some((_, rest)) => name = rest,
            None => break,
        }
    }

    normalise_domain(name).ok_or(PermErrorCause::InvalidDomain)
}

fn no_policy(origin: Origin) -> Result<Verdict, PermErrorCause> {
    if Origin::Redirect == origin {
        Err(PermErrorCause::RedirectWithoutPolicy)
    } else {
        Ok(Verdict::None)
    }
}

/// Lower-cases `domain` and strips any trailing dot, returning `None` if the
/// result is not a plausible DNS name.
///
/// Labels are restricted to letters, digits, `-`, and `_`.
fn normalise_domain(domain: &str) -> Option<String> {
    let domain = domain.strip_suffix('.').unwrap_or(domain);
    let valid = !domain.is_empty()
        && domain.len() <= MAX_DOMAIN_LEN
        && domain.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= MAX_LABEL_LEN
                && label
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b"-_".contains(&b))
        });

    valid.then(|| domain.to_ascii_lowercase())
}
