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

//! Macro expansion of directive values (RFC 7208 § 7).

use std::borrow::Cow;
use std::net::IpAddr;

use itertools::Itertools;

use super::eval::Context;
use super::syntax::{Macro, MacroElement, MacroString};

/// Expands every macro in `value` against `ctx`.
///
/// This is total: malformed macros are copied through unchanged, and a value
/// with no macros is returned as-is without allocating.
pub fn expand<'s>(value: &'s str, ctx: &'s Context<'_>) -> Cow<'s, str> {
    let mut ret = Cow::Borrowed("");
    for element in MacroString::new(value) {
        let expansion = match element {
            MacroElement::Literal(s) => Cow::Borrowed(s),
            MacroElement::Expand(me) => {
                let expansion = basic_expansion(ctx, me.kind);
                let effective_delimiters = if me.delimiters.is_empty() {
                    "."
                } else {
                    me.delimiters
                };
                let is_delimiter =
                    |c: char| effective_delimiters.chars().any(|d| d == c);
                let keep_parts = me.keep_parts.unwrap_or(usize::MAX);

                // Splitting is naïve: adjacent delimiters and delimiters at
                // either end produce empty parts.
                if me.reverse {
                    let it = expansion.rsplit(is_delimiter);
                    let parts = it.clone().count();
                    Cow::Owned(
                        it.skip(parts.saturating_sub(keep_parts)).join("."),
                    )
                } else if me.keep_parts.is_some() || !me.delimiters.is_empty()
                {
                    let it = expansion.split(is_delimiter);
                    let parts = it.clone().count();
                    Cow::Owned(
                        it.skip(parts.saturating_sub(keep_parts)).join("."),
                    )
                } else {
                    expansion
                }
            },
        };

        if ret.is_empty() {
            ret = expansion;
        } else {
            ret.to_mut().push_str(&expansion);
        }
    }

    ret
}

fn basic_expansion<'s>(ctx: &'s Context<'_>, kind: Macro) -> Cow<'s, str> {
    match kind {
        Macro::Sender => Cow::Borrowed(&*ctx.sender),
        Macro::SenderLocalPart => Cow::Borrowed(&*ctx.sender_local),
        Macro::SenderDomain => Cow::Borrowed(&*ctx.sender_domain),
        Macro::Domain => Cow::Borrowed(&*ctx.domain),
        Macro::HeloDomain => Cow::Borrowed(&*ctx.helo_domain),
        Macro::Ip => Cow::Owned(dotted_ip(ctx.ip)),
        // Reverse DNS validation is never performed, so the validated name is
        // always unknown.
        Macro::Ptr => Cow::Borrowed("unknown"),
        Macro::IpVersion => match ctx.ip {
            IpAddr::V4(_) => Cow::Borrowed("in-addr"),
            IpAddr::V6(_) => Cow::Borrowed("ip6"),
        },
    }
}

/// Formats `ip` the way `%{i}` requires: dotted-quad for IPv4 and dotted
/// nibbles for IPv6.
fn dotted_ip(ip: IpAddr) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";

    match ip {
        IpAddr::V4(ip) => ip.to_string(),
        IpAddr::V6(ip) => {
            let mut s = String::with_capacity(63);
            for (i, octet) in ip.octets().into_iter().enumerate() {
                if 0 != i {
                    s.push('.');
                }
                s.push(char::from(HEX[usize::from(octet >> 4)]));
                s.push('.');
                s.push(char::from(HEX[usize::from(octet & 0xF)]));
            }
            s
        },
    }
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;

    use super::*;

    fn example_context() -> Context<'static> {
        Context::new(
            Ipv4Addr::new(192, 0, 2, 3).into(),
            "email.example.com",
            "strong-bad@email.example.com",
        )
    }

    #[test]
    fn rfc7208_74_examples() {
        let mut ctx = example_context();
        let expand = |ctx: &Context<'_>, ms: &str| expand(ms, ctx).into_owned();

        assert_eq!("strong-bad@email.example.com", expand(&ctx, "%{s}"));
        assert_eq!("email.example.com", expand(&ctx, "%{o}"));
        assert_eq!("email.example.com", expand(&ctx, "%{d}"));
        assert_eq!("email.example.com", expand(&ctx, "%{d4}"));
        assert_eq!("email.example.com", expand(&ctx, "%{d3}"));
        assert_eq!("example.com", expand(&ctx, "%{d2}"));
        assert_eq!("com", expand(&ctx, "%{d1}"));
        assert_eq!("com.example.email", expand(&ctx, "%{dr}"));
        assert_eq!("example.email", expand(&ctx, "%{d2r}"));
        assert_eq!("strong-bad", expand(&ctx, "%{l}"));
        assert_eq!("strong.bad", expand(&ctx, "%{l-}"));
        assert_eq!("strong-bad", expand(&ctx, "%{lr}"));
        assert_eq!("bad.strong", expand(&ctx, "%{lr-}"));
        assert_eq!("strong", expand(&ctx, "%{l1r-}"));

        assert_eq!(
            "3.2.0.192.in-addr._spf.example.com",
            expand(&ctx, "%{ir}.%{v}._spf.%{d2}"),
        );
        assert_eq!(
            "bad.strong.lp._spf.example.com",
            expand(&ctx, "%{lr-}.lp._spf.%{d2}"),
        );
        assert_eq!(
            "bad.strong.lp.3.2.0.192.in-addr._spf.example.com",
            expand(&ctx, "%{lr-}.lp.%{ir}.%{v}._spf.%{d2}"),
        );
        assert_eq!(
            "3.2.0.192.in-addr.strong.lp._spf.example.com",
            expand(&ctx, "%{ir}.%{v}.%{l1r-}.lp._spf.%{d2}"),
        );
        assert_eq!(
            "example.com.trusted-domains.example.net",
            expand(&ctx, "%{d2}.trusted-domains.example.net"),
        );

        ctx.ip = "2001:db8::cb01".parse().unwrap();
        assert_eq!(
            "1.0.b.c.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.8.b.d.0.1.0.0.2.ip6._spf.example.com",
            expand(&ctx, "%{ir}.%{v}._spf.%{d2}"),
        );
    }

    #[test]
    fn all_macro_letters() {
        let ctx = Context::new(
            "dead::beef".parse().unwrap(),
            "domain.example.org",
            "john@example.com",
        )
        .with_helo("helo.example.com");

        assert_eq!("john@example.com", expand("%{s}", &ctx));
        assert_eq!("john", expand("%{l}", &ctx));
        assert_eq!("example.com", expand("%{o}", &ctx));
        assert_eq!("domain.example.org", expand("%{d}", &ctx));
        assert_eq!(
            "d.e.a.d.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.b.e.e.f",
            expand("%{i}", &ctx),
        );
        assert_eq!("ip6", expand("%{v}", &ctx));
        assert_eq!("helo.example.com", expand("%{h}", &ctx));
        assert_eq!("unknown", expand("%{p}", &ctx));
        assert_eq!("domain.example.org", expand("%{D}", &ctx));
    }

    #[test]
    fn null_sender_becomes_postmaster() {
        let ctx =
            Context::new(Ipv4Addr::LOCALHOST.into(), "example.com", "");
        assert_eq!("postmaster@example.com", expand("%{s}", &ctx));
        assert_eq!("postmaster", expand("%{l}", &ctx));
        assert_eq!("example.com", expand("%{o}", &ctx));
    }

    #[test]
    fn authoritative_domain_tracks_descent() {
        let ctx = Context::new(
            Ipv4Addr::LOCALHOST.into(),
            "example.com",
            "test@example.com",
        );
        assert_eq!(
            "127.0.0.1._spf.example.com",
            expand("%{i}._spf.%{d}", &ctx),
        );

        let child = ctx.descend("other.example.net");
        assert_eq!(
            "127.0.0.1._spf.other.example.net",
            expand("%{i}._spf.%{d}", &child),
        );
        assert_eq!("example.com", expand("%{o}", &child));
    }

    #[test]
    fn escapes_and_malformed_macros() {
        let ctx = example_context();
        assert_eq!("100%", expand("100%%", &ctx));
        assert_eq!("a b%20c", expand("a%_b%-c", &ctx));
        assert_eq!("%{x}.example.com", expand("%{x}.example.com", &ctx));
        assert_eq!("%{d", expand("%{d", &ctx));
        assert_eq!("plain.example.com", expand("plain.example.com", &ctx));
        assert!(matches!(
            expand("plain.example.com", &ctx),
            Cow::Borrowed(..),
        ));
    }
}
