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

//! The syntax for SPF TXT records.
//! RFC 7208 § 12
//!
//! Parsing is purely lexical. Mechanism values are kept as raw strings since
//! they may contain macros, which can only be expanded once the evaluator
//! knows which domain it is currently interpreting.

use std::fmt;
use std::mem;

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

use super::eval::Verdict;

/// The token every SPF record must start with.
pub const VERSION: &str = "v=spf1";

/// A parsed SPF record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record<'a> {
    /// Every term after the version token, in source order.
    pub directives: Vec<Directive<'a>>,
}

/// One term of a record: either a mechanism or a modifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Directive<'a> {
    pub kind: Kind,
    /// `None` for modifiers. Mechanisms without an explicit sign get `Pass`.
    pub qualifier: Option<Qualifier>,
    /// The mechanism or modifier name as written in the record.
    pub name: &'a str,
    /// The raw, unexpanded value. Empty if the term has no value.
    pub value: &'a str,
    /// Whether `value` contains at least one macro expansion.
    pub has_macro: bool,
    /// The whole term as written in the record.
    pub text: &'a str,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    All,
    Include,
    A,
    Mx,
    Ptr,
    Ip4,
    Ip6,
    Exists,
    Redirect,
    Explanation,
    UnknownModifier,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Qualifier {
    Pass,
    Fail,
    SoftFail,
    Neutral,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum Error {
    #[error("no SPF version token")]
    NoVersion,
    #[error("SPF record has no terms")]
    NoTerms,
    #[error("unknown character: {0}")]
    UnknownCharacter(char),
    #[error("unknown mechanism")]
    UnknownMechanism,
    #[error("unused argument for {0}")]
    UnusedArgument(&'static str),
    #[error("missing argument for {0}")]
    MissingArgument(&'static str),
    #[error("more than one {0} modifier")]
    DuplicateModifier(&'static str),
}

impl Error {
    /// The verdict a check reports when the policy fails to parse with this
    /// error.
    pub fn verdict(self) -> Verdict {
        match self {
            Self::NoVersion => Verdict::None,
            _ => Verdict::PermError,
        }
    }
}

impl Kind {
    pub fn is_mechanism(self) -> bool {
        !self.is_modifier()
    }

    pub fn is_modifier(self) -> bool {
        matches!(
            self,
            Self::Redirect | Self::Explanation | Self::UnknownModifier,
        )
    }

    /// Whether this mechanism cannot be written without a value.
    pub fn requires_value(self) -> bool {
        matches!(self, Self::Include | Self::Ip4 | Self::Ip6 | Self::Exists)
    }

    fn from_mechanism_name(name: &str) -> Option<Self> {
        const MECHANISMS: &[(&str, Kind)] = &[
            ("all", Kind::All),
            ("include", Kind::Include),
            ("a", Kind::A),
            ("mx", Kind::Mx),
            ("ptr", Kind::Ptr),
            ("ip4", Kind::Ip4),
            ("ip6", Kind::Ip6),
            ("exists", Kind::Exists),
        ];

        MECHANISMS
            .iter()
            .find(|&&(n, _)| n.eq_ignore_ascii_case(name))
            .map(|&(_, kind)| kind)
    }

    fn name(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Include => "include",
            Self::A => "a",
            Self::Mx => "mx",
            Self::Ptr => "ptr",
            Self::Ip4 => "ip4",
            Self::Ip6 => "ip6",
            Self::Exists => "exists",
            Self::Redirect => "redirect",
            Self::Explanation => "exp",
            Self::UnknownModifier => "unknown-modifier",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for Qualifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            Self::Pass => "+",
            Self::Fail => "-",
            Self::SoftFail => "~",
            Self::Neutral => "?",
        })
    }
}

/// Selects the SPF record among the TXT records published for a domain.
///
/// This is the first one that starts with the version token. A record such as
/// `v=spf10` does not count since the token must be followed by a space or
/// the end of the string.
pub fn select_record<S: AsRef<str>>(txt_records: &[S]) -> Option<&str> {
    txt_records
        .iter()
        .map(AsRef::as_ref)
        .find(|r| has_version(r))
}

fn has_version(record: &str) -> bool {
    record
        .get(..VERSION.len())
        .is_some_and(|s| s.eq_ignore_ascii_case(VERSION))
        && record[VERSION.len()..]
            .chars()
            .next()
            .map_or(true, |c| ' ' == c)
}

impl<'a> Record<'a> {
    /// Parses a complete SPF record, including its version token.
    ///
    /// A record consisting of nothing but the version token is rejected,
    /// since it cannot express any policy.
    pub fn parse(txt: &'a str) -> Result<Self, Error> {
        if !has_version(txt) {
            return Err(Error::NoVersion);
        }

        let mut directives = Vec::<Directive<'a>>::new();
        for word in txt[VERSION.len()..].split(' ') {
            if word.is_empty() {
                continue;
            }

            let directive = Directive::parse(word)?;
            if matches!(directive.kind, Kind::Redirect | Kind::Explanation)
                && directives.iter().any(|d| d.kind == directive.kind)
            {
                return Err(Error::DuplicateModifier(directive.kind.name()));
            }

            directives.push(directive);
        }

        if directives.is_empty() {
            return Err(Error::NoTerms);
        }

        Ok(Self { directives })
    }

    /// Iterates over the mechanisms in source order.
    pub fn mechanisms(&self) -> impl Iterator<Item = &Directive<'a>> + '_ {
        self.directives.iter().filter(|d| d.kind.is_mechanism())
    }

    pub fn redirect(&self) -> Option<&Directive<'a>> {
        self.directives.iter().find(|d| Kind::Redirect == d.kind)
    }

    /// Whether the record contains an `all` mechanism, which makes any
    /// `redirect` modifier inert.
    pub fn has_all(&self) -> bool {
        self.directives.iter().any(|d| Kind::All == d.kind)
    }
}

impl<'a> Directive<'a> {
    /// Parses a single term.
    ///
    /// `word` is a non-empty item from the SPF record after splitting on
    /// space.
    pub fn parse(word: &'a str) -> Result<Self, Error> {
        lazy_static! {
            static ref MODIFIER: Regex =
                Regex::new("^([a-zA-Z][a-zA-Z0-9._-]*)=(.*)$").unwrap();
        }

        if let Some(captures) = MODIFIER.captures(word) {
            let name = captures.get(1).map_or("", |m| m.as_str());
            let value = captures.get(2).map_or("", |m| m.as_str());
            Self::parse_modifier(word, name, value)
        } else {
            Self::parse_mechanism(word)
        }
    }

    fn parse_modifier(
        word: &'a str,
        name: &'a str,
        value: &'a str,
    ) -> Result<Self, Error> {
        let kind = if name.eq_ignore_ascii_case("redirect") {
            Kind::Redirect
        } else if name.eq_ignore_ascii_case("exp") {
            Kind::Explanation
        } else {
            Kind::UnknownModifier
        };

        if value.is_empty() && Kind::UnknownModifier != kind {
            return Err(Error::MissingArgument(kind.name()));
        }

        Ok(Self {
            kind,
            qualifier: None,
            name,
            value,
            has_macro: has_macro(value),
            text: word,
        })
    }

    fn parse_mechanism(word: &'a str) -> Result<Self, Error> {
        let mut chars = word.chars();
        let (qualifier, rest) = match chars.next() {
            None => return Err(Error::UnknownMechanism),
            Some('+') => (Qualifier::Pass, chars.as_str()),
            Some('-') => (Qualifier::Fail, chars.as_str()),
            Some('?') => (Qualifier::Neutral, chars.as_str()),
            Some('~') => (Qualifier::SoftFail, chars.as_str()),
            Some(c) if !c.is_ascii_alphabetic() => {
                return Err(Error::UnknownCharacter(c));
            },
            Some(_) => (Qualifier::Pass, word),
        };

        // `a` and `mx` can carry a CIDR length without any domain, as in
        // `a/24`. That suffix stays in the value so that the value is always
        // everything after the name.
        let (name, value, has_colon) =
            if let Some((name, value)) = rest.split_once(':') {
                (name, value, true)
            } else if let Some(slash) = rest.find('/') {
                (&rest[..slash], &rest[slash..], false)
            } else {
                (rest, "", false)
            };

        let kind =
            Kind::from_mechanism_name(name).ok_or(Error::UnknownMechanism)?;

        if Kind::All == kind && (has_colon || !value.is_empty()) {
            return Err(Error::UnusedArgument("all"));
        }

        if value.is_empty() && (has_colon || kind.requires_value()) {
            return Err(Error::MissingArgument(kind.name()));
        }

        if !has_colon
            && !value.is_empty()
            && !matches!(kind, Kind::A | Kind::Mx)
        {
            return Err(Error::UnknownMechanism);
        }

        Ok(Self {
            kind,
            qualifier: Some(qualifier),
            name,
            value,
            has_macro: has_macro(value),
            text: word,
        })
    }
}

/// Returns whether `s` contains at least one macro expansion (as opposed to
/// just literals and escapes).
pub fn has_macro(s: &str) -> bool {
    MacroString::new(s)
        .into_iter()
        .any(|e| matches!(e, MacroElement::Expand(..)))
}

/// A string which may contain macros, which can be iterated into its
/// elements.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MacroString<'a>(&'a str);

impl<'a> MacroString<'a> {
    pub fn new(s: &'a str) -> Self {
        Self(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MacroElement<'a> {
    Literal(&'a str),
    Expand(MacroExpand<'a>),
}

/// The actually-a-macro case of `macro-expand`.
///
/// The `%%`, `%_`, and `%-` cases of `macro-expand` are converted into
/// `MacroElement::Literal` with the output text.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MacroExpand<'a> {
    pub kind: Macro,
    pub keep_parts: Option<usize>,
    pub reverse: bool,
    pub delimiters: &'a str,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Macro {
    Sender,
    SenderLocalPart,
    SenderDomain,
    Domain,
    Ip,
    Ptr,
    IpVersion,
    HeloDomain,
}

impl<'a> IntoIterator for MacroString<'a> {
    type Item = MacroElement<'a>;
    type IntoIter = MacroElements<'a>;

    fn into_iter(self) -> MacroElements<'a> {
        MacroElements(self.0)
    }
}

/// Iterator over the elements of a `MacroString`.
///
/// Anything which is not a well-formed macro comes out as a literal with its
/// original text, so this never fails.
#[derive(Clone, Debug)]
pub struct MacroElements<'a>(&'a str);

impl<'a> Iterator for MacroElements<'a> {
    type Item = MacroElement<'a>;

    fn next(&mut self) -> Option<MacroElement<'a>> {
        if self.0.is_empty() {
            return None;
        }

        let elt = match self.0.find('%') {
            None => MacroElement::Literal(mem::take(&mut self.0)),

            Some(0) => {
                let Some(head) = self.0.get(..2) else {
                    return Some(MacroElement::Literal(mem::take(&mut self.0)));
                };

                match head {
                    "%%" => {
                        self.0 = &self.0[2..];
                        MacroElement::Literal("%")
                    },
                    "%_" => {
                        self.0 = &self.0[2..];
                        MacroElement::Literal(" ")
                    },
                    "%-" => {
                        self.0 = &self.0[2..];
                        MacroElement::Literal("%20")
                    },
                    "%{" => {
                        let Some(end) = self.0.find('}') else {
                            return Some(MacroElement::Literal(mem::take(
                                &mut self.0,
                            )));
                        };

                        let (whole, rest) = self.0.split_at(end + 1);
                        self.0 = rest;
                        parse_macro_expand(&whole[2..end])
                            .map_or(MacroElement::Literal(whole), |me| {
                                MacroElement::Expand(me)
                            })
                    },

                    _ => {
                        self.0 = &self.0[1..];
                        MacroElement::Literal("%")
                    },
                }
            },

            Some(n) => {
                let literal = &self.0[..n];
                self.0 = &self.0[n..];
                MacroElement::Literal(literal)
            },
        };

        Some(elt)
    }
}

fn parse_macro_expand(s: &str) -> Option<MacroExpand<'_>> {
    let mut chars = s.chars();
    let kind = match chars.next().map(|c| c.to_ascii_lowercase())? {
        's' => Macro::Sender,
        'l' => Macro::SenderLocalPart,
        'o' => Macro::SenderDomain,
        'd' => Macro::Domain,
        'i' => Macro::Ip,
        'p' => Macro::Ptr,
        'v' => Macro::IpVersion,
        'h' => Macro::HeloDomain,
        _ => return None,
    };

    let mut s = chars.as_str();
    let digits = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let keep_parts = if 0 == digits {
        None
    } else {
        let n = s[..digits].parse::<usize>().ok()?;
        if 0 == n {
            return None;
        }
        Some(n)
    };
    s = &s[digits..];

    let reverse = if s.starts_with('r') || s.starts_with('R') {
        s = &s[1..];
        true
    } else {
        false
    };

    if !s
        .chars()
        .all(|ch| matches!(ch, '.' | '-' | '+' | ',' | '/' | '_' | '='))
    {
        return None;
    }

    Some(MacroExpand {
        kind,
        keep_parts,
        reverse,
        delimiters: s,
    })
}
