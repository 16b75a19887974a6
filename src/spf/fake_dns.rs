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

//! An in-memory `Resolver` for tests.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use crate::support::dns::{DnsError, Resolver};

/// Answers queries from fixed tables. Names missing from a table are
/// `NotFound`.
#[derive(Default)]
pub struct FakeResolver {
    pub txt: HashMap<String, Result<Vec<String>, DnsError>>,
    pub addr: HashMap<String, Result<Vec<IpAddr>, DnsError>>,
    pub mx: HashMap<String, Result<Vec<(u16, String)>, DnsError>>,
    /// If set, every query sleeps this long before answering.
    pub delay: Option<Duration>,
    /// Every query made, as `type:name`, in the order made.
    pub queries: RefCell<Vec<String>>,
}

impl FakeResolver {
    pub fn servfail() -> DnsError {
        DnsError::Failed("SERVFAIL".to_owned())
    }

    pub fn query_count(&self) -> usize {
        self.queries.borrow().len()
    }

    async fn answer<T: Clone>(
        &self,
        kind: &str,
        table: &HashMap<String, Result<T, DnsError>>,
        name: &str,
    ) -> Result<T, DnsError> {
        self.queries.borrow_mut().push(format!("{kind}:{name}"));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        table.get(name).cloned().unwrap_or(Err(DnsError::NotFound))
    }
}

impl Resolver for FakeResolver {
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        self.answer("txt", &self.txt, name).await
    }

    async fn lookup_addresses(
        &self,
        name: &str,
    ) -> Result<Vec<IpAddr>, DnsError> {
        self.answer("addr", &self.addr, name).await
    }

    async fn lookup_mx(
        &self,
        name: &str,
    ) -> Result<Vec<(u16, String)>, DnsError> {
        self.answer("mx", &self.mx, name).await
    }
}

/// Builds a `FakeResolver`.
///
/// ```ignore
/// dns_zone! {
///     "example.com" => {
///         txt: ["v=spf1 a -all"],
///         addr: ["192.0.2.1"],
///         mx: [(10, "mx.example.com")],
///     },
///     "broken.example.com" => { txt: Error, },
/// }
/// ```
///
/// Each table also accepts `NotFound` and `Error` in place of a list.
macro_rules! dns_zone {
    (@$table:ident $zone:ident, $domain:expr, NotFound) => {
        $zone.$table.insert(
            $domain.to_owned(),
            Err($crate::support::dns::DnsError::NotFound),
        );
    };
    (@$table:ident $zone:ident, $domain:expr, Error) => {
        $zone.$table.insert(
            $domain.to_owned(),
            Err($crate::spf::fake_dns::FakeResolver::servfail()),
        );
    };
    (@txt $zone:ident, $domain:expr, $value:expr) => {
        $zone.txt.insert(
            $domain.to_owned(),
            Ok($value.iter().map(|s: &&str| (*s).to_owned()).collect()),
        );
    };
    (@addr $zone:ident, $domain:expr, $value:expr) => {
        $zone.addr.insert(
            $domain.to_owned(),
            Ok($value
                .iter()
                .map(|s: &&str| s.parse::<std::net::IpAddr>().unwrap())
                .collect()),
        );
    };
    (@mx $zone:ident, $domain:expr, $value:expr) => {
        $zone.mx.insert(
            $domain.to_owned(),
            Ok($value
                .iter()
                .map(|&(pref, host): &(u16, &str)| (pref, host.to_owned()))
                .collect()),
        );
    };

    ($($domain:expr => { $($table:ident : $value:tt,)* },)*) => {{
        #[allow(unused_mut)]
        let mut zone = $crate::spf::fake_dns::FakeResolver::default();
        $($(dns_zone!(@$table zone, $domain, $value);)*)*
        zone
    }};
}
