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

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::error::Error;
use crate::spf::Limits;

/// The configuration for `spfeval`.
///
/// This is stored in a TOML file given by `--config`. Every section and key
/// is optional; missing ones take the defaults below.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct SystemConfig {
    /// Limits on how much work one check may do.
    #[serde(default)]
    pub spf: SpfConfig,

    /// How DNS queries are made.
    #[serde(default)]
    pub dns: DnsConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SpfConfig {
    /// The maximum number of DNS-querying terms (`include`, `redirect`, `a`,
    /// `mx` and each of its hosts, `exists`) one check may evaluate.
    ///
    /// RFC 7208 sets this at 10. Raising it makes checks more lenient towards
    /// badly-written policies at the cost of more DNS traffic.
    pub lookup_limit: u32,

    /// The maximum number of MX records an `mx` mechanism may return.
    pub mx_limit: usize,

    /// The wall-clock time, in seconds, after which a check gives up and
    /// reports `temperror`.
    pub deadline_secs: u64,
}

impl Default for SpfConfig {
    fn default() -> Self {
        Self {
            lookup_limit: 10,
            mx_limit: 10,
            deadline_secs: 20,
        }
    }
}

impl SpfConfig {
    pub fn limits(&self) -> Limits {
        Limits {
            lookups: self.lookup_limit,
            mx_records: self.mx_limit,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct DnsConfig {
    /// If true, use the nameservers from `/etc/resolv.conf`. Otherwise, use
    /// the resolver library's built-in public nameservers.
    pub use_system_config: bool,

    /// The timeout, in seconds, of each individual DNS query.
    pub timeout_secs: u64,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            use_system_config: true,
            timeout_secs: 5,
        }
    }
}

impl SystemConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}
