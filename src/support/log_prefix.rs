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

use std::fmt;
use std::net::IpAddr;

/// Text included at the start of every log statement about one check.
///
/// Untrusted components are sanitised on the way in, so the prefix can be
/// written to logs verbatim.
#[derive(Clone, Debug)]
pub struct LogPrefix {
    ip: IpAddr,
    domain: String,
    sender: Option<String>,
    helo: Option<String>,
}

impl LogPrefix {
    pub fn new(ip: IpAddr, domain: &str) -> Self {
        Self {
            ip,
            domain: sanitise(domain),
            sender: None,
            helo: None,
        }
    }

    pub fn with_sender(mut self, sender: &str) -> Self {
        self.sender = Some(sanitise(sender)).filter(|s| !s.is_empty());
        self
    }

    pub fn with_helo(mut self, helo: &str) -> Self {
        self.helo = Some(sanitise(helo)).filter(|s| !s.is_empty());
        self
    }
}

impl fmt::Display for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "spf[ip={}", self.ip)?;
        if !self.domain.is_empty() {
            write!(f, " domain={}", self.domain)?;
        }
        if let Some(ref sender) = self.sender {
            write!(f, " sender={sender}")?;
        }
        if let Some(ref helo) = self.helo {
            write!(f, " helo={helo}")?;
        }

        write!(f, "]")
    }
}

fn sanitise(s: &str) -> String {
    let mut s = s.to_owned();
    s.retain(|c| !c.is_control());
    if let Some((truncate_len, _)) = s.char_indices().nth(64) {
        s.truncate(truncate_len);
    }

    s
}
