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

//! Sender Policy Framework (RFC 7208) evaluation.
//!
//! `syntax` parses records, `macros` expands directive values, `matcher`
//! compares addresses, and `eval` drives the whole thing against a
//! `Resolver`. `driver` adds a wall-clock deadline on top.

#[cfg(test)]
#[macro_use]
mod fake_dns;

pub mod driver;
pub mod eval;
pub mod macros;
pub mod matcher;
pub mod syntax;

pub use eval::{
    check, evaluate, Context, Limits, MatchedDirective, Outcome,
    PermErrorCause, Verdict,
};
