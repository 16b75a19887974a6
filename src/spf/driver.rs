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

use log::warn;

use super::eval::{evaluate, Context, Limits, Outcome, Verdict};
use crate::support::dns::Resolver;
use crate::support::log_prefix::LogPrefix;

/// Runs a complete SPF check of `ctx`, giving up at `deadline`.
///
/// A check still running at the deadline is abandoned, along with any DNS
/// queries it has in flight, and reported as `temperror`.
pub async fn run<R: Resolver>(
    resolver: &R,
    ctx: &Context<'_>,
    limits: Limits,
    deadline: tokio::time::Instant,
) -> Outcome {
    match tokio::time::timeout_at(deadline, evaluate(resolver, ctx, limits))
        .await
    {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!(
                "{} check timed out",
                LogPrefix::new(ctx.ip, &ctx.domain).with_sender(&ctx.sender),
            );
            Outcome::bare(Verdict::TempError)
        },
    }
}
