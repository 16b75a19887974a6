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

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::LevelFilter;
use structopt::StructOpt;

use crate::spf::{driver, Context, Outcome};
use crate::support::dns::HickoryResolver;
use crate::support::error::Error;
use crate::support::sysexits::*;
use crate::support::system_config::SystemConfig;

/// Evaluates the SPF policy of DOMAIN for mail sent from IP.
///
/// The verdict is printed to standard output as `spf=<verdict>`, followed by
/// details of how it was reached. The exit status is zero whatever the
/// verdict.
#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
struct Command {
    /// The TOML configuration file.
    #[structopt(long, parse(from_os_str))]
    config: Option<PathBuf>,
    /// A log4rs configuration file.
    /// [default: log warnings to standard error]
    #[structopt(long, parse(from_os_str))]
    log_config: Option<PathBuf>,
    /// Log each step of the evaluation to standard error.
    #[structopt(short, long)]
    verbose: bool,
    /// The domain given in HELO. [default: DOMAIN]
    #[structopt(long)]
    helo: Option<String>,
    /// The MAIL FROM address. [default: postmaster@DOMAIN]
    #[structopt(long, default_value = "")]
    sender: String,
    /// The IP address of the SMTP client.
    ip: IpAddr,
    /// The domain whose policy is evaluated.
    domain: String,
}

pub fn main() {
    // Clap exits with status 1 instead of EX_USAGE if we use the more concise
    // API
    let cmd = Command::from_clap(&match Command::clap().get_matches_safe() {
        Ok(matches) => matches,
        Err(
            e @ clap::Error {
                kind: clap::ErrorKind::HelpDisplayed,
                ..
            },
        )
        | Err(
            e @ clap::Error {
                kind: clap::ErrorKind::VersionDisplayed,
                ..
            },
        ) => {
            println!("{}", e.message);
            return;
        },
        Err(e) => {
            eprintln!("{}", e.message);
            EX_USAGE.exit()
        },
    });

    let system_config = match cmd.config {
        None => SystemConfig::default(),
        Some(ref path) => match SystemConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!(
                    "Error in config file at '{}': {}",
                    path.display(),
                    e,
                );
                EX_CONFIG.exit()
            },
        },
    };

    match cmd.log_config {
        Some(ref path) => init_file_log(path),
        None => crate::init_simple_log(if cmd.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Warn
        }),
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start async runtime: {e}");
            EX_SOFTWARE.exit()
        },
    };

    match runtime.block_on(check(&cmd, &system_config)) {
        Ok(outcome) => print_outcome(&outcome),
        Err(e) => {
            eprintln!("Failed to set up DNS resolver: {e}");
            EX_CONFIG.exit()
        },
    }
}

async fn check(
    cmd: &Command,
    system_config: &SystemConfig,
) -> Result<Outcome, Error> {
    let resolver = HickoryResolver::new(&system_config.dns)?;
    let ctx = Context::new(cmd.ip, &cmd.domain, &cmd.sender)
        .with_helo(cmd.helo.as_deref().unwrap_or(&cmd.domain));
    let deadline = tokio::time::Instant::now()
        + Duration::from_secs(system_config.spf.deadline_secs);

    Ok(driver::run(&resolver, &ctx, system_config.spf.limits(), deadline).await)
}

fn print_outcome(outcome: &Outcome) {
    println!("spf={}", outcome.verdict);
    if let Some(ref cause) = outcome.cause {
        println!("cause: {cause}");
    }
    if let Some(ref record) = outcome.record {
        println!("record: {record}");
    }
    if let Some(ref matched) = outcome.matched {
        println!("matched: {} (at {})", matched.text, matched.domain);
    }
    println!("lookups: {}", outcome.lookups);
}

fn init_file_log(path: &Path) {
    if let Err(e) =
        log4rs::init_file(path, log4rs::config::Deserializers::new())
    {
        eprintln!(
            "Failed to initialise logging from '{}': {}",
            path.display(),
            e,
        );
        EX_CONFIG.exit();
    }
}
