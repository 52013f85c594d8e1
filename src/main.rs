use anyhow::{ensure, Context, Result};
use clap::Parser;
use log::{info, warn};
use std::fs;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};

mod engine;

use engine::activation;
use engine::dispatcher::Dispatcher;
use engine::endpoints::{self, EndpointSpec, Role};
use engine::normalize::Protocol;
use engine::sink::Sink;

/// Consumes journald/syslog socket traffic without storing it.
///
/// Binds the well-known journal sockets so applications have somewhere to
/// log, then discards everything (or appends it to a single flat file).
#[derive(Debug, Parser)]
#[command(version)]
struct Opt {
    /// Detach from the controlling terminal and run in the background.
    #[clap(short, long)]
    daemonize: bool,

    /// Append every received log line to FILE instead of discarding it.
    #[clap(short, long, value_name = "FILE")]
    file: Option<PathBuf>,

    /// Skip protocol normalization: write payloads as-is, one line each.
    #[clap(short, long)]
    raw: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let opt = Opt::parse();

    let sink = match &opt.file {
        Some(path) => Sink::open(path)?,
        None => Sink::discard(),
    };

    if opt.daemonize {
        detach().context("cannot daemonize")?;
    }

    // journald peers request flushes via SIGUSR1; there is nothing to flush.
    unsafe {
        libc::signal(libc::SIGUSR1, libc::SIG_IGN);
    }

    let _ = fs::create_dir_all("/run/systemd/journal");

    let mut inherited = activation::inherited_fds();
    if !inherited.is_empty() {
        info!("socket activation: {} inherited descriptor(s)", inherited.len());
    }

    let mut dispatcher = Dispatcher::new(sink)?;
    let watched = setup_endpoints(
        &mut dispatcher,
        &EndpointSpec::well_known(),
        &mut inherited,
        opt.raw,
        Some(Path::new(endpoints::DEV_LOG_ALIAS)),
    )?;
    ensure!(watched > 0, "no log socket could be set up");

    info!(
        "draining log traffic{}",
        match &opt.file {
            Some(path) => format!(" into {}", path.display()),
            None => String::from(" into the void"),
        }
    );
    dispatcher.run()
}

/// Resolves and registers every endpoint, returning how many ended up
/// watched. One endpoint failing to resolve is logged and skipped; only the
/// caller decides whether ending up with none is fatal.
fn setup_endpoints(
    dispatcher: &mut Dispatcher,
    specs: &[EndpointSpec],
    inherited: &mut Vec<OwnedFd>,
    raw: bool,
    alias: Option<&Path>,
) -> Result<usize> {
    let mut watched = 0;
    for spec in specs {
        let proto = protocol_for(spec.role, raw);
        match endpoints::resolve(spec, inherited) {
            Ok(resolved) => {
                dispatcher.watch(spec.role, resolved, proto)?;
                if spec.role == Role::DevLog {
                    if let Some(alias) = alias {
                        endpoints::install_alias(alias, &spec.path);
                    }
                }
                info!("listening on {}", spec.path.display());
                watched += 1;
            }
            Err(e) => warn!("skipping {}: {:#}", spec.path.display(), e),
        }
    }
    Ok(watched)
}

fn protocol_for(role: Role, raw: bool) -> Protocol {
    if raw {
        return Protocol::Raw;
    }
    match role {
        Role::DevLog => Protocol::Syslog,
        Role::Journal => Protocol::Journal,
        Role::Stdout => Protocol::Stream,
    }
}

fn detach() -> Result<()> {
    // Keeps the original descriptors; inherited activation fds survive.
    let rc = unsafe { libc::daemon(0, 0) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}
