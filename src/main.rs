use anyhow::{Context, Result};
use nix::sys::signal::{signal, SigHandler, Signal};

use webserv::config;
use webserv::server::{request_shutdown, Server};

/// Prints message to standard error and exits with code 1.
macro_rules! abort {
    ($($arg:tt)*) => ({
        eprint!("{}: ", env!("CARGO_PKG_NAME"));
        eprintln!($($arg)*);
        std::process::exit(1);
    })
}

extern "C" fn stop_running(_signal: libc::c_int) {
    request_shutdown();
}

fn usage(argv0: &str) {
    eprintln!("usage: {} <config_file>.conf", argv0);
}

fn main() -> Result<()> {
    let mut args = std::env::args();
    let argv0 = args.next().unwrap_or_else(|| "webserv".to_string());
    let config_path = match (args.next(), args.next()) {
        (Some(path), None) => path,
        _ => {
            usage(&argv0);
            std::process::exit(1);
        }
    };
    if !config_path.ends_with(".conf") {
        abort!("configuration file must have a .conf suffix: {}", config_path);
    }

    let servers = match config::load(&config_path) {
        Ok(servers) => servers,
        Err(e) => abort!("{}", e),
    };

    println!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    // Write errors surface as ordinary errors, not a process kill.
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .context("failed to ignore SIGPIPE")?;
    unsafe { signal(Signal::SIGINT, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGINT handler")?;
    unsafe { signal(Signal::SIGTERM, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGTERM handler")?;

    let mut server = match Server::new(servers) {
        Ok(server) => server,
        Err(e) => abort!("{:#}", e),
    };

    server.run()?;

    println!("requests: {}", server.num_requests);
    println!("bytes: {} in, {} out", server.total_in, server.total_out);
    Ok(())
}
