use std::env;
use std::io::{self, Write};
use std::process::ExitCode;

use kilnd::{Command, ConfigLoader, Invocation, SystemConfigLoader, client, run_server};

fn main() -> ExitCode {
    let invocation = Invocation::from_args(env::args_os());
    let command = invocation.command();
    let loader = SystemConfigLoader::from_args(invocation.into_config_args());
    match command {
        Command::Serve => serve(&loader),
        Command::Shutdown => shutdown(&loader),
    }
}

fn serve(loader: &SystemConfigLoader) -> ExitCode {
    match run_server(loader) {
        Ok(reason) if reason.is_clean() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(error) => report(&error),
    }
}

fn shutdown(loader: &SystemConfigLoader) -> ExitCode {
    let config = match loader.load() {
        Ok(config) => config,
        Err(error) => return report(&error),
    };
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => return report(&error),
    };
    match runtime.block_on(client::request_shutdown(config.daemon_socket())) {
        Ok(pid) => {
            drop(writeln!(io::stdout(), "kilnd {pid} is shutting down"));
            ExitCode::SUCCESS
        }
        Err(error) => report(&error),
    }
}

// Error messages already embed their sources.
fn report(error: &dyn std::error::Error) -> ExitCode {
    drop(writeln!(io::stderr(), "kilnd: {error}"));
    ExitCode::FAILURE
}
