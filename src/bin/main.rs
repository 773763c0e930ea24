use std::{
    error::Error,
    fs::{self, OpenOptions},
    io::Write,
    path::Path,
    sync::mpsc::{self, RecvTimeoutError},
    thread,
    time::Duration,
};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tether::{
    cli::{ChildArgs, Cli, Commands, IdentityArgs, RunArgs, parse_args},
    constants::DEFAULT_STOP_TIMEOUT,
    gate::SingletonGate,
    named::default_objects,
    naming::NamedHandleSet,
    supervisor::ChildSupervisor,
    watchdog::ChildWatchdog,
};

/// Exit status of `tether child` when registration fails.
const REGISTRATION_FAILED_EXIT_CODE: i32 = 3;

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    init_logging(&args);

    match args.command {
        Commands::Run(run_args) => run(run_args)?,
        Commands::Child(child_args) => child(child_args)?,
        Commands::Probe { program, identity } => probe(&program, &identity)?,
        Commands::Names { program, identity } => {
            let names = NamedHandleSet::resolve(&program, None, &identity.options())?;
            println!("singleton: {}", names.singleton);
            println!("startup:   {}", names.startup);
            println!("terminate: {}", names.terminate);
        }
    }

    Ok(())
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run(args: RunArgs) -> Result<(), Box<dyn Error>> {
    let config = args.into_config()?;
    let program = config.child.program.display().to_string();

    let (interrupt_tx, interrupt_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = interrupt_tx.send(());
    })?;

    let supervisor = ChildSupervisor::new();
    let Some(child) = supervisor.start_singleton_child(
        &config.child,
        &config.options,
        config.startup_timeout,
    )?
    else {
        warn!("'{program}' is already running; aborting duplicate start");
        return Ok(());
    };
    info!("Supervising '{program}' as pid {}", child.pid());

    loop {
        match interrupt_rx.recv_timeout(Duration::from_millis(200)) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        if child.is_disposed() {
            match child.last_error() {
                Some(err) => error!("Supervision of '{program}' ended: {err}"),
                None => warn!("Supervision of '{program}' ended"),
            }
            return Ok(());
        }
        if !config.options.restart_on_exit && child.has_exited()? {
            let code = child.last_exit().and_then(|exit| exit.code);
            info!("'{program}' exited with code {code:?}");
            return Ok(());
        }
    }

    let stop_timeout = config.stop_timeout.unwrap_or(DEFAULT_STOP_TIMEOUT);
    info!("tether is shutting down; stopping child process {}", child.pid());
    child.terminate(stop_timeout)?;
    Ok(())
}

fn child(args: ChildArgs) -> Result<(), Box<dyn Error>> {
    let options = args.identity.options();
    let watchdog = ChildWatchdog::new();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    ctrlc::set_handler(move || trigger.cancel())?;

    if !watchdog.register_as_child(&options) {
        error!("Failed to register as child process");
        std::process::exit(REGISTRATION_FAILED_EXIT_CODE);
    }

    if let Some(pid_file) = &args.pid_file {
        append_pid(pid_file)?;
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let reason = runtime.block_on(watchdog.wait_for_exit_notification(&options, &cancel));
    info!("Child process {} shutting down: {reason}", std::process::id());

    if let Some(exit_file) = &args.exit_file {
        fs::write(exit_file, reason.as_ref())?;
    }
    if let Some(linger) = args.linger {
        thread::sleep(linger);
    }

    Ok(())
}

fn append_pid(path: &Path) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", std::process::id())
}

fn probe(program: &Path, identity: &IdentityArgs) -> Result<(), Box<dyn Error>> {
    let names = NamedHandleSet::resolve(program, None, &identity.options())?;
    let gate = SingletonGate::new(default_objects());
    if gate.is_held(&names.singleton)? {
        println!("running");
    } else {
        println!("not running");
    }
    Ok(())
}
