use std::collections::BTreeMap;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use zonewall::apply::{ApplyRequest, ClientInfo};
use zonewall::center::Center;
use zonewall::comms::ApplicationCommand;
use zonewall::config::Config;
use zonewall::daemon::{daemonize, signal_ready, SocketProvider};
use zonewall::manager::{self, TargetCommand};
use zonewall::metrics::Metrics;
use zonewall::nft::NftCli;
use zonewall::supervisor::SupervisorCommand;
use zonewall::units::netconf::NetConfCommand;
use zonewall::units::setmgr::SetMgrCommand;
use zonewall::units::svc::{HookAdapter, ServiceAdapter};

/// The subsystems a hook executable may be installed for.
const HOOKED_SUBSYSTEMS: [&str; 7] = [
    "dhcp",
    "dns",
    "vpn",
    "wireguard",
    "qos",
    "notifications",
    "rule_learning",
];

fn main() -> ExitCode {
    // Set up the command-line interface.
    let cmd = clap::Command::new("zonewalld")
        .version(env!("ZONEWALL_BUILD_VERSION"))
        .next_line_help(true)
        .arg(
            clap::Arg::new("check_config")
                .long("check-config")
                .action(clap::ArgAction::SetTrue)
                .help("Check the configuration and exit"),
        )
        .arg(
            clap::Arg::new("strict")
                .long("strict")
                .action(clap::ArgAction::SetTrue)
                .help("Treat policy warnings (e.g. shadowed rules) as errors"),
        );
    let cmd = Config::setup_cli(cmd);

    // Process command-line arguments.
    let matches = cmd.get_matches();

    // Construct the configuration.
    let mut config = match Config::init(&matches) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("Zonewall couldn't be configured: {error}");
            return ExitCode::from(2);
        }
    };
    if let Err(error) = config.init_from_file() {
        eprintln!("Zonewall couldn't be configured: {error}");
        return ExitCode::from(2);
    }

    let strict = matches.get_flag("strict");

    if matches.get_flag("check_config") {
        return check_config(&config, strict);
    }

    // Activate the configured logging setup.
    let logger = match zonewall::log::Logger::launch(&config.daemon.logging, &config.log_dir) {
        Ok(logger) => logger,
        Err(error) => {
            eprintln!("Zonewall couldn't set up logging: {error}");
            return ExitCode::FAILURE;
        }
    };

    // Load the global state file or start from scratch.
    let mut state = zonewall::center::State::default();
    match state.init_from_file(&config) {
        Ok(()) => info!("Successfully loaded the global state file"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            info!("State file not found; starting from scratch");
        }
        Err(err) => {
            error!("Could not load the state file: {err}");
            return ExitCode::FAILURE;
        }
    }

    // Load the capability token store.
    match zonewall::state::tokens::Spec::load(&config.token_store_path()) {
        Ok(spec) => {
            state.tokens = spec.parse();
            info!("Loaded the capability token store");
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            info!("No token store found; only the API plane token will exist");
        }
        Err(err) => {
            error!("Could not load the token store: {err}");
            return ExitCode::FAILURE;
        }
    }

    // Obtain the control listener (bound, or inherited from the previous
    // generation during an upgrade) before daemonizing.
    let provider = match SocketProvider::control_listener(&config.control_socket_path()) {
        Ok(provider) => provider,
        Err(error) => {
            error!("{error}");
            return ExitCode::FAILURE;
        }
    };
    let control_fd = match provider.dup_fd() {
        Ok(fd) => fd,
        Err(error) => {
            error!("{error}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = daemonize(&config.daemon) {
        error!("Failed to daemonize: {err}");
        return ExitCode::FAILURE;
    }

    // Prepare the center.
    let (app_cmd_tx, mut app_cmd_rx) = mpsc::unbounded_channel();
    let (update_tx, update_rx) = mpsc::unbounded_channel();
    let (apply_tx, apply_rx) = mpsc::unbounded_channel();
    let (events, _) = broadcast::channel(256);
    let had_live = state.live_id.is_some();

    let center = Arc::new(Center {
        state: Mutex::new(state),
        config,
        logger,
        live: Default::default(),
        metrics: Metrics::new(),
        started_at: tokio::time::Instant::now(),
        app_cmd_tx,
        update_tx,
        apply_tx,
        events,
    });

    // Set up an async runtime.
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("Couldn't start Tokio: {error}");
            return ExitCode::FAILURE;
        }
    };

    // Enter the runtime.
    runtime.block_on(async {
        let listener = match provider.into_tokio() {
            Ok(listener) => listener,
            Err(error) => {
                error!("{error}");
                return ExitCode::FAILURE;
            }
        };

        // Spawn the units.
        let backend = Arc::new(NftCli::new());
        let handles = match manager::spawn(
            &center,
            backend,
            update_rx,
            apply_rx,
            listener,
            control_fd,
            hook_adapters(&center.config),
        )
        .await
        {
            Ok(handles) => handles,
            Err(err) => {
                error!("Failed to spawn units: {err}");
                return ExitCode::FAILURE;
            }
        };

        // On a first start with a configuration document present, apply it.
        if !had_live && center.config.document_path().is_file() {
            initial_apply(&center).await;
        }

        // Tell the previous generation (if an upgrade is in flight) that we
        // own the sockets now.
        signal_ready();

        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(error) => {
                    error!("Listening for SIGTERM failed: {error}");
                    return ExitCode::FAILURE;
                }
            };

        let result = loop {
            tokio::select! {
                // Watch for CTRL-C (SIGINT).
                res = tokio::signal::ctrl_c() => {
                    if let Err(error) = res {
                        error!("Listening for CTRL-C (SIGINT) failed: {error}");
                        break ExitCode::FAILURE;
                    }
                    break ExitCode::SUCCESS;
                }

                _ = sigterm.recv() => {
                    info!("Received SIGTERM; shutting down");
                    break ExitCode::SUCCESS;
                }

                _ = manager::forward_app_cmds(&mut app_cmd_rx, &handles.unit_txs) => {}
            }
        };

        // Shut down.
        let _ = handles.center_tx.send(TargetCommand::Terminate);
        for (_name, tx) in &handles.unit_txs {
            let _ = tx.send(ApplicationCommand::Terminate);
        }
        let _ = handles.setmgr_tx.send(SetMgrCommand::Terminate);
        let _ = handles.netconf_tx.send(NetConfCommand::Terminate);
        let _ = handles.supervisor_tx.send(SupervisorCommand::Terminate);
        let _ = center.apply_tx.send(ApplyRequest::Terminate);

        // Persist the current state.
        zonewall::state::save_now(&center);
        {
            let state = center.state.lock().unwrap();
            let spec = zonewall::state::tokens::Spec::build(&state.tokens);
            if let Err(err) = spec.save(&center.config.token_store_path()) {
                error!("Could not save the token store: {err}");
            }
        }

        result
    })
}

/// Validate the configuration document and report the outcome.
fn check_config(config: &Config, strict: bool) -> ExitCode {
    let path = config.document_path();
    let text = match std::fs::read_to_string(path.as_std_path()) {
        Ok(text) => text,
        Err(err) => {
            eprintln!("Could not read '{path}': {err}");
            return ExitCode::from(2);
        }
    };

    let spec = match zonewall::doc::parse(&text) {
        Ok(spec) => spec,
        Err(err) => {
            eprintln!("{path}: {err}");
            return ExitCode::from(2);
        }
    };

    match zonewall::validate::validate(&spec, strict) {
        Ok(validated) => {
            for warning in &validated.warnings {
                eprintln!("warning: {warning}");
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("{path}: {err}");
            ExitCode::from(2)
        }
    }
}

/// Apply the on-disk document on a first start.
async fn initial_apply(center: &Arc<Center>) {
    let path = center.config.document_path();
    let document = match std::fs::read_to_string(path.as_std_path()) {
        Ok(document) => document,
        Err(err) => {
            warn!("Could not read '{path}': {err}");
            return;
        }
    };

    let (reply, rx) = tokio::sync::oneshot::channel();
    let _ = center.apply_tx.send(ApplyRequest::Apply {
        document,
        override_lockout: true,
        client: ClientInfo {
            principal: "startup".into(),
            addr: None,
        },
        reply,
    });
    match rx.await {
        Ok(Ok(_)) => info!("Applied the configuration document from '{path}'"),
        Ok(Err(err)) => error!("The configuration document was rejected: {err}"),
        Err(_) => error!("The applier went away during the initial apply"),
    }
}

/// Discover hook executables for the optional subsystems.
fn hook_adapters(config: &Config) -> BTreeMap<String, Box<dyn ServiceAdapter>> {
    let mut adapters: BTreeMap<String, Box<dyn ServiceAdapter>> = BTreeMap::new();
    let hooks_dir = config.config_dir.join("hooks");
    for name in HOOKED_SUBSYSTEMS {
        let hook = hooks_dir.join(name);
        if hook.is_file() {
            info!("Registered hook adapter for subsystem '{name}'");
            adapters.insert(name.to_string(), Box::new(HookAdapter::new(name, hook)));
        }
    }
    adapters
}
