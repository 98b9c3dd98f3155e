use std::{path::PathBuf, process, sync::Arc};

use fedcoord::{
    rest,
    services::{self, messages::MessageHandler, orchestration::StopOnConvergence},
    settings::{ApiSettings, CoordinatorSettings, Settings},
    state_machine::StateMachineInitializer,
    storage::{FileLedger, LedgerStorage, MemoryLedger},
};
use rayon::ThreadPoolBuilder;
use structopt::StructOpt;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::FmtSubscriber;

#[derive(Debug, StructOpt)]
#[structopt(name = "Coordinator")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let settings = Settings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let coordinator_settings = CoordinatorSettings::from(&settings);
    let Settings {
        api: api_settings,
        log: log_settings,
        ledger: ledger_settings,
        ..
    } = settings;

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    match ledger_settings.path {
        Some(path) => {
            let store = FileLedger::open(&path)
                .await
                .expect("failed to open the ledger");
            info!("using the ledger in {}", path.display());
            run(coordinator_settings, api_settings, store).await
        }
        None => {
            warn!("no ledger path configured: rounds are only recorded in memory");
            run(coordinator_settings, api_settings, MemoryLedger::new()).await
        }
    }
}

async fn run<T>(coordinator_settings: CoordinatorSettings, api_settings: ApiSettings, store: T)
where
    T: LedgerStorage,
{
    let (state_machine, requests_tx, event_subscriber) =
        StateMachineInitializer::new(coordinator_settings, store.clone())
            .init()
            .await
            .expect("failed to initialize state machine");

    let thread_pool = Arc::new(
        ThreadPoolBuilder::new()
            .build()
            .expect("failed to build the parser thread pool"),
    );
    let fetcher = services::fetchers::fetcher(&event_subscriber);
    let message_handler =
        MessageHandler::new(api_settings.max_message_size, thread_pool, requests_tx);

    tokio::select! {
        _ = state_machine.run() => {
            warn!("shutting down: state machine terminated");
        }
        res = rest::serve(api_settings, fetcher, message_handler, store) => {
            if let Err(err) = res {
                warn!("REST server failed: {}", err);
            }
            warn!("shutting down: REST server terminated");
        }
        _ = services::orchestration::drive(StopOnConvergence, &event_subscriber) => {
            info!("shutting down: training finished");
        }
        _ = signal::ctrl_c() => {}
    }
}
