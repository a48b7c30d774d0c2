//! Consumer side of an IPC exchange. Spawned by the producer with no arguments; the exchange
//! name comes from `XSYNC_IPC_EXCHANGE`. Exits 0 on success and 1 on any failure.

use xsync_core::config::HarnessConfig;
use xsync_core::{ipc, logging};

fn main() {
    let code = match HarnessConfig::from_env() {
        Ok(config) => {
            logging::init(&config.log_filter);
            match ipc::run_consumer(config) {
                Ok(()) => 0,
                Err(e) => {
                    tracing::error!(error = %e, "consumer failed");
                    1
                }
            }
        }
        Err(e) => {
            logging::init(logging::DEFAULT_FILTER);
            tracing::error!(error = %e, "bad consumer configuration");
            1
        }
    };
    std::process::exit(code);
}
