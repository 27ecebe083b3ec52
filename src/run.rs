//! `manetd run`: the daemon event loop.
//!
//! Single-threaded around the engine: transport receive threads push
//! datagrams into one bounded channel, and this loop alternates between
//! draining it and firing the engine's aggregation deadlines. All engine
//! state changes happen on this thread.

use anyhow::Result;
use crossbeam_channel::RecvTimeoutError;
use rfc5444_core::{udp_factory, Config, ConfigApplier, Engine};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_shutdown(_: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

/// Upper bound on the loop's sleep so shutdown flags are noticed promptly.
const IDLE_TICK: Duration = Duration::from_millis(250);

pub fn run(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;

    let (tx, rx) = crossbeam_channel::bounded(4096);
    let mut engine = Engine::new(Box::new(udp_factory(tx)));
    let mut applier = ConfigApplier::new();
    applier.apply(&mut engine, &config);

    RUNNING.store(true, Ordering::SeqCst);
    unsafe {
        libc::signal(libc::SIGINT, handle_shutdown as *const () as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_shutdown as *const () as libc::sighandler_t);
    }

    tracing::info!("manetd running with {} interface section(s)", config.interfaces.len());

    while RUNNING.load(Ordering::SeqCst) {
        let timeout = engine
            .poll_timeout()
            .map(|at| at.saturating_duration_since(Instant::now()))
            .unwrap_or(IDLE_TICK)
            .min(IDLE_TICK);

        match rx.recv_timeout(timeout) {
            Ok(datagram) => engine.handle_inbound(datagram),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        engine.handle_timeout(Instant::now());
    }

    tracing::info!("shutting down");
    engine.cleanup();
    Ok(())
}
