use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[cfg(unix)]
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
#[cfg(unix)]
use signal_hook::flag;
#[cfg(unix)]
use signal_hook::low_level::unregister;
#[cfg(unix)]
use signal_hook::SigId;

/// Latches once SIGINT, SIGTERM or SIGHUP arrives; the accept loop polls it.
pub struct ShutdownHooks {
    triggered: Arc<AtomicBool>,
    #[cfg(unix)]
    sig_ids: Vec<SigId>,
}

impl ShutdownHooks {
    pub fn install() -> io::Result<Self> {
        let triggered = Arc::new(AtomicBool::new(false));

        #[cfg(unix)]
        {
            let mut sig_ids = Vec::with_capacity(3);
            for signal in [SIGINT, SIGTERM, SIGHUP] {
                sig_ids.push(flag::register(signal, Arc::clone(&triggered))?);
            }
            return Ok(Self { triggered, sig_ids });
        }

        #[cfg(not(unix))]
        {
            Ok(Self { triggered })
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Requests shutdown without a signal, e.g. once a self-debug run finishes.
    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
    }

    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.triggered)
    }

    // Sleeps in small steps so a signal cuts the pause short.
    pub fn pause(&self, duration: Duration) -> bool {
        let step = Duration::from_millis(10);
        let mut waited = Duration::ZERO;
        while waited < duration {
            if self.is_triggered() {
                return true;
            }
            std::thread::sleep(step.min(duration - waited));
            waited += step;
        }
        self.is_triggered()
    }
}

impl Drop for ShutdownHooks {
    fn drop(&mut self) {
        #[cfg(unix)]
        for id in self.sig_ids.drain(..) {
            unregister(id);
        }
    }
}
