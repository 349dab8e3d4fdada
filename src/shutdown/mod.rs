use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[cfg(unix)]
use signal_hook::consts::signal::{SIGINT, SIGTERM};
#[cfg(unix)]
use signal_hook::flag;
#[cfg(unix)]
use signal_hook::low_level::unregister;
#[cfg(unix)]
use signal_hook::SigId;

/// Process-wide stop flag raised by SIGINT/SIGTERM or by [`ShutdownSignal::trigger`].
pub struct ShutdownSignal {
    triggered: Arc<AtomicBool>,
    #[cfg(unix)]
    sig_ids: Vec<SigId>,
}

impl ShutdownSignal {
    pub fn install() -> io::Result<Self> {
        let triggered = Arc::new(AtomicBool::new(false));

        #[cfg(unix)]
        {
            let id_int = flag::register(SIGINT, Arc::clone(&triggered))?;
            let id_term = flag::register(SIGTERM, Arc::clone(&triggered))?;
            Ok(Self {
                triggered,
                sig_ids: vec![id_int, id_term],
            })
        }

        #[cfg(not(unix))]
        {
            Ok(Self { triggered })
        }
    }

    /// A signal that only reacts to [`ShutdownSignal::trigger`].
    #[cfg(test)]
    pub fn manual() -> Self {
        Self {
            triggered: Arc::new(AtomicBool::new(false)),
            #[cfg(unix)]
            sig_ids: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.triggered)
    }
}

impl Drop for ShutdownSignal {
    fn drop(&mut self) {
        #[cfg(unix)]
        for id in self.sig_ids.drain(..) {
            unregister(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::ShutdownSignal;

    #[test]
    fn manual_signal_starts_untriggered_and_latches() {
        let signal = ShutdownSignal::manual();
        let flag = signal.flag();
        assert!(!signal.is_triggered());

        signal.trigger();

        assert!(signal.is_triggered());
        assert!(flag.load(Ordering::SeqCst));
    }
}
