//! Stoppable progress threads.
//!
//! Both engines drive their transports from dedicated threads: the
//! multi-rail engine runs a connection-management thread and an optional
//! data-rail progress thread, the single-transport engine a shared worker
//! thread or a small pool. All of them share this lifecycle: tick until
//! stopped, sleep when a tick reports no events, join on drop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

pub(crate) struct ProgressThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressThread {
    /// Spawn a progress thread. `tick` returns whether it processed any
    /// events; idle ticks sleep for `idle_delay` when one is set.
    pub(crate) fn spawn(
        name: &str,
        idle_delay: Option<Duration>,
        mut tick: impl FnMut() -> bool + Send + 'static,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop2 = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while !stop2.load(Ordering::Acquire) {
                    let busy = tick();
                    if !busy {
                        match idle_delay {
                            Some(delay) => std::thread::sleep(delay),
                            None => std::thread::yield_now(),
                        }
                    }
                }
            })
            .expect("spawn progress thread");
        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Request stop without joining, so wake-up messages can be posted
    /// between signalling and joining.
    pub(crate) fn signal_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub(crate) fn stop(&mut self) {
        self.signal_stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ProgressThread {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_thread_ticks_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticks2 = Arc::clone(&ticks);
        let mut t = ProgressThread::spawn("test-progress", Some(Duration::from_micros(10)), move || {
            ticks2.fetch_add(1, Ordering::SeqCst);
            false
        });
        while ticks.load(Ordering::SeqCst) < 3 {
            std::thread::yield_now();
        }
        t.stop();
        let after = ticks.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(ticks.load(Ordering::SeqCst), after);
    }
}
