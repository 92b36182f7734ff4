use std::{sync::Arc, thread::JoinHandle, time::Duration};

use parking_lot::{Condvar, Mutex};

use crate::{region_manager::HeapRegionManager, Config};

struct UncommitState {
    requested: bool,
    shutdown_requested: bool,
}

struct Shared {
    mutex: Mutex<UncommitState>,
    cv_wakeup: Condvar,
}

/// Returns the memory of inactive regions to the OS, on a background thread unless
/// concurrent uncommit is disabled.
///
/// Each step uncommits at most `limit` regions so the uncommit lock is never held for
/// long; a region reactivated in the meantime is skipped by the manager.
pub struct UncommitService {
    manager: Arc<HeapRegionManager>,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
    limit: usize,
}

impl UncommitService {
    pub fn new(manager: Arc<HeapRegionManager>, config: &Config) -> Self {
        let limit = (config.uncommit_size_limit / manager.opts().region_size_bytes).max(1);
        let shared = Arc::new(Shared {
            mutex: Mutex::new(UncommitState {
                requested: false,
                shutdown_requested: false,
            }),
            cv_wakeup: Condvar::new(),
        });
        let thread = if config.concurrent_uncommit {
            let delay = Duration::from_millis(config.uncommit_delay_ms);
            let thread_shared = shared.clone();
            let thread_manager = manager.clone();
            match std::thread::Builder::new()
                .name("comet-uncommit".to_owned())
                .spawn(move || run(&thread_shared, &thread_manager, limit, delay))
            {
                Ok(handle) => Some(handle),
                Err(err) => {
                    log::warn!("failed to start uncommit thread, uncommitting inline: {}", err);
                    None
                }
            }
        } else {
            None
        };
        Self {
            manager,
            shared,
            thread,
            limit,
        }
    }

    pub fn is_concurrent(&self) -> bool {
        self.thread.is_some()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Called after regions were deactivated.
    pub fn request(&self) {
        if !self.manager.has_inactive_regions() {
            return;
        }
        if self.thread.is_none() {
            uncommit_all(&self.manager, self.limit);
            return;
        }
        let mut state = self.shared.mutex.lock();
        state.requested = true;
        self.shared.cv_wakeup.notify_one();
    }

    pub fn stop(&mut self) {
        {
            let mut state = self.shared.mutex.lock();
            state.shutdown_requested = true;
            self.shared.cv_wakeup.notify_all();
        }
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                log::error!("uncommit thread panicked");
            }
        }
    }
}

impl Drop for UncommitService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn uncommit_all(manager: &HeapRegionManager, limit: usize) -> usize {
    let mut total = 0;
    while manager.has_inactive_regions() {
        let uncommitted = manager.uncommit_inactive_regions(limit);
        if uncommitted == 0 {
            break;
        }
        total += uncommitted;
    }
    total
}

fn run(shared: &Shared, manager: &HeapRegionManager, limit: usize, delay: Duration) {
    loop {
        {
            let mut state = shared.mutex.lock();
            while !state.requested && !state.shutdown_requested {
                shared.cv_wakeup.wait(&mut state);
            }
            if state.shutdown_requested {
                return;
            }
            state.requested = false;
            if !delay.is_zero() {
                // a new request during the delay is served by this pass
                let _ = shared.cv_wakeup.wait_for(&mut state, delay);
                if state.shutdown_requested {
                    return;
                }
                state.requested = false;
            }
        }
        while manager.has_inactive_regions() {
            if manager.uncommit_inactive_regions(limit) == 0 {
                break;
            }
            if shared.mutex.lock().shutdown_requested {
                return;
            }
        }
        log::trace!(target: "gc::uncommit", "uncommit pass done");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::RegionOptions;
    use std::time::Instant;

    fn manager(config: &Config) -> Arc<HeapRegionManager> {
        let opts = RegionOptions::setup_sizes(config);
        Arc::new(HeapRegionManager::new(opts, config))
    }

    fn config(concurrent: bool) -> Config {
        Config {
            initial_heap_size: 0,
            max_heap_size: 16 * 1024 * 1024,
            region_size: Some(1024 * 1024),
            uncommit_delay_ms: 1,
            uncommit_size_limit: 2 * 1024 * 1024,
            concurrent_uncommit: concurrent,
            ..Default::default()
        }
    }

    #[test]
    fn inline_uncommit() {
        let config = config(false);
        let manager = manager(&config);
        let service = UncommitService::new(manager.clone(), &config);
        assert!(!service.is_concurrent());
        assert_eq!(service.limit(), 2);
        assert_eq!(manager.expand_by(6), 6);
        assert_eq!(manager.shrink_by(5), 5);
        assert_eq!(manager.num_inactive_regions(), 5);
        service.request();
        assert_eq!(manager.num_inactive_regions(), 0);
        assert_eq!(manager.length(), 1);
    }

    #[test]
    fn background_uncommit() {
        let config = config(true);
        let manager = manager(&config);
        let mut service = UncommitService::new(manager.clone(), &config);
        assert!(service.is_concurrent());
        assert_eq!(manager.expand_by(8), 8);
        assert_eq!(manager.shrink_by(8), 8);
        service.request();
        let deadline = Instant::now() + Duration::from_secs(10);
        while manager.has_inactive_regions() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(!manager.has_inactive_regions());
        service.stop();
        // regions can be committed again afterwards
        assert_eq!(manager.expand_by(3), 3);
    }
}
