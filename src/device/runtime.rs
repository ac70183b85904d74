//! Process-wide driver API lifetime tracking.
//!
//! Multiple capture sessions may coexist in one process; the driver library
//! itself must be started exactly once and shut down when the last session
//! releases it. Sessions call [`acquire`] on connect and [`release`] on
//! disconnect, possibly from different threads.

use std::sync::Mutex;

use once_cell::sync::Lazy;
use tracing::{debug, error, info};

use crate::device::{DeviceResult, Transport};

static OPEN_COUNT: Lazy<Mutex<usize>> = Lazy::new(|| Mutex::new(0));

/// Registers a session with the driver API, starting it on first use.
///
/// Every successful acquire must be paired with exactly one [`release`].
pub fn acquire(transport: &dyn Transport) -> DeviceResult<()> {
    let mut count = OPEN_COUNT.lock().unwrap();
    if *count == 0 {
        transport.startup()?;
        info!("Driver API {} started", transport.version());
    } else {
        debug!("Driver API already started. Current open count: {}", *count);
    }
    *count += 1;
    Ok(())
}

/// Deregisters a session, shutting the driver API down on last use.
pub fn release(transport: &dyn Transport) {
    let mut count = OPEN_COUNT.lock().unwrap();
    match *count {
        0 => error!("Driver API release without a matching acquire"),
        1 => {
            *count = 0;
            transport.shutdown();
            info!("Driver API was shut down");
        }
        n => {
            *count = n - 1;
            debug!("Driver API still in use. Current open count: {}", *count);
        }
    }
}

#[cfg(test)]
pub(crate) fn reset() {
    *OPEN_COUNT.lock().unwrap() = 0;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serial_test::serial;

    use super::*;
    use crate::device::{ApiVersion, Device, DeviceError};

    #[derive(Default)]
    struct CountingTransport {
        startups: AtomicUsize,
        shutdowns: AtomicUsize,
    }

    impl Transport for CountingTransport {
        fn startup(&self) -> DeviceResult<()> {
            self.startups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }

        fn version(&self) -> ApiVersion {
            ApiVersion { major: 1, minor: 0, patch: 0 }
        }

        fn open(&self, _id: &str) -> DeviceResult<Box<dyn Device>> {
            Err(DeviceError::NotFound)
        }
    }

    #[test]
    #[serial]
    fn first_acquire_starts_and_last_release_shuts_down() {
        reset();
        let transport = CountingTransport::default();

        acquire(&transport).unwrap();
        acquire(&transport).unwrap();
        assert_eq!(transport.startups.load(Ordering::SeqCst), 1);

        release(&transport);
        assert_eq!(transport.shutdowns.load(Ordering::SeqCst), 0);
        release(&transport);
        assert_eq!(transport.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[serial]
    fn startup_failure_leaves_count_untouched() {
        reset();

        struct FailingTransport;
        impl Transport for FailingTransport {
            fn startup(&self) -> DeviceResult<()> {
                Err(DeviceError::Unreachable)
            }
            fn shutdown(&self) {}
            fn version(&self) -> ApiVersion {
                ApiVersion { major: 0, minor: 0, patch: 0 }
            }
            fn open(&self, _id: &str) -> DeviceResult<Box<dyn Device>> {
                Err(DeviceError::NotFound)
            }
        }

        assert_eq!(acquire(&FailingTransport), Err(DeviceError::Unreachable));

        // A later healthy transport still performs global startup.
        let transport = CountingTransport::default();
        acquire(&transport).unwrap();
        assert_eq!(transport.startups.load(Ordering::SeqCst), 1);
        release(&transport);
    }
}
