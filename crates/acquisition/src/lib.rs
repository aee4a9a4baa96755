//! Threaded belt acquisition: a blocking [`SampleSource`] read on a
//! background thread, handed to a frame-driven consumer without blocking.

pub mod bridge;
pub mod error;
pub mod source;

use std::sync::Arc;

use common::{Clock, Transport};
use log::warn;

pub use bridge::{AcquisitionBridge, BeltSettings, SampleQueue, ScopedAcquisition};
pub use error::{AcquisitionError, SourceError};
pub use source::{open_device, release_device, ReplaySource, SampleSource, SimulatedBelt};

/// Settings for the retry after `err`, if the fallback policy allows one:
/// a connection failure over BLE, with fallback enabled, retries over USB
/// with auto device selection.
pub fn fallback_settings(
    settings: &BeltSettings,
    fallback_to_usb: bool,
    err: &AcquisitionError,
) -> Option<BeltSettings> {
    if err.is_connection_failure() && fallback_to_usb && settings.transport == Transport::Ble {
        warn!("{err}; falling back to USB");
        Some(settings.over(Transport::Usb))
    } else {
        None
    }
}

/// Starts a bridge over `settings.transport`, retrying per
/// [`fallback_settings`] when the first connection fails.
///
/// `make_source` builds a fresh device handle for each attempt.
pub fn connect_with_fallback<F>(
    settings: &BeltSettings,
    fallback_to_usb: bool,
    clock: Arc<dyn Clock>,
    mut make_source: F,
) -> Result<AcquisitionBridge, AcquisitionError>
where
    F: FnMut(Transport) -> Box<dyn SampleSource>,
{
    let mut bridge = AcquisitionBridge::new(make_source(settings.transport), settings.clone())
        .with_clock(Arc::clone(&clock));

    match bridge.start() {
        Ok(()) => Ok(bridge),
        Err(err) => {
            let Some(retry) = fallback_settings(settings, fallback_to_usb, &err) else {
                return Err(err);
            };
            let mut bridge = AcquisitionBridge::new(make_source(retry.transport), retry).with_clock(clock);
            bridge.start()?;
            Ok(bridge)
        }
    }
}
