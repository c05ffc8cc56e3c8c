//! Device and record validation.
//!
//! Two severities exist here: the device check and the GPS shape check are
//! blocking (the datagram is dropped), the accelerometer check is not (only
//! the accel window is discarded, the fix proceeds).

use anyhow::Result;
use std::net::SocketAddr;
use tracing::warn;

use crate::broadcast::LogBus;
use crate::device_repo::DeviceRepository;
use crate::devices::Device;
use crate::normalizer::{AccelInput, NormalizedGps};

pub const MAX_DEVICE_ID_LEN: usize = 100;

/// Confirm the sending device is registered and active.
///
/// Rejections are security events: they are audit-logged to the log bus with
/// the sender address. `Ok(None)` means rejected (already logged); `Err`
/// means the lookup itself failed.
pub fn validate_device(
    device_repo: &DeviceRepository,
    log_bus: &LogBus,
    device_id: &str,
    sender: SocketAddr,
) -> Result<Option<Device>> {
    let Some(device) = device_repo.get_device(device_id)? else {
        warn!("Unregistered device '{}' from {} - rejected", device_id, sender);
        metrics::counter!("udp.validator.unknown_device").increment(1);
        log_bus.error(format!(
            "[VALIDATOR] SECURITY: Rejected data from unregistered device '{}' (IP: {})",
            device_id, sender
        ));
        return Ok(None);
    };

    if !device.is_active {
        warn!("Inactive device '{}' from {} - rejected", device_id, sender);
        metrics::counter!("udp.validator.inactive_device").increment(1);
        log_bus.error(format!(
            "[VALIDATOR] SECURITY: Rejected data from inactive device '{}' (IP: {})",
            device_id, sender
        ));
        return Ok(None);
    }

    Ok(Some(device))
}

/// Shape check on the canonical GPS record. Blocking: a failure drops the
/// fix entirely.
pub fn validate_gps(gps: &NormalizedGps) -> Result<()> {
    if gps.device_id.is_empty() || gps.device_id.len() > MAX_DEVICE_ID_LEN {
        anyhow::bail!(
            "device id must be 1..={} characters, got {}",
            MAX_DEVICE_ID_LEN,
            gps.device_id.len()
        );
    }
    if !(-90.0..=90.0).contains(&gps.latitude) {
        anyhow::bail!("latitude out of range: {}", gps.latitude);
    }
    if !(-180.0..=180.0).contains(&gps.longitude) {
        anyhow::bail!("longitude out of range: {}", gps.longitude);
    }
    if !gps.accuracy.is_finite() || gps.accuracy < 0.0 {
        anyhow::bail!("accuracy must be a non-negative number: {}", gps.accuracy);
    }
    if !gps.latitude.is_finite() || !gps.longitude.is_finite() || !gps.altitude.is_finite() {
        anyhow::bail!("coordinates must be finite");
    }
    Ok(())
}

/// Shape check on the accelerometer window. Non-blocking at the call site:
/// a failure discards only the window.
pub fn validate_accel(accel: &AccelInput) -> Result<()> {
    if accel.ts_end < accel.ts_start {
        anyhow::bail!("accel window ends before it starts");
    }
    if !(1..=500).contains(&accel.sample_count) {
        anyhow::bail!("sample_count out of range: {}", accel.sample_count);
    }
    if !(0..=255).contains(&accel.flags) {
        anyhow::bail!("flags out of range: {}", accel.flags);
    }
    for (label, value) in [
        ("rms_x", accel.rms_x),
        ("rms_y", accel.rms_y),
        ("rms_z", accel.rms_z),
        ("rms_mag", accel.rms_mag),
        ("max_x", accel.max_x),
        ("max_y", accel.max_y),
        ("max_z", accel.max_z),
        ("max_mag", accel.max_mag),
    ] {
        if !value.is_finite() {
            anyhow::bail!("{} is not finite", label);
        }
    }
    Ok(())
}
