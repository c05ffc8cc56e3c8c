//! Atomic persistence of one ingested datagram.
//!
//! Write order inside the transaction: artificial exit row (if any), accel
//! window, GPS fix, trip point_count, device freshness. The accel goes in
//! before the GPS so a duplicate accel alone cannot block the fix, while a
//! duplicate fix rolls everything back and leaves no orphan accel.

use anyhow::Result;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use tracing::{debug, warn};

use crate::accel_windows::NewAccelWindow;
use crate::broadcast::LogBus;
use crate::device_repo::DeviceRepository;
use crate::fixes::{GpsFix, NewGpsFix};
use crate::fixes_repo::FixesRepository;
use crate::schema::accelerometer_data;
use crate::trips_repo::TripsRepository;

/// What the transaction actually wrote
#[derive(Debug, Default)]
pub struct PersistOutcome {
    /// The persisted fix, `None` when it was a duplicate
    pub fix: Option<GpsFix>,
    pub accel_inserted: bool,
}

fn is_unique_violation(error: &DieselError) -> bool {
    matches!(
        error,
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)
    )
}

/// Persist one datagram's worth of rows in a single transaction.
///
/// Returns `PersistOutcome { fix: None, .. }` on a duplicate fix (expected
/// when devices resend; logged quietly, nothing committed). Any other
/// database failure propagates after a full rollback.
pub fn insert_data(
    conn: &mut PgConnection,
    artificial_exit: Option<&NewGpsFix>,
    new_fix: &NewGpsFix,
    accel: Option<&NewAccelWindow>,
    log_bus: &LogBus,
) -> Result<PersistOutcome> {
    let device_id = new_fix.device_id.clone();

    let result = conn.transaction::<(GpsFix, bool), DieselError, _>(|conn| {
        // The paired exit must commit ahead of its entry; a savepoint keeps
        // a replayed exit row from poisoning the real insert.
        if let Some(exit_fix) = artificial_exit {
            match conn.transaction(|conn| FixesRepository::insert_on(conn, exit_fix)) {
                Ok(_) => {}
                Err(ref e) if is_unique_violation(e) => {
                    debug!("Duplicate artificial exit for '{}' - skipped", device_id);
                }
                Err(e) => {
                    warn!("Artificial exit insert failed for '{}': {}", device_id, e);
                }
            }
        }

        let mut accel_inserted = false;
        if let Some(window) = accel {
            match conn.transaction(|conn| {
                diesel::insert_into(accelerometer_data::table)
                    .values(window)
                    .execute(conn)
            }) {
                Ok(_) => accel_inserted = true,
                Err(ref e) if is_unique_violation(e) => {
                    debug!(
                        "Duplicate accel (device_id+timestamp) for '{}' - skipped",
                        device_id
                    );
                    metrics::counter!("persistence.accel_duplicates").increment(1);
                }
                Err(e) => {
                    warn!("Accel insert failed for '{}', fix proceeds: {}", device_id, e);
                }
            }
        }

        let fix = FixesRepository::insert_on(conn, new_fix)?;

        if let Some(trip_id) = &new_fix.trip_id {
            // point_count is bookkeeping; a failure here must not lose the fix
            if let Err(e) =
                conn.transaction(|conn| TripsRepository::increment_point_count_on(conn, trip_id))
            {
                warn!(
                    "Failed to increment point_count for trip {}: {}",
                    trip_id, e
                );
            }
        }

        DeviceRepository::update_last_seen_on(conn, &device_id, new_fix.timestamp)?;

        Ok((fix, accel_inserted))
    });

    match result {
        Ok((fix, accel_inserted)) => {
            let mut summary = format!("GPS (ID: {})", fix.id);
            if accel_inserted {
                summary.push_str(" + Accel");
            }
            log_bus.log(format!(
                "[PERSISTENCE] Device '{}': {} inserted successfully",
                device_id, summary
            ));
            metrics::counter!("persistence.fixes_inserted_total").increment(1);

            Ok(PersistOutcome {
                fix: Some(fix),
                accel_inserted,
            })
        }
        Err(ref e) if is_unique_violation(e) => {
            // Expected duplicate: the device resent a datagram
            debug!(
                "Duplicate GPS (device_id+timestamp) for '{}' - skipped",
                device_id
            );
            metrics::counter!("persistence.fix_duplicates").increment(1);
            Ok(PersistOutcome::default())
        }
        Err(e) => {
            log_bus.error(format!(
                "[PERSISTENCE] GPS DB error for device '{}': {}",
                device_id, e
            ));
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diesel::result::DatabaseErrorKind;

    #[derive(Debug)]
    struct FakeErrorInfo;

    impl diesel::result::DatabaseErrorInformation for FakeErrorInfo {
        fn message(&self) -> &str {
            "duplicate key value violates unique constraint \"unique_device_timestamp\""
        }
        fn details(&self) -> Option<&str> {
            None
        }
        fn hint(&self) -> Option<&str> {
            None
        }
        fn table_name(&self) -> Option<&str> {
            Some("gps_data")
        }
        fn column_name(&self) -> Option<&str> {
            None
        }
        fn constraint_name(&self) -> Option<&str> {
            Some("unique_device_timestamp")
        }
        fn statement_position(&self) -> Option<i32> {
            None
        }
    }

    #[test]
    fn test_unique_violation_detection() {
        let duplicate = DieselError::DatabaseError(
            DatabaseErrorKind::UniqueViolation,
            Box::new(FakeErrorInfo),
        );
        assert!(is_unique_violation(&duplicate));

        let other = DieselError::DatabaseError(
            DatabaseErrorKind::ForeignKeyViolation,
            Box::new(FakeErrorInfo),
        );
        assert!(!is_unique_violation(&other));
        assert!(!is_unique_violation(&DieselError::NotFound));
    }
}
