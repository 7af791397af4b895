use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::{Engine, now_ms};

const REAP_INTERVAL: Duration = Duration::from_secs(5);
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Cancel tentative reservations whose hold has run out.
pub async fn reap_once(engine: &Engine) -> usize {
    let now = now_ms();
    let mut cancelled = 0;
    for id in engine.collect_expired_holds(now) {
        match engine.expire_hold(id, now).await {
            Ok(true) => {
                cancelled += 1;
                metrics::counter!(crate::observability::EXPIRED_HOLDS_TOTAL).increment(1);
                info!(reservation = %id, "hold expired, reservation cancelled");
            }
            // Confirmed or removed since it was collected.
            Ok(false) => {}
            Err(e) => tracing::warn!(reservation = %id, error = %e, "could not expire hold"),
        }
    }
    cancelled
}

/// Background task that periodically cancels expired tentative holds.
pub async fn run_reaper(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(REAP_INTERVAL);
    loop {
        interval.tick().await;
        reap_once(&engine).await;
    }
}

/// Background task that rewrites the WAL once enough appends piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        if let Err(e) = engine.compact_wal().await {
            tracing::error!(error = %e, appends, "WAL compaction failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("haven_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn tentative(hold_until: Option<Ms>) -> NewReservation {
        NewReservation {
            id: Ulid::new(),
            group_name: "Dasom Elementary".into(),
            contact_name: None,
            contact_phone: None,
            category: "education".into(),
            start_date: parse_date("2030-05-01").unwrap(),
            end_date: parse_date("2030-05-02").unwrap(),
            status: ReservationStatus::Tentative,
            hold_until,
            notes: None,
        }
    }

    #[tokio::test]
    async fn reaper_cancels_expired_holds() {
        let path = test_wal_path("reaper_cancel.wal");
        let engine = Engine::new(path).unwrap();

        let now = now_ms();
        let expired = engine.create_reservation(tentative(Some(now - 1_000))).await.unwrap();
        let pending = engine.create_reservation(tentative(Some(now + 3_600_000))).await.unwrap();
        let open_ended = engine.create_reservation(tentative(None)).await.unwrap();

        assert_eq!(engine.collect_expired_holds(now), vec![expired.id]);
        assert_eq!(reap_once(&engine).await, 1);

        let state = engine.get_reservation(expired.id).await.unwrap();
        assert_eq!(state.reservation.status, ReservationStatus::Cancelled);
        assert_eq!(state.reservation.hold_until, None);
        for id in [pending.id, open_ended.id] {
            let state = engine.get_reservation(id).await.unwrap();
            assert_eq!(state.reservation.status, ReservationStatus::Tentative);
        }

        assert!(engine.collect_expired_holds(now).is_empty());
        assert_eq!(reap_once(&engine).await, 0);
    }

    #[tokio::test]
    async fn confirmed_reservation_is_not_reaped() {
        let path = test_wal_path("reaper_confirmed.wal");
        let engine = Engine::new(path).unwrap();

        let now = now_ms();
        let r = engine.create_reservation(tentative(Some(now - 1_000))).await.unwrap();
        engine.set_status(r.id, ReservationStatus::Confirmed).await.unwrap();

        assert!(engine.collect_expired_holds(now).is_empty());
        assert!(!engine.expire_hold(r.id, now).await.unwrap());
    }
}
