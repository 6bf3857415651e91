//! Which full backups leave local disk, and which incrementals go with them.

use crate::models::backup_record::BackupRecord;
use chrono::{DateTime, Utc};

/// Oldest full backups beyond the newest `keep`.
///
/// `fulls` must be ascending by backup time; the returned slice is its prefix.
pub fn select_for_deletion(fulls: &[BackupRecord], keep: usize) -> &[BackupRecord] {
    if fulls.len() <= keep {
        return &[];
    }
    &fulls[..fulls.len() - keep]
}

/// Open interval of backup times whose incrementals depend on `full`.
///
/// Closed by the next full backup, or by `now` while `full` is the latest one.
pub fn dependency_window(
    full: &BackupRecord,
    next_full: Option<&BackupRecord>,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let upper = next_full.map(|next| next.backup_time).unwrap_or(now);
    (full.backup_time, upper)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::backup_record::{BackupKind, BackupStatus};
    use chrono::TimeZone;

    fn full_at(hour: u32) -> BackupRecord {
        BackupRecord {
            id: hour as i64,
            backup_time: Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap(),
            status: BackupStatus::Created,
            kind: BackupKind::Full,
            comment: String::new(),
            legacy_dir: None,
        }
    }

    #[test]
    fn test_keeps_everything_within_threshold() {
        let fulls: Vec<_> = (1..=3).map(full_at).collect();
        assert!(select_for_deletion(&fulls, 3).is_empty());
        assert!(select_for_deletion(&fulls, 10).is_empty());
        assert!(select_for_deletion(&[], 0).is_empty());
    }

    #[test]
    fn test_selects_oldest_excess_in_order() {
        let fulls: Vec<_> = (1..=5).map(full_at).collect();
        for keep in 0..5 {
            let expired = select_for_deletion(&fulls, keep);
            assert_eq!(expired.len(), 5 - keep);
            assert_eq!(expired, &fulls[..5 - keep]);
            assert!(expired.windows(2).all(|w| w[0].backup_time < w[1].backup_time));
        }
    }

    #[test]
    fn test_window_closes_at_next_full() {
        let first = full_at(1);
        let second = full_at(5);
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();

        let (lo, hi) = dependency_window(&first, Some(&second), now);
        assert_eq!(lo, first.backup_time);
        assert_eq!(hi, second.backup_time);
    }

    #[test]
    fn test_window_closes_at_now_for_latest_full() {
        let latest = full_at(7);
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 9, 30, 0).unwrap();

        assert_eq!(dependency_window(&latest, None, now), (latest.backup_time, now));
    }
}
