use chrono::{NaiveDateTime, Utc};

use crate::database::ObjectRecord;
use crate::s3::error::S3Error;

pub const MODE_COMPLIANCE: &str = "COMPLIANCE";
pub const MODE_GOVERNANCE: &str = "GOVERNANCE";

/// Whether the caller may punch through GOVERNANCE retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GovernanceBypass {
    /// `x-amz-bypass-governance-retention: true` plus the
    /// `s3:BypassGovernanceRetention` permission.
    Granted,
    Denied,
}

fn resource(record: &ObjectRecord) -> String {
    format!("/{}/{}", record.bucket, record.object_key)
}

/// Gate for every destructive mutation of a version row.
///
/// Legal hold blocks unconditionally. Unexpired COMPLIANCE retention blocks
/// unconditionally; GOVERNANCE only yields to an authorized bypass.
pub fn check_destructive(
    record: &ObjectRecord,
    bypass: GovernanceBypass,
    now: NaiveDateTime,
) -> Result<(), S3Error> {
    if record.legal_hold {
        return Err(S3Error::AccessDenied(resource(record)));
    }

    let Some(retain_until) = record.retain_until else {
        return Ok(());
    };
    if retain_until <= now {
        return Ok(());
    }

    match record.lock_mode.as_deref() {
        Some(MODE_GOVERNANCE) if bypass == GovernanceBypass::Granted => Ok(()),
        Some(MODE_GOVERNANCE) | Some(MODE_COMPLIANCE) => {
            Err(S3Error::AccessDenied(resource(record)))
        }
        // Retention date without a mode should not happen; refuse anyway.
        _ => Err(S3Error::AccessDenied(resource(record))),
    }
}

pub fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

pub fn is_valid_mode(mode: &str) -> bool {
    mode == MODE_COMPLIANCE || mode == MODE_GOVERNANCE
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(
        lock_mode: Option<&str>,
        retain_offset: Option<Duration>,
        legal_hold: bool,
    ) -> ObjectRecord {
        let now = now();
        ObjectRecord {
            id: 1,
            bucket: "b".to_string(),
            object_key: "k".to_string(),
            version_id: "v1".to_string(),
            blob_id: Some("blob".to_string()),
            size: 1,
            etag: "etag".to_string(),
            content_type: "application/octet-stream".to_string(),
            modified_at: now,
            is_latest: true,
            delete_marker: false,
            encryption_type: None,
            lock_mode: lock_mode.map(str::to_string),
            retain_until: retain_offset.map(|offset| now + offset),
            legal_hold,
        }
    }

    #[test]
    fn unlocked_rows_pass() {
        let row = record(None, None, false);
        assert!(check_destructive(&row, GovernanceBypass::Denied, now()).is_ok());
    }

    #[test]
    fn legal_hold_blocks_even_with_bypass() {
        let row = record(Some(MODE_GOVERNANCE), Some(Duration::hours(1)), true);
        assert!(check_destructive(&row, GovernanceBypass::Granted, now()).is_err());
    }

    #[test]
    fn compliance_blocks_until_expiry() {
        let held = record(Some(MODE_COMPLIANCE), Some(Duration::hours(1)), false);
        assert!(check_destructive(&held, GovernanceBypass::Granted, now()).is_err());

        let expired = record(Some(MODE_COMPLIANCE), Some(Duration::hours(-1)), false);
        assert!(check_destructive(&expired, GovernanceBypass::Denied, now()).is_ok());
    }

    #[test]
    fn governance_yields_only_to_bypass() {
        let row = record(Some(MODE_GOVERNANCE), Some(Duration::hours(1)), false);
        assert!(check_destructive(&row, GovernanceBypass::Denied, now()).is_err());
        assert!(check_destructive(&row, GovernanceBypass::Granted, now()).is_ok());
    }
}
