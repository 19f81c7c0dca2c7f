//! Replication master statistics

use crate::LogInstant;
use serde::Serialize;

/// Replication master statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MasterStats {
    /// Records admitted to the log buffer
    pub records_appended: u64,
    /// Serialized bytes admitted to the log buffer
    pub bytes_appended: u64,
    /// Records skipped because the seeded image already holds them
    pub records_skipped: u64,
    /// Batches handed to the transport
    pub batches_sent: u64,
    /// Serialized bytes handed to the transport, resends included
    pub bytes_shipped: u64,
    /// Acks received
    pub acks: u64,
    /// Successful reconnects after a transport loss
    pub reconnects: u64,
    /// Failed sends and connects
    pub send_failures: u64,
    /// Forced drains triggered by back-pressure
    pub force_drains: u64,
    /// Buffer resizes under `resize-once`
    pub resizes: u64,
    /// Highest instant the slave acknowledged
    pub last_acked: Option<LogInstant>,
    /// Highest instant the log manager reported durable
    pub last_flushed: Option<LogInstant>,
    /// Serialized bytes waiting for an ack
    pub buffered_bytes: usize,
}

impl MasterStats {
    /// Render as JSON for diagnostics endpoints and logs
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_snapshot() {
        let stats = MasterStats {
            records_appended: 3,
            last_acked: Some(42),
            ..Default::default()
        };
        let json = stats.to_json();
        assert_eq!(json["records_appended"], 3);
        assert_eq!(json["last_acked"], 42);
        assert_eq!(json["resizes"], 0);
    }
}
