//! Input model: what one completed statement phase reports to the store.
//!
//! The execution pipeline (parse/plan/execute hooks) fills these structures
//! and hands them to [`StatsStore::record_execution`](crate::store::StatsStore::record_execution).
//! Query normalization happens upstream: the store receives a stable
//! `query_id` and the canonical text, never raw SQL.

use serde::{Deserialize, Serialize};

/// Caps mirroring the on-entry string bounds.
pub const MAX_APP_NAME_LEN: usize = 100;
pub const MAX_ERROR_MESSAGE_LEN: usize = 100;
pub const MAX_COMMENT_LEN: usize = 512;
pub const MAX_RELATIONS: usize = 10;
pub const MAX_RELATION_NAME_LEN: usize = 255;
pub const MAX_PLAN_TEXT_LEN: usize = 1024;

/// Statement phase a timing sample belongs to. Each phase keeps its own
/// running aggregate on the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StatementPhase {
    Parse,
    Plan,
    #[default]
    Exec,
}

pub const PHASE_COUNT: usize = 3;

impl StatementPhase {
    pub fn index(self) -> usize {
        match self {
            StatementPhase::Parse => 0,
            StatementPhase::Plan => 1,
            StatementPhase::Exec => 2,
        }
    }
}

/// Statement command tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CommandType {
    Select,
    Insert,
    Update,
    Delete,
    Utility,
    #[default]
    Unknown,
}

/// Severity of a captured error sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum ErrorSeverity {
    #[default]
    Info,
    Warning,
    Error,
    Fatal,
}

/// Error details from a failed execution. Most recent wins on the entry;
/// there is no error aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ErrorSample {
    pub severity: ErrorSeverity,
    /// Five-character SQLSTATE code, e.g. "23505".
    pub sqlstate: String,
    /// Message text; stored truncated to [`MAX_ERROR_MESSAGE_LEN`] bytes.
    pub message: String,
}

/// Buffer I/O observed during one execution.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BlockSample {
    pub shared_hit: u64,
    pub shared_read: u64,
    pub shared_dirtied: u64,
    pub shared_written: u64,
    pub local_hit: u64,
    pub local_read: u64,
    pub local_dirtied: u64,
    pub local_written: u64,
    pub temp_read: u64,
    pub temp_written: u64,
    pub read_time_ms: f64,
    pub write_time_ms: f64,
    pub temp_read_time_ms: f64,
    pub temp_write_time_ms: f64,
}

/// WAL generated during one execution.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct WalSample {
    pub records: u64,
    pub full_page_images: u64,
    pub bytes: u64,
}

/// JIT activity during one execution. The `*_time_ms` values are totals;
/// the per-entry aggregate also counts how often each stage was non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct JitSample {
    pub functions: u64,
    pub generation_time_ms: f64,
    pub inlining_time_ms: f64,
    pub optimization_time_ms: f64,
    pub emission_time_ms: f64,
}

/// CPU time consumed by the backend for one execution.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CpuSample {
    pub user_ms: f64,
    pub system_ms: f64,
}

/// One observed statement phase, as produced by the execution pipeline.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecutionSample {
    pub phase: StatementPhase,
    /// Phase duration in milliseconds.
    pub duration_ms: f64,
    /// Rows retrieved or affected.
    pub rows: u64,
    pub blocks: BlockSample,
    pub wal: WalSample,
    pub jit: JitSample,
    pub cpu: CpuSample,
    /// Present when the statement failed; overwrites the entry's last error.
    pub error: Option<ErrorSample>,
}

/// Identity fields of an execution, minus the bucket id the rotator adds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueryOrigin {
    pub query_id: u64,
    pub user_id: u64,
    pub database_id: u64,
    pub client_ip_hash: u64,
    pub plan_id: u64,
    pub app_id_hash: u64,
    pub top_level: bool,
}

/// Descriptive query context captured once, on the first observation of a
/// key. Strings are truncated to their bounds on capture; nothing here is
/// ever silently overlong.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueryMetadata {
    /// Canonical (normalized) query text. Stored out of line in the arena.
    pub query_text: String,
    /// Server encoding id of the text (6 = UTF8).
    pub encoding_id: i32,
    pub application_name: String,
    /// Relations referenced by the query, at most [`MAX_RELATIONS`].
    pub relations: Vec<String>,
    pub cmd_type: CommandType,
    /// Leading comment extracted from the query, if any.
    pub comments: String,
    /// Plan text, captured only when the store is configured for it.
    pub plan_text: Option<String>,
}

/// Truncates to at most `max` bytes without splitting a UTF-8 character.
pub(crate) fn truncate_to_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

impl QueryMetadata {
    /// Returns a copy with every field clamped to its bound.
    pub(crate) fn bounded(&self) -> QueryMetadata {
        QueryMetadata {
            query_text: String::new(), // lives in the arena, not on the entry
            encoding_id: self.encoding_id,
            application_name: truncate_to_boundary(&self.application_name, MAX_APP_NAME_LEN)
                .to_string(),
            relations: self
                .relations
                .iter()
                .take(MAX_RELATIONS)
                .map(|r| truncate_to_boundary(r, MAX_RELATION_NAME_LEN).to_string())
                .collect(),
            cmd_type: self.cmd_type,
            comments: truncate_to_boundary(&self.comments, MAX_COMMENT_LEN).to_string(),
            plan_text: None, // lives in the arena as well
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_respects_char_boundary() {
        let s = "naïve query";
        // Byte 3 falls inside the two-byte 'ï'.
        assert_eq!(truncate_to_boundary(s, 3), "na");
        assert_eq!(truncate_to_boundary(s, 4), "naï");
        assert_eq!(truncate_to_boundary(s, 100), s);
    }

    #[test]
    fn test_metadata_bounds() {
        let meta = QueryMetadata {
            application_name: "x".repeat(500),
            relations: (0..20).map(|i| format!("rel_{i}")).collect(),
            comments: "c".repeat(2000),
            ..QueryMetadata::default()
        };
        let bounded = meta.bounded();
        assert_eq!(bounded.application_name.len(), MAX_APP_NAME_LEN);
        assert_eq!(bounded.relations.len(), MAX_RELATIONS);
        assert_eq!(bounded.comments.len(), MAX_COMMENT_LEN);
    }

    #[test]
    fn test_phase_indices_distinct() {
        let idx = [
            StatementPhase::Parse.index(),
            StatementPhase::Plan.index(),
            StatementPhase::Exec.index(),
        ];
        assert_eq!(idx, [0, 1, 2]);
    }
}
