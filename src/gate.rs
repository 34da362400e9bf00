/// Largest row count an `.xlsx` worksheet can hold.
pub const XLSX_MAX_ROWS: u64 = 1_048_576;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Proceed,
    WarnAndConfirm {
        excess: u64,
    },
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowCountGate {
    limit: u64,
}

impl RowCountGate {
    pub fn new(limit: u64) -> Self {
        Self { limit }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn evaluate(&self, total_count: u64) -> GateDecision {
        evaluate(total_count, self.limit)
    }
}

impl Default for RowCountGate {
    fn default() -> Self {
        Self::new(XLSX_MAX_ROWS)
    }
}

pub fn evaluate(total_count: u64, limit: u64) -> GateDecision {
    if total_count <= limit {
        GateDecision::Proceed
    } else if limit == 0 {
        GateDecision::Blocked
    } else {
        GateDecision::WarnAndConfirm {
            excess: total_count - limit,
        }
    }
}
