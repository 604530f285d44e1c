/// Request priority (matches Chromium's RequestPriority).
///
/// Ordering is significant: higher variants are scheduled first. FIFO order
/// is preserved within a priority level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum RequestPriority {
    Throttled = 0,
    Idle = 1,
    Lowest = 2,
    Low = 3,
    #[default]
    Medium = 4,
    Highest = 5,
}

/// Number of distinct priority levels.
pub const NUM_PRIORITIES: usize = 6;

/// The maximum priority. Requests that ignore pool limits must use it.
pub const MAXIMUM_PRIORITY: RequestPriority = RequestPriority::Highest;

impl RequestPriority {
    /// Bucket index for priority-keyed storage.
    pub fn as_index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(RequestPriority::Throttled),
            1 => Some(RequestPriority::Idle),
            2 => Some(RequestPriority::Lowest),
            3 => Some(RequestPriority::Low),
            4 => Some(RequestPriority::Medium),
            5 => Some(RequestPriority::Highest),
            _ => None,
        }
    }

    /// Human-readable name, as emitted in pool diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            RequestPriority::Throttled => "THROTTLED",
            RequestPriority::Idle => "IDLE",
            RequestPriority::Lowest => "LOWEST",
            RequestPriority::Low => "LOW",
            RequestPriority::Medium => "MEDIUM",
            RequestPriority::Highest => "HIGHEST",
        }
    }
}
