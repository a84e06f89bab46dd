//! Maintenance window policy
//!
//! Disruptive stages (flashing, reboot) only proceed while the window is
//! open. The predicate is injectable; the shipped variants are "always
//! open" and a UTC hour-of-day range.

use chrono::{Timelike, Utc};
use std::sync::Arc;

pub trait MaintenanceWindow: Send + Sync {
    /// Whether the window is open at the given UTC hour
    fn is_open_at(&self, utc_hour: u32) -> bool;

    fn is_open(&self) -> bool {
        self.is_open_at(Utc::now().hour())
    }
}

/// No constraint; flash whenever the job reaches that stage
pub struct AlwaysOpen;

impl MaintenanceWindow for AlwaysOpen {
    fn is_open_at(&self, _utc_hour: u32) -> bool {
        true
    }
}

/// Open during `[start, end)` UTC hours; ranges may wrap midnight
pub struct UtcHourWindow {
    start: u32,
    end: u32,
}

impl UtcHourWindow {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }
}

impl MaintenanceWindow for UtcHourWindow {
    fn is_open_at(&self, utc_hour: u32) -> bool {
        if self.start <= self.end {
            utc_hour >= self.start && utc_hour < self.end
        } else {
            utc_hour >= self.start || utc_hour < self.end
        }
    }
}

/// Build the window policy from config; equal start/end means unconstrained
pub fn from_config(start_hour: u8, end_hour: u8) -> Arc<dyn MaintenanceWindow> {
    if start_hour == end_hour {
        Arc::new(AlwaysOpen)
    } else {
        Arc::new(UtcHourWindow::new(start_hour as u32, end_hour as u32))
    }
}
