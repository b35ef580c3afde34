//! Admission: picking which candidates start, given the free slots.

use crate::config::SchedulerSettings;
use crate::task::Task;
use std::collections::HashMap;

/// Free capacity at the start of an admission pass.
#[derive(Debug, Clone)]
pub struct AdmissionSlots {
    global_free: usize,
    /// Free slots for platforms with a configured ceiling.
    platform_free: HashMap<String, usize>,
    /// Starts left for throttled platforms.
    start_budget: HashMap<String, u32>,
}

impl AdmissionSlots {
    /// Slots left after accounting for the platforms of the tasks currently
    /// holding a lease.
    pub fn new(settings: &SchedulerSettings, active_platforms: &[&str]) -> Self {
        let mut active_total = 0usize;
        let mut active_per_platform: HashMap<&str, usize> = HashMap::new();
        for platform in active_platforms.iter().copied() {
            active_total += 1;
            *active_per_platform.entry(platform).or_default() += 1;
        }

        let platform_free = settings
            .platform_limits
            .iter()
            .map(|(platform, limit)| {
                let used = active_per_platform
                    .get(platform.as_str())
                    .copied()
                    .unwrap_or(0);
                (platform.clone(), limit.saturating_sub(used))
            })
            .collect();

        Self {
            global_free: settings.max_concurrent.saturating_sub(active_total),
            platform_free,
            start_budget: HashMap::new(),
        }
    }

    /// Cap how many tasks of `platform` may start in this pass.
    pub fn with_start_budget(mut self, platform: &str, budget: u32) -> Self {
        self.start_budget.insert(platform.to_string(), budget);
        self
    }

    pub fn is_full(&self) -> bool {
        self.global_free == 0
    }

    pub fn has_room_for(&self, platform: &str) -> bool {
        !self.is_full()
            && self.platform_free.get(platform).map_or(true, |free| *free > 0)
            && self.start_budget.get(platform).map_or(true, |left| *left > 0)
    }

    fn take(&mut self, platform: &str) {
        self.global_free -= 1;
        if let Some(free) = self.platform_free.get_mut(platform) {
            *free -= 1;
        }
        if let Some(left) = self.start_budget.get_mut(platform) {
            *left -= 1;
        }
    }
}

/// Walk `candidates` in queue order and pick every task that fits.
///
/// A task whose platform is saturated is skipped, not removed, so later
/// tasks of other platforms can still start.
pub fn select<'t>(candidates: &'t [Task], slots: &mut AdmissionSlots) -> Vec<&'t Task> {
    let mut admitted = Vec::new();
    for task in candidates {
        if slots.is_full() {
            break;
        }
        if slots.has_room_for(&task.platform) {
            slots.take(&task.platform);
            admitted.push(task);
        }
    }
    admitted
}
