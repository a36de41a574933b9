//! Resource assessor: admission control before the pool commits to a
//! worker count.
//!
//! The assessment itself is a pure function over a `SystemResources`
//! reading, so policy can be tested without touching the live host.
//! It is advisory, but the pool never silently exceeds its suggestion.

use std::time::Duration;

use serde::Serialize;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};

/// Estimated resident footprint of one worker (browser session plus
/// cloned profile).
const ESTIMATED_RAM_PER_WORKER: u64 = 512 * 1024 * 1024;

/// Workers tolerated per CPU before the host is considered oversubscribed.
const CPU_LOAD_FACTOR: f64 = 2.0;

/// Below this much total RAM the host gets no medium-risk leniency.
const SMALL_MACHINE_TOTAL_GB: f64 = 6.0;

/// Below this much available RAM the host is critically constrained.
const CRITICAL_AVAILABLE_GB: f64 = 0.5;

/// A request within this multiple of the safe limit may pass at medium
/// risk on a comfortable host.
const MEDIUM_HEADROOM: f64 = 1.5;

/// High-risk requests are capped at this multiple of the safe limit,
/// or at the safe limit itself when available RAM is critical.
const HIGH_CAP_MULTIPLE: usize = 2;

/// Startup spacing between workers, to avoid simultaneous resource
/// spikes while browser sessions come up.
pub const STAGGER_LOW: Duration = Duration::from_millis(500);
pub const STAGGER_ELEVATED: Duration = Duration::from_secs(2);

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Host reading taken at call time.
#[derive(Debug, Clone, Serialize)]
pub struct SystemResources {
    pub cpu_count: usize,
    pub cpu_usage_percent: f32,
    pub total_ram: u64,
    pub available_ram: u64,
}

impl SystemResources {
    pub fn total_gb(&self) -> f64 {
        self.total_ram as f64 / GIB
    }

    pub fn available_gb(&self) -> f64 {
        self.available_ram as f64 / GIB
    }
}

/// How aggressively the requested worker count should be throttled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssessmentReport {
    pub requested: usize,
    pub suggested: usize,
    pub safe_limit: usize,
    pub ram_ceiling: usize,
    pub cpu_ceiling: usize,
    pub risk: RiskLevel,
    pub throttled: bool,
    pub stagger_delay: Duration,
    pub resources: SystemResources,
}

/// Read host CPU and memory state. Blocks briefly (sysinfo needs two
/// CPU refreshes a minimum interval apart for a meaningful percentage),
/// so call it from a blocking context.
pub fn get_system_resources() -> SystemResources {
    let mut sys = System::new_with_specifics(
        RefreshKind::new()
            .with_cpu(CpuRefreshKind::everything())
            .with_memory(MemoryRefreshKind::everything()),
    );
    std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    SystemResources {
        cpu_count: sys.cpus().len(),
        cpu_usage_percent: sys.global_cpu_usage(),
        total_ram: sys.total_memory(),
        available_ram: sys.available_memory(),
    }
}

/// Sample the host and assess `requested` workers against it.
/// `min_free_ram` is kept off-limits when computing the RAM ceiling.
pub fn calculate_safe_worker_count(
    requested: usize,
    min_free_ram: u64,
) -> (usize, AssessmentReport) {
    let resources = get_system_resources();
    assess(resources, requested, min_free_ram)
}

/// Pure assessment over a host reading.
///
/// The safe limit is the smaller of a RAM-derived ceiling
/// (`usable / estimated-per-worker`) and a CPU-derived ceiling
/// (`cpu_count * load factor`). A request under the limit passes at low
/// risk; a modest overshoot on a comfortable host passes at medium
/// risk; anything else is capped and classified high.
pub fn assess(
    resources: SystemResources,
    requested: usize,
    min_free_ram: u64,
) -> (usize, AssessmentReport) {
    let usable_ram = resources.available_ram.saturating_sub(min_free_ram);
    let ram_ceiling = ((usable_ram / ESTIMATED_RAM_PER_WORKER) as usize).max(1);
    let cpu_ceiling = ((resources.cpu_count as f64 * CPU_LOAD_FACTOR) as usize).max(1);
    let safe_limit = ram_ceiling.min(cpu_ceiling);

    let critical = resources.available_gb() < CRITICAL_AVAILABLE_GB;
    let comfortable = resources.total_gb() >= SMALL_MACHINE_TOTAL_GB;

    let (suggested, risk) = if requested <= safe_limit {
        (requested, RiskLevel::Low)
    } else if !critical && comfortable && requested as f64 <= safe_limit as f64 * MEDIUM_HEADROOM {
        (requested, RiskLevel::Medium)
    } else {
        let cap = if critical {
            safe_limit
        } else {
            safe_limit * HIGH_CAP_MULTIPLE
        };
        (requested.min(cap.max(1)), RiskLevel::High)
    };

    let report = AssessmentReport {
        requested,
        suggested,
        safe_limit,
        ram_ceiling,
        cpu_ceiling,
        risk,
        throttled: suggested < requested,
        stagger_delay: if risk == RiskLevel::Low {
            STAGGER_LOW
        } else {
            STAGGER_ELEVATED
        },
        resources,
    };
    (suggested, report)
}

/// Operator-facing summary of an assessment. Pure formatting.
pub fn get_risk_message(report: &AssessmentReport) -> String {
    let verdict = match (report.risk, report.throttled) {
        (RiskLevel::Low, _) => "request approved".to_string(),
        (RiskLevel::Medium, _) => "request approved above the safe limit; watch memory".to_string(),
        (RiskLevel::High, true) => format!(
            "request throttled from {} to {} workers",
            report.requested, report.suggested
        ),
        (RiskLevel::High, false) => "request at the high-risk cap".to_string(),
    };
    format!(
        "resource assessment: {:?} risk, {} (requested {}, suggested {}, safe limit {}, \
         {} cpus at {:.0}%, {:.1} GiB free of {:.1} GiB, stagger {}ms)",
        report.risk,
        verdict,
        report.requested,
        report.suggested,
        report.safe_limit,
        report.resources.cpu_count,
        report.resources.cpu_usage_percent,
        report.resources.available_gb(),
        report.resources.total_gb(),
        report.stagger_delay.as_millis(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const GB: u64 = 1024 * 1024 * 1024;

    fn host(cpu_count: usize, total_gb: u64, available_gb_milli: u64) -> SystemResources {
        SystemResources {
            cpu_count,
            cpu_usage_percent: 20.0,
            total_ram: total_gb * GB,
            available_ram: available_gb_milli * GB / 1000,
        }
    }

    #[rstest]
    // Fits under both ceilings: approved as-is at low risk.
    #[case(host(8, 16, 12_000), 4, RiskLevel::Low, 4)]
    // Modest overshoot of the CPU ceiling on a comfortable host.
    #[case(host(4, 16, 12_000), 10, RiskLevel::Medium, 10)]
    // Large overshoot: capped to twice the safe limit.
    #[case(host(2, 16, 12_000), 20, RiskLevel::High, 8)]
    // Small machine gets no medium-risk leniency.
    #[case(host(2, 4, 3_000), 10, RiskLevel::High, 8)]
    fn classification(
        #[case] resources: SystemResources,
        #[case] requested: usize,
        #[case] risk: RiskLevel,
        #[case] suggested: usize,
    ) {
        let (got, report) = assess(resources, requested, GB);
        assert_eq!(report.risk, risk);
        assert_eq!(got, suggested);
        assert_eq!(report.suggested, suggested);
        assert_eq!(report.throttled, suggested < requested);
    }

    #[test]
    fn medium_branch_allows_suggestion_at_or_above_safe_limit() {
        let (suggested, report) = assess(host(4, 16, 12_000), 10, GB);
        assert_eq!(report.safe_limit, 8);
        assert!(suggested >= report.safe_limit);
        assert!(!report.throttled);
        assert_eq!(report.stagger_delay, STAGGER_ELEVATED);
    }

    #[test]
    fn critically_low_ram_is_high_risk_with_strict_cap() {
        let resources = host(4, 16, 400); // 0.4 GiB available
        let (suggested, report) = assess(resources, 10, GB);
        assert_eq!(report.risk, RiskLevel::High);
        assert!(suggested < 10);
        // Strict multiple: capped at the safe limit itself.
        assert_eq!(suggested, report.safe_limit);
        assert_eq!(report.stagger_delay, STAGGER_ELEVATED);
    }

    #[test]
    fn low_risk_uses_the_short_stagger() {
        let (_, report) = assess(host(8, 16, 12_000), 2, GB);
        assert_eq!(report.stagger_delay, STAGGER_LOW);
    }

    #[test]
    fn risk_message_names_the_numbers() {
        let (_, report) = assess(host(2, 16, 12_000), 20, GB);
        let msg = get_risk_message(&report);
        assert!(msg.contains("requested 20"));
        assert!(msg.contains(&format!("suggested {}", report.suggested)));
        assert!(msg.contains("High"));
    }

    #[test]
    fn live_reading_is_plausible() {
        let resources = get_system_resources();
        assert!(resources.cpu_count >= 1);
        assert!(resources.total_ram > 0);
        assert!(resources.available_ram <= resources.total_ram);
    }
}
