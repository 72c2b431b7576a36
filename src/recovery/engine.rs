//! Recovery engine: picks a strategy for each reported error and
//! escalates when a strategy exhausts its attempts.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Where the error was attributed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorComponent {
    Network,
    Protocol,
    Entity,
    Render,
    Memory,
    Input,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub component: ErrorComponent,
    pub severity: ErrorSeverity,
    pub detail: String,
    pub at: Instant,
}

impl ErrorReport {
    pub fn new(component: ErrorComponent, severity: ErrorSeverity, detail: impl Into<String>) -> Self {
        Self {
            component,
            severity,
            detail: detail.into(),
            at: Instant::now(),
        }
    }
}

/// Strategies in increasing severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RecoveryStrategy {
    Immediate,
    ExponentialBackoff,
    FullResync,
    GracefulDegradation,
    UserIntervention,
}

impl RecoveryStrategy {
    /// The next strategy up the ladder, if any.
    pub fn promoted(self) -> Option<Self> {
        match self {
            RecoveryStrategy::Immediate => Some(RecoveryStrategy::ExponentialBackoff),
            RecoveryStrategy::ExponentialBackoff => Some(RecoveryStrategy::FullResync),
            RecoveryStrategy::FullResync => Some(RecoveryStrategy::GracefulDegradation),
            RecoveryStrategy::GracefulDegradation => Some(RecoveryStrategy::UserIntervention),
            RecoveryStrategy::UserIntervention => None,
        }
    }
}

/// A concrete recovery decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryPlan {
    pub strategy: RecoveryStrategy,
    /// Delay before acting; only backoff sets one.
    pub delay: Option<Duration>,
}

const RECENT_WINDOW: Duration = Duration::from_secs(300);
const RECENT_THRESHOLD: usize = 3;
const BACKOFF_ATTEMPT_CAP: u32 = 5;

pub struct RecoveryEngine {
    history: VecDeque<ErrorReport>,
    /// Consecutive failures per (component, strategy).
    attempts: HashMap<(ErrorComponent, RecoveryStrategy), u32>,
    /// Components already escalated past their base strategy.
    escalated: HashMap<ErrorComponent, RecoveryStrategy>,
}

impl RecoveryEngine {
    pub fn new() -> Self {
        Self {
            history: VecDeque::new(),
            attempts: HashMap::new(),
            escalated: HashMap::new(),
        }
    }

    pub fn recent_error_count(&self, component: ErrorComponent, now: Instant) -> usize {
        self.history
            .iter()
            .filter(|r| r.component == component && now.duration_since(r.at) < RECENT_WINDOW)
            .count()
    }

    /// Errors across all components within the recent window. Feeds the
    /// normalized error-rate input of the health score.
    pub fn recent_total_errors(&self, now: Instant) -> usize {
        self.history
            .iter()
            .filter(|r| now.duration_since(r.at) < RECENT_WINDOW)
            .count()
    }

    /// Decide how to react to one error.
    pub fn decide(&mut self, report: ErrorReport) -> RecoveryPlan {
        let now = report.at;
        self.history.push_back(report.clone());
        while self.history.len() > 256 {
            self.history.pop_front();
        }

        // Sticky escalation takes precedence.
        let mut strategy = if let Some(&escalated) = self.escalated.get(&report.component) {
            escalated
        } else if self.recent_error_count(report.component, now) >= RECENT_THRESHOLD {
            RecoveryStrategy::FullResync
        } else if report.severity == ErrorSeverity::Critical {
            RecoveryStrategy::FullResync
        } else if report.component == ErrorComponent::Network {
            RecoveryStrategy::ExponentialBackoff
        } else {
            match report.severity {
                ErrorSeverity::Low => RecoveryStrategy::Immediate,
                ErrorSeverity::Medium => RecoveryStrategy::ExponentialBackoff,
                ErrorSeverity::High | ErrorSeverity::Critical => RecoveryStrategy::FullResync,
            }
        };

        // A backoff strategy that ran out of attempts promotes before
        // ever being handed out again.
        if strategy == RecoveryStrategy::ExponentialBackoff {
            let attempts = self
                .attempts
                .get(&(report.component, strategy))
                .copied()
                .unwrap_or(0);
            if attempts >= BACKOFF_ATTEMPT_CAP {
                strategy = self.promote(report.component, strategy);
            }
        }

        let delay = if strategy == RecoveryStrategy::ExponentialBackoff {
            let attempts = self
                .attempts
                .get(&(report.component, strategy))
                .copied()
                .unwrap_or(0);
            Some(Duration::from_secs(1 << attempts.min(BACKOFF_ATTEMPT_CAP)))
        } else {
            None
        };

        info!(?strategy, component = ?report.component, detail = %report.detail, "recovery decision");
        RecoveryPlan { strategy, delay }
    }

    /// Record the outcome of an attempted strategy. A failure counts an
    /// attempt; exhaustion promotes to the next strategy up.
    pub fn report_outcome(
        &mut self,
        component: ErrorComponent,
        strategy: RecoveryStrategy,
        success: bool,
    ) {
        if success {
            self.attempts.remove(&(component, strategy));
            self.escalated.remove(&component);
            return;
        }

        let attempts = self.attempts.entry((component, strategy)).or_insert(0);
        *attempts += 1;
        let cap = match strategy {
            RecoveryStrategy::ExponentialBackoff => BACKOFF_ATTEMPT_CAP,
            _ => 1,
        };
        if *attempts >= cap {
            self.promote(component, strategy);
        }
    }

    fn promote(&mut self, component: ErrorComponent, from: RecoveryStrategy) -> RecoveryStrategy {
        match from.promoted() {
            Some(next) => {
                warn!(?component, ?from, ?next, "recovery strategy promoted");
                self.escalated.insert(component, next);
                self.attempts.remove(&(component, from));
                next
            }
            None => {
                // Nothing above user intervention.
                warn!(?component, "recovery exhausted; awaiting user");
                from
            }
        }
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.attempts.clear();
        self.escalated.clear();
    }
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(component: ErrorComponent, severity: ErrorSeverity) -> ErrorReport {
        ErrorReport::new(component, severity, "test")
    }

    #[test]
    fn test_severity_mapping() {
        let mut engine = RecoveryEngine::new();
        assert_eq!(
            engine.decide(report(ErrorComponent::Entity, ErrorSeverity::Low)).strategy,
            RecoveryStrategy::Immediate
        );
        let mut engine = RecoveryEngine::new();
        assert_eq!(
            engine.decide(report(ErrorComponent::Entity, ErrorSeverity::Medium)).strategy,
            RecoveryStrategy::ExponentialBackoff
        );
        let mut engine = RecoveryEngine::new();
        assert_eq!(
            engine.decide(report(ErrorComponent::Entity, ErrorSeverity::High)).strategy,
            RecoveryStrategy::FullResync
        );
    }

    #[test]
    fn test_critical_always_resyncs() {
        let mut engine = RecoveryEngine::new();
        assert_eq!(
            engine.decide(report(ErrorComponent::Render, ErrorSeverity::Critical)).strategy,
            RecoveryStrategy::FullResync
        );
    }

    #[test]
    fn test_network_backs_off_with_doubling_delay() {
        let mut engine = RecoveryEngine::new();
        let plan = engine.decide(report(ErrorComponent::Network, ErrorSeverity::Low));
        assert_eq!(plan.strategy, RecoveryStrategy::ExponentialBackoff);
        assert_eq!(plan.delay, Some(Duration::from_secs(1)));

        engine.report_outcome(ErrorComponent::Network, RecoveryStrategy::ExponentialBackoff, false);
        let plan = engine.decide(report(ErrorComponent::Network, ErrorSeverity::Low));
        assert_eq!(plan.strategy, RecoveryStrategy::ExponentialBackoff);
        assert_eq!(plan.delay, Some(Duration::from_secs(2)));

        // A third recent error from the same component escalates.
        let plan = engine.decide(report(ErrorComponent::Network, ErrorSeverity::Low));
        assert_eq!(plan.strategy, RecoveryStrategy::FullResync);
    }

    #[test]
    fn test_repeat_errors_escalate_to_resync() {
        let mut engine = RecoveryEngine::new();
        engine.decide(report(ErrorComponent::Entity, ErrorSeverity::Low));
        engine.decide(report(ErrorComponent::Entity, ErrorSeverity::Low));
        let plan = engine.decide(report(ErrorComponent::Entity, ErrorSeverity::Low));
        assert_eq!(plan.strategy, RecoveryStrategy::FullResync);
    }

    #[test]
    fn test_exhaustion_promotes_up_the_ladder() {
        let mut engine = RecoveryEngine::new();
        engine.report_outcome(ErrorComponent::Entity, RecoveryStrategy::FullResync, false);
        // Escalation is sticky for the component.
        let plan = engine.decide(report(ErrorComponent::Entity, ErrorSeverity::Low));
        assert_eq!(plan.strategy, RecoveryStrategy::GracefulDegradation);

        engine.report_outcome(ErrorComponent::Entity, RecoveryStrategy::GracefulDegradation, false);
        let plan = engine.decide(report(ErrorComponent::Entity, ErrorSeverity::Low));
        assert_eq!(plan.strategy, RecoveryStrategy::UserIntervention);

        // Nothing promotes past user intervention.
        assert_eq!(RecoveryStrategy::UserIntervention.promoted(), None);
    }

    #[test]
    fn test_success_clears_escalation() {
        let mut engine = RecoveryEngine::new();
        engine.report_outcome(ErrorComponent::Entity, RecoveryStrategy::FullResync, false);
        engine.report_outcome(ErrorComponent::Entity, RecoveryStrategy::GracefulDegradation, true);
        let plan = engine.decide(report(ErrorComponent::Entity, ErrorSeverity::Low));
        assert_eq!(plan.strategy, RecoveryStrategy::Immediate);
    }
}
