use std::time::SystemTime;

/// Threat severity assigned by a module's analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ThreatLevel {
    /// Request appears safe. No action needed.
    Safe,
    /// Slightly suspicious. Log and monitor.
    Low,
    /// Suspicious patterns. May warrant a challenge.
    Medium,
    /// Likely malicious. Should be blocked or challenged.
    High,
    /// Confirmed malicious. Must be blocked immediately.
    Critical,
}

/// What the engine should do about a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Let the request through.
    Allow,
    /// Allow but log a warning.
    Log,
    /// Respond with a CAPTCHA or crypto challenge.
    Challenge,
    /// Slow down the client.
    Throttle,
    /// Reject the request.
    Block,
}

/// A module's classification of a single event.
#[derive(Debug, Clone)]
pub struct ThreatVerdict {
    pub level: ThreatLevel,
    pub reason: String,
    /// Which module produced this verdict.
    pub module_id: String,
    pub recommended_action: Action,
    /// What to block: an IP, user id, fingerprint key or synthetic key.
    pub target_identifier: Option<String>,
    /// How long to block, in seconds. 0 means permanent for Block verdicts.
    pub block_duration_secs: u64,
    pub timestamp: SystemTime,
}

impl ThreatVerdict {
    fn new(
        level: ThreatLevel,
        reason: impl Into<String>,
        module_id: impl Into<String>,
        action: Action,
        target: Option<String>,
        block_duration_secs: u64,
    ) -> Self {
        Self {
            level,
            reason: reason.into(),
            module_id: module_id.into(),
            recommended_action: action,
            target_identifier: target,
            block_duration_secs,
            timestamp: SystemTime::now(),
        }
    }

    pub fn safe(module_id: impl Into<String>) -> Self {
        Self::new(
            ThreatLevel::Safe,
            "No threat detected",
            module_id,
            Action::Allow,
            None,
            0,
        )
    }

    pub fn suspicious(
        module_id: impl Into<String>,
        reason: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self::new(
            ThreatLevel::Medium,
            reason,
            module_id,
            Action::Log,
            Some(target.into()),
            0,
        )
    }

    pub fn challenge(
        module_id: impl Into<String>,
        reason: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self::new(
            ThreatLevel::High,
            reason,
            module_id,
            Action::Challenge,
            Some(target.into()),
            0,
        )
    }

    pub fn throttle(
        module_id: impl Into<String>,
        reason: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self::new(
            ThreatLevel::High,
            reason,
            module_id,
            Action::Throttle,
            Some(target.into()),
            0,
        )
    }

    pub fn block(
        module_id: impl Into<String>,
        reason: impl Into<String>,
        target: impl Into<String>,
        duration_secs: u64,
    ) -> Self {
        Self::new(
            ThreatLevel::Critical,
            reason,
            module_id,
            Action::Block,
            Some(target.into()),
            duration_secs,
        )
    }

    /// Anything above Low counts as a threat.
    pub fn is_threat(&self) -> bool {
        self.level != ThreatLevel::Safe && self.level != ThreatLevel::Low
    }

    pub fn should_block(&self) -> bool {
        self.recommended_action == Action::Block
    }
}
