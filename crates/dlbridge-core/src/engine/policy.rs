//! Redirect policy translation
//!
//! Maps the caller's two-valued decision onto the modern generation's native
//! redirect policy vocabulary and back. The legacy generation never asks for
//! a decision, so it has no vocabulary here.

use crate::error::{DownloadError, Result};
use dlbridge_types::RedirectDecision;

/// Native redirect policy values of the modern download API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum ModernRedirectPolicy {
    Cancel = 0,
    Allow = 1,
}

impl ModernRedirectPolicy {
    pub fn raw(self) -> i64 {
        self as i64
    }

    pub fn from_raw(raw: i64) -> Result<Self> {
        match raw {
            0 => Ok(ModernRedirectPolicy::Cancel),
            1 => Ok(ModernRedirectPolicy::Allow),
            other => Err(DownloadError::RedirectPolicyUnmapped(other)),
        }
    }
}

pub struct RedirectPolicy;

impl RedirectPolicy {
    pub fn to_native(decision: RedirectDecision) -> ModernRedirectPolicy {
        match decision {
            RedirectDecision::Allow => ModernRedirectPolicy::Allow,
            RedirectDecision::Cancel => ModernRedirectPolicy::Cancel,
        }
    }

    pub fn from_native(policy: ModernRedirectPolicy) -> RedirectDecision {
        match policy {
            ModernRedirectPolicy::Allow => RedirectDecision::Allow,
            ModernRedirectPolicy::Cancel => RedirectDecision::Cancel,
        }
    }

    /// Decode a raw value received from the engine side
    pub fn decision_from_raw(raw: i64) -> Result<RedirectDecision> {
        ModernRedirectPolicy::from_raw(raw).map(Self::from_native)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_is_total_both_ways() {
        for decision in [RedirectDecision::Allow, RedirectDecision::Cancel] {
            let native = RedirectPolicy::to_native(decision);
            assert_eq!(RedirectPolicy::from_native(native), decision);
            assert_eq!(RedirectPolicy::decision_from_raw(native.raw()).unwrap(), decision);
        }
    }

    #[test]
    fn test_raw_values() {
        assert_eq!(ModernRedirectPolicy::Cancel.raw(), 0);
        assert_eq!(ModernRedirectPolicy::Allow.raw(), 1);
    }

    #[test]
    fn test_unknown_raw_value_is_unmapped() {
        match RedirectPolicy::decision_from_raw(2) {
            Err(DownloadError::RedirectPolicyUnmapped(2)) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }
}
