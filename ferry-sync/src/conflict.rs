//! Conflict resolution between diverging copies of one module.

use std::cmp::Ordering;

use ferry_core::{ConflictPolicy, ConflictRecord, Resolution};

/// Pure and deterministic: the same conflict and policy always yield the
/// same record.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn resolve(&self, conflict: &ConflictRecord, policy: ConflictPolicy) -> ConflictRecord {
        let mut resolved = conflict.clone();
        let (resolution, winner) = match policy {
            ConflictPolicy::SourceWins => (Resolution::SourceWins, Some(&conflict.source_record)),
            ConflictPolicy::TargetWins => (Resolution::TargetWins, Some(&conflict.target_record)),
            ConflictPolicy::Manual | ConflictPolicy::Skip => (Resolution::Unresolved, None),
            ConflictPolicy::LatestUpdate => {
                match conflict
                    .source_record
                    .updated_at
                    .cmp(&conflict.target_record.updated_at)
                {
                    Ordering::Greater => (Resolution::LatestUpdate, Some(&conflict.source_record)),
                    Ordering::Less => (Resolution::LatestUpdate, Some(&conflict.target_record)),
                    Ordering::Equal => (Resolution::Unresolved, None),
                }
            }
        };
        resolved.resolution = resolution;
        resolved.resolved_record = winner.cloned();
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use ferry_core::{ModuleRecord, ModuleStatus, Payload};
    use rstest::rstest;
    use serde_json::json;

    fn pair(source_newer_by: i64) -> ConflictRecord {
        let now = Utc::now();
        let mut a = Payload::new();
        a.insert("v".into(), json!("source"));
        let mut b = Payload::new();
        b.insert("v".into(), json!("target"));
        ConflictRecord::new(
            ModuleRecord::new("dao", "1.1.0", ModuleStatus::Testing, a)
                .with_updated_at(now + Duration::seconds(source_newer_by)),
            ModuleRecord::new("dao", "1.0.0", ModuleStatus::ProductionReady, b).with_updated_at(now),
        )
    }

    #[rstest]
    #[case(ConflictPolicy::SourceWins, Resolution::SourceWins, Some("source"))]
    #[case(ConflictPolicy::TargetWins, Resolution::TargetWins, Some("target"))]
    #[case(ConflictPolicy::Manual, Resolution::Unresolved, None)]
    #[case(ConflictPolicy::Skip, Resolution::Unresolved, None)]
    fn fixed_policies(
        #[case] policy: ConflictPolicy,
        #[case] expected: Resolution,
        #[case] winner: Option<&str>,
    ) {
        // The target is older here; fixed policies must ignore timestamps.
        let out = ConflictResolver.resolve(&pair(60), policy);
        assert_eq!(out.resolution, expected);
        assert_eq!(
            out.resolved_record.as_ref().map(|r| r.payload["v"].as_str().unwrap()),
            winner
        );
    }

    #[rstest]
    #[case(30, Resolution::LatestUpdate, Some("source"))]
    #[case(-30, Resolution::LatestUpdate, Some("target"))]
    #[case(0, Resolution::Unresolved, None)]
    fn latest_update_is_opt_in_and_ties_stay_unresolved(
        #[case] skew: i64,
        #[case] expected: Resolution,
        #[case] winner: Option<&str>,
    ) {
        let out = ConflictResolver.resolve(&pair(skew), ConflictPolicy::LatestUpdate);
        assert_eq!(out.resolution, expected);
        assert_eq!(
            out.resolved_record.as_ref().map(|r| r.payload["v"].as_str().unwrap()),
            winner
        );
    }

    #[test]
    fn resolution_is_deterministic() {
        let conflict = pair(5);
        for policy in [
            ConflictPolicy::SourceWins,
            ConflictPolicy::TargetWins,
            ConflictPolicy::Manual,
            ConflictPolicy::Skip,
            ConflictPolicy::LatestUpdate,
        ] {
            let a = ConflictResolver.resolve(&conflict, policy);
            let b = ConflictResolver.resolve(&conflict, policy);
            assert_eq!(a, b, "{policy}");
            assert_eq!(a.detected_at, conflict.detected_at);
        }
    }
}
