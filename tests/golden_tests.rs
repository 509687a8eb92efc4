//! Golden tests - fixture-based tests that lock expected behavior
//!
//! These tests use JSON fixtures to verify that critical functions produce
//! expected outputs. Any change in behavior will cause these tests to fail,
//! signaling a potential breaking change.
//!
//! Run with: cargo test --test golden_tests

use serde::Deserialize;
use std::fs;

fn fixture(name: &str) -> String {
    let path = format!("{}/tests/fixtures/{}", env!("CARGO_MANIFEST_DIR"), name);
    fs::read_to_string(&path).unwrap_or_else(|e| panic!("Failed to read {}: {}", path, e))
}

// ============================================================================
// KEY NORMALIZATION GOLDEN TESTS
// ============================================================================

mod key_golden {
    use super::*;
    use ccjk_sync::sync::normalize_key;

    #[derive(Debug, Deserialize)]
    struct TestCase {
        name: String,
        input: String,
        expected: String,
    }

    #[derive(Debug, Deserialize)]
    struct Fixture {
        test_cases: Vec<TestCase>,
    }

    #[test]
    fn test_key_normalization_golden() {
        let fixture: Fixture = serde_json::from_str(&fixture("key_normalization.json"))
            .expect("Failed to parse fixture JSON");

        for case in fixture.test_cases {
            assert_eq!(
                normalize_key(&case.input),
                case.expected,
                "Case '{}': normalized key mismatch",
                case.name
            );
        }
    }
}

// ============================================================================
// RETRY BACKOFF GOLDEN TESTS
// ============================================================================

mod backoff_golden {
    use super::*;
    use ccjk_sync::sync::backoff_delay;
    use std::time::Duration;

    #[derive(Debug, Deserialize)]
    struct Step {
        attempt: u32,
        delay_ms: u64,
    }

    #[derive(Debug, Deserialize)]
    struct Fixture {
        base_delay_ms: u64,
        schedule: Vec<Step>,
    }

    #[test]
    fn test_backoff_schedule_golden() {
        let fixture: Fixture = serde_json::from_str(&fixture("backoff_schedule.json"))
            .expect("Failed to parse fixture JSON");

        for step in fixture.schedule {
            assert_eq!(
                backoff_delay(fixture.base_delay_ms, step.attempt),
                Duration::from_millis(step.delay_ms),
                "attempt {}",
                step.attempt
            );
        }
    }
}

// ============================================================================
// CONFLICT RESOLUTION GOLDEN TESTS
// ============================================================================

mod resolution_golden {
    use super::*;
    use ccjk_sync::sync::{ConflictDetector, ConflictResolver, ResolveOutcome};
    use ccjk_sync::types::{
        Change, ChangeSource, ChangeType, ConflictStrategy, ItemType, Resolution, SyncConflict,
        SyncableItem,
    };
    use chrono::{Duration, TimeZone, Utc};

    #[derive(Debug, Deserialize)]
    struct Side {
        content: String,
        version: u64,
        offset_secs: i64,
    }

    #[derive(Debug, Deserialize)]
    struct Expected {
        resolution: Resolution,
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        json: Option<serde_json::Value>,
        version: u64,
    }

    #[derive(Debug, Deserialize)]
    struct TestCase {
        name: String,
        strategy: ConflictStrategy,
        local: Side,
        remote: Side,
        expected: Expected,
    }

    #[derive(Debug, Deserialize)]
    struct Fixture {
        test_cases: Vec<TestCase>,
    }

    fn change(side: &Side, source: ChangeSource) -> Change {
        let epoch = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let mut item = SyncableItem::new("settings", ItemType::Settings, "settings", &side.content)
            .modified_at(epoch + Duration::seconds(side.offset_secs));
        item.version = side.version;
        Change::new(ChangeType::Update, item, source)
    }

    #[test]
    fn test_conflict_resolution_golden() {
        let fixture: Fixture = serde_json::from_str(&fixture("conflict_resolution.json"))
            .expect("Failed to parse fixture JSON");
        let detector = ConflictDetector::new();
        let resolver = ConflictResolver::new();

        for case in fixture.test_cases {
            let local = change(&case.local, ChangeSource::Local);
            let remote = change(&case.remote, ChangeSource::Remote);
            let info = detector
                .detect(None, &local, &remote)
                .unwrap_or_else(|| panic!("Case '{}': expected a conflict", case.name));
            let conflict = SyncConflict::new(local, remote);

            let (resolution, item) = match resolver.resolve(&conflict, &info, case.strategy, None)
            {
                ResolveOutcome::Resolved { resolution, item } => (resolution, item),
                ResolveOutcome::Manual { reason } => {
                    panic!("Case '{}': unexpected manual ({})", case.name, reason)
                }
            };

            assert_eq!(resolution, case.expected.resolution, "Case '{}'", case.name);
            assert_eq!(item.version, case.expected.version, "Case '{}'", case.name);
            assert!(item.verify_hash(), "Case '{}': stale hash", case.name);
            if let Some(content) = &case.expected.content {
                assert_eq!(&item.content, content, "Case '{}'", case.name);
            }
            if let Some(json) = &case.expected.json {
                let actual: serde_json::Value = serde_json::from_str(&item.content).unwrap();
                assert_eq!(&actual, json, "Case '{}'", case.name);
            }
        }
    }
}
