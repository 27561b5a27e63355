//! Property tests for circadian phase and rhythm gating

mod common;

use chrono::{Duration as ChronoDuration, Timelike};
use common::{create_test_scheduler, local, FixedClock, ScriptedProcessor};
use hypnos_core::config::ResourceConfig;
use hypnos_core::resilience::ResourceMonitor;
use hypnos_core::{phase, CircadianPhase, HypnosConfig, ResilienceLayer, RhythmType};
use proptest::prelude::*;
use std::sync::Arc;

fn expected(hour: u32) -> CircadianPhase {
    match hour {
        6..=21 => CircadianPhase::WakeActive,
        22 => CircadianPhase::WakeQuiet,
        23 | 0 | 1 => CircadianPhase::LightSleep,
        2 | 3 => CircadianPhase::DeepSleep,
        _ => CircadianPhase::RemDominant,
    }
}

#[test]
fn test_every_hour_maps_to_exactly_one_phase() {
    let mut per_phase = std::collections::BTreeMap::new();
    for hour in 0..24 {
        *per_phase.entry(phase(hour).as_str()).or_insert(0) += 1;
    }
    assert_eq!(per_phase.get("wake_active"), Some(&16));
    assert_eq!(per_phase.get("wake_quiet"), Some(&1));
    assert_eq!(per_phase.get("light_sleep"), Some(&3));
    assert_eq!(per_phase.get("deep_sleep"), Some(&2));
    assert_eq!(per_phase.get("rem_dominant"), Some(&2));
}

proptest! {
    #[test]
    fn prop_phase_wraps_modulo_24(hour in 0u32..10_000) {
        prop_assert_eq!(phase(hour), expected(hour % 24));
    }

    #[test]
    fn prop_gated_rhythms_only_in_their_phase(minutes in 0i64..(7 * 24 * 60)) {
        let config = HypnosConfig::default();
        let monitor = ResourceMonitor::with_sampler(
            ResourceConfig::default(),
            Box::new(common::FixedSampler(common::quiet_usage())),
        );
        let resilience = Arc::new(ResilienceLayer::new(&config, None, monitor));
        let scheduler = create_test_scheduler(
            &config,
            resilience,
            Arc::new(ScriptedProcessor::default()),
            FixedClock::at(2024, 6, 2, 0, 0),
        );

        let now = local(2024, 6, 2, 0, 0) + ChronoDuration::minutes(minutes);
        let current = phase(now.hour());

        prop_assert_eq!(
            scheduler.should_run_at(RhythmType::Continuous, now),
            current == CircadianPhase::WakeActive
        );
        prop_assert_eq!(
            scheduler.should_run_at(RhythmType::DeepSleep, now),
            current == CircadianPhase::DeepSleep
        );
        if scheduler.should_run_at(RhythmType::RemSleep, now) {
            prop_assert_eq!(current, CircadianPhase::RemDominant);
        }
        // Fresh scheduler: consolidation cadences are always due
        prop_assert!(scheduler.should_run_at(RhythmType::ShortTerm, now));
        prop_assert!(scheduler.should_run_at(RhythmType::LongTerm, now));
    }
}
