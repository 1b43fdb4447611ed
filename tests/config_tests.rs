use sn_sweep::config::{AngleAggregationType, SchedulingAlgorithm, SweepConfig};
use sn_sweep::sweep_error::SweepError;

#[test]
fn json_round_trip() {
    let cfg = SweepConfig {
        scheduling_algorithm: SchedulingAlgorithm::FirstInFirstOut,
        angle_aggregation: AngleAggregationType::Polar,
        allow_cycles: false,
        eager_limit_bytes: 4096,
        num_group_subsets: 3,
    };
    let text = serde_json::to_string(&cfg).unwrap();
    let back: SweepConfig = serde_json::from_str(&text).unwrap();
    assert_eq!(back, cfg);
}

#[test]
fn missing_fields_take_defaults() {
    let cfg: SweepConfig = serde_json::from_str(r#"{ "num_group_subsets": 2 }"#).unwrap();
    assert_eq!(cfg.num_group_subsets, 2);
    assert_eq!(cfg.scheduling_algorithm, SchedulingAlgorithm::DepthOfGraph);
    assert_eq!(cfg.angle_aggregation, AngleAggregationType::Single);
    assert!(cfg.allow_cycles);
    assert_eq!(cfg.eager_limit_bytes, 32000);
}

#[test]
fn tiny_eager_limit_is_rejected() {
    let cfg = SweepConfig {
        eager_limit_bytes: 4,
        ..Default::default()
    };
    assert!(matches!(cfg.validate(), Err(SweepError::Config(_))));
}
