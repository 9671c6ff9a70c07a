use std::collections::HashSet;
use std::time::Duration;

use proptest::prelude::*;

use page_channel::BackoffConfig;
use page_channel::dedup::{SeenKey, SeenWindow};
use page_channel::message::{self, Message, RequestId};

// --- Backoff schedule ---

fn arb_backoff() -> impl Strategy<Value = BackoffConfig> {
    (1u64..500, 1.0f64..4.0, 0u32..40, 1u64..10_000).prop_map(|(initial, factor, steps, max)| {
        BackoffConfig {
            initial: Duration::from_millis(initial),
            factor,
            steps,
            max: Duration::from_millis(max),
            fallback: None,
        }
    })
}

proptest! {
    #[test]
    fn backoff_yields_exactly_steps_draws(config in arb_backoff()) {
        let draws: Vec<Duration> = config.start().collect();
        prop_assert_eq!(draws.len(), config.steps as usize);
    }

    #[test]
    fn backoff_never_exceeds_max(config in arb_backoff()) {
        for delay in config.start() {
            prop_assert!(delay <= config.max);
        }
    }

    #[test]
    fn backoff_is_nondecreasing(config in arb_backoff()) {
        let draws: Vec<Duration> = config.start().collect();
        for pair in draws.windows(2) {
            prop_assert!(pair[0] <= pair[1], "{:?} then {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn backoff_fallback_repeats(config in arb_backoff(), fallback in 1u64..5_000) {
        let config = BackoffConfig { fallback: Some(Duration::from_millis(fallback)), ..config };
        let mut backoff = config.start();
        for _ in 0..config.steps {
            prop_assert!(backoff.next().is_some());
        }
        for _ in 0..3 {
            prop_assert_eq!(backoff.next(), Some(Duration::from_millis(fallback)));
        }
    }
}

// --- Duplicate window ---

fn arb_key() -> impl Strategy<Value = SeenKey> {
    prop_oneof![
        (0u64..32).prop_map(|n| SeenKey::Request(RequestId::Number(n))),
        (0u64..32).prop_map(|n| SeenKey::Response(RequestId::Number(n))),
        "[a-d]{1,2}".prop_map(|s| SeenKey::Request(RequestId::Text(s))),
    ]
}

proptest! {
    #[test]
    fn first_occurrence_is_accepted_repeats_are_not(keys in prop::collection::vec(arb_key(), 0..200)) {
        // Window larger than the input, so nothing is evicted
        let mut window = SeenWindow::with_limits(1024, Duration::from_secs(300));
        let mut reference = HashSet::new();
        for key in keys {
            prop_assert_eq!(window.insert(key.clone()), reference.insert(key));
        }
        prop_assert_eq!(window.len(), reference.len());
    }

    #[test]
    fn window_respects_capacity(keys in prop::collection::vec(arb_key(), 0..200), cap in 1usize..16) {
        let mut window = SeenWindow::with_limits(cap, Duration::from_secs(300));
        for key in keys {
            window.insert(key);
            prop_assert!(window.len() <= cap);
        }
    }
}

// --- Wire codec ---

proptest! {
    #[test]
    fn decode_never_panics(frame in ".{0,256}") {
        let _ = message::decode(&frame);
    }

    #[test]
    fn notifications_survive_the_codec(method in "[a-z][a-z-]{0,20}", n in any::<i64>()) {
        let sent = Message::notification(method, Some(serde_json::json!({ "n": n })));
        let frame = message::encode(&sent).unwrap();
        prop_assert_eq!(message::decode(&frame).unwrap(), sent);
    }
}
