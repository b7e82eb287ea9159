use proptest::prelude::*;
use proptest::{prop_assert, prop_assert_eq, proptest};
use rust_deferred::{combine, deferred, observe, CombinatorMode, Deferred, Future};

mod common;

#[derive(Debug, Clone, Copy)]
enum Settle {
    Complete(i32),
    Cancel,
}

fn settle_strategy() -> impl Strategy<Value = Settle> {
    prop_oneof![any::<i32>().prop_map(Settle::Complete), Just(Settle::Cancel)]
}

fn apply(d: &Deferred<i32>, action: Settle) {
    match action {
        Settle::Complete(v) => d.complete(v),
        Settle::Cancel => d.cancel(),
    }
}

proptest! {
    #[test]
    fn first_settlement_is_final(actions in prop::collection::vec(settle_strategy(), 1..8)) {
        let d = deferred::<i32>();
        let f = d.future();
        for action in &actions {
            apply(&d, *action);
        }

        prop_assert!(f.is_finished());
        match actions[0] {
            Settle::Complete(v) => {
                prop_assert!(!f.is_canceled());
                prop_assert_eq!(f.results(), vec![v]);
            }
            Settle::Cancel => {
                prop_assert!(f.is_canceled());
                prop_assert_eq!(f.result_count(), 0);
            }
        }
    }

    #[test]
    fn fail_fast_cancels_iff_any_canceled(
        actions in prop::collection::vec(settle_strategy(), 1..12),
        rotation in any::<usize>(),
    ) {
        let inputs: Vec<Deferred<i32>> = actions.iter().map(|_| deferred()).collect();
        let c = combine(CombinatorMode::FailFast);
        for d in &inputs {
            c.add(d.future());
        }

        // Settle in a pseudo-random rotation of the input order
        let start = rotation % inputs.len();
        let any_canceled = actions.iter().any(|a| matches!(a, Settle::Cancel));
        let mut saw_cancel = false;
        for step in 0..inputs.len() {
            let i = (start + step) % inputs.len();
            apply(&inputs[i], actions[i]);
            saw_cancel |= matches!(actions[i], Settle::Cancel);
            // Canceled as soon as the first cancel landed
            prop_assert_eq!(c.future().is_canceled(), saw_cancel);
        }

        prop_assert!(c.future().is_finished());
        prop_assert_eq!(c.future().is_canceled(), any_canceled);
    }

    #[test]
    fn all_settled_waits_for_every_input(actions in prop::collection::vec(settle_strategy(), 1..12)) {
        let inputs: Vec<Deferred<i32>> = actions.iter().map(|_| deferred()).collect();
        let c = combine(CombinatorMode::AllSettled);
        for d in &inputs {
            c.add(d.future());
        }

        for (i, (d, action)) in inputs.iter().zip(&actions).enumerate() {
            prop_assert!(c.future().is_running());
            prop_assert_eq!(c.future().progress_value(), i as i32);
            apply(d, *action);
        }

        let any_canceled = actions.iter().any(|a| matches!(a, Settle::Cancel));
        prop_assert!(c.future().is_finished());
        prop_assert_eq!(c.future().is_canceled(), any_canceled);
        prop_assert_eq!(c.future().progress_maximum(), actions.len() as i32);
    }

    #[test]
    fn flattening_is_transparent(action in settle_strategy(), depth in 1usize..4) {
        let direct = deferred::<i32>();
        let source = deferred::<i32>();
        direct.complete_with(source.future());

        // Wrap the source future `depth` times, then unwrap it again
        let mut observable = observe(source.future()).then(|f: Future<i32>| f);
        for _ in 1..depth {
            observable = observable.then(|f: Future<i32>| Future::ready(f)).flatten();
        }
        let nested = observable.flatten().future();

        apply(&source, action);
        prop_assert_eq!(nested.is_finished(), direct.future().is_finished());
        prop_assert_eq!(nested.is_canceled(), direct.future().is_canceled());
        prop_assert_eq!(nested.results(), direct.future().results());
    }
}
