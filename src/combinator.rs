//! N-way combinator
//!
//! `combine(mode)` builds a [`Combinator`]: futures of any result type are
//! added to it and its own `Future<()>` settles according to the mode.
//!
//! - [`CombinatorMode::FailFast`]: cancels as soon as one added future is
//!   canceled, completes once all of them completed.
//! - [`CombinatorMode::AllSettled`]: waits for every added future, then
//!   completes, or cancels if any of them was canceled.
//!
//! Each added future contributes one unit of progress: the combined future's
//! progress range is `(0, added)` and its value is the number settled so far.
//!
//! Adding to a combinator that already settled is a no-op. Clones share the
//! same state; once every handle is dropped, the combined future settles from
//! the futures added so far, and a combinator nothing was ever added to
//! cancels.

use std::fmt;
use std::ops::Shl;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::deferred::{Deferred, DeferredCore, Hold};
use crate::future::{Future, Outcome};
use crate::observable::{observe, Observable};

/// Policy deciding how a [`Combinator`] settles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CombinatorMode {
    /// Cancel on the first canceled constituent
    #[default]
    FailFast,
    /// Wait for every constituent before settling
    AllSettled,
}

/// Create a combinator with the given mode
pub fn combine(mode: CombinatorMode) -> Combinator {
    Combinator::new(mode)
}

#[derive(Debug, Default)]
struct Counters {
    count: usize,
    settled: usize,
    any_canceled: bool,
    resolved: bool,
}

enum Decision {
    Complete,
    Cancel,
}

struct Combined {
    core: Arc<DeferredCore<()>>,
    mode: CombinatorMode,
    counters: Mutex<Counters>,
}

impl Combined {
    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_settled(&self, canceled: bool) {
        let (settled, decision) = {
            let mut counters = self.counters();
            if counters.resolved {
                return;
            }
            counters.settled += 1;
            counters.any_canceled |= canceled;

            let decision = if counters.any_canceled && self.mode == CombinatorMode::FailFast {
                Some(Decision::Cancel)
            } else if counters.settled == counters.count {
                if counters.any_canceled {
                    Some(Decision::Cancel)
                } else {
                    Some(Decision::Complete)
                }
            } else {
                None
            };
            counters.resolved = decision.is_some();
            (counters.settled, decision)
        };

        self.core.set_progress_value(settled as i32);
        match decision {
            Some(Decision::Complete) => {
                tracing::trace!(settled, "combinator completed");
                self.core.complete(());
            }
            Some(Decision::Cancel) => {
                tracing::trace!(settled, "combinator canceled");
                self.core.cancel();
            }
            None => {}
        }
    }
}

/// Shared by all clones of a combinator
struct Owner {
    combined: Arc<Combined>,
    _hold: Hold<()>,
}

/// Aggregates many futures into one settle decision.
///
/// ```rust
/// use rust_deferred::{combine, deferred, CombinatorMode};
///
/// let a = deferred::<i32>();
/// let b = deferred::<String>();
///
/// let all = combine(CombinatorMode::AllSettled);
/// all.add(a.future()).add(b.future());
///
/// b.cancel();
/// assert!(all.future().is_running());
/// a.complete(1);
/// assert!(all.future().is_canceled());
/// assert_eq!(all.future().progress_value(), 2);
/// ```
#[derive(Clone)]
pub struct Combinator {
    owner: Arc<Owner>,
}

impl Combinator {
    pub fn new(mode: CombinatorMode) -> Self {
        let core = DeferredCore::new();
        let hold = core.hold();
        Combinator {
            owner: Arc::new(Owner {
                combined: Arc::new(Combined {
                    core,
                    mode,
                    counters: Mutex::new(Counters::default()),
                }),
                _hold: hold,
            }),
        }
    }

    pub fn mode(&self) -> CombinatorMode {
        self.owner.combined.mode
    }

    /// Number of futures added before the combinator settled
    pub fn count(&self) -> usize {
        self.owner.combined.counters().count
    }

    /// Add a future; a no-op once the combinator settled
    pub fn add<A: 'static>(&self, future: Future<A>) -> &Self {
        let combined = &self.owner.combined;
        let count = {
            let mut counters = combined.counters();
            if counters.resolved || combined.core.is_settled() {
                return self;
            }
            counters.count += 1;
            counters.count
        };
        combined.core.set_progress_range(0, count as i32);

        let hold = combined.core.hold();
        let combined = combined.clone();
        future.watch(move |_, outcome| {
            combined.on_settled(outcome == Outcome::Canceled);
            drop(hold);
        });
        self
    }

    /// Add the future of a deferred value
    pub fn add_deferred<A: Send + 'static>(&self, deferred: &Deferred<A>) -> &Self {
        self.add(deferred.future())
    }

    /// The combined future
    pub fn future(&self) -> Future<()> {
        self.owner.combined.core.future()
    }

    pub fn observe(&self) -> Observable<()> {
        observe(self.future())
    }
}

impl Default for Combinator {
    fn default() -> Self {
        Combinator::new(CombinatorMode::default())
    }
}

impl<A: 'static> Shl<Future<A>> for Combinator {
    type Output = Combinator;

    fn shl(self, future: Future<A>) -> Combinator {
        self.add(future);
        self
    }
}

impl<A: Send + 'static> Shl<&Deferred<A>> for Combinator {
    type Output = Combinator;

    fn shl(self, deferred: &Deferred<A>) -> Combinator {
        self.add_deferred(deferred);
        self
    }
}

impl fmt::Debug for Combinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let combined = &self.owner.combined;
        f.debug_struct("Combinator")
            .field("mode", &combined.mode)
            .field("counters", &*combined.counters())
            .field("future", &combined.core.future())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::deferred;

    #[test]
    fn test_fail_fast_cancels_on_first_cancel() {
        let d1 = deferred::<i32>();
        let d2 = deferred::<String>();
        let d3 = deferred::<()>();
        let c = combine(CombinatorMode::FailFast);
        c.add(d1.future()).add(d2.future()).add(d3.future());

        d1.complete(1);
        assert!(c.future().is_running());
        d2.cancel();
        assert!(c.future().is_canceled());
        assert!(c.future().is_finished());
    }

    #[test]
    fn test_fail_fast_completes_when_all_complete() {
        let d1 = deferred::<i32>();
        let d2 = deferred::<String>();
        let c = combine(CombinatorMode::FailFast) << &d1 << &d2;

        assert_eq!(c.future().progress_maximum(), 2);
        d2.complete("b".into());
        assert_eq!(c.future().progress_value(), 1);
        d1.complete(1);
        assert!(c.future().is_finished());
        assert!(!c.future().is_canceled());
    }

    #[test]
    fn test_all_settled_waits_for_everything() {
        let d1 = deferred::<i32>();
        let d2 = deferred::<String>();
        let d3 = deferred::<u8>();
        let c = combine(CombinatorMode::AllSettled);
        c.add(d1.future()).add(d2.future()).add(d3.future());

        d1.complete(1);
        d2.cancel();
        assert!(c.future().is_running());
        d3.complete(3);
        assert!(c.future().is_canceled());
        assert_eq!(c.future().progress_value(), 3);
    }

    #[test]
    fn test_add_after_settle_is_noop() {
        let d1 = deferred::<i32>();
        let c = combine(CombinatorMode::FailFast);
        c.add(d1.future());
        d1.complete(1);
        assert!(c.future().is_finished());

        let late = deferred::<i32>();
        let copy = c.clone();
        copy.add(late.future());
        late.cancel();

        assert_eq!(c.count(), 1);
        assert!(!c.future().is_canceled());
    }

    #[test]
    fn test_already_settled_constituents() {
        let c = combine(CombinatorMode::FailFast) << Future::ready(1) << Future::ready("x");
        assert!(c.future().is_finished());
        assert!(!c.future().is_canceled());

        let c = combine(CombinatorMode::FailFast) << Future::<i32>::canceled();
        assert!(c.future().is_canceled());
    }

    #[test]
    fn test_empty_combinator_cancels_when_dropped() {
        let c = combine(CombinatorMode::AllSettled);
        let f = c.future();
        assert!(f.is_running());
        drop(c);
        assert!(f.is_canceled());
    }

    #[test]
    fn test_dropped_combinator_still_settles() {
        let d = deferred::<i32>();
        let f = {
            let c = combine(CombinatorMode::FailFast) << &d;
            c.future()
        };
        assert!(f.is_running());
        d.complete(1);
        assert!(f.is_finished());
        assert!(!f.is_canceled());
    }
}
