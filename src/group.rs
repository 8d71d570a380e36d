//! N-to-1 aggregation of deferreds.
//!
//! [`group`] does the opposite of [`Deferred::chain`]: instead of fanning
//! one result out, it collects the results of many deferreds into a single
//! parent that settles once every child has. [`group_in_order`] does the
//! same but keeps the outcome at index `i` matched to the child at index
//! `i`, regardless of completion order.
//!
//! If any child carries an error, the parent carries an
//! [`ErrorKind::Group`] error whose source is a [`GroupError`] holding
//! every outcome plus the first error in traversal order. The notifiers
//! attached to the children pass each result on unchanged, so grouping a
//! deferred does not disturb its own chain.

use core::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::deferred::{Deferred, Step};
use crate::error::{Error, ErrorKind};
use crate::payload::Carry;

/// The payload behind a failed group: every child's outcome plus the
/// first error encountered in traversal order.
///
/// Reached through [`std::error::Error::source`] on the parent's carried
/// error:
///
/// ```
/// use std::error::Error as _;
/// use deferral::{group, Deferred, Error, GroupError};
///
/// let parent = group(vec![
///     Deferred::of_value(1),
///     Deferred::of_error(Error::user("down")),
/// ]);
/// let err = parent.join().unwrap_err();
/// let details = err
///     .source()
///     .and_then(|s| s.downcast_ref::<GroupError<i32>>())
///     .unwrap();
/// assert_eq!(details.outcomes().len(), 2);
/// assert_eq!(details.first().message(), "down");
/// ```
#[derive(Debug, Clone)]
pub struct GroupError<T> {
    outcomes: Vec<Result<T, Error>>,
    first: Error,
}

impl<T> GroupError<T> {
    /// Every child's outcome, one per child.
    #[must_use]
    pub fn outcomes(&self) -> &[Result<T, Error>] {
        &self.outcomes
    }

    /// Consumes the error, returning the outcomes.
    #[must_use]
    pub fn into_outcomes(self) -> Vec<Result<T, Error>> {
        self.outcomes
    }

    /// The first error among the outcomes, in traversal order.
    #[must_use]
    pub fn first(&self) -> &Error {
        &self.first
    }
}

impl<T> fmt::Display for GroupError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "at least one deferred in the group failed, first error: {}",
            self.first
        )
    }
}

impl<T: fmt::Debug> std::error::Error for GroupError<T> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.first)
    }
}

/// Collects `children` into one deferred that settles after all of them.
///
/// The parent's list is in *completion* order; use [`group_in_order`] to
/// keep it in argument order. An empty collection settles the parent
/// immediately with an empty list.
pub fn group<T>(children: impl IntoIterator<Item = Deferred<T>>) -> Deferred<Vec<T>>
where
    T: Carry + Sync,
{
    DeferredGroup::build(children.into_iter().collect(), false)
}

/// Like [`group`], but outcome `i` always corresponds to child `i`,
/// regardless of the order in which the children complete.
pub fn group_in_order<T>(children: impl IntoIterator<Item = Deferred<T>>) -> Deferred<Vec<T>>
where
    T: Carry + Sync,
{
    DeferredGroup::build(children.into_iter().collect(), true)
}

/// Book-keeping shared by all notifiers of one group.
struct DeferredGroup<T> {
    parent: Deferred<Vec<T>>,
    state: Mutex<GroupState<T>>,
}

struct GroupState<T> {
    /// One slot per child. Ordered groups write their designated slot;
    /// unordered groups fill front to back as children complete.
    outcomes: Vec<Option<Result<T, Error>>>,
    filled: usize,
    remaining: usize,
}

impl<T: Carry + Sync> DeferredGroup<T> {
    fn build(children: Vec<Deferred<T>>, ordered: bool) -> Deferred<Vec<T>> {
        let parent: Deferred<Vec<T>> = Deferred::new();
        let expected = children.len();
        if expected == 0 {
            parent.complete(Vec::new());
            return parent;
        }

        let group = Arc::new(Self {
            parent: parent.clone(),
            state: Mutex::new(GroupState {
                outcomes: vec![None; expected],
                filled: 0,
                remaining: expected,
            }),
        });

        for (index, child) in children.into_iter().enumerate() {
            let notify = Arc::clone(&group);
            let slot = if ordered { Some(index) } else { None };
            let _: Deferred<T> = child.on_both(move |outcome: Result<T, Error>| match outcome {
                Ok(value) => {
                    notify.record(slot, Ok(value.clone()));
                    Step::Value(value)
                }
                Err(error) => {
                    notify.record(slot, Err(error.clone()));
                    Step::Error(error)
                }
            });
        }
        parent
    }

    /// Called from a child's chain as it settles. The last notification
    /// finalizes the parent (on that child's completing thread).
    fn record(&self, slot: Option<usize>, outcome: Result<T, Error>) {
        let outcomes = {
            let mut state = self.state.lock();
            let index = match slot {
                Some(index) => index,
                None => {
                    let index = state.filled;
                    state.filled += 1;
                    index
                }
            };
            debug_assert!(state.outcomes[index].is_none(), "group slot written twice");
            state.outcomes[index] = Some(outcome);
            state.remaining -= 1;
            if state.remaining > 0 {
                return;
            }
            state
                .outcomes
                .drain(..)
                .map(|outcome| outcome.expect("group finalized with a missing outcome"))
                .collect::<Vec<_>>()
        };
        self.finalize(outcomes);
    }

    fn finalize(&self, outcomes: Vec<Result<T, Error>>) {
        tracing::debug!(outcomes = outcomes.len(), "group complete, settling parent");
        let first = outcomes.iter().find_map(|o| o.as_ref().err()).cloned();
        match first {
            Some(first) => {
                let grouped = GroupError { outcomes, first };
                self.parent.complete_error(
                    Error::new(ErrorKind::Group)
                        .with_context("at least one deferred in the group failed")
                        .with_source(grouped),
                );
            }
            None => {
                let values = outcomes
                    .into_iter()
                    .map(|outcome| match outcome {
                        Ok(value) => value,
                        Err(_) => unreachable!("scanned for errors just above"),
                    })
                    .collect();
                self.parent.complete(values);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn an_empty_group_settles_immediately() {
        let parent = group(Vec::<Deferred<i32>>::new());
        assert_eq!(parent.join().expect("empty list"), Vec::<i32>::new());
    }

    #[test]
    fn an_unordered_group_collects_in_completion_order() {
        let d1: Deferred<i32> = Deferred::new();
        let d2: Deferred<i32> = Deferred::new();
        let parent = group(vec![d1.clone(), d2.clone()]);
        d2.complete(20);
        d1.complete(10);
        assert_eq!(parent.join().expect("all complete"), vec![20, 10]);
    }

    #[test]
    fn an_ordered_group_keeps_argument_order() {
        let d1: Deferred<i32> = Deferred::new();
        let d2: Deferred<i32> = Deferred::new();
        let d3: Deferred<i32> = Deferred::new();
        let parent = group_in_order(vec![d1.clone(), d2.clone(), d3.clone()]);
        d3.complete(30);
        d1.complete(10);
        d2.complete(20);
        assert_eq!(parent.join().expect("all complete"), vec![10, 20, 30]);
    }

    #[test]
    fn a_failed_child_turns_into_a_grouped_error() {
        let parent = group(vec![
            Deferred::of_value(1),
            Deferred::of_value(2),
            Deferred::of_error(Error::user("child failed")),
        ]);
        let err = parent.join().expect_err("one child failed");
        assert_eq!(err.kind(), ErrorKind::Group);

        let details = err
            .source()
            .and_then(|s| s.downcast_ref::<GroupError<i32>>())
            .expect("grouped payload");
        assert_eq!(details.outcomes().len(), 3);
        assert_eq!(details.first().message(), "child failed");
        let values: Vec<i32> = details
            .outcomes()
            .iter()
            .filter_map(|o| o.as_ref().ok().copied())
            .collect();
        assert_eq!(values, vec![1, 2]);
    }

    #[test]
    fn the_first_error_in_traversal_order_wins() {
        let d1: Deferred<i32> = Deferred::new();
        let d2: Deferred<i32> = Deferred::new();
        let parent = group_in_order(vec![d1.clone(), d2.clone()]);
        // Completion order is d2 first, but traversal order is slot order.
        d2.complete_error(Error::user("second"));
        d1.complete_error(Error::user("first"));
        let err = parent.join().expect_err("both children failed");
        let details = err
            .source()
            .and_then(|s| s.downcast_ref::<GroupError<i32>>())
            .expect("grouped payload");
        assert_eq!(details.first().message(), "first");
    }

    #[test]
    fn grouping_does_not_disturb_the_children() {
        let child: Deferred<i32> = Deferred::new();
        let parent = group(vec![child.clone()]);
        child.complete(7);
        assert_eq!(parent.join().expect("group value"), vec![7]);
        // The notifier passed the value through unchanged.
        assert_eq!(child.join().expect("child value"), 7);
    }

    #[test]
    fn children_may_already_be_settled() {
        let parent = group_in_order(vec![Deferred::of_value(1), Deferred::of_value(2)]);
        assert_eq!(parent.join().expect("all settled"), vec![1, 2]);
    }
}
