//! Cross-thread end-to-end coverage for deferred groups.

mod common;

use common::init_test;
use deferral::{group, group_in_order, Deferred, Error, ErrorKind, GroupError};
use std::error::Error as _;
use std::thread;
use std::time::Duration;

#[test]
fn a_group_settles_after_every_threaded_child() {
    init_test("a_group_settles_after_every_threaded_child");
    let children: Vec<Deferred<i32>> = (0..8).map(|_| Deferred::new()).collect();
    let parent = group(children.clone());

    let mut workers = Vec::new();
    for (index, child) in children.into_iter().enumerate() {
        workers.push(thread::spawn(move || {
            thread::sleep(Duration::from_millis((8 - index as u64) * 3));
            child.complete(i32::try_from(index).expect("small index"));
        }));
    }
    for worker in workers {
        worker.join().expect("child thread");
    }

    let mut values = parent.join().expect("all children complete");
    values.sort_unstable();
    assert_eq!(values, (0..8).collect::<Vec<i32>>());
}

#[test]
fn an_ordered_group_is_immune_to_completion_order() {
    init_test("an_ordered_group_is_immune_to_completion_order");
    let children: Vec<Deferred<i32>> = (0..6).map(|_| Deferred::new()).collect();
    let parent = group_in_order(children.clone());

    // Complete in reverse, each from its own thread.
    let mut workers = Vec::new();
    for (index, child) in children.into_iter().enumerate().rev() {
        workers.push(thread::spawn(move || {
            child.complete(i32::try_from(index * 10).expect("small index"));
        }));
    }
    for worker in workers {
        worker.join().expect("child thread");
    }

    assert_eq!(
        parent.join().expect("all children complete"),
        vec![0, 10, 20, 30, 40, 50]
    );
}

#[test]
fn one_failing_child_fails_the_whole_group() {
    init_test("one_failing_child_fails_the_whole_group");
    let ok: Deferred<i32> = Deferred::new();
    let bad: Deferred<i32> = Deferred::new();
    let parent = group_in_order(vec![ok.clone(), bad.clone()]);

    let t1 = thread::spawn(move || ok.complete(1));
    let t2 = thread::spawn(move || bad.complete_error(Error::user("disk gone")));
    t1.join().expect("ok thread");
    t2.join().expect("bad thread");

    let err = parent.join().expect_err("grouped failure");
    assert_eq!(err.kind(), ErrorKind::Group);
    let details = err
        .source()
        .and_then(|s| s.downcast_ref::<GroupError<i32>>())
        .expect("grouped payload");
    assert_eq!(details.outcomes().len(), 2);
    assert_eq!(details.first().message(), "disk gone");
}

#[test]
fn a_group_parent_works_as_a_continuation() {
    init_test("a_group_parent_works_as_a_continuation");
    let kickoff: Deferred<i32> = Deferred::new();
    let left: Deferred<i32> = Deferred::new();
    let right: Deferred<i32> = Deferred::new();
    let parent = group_in_order(vec![left.clone(), right.clone()]);

    // A link returning the group parent parks the chain until the whole
    // group settled.
    let summed: Deferred<i32> = kickoff
        .on_success(move |_x: i32| parent)
        .on_success(|values: Vec<i32>| values.iter().sum::<i32>());

    kickoff.complete(0);
    let t1 = thread::spawn(move || left.complete(40));
    let t2 = thread::spawn(move || right.complete(2));
    t1.join().expect("left thread");
    t2.join().expect("right thread");

    assert_eq!(summed.join().expect("sum"), 42);
}
