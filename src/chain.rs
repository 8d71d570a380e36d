//! Append-only storage for a deferred's callback chain.
//!
//! The chain is a dense array of link *pairs*: entry `2k` holds the success
//! link of pair `k` and entry `2k + 1` its error twin, so the live region
//! always has even length. A consume cursor walks forward as pairs are
//! popped; growth compacts the live window `[next, last)` back to index 0
//! before doubling. Indices are `u16`, which is what ultimately enforces
//! the chain-length bound.

use core::fmt;

use crate::payload::Payload;

/// Maximum number of link pairs one chain may hold.
///
/// An arbitrary but generous limit whose real job is to fail fast when
/// mutually dependent deferreds form a cycle and re-append forever. No
/// practical pipeline needs a chain this deep.
pub(crate) const MAX_CHAIN_PAIRS: usize = (1 << 14) - 1;

/// Entries allocated on first append. Most chains hold one or two pairs,
/// so four entries means the common case never reallocates.
const INITIAL_ENTRIES: usize = 4;

type LinkFn = Box<dyn FnOnce(Payload) -> Payload + Send + 'static>;

/// One registered transformation on a chain.
///
/// A link is consumed by its single invocation; the deferred drops it (and
/// its unused pair twin) as soon as the pair has run, releasing whatever
/// the closure captured.
pub(crate) enum Link {
    /// Returns its argument unchanged. Fills the untouched half of a pair
    /// registered through the one-sided helpers.
    Identity,
    /// A boxed transformation, labelled for the debug rendering.
    Call {
        /// Short static label shown by `Debug` output.
        name: &'static str,
        f: LinkFn,
    },
}

impl Link {
    pub(crate) fn new(
        name: &'static str,
        f: impl FnOnce(Payload) -> Payload + Send + 'static,
    ) -> Self {
        Self::Call {
            name,
            f: Box::new(f),
        }
    }

    pub(crate) fn invoke(self, payload: Payload) -> Payload {
        match self {
            Self::Identity => payload,
            Self::Call { f, .. } => f(payload),
        }
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identity => f.write_str("passthrough"),
            Self::Call { name, .. } => f.write_str(name),
        }
    }
}

/// Dense pair storage with a consume cursor.
pub(crate) struct Chain {
    entries: Vec<Option<Link>>,
    /// Index of the next entry to pop. Everything before it is spent.
    next: u16,
    /// Index one past the last appended entry.
    last: u16,
}

impl Chain {
    pub(crate) const fn new() -> Self {
        Self {
            entries: Vec::new(),
            next: 0,
            last: 0,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.next == self.last
    }

    /// Number of pairs waiting to run.
    pub(crate) fn pending_pairs(&self) -> usize {
        usize::from(self.last - self.next) / 2
    }

    /// Appends a pair in amortized O(1).
    ///
    /// Panics once the chain already holds [`MAX_CHAIN_PAIRS`] pairs; a
    /// chain that deep is a cycle of mutually dependent deferreds, not a
    /// pipeline.
    pub(crate) fn push(&mut self, on_success: Link, on_error: Link) {
        if usize::from(self.last) == self.entries.len() {
            self.grow();
        }
        self.entries[usize::from(self.last)] = Some(on_success);
        self.entries[usize::from(self.last) + 1] = Some(on_error);
        self.last += 2;
    }

    fn grow(&mut self) {
        let old_len = self.entries.len();
        if old_len == MAX_CHAIN_PAIRS * 2 {
            panic!(
                "too many callbacks in chain (size={}): runaway cycle of deferreds?",
                self.pending_pairs()
            );
        }
        let new_len = if old_len == 0 {
            INITIAL_ENTRIES
        } else {
            (old_len * 2).min(MAX_CHAIN_PAIRS * 2)
        };
        // Compact the live window to the front of the new storage.
        let mut grown: Vec<Option<Link>> = Vec::with_capacity(new_len);
        grown.extend(
            self.entries[usize::from(self.next)..usize::from(self.last)]
                .iter_mut()
                .map(Option::take),
        );
        grown.resize_with(new_len, || None);
        self.last -= self.next;
        self.next = 0;
        self.entries = grown;
    }

    /// Removes and returns the oldest pending pair.
    pub(crate) fn pop(&mut self) -> Option<(Link, Link)> {
        if self.next == self.last {
            return None;
        }
        let on_success = self.entries[usize::from(self.next)].take();
        let on_error = self.entries[usize::from(self.next) + 1].take();
        self.next += 2;
        match (on_success, on_error) {
            (Some(cb), Some(eb)) => Some((cb, eb)),
            _ => unreachable!("chain entries out of step with the cursor"),
        }
    }

    /// Releases the storage once a drain has emptied the chain.
    pub(crate) fn reset(&mut self) {
        self.entries = Vec::new();
        self.next = 0;
        self.last = 0;
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        let mut index = usize::from(self.next);
        while index < usize::from(self.last) {
            match (&self.entries[index], &self.entries[index + 1]) {
                (Some(cb), Some(eb)) => {
                    list.entry(&format_args!("{cb:?}/{eb:?}"));
                }
                _ => {
                    list.entry(&format_args!("<taken>"));
                }
            }
            index += 2;
        }
        list.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::Payload;

    fn tag(name: &'static str, tags: &std::sync::Arc<parking_lot::Mutex<Vec<&'static str>>>) -> Link {
        let tags = std::sync::Arc::clone(tags);
        Link::new(name, move |payload| {
            tags.lock().push(name);
            payload
        })
    }

    #[test]
    fn pops_in_append_order() {
        let mut chain = Chain::new();
        chain.push(Link::new("a", |p| p), Link::Identity);
        chain.push(Link::new("b", |p| p), Link::Identity);
        chain.push(Link::new("c", |p| p), Link::Identity);

        let names: Vec<String> = std::iter::from_fn(|| chain.pop())
            .map(|(cb, _)| format!("{cb:?}"))
            .collect();
        assert_eq!(names, ["a", "b", "c"]);
        assert!(chain.is_empty());
    }

    #[test]
    fn growth_preserves_the_live_window() {
        let tags = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut chain = Chain::new();
        chain.push(tag("one", &tags), Link::Identity);
        chain.push(tag("two", &tags), Link::Identity);
        // Consume one pair so the window no longer starts at zero, then
        // push past the initial allocation to force a compacting grow.
        let (first, _) = chain.pop().expect("pair present");
        first.invoke(Payload::value(0_i32));
        chain.push(tag("three", &tags), Link::Identity);
        chain.push(tag("four", &tags), Link::Identity);

        while let Some((cb, _)) = chain.pop() {
            cb.invoke(Payload::value(0_i32));
        }
        assert_eq!(*tags.lock(), ["one", "two", "three", "four"]);
    }

    #[test]
    fn pending_pairs_counts_the_window() {
        let mut chain = Chain::new();
        assert_eq!(chain.pending_pairs(), 0);
        chain.push(Link::Identity, Link::Identity);
        chain.push(Link::Identity, Link::Identity);
        assert_eq!(chain.pending_pairs(), 2);
        chain.pop();
        assert_eq!(chain.pending_pairs(), 1);
    }

    #[test]
    fn reset_drops_the_storage() {
        let mut chain = Chain::new();
        chain.push(Link::Identity, Link::Identity);
        chain.pop();
        chain.reset();
        assert!(chain.is_empty());
        assert_eq!(chain.pending_pairs(), 0);
    }

    #[test]
    fn full_chain_still_pops_everything() {
        let mut chain = Chain::new();
        for _ in 0..MAX_CHAIN_PAIRS {
            chain.push(Link::Identity, Link::Identity);
        }
        assert_eq!(chain.pending_pairs(), MAX_CHAIN_PAIRS);
        let mut popped = 0;
        while chain.pop().is_some() {
            popped += 1;
        }
        assert_eq!(popped, MAX_CHAIN_PAIRS);
    }

    #[test]
    #[should_panic(expected = "too many callbacks in chain")]
    fn overflow_panics() {
        let mut chain = Chain::new();
        for _ in 0..=MAX_CHAIN_PAIRS {
            chain.push(Link::Identity, Link::Identity);
        }
    }
}
