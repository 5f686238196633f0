//! Helper stream combinator used by [`super::AbstractCircMgr::take_action`].
//!
//! We want to wait on two different kinds of notifications at once: the
//! circuits we are actually pending on (or building), and any other
//! circuits that might opportunistically satisfy our request.  The former
//! are authoritative: once they're all exhausted, there's nothing left to
//! wait for.  The latter are just advice, and can keep arriving or stop
//! arriving without affecting whether we're done.

use futures::stream::Stream;
use pin_project::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Which of the two streams passed to [`select_biased`] produced an item.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Source {
    /// The item came from the "authoritative" stream: one of the circuits
    /// that we are actually waiting on.
    Left,
    /// The item came from the "advisory" stream: a circuit we weren't
    /// waiting on, but which might still satisfy our request.
    Right,
}

/// A stream combinator that polls `left` in preference to `right`, tagging
/// each item with the [`Source`] it came from.
///
/// The combined stream ends as soon as `left` ends, regardless of whether
/// `right` has more items to offer: `left` is the stream of circuits we are
/// actually waiting for, so once it's exhausted there's nothing left for us
/// to usefully wait on.  `right` may end earlier without affecting this
/// stream; once it does, we simply stop polling it.
#[pin_project]
struct SelectBiased<S1, S2> {
    /// The authoritative stream.
    #[pin]
    left: S1,
    /// The advisory stream.
    #[pin]
    right: S2,
    /// Set once `right` has yielded `None`, so that we stop polling it.
    right_done: bool,
}

impl<S1, S2, T> Stream for SelectBiased<S1, S2>
where
    S1: Stream<Item = T>,
    S2: Stream<Item = T>,
{
    type Item = (Source, T);

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        match this.left.as_mut().poll_next(cx) {
            Poll::Ready(Some(item)) => return Poll::Ready(Some((Source::Left, item))),
            Poll::Ready(None) => return Poll::Ready(None),
            Poll::Pending => {}
        }

        if !*this.right_done {
            match this.right.as_mut().poll_next(cx) {
                Poll::Ready(Some(item)) => return Poll::Ready(Some((Source::Right, item))),
                Poll::Ready(None) => *this.right_done = true,
                Poll::Pending => {}
            }
        }

        Poll::Pending
    }
}

/// Combine `left` and `right` into a single stream of `(Source, T)`,
/// preferring items from `left` whenever both are ready.
///
/// The combined stream ends once `left` ends; see [`SelectBiased`] for
/// details.
pub(crate) fn select_biased<S1, S2, T>(left: S1, right: S2) -> impl Stream<Item = (Source, T)>
where
    S1: Stream<Item = T>,
    S2: Stream<Item = T>,
{
    SelectBiased {
        left,
        right,
        right_done: false,
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->

    use super::*;
    use futures::channel::mpsc;
    use futures::stream::StreamExt;
    use futures::SinkExt;

    #[test]
    fn ends_with_left() {
        tor_rtmock::MockRuntime::test_with_various(|_rt| async move {
            let (mut left_tx, left_rx) = mpsc::channel::<u32>(8);
            let (mut right_tx, right_rx) = mpsc::channel::<u32>(8);

            left_tx.send(1).await.unwrap();
            right_tx.send(2).await.unwrap();
            drop(left_tx);
            drop(right_tx);

            let mut combined = select_biased(left_rx, right_rx);
            let mut seen = Vec::new();
            while let Some((src, item)) = combined.next().await {
                seen.push((src, item));
            }

            assert!(seen.contains(&(Source::Left, 1)));
            assert!(seen.contains(&(Source::Right, 2)));
        });
    }

    #[test]
    fn terminates_when_left_exhausted() {
        tor_rtmock::MockRuntime::test_with_various(|_rt| async move {
            let (left_tx, left_rx) = mpsc::channel::<u32>(8);
            let (mut right_tx, right_rx) = mpsc::channel::<u32>(8);

            drop(left_tx);
            right_tx.send(7).await.unwrap();

            let mut combined = select_biased(left_rx, right_rx);
            assert!(combined.next().await.is_none());
        });
    }
}
