use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Which branch of [`select()`] finished first.
pub enum Either<A, B> {
    Left(A),
    Right(B),
}

impl<T> Either<T, T> {
    /// The winning value, whichever side it came from.
    pub fn into_inner(self) -> T {
        match self {
            Either::Left(v) | Either::Right(v) => v,
        }
    }
}

pin_project_lite::pin_project! {
    /// First-completed-wins race over two futures. Biased: `a` is always
    /// polled before `b`.
    pub struct Select<A, B> {
        #[pin] a: A,
        #[pin] b: B,
    }
}

impl<A: Future, B: Future> Future for Select<A, B> {
    type Output = Either<A::Output, B::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if let Poll::Ready(val) = this.a.poll(cx) {
            return Poll::Ready(Either::Left(val));
        }
        if let Poll::Ready(val) = this.b.poll(cx) {
            return Poll::Ready(Either::Right(val));
        }
        Poll::Pending
    }
}

/// Race two futures; whichever finishes first wins and the loser is
/// dropped. Ties go to `a`.
///
/// Dropping the loser is safe with the engine's I/O futures: bytes
/// buffered for a dropped recv future stay in the connection's
/// accumulator, and a dropped sleep cancels its timeout SQE. The loser is
/// never resumed later.
pub fn select<A: Future, B: Future>(a: A, b: B) -> Select<A, B> {
    Select { a, b }
}
