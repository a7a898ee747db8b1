use crate::errors::BodyError;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use shared::http::BoxError;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::{Duration, Instant};
use tokio::time::Sleep;

/// Body type of every response the gateway produces, proxied or local.
pub type GatewayBody = BoxBody<Bytes, BodyError>;

pub fn full_body(data: impl Into<Bytes>) -> GatewayBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

pub fn empty_body() -> GatewayBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

pin_project! {
    /// Streams an inner body while enforcing an idle timeout between frames, an absolute
    /// deadline, and optionally a cap on the total number of data bytes.
    ///
    /// Once any limit trips the body yields a single [`BodyError`] and then ends.
    pub struct GuardedBody<B> {
        #[pin]
        inner: B,
        #[pin]
        idle: Sleep,
        #[pin]
        deadline: Sleep,
        idle_timeout: Duration,
        limit: Option<u64>,
        seen: u64,
        done: bool,
    }
}

impl<B> GuardedBody<B> {
    pub fn new(inner: B, idle_timeout: Duration, deadline: Instant, limit: Option<u64>) -> Self {
        GuardedBody {
            inner,
            idle: tokio::time::sleep(idle_timeout),
            deadline: tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)),
            idle_timeout,
            limit,
            seen: 0,
            done: false,
        }
    }
}

impl<B> Body for GuardedBody<B>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BodyError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let mut this = self.project();
        if *this.done {
            return Poll::Ready(None);
        }

        if let Poll::Ready(frame) = this.inner.as_mut().poll_frame(cx) {
            let frame = match frame {
                None => {
                    *this.done = true;
                    return Poll::Ready(None);
                }
                Some(Err(e)) => {
                    *this.done = true;
                    return Poll::Ready(Some(Err(BodyError::Stream(e.into()))));
                }
                Some(Ok(frame)) => frame,
            };

            if let Some(data) = frame.data_ref() {
                *this.seen += data.len() as u64;
                if let Some(limit) = *this.limit
                    && *this.seen > limit
                {
                    *this.done = true;
                    return Poll::Ready(Some(Err(BodyError::TooLarge(limit))));
                }
            }

            let next_idle = tokio::time::Instant::now() + *this.idle_timeout;
            this.idle.as_mut().reset(next_idle);
            return Poll::Ready(Some(Ok(frame)));
        }

        if this.deadline.as_mut().poll(cx).is_ready() {
            *this.done = true;
            return Poll::Ready(Some(Err(BodyError::Deadline)));
        }

        ready!(this.idle.as_mut().poll(cx));
        *this.done = true;
        Poll::Ready(Some(Err(BodyError::Idle)))
    }

    fn is_end_stream(&self) -> bool {
        self.done || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
