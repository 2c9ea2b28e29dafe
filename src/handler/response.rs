//! Response and delay specifications.
//!
//! Both are tagged variants evaluated through one uniform contract:
//! [`ResponseSpec::compute`] and [`DelaySpec::resolve`] take the matched
//! request, whether the declaration was a static value or a function.

use super::MatchedRequest;
use crate::message::MockResponse;
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub(crate) type ResponseFactory = Arc<dyn Fn(&MatchedRequest) -> MockResponse + Send + Sync>;
pub(crate) type DelayFactory = Arc<dyn Fn(&MatchedRequest) -> Duration + Send + Sync>;

/// What a handler answers with.
#[derive(Clone)]
pub enum ResponseSpec {
    /// The same response every time.
    Static(MockResponse),
    /// A response computed from the matched request.
    Factory(ResponseFactory),
}

impl ResponseSpec {
    /// Produce the response for a matched request.
    pub fn compute(&self, matched: &MatchedRequest) -> MockResponse {
        match self {
            ResponseSpec::Static(response) => response.clone(),
            ResponseSpec::Factory(factory) => factory(matched),
        }
    }
}

impl fmt::Debug for ResponseSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseSpec::Static(response) => f.debug_tuple("Static").field(&response.status).finish(),
            ResponseSpec::Factory(_) => f.write_str("Factory"),
        }
    }
}

/// How long a handler waits before answering.
#[derive(Clone, Default)]
pub enum DelaySpec {
    /// Answer immediately.
    #[default]
    None,
    /// Always the same delay.
    Fixed(Duration),
    /// Uniformly random in `[min, max]`.
    Range {
        /// Lower bound
        min: Duration,
        /// Upper bound
        max: Duration,
    },
    /// Computed from the matched request.
    Computed(DelayFactory),
}

impl DelaySpec {
    /// Build a range, swapping the bounds if given in reverse.
    pub fn range(a: Duration, b: Duration) -> Self {
        let (min, max) = if a <= b { (a, b) } else { (b, a) };
        DelaySpec::Range { min, max }
    }

    /// Delay to apply for this request.
    pub fn resolve(&self, matched: &MatchedRequest) -> Duration {
        match self {
            DelaySpec::None => Duration::ZERO,
            DelaySpec::Fixed(delay) => *delay,
            DelaySpec::Range { min, max } if min == max => *min,
            DelaySpec::Range { min, max } => rand::rng().random_range(*min..=*max),
            DelaySpec::Computed(factory) => factory(matched),
        }
    }
}

impl fmt::Debug for DelaySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DelaySpec::None => f.write_str("None"),
            DelaySpec::Fixed(delay) => f.debug_tuple("Fixed").field(delay).finish(),
            DelaySpec::Range { min, max } => f
                .debug_struct("Range")
                .field("min", min)
                .field("max", max)
                .finish(),
            DelaySpec::Computed(_) => f.write_str("Computed"),
        }
    }
}
