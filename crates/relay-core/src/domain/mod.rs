//! Domain types for request admission.

mod caller;
mod limit;

pub use caller::CallerKey;
pub use limit::{
    LimiterSettings, MAX_WINDOW, SkipPredicate, skip_keys, skip_when, skip_when_async,
};
