//! Track streaming with byte-range support and demo protection.

pub mod body;
pub mod controller;
pub mod notify;
pub mod range;

pub use controller::{StreamController, StreamError, StreamRequest};
pub use notify::{NotifyError, PlayCounter, PlayEvent, PlayNotifier};
pub use range::{RangeSpec, parse_range};
