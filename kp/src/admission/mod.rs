//! Rate admission
//!
//! Decides per request whether to admit now, admit into the next window, or
//! reject, using only atomic store primitives.

mod controller;
mod service;

pub use controller::{Admission, RateAdmissionController, RatePolicy};
pub use service::{AdmissionResult, AdmissionService};
