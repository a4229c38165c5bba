//! Message and hypothesis feedback.

pub mod handlers;
pub mod service;
