// Chat turns: coordination, resumable replay and the CRUD routes around them.

pub mod coordinator;
pub mod handlers;
pub mod resume;
